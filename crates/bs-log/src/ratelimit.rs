// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rate limiting for noisy warnings.
//!
//! A [`RateLimiter`] is a single timestamp updated with compare-and-swap, so
//! hot paths can ask whether they may log without taking a lock or owning a
//! timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default period between two allowed events.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct RateLimiter {
    period_ms: u64,
    origin: Instant,
    // Milliseconds since `origin` of the last allowed event, plus one. Zero
    // means no event was allowed yet.
    last: AtomicU64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_PERIOD)
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(period: Duration) -> Self {
        RateLimiter {
            period_ms: u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
            origin: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    /// Returns true at most once per period. Concurrent callers racing for
    /// the same slot see exactly one winner.
    pub fn allow(&self) -> bool {
        let now = u64::try_from(self.origin.elapsed().as_millis())
            .unwrap_or(u64::MAX - 1)
            .saturating_add(1);
        let last = self.last.load(Ordering::Acquire);
        if last != 0 && now.saturating_sub(last) < self.period_ms {
            return false;
        }
        self.last
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
