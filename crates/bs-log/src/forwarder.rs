// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Generic reconnecting forwarder.
//!
//! A [`Forwarder`] owns a bounded queue and a worker task driving an
//! [`Adapter`]. The worker connects (retrying with exponential backoff),
//! hands every queued message to the adapter, reconnects when processing
//! fails and, on shutdown, drains what is left in the queue for a short while
//! before closing the connection.
//!
//! Producers never wait: when the queue is full the message is dropped and a
//! warning is logged at most once a minute.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::ForwarderError;
use crate::ratelimit::RateLimiter;

pub const DEFAULT_QUEUE_SIZE: usize = 1_000_000;
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// A sink the forwarder can drive.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    type Conn: Send + 'static;
    type Message: Send + 'static;

    fn name(&self) -> &str;

    /// Called once before the worker starts. The token is cancelled when the
    /// forwarder stops.
    async fn initialize(&self, _shutdown: CancellationToken) -> Result<(), ForwarderError> {
        Ok(())
    }

    async fn connect(&self) -> Result<Self::Conn, ForwarderError>;

    async fn process(
        &self,
        conn: &mut Self::Conn,
        message: Self::Message,
    ) -> Result<(), ForwarderError>;

    async fn close(&self, conn: Self::Conn);

    /// Period of [`Adapter::flush`] calls while connected, if any.
    fn flush_interval(&self) -> Option<Duration> {
        None
    }

    async fn flush(&self, _conn: &mut Self::Conn) -> Result<(), ForwarderError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub queue_size: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub drain_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        ForwarderConfig {
            queue_size: DEFAULT_QUEUE_SIZE,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
            drain_timeout: DRAIN_TIMEOUT,
        }
    }
}

impl ForwarderConfig {
    #[must_use]
    pub fn with_queue_size(queue_size: usize) -> Self {
        ForwarderConfig {
            queue_size,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
    Terminated,
}

/// Handle to a running forwarder worker.
pub struct Forwarder<M> {
    name: Arc<str>,
    sender: mpsc::Sender<M>,
    shutdown: CancellationToken,
    state: watch::Receiver<ForwarderState>,
    drop_warning: RateLimiter,
    dropped: AtomicU64,
    worker: JoinHandle<()>,
}

impl<M: Send + 'static> Forwarder<M> {
    /// Initializes the adapter and spawns its worker.
    pub async fn start<A>(adapter: A, config: ForwarderConfig) -> Result<Self, ForwarderError>
    where
        A: Adapter<Message = M>,
    {
        let shutdown = CancellationToken::new();
        adapter.initialize(shutdown.child_token()).await?;

        let name: Arc<str> = Arc::from(adapter.name());
        let (sender, receiver) = mpsc::channel(config.queue_size.max(1));
        let (state_tx, state) = watch::channel(ForwarderState::Disconnected);
        let worker = Worker {
            name: Arc::clone(&name),
            adapter,
            receiver,
            shutdown: shutdown.clone(),
            state: state_tx,
            config,
        };
        let worker = tokio::spawn(worker.run());
        Ok(Forwarder {
            name,
            sender,
            shutdown,
            state,
            drop_warning: RateLimiter::default(),
            dropped: AtomicU64::new(0),
            worker,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues a message without waiting. Returns false when it was dropped.
    pub fn send(&self, message: M) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                if self.drop_warning.allow() {
                    warn!(
                        "[log forwarder {}] dropping due to full channel buffer",
                        self.name
                    );
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("[log forwarder {}] queue closed, dropping", self.name);
                false
            }
        }
    }

    /// Number of messages dropped so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn state(&self) -> ForwarderState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ForwarderState> {
        self.state.clone()
    }

    /// Signals the worker and waits until it drained its queue and closed
    /// the connection.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.worker.await {
            warn!("[log forwarder {}] worker failed: {e}", self.name);
        }
    }
}

enum Served {
    Shutdown,
    QueueClosed,
    Failed(ForwarderError),
}

struct Worker<A: Adapter> {
    name: Arc<str>,
    adapter: A,
    receiver: mpsc::Receiver<A::Message>,
    shutdown: CancellationToken,
    state: watch::Sender<ForwarderState>,
    config: ForwarderConfig,
}

impl<A: Adapter> Worker<A> {
    fn set_state(&self, state: ForwarderState) {
        self.state.send_replace(state);
    }

    async fn run(mut self) {
        let mut backoff = self.config.initial_backoff;
        let mut failures: u32 = 0;
        loop {
            self.set_state(ForwarderState::Connecting);
            let connected = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => None,
                result = self.adapter.connect() => Some(result),
            };
            let mut conn = match connected {
                None => break,
                Some(Ok(conn)) => conn,
                Some(Err(e)) => {
                    self.set_state(ForwarderState::Disconnected);
                    failures += 1;
                    if failures == 1 {
                        warn!(
                            "[log forwarder {}] unable to connect: {e}, retrying in {backoff:?}",
                            self.name
                        );
                    } else {
                        debug!(
                            "[log forwarder {}] connect attempt {failures} failed: {e}",
                            self.name
                        );
                    }
                    tokio::select! {
                        biased;
                        () = self.shutdown.cancelled() => break,
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.config.max_backoff);
                    continue;
                }
            };
            if failures > 0 {
                info!(
                    "[log forwarder {}] connected after {failures} failed attempts",
                    self.name
                );
            }
            backoff = self.config.initial_backoff;
            failures = 0;
            self.set_state(ForwarderState::Connected);

            match self.serve(&mut conn).await {
                Served::Shutdown => {
                    self.drain(conn).await;
                    break;
                }
                Served::QueueClosed => {
                    self.adapter.close(conn).await;
                    break;
                }
                Served::Failed(e) => {
                    warn!(
                        "[log forwarder {}] error processing message, reconnecting: {e}",
                        self.name
                    );
                    self.adapter.close(conn).await;
                    self.set_state(ForwarderState::Disconnected);
                }
            }
        }
        self.set_state(ForwarderState::Terminated);
        debug!("[log forwarder {}] stopped", self.name);
    }

    async fn serve(&mut self, conn: &mut A::Conn) -> Served {
        let mut flush_ticker = self.adapter.flush_interval().map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return Served::Shutdown,
                message = self.receiver.recv() => match message {
                    Some(message) => {
                        if let Err(e) = self.adapter.process(conn, message).await {
                            return Served::Failed(e);
                        }
                    }
                    None => return Served::QueueClosed,
                },
                () = tick(&mut flush_ticker) => {
                    if let Err(e) = self.adapter.flush(conn).await {
                        return Served::Failed(e);
                    }
                }
            }
        }
    }

    async fn drain(&mut self, mut conn: A::Conn) {
        self.set_state(ForwarderState::Draining);
        self.receiver.close();
        let deadline = Instant::now() + self.config.drain_timeout;
        let mut drained = 0usize;
        while Instant::now() < deadline {
            let Ok(message) = self.receiver.try_recv() else {
                break;
            };
            match bounded(deadline, self.adapter.process(&mut conn, message)).await {
                Some(Ok(())) => drained += 1,
                Some(Err(e)) => {
                    warn!("[log forwarder {}] error while draining: {e}", self.name);
                    break;
                }
                None => break,
            }
        }
        debug!(
            "[log forwarder {}] drained {drained} messages before closing",
            self.name
        );
        self.adapter.close(conn).await;
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn bounded<T>(deadline: Instant, fut: impl Future<Output = T>) -> Option<T> {
    tokio::time::timeout_at(deadline, fut).await.ok()
}
