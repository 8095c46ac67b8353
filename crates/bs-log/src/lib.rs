// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Container log pipeline.
//!
//! Log lines arrive over syslog (UDP or TCP) or are tailed from JSON log
//! files, get parsed and enriched with container metadata, and are handed to
//! every enabled backend. Each backend owns a bounded queue and a forwarder
//! worker that keeps the remote connection alive.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod backends;
pub mod buffered_conn;
pub mod errors;
pub mod file_monitor;
pub mod forwarder;
pub mod parser;
pub mod ratelimit;
pub mod server;

pub use parser::{parse, RawLogParts};
pub use server::{Dispatcher, LogForwarder, LogHandler, LogServerConfig};
