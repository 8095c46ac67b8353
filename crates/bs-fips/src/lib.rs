// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! TLS setup for the control plane HTTP client.
//!
//! Without the `fips` feature reqwest's bundled rustls configuration is used.
//! With it, the process wide crypto provider must be FIPS validated and the
//! trust store is loaded from the host.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

mod reqwest_adapter;

pub use reqwest_adapter::{create_reqwest_client_builder, TlsError};
