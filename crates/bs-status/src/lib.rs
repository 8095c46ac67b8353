// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Node status reporting.
//!
//! Every interval the [`reporter::Reporter`] classifies the application
//! containers on this host, runs the host checks, posts the result to the
//! control plane and removes the containers the control plane no longer knows.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod addrs;
pub mod api;
pub mod error;
pub mod hostcheck;
pub mod reporter;

pub use error::Error;
pub use hostcheck::{CheckResult, HostCheck, HostCheckConfig, HostChecks};
pub use reporter::{Reporter, ReporterConfig, UnitStatus};
