// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Container runtime access for the node agent.
//!
//! [`docker::DockerClient`] speaks the Docker Engine API and
//! [`client::ContainerClient`] resolves container ids to the application
//! metadata used to route logs and report unit status.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod client;
pub mod docker;
pub mod error;
pub mod runtime;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod types;

pub use client::{Container, ContainerClient};
pub use error::Error;
pub use runtime::ContainerRuntime;
