// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use crate::error::Error;
use crate::types::{
    ContainerInspect, ContainerSummary, CreateContainerOptions, RuntimeInfo,
};

/// Operations the agent needs from the container runtime.
///
/// [`crate::docker::DockerClient`] talks to a Docker Engine; tests plug in
/// an in-memory implementation.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect, Error>;

    /// Lists containers; `all` includes stopped ones.
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, Error>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), Error>;

    /// Creates a container and returns its id.
    async fn create_container(
        &self,
        name: Option<&str>,
        options: &CreateContainerOptions,
    ) -> Result<String, Error>;

    async fn start_container(&self, id: &str) -> Result<(), Error>;

    /// Blocks until the container exits and returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, Error>;

    /// Returns the captured stdout of a container.
    async fn container_output(&self, id: &str) -> Result<Vec<u8>, Error>;

    async fn info(&self) -> Result<RuntimeInfo, Error>;
}
