// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory [`ContainerRuntime`] for tests.

#![allow(clippy::expect_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::error::Error;
use crate::runtime::ContainerRuntime;
use crate::types::{
    ContainerConfig, ContainerInspect, ContainerState, ContainerSummary, CreateContainerOptions,
    RuntimeInfo,
};

/// Builds an inspection record with the given id, name and environment.
#[must_use]
pub fn inspect_with_env(id: &str, name: &str, env: &[&str]) -> ContainerInspect {
    ContainerInspect {
        id: id.to_string(),
        name: format!("/{name}"),
        created: "2016-01-02T10:00:00Z".to_string(),
        config: ContainerConfig {
            hostname: format!("{id}.host.local"),
            image: "tsuru/app".to_string(),
            env: Some(env.iter().map(|e| (*e).to_string()).collect()),
            labels: None,
        },
        state: ContainerState {
            running: true,
            restarting: false,
            started_at: "2016-01-02T10:00:01Z".to_string(),
        },
    }
}

/// A fake runtime holding containers in a map.
///
/// Removals can be held back with [`FakeRuntime::block_removals`] until
/// [`FakeRuntime::release_removals`] grants them.
pub struct FakeRuntime {
    containers: Mutex<Vec<ContainerInspect>>,
    inspect_calls: AtomicUsize,
    remove_calls: Mutex<Vec<String>>,
    removal_gate: Mutex<Option<Arc<Semaphore>>>,
    output: Mutex<HashMap<String, Vec<u8>>>,
    created: Mutex<Vec<CreateContainerOptions>>,
    root_dir: Mutex<String>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl FakeRuntime {
    #[must_use]
    pub fn new(containers: Vec<ContainerInspect>) -> Self {
        FakeRuntime {
            containers: Mutex::new(containers),
            inspect_calls: AtomicUsize::new(0),
            remove_calls: Mutex::new(Vec::new()),
            removal_gate: Mutex::new(None),
            output: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            root_dir: Mutex::new("/var/lib/docker".to_string()),
        }
    }

    pub fn add(&self, inspect: ContainerInspect) {
        self.containers.lock().expect("lock poisoned").push(inspect);
    }

    #[must_use]
    pub fn inspect_calls(&self) -> usize {
        self.inspect_calls.load(Ordering::SeqCst)
    }

    /// Ids passed to `remove_container`, in call order.
    #[must_use]
    pub fn remove_calls(&self) -> Vec<String> {
        self.remove_calls.lock().expect("lock poisoned").clone()
    }

    #[must_use]
    pub fn created(&self) -> Vec<CreateContainerOptions> {
        self.created.lock().expect("lock poisoned").clone()
    }

    pub fn block_removals(&self) {
        *self.removal_gate.lock().expect("lock poisoned") = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_removals(&self) {
        if let Some(gate) = self.removal_gate.lock().expect("lock poisoned").as_ref() {
            gate.add_permits(1 << 20);
        }
    }

    pub fn set_root_dir(&self, dir: &str) {
        *self.root_dir.lock().expect("lock poisoned") = dir.to_string();
    }

    /// Sets the output every created container prints.
    pub fn set_output(&self, output: &[u8]) {
        self.output
            .lock()
            .expect("lock poisoned")
            .insert("*".to_string(), output.to_vec());
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect, Error> {
        self.inspect_calls.fetch_add(1, Ordering::SeqCst);
        self.containers
            .lock()
            .expect("lock poisoned")
            .iter()
            .find(|c| c.id == id || c.name.trim_start_matches('/') == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn list_containers(&self, _all: bool) -> Result<Vec<ContainerSummary>, Error> {
        Ok(self
            .containers
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![c.name.clone()],
                image: c.config.image.clone(),
                state: String::new(),
            })
            .collect())
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<(), Error> {
        self.remove_calls
            .lock()
            .expect("lock poisoned")
            .push(id.to_string());
        let gate = self.removal_gate.lock().expect("lock poisoned").clone();
        if let Some(gate) = gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
        }
        Ok(())
    }

    async fn create_container(
        &self,
        _name: Option<&str>,
        options: &CreateContainerOptions,
    ) -> Result<String, Error> {
        let mut created = self.created.lock().expect("lock poisoned");
        created.push(options.clone());
        Ok(format!("created-{}", created.len()))
    }

    async fn start_container(&self, _id: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn wait_container(&self, _id: &str) -> Result<i64, Error> {
        Ok(0)
    }

    async fn container_output(&self, _id: &str) -> Result<Vec<u8>, Error> {
        let output = self.output.lock().expect("lock poisoned");
        if let Some(out) = output.get("*") {
            return Ok(out.clone());
        }
        // Behave like `echo`: print the last argument of the last command.
        let created = self.created.lock().expect("lock poisoned");
        Ok(created
            .last()
            .and_then(|opts| opts.cmd.last())
            .map(|arg| format!("{arg}\n").into_bytes())
            .unwrap_or_default())
    }

    async fn info(&self) -> Result<RuntimeInfo, Error> {
        Ok(RuntimeInfo {
            docker_root_dir: self.root_dir.lock().expect("lock poisoned").clone(),
        })
    }
}
