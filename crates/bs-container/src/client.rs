// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cached container metadata lookups.
//!
//! Log lines only carry a container id; the [`ContainerClient`] resolves that
//! id to the application and process names by inspecting the container and
//! keeps the result in a bounded LRU so the hot path rarely reaches the
//! runtime. Concurrent misses for the same id may inspect the container more
//! than once; the last result wins in the cache.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lru::LruCache;
use tracing::{debug, warn};

use crate::error::Error;
use crate::runtime::ContainerRuntime;
use crate::types::{parse_timestamp, ContainerInspect};

/// Maximum number of containers kept in the metadata cache.
pub const CACHE_CAPACITY: usize = 100;

pub const APP_NAME_ENV: &str = "TSURU_APPNAME";
pub const PROCESS_NAME_ENV: &str = "TSURU_PROCESSNAME";

const ENV_WHITELIST: [&str; 2] = [APP_NAME_ENV, PROCESS_NAME_ENV];

/// Container metadata resolved from an inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub id: String,
    /// Container name without the leading `/`.
    pub name: String,
    pub app_name: String,
    pub process_name: String,
    /// First label of the container hostname.
    pub short_hostname: String,
    pub created: Option<DateTime<Utc>>,
    /// Values of the whitelisted environment variables found in the container.
    pub envs: HashMap<String, String>,
    /// The full inspection record, shared with whoever holds this container.
    pub inspect: Arc<ContainerInspect>,
}

impl Container {
    /// Builds the metadata view of an inspection record.
    ///
    /// Containers without the application variables keep their name as
    /// application and their id as process, so their logs can still be
    /// relayed.
    #[must_use]
    pub fn from_inspect(inspect: ContainerInspect) -> Self {
        let mut envs = HashMap::new();
        for entry in inspect.env() {
            for name in ENV_WHITELIST {
                if let Some(value) = env_value(entry, name) {
                    envs.insert(name.to_string(), value.to_string());
                }
            }
        }
        let name = inspect.name.trim_start_matches('/').to_string();
        let (app_name, process_name) = match envs.get(APP_NAME_ENV) {
            Some(app) => (
                app.clone(),
                envs.get(PROCESS_NAME_ENV).cloned().unwrap_or_default(),
            ),
            None => (name.clone(), inspect.id.clone()),
        };
        let short_hostname = inspect
            .config
            .hostname
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string();
        Container {
            id: inspect.id.clone(),
            name,
            app_name,
            process_name,
            short_hostname,
            created: parse_timestamp(&inspect.created),
            envs,
            inspect: Arc::new(inspect),
        }
    }

    /// Whether the container was started by the platform for an application.
    #[must_use]
    pub fn is_app(&self) -> bool {
        self.envs.contains_key(APP_NAME_ENV)
    }

    /// Returns true when every name in `required` is set in the container
    /// environment.
    #[must_use]
    pub fn has_envs(&self, required: &[&str]) -> bool {
        required.iter().all(|name| {
            self.inspect
                .env()
                .iter()
                .any(|entry| env_value(entry, name).is_some())
        })
    }
}

fn env_value<'a>(entry: &'a str, name: &str) -> Option<&'a str> {
    entry.strip_prefix(name)?.strip_prefix('=')
}

/// Resolves container ids to [`Container`] metadata through an LRU cache.
pub struct ContainerClient {
    runtime: Arc<dyn ContainerRuntime>,
    cache: Mutex<LruCache<String, Arc<Container>>>,
}

impl std::fmt::Debug for ContainerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContainerClient")
    }
}

impl ContainerClient {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self::with_capacity(runtime, CACHE_CAPACITY)
    }

    pub fn with_capacity(runtime: Arc<dyn ContainerRuntime>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        ContainerClient {
            runtime,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// The runtime this client inspects containers with.
    #[must_use]
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Looks a container up, from the cache when `use_cache` is set.
    ///
    /// Fails with [`Error::TsuruVariablesNotFound`] when any of
    /// `required_envs` is missing from the container environment; such
    /// containers are never cached.
    pub async fn get_container(
        &self,
        id: &str,
        use_cache: bool,
        required_envs: &[&str],
    ) -> Result<Arc<Container>, Error> {
        if use_cache {
            if let Some(container) = self.cached(id) {
                if !container.has_envs(required_envs) {
                    return Err(Error::TsuruVariablesNotFound);
                }
                return Ok(container);
            }
        }
        let inspect = self.runtime.inspect_container(id).await?;
        let container = Container::from_inspect(inspect);
        if !container.has_envs(required_envs) {
            debug!(
                "container {} lacks required environment {:?}",
                id, required_envs
            );
            return Err(Error::TsuruVariablesNotFound);
        }
        let container = Arc::new(container);
        self.store(id, Arc::clone(&container));
        Ok(container)
    }

    /// Same as [`Self::get_container`] requiring the application variable.
    pub async fn get_app_container(
        &self,
        id: &str,
        use_cache: bool,
    ) -> Result<Arc<Container>, Error> {
        self.get_container(id, use_cache, &[APP_NAME_ENV]).await
    }

    /// Always inspects the runtime; used where the current state matters.
    pub async fn get_fresh_container(&self, id: &str) -> Result<Arc<Container>, Error> {
        self.get_container(id, false, &[]).await
    }

    fn cached(&self, id: &str) -> Option<Arc<Container>> {
        match self.cache.lock() {
            Ok(mut cache) => cache.get(id).cloned(),
            Err(_) => {
                warn!("container cache lock poisoned, bypassing cache");
                None
            }
        }
    }

    fn store(&self, id: &str, container: Arc<Container>) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(id.to_string(), container);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContainerConfig, ContainerState};

    fn inspect(env: &[&str]) -> ContainerInspect {
        ContainerInspect {
            id: "c1".to_string(),
            name: "/my-container".to_string(),
            created: "2016-01-02T10:00:00Z".to_string(),
            config: ContainerConfig {
                hostname: "c1host.cluster.local".to_string(),
                env: Some(env.iter().map(|e| e.to_string()).collect()),
                ..Default::default()
            },
            state: ContainerState::default(),
        }
    }

    #[test]
    fn test_from_inspect_app_container() {
        let container =
            Container::from_inspect(inspect(&["TSURU_PROCESSNAME=procx", "TSURU_APPNAME=coolappname"]));
        assert_eq!(container.app_name, "coolappname");
        assert_eq!(container.process_name, "procx");
        assert_eq!(container.short_hostname, "c1host");
        assert_eq!(container.name, "my-container");
        assert!(container.is_app());
        assert!(container.created.is_some());
    }

    #[test]
    fn test_from_inspect_plain_container() {
        let container = Container::from_inspect(inspect(&["PATH=/bin"]));
        assert_eq!(container.app_name, "my-container");
        assert_eq!(container.process_name, "c1");
        assert!(!container.is_app());
    }

    #[test]
    fn test_env_prefix_must_be_exact() {
        let container = Container::from_inspect(inspect(&["TSURU_APPNAMEX=nope"]));
        assert!(!container.is_app());
        assert!(!container.has_envs(&[APP_NAME_ENV]));
        assert!(container.has_envs(&[]));
    }

    #[test]
    fn test_has_envs_with_empty_value() {
        let container = Container::from_inspect(inspect(&["TSURU_APPNAME=", "OTHER=1"]));
        assert!(container.has_envs(&["TSURU_APPNAME", "OTHER"]));
        assert!(!container.has_envs(&["MISSING"]));
    }
}
