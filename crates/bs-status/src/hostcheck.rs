// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host health checks reported along with the unit status.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bs_container::types::CreateContainerOptions;
use bs_container::ContainerRuntime;
use serde::Serialize;
use tracing::debug;

pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one check as reported to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckResult {
    pub name: String,
    pub successful: bool,
    pub err: String,
}

#[async_trait]
pub trait HostCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<(), String>;
}

/// Writes and removes a probe file in a directory.
pub struct WritablePath {
    name: String,
    path: PathBuf,
}

impl WritablePath {
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        WritablePath {
            name: name.into(),
            path: path.into(),
        }
    }
}

async fn probe_write(dir: &Path) -> Result<(), String> {
    let probe = dir.join(format!(".bs-check-{:016x}", fastrand::u64(..)));
    tokio::fs::write(&probe, b"ok")
        .await
        .map_err(|e| format!("unable to write {}: {e}", probe.display()))?;
    tokio::fs::remove_file(&probe)
        .await
        .map_err(|e| format!("unable to remove {}: {e}", probe.display()))
}

#[async_trait]
impl HostCheck for WritablePath {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> Result<(), String> {
        probe_write(&self.path).await
    }
}

/// Probes the runtime's root directory, as reported by the runtime.
pub struct WritableDockerRoot {
    runtime: Arc<dyn ContainerRuntime>,
}

#[async_trait]
impl HostCheck for WritableDockerRoot {
    fn name(&self) -> &str {
        "writableDockerRoot"
    }

    async fn run(&self) -> Result<(), String> {
        let info = self.runtime.info().await.map_err(|e| e.to_string())?;
        if info.docker_root_dir.is_empty() {
            return Err("runtime did not report its root directory".to_string());
        }
        probe_write(Path::new(&info.docker_root_dir)).await
    }
}

/// Runs `echo` in a container built from the agent's own image.
pub struct CreateContainer {
    runtime: Arc<dyn ContainerRuntime>,
    base_container: String,
}

impl CreateContainer {
    async fn run_echo(&self, id: &str, message: &str) -> Result<(), String> {
        self.runtime
            .start_container(id)
            .await
            .map_err(|e| e.to_string())?;
        let code = self
            .runtime
            .wait_container(id)
            .await
            .map_err(|e| e.to_string())?;
        let output = self
            .runtime
            .container_output(id)
            .await
            .map_err(|e| e.to_string())?;
        let output = String::from_utf8_lossy(&output);
        if code != 0 {
            return Err(format!("container exited with status {code}"));
        }
        if output.trim() != message {
            return Err(format!(
                "unexpected container output: {:?}, expected {message:?}",
                output.trim()
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl HostCheck for CreateContainer {
    fn name(&self) -> &str {
        "createContainer"
    }

    async fn run(&self) -> Result<(), String> {
        let base = self
            .runtime
            .inspect_container(&self.base_container)
            .await
            .map_err(|e| e.to_string())?;
        let message = format!("ok-{:08x}", fastrand::u32(..));
        let options = CreateContainerOptions {
            image: base.config.image,
            cmd: vec!["echo".to_string(), message.clone()],
            attach_stdout: true,
            attach_stderr: true,
            labels: None,
        };
        let id = self
            .runtime
            .create_container(None, &options)
            .await
            .map_err(|e| e.to_string())?;
        let result = self.run_echo(&id, &message).await;
        if let Err(e) = self.runtime.remove_container(&id, true).await {
            debug!("unable to remove check container {id}: {e}");
        }
        result
    }
}

#[derive(Debug, Clone)]
pub struct HostCheckConfig {
    pub root_path: PathBuf,
    pub log_path: PathBuf,
    pub extra_paths: Vec<PathBuf>,
    /// Container whose image is used by the `createContainer` check. The
    /// check is disabled when empty.
    pub base_container_name: String,
    pub timeout: Duration,
}

impl Default for HostCheckConfig {
    fn default() -> Self {
        HostCheckConfig {
            root_path: PathBuf::from("/"),
            log_path: PathBuf::from("/var/log"),
            extra_paths: Vec::new(),
            base_container_name: String::new(),
            timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }
}

/// A set of checks run concurrently.
pub struct HostChecks {
    checks: Vec<Box<dyn HostCheck>>,
    timeout: Duration,
}

impl HostChecks {
    #[must_use]
    pub fn new(checks: Vec<Box<dyn HostCheck>>, timeout: Duration) -> Self {
        HostChecks { checks, timeout }
    }

    /// The built-in checks plus one writable check per extra path.
    #[must_use]
    pub fn builtin(config: &HostCheckConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let mut checks: Vec<Box<dyn HostCheck>> = vec![
            Box::new(WritablePath::new("writableRoot", &config.root_path)),
            Box::new(WritablePath::new("writableLog", &config.log_path)),
            Box::new(WritableDockerRoot {
                runtime: Arc::clone(&runtime),
            }),
        ];
        if !config.base_container_name.is_empty() {
            checks.push(Box::new(CreateContainer {
                runtime,
                base_container: config.base_container_name.clone(),
            }));
        }
        for (i, path) in config.extra_paths.iter().enumerate() {
            checks.push(Box::new(WritablePath::new(
                format!("writableCustomPath{}", i + 1),
                path,
            )));
        }
        HostChecks::new(checks, config.timeout)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Runs every check concurrently. Results are sorted by check name.
    pub async fn run(&self) -> Vec<CheckResult> {
        let limit = self.timeout;
        let mut results =
            futures_util::future::join_all(self.checks.iter().map(|check| async move {
                let outcome = match tokio::time::timeout(limit, check.run()).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(format!("timeout after {limit:?}")),
                };
                CheckResult {
                    name: check.name().to_string(),
                    successful: outcome.is_ok(),
                    err: outcome.err().unwrap_or_default(),
                }
            }))
            .await;
        results.sort_by(|a, b| a.name.cmp(&b.name));
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bs_container::testing::{inspect_with_env, FakeRuntime};

    struct Fixed {
        name: &'static str,
        result: Result<(), String>,
        delay: Duration,
    }

    #[async_trait]
    impl HostCheck for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self) -> Result<(), String> {
            tokio::time::sleep(self.delay).await;
            self.result.clone()
        }
    }

    fn fixed(name: &'static str, result: Result<(), String>, delay_ms: u64) -> Box<dyn HostCheck> {
        Box::new(Fixed {
            name,
            result,
            delay: Duration::from_millis(delay_ms),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_sorted_with_timeout() {
        let checks = HostChecks::new(
            vec![
                fixed("zeta", Ok(()), 10),
                fixed("alpha", Err("broken".to_string()), 0),
                fixed("slow", Ok(()), 5_000),
            ],
            Duration::from_secs(1),
        );
        let results = checks.run().await;
        assert_eq!(
            results,
            vec![
                CheckResult {
                    name: "alpha".to_string(),
                    successful: false,
                    err: "broken".to_string(),
                },
                CheckResult {
                    name: "slow".to_string(),
                    successful: false,
                    err: "timeout after 1s".to_string(),
                },
                CheckResult {
                    name: "zeta".to_string(),
                    successful: true,
                    err: String::new(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_builtin_checks() {
        let root = tempfile::tempdir().unwrap();
        let log = tempfile::tempdir().unwrap();
        let docker = tempfile::tempdir().unwrap();
        let extra = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new(vec![inspect_with_env("self", "bs", &[])]));
        runtime.set_root_dir(docker.path().to_str().unwrap());

        let config = HostCheckConfig {
            root_path: root.path().to_path_buf(),
            log_path: log.path().to_path_buf(),
            extra_paths: vec![extra.path().to_path_buf(), PathBuf::from("/nonexistent/bs")],
            base_container_name: "bs".to_string(),
            timeout: DEFAULT_CHECK_TIMEOUT,
        };
        let results = HostChecks::builtin(&config, runtime.clone()).run().await;
        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "createContainer",
                "writableCustomPath1",
                "writableCustomPath2",
                "writableDockerRoot",
                "writableLog",
                "writableRoot",
            ]
        );
        for result in &results {
            if result.name == "writableCustomPath2" {
                assert!(!result.successful);
                assert!(result.err.contains("unable to write"), "{}", result.err);
            } else {
                assert!(result.successful, "{} failed: {}", result.name, result.err);
            }
        }
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);

        let created = runtime.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].image, "tsuru/app");
        assert_eq!(created[0].cmd[0], "echo");
        assert_eq!(runtime.remove_calls(), vec!["created-1".to_string()]);
    }

    #[tokio::test]
    async fn test_create_container_unexpected_output() {
        let runtime = Arc::new(FakeRuntime::new(vec![inspect_with_env("self", "bs", &[])]));
        runtime.set_output(b"something else\n");
        let check = CreateContainer {
            runtime: runtime.clone(),
            base_container: "bs".to_string(),
        };
        let err = check.run().await.unwrap_err();
        assert!(err.starts_with("unexpected container output"), "{err}");
        assert_eq!(runtime.remove_calls().len(), 1);
    }
}
