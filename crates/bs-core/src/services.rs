// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::Arc;

use bs_container::docker::DockerClient;
use bs_container::{ContainerClient, ContainerRuntime};
use bs_log::LogForwarder;
use bs_status::{HostChecks, Reporter, ReporterConfig};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::ServicesError;

/// Status of the agent services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Services are running normally.
    Running,
    /// Ingress is closed and queues are draining.
    Stopping,
    /// Services have stopped.
    Stopped,
}

/// Handle to the running services.
///
/// Cancelling the shutdown token (or calling [`ServicesHandle::stop`]) stops
/// log ingress first, then drains the log backends, then stops the status
/// reporter once its in-flight removals are done.
#[derive(Debug, Clone)]
pub struct ServicesHandle {
    status: watch::Receiver<ServiceStatus>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    log_addr: Option<SocketAddr>,
}

impl ServicesHandle {
    #[must_use]
    pub fn status(&self) -> ServiceStatus {
        *self.status.borrow()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status() == ServiceStatus::Running
    }

    /// Get a receiver for status updates.
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<ServiceStatus> {
        self.status.clone()
    }

    /// Address the syslog listener is bound to, if any.
    #[must_use]
    pub fn log_addr(&self) -> Option<SocketAddr> {
        self.log_addr
    }

    /// Signals shutdown. Idempotent.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Waits until every service has stopped.
    pub async fn wait(&self) {
        self.tasks.wait().await;
    }
}

/// Supervisor of the log forwarder and the status reporter.
#[derive(Debug)]
pub struct Services {
    config: Config,
}

impl Services {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Starts every service against the runtime at `DOCKER_ENDPOINT`.
    pub async fn start(self, shutdown: CancellationToken) -> Result<ServicesHandle, ServicesError> {
        let runtime = Arc::new(DockerClient::new(&self.config.docker_endpoint)?);
        self.start_with_runtime(runtime, shutdown).await
    }

    /// Starts every service. A service that fails to start is logged and
    /// skipped; an error is returned only when nothing could be started.
    pub async fn start_with_runtime(
        self,
        runtime: Arc<dyn ContainerRuntime>,
        shutdown: CancellationToken,
    ) -> Result<ServicesHandle, ServicesError> {
        let config = self.config;
        info!(
            "status interval {:?}, metrics interval {:?}",
            config.status_interval, config.metrics_interval
        );
        let client = Arc::new(ContainerClient::new(Arc::clone(&runtime)));

        let log_forwarder = if config.has_log_ingress() {
            match LogForwarder::start(config.log_server_config(), Arc::clone(&client)).await {
                Ok(forwarder) => {
                    info!(
                        "log forwarder started, backends: {:?}",
                        config.log_backends
                    );
                    Some(forwarder)
                }
                Err(e) => {
                    error!("unable to start log forwarder: {e}");
                    None
                }
            }
        } else {
            info!("no syslog listen address or log file directory configured, log forwarder disabled");
            None
        };

        let checks = HostChecks::builtin(&config.hostcheck, runtime);
        let reporter = match Reporter::new(ReporterConfig {
            endpoint: config.tsuru_endpoint.clone(),
            token: config.tsuru_token.clone(),
            interval: config.status_interval,
            client,
            checks,
        }) {
            Ok(reporter) => {
                info!("status reporter started");
                Some(reporter)
            }
            Err(e) => {
                error!("unable to start status reporter: {e}");
                None
            }
        };

        if log_forwarder.is_none() && reporter.is_none() {
            return Err(ServicesError::NothingStarted);
        }

        let log_addr = log_forwarder.as_ref().and_then(LogForwarder::local_addr);
        let (status_tx, status_rx) = watch::channel(ServiceStatus::Running);
        let tasks = TaskTracker::new();
        let token = shutdown.clone();
        tasks.spawn(async move {
            token.cancelled().await;
            info!("Shutting down services");
            status_tx.send_replace(ServiceStatus::Stopping);
            if let Some(forwarder) = log_forwarder {
                forwarder.stop().await;
                debug!("log forwarder stopped");
            }
            if let Some(reporter) = reporter {
                reporter.stop().await;
                debug!("status reporter stopped");
            }
            status_tx.send_replace(ServiceStatus::Stopped);
        });
        tasks.close();

        Ok(ServicesHandle {
            status: status_rx,
            shutdown,
            tasks,
            log_addr,
        })
    }
}
