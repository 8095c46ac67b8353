// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bs_container::types::ContainerState;
use bs_container::ContainerClient;
use serde::Serialize;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::addrs::host_addresses;
use crate::api::{ControlPlane, NodeStatus};
use crate::error::Error;
use crate::hostcheck::HostChecks;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
const ISOLATED_RUN_LABEL: &str = "is-isolated-run";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Started,
    Stopped,
    Error,
    Created,
}

impl Status {
    #[must_use]
    pub fn from_state(state: &ContainerState) -> Self {
        if state.restarting {
            Status::Error
        } else if state.running {
            Status::Started
        } else if state.started_at_is_zero() {
            Status::Created
        } else {
            Status::Stopped
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitStatus {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Status")]
    pub status: Status,
}

pub struct ReporterConfig {
    pub endpoint: String,
    pub token: String,
    pub interval: Duration,
    pub client: Arc<ContainerClient>,
    pub checks: HostChecks,
}

/// What a single report cycle did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub units: Vec<UnitStatus>,
    /// Removals started by this cycle.
    pub removals: Vec<String>,
}

struct ReportCycle {
    api: ControlPlane,
    client: Arc<ContainerClient>,
    checks: HostChecks,
    pending: Arc<Mutex<HashSet<String>>>,
    removals: TaskTracker,
}

impl ReportCycle {
    async fn units(&self) -> Result<Vec<UnitStatus>, Error> {
        let listed = self.client.runtime().list_containers(true).await?;
        let mut units = Vec::with_capacity(listed.len());
        for summary in listed {
            let container = match self.client.get_fresh_container(&summary.id).await {
                Ok(container) => container,
                Err(e) => {
                    warn!("[status reporter] unable to inspect container {}: {e}", summary.id);
                    continue;
                }
            };
            if !container.is_app()
                || container.inspect.label(ISOLATED_RUN_LABEL) == Some("true")
            {
                continue;
            }
            units.push(UnitStatus {
                id: container.id.clone(),
                name: container.name.clone(),
                status: Status::from_state(&container.inspect.state),
            });
        }
        Ok(units)
    }

    async fn run(&self) -> Result<CycleSummary, Error> {
        let units = self.units().await?;
        let checks = self.checks.run().await;
        let addrs = host_addresses();
        let found = self
            .api
            .report(&NodeStatus {
                addrs: &addrs,
                units: &units,
                checks: &checks,
            })
            .await?;

        let mut removals = Vec::new();
        for unit in found.into_iter().filter(|u| !u.found) {
            let fresh = match self.pending.lock() {
                Ok(mut pending) => pending.insert(unit.id.clone()),
                Err(_) => false,
            };
            if !fresh {
                debug!("[status reporter] removal of {} already in progress", unit.id);
                continue;
            }
            removals.push(unit.id.clone());
            let client = Arc::clone(&self.client);
            let pending = Arc::clone(&self.pending);
            self.removals.spawn(async move {
                info!("[status reporter] removing container {} unknown to the control plane", unit.id);
                if let Err(e) = client.runtime().remove_container(&unit.id, true).await {
                    error!("[status reporter] unable to remove container {}: {e}", unit.id);
                }
                if let Ok(mut pending) = pending.lock() {
                    pending.remove(&unit.id);
                }
            });
        }
        Ok(CycleSummary { units, removals })
    }
}

/// Reports unit status every interval until stopped.
pub struct Reporter {
    cycle: Arc<ReportCycle>,
    abort: CancellationToken,
    tasks: TaskTracker,
}

impl Reporter {
    /// Builds the reporter and starts its loop. The first report is sent one
    /// interval after start.
    pub fn new(config: ReporterConfig) -> Result<Self, Error> {
        let api = ControlPlane::new(&config.endpoint, &config.token)?;
        let cycle = Arc::new(ReportCycle {
            api,
            client: config.client,
            checks: config.checks,
            pending: Arc::new(Mutex::new(HashSet::new())),
            removals: TaskTracker::new(),
        });
        let abort = CancellationToken::new();
        let tasks = TaskTracker::new();
        tasks.spawn(report_loop(
            Arc::clone(&cycle),
            abort.clone(),
            config.interval.max(Duration::from_secs(1)),
        ));
        tasks.close();
        Ok(Reporter {
            cycle,
            abort,
            tasks,
        })
    }

    /// Runs one report cycle now.
    pub async fn report(&self) -> Result<CycleSummary, Error> {
        self.cycle.run().await
    }

    /// Number of removals started and not finished yet.
    #[must_use]
    pub fn pending_removals(&self) -> usize {
        self.cycle.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Stops the loop and waits for in-flight removals.
    pub async fn stop(&self) {
        self.abort.cancel();
        self.wait().await;
    }

    /// Waits until the loop has exited.
    pub async fn wait(&self) {
        self.tasks.wait().await;
    }
}

async fn report_loop(cycle: Arc<ReportCycle>, abort: CancellationToken, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = abort.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match cycle.run().await {
            Ok(summary) => debug!(
                "[status reporter] reported {} units, {} removals started",
                summary.units.len(),
                summary.removals.len()
            ),
            Err(e) => error!("[status reporter] unable to report status: {e}"),
        }
    }
    cycle.removals.close();
    cycle.removals.wait().await;
}
