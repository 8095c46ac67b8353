// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tails container JSON log files.
//!
//! Files are named `<pod>_<namespace>_<container>-<id>.log` and hold one JSON
//! document per line: `{"log": "...", "stream": "stdout", "time": "..."}`.
//! The directory is scanned every poll interval. Files seen on the first
//! scan are followed from their current end, files that appear later are
//! read from the start.
//!
//! A file is read again from its start when it is replaced, when it shrinks
//! below the read offset, or when its first bytes no longer match the ones
//! seen before (truncated and rewritten between two polls).

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::parser::RawLogParts;
use crate::ratelimit::RateLimiter;
use crate::server::{LogHandler, MAX_LINE_LENGTH};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const STDOUT_PRIORITY: u8 = 30;
const STDERR_PRIORITY: u8 = 27;
const HEAD_LEN: u64 = 64;

#[allow(clippy::expect_used)]
fn log_file_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<pod>[^_]+)_(?P<ns>[^_]+)_(?P<container>.+)-(?P<id>[0-9a-f]{64})\.log$")
            .expect("failed creating regex")
    })
}

/// Extracts the container id from a log file name.
#[must_use]
pub fn container_id_from_name(name: &str) -> Option<&str> {
    log_file_pattern()
        .captures(name)
        .and_then(|c| c.name("id"))
        .map(|m| m.as_str())
}

#[derive(Debug, Clone)]
pub struct FileMonitorConfig {
    pub directory: PathBuf,
    pub poll_interval: Duration,
}

impl FileMonitorConfig {
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        FileMonitorConfig {
            directory: directory.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Deserialize)]
struct LogRecord {
    log: String,
    #[serde(default)]
    stream: String,
    #[serde(default)]
    time: String,
}

/// Turns one JSON log line into the parts a syslog line would have produced.
pub fn parts_from_json(line: &[u8], container_id: &str) -> Result<RawLogParts, serde_json::Error> {
    let record: LogRecord = serde_json::from_slice(line)?;
    let priority = if record.stream == "stderr" {
        STDERR_PRIORITY
    } else {
        STDOUT_PRIORITY
    };
    let content = record.log.trim_end_matches('\n');
    Ok(RawLogParts::from_record(
        priority,
        &record.time,
        container_id,
        content.as_bytes(),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

#[cfg(unix)]
fn file_identity(metadata: &std::fs::Metadata) -> Option<FileIdentity> {
    use std::os::unix::fs::MetadataExt;
    Some(FileIdentity {
        dev: metadata.dev(),
        ino: metadata.ino(),
    })
}

#[cfg(not(unix))]
fn file_identity(_metadata: &std::fs::Metadata) -> Option<FileIdentity> {
    None
}

#[derive(Default)]
struct TailState {
    container_id: String,
    offset: u64,
    partial: Vec<u8>,
    identity: Option<FileIdentity>,
    // First bytes of the file as last read.
    head: Vec<u8>,
    // Set while skipping the rest of an oversized line.
    discarding: bool,
}

impl TailState {
    fn rewind(&mut self) {
        self.offset = 0;
        self.partial.clear();
        self.discarding = false;
    }
}

pub struct FileMonitor {
    config: FileMonitorConfig,
    handler: Arc<dyn LogHandler>,
    files: HashMap<PathBuf, TailState>,
    initial_scan: bool,
    decode_warning: RateLimiter,
}

impl FileMonitor {
    #[must_use]
    pub fn new(config: FileMonitorConfig, handler: Arc<dyn LogHandler>) -> Self {
        FileMonitor {
            config,
            handler,
            files: HashMap::new(),
            initial_scan: true,
            decode_warning: RateLimiter::default(),
        }
    }

    /// Polls the directory until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => self.poll().await,
            }
        }
    }

    /// One scan of the directory followed by a read of every tracked file.
    pub async fn poll(&mut self) {
        if let Err(e) = self.scan().await {
            warn!(
                "[file monitor] unable to list {}: {e}",
                self.config.directory.display()
            );
            return;
        }
        let paths: Vec<PathBuf> = self.files.keys().cloned().collect();
        for path in paths {
            let lines = match self.read_lines(&path).await {
                Ok(lines) => lines,
                Err(e) => {
                    debug!("[file monitor] unable to read {}: {e}", path.display());
                    continue;
                }
            };
            let Some(container_id) = self.files.get(&path).map(|s| s.container_id.clone()) else {
                continue;
            };
            for line in lines {
                match parts_from_json(&line, &container_id) {
                    Ok(parts) => self.handler.handle(parts).await,
                    Err(e) => {
                        if self.decode_warning.allow() {
                            warn!("[file monitor] invalid log line in {}: {e}", path.display());
                        }
                    }
                }
            }
        }
    }

    async fn scan(&mut self) -> std::io::Result<()> {
        let mut entries = tokio::fs::read_dir(&self.config.directory).await?;
        let mut present = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(container_id) = container_id_from_name(name) else {
                debug!("[file monitor] skipping {name}");
                continue;
            };
            if !self.files.contains_key(&path) {
                let offset = if self.initial_scan {
                    entry.metadata().await.map(|m| m.len()).unwrap_or(0)
                } else {
                    0
                };
                debug!("[file monitor] following {name} from offset {offset}");
                self.files.insert(
                    path.clone(),
                    TailState {
                        container_id: container_id.to_string(),
                        offset,
                        ..Default::default()
                    },
                );
            }
            present.push(path);
        }
        self.files.retain(|path, _| present.contains(path));
        self.initial_scan = false;
        Ok(())
    }

    /// Reads the complete lines appended to `path` since the last call.
    async fn read_lines(&mut self, path: &Path) -> std::io::Result<Vec<Vec<u8>>> {
        let Some(state) = self.files.get_mut(path) else {
            return Ok(Vec::new());
        };
        let mut file = tokio::fs::File::open(path).await?;
        let metadata = file.metadata().await?;
        let len = metadata.len();
        let identity = file_identity(&metadata);
        let mut head = Vec::new();
        (&mut file).take(HEAD_LEN).read_to_end(&mut head).await?;

        let replaced = matches!((state.identity, identity), (Some(old), Some(new)) if old != new);
        if replaced || len < state.offset || !head.starts_with(&state.head) {
            debug!("[file monitor] {} was truncated or replaced", path.display());
            state.rewind();
        }
        state.identity = identity;
        state.head = head;
        if len <= state.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(state.offset)).await?;
        let read = file
            .take(len - state.offset)
            .read_to_end(&mut state.partial)
            .await?;
        state.offset += read as u64;

        let mut lines = Vec::new();
        let mut dropped = false;
        let mut start = 0;
        while let Some(end) = state.partial[start..].iter().position(|b| *b == b'\n') {
            let line = &state.partial[start..start + end];
            if state.discarding {
                state.discarding = false;
            } else if line.len() > MAX_LINE_LENGTH {
                dropped = true;
            } else if !line.is_empty() {
                lines.push(line.to_vec());
            }
            start += end + 1;
        }
        state.partial.drain(..start);
        if state.discarding || state.partial.len() > MAX_LINE_LENGTH {
            if !state.discarding {
                dropped = true;
            }
            state.partial.clear();
            state.discarding = true;
        }
        if dropped && self.decode_warning.allow() {
            warn!(
                "[file monitor] dropping log line longer than {MAX_LINE_LENGTH} bytes in {}",
                path.display()
            );
        }
        Ok(lines)
    }
}
