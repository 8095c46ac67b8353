// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log destinations.

use std::str::FromStr;

use bs_container::Container;

use crate::errors::ServerError;
use crate::forwarder::ForwarderConfig;
use crate::parser::RawLogParts;

pub mod gelf;
pub mod syslog;
pub mod tsuru;

pub use gelf::{GelfBackend, GelfCompression, GelfConfig};
pub use syslog::{SyslogBackend, SyslogConfig, SyslogTimezone};
pub use tsuru::{TsuruBackend, TsuruConfig};

/// Backend names accepted in the enabled backends list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Tsuru,
    Syslog,
    Gelf,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Tsuru => "tsuru",
            BackendKind::Syslog => "syslog",
            BackendKind::Gelf => "gelf",
        }
    }

    /// Parses a comma separated list. `none` alone disables every backend.
    pub fn parse_list(value: &str) -> Result<Vec<BackendKind>, ServerError> {
        let mut kinds = Vec::new();
        for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if name.eq_ignore_ascii_case("none") {
                continue;
            }
            let kind = name.parse::<BackendKind>()?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        Ok(kinds)
    }
}

impl FromStr for BackendKind {
    type Err = ServerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tsuru" => Ok(BackendKind::Tsuru),
            "syslog" => Ok(BackendKind::Syslog),
            "gelf" => Ok(BackendKind::Gelf),
            _ => Err(ServerError::UnknownBackend(value.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub enum BackendConfig {
    Tsuru(TsuruConfig),
    Syslog(SyslogConfig),
    Gelf(GelfConfig),
}

impl BackendConfig {
    #[must_use]
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::Tsuru(_) => BackendKind::Tsuru,
            BackendConfig::Syslog(_) => BackendKind::Syslog,
            BackendConfig::Gelf(_) => BackendKind::Gelf,
        }
    }
}

/// A running log destination.
pub enum Backend {
    Tsuru(TsuruBackend),
    Syslog(SyslogBackend),
    Gelf(GelfBackend),
}

impl Backend {
    pub async fn start(config: &BackendConfig, forwarder: ForwarderConfig) -> Result<Self, ServerError> {
        let name = config.kind().as_str();
        let backend = match config {
            BackendConfig::Tsuru(c) => TsuruBackend::start(c.clone(), forwarder)
                .await
                .map(Backend::Tsuru),
            BackendConfig::Syslog(c) => SyslogBackend::start(c.clone(), forwarder)
                .await
                .map(Backend::Syslog),
            BackendConfig::Gelf(c) => GelfBackend::start(c.clone(), forwarder)
                .await
                .map(Backend::Gelf),
        };
        backend.map_err(|source| ServerError::Backend {
            name: name.to_string(),
            source,
        })
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Tsuru(_) => BackendKind::Tsuru.as_str(),
            Backend::Syslog(_) => BackendKind::Syslog.as_str(),
            Backend::Gelf(_) => BackendKind::Gelf.as_str(),
        }
    }

    pub fn send_message(&self, parts: &RawLogParts, container: &Container) {
        match self {
            Backend::Tsuru(b) => b.send_message(parts, container),
            Backend::Syslog(b) => b.send_message(parts, container),
            Backend::Gelf(b) => b.send_message(parts, container),
        }
    }

    pub async fn stop(self) {
        match self {
            Backend::Tsuru(b) => b.stop().await,
            Backend::Syslog(b) => b.stop().await,
            Backend::Gelf(b) => b.stop().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backend_list() {
        assert_eq!(
            BackendKind::parse_list("tsuru, syslog,gelf,tsuru").unwrap(),
            vec![BackendKind::Tsuru, BackendKind::Syslog, BackendKind::Gelf]
        );
        assert!(BackendKind::parse_list("none").unwrap().is_empty());
        assert!(BackendKind::parse_list("").unwrap().is_empty());
        let err = BackendKind::parse_list("syslog,kafka").unwrap_err();
        assert!(matches!(err, ServerError::UnknownBackend(name) if name == "kafka"));
    }

    #[tokio::test]
    async fn test_start_reports_backend_name() {
        let config = BackendConfig::Tsuru(TsuruConfig {
            endpoint: "ftp://nowhere".to_string(),
            token: "t".to_string(),
            ping_interval: tsuru::DEFAULT_PING_INTERVAL,
            pong_interval: None,
        });
        let err = Backend::start(&config, ForwarderConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::Backend { ref name, .. } if name == "tsuru"));
    }
}
