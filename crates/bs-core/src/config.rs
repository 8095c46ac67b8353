// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bs_log::backends::syslog::SyslogAddress;
use bs_log::backends::{
    BackendConfig, BackendKind, GelfCompression, GelfConfig, SyslogConfig, SyslogTimezone,
    TsuruConfig,
};
use bs_log::backends::tsuru::DEFAULT_PING_INTERVAL;
use bs_log::file_monitor::FileMonitorConfig;
use bs_log::forwarder::{ForwarderConfig, DEFAULT_QUEUE_SIZE};
use bs_log::LogServerConfig;
use bs_status::hostcheck::DEFAULT_CHECK_TIMEOUT;
use bs_status::HostCheckConfig;
use tracing::warn;

use crate::error::ConfigError;

pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_LOG_BACKENDS: &str = "tsuru,syslog";
const GELF_CHUNK_HEADER_LEN: usize = 12;

/// Configuration of the node agent, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Container runtime API endpoint (`unix://`, `tcp://` or `http://`)
    pub docker_endpoint: String,
    /// Control plane API endpoint
    pub tsuru_endpoint: String,
    pub tsuru_token: String,
    /// Syslog listener, `udp://host:port` or `tcp://host:port`
    pub syslog_listen_address: Option<String>,
    pub status_interval: Duration,
    /// Parsed and reported only; no metrics are collected.
    pub metrics_interval: Duration,
    pub log_backends: Vec<BackendKind>,
    /// Queue size of every log backend
    pub log_buffer_size: usize,
    pub syslog: SyslogConfig,
    pub gelf: GelfConfig,
    pub tsuru_ping_interval: Duration,
    pub tsuru_pong_interval: Option<Duration>,
    /// Env names a container must carry for its logs to be forwarded
    pub required_envs: Vec<String>,
    /// Directory of JSON log files to tail
    pub file_monitor_dir: Option<PathBuf>,
    pub hostcheck: HostCheckConfig,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            docker_endpoint: String::new(),
            tsuru_endpoint: String::new(),
            tsuru_token: String::new(),
            syslog_listen_address: None,
            status_interval: DEFAULT_STATUS_INTERVAL,
            metrics_interval: DEFAULT_METRICS_INTERVAL,
            log_backends: vec![BackendKind::Tsuru, BackendKind::Syslog],
            log_buffer_size: DEFAULT_QUEUE_SIZE,
            syslog: SyslogConfig::default(),
            gelf: GelfConfig::default(),
            tsuru_ping_interval: DEFAULT_PING_INTERVAL,
            tsuru_pong_interval: None,
            required_envs: Vec::new(),
            file_monitor_dir: None,
            hostcheck: HostCheckConfig::default(),
            debug: false,
        }
    }
}

/// Reads variables through a lookup function. Blank values count as unset.
struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn get_with_alias(&self, name: &'static str, deprecated: &'static str) -> Option<String> {
        self.get(name).or_else(|| {
            let value = self.get(deprecated)?;
            warn!("{deprecated} is deprecated, use {name} instead");
            Some(value)
        })
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.get(name).ok_or(ConfigError::Missing(name))
    }

    fn parse<T>(&self, name: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        value
            .map(|value| {
                value
                    .parse::<T>()
                    .map_err(|e| ConfigError::invalid(name, &value, e))
            })
            .transpose()
    }

    fn number<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.parse(name, self.get(name))?.unwrap_or(default))
    }

    fn seconds(&self, name: &'static str, value: Option<String>) -> Result<Option<Duration>, ConfigError> {
        value
            .map(|value| parse_seconds(&value).map_err(|reason| ConfigError::invalid(name, &value, reason)))
            .transpose()
    }

    fn flag(&self, name: &'static str) -> Result<bool, ConfigError> {
        match self.get(name) {
            None => Ok(false),
            Some(value) => parse_flag(&value).ok_or_else(|| {
                ConfigError::invalid(name, &value, "expected true or false")
            }),
        }
    }

    fn list(&self, name: &str) -> Option<Vec<String>> {
        self.get(name).map(|value| split_list(&value))
    }

    /// A value of the form `$NAME` is replaced by the value of `NAME`.
    fn expand(&self, name: &str) -> String {
        let Some(value) = (self.lookup)(name) else {
            return String::new();
        };
        match value.strip_prefix('$') {
            Some(var) if !var.is_empty() => (self.lookup)(var).unwrap_or_default(),
            _ => value,
        }
    }
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    let seconds = value
        .parse::<f64>()
        .map_err(|_| "expected a number of seconds".to_string())?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err("expected a positive number of seconds".to_string());
    }
    Ok(Duration::from_secs_f64(seconds))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_default()
}

/// Tracing filter for the process: `BS_LOG_FILTER` when set, else `debug`
/// or `info` depending on `BS_DEBUG`.
#[must_use]
pub fn log_filter_from_env() -> String {
    log_filter_from(|name| env::var(name).ok())
}

fn log_filter_from<F: Fn(&str) -> Option<String>>(lookup: F) -> String {
    let vars = Vars { lookup };
    if let Some(filter) = vars.get("BS_LOG_FILTER") {
        return filter;
    }
    let level = if vars.flag("BS_DEBUG").unwrap_or(false) {
        "debug"
    } else {
        "info"
    };
    format!("h2=off,hyper=off,rustls=off,tungstenite=off,{level}")
}

impl Config {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads the configuration through `lookup` and validates it.
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, ConfigError> {
        let vars = Vars { lookup };
        let defaults = Config::default();

        let log_backends = BackendKind::parse_list(
            &vars
                .get("LOG_BACKENDS")
                .unwrap_or_else(|| DEFAULT_LOG_BACKENDS.to_string()),
        )
        .map_err(|e| {
            ConfigError::invalid(
                "LOG_BACKENDS",
                &vars.get("LOG_BACKENDS").unwrap_or_default(),
                e,
            )
        })?;

        let syslog = SyslogConfig {
            addresses: vars
                .get_with_alias("LOG_SYSLOG_FORWARD_ADDRESSES", "SYSLOG_FORWARD_ADDRESSES")
                .map(|value| split_list(&value))
                .unwrap_or_default(),
            timezone: vars
                .parse::<SyslogTimezone>("LOG_SYSLOG_TIMEZONE", vars.get("LOG_SYSLOG_TIMEZONE"))?
                .unwrap_or_default(),
            extra_start: vars.expand("LOG_SYSLOG_MESSAGE_EXTRA_START"),
            extra_end: vars.expand("LOG_SYSLOG_MESSAGE_EXTRA_END"),
        };

        let gelf = GelfConfig {
            host: vars.get("LOG_GELF_HOST").unwrap_or(defaults.gelf.host),
            chunk_size: vars.number("LOG_GELF_CHUNK_SIZE", defaults.gelf.chunk_size)?,
            fields_whitelist: vars
                .list("LOG_GELF_FIELDS_WHITELIST")
                .unwrap_or(defaults.gelf.fields_whitelist),
            compression: vars
                .parse::<GelfCompression>("LOG_GELF_COMPRESSION", vars.get("LOG_GELF_COMPRESSION"))?
                .unwrap_or_default(),
        };

        let hostcheck = HostCheckConfig {
            root_path: vars
                .get("HOSTCHECK_ROOT_PATH_OVERRIDE")
                .map_or(defaults.hostcheck.root_path, PathBuf::from),
            extra_paths: vars
                .list("HOSTCHECK_EXTRA_PATHS")
                .unwrap_or_default()
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            base_container_name: vars
                .get("HOSTCHECK_BASE_CONTAINER_NAME")
                .unwrap_or_else(local_hostname),
            timeout: vars
                .seconds("HOSTCHECK_TIMEOUT", vars.get("HOSTCHECK_TIMEOUT"))?
                .unwrap_or(DEFAULT_CHECK_TIMEOUT),
            ..defaults.hostcheck
        };

        let config = Self {
            docker_endpoint: vars.required("DOCKER_ENDPOINT")?,
            tsuru_endpoint: vars.required("TSURU_ENDPOINT")?,
            tsuru_token: vars.required("TSURU_TOKEN")?,
            syslog_listen_address: vars.get("SYSLOG_LISTEN_ADDRESS"),
            status_interval: vars
                .seconds("STATUS_INTERVAL", vars.get("STATUS_INTERVAL"))?
                .unwrap_or(DEFAULT_STATUS_INTERVAL),
            metrics_interval: vars
                .seconds("METRICS_INTERVAL", vars.get("METRICS_INTERVAL"))?
                .unwrap_or(DEFAULT_METRICS_INTERVAL),
            log_backends,
            log_buffer_size: vars.number("LOG_BUFFER_SIZE", DEFAULT_QUEUE_SIZE)?,
            syslog,
            gelf,
            tsuru_ping_interval: vars
                .seconds(
                    "LOG_TSURU_PING_INTERVAL",
                    vars.get_with_alias("LOG_TSURU_PING_INTERVAL", "LOG_WS_PING_INTERVAL"),
                )?
                .unwrap_or(DEFAULT_PING_INTERVAL),
            tsuru_pong_interval: vars.seconds(
                "LOG_TSURU_PONG_INTERVAL",
                vars.get_with_alias("LOG_TSURU_PONG_INTERVAL", "LOG_WS_PONG_INTERVAL"),
            )?,
            required_envs: vars.list("LOG_REQUIRED_ENVS").unwrap_or_default(),
            file_monitor_dir: vars.get("LOG_FILE_MONITOR_DIR").map(PathBuf::from),
            hostcheck,
            debug: vars.flag("BS_DEBUG")?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.docker_endpoint.trim().is_empty() {
            return Err(ConfigError::Missing("DOCKER_ENDPOINT"));
        }
        if self.tsuru_endpoint.trim().is_empty() {
            return Err(ConfigError::Missing("TSURU_ENDPOINT"));
        }
        if self.tsuru_token.trim().is_empty() {
            return Err(ConfigError::Missing("TSURU_TOKEN"));
        }
        if !(self.tsuru_endpoint.starts_with("http://") || self.tsuru_endpoint.starts_with("https://")) {
            return Err(ConfigError::invalid(
                "TSURU_ENDPOINT",
                &self.tsuru_endpoint,
                "expected an http:// or https:// URL",
            ));
        }

        for (name, interval) in [
            ("STATUS_INTERVAL", self.status_interval),
            ("METRICS_INTERVAL", self.metrics_interval),
            ("LOG_TSURU_PING_INTERVAL", self.tsuru_ping_interval),
            ("HOSTCHECK_TIMEOUT", self.hostcheck.timeout),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::invalid(name, "0", "must be greater than 0"));
            }
        }

        if self.log_buffer_size == 0 {
            return Err(ConfigError::invalid("LOG_BUFFER_SIZE", "0", "must be greater than 0"));
        }

        if let Some(address) = &self.syslog_listen_address {
            if !(address.starts_with("udp://") || address.starts_with("tcp://")) {
                return Err(ConfigError::invalid(
                    "SYSLOG_LISTEN_ADDRESS",
                    address,
                    "expected udp://host:port or tcp://host:port",
                ));
            }
        }

        if self.log_backends.contains(&BackendKind::Syslog) {
            for address in &self.syslog.addresses {
                if let Err(e) = address.parse::<SyslogAddress>() {
                    return Err(ConfigError::invalid("LOG_SYSLOG_FORWARD_ADDRESSES", address, e));
                }
            }
        }

        if self.log_backends.contains(&BackendKind::Gelf) {
            if !self.gelf.host.contains(':') {
                return Err(ConfigError::invalid(
                    "LOG_GELF_HOST",
                    &self.gelf.host,
                    "expected host:port",
                ));
            }
            if self.gelf.chunk_size <= GELF_CHUNK_HEADER_LEN {
                return Err(ConfigError::invalid(
                    "LOG_GELF_CHUNK_SIZE",
                    &self.gelf.chunk_size.to_string(),
                    format!("must be greater than {GELF_CHUNK_HEADER_LEN}"),
                ));
            }
        }

        Ok(())
    }

    /// Whether any log ingress (listener or file monitor) is configured.
    #[must_use]
    pub fn has_log_ingress(&self) -> bool {
        self.syslog_listen_address.is_some() || self.file_monitor_dir.is_some()
    }

    #[must_use]
    pub fn backend_configs(&self) -> Vec<BackendConfig> {
        self.log_backends
            .iter()
            .map(|kind| match kind {
                BackendKind::Tsuru => BackendConfig::Tsuru(TsuruConfig {
                    endpoint: self.tsuru_endpoint.clone(),
                    token: self.tsuru_token.clone(),
                    ping_interval: self.tsuru_ping_interval,
                    pong_interval: self.tsuru_pong_interval,
                }),
                BackendKind::Syslog => BackendConfig::Syslog(self.syslog.clone()),
                BackendKind::Gelf => BackendConfig::Gelf(self.gelf.clone()),
            })
            .collect()
    }

    #[must_use]
    pub fn log_server_config(&self) -> LogServerConfig {
        LogServerConfig {
            listen_address: self.syslog_listen_address.clone(),
            file_monitor: self.file_monitor_dir.clone().map(FileMonitorConfig::new),
            backends: self.backend_configs(),
            forwarder: ForwarderConfig::with_queue_size(self.log_buffer_size),
            required_envs: self.required_envs.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;
    use tracing_test::traced_test;

    const REQUIRED: [(&str, &str); 3] = [
        ("DOCKER_ENDPOINT", "unix:///var/run/docker.sock"),
        ("TSURU_ENDPOINT", "http://tsuru.local:8080"),
        ("TSURU_TOKEN", "abc"),
    ];

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = REQUIRED
            .iter()
            .chain(vars.iter())
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    fn valid() -> Config {
        load(&[]).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = valid();
        assert_eq!(config.status_interval, Duration::from_secs(60));
        assert_eq!(config.metrics_interval, Duration::from_secs(60));
        assert_eq!(
            config.log_backends,
            vec![BackendKind::Tsuru, BackendKind::Syslog]
        );
        assert_eq!(config.log_buffer_size, 1_000_000);
        assert_eq!(config.gelf.host, "localhost:12201");
        assert_eq!(config.tsuru_ping_interval, Duration::from_secs(30));
        assert_eq!(config.tsuru_pong_interval, None);
        assert_eq!(config.syslog.timezone, SyslogTimezone::Local);
        assert!(config.syslog.addresses.is_empty());
        assert!(config.required_envs.is_empty());
        assert_eq!(config.hostcheck.root_path, PathBuf::from("/"));
        assert_eq!(config.hostcheck.timeout, Duration::from_secs(30));
        assert!(!config.has_log_ingress());
        assert!(!config.debug);
    }

    #[test]
    fn test_required_variables() {
        for missing in ["DOCKER_ENDPOINT", "TSURU_ENDPOINT", "TSURU_TOKEN"] {
            let vars: HashMap<&str, &str> = REQUIRED
                .iter()
                .copied()
                .filter(|(name, _)| *name != missing)
                .collect();
            let err = Config::from_lookup(|name| vars.get(name).map(|v| (*v).to_string()))
                .unwrap_err();
            assert!(
                matches!(err, ConfigError::Missing(name) if name == missing),
                "{err}"
            );
        }
    }

    #[test]
    fn test_reads_every_setting() {
        let config = load(&[
            ("SYSLOG_LISTEN_ADDRESS", "udp://0.0.0.0:1514"),
            ("STATUS_INTERVAL", "15"),
            ("METRICS_INTERVAL", "0.5"),
            ("LOG_BACKENDS", "gelf, syslog"),
            ("LOG_BUFFER_SIZE", "100"),
            ("LOG_SYSLOG_FORWARD_ADDRESSES", "udp://a:514,tcp://b:601"),
            ("LOG_SYSLOG_TIMEZONE", "America/Sao_Paulo"),
            ("LOG_GELF_HOST", "graylog:12201"),
            ("LOG_GELF_CHUNK_SIZE", "8000"),
            ("LOG_GELF_FIELDS_WHITELIST", "status, uri"),
            ("LOG_GELF_COMPRESSION", "gzip"),
            ("LOG_TSURU_PING_INTERVAL", "5"),
            ("LOG_TSURU_PONG_INTERVAL", "40"),
            ("LOG_REQUIRED_ENVS", "TSURU_APPNAME"),
            ("LOG_FILE_MONITOR_DIR", "/var/log/containers"),
            ("HOSTCHECK_BASE_CONTAINER_NAME", "big-sibling"),
            ("HOSTCHECK_ROOT_PATH_OVERRIDE", "/rootfs"),
            ("HOSTCHECK_EXTRA_PATHS", "/data,/scratch"),
            ("HOSTCHECK_TIMEOUT", "3"),
            ("BS_DEBUG", "true"),
        ])
        .unwrap();

        assert_eq!(
            config.syslog_listen_address.as_deref(),
            Some("udp://0.0.0.0:1514")
        );
        assert_eq!(config.status_interval, Duration::from_secs(15));
        assert_eq!(config.metrics_interval, Duration::from_millis(500));
        assert_eq!(config.log_backends, vec![BackendKind::Gelf, BackendKind::Syslog]);
        assert_eq!(config.log_buffer_size, 100);
        assert_eq!(config.syslog.addresses, vec!["udp://a:514", "tcp://b:601"]);
        assert_eq!(
            config.syslog.timezone,
            "America/Sao_Paulo".parse::<SyslogTimezone>().unwrap()
        );
        assert_eq!(config.gelf.host, "graylog:12201");
        assert_eq!(config.gelf.chunk_size, 8000);
        assert_eq!(config.gelf.fields_whitelist, vec!["status", "uri"]);
        assert_eq!(config.gelf.compression, GelfCompression::Gzip);
        assert_eq!(config.tsuru_ping_interval, Duration::from_secs(5));
        assert_eq!(config.tsuru_pong_interval, Some(Duration::from_secs(40)));
        assert_eq!(config.required_envs, vec!["TSURU_APPNAME"]);
        assert_eq!(
            config.file_monitor_dir,
            Some(PathBuf::from("/var/log/containers"))
        );
        assert_eq!(config.hostcheck.base_container_name, "big-sibling");
        assert_eq!(config.hostcheck.root_path, PathBuf::from("/rootfs"));
        assert_eq!(
            config.hostcheck.extra_paths,
            vec![PathBuf::from("/data"), PathBuf::from("/scratch")]
        );
        assert_eq!(config.hostcheck.timeout, Duration::from_secs(3));
        assert!(config.debug);
        assert!(config.has_log_ingress());
    }

    #[test]
    fn test_message_extras_expand_variables() {
        let config = load(&[
            ("LOG_SYSLOG_MESSAGE_EXTRA_START", "$POOL_TAG"),
            ("POOL_TAG", "pool=prod"),
            ("LOG_SYSLOG_MESSAGE_EXTRA_END", "region=us"),
        ])
        .unwrap();
        assert_eq!(config.syslog.extra_start, "pool=prod");
        assert_eq!(config.syslog.extra_end, "region=us");

        let config = load(&[("LOG_SYSLOG_MESSAGE_EXTRA_START", "$UNSET_VAR")]).unwrap();
        assert_eq!(config.syslog.extra_start, "");
    }

    #[test]
    #[traced_test]
    fn test_deprecated_aliases() {
        let config = load(&[
            ("SYSLOG_FORWARD_ADDRESSES", "udp://old:514"),
            ("LOG_WS_PING_INTERVAL", "7"),
            ("LOG_WS_PONG_INTERVAL", "70"),
        ])
        .unwrap();
        assert_eq!(config.syslog.addresses, vec!["udp://old:514"]);
        assert_eq!(config.tsuru_ping_interval, Duration::from_secs(7));
        assert_eq!(config.tsuru_pong_interval, Some(Duration::from_secs(70)));
        assert!(logs_contain(
            "SYSLOG_FORWARD_ADDRESSES is deprecated, use LOG_SYSLOG_FORWARD_ADDRESSES instead"
        ));
        assert!(logs_contain("LOG_WS_PING_INTERVAL is deprecated"));

        let config = load(&[
            ("SYSLOG_FORWARD_ADDRESSES", "udp://old:514"),
            ("LOG_SYSLOG_FORWARD_ADDRESSES", "udp://new:514"),
        ])
        .unwrap();
        assert_eq!(config.syslog.addresses, vec!["udp://new:514"]);
    }

    #[test]
    fn test_invalid_values() {
        for (name, value) in [
            ("STATUS_INTERVAL", "soon"),
            ("STATUS_INTERVAL", "0"),
            ("METRICS_INTERVAL", "-1"),
            ("LOG_BACKENDS", "tsuru,kafka"),
            ("LOG_BUFFER_SIZE", "0"),
            ("LOG_BUFFER_SIZE", "many"),
            ("LOG_SYSLOG_TIMEZONE", "Mars/Olympus"),
            ("LOG_SYSLOG_FORWARD_ADDRESSES", "http://a:514"),
            ("LOG_GELF_COMPRESSION", "brotli"),
            ("SYSLOG_LISTEN_ADDRESS", "0.0.0.0:1514"),
            ("TSURU_ENDPOINT", "tsuru.local"),
            ("HOSTCHECK_TIMEOUT", "0"),
            ("BS_DEBUG", "maybe"),
        ] {
            let result = load(&[(name, value)]);
            assert!(
                matches!(result, Err(ConfigError::Invalid { name: n, .. }) if n == name),
                "{name}={value} gave {result:?}"
            );
        }
    }

    #[test]
    fn test_gelf_settings_validated_only_when_enabled() {
        assert!(load(&[("LOG_GELF_HOST", "graylog")]).is_ok());
        assert!(load(&[("LOG_BACKENDS", "gelf"), ("LOG_GELF_HOST", "graylog")]).is_err());
        assert!(load(&[("LOG_BACKENDS", "gelf"), ("LOG_GELF_CHUNK_SIZE", "12")]).is_err());
    }

    #[test]
    fn test_no_backends() {
        let config = load(&[("LOG_BACKENDS", "none")]).unwrap();
        assert!(config.log_backends.is_empty());
        assert!(config.backend_configs().is_empty());
    }

    #[test]
    fn test_log_server_config() {
        let config = load(&[
            ("SYSLOG_LISTEN_ADDRESS", "tcp://127.0.0.1:1514"),
            ("LOG_BACKENDS", "tsuru,syslog,gelf"),
            ("LOG_BUFFER_SIZE", "42"),
            ("LOG_REQUIRED_ENVS", "TSURU_APPNAME,TSURU_PROCESSNAME"),
        ])
        .unwrap();
        let server = config.log_server_config();
        assert_eq!(
            server.listen_address.as_deref(),
            Some("tcp://127.0.0.1:1514")
        );
        assert!(server.file_monitor.is_none());
        assert_eq!(server.forwarder.queue_size, 42);
        assert_eq!(server.required_envs.len(), 2);
        let kinds: Vec<BackendKind> = server.backends.iter().map(BackendConfig::kind).collect();
        assert_eq!(
            kinds,
            vec![BackendKind::Tsuru, BackendKind::Syslog, BackendKind::Gelf]
        );
        match &server.backends[0] {
            BackendConfig::Tsuru(tsuru) => {
                assert_eq!(tsuru.endpoint, "http://tsuru.local:8080");
                assert_eq!(tsuru.token, "abc");
            }
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn test_log_filter() {
        let filter = |vars: &[(&str, &str)]| {
            let vars: HashMap<&str, &str> = vars.iter().copied().collect();
            log_filter_from(|name| vars.get(name).map(|v| (*v).to_string()))
        };
        assert!(filter(&[]).ends_with(",info"));
        assert!(filter(&[("BS_DEBUG", "1")]).ends_with(",debug"));
        assert!(filter(&[("BS_DEBUG", "garbage")]).ends_with(",info"));
        assert_eq!(
            filter(&[("BS_DEBUG", "1"), ("BS_LOG_FILTER", "bs_log=trace")]),
            "bs_log=trace"
        );
    }

    #[test]
    #[serial]
    fn test_from_env() {
        for (name, value) in REQUIRED {
            env::set_var(name, value);
        }
        env::set_var("STATUS_INTERVAL", "5");
        env::set_var("HOSTCHECK_BASE_CONTAINER_NAME", "bs");
        let config = Config::from_env();
        for (name, _) in REQUIRED {
            env::remove_var(name);
        }
        env::remove_var("STATUS_INTERVAL");
        env::remove_var("HOSTCHECK_BASE_CONTAINER_NAME");

        let config = config.unwrap();
        assert_eq!(config.docker_endpoint, "unix:///var/run/docker.sock");
        assert_eq!(config.status_interval, Duration::from_secs(5));
        assert_eq!(config.hostcheck.base_container_name, "bs");
    }

    #[test]
    #[serial]
    fn test_from_env_missing_token() {
        env::remove_var("TSURU_TOKEN");
        env::set_var("DOCKER_ENDPOINT", "unix:///var/run/docker.sock");
        env::set_var("TSURU_ENDPOINT", "http://tsuru.local");
        let result = Config::from_env();
        env::remove_var("DOCKER_ENDPOINT");
        env::remove_var("TSURU_ENDPOINT");
        assert!(matches!(result, Err(ConfigError::Missing("TSURU_TOKEN"))));
    }
}
