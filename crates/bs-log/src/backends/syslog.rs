// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Syslog relay backend.
//!
//! Every message is formatted once as
//! `<pri>Mon DD HH:MM:SS shortid app[process]: content\n` and the resulting
//! buffer is shared by the forwarders of all configured destinations.

use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bs_container::Container;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Local, Utc};
use chrono_tz::Tz;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::buffered_conn::{BufferedConn, DEFAULT_BUFFER_SIZE};
use crate::errors::ForwarderError;
use crate::forwarder::{Adapter, Forwarder, ForwarderConfig};
use crate::parser::RawLogParts;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const FLUSH_LATENCY: Duration = Duration::from_secs(1);
const ARENA_CHUNK: usize = 64 * 1024;
const SHORT_ID_LEN: usize = 12;
const TIMESTAMP_FORMAT: &str = "%b %e %H:%M:%S";

/// Zone used to render relayed timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyslogTimezone {
    #[default]
    Local,
    Named(Tz),
}

impl FromStr for SyslogTimezone {
    type Err = String;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim() {
            "" | "Local" => Ok(SyslogTimezone::Local),
            name => name
                .parse::<Tz>()
                .map(SyslogTimezone::Named)
                .map_err(|e| format!("unknown timezone {name:?}: {e}")),
        }
    }
}

impl SyslogTimezone {
    #[must_use]
    pub fn format(&self, time: DateTime<Utc>) -> String {
        match self {
            SyslogTimezone::Local => time.with_timezone(&Local).format(TIMESTAMP_FORMAT),
            SyslogTimezone::Named(tz) => time.with_timezone(tz).format(TIMESTAMP_FORMAT),
        }
        .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyslogAddress {
    Tcp(String),
    Udp(String),
}

impl FromStr for SyslogAddress {
    type Err = ForwarderError;

    fn from_str(address: &str) -> Result<Self, Self::Err> {
        let address = address.trim();
        let invalid = || ForwarderError::InvalidAddress(address.to_string());
        let (scheme, host) = address.split_once("://").ok_or_else(invalid)?;
        if host.is_empty() || !host.contains(':') {
            return Err(invalid());
        }
        match scheme {
            "tcp" => Ok(SyslogAddress::Tcp(host.to_string())),
            "udp" => Ok(SyslogAddress::Udp(host.to_string())),
            _ => Err(invalid()),
        }
    }
}

impl std::fmt::Display for SyslogAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyslogAddress::Tcp(host) => write!(f, "tcp://{host}"),
            SyslogAddress::Udp(host) => write!(f, "udp://{host}"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyslogConfig {
    pub addresses: Vec<String>,
    pub timezone: SyslogTimezone,
    pub extra_start: String,
    pub extra_end: String,
}

/// Line format shared by every destination.
#[derive(Debug, Clone, Default)]
pub struct LineFormat {
    pub timezone: SyslogTimezone,
    pub extra_start: String,
    pub extra_end: String,
}

impl LineFormat {
    /// Appends the relay line for `parts` to `buf`.
    pub fn write_line(&self, buf: &mut BytesMut, parts: &RawLogParts, container: &Container) {
        let time = parts.time().unwrap_or_else(Utc::now);
        let short_id = container.id.get(..SHORT_ID_LEN).unwrap_or(&container.id);
        buf.reserve(64 + parts.content.len() + self.extra_start.len() + self.extra_end.len());
        buf.put_u8(b'<');
        buf.put_slice(&parts.priority);
        buf.put_u8(b'>');
        // Writing into a BytesMut cannot fail.
        let _ = write!(
            buf,
            "{} {} {}[{}]: ",
            self.timezone.format(time),
            short_id,
            container.app_name,
            container.process_name
        );
        if !self.extra_start.is_empty() {
            buf.put_slice(self.extra_start.as_bytes());
            buf.put_u8(b' ');
        }
        buf.put_slice(&parts.content);
        if !self.extra_end.is_empty() {
            buf.put_u8(b' ');
            buf.put_slice(self.extra_end.as_bytes());
        }
        buf.put_u8(b'\n');
    }
}

pub struct SyslogBackend {
    format: LineFormat,
    arena: Mutex<BytesMut>,
    forwarders: Vec<Forwarder<Bytes>>,
}

impl SyslogBackend {
    /// Starts one forwarder per destination address.
    pub async fn start(
        config: SyslogConfig,
        forwarder: ForwarderConfig,
    ) -> Result<Self, ForwarderError> {
        let addresses = config
            .addresses
            .iter()
            .filter(|a| !a.trim().is_empty())
            .map(|a| a.parse::<SyslogAddress>())
            .collect::<Result<Vec<_>, _>>()?;
        let mut forwarders = Vec::with_capacity(addresses.len());
        for address in addresses {
            let adapter = SyslogAdapter {
                name: format!("syslog {address}"),
                address,
            };
            forwarders.push(Forwarder::start(adapter, forwarder.clone()).await?);
        }
        Ok(SyslogBackend {
            format: LineFormat {
                timezone: config.timezone,
                extra_start: config.extra_start,
                extra_end: config.extra_end,
            },
            arena: Mutex::new(BytesMut::with_capacity(ARENA_CHUNK)),
            forwarders,
        })
    }

    pub fn send_message(&self, parts: &RawLogParts, container: &Container) {
        if self.forwarders.is_empty() {
            return;
        }
        let line = match self.arena.lock() {
            Ok(mut arena) => {
                if arena.capacity() < parts.content.len() + 256 {
                    arena.reserve(ARENA_CHUNK);
                }
                self.format.write_line(&mut arena, parts, container);
                arena.split().freeze()
            }
            Err(_) => {
                let mut buf = BytesMut::new();
                self.format.write_line(&mut buf, parts, container);
                buf.freeze()
            }
        };
        for forwarder in &self.forwarders {
            forwarder.send(line.clone());
        }
    }

    #[must_use]
    pub fn forwarders(&self) -> &[Forwarder<Bytes>] {
        &self.forwarders
    }

    pub async fn stop(self) {
        futures_util::future::join_all(self.forwarders.into_iter().map(Forwarder::stop)).await;
    }
}

pub enum SyslogConn {
    Tcp(BufferedConn<TcpStream>),
    Udp(UdpSocket),
}

struct SyslogAdapter {
    name: String,
    address: SyslogAddress,
}

impl SyslogAdapter {
    fn connect_error(&self, message: String) -> ForwarderError {
        ForwarderError::Connect {
            address: self.address.to_string(),
            message,
        }
    }
}

#[async_trait]
impl Adapter for SyslogAdapter {
    type Conn = SyslogConn;
    type Message = Bytes;

    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<SyslogConn, ForwarderError> {
        match &self.address {
            SyslogAddress::Tcp(host) => {
                let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(host.as_str()))
                    .await
                    .map_err(|_| ForwarderError::Timeout(DIAL_TIMEOUT))?
                    .map_err(|e| self.connect_error(e.to_string()))?;
                Ok(SyslogConn::Tcp(BufferedConn::new(
                    stream,
                    DEFAULT_BUFFER_SIZE,
                    FLUSH_LATENCY,
                )))
            }
            SyslogAddress::Udp(host) => {
                let socket = timeout(DIAL_TIMEOUT, connect_udp(host))
                    .await
                    .map_err(|_| ForwarderError::Timeout(DIAL_TIMEOUT))?
                    .map_err(|e| self.connect_error(e.to_string()))?;
                Ok(SyslogConn::Udp(socket))
            }
        }
    }

    async fn process(&self, conn: &mut SyslogConn, line: Bytes) -> Result<(), ForwarderError> {
        let written = match conn {
            SyslogConn::Tcp(conn) => {
                conn.set_write_deadline(Some(Instant::now() + WRITE_TIMEOUT))
                    .await;
                conn.write(&line).await?
            }
            SyslogConn::Udp(socket) => timeout(WRITE_TIMEOUT, socket.send(&line))
                .await
                .map_err(|_| ForwarderError::Timeout(WRITE_TIMEOUT))??,
        };
        if written < line.len() {
            return Err(ForwarderError::ShortWrite {
                written,
                expected: line.len(),
            });
        }
        Ok(())
    }

    async fn close(&self, conn: SyslogConn) {
        if let SyslogConn::Tcp(mut conn) = conn {
            conn.set_write_deadline(None).await;
            if let Err(e) = conn.close().await {
                debug!("[log forwarder {}] error closing connection: {e}", self.name);
            }
        }
    }
}

pub(crate) async fn connect_udp(host: &str) -> std::io::Result<UdpSocket> {
    let target = tokio::net::lookup_host(host)
        .await?
        .next()
        .ok_or_else(|| std::io::Error::other(format!("no address found for {host}")))?;
    let local = if target.is_ipv4() {
        "0.0.0.0:0"
    } else {
        "[::]:0"
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(target).await?;
    Ok(socket)
}
