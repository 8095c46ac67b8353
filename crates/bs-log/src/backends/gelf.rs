// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! GELF datagram backend.
//!
//! Records are JSON documents sent over UDP, optionally compressed, and split
//! into GELF chunks when they do not fit one datagram. Datagrams are batched
//! and written out when the batch fills up or every flush interval.

use std::io::Write;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bs_container::Container;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde_json::{Map, Value};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::warn;

use crate::backends::syslog::connect_udp;
use crate::errors::ForwarderError;
use crate::forwarder::{Adapter, Forwarder, ForwarderConfig};
use crate::parser::RawLogParts;
use crate::ratelimit::RateLimiter;

pub const DEFAULT_HOST: &str = "localhost:12201";
pub const DEFAULT_CHUNK_SIZE: usize = 1420;
pub const DEFAULT_FIELDS_WHITELIST: [&str; 6] = [
    "request_id",
    "request_time",
    "request_uri",
    "status",
    "method",
    "uri",
];
pub const MAX_CHUNKS: usize = 128;
const CHUNK_MAGIC: [u8; 2] = [0x1e, 0x0f];
const CHUNK_HEADER_LEN: usize = 12;
const BATCH_SIZE: usize = 1024;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GelfCompression {
    #[default]
    None,
    Gzip,
    Zlib,
}

impl FromStr for GelfCompression {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(GelfCompression::None),
            "gzip" => Ok(GelfCompression::Gzip),
            "zlib" => Ok(GelfCompression::Zlib),
            other => Err(format!("unknown GELF compression {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GelfConfig {
    pub host: String,
    pub chunk_size: usize,
    pub fields_whitelist: Vec<String>,
    pub compression: GelfCompression,
}

impl Default for GelfConfig {
    fn default() -> Self {
        GelfConfig {
            host: DEFAULT_HOST.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            fields_whitelist: DEFAULT_FIELDS_WHITELIST
                .iter()
                .map(|f| (*f).to_string())
                .collect(),
            compression: GelfCompression::None,
        }
    }
}

/// Maps a level name found in a log line to its syslog severity.
#[must_use]
pub fn level_from_name(name: &str) -> Option<u8> {
    let level = match name.to_ascii_uppercase().as_str() {
        "EMERG" | "EMERGENCY" | "PANIC" => 0,
        "ALERT" => 1,
        "CRIT" | "CRITICAL" | "FATAL" => 2,
        "ERR" | "ERROR" => 3,
        "WARN" | "WARNING" => 4,
        "NOTICE" => 5,
        "INFO" | "INFORMATIONAL" => 6,
        "DEBUG" | "TRACE" => 7,
        _ => return None,
    };
    Some(level)
}

/// Extracts `key=value` pairs from a log line. Values may be double quoted.
#[must_use]
pub fn key_values(content: &str) -> Vec<(&str, &str)> {
    let bytes = content.as_bytes();
    let mut pairs = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        let key_start = pos;
        while pos < bytes.len() && !bytes[pos].is_ascii_whitespace() && bytes[pos] != b'=' {
            pos += 1;
        }
        if pos >= bytes.len() || bytes[pos] != b'=' || pos == key_start {
            // Not a pair: skip the rest of the token.
            while pos < bytes.len() && !bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            continue;
        }
        let key = &content[key_start..pos];
        pos += 1;
        let value = if bytes.get(pos) == Some(&b'"') {
            let start = pos + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end] != b'"' {
                if bytes[end] == b'\\' {
                    end += 1;
                }
                end += 1;
            }
            let end = end.min(bytes.len());
            pos = (end + 1).min(bytes.len());
            &content[start..end]
        } else {
            let start = pos;
            while pos < bytes.len() && !bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            &content[start..pos]
        };
        pairs.push((key, value));
    }
    pairs
}

/// Builds the GELF document for one log line.
#[must_use]
pub fn gelf_record(
    parts: &RawLogParts,
    container: &Container,
    whitelist: &[String],
) -> Map<String, Value> {
    let content = parts.content_str();
    let mut level = parts.severity();
    let mut record = Map::new();
    for (key, value) in key_values(&content) {
        if key.eq_ignore_ascii_case("level") {
            if let Some(named) = level_from_name(value) {
                level = named;
            }
        }
        // `_id` is reserved by the GELF format.
        if key != "id" && whitelist.iter().any(|w| w == key) {
            record.insert(format!("_{key}"), Value::from(value));
        }
    }
    let time = parts.time().unwrap_or_else(Utc::now);
    record.insert("version".to_string(), Value::from("1.1"));
    record.insert(
        "host".to_string(),
        Value::from(container.short_hostname.as_str()),
    );
    record.insert("short_message".to_string(), Value::from(content.as_ref()));
    record.insert(
        "timestamp".to_string(),
        Value::from(time.timestamp_millis() as f64 / 1000.0),
    );
    record.insert("level".to_string(), Value::from(level));
    record.insert("_app".to_string(), Value::from(container.app_name.as_str()));
    record.insert(
        "_pid".to_string(),
        Value::from(container.process_name.as_str()),
    );
    record
}

pub fn compress(payload: &[u8], compression: GelfCompression) -> std::io::Result<Vec<u8>> {
    match compression {
        GelfCompression::None => Ok(payload.to_vec()),
        GelfCompression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(payload)?;
            encoder.finish()
        }
        GelfCompression::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(payload)?;
            encoder.finish()
        }
    }
}

/// Splits `payload` into GELF datagrams of at most `chunk_size` bytes.
pub fn chunk(payload: &[u8], chunk_size: usize, id: [u8; 8]) -> Result<Vec<Bytes>, ForwarderError> {
    if payload.len() <= chunk_size {
        return Ok(vec![Bytes::copy_from_slice(payload)]);
    }
    let data_len = chunk_size.saturating_sub(CHUNK_HEADER_LEN).max(1);
    let count = payload.len().div_ceil(data_len);
    if count > MAX_CHUNKS {
        return Err(ForwarderError::Encode(format!(
            "message needs {count} chunks, more than the {MAX_CHUNKS} allowed"
        )));
    }
    let count_byte = u8::try_from(count).unwrap_or(u8::MAX);
    Ok(payload
        .chunks(data_len)
        .enumerate()
        .map(|(seq, data)| {
            let mut datagram = BytesMut::with_capacity(CHUNK_HEADER_LEN + data.len());
            datagram.put_slice(&CHUNK_MAGIC);
            datagram.put_slice(&id);
            datagram.put_u8(u8::try_from(seq).unwrap_or(u8::MAX));
            datagram.put_u8(count_byte);
            datagram.put_slice(data);
            datagram.freeze()
        })
        .collect())
}

pub struct GelfBackend {
    whitelist: Vec<String>,
    forwarder: Forwarder<Bytes>,
    encode_warning: RateLimiter,
}

impl GelfBackend {
    pub async fn start(
        config: GelfConfig,
        forwarder: ForwarderConfig,
    ) -> Result<Self, ForwarderError> {
        if config.host.trim().is_empty() || !config.host.contains(':') {
            return Err(ForwarderError::InvalidAddress(config.host));
        }
        let adapter = GelfAdapter {
            host: config.host,
            chunk_size: config.chunk_size.max(CHUNK_HEADER_LEN + 1),
            compression: config.compression,
            chunk_warning: RateLimiter::default(),
        };
        Ok(GelfBackend {
            whitelist: config.fields_whitelist,
            forwarder: Forwarder::start(adapter, forwarder).await?,
            encode_warning: RateLimiter::default(),
        })
    }

    pub fn send_message(&self, parts: &RawLogParts, container: &Container) {
        let record = gelf_record(parts, container, &self.whitelist);
        match serde_json::to_vec(&record) {
            Ok(payload) => {
                self.forwarder.send(Bytes::from(payload));
            }
            Err(e) => {
                if self.encode_warning.allow() {
                    warn!("[log forwarder gelf] unable to encode record: {e}");
                }
            }
        }
    }

    #[must_use]
    pub fn forwarder(&self) -> &Forwarder<Bytes> {
        &self.forwarder
    }

    pub async fn stop(self) {
        self.forwarder.stop().await;
    }
}

pub struct GelfConn {
    socket: UdpSocket,
    batch: Vec<Bytes>,
}

struct GelfAdapter {
    host: String,
    chunk_size: usize,
    compression: GelfCompression,
    chunk_warning: RateLimiter,
}

#[async_trait]
impl Adapter for GelfAdapter {
    type Conn = GelfConn;
    type Message = Bytes;

    fn name(&self) -> &str {
        "gelf"
    }

    async fn connect(&self) -> Result<GelfConn, ForwarderError> {
        let socket = timeout(DIAL_TIMEOUT, connect_udp(&self.host))
            .await
            .map_err(|_| ForwarderError::Timeout(DIAL_TIMEOUT))?
            .map_err(|e| ForwarderError::Connect {
                address: self.host.clone(),
                message: e.to_string(),
            })?;
        Ok(GelfConn {
            socket,
            batch: Vec::with_capacity(BATCH_SIZE),
        })
    }

    async fn process(&self, conn: &mut GelfConn, record: Bytes) -> Result<(), ForwarderError> {
        let payload = compress(&record, self.compression)?;
        match chunk(&payload, self.chunk_size, fastrand::u64(..).to_be_bytes()) {
            Ok(datagrams) => conn.batch.extend(datagrams),
            Err(e) => {
                // Oversized records are dropped, the connection is fine.
                if self.chunk_warning.allow() {
                    warn!("[log forwarder gelf] dropping record: {e}");
                }
                return Ok(());
            }
        }
        if conn.batch.len() >= BATCH_SIZE {
            self.flush(conn).await?;
        }
        Ok(())
    }

    async fn close(&self, mut conn: GelfConn) {
        if let Err(e) = self.flush(&mut conn).await {
            warn!("[log forwarder gelf] failed to flush pending records: {e}");
        }
    }

    fn flush_interval(&self) -> Option<Duration> {
        Some(FLUSH_INTERVAL)
    }

    async fn flush(&self, conn: &mut GelfConn) -> Result<(), ForwarderError> {
        for datagram in conn.batch.drain(..) {
            let written = timeout(WRITE_TIMEOUT, conn.socket.send(&datagram))
                .await
                .map_err(|_| ForwarderError::Timeout(WRITE_TIMEOUT))??;
            if written < datagram.len() {
                return Err(ForwarderError::ShortWrite {
                    written,
                    expected: datagram.len(),
                });
            }
        }
        Ok(())
    }
}
