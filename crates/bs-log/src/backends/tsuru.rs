// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Control plane websocket backend.
//!
//! Application logs are streamed as JSON records over a websocket opened on
//! `{endpoint}/logs`. Two tasks watch every connection: one sends pings and
//! kills the connection when pongs stop coming back, the other reads the
//! incoming frames to record pongs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bs_container::Container;
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::ForwarderError;
use crate::forwarder::{Adapter, Forwarder, ForwarderConfig};
use crate::parser::RawLogParts;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

#[derive(Debug, Clone)]
pub struct TsuruConfig {
    /// Control plane endpoint, `http(s)://host[:port][/prefix]`.
    pub endpoint: String,
    pub token: String,
    pub ping_interval: Duration,
    /// Maximum time without a pong before the connection is dropped.
    pub pong_interval: Option<Duration>,
}

impl TsuruConfig {
    /// Effective pong interval: four ping intervals unless a larger value
    /// was configured.
    #[must_use]
    pub fn pong_interval(&self) -> Duration {
        match self.pong_interval {
            Some(pong) if pong >= self.ping_interval => pong,
            _ => self.ping_interval * 4,
        }
    }
}

/// Log record sent to the control plane.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct LogEntry {
    pub date: DateTime<Utc>,
    pub app_name: String,
    pub message: String,
    pub source: String,
    pub unit: String,
}

/// Builds the control plane record, or `None` for containers that do not
/// belong to an application.
#[must_use]
pub fn log_entry(parts: &RawLogParts, container: &Container) -> Option<LogEntry> {
    if !container.is_app() {
        return None;
    }
    Some(LogEntry {
        date: parts.time().unwrap_or_else(Utc::now),
        app_name: container.app_name.clone(),
        message: parts.content_str().into_owned(),
        source: container.process_name.clone(),
        unit: container.id.clone(),
    })
}

/// Maps the control plane endpoint to its log websocket URL.
pub fn websocket_url(endpoint: &str) -> Result<String, ForwarderError> {
    let endpoint = endpoint.trim().trim_end_matches('/');
    let (scheme, rest) = endpoint
        .split_once("://")
        .ok_or_else(|| ForwarderError::InvalidAddress(endpoint.to_string()))?;
    let scheme = match scheme {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(ForwarderError::InvalidAddress(endpoint.to_string())),
    };
    if rest.is_empty() {
        return Err(ForwarderError::InvalidAddress(endpoint.to_string()));
    }
    Ok(format!("{scheme}://{rest}/logs"))
}

pub struct TsuruBackend {
    forwarder: Forwarder<LogEntry>,
}

impl TsuruBackend {
    pub async fn start(
        config: TsuruConfig,
        forwarder: ForwarderConfig,
    ) -> Result<Self, ForwarderError> {
        let adapter = TsuruAdapter {
            url: websocket_url(&config.endpoint)?,
            token: config.token.clone(),
            ping_interval: config.ping_interval,
            pong_interval: config.pong_interval(),
        };
        Ok(TsuruBackend {
            forwarder: Forwarder::start(adapter, forwarder).await?,
        })
    }

    pub fn send_message(&self, parts: &RawLogParts, container: &Container) {
        if let Some(entry) = log_entry(parts, container) {
            self.forwarder.send(entry);
        }
    }

    #[must_use]
    pub fn forwarder(&self) -> &Forwarder<LogEntry> {
        &self.forwarder
    }

    pub async fn stop(self) {
        self.forwarder.stop().await;
    }
}

/// Monotonic time of the last pong seen on a connection.
struct PongClock {
    origin: Instant,
    last_ms: AtomicU64,
}

impl PongClock {
    fn new() -> Self {
        PongClock {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_ms.store(now, Ordering::Release);
    }

    fn since_last(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Acquire));
        self.origin.elapsed().saturating_sub(last)
    }
}

pub struct WsConn {
    sink: Arc<Mutex<WsSink>>,
    dead: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct TsuruAdapter {
    url: String,
    token: String,
    ping_interval: Duration,
    pong_interval: Duration,
}

impl TsuruAdapter {
    fn request(&self) -> Result<Request, ForwarderError> {
        let mut request = self.url.as_str().into_client_request()?;
        let auth = HeaderValue::from_str(&format!("bearer {}", self.token))
            .map_err(|e| ForwarderError::InvalidAddress(format!("invalid token: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, auth);
        Ok(request)
    }
}

#[async_trait]
impl Adapter for TsuruAdapter {
    type Conn = WsConn;
    type Message = LogEntry;

    fn name(&self) -> &str {
        "tsuru"
    }

    async fn initialize(&self, _shutdown: CancellationToken) -> Result<(), ForwarderError> {
        self.request().map(|_| ())
    }

    async fn connect(&self) -> Result<WsConn, ForwarderError> {
        let request = self.request()?;
        let uri = request.uri();
        let host = uri
            .host()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .ok_or_else(|| ForwarderError::InvalidAddress(self.url.clone()))?;
        let default_port = if uri.scheme_str() == Some("wss") { 443 } else { 80 };
        let port = uri.port_u16().unwrap_or(default_port);

        let connect_error = |message: String| ForwarderError::Connect {
            address: self.url.clone(),
            message,
        };
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| ForwarderError::Timeout(DIAL_TIMEOUT))?
            .map_err(|e| connect_error(e.to_string()))?;
        SockRef::from(&stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(TCP_KEEPALIVE))?;

        let (ws, _) = timeout(
            DIAL_TIMEOUT,
            client_async_tls_with_config(request, stream, None, None),
        )
        .await
        .map_err(|_| ForwarderError::Timeout(DIAL_TIMEOUT))?
        .map_err(|e| connect_error(e.to_string()))?;
        debug!("connected to {}", self.url);

        let (sink, stream) = ws.split();
        let sink = Arc::new(Mutex::new(sink));
        let dead = CancellationToken::new();
        let clock = Arc::new(PongClock::new());
        let tasks = vec![
            tokio::spawn(monitor_pongs(stream, Arc::clone(&clock), dead.clone())),
            tokio::spawn(send_pings(
                Arc::clone(&sink),
                clock,
                dead.clone(),
                self.ping_interval,
                self.pong_interval,
            )),
        ];
        Ok(WsConn { sink, dead, tasks })
    }

    async fn process(&self, conn: &mut WsConn, entry: LogEntry) -> Result<(), ForwarderError> {
        if conn.dead.is_cancelled() {
            return Err(ForwarderError::Closed);
        }
        let payload = serde_json::to_string(&entry)?;
        let mut sink = conn.sink.lock().await;
        timeout(WRITE_TIMEOUT, sink.send(Message::Text(payload)))
            .await
            .map_err(|_| ForwarderError::Timeout(WRITE_TIMEOUT))??;
        Ok(())
    }

    async fn close(&self, conn: WsConn) {
        conn.dead.cancel();
        if let Err(e) = conn.sink.lock().await.close().await {
            debug!("error closing websocket: {e}");
        }
        for task in conn.tasks {
            task.abort();
        }
    }
}

async fn monitor_pongs(
    mut stream: SplitStream<WsStream>,
    clock: Arc<PongClock>,
    dead: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = dead.cancelled() => return,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Pong(_))) => clock.touch(),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("websocket read failed: {e}");
                break;
            }
        }
    }
    dead.cancel();
}

async fn send_pings(
    sink: Arc<Mutex<WsSink>>,
    clock: Arc<PongClock>,
    dead: CancellationToken,
    ping_interval: Duration,
    pong_interval: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    loop {
        tokio::select! {
            () = dead.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let sent = timeout(WRITE_TIMEOUT, async {
            sink.lock().await.send(Message::Ping(vec![b'.'])).await
        })
        .await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("failed to send websocket ping: {e}");
                break;
            }
            Err(_) => {
                debug!("timed out sending websocket ping");
                break;
            }
        }
        let silence = clock.since_last();
        if silence > pong_interval {
            warn!("no pong from the control plane in {silence:?}, closing log connection");
            break;
        }
    }
    dead.cancel();
    let _ = timeout(WRITE_TIMEOUT, async { sink.lock().await.close().await }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bs_container::testing::inspect_with_env;
    use bytes::Bytes;

    #[test]
    fn test_websocket_url() {
        assert_eq!(
            websocket_url("http://tsuru.local:8080").unwrap(),
            "ws://tsuru.local:8080/logs"
        );
        assert_eq!(
            websocket_url("https://tsuru.example.com/api/").unwrap(),
            "wss://tsuru.example.com/api/logs"
        );
        assert!(websocket_url("tsuru.local").is_err());
        assert!(websocket_url("ftp://tsuru.local").is_err());
        assert!(websocket_url("http://").is_err());
    }

    #[test]
    fn test_pong_interval_defaults() {
        let mut config = TsuruConfig {
            endpoint: String::new(),
            token: String::new(),
            ping_interval: Duration::from_secs(30),
            pong_interval: None,
        };
        assert_eq!(config.pong_interval(), Duration::from_secs(120));
        config.pong_interval = Some(Duration::from_secs(10));
        assert_eq!(config.pong_interval(), Duration::from_secs(120));
        config.pong_interval = Some(Duration::from_secs(45));
        assert_eq!(config.pong_interval(), Duration::from_secs(45));
    }

    #[test]
    fn test_log_entry_only_for_app_containers() {
        let parts = crate::parser::parse(Bytes::from_static(
            b"<30>2015-06-05T16:13:47Z vagrant docker/abc123[1]: hello there",
        ))
        .unwrap();

        let app = Container::from_inspect(inspect_with_env(
            "abc123",
            "web",
            &["TSURU_APPNAME=myapp", "TSURU_PROCESSNAME=web"],
        ));
        let entry = log_entry(&parts, &app).unwrap();
        assert_eq!(entry.app_name, "myapp");
        assert_eq!(entry.source, "web");
        assert_eq!(entry.unit, "abc123");
        assert_eq!(entry.message, "hello there");
        assert_eq!(entry.date.to_rfc3339(), "2015-06-05T16:13:47+00:00");

        let json = serde_json::to_value(&entry).unwrap();
        for key in ["Date", "AppName", "Message", "Source", "Unit"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }

        let plain = Container::from_inspect(inspect_with_env("abc123", "plain", &[]));
        assert!(log_entry(&parts, &plain).is_none());
    }
}
