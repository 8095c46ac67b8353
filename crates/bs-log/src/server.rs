// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Syslog ingress and dispatch to the enabled backends.
//!
//! The server listens on `udp://` (one message per datagram) or `tcp://`
//! (newline framed) and may also tail container log files. Every parsed line
//! is resolved to its container and handed to each backend.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bs_container::ContainerClient;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::backends::{Backend, BackendConfig};
use crate::errors::ServerError;
use crate::file_monitor::{FileMonitor, FileMonitorConfig};
use crate::forwarder::ForwarderConfig;
use crate::parser::{parse, RawLogParts};
use crate::ratelimit::RateLimiter;

const UDP_BUFFER_SIZE: usize = 64 * 1024;
pub(crate) const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Receives every parsed log line.
#[async_trait]
pub trait LogHandler: Send + Sync {
    async fn handle(&self, parts: RawLogParts);
}

/// Resolves lines to containers and fans them out to the backends.
pub struct Dispatcher {
    client: Arc<ContainerClient>,
    backends: Vec<Backend>,
    required_envs: Vec<String>,
    lookup_warning: RateLimiter,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        client: Arc<ContainerClient>,
        backends: Vec<Backend>,
        required_envs: Vec<String>,
    ) -> Self {
        Dispatcher {
            client,
            backends,
            required_envs,
            lookup_warning: RateLimiter::default(),
        }
    }

    #[must_use]
    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    /// Stops every backend, draining their queues concurrently.
    pub async fn stop(self) {
        futures_util::future::join_all(self.backends.into_iter().map(Backend::stop)).await;
    }
}

#[async_trait]
impl LogHandler for Dispatcher {
    async fn handle(&self, parts: RawLogParts) {
        let Ok(id) = std::str::from_utf8(&parts.container_id) else {
            if self.lookup_warning.allow() {
                warn!("[log forwarder] ignored message with invalid container id");
            }
            return;
        };
        let required: Vec<&str> = self.required_envs.iter().map(String::as_str).collect();
        match self.client.get_container(id, true, &required).await {
            Ok(container) => {
                for backend in &self.backends {
                    backend.send_message(&parts, &container);
                }
            }
            Err(e) if e.is_not_eligible() => {}
            Err(e) => {
                if self.lookup_warning.allow() {
                    warn!("[log forwarder] ignored message for container {id}: {e}");
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogServerConfig {
    /// `udp://host:port` or `tcp://host:port`. No listener when unset.
    pub listen_address: Option<String>,
    pub file_monitor: Option<FileMonitorConfig>,
    pub backends: Vec<BackendConfig>,
    pub forwarder: ForwarderConfig,
    pub required_envs: Vec<String>,
}

/// The running log pipeline: listeners, file monitor and backends.
pub struct LogForwarder {
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    local_addr: Option<SocketAddr>,
}

impl LogForwarder {
    /// Binds the listener and starts every backend. Nothing is left running
    /// when an error is returned.
    pub async fn start(
        config: LogServerConfig,
        client: Arc<ContainerClient>,
    ) -> Result<Self, ServerError> {
        let listener = match &config.listen_address {
            Some(address) => Some(Listener::bind(address).await?),
            None => None,
        };

        let mut backends = Vec::with_capacity(config.backends.len());
        for backend in &config.backends {
            match Backend::start(backend, config.forwarder.clone()).await {
                Ok(started) => {
                    info!("[log forwarder] backend {} started", started.name());
                    backends.push(started);
                }
                Err(e) => {
                    Dispatcher::new(client, backends, Vec::new()).stop().await;
                    return Err(e);
                }
            }
        }

        let dispatcher = Arc::new(Dispatcher::new(client, backends, config.required_envs));
        let ingest = Arc::new(Ingest {
            handler: Arc::clone(&dispatcher) as Arc<dyn LogHandler>,
            parse_warning: RateLimiter::default(),
        });
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let local_addr = listener.as_ref().and_then(Listener::local_addr);
        if let Some(listener) = listener {
            tracker.spawn(listener.serve(Arc::clone(&ingest), cancel.clone(), tracker.clone()));
        }
        if let Some(monitor) = config.file_monitor {
            let monitor = FileMonitor::new(monitor, Arc::clone(&ingest.handler));
            tracker.spawn(monitor.run(cancel.clone()));
        }
        tracker.close();

        Ok(LogForwarder {
            dispatcher,
            cancel,
            tracker,
            local_addr,
        })
    }

    /// Address the syslog listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Stops ingress first, then drains and stops the backends.
    pub async fn stop(self) {
        self.cancel.cancel();
        self.tracker.wait().await;
        match Arc::try_unwrap(self.dispatcher) {
            Ok(dispatcher) => dispatcher.stop().await,
            Err(_) => error!("[log forwarder] dispatcher still in use, backends not drained"),
        }
    }
}

/// Parses raw lines and passes them on.
struct Ingest {
    handler: Arc<dyn LogHandler>,
    parse_warning: RateLimiter,
}

impl Ingest {
    async fn line(&self, line: Bytes) {
        if line.is_empty() {
            return;
        }
        match parse(line) {
            Ok(parts) => self.handler.handle(parts).await,
            Err(e) => {
                if self.parse_warning.allow() {
                    warn!("[log forwarder] {e}");
                }
            }
        }
    }
}

enum Listener {
    Udp(UdpSocket),
    Tcp(TcpListener),
}

impl Listener {
    async fn bind(address: &str) -> Result<Self, ServerError> {
        let (scheme, host) = address
            .split_once("://")
            .ok_or_else(|| ServerError::InvalidAddress(address.to_string()))?;
        let bind_error = |source| ServerError::Bind {
            address: address.to_string(),
            source,
        };
        match scheme {
            "udp" => UdpSocket::bind(host)
                .await
                .map(Listener::Udp)
                .map_err(bind_error),
            "tcp" => TcpListener::bind(host)
                .await
                .map(Listener::Tcp)
                .map_err(bind_error),
            _ => Err(ServerError::InvalidAddress(address.to_string())),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Udp(socket) => socket.local_addr().ok(),
            Listener::Tcp(listener) => listener.local_addr().ok(),
        }
    }

    async fn serve(self, ingest: Arc<Ingest>, cancel: CancellationToken, tracker: TaskTracker) {
        match self {
            Listener::Udp(socket) => serve_udp(socket, ingest, cancel).await,
            Listener::Tcp(listener) => serve_tcp(listener, ingest, cancel, tracker).await,
        }
    }
}

async fn serve_udp(socket: UdpSocket, ingest: Arc<Ingest>, cancel: CancellationToken) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        let received = tokio::select! {
            () = cancel.cancelled() => return,
            received = socket.recv_from(&mut buf) => received,
        };
        match received {
            Ok((len, _)) => {
                let mut datagram = &buf[..len];
                while let Some(rest) = datagram.strip_suffix(b"\n") {
                    datagram = rest;
                }
                ingest.line(Bytes::copy_from_slice(datagram)).await;
            }
            Err(e) => debug!("[log forwarder] udp receive failed: {e}"),
        }
    }
}

async fn serve_tcp(
    listener: TcpListener,
    ingest: Arc<Ingest>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!("[log forwarder] accepted connection from {peer}");
                tracker.spawn(serve_connection(stream, Arc::clone(&ingest), cancel.clone()));
            }
            Err(e) => warn!("[log forwarder] accept failed: {e}"),
        }
    }
}

async fn serve_connection(stream: TcpStream, ingest: Arc<Ingest>, cancel: CancellationToken) {
    let codec = AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), MAX_LINE_LENGTH);
    let mut lines = FramedRead::new(stream, codec);
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return,
            next = lines.next() => next,
        };
        match next {
            Some(Ok(line)) => ingest.line(line).await,
            Some(Err(e)) => {
                debug!("[log forwarder] closing connection: {e}");
                return;
            }
            None => return,
        }
    }
}
