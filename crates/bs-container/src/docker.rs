// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Docker Engine API client.
//!
//! Each request opens a fresh HTTP/1 connection to the engine, either over the
//! local unix socket (`unix:///var/run/docker.sock`) or over TCP
//! (`tcp://host:port`, `http://host:port`). Every call is bounded by the
//! client timeout.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use http_body_util::{BodyExt, Full};
use hyper::{header, Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::{debug, trace};

use crate::error::Error;
use crate::runtime::ContainerRuntime;
use crate::types::{
    ContainerInspect, ContainerSummary, CreateContainerOptions, CreateContainerResponse,
    RuntimeInfo, WaitContainerResponse,
};

/// Full timeout applied to every runtime call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

const STDOUT_STREAM: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl Endpoint {
    fn parse(endpoint: &str) -> Result<Self, Error> {
        let endpoint = endpoint.trim();
        if let Some(path) = endpoint.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(Error::InvalidEndpoint(endpoint.to_string()));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        let authority = endpoint
            .strip_prefix("tcp://")
            .or_else(|| endpoint.strip_prefix("http://"))
            .ok_or_else(|| Error::InvalidEndpoint(endpoint.to_string()))?
            .trim_end_matches('/');
        if authority.is_empty() || authority.contains('/') {
            return Err(Error::InvalidEndpoint(endpoint.to_string()));
        }
        Ok(Endpoint::Tcp(authority.to_string()))
    }

    fn host_header(&self) -> &str {
        match self {
            Endpoint::Unix(_) => "docker",
            Endpoint::Tcp(authority) => authority,
        }
    }
}

/// Client for the Docker Engine HTTP API.
#[derive(Debug, Clone)]
pub struct DockerClient {
    endpoint: Endpoint,
    timeout: Duration,
}

impl DockerClient {
    pub fn new(endpoint: &str) -> Result<Self, Error> {
        Self::with_timeout(endpoint, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(endpoint: &str, timeout: Duration) -> Result<Self, Error> {
        Ok(DockerClient {
            endpoint: Endpoint::parse(endpoint)?,
            timeout,
        })
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Bytes), Error> {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, self.endpoint.host_header());
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        let req = builder.body(Full::new(Bytes::from(body.unwrap_or_default())))?;
        trace!("container runtime request {} {}", req.method(), path);

        let fut = async {
            match &self.endpoint {
                #[cfg(unix)]
                Endpoint::Unix(socket_path) => {
                    let stream = UnixStream::connect(socket_path).await?;
                    send_request(stream, req).await
                }
                #[cfg(not(unix))]
                Endpoint::Unix(_) => Err(Error::InvalidEndpoint(
                    "unix sockets are not supported on this platform".to_string(),
                )),
                Endpoint::Tcp(authority) => {
                    let stream = TcpStream::connect(authority.as_str()).await?;
                    send_request(stream, req).await
                }
            }
        };
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
    }

    async fn expect_success(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        id: &str,
    ) -> Result<Bytes, Error> {
        let (status, body) = self.request(method, path, body).await?;
        check_status(status, body, id)
    }
}

async fn send_request<S>(stream: S, req: Request<Full<Bytes>>) -> Result<(StatusCode, Bytes), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("container runtime connection closed with error: {e}");
        }
    });
    let resp = sender.send_request(req).await?;
    let status = resp.status();
    let body = resp.into_body().collect().await?.to_bytes();
    Ok((status, body))
}

/// Builds `/containers/{id}{suffix}`. Ids and names outside `[A-Za-z0-9_.-]`
/// never reach the engine and are reported as missing containers.
fn container_path(id: &str, suffix: &str) -> Result<String, Error> {
    if !is_valid_id(id) {
        return Err(Error::NotFound(id.to_string()));
    }
    Ok(format!("/containers/{id}{suffix}"))
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

fn check_status(status: StatusCode, body: Bytes, id: &str) -> Result<Bytes, Error> {
    if status.is_success() {
        return Ok(body);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(Error::NotFound(id.to_string()));
    }
    Err(Error::Status {
        status: status.as_u16(),
        message: String::from_utf8_lossy(&body).trim().to_string(),
    })
}

/// Extracts the stdout frames of a multiplexed log stream.
///
/// Each frame is an 8 byte header (stream type, three padding bytes, big
/// endian payload length) followed by the payload. Data that does not carry a
/// valid header (containers started with a TTY) is returned untouched.
pub(crate) fn demux_stdout(mut raw: Bytes) -> Vec<u8> {
    let original = raw.clone();
    let mut stdout = Vec::with_capacity(raw.len());
    while raw.has_remaining() {
        if raw.remaining() < 8 || !matches!(raw[0], 0..=2) || raw[1..4] != [0, 0, 0] {
            return original.to_vec();
        }
        let stream = raw.get_u8();
        raw.advance(3);
        let size = raw.get_u32() as usize;
        if raw.remaining() < size {
            return original.to_vec();
        }
        let payload = raw.split_to(size);
        if stream == STDOUT_STREAM {
            stdout.extend_from_slice(&payload);
        }
    }
    stdout
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect, Error> {
        let body = self
            .expect_success(Method::GET, &container_path(id, "/json")?, None, id)
            .await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, Error> {
        let path = if all {
            "/containers/json?all=1"
        } else {
            "/containers/json"
        };
        let body = self.expect_success(Method::GET, path, None, "").await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), Error> {
        let path = container_path(id, &format!("?force={}", u8::from(force)))?;
        self.expect_success(Method::DELETE, &path, None, id).await?;
        Ok(())
    }

    async fn create_container(
        &self,
        name: Option<&str>,
        options: &CreateContainerOptions,
    ) -> Result<String, Error> {
        let path = match name {
            Some(name) => {
                let name = name.trim_start_matches('/');
                if !is_valid_id(name) {
                    return Err(Error::InvalidName(name.to_string()));
                }
                format!("/containers/create?name={name}")
            }
            None => "/containers/create".to_string(),
        };
        let payload = serde_json::to_vec(options)?;
        let body = self
            .expect_success(Method::POST, &path, Some(payload), &options.image)
            .await?;
        let created: CreateContainerResponse = serde_json::from_slice(&body)?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), Error> {
        let path = container_path(id, "/start")?;
        let (status, body) = self.request(Method::POST, &path, None).await?;
        // 304: already started
        if status == StatusCode::NOT_MODIFIED {
            return Ok(());
        }
        check_status(status, body, id)?;
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, Error> {
        let body = self
            .expect_success(Method::POST, &container_path(id, "/wait")?, None, id)
            .await?;
        let waited: WaitContainerResponse = serde_json::from_slice(&body)?;
        Ok(waited.status_code)
    }

    async fn container_output(&self, id: &str) -> Result<Vec<u8>, Error> {
        let path = container_path(id, "/logs?stdout=1&stderr=0")?;
        let body = self.expect_success(Method::GET, &path, None, id).await?;
        Ok(demux_stdout(body))
    }

    async fn info(&self) -> Result<RuntimeInfo, Error> {
        let body = self.expect_success(Method::GET, "/info", None, "").await?;
        Ok(serde_json::from_slice(&body)?)
    }
}
