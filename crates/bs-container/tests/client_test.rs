// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bs_container::client::{ContainerClient, APP_NAME_ENV};
use bs_container::docker::DockerClient;
use bs_container::testing::{inspect_with_env, FakeRuntime};
use bs_container::types::CreateContainerOptions;
use bs_container::{ContainerRuntime, Error};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[tokio::test]
async fn test_get_container_extracts_tsuru_metadata_and_caches() {
    let runtime = Arc::new(FakeRuntime::new(vec![inspect_with_env(
        "abc123",
        "web-1",
        &["TSURU_PROCESSNAME=procx", "TSURU_APPNAME=coolappname"],
    )]));
    let client = ContainerClient::new(runtime.clone());

    let first = client
        .get_container("abc123", true, &[])
        .await
        .expect("lookup failed");
    assert_eq!(first.app_name, "coolappname");
    assert_eq!(first.process_name, "procx");
    assert_eq!(runtime.inspect_calls(), 1);

    let second = client
        .get_container("abc123", true, &[])
        .await
        .expect("lookup failed");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(runtime.inspect_calls(), 1);

    let third = client
        .get_container("abc123", false, &[])
        .await
        .expect("lookup failed");
    assert_eq!(third.app_name, "coolappname");
    assert_eq!(runtime.inspect_calls(), 2);
}

#[tokio::test]
async fn test_get_container_without_tsuru_envs() {
    let runtime = Arc::new(FakeRuntime::new(vec![inspect_with_env(
        "def456",
        "plain",
        &["PATH=/usr/bin"],
    )]));
    let client = ContainerClient::new(runtime.clone());

    let container = client
        .get_container("def456", true, &[])
        .await
        .expect("lookup failed");
    assert_eq!(container.app_name, "plain");
    assert_eq!(container.process_name, "def456");

    let err = client
        .get_app_container("def456", false)
        .await
        .expect_err("container should not be eligible");
    assert!(err.is_not_eligible());
}

#[tokio::test]
async fn test_not_eligible_containers_are_not_cached() {
    let runtime = Arc::new(FakeRuntime::new(vec![inspect_with_env(
        "noenv",
        "plain",
        &[],
    )]));
    let client = ContainerClient::new(runtime.clone());

    for _ in 0..3 {
        let err = client
            .get_container("noenv", true, &[APP_NAME_ENV])
            .await
            .expect_err("lookup should fail");
        assert!(matches!(err, Error::TsuruVariablesNotFound));
    }
    assert_eq!(runtime.inspect_calls(), 3);
}

#[tokio::test]
async fn test_cached_container_rechecks_required_envs() {
    let runtime = Arc::new(FakeRuntime::new(vec![inspect_with_env(
        "c1",
        "plain",
        &["PATH=/bin"],
    )]));
    let client = ContainerClient::new(runtime.clone());

    client
        .get_container("c1", true, &[])
        .await
        .expect("lookup failed");
    let err = client
        .get_app_container("c1", true)
        .await
        .expect_err("cached container lacks the app env");
    assert!(err.is_not_eligible());
    assert_eq!(runtime.inspect_calls(), 1);
}

#[tokio::test]
async fn test_lru_eviction() {
    let runtime = Arc::new(FakeRuntime::default());
    for i in 0..3 {
        runtime.add(inspect_with_env(&format!("c{i}"), "n", &["TSURU_APPNAME=a"]));
    }
    let client = ContainerClient::with_capacity(runtime.clone(), 2);

    for id in ["c0", "c1", "c2"] {
        client.get_container(id, true, &[]).await.expect("lookup failed");
    }
    assert_eq!(runtime.inspect_calls(), 3);

    // c0 was evicted by c2, c2 is still cached.
    client.get_container("c2", true, &[]).await.expect("lookup failed");
    assert_eq!(runtime.inspect_calls(), 3);
    client.get_container("c0", true, &[]).await.expect("lookup failed");
    assert_eq!(runtime.inspect_calls(), 4);
}

#[tokio::test]
async fn test_unknown_container() {
    let client = ContainerClient::new(Arc::new(FakeRuntime::default()));
    let err = client
        .get_fresh_container("missing")
        .await
        .expect_err("lookup should fail");
    assert!(matches!(err, Error::NotFound(id) if id == "missing"));
}

/// Serves a single canned HTTP response and returns the raw request it saw.
async fn serve_once(listener: TcpListener, status: &'static str, body: &'static str) -> String {
    let (mut stream, _) = listener.accept().await.expect("accept failed");
    let mut request = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await.expect("read failed");
        request.extend_from_slice(&buf[..n]);
        if n == 0 || request.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream
        .write_all(response.as_bytes())
        .await
        .expect("write failed");
    String::from_utf8_lossy(&request).to_string()
}

#[tokio::test]
async fn test_docker_client_inspect_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");
    let server = tokio::spawn(serve_once(
        listener,
        "200 OK",
        r#"{"Id":"abc","Name":"/web","Config":{"Env":["TSURU_APPNAME=app"]},"State":{"Running":true}}"#,
    ));

    let client = DockerClient::new(&format!("tcp://{addr}")).expect("invalid endpoint");
    let inspect = client.inspect_container("abc").await.expect("inspect failed");
    assert_eq!(inspect.id, "abc");
    assert!(inspect.state.running);

    let request = server.await.expect("server task failed");
    assert!(request.starts_with("GET /containers/abc/json HTTP/1.1"));
}

#[tokio::test]
async fn test_docker_client_remove_not_found() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");
    let server = tokio::spawn(serve_once(
        listener,
        "404 Not Found",
        r#"{"message":"No such container: gone"}"#,
    ));

    let client = DockerClient::new(&format!("http://{addr}")).expect("invalid endpoint");
    let err = client
        .remove_container("gone", true)
        .await
        .expect_err("remove should fail");
    assert!(matches!(err, Error::NotFound(id) if id == "gone"));

    let request = server.await.expect("server task failed");
    assert!(request.starts_with("DELETE /containers/gone?force=1 HTTP/1.1"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_docker_client_over_unix_socket() {
    use tokio::net::UnixListener;

    let dir = tempfile::tempdir().expect("tempdir failed");
    let socket_path = dir.path().join("docker.sock");
    let listener = UnixListener::bind(&socket_path).expect("bind failed");
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept failed");
        let mut buf = [0u8; 4096];
        let _ = stream.read(&mut buf).await.expect("read failed");
        let body = r#"{"DockerRootDir":"/data/docker"}"#;
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream
            .write_all(response.as_bytes())
            .await
            .expect("write failed");
    });

    let client = DockerClient::new(&format!("unix://{}", socket_path.display()))
        .expect("invalid endpoint");
    let info = client.info().await.expect("info failed");
    assert_eq!(info.docker_root_dir, "/data/docker");
    server.await.expect("server task failed");
}

#[tokio::test]
async fn test_docker_client_create_container() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");
    let server = tokio::spawn(serve_once(
        listener,
        "201 Created",
        r#"{"Id":"new-container","Warnings":[]}"#,
    ));

    let client = DockerClient::new(&format!("tcp://{addr}")).expect("invalid endpoint");
    let id = client
        .create_container(
            None,
            &CreateContainerOptions {
                image: "tsuru/bs".to_string(),
                cmd: vec!["echo".to_string(), "hi".to_string()],
                ..Default::default()
            },
        )
        .await
        .expect("create failed");
    assert_eq!(id, "new-container");
    let request = server.await.expect("server task failed");
    assert!(request.starts_with("POST /containers/create HTTP/1.1"));
}
