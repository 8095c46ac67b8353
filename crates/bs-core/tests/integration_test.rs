// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use bs_container::testing::{inspect_with_env, FakeRuntime};
use bs_core::{Config, ServiceStatus, Services};
use mockito::{Matcher, Server};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_reporter_runs_under_supervisor() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/node/status")
        .match_header("authorization", "bearer secret")
        .match_body(Matcher::Regex(
            r#""ID":"abc","Name":"web-1","Status":"started""#.to_string(),
        ))
        .with_status(200)
        .with_body(r#"[{"ID":"abc","Found":true}]"#)
        .expect_at_least(1)
        .create_async()
        .await;

    let mut config = Config {
        docker_endpoint: "unix:///var/run/docker.sock".to_string(),
        tsuru_endpoint: server.url(),
        tsuru_token: "secret".to_string(),
        status_interval: Duration::from_secs(1),
        ..Default::default()
    };
    config.hostcheck.base_container_name = String::new();
    config.validate().unwrap();

    let runtime = Arc::new(FakeRuntime::new(vec![inspect_with_env(
        "abc",
        "web-1",
        &["TSURU_APPNAME=myapp"],
    )]));
    let shutdown = CancellationToken::new();
    let handle = Services::new(config)
        .start_with_runtime(runtime.clone(), shutdown.clone())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while !mock.matched_async().await {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .unwrap();
    assert_eq!(handle.status(), ServiceStatus::Stopped);
    assert!(runtime.remove_calls().is_empty());
}

#[tokio::test]
async fn test_unreachable_docker_endpoint_is_rejected() {
    let config = Config {
        docker_endpoint: "ftp://docker".to_string(),
        tsuru_endpoint: "http://127.0.0.1:1".to_string(),
        tsuru_token: "secret".to_string(),
        ..Default::default()
    };
    let result = Services::new(config).start(CancellationToken::new()).await;
    assert!(matches!(result, Err(bs_core::ServicesError::Runtime(_))));
}
