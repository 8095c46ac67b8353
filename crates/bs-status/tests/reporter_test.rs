// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bs_container::testing::{inspect_with_env, FakeRuntime};
use bs_container::types::ContainerInspect;
use bs_container::ContainerClient;
use bs_status::reporter::{Status, UnitStatus};
use bs_status::{HostChecks, Reporter, ReporterConfig};
use mockito::{Matcher, Server};

const APP_ENV: &[&str] = &["TSURU_APPNAME=app1", "TSURU_PROCESSNAME=web"];

fn app(id: &str, running: bool, restarting: bool, started_at: &str) -> ContainerInspect {
    let mut inspect = inspect_with_env(id, &format!("unit-{id}"), APP_ENV);
    inspect.state.running = running;
    inspect.state.restarting = restarting;
    inspect.state.started_at = started_at.to_string();
    inspect
}

fn reporter(server: &Server, runtime: Arc<FakeRuntime>) -> Reporter {
    Reporter::new(ReporterConfig {
        endpoint: server.url(),
        token: "token".to_string(),
        interval: Duration::from_secs(3600),
        client: Arc::new(ContainerClient::new(runtime)),
        checks: HostChecks::new(Vec::new(), Duration::from_secs(1)),
    })
    .unwrap()
}

fn unit(id: &str, status: Status) -> UnitStatus {
    UnitStatus {
        id: id.to_string(),
        name: format!("unit-{id}"),
        status,
    }
}

#[tokio::test]
async fn test_status_classification() {
    let past = "2016-01-02T10:00:01Z";
    let zero = "0001-01-01T00:00:00Z";
    let mut isolated = app("c7", true, false, past);
    isolated.config.labels = Some(HashMap::from([(
        "is-isolated-run".to_string(),
        "true".to_string(),
    )]));
    let runtime = Arc::new(FakeRuntime::new(vec![
        app("c1", true, false, past),
        app("c2", false, false, past),
        app("c3", true, true, past),
        app("c4", true, false, past),
        inspect_with_env("c5", "plain", &[]),
        app("c6", false, false, zero),
        isolated,
    ]));

    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/node/status")
        .match_header("authorization", "bearer token")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#""ID":"c3","Name":"unit-c3","Status":"error""#.to_string()),
            Matcher::Regex(r#""ID":"c6","Name":"unit-c6","Status":"created""#.to_string()),
            Matcher::Regex(r#""Checks":\[\]"#.to_string()),
        ]))
        .with_status(200)
        .with_body("[]")
        .create_async()
        .await;

    let reporter = reporter(&server, runtime);
    let summary = reporter.report().await.unwrap();
    mock.assert_async().await;
    assert_eq!(
        summary.units,
        vec![
            unit("c1", Status::Started),
            unit("c2", Status::Stopped),
            unit("c3", Status::Error),
            unit("c4", Status::Started),
            unit("c6", Status::Created),
        ]
    );
    assert!(summary.removals.is_empty());
    reporter.stop().await;
}

async fn wait_for_removals(reporter: &Reporter) {
    for _ in 0..200 {
        if reporter.pending_removals() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("removals still pending");
}

#[tokio::test]
async fn test_removal_is_not_reissued_while_pending() {
    let past = "2016-01-02T10:00:01Z";
    let runtime = Arc::new(FakeRuntime::new(vec![
        app("A", true, false, past),
        app("B", false, false, past),
    ]));
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/node/status")
        .with_status(200)
        .with_body(r#"[{"ID":"A","Found":true},{"ID":"B","Found":false}]"#)
        .create_async()
        .await;

    let reporter = reporter(&server, Arc::clone(&runtime));
    runtime.block_removals();

    let first = reporter.report().await.unwrap();
    assert_eq!(first.removals, vec!["B".to_string()]);
    for _ in 0..2 {
        assert!(reporter.report().await.unwrap().removals.is_empty());
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runtime.remove_calls(), vec!["B".to_string()]);
    assert_eq!(reporter.pending_removals(), 1);

    runtime.release_removals();
    wait_for_removals(&reporter).await;

    let again = reporter.report().await.unwrap();
    assert_eq!(again.removals, vec!["B".to_string()]);
    wait_for_removals(&reporter).await;
    assert_eq!(
        runtime.remove_calls(),
        vec!["B".to_string(), "B".to_string()]
    );
    reporter.stop().await;
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_removals() {
    let runtime = Arc::new(FakeRuntime::new(vec![app(
        "gone",
        true,
        false,
        "2016-01-02T10:00:01Z",
    )]));
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/node/status")
        .with_status(200)
        .with_body(r#"[{"ID":"gone","Found":false}]"#)
        .create_async()
        .await;

    let reporter = Arc::new(reporter(&server, Arc::clone(&runtime)));
    runtime.block_removals();
    reporter.report().await.unwrap();

    let stopping = {
        let reporter = Arc::clone(&reporter);
        tokio::spawn(async move { reporter.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!stopping.is_finished());

    runtime.release_removals();
    tokio::time::timeout(Duration::from_secs(5), stopping)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reporter.pending_removals(), 0);
}

#[tokio::test]
async fn test_report_error_is_returned() {
    let runtime = Arc::new(FakeRuntime::new(vec![]));
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/node/status")
        .with_status(200)
        .with_body("not json")
        .create_async()
        .await;
    let reporter = reporter(&server, runtime);
    assert!(matches!(
        reporter.report().await,
        Err(bs_status::Error::Decode(_))
    ));
    reporter.stop().await;
}
