// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Control plane status endpoints.

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;
use crate::hostcheck::CheckResult;
use crate::reporter::UnitStatus;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeStatus<'a> {
    pub addrs: &'a [String],
    pub units: &'a [UnitStatus],
    pub checks: &'a [CheckResult],
}

/// Control plane answer for one reported unit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UnitFound {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Found")]
    pub found: bool,
}

#[derive(Clone)]
pub struct ControlPlane {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl ControlPlane {
    pub fn new(endpoint: &str, token: &str) -> Result<Self, Error> {
        let endpoint = endpoint.trim().trim_end_matches('/');
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(Error::InvalidEndpoint(endpoint.to_string()));
        }
        let client = bs_fips::create_reqwest_client_builder(CONNECT_TIMEOUT, REQUEST_TIMEOUT)?
            .build()?;
        Ok(ControlPlane {
            client,
            endpoint: endpoint.to_string(),
            token: token.to_string(),
        })
    }

    /// Posts the node status. Control planes without `/node/status` answer
    /// 404, in which case only the units are posted to `/units/status`.
    pub async fn report(&self, status: &NodeStatus<'_>) -> Result<Vec<UnitFound>, Error> {
        match self.post("/node/status", status).await {
            Err(Error::Status { status: code, .. }) if code == StatusCode::NOT_FOUND => {
                debug!("node status route not found, falling back to unit status");
                self.post("/units/status", &status.units).await
            }
            result => result,
        }
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<Vec<UnitFound>, Error> {
        let payload = serde_json::to_vec(body)?;
        let response = self
            .client
            .post(format!("{}{path}", self.endpoint))
            .header(AUTHORIZATION, format!("bearer {}", self.token))
            .header(CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(Error::Status {
                status,
                body: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice::<Option<Vec<UnitFound>>>(&body)?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn status<'a>(units: &'a [UnitStatus]) -> NodeStatus<'a> {
        NodeStatus {
            addrs: &[],
            units,
            checks: &[],
        }
    }

    #[test]
    fn test_rejects_endpoint_without_scheme() {
        assert!(matches!(
            ControlPlane::new("tsuru.local", "t"),
            Err(Error::InvalidEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_posts_node_status() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/node/status")
            .match_header("authorization", "bearer abc")
            .match_header("content-type", "application/json")
            .match_body(Matcher::JsonString(
                r#"{"Addrs":[],"Units":[],"Checks":[]}"#.to_string(),
            ))
            .with_status(200)
            .with_body(r#"[{"ID":"a","Found":true},{"ID":"b","Found":false}]"#)
            .create_async()
            .await;

        let api = ControlPlane::new(&format!("{}/", server.url()), "abc").unwrap();
        let found = api.report(&status(&[])).await.unwrap();
        mock.assert_async().await;
        assert_eq!(
            found,
            vec![
                UnitFound {
                    id: "a".to_string(),
                    found: true
                },
                UnitFound {
                    id: "b".to_string(),
                    found: false
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_falls_back_to_unit_status_on_404() {
        let mut server = Server::new_async().await;
        let node = server
            .mock("POST", "/node/status")
            .with_status(404)
            .create_async()
            .await;
        let units = server
            .mock("POST", "/units/status")
            .match_header("authorization", "bearer abc")
            .match_body(Matcher::JsonString(
                r#"[{"ID":"c1","Name":"web","Status":"started"}]"#.to_string(),
            ))
            .with_status(200)
            .with_body("null")
            .create_async()
            .await;

        let api = ControlPlane::new(&server.url(), "abc").unwrap();
        let unit = [UnitStatus {
            id: "c1".to_string(),
            name: "web".to_string(),
            status: crate::reporter::Status::Started,
        }];
        let found = api.report(&status(&unit)).await.unwrap();
        node.assert_async().await;
        units.assert_async().await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_error_status() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/node/status")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;
        let api = ControlPlane::new(&server.url(), "abc").unwrap();
        let err = api.report(&status(&[])).await.unwrap_err();
        assert!(matches!(err, Error::Status { status, ref body } if status == 500 && body == "boom"));
    }
}
