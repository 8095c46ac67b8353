// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid control plane endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("unable to build http client: {0}")]
    Tls(#[from] bs_fips::TlsError),

    #[error("control plane request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("control plane returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("invalid control plane response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Runtime(#[from] bs_container::Error),
}
