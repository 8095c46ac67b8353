// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Errors returned by the container runtime client and the metadata cache.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The container does not carry the environment variables the caller
    /// asked for. This is not a failure: the container is simply not eligible.
    #[error("could not find tsuru environment variables in container")]
    TsuruVariablesNotFound,

    #[error("invalid container runtime endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("container runtime request failed: {0}")]
    Transport(String),

    #[error("no such container: {0}")]
    NotFound(String),

    #[error("invalid container name {0:?}")]
    InvalidName(String),

    #[error("container runtime returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("failed to decode container runtime response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("container runtime request timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Returns true when the container exists but lacks the required environment.
    #[must_use]
    pub fn is_not_eligible(&self) -> bool {
        matches!(self, Error::TsuruVariablesNotFound)
    }
}

impl From<hyper::Error> for Error {
    fn from(err: hyper::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<hyper::http::Error> for Error {
    fn from(err: hyper::http::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
