// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Error produced when a line matches none of the accepted syslog dialects.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unable to parse syslog line: {reason}")]
pub struct ParseError {
    pub reason: &'static str,
}

impl ParseError {
    pub(crate) fn new(reason: &'static str) -> Self {
        ParseError { reason }
    }
}

/// Errors raised by forwarder adapters while talking to a sink.
#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    #[error("invalid backend address {0:?}")]
    InvalidAddress(String),

    #[error("failed to connect to {address}: {message}")]
    Connect { address: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("short write: wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("connection is closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for ForwarderError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ForwarderError::WebSocket(err.to_string())
    }
}

impl From<serde_json::Error> for ForwarderError {
    fn from(err: serde_json::Error) -> Self {
        ForwarderError::Encode(err.to_string())
    }
}

/// Errors returned while starting the log forwarder server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid listen address {0:?}, expected udp://host:port or tcp://host:port")]
    InvalidAddress(String),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown log backend {0:?}")]
    UnknownBackend(String),

    #[error("failed to initialize backend {name}: {source}")]
    Backend {
        name: String,
        #[source]
        source: ForwarderError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ParseError::new("missing priority").to_string(),
            "unable to parse syslog line: missing priority"
        );
        assert_eq!(
            ForwarderError::ShortWrite {
                written: 3,
                expected: 10
            }
            .to_string(),
            "short write: wrote 3 of 10 bytes"
        );
        let err = ServerError::Backend {
            name: "gelf".to_string(),
            source: ForwarderError::InvalidAddress("nowhere".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "failed to initialize backend gelf: invalid backend address \"nowhere\""
        );
    }
}
