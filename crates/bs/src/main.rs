// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::process::ExitCode;

use bs_core::config::log_filter_from_env;
use bs_core::{Config, Services};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
pub async fn main() -> ExitCode {
    if env::args()
        .skip(1)
        .any(|arg| arg == "-version" || arg == "--version")
    {
        println!("bs version {VERSION}");
        return ExitCode::SUCCESS;
    }

    let log_filter = log_filter_from_env();
    let env_filter = EnvFilter::try_new(&log_filter).unwrap_or_else(|e| {
        eprintln!("invalid log filter {log_filter:?}, using info: {e}");
        EnvFilter::new("info")
    });
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
    }

    debug!("Logging subsystem enabled");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!("bs {VERSION} starting");
    let shutdown = CancellationToken::new();
    let handle = match Services::new(config).start(shutdown.clone()).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("unable to start services: {e}");
            return ExitCode::FAILURE;
        }
    };

    wait_for_signal().await;
    shutdown.cancel();
    handle.wait().await;
    info!("bs stopped");
    ExitCode::SUCCESS
}

async fn wait_for_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!("unable to listen for SIGTERM: {e}");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("unable to listen for SIGINT: {e}");
            }
            return;
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("received SIGINT"),
            Err(e) => error!("unable to listen for SIGINT: {e}"),
        },
        _ = terminate.recv() => info!("received SIGTERM"),
    }
}
