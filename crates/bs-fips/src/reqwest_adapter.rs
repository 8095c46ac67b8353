// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use reqwest::ClientBuilder;
#[cfg(feature = "fips")]
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("no crypto provider installed")]
    NoProvider,

    #[error("crypto provider is not FIPS compliant")]
    NotFips,

    #[error("no usable certificate in the native root store")]
    NoRootCertificates,

    #[error("invalid TLS configuration: {0}")]
    Config(String),
}

/// Returns a client builder with the connect and total request timeouts set.
#[cfg(not(feature = "fips"))]
pub fn create_reqwest_client_builder(
    connect_timeout: Duration,
    timeout: Duration,
) -> Result<ClientBuilder, TlsError> {
    Ok(reqwest::Client::builder()
        .use_rustls_tls()
        .connect_timeout(connect_timeout)
        .timeout(timeout))
}

/// Returns a client builder restricted to the installed FIPS provider.
#[cfg(feature = "fips")]
pub fn create_reqwest_client_builder(
    connect_timeout: Duration,
    timeout: Duration,
) -> Result<ClientBuilder, TlsError> {
    let provider = rustls::crypto::CryptoProvider::get_default().ok_or(TlsError::NoProvider)?;
    if !provider.fips() {
        return Err(TlsError::NotFips);
    }

    let mut roots = rustls::RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    debug!("loaded {added} native root certificates, ignored {ignored}");
    if added == 0 {
        return Err(TlsError::NoRootCertificates);
    }

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .map_err(|e| TlsError::Config(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    if !config.fips() {
        return Err(TlsError::NotFips);
    }

    Ok(reqwest::Client::builder()
        .use_preconfigured_tls(config)
        .connect_timeout(connect_timeout)
        .timeout(timeout))
}
