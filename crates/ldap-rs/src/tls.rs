// Copyright (C) 2025 Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

//! rustls client configuration for LDAPS and StartTLS.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ClientConfig;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tracing::{debug, warn};

use crate::config::TlsConfig;
use crate::error::TransportError;

fn tls_error(host: &str, message: impl Into<String>) -> TransportError {
    TransportError::Tls {
        host: host.to_string(),
        message: message.into(),
    }
}

/// Build the client configuration: system roots, plus the optional PEM
/// bundle, or no verification at all when `skip_verify` is set.
pub(crate) fn client_config(tls: &TlsConfig, host: &str) -> Result<Arc<ClientConfig>, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        debug!(error = %err, "skipping unreadable system certificate");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!(added, ignored, "loaded system root certificates");

    if let Some(path) = &tls.ca_file {
        let pem = std::fs::read(path)
            .map_err(|e| tls_error(host, format!("reading {}: {}", path.display(), e)))?;
        for cert in rustls_pemfile::certs(&mut std::io::Cursor::new(pem)) {
            let cert = cert.map_err(|e| tls_error(host, format!("parsing CA PEM: {}", e)))?;
            roots
                .add(cert)
                .map_err(|e| tls_error(host, format!("adding CA certificate: {}", e)))?;
        }
    }

    let mut config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error(host, e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    if tls.skip_verify {
        warn!(host, "TLS certificate verification is disabled");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(InsecureServerVerifier { provider }));
    }
    Ok(Arc::new(config))
}

/// The name presented for SNI and checked against the certificate.
pub(crate) fn server_name(tls: &TlsConfig, host: &str) -> Result<ServerName<'static>, TransportError> {
    let name = tls.server_name.as_deref().unwrap_or(host);
    ServerName::try_from(name)
        .map(|n| n.to_owned())
        .map_err(|_| tls_error(host, format!("invalid TLS server name {:?}", name)))
}

/// Accepts any server certificate.
#[derive(Debug)]
struct InsecureServerVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
