//! TLS for a pinned server certificate
//!
//! Host servers present self-signed certificates whose names rarely match
//! the address they are reached at. When the configuration pins a server
//! certificate, the handshake accepts exactly that certificate, whatever the
//! URL host is. Handshake signatures are still verified against it.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, SignatureScheme};
use tracing::debug;

use lattice_common::{Error, Result};

/// Server certificate verifier that trusts a single end-entity certificate
#[derive(Debug)]
pub struct PinnedServerCertVerifier {
    pinned: CertificateDer<'static>,
    provider: Arc<CryptoProvider>,
}

impl PinnedServerCertVerifier {
    /// Verifier trusting only `pinned`
    pub fn new(pinned: CertificateDer<'static>, provider: Arc<CryptoProvider>) -> Self {
        Self { pinned, provider }
    }
}

impl ServerCertVerifier for PinnedServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() != self.pinned.as_ref() {
            debug!(server = ?server_name, "Server certificate does not match the pinned certificate");
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Parse the first certificate of a PEM bundle
pub fn parse_certificate(field: &str, pem_text: &str) -> Result<CertificateDer<'static>> {
    parse_certificates(field, pem_text)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::validation_for_field(field, "no CERTIFICATE block found"))
}

/// Parse every certificate of a PEM bundle, in order
pub fn parse_certificates(field: &str, pem_text: &str) -> Result<Vec<CertificateDer<'static>>> {
    let blocks = pem::parse_many(pem_text.as_bytes())
        .map_err(|e| Error::validation_for_field(field, format!("invalid PEM: {}", e)))?;
    Ok(blocks
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| CertificateDer::from(block.into_contents()))
        .collect())
}

/// Parse a PKCS#8, PKCS#1 or SEC1 private key
pub fn parse_private_key(field: &str, pem_text: &str) -> Result<PrivateKeyDer<'static>> {
    let block = pem::parse(pem_text.as_bytes())
        .map_err(|e| Error::validation_for_field(field, format!("invalid PEM: {}", e)))?;
    match block.tag() {
        "PRIVATE KEY" => Ok(PrivateKeyDer::Pkcs8(block.into_contents().into())),
        "RSA PRIVATE KEY" => Ok(PrivateKeyDer::Pkcs1(block.into_contents().into())),
        "EC PRIVATE KEY" => Ok(PrivateKeyDer::Sec1(block.into_contents().into())),
        tag => Err(Error::validation_for_field(
            field,
            format!("unsupported private key block {:?}", tag),
        )),
    }
}

/// rustls client config trusting only `server_crt`, with an optional client identity
pub fn pinned_client_config(
    server_crt: &str,
    client_crt: &str,
    client_key: &str,
) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let pinned = parse_certificate("server-crt", server_crt)?;

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::internal_with_context("tls", e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedServerCertVerifier::new(pinned, provider)));

    if client_crt.is_empty() && client_key.is_empty() {
        return Ok(builder.with_no_client_auth());
    }

    let chain = parse_certificates("client-crt", client_crt)?;
    if chain.is_empty() {
        return Err(Error::validation_for_field("client-crt", "no CERTIFICATE block found"));
    }
    let key = parse_private_key("client-key", client_key)?;
    builder
        .with_client_auth_cert(chain, key)
        .map_err(|e| Error::validation_for_field("client-key", format!("invalid client certificate or key: {}", e)))
}
