//! TLS setup. Certificates are throwaway: peer identity is proven by the
//! device-key handshake on the first stream, so the server certificate
//! is never checked.

use heart_api::*;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime,
};
use std::sync::Arc;

/// Application protocol negotiated on every connection.
pub(crate) const ALPN: &[u8] = b"heart/drpc";

/// Name put in, and dialed against, the self-signed certificate.
pub(crate) const SERVER_NAME: &str = "heart";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_err(ctx: &'static str) -> impl FnOnce(rustls::Error) -> HeartError {
    move |e| HeartError::other_src(ctx, e)
}

pub(crate) fn server_crypto(
) -> HeartResult<quinn::crypto::rustls::QuicServerConfig> {
    let certified = rcgen::generate_simple_self_signed(vec![
        SERVER_NAME.to_string(),
    ])
    .map_err(|e| HeartError::other_src("generate certificate", e))?;
    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));

    let mut config = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_err("tls versions"))?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(tls_err("tls certificate"))?;
    config.alpn_protocols = vec![ALPN.to_vec()];

    quinn::crypto::rustls::QuicServerConfig::try_from(config)
        .map_err(|e| HeartError::other_src("quic server crypto", e))
}

pub(crate) fn client_crypto(
) -> HeartResult<quinn::crypto::rustls::QuicClientConfig> {
    let provider = provider();
    let mut config =
        rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(tls_err("tls versions"))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AnyCert(provider)))
            .with_no_client_auth();
    config.alpn_protocols = vec![ALPN.to_vec()];

    quinn::crypto::rustls::QuicClientConfig::try_from(config)
        .map_err(|e| HeartError::other_src("quic client crypto", e))
}

/// Accepts any server certificate but still checks that the handshake
/// signatures match the presented one.
#[derive(Debug)]
struct AnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AnyCert {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
