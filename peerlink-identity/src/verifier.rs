use std::sync::{Arc, OnceLock};

use libp2p_identity::{PeerId, PublicKey};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tracing::debug;
use x509_parser::prelude::*;

use crate::certificate;
use crate::errors::IdentityError;

/// Certificate verifier for the dial path.
///
/// Verification at the TLS layer is disabled; this verifier checks the
/// libp2p identity binding instead, compares the derived peer ID against the
/// one the dialer expects, and publishes the derived public key through a
/// single-assignment slot the dial path reads after the handshake.
#[derive(Debug)]
pub struct PeerVerifier {
    expected: PeerId,
    remote_key: Arc<OnceLock<PublicKey>>,
}

impl PeerVerifier {
    pub fn new(expected: PeerId, remote_key: Arc<OnceLock<PublicKey>>) -> Self {
        Self {
            expected,
            remote_key,
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for PeerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let public_key = verify_presented_certs(end_entity, intermediates, now)?;

        let actual = public_key.to_peer_id();
        if actual != self.expected {
            return Err(crypto_error(IdentityError::PeerIdMismatch {
                expected: self.expected,
                actual,
            }));
        }

        // At most one handshake writes here; later reads see this value.
        let _ = self.remote_key.set(public_key);

        debug!("Verified server certificate for {}", actual);
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        supported_schemes()
    }
}

/// Client-certificate verifier for the accept path.
///
/// Accepts any peer whose certificate carries a valid identity binding. The
/// peer ID cannot be checked here because the listener has no expectation;
/// derivation happens again on the accept path once the session surfaces.
#[derive(Debug)]
pub struct AnyPeerVerifier;

impl rustls::server::danger::ClientCertVerifier for AnyPeerVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        // Self-signed leaves, no roots to hint at.
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        let public_key = verify_presented_certs(end_entity, intermediates, now)?;
        debug!("Verified client certificate for {}", public_key.to_peer_id());
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        supported_schemes()
    }
}

fn verify_presented_certs(
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
    now: UnixTime,
) -> std::result::Result<PublicKey, rustls::Error> {
    if !intermediates.is_empty() {
        return Err(crypto_error(IdentityError::UnexpectedChainLength(
            1 + intermediates.len(),
        )));
    }

    let (_, cert) = X509Certificate::from_der(end_entity)
        .map_err(|_| rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding))?;

    let now_seconds = now.as_secs();
    if (cert.validity().not_before.timestamp() as u64) > now_seconds
        || (cert.validity().not_after.timestamp() as u64) < now_seconds
    {
        return Err(rustls::Error::InvalidCertificate(
            rustls::CertificateError::Expired,
        ));
    }

    // The leaf must be self-signed; there is no chain to walk.
    cert.verify_signature(None).map_err(|_| {
        rustls::Error::InvalidCertificate(rustls::CertificateError::BadSignature)
    })?;

    certificate::parse(end_entity).map_err(crypto_error)
}

fn crypto_error(err: IdentityError) -> rustls::Error {
    rustls::Error::InvalidCertificate(rustls::CertificateError::Other(rustls::OtherError(
        Arc::new(err),
    )))
}

fn supported_schemes() -> Vec<rustls::SignatureScheme> {
    vec![
        rustls::SignatureScheme::ED25519,
        rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
        rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
        rustls::SignatureScheme::RSA_PSS_SHA256,
        rustls::SignatureScheme::RSA_PSS_SHA384,
        rustls::SignatureScheme::RSA_PSS_SHA512,
    ]
}
