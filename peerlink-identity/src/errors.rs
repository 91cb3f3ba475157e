use libp2p_identity::PeerId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    #[error("certificate parsing failed: {0}")]
    CertificateParsing(String),

    #[error("certificate does not carry the libp2p extension")]
    MissingExtension,

    #[error("invalid libp2p key encoding: {0}")]
    InvalidKeyEncoding(String),

    #[error("identity signature does not cover the certificate key")]
    InvalidSignature,

    #[error("expected a single certificate in the chain, got {0}")]
    UnexpectedChainLength(usize),

    #[error("peer ID mismatch: expected {expected}, derived {actual}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
}

pub type Result<T> = std::result::Result<T, IdentityError>;
