use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid multiaddr: {0}")]
    InvalidAddress(String),

    #[error("invalid network: not an IPv4 or IPv6 UDP/QUIC address")]
    InvalidNetwork,

    #[error("handshake failed: {source}")]
    HandshakeFailed {
        /// True when the failure originated in the TLS layer, e.g. an
        /// identity-binding or peer ID verification failure.
        crypto: bool,
        #[source]
        source: quinn::ConnectionError,
    },

    #[error("connection gated")]
    Gated,

    #[error("stateless reset received")]
    StatelessReset,

    #[error("stream reset by peer")]
    StreamReset,

    #[error("operation canceled")]
    Canceled,

    #[error("connection closed")]
    Closed,

    #[error("timed out")]
    Timeout,

    #[error("private networks are not supported")]
    PrivateNetworkUnsupported,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("identity error: {0}")]
    Identity(#[from] peerlink_identity::IdentityError),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("connection error: {0}")]
    Connection(quinn::ConnectionError),

    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl TransportError {
    /// True for handshake failures caused by certificate or peer ID
    /// verification rather than transport-level problems.
    pub fn is_crypto(&self) -> bool {
        matches!(self, TransportError::HandshakeFailed { crypto: true, .. })
    }
}

/// Application close code for an orderly connection close.
pub(crate) const CLOSE_CODE_ORDERLY: u32 = 0;
/// Application close code used when the gater rejects a secured session.
pub(crate) const CLOSE_CODE_GATED: u32 = 1;

/// Maps a session-level error observed on an established connection.
pub(crate) fn from_connection_error(err: quinn::ConnectionError) -> TransportError {
    match err {
        quinn::ConnectionError::Reset => TransportError::StatelessReset,
        quinn::ConnectionError::LocallyClosed => TransportError::Closed,
        quinn::ConnectionError::ApplicationClosed(close) => {
            if close.error_code == CLOSE_CODE_GATED.into() {
                TransportError::Gated
            } else {
                TransportError::Closed
            }
        }
        quinn::ConnectionError::ConnectionClosed(_) => TransportError::Closed,
        quinn::ConnectionError::TimedOut => TransportError::Timeout,
        other => TransportError::Connection(other),
    }
}

/// Maps an error observed while a dial handshake was in flight.
pub(crate) fn from_handshake_error(err: quinn::ConnectionError) -> TransportError {
    match err {
        quinn::ConnectionError::Reset => TransportError::StatelessReset,
        quinn::ConnectionError::TimedOut => TransportError::Timeout,
        quinn::ConnectionError::LocallyClosed => TransportError::Canceled,
        quinn::ConnectionError::TransportError(e) => {
            // TLS alerts surface as QUIC CRYPTO_ERROR codes (0x100..=0x1ff).
            let code = u64::from(e.code);
            TransportError::HandshakeFailed {
                crypto: (0x100..=0x1ff).contains(&code),
                source: quinn::ConnectionError::TransportError(e),
            }
        }
        other => TransportError::HandshakeFailed {
            crypto: false,
            source: other,
        },
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
