//! # Peerlink transport
//!
//! A peer-to-peer QUIC transport in the libp2p mold: bidirectional,
//! multiplexed, authenticated streams between peer identities, tunneled over
//! a single UDP socket per endpoint.
//!
//! The pieces, bottom up:
//!
//! - [`addr`]: `/ip{4,6}/<ip>/udp/<port>/quic` multiaddress codec
//! - [`gater`]: the admission-control capability consulted on the packet
//!   path and after the handshake
//! - the reuse registry: a reference-counted cache of UDP sockets letting
//!   one OS port back a listener and many outbound dials, garbage-collected
//!   when idle
//! - [`Stream`] and [`Connection`]: QUIC stream and session adapters with
//!   the muxed-stream contract
//! - [`Listener`] and [`QuicTransport`]: accept and dial orchestration with
//!   peer identity verification during the TLS handshake

pub mod addr;
pub mod config;
pub mod connection;
pub mod errors;
mod filtered;
pub mod gater;
pub mod listener;
mod reuse;
pub mod stream;
pub mod token_store;
pub mod transport;

pub use config::QuicConfig;
pub use connection::Connection;
pub use errors::{Result, TransportError};
pub use gater::{ConnectionGater, Direction};
pub use listener::Listener;
pub use stream::Stream;
pub use token_store::MemoryTokenStore;
pub use transport::{PreSharedKey, QuicTransport};
