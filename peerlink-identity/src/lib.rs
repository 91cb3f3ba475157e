//! # Peerlink identity
//!
//! Peer identity binding over TLS for the peerlink QUIC transport. A node's
//! long-term libp2p key never signs TLS sessions directly; instead each node
//! generates a short-lived TLS keypair and a self-signed certificate whose
//! critical extension proves that the libp2p key authorized the TLS key.
//!
//! ## Key components
//!
//! - [`Identity`]: per-node certificate plus the rustls configuration
//!   factories for dialing and listening
//! - [`certificate`]: generation and verification of the bound leaf
//!   certificates
//! - [`verifier`]: rustls verifiers enforcing the binding during handshakes

pub mod certificate;
pub mod errors;
pub mod identity;
pub mod verifier;

pub use errors::{IdentityError, Result};
pub use identity::Identity;
