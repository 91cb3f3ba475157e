use libp2p_identity::{Keypair, PeerId, PublicKey};
use rcgen::{CertificateParams, CustomExtension, DistinguishedName, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::debug;
use x509_parser::prelude::*;

use crate::errors::{IdentityError, Result};

/// OID of the libp2p Public Key Extension, per the libp2p TLS handshake
/// specification (1.3.6.1.4.1.53594.1.1).
pub const P2P_EXT_OID: [u64; 9] = [1, 3, 6, 1, 4, 1, 53594, 1, 1];

const P2P_EXT_OID_STRING: &str = "1.3.6.1.4.1.53594.1.1";

/// Domain-separation prefix for the extension signature.
pub const P2P_SIGNING_PREFIX: &[u8] = b"libp2p-tls-handshake:";

/// Certificates are short-lived; peers validate the identity binding, not a
/// CA chain, so there is nothing to gain from long validity periods.
const CERT_VALIDITY_DAYS: i64 = 180;

/// Generates a self-signed TLS leaf certificate bound to a libp2p identity.
///
/// The certificate uses a freshly generated P-256 keypair for TLS. The
/// binding to the long-term libp2p key is carried in a critical custom
/// extension containing the protobuf-encoded libp2p public key and a
/// signature by the libp2p private key over
/// `"libp2p-tls-handshake:" || SPKI(tls_public_key)`.
pub fn generate(identity: &Keypair) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let tls_key =
        KeyPair::generate().map_err(|e| IdentityError::CertificateGeneration(e.to_string()))?;

    let mut msg = Vec::with_capacity(P2P_SIGNING_PREFIX.len() + tls_key.public_key_der().len());
    msg.extend_from_slice(P2P_SIGNING_PREFIX);
    msg.extend_from_slice(&tls_key.public_key_der());
    let signature = identity
        .sign(&msg)
        .map_err(|e| IdentityError::Signing(e.to_string()))?;

    let signed_key = encode_signed_key(&identity.public().encode_protobuf(), &signature);
    let mut ext = CustomExtension::from_oid_content(&P2P_EXT_OID, signed_key);
    ext.set_criticality(true);

    // An empty subject: peers identify each other through the extension, so
    // the distinguished name carries no information.
    let mut params = CertificateParams::new(Vec::new())
        .map_err(|e| IdentityError::CertificateGeneration(e.to_string()))?;
    params.distinguished_name = DistinguishedName::new();
    params.not_before = ::time::OffsetDateTime::now_utc() - ::time::Duration::hours(1);
    params.not_after = params.not_before + ::time::Duration::days(CERT_VALIDITY_DAYS);
    params.custom_extensions = vec![ext];

    let cert = params
        .self_signed(&tls_key)
        .map_err(|e| IdentityError::CertificateGeneration(e.to_string()))?;
    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(tls_key.serialize_der()).map_err(|e| {
        IdentityError::CertificateGeneration(format!("failed to serialize key: {e:?}"))
    })?;

    debug!("Generated identity certificate for {}", identity.public().to_peer_id());

    Ok((cert_der, key_der))
}

/// Extracts and verifies the libp2p public key embedded in a certificate.
///
/// Checks that the embedded signature, made with the libp2p private key,
/// covers this certificate's TLS public key. A certificate that parses but
/// fails the binding check is treated as an invalid certificate, not as a
/// different peer.
pub fn parse(cert: &CertificateDer<'_>) -> Result<PublicKey> {
    let (_, x509) = X509Certificate::from_der(cert)
        .map_err(|e| IdentityError::CertificateParsing(e.to_string()))?;

    let ext = x509
        .extensions()
        .iter()
        .find(|ext| ext.oid.to_string() == P2P_EXT_OID_STRING)
        .ok_or(IdentityError::MissingExtension)?;

    let (public_key_bytes, signature) = decode_signed_key(ext.value)?;
    let public_key = PublicKey::try_decode_protobuf(&public_key_bytes)
        .map_err(|e| IdentityError::InvalidKeyEncoding(e.to_string()))?;

    let spki = x509.public_key().raw;
    let mut msg = Vec::with_capacity(P2P_SIGNING_PREFIX.len() + spki.len());
    msg.extend_from_slice(P2P_SIGNING_PREFIX);
    msg.extend_from_slice(spki);
    if !public_key.verify(&msg, &signature) {
        return Err(IdentityError::InvalidSignature);
    }

    Ok(public_key)
}

/// Derives the peer identity from a certificate chain.
///
/// libp2p requires the chain to consist of exactly one self-signed leaf.
pub fn peer_from_chain(chain: &[CertificateDer<'_>]) -> Result<(PeerId, PublicKey)> {
    let cert = match chain {
        [cert] => cert,
        _ => return Err(IdentityError::UnexpectedChainLength(chain.len())),
    };
    let public_key = parse(cert)?;
    Ok((public_key.to_peer_id(), public_key))
}

// SignedKey ::= SEQUENCE { publicKey OCTET STRING, signature OCTET STRING }
fn encode_signed_key(public_key: &[u8], signature: &[u8]) -> Vec<u8> {
    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_bytes(public_key);
            writer.next().write_bytes(signature);
        })
    })
}

fn decode_signed_key(der: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    yasna::parse_der(der, |reader| {
        reader.read_sequence(|reader| {
            let public_key = reader.next().read_bytes()?;
            let signature = reader.next().read_bytes()?;
            Ok((public_key, signature))
        })
    })
    .map_err(|e| IdentityError::CertificateParsing(format!("invalid SignedKey extension: {e}")))
}
