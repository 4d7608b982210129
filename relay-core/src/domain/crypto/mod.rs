//! ECDSA keys for commit signatures.
//!
//! atproto accounts sign commits with either NIST P-256 or secp256k1. Both
//! paths hash content with SHA-256 and verify the 64-byte `r || s` signature
//! against the digest. Signatures must be in "low-S" form: a high-S signature
//! is rejected even when the raw ECDSA verify would pass, so that a commit
//! has exactly one valid signature encoding.

use crate::foundation::{RelayError, Result};
use p256::ecdsa::signature::{Signer, Verifier};
use secp256k1::SECP256K1;
use sha2::{Digest, Sha256};

/// Multicodec varint prefix for p256-pub (0x1200).
const P256_MULTICODEC: [u8; 2] = [0x80, 0x24];
/// Multicodec varint prefix for secp256k1-pub (0xe7).
const K256_MULTICODEC: [u8; 2] = [0xe7, 0x01];

pub const SIGNATURE_LEN: usize = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyAlgo {
    P256,
    K256,
}

impl std::fmt::Display for KeyAlgo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyAlgo::P256 => write!(f, "p256"),
            KeyAlgo::K256 => write!(f, "k256"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PublicKey {
    P256(p256::ecdsa::VerifyingKey),
    K256(secp256k1::PublicKey),
}

impl PublicKey {
    /// Parses a compressed curve point for the given algorithm.
    pub fn parse(algo: KeyAlgo, bytes: &[u8]) -> Result<Self> {
        match algo {
            KeyAlgo::P256 => {
                let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
                    .map_err(|err| RelayError::InvalidKey(format!("p256: {err}")))?;
                Ok(PublicKey::P256(key))
            }
            KeyAlgo::K256 => {
                let key = secp256k1::PublicKey::from_slice(bytes)
                    .map_err(|err| RelayError::InvalidKey(format!("k256: {err}")))?;
                Ok(PublicKey::K256(key))
            }
        }
    }

    /// Decodes a multibase public key (`z` + base58btc + multicodec prefix),
    /// the encoding used inside identity documents.
    pub fn from_multibase(encoded: &str) -> Result<Self> {
        let rest = encoded
            .strip_prefix('z')
            .ok_or_else(|| RelayError::InvalidKey(format!("unsupported multibase: {encoded}")))?;
        let bytes = bs58::decode(rest)
            .into_vec()
            .map_err(|err| RelayError::InvalidKey(format!("base58: {err}")))?;
        if bytes.len() < 3 {
            return Err(RelayError::InvalidKey("multibase key too short".to_string()));
        }
        let (prefix, point) = bytes.split_at(2);
        if prefix == P256_MULTICODEC {
            Self::parse(KeyAlgo::P256, point)
        } else if prefix == K256_MULTICODEC {
            Self::parse(KeyAlgo::K256, point)
        } else {
            Err(RelayError::InvalidKey(format!("unknown multicodec prefix: {:02x}{:02x}", prefix[0], prefix[1])))
        }
    }

    pub fn from_did_key(did_key: &str) -> Result<Self> {
        let rest = did_key
            .strip_prefix("did:key:")
            .ok_or_else(|| RelayError::InvalidKey(format!("not a did:key: {did_key}")))?;
        Self::from_multibase(rest)
    }

    pub fn algo(&self) -> KeyAlgo {
        match self {
            PublicKey::P256(_) => KeyAlgo::P256,
            PublicKey::K256(_) => KeyAlgo::K256,
        }
    }

    /// Compressed curve point serialization.
    pub fn bytes(&self) -> Vec<u8> {
        match self {
            PublicKey::P256(key) => key.to_encoded_point(true).as_bytes().to_vec(),
            PublicKey::K256(key) => key.serialize().to_vec(),
        }
    }

    /// Hashes `content` with SHA-256 and verifies the ECDSA signature
    /// against the digest. Requires low-S form.
    pub fn verify(&self, content: &[u8], sig: &[u8]) -> Result<()> {
        if sig.len() != SIGNATURE_LEN {
            return Err(RelayError::BadSignature);
        }
        match self {
            PublicKey::P256(key) => {
                let sig = p256::ecdsa::Signature::from_slice(sig).map_err(|_| RelayError::BadSignature)?;
                // RustCrypto accepts either S form; reject the malleable one.
                if sig.normalize_s().is_some() {
                    return Err(RelayError::BadSignature);
                }
                key.verify(content, &sig).map_err(|_| RelayError::BadSignature)
            }
            PublicKey::K256(key) => {
                let sig = secp256k1::ecdsa::Signature::from_compact(sig).map_err(|_| RelayError::BadSignature)?;
                let mut normalized = sig;
                normalized.normalize_s();
                if normalized.serialize_compact() != sig.serialize_compact() {
                    return Err(RelayError::BadSignature);
                }
                let digest: [u8; 32] = Sha256::digest(content).into();
                let message = secp256k1::Message::from_digest(digest);
                SECP256K1.verify_ecdsa(&message, &sig, key).map_err(|_| RelayError::BadSignature)
            }
        }
    }

    /// Multibase string encoding: multicodec prefix + compressed point,
    /// base58btc with a `z` sentinel.
    pub fn multibase(&self) -> String {
        let prefix = match self {
            PublicKey::P256(_) => P256_MULTICODEC,
            PublicKey::K256(_) => K256_MULTICODEC,
        };
        let mut bytes = prefix.to_vec();
        bytes.extend_from_slice(&self.bytes());
        format!("z{}", bs58::encode(bytes).into_string())
    }

    /// `did:key` form of the public key.
    pub fn did_key(&self) -> String {
        format!("did:key:{}", self.multibase())
    }
}

/// Signing side. The relay only verifies; private keys exist for key tooling
/// and test fixtures.
#[derive(Clone, Debug)]
pub enum PrivateKey {
    P256(p256::ecdsa::SigningKey),
    K256(secp256k1::SecretKey),
}

impl PrivateKey {
    pub fn generate(algo: KeyAlgo) -> Self {
        match algo {
            KeyAlgo::P256 => PrivateKey::P256(p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng)),
            KeyAlgo::K256 => PrivateKey::K256(secp256k1::SecretKey::new(&mut rand::thread_rng())),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            PrivateKey::P256(key) => PublicKey::P256(*key.verifying_key()),
            PrivateKey::K256(key) => PublicKey::K256(key.public_key(SECP256K1)),
        }
    }

    /// Hashes with SHA-256 and signs the digest, returning 64 bytes `r || s`.
    /// Always emits low-S.
    pub fn hash_and_sign(&self, content: &[u8]) -> Vec<u8> {
        match self {
            PrivateKey::P256(key) => {
                let sig: p256::ecdsa::Signature = key.sign(content);
                let sig = sig.normalize_s().unwrap_or(sig);
                sig.to_bytes().to_vec()
            }
            PrivateKey::K256(key) => {
                let digest: [u8; 32] = Sha256::digest(content).into();
                let message = secp256k1::Message::from_digest(digest);
                SECP256K1.sign_ecdsa(&message, key).serialize_compact().to_vec()
            }
        }
    }
}
