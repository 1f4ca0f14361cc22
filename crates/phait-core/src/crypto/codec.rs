//! **CipherCodec**: Stateless AEAD encrypt/decrypt for every persisted vault unit.
//!
//! ## Wire Format
//!
//! Each blob is stored as `[version:1][algorithm_id:1][nonce:12][tag:16][ciphertext]`.
//! The two header bytes are prepended to the caller's associated data, so flipping the
//! algorithm id or version fails authentication like any other tampering.
//!
//! The nonce is drawn from `OsRng` inside [`CipherCodec::encrypt`]; callers cannot supply one.
//! Decrypted plaintext comes back in a memory-locked [`LockedVec`].

use super::keys::MasterKey;
use crate::error::{PhaitError, PhaitResult};
use crate::secure_memory::LockedVec;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroize;

/// 96-bit nonce for both supported algorithms.
pub const NONCE_LEN: usize = 12;

/// 128-bit authentication tag.
pub const TAG_LEN: usize = 16;

const BLOB_VERSION: u8 = 1;

/// `[version][algorithm_id][nonce][tag]`
pub const BLOB_HEADER_LEN: usize = 2 + NONCE_LEN + TAG_LEN;

// Each call expands the master key into a cipher schedule; it must be wiped on drop.
const _: fn() = || {
    fn wiped_on_drop<T: zeroize::ZeroizeOnDrop>() {}
    wiped_on_drop::<aes::Aes256>();
};

/// Authenticated-encryption algorithms a blob may be sealed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl Algorithm {
    /// Self-describing id written into every blob header.
    pub fn id(&self) -> u8 {
        match self {
            Self::Aes256Gcm => 1,
            Self::ChaCha20Poly1305 => 2,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Aes256Gcm),
            2 => Some(Self::ChaCha20Poly1305),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Aes256Gcm => "AES-256-GCM",
            Self::ChaCha20Poly1305 => "ChaCha20-Poly1305",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = PhaitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('_', "-");
        match normalized.as_str() {
            "AES-256-GCM" | "AES256-GCM" | "AES256GCM" => Ok(Self::Aes256Gcm),
            "CHACHA20-POLY1305" | "CHACHA20POLY1305" => Ok(Self::ChaCha20Poly1305),
            _ => Err(PhaitError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

/// One sealed unit: immutable once written, decryptable on its own.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub algorithm: Algorithm,
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
    pub ciphertext: Vec<u8>,
}

impl fmt::Debug for EncryptedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedBlob")
            .field("algorithm", &self.algorithm)
            .field("nonce", &hex::encode(self.nonce))
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

impl EncryptedBlob {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOB_HEADER_LEN + self.ciphertext.len());
        out.push(BLOB_VERSION);
        out.push(self.algorithm.id());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse a stored blob. A malformed header is reported as an authentication failure:
    /// it can only come from corruption or tampering.
    pub fn from_bytes(bytes: &[u8]) -> PhaitResult<Self> {
        if bytes.len() < BLOB_HEADER_LEN {
            return Err(PhaitError::AuthenticationFailure(format!(
                "blob too short ({} bytes)",
                bytes.len()
            )));
        }
        if bytes[0] != BLOB_VERSION {
            return Err(PhaitError::AuthenticationFailure(format!(
                "unknown blob version {}",
                bytes[0]
            )));
        }
        let algorithm = Algorithm::from_id(bytes[1]).ok_or_else(|| {
            PhaitError::AuthenticationFailure(format!("unknown algorithm id {}", bytes[1]))
        })?;
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[2..2 + NONCE_LEN]);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&bytes[2 + NONCE_LEN..BLOB_HEADER_LEN]);
        Ok(Self {
            algorithm,
            nonce,
            tag,
            ciphertext: bytes[BLOB_HEADER_LEN..].to_vec(),
        })
    }

    fn bound_aad(algorithm: Algorithm, associated_data: &[u8]) -> Vec<u8> {
        let mut aad = Vec::with_capacity(2 + associated_data.len());
        aad.push(BLOB_VERSION);
        aad.push(algorithm.id());
        aad.extend_from_slice(associated_data);
        aad
    }
}

/// Stateless codec. `algorithm` only selects what new blobs are sealed with; decryption
/// always follows the blob's own algorithm id, so older blobs stay readable after a switch.
#[derive(Debug, Clone, Copy)]
pub struct CipherCodec {
    algorithm: Algorithm,
}

impl CipherCodec {
    pub fn new(algorithm: Algorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn encrypt(
        &self,
        key: &MasterKey,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> PhaitResult<EncryptedBlob> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let aad = EncryptedBlob::bound_aad(self.algorithm, associated_data);
        let mut buffer = plaintext.to_vec();

        let sealed = match self.algorithm {
            Algorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key.expose())
                .map_err(|e| PhaitError::Config(format!("key setup: {}", e)))?
                .encrypt_in_place_detached(aes_gcm::Nonce::from_slice(&nonce), &aad, &mut buffer),
            Algorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key.expose())
                .map_err(|e| PhaitError::Config(format!("key setup: {}", e)))?
                .encrypt_in_place_detached(
                    chacha20poly1305::Nonce::from_slice(&nonce),
                    &aad,
                    &mut buffer,
                ),
        };

        match sealed {
            Ok(tag_bytes) => {
                let mut tag = [0u8; TAG_LEN];
                tag.copy_from_slice(tag_bytes.as_slice());
                Ok(EncryptedBlob {
                    algorithm: self.algorithm,
                    nonce,
                    tag,
                    ciphertext: buffer,
                })
            }
            Err(e) => {
                buffer.zeroize();
                Err(PhaitError::Storage(format!("encrypt: {}", e)))
            }
        }
    }

    /// Returns the plaintext or `AuthenticationFailure`; never partial output.
    pub fn decrypt(
        &self,
        key: &MasterKey,
        blob: &EncryptedBlob,
        associated_data: &[u8],
    ) -> PhaitResult<LockedVec> {
        let aad = EncryptedBlob::bound_aad(blob.algorithm, associated_data);
        let mut buffer = blob.ciphertext.clone();

        let opened = match blob.algorithm {
            Algorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key.expose())
                .map_err(|e| PhaitError::Config(format!("key setup: {}", e)))?
                .decrypt_in_place_detached(
                    aes_gcm::Nonce::from_slice(&blob.nonce),
                    &aad,
                    &mut buffer,
                    aes_gcm::Tag::from_slice(&blob.tag),
                ),
            Algorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key.expose())
                .map_err(|e| PhaitError::Config(format!("key setup: {}", e)))?
                .decrypt_in_place_detached(
                    chacha20poly1305::Nonce::from_slice(&blob.nonce),
                    &aad,
                    &mut buffer,
                    chacha20poly1305::Tag::from_slice(&blob.tag),
                ),
        };

        match opened {
            Ok(()) => Ok(LockedVec::new(buffer)),
            Err(_) => {
                buffer.zeroize();
                Err(PhaitError::AuthenticationFailure(
                    "tag mismatch (wrong key, tampered or corrupted blob)".to_string(),
                ))
            }
        }
    }

    /// Parse raw stored bytes and decrypt them.
    pub fn open_bytes(
        &self,
        key: &MasterKey,
        stored: &[u8],
        associated_data: &[u8],
    ) -> PhaitResult<LockedVec> {
        let blob = EncryptedBlob::from_bytes(stored)?;
        self.decrypt(key, &blob, associated_data)
    }
}
