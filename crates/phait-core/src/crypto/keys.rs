//! **KeyManager**: Derives the vault master key from the user secret and owns it until close.
//!
//! ## Key Derivation
//!
//! PBKDF2-HMAC-SHA256 over the secret with a random 16-byte salt. The iteration count and
//! salt are persisted in `data/master.key` together with a *verifier* (a fixed string sealed
//! under the derived key). Opening checks the secret against the verifier, so a wrong secret
//! is rejected with `InvalidSecret` before any record is touched.
//!
//! The stored iteration count wins over the configured one: raising the configured cost only
//! affects vaults created afterwards, and existing vaults keep opening.
//!
//! The key lives in a memory-locked heap buffer ([`LockedKey`]) and is zeroed on `close()`
//! and on drop, on every exit path.

use super::codec::{Algorithm, CipherCodec, EncryptedBlob};
use crate::atomic_file;
use crate::config::PhaitConfig;
use crate::error::{PhaitError, PhaitResult};
use crate::secure_memory::LockedKey;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// Master key length (256 bits).
pub const KEY_LEN: usize = 32;

const SALT_LEN: usize = 16;
const PARAMS_VERSION: u32 = 1;
const KDF_NAME: &str = "PBKDF2-HMAC-SHA256";
const VERIFIER_PLAINTEXT: &[u8] = b"phait:vault-key-check:v1";
const VERIFIER_AAD: &[u8] = b"phait:verifier";

/// The derived vault key. Not `Clone`, not serializable; `Debug` is redacted.
pub struct MasterKey(LockedKey<KEY_LEN>);

impl MasterKey {
    /// Derive a key from `secret` with PBKDF2-HMAC-SHA256.
    pub fn derive(secret: &[u8], salt: &[u8], iterations: u32) -> Self {
        let mut out = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(secret, salt, iterations, &mut out);
        Self::from_bytes(&mut out)
    }

    /// Wraps raw key bytes; the source array is wiped.
    pub(crate) fn from_bytes(bytes: &mut [u8; KEY_LEN]) -> Self {
        Self(LockedKey::new(bytes))
    }

    #[inline]
    pub(crate) fn expose(&self) -> &[u8; KEY_LEN] {
        self.0.expose()
    }

    pub fn is_memory_locked(&self) -> bool {
        self.0.is_memory_locked()
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// Non-secret identity of a vault key (hash of salt, cost and KDF). Two snapshots with the
/// same fingerprint were sealed under the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyFingerprint(pub String);

impl fmt::Display for KeyFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key-derivation parameters persisted alongside the vault. Contains no secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyParams {
    pub version: u32,
    pub kdf: String,
    pub iterations: u32,
    /// Hex-encoded salt.
    pub salt: String,
    /// Algorithm the verifier was sealed with (the vault's creation algorithm).
    pub algorithm: String,
    /// Base64 of the sealed verifier blob.
    pub verifier: String,
    pub created_at: DateTime<Utc>,
}

impl KeyParams {
    pub fn load(path: &Path) -> PhaitResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        let params: KeyParams = serde_json::from_slice(&bytes)?;
        Ok(Some(params))
    }

    pub fn save(&self, path: &Path) -> PhaitResult<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        atomic_file::write_atomic(path, &bytes)
    }

    fn salt_bytes(&self) -> PhaitResult<Vec<u8>> {
        hex::decode(&self.salt)
            .map_err(|e| PhaitError::Serialization(format!("key params salt: {}", e)))
    }

    fn verifier_blob(&self) -> PhaitResult<EncryptedBlob> {
        let bytes = B64
            .decode(&self.verifier)
            .map_err(|e| PhaitError::Serialization(format!("key params verifier: {}", e)))?;
        EncryptedBlob::from_bytes(&bytes)
    }

    pub fn fingerprint(&self) -> KeyFingerprint {
        let mut hasher = Sha256::new();
        hasher.update(b"phait:key-fingerprint");
        hasher.update(self.kdf.as_bytes());
        hasher.update(self.iterations.to_be_bytes());
        hasher.update(self.salt.as_bytes());
        KeyFingerprint(hex::encode(&hasher.finalize()[..16]))
    }
}

/// Owns the master key for the lifetime of an open vault.
pub struct KeyManager {
    key: Option<MasterKey>,
    params: KeyParams,
}

impl KeyManager {
    /// Open the vault key: create parameters on first use, otherwise verify `secret`
    /// against the stored verifier.
    pub fn open(config: &PhaitConfig, secret: &str) -> PhaitResult<Self> {
        if secret.is_empty() {
            return Err(PhaitError::InvalidSecret);
        }
        let path = config.key_path();
        match KeyParams::load(&path)? {
            Some(params) => Self::unlock(params, secret),
            None => {
                let manager = Self::create(config, secret)?;
                manager.params.save(&path)?;
                tracing::info!(
                    target: "phait::keys",
                    iterations = manager.params.iterations,
                    algorithm = %manager.params.algorithm,
                    "created new vault key parameters"
                );
                Ok(manager)
            }
        }
    }

    /// Fresh parameters and key (not persisted).
    pub fn create(config: &PhaitConfig, secret: &str) -> PhaitResult<Self> {
        if secret.is_empty() {
            return Err(PhaitError::InvalidSecret);
        }
        let algorithm = config.algorithm()?;
        let iterations = config.key_derivation_iterations;
        if iterations == 0 {
            return Err(PhaitError::Config(
                "key_derivation_iterations must be at least 1".into(),
            ));
        }
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);

        let key = MasterKey::derive(secret.as_bytes(), &salt, iterations);
        let verifier = CipherCodec::new(algorithm).encrypt(&key, VERIFIER_PLAINTEXT, VERIFIER_AAD)?;
        let params = KeyParams {
            version: PARAMS_VERSION,
            kdf: KDF_NAME.to_string(),
            iterations,
            salt: hex::encode(salt),
            algorithm: algorithm.name().to_string(),
            verifier: B64.encode(verifier.to_bytes()),
            created_at: Utc::now(),
        };
        Ok(Self {
            key: Some(key),
            params,
        })
    }

    /// Derive with the stored parameters and check the verifier.
    pub fn unlock(params: KeyParams, secret: &str) -> PhaitResult<Self> {
        if secret.is_empty() {
            return Err(PhaitError::InvalidSecret);
        }
        if params.kdf != KDF_NAME {
            return Err(PhaitError::Config(format!("unknown key derivation: {}", params.kdf)));
        }
        if params.iterations == 0 {
            return Err(PhaitError::Config("stored iteration count is zero".into()));
        }
        let salt = params.salt_bytes()?;
        let verifier = params.verifier_blob()?;

        let key = MasterKey::derive(secret.as_bytes(), &salt, params.iterations);
        let codec = CipherCodec::new(verifier.algorithm);
        let check = codec
            .decrypt(&key, &verifier, VERIFIER_AAD)
            .map_err(|_| PhaitError::InvalidSecret)?;
        if check.as_slice() != VERIFIER_PLAINTEXT {
            return Err(PhaitError::InvalidSecret);
        }
        if !key.is_memory_locked() {
            tracing::warn!(target: "phait::keys", "master key could not be memory-locked");
        }
        tracing::info!(
            target: "phait::keys",
            iterations = params.iterations,
            "🔐 vault key unlocked"
        );
        Ok(Self {
            key: Some(key),
            params,
        })
    }

    /// Borrow the key for one codec call.
    pub fn key(&self) -> PhaitResult<&MasterKey> {
        self.key.as_ref().ok_or(PhaitError::Locked)
    }

    pub fn is_open(&self) -> bool {
        self.key.is_some()
    }

    pub fn params(&self) -> &KeyParams {
        &self.params
    }

    pub fn fingerprint(&self) -> KeyFingerprint {
        self.params.fingerprint()
    }

    /// Wipe the key. Further `key()` calls return `Locked`.
    pub fn close(&mut self) {
        if self.key.take().is_some() {
            tracing::info!(target: "phait::keys", "🔒 vault key released");
        }
    }
}

impl Drop for KeyManager {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("open", &self.is_open())
            .field("iterations", &self.params.iterations)
            .finish()
    }
}
