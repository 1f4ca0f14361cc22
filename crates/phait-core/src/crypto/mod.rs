//! Key derivation and authenticated encryption for the vault.

mod codec;
mod keys;

pub use codec::{Algorithm, CipherCodec, EncryptedBlob, BLOB_HEADER_LEN, NONCE_LEN, TAG_LEN};
pub use keys::{KeyFingerprint, KeyManager, KeyParams, MasterKey, KEY_LEN};
