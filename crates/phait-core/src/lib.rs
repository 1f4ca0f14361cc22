//! phait-core: encrypted personal health vault with bounded local-AI summaries.
//!
//! - [`crypto`]: key derivation ([`KeyManager`]) and authenticated encryption ([`CipherCodec`]).
//! - [`vault`]: encrypted records and attachments ([`VaultStore`]).
//! - [`backup`]: ciphertext-only snapshots ([`BackupManager`]).
//! - [`inference`]: deadline-bounded model calls ([`InferenceGateway`]).
//! - [`orchestrator`]: cached, per-language SOS summaries ([`SosOrchestrator`]).

mod app;
mod atomic_file;
pub mod backup;
pub mod config;
pub mod crypto;
mod error;
pub mod inference;
pub mod orchestrator;
pub mod prompts;
mod secure_memory;
pub mod vault;

pub use app::Phait;
pub use backup::{BackupEntry, BackupManager, BackupManifest, BackupSnapshot, EntryKind};
pub use config::{Operation, PhaitConfig};
pub use crypto::{
    Algorithm, CipherCodec, EncryptedBlob, KeyFingerprint, KeyManager, KeyParams, MasterKey,
};
pub use error::{PhaitError, PhaitResult};
pub use inference::{
    InferenceGateway, InferenceModel, InferenceOutput, PlaceholderModel, RunContext,
};
pub use orchestrator::{
    InteractionFlag, InteractionSeverity, ResponseOrigin, SosArtifact, SosOrchestrator,
    SosResponse, SosState,
};
pub use secure_memory::LockedVec;
pub use vault::{
    AttachmentId, ChangeKind, Record, RecordChange, RecordFilter, RecordId, VaultStore,
    MEDICATION_RECORD_TYPE,
};
