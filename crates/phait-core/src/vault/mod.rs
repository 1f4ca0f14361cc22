//! Encrypted medical vault: records, attachments and change events.

mod record;
mod store;

pub use record::{
    AttachmentId, ChangeKind, Record, RecordChange, RecordFilter, RecordId,
    MEDICATION_RECORD_TYPE,
};
pub use store::{RecordIds, VaultStore};

pub(crate) use store::WriteGate;
