//! Prompt templates for SOS summaries and medication interaction checks.

pub mod interactions;
pub mod sos_summary;

pub use interactions::{interactions_prompt, INTERACTIONS_SYSTEM, INTERACTIONS_USER_TEMPLATE};
pub use sos_summary::{
    language_name, sos_summary_prompt, SOS_SUMMARY_SYSTEM, SOS_SUMMARY_USER_TEMPLATE,
};
