//! Medication interaction check over the user's current medication list.

pub const INTERACTIONS_SYSTEM: &str = r#"You are a clinical pharmacology assistant.
Given a list of medications, report every pair with a known interaction.

Rules:
- One interaction per line, formatted exactly: first | second | severity | note
- severity is one of: minor, moderate, major
- note is a single short sentence
- If there are no known interactions, reply with: NONE"#;

/// `{medications}` is one `- name dose` line per medication.
pub const INTERACTIONS_USER_TEMPLATE: &str = r#"Medications:
---
{medications}
---

Interactions:"#;

pub fn interactions_prompt(medications: &str) -> String {
    format!(
        "{}\n\n{}",
        INTERACTIONS_SYSTEM,
        INTERACTIONS_USER_TEMPLATE.replace("{medications}", medications)
    )
}
