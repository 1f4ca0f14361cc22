//! SOS summary: a short emergency synopsis of the user's medical history, written for a
//! first responder who has seconds to read it.

/// Instruction block for the summary model.
pub const SOS_SUMMARY_SYSTEM: &str = r#"You write emergency medical summaries for first responders.

Rules:
- Write in {language_name}
- At most 8 short lines
- Lead with life-threatening allergies, then active conditions, then current medications
- Include blood type, implants and emergency contacts when present
- Use only facts from the records below; never guess or add advice
- Plain text only, no markdown"#;

/// Record block template. `{records}` is one `- type: fields` line per record.
pub const SOS_SUMMARY_USER_TEMPLATE: &str = r#"Medical records:
---
{records}
---

Emergency summary:"#;

/// Full prompt for one language. `records` is the pre-rendered bullet block.
pub fn sos_summary_prompt(language_name: &str, records: &str) -> String {
    let system = SOS_SUMMARY_SYSTEM.replace("{language_name}", language_name);
    let user = SOS_SUMMARY_USER_TEMPLATE.replace("{records}", records);
    format!("{}\n\n{}", system, user)
}

/// Display name used inside prompts; unknown codes pass through unchanged.
pub fn language_name(code: &str) -> &str {
    match code {
        "en" => "English",
        "es" => "Spanish",
        "fr" => "French",
        "de" => "German",
        "zh" => "Simplified Chinese",
        other => other,
    }
}
