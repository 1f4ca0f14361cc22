//! Medication interaction flags parsed from model output.

use crate::vault::Record;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionSeverity {
    Minor,
    Moderate,
    Major,
    Unknown,
}

impl InteractionSeverity {
    fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "minor" | "low" => Self::Minor,
            "moderate" | "medium" => Self::Moderate,
            "major" | "severe" | "high" => Self::Major,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionFlag {
    pub first: String,
    pub second: String,
    pub severity: InteractionSeverity,
    pub note: String,
}

/// One `- name dose` line per medication record.
pub(crate) fn render_medications(records: &[Record]) -> String {
    records
        .iter()
        .map(|r| {
            let field = |k: &str| r.fields.get(k).and_then(|v| v.as_str()).unwrap_or("");
            let name = field("name");
            let label = if name.is_empty() {
                r.searchable_text()
            } else {
                format!("{} {}", name, field("dose")).trim_end().to_string()
            };
            format!("- {}", label)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse `first | second | severity | note` lines. Anything else (including `NONE`) is
/// ignored.
pub(crate) fn parse_interactions(text: &str) -> Vec<InteractionFlag> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim().trim_start_matches("- ");
            let parts: Vec<&str> = line.splitn(4, '|').map(str::trim).collect();
            if parts.len() != 4 || parts[0].is_empty() || parts[1].is_empty() {
                return None;
            }
            Some(InteractionFlag {
                first: parts[0].to_string(),
                second: parts[1].to_string(),
                severity: InteractionSeverity::parse(parts[2]),
                note: parts[3].to_string(),
            })
        })
        .collect()
}
