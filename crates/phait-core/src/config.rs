//! PHAIT configuration: on-disk layout, crypto parameters, per-operation timeout budgets,
//! and the supported SOS summary languages.
//!
//! A `PhaitConfig` value is passed explicitly when a vault is opened. There is no
//! process-wide default instance, so several vaults can coexist in one process.
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | base_dir | ~/.phait | Root of `data/`, `backups/`, `attachments/`, `models/`. |
//! | encryption_algorithm | AES-256-GCM | Algorithm for new writes (`AES-256-GCM` or `ChaCha20-Poly1305`). |
//! | key_derivation_iterations | 100000 | PBKDF2 cost for newly created vaults. |
//! | sos_generation_timeout_seconds | 5 | Fetch + inference budget for a first summary. |
//! | sos_regeneration_timeout_seconds | 10 | Budget when replacing a stale summary. |
//! | search_timeout_seconds | 2 | Record search budget. |
//! | export_timeout_seconds | 30 | Named backup export budget. |
//! | interaction_check_timeout_seconds | 5 | Medication interaction check budget. |
//! | supported_languages | en, es, fr, de, zh | Languages an SOS summary may be requested in. |

use crate::atomic_file;
use crate::crypto::Algorithm;
use crate::error::{PhaitError, PhaitResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "phait.toml";
const ENV_CONFIG_PATH: &str = "PHAIT_CONFIG";
const ENV_PREFIX: &str = "PHAIT";

fn default_base_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".phait")
}

fn default_algorithm() -> String {
    "AES-256-GCM".to_string()
}

fn default_iterations() -> u32 {
    100_000
}

fn default_sos_generation() -> f64 {
    5.0
}

fn default_sos_regeneration() -> f64 {
    10.0
}

fn default_search() -> f64 {
    2.0
}

fn default_export() -> f64 {
    30.0
}

fn default_interaction_check() -> f64 {
    5.0
}

fn default_languages() -> Vec<String> {
    ["en", "es", "fr", "de", "zh"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Operations that run under a timeout budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    SosGeneration,
    SosRegeneration,
    Search,
    Export,
    InteractionCheck,
}

impl Operation {
    pub fn label(&self) -> &'static str {
        match self {
            Self::SosGeneration => "sos generation",
            Self::SosRegeneration => "sos regeneration",
            Self::Search => "search",
            Self::Export => "export",
            Self::InteractionCheck => "interaction check",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaitConfig {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default = "default_algorithm")]
    pub encryption_algorithm: String,
    #[serde(default = "default_iterations")]
    pub key_derivation_iterations: u32,
    #[serde(default = "default_sos_generation")]
    pub sos_generation_timeout_seconds: f64,
    #[serde(default = "default_sos_regeneration")]
    pub sos_regeneration_timeout_seconds: f64,
    #[serde(default = "default_search")]
    pub search_timeout_seconds: f64,
    #[serde(default = "default_export")]
    pub export_timeout_seconds: f64,
    #[serde(default = "default_interaction_check")]
    pub interaction_check_timeout_seconds: f64,
    #[serde(default = "default_languages")]
    pub supported_languages: Vec<String>,
}

impl Default for PhaitConfig {
    fn default() -> Self {
        Self::with_base_dir(default_base_dir())
    }
}

impl PhaitConfig {
    /// Defaults rooted at `base_dir`.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            encryption_algorithm: default_algorithm(),
            key_derivation_iterations: default_iterations(),
            sos_generation_timeout_seconds: default_sos_generation(),
            sos_regeneration_timeout_seconds: default_sos_regeneration(),
            search_timeout_seconds: default_search(),
            export_timeout_seconds: default_export(),
            interaction_check_timeout_seconds: default_interaction_check(),
            supported_languages: default_languages(),
        }
    }

    /// Load from defaults, then a TOML file, then `PHAIT__*` environment variables.
    /// File precedence: env `PHAIT_CONFIG` path > `~/.phait/phait.toml` > none.
    pub fn load() -> PhaitResult<Self> {
        let _ = dotenvy::dotenv();
        let path = std::env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_base_dir().join(CONFIG_FILE_NAME));
        Self::load_from_path(&path)
    }

    /// Same layering as [`PhaitConfig::load`] with an explicit file path (missing file is fine).
    pub fn load_from_path(path: &Path) -> PhaitResult<Self> {
        let defaults = Self::default();
        let builder = config::Config::builder()
            .set_default("base_dir", defaults.base_dir.to_string_lossy().to_string())?
            .set_default("encryption_algorithm", defaults.encryption_algorithm)?
            .set_default(
                "key_derivation_iterations",
                i64::from(defaults.key_derivation_iterations),
            )?
            .set_default(
                "sos_generation_timeout_seconds",
                defaults.sos_generation_timeout_seconds,
            )?
            .set_default(
                "sos_regeneration_timeout_seconds",
                defaults.sos_regeneration_timeout_seconds,
            )?
            .set_default("search_timeout_seconds", defaults.search_timeout_seconds)?
            .set_default("export_timeout_seconds", defaults.export_timeout_seconds)?
            .set_default(
                "interaction_check_timeout_seconds",
                defaults.interaction_check_timeout_seconds,
            )?
            .set_default("supported_languages", defaults.supported_languages)?;

        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("supported_languages")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Self = built.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save_to_path(&self, path: &Path) -> PhaitResult<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| PhaitError::Config(e.to_string()))?;
        atomic_file::write_atomic(path, content.as_bytes())
    }

    /// Reject values that would make the vault unusable or unsafe.
    pub fn validate(&self) -> PhaitResult<()> {
        self.algorithm()?;
        if self.key_derivation_iterations == 0 {
            return Err(PhaitError::Config(
                "key_derivation_iterations must be at least 1".into(),
            ));
        }
        for op in [
            Operation::SosGeneration,
            Operation::SosRegeneration,
            Operation::Search,
            Operation::Export,
            Operation::InteractionCheck,
        ] {
            let secs = self.budget_seconds(op);
            if !secs.is_finite() || secs <= 0.0 {
                return Err(PhaitError::Config(format!(
                    "{} timeout must be a positive number of seconds (got {})",
                    op.label(),
                    secs
                )));
            }
        }
        if self.supported_languages.is_empty() {
            return Err(PhaitError::Config(
                "supported_languages must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// The configured algorithm for new writes.
    pub fn algorithm(&self) -> PhaitResult<Algorithm> {
        self.encryption_algorithm.parse()
    }

    fn budget_seconds(&self, op: Operation) -> f64 {
        match op {
            Operation::SosGeneration => self.sos_generation_timeout_seconds,
            Operation::SosRegeneration => self.sos_regeneration_timeout_seconds,
            Operation::Search => self.search_timeout_seconds,
            Operation::Export => self.export_timeout_seconds,
            Operation::InteractionCheck => self.interaction_check_timeout_seconds,
        }
    }

    /// Wall-clock allowance for `op`.
    pub fn budget(&self, op: Operation) -> Duration {
        Duration::try_from_secs_f64(self.budget_seconds(op)).unwrap_or(Duration::ZERO)
    }

    pub fn supports_language(&self, language: &str) -> bool {
        self.supported_languages.iter().any(|l| l == language)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join("data")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.base_dir.join("backups")
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.base_dir.join("attachments")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.base_dir.join("models")
    }

    /// Sled database directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("medical_vault.db")
    }

    /// Persisted key-derivation parameters (salt, iterations, verifier). Never the key itself.
    pub fn key_path(&self) -> PathBuf {
        self.data_dir().join("master.key")
    }

    pub fn ai_model_path(&self) -> PathBuf {
        self.models_dir().join("model.gguf")
    }

    pub fn attachment_path(&self, attachment_id: &str) -> PathBuf {
        self.attachments_dir().join(format!("{}.enc", attachment_id))
    }

    pub fn backup_path(&self, backup_name: &str) -> PathBuf {
        self.backup_dir().join(backup_name)
    }

    /// Create every directory of the layout.
    pub fn ensure_directories(&self) -> PhaitResult<()> {
        for dir in [
            self.base_dir.clone(),
            self.data_dir(),
            self.backup_dir(),
            self.attachments_dir(),
            self.models_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = PhaitConfig::with_base_dir("/tmp/phait-test");
        assert_eq!(cfg.encryption_algorithm, "AES-256-GCM");
        assert_eq!(cfg.key_derivation_iterations, 100_000);
        assert_eq!(cfg.budget(Operation::SosGeneration), Duration::from_secs(5));
        assert_eq!(cfg.budget(Operation::SosRegeneration), Duration::from_secs(10));
        assert_eq!(cfg.budget(Operation::Search), Duration::from_secs(2));
        assert_eq!(cfg.budget(Operation::Export), Duration::from_secs(30));
        assert_eq!(cfg.supported_languages, vec!["en", "es", "fr", "de", "zh"]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn layout_paths() {
        let cfg = PhaitConfig::with_base_dir("/vault");
        assert_eq!(cfg.key_path(), PathBuf::from("/vault/data/master.key"));
        assert_eq!(
            cfg.attachment_path("abc"),
            PathBuf::from("/vault/attachments/abc.enc")
        );
        assert_eq!(
            cfg.backup_path("weekly.phb"),
            PathBuf::from("/vault/backups/weekly.phb")
        );
        assert_eq!(cfg.ai_model_path(), PathBuf::from("/vault/models/model.gguf"));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = PhaitConfig::with_base_dir("/vault");
        cfg.encryption_algorithm = "ROT13".into();
        assert!(matches!(
            cfg.validate(),
            Err(PhaitError::UnsupportedAlgorithm(_))
        ));

        let mut cfg = PhaitConfig::with_base_dir("/vault");
        cfg.search_timeout_seconds = 0.0;
        assert!(matches!(cfg.validate(), Err(PhaitError::Config(_))));

        let mut cfg = PhaitConfig::with_base_dir("/vault");
        cfg.supported_languages.clear();
        assert!(matches!(cfg.validate(), Err(PhaitError::Config(_))));
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("phait.toml");
        let mut cfg = PhaitConfig::with_base_dir(dir.path());
        cfg.key_derivation_iterations = 2_000;
        cfg.search_timeout_seconds = 0.5;
        cfg.supported_languages = vec!["en".into(), "de".into()];
        cfg.save_to_path(&path).unwrap();

        let loaded = PhaitConfig::load_from_path(&path).unwrap();
        assert_eq!(loaded.base_dir, dir.path());
        assert_eq!(loaded.key_derivation_iterations, 2_000);
        assert_eq!(loaded.budget(Operation::Search), Duration::from_millis(500));
        assert!(loaded.supports_language("de"));
        assert!(!loaded.supports_language("zh"));
    }

    #[test]
    fn save_replaces_existing_file_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("phait.toml");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "key_derivation_iterations = \"trunc").unwrap();

        let mut cfg = PhaitConfig::with_base_dir(dir.path());
        cfg.key_derivation_iterations = 3_000;
        cfg.save_to_path(&path).unwrap();

        assert_eq!(
            PhaitConfig::load_from_path(&path).unwrap().key_derivation_iterations,
            3_000
        );
        let entries: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn ensure_directories_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PhaitConfig::with_base_dir(dir.path().join("phait"));
        cfg.ensure_directories().unwrap();
        assert!(cfg.data_dir().is_dir());
        assert!(cfg.backup_dir().is_dir());
        assert!(cfg.attachments_dir().is_dir());
        assert!(cfg.models_dir().is_dir());
    }
}
