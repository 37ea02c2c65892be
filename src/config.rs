//! Workspace configuration (`mem-os.json`) and schema migration.
//!
//! Every recognized key of the config surface is modeled; unknown keys are
//! captured in a side map and preserved verbatim on rewrite, so older and
//! newer tools can share a workspace. [`ensure_schema_version`] upgrades the
//! on-disk file between schema versions idempotently, one step at a time,
//! writing each stage atomically via replace-on-rename.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::{errors::MemError, governance::mode::GovernanceMode, utils::atomic_write};

/// Current schema version written by this crate.
pub const SCHEMA_VERSION: &str = "2.1.0";

/// Retrieval backend selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecallBackend {
    #[default]
    Bm25,
    Vector,
}

/// Vector backend coordinates; unused unless `recall.backend = "vector"`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VectorConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// `recall.*` keys.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RecallConfig {
    #[serde(default)]
    pub backend: RecallBackend,
    #[serde(default)]
    pub vector: VectorConfig,
}

/// `proposal_budget.*` keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalBudget {
    pub per_run: u32,
    pub per_day: u32,
    pub backlog_limit: u32,
}

impl Default for ProposalBudget {
    fn default() -> Self {
        Self {
            per_run: 5,
            per_day: 20,
            backlog_limit: 50,
        }
    }
}

/// `compaction.*` retention windows, in days.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    pub archive_days: u32,
    pub snapshot_days: u32,
    pub log_days: u32,
    pub signal_days: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            archive_days: 90,
            snapshot_days: 30,
            log_days: 365,
            signal_days: 30,
        }
    }
}

/// `abstention.*` keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbstentionConfig {
    pub threshold: f64,
}

impl Default for AbstentionConfig {
    fn default() -> Self {
        Self { threshold: 0.20 }
    }
}

/// The `mem-os.json` model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemOsConfig {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
    #[serde(default)]
    pub governance_mode: GovernanceMode,
    #[serde(default = "default_true")]
    pub auto_capture: bool,
    #[serde(default = "default_true")]
    pub auto_recall: bool,
    #[serde(default)]
    pub recall: RecallConfig,
    #[serde(default)]
    pub proposal_budget: ProposalBudget,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub abstention: AbstentionConfig,
    /// Days without inbound references before a decision counts as dead.
    #[serde(default = "default_dead_threshold_days")]
    pub dead_threshold_days: u32,
    /// Cooldown before a deferred `(target, action)` may be re-proposed.
    #[serde(default = "default_defer_cooldown_days")]
    pub defer_cooldown_days: u32,
    /// Unrecognized keys, preserved verbatim on rewrite.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

fn default_dead_threshold_days() -> u32 {
    45
}

fn default_defer_cooldown_days() -> u32 {
    7
}

impl Default for MemOsConfig {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION.to_string(),
            workspace_path: None,
            governance_mode: GovernanceMode::default(),
            auto_capture: true,
            auto_recall: true,
            recall: RecallConfig::default(),
            proposal_budget: ProposalBudget::default(),
            compaction: CompactionConfig::default(),
            abstention: AbstentionConfig::default(),
            dead_threshold_days: default_dead_threshold_days(),
            defer_cooldown_days: default_defer_cooldown_days(),
            extra: Map::new(),
        }
    }
}

impl MemOsConfig {
    /// Load `mem-os.json`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, MemError> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| MemError::InvalidConfig(path.to_path_buf(), err.to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Persist atomically, preserving unknown keys.
    pub fn save(&self, path: &Path) -> Result<(), MemError> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        atomic_write(path, &bytes)
    }
}

/// One schema upgrade step `v_i → v_{i+1}`.
struct Upgrade {
    /// Versions this step upgrades from (major.minor prefix match).
    from_prefix: &'static str,
    to: &'static str,
    apply: fn(&mut Map<String, Value>),
}

/// Registered upgrade chain, oldest first.
const UPGRADES: &[Upgrade] = &[
    Upgrade {
        from_prefix: "1.",
        to: "2.0.0",
        apply: upgrade_v1_to_v2,
    },
    Upgrade {
        from_prefix: "2.0",
        to: "2.1.0",
        apply: upgrade_v20_to_v21,
    },
];

/// v1 kept a flat `recall_backend` key; v2 nests it under `recall.backend`.
fn upgrade_v1_to_v2(root: &mut Map<String, Value>) {
    if let Some(backend) = root.remove("recall_backend") {
        let recall = root
            .entry("recall".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(recall) = recall {
            recall.entry("backend".to_string()).or_insert(backend);
        }
    }
}

/// v2.1 renames `self_correcting_mode` to the canonical `governance_mode`.
/// The old key is consumed as migration input and physically removed.
fn upgrade_v20_to_v21(root: &mut Map<String, Value>) {
    if let Some(mode) = root.remove("self_correcting_mode") {
        root.entry("governance_mode".to_string()).or_insert(mode);
    }
}

/// Idempotently bring `mem-os.json` under `workspace_root` up to
/// [`SCHEMA_VERSION`]. A missing config is written fresh at the current
/// version. Returns `true` when the file was rewritten.
pub fn ensure_schema_version(workspace_root: &Path) -> Result<bool, MemError> {
    let path = workspace_root.join("mem-os.json");
    let mut root: Map<String, Value> = match fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|err| MemError::InvalidConfig(path.clone(), err.to_string()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            MemOsConfig::default().save(&path)?;
            return Ok(true);
        }
        Err(err) => return Err(err.into()),
    };

    let mut version = root
        .get("version")
        .and_then(Value::as_str)
        .unwrap_or("1.0.0")
        .to_string();
    if version == SCHEMA_VERSION {
        return Ok(false);
    }

    let mut applied = false;
    for upgrade in UPGRADES {
        if version.starts_with(upgrade.from_prefix) {
            info!(from = %version, to = upgrade.to, "migrating mem-os.json schema");
            (upgrade.apply)(&mut root);
            version = upgrade.to.to_string();
            root.insert("version".to_string(), Value::String(version.clone()));
            applied = true;
        }
    }

    if version != SCHEMA_VERSION {
        return Err(MemError::UnsupportedSchemaVersion(version));
    }
    if applied {
        // Each stage rewrites atomically; the rename is the commit point.
        let mut bytes = serde_json::to_vec_pretty(&Value::Object(root))?;
        bytes.push(b'\n');
        atomic_write(&path, &bytes)?;
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MemOsConfig::default();
        assert_eq!(config.version, SCHEMA_VERSION);
        assert_eq!(config.governance_mode, GovernanceMode::DetectOnly);
        assert_eq!(config.proposal_budget.per_run, 5);
        assert!((config.abstention.threshold - 0.20).abs() < f64::EPSILON);
        assert_eq!(config.recall.backend, RecallBackend::Bm25);
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mem-os.json");
        fs::write(
            &path,
            br#"{"version": "2.1.0", "governance_mode": "propose", "experimental_flag": {"nested": true}}"#,
        )
        .unwrap();

        let config = MemOsConfig::load(&path).unwrap();
        assert_eq!(config.governance_mode, GovernanceMode::Propose);
        assert!(config.extra.contains_key("experimental_flag"));

        config.save(&path).unwrap();
        let raw: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["experimental_flag"]["nested"], Value::Bool(true));
    }

    #[test]
    fn test_migration_renames_self_correcting_mode() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mem-os.json");
        fs::write(
            &path,
            br#"{"version": "2.0.3", "self_correcting_mode": "propose", "auto_capture": false}"#,
        )
        .unwrap();

        assert!(ensure_schema_version(dir.path()).unwrap());

        let config = MemOsConfig::load(&path).unwrap();
        assert_eq!(config.version, SCHEMA_VERSION);
        assert_eq!(config.governance_mode, GovernanceMode::Propose);
        assert!(!config.auto_capture);

        let raw: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert!(raw.get("self_correcting_mode").is_none());
    }

    #[test]
    fn test_migration_chains_from_v1() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mem-os.json");
        fs::write(
            &path,
            br#"{"version": "1.4.0", "recall_backend": "bm25", "self_correcting_mode": "enforce"}"#,
        )
        .unwrap();

        assert!(ensure_schema_version(dir.path()).unwrap());
        let config = MemOsConfig::load(&path).unwrap();
        assert_eq!(config.version, SCHEMA_VERSION);
        assert_eq!(config.recall.backend, RecallBackend::Bm25);
        assert_eq!(config.governance_mode, GovernanceMode::Enforce);
    }

    #[test]
    fn test_migration_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mem-os.json");
        fs::write(
            &path,
            br#"{"version": "2.0.0", "self_correcting_mode": "propose"}"#,
        )
        .unwrap();

        assert!(ensure_schema_version(dir.path()).unwrap());
        let first = fs::read(&path).unwrap();
        assert!(!ensure_schema_version(dir.path()).unwrap());
        let second = fs::read(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_config_written_fresh() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(ensure_schema_version(dir.path()).unwrap());
        let config = MemOsConfig::load(&dir.path().join("mem-os.json")).unwrap();
        assert_eq!(config.version, SCHEMA_VERSION);
    }

    #[test]
    fn test_future_version_refused() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mem-os.json");
        fs::write(&path, br#"{"version": "9.0.0"}"#).unwrap();
        assert!(matches!(
            ensure_schema_version(dir.path()),
            Err(MemError::UnsupportedSchemaVersion(_))
        ));
    }
}
