//! Converter job configuration: partial fragments and the effective config.
//!
//! A [`JobConfigFragment`] is what operators write: every field is optional
//! and a fragment may name a `parent` to inherit from. The
//! [`ConfigResolver`](super::ConfigResolver) folds a fragment's inheritance
//! chain onto the baseline default and produces an [`EffectiveJobConfig`] in
//! which nothing is missing.

use crate::error::PositionError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use ulid::Ulid;

/// Possibly-partial configuration node.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct JobConfigFragment {
    /// Fragment name, also used as the job name
    pub name: String,

    /// Marks fragments that only exist to be inherited from. Not inheritable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prototype: Option<bool>,

    /// Explicit job identity. Not inheritable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Ulid>,

    /// Name of the fragment to inherit from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    /// Start the job right after initialization
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_by_default: Option<bool>,

    pub debug: DebugFragment,
    pub converter_settings: ConverterSettingsFragment,
    pub rawdata_source: RawdataSourceFragment,
    pub target_storage: TargetStorageFragment,
    pub target_dataset: TargetDatasetFragment,

    /// Pseudonymization rules, evaluated first-match
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pseudo_rules: Option<Vec<PseudoRule>>,

    /// Converter specific settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converter_config: Option<BTreeMap<String, serde_json::Value>>,
}

impl JobConfigFragment {
    /// Create an empty fragment with a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Whether the fragment is a prototype.
    pub fn is_prototype(&self) -> bool {
        self.prototype.unwrap_or(false)
    }
}

/// Debug toggles and local capture settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DebugFragment {
    pub dryrun: Option<bool>,
    pub development_mode: Option<bool>,
    pub log_failed_rawdata: Option<bool>,
    pub log_skipped_rawdata: Option<bool>,
    pub log_all_rawdata: Option<bool>,
    pub log_all_converted: Option<bool>,
    pub store_failed_rawdata: Option<bool>,
    pub store_skipped_rawdata: Option<bool>,
    pub store_all_rawdata: Option<bool>,
    pub store_all_converted: Option<bool>,
    pub local_storage_path: Option<PathBuf>,
    #[serde(skip_serializing)]
    pub local_storage_password: Option<String>,
    /// Entry-name whitelist for raw captures
    pub included_rawdata_entries: Option<Vec<String>>,
}

/// Flush thresholds and message selection.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConverterSettingsFragment {
    pub max_records_before_flush: Option<u64>,
    pub max_seconds_before_flush: Option<u64>,
    pub max_records_total: Option<u64>,
    pub rawdata_samples: Option<u32>,
    /// Message ids that are dropped without conversion
    pub skipped_messages: Option<Vec<Ulid>>,
}

/// Reference to the source stream.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RawdataSourceFragment {
    pub name: Option<String>,
    pub topic: Option<String>,
    /// `FIRST`, `LAST` or a ulid
    pub initial_position: Option<String>,
}

/// Output dataset location.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TargetStorageFragment {
    pub root: Option<String>,
    pub path: Option<String>,
    pub version: Option<String>,
    pub sa_key_file: Option<PathBuf>,
}

/// Output dataset classification.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TargetDatasetFragment {
    pub valuation: Option<Valuation>,
    #[serde(rename = "type")]
    pub dataset_type: Option<DatasetType>,
    pub publish_metadata: Option<bool>,
}

/// Dataset sensitivity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Valuation {
    Sensitive,
    Shielded,
    Internal,
    Open,
}

/// Whether the source stream is finite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatasetType {
    /// Source exhaustion ends the job
    Bounded,
    /// Source exhaustion means waiting for more data
    Unbounded,
}

/// Declarative de-identification rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PseudoRule {
    pub name: String,
    pub pattern: String,
    pub func: String,
}

/// Symbolic starting point in a rawdata stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub enum InitialPosition {
    /// Start of the stream
    First,
    /// Right after the last record already in the target dataset
    Last,
    /// Right after an explicit message
    At(Ulid),
}

impl FromStr for InitialPosition {
    type Err = PositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("FIRST") {
            Ok(InitialPosition::First)
        } else if trimmed.eq_ignore_ascii_case("LAST") {
            Ok(InitialPosition::Last)
        } else {
            Ulid::from_string(trimmed)
                .map(InitialPosition::At)
                .map_err(|_| PositionError::InvalidPosition {
                    value: s.to_string(),
                })
        }
    }
}

impl fmt::Display for InitialPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitialPosition::First => f.write_str("FIRST"),
            InitialPosition::Last => f.write_str("LAST"),
            InitialPosition::At(ulid) => write!(f, "{}", ulid),
        }
    }
}

impl From<InitialPosition> for String {
    fn from(p: InitialPosition) -> Self {
        p.to_string()
    }
}

/// Fully merged, validated configuration for one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveJobConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Ulid>,
    pub active_by_default: bool,
    pub debug: DebugSettings,
    pub converter_settings: ConverterSettings,
    pub rawdata_source: RawdataSourceRef,
    pub target_storage: TargetStorage,
    pub target_dataset: TargetDataset,
    pub pseudo_rules: Vec<PseudoRule>,
    pub converter_config: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugSettings {
    pub dryrun: bool,
    pub development_mode: bool,
    pub log_failed_rawdata: bool,
    pub log_skipped_rawdata: bool,
    pub log_all_rawdata: bool,
    pub log_all_converted: bool,
    pub store_failed_rawdata: bool,
    pub store_skipped_rawdata: bool,
    pub store_all_rawdata: bool,
    pub store_all_converted: bool,
    pub local_storage_path: Option<PathBuf>,
    #[serde(skip_serializing)]
    pub local_storage_password: Option<String>,
    pub included_rawdata_entries: Vec<String>,
}

impl DebugSettings {
    /// Any raw content is logged in clear text.
    pub fn is_rawdata_logged(&self) -> bool {
        self.log_all_rawdata || self.log_failed_rawdata || self.log_skipped_rawdata
    }

    /// Any raw content is written to local storage.
    pub fn is_rawdata_stored(&self) -> bool {
        self.store_all_rawdata || self.store_failed_rawdata || self.store_skipped_rawdata
    }

    /// Any content at all is written to local storage.
    pub fn uses_local_storage(&self) -> bool {
        self.is_rawdata_stored() || self.store_all_converted
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConverterSettings {
    pub max_records_before_flush: u64,
    pub max_seconds_before_flush: u64,
    pub max_records_total: Option<u64>,
    pub rawdata_samples: u32,
    pub skipped_messages: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawdataSourceRef {
    pub name: String,
    pub topic: String,
    pub initial_position: InitialPosition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetStorage {
    pub root: String,
    pub path: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sa_key_file: Option<PathBuf>,
}

impl fmt::Display for TargetStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.root.trim_end_matches('/'),
            self.path.trim_matches('/'),
            self.version
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetDataset {
    pub valuation: Valuation,
    #[serde(rename = "type")]
    pub dataset_type: DatasetType,
    pub publish_metadata: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_position_parse() {
        assert_eq!("FIRST".parse::<InitialPosition>().unwrap(), InitialPosition::First);
        assert_eq!("last".parse::<InitialPosition>().unwrap(), InitialPosition::Last);

        let ulid = Ulid::new();
        assert_eq!(
            ulid.to_string().parse::<InitialPosition>().unwrap(),
            InitialPosition::At(ulid)
        );

        let err = "yesterday".parse::<InitialPosition>().unwrap_err();
        assert!(matches!(err, PositionError::InvalidPosition { value } if value == "yesterday"));
    }

    #[test]
    fn test_fragment_from_toml() {
        let toml_str = r#"
            name = "freg-base"
            prototype = true
            parent = "base"

            [debug]
            dryrun = true
            included_rawdata_entries = ["manifest.json"]

            [converter_settings]
            max_records_before_flush = 1000
            skipped_messages = ["01ARZ3NDEKTSV4RRFFQ69G5FAV"]

            [rawdata_source]
            name = "filesystem"
            initial_position = "FIRST"

            [target_dataset]
            valuation = "SENSITIVE"
            type = "UNBOUNDED"

            [[pseudo_rules]]
            name = "fnr"
            pattern = "**/fnr"
            func = "fpe-fnr(secret1)"

            [converter_config]
            entry = "payload"
        "#;

        let fragment: JobConfigFragment = toml::from_str(toml_str).unwrap();
        assert_eq!(fragment.name, "freg-base");
        assert!(fragment.is_prototype());
        assert_eq!(fragment.debug.dryrun, Some(true));
        assert_eq!(fragment.converter_settings.max_records_before_flush, Some(1000));
        assert_eq!(
            fragment.converter_settings.skipped_messages.as_ref().map(Vec::len),
            Some(1)
        );
        assert_eq!(fragment.target_dataset.valuation, Some(Valuation::Sensitive));
        assert_eq!(fragment.target_dataset.dataset_type, Some(DatasetType::Unbounded));
        assert_eq!(fragment.pseudo_rules.as_ref().map(Vec::len), Some(1));
        assert_eq!(
            fragment.converter_config.as_ref().and_then(|m| m.get("entry")),
            Some(&serde_json::json!("payload"))
        );
        assert!(fragment.target_storage.root.is_none());
    }

    #[test]
    fn test_password_is_never_serialized() {
        let mut fragment = JobConfigFragment::named("secret");
        fragment.debug.local_storage_password = Some("hunter2".into());
        let json = serde_json::to_string(&fragment).unwrap();
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn test_target_storage_display() {
        let storage = TargetStorage {
            root: "file:///data/".into(),
            path: "/kilde/freg/".into(),
            version: "1598553650000".into(),
            sa_key_file: None,
        };
        assert_eq!(storage.to_string(), "file:///data/kilde/freg/1598553650000");
    }
}
