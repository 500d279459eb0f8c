//! Rule document loading
//!
//! The document is read with the `config` crate so YAML, JSON and TOML files
//! all work; the format is picked from the file extension. Condition and
//! action bodies stay as raw JSON values until [`crate::RuleSet::compile`]
//! validates them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::RulesResult;

// ============================================================================
// SETTINGS
// ============================================================================

/// The document's `config` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Geofence files
    pub kmls: Vec<PathBuf>,
    /// Inactivity window after which a flight is expired
    pub flight_expire_secs: i64,
    /// Data-time cadence of expiry during ingestion
    pub expire_interval_secs: i64,
    /// Quiet period after which a proximity encounter is retired
    pub proximity_grace_secs: i64,
    /// Max age difference between two positions compared live
    pub proximity_time_window_secs: i64,
    /// Run pair callbacks on a background worker
    pub async_dispatch: bool,
    /// Wall-clock period of the background sweeper
    pub sweep_interval_ms: u64,
    /// Record per-aircraft history for the resampled pass
    pub resample: bool,
    pub resample_interval_secs: i64,
    pub resample_max_gap_secs: i64,
    pub replay_url_base: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            kmls: Vec::new(),
            flight_expire_secs: 300,
            expire_interval_secs: 60,
            proximity_grace_secs: 60,
            proximity_time_window_secs: 10,
            async_dispatch: false,
            sweep_interval_ms: 1000,
            resample: false,
            resample_interval_secs: 1,
            resample_max_gap_secs: 60,
            replay_url_base: "https://globe.adsbexchange.com/".to_string(),
        }
    }
}

// ============================================================================
// DOCUMENT
// ============================================================================

/// A rule document as written, before validation
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleDocument {
    #[serde(default)]
    pub config: Settings,
    #[serde(default)]
    pub aircraft_lists: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub rules: Map<String, Value>,
    /// Directory of the file the document came from
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

impl RuleDocument {
    /// Load a document from disk, choosing the format by extension
    pub fn from_path(path: impl AsRef<Path>) -> RulesResult<Self> {
        let path = path.as_ref();
        let mut doc: RuleDocument = Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;
        doc.base_dir = path.parent().map(Path::to_path_buf);

        debug!(
            path = %path.display(),
            rules = doc.rules.len(),
            lists = doc.aircraft_lists.len(),
            "Loaded rule document"
        );
        Ok(doc)
    }

    pub fn from_yaml_str(text: &str) -> RulesResult<Self> {
        Self::from_str_with_format(text, FileFormat::Yaml)
    }

    pub fn from_json_str(text: &str) -> RulesResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    fn from_str_with_format(text: &str, format: FileFormat) -> RulesResult<Self> {
        Ok(Config::builder()
            .add_source(File::from_str(text, format))
            .build()?
            .try_deserialize()?)
    }

    /// Geofence paths, with relative ones resolved against the document's directory
    pub fn kml_paths(&self) -> Vec<PathBuf> {
        self.config
            .kmls
            .iter()
            .map(|p| match &self.base_dir {
                Some(base) if p.is_relative() => base.join(p),
                _ => p.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DOC: &str = r#"
config:
  kmls:
    - airfield.kml
  flight_expire_secs: 120
aircraft_lists:
  locals: [N12345, N555]
rules:
  everything:
    conditions: {}
    actions:
      callback: log
  high:
    conditions:
      min_alt: 4000
      max_alt: 10000
    actions:
      print_csv: high
"#;

    #[test]
    fn test_yaml_document_with_defaults() {
        let doc = RuleDocument::from_yaml_str(DOC).unwrap();

        assert_eq!(doc.config.kmls, vec![PathBuf::from("airfield.kml")]);
        assert_eq!(doc.config.flight_expire_secs, 120);
        assert_eq!(doc.config.proximity_grace_secs, 60);
        assert!(!doc.config.async_dispatch);
        assert_eq!(doc.aircraft_lists["locals"], vec!["N12345", "N555"]);

        let names: Vec<_> = doc.rules.keys().cloned().collect();
        assert_eq!(names, vec!["everything", "high"]);
        assert_eq!(doc.rules["high"]["conditions"]["min_alt"], 4000);
    }

    #[test]
    fn test_condition_order_preserved() {
        let doc = RuleDocument::from_yaml_str(DOC).unwrap();
        let keys: Vec<_> = doc.rules["high"]["conditions"]
            .as_object()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        assert_eq!(keys, vec!["min_alt", "max_alt"]);
    }

    #[test]
    fn test_json_document() {
        let doc = RuleDocument::from_json_str(
            r#"{"rules": {"all": {"conditions": {}, "actions": {"print": true}}}}"#,
        )
        .unwrap();
        assert_eq!(doc.config, Settings::default());
        assert!(doc.rules.contains_key("all"));
    }

    #[test]
    fn test_file_paths_resolve_against_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(DOC.as_bytes()).unwrap();

        let doc = RuleDocument::from_path(&path).unwrap();
        assert_eq!(doc.kml_paths(), vec![dir.path().join("airfield.kml")]);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(RuleDocument::from_path("/nonexistent/rules.yaml").is_err());
    }
}
