//! Runner configuration

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Runner configuration, read from the environment
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    /// Rule document (YAML, JSON or TOML)
    pub rules_path: PathBuf,
    /// JSON-lines report file; stdin when unset
    pub input: Option<PathBuf>,
    /// Record history and run a resampled proximity pass after ingestion
    pub resample: bool,
    /// Emit logs as JSON objects instead of text
    pub log_json: bool,
}

impl RunnerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let rules_path = lookup("SKYWATCH_RULES")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .context("SKYWATCH_RULES must name a rule document")?;

        let input = lookup("SKYWATCH_INPUT")
            .filter(|s| !s.trim().is_empty() && s != "-")
            .map(PathBuf::from);

        let resample = lookup("SKYWATCH_RESAMPLE").is_some_and(|s| flag(&s));
        let log_json = lookup("SKYWATCH_LOG_JSON").is_some_and(|s| flag(&s));

        Ok(Self {
            rules_path,
            input,
            resample,
            log_json,
        })
    }
}

fn flag(value: &str) -> bool {
    value == "true" || value == "1"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<RunnerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RunnerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_rules_path_required() {
        assert!(load(&[]).is_err());
        assert!(load(&[("SKYWATCH_RULES", " ")]).is_err());
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("SKYWATCH_RULES", "rules.yaml")]).unwrap();
        assert_eq!(config.rules_path, PathBuf::from("rules.yaml"));
        assert_eq!(config.input, None);
        assert!(!config.resample);
        assert!(!config.log_json);
    }

    #[test]
    fn test_flags_and_input() {
        let config = load(&[
            ("SKYWATCH_RULES", "rules.yaml"),
            ("SKYWATCH_INPUT", "reports.jsonl"),
            ("SKYWATCH_RESAMPLE", "1"),
            ("SKYWATCH_LOG_JSON", "true"),
        ])
        .unwrap();
        assert_eq!(config.input, Some(PathBuf::from("reports.jsonl")));
        assert!(config.resample);
        assert!(config.log_json);

        let stdin = load(&[("SKYWATCH_RULES", "r.yaml"), ("SKYWATCH_INPUT", "-")]).unwrap();
        assert_eq!(stdin.input, None);
    }
}
