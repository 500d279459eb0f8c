//! Rule loading and validation errors
//!
//! Every variant is raised while a rule document is compiled, never while
//! reports are being evaluated.

use thiserror::Error;

use crate::callbacks::CallbackKind;

#[derive(Error, Debug)]
pub enum RulesError {
    #[error("Failed to load rule document: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Failed to parse rule document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Rule '{rule}' has no conditions; use an empty mapping for an unconditional rule")]
    MissingConditions { rule: String },

    #[error("Rule '{rule}': conditions must be a mapping, found {found}")]
    ConditionsNotMapping { rule: String, found: &'static str },

    #[error("Rule '{rule}': unknown condition '{key}'")]
    UnknownCondition { rule: String, key: String },

    #[error("Rule '{rule}': invalid value for condition '{key}': {reason}")]
    InvalidCondition {
        rule: String,
        key: String,
        reason: String,
    },

    #[error("Rule '{rule}': unknown aircraft list '{list}'")]
    UnknownAircraftList { rule: String, list: String },

    #[error("Rule '{rule}': region '{region}' is not defined in any loaded KML")]
    UnknownRegion { rule: String, region: String },

    #[error("Rule '{rule}': actions must be a mapping or a list of mappings, found {found}")]
    ActionsNotMapping { rule: String, found: &'static str },

    #[error("Rule '{rule}': unknown action '{key}'")]
    UnknownAction { rule: String, key: String },

    #[error("Rule '{rule}': invalid value for action '{key}': {reason}")]
    InvalidAction {
        rule: String,
        key: String,
        reason: String,
    },

    #[error("Rule '{rule}': no callback registered under '{name}'")]
    UnknownCallback { rule: String, name: String },

    #[error("Rule '{rule}': callback '{name}' must be a {expected} callback")]
    CallbackKindMismatch {
        rule: String,
        name: String,
        expected: CallbackKind,
    },

    #[error("Callback already registered: {0}")]
    DuplicateCallback(String),
}

impl RulesError {
    pub fn invalid_condition(
        rule: impl Into<String>,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidCondition {
            rule: rule.into(),
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_action(
        rule: impl Into<String>,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidAction {
            rule: rule.into(),
            key: key.into(),
            reason: reason.into(),
        }
    }
}

pub type RulesResult<T> = Result<T, RulesError>;
