//! Rule actions

use serde_json::Value;

use crate::conditions::value_kind;
use crate::error::{RulesError, RulesResult};

/// One step of a matched rule's action list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Invoke a registered callback with the matched flight (or pair)
    Callback(String),
    /// Emit a post-processing record with this label
    PrintCsv(String),
    /// Log the matched flight
    Print,
    /// Tag the flight
    Note(String),
    /// Invoke a registered callback when the flight expires
    ExpireCallback(String),
}

impl Action {
    /// Callback name this action refers to, if any
    pub fn callback_name(&self) -> Option<&str> {
        match self {
            Action::Callback(name) | Action::ExpireCallback(name) => Some(name),
            _ => None,
        }
    }
}

/// Parse an action list given either as a mapping or a list of mappings
pub(crate) fn parse_actions(rule: &str, value: Option<&Value>) -> RulesResult<Vec<Action>> {
    let mut actions = Vec::new();
    match value {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (key, v) in map {
                actions.extend(parse_action(rule, key, v)?);
            }
        }
        Some(Value::Array(items)) => {
            for item in items {
                let Value::Object(map) = item else {
                    return Err(RulesError::ActionsNotMapping {
                        rule: rule.to_string(),
                        found: value_kind(item),
                    });
                };
                for (key, v) in map {
                    actions.extend(parse_action(rule, key, v)?);
                }
            }
        }
        Some(other) => {
            return Err(RulesError::ActionsNotMapping {
                rule: rule.to_string(),
                found: value_kind(other),
            });
        }
    }
    Ok(actions)
}

fn parse_action(rule: &str, key: &str, value: &Value) -> RulesResult<Option<Action>> {
    let text = || -> RulesResult<String> {
        match value {
            Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            other => Err(RulesError::invalid_action(
                rule,
                key,
                format!("expected a non-empty string, found {}", value_kind(other)),
            )),
        }
    };

    let action = match key {
        "callback" => Action::Callback(text()?),
        "expire_callback" => Action::ExpireCallback(text()?),
        "note" => Action::Note(text()?),
        "print_csv" => match value {
            // bare `print_csv: true` labels records with the rule name
            Value::Bool(true) => Action::PrintCsv(rule.to_string()),
            _ => Action::PrintCsv(text()?),
        },
        "print" => match value {
            Value::Bool(true) => Action::Print,
            Value::Bool(false) => return Ok(None),
            other => {
                return Err(RulesError::invalid_action(
                    rule,
                    key,
                    format!("expected true or false, found {}", value_kind(other)),
                ));
            }
        },
        _ => {
            return Err(RulesError::UnknownAction {
                rule: rule.to_string(),
                key: key.to_string(),
            });
        }
    };
    Ok(Some(action))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mapping_keeps_document_order() {
        let actions = parse_actions(
            "r",
            Some(&json!({"note": "local", "print_csv": "landing", "callback": "cb"})),
        )
        .unwrap();
        assert_eq!(
            actions,
            vec![
                Action::Note("local".into()),
                Action::PrintCsv("landing".into()),
                Action::Callback("cb".into()),
            ]
        );
    }

    #[test]
    fn test_list_form_allows_repeats() {
        let actions = parse_actions(
            "r",
            Some(&json!([{"callback": "a"}, {"callback": "b"}, {"print": true}])),
        )
        .unwrap();
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[1].callback_name(), Some("b"));
        assert_eq!(actions[2], Action::Print);
    }

    #[test]
    fn test_print_csv_true_uses_rule_name() {
        let actions = parse_actions("takeoffs", Some(&json!({"print_csv": true}))).unwrap();
        assert_eq!(actions, vec![Action::PrintCsv("takeoffs".into())]);
    }

    #[test]
    fn test_invalid_actions() {
        assert!(matches!(
            parse_actions("r", Some(&json!({"email": "x"}))).unwrap_err(),
            RulesError::UnknownAction { key, .. } if key == "email"
        ));
        assert!(parse_actions("r", Some(&json!({"callback": ""}))).is_err());
        assert!(parse_actions("r", Some(&json!({"callback": 3}))).is_err());
        assert!(parse_actions("r", Some(&json!(["callback"]))).is_err());
        assert!(parse_actions("r", Some(&json!("callback"))).is_err());
    }

    #[test]
    fn test_missing_actions_is_empty() {
        assert!(parse_actions("r", None).unwrap().is_empty());
        assert!(parse_actions("r", Some(&json!({"print": false}))).unwrap().is_empty());
    }
}
