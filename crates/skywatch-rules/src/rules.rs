//! Compiled rules
//!
//! [`RuleSet::compile`] turns a [`RuleDocument`] into immutable rules. Every
//! configuration problem, including callback names with no registered
//! handler, is reported here so a running engine never meets one.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use skywatch_core::{Flight, RegionResolver};
use tracing::{debug, info};

use crate::actions::{Action, parse_actions};
use crate::callbacks::{CallbackKind, CallbackRegistry};
use crate::conditions::{
    AircraftList, Condition, EvalContext, ProximityThresholds, parse_conditions,
};
use crate::document::RuleDocument;
use crate::error::{RulesError, RulesResult};

// ============================================================================
// RULE
// ============================================================================

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    /// Conjunction, evaluated in document order
    pub conditions: Vec<Condition>,
    /// Present on pairwise rules
    pub proximity: Option<ProximityThresholds>,
    pub actions: Vec<Action>,
}

impl Rule {
    pub fn is_unconditional(&self) -> bool {
        self.conditions.is_empty() && self.proximity.is_none()
    }

    pub fn is_pairwise(&self) -> bool {
        self.proximity.is_some()
    }

    pub fn has_cooldown(&self) -> bool {
        self.conditions.iter().any(Condition::is_cooldown)
    }

    /// All conditions hold; stops at the first that fails
    pub fn matches(&self, ctx: &EvalContext<'_>) -> bool {
        self.conditions.iter().all(|c| c.matches(ctx))
    }

    /// Position-only check used where there is no report history
    pub fn matches_stateless(&self, flight: &Flight) -> bool {
        let ctx = EvalContext::new(flight);
        self.conditions
            .iter()
            .filter(|c| c.is_stateless())
            .all(|c| c.matches(&ctx))
    }

    /// Names of `callback` actions
    pub fn callbacks(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().filter_map(|a| match a {
            Action::Callback(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

// ============================================================================
// RULE SET
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
    aircraft_lists: BTreeMap<String, Arc<AircraftList>>,
}

impl RuleSet {
    /// Validate a document against the registered callbacks and loaded regions
    pub fn compile(
        doc: &RuleDocument,
        callbacks: &CallbackRegistry,
        resolver: &RegionResolver,
    ) -> RulesResult<Self> {
        let aircraft_lists: BTreeMap<String, Arc<AircraftList>> = doc
            .aircraft_lists
            .iter()
            .map(|(name, members)| {
                let list = AircraftList::new(name.clone(), members);
                (name.clone(), Arc::new(list))
            })
            .collect();

        let mut rules = Vec::with_capacity(doc.rules.len());
        for (name, body) in &doc.rules {
            let rule = compile_rule(name, body, &aircraft_lists, callbacks, resolver)?;
            debug!(
                rule = %name,
                conditions = rule.conditions.len(),
                actions = rule.actions.len(),
                pairwise = rule.is_pairwise(),
                "Compiled rule"
            );
            rules.push(rule);
        }

        info!(
            rules = rules.len(),
            aircraft_lists = aircraft_lists.len(),
            regions = resolver.len(),
            "Rule set ready"
        );

        Ok(Self {
            rules,
            aircraft_lists,
        })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn get(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn single_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| !r.is_pairwise())
    }

    pub fn pairwise_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.is_pairwise())
    }

    pub fn has_pairwise_rules(&self) -> bool {
        self.rules.iter().any(Rule::is_pairwise)
    }

    pub fn aircraft_list(&self, name: &str) -> Option<&Arc<AircraftList>> {
        self.aircraft_lists.get(name)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn compile_rule(
    name: &str,
    body: &Value,
    lists: &BTreeMap<String, Arc<AircraftList>>,
    callbacks: &CallbackRegistry,
    resolver: &RegionResolver,
) -> RulesResult<Rule> {
    let Value::Object(body) = body else {
        return Err(RulesError::MissingConditions {
            rule: name.to_string(),
        });
    };

    let parsed = parse_conditions(name, body.get("conditions"), lists, resolver)?;
    let actions = parse_actions(name, body.get("actions"))?;
    let rule = Rule {
        name: name.to_string(),
        conditions: parsed.conditions,
        proximity: parsed.proximity,
        actions,
    };

    for action in &rule.actions {
        let (callback, expected) = match action {
            Action::Callback(cb) if rule.is_pairwise() => (cb, CallbackKind::Pair),
            Action::Callback(cb) | Action::ExpireCallback(cb) => (cb, CallbackKind::Flight),
            _ => continue,
        };
        let registered = callbacks
            .get(callback)
            .ok_or_else(|| RulesError::UnknownCallback {
                rule: name.to_string(),
                name: callback.clone(),
            })?;
        if registered.kind() != expected {
            return Err(RulesError::CallbackKindMismatch {
                rule: name.to_string(),
                name: callback.clone(),
                expected,
            });
        }
    }

    Ok(rule)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::Callback;
    use skywatch_core::{Altitude, PositionReport};
    use std::collections::BTreeSet;

    fn registry() -> CallbackRegistry {
        let mut registry = CallbackRegistry::new();
        registry.register("log", Callback::flight(|_| Ok(()))).unwrap();
        registry
            .register("pair_log", Callback::pair(|_, _| Ok(())))
            .unwrap();
        registry
    }

    fn compile(yaml: &str) -> RulesResult<RuleSet> {
        let doc = RuleDocument::from_yaml_str(yaml)?;
        RuleSet::compile(&doc, &registry(), &RegionResolver::empty())
    }

    #[test]
    fn test_compile_rules_in_document_order() {
        let rules = compile(
            r#"
aircraft_lists:
  locals: [N12345]
rules:
  zeta:
    conditions: {}
    actions:
      callback: log
  alpha:
    conditions:
      aircraft_list: locals
      min_alt: 1000
    actions:
      - print_csv: locals
      - callback: log
"#,
        )
        .unwrap();

        let names: Vec<_> = rules.rules().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
        assert!(rules.get("zeta").unwrap().is_unconditional());
        assert_eq!(rules.get("alpha").unwrap().conditions.len(), 2);
        assert_eq!(rules.aircraft_list("locals").map(|l| l.len()), Some(1));
    }

    #[test]
    fn test_empty_condition_list_fails_load() {
        let err = RuleSet::compile(
            &RuleDocument::from_json_str(
                r#"{"rules": {"bad": {"conditions": [], "actions": {"callback": "log"}}}}"#,
            )
            .unwrap(),
            &registry(),
            &RegionResolver::empty(),
        )
        .unwrap_err();
        assert!(matches!(err, RulesError::ConditionsNotMapping { rule, .. } if rule == "bad"));
    }

    #[test]
    fn test_unknown_callback_fails_load() {
        let err = compile(
            r#"
rules:
  r:
    conditions: {}
    actions:
      callback: missing
"#,
        )
        .unwrap_err();
        assert!(matches!(err, RulesError::UnknownCallback { name, .. } if name == "missing"));
    }

    #[test]
    fn test_callback_kind_checked() {
        let err = compile(
            r#"
rules:
  close:
    conditions:
      proximity: [400, 0.5]
    actions:
      callback: log
"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RulesError::CallbackKindMismatch { expected: CallbackKind::Pair, .. }
        ));

        let err = compile(
            r#"
rules:
  single:
    conditions: {}
    actions:
      expire_callback: pair_log
"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RulesError::CallbackKindMismatch { expected: CallbackKind::Flight, .. }
        ));
    }

    #[test]
    fn test_regions_without_kml_fails_load() {
        let err = compile(
            r#"
rules:
  r:
    conditions:
      regions: [Field]
    actions:
      print: true
"#,
        )
        .unwrap_err();
        assert!(matches!(err, RulesError::UnknownRegion { .. }));
    }

    #[test]
    fn test_pairwise_split_and_stateless_match() {
        let rules = compile(
            r#"
rules:
  close:
    conditions:
      min_alt: 500
      changed_regions: any
      proximity: [400, 0.5]
    actions:
      callback: pair_log
  single:
    conditions: {}
    actions:
      callback: log
"#,
        )
        .unwrap();

        assert!(rules.has_pairwise_rules());
        assert_eq!(rules.pairwise_rules().count(), 1);
        assert_eq!(rules.single_rules().count(), 1);

        let close = rules.get("close").unwrap();
        let report = PositionReport::new(0, "abc123", 40.0, -105.0, Altitude::Feet(3000));
        let flight = Flight::new(&report, BTreeSet::new());

        // changed_regions is skipped, min_alt still applies
        assert!(close.matches_stateless(&flight));
        assert!(!close.matches(&EvalContext::new(&flight)));
        assert_eq!(close.callbacks().collect::<Vec<_>>(), vec!["pair_log"]);
    }
}
