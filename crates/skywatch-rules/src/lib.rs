//! # Skywatch Rules
//!
//! Declarative rule documents for the skywatch engine: loading, load-time
//! validation, the condition vocabulary and the named callback registry.
//!
//! A document has three top-level keys:
//!
//! ```yaml
//! config:
//!   kmls: [airfield.kml]
//! aircraft_lists:
//!   locals: [N12345, N555]
//! rules:
//!   local_landing:
//!     conditions:
//!       aircraft_list: locals
//!       transition: landing
//!     actions:
//!       print_csv: landing
//!       callback: notify
//! ```

pub mod actions;
pub mod callbacks;
pub mod conditions;
pub mod document;
pub mod error;
pub mod rules;

pub use actions::Action;
pub use callbacks::{
    Callback, CallbackError, CallbackKind, CallbackRegistry, CallbackResult, FlightHandler,
    PairHandler,
};
pub use conditions::{AircraftList, Condition, EvalContext, ProximityThresholds, RegionChange};
pub use document::{RuleDocument, Settings};
pub use error::{RulesError, RulesResult};
pub use rules::{Rule, RuleSet};
