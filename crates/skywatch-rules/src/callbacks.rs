//! Named callback registry
//!
//! Rule documents refer to handlers by name. Handlers are registered before
//! the document is compiled so every name is resolved, and its arity checked,
//! at load time.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use skywatch_core::Flight;
use thiserror::Error;

use crate::error::{RulesError, RulesResult};

/// Failure reported by a user callback
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CallbackError(pub String);

impl CallbackError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub type CallbackResult = Result<(), CallbackError>;

pub type FlightHandler = Arc<dyn Fn(&Flight) -> CallbackResult + Send + Sync>;
pub type PairHandler = Arc<dyn Fn(&Flight, &Flight) -> CallbackResult + Send + Sync>;

/// Whether a callback takes one flight or a proximity pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Flight,
    Pair,
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackKind::Flight => write!(f, "single-flight"),
            CallbackKind::Pair => write!(f, "pair"),
        }
    }
}

/// A registered handler
#[derive(Clone)]
pub enum Callback {
    Flight(FlightHandler),
    Pair(PairHandler),
}

impl Callback {
    pub fn flight<F>(handler: F) -> Self
    where
        F: Fn(&Flight) -> CallbackResult + Send + Sync + 'static,
    {
        Self::Flight(Arc::new(handler))
    }

    pub fn pair<F>(handler: F) -> Self
    where
        F: Fn(&Flight, &Flight) -> CallbackResult + Send + Sync + 'static,
    {
        Self::Pair(Arc::new(handler))
    }

    pub fn kind(&self) -> CallbackKind {
        match self {
            Callback::Flight(_) => CallbackKind::Flight,
            Callback::Pair(_) => CallbackKind::Pair,
        }
    }

    pub fn invoke_flight(&self, flight: &Flight) -> CallbackResult {
        match self {
            Callback::Flight(handler) => handler(flight),
            Callback::Pair(_) => Err(CallbackError::new("pair callback invoked with one flight")),
        }
    }

    pub fn invoke_pair(&self, a: &Flight, b: &Flight) -> CallbackResult {
        match self {
            Callback::Pair(handler) => handler(a, b),
            Callback::Flight(_) => {
                Err(CallbackError::new("single-flight callback invoked with a pair"))
            }
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback::{:?}", self.kind())
    }
}

/// Name → handler table
#[derive(Debug, Clone, Default)]
pub struct CallbackRegistry {
    handlers: HashMap<String, Callback>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler; a name that is already bound is an error
    pub fn register(&mut self, name: impl Into<String>, callback: Callback) -> RulesResult<()> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(RulesError::DuplicateCallback(name));
        }
        self.handlers.insert(name, callback);
        Ok(())
    }

    /// Bind a handler, returning the one it displaced
    pub fn replace(&mut self, name: impl Into<String>, callback: Callback) -> Option<Callback> {
        self.handlers.insert(name.into(), callback)
    }

    pub fn get(&self, name: &str) -> Option<&Callback> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
