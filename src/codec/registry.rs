//! Per-type parser registry.
//!
//! A parser receives the base-decoded value of a cell (for array columns, each
//! non-NULL leaf) and returns the value handed to the caller.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::codec::date::parse_timestamp;
use crate::error::{Error, Result};
use crate::protocol::types::{Oid, oid};
use crate::value::Value;

/// A registered parser.
pub type Parser = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// Mapping from type OID to parser.
///
/// Cloning yields another handle to the same table, so a registry can be shared by
/// several connections and changed while they run. OIDs without an entry are passed
/// through unchanged.
#[derive(Clone)]
pub struct ParserRegistry {
    parsers: Arc<RwLock<HashMap<Oid, Parser>>>,
}

impl ParserRegistry {
    /// A registry with the built-in JSON and date parsers.
    pub fn new() -> Self {
        let registry = Self::empty();
        for type_oid in [oid::JSON, oid::JSON_ARRAY, oid::JSONB, oid::JSONB_ARRAY] {
            registry.register(type_oid, parse_json);
        }
        for type_oid in [
            oid::DATE,
            oid::DATE_ARRAY,
            oid::TIMESTAMP,
            oid::TIMESTAMP_ARRAY,
            oid::TIMESTAMPTZ,
            oid::TIMESTAMPTZ_ARRAY,
        ] {
            registry.register(type_oid, parse_date);
        }
        registry
    }

    /// A registry with no entries.
    pub fn empty() -> Self {
        Self {
            parsers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Install `parser` for `type_oid`, returning the entry it replaces.
    pub fn register<F>(&self, type_oid: Oid, parser: F) -> Option<Parser>
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.register_parser(type_oid, Arc::new(parser))
    }

    /// Install an already shared parser, e.g. one previously returned by `register`.
    pub fn register_parser(&self, type_oid: Oid, parser: Parser) -> Option<Parser> {
        self.parsers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(type_oid, parser)
    }

    /// Remove the entry for `type_oid`, returning it.
    pub fn unregister(&self, type_oid: Oid) -> Option<Parser> {
        self.parsers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&type_oid)
    }

    /// Current entry for `type_oid`.
    pub fn get(&self, type_oid: Oid) -> Option<Parser> {
        self.parsers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&type_oid)
            .cloned()
    }

    pub fn contains(&self, type_oid: Oid) -> bool {
        self.parsers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&type_oid)
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ParserRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.parsers.read().unwrap_or_else(PoisonError::into_inner);
        let mut oids: Vec<Oid> = guard.keys().copied().collect();
        oids.sort_unstable();
        f.debug_struct("ParserRegistry").field("oids", &oids).finish()
    }
}

/// Built-in parser for `json` / `jsonb` text.
pub fn parse_json(value: Value) -> Result<Value> {
    match value {
        Value::Text(text) => serde_json::from_str(&text)
            .map(Value::Json)
            .map_err(|e| Error::Decode(format!("invalid JSON: {e}"))),
        other => Ok(other),
    }
}

/// Built-in parser for `date`, `timestamp` and `timestamptz` text.
pub fn parse_date(value: Value) -> Result<Value> {
    match value {
        Value::Text(text) => parse_timestamp(&text).map(Value::Timestamp),
        other => Ok(other),
    }
}
