//! Deterministic cache keys.
//!
//! A key is the blake3 digest of the operation identity plus a canonical
//! rendering of its parameters. Object keys are sorted at every nesting level
//! and the JSON is compact, so two requests with the same logical arguments
//! hash identically regardless of the order the arguments were supplied in.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Anything that identifies a cacheable operation call.
pub trait RequestKey {
    /// Name of the operation, e.g. `"schedule"`.
    fn operation(&self) -> &str;

    /// Canonical parameter encoding. Must be stable across runs and processes.
    fn canonical_params(&self) -> String;

    /// Optional scope mixed into the key, e.g. the data source.
    fn namespace(&self) -> Option<&str> {
        None
    }

    fn cache_key(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        if let Some(ns) = self.namespace() {
            hasher.update(ns.as_bytes());
            hasher.update(b"/");
        }
        hasher.update(self.operation().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.canonical_params().as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Typed request descriptor: an operation name plus named parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    operation: String,
    params: BTreeMap<String, Value>,
}

impl Request {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// Parameter rendered as plain text (strings unquoted).
    pub fn get_str(&self, name: &str) -> Option<String> {
        self.params.get(name).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }
}

impl RequestKey for Request {
    fn operation(&self) -> &str {
        &self.operation
    }

    fn canonical_params(&self) -> String {
        let mut out = String::new();
        out.push('{');
        for (i, (name, value)) in self.params.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_string(name, &mut out);
            out.push(':');
            write_canonical(value, &mut out);
        }
        out.push('}');
        out
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.operation, self.canonical_params())
    }
}

/// A request scoped to a particular data source.
#[derive(Debug, Clone, Copy)]
pub struct Scoped<'a> {
    pub scope: &'a str,
    pub request: &'a Request,
}

impl RequestKey for Scoped<'_> {
    fn operation(&self) -> &str {
        self.request.operation()
    }

    fn canonical_params(&self) -> String {
        self.request.canonical_params()
    }

    fn namespace(&self) -> Option<&str> {
        Some(self.scope)
    }
}

fn write_string(s: &str, out: &mut String) {
    // Value's Display is compact JSON with proper escaping
    out.push_str(&Value::String(s.to_string()).to_string());
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, inner)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(name, out);
                out.push(':');
                write_canonical(inner, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, inner) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(inner, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
