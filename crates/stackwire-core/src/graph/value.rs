//! Property values and the references they carry.
//!
//! A [`Value`] is either known when the definition is written (a literal or
//! a parameter reference) or only known once something else has been
//! provisioned (an attribute of a resource in the same group, or an output
//! published by another group). The composer walks these references to
//! build the dependency graph; the executor resolves them at apply time.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A plain literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Number(f64),
    String(String),
}

impl Scalar {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Scalar::Bool(b) => serde_json::Value::Bool(*b),
            Scalar::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Scalar::String(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Convert a resolved JSON value back into a scalar. Arrays, objects and
    /// null have no scalar form.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Scalar::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(Scalar::Number),
            serde_json::Value::String(s) => Some(Scalar::String(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Number(n) => write!(f, "{n}"),
            Scalar::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::String(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::String(s)
    }
}

impl From<f64> for Scalar {
    fn from(n: f64) -> Self {
        Scalar::Number(n)
    }
}

impl From<u32> for Scalar {
    fn from(n: u32) -> Self {
        Scalar::Number(f64::from(n))
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

/// A property value in a resource definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Literal(Scalar),
    /// Value of a declared deployment parameter
    ParameterRef(String),
    /// Runtime attribute of a resource in the same stack group
    DeferredAttribute { resource_id: String, attr: String },
    /// Output published by another stack group
    Output { group: String, name: String },
    /// String concatenation of the stringified parts
    Join(Vec<Value>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

/// A reference found inside a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference<'a> {
    Parameter(&'a str),
    Attribute { resource_id: &'a str, attr: &'a str },
    Output { group: &'a str, name: &'a str },
}

impl Value {
    pub fn lit(s: impl Into<Scalar>) -> Self {
        Value::Literal(s.into())
    }

    pub fn param(name: impl Into<String>) -> Self {
        Value::ParameterRef(name.into())
    }

    pub fn attr(resource_id: impl Into<String>, attr: impl Into<String>) -> Self {
        Value::DeferredAttribute {
            resource_id: resource_id.into(),
            attr: attr.into(),
        }
    }

    pub fn output(group: impl Into<String>, name: impl Into<String>) -> Self {
        Value::Output {
            group: group.into(),
            name: name.into(),
        }
    }

    pub fn join(parts: impl IntoIterator<Item = Value>) -> Self {
        Value::Join(parts.into_iter().collect())
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(items.into_iter().collect())
    }

    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Every reference reachable from this value, in traversal order.
    pub fn references(&self) -> Vec<Reference<'_>> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<Reference<'a>>) {
        match self {
            Value::Literal(_) => {}
            Value::ParameterRef(name) => out.push(Reference::Parameter(name)),
            Value::DeferredAttribute { resource_id, attr } => out.push(Reference::Attribute {
                resource_id,
                attr,
            }),
            Value::Output { group, name } => out.push(Reference::Output { group, name }),
            Value::Join(parts) | Value::List(parts) => {
                for part in parts {
                    part.collect_references(out);
                }
            }
            Value::Map(entries) => {
                for value in entries.values() {
                    value.collect_references(out);
                }
            }
        }
    }

    /// `true` when the value resolves to a single scalar.
    pub fn is_scalar_shaped(&self) -> bool {
        !matches!(self, Value::List(_) | Value::Map(_))
    }

    /// `true` when the value is the literal string `*`.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Value::Literal(Scalar::String(s)) if s == "*")
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::lit(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::lit(s)
    }
}

impl From<Scalar> for Value {
    fn from(s: Scalar) -> Self {
        Value::Literal(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::lit(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::lit(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::lit(b)
    }
}

impl<V: Into<Value>> From<Vec<V>> for Value {
    fn from(items: Vec<V>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}
