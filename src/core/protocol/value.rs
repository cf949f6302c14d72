// src/core/protocol/value.rs

//! A simplified value type used at the command/scheduler layer, independent of
//! how it is eventually encoded onto the wire.

use std::collections::BTreeSet;

/// `Value` is the internal representation of an argument or a reply field.
///
/// It deliberately supports only primitive and composite types — integers,
/// booleans, strings, lists, and sets — so that the wire codec never needs to
/// instantiate anything beyond plain data.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Str(String),
    List(Vec<Value>),
    Set(BTreeSet<String>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Interprets this value as a comma-normalized list of lowercase strings,
    /// accepting either a `Str` (split on `,`) or a `List`/`Set` of strings.
    pub fn as_string_list(&self) -> Option<Vec<String>> {
        match self {
            Value::Str(s) => Some(
                s.split(',')
                    .map(|p| p.trim().to_lowercase())
                    .filter(|p| !p.is_empty())
                    .collect(),
            ),
            Value::List(items) => items
                .iter()
                .map(|v| v.as_str().map(|s| s.to_lowercase()))
                .collect(),
            Value::Set(items) => Some(items.iter().map(|s| s.to_lowercase()).collect()),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}
