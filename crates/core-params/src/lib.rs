//! Typed key-value parameters for event sources and connections.
//!
//! Connection managers take their configuration as a string-keyed bag of
//! typed values. Each manager declares the keys it accepts in a declarative
//! restriction table; unknown keys, wrong types and wrong scalar/array forms
//! are rejected before any socket work happens.

use core_status::{UaError, UaResult};
use std::collections::BTreeMap;
use std::fmt;
use tracing::error;

/// A single typed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    UInt16(u16),
    UInt32(u32),
    Int32(i32),
    UInt64(u64),
    String(String),
    /// Array form of `String`. The TCP `address` key accepts this.
    StringArray(Vec<String>),
}

/// Discriminant used by restriction tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Bool,
    UInt16,
    UInt32,
    Int32,
    UInt64,
    String,
}

impl ParamValue {
    fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Bool(_) => ParamKind::Bool,
            ParamValue::UInt16(_) => ParamKind::UInt16,
            ParamValue::UInt32(_) => ParamKind::UInt32,
            ParamValue::Int32(_) => ParamKind::Int32,
            ParamValue::UInt64(_) => ParamKind::UInt64,
            ParamValue::String(_) | ParamValue::StringArray(_) => ParamKind::String,
        }
    }

    fn is_array(&self) -> bool {
        matches!(self, ParamValue::StringArray(_))
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::UInt16(v) => write!(f, "{v}"),
            ParamValue::UInt32(v) => write!(f, "{v}"),
            ParamValue::Int32(v) => write!(f, "{v}"),
            ParamValue::UInt64(v) => write!(f, "{v}"),
            ParamValue::String(v) => write!(f, "{v}"),
            ParamValue::StringArray(v) => write!(f, "{}", v.join(",")),
        }
    }
}

/// Ordered map of named parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamMap {
    entries: BTreeMap<String, ParamValue>,
}

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ParamValue) -> &mut Self {
        self.entries.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.entries.get(key) {
            Some(ParamValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u16(&self, key: &str) -> Option<u16> {
        match self.entries.get(key) {
            Some(ParamValue::UInt16(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        match self.entries.get(key) {
            Some(ParamValue::UInt32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        match self.entries.get(key) {
            Some(ParamValue::Int32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.entries.get(key) {
            Some(ParamValue::UInt64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(ParamValue::String(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Scalar string or every element of a string array.
    pub fn get_strings(&self, key: &str) -> Vec<&str> {
        match self.entries.get(key) {
            Some(ParamValue::String(v)) => vec![v.as_str()],
            Some(ParamValue::StringArray(v)) => v.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }
}

impl<K: Into<String>> FromIterator<(K, ParamValue)> for ParamMap {
    fn from_iter<I: IntoIterator<Item = (K, ParamValue)>>(iter: I) -> Self {
        let mut map = ParamMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// One accepted key of a parameter bag.
#[derive(Debug, Clone, Copy)]
pub struct Restriction {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub scalar_only: bool,
    pub array_only: bool,
}

impl Restriction {
    pub const fn scalar(name: &'static str, kind: ParamKind, required: bool) -> Self {
        Self {
            name,
            kind,
            required,
            scalar_only: true,
            array_only: false,
        }
    }

    /// Key that admits both scalar and array form.
    pub const fn scalar_or_array(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: false,
            scalar_only: false,
            array_only: false,
        }
    }
}

/// Validate `params` against the declared table. `module` is only used for
/// the error log.
pub fn validate(module: &str, restrictions: &[Restriction], params: &ParamMap) -> UaResult<()> {
    for r in restrictions {
        let Some(value) = params.get(r.name) else {
            if r.required {
                error!(target: "params", module, key = r.name, "required parameter missing");
                return Err(UaError::InvalidArgument);
            }
            continue;
        };
        if value.kind() != r.kind {
            error!(target: "params", module, key = r.name, "parameter has the wrong type");
            return Err(UaError::InvalidArgument);
        }
        if r.scalar_only && value.is_array() {
            error!(target: "params", module, key = r.name, "parameter must be a scalar");
            return Err(UaError::InvalidArgument);
        }
        if r.array_only && !value.is_array() {
            error!(target: "params", module, key = r.name, "parameter must be an array");
            return Err(UaError::InvalidArgument);
        }
    }

    // Reject keys the table does not declare.
    for (key, _) in params.iter() {
        if !restrictions.iter().any(|r| r.name == key) {
            error!(target: "params", module, key, "unknown parameter");
            return Err(UaError::InvalidArgument);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &[Restriction] = &[
        Restriction::scalar_or_array("address", ParamKind::String),
        Restriction::scalar("port", ParamKind::UInt16, true),
        Restriction::scalar("listen", ParamKind::Bool, false),
        Restriction::scalar("interface", ParamKind::String, false),
    ];

    fn base() -> ParamMap {
        let mut p = ParamMap::new();
        p.insert("port", ParamValue::UInt16(4840));
        p
    }

    #[test]
    fn accepts_minimal_map() {
        assert_eq!(validate("test", TABLE, &base()), Ok(()));
    }

    #[test]
    fn missing_required_key() {
        let p = ParamMap::new();
        assert_eq!(validate("test", TABLE, &p), Err(UaError::InvalidArgument));
    }

    #[test]
    fn wrong_type_rejected() {
        let mut p = base();
        p.insert("listen", ParamValue::UInt32(1));
        assert_eq!(validate("test", TABLE, &p), Err(UaError::InvalidArgument));
    }

    #[test]
    fn unknown_key_rejected() {
        let mut p = base();
        p.insert("bogus", ParamValue::Bool(true));
        assert_eq!(validate("test", TABLE, &p), Err(UaError::InvalidArgument));
    }

    #[test]
    fn scalar_only_rejects_array() {
        let mut p = base();
        p.insert(
            "interface",
            ParamValue::StringArray(vec!["a".into(), "b".into()]),
        );
        assert_eq!(validate("test", TABLE, &p), Err(UaError::InvalidArgument));
    }

    #[test]
    fn address_accepts_both_forms() {
        let mut p = base();
        p.insert("address", ParamValue::String("localhost".into()));
        assert_eq!(validate("test", TABLE, &p), Ok(()));
        p.insert(
            "address",
            ParamValue::StringArray(vec!["::1".into(), "127.0.0.1".into()]),
        );
        assert_eq!(validate("test", TABLE, &p), Ok(()));
        assert_eq!(p.get_strings("address"), vec!["::1", "127.0.0.1"]);
    }
}
