//! String-keyed metadata bag attached to audio and decoders.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    String(String),
    Number(i64),
    Float(f64),
    Bool(bool),
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{}", n),
            Self::Float(v) => write!(f, "{}", v),
            Self::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Ordered property bag. Keys are case-sensitive; unknown keys are carried
/// along untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    values: BTreeMap<String, PropertyValue>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: PropertyValue) {
        self.values.insert(key.into(), value);
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.set(key, PropertyValue::String(value.into()));
    }

    pub fn set_number(&mut self, key: impl Into<String>, value: i64) {
        self.set(key, PropertyValue::Number(value));
    }

    pub fn set_float(&mut self, key: impl Into<String>, value: f64) {
        self.set(key, PropertyValue::Float(value));
    }

    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.set(key, PropertyValue::Bool(value));
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.values.remove(key)
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        match self.values.get(key)? {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer lookup; strings holding a decimal integer are accepted since
    /// tag metadata (e.g. `LOOPSTART`) usually arrives as text.
    pub fn number(&self, key: &str) -> Option<i64> {
        match self.values.get(key)? {
            PropertyValue::Number(n) => Some(*n),
            PropertyValue::Float(v) => Some(*v as i64),
            PropertyValue::String(s) => s.trim().parse().ok(),
            PropertyValue::Bool(_) => None,
        }
    }

    pub fn float(&self, key: &str) -> Option<f64> {
        match self.values.get(key)? {
            PropertyValue::Float(v) => Some(*v),
            PropertyValue::Number(n) => Some(*n as f64),
            PropertyValue::String(s) => s.trim().parse().ok(),
            PropertyValue::Bool(_) => None,
        }
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key)? {
            PropertyValue::Bool(b) => Some(*b),
            PropertyValue::Number(n) => Some(*n != 0),
            _ => None,
        }
    }

    /// Copies every entry of `other` into `self`, overwriting on conflict.
    pub fn extend(&mut self, other: Properties) {
        self.values.extend(other.values);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}
