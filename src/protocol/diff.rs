//! Shallow partial updates over the shared state document
//!
//! A [`Diff`] names zero or more top-level keys; applying it replaces each
//! named key wholesale. Nothing below the top level is merged, and keys the
//! diff does not mention are left alone.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{json_kind, Result, SessionError};

/// State document: string keys to arbitrary JSON values
pub type State = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Diff(State);

impl Diff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style single key insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Build a diff from any value that serializes to a JSON object
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Self::try_from(serde_json::to_value(value)?)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn as_map(&self) -> &State {
        &self.0
    }

    pub fn into_map(self) -> State {
        self.0
    }

    /// Replace each named key in `target`
    pub fn apply_to(&self, target: &mut State) {
        for (key, value) in &self.0 {
            target.insert(key.clone(), value.clone());
        }
    }

    /// Entries of `defaults` whose keys are absent from `current`
    pub fn missing_keys(defaults: &State, current: &State) -> Self {
        defaults
            .iter()
            .filter(|(key, _)| !current.contains_key(key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

impl From<State> for Diff {
    fn from(map: State) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Diff {
    type Error = SessionError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(SessionError::NotAnObject(json_kind(&other))),
        }
    }
}

impl From<Diff> for Value {
    fn from(diff: Diff) -> Self {
        Value::Object(diff.0)
    }
}

impl FromIterator<(String, Value)> for Diff {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Diff {
    type Item = (String, Value);
    type IntoIter = serde_json::map::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
