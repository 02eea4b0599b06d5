//! Reference values: identity-tagged wrappers that survive serialization
//!
//! A [`RefValue`] boxes one value together with a key, so a receiver can tell
//! "the same logical value sent again" apart from "a different value that
//! happens to be structurally equal". On the wire it is
//! `{ "k": key, "v": value, "__isRef": true }`.
//!
//! Boxing is idempotent: [`make_auto_ref`] and [`make_auto_ref_value`] hand an
//! already-boxed value back untouched, keeping its original key. Nothing tracks
//! issued keys; a key lives exactly as long as the value carrying it.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::protocol::is_truthy;

/// Wire field names
pub const KEY_FIELD: &str = "k";
pub const VALUE_FIELD: &str = "v";
pub const MARKER_FIELD: &str = "__isRef";

/// Identity key carried by a [`RefValue`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefKey(String);

impl RefKey {
    /// Fresh key from a random v4 UUID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RefKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RefKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// The `__isRef: true` marker. Only deserializes from `true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
struct RefMarker;

impl Serialize for RefMarker {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(true)
    }
}

impl<'de> Deserialize<'de> for RefMarker {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if bool::deserialize(deserializer)? {
            Ok(RefMarker)
        } else {
            Err(D::Error::custom("`__isRef` must be true"))
        }
    }
}

/// A value boxed with a stable identity key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefValue<T> {
    #[serde(rename = "k")]
    pub key: RefKey,
    #[serde(rename = "v")]
    pub value: T,
    #[serde(rename = "__isRef")]
    marker: RefMarker,
}

impl<T> RefValue<T> {
    /// Box `value` under a freshly generated key
    pub fn new(value: T) -> Self {
        Self::with_key(RefKey::generate(), value)
    }

    pub fn with_key(key: RefKey, value: T) -> Self {
        Self {
            key,
            value,
            marker: RefMarker,
        }
    }

    pub fn into_inner(self) -> T {
        self.value
    }

    /// Same identity, regardless of what the boxed values look like
    pub fn same_ref<U>(&self, other: &RefValue<U>) -> bool {
        self.key == other.key
    }
}

/// Either an already-boxed value or a raw one
///
/// Deserialization tries the boxed shape first, so a value that arrives
/// already wrapped is recognized as such.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaybeRef<T> {
    Ref(RefValue<T>),
    Raw(T),
}

impl<T> MaybeRef<T> {
    pub fn is_ref(&self) -> bool {
        matches!(self, MaybeRef::Ref(_))
    }

    /// Box a raw value with a fresh key; boxed values pass through
    pub fn into_ref(self) -> RefValue<T> {
        match self {
            MaybeRef::Ref(boxed) => boxed,
            MaybeRef::Raw(value) => RefValue::new(value),
        }
    }
}

impl<T> From<RefValue<T>> for MaybeRef<T> {
    fn from(boxed: RefValue<T>) -> Self {
        MaybeRef::Ref(boxed)
    }
}

/// Always produces a new wrapper with a fresh key
pub fn make_ref<T>(value: T) -> RefValue<T> {
    RefValue::new(value)
}

/// Box `value` unless it already is boxed
pub fn make_auto_ref<T>(value: MaybeRef<T>) -> RefValue<T> {
    value.into_ref()
}

/// True iff `value` is an object carrying a truthy `__isRef` marker
pub fn is_ref(value: &Value) -> bool {
    value
        .as_object()
        .and_then(|obj| obj.get(MARKER_FIELD))
        .is_some_and(is_truthy)
}

/// Dynamic counterpart of [`make_ref`]
pub fn make_ref_value(value: Value) -> Value {
    boxed_value(RefKey::generate(), value)
}

/// Dynamic counterpart of [`make_auto_ref`]
pub fn make_auto_ref_value(value: Value) -> Value {
    if is_ref(&value) {
        value
    } else {
        make_ref_value(value)
    }
}

/// Read the identity key of a boxed dynamic value
pub fn ref_key(value: &Value) -> Option<&str> {
    if !is_ref(value) {
        return None;
    }
    value.get(KEY_FIELD).and_then(Value::as_str)
}

fn boxed_value(key: RefKey, value: Value) -> Value {
    let mut obj = Map::with_capacity(3);
    obj.insert(KEY_FIELD.to_string(), Value::String(key.0));
    obj.insert(VALUE_FIELD.to_string(), value);
    obj.insert(MARKER_FIELD.to_string(), Value::Bool(true));
    Value::Object(obj)
}

/// Issues keys namespaced by a session, unique by construction
///
/// Keys look like `<namespace>:<n>` with `n` taken from a monotonic counter.
#[derive(Debug)]
pub struct RefFactory {
    namespace: Uuid,
    next: AtomicU64,
}

impl RefFactory {
    pub fn new(namespace: Uuid) -> Self {
        Self {
            namespace,
            next: AtomicU64::new(0),
        }
    }

    pub fn namespace(&self) -> Uuid {
        self.namespace
    }

    pub fn next_key(&self) -> RefKey {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        RefKey(format!("{}:{}", self.namespace.simple(), n))
    }

    pub fn make_ref<T>(&self, value: T) -> RefValue<T> {
        RefValue::with_key(self.next_key(), value)
    }

    pub fn make_auto_ref<T>(&self, value: MaybeRef<T>) -> RefValue<T> {
        match value {
            MaybeRef::Ref(boxed) => boxed,
            MaybeRef::Raw(value) => self.make_ref(value),
        }
    }

    pub fn make_auto_ref_value(&self, value: Value) -> Value {
        if is_ref(&value) {
            value
        } else {
            boxed_value(self.next_key(), value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_make_ref_always_fresh() {
        let a = make_ref(1);
        let b = make_ref(1);
        assert_eq!(a.value, b.value);
        assert!(!a.same_ref(&b));
    }

    #[test]
    fn test_auto_ref_is_idempotent() {
        let once = make_auto_ref(MaybeRef::Raw("hello".to_string()));
        let twice = make_auto_ref(MaybeRef::from(once.clone()));
        assert_eq!(once.key, twice.key);
        assert_eq!(twice.value, "hello");
    }

    #[test]
    fn test_dynamic_auto_ref_is_idempotent() {
        let once = make_auto_ref_value(json!({ "x": 1 }));
        assert!(is_ref(&once));
        let twice = make_auto_ref_value(once.clone());
        assert_eq!(ref_key(&once), ref_key(&twice));
        assert_eq!(twice[VALUE_FIELD], json!({ "x": 1 }));
        assert!(!is_ref(&twice[VALUE_FIELD]));
    }

    #[test]
    fn test_is_ref_requires_truthy_marker() {
        assert!(!is_ref(&json!(5)));
        assert!(!is_ref(&json!(null)));
        assert!(!is_ref(&json!({ "k": "a", "v": 1 })));
        assert!(!is_ref(&json!({ "k": "a", "v": 1, "__isRef": false })));
        assert!(is_ref(&json!({ "k": "a", "v": 1, "__isRef": 1 })));
    }

    #[test]
    fn test_wire_shape() {
        let boxed = RefValue::with_key(RefKey::from("abc".to_string()), vec![1, 2]);
        let wire = serde_json::to_value(&boxed).unwrap();
        assert_eq!(wire, json!({ "k": "abc", "v": [1, 2], "__isRef": true }));
        assert!(is_ref(&wire));
    }

    #[test]
    fn test_maybe_ref_recognizes_boxed_input() {
        let boxed: MaybeRef<i64> =
            serde_json::from_value(json!({ "k": "abc", "v": 7, "__isRef": true })).unwrap();
        assert!(boxed.is_ref());
        assert_eq!(make_auto_ref(boxed).key.as_str(), "abc");

        let raw: MaybeRef<i64> = serde_json::from_value(json!(7)).unwrap();
        assert!(!raw.is_ref());
    }

    #[test]
    fn test_false_marker_is_not_a_ref() {
        let parsed: MaybeRef<Value> =
            serde_json::from_value(json!({ "k": "abc", "v": 7, "__isRef": false })).unwrap();
        assert!(!parsed.is_ref());
    }

    #[test]
    fn test_factory_keys_unique_and_namespaced() {
        let ns = Uuid::new_v4();
        let factory = RefFactory::new(ns);
        let keys: HashSet<_> = (0..1000).map(|_| factory.next_key()).collect();
        assert_eq!(keys.len(), 1000);
        assert!(keys
            .iter()
            .all(|k| k.as_str().starts_with(&ns.simple().to_string())));
    }

    #[test]
    fn test_factory_auto_ref_keeps_foreign_key() {
        let factory = RefFactory::new(Uuid::new_v4());
        let foreign = make_ref_value(json!("x"));
        let kept = factory.make_auto_ref_value(foreign.clone());
        assert_eq!(kept, foreign);
    }
}
