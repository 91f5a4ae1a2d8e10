//! Tagged property values.
//!
//! Desired properties are loosely typed in declarative documents. They are
//! represented here as an explicit variant type so that equality, merging and
//! reference resolution are well defined instead of duck-typed.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use super::resource::{Reference, ResourceId};

/// Key used to mark a reference in serialized documents.
pub const REF_KEY: &str = "$ref";

/// A property mapping, keyed by property name.
pub type Properties = BTreeMap<String, Value>;

/// A numeric value.
///
/// Integers and floats compare by mathematical value, so `1` and `1.0` are equal.
#[derive(Debug, Clone, Copy)]
pub enum Number {
    /// A signed integer.
    Integer(i64),
    /// A floating point number.
    Float(f64),
}

/// A property value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Explicit null.
    Null,
    /// A boolean.
    Bool(bool),
    /// A number.
    Number(Number),
    /// A string.
    String(String),
    /// An ordered sequence.
    Sequence(Vec<Self>),
    /// A mapping. Keys are sorted, so insertion order never affects equality.
    Mapping(BTreeMap<String, Self>),
    /// A reference to another resource's output attribute.
    Reference(Reference),
}

impl PartialEq for Number {
    #[allow(clippy::float_cmp, clippy::cast_precision_loss)]
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Self::Integer(i), Self::Float(f)) | (Self::Float(f), Self::Integer(i)) => {
                (*i as f64) == *f
            }
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
        }
    }
}

impl Value {
    /// Creates a string value.
    #[must_use]
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    /// Creates a reference value.
    #[must_use]
    pub fn reference(resource: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self::Reference(Reference::new(resource, attribute))
    }

    /// Creates a mapping value from key/value pairs.
    #[must_use]
    pub fn mapping<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Self)>,
    {
        Self::Mapping(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Returns the string content, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer content, if this is an integral number.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(Number::Integer(i)) => Some(*i),
            Self::Number(Number::Float(f)) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    /// Returns the boolean content, if this is a boolean.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the mapping content, if this is a mapping.
    #[must_use]
    pub const fn as_mapping(&self) -> Option<&BTreeMap<String, Self>> {
        match self {
            Self::Mapping(m) => Some(m),
            _ => None,
        }
    }

    /// Looks up a nested value by a path of mapping keys.
    #[must_use]
    pub fn get_path<'a, I>(&self, path: I) -> Option<&Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut current = self;
        for segment in path {
            current = current.as_mapping()?.get(segment)?;
        }
        Some(current)
    }

    /// Returns true if the value contains no references at any depth.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        match self {
            Self::Reference(_) => false,
            Self::Sequence(items) => items.iter().all(Self::is_resolved),
            Self::Mapping(map) => map.values().all(Self::is_resolved),
            _ => true,
        }
    }

    /// Collects every reference contained in the value.
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Reference(r) => out.push(r),
            Self::Sequence(items) => items.iter().for_each(|v| v.collect_references(out)),
            Self::Mapping(map) => map.values().for_each(|v| v.collect_references(out)),
            _ => {}
        }
    }

    /// Replaces every reference using `lookup`.
    ///
    /// Returns `None` as soon as one reference cannot be resolved, meaning the
    /// value is not known yet.
    pub fn resolve<F>(&self, lookup: &F) -> Option<Self>
    where
        F: Fn(&Reference) -> Option<Self>,
    {
        match self {
            Self::Reference(r) => lookup(r),
            Self::Sequence(items) => items
                .iter()
                .map(|v| v.resolve(lookup))
                .collect::<Option<Vec<_>>>()
                .map(Self::Sequence),
            Self::Mapping(map) => map
                .iter()
                .map(|(k, v)| v.resolve(lookup).map(|v| (k.clone(), v)))
                .collect::<Option<BTreeMap<_, _>>>()
                .map(Self::Mapping),
            other => Some(other.clone()),
        }
    }

    /// Deep-merges `overlay` into `self`.
    ///
    /// Mappings merge key by key (recursively); any other combination is
    /// replaced by the overlay.
    pub fn merge(&mut self, overlay: Self) {
        match (self, overlay) {
            (Self::Mapping(base), Self::Mapping(over)) => merge_properties(base, over),
            (slot, over) => *slot = over,
        }
    }

    /// Converts into a `serde_json::Value`, encoding references as `$ref` objects.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(Number::Integer(i)) => serde_json::Value::from(*i),
            Self::Number(Number::Float(f)) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Sequence(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
            Self::Mapping(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Self::Reference(r) => {
                let mut obj = serde_json::Map::new();
                obj.insert(REF_KEY.to_string(), serde_json::Value::String(r.to_string()));
                serde_json::Value::Object(obj)
            }
        }
    }

    /// Converts from a `serde_json::Value`, decoding `$ref` objects into references.
    ///
    /// # Errors
    ///
    /// Returns the raw string of a malformed `$ref`.
    pub fn from_json(json: serde_json::Value) -> std::result::Result<Self, String> {
        Ok(match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(
                n.as_i64()
                    .map_or_else(|| Number::Float(n.as_f64().unwrap_or(f64::NAN)), Number::Integer),
            ),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => Self::Sequence(
                items
                    .into_iter()
                    .map(Self::from_json)
                    .collect::<std::result::Result<_, _>>()?,
            ),
            serde_json::Value::Object(map) => {
                if map.len() == 1
                    && let Some(serde_json::Value::String(raw)) = map.get(REF_KEY)
                {
                    return Reference::parse(raw).map(Self::Reference).ok_or_else(|| raw.clone());
                }
                Self::Mapping(
                    map.into_iter()
                        .map(|(k, v)| Self::from_json(v).map(|v| (k, v)))
                        .collect::<std::result::Result<_, _>>()?,
                )
            }
        })
    }
}

/// Deep-merges `overlay` into `base`, key by key.
pub fn merge_properties(base: &mut BTreeMap<String, Value>, overlay: BTreeMap<String, Value>) {
    for (key, value) in overlay {
        match base.get_mut(&key) {
            Some(existing) => existing.merge(value),
            None => {
                base.insert(key, value);
            }
        }
    }
}

/// Parses a resource id and attribute path out of `"<id>.<attr>[.<path>]"`.
pub(crate) fn split_reference(raw: &str) -> Option<(ResourceId, String)> {
    let (resource, attribute) = raw.split_once('.')?;
    if resource.is_empty() || attribute.is_empty() || attribute.split('.').any(str::is_empty) {
        return None;
    }
    Some((ResourceId::new(resource), attribute.to_string()))
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Number(Number::Integer(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Number(Number::Float(f))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Reference> for Value {
    fn from(r: Reference) -> Self {
        Self::Reference(r)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Self::from_json(json).map_err(|raw| {
            serde::de::Error::custom(format!(
                "invalid reference '{raw}': expected '<resource>.<attribute>'"
            ))
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Reference(r) => write!(f, "${{{r}}}"),
            Self::Sequence(_) | Self::Mapping(_) => write!(f, "{}", self.to_json()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_equality_ignores_order() {
        let a: Value = serde_json::from_str(r#"{"Name": "backup", "Purpose": "automated"}"#)
            .expect("valid json");
        let b: Value = serde_json::from_str(r#"{"Purpose": "automated", "Name": "backup"}"#)
            .expect("valid json");
        assert_eq!(a, b);
    }

    #[test]
    fn test_number_equality_across_representations() {
        assert_eq!(Value::from(90_i64), Value::from(90.0));
        assert_ne!(Value::from(90_i64), Value::from(90.5));
        assert_ne!(Value::from(1_i64), Value::from("1"));
    }

    #[test]
    fn test_sequence_order_matters() {
        let a = Value::Sequence(vec![Value::from("x"), Value::from("y")]);
        let b = Value::Sequence(vec![Value::from("y"), Value::from("x")]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_reference_round_trip_through_json() {
        let json = serde_json::json!({ "bucket": { "$ref": "b1.arn" }, "count": 2 });
        let value = Value::from_json(json.clone()).expect("valid value");

        let mut refs = Vec::new();
        value.collect_references(&mut refs);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].resource.as_str(), "b1");
        assert_eq!(refs[0].attribute, "arn");
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn test_malformed_reference_rejected() {
        let json = serde_json::json!({ "$ref": "no-attribute" });
        assert_eq!(Value::from_json(json), Err(String::from("no-attribute")));
    }

    #[test]
    fn test_ref_key_with_siblings_is_plain_mapping() {
        let json = serde_json::json!({ "$ref": "b1.arn", "other": true });
        let value = Value::from_json(json).expect("valid value");
        assert!(value.is_resolved());
    }

    #[test]
    fn test_resolve_replaces_nested_references() {
        let value = Value::mapping([
            ("resource", Value::Sequence(vec![Value::reference("b1", "arn")])),
            ("effect", Value::from("Allow")),
        ]);

        let resolved = value
            .resolve(&|r: &Reference| (r.attribute == "arn").then(|| Value::from("arn:aws:s3:::b1")))
            .expect("all references known");

        assert!(resolved.is_resolved());
        assert_eq!(
            resolved.get_path(["resource"]),
            Some(&Value::Sequence(vec![Value::from("arn:aws:s3:::b1")]))
        );
    }

    #[test]
    fn test_resolve_unknown_reference_yields_none() {
        let value = Value::Sequence(vec![Value::from(1_i64), Value::reference("b1", "arn")]);
        assert!(value.resolve(&|_: &Reference| None).is_none());
    }

    #[test]
    fn test_deep_merge() {
        let mut base = Value::mapping([
            ("tags", Value::mapping([("ManagedBy", Value::from("halldyll"))])),
            ("versioning", Value::from(true)),
        ]);
        base.merge(Value::mapping([
            ("tags", Value::mapping([("Purpose", Value::from("backups"))])),
            ("versioning", Value::from(false)),
        ]));

        assert_eq!(base.get_path(["tags", "ManagedBy"]), Some(&Value::from("halldyll")));
        assert_eq!(base.get_path(["tags", "Purpose"]), Some(&Value::from("backups")));
        assert_eq!(base.get_path(["versioning"]), Some(&Value::from(false)));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::from("x").to_string(), "\"x\"");
        assert_eq!(Value::reference("b1", "arn").to_string(), "${b1.arn}");
        assert_eq!(Value::Null.to_string(), "null");
    }
}
