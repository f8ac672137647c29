//! Payload object model.
//!
//! Every message payload decodes into a [`Value`]. The set of variants is
//! closed: an unknown tag fails decoding, and [`Value::validate`] applies the
//! structural checks serde cannot express (context name length, handle range).

use crate::config::IdConfig;
use crate::error::{CallError, Result, TetherError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Allow-listed payload value.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(#[serde(with = "float_repr")] f64),
    Str(String),
    Bytes(#[serde(with = "hex_bytes")] Vec<u8>),
    /// Bytes whose debug output only reports the length.
    Blob(#[serde(with = "hex_bytes")] Vec<u8>),
    /// Text masked in debug output.
    Secret(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    Kwargs(Kwargs),
    Context(ContextRef),
    Sender(SenderRef),
    CallError(CallError),
}

/// Keyword arguments of a call.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kwargs(BTreeMap<String, Value>);

impl Kwargs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.0
    }
}

impl From<BTreeMap<String, Value>> for Kwargs {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl fmt::Debug for Kwargs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

/// Serialized reference to a context: enough to rebuild a handle on the
/// receiving router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRef {
    pub id: u32,
    #[serde(default)]
    pub name: Option<String>,
}

/// Serialized reference to a handle on some context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderRef {
    pub context_id: u32,
    pub handle: u32,
}

/// Coarse type of a [`Value`], used by service argument specs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Any,
    None,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    List,
    Dict,
    Kwargs,
    Context,
    Sender,
    CallError,
}

impl ValueKind {
    /// Whether `value` satisfies this kind. `Bytes` accepts blobs, `Str`
    /// accepts secrets and `List` accepts tuples.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ValueKind::Any => true,
            other => value.kind() == *other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Any => "any",
            ValueKind::None => "none",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Str => "str",
            ValueKind::Bytes => "bytes",
            ValueKind::List => "list",
            ValueKind::Dict => "dict",
            ValueKind::Kwargs => "kwargs",
            ValueKind::Context => "context",
            ValueKind::Sender => "sender",
            ValueKind::CallError => "call_error",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::None => ValueKind::None,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) | Value::Secret(_) => ValueKind::Str,
            Value::Bytes(_) | Value::Blob(_) => ValueKind::Bytes,
            Value::List(_) | Value::Tuple(_) => ValueKind::List,
            Value::Dict(_) => ValueKind::Dict,
            Value::Kwargs(_) => ValueKind::Kwargs,
            Value::Context(_) => ValueKind::Context,
            Value::Sender(_) => ValueKind::Sender,
            Value::CallError(_) => ValueKind::CallError,
        }
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(items)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_i64().and_then(|i| u32::try_from(i).ok())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Secret(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) | Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// Items of a list or tuple.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Dict(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_kwargs(&self) -> Option<&Kwargs> {
        match self {
            Value::Kwargs(kwargs) => Some(kwargs),
            _ => None,
        }
    }

    pub fn as_context(&self) -> Option<&ContextRef> {
        match self {
            Value::Context(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_sender(&self) -> Option<SenderRef> {
        match self {
            Value::Sender(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_call_error(&self) -> Option<&CallError> {
        match self {
            Value::CallError(e) => Some(e),
            _ => None,
        }
    }

    /// Reject structurally invalid values that deserialized successfully.
    pub fn validate(&self) -> Result<()> {
        match self {
            Value::Context(ctx) => {
                if let Some(name) = &ctx.name {
                    if name.len() >= IdConfig::MAX_NAME_LEN {
                        return Err(TetherError::Stream(format!(
                            "bad input: context name too long ({} bytes)",
                            name.len()
                        )));
                    }
                }
                Ok(())
            }
            Value::Sender(sender) => {
                if sender.handle == 0 {
                    return Err(TetherError::Stream(
                        "bad input: sender handle must be nonzero".into(),
                    ));
                }
                Ok(())
            }
            Value::CallError(err) => {
                if err.is_well_formed() {
                    Ok(())
                } else {
                    Err(TetherError::Stream("bad input: oversized call error".into()))
                }
            }
            Value::List(items) | Value::Tuple(items) => items.iter().try_for_each(Value::validate),
            Value::Dict(map) => map.values().try_for_each(Value::validate),
            Value::Kwargs(kwargs) => kwargs.0.values().try_for_each(Value::validate),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "b{:?}", String::from_utf8_lossy(b)),
            Value::Blob(b) => write!(f, "[blob: {} bytes]", b.len()),
            Value::Secret(_) => f.write_str("[censored]"),
            Value::List(items) => f.debug_list().entries(items).finish(),
            Value::Tuple(items) => {
                let mut t = f.debug_tuple("");
                for item in items {
                    t.field(item);
                }
                t.finish()
            }
            Value::Dict(map) => f.debug_map().entries(map.iter()).finish(),
            Value::Kwargs(kwargs) => write!(f, "Kwargs({:?})", kwargs),
            Value::Context(ctx) => match &ctx.name {
                Some(name) => write!(f, "Context({}, {:?})", ctx.id, name),
                None => write!(f, "Context({})", ctx.id),
            },
            Value::Sender(s) => write!(f, "Sender({}, {})", s.context_id, s.handle),
            Value::CallError(e) => write!(f, "{:?}", e),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::None
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Dict(map)
    }
}

impl From<Kwargs> for Value {
    fn from(kwargs: Kwargs) -> Self {
        Value::Kwargs(kwargs)
    }
}

impl From<ContextRef> for Value {
    fn from(ctx: ContextRef) -> Self {
        Value::Context(ctx)
    }
}

impl From<SenderRef> for Value {
    fn from(sender: SenderRef) -> Self {
        Value::Sender(sender)
    }
}

impl From<CallError> for Value {
    fn from(err: CallError) -> Self {
        Value::CallError(err)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Value::None,
        }
    }
}

/// Bytes travel as lowercase hex strings inside the JSON encoding.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

/// JSON has no infinities or NaN, so those travel as `"inf"`, `"-inf"` and
/// `"nan"`.
mod float_repr {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(x: &f64, s: S) -> Result<S::Ok, S::Error> {
        if x.is_nan() {
            s.serialize_str("nan")
        } else if x.is_infinite() {
            s.serialize_str(if *x > 0.0 { "inf" } else { "-inf" })
        } else {
            s.serialize_f64(*x)
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        match Repr::deserialize(d)? {
            Repr::Number(x) => Ok(x),
            Repr::Text(text) => match text.as_str() {
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                "nan" => Ok(f64::NAN),
                other => Err(serde::de::Error::custom(format!("bad float {:?}", other))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(text: &str) -> serde_json::Result<Value> {
        serde_json::from_str(text)
    }

    #[test]
    fn test_nested_value_survives_encoding() {
        let value = Value::tuple(vec![
            Value::Str("chain".into()),
            Value::List(vec![Value::Int(2), Value::Float(3.5), Value::Bytes(vec![0, 255])]),
            Value::Kwargs(Kwargs::new().with("flag", true).with("name", "x")),
            Value::Context(ContextRef { id: 4, name: Some("child".into()) }),
        ]);
        let text = serde_json::to_string(&value).unwrap();
        assert_eq!(decode(&text).unwrap(), value);
    }

    #[test]
    fn test_non_finite_floats_survive_encoding() {
        for x in [f64::INFINITY, f64::NEG_INFINITY] {
            let text = serde_json::to_string(&Value::Float(x)).unwrap();
            assert_eq!(decode(&text).unwrap(), Value::Float(x));
        }
        let text = serde_json::to_string(&Value::Float(f64::NAN)).unwrap();
        match decode(&text).unwrap() {
            Value::Float(x) => assert!(x.is_nan()),
            other => panic!("expected float, got {:?}", other),
        }
        assert!(decode(r#"{"Float":"huge"}"#).is_err());
        assert!(decode(r#"{"Float":null}"#).is_err());
    }

    #[test]
    fn test_unknown_tag_fails_closed() {
        assert!(decode(r#"{"Pickle":"cos\nsystem"}"#).is_err());
        assert!(decode(r#"{"Int":"not a number"}"#).is_err());
        assert!(decode(r#"{"Bytes":"zz"}"#).is_err());
    }

    #[test]
    fn test_validate_rejects_long_context_name() {
        let value = Value::List(vec![Value::Context(ContextRef {
            id: 1,
            name: Some("x".repeat(200)),
        })]);
        assert!(value.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_handle() {
        let value = Value::Sender(SenderRef { context_id: 1, handle: 0 });
        assert!(value.validate().is_err());
        let value = Value::Sender(SenderRef { context_id: 1, handle: 1000 });
        assert!(value.validate().is_ok());
    }

    #[test]
    fn test_debug_masks_blob_and_secret() {
        let text = format!("{:?}", Value::List(vec![
            Value::Blob(vec![1; 64]),
            Value::Secret("hunter2".into()),
        ]));
        assert!(text.contains("[blob: 64 bytes]"));
        assert!(text.contains("[censored]"));
        assert!(!text.contains("hunter2"));
    }

    #[test]
    fn test_value_kind_matching() {
        assert!(ValueKind::Str.matches(&Value::Secret("s".into())));
        assert!(ValueKind::List.matches(&Value::Tuple(vec![])));
        assert!(ValueKind::Any.matches(&Value::None));
        assert!(!ValueKind::Int.matches(&Value::Float(1.0)));
    }
}
