//! # Type-Preserving Persistence Codec
//!
//! Persisted directory state lives in a string-only key/value store, but the
//! in-memory state holds values JSON cannot express directly: ordered maps with
//! non-string keys and raw byte buffers (node public keys). This module maps
//! between the two.
//!
//! ## Envelope Format
//!
//! Non-JSON-native values are wrapped in an envelope:
//!
//! ```text
//! { "__datatype": "Map",        "value": [[key, value], ...] }   // entry order preserved
//! { "__datatype": "Uint8Array", "value": [0, 255, 17, ...] }      // always a fresh copy
//! ```
//!
//! ## Handlers
//!
//! Each envelope tag is served by a [`TypeHandler`]. The codec tries handlers in
//! registration order when encoding, and looks them up by tag when decoding.
//! Callers may register additional handlers (see [`TaggedHandler`]).
//!
//! Any JSON object carrying both `__datatype` and `value` keys with a registered
//! tag is revived as that type. Plain data that happens to look like an envelope
//! is therefore indistinguishable from a real one; persisted payloads written by
//! earlier versions rely on this, so no stricter check is applied.
//!
//! ## Usage
//!
//! ```rust
//! use bytes::Bytes;
//! use meshdir::codec::{Codec, Value};
//!
//! let codec = Codec::new();
//! let value = Value::Map(vec![(Value::from(7u32), Value::Bytes(Bytes::from_static(&[1, 2])))]);
//! let text = codec.encode(&value).unwrap();
//! assert_eq!(codec.decode(&text).unwrap(), value);
//! ```

use bytes::Bytes;
use serde_json::{json, Number};
use std::collections::BTreeMap;
use thiserror::Error;

/// Object key naming the envelope type.
pub const DATATYPE_KEY: &str = "__datatype";
/// Object key holding the envelope payload.
pub const VALUE_KEY: &str = "value";

pub const MAP_TAG: &str = "Map";
pub const BYTES_TAG: &str = "Uint8Array";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An envelope whose payload does not fit its declared type.
    #[error("malformed {tag} envelope: {reason}")]
    Envelope { tag: String, reason: String },

    /// A value with no handler able to encode it.
    #[error("no handler registered for tag {0}")]
    UnknownTag(String),

    /// A decoded value did not have the shape a record expected.
    #[error("unexpected shape: {0}")]
    Shape(String),
}

/// Runtime value tree handled by the codec.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    /// Ordered map with arbitrary keys.
    Map(Vec<(Value, Value)>),
    Bytes(Bytes),
    /// Value of a caller-defined type, carried under its envelope tag.
    Tagged { tag: String, value: Box<Value> },
}

impl Value {
    /// Lift plain JSON into a value tree without reviving envelopes.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(fields) => Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Lower a value tree that contains only JSON-native variants back to JSON.
    pub fn into_plain_json(self) -> Result<serde_json::Value, CodecError> {
        Ok(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Number(n) => serde_json::Value::Number(n),
            Value::String(s) => serde_json::Value::String(s),
            Value::Array(items) => serde_json::Value::Array(
                items
                    .into_iter()
                    .map(Value::into_plain_json)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(fields) => {
                let mut out = serde_json::Map::new();
                for (k, v) in fields {
                    out.insert(k, v.into_plain_json()?);
                }
                serde_json::Value::Object(out)
            }
            Value::Map(_) => return Err(CodecError::Shape("map in plain json".into())),
            Value::Bytes(_) => return Err(CodecError::Shape("bytes in plain json".into())),
            Value::Tagged { tag, .. } => {
                return Err(CodecError::Shape(format!("{} in plain json", tag)))
            }
        })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(fields) => fields.get(key),
            _ => None,
        }
    }

    /// Remove and return an object field.
    pub fn take(&mut self, key: &str) -> Option<Value> {
        match self {
            Value::Object(fields) => fields.remove(key),
            _ => None,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        if let Value::Object(fields) = self {
            fields.insert(key.into(), value);
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Number(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Number(v.into())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

/// Records that can be written to and read back from a [`Value`] tree.
pub trait Persist: Sized {
    fn to_value(&self) -> Result<Value, CodecError>;
    fn from_value(value: Value) -> Result<Self, CodecError>;
}

/// Encoder/decoder for one envelope tag.
///
/// `encode` returns the JSON placed under the envelope's `value` key; `decode`
/// receives that payload after its own nested envelopes have been revived.
pub trait TypeHandler: Send + Sync {
    fn tag(&self) -> &str;
    fn test(&self, value: &Value) -> bool;
    fn encode(&self, value: &Value, codec: &Codec) -> Result<serde_json::Value, CodecError>;
    fn decode(&self, payload: Value, codec: &Codec) -> Result<Value, CodecError>;
}

pub struct MapHandler;

impl TypeHandler for MapHandler {
    fn tag(&self) -> &str {
        MAP_TAG
    }

    fn test(&self, value: &Value) -> bool {
        matches!(value, Value::Map(_))
    }

    fn encode(&self, value: &Value, codec: &Codec) -> Result<serde_json::Value, CodecError> {
        let Value::Map(entries) = value else {
            return Err(CodecError::Shape("map handler given non-map".into()));
        };
        let mut out = Vec::with_capacity(entries.len());
        for (k, v) in entries {
            out.push(serde_json::Value::Array(vec![
                codec.to_json(k)?,
                codec.to_json(v)?,
            ]));
        }
        Ok(serde_json::Value::Array(out))
    }

    fn decode(&self, payload: Value, _codec: &Codec) -> Result<Value, CodecError> {
        let malformed = |reason: &str| CodecError::Envelope {
            tag: MAP_TAG.to_string(),
            reason: reason.to_string(),
        };
        let Value::Array(items) = payload else {
            return Err(malformed("payload is not an array"));
        };
        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::Array(pair) if pair.len() == 2 => {
                    let mut pair = pair.into_iter();
                    if let (Some(k), Some(v)) = (pair.next(), pair.next()) {
                        entries.push((k, v));
                    }
                }
                _ => return Err(malformed("entry is not a [key, value] pair")),
            }
        }
        Ok(Value::Map(entries))
    }
}

pub struct BytesHandler;

impl TypeHandler for BytesHandler {
    fn tag(&self) -> &str {
        BYTES_TAG
    }

    fn test(&self, value: &Value) -> bool {
        matches!(value, Value::Bytes(_))
    }

    fn encode(&self, value: &Value, _codec: &Codec) -> Result<serde_json::Value, CodecError> {
        let Value::Bytes(buf) = value else {
            return Err(CodecError::Shape("bytes handler given non-bytes".into()));
        };
        // Iterating the view copies exactly its window; slices of a larger
        // buffer come back as a standalone buffer.
        Ok(serde_json::Value::Array(
            buf.iter().map(|b| json!(*b)).collect(),
        ))
    }

    fn decode(&self, payload: Value, _codec: &Codec) -> Result<Value, CodecError> {
        let Value::Array(items) = payload else {
            return Err(CodecError::Envelope {
                tag: BYTES_TAG.to_string(),
                reason: "payload is not an array".to_string(),
            });
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item.as_u64() {
                Some(b) if b <= u8::MAX as u64 => out.push(b as u8),
                _ => {
                    return Err(CodecError::Envelope {
                        tag: BYTES_TAG.to_string(),
                        reason: "element is not a byte".to_string(),
                    })
                }
            }
        }
        Ok(Value::Bytes(Bytes::from(out)))
    }
}

/// Handler for caller-defined [`Value::Tagged`] values with a fixed tag.
pub struct TaggedHandler {
    tag: String,
}

impl TaggedHandler {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

impl TypeHandler for TaggedHandler {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn test(&self, value: &Value) -> bool {
        matches!(value, Value::Tagged { tag, .. } if *tag == self.tag)
    }

    fn encode(&self, value: &Value, codec: &Codec) -> Result<serde_json::Value, CodecError> {
        match value {
            Value::Tagged { value, .. } => codec.to_json(value),
            _ => Err(CodecError::Shape(format!("{} handler given untagged value", self.tag))),
        }
    }

    fn decode(&self, payload: Value, _codec: &Codec) -> Result<Value, CodecError> {
        Ok(Value::Tagged {
            tag: self.tag.clone(),
            value: Box::new(payload),
        })
    }
}

/// Handler table plus the replacer/reviver walks.
pub struct Codec {
    handlers: Vec<Box<dyn TypeHandler>>,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    /// Codec with the built-in `Map` and `Uint8Array` handlers.
    pub fn new() -> Self {
        let mut codec = Self::empty();
        codec.register(Box::new(MapHandler));
        codec.register(Box::new(BytesHandler));
        codec
    }

    pub fn empty() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Append a handler. Earlier handlers win when more than one matches a value.
    pub fn register(&mut self, handler: Box<dyn TypeHandler>) {
        self.handlers.push(handler);
    }

    pub fn encode(&self, value: &Value) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&self.to_json(value)?)?)
    }

    pub fn decode(&self, text: &str) -> Result<Value, CodecError> {
        let json: serde_json::Value = serde_json::from_str(text)?;
        self.revive(json)
    }

    /// Replacer walk: value tree to JSON with envelopes.
    pub fn to_json(&self, value: &Value) -> Result<serde_json::Value, CodecError> {
        if let Some(handler) = self.handlers.iter().find(|h| h.test(value)) {
            let payload = handler.encode(value, self)?;
            let mut envelope = serde_json::Map::new();
            envelope.insert(DATATYPE_KEY.to_string(), json!(handler.tag()));
            envelope.insert(VALUE_KEY.to_string(), payload);
            return Ok(serde_json::Value::Object(envelope));
        }
        Ok(match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|v| self.to_json(v))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(fields) => {
                let mut out = serde_json::Map::new();
                for (k, v) in fields {
                    out.insert(k.clone(), self.to_json(v)?);
                }
                serde_json::Value::Object(out)
            }
            Value::Map(_) => return Err(CodecError::UnknownTag(MAP_TAG.into())),
            Value::Bytes(_) => return Err(CodecError::UnknownTag(BYTES_TAG.into())),
            Value::Tagged { tag, .. } => return Err(CodecError::UnknownTag(tag.clone())),
        })
    }

    /// Reviver walk: JSON to value tree, innermost envelopes first.
    pub fn revive(&self, json: serde_json::Value) -> Result<Value, CodecError> {
        match json {
            serde_json::Value::Array(items) => Ok(Value::Array(
                items
                    .into_iter()
                    .map(|v| self.revive(v))
                    .collect::<Result<_, _>>()?,
            )),
            serde_json::Value::Object(fields) => {
                let mut revived = BTreeMap::new();
                for (k, v) in fields {
                    revived.insert(k, self.revive(v)?);
                }
                let handler = match (revived.get(DATATYPE_KEY), revived.contains_key(VALUE_KEY)) {
                    (Some(Value::String(tag)), true) => {
                        self.handlers.iter().find(|h| h.tag() == tag.as_str())
                    }
                    _ => None,
                };
                match handler {
                    Some(handler) => {
                        let payload = revived.remove(VALUE_KEY).unwrap_or_default();
                        handler.decode(payload, self)
                    }
                    None => Ok(Value::Object(revived)),
                }
            }
            other => Ok(Value::from_json(other)),
        }
    }
}
