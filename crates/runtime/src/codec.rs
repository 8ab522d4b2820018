//! Conversion between application values and the wire's tagged values.
//!
//! [`JsValue`] is the application-side model: plain JSON plus `undefined`,
//! non-finite numbers, negative zero, the opaque scalar tags and references
//! to live remote objects. [`encode`] turns it into a [`SerializedArgument`]
//! (value plus handle table) and [`decode`] inverts it, resolving handles
//! through the connection's registry.

use std::sync::Arc;

use pwchan_protocol::{HandleRef, SerializedArgument, SerializedValue, SpecialValue};
use serde::Serialize;
use serde_json::Value;

use crate::channel_owner::ChannelOwner;
use crate::connection::ConnectionLike;
use crate::error::{Error, Result};

/// An application value as seen by evaluated driver-side code.
#[derive(Clone)]
pub enum JsValue {
    Undefined,
    Null,
    Bool(bool),
    /// Any number, including NaN, the infinities and `-0.0`
    Number(f64),
    String(String),
    /// ISO-8601 date string
    Date(String),
    /// Decimal digits of a big integer
    BigInt(String),
    Url(String),
    RegExp {
        pattern: String,
        flags: String,
    },
    Array(Vec<JsValue>),
    /// Key/value pairs in insertion order
    Object(Vec<(String, JsValue)>),
    /// Reference to a live remote object
    Handle(Arc<dyn ChannelOwner>),
}

impl JsValue {
    /// Converts any serde-serializable value.
    ///
    /// Fails with [`Error::UnsupportedValue`] for values serde cannot express
    /// as JSON (maps with non-string keys, for instance).
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(JsValue::from)
            .map_err(|e| Error::UnsupportedValue(e.to_string()))
    }

    /// Plain JSON rendering.
    ///
    /// Lossy: `undefined` and non-finite numbers become `null`, `-0` becomes
    /// `0`, the opaque scalars become strings and handles become
    /// `{"guid": ...}`.
    pub fn to_json(&self) -> Value {
        match self {
            JsValue::Undefined | JsValue::Null => Value::Null,
            JsValue::Bool(b) => Value::Bool(*b),
            JsValue::Number(n) => number_to_json(*n),
            JsValue::String(s) | JsValue::Date(s) | JsValue::BigInt(s) | JsValue::Url(s) => {
                Value::String(s.clone())
            }
            JsValue::RegExp { pattern, flags } => Value::String(format!("/{pattern}/{flags}")),
            JsValue::Array(items) => Value::Array(items.iter().map(JsValue::to_json).collect()),
            JsValue::Object(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            JsValue::Handle(object) => serde_json::json!({ "guid": object.guid() }),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            JsValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            JsValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            JsValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<&Arc<dyn ChannelOwner>> {
        match self {
            JsValue::Handle(object) => Some(object),
            _ => None,
        }
    }

    /// Looks up `key` in an object value. The first matching entry wins.
    pub fn get(&self, key: &str) -> Option<&JsValue> {
        match self {
            JsValue::Object(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, JsValue::Undefined)
    }
}

fn number_to_json(n: f64) -> Value {
    if !n.is_finite() {
        return Value::Null;
    }
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        return Value::from(n as i64);
    }
    serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
}

impl From<Value> for JsValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => JsValue::Null,
            Value::Bool(b) => JsValue::Bool(b),
            Value::Number(n) => JsValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => JsValue::String(s),
            Value::Array(items) => JsValue::Array(items.into_iter().map(JsValue::from).collect()),
            Value::Object(map) => {
                JsValue::Object(map.into_iter().map(|(k, v)| (k, JsValue::from(v))).collect())
            }
        }
    }
}

impl From<bool> for JsValue {
    fn from(b: bool) -> Self {
        JsValue::Bool(b)
    }
}

impl From<f64> for JsValue {
    fn from(n: f64) -> Self {
        JsValue::Number(n)
    }
}

impl From<&str> for JsValue {
    fn from(s: &str) -> Self {
        JsValue::String(s.to_string())
    }
}

impl From<String> for JsValue {
    fn from(s: String) -> Self {
        JsValue::String(s)
    }
}

impl From<Arc<dyn ChannelOwner>> for JsValue {
    fn from(object: Arc<dyn ChannelOwner>) -> Self {
        JsValue::Handle(object)
    }
}

impl PartialEq for JsValue {
    /// Structural equality where `NaN == NaN`, `0.0 != -0.0` and handles
    /// compare by GUID.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (JsValue::Undefined, JsValue::Undefined) | (JsValue::Null, JsValue::Null) => true,
            (JsValue::Bool(a), JsValue::Bool(b)) => a == b,
            (JsValue::Number(a), JsValue::Number(b)) => {
                (a.is_nan() && b.is_nan())
                    || (a == b && a.is_sign_negative() == b.is_sign_negative())
            }
            (JsValue::String(a), JsValue::String(b))
            | (JsValue::Date(a), JsValue::Date(b))
            | (JsValue::BigInt(a), JsValue::BigInt(b))
            | (JsValue::Url(a), JsValue::Url(b)) => a == b,
            (
                JsValue::RegExp { pattern, flags },
                JsValue::RegExp {
                    pattern: p,
                    flags: f,
                },
            ) => pattern == p && flags == f,
            (JsValue::Array(a), JsValue::Array(b)) => a == b,
            (JsValue::Object(a), JsValue::Object(b)) => a == b,
            (JsValue::Handle(a), JsValue::Handle(b)) => a.guid() == b.guid(),
            _ => false,
        }
    }
}

impl std::fmt::Debug for JsValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JsValue::Undefined => f.write_str("Undefined"),
            JsValue::Null => f.write_str("Null"),
            JsValue::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            JsValue::Number(n) => f.debug_tuple("Number").field(n).finish(),
            JsValue::String(s) => f.debug_tuple("String").field(s).finish(),
            JsValue::Date(s) => f.debug_tuple("Date").field(s).finish(),
            JsValue::BigInt(s) => f.debug_tuple("BigInt").field(s).finish(),
            JsValue::Url(s) => f.debug_tuple("Url").field(s).finish(),
            JsValue::RegExp { pattern, flags } => f
                .debug_struct("RegExp")
                .field("pattern", pattern)
                .field("flags", flags)
                .finish(),
            JsValue::Array(items) => f.debug_tuple("Array").field(items).finish(),
            JsValue::Object(entries) => f.debug_tuple("Object").field(entries).finish(),
            JsValue::Handle(object) => f
                .debug_struct("Handle")
                .field("guid", &object.guid())
                .field("type_name", &object.type_name())
                .finish(),
        }
    }
}

/// Encodes `value` into a wire argument.
///
/// Every handle occurrence gets its own slot in the handle table. Fails with
/// [`Error::UnsupportedValue`] for handles to disposed objects.
pub fn encode(value: &JsValue) -> Result<SerializedArgument> {
    let mut handles = Vec::new();
    let value = encode_value(value, &mut handles)?;
    Ok(SerializedArgument { value, handles })
}

fn encode_value(value: &JsValue, handles: &mut Vec<HandleRef>) -> Result<SerializedValue> {
    Ok(match value {
        JsValue::Undefined => SerializedValue::Special(SpecialValue::Undefined),
        JsValue::Null => SerializedValue::Special(SpecialValue::Null),
        JsValue::Bool(b) => SerializedValue::Bool(*b),
        JsValue::Number(n) => match SpecialValue::for_number(*n) {
            Some(special) => SerializedValue::Special(special),
            None => SerializedValue::Number(*n),
        },
        JsValue::String(s) => SerializedValue::Str(s.clone()),
        JsValue::Date(d) => SerializedValue::Date(d.clone()),
        JsValue::BigInt(bi) => SerializedValue::BigInt(bi.clone()),
        JsValue::Url(u) => SerializedValue::Url(u.clone()),
        JsValue::RegExp { pattern, flags } => SerializedValue::RegExp {
            pattern: pattern.clone(),
            flags: flags.clone(),
        },
        JsValue::Array(items) => SerializedValue::Array(
            items
                .iter()
                .map(|item| encode_value(item, handles))
                .collect::<Result<_>>()?,
        ),
        JsValue::Object(entries) => SerializedValue::Object(
            entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), encode_value(v, handles)?)))
                .collect::<Result<_>>()?,
        ),
        JsValue::Handle(object) => {
            if object.is_disposed() {
                return Err(Error::UnsupportedValue(format!(
                    "handle to disposed object {}",
                    object.guid()
                )));
            }
            handles.push(HandleRef {
                guid: object.guid().to_string(),
            });
            SerializedValue::Handle(handles.len() - 1)
        }
    })
}

/// Decodes a wire argument, resolving handles through `connection`.
///
/// Fails with [`Error::Codec`] for a handle index outside the table and
/// [`Error::ObjectNotFound`] for a GUID that is no longer registered.
pub fn decode(arg: &SerializedArgument, connection: &dyn ConnectionLike) -> Result<JsValue> {
    decode_with(&arg.value, &mut |index: usize| {
        let handle = arg
            .handles
            .get(index)
            .ok_or_else(|| Error::Codec(format!("handle index {index} out of range")))?;
        connection.get_existing_object(&handle.guid)
    })
}

/// Decodes a bare value. Handles fail with [`Error::Codec`].
pub fn decode_value(value: &SerializedValue) -> Result<JsValue> {
    decode_with(value, &mut |index: usize| {
        Err(Error::Codec(format!(
            "handle {index} outside of an argument with a handle table"
        )))
    })
}

/// Parses and decodes a bare value from wire JSON.
pub fn decode_json(value: &Value) -> Result<JsValue> {
    decode_value(&SerializedValue::from_json(value)?)
}

fn decode_with(
    value: &SerializedValue,
    resolve: &mut dyn FnMut(usize) -> Result<Arc<dyn ChannelOwner>>,
) -> Result<JsValue> {
    Ok(match value {
        SerializedValue::Number(n) => JsValue::Number(*n),
        SerializedValue::Bool(b) => JsValue::Bool(*b),
        SerializedValue::Str(s) => JsValue::String(s.clone()),
        SerializedValue::Special(special) => match special {
            SpecialValue::Null => JsValue::Null,
            SpecialValue::Undefined => JsValue::Undefined,
            SpecialValue::NaN => JsValue::Number(f64::NAN),
            SpecialValue::Infinity => JsValue::Number(f64::INFINITY),
            SpecialValue::NegInfinity => JsValue::Number(f64::NEG_INFINITY),
            SpecialValue::NegZero => JsValue::Number(-0.0),
        },
        SerializedValue::Date(d) => JsValue::Date(d.clone()),
        SerializedValue::BigInt(bi) => JsValue::BigInt(bi.clone()),
        SerializedValue::Url(u) => JsValue::Url(u.clone()),
        SerializedValue::RegExp { pattern, flags } => JsValue::RegExp {
            pattern: pattern.clone(),
            flags: flags.clone(),
        },
        SerializedValue::Array(items) => JsValue::Array(
            items
                .iter()
                .map(|item| decode_with(item, &mut *resolve))
                .collect::<Result<_>>()?,
        ),
        SerializedValue::Object(entries) => JsValue::Object(
            entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), decode_with(v, &mut *resolve)?)))
                .collect::<Result<_>>()?,
        ),
        SerializedValue::Handle(index) => JsValue::Handle(resolve(*index)?),
    })
}
