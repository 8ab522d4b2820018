//! Tagged value representation used for call arguments and results.
//!
//! The driver wraps every value in a single-key object whose key names the
//! variant:
//!
//! | Value | Wire format |
//! |-------|-------------|
//! | number | `{"n": 123}` |
//! | boolean | `{"b": true}` |
//! | string | `{"s": "value"}` |
//! | null / undefined / NaN / ±Infinity / -0 | `{"v": "null"}`, `{"v": "-0"}`, ... |
//! | date | `{"d": "2024-01-01T00:00:00.000Z"}` |
//! | bigint | `{"bi": "123"}` |
//! | URL | `{"u": "https://example.com/"}` |
//! | regexp | `{"r": {"p": "a+", "f": "gi"}}` |
//! | array | `{"a": [...]}` |
//! | object | `{"o": [{"k": "key", "v": {...}}, ...]}` |
//! | handle | `{"h": 0}` (index into [`SerializedArgument::handles`]) |
//!
//! Arrays and objects may also carry an `"id"` used by the driver for cycle
//! bookkeeping; it is accepted and ignored.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};
use thiserror::Error;

/// Violations of the tagged value grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("serialized value is not a JSON object: {0}")]
    NotAnObject(String),

    #[error("serialized value has no variant")]
    Empty,

    #[error("serialized value is ambiguous (keys: {0})")]
    Ambiguous(String),

    #[error("unknown serialized value tag '{0}'")]
    UnknownTag(String),

    #[error("unknown special value sentinel '{0}'")]
    UnknownSentinel(String),

    #[error("malformed '{tag}' value: expected {expected}")]
    Malformed { tag: &'static str, expected: &'static str },
}

/// Values plain JSON cannot carry losslessly, sent as `{"v": ...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialValue {
    Null,
    Undefined,
    NaN,
    Infinity,
    NegInfinity,
    NegZero,
}

impl SpecialValue {
    pub fn as_str(self) -> &'static str {
        match self {
            SpecialValue::Null => "null",
            SpecialValue::Undefined => "undefined",
            SpecialValue::NaN => "NaN",
            SpecialValue::Infinity => "Infinity",
            SpecialValue::NegInfinity => "-Infinity",
            SpecialValue::NegZero => "-0",
        }
    }

    pub fn parse(sentinel: &str) -> Option<Self> {
        Some(match sentinel {
            "null" => SpecialValue::Null,
            "undefined" => SpecialValue::Undefined,
            "NaN" => SpecialValue::NaN,
            "Infinity" => SpecialValue::Infinity,
            "-Infinity" => SpecialValue::NegInfinity,
            "-0" => SpecialValue::NegZero,
            _ => return None,
        })
    }

    /// Classifies a float that plain JSON cannot represent.
    ///
    /// Order matters: `-0.0 == 0.0`, so the sign bit is checked explicitly
    /// and only after the non-finite cases.
    pub fn for_number(n: f64) -> Option<Self> {
        if n.is_nan() {
            Some(SpecialValue::NaN)
        } else if n == f64::INFINITY {
            Some(SpecialValue::Infinity)
        } else if n == f64::NEG_INFINITY {
            Some(SpecialValue::NegInfinity)
        } else if n == 0.0 && n.is_sign_negative() {
            Some(SpecialValue::NegZero)
        } else {
            None
        }
    }

    /// Numeric identity of the float sentinels.
    pub fn as_number(self) -> Option<f64> {
        match self {
            SpecialValue::NaN => Some(f64::NAN),
            SpecialValue::Infinity => Some(f64::INFINITY),
            SpecialValue::NegInfinity => Some(f64::NEG_INFINITY),
            SpecialValue::NegZero => Some(-0.0),
            SpecialValue::Null | SpecialValue::Undefined => None,
        }
    }
}

/// One value in the driver's tagged representation.
#[derive(Debug, Clone, PartialEq)]
pub enum SerializedValue {
    /// Finite number; non-finite numbers and `-0` use [`SerializedValue::Special`]
    Number(f64),
    Bool(bool),
    Str(String),
    Special(SpecialValue),
    /// ISO-8601 date string
    Date(String),
    /// Decimal digits of a big integer
    BigInt(String),
    Url(String),
    RegExp { pattern: String, flags: String },
    Array(Vec<SerializedValue>),
    /// Key/value pairs in insertion order
    Object(Vec<(String, SerializedValue)>),
    /// Index into the enclosing argument's handle table
    Handle(usize),
}

impl SerializedValue {
    /// Wire JSON for this value.
    pub fn to_json(&self) -> Value {
        match self {
            SerializedValue::Number(n) => match serde_json::Number::from_f64(*n) {
                Some(number) if SpecialValue::for_number(*n).is_none() => json!({ "n": number }),
                _ => {
                    let special = SpecialValue::for_number(*n).unwrap_or(SpecialValue::NaN);
                    json!({ "v": special.as_str() })
                }
            },
            SerializedValue::Bool(b) => json!({ "b": b }),
            SerializedValue::Str(s) => json!({ "s": s }),
            SerializedValue::Special(special) => json!({ "v": special.as_str() }),
            SerializedValue::Date(d) => json!({ "d": d }),
            SerializedValue::BigInt(bi) => json!({ "bi": bi }),
            SerializedValue::Url(u) => json!({ "u": u }),
            SerializedValue::RegExp { pattern, flags } => {
                json!({ "r": { "p": pattern, "f": flags } })
            }
            SerializedValue::Array(items) => {
                json!({ "a": items.iter().map(Self::to_json).collect::<Vec<_>>() })
            }
            SerializedValue::Object(entries) => {
                let entries: Vec<Value> = entries
                    .iter()
                    .map(|(k, v)| json!({ "k": k, "v": v.to_json() }))
                    .collect();
                json!({ "o": entries })
            }
            SerializedValue::Handle(index) => json!({ "h": index }),
        }
    }

    /// Parses wire JSON, rejecting anything outside the grammar.
    pub fn from_json(value: &Value) -> Result<Self, ValueError> {
        let map = value
            .as_object()
            .ok_or_else(|| ValueError::NotAnObject(value.to_string()))?;

        let tag = single_tag(map)?;
        let inner = &map[tag];

        Ok(match tag {
            "n" => SerializedValue::Number(inner.as_f64().ok_or(ValueError::Malformed {
                tag: "n",
                expected: "a number",
            })?),
            "b" => SerializedValue::Bool(inner.as_bool().ok_or(ValueError::Malformed {
                tag: "b",
                expected: "a boolean",
            })?),
            "s" => SerializedValue::Str(expect_str(inner, "s")?),
            "v" => {
                let sentinel = inner.as_str().ok_or(ValueError::Malformed {
                    tag: "v",
                    expected: "a sentinel string",
                })?;
                SerializedValue::Special(
                    SpecialValue::parse(sentinel)
                        .ok_or_else(|| ValueError::UnknownSentinel(sentinel.to_string()))?,
                )
            }
            "d" => SerializedValue::Date(expect_str(inner, "d")?),
            "bi" => SerializedValue::BigInt(expect_str(inner, "bi")?),
            "u" => SerializedValue::Url(expect_str(inner, "u")?),
            "r" => SerializedValue::RegExp {
                pattern: expect_str(&inner["p"], "r")?,
                flags: inner
                    .get("f")
                    .map(|f| expect_str(f, "r"))
                    .transpose()?
                    .unwrap_or_default(),
            },
            "a" => {
                let items = inner.as_array().ok_or(ValueError::Malformed {
                    tag: "a",
                    expected: "an array",
                })?;
                SerializedValue::Array(items.iter().map(Self::from_json).collect::<Result<_, _>>()?)
            }
            "o" => {
                let entries = inner.as_array().ok_or(ValueError::Malformed {
                    tag: "o",
                    expected: "an array of {k, v}",
                })?;
                let mut out = Vec::with_capacity(entries.len());
                for entry in entries {
                    let key = entry.get("k").and_then(Value::as_str).ok_or(
                        ValueError::Malformed {
                            tag: "o",
                            expected: "a string key 'k'",
                        },
                    )?;
                    let value = entry.get("v").ok_or(ValueError::Malformed {
                        tag: "o",
                        expected: "a value 'v'",
                    })?;
                    out.push((key.to_string(), Self::from_json(value)?));
                }
                SerializedValue::Object(out)
            }
            "h" => SerializedValue::Handle(inner.as_u64().ok_or(ValueError::Malformed {
                tag: "h",
                expected: "a handle index",
            })? as usize),
            other => return Err(ValueError::UnknownTag(other.to_string())),
        })
    }
}

fn single_tag(map: &Map<String, Value>) -> Result<&str, ValueError> {
    let mut keys = map
        .keys()
        .map(String::as_str)
        .filter(|k| !(*k == "id" && (map.contains_key("a") || map.contains_key("o"))));
    match (keys.next(), keys.next()) {
        (None, _) => Err(ValueError::Empty),
        (Some(tag), None) => Ok(tag),
        (Some(_), Some(_)) => Err(ValueError::Ambiguous(
            map.keys().cloned().collect::<Vec<_>>().join(", "),
        )),
    }
}

fn expect_str(value: &Value, tag: &'static str) -> Result<String, ValueError> {
    value.as_str().map(str::to_string).ok_or(ValueError::Malformed {
        tag,
        expected: "a string",
    })
}

impl Serialize for SerializedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SerializedValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        SerializedValue::from_json(&value).map_err(D::Error::custom)
    }
}

/// Reference to a remote object carried alongside a serialized value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleRef {
    pub guid: String,
}

/// A value plus the handle table its `{"h": n}` entries index into.
///
/// This is the shape of the `arg` parameter of evaluation-style calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedArgument {
    pub value: SerializedValue,
    #[serde(default)]
    pub handles: Vec<HandleRef>,
}

impl SerializedArgument {
    /// An argument with no handles.
    pub fn plain(value: SerializedValue) -> Self {
        Self {
            value,
            handles: Vec::new(),
        }
    }
}
