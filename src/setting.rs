//! The setting record and its value codec.
//!
//! A setting is a key, a type tag and a value. The tag decides how the value
//! is written to the `value` column and how it is read back:
//!
//! | tag          | stored as                  |
//! |--------------|----------------------------|
//! | `bool`       | integer `1` / `0`          |
//! | `float32`    | shortest round-trip text   |
//! | `int32`      | integer                    |
//! | `int64`      | integer                    |
//! | `string`     | text                       |
//! | `string-set` | JSON array text            |
//! | `opaque`     | blob                       |
//!
//! The `value` column has TEXT affinity, so numeric values come back as text
//! from SQLite; decoding accepts any storage class that parses.

use std::collections::BTreeSet;
use std::fmt;

use rusqlite::types::Value;
use serde::Serialize;

use crate::error::{Error, Result};

/// Row id of a setting that has never been persisted.
pub const NO_ID: i64 = -1;

/// Type tag of a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Bool,
    Float,
    Int,
    Long,
    String,
    StringSet,
    Opaque,
}

impl ValueType {
    pub const ALL: [ValueType; 7] = [
        ValueType::Bool,
        ValueType::Float,
        ValueType::Int,
        ValueType::Long,
        ValueType::String,
        ValueType::StringSet,
        ValueType::Opaque,
    ];

    /// Tag written to the `type` column.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Float => "float32",
            Self::Int => "int32",
            Self::Long => "int64",
            Self::String => "string",
            Self::StringSet => "string-set",
            Self::Opaque => "opaque",
        }
    }

    /// Map a stored tag back to its type. Unknown tags are opaque.
    pub fn from_tag(tag: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|t| t.tag() == tag)
            .unwrap_or(Self::Opaque)
    }

    /// Like [`ValueType::from_tag`] but rejects unknown tags.
    pub fn parse_tag(tag: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.tag() == tag)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown value type {tag:?}")))
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A setting value.
///
/// Floats compare by bit pattern, so `NaN` equals itself.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "value")]
pub enum SettingValue {
    #[serde(rename = "bool")]
    Bool(bool),
    #[serde(rename = "float32")]
    Float(f32),
    #[serde(rename = "int32")]
    Int(i32),
    #[serde(rename = "int64")]
    Long(i64),
    #[serde(rename = "string")]
    String(String),
    #[serde(rename = "string-set")]
    StringSet(BTreeSet<String>),
    #[serde(rename = "opaque")]
    Opaque(Vec<u8>),
}

impl PartialEq for SettingValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Long(a), Self::Long(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::StringSet(a), Self::StringSet(b)) => a == b,
            (Self::Opaque(a), Self::Opaque(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for SettingValue {}

impl SettingValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Bool(_) => ValueType::Bool,
            Self::Float(_) => ValueType::Float,
            Self::Int(_) => ValueType::Int,
            Self::Long(_) => ValueType::Long,
            Self::String(_) => ValueType::String,
            Self::StringSet(_) => ValueType::StringSet,
            Self::Opaque(_) => ValueType::Opaque,
        }
    }

    /// Encode for the `value` column.
    pub fn encode(&self) -> Result<Value> {
        Ok(match self {
            Self::Bool(b) => Value::Integer(i64::from(*b)),
            Self::Float(f) => Value::Text(f.to_string()),
            Self::Int(i) => Value::Integer(i64::from(*i)),
            Self::Long(l) => Value::Integer(*l),
            Self::String(s) => Value::Text(s.clone()),
            Self::StringSet(set) => Value::Text(serde_json::to_string(set)?),
            Self::Opaque(bytes) => Value::Blob(bytes.clone()),
        })
    }

    /// Decode a raw column value according to its type tag.
    pub fn decode(value_type: ValueType, raw: Value) -> Result<Self> {
        if let Value::Null = raw {
            return Err(Error::Serialization(format!(
                "missing value for {value_type} setting"
            )));
        }

        match value_type {
            ValueType::Bool => match integer(&raw)? {
                1 => Ok(Self::Bool(true)),
                0 => Ok(Self::Bool(false)),
                other => Err(Error::Serialization(format!(
                    "invalid boolean value {other}"
                ))),
            },
            ValueType::Float => float(&raw).map(Self::Float),
            ValueType::Int => {
                let wide = integer(&raw)?;
                i32::try_from(wide)
                    .map(Self::Int)
                    .map_err(|_| Error::Serialization(format!("{wide} overflows int32")))
            }
            ValueType::Long => integer(&raw).map(Self::Long),
            ValueType::String => match raw {
                Value::Text(s) => Ok(Self::String(s)),
                Value::Integer(i) => Ok(Self::String(i.to_string())),
                Value::Real(f) => Ok(Self::String(f.to_string())),
                Value::Blob(bytes) => String::from_utf8(bytes)
                    .map(Self::String)
                    .map_err(|e| Error::Serialization(e.to_string())),
                other => Err(unexpected(ValueType::String, &other)),
            },
            ValueType::StringSet => match raw {
                Value::Text(s) => Ok(Self::StringSet(serde_json::from_str(&s)?)),
                other => Err(unexpected(ValueType::StringSet, &other)),
            },
            ValueType::Opaque => match raw {
                Value::Blob(bytes) => Ok(Self::Opaque(bytes)),
                Value::Text(s) => Ok(Self::Opaque(s.into_bytes())),
                other => Err(unexpected(ValueType::Opaque, &other)),
            },
        }
    }

    /// Parse a value from its textual form, as typed on a command line.
    pub fn parse(value_type: ValueType, text: &str) -> Result<Self> {
        let bad = |e: &dyn fmt::Display| {
            Error::InvalidArgument(format!("{text:?} is not a valid {value_type}: {e}"))
        };
        match value_type {
            ValueType::Bool => text.parse().map(Self::Bool).map_err(|e| bad(&e)),
            ValueType::Float => text.parse().map(Self::Float).map_err(|e| bad(&e)),
            ValueType::Int => text.parse().map(Self::Int).map_err(|e| bad(&e)),
            ValueType::Long => text.parse().map(Self::Long).map_err(|e| bad(&e)),
            ValueType::String => Ok(Self::String(text.to_string())),
            ValueType::StringSet => Ok(Self::StringSet(
                text.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            )),
            ValueType::Opaque => Ok(Self::Opaque(text.as_bytes().to_vec())),
        }
    }

    /// Build a value from a JSON document, as found in import files.
    pub fn from_json(value_type: ValueType, json: &serde_json::Value) -> Result<Self> {
        use serde_json::Value as Json;

        let mismatch = || {
            Error::InvalidArgument(format!("JSON value {json} is not a valid {value_type}"))
        };
        match (value_type, json) {
            (ValueType::Bool, Json::Bool(b)) => Ok(Self::Bool(*b)),
            (ValueType::Float, Json::Number(n)) => {
                n.as_f64().map(|f| Self::Float(f as f32)).ok_or_else(mismatch)
            }
            (ValueType::Int, Json::Number(n)) => n
                .as_i64()
                .and_then(|i| i32::try_from(i).ok())
                .map(Self::Int)
                .ok_or_else(mismatch),
            (ValueType::Long, Json::Number(n)) => n.as_i64().map(Self::Long).ok_or_else(mismatch),
            (ValueType::String, Json::String(s)) => Ok(Self::String(s.clone())),
            (ValueType::StringSet, Json::Array(items)) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect::<Option<BTreeSet<_>>>()
                .map(Self::StringSet)
                .ok_or_else(mismatch),
            (ValueType::Opaque, Json::String(s)) => Ok(Self::Opaque(s.as_bytes().to_vec())),
            (ValueType::Opaque, Json::Array(_)) => Ok(Self::Opaque(
                serde_json::from_value(json.clone()).map_err(|_| mismatch())?,
            )),
            _ => Err(mismatch()),
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Long(l) => write!(f, "{l}"),
            Self::String(s) => f.write_str(s),
            Self::StringSet(set) => {
                let joined: Vec<&str> = set.iter().map(String::as_str).collect();
                write!(f, "{}", joined.join(","))
            }
            Self::Opaque(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f32> for SettingValue {
    fn from(value: f32) -> Self {
        Self::Float(value)
    }
}

impl From<i32> for SettingValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<BTreeSet<String>> for SettingValue {
    fn from(value: BTreeSet<String>) -> Self {
        Self::StringSet(value)
    }
}

impl From<Vec<u8>> for SettingValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Opaque(value)
    }
}

fn integer(raw: &Value) -> Result<i64> {
    match raw {
        Value::Integer(i) => Ok(*i),
        Value::Real(f) if f.fract() == 0.0 => Ok(*f as i64),
        Value::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| Error::Serialization(format!("{s:?} is not an integer"))),
        other => Err(Error::Serialization(format!(
            "expected an integer, found {}",
            storage_class(other)
        ))),
    }
}

fn float(raw: &Value) -> Result<f32> {
    match raw {
        Value::Real(f) => Ok(*f as f32),
        Value::Integer(i) => Ok(*i as f32),
        Value::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| Error::Serialization(format!("{s:?} is not a float"))),
        other => Err(Error::Serialization(format!(
            "expected a float, found {}",
            storage_class(other)
        ))),
    }
}

fn unexpected(value_type: ValueType, raw: &Value) -> Error {
    Error::Serialization(format!(
        "cannot decode {} as {value_type}",
        storage_class(raw)
    ))
}

fn storage_class(raw: &Value) -> &'static str {
    match raw {
        Value::Null => "NULL",
        Value::Integer(_) => "INTEGER",
        Value::Real(_) => "REAL",
        Value::Text(_) => "TEXT",
        Value::Blob(_) => "BLOB",
    }
}

/// A key-value pair, optionally bound to a stored row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Setting {
    pub id: i64,
    pub key: String,
    pub value: SettingValue,
}

impl Setting {
    /// A setting that has not been persisted yet.
    pub fn new(key: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        Self {
            id: NO_ID,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    pub fn is_persisted(&self) -> bool {
        self.id != NO_ID
    }

    pub fn value_type(&self) -> ValueType {
        self.value.value_type()
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[id={}, key={}, type={}, value={}]",
            self.id,
            self.key,
            self.value_type(),
            self.value
        )
    }
}

/// A settings row as read from storage, before its value is decoded.
#[derive(Debug, Clone)]
pub struct RawSetting {
    pub id: i64,
    pub key: String,
    pub type_tag: String,
    pub value: Value,
}

impl RawSetting {
    /// Read the `id, key, type, value` columns of a row, in that order.
    pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            key: row.get(1)?,
            type_tag: row.get(2)?,
            value: row.get(3)?,
        })
    }

    pub fn decode(self) -> Result<Setting> {
        let value_type = ValueType::from_tag(&self.type_tag);
        let value = SettingValue::decode(value_type, self.value).map_err(|e| match e {
            Error::Serialization(msg) => {
                Error::Serialization(format!("setting {:?}: {msg}", self.key))
            }
            other => other,
        })?;
        Ok(Setting {
            id: self.id,
            key: self.key,
            value,
        })
    }
}
