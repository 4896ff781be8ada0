//! Field lookup on supplier result items.
//!
//! Items are read through their serde representation, so maps, structs and
//! tuple structs can all be correlated without a hand-written getter. The
//! lookup strategy is chosen once per batch from the shape of its first item.

use coalesce_core::{CoalesceError, CoalesceResult};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accessor {
    /// Items serializing to a map: maps and structs with named fields.
    Keyed,
    /// Items serializing to a sequence: tuples and tuple structs, addressed
    /// by position (`"0"`, `"1"`, ...).
    Positional,
}

impl Accessor {
    pub fn detect(first: &Value) -> CoalesceResult<Self> {
        match first {
            Value::Object(_) => Ok(Self::Keyed),
            Value::Array(_) => Ok(Self::Positional),
            other => Err(CoalesceError::Config(format!(
                "batch items have no fields to join on: {other}"
            ))),
        }
    }

    pub fn get<'a>(self, item: &'a Value, field: &str) -> Option<&'a Value> {
        match self {
            Self::Keyed => item.as_object()?.get(field),
            Self::Positional => item.as_array()?.get(field.parse::<usize>().ok()?),
        }
    }
}

/// Correlation key of a request argument or of an item's join field.
///
/// Two values join when their canonical JSON text is equal, so `1` and
/// `"1"` do not match, and neither do `1` and `1.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JoinKey(String);

impl JoinKey {
    pub fn of(value: &Value) -> Self {
        Self(value.to_string())
    }

    pub fn from_arg<A: Serialize>(arg: &A) -> CoalesceResult<Self> {
        Ok(Self::of(&serde_json::to_value(arg)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
