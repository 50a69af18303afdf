use crate::decimal::Decimal;
use crate::temporal::{
    DateDuration, Datetime, Duration, LocalDate, LocalDatetime, LocalTime, RelativeDuration,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Server-assigned identity of a type descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TypeId(pub Uuid);

impl TypeId {
    /// Type of commands that produce no result, and of absent arguments.
    pub const NULL: TypeId = TypeId(Uuid::nil());
    /// The empty tuple, used for commands that take no arguments.
    pub const EMPTY_TUPLE: TypeId = TypeId::from_u128(0xFF);

    pub const fn from_u128(v: u128) -> Self {
        TypeId(Uuid::from_u128(v))
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        TypeId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL, or an empty result.
    Nothing,
    Uuid(Uuid),
    Str(String),
    Bytes(Vec<u8>),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    BigInt(Decimal),
    Decimal(Decimal),
    Bool(bool),
    Datetime(Datetime),
    LocalDatetime(LocalDatetime),
    LocalDate(LocalDate),
    LocalTime(LocalTime),
    Duration(Duration),
    RelativeDuration(RelativeDuration),
    DateDuration(DateDuration),
    Json(String),
    Enum(String),
    Array(Vec<Value>),
    Set(Vec<Value>),
    Tuple(Vec<Value>),
    Record(Record),
    Range(Range),
}

impl Value {
    pub fn is_nothing(&self) -> bool {
        matches!(self, Value::Nothing)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Nothing => "nothing",
            Value::Uuid(_) => "uuid",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Int16(_) => "int16",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Float32(_) => "float32",
            Value::Float64(_) => "float64",
            Value::BigInt(_) => "bigint",
            Value::Decimal(_) => "decimal",
            Value::Bool(_) => "bool",
            Value::Datetime(_) => "datetime",
            Value::LocalDatetime(_) => "local_datetime",
            Value::LocalDate(_) => "local_date",
            Value::LocalTime(_) => "local_time",
            Value::Duration(_) => "duration",
            Value::RelativeDuration(_) => "relative_duration",
            Value::DateDuration(_) => "date_duration",
            Value::Json(_) => "json",
            Value::Enum(_) => "enum",
            Value::Array(_) => "array",
            Value::Set(_) => "set",
            Value::Tuple(_) => "tuple",
            Value::Record(_) => "record",
            Value::Range(_) => "range",
        }
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Nothing)
    }
}

/// Labeled tuple. Field order follows the wire; a NULL field is present with
/// [`Value::Nothing`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(field, _)| field == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub lower: Option<Box<Value>>,
    pub upper: Option<Box<Value>>,
    pub inc_lower: bool,
    pub inc_upper: bool,
    pub empty: bool,
}

impl Range {
    pub fn empty() -> Self {
        Self {
            lower: None,
            upper: None,
            inc_lower: false,
            inc_upper: false,
            empty: true,
        }
    }

    /// `[lower, upper)`, the canonical form for discrete ranges.
    pub fn new(lower: Option<Value>, upper: Option<Value>) -> Self {
        Self {
            inc_lower: lower.is_some(),
            lower: lower.map(Box::new),
            upper: upper.map(Box::new),
            inc_upper: false,
            empty: false,
        }
    }
}
