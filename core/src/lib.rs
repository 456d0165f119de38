//! Typed values for pagedb.
//!
//! Values are the keys of the primary index and the columns of table rows.
//! Every value serializes as `[type:i32][bytes]` (big-endian), where the type
//! tag is [`NULL_TAG`] for an absent value, so a sequence of encoded values is
//! self-describing.

use bytes::{Buf, BufMut};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Type tag written in place of a real type for a NULL value.
pub const NULL_TAG: i32 = -1;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    #[error("unknown value type tag {0}")]
    UnknownType(i32),

    #[error("truncated value: needed {needed} bytes, {available} left")]
    Truncated { needed: usize, available: usize },

    #[error("string value is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid decimal literal {0:?}")]
    InvalidDecimal(String),

    #[error("negative length prefix {0}")]
    NegativeLength(i32),
}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Bytes = 1,
    Boolean = 2,
    Short = 3,
    Int = 4,
    Long = 5,
    Double = 6,
    Decimal = 7,
    String = 8,
}

impl ValueType {
    pub fn tag(self) -> i32 {
        self as i32
    }

    pub fn from_tag(tag: i32) -> Result<Self, ValueError> {
        Ok(match tag {
            1 => ValueType::Bytes,
            2 => ValueType::Boolean,
            3 => ValueType::Short,
            4 => ValueType::Int,
            5 => ValueType::Long,
            6 => ValueType::Double,
            7 => ValueType::Decimal,
            8 => ValueType::String,
            other => return Err(ValueError::UnknownType(other)),
        })
    }

    pub fn is_integral(self) -> bool {
        matches!(
            self,
            ValueType::Boolean | ValueType::Short | ValueType::Int | ValueType::Long
        )
    }

    /// Width of the payload for fixed-size types.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            ValueType::Boolean => Some(1),
            ValueType::Short => Some(2),
            ValueType::Int => Some(4),
            ValueType::Long | ValueType::Double => Some(8),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Bytes => write!(f, "BYTES"),
            ValueType::Boolean => write!(f, "BOOLEAN"),
            ValueType::Short => write!(f, "SHORT"),
            ValueType::Int => write!(f, "INT"),
            ValueType::Long => write!(f, "LONG"),
            ValueType::Double => write!(f, "DOUBLE"),
            ValueType::Decimal => write!(f, "DECIMAL"),
            ValueType::String => write!(f, "STRING"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bytes(Vec<u8>),
    Boolean(bool),
    Short(i16),
    Int(i32),
    Long(i64),
    Double(f64),
    Decimal(Decimal),
    String(String),
}

impl Value {
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Null => None,
            Value::Bytes(_) => Some(ValueType::Bytes),
            Value::Boolean(_) => Some(ValueType::Boolean),
            Value::Short(_) => Some(ValueType::Short),
            Value::Int(_) => Some(ValueType::Int),
            Value::Long(_) => Some(ValueType::Long),
            Value::Double(_) => Some(ValueType::Double),
            Value::Decimal(_) => Some(ValueType::Decimal),
            Value::String(_) => Some(ValueType::String),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_compatible(&self, value_type: ValueType) -> bool {
        match self.value_type() {
            None => true,
            Some(t) => t == value_type,
        }
    }

    /// Number of bytes [`Value::encode`] produces, type tag included.
    pub fn encoded_len(&self) -> usize {
        4 + match self {
            Value::Null => 0,
            Value::Bytes(b) => 4 + b.len(),
            Value::Boolean(_) => 1,
            Value::Short(_) => 2,
            Value::Int(_) => 4,
            Value::Long(_) | Value::Double(_) => 8,
            Value::Decimal(d) => 4 + d.to_string().len(),
            Value::String(s) => 4 + s.len(),
        }
    }

    pub fn encode<B: BufMut>(&self, out: &mut B) {
        out.put_i32(self.value_type().map_or(NULL_TAG, ValueType::tag));
        match self {
            Value::Null => {}
            Value::Bytes(b) => {
                out.put_i32(b.len() as i32);
                out.put_slice(b);
            }
            Value::Boolean(v) => out.put_u8(u8::from(*v)),
            Value::Short(v) => out.put_i16(*v),
            Value::Int(v) => out.put_i32(*v),
            Value::Long(v) => out.put_i64(*v),
            Value::Double(v) => out.put_f64(*v),
            Value::Decimal(d) => {
                let plain = d.to_string();
                out.put_i32(plain.len() as i32);
                out.put_slice(plain.as_bytes());
            }
            Value::String(s) => {
                out.put_i32(s.len() as i32);
                out.put_slice(s.as_bytes());
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode(&mut out);
        out
    }

    /// Decodes one value, advancing `buf` past it.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Value, ValueError> {
        let tag = get_i32(buf)?;
        if tag == NULL_TAG {
            return Ok(Value::Null);
        }
        Self::decode_typed(ValueType::from_tag(tag)?, buf)
    }

    /// Decodes the payload of a value whose type tag was already consumed.
    pub fn decode_typed<B: Buf>(value_type: ValueType, buf: &mut B) -> Result<Value, ValueError> {
        if let Some(width) = value_type.fixed_size() {
            need(buf, width)?;
        }
        Ok(match value_type {
            ValueType::Bytes => Value::Bytes(get_prefixed(buf)?),
            ValueType::Boolean => Value::Boolean(buf.get_u8() == 1),
            ValueType::Short => Value::Short(buf.get_i16()),
            ValueType::Int => Value::Int(buf.get_i32()),
            ValueType::Long => Value::Long(buf.get_i64()),
            ValueType::Double => Value::Double(buf.get_f64()),
            ValueType::Decimal => {
                let raw = String::from_utf8(get_prefixed(buf)?)
                    .map_err(|_| ValueError::InvalidUtf8)?;
                let d = Decimal::from_str(&raw).map_err(|_| ValueError::InvalidDecimal(raw))?;
                Value::Decimal(d)
            }
            ValueType::String => Value::String(
                String::from_utf8(get_prefixed(buf)?).map_err(|_| ValueError::InvalidUtf8)?,
            ),
        })
    }

    /// Three-way comparison used for index ordering.
    ///
    /// NULL sorts before everything. Integral types compare exactly across
    /// widths. Comparisons involving a DOUBLE truncate the difference to an
    /// integer, so doubles closer than 1.0 compare equal.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Decimal(a), Value::Decimal(b)) => a.cmp(b),
            _ => match (self.as_i64(), other.as_i64()) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => match (self.as_f64(), other.as_f64()) {
                    (Some(a), Some(b)) => truncated_compare(a, b),
                    _ => self.type_rank().cmp(&other.type_rank()),
                },
            },
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Boolean(v) => Some(i64::from(*v)),
            Value::Short(v) => Some(i64::from(*v)),
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Decimal(d) => d.to_f64(),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    fn type_rank(&self) -> i32 {
        self.value_type().map_or(NULL_TAG, ValueType::tag)
    }
}

fn truncated_compare(a: f64, b: f64) -> Ordering {
    if a > 0.0 && b < 0.0 {
        Ordering::Greater
    } else if b > 0.0 && a < 0.0 {
        Ordering::Less
    } else {
        ((a - b) as i64).cmp(&0)
    }
}

fn need<B: Buf>(buf: &B, needed: usize) -> Result<(), ValueError> {
    if buf.remaining() < needed {
        return Err(ValueError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn get_i32<B: Buf>(buf: &mut B) -> Result<i32, ValueError> {
    need(buf, 4)?;
    Ok(buf.get_i32())
}

fn get_prefixed<B: Buf>(buf: &mut B) -> Result<Vec<u8>, ValueError> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Err(ValueError::NegativeLength(len));
    }
    need(buf, len as usize)?;
    let mut data = vec![0u8; len as usize];
    buf.copy_to_slice(&mut data);
    Ok(data)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Short(i) => write!(f, "{}", i),
            Value::Int(i) => write!(f, "{}", i),
            Value::Long(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{}", d),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::String(s) => write!(f, "'{}'", s),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
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
