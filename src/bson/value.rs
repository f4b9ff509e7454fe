use std::cmp::Ordering;
use std::fmt;

use uuid::Uuid;

use super::date_time::DateTime;
use super::decimal::Decimal;
use super::document::{Array, Document};
use super::object_id::ObjectId;
use crate::config::Collation;

// ============================================================================
// Value - the dynamic scalar/container union
// ============================================================================

/// Dynamically typed document value.
///
/// Comparison between different kinds orders by a fixed rank (Min first, Max
/// last, all numerics sharing one rank and comparing numerically); strings
/// compare under the active collation.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Decimal(Decimal),
    String(String),
    Binary(Vec<u8>),
    ObjectId(ObjectId),
    Guid(Uuid),
    DateTime(DateTime),
    Document(Document),
    Array(Array),
    Vector(Vec<f32>),
    MinValue,
    MaxValue,
}

/// On-disk type tags. Stable: these bytes are part of the file format.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ValueTag {
    Null = 0,
    Boolean = 1,
    Int32 = 2,
    Int64 = 3,
    Double = 4,
    Decimal = 5,
    String = 6,
    Binary = 7,
    ObjectId = 8,
    Guid = 9,
    DateTime = 10,
    Document = 11,
    Array = 12,
    Vector = 13,
    MinValue = 14,
    MaxValue = 15,
}

impl ValueTag {
    pub fn from_u8(byte: u8) -> Option<ValueTag> {
        use ValueTag::*;
        Some(match byte {
            0 => Null,
            1 => Boolean,
            2 => Int32,
            3 => Int64,
            4 => Double,
            5 => Decimal,
            6 => String,
            7 => Binary,
            8 => ObjectId,
            9 => Guid,
            10 => DateTime,
            11 => Document,
            12 => Array,
            13 => Vector,
            14 => MinValue,
            15 => MaxValue,
            _ => return None,
        })
    }
}

impl Value {
    pub fn tag(&self) -> ValueTag {
        match self {
            Value::Null => ValueTag::Null,
            Value::Boolean(_) => ValueTag::Boolean,
            Value::Int32(_) => ValueTag::Int32,
            Value::Int64(_) => ValueTag::Int64,
            Value::Double(_) => ValueTag::Double,
            Value::Decimal(_) => ValueTag::Decimal,
            Value::String(_) => ValueTag::String,
            Value::Binary(_) => ValueTag::Binary,
            Value::ObjectId(_) => ValueTag::ObjectId,
            Value::Guid(_) => ValueTag::Guid,
            Value::DateTime(_) => ValueTag::DateTime,
            Value::Document(_) => ValueTag::Document,
            Value::Array(_) => ValueTag::Array,
            Value::Vector(_) => ValueTag::Vector,
            Value::MinValue => ValueTag::MinValue,
            Value::MaxValue => ValueTag::MaxValue,
        }
    }

    /// Cross-kind ordering rank. Numerics share a rank so they compare by
    /// numeric value; Min and Max bracket everything.
    fn sort_rank(&self) -> u8 {
        match self {
            Value::MinValue => 0,
            Value::Null => 1,
            Value::Int32(_) | Value::Int64(_) | Value::Double(_) | Value::Decimal(_) => 2,
            Value::String(_) => 3,
            Value::Document(_) => 4,
            Value::Array(_) => 5,
            Value::Binary(_) => 6,
            Value::Vector(_) => 7,
            Value::ObjectId(_) => 8,
            Value::Guid(_) => 9,
            Value::Boolean(_) => 10,
            Value::DateTime(_) => 11,
            Value::MaxValue => 12,
        }
    }

    // ------------------------------------------------------------------
    // Kind probes and conversions
    // ------------------------------------------------------------------

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::Int32(_) | Value::Int64(_) | Value::Double(_) | Value::Decimal(_)
        )
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            Value::Int64(v) => i32::try_from(*v).ok(),
            Value::Double(v) => Some(*v as i32),
            Value::Decimal(d) => i32::try_from(d.to_i64()).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            Value::Double(v) => Some(*v as i64),
            Value::Decimal(d) => Some(d.to_i64()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::Decimal(d) => Some(d.to_f64()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            Value::Vector(v) => Some(v),
            _ => None,
        }
    }

    /// Coerce to a float vector: native vectors pass through, numeric arrays
    /// convert elementwise.
    pub fn to_vector(&self) -> Option<Vec<f32>> {
        match self {
            Value::Vector(v) => Some(v.clone()),
            Value::Array(arr) => arr
                .iter()
                .map(|v| v.as_f64().map(|f| f as f32))
                .collect::<Option<Vec<f32>>>(),
            _ => None,
        }
    }

    /// Truthiness used by filter predicates: only `true` passes.
    pub fn is_truthy(&self) -> bool {
        matches!(self, Value::Boolean(true))
    }

    // ------------------------------------------------------------------
    // Ordering
    // ------------------------------------------------------------------

    /// Total order under a collation. Numerics compare numerically across
    /// kinds; everything else compares within its rank.
    pub fn total_cmp(&self, other: &Value, collation: &Collation) -> Ordering {
        let (ra, rb) = (self.sort_rank(), other.sort_rank());
        if ra != rb {
            return ra.cmp(&rb);
        }

        match (self, other) {
            (Value::MinValue, Value::MinValue)
            | (Value::MaxValue, Value::MaxValue)
            | (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => collation.compare(a, b),
            (Value::Binary(a), Value::Binary(b)) => a.cmp(b),
            (Value::ObjectId(a), Value::ObjectId(b)) => a.cmp(b),
            (Value::Guid(a), Value::Guid(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Document(a), Value::Document(b)) => a.cmp_with(b, collation),
            (Value::Array(a), Value::Array(b)) => a.cmp_with(b, collation),
            (Value::Vector(a), Value::Vector(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.total_cmp(y) {
                        Ordering::Equal => continue,
                        ord => return ord,
                    }
                }
                a.len().cmp(&b.len())
            }
            _ if self.is_numeric() && other.is_numeric() => self.numeric_cmp(other),
            _ => Ordering::Equal,
        }
    }

    fn numeric_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Decimal(a), _) => a.cmp(&to_decimal(other)),
            (_, Value::Decimal(b)) => to_decimal(self).cmp(b),
            (Value::Double(_), _) | (_, Value::Double(_)) => {
                let a = self.as_f64().unwrap_or(f64::NAN);
                let b = other.as_f64().unwrap_or(f64::NAN);
                a.total_cmp(&b)
            }
            _ => {
                let a = self.as_i64().unwrap_or(0);
                let b = other.as_i64().unwrap_or(0);
                a.cmp(&b)
            }
        }
    }

    pub fn eq_with(&self, other: &Value, collation: &Collation) -> bool {
        self.total_cmp(other, collation) == Ordering::Equal
    }

    // ------------------------------------------------------------------
    // Arithmetic with numeric promotion
    // ------------------------------------------------------------------

    /// `+` also concatenates strings; any other non-numeric operand yields
    /// Null.
    pub fn add(&self, other: &Value) -> Value {
        if let (Value::String(a), Value::String(b)) = (self, other) {
            return Value::String(format!("{a}{b}"));
        }
        self.numeric_op(other, i32::checked_add, i64::checked_add, |a, b| a + b, Decimal::checked_add)
    }

    pub fn sub(&self, other: &Value) -> Value {
        self.numeric_op(other, i32::checked_sub, i64::checked_sub, |a, b| a - b, Decimal::checked_sub)
    }

    pub fn mul(&self, other: &Value) -> Value {
        self.numeric_op(other, i32::checked_mul, i64::checked_mul, |a, b| a * b, Decimal::checked_mul)
    }

    pub fn div(&self, other: &Value) -> Value {
        if !self.is_numeric() || !other.is_numeric() {
            return Value::Null;
        }
        match (self, other) {
            (Value::Decimal(_), _) | (_, Value::Decimal(_)) => to_decimal(self)
                .checked_div(to_decimal(other))
                .map(Value::Decimal)
                .unwrap_or(Value::Null),
            _ => {
                let b = other.as_f64().unwrap_or(0.0);
                if b == 0.0 {
                    Value::Null
                } else {
                    Value::Double(self.as_f64().unwrap_or(0.0) / b)
                }
            }
        }
    }

    pub fn rem(&self, other: &Value) -> Value {
        match (self.as_i64(), other.as_i64()) {
            (Some(a), Some(b)) if b != 0 => Value::Int64(a % b),
            _ => Value::Null,
        }
    }

    fn numeric_op(
        &self,
        other: &Value,
        op32: fn(i32, i32) -> Option<i32>,
        op64: fn(i64, i64) -> Option<i64>,
        opf: fn(f64, f64) -> f64,
        opd: fn(Decimal, Decimal) -> Decimal,
    ) -> Value {
        if !self.is_numeric() || !other.is_numeric() {
            return Value::Null;
        }
        match (self, other) {
            (Value::Decimal(_), _) | (_, Value::Decimal(_)) => {
                Value::Decimal(opd(to_decimal(self), to_decimal(other)))
            }
            (Value::Double(_), _) | (_, Value::Double(_)) => Value::Double(opf(
                self.as_f64().unwrap_or(0.0),
                other.as_f64().unwrap_or(0.0),
            )),
            (Value::Int64(_), _) | (_, Value::Int64(_)) => {
                match op64(self.as_i64().unwrap_or(0), other.as_i64().unwrap_or(0)) {
                    Some(v) => Value::Int64(v),
                    None => Value::Null,
                }
            }
            (Value::Int32(a), Value::Int32(b)) => match op32(*a, *b) {
                Some(v) => Value::Int32(v),
                // overflow widens, matching the promotion ladder
                None => match op64(*a as i64, *b as i64) {
                    Some(v) => Value::Int64(v),
                    None => Value::Null,
                },
            },
            _ => Value::Null,
        }
    }
}

fn to_decimal(value: &Value) -> Decimal {
    match value {
        Value::Decimal(d) => *d,
        Value::Int32(v) => Decimal::from_i64(*v as i64),
        Value::Int64(v) => Decimal::from_i64(*v),
        Value::Double(v) => Decimal::from_f64(*v),
        _ => Decimal::ZERO,
    }
}

// Equality/ordering with the ordinal collation, for containers and tests.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.total_cmp(other, &Collation::ordinal()) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.total_cmp(other, &Collation::ordinal()))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.total_cmp(other, &Collation::ordinal())
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
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
        Value::Double(v)
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

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Value::ObjectId(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Guid(v)
    }
}

impl From<DateTime> for Value {
    fn from(v: DateTime) -> Self {
        Value::DateTime(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<Document> for Value {
    fn from(v: Document) -> Self {
        Value::Document(v)
    }
}

impl From<Array> for Value {
    fn from(v: Array) -> Self {
        Value::Array(v)
    }
}

impl From<Vec<f32>> for Value {
    fn from(v: Vec<f32>) -> Self {
        Value::Vector(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Binary(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::String(s) => write!(f, "\"{s}\""),
            Value::Binary(b) => write!(f, "binary({})", b.len()),
            Value::ObjectId(id) => write!(f, "{id}"),
            Value::Guid(g) => write!(f, "{g}"),
            Value::DateTime(dt) => write!(f, "{dt}"),
            Value::Document(d) => write!(f, "{d}"),
            Value::Array(a) => write!(f, "{a}"),
            Value::Vector(v) => write!(f, "vector({})", v.len()),
            Value::MinValue => write!(f, "$min"),
            Value::MaxValue => write!(f, "$max"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_kind_rank_ordering() {
        assert!(Value::MinValue < Value::Null);
        assert!(Value::Null < Value::Int32(0));
        assert!(Value::Int32(1) < Value::String("a".into()));
        assert!(Value::String("z".into()) < Value::Boolean(false));
        assert!(Value::Boolean(true) < Value::MaxValue);
    }

    #[test]
    fn numerics_compare_across_kinds() {
        assert_eq!(Value::Int32(5), Value::Int64(5));
        assert_eq!(Value::Int64(2), Value::Double(2.0));
        assert!(Value::Double(1.5) < Value::Int32(2));
        assert_eq!(Value::Decimal("2.0".parse().unwrap()), Value::Int32(2));
    }

    #[test]
    fn promotion_ladder() {
        assert_eq!(Value::Int32(1).add(&Value::Int32(2)), Value::Int32(3));
        assert_eq!(
            Value::Int32(1).add(&Value::Int64(2)),
            Value::Int64(3)
        );
        assert_eq!(
            Value::Int32(1).add(&Value::Double(0.5)),
            Value::Double(1.5)
        );
        assert_eq!(
            Value::Int32(i32::MAX).add(&Value::Int32(1)),
            Value::Int64(i32::MAX as i64 + 1)
        );
        assert_eq!(Value::Int32(3).div(&Value::Int32(2)), Value::Double(1.5));
    }

    #[test]
    fn string_concat_and_null_propagation() {
        assert_eq!(
            Value::from("ab").add(&Value::from("cd")),
            Value::from("abcd")
        );
        assert_eq!(Value::from("ab").mul(&Value::Int32(3)), Value::Null);
        assert_eq!(Value::Int32(1).div(&Value::Int32(0)), Value::Null);
    }
}
