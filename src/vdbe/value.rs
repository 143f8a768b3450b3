//! Register value semantics
//!
//! Ordering, collation, affinity coercion and arithmetic on `Value`s as the
//! engine applies them. Values of different storage classes order as
//! NULL < INTEGER/REAL < TEXT < BLOB; numbers compare numerically across
//! the integer/real divide.

use std::cmp::Ordering;

use crate::error::{Error, ErrorCode, Result};
use crate::schema::Affinity;
use crate::types::{is_numeric_text, real_to_i64, text_to_numeric, Value};

// ============================================================================
// Collation
// ============================================================================

/// Built-in collating sequences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Collation {
    #[default]
    Binary,
    NoCase,
    RTrim,
}

impl Collation {
    /// Look up a collation by (case-insensitive) name
    pub fn from_name(name: &str) -> Option<Collation> {
        match name.to_ascii_uppercase().as_str() {
            "BINARY" => Some(Collation::Binary),
            "NOCASE" => Some(Collation::NoCase),
            "RTRIM" => Some(Collation::RTrim),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Collation::Binary => "BINARY",
            Collation::NoCase => "NOCASE",
            Collation::RTrim => "RTRIM",
        }
    }

    /// Small integer encoding carried in an instruction operand
    pub fn code(&self) -> i32 {
        match self {
            Collation::Binary => 0,
            Collation::NoCase => 1,
            Collation::RTrim => 2,
        }
    }

    pub fn from_code(code: i32) -> Collation {
        match code {
            1 => Collation::NoCase,
            2 => Collation::RTrim,
            _ => Collation::Binary,
        }
    }

    /// Compare two strings under this collation
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        match self {
            Collation::Binary => a.as_bytes().cmp(b.as_bytes()),
            Collation::NoCase => {
                let la = a.bytes().map(|c| c.to_ascii_lowercase());
                let lb = b.bytes().map(|c| c.to_ascii_lowercase());
                la.cmp(lb)
            }
            Collation::RTrim => a.trim_end_matches(' ').as_bytes().cmp(b.trim_end_matches(' ').as_bytes()),
        }
    }
}

/// Looks up a collation, failing with the usual message
pub fn collation_or_error(name: &str) -> Result<Collation> {
    Collation::from_name(name)
        .ok_or_else(|| Error::sql(format!("no such collation sequence: {}", name)))
}

// ============================================================================
// Comparison
// ============================================================================

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Integer(_) | Value::Real(_) => 1,
        Value::Text(_) => 2,
        Value::Blob(_) => 3,
    }
}

fn compare_numbers(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => x.cmp(y),
        (Value::Integer(x), Value::Real(y)) => compare_int_real(*x, *y),
        (Value::Real(x), Value::Integer(y)) => compare_int_real(*y, *x).reverse(),
        (Value::Real(x), Value::Real(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    }
}

fn compare_int_real(i: i64, r: f64) -> Ordering {
    if r.is_nan() {
        return Ordering::Greater;
    }
    if r < -9.223372036854775808e18 {
        return Ordering::Greater;
    }
    if r >= 9.223372036854775807e18 {
        return Ordering::Less;
    }
    let ri = r as i64;
    match i.cmp(&ri) {
        Ordering::Equal => {
            let frac = r - ri as f64;
            if frac > 0.0 {
                Ordering::Less
            } else if frac < 0.0 {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        other => other,
    }
}

/// Total order over values used by indexes, sorters and comparisons
pub fn compare_values(a: &Value, b: &Value, coll: Collation) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Text(x), Value::Text(y)) => coll.compare(x, y),
        (Value::Blob(x), Value::Blob(y)) => x.cmp(y),
        _ => compare_numbers(a, b),
    }
}

/// Compare two keys field by field under a KeyInfo-like description
///
/// Only the first `n` fields are compared; a shorter key that is a prefix
/// of the longer one compares equal.
pub fn compare_keys(
    a: &[Value],
    b: &[Value],
    n: usize,
    collation_of: impl Fn(usize) -> Collation,
    desc_of: impl Fn(usize) -> bool,
) -> Ordering {
    let limit = n.min(a.len()).min(b.len());
    for i in 0..limit {
        let mut ord = compare_values(&a[i], &b[i], collation_of(i));
        if desc_of(i) {
            ord = ord.reverse();
        }
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

// ============================================================================
// Affinity
// ============================================================================

/// Coerce a value toward an affinity, never losing information
pub fn apply_affinity(v: Value, aff: Affinity) -> Value {
    match aff {
        Affinity::Blob => v,
        Affinity::Text => match v {
            Value::Integer(_) | Value::Real(_) => Value::Text(v.to_text()),
            other => other,
        },
        Affinity::Numeric | Affinity::Integer => match v {
            Value::Text(ref s) => match is_numeric_text(s) {
                Some(Value::Real(f)) => real_to_integer_if_exact(f),
                Some(n) => n,
                None => v,
            },
            Value::Real(f) => real_to_integer_if_exact(f),
            other => other,
        },
        Affinity::Real => match v {
            Value::Integer(i) => Value::Real(i as f64),
            Value::Text(ref s) => match is_numeric_text(s) {
                Some(n) => Value::Real(n.to_f64()),
                None => v,
            },
            other => other,
        },
    }
}

fn real_to_integer_if_exact(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        Value::Integer(f as i64)
    } else {
        Value::Real(f)
    }
}

/// Comparison-time affinity: only converts text to numbers (never the
/// reverse) for numeric affinities, and numbers to text for TEXT
pub fn apply_comparison_affinity(v: &Value, aff: Option<Affinity>) -> Value {
    match aff {
        Some(Affinity::Numeric) | Some(Affinity::Integer) | Some(Affinity::Real) => match v {
            Value::Text(s) => is_numeric_text(s).unwrap_or_else(|| v.clone()),
            other => other.clone(),
        },
        Some(Affinity::Text) => match v {
            Value::Integer(_) | Value::Real(_) => Value::Text(v.to_text()),
            other => other.clone(),
        },
        _ => v.clone(),
    }
}

/// CAST(v AS type)
pub fn cast_value(v: Value, aff: Affinity) -> Value {
    if v.is_null() {
        return v;
    }
    match aff {
        Affinity::Blob => Value::Blob(v.to_blob()),
        Affinity::Text => Value::Text(v.to_text()),
        Affinity::Integer => Value::Integer(v.to_i64()),
        Affinity::Real => Value::Real(v.to_f64()),
        Affinity::Numeric => match v {
            Value::Integer(_) | Value::Real(_) => v,
            other => match text_to_numeric(&other.to_text()) {
                Some(Value::Real(f)) => real_to_integer_if_exact(f),
                Some(n) => n,
                None => Value::Integer(0),
            },
        },
    }
}

// ============================================================================
// Arithmetic
// ============================================================================

/// Binary arithmetic operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
}

fn as_number(v: &Value) -> Value {
    match v {
        Value::Integer(_) | Value::Real(_) => v.clone(),
        Value::Text(s) => text_to_numeric(s).unwrap_or(Value::Integer(0)),
        Value::Blob(b) => text_to_numeric(&String::from_utf8_lossy(b)).unwrap_or(Value::Integer(0)),
        Value::Null => Value::Null,
    }
}

/// Evaluate `a op b`; NULL in, NULL out; integer overflow promotes to real
pub fn arith(op: ArithOp, a: &Value, b: &Value) -> Value {
    let (x, y) = (as_number(a), as_number(b));
    if x.is_null() || y.is_null() {
        return Value::Null;
    }
    if let (Value::Integer(i), Value::Integer(j)) = (&x, &y) {
        let (i, j) = (*i, *j);
        let r = match op {
            ArithOp::Add => i.checked_add(j),
            ArithOp::Subtract => i.checked_sub(j),
            ArithOp::Multiply => i.checked_mul(j),
            ArithOp::Divide => {
                if j == 0 {
                    return Value::Null;
                }
                i.checked_div(j)
            }
            ArithOp::Remainder => {
                if j == 0 {
                    return Value::Null;
                }
                Some(i.checked_rem(j).unwrap_or(0))
            }
        };
        if let Some(r) = r {
            return Value::Integer(r);
        }
    }
    let (f, g) = (x.to_f64(), y.to_f64());
    match op {
        ArithOp::Add => Value::Real(f + g),
        ArithOp::Subtract => Value::Real(f - g),
        ArithOp::Multiply => Value::Real(f * g),
        ArithOp::Divide => {
            if g == 0.0 {
                Value::Null
            } else {
                Value::Real(f / g)
            }
        }
        ArithOp::Remainder => {
            let (fi, gi) = (real_to_i64(f), real_to_i64(g));
            if gi == 0 {
                Value::Null
            } else {
                Value::Real((fi % gi) as f64)
            }
        }
    }
}

/// Integer bitwise operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOp {
    And,
    Or,
    ShiftLeft,
    ShiftRight,
}

pub fn bitwise(op: BitOp, a: &Value, b: &Value) -> Value {
    if a.is_null() || b.is_null() {
        return Value::Null;
    }
    let (x, y) = (a.to_i64(), b.to_i64());
    Value::Integer(match op {
        BitOp::And => x & y,
        BitOp::Or => x | y,
        BitOp::ShiftLeft => shift_left(x, y),
        BitOp::ShiftRight => shift_left(x, y.saturating_neg()),
    })
}

fn shift_left(x: i64, n: i64) -> i64 {
    if n >= 64 {
        0
    } else if n >= 0 {
        ((x as u64) << n) as i64
    } else if n <= -64 {
        if x < 0 {
            -1
        } else {
            0
        }
    } else {
        x >> (-n)
    }
}

pub fn negate(v: &Value) -> Value {
    match as_number(v) {
        Value::Integer(i) => match i.checked_neg() {
            Some(n) => Value::Integer(n),
            None => Value::Real(-(i as f64)),
        },
        Value::Real(f) => Value::Real(-f),
        _ => Value::Null,
    }
}

pub fn concat(a: &Value, b: &Value) -> Value {
    if a.is_null() || b.is_null() {
        return Value::Null;
    }
    Value::Text(format!("{}{}", a.to_text(), b.to_text()))
}

/// Force a value to an integer for MustBeInt
pub fn must_be_int(v: &Value) -> Result<i64> {
    match v {
        Value::Integer(i) => Ok(*i),
        Value::Real(f) if f.fract() == 0.0 => Ok(*f as i64),
        Value::Text(s) => match is_numeric_text(s) {
            Some(Value::Integer(i)) => Ok(i),
            Some(Value::Real(f)) if f.fract() == 0.0 => Ok(f as i64),
            _ => Err(Error::new(ErrorCode::Mismatch)),
        },
        _ => Err(Error::new(ErrorCode::Mismatch)),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_class_order() {
        let vals = [
            Value::Blob(vec![0]),
            Value::Text("a".into()),
            Value::Real(1.5),
            Value::Integer(1),
            Value::Null,
        ];
        let mut sorted = vals.to_vec();
        sorted.sort_by(|a, b| compare_values(a, b, Collation::Binary));
        assert_eq!(sorted[0], Value::Null);
        assert_eq!(sorted[1], Value::Integer(1));
        assert_eq!(sorted[2], Value::Real(1.5));
        assert_eq!(sorted[3], Value::Text("a".into()));
    }

    #[test]
    fn test_int_real_compare() {
        assert_eq!(
            compare_values(&Value::Integer(2), &Value::Real(2.0), Collation::Binary),
            Ordering::Equal
        );
        assert_eq!(
            compare_values(&Value::Integer(2), &Value::Real(2.5), Collation::Binary),
            Ordering::Less
        );
    }

    #[test]
    fn test_collations() {
        assert_eq!(Collation::NoCase.compare("ABC", "abc"), Ordering::Equal);
        assert_eq!(Collation::RTrim.compare("abc  ", "abc"), Ordering::Equal);
        assert_ne!(Collation::Binary.compare("ABC", "abc"), Ordering::Equal);
    }

    #[test]
    fn test_apply_affinity() {
        assert_eq!(apply_affinity(Value::Text("12".into()), Affinity::Integer), Value::Integer(12));
        assert_eq!(apply_affinity(Value::Text("3.0".into()), Affinity::Numeric), Value::Integer(3));
        assert_eq!(apply_affinity(Value::Text("x1".into()), Affinity::Numeric), Value::Text("x1".into()));
        assert_eq!(apply_affinity(Value::Integer(5), Affinity::Text), Value::Text("5".into()));
        assert_eq!(apply_affinity(Value::Integer(5), Affinity::Real), Value::Real(5.0));
    }

    #[test]
    fn test_arith_overflow_and_div_zero() {
        assert_eq!(arith(ArithOp::Add, &Value::Integer(i64::MAX), &Value::Integer(1)), Value::Real(i64::MAX as f64 + 1.0));
        assert_eq!(arith(ArithOp::Divide, &Value::Integer(1), &Value::Integer(0)), Value::Null);
        assert_eq!(arith(ArithOp::Divide, &Value::Integer(7), &Value::Integer(2)), Value::Integer(3));
        assert_eq!(arith(ArithOp::Add, &Value::Text("2".into()), &Value::Integer(3)), Value::Integer(5));
    }

    #[test]
    fn test_compare_keys_prefix_and_desc() {
        let a = [Value::Integer(1), Value::Integer(5)];
        let b = [Value::Integer(1)];
        assert_eq!(compare_keys(&a, &b, 2, |_| Collation::Binary, |_| false), Ordering::Equal);
        let c = [Value::Integer(2)];
        assert_eq!(compare_keys(&b, &c, 1, |_| Collation::Binary, |_| true), Ordering::Greater);
    }
}
