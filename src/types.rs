//! Core value types
//!
//! `Value` is the dynamically typed datum that flows through registers,
//! records and the public API. Conversions here follow SQLite's loose
//! typing rules: text that looks numeric converts by its longest numeric
//! prefix, and reals that hold whole numbers still print with a decimal
//! point.

use std::fmt;

/// Row ID type
pub type RowId = i64;

/// Root page number of a b-tree
pub type Pgno = u32;

// ============================================================================
// Statement Execution Types
// ============================================================================

/// Result of sqlite3_step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// SQLITE_ROW - another row available
    Row,
    /// SQLITE_DONE - statement finished
    Done,
}

/// Fundamental datatypes (SQLITE_INTEGER, SQLITE_FLOAT, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ColumnType {
    Integer = 1,
    Float = 2,
    Text = 3,
    Blob = 4,
    Null = 5,
}

// ============================================================================
// Value
// ============================================================================

/// Dynamic SQL value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Null => ColumnType::Null,
            Value::Integer(_) => ColumnType::Integer,
            Value::Real(_) => ColumnType::Float,
            Value::Text(_) => ColumnType::Text,
            Value::Blob(_) => ColumnType::Blob,
        }
    }

    /// Name reported by typeof()
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Real(_))
    }

    /// Integer value under SQLite coercion rules
    ///
    /// - NULL -> 0
    /// - Real -> truncated toward zero, saturating
    /// - Text/Blob -> longest integer prefix, or 0
    pub fn to_i64(&self) -> i64 {
        match self {
            Value::Null => 0,
            Value::Integer(i) => *i,
            Value::Real(f) => real_to_i64(*f),
            Value::Text(s) => text_to_numeric(s).map_or(0, |v| v.to_i64()),
            Value::Blob(b) => text_to_numeric(&String::from_utf8_lossy(b)).map_or(0, |v| v.to_i64()),
        }
    }

    /// Real value under SQLite coercion rules
    pub fn to_f64(&self) -> f64 {
        match self {
            Value::Null => 0.0,
            Value::Integer(i) => *i as f64,
            Value::Real(f) => *f,
            Value::Text(s) => text_to_numeric(s).map_or(0.0, |v| v.to_f64()),
            Value::Blob(b) => text_to_numeric(&String::from_utf8_lossy(b)).map_or(0.0, |v| v.to_f64()),
        }
    }

    /// Text rendering; NULL renders as the empty string
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Integer(i) => i.to_string(),
            Value::Real(f) => format_real(*f),
            Value::Text(s) => s.clone(),
            Value::Blob(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    pub fn to_blob(&self) -> Vec<u8> {
        match self {
            Value::Null => Vec::new(),
            Value::Blob(b) => b.clone(),
            other => other.to_text().into_bytes(),
        }
    }

    /// Truth value for WHERE/IF: NULL is neither true nor false
    pub fn truthiness(&self) -> Option<bool> {
        match self {
            Value::Null => None,
            Value::Integer(i) => Some(*i != 0),
            Value::Real(f) => Some(*f != 0.0),
            other => Some(other.to_f64() != 0.0),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Blob(b) => write!(f, "x'{}'", hex::encode(b)),
            other => f.write_str(&other.to_text()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}

// ============================================================================
// Numeric Text Helpers
// ============================================================================

/// Convert a real to an integer the way CAST(x AS INTEGER) does
pub fn real_to_i64(f: f64) -> i64 {
    if f.is_nan() {
        0
    } else if f >= 9.223372036854775807e18 {
        i64::MAX
    } else if f <= -9.223372036854775808e18 {
        i64::MIN
    } else {
        f as i64
    }
}

/// Parse the longest numeric prefix of `s` (after leading spaces)
///
/// Returns `None` when no digits are present at all.
pub fn text_to_numeric(s: &str) -> Option<Value> {
    let t = s.trim_start();
    let bytes = t.as_bytes();
    let mut i = 0;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        i += 1;
    }
    let digits_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    let mut is_real = false;
    let mut n_digits = i - digits_start;
    if i < bytes.len() && bytes[i] == b'.' {
        let mut j = i + 1;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        n_digits += j - i - 1;
        if n_digits > 0 {
            is_real = true;
            i = j;
        }
    }
    if n_digits == 0 {
        return None;
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        let exp_start = j;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if j > exp_start {
            is_real = true;
            i = j;
        }
    }
    let num = &t[..i];
    if !is_real {
        if let Ok(v) = num.parse::<i64>() {
            return Some(Value::Integer(v));
        }
    }
    num.parse::<f64>().ok().map(Value::Real)
}

/// Whether the entire string (ignoring surrounding spaces) is a number
pub fn is_numeric_text(s: &str) -> Option<Value> {
    let trimmed = s.trim();
    let value = text_to_numeric(trimmed)?;
    let rendered_len = numeric_prefix_len(trimmed);
    if rendered_len == trimmed.len() {
        Some(value)
    } else {
        None
    }
}

fn numeric_prefix_len(t: &str) -> usize {
    let bytes = t.as_bytes();
    let mut i = 0;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        i += 1;
    }
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        let start = j;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if j > start {
            i = j;
        }
    }
    i
}

/// Render a real the way SQLite's "%!.15g" does
pub fn format_real(f: f64) -> String {
    if f.is_nan() {
        return "NaN".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "Inf".to_string() } else { "-Inf".to_string() };
    }
    if f == 0.0 {
        return "0.0".to_string();
    }
    let exp = f.abs().log10().floor() as i32;
    if !(-5..15).contains(&exp) {
        let s = format!("{:.14e}", f);
        // mantissa trimming: 1.50000000000000e20 -> 1.5e+20
        let (mant, e) = s.split_once('e').unwrap_or((&s, "0"));
        let mant = trim_fraction(mant);
        let e: i32 = e.parse().unwrap_or(0);
        let sign = if e < 0 { '-' } else { '+' };
        return format!("{}e{}{:02}", mant, sign, e.abs());
    }
    let decimals = (14 - exp).max(0) as usize;
    let s = format!("{:.*}", decimals, f);
    trim_fraction(&s)
}

fn trim_fraction(s: &str) -> String {
    if !s.contains('.') {
        return format!("{}.0", s);
    }
    let trimmed = s.trim_end_matches('0');
    if trimmed.ends_with('.') {
        format!("{}0", trimmed)
    } else {
        trimmed.to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_coercions() {
        assert_eq!(Value::Text("12abc".into()).to_i64(), 12);
        assert_eq!(Value::Text("  3.5".into()).to_f64(), 3.5);
        assert_eq!(Value::Real(2.9).to_i64(), 2);
        assert_eq!(Value::Null.to_i64(), 0);
        assert_eq!(Value::Text("abc".into()).to_i64(), 0);
    }

    #[test]
    fn test_format_real() {
        assert_eq!(format_real(1.0), "1.0");
        assert_eq!(format_real(1.5), "1.5");
        assert_eq!(format_real(0.1), "0.1");
        assert_eq!(format_real(-2.25), "-2.25");
        assert_eq!(format_real(1e20), "1.0e+20");
        assert_eq!(format_real(100.0), "100.0");
    }

    #[test]
    fn test_is_numeric_text() {
        assert_eq!(is_numeric_text(" 42 "), Some(Value::Integer(42)));
        assert_eq!(is_numeric_text("4.5e1"), Some(Value::Real(45.0)));
        assert_eq!(is_numeric_text("42x"), None);
        assert_eq!(is_numeric_text(""), None);
    }

    #[test]
    fn test_truthiness() {
        assert_eq!(Value::Null.truthiness(), None);
        assert_eq!(Value::Integer(0).truthiness(), Some(false));
        assert_eq!(Value::Text("1".into()).truthiness(), Some(true));
    }
}
