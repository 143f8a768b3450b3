//! Scalar SQL functions
//!
//! Each function takes its evaluated arguments and returns a single
//! Value. Argument counts are validated when the call is resolved, so the
//! bodies below index `args` directly within the declared arity.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::types::{format_real, text_to_numeric, Value};
use crate::vdbe::value::{compare_values, Collation};

/// Function implementation type
pub type ScalarFunc = fn(&[Value]) -> Result<Value>;

// ============================================================================
// Math Functions
// ============================================================================

/// abs(X)
pub fn func_abs(args: &[Value]) -> Result<Value> {
    match &args[0] {
        Value::Null => Ok(Value::Null),
        Value::Integer(n) => n
            .checked_abs()
            .map(Value::Integer)
            .ok_or_else(|| Error::sql("integer overflow")),
        Value::Real(f) => Ok(Value::Real(f.abs())),
        other => match text_to_numeric(&other.to_text()) {
            Some(Value::Integer(n)) => Ok(Value::Real((n as f64).abs())),
            Some(v) => Ok(Value::Real(v.to_f64().abs())),
            None => Ok(Value::Real(0.0)),
        },
    }
}

/// max(X, Y, ...): NULL if any argument is NULL
pub fn func_max(args: &[Value]) -> Result<Value> {
    pick(args, Ordering::Greater)
}

/// min(X, Y, ...): NULL if any argument is NULL
pub fn func_min(args: &[Value]) -> Result<Value> {
    pick(args, Ordering::Less)
}

fn pick(args: &[Value], want: Ordering) -> Result<Value> {
    let mut best = &args[0];
    for arg in args {
        if arg.is_null() {
            return Ok(Value::Null);
        }
        if compare_values(arg, best, Collation::Binary) == want {
            best = arg;
        }
    }
    Ok(best.clone())
}

/// round(X [, Y])
pub fn func_round(args: &[Value]) -> Result<Value> {
    if args[0].is_null() {
        return Ok(Value::Null);
    }
    let digits = match args.get(1) {
        Some(Value::Null) => return Ok(Value::Null),
        Some(v) => v.to_i64().clamp(0, 30) as i32,
        None => 0,
    };
    let x = args[0].to_f64();
    if !x.is_finite() {
        return Ok(Value::Real(x));
    }
    let rounded = if digits == 0 {
        x.round()
    } else {
        format!("{:.*}", digits as usize, x).parse::<f64>().unwrap_or(x)
    };
    Ok(Value::Real(rounded))
}

// ============================================================================
// String Functions
// ============================================================================

/// length(X): characters for text, bytes for blobs
pub fn func_length(args: &[Value]) -> Result<Value> {
    Ok(match &args[0] {
        Value::Null => Value::Null,
        Value::Blob(b) => Value::Integer(b.len() as i64),
        Value::Text(s) => Value::Integer(s.chars().count() as i64),
        other => Value::Integer(other.to_text().chars().count() as i64),
    })
}

pub fn func_lower(args: &[Value]) -> Result<Value> {
    Ok(match &args[0] {
        Value::Null => Value::Null,
        v => Value::Text(v.to_text().to_ascii_lowercase()),
    })
}

pub fn func_upper(args: &[Value]) -> Result<Value> {
    Ok(match &args[0] {
        Value::Null => Value::Null,
        v => Value::Text(v.to_text().to_ascii_uppercase()),
    })
}

/// substr(X, Y [, Z]) with SQLite's 1-based, negative-from-end indexing
pub fn func_substr(args: &[Value]) -> Result<Value> {
    if args.iter().any(|a| a.is_null()) {
        return Ok(Value::Null);
    }
    let start = args[1].to_i64();
    let len = args.get(2).map(|v| v.to_i64());
    match &args[0] {
        Value::Blob(b) => {
            let (from, to) = substr_range(b.len() as i64, start, len);
            Ok(Value::Blob(b[from..to].to_vec()))
        }
        v => {
            let chars: Vec<char> = v.to_text().chars().collect();
            let (from, to) = substr_range(chars.len() as i64, start, len);
            Ok(Value::Text(chars[from..to].iter().collect()))
        }
    }
}

fn substr_range(total: i64, start: i64, len: Option<i64>) -> (usize, usize) {
    let mut p1 = start;
    let mut p2 = len.unwrap_or(total.saturating_add(1).max(1));
    let mut negative_len = false;
    if p2 < 0 {
        negative_len = true;
        p2 = -p2;
    }
    if p1 < 0 {
        p1 += total;
        if p1 < 0 {
            p2 += p1;
            p1 = 0;
        }
    } else if p1 > 0 {
        p1 -= 1;
    } else if p2 > 0 {
        p2 -= 1;
    }
    if negative_len {
        p1 -= p2;
        if p1 < 0 {
            p2 += p1;
            p1 = 0;
        }
    }
    let from = p1.clamp(0, total);
    let to = p1.saturating_add(p2.max(0)).clamp(from, total);
    (from as usize, to as usize)
}

fn trim_impl(args: &[Value], left: bool, right: bool) -> Result<Value> {
    if args.iter().any(|a| a.is_null()) {
        return Ok(Value::Null);
    }
    let text = args[0].to_text();
    let set: Vec<char> = match args.get(1) {
        Some(v) => v.to_text().chars().collect(),
        None => vec![' '],
    };
    let mut s = text.as_str();
    if left {
        s = s.trim_start_matches(|c| set.contains(&c));
    }
    if right {
        s = s.trim_end_matches(|c| set.contains(&c));
    }
    Ok(Value::Text(s.to_string()))
}

pub fn func_trim(args: &[Value]) -> Result<Value> {
    trim_impl(args, true, true)
}

pub fn func_ltrim(args: &[Value]) -> Result<Value> {
    trim_impl(args, true, false)
}

pub fn func_rtrim(args: &[Value]) -> Result<Value> {
    trim_impl(args, false, true)
}

/// replace(X, Y, Z)
pub fn func_replace(args: &[Value]) -> Result<Value> {
    if args.iter().any(|a| a.is_null()) {
        return Ok(Value::Null);
    }
    let (x, y, z) = (args[0].to_text(), args[1].to_text(), args[2].to_text());
    if y.is_empty() {
        return Ok(Value::Text(x));
    }
    Ok(Value::Text(x.replace(&y, &z)))
}

/// instr(X, Y): 1-based position of Y in X, 0 when absent
pub fn func_instr(args: &[Value]) -> Result<Value> {
    if args.iter().any(|a| a.is_null()) {
        return Ok(Value::Null);
    }
    if let (Value::Blob(h), Value::Blob(n)) = (&args[0], &args[1]) {
        let pos = if n.is_empty() {
            Some(0)
        } else {
            h.windows(n.len()).position(|w| w == n.as_slice())
        };
        return Ok(Value::Integer(pos.map(|p| p as i64 + 1).unwrap_or(0)));
    }
    let (h, n) = (args[0].to_text(), args[1].to_text());
    Ok(Value::Integer(match h.find(&n) {
        Some(byte) => h[..byte].chars().count() as i64 + 1,
        None => 0,
    }))
}

// ============================================================================
// Type and NULL Handling
// ============================================================================

pub fn func_typeof(args: &[Value]) -> Result<Value> {
    Ok(Value::Text(args[0].type_name().to_string()))
}

/// coalesce(X, Y, ...): first non-NULL argument
pub fn func_coalesce(args: &[Value]) -> Result<Value> {
    Ok(args.iter().find(|a| !a.is_null()).cloned().unwrap_or(Value::Null))
}

pub fn func_ifnull(args: &[Value]) -> Result<Value> {
    func_coalesce(args)
}

/// nullif(X, Y): NULL when X = Y, else X
pub fn func_nullif(args: &[Value]) -> Result<Value> {
    if compare_values(&args[0], &args[1], Collation::Binary) == Ordering::Equal && !args[0].is_null() {
        Ok(Value::Null)
    } else {
        Ok(args[0].clone())
    }
}

/// iif(C, X, Y)
pub fn func_iif(args: &[Value]) -> Result<Value> {
    if args[0].truthiness() == Some(true) {
        Ok(args[1].clone())
    } else {
        Ok(args[2].clone())
    }
}

// ============================================================================
// Blob and Quoting
// ============================================================================

pub fn func_hex(args: &[Value]) -> Result<Value> {
    Ok(Value::Text(hex::encode_upper(args[0].to_blob())))
}

/// quote(X): SQL literal text for X
pub fn func_quote(args: &[Value]) -> Result<Value> {
    Ok(Value::Text(quote_value(&args[0])))
}

/// Render a value as an SQL literal
pub fn quote_value(v: &Value) -> String {
    match v {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => format_real(*f),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Blob(b) => format!("X'{}'", hex::encode_upper(b)),
    }
}

// ============================================================================
// Date and Time
// ============================================================================

/// current_time(): HH:MM:SS in UTC
pub fn func_current_time(_args: &[Value]) -> Result<Value> {
    Ok(Value::Text(chrono::Utc::now().format("%H:%M:%S").to_string()))
}

/// current_date(): YYYY-MM-DD in UTC
pub fn func_current_date(_args: &[Value]) -> Result<Value> {
    Ok(Value::Text(chrono::Utc::now().format("%Y-%m-%d").to_string()))
}

/// current_timestamp(): YYYY-MM-DD HH:MM:SS in UTC
pub fn func_current_timestamp(_args: &[Value]) -> Result<Value> {
    Ok(Value::Text(chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()))
}

// ============================================================================
// Pattern Matching
// ============================================================================

/// like(PATTERN, X [, ESCAPE]); note the pattern comes first
pub fn func_like(args: &[Value]) -> Result<Value> {
    if args.iter().any(|a| a.is_null()) {
        return Ok(Value::Null);
    }
    let escape = match args.get(2) {
        Some(e) => {
            let s = e.to_text();
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Some(c),
                _ => return Err(Error::sql("ESCAPE expression must be a single character")),
            }
        }
        None => None,
    };
    let pattern: Vec<char> = args[0].to_text().chars().collect();
    let text: Vec<char> = args[1].to_text().chars().collect();
    Ok(Value::Integer(like_match(&pattern, &text, escape) as i64))
}

/// glob(PATTERN, X)
pub fn func_glob(args: &[Value]) -> Result<Value> {
    if args.iter().any(|a| a.is_null()) {
        return Ok(Value::Null);
    }
    let pattern: Vec<char> = args[0].to_text().chars().collect();
    let text: Vec<char> = args[1].to_text().chars().collect();
    Ok(Value::Integer(glob_match(&pattern, &text) as i64))
}

/// LIKE matching: `%` any run, `_` any one character, ASCII case folded
pub fn like_match(p: &[char], t: &[char], escape: Option<char>) -> bool {
    let (mut pi, mut ti) = (0, 0);
    let mut back: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() {
            let c = p[pi];
            if Some(c) == escape && pi + 1 < p.len() {
                if p[pi + 1].eq_ignore_ascii_case(&t[ti]) {
                    pi += 2;
                    ti += 1;
                    continue;
                }
            } else if c == '%' {
                back = Some((pi, ti));
                pi += 1;
                continue;
            } else if c == '_' || c.eq_ignore_ascii_case(&t[ti]) {
                pi += 1;
                ti += 1;
                continue;
            }
        }
        match back {
            Some((bp, bt)) => {
                pi = bp + 1;
                ti = bt + 1;
                back = Some((bp, bt + 1));
            }
            None => return false,
        }
    }
    p[pi..].iter().all(|c| *c == '%')
}

/// GLOB matching: `*`, `?` and `[...]` classes, case sensitive
pub fn glob_match(p: &[char], t: &[char]) -> bool {
    if p.is_empty() {
        return t.is_empty();
    }
    match p[0] {
        '*' => (0..=t.len()).any(|skip| glob_match(&p[1..], &t[skip..])),
        '?' => !t.is_empty() && glob_match(&p[1..], &t[1..]),
        '[' => {
            if t.is_empty() {
                return false;
            }
            let mut i = 1;
            let negate = p.get(i) == Some(&'^');
            if negate {
                i += 1;
            }
            let mut matched = false;
            let mut first = true;
            while i < p.len() && (first || p[i] != ']') {
                first = false;
                if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
                    if p[i] <= t[0] && t[0] <= p[i + 2] {
                        matched = true;
                    }
                    i += 3;
                } else {
                    if p[i] == t[0] {
                        matched = true;
                    }
                    i += 1;
                }
            }
            if i >= p.len() {
                return false;
            }
            matched != negate && glob_match(&p[i + 1..], &t[1..])
        }
        c => !t.is_empty() && t[0] == c && glob_match(&p[1..], &t[1..]),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    #[test]
    fn test_abs() {
        assert_eq!(func_abs(&[Value::Integer(-5)]).unwrap(), Value::Integer(5));
        assert_eq!(func_abs(&[Value::Null]).unwrap(), Value::Null);
        assert!(func_abs(&[Value::Integer(i64::MIN)]).is_err());
    }

    #[test]
    fn test_scalar_min_max() {
        let args = [Value::Integer(3), Value::Integer(1), Value::Integer(2)];
        assert_eq!(func_max(&args).unwrap(), Value::Integer(3));
        assert_eq!(func_min(&args).unwrap(), Value::Integer(1));
        assert_eq!(func_max(&[Value::Integer(1), Value::Null]).unwrap(), Value::Null);
    }

    #[test]
    fn test_substr() {
        assert_eq!(func_substr(&[t("hello"), Value::Integer(2), Value::Integer(3)]).unwrap(), t("ell"));
        assert_eq!(func_substr(&[t("hello"), Value::Integer(-3)]).unwrap(), t("llo"));
        assert_eq!(func_substr(&[t("hello"), Value::Integer(0), Value::Integer(2)]).unwrap(), t("h"));
        assert_eq!(func_substr(&[t("hello"), Value::Integer(3), Value::Integer(-2)]).unwrap(), t("he"));
    }

    #[test]
    fn test_trim_family() {
        assert_eq!(func_trim(&[t("  x  ")]).unwrap(), t("x"));
        assert_eq!(func_ltrim(&[t("xxaxx"), t("x")]).unwrap(), t("axx"));
        assert_eq!(func_rtrim(&[t("xxaxx"), t("x")]).unwrap(), t("xxa"));
    }

    #[test]
    fn test_round() {
        assert_eq!(func_round(&[Value::Real(2.5)]).unwrap(), Value::Real(3.0));
        assert_eq!(func_round(&[Value::Real(1.2345), Value::Integer(2)]).unwrap(), Value::Real(1.23));
    }

    #[test]
    fn test_quote_and_hex() {
        assert_eq!(func_quote(&[t("it's")]).unwrap(), t("'it''s'"));
        assert_eq!(func_quote(&[Value::Blob(vec![0xab])]).unwrap(), t("X'AB'"));
        assert_eq!(func_hex(&[t("abc")]).unwrap(), t("616263"));
    }

    #[test]
    fn test_like_and_glob() {
        let chars = |s: &str| s.chars().collect::<Vec<_>>();
        assert!(like_match(&chars("a%c"), &chars("ABBC"), None));
        assert!(like_match(&chars("_b%"), &chars("abc"), None));
        assert!(!like_match(&chars("a_"), &chars("a"), None));
        assert!(like_match(&chars("10!%"), &chars("10%"), Some('!')));
        assert!(glob_match(&chars("a*[0-9]"), &chars("abc7")));
        assert!(!glob_match(&chars("A*"), &chars("abc")));
        assert!(glob_match(&chars("[^x]?"), &chars("ab")));
    }

    #[test]
    fn test_instr_and_replace() {
        assert_eq!(func_instr(&[t("hello"), t("ll")]).unwrap(), Value::Integer(3));
        assert_eq!(func_instr(&[t("hello"), t("z")]).unwrap(), Value::Integer(0));
        assert_eq!(func_replace(&[t("aXbX"), t("X"), t("-")]).unwrap(), t("a-b-"));
    }

    #[test]
    fn test_current_timestamp_shape() {
        let ts = func_current_timestamp(&[]).unwrap().to_text();
        assert_eq!(ts.len(), 19);
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], " ");
        assert_eq!(func_current_date(&[]).unwrap().to_text().len(), 10);
    }

    #[test]
    fn test_nullif_and_iif() {
        assert_eq!(func_nullif(&[Value::Integer(1), Value::Integer(1)]).unwrap(), Value::Null);
        assert_eq!(func_nullif(&[Value::Integer(1), Value::Integer(2)]).unwrap(), Value::Integer(1));
        assert_eq!(func_iif(&[Value::Integer(0), t("a"), t("b")]).unwrap(), t("b"));
    }
}
