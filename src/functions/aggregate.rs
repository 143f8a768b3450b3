//! Aggregate SQL functions
//!
//! Aggregates accumulate across the rows of a group. The engine keeps one
//! `AggregateState` per accumulator register, created on the first
//! `AggStep` after the register was cleared and turned into a value by
//! `AggFinal`.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::types::{text_to_numeric, Value};
use crate::vdbe::value::{compare_values, Collation};

// ============================================================================
// Aggregate State
// ============================================================================

/// State maintained during aggregation
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateState {
    /// COUNT(*) or COUNT(x)
    Count { count: i64 },

    /// SUM(x): exact integer sum until a real shows up
    Sum {
        int_sum: i64,
        real_sum: f64,
        has_value: bool,
        is_integer: bool,
    },

    /// AVG(x)
    Avg { sum: f64, count: i64 },

    /// MIN(x) / MAX(x)
    MinMax { value: Option<Value>, want: Ordering },

    /// TOTAL(x): always real, 0.0 for no rows
    Total { sum: f64 },

    /// GROUP_CONCAT(x [, sep])
    GroupConcat { text: Option<String> },
}

fn numeric(v: &Value) -> Value {
    match v {
        Value::Integer(_) | Value::Real(_) => v.clone(),
        other => text_to_numeric(&other.to_text()).unwrap_or(Value::Integer(0)),
    }
}

impl AggregateState {
    /// Initial state for an aggregate function (name is lowercase)
    pub fn new(func_name: &str) -> Option<Self> {
        match func_name {
            "count" => Some(AggregateState::Count { count: 0 }),
            "sum" => Some(AggregateState::Sum {
                int_sum: 0,
                real_sum: 0.0,
                has_value: false,
                is_integer: true,
            }),
            "avg" => Some(AggregateState::Avg { sum: 0.0, count: 0 }),
            "min" => Some(AggregateState::MinMax {
                value: None,
                want: Ordering::Less,
            }),
            "max" => Some(AggregateState::MinMax {
                value: None,
                want: Ordering::Greater,
            }),
            "total" => Some(AggregateState::Total { sum: 0.0 }),
            "group_concat" => Some(AggregateState::GroupConcat { text: None }),
            _ => None,
        }
    }

    /// Add one row's arguments
    pub fn step(&mut self, args: &[Value], coll: Collation) -> Result<()> {
        let arg = args.first();
        match self {
            AggregateState::Count { count } => {
                // COUNT(*) counts all rows, COUNT(x) counts non-NULL x
                if arg.map_or(true, |v| !v.is_null()) {
                    *count += 1;
                }
            }

            AggregateState::Sum {
                int_sum,
                real_sum,
                has_value,
                is_integer,
            } => {
                if let Some(val) = arg.filter(|v| !v.is_null()) {
                    *has_value = true;
                    match numeric(val) {
                        Value::Integer(n) => {
                            *real_sum += n as f64;
                            if *is_integer {
                                *int_sum = int_sum
                                    .checked_add(n)
                                    .ok_or_else(|| Error::sql("integer overflow"))?;
                            }
                        }
                        other => {
                            *real_sum += other.to_f64();
                            *is_integer = false;
                        }
                    }
                }
            }

            AggregateState::Avg { sum, count } => {
                if let Some(val) = arg.filter(|v| !v.is_null()) {
                    *count += 1;
                    *sum += numeric(val).to_f64();
                }
            }

            AggregateState::MinMax { value, want } => {
                if let Some(val) = arg.filter(|v| !v.is_null()) {
                    let replace = match value {
                        Some(current) => compare_values(val, current, coll) == *want,
                        None => true,
                    };
                    if replace {
                        *value = Some(val.clone());
                    }
                }
            }

            AggregateState::Total { sum } => {
                if let Some(val) = arg.filter(|v| !v.is_null()) {
                    *sum += numeric(val).to_f64();
                }
            }

            AggregateState::GroupConcat { text } => {
                if let Some(val) = arg.filter(|v| !v.is_null()) {
                    match text {
                        Some(acc) => {
                            match args.get(1) {
                                Some(Value::Null) => {}
                                Some(sep) => acc.push_str(&sep.to_text()),
                                None => acc.push(','),
                            }
                            acc.push_str(&val.to_text());
                        }
                        None => *text = Some(val.to_text()),
                    }
                }
            }
        }
        Ok(())
    }

    /// The aggregate's value
    pub fn finalize(&self) -> Value {
        match self {
            AggregateState::Count { count } => Value::Integer(*count),
            AggregateState::Sum {
                int_sum,
                real_sum,
                has_value,
                is_integer,
            } => {
                if !has_value {
                    Value::Null
                } else if *is_integer {
                    Value::Integer(*int_sum)
                } else {
                    Value::Real(*real_sum)
                }
            }
            AggregateState::Avg { sum, count } => {
                if *count == 0 {
                    Value::Null
                } else {
                    Value::Real(*sum / *count as f64)
                }
            }
            AggregateState::MinMax { value, .. } => value.clone().unwrap_or(Value::Null),
            AggregateState::Total { sum } => Value::Real(*sum),
            AggregateState::GroupConcat { text } => text.clone().map(Value::Text).unwrap_or(Value::Null),
        }
    }
}

// ============================================================================
// Aggregate Function Registry
// ============================================================================

/// Whether `name` called with `argc` arguments is an aggregate
///
/// min() and max() are aggregates only with a single argument.
pub fn is_aggregate_function(name: &str, argc: usize) -> bool {
    match name.to_ascii_lowercase().as_str() {
        "count" => argc <= 1,
        "min" | "max" => argc == 1,
        "sum" | "avg" | "total" => argc == 1,
        "group_concat" => argc == 1 || argc == 2,
        _ => false,
    }
}

/// Whether `name` is an aggregate for some argument count
pub fn is_aggregate_name(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "count" | "sum" | "avg" | "total" | "group_concat"
    )
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn run(name: &str, rows: &[Vec<Value>]) -> Value {
        let mut state = AggregateState::new(name).unwrap();
        for r in rows {
            state.step(r, Collation::Binary).unwrap();
        }
        state.finalize()
    }

    #[test]
    fn test_count() {
        let rows = vec![vec![Value::Integer(1)], vec![Value::Null], vec![Value::Integer(3)]];
        assert_eq!(run("count", &rows), Value::Integer(2));
        assert_eq!(run("count", &[vec![], vec![]]), Value::Integer(2));
    }

    #[test]
    fn test_sum_integer_and_real() {
        let rows = vec![vec![Value::Integer(10)], vec![Value::Null], vec![Value::Integer(20)]];
        assert_eq!(run("sum", &rows), Value::Integer(30));
        let rows = vec![vec![Value::Integer(1)], vec![Value::Real(0.5)]];
        assert_eq!(run("sum", &rows), Value::Real(1.5));
        assert_eq!(run("sum", &[]), Value::Null);
    }

    #[test]
    fn test_sum_overflow() {
        let mut state = AggregateState::new("sum").unwrap();
        state.step(&[Value::Integer(i64::MAX)], Collation::Binary).unwrap();
        assert!(state.step(&[Value::Integer(1)], Collation::Binary).is_err());
    }

    #[test]
    fn test_avg_and_total() {
        let rows = vec![vec![Value::Integer(1)], vec![Value::Integer(2)]];
        assert_eq!(run("avg", &rows), Value::Real(1.5));
        assert_eq!(run("total", &[]), Value::Real(0.0));
        assert_eq!(run("avg", &[]), Value::Null);
    }

    #[test]
    fn test_min_max_skip_null() {
        let rows = vec![vec![Value::Integer(5)], vec![Value::Null], vec![Value::Integer(2)]];
        assert_eq!(run("min", &rows), Value::Integer(2));
        assert_eq!(run("max", &rows), Value::Integer(5));
    }

    #[test]
    fn test_min_uses_collation() {
        let mut state = AggregateState::new("min").unwrap();
        state.step(&[Value::Text("b".into())], Collation::NoCase).unwrap();
        state.step(&[Value::Text("A".into())], Collation::NoCase).unwrap();
        assert_eq!(state.finalize(), Value::Text("A".into()));
    }

    #[test]
    fn test_group_concat_separator() {
        let rows = vec![vec![Value::Text("a".into())], vec![Value::Null], vec![Value::Text("b".into())]];
        assert_eq!(run("group_concat", &rows), Value::Text("a,b".into()));
        let sep = Value::Text("; ".into());
        let rows = vec![vec![Value::Integer(1), sep.clone()], vec![Value::Integer(2), sep]];
        assert_eq!(run("group_concat", &rows), Value::Text("1; 2".into()));
    }

    #[test]
    fn test_is_aggregate_function() {
        assert!(is_aggregate_function("COUNT", 0));
        assert!(is_aggregate_function("max", 1));
        assert!(!is_aggregate_function("max", 2));
        assert!(!is_aggregate_function("length", 1));
    }
}
