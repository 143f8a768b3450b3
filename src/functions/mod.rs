//! Built-in SQL functions: scalar and aggregate
//!
//! Functions are looked up by lowercase name in a process-wide registry
//! built once on first use. The resolver validates argument counts against
//! the registry entry; the engine calls the scalar body or drives an
//! `AggregateState`.

pub mod aggregate;
pub mod scalar;

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::error::{Error, Result};

pub use aggregate::{is_aggregate_function, is_aggregate_name, AggregateState};
pub use scalar::ScalarFunc;

/// How a registered function is implemented
#[derive(Debug, Clone, Copy)]
pub enum FuncImpl {
    Scalar(ScalarFunc),
    Aggregate,
}

/// One registry entry (a name may have several, by arity)
#[derive(Debug, Clone, Copy)]
pub struct FuncDef {
    pub name: &'static str,
    pub min_args: usize,
    /// `None` means variadic
    pub max_args: Option<usize>,
    pub imp: FuncImpl,
}

impl FuncDef {
    fn accepts(&self, argc: usize) -> bool {
        argc >= self.min_args && self.max_args.map_or(true, |m| argc <= m)
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self.imp, FuncImpl::Aggregate)
    }
}

const fn scalar_def(name: &'static str, min_args: usize, max_args: Option<usize>, f: ScalarFunc) -> FuncDef {
    FuncDef {
        name,
        min_args,
        max_args,
        imp: FuncImpl::Scalar(f),
    }
}

const fn agg_def(name: &'static str, min_args: usize, max_args: usize) -> FuncDef {
    FuncDef {
        name,
        min_args,
        max_args: Some(max_args),
        imp: FuncImpl::Aggregate,
    }
}

lazy_static! {
    static ref FUNCTIONS: HashMap<&'static str, Vec<FuncDef>> = {
        use scalar::*;
        let defs = [
            scalar_def("abs", 1, Some(1), func_abs),
            scalar_def("coalesce", 2, None, func_coalesce),
            scalar_def("ifnull", 2, Some(2), func_ifnull),
            scalar_def("nullif", 2, Some(2), func_nullif),
            scalar_def("iif", 3, Some(3), func_iif),
            scalar_def("length", 1, Some(1), func_length),
            scalar_def("lower", 1, Some(1), func_lower),
            scalar_def("upper", 1, Some(1), func_upper),
            scalar_def("substr", 2, Some(3), func_substr),
            scalar_def("substring", 2, Some(3), func_substr),
            scalar_def("trim", 1, Some(2), func_trim),
            scalar_def("ltrim", 1, Some(2), func_ltrim),
            scalar_def("rtrim", 1, Some(2), func_rtrim),
            scalar_def("replace", 3, Some(3), func_replace),
            scalar_def("instr", 2, Some(2), func_instr),
            scalar_def("typeof", 1, Some(1), func_typeof),
            scalar_def("hex", 1, Some(1), func_hex),
            scalar_def("quote", 1, Some(1), func_quote),
            scalar_def("round", 1, Some(2), func_round),
            scalar_def("min", 2, None, func_min),
            scalar_def("max", 2, None, func_max),
            scalar_def("like", 2, Some(3), func_like),
            scalar_def("glob", 2, Some(2), func_glob),
            scalar_def("current_time", 0, Some(0), func_current_time),
            scalar_def("current_date", 0, Some(0), func_current_date),
            scalar_def("current_timestamp", 0, Some(0), func_current_timestamp),
            agg_def("count", 0, 1),
            agg_def("sum", 1, 1),
            agg_def("total", 1, 1),
            agg_def("avg", 1, 1),
            agg_def("min", 1, 1),
            agg_def("max", 1, 1),
            agg_def("group_concat", 1, 2),
        ];
        let mut map: HashMap<&'static str, Vec<FuncDef>> = HashMap::new();
        for d in defs {
            map.entry(d.name).or_default().push(d);
        }
        map
    };
}

/// Find the definition of `name` taking `argc` arguments
pub fn find_function(name: &str, argc: usize) -> Result<FuncDef> {
    let lower = name.to_ascii_lowercase();
    let defs = FUNCTIONS
        .get(lower.as_str())
        .ok_or_else(|| Error::sql(format!("no such function: {}", name)))?;
    defs.iter()
        .find(|d| d.accepts(argc))
        .copied()
        .ok_or_else(|| Error::sql(format!("wrong number of arguments to function {}()", name)))
}

/// The scalar body registered for `name` (lowercase) and `argc`
pub fn scalar_function(name: &str, argc: usize) -> Option<ScalarFunc> {
    FUNCTIONS.get(name)?.iter().find_map(|d| match d.imp {
        FuncImpl::Scalar(f) if d.accepts(argc) => Some(f),
        _ => None,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[test]
    fn test_lookup_by_arity() {
        assert!(find_function("MAX", 1).unwrap().is_aggregate());
        assert!(!find_function("max", 3).unwrap().is_aggregate());
        assert!(find_function("count", 0).unwrap().is_aggregate());
    }

    #[test]
    fn test_lookup_errors() {
        assert_eq!(find_function("nope", 1).unwrap_err().errmsg(), "no such function: nope");
        assert_eq!(
            find_function("abs", 2).unwrap_err().errmsg(),
            "wrong number of arguments to function abs()"
        );
    }

    #[test]
    fn test_scalar_dispatch() {
        let f = scalar_function("upper", 1).unwrap();
        assert_eq!(f(&[Value::Text("ab".into())]).unwrap(), Value::Text("AB".into()));
        assert!(scalar_function("count", 1).is_none());
    }
}
