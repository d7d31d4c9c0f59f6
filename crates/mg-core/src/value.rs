//! Typed attribute values and the coercion/comparison kernel
//!
//! Every mesh attribute carries a declared type. Rule thresholds arrive as
//! raw JSON and are coerced to the attribute's declared type before being
//! compared, so `"21"` matches an integer temperature of 21 but `"warm"`
//! does not. A comparison that cannot be performed (bad coercion, ordering
//! on a non-numeric type) fails closed: callers treat the condition as
//! false and surface the error text as the trace reason.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Declared type of a device attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrType {
    Boolean,
    Integer,
    Float,
    String,
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrType::Boolean => write!(f, "boolean"),
            AttrType::Float => write!(f, "float"),
            AttrType::Integer => write!(f, "integer"),
            AttrType::String => write!(f, "string"),
        }
    }
}

/// A typed attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl AttrValue {
    /// The declared type this value belongs to
    pub fn attr_type(&self) -> AttrType {
        match self {
            AttrValue::Bool(_) => AttrType::Boolean,
            AttrValue::Int(_) => AttrType::Integer,
            AttrValue::Float(_) => AttrType::Float,
            AttrValue::Str(_) => AttrType::String,
        }
    }

    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(i) => Some(*i as f64),
            AttrValue::Float(f) => Some(*f),
            AttrValue::Bool(_) | AttrValue::Str(_) => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(b) => write!(f, "{}", b),
            AttrValue::Int(i) => write!(f, "{}", i),
            AttrValue::Float(v) => write!(f, "{}", v),
            AttrValue::Str(s) => write!(f, "{}", s),
        }
    }
}

/// Comparison operator usable in rule conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    Nin,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "eq",
            CompareOp::Neq => "neq",
            CompareOp::Gt => "gt",
            CompareOp::Lt => "lt",
            CompareOp::Gte => "gte",
            CompareOp::Lte => "lte",
            CompareOp::In => "in",
            CompareOp::Nin => "nin",
        };
        write!(f, "{}", s)
    }
}

/// Errors from coercion or comparison; conditions fail closed on these
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompareError {
    #[error("cannot coerce {raw} to {ty}")]
    Coerce { raw: String, ty: AttrType },

    #[error("operator '{op}' needs a numeric attribute, got {ty}")]
    NotNumeric { op: CompareOp, ty: AttrType },

    #[error("operator '{op}' needs a list threshold")]
    ListExpected { op: CompareOp },
}

/// Operators that make sense for a given attribute type
///
/// Feeds the per-device attribute catalog so clients only offer valid
/// operator choices when building rules.
pub fn applicable_operators(ty: AttrType) -> &'static [CompareOp] {
    use CompareOp::*;
    match ty {
        AttrType::Boolean => &[Eq, Neq],
        AttrType::String => &[Eq, Neq, In, Nin],
        AttrType::Integer | AttrType::Float => &[Eq, Neq, Gt, Lt, Gte, Lte, In, Nin],
    }
}

/// Coerce a raw JSON threshold to the declared attribute type
///
/// String-typed attributes are never coerced to boolean: a device enum
/// string like "ON" must compare as a string, not be misread as `true`.
pub fn coerce(raw: &serde_json::Value, ty: AttrType) -> Result<AttrValue, CompareError> {
    use serde_json::Value;

    let fail = || CompareError::Coerce {
        raw: raw.to_string(),
        ty,
    };

    match ty {
        AttrType::Boolean => match raw {
            Value::Bool(b) => Ok(AttrValue::Bool(*b)),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "on" | "1" => Ok(AttrValue::Bool(true)),
                "false" | "off" | "0" => Ok(AttrValue::Bool(false)),
                _ => Err(fail()),
            },
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(AttrValue::Bool(false)),
                Some(1) => Ok(AttrValue::Bool(true)),
                _ => Err(fail()),
            },
            _ => Err(fail()),
        },
        AttrType::Integer => match raw {
            Value::Number(n) => n.as_i64().map(AttrValue::Int).ok_or_else(fail),
            Value::String(s) => s.trim().parse().map(AttrValue::Int).map_err(|_| fail()),
            _ => Err(fail()),
        },
        AttrType::Float => match raw {
            Value::Number(n) => n.as_f64().map(AttrValue::Float).ok_or_else(fail),
            Value::String(s) => s.trim().parse().map(AttrValue::Float).map_err(|_| fail()),
            _ => Err(fail()),
        },
        AttrType::String => match raw {
            Value::String(s) => Ok(AttrValue::Str(s.clone())),
            Value::Number(n) => Ok(AttrValue::Str(n.to_string())),
            Value::Bool(b) => Ok(AttrValue::Str(b.to_string())),
            _ => Err(fail()),
        },
    }
}

/// Compare a reported attribute value against a raw JSON threshold
pub fn compare(
    actual: &AttrValue,
    op: CompareOp,
    threshold: &serde_json::Value,
) -> Result<bool, CompareError> {
    match op {
        CompareOp::In | CompareOp::Nin => {
            let list = threshold
                .as_array()
                .ok_or(CompareError::ListExpected { op })?;

            // Each element coerces independently; one that cannot coerce to
            // the attribute's type can never equal it, so it is skipped.
            let found = list.iter().any(|item| {
                coerce(item, actual.attr_type())
                    .map(|coerced| values_equal(actual, &coerced))
                    .unwrap_or(false)
            });

            Ok(if op == CompareOp::In { found } else { !found })
        }
        CompareOp::Eq | CompareOp::Neq => {
            let coerced = coerce(threshold, actual.attr_type())?;
            let eq = values_equal(actual, &coerced);
            Ok(if op == CompareOp::Eq { eq } else { !eq })
        }
        CompareOp::Gt | CompareOp::Lt | CompareOp::Gte | CompareOp::Lte => {
            let lhs = actual.as_f64().ok_or(CompareError::NotNumeric {
                op,
                ty: actual.attr_type(),
            })?;
            let rhs = numeric_threshold(threshold, op)?;

            Ok(match op {
                CompareOp::Gt => lhs > rhs,
                CompareOp::Lt => lhs < rhs,
                CompareOp::Gte => lhs >= rhs,
                CompareOp::Lte => lhs <= rhs,
                _ => unreachable!(),
            })
        }
    }
}

/// Equality across numeric representations (Int 21 equals Float 21.0)
fn values_equal(a: &AttrValue, b: &AttrValue) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn numeric_threshold(raw: &serde_json::Value, op: CompareOp) -> Result<f64, CompareError> {
    use serde_json::Value;
    match raw {
        Value::Number(n) => n.as_f64().ok_or(CompareError::Coerce {
            raw: raw.to_string(),
            ty: AttrType::Float,
        }),
        Value::String(s) => s.trim().parse().map_err(|_| CompareError::Coerce {
            raw: raw.to_string(),
            ty: AttrType::Float,
        }),
        _ => Err(CompareError::NotNumeric {
            op,
            ty: AttrType::String,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coerce_to_declared_type() {
        assert_eq!(
            coerce(&json!("21"), AttrType::Integer).unwrap(),
            AttrValue::Int(21)
        );
        assert_eq!(
            coerce(&json!("21.5"), AttrType::Float).unwrap(),
            AttrValue::Float(21.5)
        );
        assert_eq!(
            coerce(&json!("on"), AttrType::Boolean).unwrap(),
            AttrValue::Bool(true)
        );
        assert_eq!(
            coerce(&json!(42), AttrType::String).unwrap(),
            AttrValue::Str("42".to_string())
        );
    }

    #[test]
    fn test_coerce_failures() {
        assert!(coerce(&json!("warm"), AttrType::Integer).is_err());
        assert!(coerce(&json!("maybe"), AttrType::Boolean).is_err());
        assert!(coerce(&json!([1, 2]), AttrType::Float).is_err());
    }

    #[test]
    fn test_string_attribute_never_becomes_boolean() {
        // "ON" under a string-typed attribute is an enum string; a boolean
        // threshold stringifies and must not match it.
        let actual = AttrValue::Str("ON".to_string());
        assert!(!compare(&actual, CompareOp::Eq, &json!(true)).unwrap());
        assert!(compare(&actual, CompareOp::Eq, &json!("ON")).unwrap());
    }

    #[test]
    fn test_eq_numeric_cross_type() {
        let actual = AttrValue::Int(21);
        assert!(compare(&actual, CompareOp::Eq, &json!(21.0)).unwrap());
        assert!(compare(&actual, CompareOp::Neq, &json!(22)).unwrap());

        let actual = AttrValue::Float(21.0);
        assert!(compare(&actual, CompareOp::Eq, &json!(21)).unwrap());
    }

    #[test]
    fn test_ordering_operators() {
        let temp = AttrValue::Float(22.5);
        assert!(compare(&temp, CompareOp::Gt, &json!(20)).unwrap());
        assert!(compare(&temp, CompareOp::Lte, &json!("22.5")).unwrap());
        assert!(!compare(&temp, CompareOp::Lt, &json!(22.5)).unwrap());
    }

    #[test]
    fn test_ordering_fails_closed_on_non_numeric() {
        let state = AttrValue::Str("open".to_string());
        let err = compare(&state, CompareOp::Gt, &json!(5)).unwrap_err();
        assert!(matches!(err, CompareError::NotNumeric { .. }));

        let flag = AttrValue::Bool(true);
        assert!(compare(&flag, CompareOp::Gte, &json!(1)).is_err());
    }

    #[test]
    fn test_in_nin_set_membership() {
        let mode = AttrValue::Str("eco".to_string());
        // Membership holds regardless of declared element order
        assert!(compare(&mode, CompareOp::In, &json!(["away", "eco", "home"])).unwrap());
        assert!(compare(&mode, CompareOp::In, &json!(["eco", "home", "away"])).unwrap());
        assert!(!compare(&mode, CompareOp::Nin, &json!(["eco"])).unwrap());
        assert!(compare(&mode, CompareOp::Nin, &json!(["home", "away"])).unwrap());
    }

    #[test]
    fn test_in_requires_list() {
        let mode = AttrValue::Str("eco".to_string());
        let err = compare(&mode, CompareOp::In, &json!("eco")).unwrap_err();
        assert!(matches!(err, CompareError::ListExpected { .. }));
    }

    #[test]
    fn test_in_skips_uncoercible_elements() {
        let level = AttrValue::Int(3);
        assert!(compare(&level, CompareOp::In, &json!(["high", 3])).unwrap());
        assert!(!compare(&level, CompareOp::In, &json!(["high", "low"])).unwrap());
    }

    #[test]
    fn test_applicable_operators() {
        assert!(!applicable_operators(AttrType::Boolean).contains(&CompareOp::Gt));
        assert!(applicable_operators(AttrType::Float).contains(&CompareOp::Gte));
        assert!(applicable_operators(AttrType::String).contains(&CompareOp::In));
    }

    #[test]
    fn test_attr_value_serde() {
        let v: AttrValue = serde_json::from_str("21").unwrap();
        assert_eq!(v, AttrValue::Int(21));
        let v: AttrValue = serde_json::from_str("21.5").unwrap();
        assert_eq!(v, AttrValue::Float(21.5));
        let v: AttrValue = serde_json::from_str("\"eco\"").unwrap();
        assert_eq!(v, AttrValue::Str("eco".to_string()));
        let v: AttrValue = serde_json::from_str("true").unwrap();
        assert_eq!(v, AttrValue::Bool(true));
    }
}
