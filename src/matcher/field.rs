//! Field-value constraints.
//!
//! Every comparison fails closed: a missing field, an empty attribution
//! chain or a value of the wrong type is a non-match, never an error.

use crate::core::types::{Atom, FieldType, FieldValue};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Which attribution node a constraint or dimension looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainPosition {
    First,
    Last,
    /// Any node in the chain may satisfy the constraint.
    Any,
}

/// What part of the atom a constraint reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldTarget {
    /// Positional field, 1-based.
    Field(u32),
    AttributionUid(ChainPosition),
    AttributionTag(ChainPosition),
}

/// Literal a constraint compares against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatchValue {
    Bool(bool),
    Int(i64),
    Float(f32),
    String(String),
}

impl MatchValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            MatchValue::Bool(_) => "bool",
            MatchValue::Int(_) => "int",
            MatchValue::Float(_) => "float",
            MatchValue::String(_) => "string",
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, MatchValue::Int(_) | MatchValue::Float(_))
    }

    /// Whether this literal can be compared with a field of `declared` type.
    fn comparable_with(&self, declared: FieldType) -> bool {
        match (self, declared) {
            (MatchValue::Int(_), t) => t.is_integral() || t == FieldType::Float,
            (MatchValue::Float(_), FieldType::Float) => true,
            (MatchValue::String(_), FieldType::String) => true,
            (MatchValue::Bool(_), FieldType::Bool) => true,
            _ => false,
        }
    }
}

/// Comparison applied to the targeted value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOp {
    Eq(MatchValue),
    Neq(MatchValue),
    Lt(MatchValue),
    Lte(MatchValue),
    Gt(MatchValue),
    Gte(MatchValue),
    /// Inclusive on both ends.
    Range { min: MatchValue, max: MatchValue },
    EqAnyOf(Vec<MatchValue>),
    NeqAllOf(Vec<MatchValue>),
}

impl MatchOp {
    fn values(&self) -> Vec<&MatchValue> {
        match self {
            MatchOp::Eq(v)
            | MatchOp::Neq(v)
            | MatchOp::Lt(v)
            | MatchOp::Lte(v)
            | MatchOp::Gt(v)
            | MatchOp::Gte(v) => vec![v],
            MatchOp::Range { min, max } => vec![min, max],
            MatchOp::EqAnyOf(vs) | MatchOp::NeqAllOf(vs) => vs.iter().collect(),
        }
    }

    fn is_ordering(&self) -> bool {
        matches!(
            self,
            MatchOp::Lt(_) | MatchOp::Lte(_) | MatchOp::Gt(_) | MatchOp::Gte(_) | MatchOp::Range { .. }
        )
    }

    /// Upload-time type check. On mismatch returns the offending literal type.
    pub fn check_against(&self, declared: FieldType) -> std::result::Result<(), &'static str> {
        for value in self.values() {
            if !value.comparable_with(declared) {
                return Err(value.type_name());
            }
            if self.is_ordering() && !value.is_numeric() {
                return Err(value.type_name());
            }
        }
        Ok(())
    }

    /// Applies the operator to one concrete value.
    pub fn test(&self, field: &FieldValue) -> bool {
        match self {
            MatchOp::Eq(v) => equals(field, v) == Some(true),
            MatchOp::Neq(v) => equals(field, v) == Some(false),
            MatchOp::Lt(v) => compare(field, v) == Some(Ordering::Less),
            MatchOp::Lte(v) => matches!(compare(field, v), Some(Ordering::Less | Ordering::Equal)),
            MatchOp::Gt(v) => compare(field, v) == Some(Ordering::Greater),
            MatchOp::Gte(v) => {
                matches!(compare(field, v), Some(Ordering::Greater | Ordering::Equal))
            },
            MatchOp::Range { min, max } => {
                matches!(compare(field, min), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(compare(field, max), Some(Ordering::Less | Ordering::Equal))
            },
            MatchOp::EqAnyOf(vs) => vs.iter().any(|v| equals(field, v) == Some(true)),
            MatchOp::NeqAllOf(vs) => {
                !vs.is_empty() && vs.iter().all(|v| equals(field, v) == Some(false))
            },
        }
    }
}

/// One constraint of a simple matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValueMatcher {
    pub target: FieldTarget,
    #[serde(flatten)]
    pub op: MatchOp,
}

impl FieldValueMatcher {
    pub fn new(target: FieldTarget, op: MatchOp) -> Self {
        Self { target, op }
    }

    /// Shorthand for an integer equality on a positional field.
    pub fn eq_int(position: u32, value: i64) -> Self {
        Self::new(FieldTarget::Field(position), MatchOp::Eq(MatchValue::Int(value)))
    }

    /// Shorthand for a string equality on a positional field.
    pub fn eq_string(position: u32, value: impl Into<String>) -> Self {
        Self::new(
            FieldTarget::Field(position),
            MatchOp::Eq(MatchValue::String(value.into())),
        )
    }

    pub fn matches(&self, atom: &Atom) -> bool {
        match self.target {
            FieldTarget::Field(position) => {
                atom.field(position).is_some_and(|field| self.op.test(field))
            },
            FieldTarget::AttributionUid(position) => {
                self.test_chain(atom, position, |node| FieldValue::Int(node.uid))
            },
            FieldTarget::AttributionTag(position) => {
                self.test_chain(atom, position, |node| FieldValue::Str(node.tag.clone()))
            },
        }
    }

    fn test_chain<F>(&self, atom: &Atom, position: ChainPosition, project: F) -> bool
    where
        F: Fn(&crate::core::types::AttributionNode) -> FieldValue,
    {
        let chain = atom.attribution_chain();
        match position {
            ChainPosition::First => chain.first().is_some_and(|n| self.op.test(&project(n))),
            ChainPosition::Last => chain.last().is_some_and(|n| self.op.test(&project(n))),
            ChainPosition::Any => chain.iter().any(|n| self.op.test(&project(n))),
        }
    }
}

fn equals(field: &FieldValue, value: &MatchValue) -> Option<bool> {
    match (field, value) {
        (FieldValue::Str(s), MatchValue::String(v)) => Some(s == v),
        (FieldValue::Bool(b), MatchValue::Bool(v)) => Some(b == v),
        _ => compare(field, value).map(|o| o == Ordering::Equal),
    }
}

fn compare(field: &FieldValue, value: &MatchValue) -> Option<Ordering> {
    match (field, value) {
        (FieldValue::Float(f), MatchValue::Float(v)) => f.partial_cmp(v),
        #[allow(clippy::cast_precision_loss)]
        (FieldValue::Float(f), MatchValue::Int(v)) => f64::from(*f).partial_cmp(&(*v as f64)),
        (field, MatchValue::Int(v)) => field.as_i64().map(|f| f.cmp(v)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::parse_yaml;

    fn wakelock(tag: &str, state: i32) -> Atom {
        Atom::builder(10)
            .attribution(10001, "app_main")
            .attribution(1000, "system")
            .enumeration(1)
            .string(tag)
            .enumeration(state)
            .build()
            .unwrap()
    }

    #[test]
    fn test_enum_compares_by_ordinal() {
        let atom = wakelock("wl", 1);
        assert!(FieldValueMatcher::eq_int(3, 1).matches(&atom));
        assert!(!FieldValueMatcher::eq_int(3, 0).matches(&atom));
    }

    #[test]
    fn test_type_mismatch_fails_closed() {
        let atom = wakelock("wl", 1);
        // Field 2 is a string; integer constraints never match it, not even via Neq.
        assert!(!FieldValueMatcher::eq_int(2, 1).matches(&atom));
        let neq = FieldValueMatcher::new(FieldTarget::Field(2), MatchOp::Neq(MatchValue::Int(1)));
        assert!(!neq.matches(&atom));
    }

    #[test]
    fn test_missing_field_fails_closed() {
        let atom = wakelock("wl", 1);
        assert!(!FieldValueMatcher::eq_int(9, 1).matches(&atom));
    }

    #[test]
    fn test_string_equality_is_exact() {
        let atom = wakelock("wakelock1", 1);
        assert!(FieldValueMatcher::eq_string(2, "wakelock1").matches(&atom));
        assert!(!FieldValueMatcher::eq_string(2, "Wakelock1").matches(&atom));
    }

    #[test]
    fn test_range_and_ordering() {
        let atom = Atom::builder(42).long(150).float(2.5).build().unwrap();
        let in_range = FieldValueMatcher::new(
            FieldTarget::Field(1),
            MatchOp::Range {
                min: MatchValue::Int(100),
                max: MatchValue::Int(150),
            },
        );
        assert!(in_range.matches(&atom));
        let gt = FieldValueMatcher::new(FieldTarget::Field(2), MatchOp::Gt(MatchValue::Float(2.0)));
        assert!(gt.matches(&atom));
        let lt = FieldValueMatcher::new(FieldTarget::Field(2), MatchOp::Lt(MatchValue::Int(2)));
        assert!(!lt.matches(&atom));
    }

    #[test]
    fn test_attribution_positions() {
        let atom = wakelock("wl", 1);
        let first = FieldValueMatcher::new(
            FieldTarget::AttributionUid(ChainPosition::First),
            MatchOp::Eq(MatchValue::Int(1000)),
        );
        let last = FieldValueMatcher::new(
            FieldTarget::AttributionUid(ChainPosition::Last),
            MatchOp::Eq(MatchValue::Int(1000)),
        );
        let any = FieldValueMatcher::new(
            FieldTarget::AttributionUid(ChainPosition::Any),
            MatchOp::Eq(MatchValue::Int(1000)),
        );
        assert!(!first.matches(&atom));
        assert!(last.matches(&atom));
        assert!(any.matches(&atom));

        let tag = FieldValueMatcher::new(
            FieldTarget::AttributionTag(ChainPosition::First),
            MatchOp::Eq(MatchValue::String("app_main".into())),
        );
        assert!(tag.matches(&atom));
    }

    #[test]
    fn test_empty_chain_fails_closed() {
        let atom = Atom::builder(10).enumeration(1).build().unwrap();
        let any = FieldValueMatcher::new(
            FieldTarget::AttributionUid(ChainPosition::Any),
            MatchOp::Neq(MatchValue::Int(0)),
        );
        assert!(!any.matches(&atom));
    }

    #[test]
    fn test_any_of_and_none_of() {
        let atom = wakelock("wl", 3);
        let any_of = FieldValueMatcher::new(
            FieldTarget::Field(3),
            MatchOp::EqAnyOf(vec![MatchValue::Int(1), MatchValue::Int(3)]),
        );
        let none_of = FieldValueMatcher::new(
            FieldTarget::Field(3),
            MatchOp::NeqAllOf(vec![MatchValue::Int(0), MatchValue::Int(2)]),
        );
        assert!(any_of.matches(&atom));
        assert!(none_of.matches(&atom));
    }

    #[test]
    fn test_upload_type_check() {
        let op = MatchOp::Eq(MatchValue::String("x".into()));
        assert_eq!(op.check_against(FieldType::Int), Err("string"));
        assert!(op.check_against(FieldType::String).is_ok());
        assert!(MatchOp::Gte(MatchValue::Int(3)).check_against(FieldType::Enum).is_ok());
        assert_eq!(
            MatchOp::Gt(MatchValue::Bool(true)).check_against(FieldType::Bool),
            Err("bool")
        );
    }

    #[test]
    fn test_yaml_shape() {
        let yaml = r#"
target: { field: 3 }
eq: 2
"#;
        let m: FieldValueMatcher = parse_yaml(yaml).unwrap();
        assert_eq!(m, FieldValueMatcher::eq_int(3, 2));

        let yaml = r#"
target: { attribution_uid: any }
eq_any_of: [1000, 1001]
"#;
        let m: FieldValueMatcher = parse_yaml(yaml).unwrap();
        assert_eq!(m.target, FieldTarget::AttributionUid(ChainPosition::Any));
    }
}
