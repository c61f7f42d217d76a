//! Atom matchers.
//!
//! A simple matcher selects atoms by id plus ANDed field constraints.
//! Combination matchers join other matchers of the same config with a
//! logical operation. [`MatcherSet`] evaluates every matcher of a config
//! once per atom, children before parents.

pub mod field;

pub use field::{ChainPosition, FieldTarget, FieldValueMatcher, MatchOp, MatchValue};

use crate::core::error::ConfigError;
use crate::core::types::Atom;
use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};

/// A named predicate over atoms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomMatcher {
    pub id: i64,
    #[serde(flatten)]
    pub kind: MatcherKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherKind {
    Simple(SimpleAtomMatcher),
    Combination(CombinationMatcher),
}

/// Atom-id equality plus zero or more field constraints, all ANDed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleAtomMatcher {
    pub atom_id: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_value_matchers: Vec<FieldValueMatcher>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperation {
    And,
    Or,
    Not,
    Nand,
    Nor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinationMatcher {
    pub operation: LogicalOperation,
    pub matchers: Vec<i64>,
}

impl AtomMatcher {
    pub fn simple(id: i64, atom_id: i32) -> Self {
        Self {
            id,
            kind: MatcherKind::Simple(SimpleAtomMatcher {
                atom_id,
                field_value_matchers: Vec::new(),
            }),
        }
    }

    pub fn combination(id: i64, operation: LogicalOperation, matchers: Vec<i64>) -> Self {
        Self {
            id,
            kind: MatcherKind::Combination(CombinationMatcher {
                operation,
                matchers,
            }),
        }
    }

    /// Adds a constraint to a simple matcher. No-op on combinations.
    pub fn with_field(mut self, constraint: FieldValueMatcher) -> Self {
        if let MatcherKind::Simple(simple) = &mut self.kind {
            simple.field_value_matchers.push(constraint);
        }
        self
    }
}

/// Evaluates a simple matcher against one atom.
///
/// Deterministic and side-effect free: the result depends only on the
/// atom's id and field values.
pub fn matches(matcher: &SimpleAtomMatcher, atom: &Atom) -> bool {
    matcher.atom_id == atom.atom_id()
        && matcher
            .field_value_matchers
            .iter()
            .all(|constraint| constraint.matches(atom))
}

/// Per-atom evaluation result of a [`MatcherSet`].
#[derive(Debug, Clone)]
pub struct MatchResults {
    fired: Vec<i64>,
}

impl MatchResults {
    pub fn is_empty(&self) -> bool {
        self.fired.is_empty()
    }

    pub fn contains(&self, matcher_id: i64) -> bool {
        self.fired.contains(&matcher_id)
    }

    /// Ids of matchers that fired, in evaluation order.
    pub fn fired(&self) -> &[i64] {
        &self.fired
    }
}

#[derive(Debug, Clone)]
enum Compiled {
    Simple(SimpleAtomMatcher),
    Combination(LogicalOperation, Vec<usize>),
}

/// All matchers of one config, validated and ordered for evaluation.
#[derive(Debug, Clone)]
pub struct MatcherSet {
    ids: Vec<i64>,
    compiled: Vec<Compiled>,
    /// Indices in children-first order.
    order: Vec<usize>,
    index: AHashMap<i64, usize>,
    interesting_atoms: AHashSet<i32>,
}

impl MatcherSet {
    /// Builds the set, rejecting duplicate ids, dangling children and cycles.
    pub fn new(matchers: &[AtomMatcher]) -> std::result::Result<Self, ConfigError> {
        let mut index = AHashMap::with_capacity(matchers.len());
        for (i, m) in matchers.iter().enumerate() {
            if index.insert(m.id, i).is_some() {
                return Err(ConfigError::DuplicateMatcherId(m.id));
            }
        }

        let mut compiled = Vec::with_capacity(matchers.len());
        let mut interesting_atoms = AHashSet::new();
        for m in matchers {
            match &m.kind {
                MatcherKind::Simple(simple) => {
                    interesting_atoms.insert(simple.atom_id);
                    compiled.push(Compiled::Simple(simple.clone()));
                },
                MatcherKind::Combination(combo) => {
                    let valid_arity = match combo.operation {
                        LogicalOperation::Not => combo.matchers.len() == 1,
                        _ => !combo.matchers.is_empty(),
                    };
                    if !valid_arity {
                        return Err(ConfigError::InvalidCombination(m.id));
                    }
                    let children = combo
                        .matchers
                        .iter()
                        .map(|child| {
                            index.get(child).copied().ok_or_else(|| {
                                ConfigError::DanglingReference {
                                    owner: format!("matcher {}", m.id),
                                    kind: "matcher",
                                    target: *child,
                                }
                            })
                        })
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    compiled.push(Compiled::Combination(combo.operation, children));
                },
            }
        }

        let order = topological_order(matchers, &compiled)?;

        Ok(Self {
            ids: matchers.iter().map(|m| m.id).collect(),
            compiled,
            order,
            index,
            interesting_atoms,
        })
    }

    pub fn contains(&self, matcher_id: i64) -> bool {
        self.index.contains_key(&matcher_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Simple matcher definition by id, if it is one.
    pub fn simple(&self, matcher_id: i64) -> Option<&SimpleAtomMatcher> {
        match self.compiled.get(*self.index.get(&matcher_id)?)? {
            Compiled::Simple(simple) => Some(simple),
            Compiled::Combination(..) => None,
        }
    }

    /// Atom ids a matcher can ever fire on.
    pub fn atom_ids_of(&self, matcher_id: i64) -> Vec<i32> {
        let mut out = Vec::new();
        if let Some(&i) = self.index.get(&matcher_id) {
            self.collect_atom_ids(i, &mut out);
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_atom_ids(&self, i: usize, out: &mut Vec<i32>) {
        match &self.compiled[i] {
            Compiled::Simple(simple) => out.push(simple.atom_id),
            Compiled::Combination(_, children) => {
                for &child in children {
                    self.collect_atom_ids(child, out);
                }
            },
        }
    }

    /// Evaluates every matcher against the atom.
    pub fn evaluate(&self, atom: &Atom) -> MatchResults {
        if !self.interesting_atoms.contains(&atom.atom_id()) {
            return MatchResults { fired: Vec::new() };
        }

        let mut state = vec![false; self.compiled.len()];
        for &i in &self.order {
            state[i] = match &self.compiled[i] {
                Compiled::Simple(simple) => matches(simple, atom),
                Compiled::Combination(op, children) => {
                    let mut values = children.iter().map(|&c| state[c]);
                    match op {
                        LogicalOperation::And => values.all(|v| v),
                        LogicalOperation::Or => values.any(|v| v),
                        LogicalOperation::Not => !values.next().unwrap_or(true),
                        LogicalOperation::Nand => !values.all(|v| v),
                        LogicalOperation::Nor => !values.any(|v| v),
                    }
                },
            };
        }

        let fired = self
            .order
            .iter()
            .filter(|&&i| state[i])
            .map(|&i| self.ids[i])
            .collect();
        MatchResults { fired }
    }
}

fn topological_order(
    matchers: &[AtomMatcher],
    compiled: &[Compiled],
) -> std::result::Result<Vec<usize>, ConfigError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    fn visit(
        i: usize,
        matchers: &[AtomMatcher],
        compiled: &[Compiled],
        marks: &mut [Mark],
        order: &mut Vec<usize>,
    ) -> std::result::Result<(), ConfigError> {
        match marks[i] {
            Mark::Done => return Ok(()),
            Mark::InProgress => return Err(ConfigError::MatcherCycle(matchers[i].id)),
            Mark::Unvisited => {},
        }
        marks[i] = Mark::InProgress;
        if let Compiled::Combination(_, children) = &compiled[i] {
            for &child in children {
                visit(child, matchers, compiled, marks, order)?;
            }
        }
        marks[i] = Mark::Done;
        order.push(i);
        Ok(())
    }

    let mut marks = vec![Mark::Unvisited; compiled.len()];
    let mut order = Vec::with_capacity(compiled.len());
    for i in 0..compiled.len() {
        visit(i, matchers, compiled, &mut marks, &mut order)?;
    }
    Ok(order)
}
