//! Dimension keys: the projection of an atom onto a metric's
//! `dimensions_in_what`.

use crate::core::types::{Atom, AttributionNode, FieldValue};
use crate::matcher::{ChainPosition, FieldTarget};
use crate::uid_map::UidMap;
use serde::{Serialize, Serializer};
use smallvec::SmallVec;
use std::fmt;

/// One projected value. Floats are kept as raw bits so keys hash and order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DimensionValue {
    Int(i64),
    Float(u32),
    Str(String),
    Bool(bool),
}

impl From<&FieldValue> for DimensionValue {
    fn from(value: &FieldValue) -> Self {
        match value {
            FieldValue::Int(v) | FieldValue::Enum(v) => DimensionValue::Int(i64::from(*v)),
            FieldValue::Long(v) => DimensionValue::Int(*v),
            FieldValue::Float(v) => DimensionValue::Float(v.to_bits()),
            FieldValue::Str(v) => DimensionValue::Str(v.clone()),
            FieldValue::Bool(v) => DimensionValue::Bool(*v),
        }
    }
}

impl Serialize for DimensionValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DimensionValue::Int(v) => serializer.serialize_i64(*v),
            DimensionValue::Float(bits) => serializer.serialize_f32(f32::from_bits(*bits)),
            DimensionValue::Str(v) => serializer.serialize_str(v),
            DimensionValue::Bool(v) => serializer.serialize_bool(*v),
        }
    }
}

impl fmt::Display for DimensionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimensionValue::Int(v) => write!(f, "{}", v),
            DimensionValue::Float(bits) => write!(f, "{}", f32::from_bits(*bits)),
            DimensionValue::Str(v) => f.write_str(v),
            DimensionValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

/// Ordered projected values. Empty for undimensioned metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DimensionKey(SmallVec<[DimensionValue; 3]>);

impl DimensionKey {
    /// Key of an undimensioned metric.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_values(values: impl IntoIterator<Item = DimensionValue>) -> Self {
        Self(values.into_iter().collect())
    }

    pub fn values(&self) -> &[DimensionValue] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Projects an atom. Returns `None` when a projected field or attribution
    /// node is missing, in which case the atom does not count for the metric.
    /// Attribution uids are resolved to their host uid.
    pub fn project(atom: &Atom, dimensions: &[FieldTarget], uid_map: &UidMap) -> Option<Self> {
        let mut values = SmallVec::new();
        for dimension in dimensions {
            match *dimension {
                FieldTarget::Field(position) => {
                    values.push(DimensionValue::from(atom.field(position)?));
                },
                FieldTarget::AttributionUid(position) => {
                    for node in chain_nodes(atom, position)? {
                        let uid = uid_map.host_uid_or_self(node.uid);
                        values.push(DimensionValue::Int(i64::from(uid)));
                    }
                },
                FieldTarget::AttributionTag(position) => {
                    for node in chain_nodes(atom, position)? {
                        values.push(DimensionValue::Str(node.tag.clone()));
                    }
                },
            }
        }
        Some(Self(values))
    }
}

/// `Any` projects every node of the chain.
fn chain_nodes(atom: &Atom, position: ChainPosition) -> Option<&[AttributionNode]> {
    let chain = atom.attribution_chain();
    if chain.is_empty() {
        return None;
    }
    match position {
        ChainPosition::First => Some(&chain[..1]),
        ChainPosition::Last => Some(&chain[chain.len() - 1..]),
        ChainPosition::Any => Some(chain),
    }
}

impl fmt::Display for DimensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            write!(f, "{}", value)?;
        }
        Ok(())
    }
}

/// Caps the number of distinct keys per metric bucket.
#[derive(Debug, Clone)]
pub struct DimensionGuardrail {
    max_keys: usize,
    hit: bool,
}

impl DimensionGuardrail {
    pub fn new(max_keys: usize) -> Self {
        Self {
            max_keys,
            hit: false,
        }
    }

    /// Whether a key may be tracked given how many distinct keys are already
    /// tracked. Known keys are always admitted.
    pub fn admit(&mut self, known: bool, tracked: usize) -> bool {
        if known || tracked < self.max_keys {
            return true;
        }
        if !self.hit {
            tracing::warn!("Dimension guardrail hit at {} keys", self.max_keys);
        }
        self.hit = true;
        false
    }

    pub fn hit(&self) -> bool {
        self.hit
    }

    pub fn reset(&mut self) {
        self.hit = false;
    }
}
