use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::error::{AtomdError, Result};

/// Identity of an uploaded stats config: the uploading uid plus the config id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigKey {
    pub uid: i32,
    pub id: i64,
}

impl ConfigKey {
    pub fn new(uid: i32, id: i64) -> Self {
        Self { uid, id }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.uid, self.id)
    }
}

/// Declared type of a positional atom field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Int,
    Long,
    Float,
    String,
    Bool,
    Enum,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Int => "int",
            FieldType::Long => "long",
            FieldType::Float => "float",
            FieldType::String => "string",
            FieldType::Bool => "bool",
            FieldType::Enum => "enum",
        }
    }

    /// Int, long and enum fields all compare as integers.
    pub fn is_integral(&self) -> bool {
        matches!(self, FieldType::Int | FieldType::Long | FieldType::Enum)
    }
}

/// A single typed field value carried by an atom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Int(i32),
    Long(i64),
    Float(f32),
    #[serde(rename = "string")]
    Str(String),
    Bool(bool),
    Enum(i32),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Int(_) => FieldType::Int,
            FieldValue::Long(_) => FieldType::Long,
            FieldValue::Float(_) => FieldType::Float,
            FieldValue::Str(_) => FieldType::String,
            FieldValue::Bool(_) => FieldType::Bool,
            FieldValue::Enum(_) => FieldType::Enum,
        }
    }

    /// Integer view of int, long and enum fields.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) | FieldValue::Enum(v) => Some(i64::from(*v)),
            FieldValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view used by value metrics.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(f64::from(*v)),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) | FieldValue::Enum(v) => write!(f, "{}", v),
            FieldValue::Long(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Str(s) => write!(f, "{}", s),
            FieldValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// One (uid, tag) link of an attribution chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributionNode {
    pub uid: i32,
    #[serde(default)]
    pub tag: String,
}

impl AttributionNode {
    pub fn new(uid: i32, tag: impl Into<String>) -> Self {
        Self {
            uid,
            tag: tag.into(),
        }
    }
}

/// An immutable structured telemetry event.
///
/// Fields are positional; position 1 is the first element of `fields`.
/// The attribution chain, when present, is carried beside the fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    atom_id: i32,
    #[serde(default)]
    elapsed_timestamp_ns: i64,
    #[serde(default)]
    fields: Vec<FieldValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    attribution_chain: Vec<AttributionNode>,
}

impl Atom {
    /// Creates a new atom after validating its id
    pub fn new(atom_id: i32, elapsed_timestamp_ns: i64, fields: Vec<FieldValue>) -> Result<Self> {
        Self::builder(atom_id)
            .timestamp_ns(elapsed_timestamp_ns)
            .fields(fields)
            .build()
    }

    pub fn builder(atom_id: i32) -> AtomBuilder {
        AtomBuilder {
            atom_id,
            elapsed_timestamp_ns: 0,
            fields: Vec::new(),
            attribution_chain: Vec::new(),
        }
    }

    pub fn atom_id(&self) -> i32 {
        self.atom_id
    }

    pub fn elapsed_timestamp_ns(&self) -> i64 {
        self.elapsed_timestamp_ns
    }

    pub fn fields(&self) -> &[FieldValue] {
        &self.fields
    }

    /// Field at a 1-based position.
    pub fn field(&self, position: u32) -> Option<&FieldValue> {
        let index = usize::try_from(position).ok()?.checked_sub(1)?;
        self.fields.get(index)
    }

    pub fn attribution_chain(&self) -> &[AttributionNode] {
        &self.attribution_chain
    }

    pub fn has_attribution_chain(&self) -> bool {
        !self.attribution_chain.is_empty()
    }

    /// Copy of this atom stamped with a different timestamp.
    pub fn with_timestamp_ns(&self, elapsed_timestamp_ns: i64) -> Self {
        Self {
            elapsed_timestamp_ns,
            ..self.clone()
        }
    }

    /// Structural well-formedness check used on ingress.
    pub fn validate(&self) -> Result<()> {
        if self.atom_id < 0 {
            return Err(AtomdError::malformed(format!("atom id {} is negative", self.atom_id)));
        }
        if self.elapsed_timestamp_ns < 0 {
            return Err(AtomdError::malformed(format!(
                "atom {} has negative timestamp {}",
                self.atom_id, self.elapsed_timestamp_ns
            )));
        }
        Ok(())
    }
}

/// Builder for [`Atom`].
#[derive(Debug, Clone)]
pub struct AtomBuilder {
    atom_id: i32,
    elapsed_timestamp_ns: i64,
    fields: Vec<FieldValue>,
    attribution_chain: Vec<AttributionNode>,
}

impl AtomBuilder {
    pub fn timestamp_ns(mut self, ts: i64) -> Self {
        self.elapsed_timestamp_ns = ts;
        self
    }

    pub fn field(mut self, value: FieldValue) -> Self {
        self.fields.push(value);
        self
    }

    pub fn fields(mut self, values: Vec<FieldValue>) -> Self {
        self.fields.extend(values);
        self
    }

    pub fn int(self, v: i32) -> Self {
        self.field(FieldValue::Int(v))
    }

    pub fn long(self, v: i64) -> Self {
        self.field(FieldValue::Long(v))
    }

    pub fn float(self, v: f32) -> Self {
        self.field(FieldValue::Float(v))
    }

    pub fn string(self, v: impl Into<String>) -> Self {
        self.field(FieldValue::Str(v.into()))
    }

    pub fn boolean(self, v: bool) -> Self {
        self.field(FieldValue::Bool(v))
    }

    pub fn enumeration(self, v: i32) -> Self {
        self.field(FieldValue::Enum(v))
    }

    pub fn attribution(mut self, uid: i32, tag: impl Into<String>) -> Self {
        self.attribution_chain.push(AttributionNode::new(uid, tag));
        self
    }

    pub fn attribution_chain(mut self, chain: Vec<AttributionNode>) -> Self {
        self.attribution_chain = chain;
        self
    }

    pub fn build(self) -> Result<Atom> {
        let atom = Atom {
            atom_id: self.atom_id,
            elapsed_timestamp_ns: self.elapsed_timestamp_ns,
            fields: self.fields,
            attribution_chain: self.attribution_chain,
        };
        atom.validate()?;
        Ok(atom)
    }
}
