//! Protobuf wire format for atom ingress.
//!
//! Messages are declared with prost derives so no build step is needed:
//!
//! ```text
//! message AtomBatch { repeated AtomProto atoms = 1; }
//! message AtomProto {
//!   int32 atom_id = 1;
//!   int64 elapsed_timestamp_ns = 2;
//!   repeated FieldValueProto fields = 3;
//!   repeated AttributionNodeProto attribution_chain = 4;
//! }
//! ```

use crate::core::error::{AtomdError, Result};
use crate::core::types::{Atom, AttributionNode, FieldValue};
use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct AtomBatch {
    #[prost(message, repeated, tag = "1")]
    pub atoms: Vec<AtomProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AtomProto {
    #[prost(int32, tag = "1")]
    pub atom_id: i32,
    #[prost(int64, tag = "2")]
    pub elapsed_timestamp_ns: i64,
    #[prost(message, repeated, tag = "3")]
    pub fields: Vec<FieldValueProto>,
    #[prost(message, repeated, tag = "4")]
    pub attribution_chain: Vec<AttributionNodeProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AttributionNodeProto {
    #[prost(int32, tag = "1")]
    pub uid: i32,
    #[prost(string, tag = "2")]
    pub tag: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct FieldValueProto {
    #[prost(oneof = "field_value_proto::Value", tags = "1, 2, 3, 4, 5, 6")]
    pub value: Option<field_value_proto::Value>,
}

pub mod field_value_proto {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Value {
        #[prost(int32, tag = "1")]
        Int(i32),
        #[prost(int64, tag = "2")]
        Long(i64),
        #[prost(float, tag = "3")]
        Float(f32),
        #[prost(string, tag = "4")]
        Str(String),
        #[prost(bool, tag = "5")]
        Bool(bool),
        #[prost(int32, tag = "6")]
        Enum(i32),
    }
}

use field_value_proto::Value;

impl TryFrom<AtomProto> for Atom {
    type Error = AtomdError;

    fn try_from(proto: AtomProto) -> Result<Self> {
        let atom_id = proto.atom_id;
        let fields = proto
            .fields
            .into_iter()
            .enumerate()
            .map(|(i, field)| {
                let value = field.value.ok_or_else(|| {
                    AtomdError::malformed(format!("atom {} field {} has no value", atom_id, i + 1))
                })?;
                Ok(match value {
                    Value::Int(v) => FieldValue::Int(v),
                    Value::Long(v) => FieldValue::Long(v),
                    Value::Float(v) => FieldValue::Float(v),
                    Value::Str(v) => FieldValue::Str(v),
                    Value::Bool(v) => FieldValue::Bool(v),
                    Value::Enum(v) => FieldValue::Enum(v),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let chain = proto
            .attribution_chain
            .into_iter()
            .map(|node| AttributionNode::new(node.uid, node.tag))
            .collect();

        Atom::builder(atom_id)
            .timestamp_ns(proto.elapsed_timestamp_ns)
            .fields(fields)
            .attribution_chain(chain)
            .build()
    }
}

impl From<&Atom> for AtomProto {
    fn from(atom: &Atom) -> Self {
        let fields = atom
            .fields()
            .iter()
            .map(|field| FieldValueProto {
                value: Some(match field {
                    FieldValue::Int(v) => Value::Int(*v),
                    FieldValue::Long(v) => Value::Long(*v),
                    FieldValue::Float(v) => Value::Float(*v),
                    FieldValue::Str(v) => Value::Str(v.clone()),
                    FieldValue::Bool(v) => Value::Bool(*v),
                    FieldValue::Enum(v) => Value::Enum(*v),
                }),
            })
            .collect();
        let attribution_chain = atom
            .attribution_chain()
            .iter()
            .map(|node| AttributionNodeProto {
                uid: node.uid,
                tag: node.tag.clone(),
            })
            .collect();
        AtomProto {
            atom_id: atom.atom_id(),
            elapsed_timestamp_ns: atom.elapsed_timestamp_ns(),
            fields,
            attribution_chain,
        }
    }
}

/// Atoms of a decoded batch, plus the errors of the ones that were dropped.
pub fn decode_batch(body: &[u8]) -> Result<(Vec<Atom>, Vec<AtomdError>)> {
    let batch = AtomBatch::decode(body)?;
    let mut atoms = Vec::with_capacity(batch.atoms.len());
    let mut dropped = Vec::new();
    for proto in batch.atoms {
        match Atom::try_from(proto) {
            Ok(atom) => atoms.push(atom),
            Err(e) => dropped.push(e),
        }
    }
    Ok((atoms, dropped))
}

/// Encodes atoms as an [`AtomBatch`].
pub fn encode_batch(atoms: &[Atom]) -> Vec<u8> {
    AtomBatch {
        atoms: atoms.iter().map(AtomProto::from).collect(),
    }
    .encode_to_vec()
}
