//! Statically declared atom schemas.
//!
//! Every atom id a config may reference has a field-position → type table.
//! Matchers and dimensions are checked against it at upload time so that
//! positional field access never needs runtime reflection.

use crate::core::types::FieldType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Well-known atom ids.
pub mod atom_ids {
    pub const BLE_SCAN_STATE_CHANGED: i32 = 2;
    pub const SCHEDULED_JOB_STATE_CHANGED: i32 = 8;
    pub const WAKELOCK_STATE_CHANGED: i32 = 10;
    pub const CAMERA_STATE_CHANGED: i32 = 25;
    pub const APP_BREADCRUMB_REPORTED: i32 = 47;
    pub const CPU_TIME_PER_UID: i32 = 10009;
    pub const PROCESS_MEMORY_STATE: i32 = 10018;
}

/// `AppBreadcrumbReported` field positions and state ordinals.
pub mod breadcrumb {
    pub const UID_FIELD: u32 = 1;
    pub const LABEL_FIELD: u32 = 2;
    pub const STATE_FIELD: u32 = 3;

    pub const STATE_UNSPECIFIED: i32 = 0;
    pub const STATE_STOP: i32 = 1;
    pub const STATE_START: i32 = 2;
}

/// `WakelockStateChanged` field positions and state ordinals.
pub mod wakelock {
    pub const TYPE_FIELD: u32 = 1;
    pub const TAG_FIELD: u32 = 2;
    pub const STATE_FIELD: u32 = 3;

    pub const STATE_RELEASE: i32 = 0;
    pub const STATE_ACQUIRE: i32 = 1;
    pub const STATE_CHANGE_RELEASE: i32 = 2;
    pub const STATE_CHANGE_ACQUIRE: i32 = 3;
}

/// Field table for one atom id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomSchema {
    pub atom_id: i32,
    pub name: String,
    pub fields: Vec<FieldType>,
    #[serde(default)]
    pub attribution_chain: bool,
    #[serde(default)]
    pub pulled: bool,
}

impl AtomSchema {
    pub fn new(atom_id: i32, name: impl Into<String>, fields: Vec<FieldType>) -> Self {
        Self {
            atom_id,
            name: name.into(),
            fields,
            attribution_chain: false,
            pulled: false,
        }
    }

    pub fn with_attribution_chain(mut self) -> Self {
        self.attribution_chain = true;
        self
    }

    pub fn pulled(mut self) -> Self {
        self.pulled = true;
        self
    }

    /// Declared type at a 1-based position.
    pub fn field_type(&self, position: u32) -> Option<FieldType> {
        let index = usize::try_from(position).ok()?.checked_sub(1)?;
        self.fields.get(index).copied()
    }
}

/// Lookup table from atom id to schema.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<i32, AtomSchema>,
}

impl SchemaRegistry {
    /// Registry without any declarations.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in atoms.
    pub fn with_builtin_atoms() -> Self {
        use FieldType::*;

        let mut registry = Self::empty();
        registry.register(
            AtomSchema::new(
                atom_ids::BLE_SCAN_STATE_CHANGED,
                "BleScanStateChanged",
                vec![Enum, Bool, Bool, Bool],
            )
            .with_attribution_chain(),
        );
        registry.register(
            AtomSchema::new(
                atom_ids::SCHEDULED_JOB_STATE_CHANGED,
                "ScheduledJobStateChanged",
                vec![String, Enum],
            )
            .with_attribution_chain(),
        );
        registry.register(
            AtomSchema::new(
                atom_ids::WAKELOCK_STATE_CHANGED,
                "WakelockStateChanged",
                vec![Enum, String, Enum],
            )
            .with_attribution_chain(),
        );
        registry.register(
            AtomSchema::new(atom_ids::CAMERA_STATE_CHANGED, "CameraStateChanged", vec![Enum])
                .with_attribution_chain(),
        );
        registry.register(AtomSchema::new(
            atom_ids::APP_BREADCRUMB_REPORTED,
            "AppBreadcrumbReported",
            vec![Int, Int, Enum],
        ));
        registry.register(
            AtomSchema::new(atom_ids::CPU_TIME_PER_UID, "CpuTimePerUid", vec![Int, Long, Long])
                .pulled(),
        );
        registry.register(
            AtomSchema::new(
                atom_ids::PROCESS_MEMORY_STATE,
                "ProcessMemoryState",
                vec![Int, String, Long, Long, Long],
            )
            .pulled(),
        );
        registry
    }

    /// Adds or replaces a schema. Returns the replaced declaration, if any.
    pub fn register(&mut self, schema: AtomSchema) -> Option<AtomSchema> {
        self.schemas.insert(schema.atom_id, schema)
    }

    pub fn get(&self, atom_id: i32) -> Option<&AtomSchema> {
        self.schemas.get(&atom_id)
    }

    pub fn contains(&self, atom_id: i32) -> bool {
        self.schemas.contains_key(&atom_id)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_breadcrumb() {
        let registry = SchemaRegistry::with_builtin_atoms();
        let schema = registry.get(atom_ids::APP_BREADCRUMB_REPORTED).unwrap();
        assert_eq!(schema.field_type(breadcrumb::STATE_FIELD), Some(FieldType::Enum));
        assert_eq!(schema.field_type(breadcrumb::LABEL_FIELD), Some(FieldType::Int));
        assert_eq!(schema.field_type(4), None);
        assert!(!schema.attribution_chain);
    }

    #[test]
    fn test_pulled_atoms_flagged() {
        let registry = SchemaRegistry::with_builtin_atoms();
        assert!(registry.get(atom_ids::CPU_TIME_PER_UID).unwrap().pulled);
        assert!(!registry.get(atom_ids::WAKELOCK_STATE_CHANGED).unwrap().pulled);
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = SchemaRegistry::empty();
        assert!(registry.register(AtomSchema::new(42, "Custom", vec![FieldType::String])).is_none());
        let old = registry.register(AtomSchema::new(42, "Custom", vec![FieldType::Int]));
        assert_eq!(old.unwrap().fields, vec![FieldType::String]);
        assert_eq!(registry.get(42).unwrap().field_type(1), Some(FieldType::Int));
    }

    #[test]
    fn test_schema_yaml() {
        let yaml = r#"
atom_id: 42
name: TestAtom
fields: [string, int]
"#;
        let schema: AtomSchema = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(schema.fields, vec![FieldType::String, FieldType::Int]);
        assert!(!schema.pulled);
    }
}
