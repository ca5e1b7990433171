//! Data models for the sync engine.
//!
//! - [`entity`] - entity type discriminators and source state vocabulary
//! - [`snapshot`] - typed source snapshots and decoded change records
//! - [`row`] - target rows mirrored into the records store

pub mod entity;
pub mod row;
pub mod snapshot;

pub use entity::{EntityType, SourceState};
pub use row::{InductionFields, InductionStatus, MappedFields, PersonFields, TargetRow};
pub use snapshot::{
    ChangeRecord, ContactAttributes, ContactSnapshot, InductionAttributes, InductionSnapshot,
    SnapshotMeta, SourceSnapshot,
};
