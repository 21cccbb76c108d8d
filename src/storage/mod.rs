//! Storage collaborators of the kernel.
//!
//! Token registries, the record store adapter, schema storage and the index subsystem
//! (lifecycle service, label scan store and the schema state cache).

/// Token registries for labels, property keys and relationship types.
pub mod catalog;

/// Index lifecycle, label scan store and schema state cache.
pub mod index;

/// Schema rules and schema storage.
pub mod schema;

mod node;
mod props;
mod record;
mod types;

pub use catalog::{Token, TokenMetricsSnapshot, TokenRegistry};
pub use node::{decode_labels, encode_labels, parse_labels_field, LabelField, LabelSet};
pub use props::{value_key, PropertyBlock};
pub use record::{
    read_properties, GraphRecord, MemRecordStore, NodeRecord, PersistenceManager,
    PrimitiveRecord, PropertyOwner, PropertyRecord, RecordStore, RecordStoreOptions,
    RelationshipRecord,
};
pub use schema::{
    IndexDescriptor, MemSchemaStore, SchemaRule, SchemaRuleKind, SchemaStorage, SchemaStore,
    UniquenessConstraint,
};
pub use types::{PropArray, PropValueOwned, Property};
