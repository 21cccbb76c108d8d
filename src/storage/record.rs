//! Record store adapter and persistence collaborator seams.
//!
//! [`RecordStore`] is the read side of persisted entity records; [`PersistenceManager`]
//! is the write side used only by commit application. [`MemRecordStore`] implements both
//! over in-memory record maps, keeping the record shapes (label fields, property record
//! chains, dynamic label records) of a paged store.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::types::{
    DynRecordId, EntityKind, LabelId, NodeId, PropId, PropRecordId, RelId, Result, StorageError,
    TypeId,
};

use super::node::{encode_labels, LabelField};
use super::props::PropertyBlock;
use super::types::{PropValueOwned, Property};

/// Persisted node record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub labels: LabelField,
    pub next_prop: Option<PropRecordId>,
}

/// Persisted relationship record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationshipRecord {
    pub id: RelId,
    pub ty: TypeId,
    pub start: NodeId,
    pub end: NodeId,
    pub next_prop: Option<PropRecordId>,
}

/// The singleton graph-global record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GraphRecord {
    pub next_prop: Option<PropRecordId>,
}

/// One link of a property chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyRecord {
    pub id: PropRecordId,
    pub blocks: Vec<PropertyBlock>,
    pub next: Option<PropRecordId>,
}

/// Records that own a property chain.
pub trait PrimitiveRecord {
    fn next_prop(&self) -> Option<PropRecordId>;
}

impl PrimitiveRecord for NodeRecord {
    fn next_prop(&self) -> Option<PropRecordId> {
        self.next_prop
    }
}

impl PrimitiveRecord for RelationshipRecord {
    fn next_prop(&self) -> Option<PropRecordId> {
        self.next_prop
    }
}

impl PrimitiveRecord for GraphRecord {
    fn next_prop(&self) -> Option<PropRecordId> {
        self.next_prop
    }
}

/// Entity owning a set of stored properties.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PropertyOwner {
    Node(NodeId),
    Relationship(RelId),
    Graph,
}

/// Read access to persisted records. Fails with [`StorageError::InvalidRecord`] for ids
/// that do not name an in-use record.
pub trait RecordStore: Send + Sync {
    fn node_record(&self, id: NodeId) -> Result<NodeRecord>;
    fn relationship_record(&self, id: RelId) -> Result<RelationshipRecord>;
    fn graph_record(&self) -> Result<GraphRecord>;
    fn dynamic_label_record(&self, id: DynRecordId) -> Result<Vec<u8>>;
    /// Loads the property chain starting at `start`; `None` when there is no chain.
    fn property_record_chain(
        &self,
        start: Option<PropRecordId>,
    ) -> Result<Option<Vec<PropertyRecord>>>;
}

/// Write side of the persistence layer, driven by commit application only.
pub trait PersistenceManager: Send + Sync {
    fn reserve_node_id(&self) -> NodeId;
    fn reserve_relationship_id(&self) -> RelId;
    fn node_create(&self, id: NodeId) -> Result<()>;
    fn node_delete(&self, id: NodeId) -> Result<()>;
    fn node_set_labels(&self, id: NodeId, labels: &[LabelId]) -> Result<()>;
    fn relationship_create(&self, id: RelId, ty: TypeId, start: NodeId, end: NodeId)
        -> Result<()>;
    fn relationship_delete(&self, id: RelId) -> Result<()>;
    fn add_property(&self, owner: PropertyOwner, key: PropId, value: &PropValueOwned)
        -> Result<()>;
    fn change_property(
        &self,
        owner: PropertyOwner,
        key: PropId,
        value: &PropValueOwned,
    ) -> Result<()>;
    fn remove_property(&self, owner: PropertyOwner, key: PropId) -> Result<()>;
}

/// Loads and decodes every property block reachable from `head`, in chain order.
pub fn read_properties(store: &dyn RecordStore, head: Option<PropRecordId>) -> Result<Vec<Property>> {
    let Some(chain) = store.property_record_chain(head)? else {
        return Ok(Vec::new());
    };
    let mut props = Vec::with_capacity(chain.iter().map(|r| r.blocks.len()).sum());
    for record in &chain {
        for block in &record.blocks {
            props.push(block.decode()?);
        }
    }
    Ok(props)
}

/// Shape parameters for [`MemRecordStore`].
#[derive(Clone, Copy, Debug)]
pub struct RecordStoreOptions {
    /// Property blocks packed into one property record.
    pub blocks_per_record: usize,
    /// Label sets larger than this spill into a dynamic label record.
    pub inline_label_limit: usize,
}

impl Default for RecordStoreOptions {
    fn default() -> Self {
        Self {
            blocks_per_record: 4,
            inline_label_limit: 4,
        }
    }
}

#[derive(Default)]
struct Records {
    nodes: FxHashMap<u64, NodeRecord>,
    relationships: FxHashMap<u64, RelationshipRecord>,
    graph: GraphRecord,
    props: FxHashMap<u64, PropertyRecord>,
    dynamic_labels: FxHashMap<u64, Vec<u8>>,
    next_prop_record: u64,
    next_dynamic: u64,
}

impl Records {
    fn head_of(&self, owner: PropertyOwner) -> Result<Option<PropRecordId>> {
        match owner {
            PropertyOwner::Node(id) => self
                .nodes
                .get(&id.0)
                .map(|r| r.next_prop)
                .ok_or_else(|| invalid(EntityKind::Node, id.0)),
            PropertyOwner::Relationship(id) => self
                .relationships
                .get(&id.0)
                .map(|r| r.next_prop)
                .ok_or_else(|| invalid(EntityKind::Relationship, id.0)),
            PropertyOwner::Graph => Ok(self.graph.next_prop),
        }
    }

    fn set_head(&mut self, owner: PropertyOwner, head: Option<PropRecordId>) {
        match owner {
            PropertyOwner::Node(id) => {
                if let Some(record) = self.nodes.get_mut(&id.0) {
                    record.next_prop = head;
                }
            }
            PropertyOwner::Relationship(id) => {
                if let Some(record) = self.relationships.get_mut(&id.0) {
                    record.next_prop = head;
                }
            }
            PropertyOwner::Graph => self.graph.next_prop = head,
        }
    }

    fn take_blocks(&mut self, head: Option<PropRecordId>) -> Result<Vec<PropertyBlock>> {
        let mut blocks = Vec::new();
        let mut next = head;
        while let Some(id) = next {
            let record = self
                .props
                .remove(&id.0)
                .ok_or(StorageError::Corruption("property chain points at free record"))?;
            blocks.extend(record.blocks);
            next = record.next;
        }
        Ok(blocks)
    }

    fn write_chain(&mut self, blocks: Vec<PropertyBlock>, per_record: usize) -> Option<PropRecordId> {
        let per_record = per_record.max(1);
        let chunks: Vec<Vec<PropertyBlock>> =
            blocks.chunks(per_record).map(|c| c.to_vec()).collect();
        let ids: Vec<PropRecordId> = chunks
            .iter()
            .map(|_| {
                self.next_prop_record += 1;
                PropRecordId(self.next_prop_record)
            })
            .collect();
        for (idx, chunk) in chunks.into_iter().enumerate() {
            let record = PropertyRecord {
                id: ids[idx],
                blocks: chunk,
                next: ids.get(idx + 1).copied(),
            };
            self.props.insert(ids[idx].0, record);
        }
        ids.first().copied()
    }
}

fn invalid(kind: EntityKind, id: u64) -> crate::types::KernelError {
    StorageError::InvalidRecord { kind, id }.into()
}

/// In-memory record store implementing both the read adapter and the persistence seam.
pub struct MemRecordStore {
    opts: RecordStoreOptions,
    records: RwLock<Records>,
    next_node: AtomicU64,
    next_relationship: AtomicU64,
}

impl MemRecordStore {
    pub fn new(opts: RecordStoreOptions) -> Self {
        Self {
            opts,
            records: RwLock::new(Records::default()),
            next_node: AtomicU64::new(0),
            next_relationship: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> RecordStoreOptions {
        self.opts
    }

    /// Stores `record` verbatim, bypassing label encoding. Used to stage damaged records.
    pub fn put_node_record(&self, record: NodeRecord) {
        let mut records = self.records.write();
        let id = record.id.0;
        records.nodes.insert(id, record);
        self.next_node.fetch_max(id + 1, Ordering::SeqCst);
    }

    /// Stores a raw dynamic label record and returns its id.
    pub fn put_dynamic_label_record(&self, bytes: Vec<u8>) -> DynRecordId {
        let mut records = self.records.write();
        records.next_dynamic += 1;
        let id = records.next_dynamic;
        records.dynamic_labels.insert(id, bytes);
        DynRecordId(id)
    }

    pub fn node_count(&self) -> usize {
        self.records.read().nodes.len()
    }

    fn update_property<F>(&self, owner: PropertyOwner, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<PropertyBlock>),
    {
        let mut records = self.records.write();
        let head = records.head_of(owner)?;
        let mut blocks = records.take_blocks(head)?;
        edit(&mut blocks);
        let new_head = records.write_chain(blocks, self.opts.blocks_per_record);
        records.set_head(owner, new_head);
        Ok(())
    }

    fn upsert(&self, owner: PropertyOwner, key: PropId, value: &PropValueOwned) -> Result<()> {
        let block = PropertyBlock::encode(&Property {
            key,
            value: value.clone(),
        });
        self.update_property(owner, |blocks| {
            match blocks.iter_mut().find(|b| b.key == key) {
                Some(existing) => *existing = block,
                None => blocks.push(block),
            }
        })?;
        trace!(?owner, key = key.0, "records.property.write");
        Ok(())
    }
}

impl Default for MemRecordStore {
    fn default() -> Self {
        Self::new(RecordStoreOptions::default())
    }
}

impl RecordStore for MemRecordStore {
    fn node_record(&self, id: NodeId) -> Result<NodeRecord> {
        self.records
            .read()
            .nodes
            .get(&id.0)
            .cloned()
            .ok_or_else(|| invalid(EntityKind::Node, id.0))
    }

    fn relationship_record(&self, id: RelId) -> Result<RelationshipRecord> {
        self.records
            .read()
            .relationships
            .get(&id.0)
            .cloned()
            .ok_or_else(|| invalid(EntityKind::Relationship, id.0))
    }

    fn graph_record(&self) -> Result<GraphRecord> {
        Ok(self.records.read().graph.clone())
    }

    fn dynamic_label_record(&self, id: DynRecordId) -> Result<Vec<u8>> {
        self.records
            .read()
            .dynamic_labels
            .get(&id.0)
            .cloned()
            .ok_or_else(|| StorageError::Corruption("dynamic label record not in use").into())
    }

    fn property_record_chain(
        &self,
        start: Option<PropRecordId>,
    ) -> Result<Option<Vec<PropertyRecord>>> {
        let Some(head) = start else {
            return Ok(None);
        };
        let records = self.records.read();
        let mut chain = Vec::new();
        let mut next = Some(head);
        while let Some(id) = next {
            if chain.len() > records.props.len() {
                return Err(StorageError::Corruption("property chain contains a cycle").into());
            }
            let record = records
                .props
                .get(&id.0)
                .ok_or(StorageError::Corruption("property chain points at free record"))?;
            next = record.next;
            chain.push(record.clone());
        }
        Ok(Some(chain))
    }
}

impl PersistenceManager for MemRecordStore {
    fn reserve_node_id(&self) -> NodeId {
        NodeId(self.next_node.fetch_add(1, Ordering::SeqCst))
    }

    fn reserve_relationship_id(&self) -> RelId {
        RelId(self.next_relationship.fetch_add(1, Ordering::SeqCst))
    }

    fn node_create(&self, id: NodeId) -> Result<()> {
        let mut records = self.records.write();
        records.nodes.insert(
            id.0,
            NodeRecord {
                id,
                labels: LabelField::default(),
                next_prop: None,
            },
        );
        self.next_node.fetch_max(id.0 + 1, Ordering::SeqCst);
        Ok(())
    }

    fn node_delete(&self, id: NodeId) -> Result<()> {
        let mut records = self.records.write();
        let record = records
            .nodes
            .remove(&id.0)
            .ok_or_else(|| invalid(EntityKind::Node, id.0))?;
        records.take_blocks(record.next_prop)?;
        if let LabelField::Dynamic(dyn_id) = record.labels {
            records.dynamic_labels.remove(&dyn_id.0);
        }
        Ok(())
    }

    fn node_set_labels(&self, id: NodeId, labels: &[LabelId]) -> Result<()> {
        let encoded = encode_labels(labels)?;
        let mut records = self.records.write();
        let previous = records
            .nodes
            .get(&id.0)
            .map(|r| r.labels.clone())
            .ok_or_else(|| invalid(EntityKind::Node, id.0))?;
        if let LabelField::Dynamic(dyn_id) = previous {
            records.dynamic_labels.remove(&dyn_id.0);
        }
        let field = if labels.len() > self.opts.inline_label_limit {
            records.next_dynamic += 1;
            let dyn_id = records.next_dynamic;
            records.dynamic_labels.insert(dyn_id, encoded);
            LabelField::Dynamic(DynRecordId(dyn_id))
        } else {
            LabelField::Inline(encoded)
        };
        if let Some(record) = records.nodes.get_mut(&id.0) {
            record.labels = field;
        }
        Ok(())
    }

    fn relationship_create(
        &self,
        id: RelId,
        ty: TypeId,
        start: NodeId,
        end: NodeId,
    ) -> Result<()> {
        let mut records = self.records.write();
        for node in [start, end] {
            if !records.nodes.contains_key(&node.0) {
                return Err(invalid(EntityKind::Node, node.0));
            }
        }
        records.relationships.insert(
            id.0,
            RelationshipRecord {
                id,
                ty,
                start,
                end,
                next_prop: None,
            },
        );
        self.next_relationship.fetch_max(id.0 + 1, Ordering::SeqCst);
        Ok(())
    }

    fn relationship_delete(&self, id: RelId) -> Result<()> {
        let mut records = self.records.write();
        let record = records
            .relationships
            .remove(&id.0)
            .ok_or_else(|| invalid(EntityKind::Relationship, id.0))?;
        records.take_blocks(record.next_prop)?;
        Ok(())
    }

    fn add_property(&self, owner: PropertyOwner, key: PropId, value: &PropValueOwned) -> Result<()> {
        self.upsert(owner, key, value)
    }

    fn change_property(
        &self,
        owner: PropertyOwner,
        key: PropId,
        value: &PropValueOwned,
    ) -> Result<()> {
        self.upsert(owner, key, value)
    }

    fn remove_property(&self, owner: PropertyOwner, key: PropId) -> Result<()> {
        self.update_property(owner, |blocks| blocks.retain(|b| b.key != key))
    }
}
