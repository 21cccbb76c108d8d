//! Capability-scoped statement handles.
//!
//! [`ReadStatement`] reads committed state through the store-backed operations.
//! [`DataStatement`] additionally records entity writes in the transaction's change set
//! and [`SchemaStatement`] records schema writes; both dereference to a read statement.

use std::ops::Deref;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::storage::{IndexDescriptor, Property, SchemaRule, UniquenessConstraint};
use crate::types::{
    EntityKind, KernelError, LabelId, NodeId, PropId, RelId, Result, StorageError, TypeId,
};

use super::store_ops::{EntityWriteOperations, StoreReads};
use super::transaction::KernelTransaction;
use super::tx_state::{CreatedRelationship, PropertyDiff, SchemaChange, TxChangeSet};

/// Read access to committed state within one open transaction.
///
/// Released when dropped. Entity writes are not reachable from it:
///
/// ```compile_fail
/// use sombra_kernel::kernel::{AccessMode, EntityWriteOperations, Kernel, KernelOptions};
///
/// let kernel = Kernel::in_memory(KernelOptions::default())?;
/// let tx = kernel.begin_transaction(AccessMode::ReadOnly);
/// let read = tx.acquire_read_statement()?;
/// read.node_create()?;
/// # Ok::<(), sombra_kernel::KernelError>(())
/// ```
pub struct ReadStatement<'tx> {
    tx: &'tx KernelTransaction,
    kind: &'static str,
}

impl<'tx> ReadStatement<'tx> {
    pub(crate) fn new(tx: &'tx KernelTransaction, kind: &'static str) -> Self {
        trace!(tx = tx.id(), kind, "statement.acquire");
        Self { tx, kind }
    }

    pub fn transaction(&self) -> &'tx KernelTransaction {
        self.tx
    }

    /// Releases the statement. Equivalent to dropping it.
    pub fn release(self) {}

    /// Memoizes `producer(key)` in the kernel's schema state cache until the next
    /// schema-changing commit.
    pub fn schema_state_get_or_create<V, F>(&self, key: &str, producer: F) -> Result<Arc<V>>
    where
        V: std::any::Any + Send + Sync,
        F: FnOnce(&str) -> Result<V>,
    {
        self.tx
            .kernel()
            .schema_state
            .get_or_create(&key.to_owned(), |k: &String| producer(k))
    }

    pub fn node_get_property(&self, node: NodeId, key: PropId) -> Result<Option<Property>> {
        Ok(self.node_get_all_properties(node)?.find(|p| p.key == key))
    }

    pub fn relationship_get_property(&self, rel: RelId, key: PropId) -> Result<Option<Property>> {
        Ok(self.relationship_get_all_properties(rel)?.find(|p| p.key == key))
    }

    pub fn graph_get_property(&self, key: PropId) -> Result<Option<Property>> {
        Ok(self.graph_get_all_properties()?.find(|p| p.key == key))
    }

    pub fn node_get_property_keys(&self, node: NodeId) -> Result<Vec<PropId>> {
        Ok(self.node_get_all_properties(node)?.map(|p| p.key).collect())
    }

    pub fn relationship_get_property_keys(&self, rel: RelId) -> Result<Vec<PropId>> {
        Ok(self
            .relationship_get_all_properties(rel)?
            .map(|p| p.key)
            .collect())
    }

    pub fn graph_get_property_keys(&self) -> Result<Vec<PropId>> {
        Ok(self.graph_get_all_properties()?.map(|p| p.key).collect())
    }
}

impl Deref for ReadStatement<'_> {
    type Target = StoreReads;

    fn deref(&self) -> &Self::Target {
        self.tx.kernel().store_ops.reads()
    }
}

impl Drop for ReadStatement<'_> {
    fn drop(&mut self) {
        trace!(tx = self.tx.id(), kind = self.kind, "statement.release");
    }
}

/// Read plus entity writes. Writes are recorded in the transaction and applied at commit;
/// reads keep answering from committed state.
pub struct DataStatement<'tx> {
    read: ReadStatement<'tx>,
}

impl<'tx> DataStatement<'tx> {
    pub(crate) fn new(tx: &'tx KernelTransaction) -> Self {
        Self {
            read: ReadStatement::new(tx, "data"),
        }
    }

    pub fn release(self) {}

    fn tx(&self) -> &'tx KernelTransaction {
        self.read.tx
    }

    fn ensure_node(&self, node: NodeId) -> Result<bool> {
        {
            let changes = self.tx().changes().lock();
            if changes.deleted_nodes.contains(&node) {
                return Err(entity_not_found(EntityKind::Node, node.0));
            }
            if changes.created_nodes.contains(&node) {
                return Ok(true);
            }
        }
        self.tx()
            .kernel()
            .records
            .node_record(node)
            .map(|_| false)
            .map_err(|err| missing_as(err, EntityKind::Node, node.0))
    }

    fn ensure_relationship(&self, rel: RelId) -> Result<bool> {
        {
            let changes = self.tx().changes().lock();
            if changes.deleted_relationships.contains(&rel) {
                return Err(entity_not_found(EntityKind::Relationship, rel.0));
            }
            if changes.created_relationships.contains_key(&rel) {
                return Ok(true);
            }
        }
        self.tx()
            .kernel()
            .records
            .relationship_record(rel)
            .map(|_| false)
            .map_err(|err| missing_as(err, EntityKind::Relationship, rel.0))
    }

    fn committed_labels(&self, node: NodeId, created: bool) -> Vec<LabelId> {
        if created {
            Vec::new()
        } else {
            self.node_get_labels(node).to_vec()
        }
    }

    /// Applies `value` to the pending diff selected by `select`, returning the previous
    /// effective property. `committed` supplies the committed value on first touch.
    fn write_property<S, C>(
        &self,
        key: PropId,
        value: Option<Property>,
        committed: C,
        select: S,
    ) -> Result<Option<Property>>
    where
        C: FnOnce() -> Result<Option<Property>>,
        S: Fn(&mut TxChangeSet) -> &mut PropertyDiff,
    {
        let pending = {
            let mut changes = self.tx().changes().lock();
            select(&mut *changes).get(&key).cloned()
        };
        let previous = match pending {
            Some(pending) => pending.map(|value| Property { key, value }),
            None => committed()?,
        };
        let mut changes = self.tx().changes().lock();
        let diff = select(&mut *changes);
        match value {
            Some(property) => {
                diff.insert(key, Some(property.value));
            }
            None if previous.is_some() => {
                diff.insert(key, None);
            }
            None => {}
        }
        Ok(previous)
    }
}

impl<'tx> Deref for DataStatement<'tx> {
    type Target = ReadStatement<'tx>;

    fn deref(&self) -> &Self::Target {
        &self.read
    }
}

fn entity_not_found(kind: EntityKind, id: u64) -> KernelError {
    KernelError::EntityNotFound { kind, id }
}

fn missing_as(err: KernelError, kind: EntityKind, id: u64) -> KernelError {
    match err {
        KernelError::Storage(StorageError::InvalidRecord { .. }) => entity_not_found(kind, id),
        other => other,
    }
}

impl EntityWriteOperations for DataStatement<'_> {
    fn node_create(&self) -> Result<NodeId> {
        let node = self.tx().kernel().persistence.reserve_node_id();
        self.tx().changes().lock().created_nodes.insert(node);
        trace!(tx = self.tx().id(), node = node.0, "statement.node_create");
        Ok(node)
    }

    fn node_delete(&self, node: NodeId) -> Result<()> {
        self.ensure_node(node)?;
        let mut changes = self.tx().changes().lock();
        changes.deleted_nodes.insert(node);
        changes.nodes.remove(&node);
        Ok(())
    }

    fn relationship_create(&self, ty: TypeId, start: NodeId, end: NodeId) -> Result<RelId> {
        self.relationship_type_get_name(ty)?;
        self.ensure_node(start)?;
        self.ensure_node(end)?;
        let rel = self.tx().kernel().persistence.reserve_relationship_id();
        self.tx()
            .changes()
            .lock()
            .created_relationships
            .insert(rel, CreatedRelationship { ty, start, end });
        Ok(rel)
    }

    fn relationship_delete(&self, rel: RelId) -> Result<()> {
        self.ensure_relationship(rel)?;
        let mut changes = self.tx().changes().lock();
        changes.deleted_relationships.insert(rel);
        changes.relationship_props.remove(&rel);
        Ok(())
    }

    fn node_add_label(&self, node: NodeId, label: LabelId) -> Result<bool> {
        self.label_get_name(label)?;
        let created = self.ensure_node(node)?;
        let committed = self.committed_labels(node, created);
        let mut changes = self.tx().changes().lock();
        if changes.effective_labels(node, &committed).contains(&label) {
            return Ok(false);
        }
        changes.add_label(node, label);
        Ok(true)
    }

    fn node_remove_label(&self, node: NodeId, label: LabelId) -> Result<bool> {
        let created = self.ensure_node(node)?;
        let committed = self.committed_labels(node, created);
        let mut changes = self.tx().changes().lock();
        if !changes.effective_labels(node, &committed).contains(&label) {
            return Ok(false);
        }
        changes.remove_label(node, label);
        Ok(true)
    }

    fn node_set_property(&self, node: NodeId, property: Property) -> Result<Option<Property>> {
        self.property_key_get_name(property.key)?;
        let created = self.ensure_node(node)?;
        let key = property.key;
        self.write_property(
            key,
            Some(property),
            || {
                if created {
                    Ok(None)
                } else {
                    self.read.node_get_property(node, key)
                }
            },
            |changes| &mut changes.node_diff(node).props,
        )
    }

    fn relationship_set_property(
        &self,
        rel: RelId,
        property: Property,
    ) -> Result<Option<Property>> {
        self.property_key_get_name(property.key)?;
        let created = self.ensure_relationship(rel)?;
        let key = property.key;
        self.write_property(
            key,
            Some(property),
            || {
                if created {
                    Ok(None)
                } else {
                    self.read.relationship_get_property(rel, key)
                }
            },
            |changes| changes.relationship_props.entry(rel).or_default(),
        )
    }

    fn graph_set_property(&self, property: Property) -> Result<Option<Property>> {
        self.property_key_get_name(property.key)?;
        let key = property.key;
        self.write_property(
            key,
            Some(property),
            || self.read.graph_get_property(key),
            |changes| &mut changes.graph_props,
        )
    }

    fn node_remove_property(&self, node: NodeId, key: PropId) -> Result<Option<Property>> {
        let created = self.ensure_node(node)?;
        self.write_property(
            key,
            None,
            || {
                if created {
                    Ok(None)
                } else {
                    self.read.node_get_property(node, key)
                }
            },
            |changes| &mut changes.node_diff(node).props,
        )
    }

    fn relationship_remove_property(&self, rel: RelId, key: PropId) -> Result<Option<Property>> {
        let created = self.ensure_relationship(rel)?;
        self.write_property(
            key,
            None,
            || {
                if created {
                    Ok(None)
                } else {
                    self.read.relationship_get_property(rel, key)
                }
            },
            |changes| changes.relationship_props.entry(rel).or_default(),
        )
    }

    fn graph_remove_property(&self, key: PropId) -> Result<Option<Property>> {
        self.write_property(
            key,
            None,
            || self.read.graph_get_property(key),
            |changes| &mut changes.graph_props,
        )
    }
}

/// Read plus schema writes, applied at commit.
pub struct SchemaStatement<'tx> {
    read: ReadStatement<'tx>,
}

impl<'tx> SchemaStatement<'tx> {
    pub(crate) fn new(tx: &'tx KernelTransaction) -> Self {
        Self {
            read: ReadStatement::new(tx, "schema"),
        }
    }

    pub fn release(self) {}

    fn committed_rule(&self, label: LabelId, prop: PropId) -> Result<Option<SchemaRule>> {
        match self.tx().kernel().schema.index_rule(label, prop) {
            Ok(rule) => Ok(Some(rule)),
            Err(KernelError::SchemaRuleNotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn tx(&self) -> &'tx KernelTransaction {
        self.read.tx
    }

    /// Records creation of an index on `(label, prop)`.
    pub fn index_create(&self, label: LabelId, prop: PropId) -> Result<IndexDescriptor> {
        let descriptor = IndexDescriptor::new(label, prop);
        let constraint = UniquenessConstraint::new(label, prop);
        let committed = self.committed_rule(label, prop)?;
        let mut changes = self.tx().changes().lock();
        if changes.cancel_schema(&SchemaChange::IndexDrop(descriptor)) {
            return Ok(descriptor);
        }
        if changes.pending_schema(&SchemaChange::IndexCreate(descriptor)) {
            return Err(KernelError::AlreadyIndexed { label, prop });
        }
        if changes.pending_schema(&SchemaChange::ConstraintCreate(constraint)) {
            return Err(KernelError::AlreadyConstrained { label, prop });
        }
        match committed {
            Some(SchemaRule::ConstraintIndex { .. }) => {
                Err(KernelError::AlreadyConstrained { label, prop })
            }
            Some(_) => Err(KernelError::AlreadyIndexed { label, prop }),
            None => {
                changes.schema.push(SchemaChange::IndexCreate(descriptor));
                debug!(tx = self.tx().id(), %descriptor, "statement.index_create");
                Ok(descriptor)
            }
        }
    }

    /// Records removal of the index named by `descriptor`.
    pub fn index_drop(&self, descriptor: IndexDescriptor) -> Result<()> {
        let committed = self.committed_rule(descriptor.label, descriptor.prop)?;
        let mut changes = self.tx().changes().lock();
        if changes.cancel_schema(&SchemaChange::IndexCreate(descriptor)) {
            return Ok(());
        }
        if changes.pending_schema(&SchemaChange::IndexDrop(descriptor)) {
            return Err(KernelError::IndexNotFound(descriptor));
        }
        match committed {
            Some(SchemaRule::Index { .. }) => {
                changes.schema.push(SchemaChange::IndexDrop(descriptor));
                debug!(tx = self.tx().id(), %descriptor, "statement.index_drop");
                Ok(())
            }
            _ => Err(KernelError::IndexNotFound(descriptor)),
        }
    }

    /// Records creation of a uniqueness constraint. Commit builds the backing index and
    /// fails with `ConstraintCreationFailed` when existing data violates the constraint.
    pub fn uniqueness_constraint_create(
        &self,
        label: LabelId,
        prop: PropId,
    ) -> Result<UniquenessConstraint> {
        let constraint = UniquenessConstraint::new(label, prop);
        let descriptor = IndexDescriptor::new(label, prop);
        let committed = self.committed_rule(label, prop)?;
        let mut changes = self.tx().changes().lock();
        if changes.cancel_schema(&SchemaChange::ConstraintDrop(constraint)) {
            return Ok(constraint);
        }
        if changes.pending_schema(&SchemaChange::ConstraintCreate(constraint)) {
            return Err(KernelError::AlreadyConstrained { label, prop });
        }
        if changes.pending_schema(&SchemaChange::IndexCreate(descriptor)) {
            return Err(KernelError::AlreadyIndexed { label, prop });
        }
        match committed {
            Some(SchemaRule::ConstraintIndex { .. }) => {
                Err(KernelError::AlreadyConstrained { label, prop })
            }
            Some(_) => Err(KernelError::AlreadyIndexed { label, prop }),
            None => {
                changes.schema.push(SchemaChange::ConstraintCreate(constraint));
                debug!(tx = self.tx().id(), %constraint, "statement.constraint_create");
                Ok(constraint)
            }
        }
    }

    pub fn constraint_drop(&self, constraint: UniquenessConstraint) -> Result<()> {
        let committed = match self
            .tx()
            .kernel()
            .schema
            .uniqueness_constraint_rule(constraint.label, constraint.prop)
        {
            Ok(_) => true,
            Err(KernelError::SchemaRuleNotFound { .. }) => false,
            Err(err) => return Err(err),
        };
        let mut changes = self.tx().changes().lock();
        if changes.cancel_schema(&SchemaChange::ConstraintCreate(constraint)) {
            return Ok(());
        }
        if !committed || changes.pending_schema(&SchemaChange::ConstraintDrop(constraint)) {
            return Err(KernelError::ConstraintNotFound {
                label: constraint.label,
                prop: constraint.prop,
            });
        }
        changes.schema.push(SchemaChange::ConstraintDrop(constraint));
        debug!(tx = self.tx().id(), %constraint, "statement.constraint_drop");
        Ok(())
    }
}

impl<'tx> Deref for SchemaStatement<'tx> {
    type Target = ReadStatement<'tx>;

    fn deref(&self) -> &Self::Target {
        &self.read
    }
}
