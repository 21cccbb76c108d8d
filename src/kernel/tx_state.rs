//! Pending changes of one transaction, applied to the store at commit.

use std::collections::{BTreeMap, BTreeSet};

use crate::storage::{IndexDescriptor, PropValueOwned, UniquenessConstraint};
use crate::types::{LabelId, NodeId, PropId, RelId, TypeId};

/// Pending property writes of one entity: `Some` sets, `None` removes.
pub(crate) type PropertyDiff = BTreeMap<PropId, Option<PropValueOwned>>;

#[derive(Debug, Default, Clone)]
pub(crate) struct NodeDiff {
    pub labels_added: BTreeSet<LabelId>,
    pub labels_removed: BTreeSet<LabelId>,
    pub props: PropertyDiff,
}

impl NodeDiff {
    pub fn is_empty(&self) -> bool {
        self.labels_added.is_empty() && self.labels_removed.is_empty() && self.props.is_empty()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct CreatedRelationship {
    pub ty: TypeId,
    pub start: NodeId,
    pub end: NodeId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum SchemaChange {
    IndexCreate(IndexDescriptor),
    IndexDrop(IndexDescriptor),
    ConstraintCreate(UniquenessConstraint),
    ConstraintDrop(UniquenessConstraint),
}

#[derive(Debug, Default)]
pub(crate) struct TxChangeSet {
    pub created_nodes: BTreeSet<NodeId>,
    pub deleted_nodes: BTreeSet<NodeId>,
    pub nodes: BTreeMap<NodeId, NodeDiff>,
    pub created_relationships: BTreeMap<RelId, CreatedRelationship>,
    pub deleted_relationships: BTreeSet<RelId>,
    pub relationship_props: BTreeMap<RelId, PropertyDiff>,
    pub graph_props: PropertyDiff,
    pub schema: Vec<SchemaChange>,
}

impl TxChangeSet {
    pub fn is_empty(&self) -> bool {
        self.created_nodes.is_empty()
            && self.deleted_nodes.is_empty()
            && self.nodes.values().all(NodeDiff::is_empty)
            && self.created_relationships.is_empty()
            && self.deleted_relationships.is_empty()
            && self.relationship_props.values().all(BTreeMap::is_empty)
            && self.graph_props.is_empty()
            && self.schema.is_empty()
    }

    pub fn has_schema_changes(&self) -> bool {
        !self.schema.is_empty()
    }

    pub fn node_diff(&mut self, node: NodeId) -> &mut NodeDiff {
        self.nodes.entry(node).or_default()
    }

    pub fn add_label(&mut self, node: NodeId, label: LabelId) {
        let diff = self.node_diff(node);
        diff.labels_removed.remove(&label);
        diff.labels_added.insert(label);
    }

    pub fn remove_label(&mut self, node: NodeId, label: LabelId) {
        let diff = self.node_diff(node);
        diff.labels_added.remove(&label);
        diff.labels_removed.insert(label);
    }

    /// Label set after this transaction, given the committed set.
    pub fn effective_labels(&self, node: NodeId, committed: &[LabelId]) -> BTreeSet<LabelId> {
        let mut labels: BTreeSet<LabelId> = committed.iter().copied().collect();
        if let Some(diff) = self.nodes.get(&node) {
            labels.retain(|l| !diff.labels_removed.contains(l));
            labels.extend(diff.labels_added.iter().copied());
        }
        labels
    }

    pub fn pending_schema(&self, change: &SchemaChange) -> bool {
        self.schema.contains(change)
    }

    /// Removes `change` if it is pending, returning whether it was.
    pub fn cancel_schema(&mut self, change: &SchemaChange) -> bool {
        match self.schema.iter().position(|c| c == change) {
            Some(pos) => {
                self.schema.remove(pos);
                true
            }
            None => false,
        }
    }
}
