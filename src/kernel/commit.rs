//! Commit application.
//!
//! Runs under the kernel commit lock. Schema transactions write schema rules and drive
//! the indexing service, then invalidate the schema state cache before returning. Data
//! transactions write records through the persistence collaborator and the auxiliary
//! store channel, then feed the label scan store and the indexes.

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::FxHashMap;
use tracing::{debug, error, info, trace};

use crate::storage::index::{IndexState, NodeChange};
use crate::storage::{value_key, IndexDescriptor, Property, SchemaRule, UniquenessConstraint};
use crate::types::{KernelError, NodeId, Result, RuleId};

use super::store_ops::AuxiliaryStoreOperations;
use super::tx_state::{PropertyDiff, SchemaChange, TxChangeSet};
use super::KernelInner;

/// What a successful commit changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct CommitSummary {
    pub nodes: usize,
    pub relationships: usize,
    pub schema_rules: usize,
}

impl KernelInner {
    pub(crate) fn apply_commit(&self, tx: u64, changes: TxChangeSet) -> Result<CommitSummary> {
        let _commit = self.commit_lock.lock();
        if changes.has_schema_changes() {
            let applied = self.apply_schema(&changes.schema);
            let generation = self.schema_state.invalidate();
            debug!(tx, generation = generation.0, "commit.schema_state.invalidated");
            let schema_rules = applied?;
            info!(tx, schema_rules, "commit.schema");
            Ok(CommitSummary {
                schema_rules,
                ..CommitSummary::default()
            })
        } else {
            let summary = self.apply_data(&changes)?;
            info!(
                tx,
                nodes = summary.nodes,
                relationships = summary.relationships,
                "commit.data"
            );
            Ok(summary)
        }
    }

    fn apply_schema(&self, changes: &[SchemaChange]) -> Result<usize> {
        for change in changes {
            self.validate_schema_change(change)?;
        }

        let mut created: Vec<(RuleId, RuleId)> = Vec::new();
        for change in changes {
            if let SchemaChange::ConstraintCreate(constraint) = change {
                match self.create_constraint(*constraint) {
                    Ok(ids) => created.push(ids),
                    Err(err) => {
                        for (index, constraint) in created {
                            self.remove_constraint_rules(index, Some(constraint));
                        }
                        return Err(err);
                    }
                }
            }
        }

        for change in changes {
            match change {
                SchemaChange::ConstraintCreate(_) => {}
                SchemaChange::IndexCreate(descriptor) => {
                    let rule = SchemaRule::Index {
                        id: self.schema.store().next_rule_id(),
                        label: descriptor.label,
                        prop: descriptor.prop,
                    };
                    self.indexing.create_index(&rule)?;
                    self.publish_rule(rule)?;
                }
                SchemaChange::IndexDrop(descriptor) => {
                    let rule = self.schema.index_rule(descriptor.label, descriptor.prop)?;
                    self.schema.store().remove_rule(rule.id())?;
                    self.indexing.drop_index(rule.id())?;
                }
                SchemaChange::ConstraintDrop(constraint) => {
                    let rule = self
                        .schema
                        .uniqueness_constraint_rule(constraint.label, constraint.prop)?;
                    if let SchemaRule::UniquenessConstraint {
                        id, owned_index, ..
                    } = rule
                    {
                        self.schema.store().remove_rule(id)?;
                        self.schema.store().remove_rule(owned_index)?;
                        self.indexing.drop_index(owned_index)?;
                    }
                }
            }
        }
        Ok(changes.len())
    }

    fn validate_schema_change(&self, change: &SchemaChange) -> Result<()> {
        match change {
            SchemaChange::IndexCreate(d) => match self.schema.index_rule(d.label, d.prop) {
                Ok(rule) => Err(already_present(&rule, *d)),
                Err(KernelError::SchemaRuleNotFound { .. }) => Ok(()),
                Err(err) => Err(err),
            },
            SchemaChange::ConstraintCreate(c) => {
                match self.schema.index_rule(c.label, c.prop) {
                    Ok(rule) => Err(already_present(&rule, IndexDescriptor::new(c.label, c.prop))),
                    Err(KernelError::SchemaRuleNotFound { .. }) => Ok(()),
                    Err(err) => Err(err),
                }
            }
            SchemaChange::IndexDrop(d) => match self.schema.index_rule(d.label, d.prop) {
                Ok(SchemaRule::Index { .. }) => Ok(()),
                Ok(_) | Err(KernelError::SchemaRuleNotFound { .. }) => {
                    Err(KernelError::IndexNotFound(*d))
                }
                Err(err) => Err(err),
            },
            SchemaChange::ConstraintDrop(c) => {
                match self.schema.uniqueness_constraint_rule(c.label, c.prop) {
                    Ok(_) => Ok(()),
                    Err(KernelError::SchemaRuleNotFound { .. }) => {
                        Err(KernelError::ConstraintNotFound {
                            label: c.label,
                            prop: c.prop,
                        })
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Populates the backing index, then publishes the index and constraint rules. A
    /// failed population leaves no rule behind.
    fn create_constraint(&self, constraint: UniquenessConstraint) -> Result<(RuleId, RuleId)> {
        let store = self.schema.store();
        let index_id = store.next_rule_id();
        let constraint_id = store.next_rule_id();
        let index_rule = SchemaRule::ConstraintIndex {
            id: index_id,
            label: constraint.label,
            prop: constraint.prop,
            owning_constraint: Some(constraint_id),
        };
        self.indexing.create_index(&index_rule)?;
        if let Err(err) = self.indexing.await_online(index_id) {
            self.discard_proxy(index_id);
            let reason = match err {
                KernelError::IndexPopulationFailed { failure, .. } => failure,
                other => other.to_string(),
            };
            error!(constraint = %constraint, reason = %reason, "commit.constraint.failed");
            return Err(KernelError::ConstraintCreationFailed {
                label: constraint.label,
                prop: constraint.prop,
                reason,
            });
        }
        self.publish_rule(index_rule)?;
        let constraint_rule = SchemaRule::UniquenessConstraint {
            id: constraint_id,
            label: constraint.label,
            prop: constraint.prop,
            owned_index: index_id,
        };
        if let Err(err) = store.add_rule(constraint_rule) {
            self.remove_constraint_rules(index_id, None);
            return Err(err);
        }
        Ok((index_id, constraint_id))
    }

    /// Makes an index rule visible to readers once its proxy exists.
    fn publish_rule(&self, rule: SchemaRule) -> Result<()> {
        let id = rule.id();
        if let Err(err) = self.schema.store().add_rule(rule) {
            self.discard_proxy(id);
            return Err(err);
        }
        Ok(())
    }

    fn discard_proxy(&self, index: RuleId) {
        if let Err(err) = self.indexing.drop_index(index) {
            error!(rule = index.0, error = %err, "commit.index.cleanup_failed");
        }
    }

    /// Best-effort removal of a published constraint.
    fn remove_constraint_rules(&self, index: RuleId, constraint: Option<RuleId>) {
        let store = self.schema.store();
        for rule in constraint.into_iter().chain(std::iter::once(index)) {
            if let Err(err) = store.remove_rule(rule) {
                error!(rule = rule.0, error = %err, "commit.constraint.cleanup_failed");
            }
        }
        self.discard_proxy(index);
    }

    fn apply_data(&self, changes: &TxChangeSet) -> Result<CommitSummary> {
        let node_changes = self.node_changes(changes)?;
        self.check_uniqueness(&node_changes)?;

        let persistence = self.persistence.as_ref();
        for node in changes.created_nodes.difference(&changes.deleted_nodes) {
            persistence.node_create(*node)?;
        }
        for (rel, created) in &changes.created_relationships {
            if !changes.deleted_relationships.contains(rel) {
                persistence.relationship_create(*rel, created.ty, created.start, created.end)?;
            }
        }

        for change in &node_changes {
            if changes.deleted_nodes.contains(&change.node) {
                continue;
            }
            if change.labels_before != change.labels_after {
                persistence.node_set_labels(change.node, &change.labels_after)?;
            }
            if let Some(diff) = changes.nodes.get(&change.node) {
                let node = change.node;
                write_properties(&change.props_before, &diff.props, PropertyWrites {
                    add: &|p: &Property| self.auxiliary.node_add_store_property(node, p),
                    change: &|prev: &Property, p: &Property| self.auxiliary.node_change_store_property(node, prev, p),
                    remove: &|p: &Property| self.auxiliary.node_remove_store_property(node, p),
                })?;
            }
        }

        for (rel, diff) in &changes.relationship_props {
            if changes.deleted_relationships.contains(rel) {
                continue;
            }
            let before: Vec<Property> = if changes.created_relationships.contains_key(rel) {
                Vec::new()
            } else {
                self.store_ops.relationship_get_all_properties(*rel)?.collect()
            };
            let rel = *rel;
            write_properties(&before, diff, PropertyWrites {
                add: &|p: &Property| self.auxiliary.relationship_add_store_property(rel, p),
                change: &|prev: &Property, p: &Property| {
                    self.auxiliary.relationship_change_store_property(rel, prev, p)
                },
                remove: &|p: &Property| self.auxiliary.relationship_remove_store_property(rel, p),
            })?;
        }

        if !changes.graph_props.is_empty() {
            let before: Vec<Property> = self.store_ops.graph_get_all_properties()?.collect();
            write_properties(&before, &changes.graph_props, PropertyWrites {
                add: &|p: &Property| self.auxiliary.graph_add_store_property(p),
                change: &|prev: &Property, p: &Property| self.auxiliary.graph_change_store_property(prev, p),
                remove: &|p: &Property| self.auxiliary.graph_remove_store_property(p),
            })?;
        }

        for rel in &changes.deleted_relationships {
            if !changes.created_relationships.contains_key(rel) {
                persistence.relationship_delete(*rel)?;
            }
        }
        for node in changes.deleted_nodes.difference(&changes.created_nodes) {
            persistence.node_delete(*node)?;
        }

        for change in &node_changes {
            if change.labels_before != change.labels_after {
                self.label_scan
                    .update_node(change.node, &change.labels_before, &change.labels_after);
            }
        }
        self.indexing.apply_updates(&node_changes);

        let relationships = changes.created_relationships.len()
            + changes.deleted_relationships.len()
            + changes.relationship_props.len();
        Ok(CommitSummary {
            nodes: node_changes.len(),
            relationships,
            schema_rules: 0,
        })
    }

    /// Before/after label and property state of every node the transaction touches.
    fn node_changes(&self, changes: &TxChangeSet) -> Result<Vec<NodeChange>> {
        let touched: BTreeSet<NodeId> = changes
            .created_nodes
            .iter()
            .chain(changes.deleted_nodes.iter())
            .chain(changes.nodes.keys())
            .copied()
            .collect();
        let mut out = Vec::with_capacity(touched.len());
        for node in touched {
            let created = changes.created_nodes.contains(&node);
            let (labels_before, props_before) = if created {
                (Vec::new(), Vec::new())
            } else {
                (
                    self.store_ops.node_get_labels(node).to_vec(),
                    self.store_ops.node_get_all_properties(node)?.collect(),
                )
            };
            let (labels_after, props_after) = if changes.deleted_nodes.contains(&node) {
                (Vec::new(), Vec::new())
            } else {
                let labels = changes
                    .effective_labels(node, &labels_before)
                    .into_iter()
                    .collect();
                let props = match changes.nodes.get(&node) {
                    Some(diff) => merge_properties(&props_before, &diff.props),
                    None => props_before.clone(),
                };
                (labels, props)
            };
            out.push(NodeChange {
                node,
                labels_before,
                labels_after,
                props_before,
                props_after,
            });
        }
        Ok(out)
    }

    /// Rejects changes that would give two nodes the same value in an online unique index.
    fn check_uniqueness(&self, node_changes: &[NodeChange]) -> Result<()> {
        let touched: BTreeSet<NodeId> = node_changes.iter().map(|c| c.node).collect();
        let mut claimed: FxHashMap<(RuleId, Vec<u8>), NodeId> = FxHashMap::default();
        for change in node_changes {
            for label in &change.labels_after {
                for proxy in self.indexing.proxies_for_label(*label) {
                    if !proxy.is_unique()
                        || proxy.state() != IndexState::Online
                    {
                        continue;
                    }
                    let descriptor = proxy.descriptor();
                    let Some(prop) = change.props_after.iter().find(|p| p.key == descriptor.prop)
                    else {
                        continue;
                    };
                    let key = (proxy.rule(), value_key(&prop.value));
                    if let Some(existing) = claimed.insert(key, change.node) {
                        return Err(violation(descriptor, change.node, existing));
                    }
                    let holder = proxy
                        .holders_other_than(change.node, &prop.value)
                        .into_iter()
                        .find(|holder| !touched.contains(holder));
                    if let Some(existing) = holder {
                        return Err(violation(descriptor, change.node, existing));
                    }
                }
            }
        }
        trace!(nodes = node_changes.len(), "commit.uniqueness.checked");
        Ok(())
    }
}

fn violation(descriptor: IndexDescriptor, node: NodeId, existing: NodeId) -> KernelError {
    KernelError::UniquenessViolation {
        descriptor,
        node,
        existing,
    }
}

fn already_present(rule: &SchemaRule, descriptor: IndexDescriptor) -> KernelError {
    match rule {
        SchemaRule::ConstraintIndex { .. } => KernelError::AlreadyConstrained {
            label: descriptor.label,
            prop: descriptor.prop,
        },
        _ => KernelError::AlreadyIndexed {
            label: descriptor.label,
            prop: descriptor.prop,
        },
    }
}

fn merge_properties(before: &[Property], diff: &PropertyDiff) -> Vec<Property> {
    let mut merged: BTreeMap<_, _> = before.iter().map(|p| (p.key, p.value.clone())).collect();
    for (key, value) in diff {
        match value {
            Some(value) => {
                merged.insert(*key, value.clone());
            }
            None => {
                merged.remove(key);
            }
        }
    }
    merged
        .into_iter()
        .map(|(key, value)| Property { key, value })
        .collect()
}

struct PropertyWrites<'a> {
    add: &'a dyn Fn(&Property) -> Result<()>,
    change: &'a dyn Fn(&Property, &Property) -> Result<()>,
    remove: &'a dyn Fn(&Property) -> Result<()>,
}

/// Routes a property diff to add, change or remove against the committed properties.
fn write_properties(before: &[Property], diff: &PropertyDiff, writes: PropertyWrites<'_>) -> Result<()> {
    for (key, value) in diff {
        let previous = before.iter().find(|p| p.key == *key);
        match (previous, value) {
            (None, Some(value)) => (writes.add)(&Property {
                key: *key,
                value: value.clone(),
            })?,
            (Some(previous), Some(value)) if previous.value != *value => (writes.change)(
                previous,
                &Property {
                    key: *key,
                    value: value.clone(),
                },
            )?,
            (Some(previous), None) => (writes.remove)(previous)?,
            _ => {}
        }
    }
    Ok(())
}
