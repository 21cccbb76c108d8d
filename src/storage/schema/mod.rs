#![forbid(unsafe_code)]

//! Schema rules and the storage that answers typed queries over them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::types::{KernelError, LabelId, PropId, Result, RuleId, StorageError};

/// Logical identity of an index: the `(label, property key)` pair it covers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct IndexDescriptor {
    pub label: LabelId,
    pub prop: PropId,
}

impl IndexDescriptor {
    pub fn new(label: LabelId, prop: PropId) -> Self {
        Self { label, prop }
    }
}

impl fmt::Display for IndexDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":label[{}](property[{}])", self.label, self.prop)
    }
}

/// A uniqueness constraint on `(label, property key)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct UniquenessConstraint {
    pub label: LabelId,
    pub prop: PropId,
}

impl UniquenessConstraint {
    pub fn new(label: LabelId, prop: PropId) -> Self {
        Self { label, prop }
    }

    pub fn contains_property_key(&self, prop: PropId) -> bool {
        self.prop == prop
    }
}

impl fmt::Display for UniquenessConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unique :label[{}](property[{}])", self.label, self.prop)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SchemaRuleKind {
    Index,
    ConstraintIndex,
    UniquenessConstraint,
}

/// A persisted schema fact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchemaRule {
    /// A plain property index.
    Index {
        id: RuleId,
        label: LabelId,
        prop: PropId,
    },
    /// An index backing a uniqueness constraint.
    ConstraintIndex {
        id: RuleId,
        label: LabelId,
        prop: PropId,
        owning_constraint: Option<RuleId>,
    },
    UniquenessConstraint {
        id: RuleId,
        label: LabelId,
        prop: PropId,
        owned_index: RuleId,
    },
}

impl SchemaRule {
    pub fn id(&self) -> RuleId {
        match self {
            SchemaRule::Index { id, .. }
            | SchemaRule::ConstraintIndex { id, .. }
            | SchemaRule::UniquenessConstraint { id, .. } => *id,
        }
    }

    pub fn label(&self) -> LabelId {
        match self {
            SchemaRule::Index { label, .. }
            | SchemaRule::ConstraintIndex { label, .. }
            | SchemaRule::UniquenessConstraint { label, .. } => *label,
        }
    }

    pub fn prop(&self) -> PropId {
        match self {
            SchemaRule::Index { prop, .. }
            | SchemaRule::ConstraintIndex { prop, .. }
            | SchemaRule::UniquenessConstraint { prop, .. } => *prop,
        }
    }

    pub fn kind(&self) -> SchemaRuleKind {
        match self {
            SchemaRule::Index { .. } => SchemaRuleKind::Index,
            SchemaRule::ConstraintIndex { .. } => SchemaRuleKind::ConstraintIndex,
            SchemaRule::UniquenessConstraint { .. } => SchemaRuleKind::UniquenessConstraint,
        }
    }

    pub fn descriptor(&self) -> IndexDescriptor {
        IndexDescriptor::new(self.label(), self.prop())
    }

    /// `true` for rules that own an index proxy.
    pub fn is_index(&self) -> bool {
        matches!(
            self,
            SchemaRule::Index { .. } | SchemaRule::ConstraintIndex { .. }
        )
    }
}

/// Persistence seam for schema rules.
pub trait SchemaStore: Send + Sync {
    fn load_all_schema_rules(&self) -> Result<Vec<SchemaRule>>;
    fn next_rule_id(&self) -> RuleId;
    fn add_rule(&self, rule: SchemaRule) -> Result<()>;
    fn remove_rule(&self, id: RuleId) -> Result<()>;
}

/// In-memory [`SchemaStore`] keeping rules ordered by id.
#[derive(Default)]
pub struct MemSchemaStore {
    rules: RwLock<BTreeMap<RuleId, SchemaRule>>,
    next_id: AtomicU64,
}

impl MemSchemaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchemaStore for MemSchemaStore {
    fn load_all_schema_rules(&self) -> Result<Vec<SchemaRule>> {
        Ok(self.rules.read().values().cloned().collect())
    }

    fn next_rule_id(&self) -> RuleId {
        RuleId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn add_rule(&self, rule: SchemaRule) -> Result<()> {
        let id = rule.id();
        self.next_id.fetch_max(id.0 + 1, Ordering::SeqCst);
        let mut rules = self.rules.write();
        if rules.contains_key(&id) {
            return Err(StorageError::Corruption("schema rule id already in use").into());
        }
        rules.insert(id, rule);
        trace!(rule = id.0, "schema.rule.add");
        Ok(())
    }

    fn remove_rule(&self, id: RuleId) -> Result<()> {
        match self.rules.write().remove(&id) {
            Some(_) => {
                trace!(rule = id.0, "schema.rule.remove");
                Ok(())
            }
            None => Err(StorageError::Corruption("schema rule not in use").into()),
        }
    }
}

/// Typed queries over the committed schema rules of a [`SchemaStore`].
#[derive(Clone)]
pub struct SchemaStorage {
    store: Arc<dyn SchemaStore>,
}

impl SchemaStorage {
    pub fn new(store: Arc<dyn SchemaStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SchemaStore> {
        &self.store
    }

    /// Every committed rule accepted by `filter`, in rule id order.
    pub fn schema_rules<F>(&self, filter: F) -> Result<std::vec::IntoIter<SchemaRule>>
    where
        F: Fn(&SchemaRule) -> bool,
    {
        let mut rules = self.store.load_all_schema_rules()?;
        rules.retain(|rule| filter(rule));
        Ok(rules.into_iter())
    }

    /// The index or constraint-index rule covering `(label, prop)`.
    pub fn index_rule(&self, label: LabelId, prop: PropId) -> Result<SchemaRule> {
        self.single_rule("index rule", label, prop, SchemaRule::is_index)
    }

    pub fn uniqueness_constraint_rule(&self, label: LabelId, prop: PropId) -> Result<SchemaRule> {
        self.single_rule("uniqueness constraint rule", label, prop, |rule| {
            matches!(rule, SchemaRule::UniquenessConstraint { .. })
        })
    }

    pub fn rule(&self, id: RuleId) -> Result<Option<SchemaRule>> {
        Ok(self
            .store
            .load_all_schema_rules()?
            .into_iter()
            .find(|rule| rule.id() == id))
    }

    fn single_rule<F>(
        &self,
        what: &'static str,
        label: LabelId,
        prop: PropId,
        kind: F,
    ) -> Result<SchemaRule>
    where
        F: Fn(&SchemaRule) -> bool,
    {
        self.schema_rules(|rule| kind(rule) && rule.label() == label && rule.prop() == prop)?
            .next()
            .ok_or(KernelError::SchemaRuleNotFound { what, label, prop })
    }
}
