//! Store-backed statement operations.
//!
//! Answers every read a statement needs from the committed store: token registries,
//! record store, schema storage, the indexing service and the label scan store. Direct
//! writes are refused with a typed [`Rejection`]; committed changes reach the store only
//! through [`AuxiliaryStoreOperations`] and the persistence collaborator.

use std::ops::Deref;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::storage::index::{
    IndexProxy, IndexState, IndexingService, LabelScanReader, NodeIdStream,
};
use crate::storage::{
    parse_labels_field, read_properties, IndexDescriptor, LabelSet, PersistenceManager,
    PropValueOwned, Property, PropertyOwner, RecordStore, SchemaRule, SchemaStorage, Token,
    TokenRegistry, UniquenessConstraint,
};
use crate::types::{
    EntityKind, KernelError, LabelId, NodeId, PropId, Rejection, RelId, Result, RuleId,
    StorageError, TokenKind, TypeId,
};

/// Sequence of decoded properties of one entity.
pub type PropertyIter = std::vec::IntoIter<Property>;

/// Entity writes. Only a data statement accepts them; the store-backed layer refuses them.
pub trait EntityWriteOperations {
    fn node_create(&self) -> Result<NodeId>;
    fn node_delete(&self, node: NodeId) -> Result<()>;
    fn relationship_create(&self, ty: TypeId, start: NodeId, end: NodeId) -> Result<RelId>;
    fn relationship_delete(&self, rel: RelId) -> Result<()>;
    /// Returns `true` when the label was not already present.
    fn node_add_label(&self, node: NodeId, label: LabelId) -> Result<bool>;
    /// Returns `true` when the label was present.
    fn node_remove_label(&self, node: NodeId, label: LabelId) -> Result<bool>;
    /// Returns the previous value of the property, if any.
    fn node_set_property(&self, node: NodeId, property: Property) -> Result<Option<Property>>;
    fn relationship_set_property(&self, rel: RelId, property: Property)
        -> Result<Option<Property>>;
    fn graph_set_property(&self, property: Property) -> Result<Option<Property>>;
    fn node_remove_property(&self, node: NodeId, key: PropId) -> Result<Option<Property>>;
    fn relationship_remove_property(&self, rel: RelId, key: PropId) -> Result<Option<Property>>;
    fn graph_remove_property(&self, key: PropId) -> Result<Option<Property>>;
}

/// Side channel used by commit application to write committed property changes.
pub trait AuxiliaryStoreOperations {
    fn node_add_store_property(&self, node: NodeId, property: &Property) -> Result<()>;
    fn relationship_add_store_property(&self, rel: RelId, property: &Property) -> Result<()>;
    fn graph_add_store_property(&self, property: &Property) -> Result<()>;
    fn node_change_store_property(
        &self,
        node: NodeId,
        previous: &Property,
        property: &Property,
    ) -> Result<()>;
    fn relationship_change_store_property(
        &self,
        rel: RelId,
        previous: &Property,
        property: &Property,
    ) -> Result<()>;
    fn graph_change_store_property(&self, previous: &Property, property: &Property) -> Result<()>;
    fn node_remove_store_property(&self, node: NodeId, property: &Property) -> Result<()>;
    fn relationship_remove_store_property(&self, rel: RelId, property: &Property) -> Result<()>;
    fn graph_remove_store_property(&self, property: &Property) -> Result<()>;
}

/// The three token namespaces.
#[derive(Clone)]
pub struct TokenRegistries {
    pub labels: Arc<TokenRegistry>,
    pub property_keys: Arc<TokenRegistry>,
    pub relationship_types: Arc<TokenRegistry>,
}

impl TokenRegistries {
    pub fn new(label_capacity: u32, property_key_capacity: u32, type_capacity: u32) -> Self {
        Self {
            labels: Arc::new(TokenRegistry::new(TokenKind::Label, label_capacity)),
            property_keys: Arc::new(TokenRegistry::new(
                TokenKind::PropertyKey,
                property_key_capacity,
            )),
            relationship_types: Arc::new(TokenRegistry::new(
                TokenKind::RelationshipType,
                type_capacity,
            )),
        }
    }
}

/// Read operations over committed state.
///
/// Carries no write entry points at all; the refusals live on
/// [`StoreStatementOperations`], which dereferences to this.
pub struct StoreReads {
    tokens: TokenRegistries,
    records: Arc<dyn RecordStore>,
    schema: SchemaStorage,
    indexing: Arc<IndexingService>,
    label_scan: Arc<dyn LabelScanReader>,
}

impl StoreReads {
    // Tokens.

    /// Fails with `TooManyLabels` when the label id space is exhausted.
    pub fn label_get_or_create_for_name(&self, name: &str) -> Result<LabelId> {
        match self.tokens.labels.get_or_create_id(name) {
            Ok(id) => Ok(LabelId(id)),
            Err(KernelError::Storage(
                cause @ StorageError::IdCapacityExceeded(TokenKind::Label),
            )) => Err(KernelError::TooManyLabels(cause)),
            Err(err) => Err(err),
        }
    }

    pub fn label_get_for_name(&self, name: &str) -> Option<LabelId> {
        self.tokens.labels.id_for_name(name).map(LabelId)
    }

    pub fn label_get_name(&self, label: LabelId) -> Result<String> {
        Ok(self.tokens.labels.token(label.0)?.name)
    }

    pub fn labels_get_all_tokens(&self) -> std::vec::IntoIter<Token> {
        self.tokens.labels.all_tokens().into_iter()
    }

    pub fn property_key_get_or_create_for_name(&self, name: &str) -> Result<PropId> {
        self.tokens.property_keys.get_or_create_id(name).map(PropId)
    }

    pub fn property_key_get_for_name(&self, name: &str) -> Option<PropId> {
        self.tokens.property_keys.id_for_name(name).map(PropId)
    }

    pub fn property_key_get_name(&self, key: PropId) -> Result<String> {
        Ok(self.tokens.property_keys.token(key.0)?.name)
    }

    pub fn property_keys_get_all_tokens(&self) -> std::vec::IntoIter<Token> {
        self.tokens.property_keys.all_tokens().into_iter()
    }

    pub fn relationship_type_get_or_create_for_name(&self, name: &str) -> Result<TypeId> {
        self.tokens
            .relationship_types
            .get_or_create_id(name)
            .map(TypeId)
    }

    pub fn relationship_type_get_for_name(&self, name: &str) -> Option<TypeId> {
        self.tokens.relationship_types.id_for_name(name).map(TypeId)
    }

    pub fn relationship_type_get_name(&self, ty: TypeId) -> Result<String> {
        Ok(self.tokens.relationship_types.token(ty.0)?.name)
    }

    pub fn relationship_types_get_all_tokens(&self) -> std::vec::IntoIter<Token> {
        self.tokens.relationship_types.all_tokens().into_iter()
    }

    // Labels.

    /// Labels of `node`, parsed from its inline or dynamic label field.
    ///
    /// An unknown node or an unreadable label field yields no labels instead of an error.
    pub fn node_get_labels(&self, node: NodeId) -> LabelSet {
        let parsed = self
            .records
            .node_record(node)
            .and_then(|record| parse_labels_field(&record.labels, self.records.as_ref()));
        match parsed {
            Ok(labels) => labels,
            Err(KernelError::Storage(StorageError::InvalidRecord { .. })) => {
                debug!(node = node.0, "store.labels.missing_node");
                LabelSet::new()
            }
            Err(err) => {
                warn!(node = node.0, error = %err, "store.labels.unreadable");
                LabelSet::new()
            }
        }
    }

    pub fn node_has_label(&self, node: NodeId, label: LabelId) -> bool {
        self.node_get_labels(node).contains(&label)
    }

    /// Nodes carrying `label`, served by the label scan store.
    pub fn nodes_get_for_label(&self, label: LabelId) -> Result<NodeIdStream> {
        self.label_scan.nodes_with_label(label)
    }

    // Indexes.

    /// Fails with `SchemaRuleNotFound` when no index covers `(label, prop)`.
    pub fn index_get_for_label_and_property_key(
        &self,
        label: LabelId,
        prop: PropId,
    ) -> Result<IndexDescriptor> {
        Ok(self.schema.index_rule(label, prop)?.descriptor())
    }

    pub fn indexes_get_for_label(
        &self,
        label: LabelId,
    ) -> Result<impl Iterator<Item = IndexDescriptor>> {
        self.descriptors(move |rule| {
            matches!(rule, SchemaRule::Index { .. }) && rule.label() == label
        })
    }

    pub fn indexes_get_all(&self) -> Result<impl Iterator<Item = IndexDescriptor>> {
        self.descriptors(|rule| matches!(rule, SchemaRule::Index { .. }))
    }

    pub fn unique_indexes_get_for_label(
        &self,
        label: LabelId,
    ) -> Result<impl Iterator<Item = IndexDescriptor>> {
        self.descriptors(move |rule| {
            matches!(rule, SchemaRule::ConstraintIndex { .. }) && rule.label() == label
        })
    }

    pub fn unique_indexes_get_all(&self) -> Result<impl Iterator<Item = IndexDescriptor>> {
        self.descriptors(|rule| matches!(rule, SchemaRule::ConstraintIndex { .. }))
    }

    fn descriptors<F>(&self, filter: F) -> Result<impl Iterator<Item = IndexDescriptor>>
    where
        F: Fn(&SchemaRule) -> bool,
    {
        Ok(self.schema.schema_rules(filter)?.map(|rule| rule.descriptor()))
    }

    /// Committed rule id of the index named by `descriptor`.
    pub fn index_get_committed_id(&self, descriptor: IndexDescriptor) -> Result<RuleId> {
        Ok(self.schema.index_rule(descriptor.label, descriptor.prop)?.id())
    }

    /// Id of the uniqueness constraint a constraint index backs; `None` for plain indexes.
    pub fn index_get_owning_uniqueness_constraint_id(
        &self,
        descriptor: IndexDescriptor,
    ) -> Result<Option<RuleId>> {
        match self.schema.index_rule(descriptor.label, descriptor.prop)? {
            SchemaRule::ConstraintIndex {
                owning_constraint, ..
            } => Ok(owning_constraint),
            _ => Ok(None),
        }
    }

    pub fn index_get_state(&self, descriptor: IndexDescriptor) -> Result<IndexState> {
        Ok(self.index_proxy(descriptor)?.state())
    }

    /// Rendered population failure; `None` unless the index is `FAILED`.
    pub fn index_get_failure(&self, descriptor: IndexDescriptor) -> Result<Option<String>> {
        Ok(self
            .index_proxy(descriptor)?
            .population_failure()
            .map(|failure| failure.as_text().to_owned()))
    }

    /// Blocks until the index leaves `POPULATING`.
    pub fn index_await_online(&self, descriptor: IndexDescriptor) -> Result<()> {
        let rule = self.index_id(descriptor)?;
        self.indexing
            .await_online(rule)
            .map_err(|err| proxy_missing(err, descriptor))
    }

    pub fn nodes_get_from_index_lookup(
        &self,
        descriptor: IndexDescriptor,
        value: &PropValueOwned,
    ) -> Result<NodeIdStream> {
        let rule = self.index_id(descriptor)?;
        self.indexing
            .reader(rule)
            .map_err(|err| proxy_missing(err, descriptor))?
            .lookup(value)
    }

    fn index_proxy(&self, descriptor: IndexDescriptor) -> Result<Arc<IndexProxy>> {
        let rule = self.index_id(descriptor)?;
        self.indexing
            .proxy_for_rule(rule)
            .map_err(|err| proxy_missing(err, descriptor))
    }

    fn index_id(&self, descriptor: IndexDescriptor) -> Result<RuleId> {
        match self.schema.index_rule(descriptor.label, descriptor.prop) {
            Ok(rule) => Ok(rule.id()),
            Err(KernelError::SchemaRuleNotFound { .. }) => {
                Err(KernelError::IndexNotFound(descriptor))
            }
            Err(err) => Err(err),
        }
    }

    // Constraints.

    pub fn constraints_get_for_label_and_property_key(
        &self,
        label: LabelId,
        prop: PropId,
    ) -> Result<impl Iterator<Item = UniquenessConstraint>> {
        Ok(self
            .constraints(move |c| c.label == label)?
            .filter(move |c| c.contains_property_key(prop)))
    }

    pub fn constraints_get_for_label(
        &self,
        label: LabelId,
    ) -> Result<impl Iterator<Item = UniquenessConstraint>> {
        self.constraints(move |c| c.label == label)
    }

    pub fn constraints_get_all(&self) -> Result<impl Iterator<Item = UniquenessConstraint>> {
        self.constraints(|_| true)
    }

    fn constraints<F>(&self, filter: F) -> Result<impl Iterator<Item = UniquenessConstraint>>
    where
        F: Fn(&UniquenessConstraint) -> bool,
    {
        let rules = self
            .schema
            .schema_rules(|rule| matches!(rule, SchemaRule::UniquenessConstraint { .. }))?;
        Ok(rules
            .map(|rule| UniquenessConstraint::new(rule.label(), rule.prop()))
            .filter(move |c| filter(c)))
    }

    // Properties.

    pub fn node_get_all_properties(&self, node: NodeId) -> Result<PropertyIter> {
        let record = self
            .records
            .node_record(node)
            .map_err(|err| not_found(err, EntityKind::Node, node.0))?;
        self.load_properties(record.next_prop, EntityKind::Node, node.0)
    }

    pub fn relationship_get_all_properties(&self, rel: RelId) -> Result<PropertyIter> {
        let record = self
            .records
            .relationship_record(rel)
            .map_err(|err| not_found(err, EntityKind::Relationship, rel.0))?;
        self.load_properties(record.next_prop, EntityKind::Relationship, rel.0)
    }

    pub fn graph_get_all_properties(&self) -> Result<PropertyIter> {
        let record = self.records.graph_record()?;
        Ok(read_properties(self.records.as_ref(), record.next_prop)?.into_iter())
    }

    fn load_properties(
        &self,
        head: Option<crate::types::PropRecordId>,
        kind: EntityKind,
        id: u64,
    ) -> Result<PropertyIter> {
        read_properties(self.records.as_ref(), head)
            .map(Vec::into_iter)
            .map_err(|err| not_found(err, kind, id))
    }
}

/// The store-backed statement layer: committed reads through [`StoreReads`], and a typed
/// refusal for every write or overlay-dependent read.
pub struct StoreStatementOperations {
    reads: StoreReads,
}

impl StoreStatementOperations {
    pub fn new(
        tokens: TokenRegistries,
        records: Arc<dyn RecordStore>,
        schema: SchemaStorage,
        indexing: Arc<IndexingService>,
        label_scan: Arc<dyn LabelScanReader>,
    ) -> Self {
        Self {
            reads: StoreReads {
                tokens,
                records,
                schema,
                indexing,
                label_scan,
            },
        }
    }

    pub fn reads(&self) -> &StoreReads {
        &self.reads
    }

    // Answered above this layer.

    pub fn node_get_property(&self, _node: NodeId, _key: PropId) -> Result<Option<Property>> {
        Err(KernelError::unsupported("node_get_property", Rejection::NotReachable))
    }

    pub fn relationship_get_property(&self, _rel: RelId, _key: PropId) -> Result<Option<Property>> {
        Err(KernelError::unsupported(
            "relationship_get_property",
            Rejection::NotReachable,
        ))
    }

    pub fn graph_get_property(&self, _key: PropId) -> Result<Option<Property>> {
        Err(KernelError::unsupported("graph_get_property", Rejection::NotReachable))
    }

    pub fn node_get_property_keys(&self, _node: NodeId) -> Result<Vec<PropId>> {
        Err(KernelError::unsupported(
            "node_get_property_keys",
            Rejection::NotReachable,
        ))
    }

    pub fn relationship_get_property_keys(&self, _rel: RelId) -> Result<Vec<PropId>> {
        Err(KernelError::unsupported(
            "relationship_get_property_keys",
            Rejection::NotReachable,
        ))
    }

    pub fn graph_get_property_keys(&self) -> Result<Vec<PropId>> {
        Err(KernelError::unsupported(
            "graph_get_property_keys",
            Rejection::NotReachable,
        ))
    }

    /// Record-level deletes; the store only changes through commit application.
    pub fn node_delete_record(&self, _node: NodeId) -> Result<()> {
        Err(KernelError::unsupported("node_delete_record", Rejection::UseTransaction))
    }

    pub fn relationship_delete_record(&self, _rel: RelId) -> Result<()> {
        Err(KernelError::unsupported(
            "relationship_delete_record",
            Rejection::UseTransaction,
        ))
    }
}

impl Deref for StoreStatementOperations {
    type Target = StoreReads;

    fn deref(&self) -> &StoreReads {
        &self.reads
    }
}

/// A missing record or an unreadable record chain reads as a missing entity.
fn not_found(err: KernelError, kind: EntityKind, id: u64) -> KernelError {
    match err {
        KernelError::Storage(StorageError::InvalidRecord { .. }) => {
            KernelError::EntityNotFound { kind, id }
        }
        KernelError::Storage(StorageError::Corruption(reason)) => {
            warn!(?kind, id, reason, "store.properties.unreadable");
            KernelError::EntityNotFound { kind, id }
        }
        other => other,
    }
}

/// A rule whose proxy is gone names an index that no longer exists.
fn proxy_missing(err: KernelError, descriptor: IndexDescriptor) -> KernelError {
    match err {
        KernelError::IndexProxyNotFound(_) => KernelError::IndexNotFound(descriptor),
        other => other,
    }
}

impl EntityWriteOperations for StoreStatementOperations {
    fn node_create(&self) -> Result<NodeId> {
        Err(KernelError::unsupported("node_create", Rejection::UseTransaction))
    }

    fn node_delete(&self, _node: NodeId) -> Result<()> {
        Err(KernelError::unsupported("node_delete", Rejection::UseAuxiliary))
    }

    fn relationship_create(&self, _ty: TypeId, _start: NodeId, _end: NodeId) -> Result<RelId> {
        Err(KernelError::unsupported(
            "relationship_create",
            Rejection::UseTransaction,
        ))
    }

    fn relationship_delete(&self, _rel: RelId) -> Result<()> {
        Err(KernelError::unsupported(
            "relationship_delete",
            Rejection::UseAuxiliary,
        ))
    }

    fn node_add_label(&self, _node: NodeId, _label: LabelId) -> Result<bool> {
        Err(KernelError::unsupported("node_add_label", Rejection::UseTransaction))
    }

    fn node_remove_label(&self, _node: NodeId, _label: LabelId) -> Result<bool> {
        Err(KernelError::unsupported(
            "node_remove_label",
            Rejection::UseTransaction,
        ))
    }

    fn node_set_property(&self, _node: NodeId, _property: Property) -> Result<Option<Property>> {
        Err(KernelError::unsupported("node_set_property", Rejection::UseAuxiliary))
    }

    fn relationship_set_property(
        &self,
        _rel: RelId,
        _property: Property,
    ) -> Result<Option<Property>> {
        Err(KernelError::unsupported(
            "relationship_set_property",
            Rejection::UseAuxiliary,
        ))
    }

    fn graph_set_property(&self, _property: Property) -> Result<Option<Property>> {
        Err(KernelError::unsupported("graph_set_property", Rejection::UseAuxiliary))
    }

    fn node_remove_property(&self, _node: NodeId, _key: PropId) -> Result<Option<Property>> {
        Err(KernelError::unsupported(
            "node_remove_property",
            Rejection::UseAuxiliary,
        ))
    }

    fn relationship_remove_property(
        &self,
        _rel: RelId,
        _key: PropId,
    ) -> Result<Option<Property>> {
        Err(KernelError::unsupported(
            "relationship_remove_property",
            Rejection::UseAuxiliary,
        ))
    }

    fn graph_remove_property(&self, _key: PropId) -> Result<Option<Property>> {
        Err(KernelError::unsupported(
            "graph_remove_property",
            Rejection::UseAuxiliary,
        ))
    }
}

/// The auxiliary channel, backed by the persistence collaborator.
pub struct AuxiliaryStore {
    persistence: Arc<dyn PersistenceManager>,
}

impl AuxiliaryStore {
    pub fn new(persistence: Arc<dyn PersistenceManager>) -> Self {
        Self { persistence }
    }
}

impl AuxiliaryStoreOperations for AuxiliaryStore {
    fn node_add_store_property(&self, node: NodeId, property: &Property) -> Result<()> {
        self.persistence
            .add_property(PropertyOwner::Node(node), property.key, &property.value)
    }

    fn relationship_add_store_property(&self, rel: RelId, property: &Property) -> Result<()> {
        self.persistence
            .add_property(PropertyOwner::Relationship(rel), property.key, &property.value)
    }

    fn graph_add_store_property(&self, property: &Property) -> Result<()> {
        self.persistence
            .add_property(PropertyOwner::Graph, property.key, &property.value)
    }

    fn node_change_store_property(
        &self,
        node: NodeId,
        _previous: &Property,
        property: &Property,
    ) -> Result<()> {
        self.persistence
            .change_property(PropertyOwner::Node(node), property.key, &property.value)
    }

    fn relationship_change_store_property(
        &self,
        rel: RelId,
        _previous: &Property,
        property: &Property,
    ) -> Result<()> {
        self.persistence.change_property(
            PropertyOwner::Relationship(rel),
            property.key,
            &property.value,
        )
    }

    fn graph_change_store_property(&self, _previous: &Property, property: &Property) -> Result<()> {
        self.persistence
            .change_property(PropertyOwner::Graph, property.key, &property.value)
    }

    fn node_remove_store_property(&self, node: NodeId, property: &Property) -> Result<()> {
        self.persistence
            .remove_property(PropertyOwner::Node(node), property.key)
    }

    fn relationship_remove_store_property(&self, rel: RelId, property: &Property) -> Result<()> {
        self.persistence
            .remove_property(PropertyOwner::Relationship(rel), property.key)
    }

    fn graph_remove_store_property(&self, property: &Property) -> Result<()> {
        self.persistence
            .remove_property(PropertyOwner::Graph, property.key)
    }
}
