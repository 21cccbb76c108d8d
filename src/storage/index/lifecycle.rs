//! Index lifecycle: one [`IndexProxy`] per committed index rule, populated in the
//! background and observed through `POPULATING -> ONLINE | FAILED`.
//!
//! Updates committed while a proxy is populating are queued on the proxy and replayed
//! under the same lock that flips it to `ONLINE`, so a reader handed out for an online
//! index always sees every committed change.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, trace};

use crate::storage::props::value_key;
use crate::storage::record::{read_properties, RecordStore};
use crate::storage::schema::{IndexDescriptor, SchemaRule};
use crate::storage::types::{PropValueOwned, Property};
use crate::types::{EntityKind, KernelError, LabelId, NodeId, Result, RuleId, StorageError};

use super::label::LabelScanStore;
use super::types::{NodeIdStream, SnapshotPostingStream};

/// Point-in-time lifecycle state of an index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IndexState {
    Populating,
    Online,
    Failed,
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IndexState::Populating => "POPULATING",
            IndexState::Online => "ONLINE",
            IndexState::Failed => "FAILED",
        })
    }
}

/// Diagnostic recorded when population fails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PopulationFailure {
    message: String,
}

impl PopulationFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn as_text(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PopulationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Committed label/property state of one node before and after a transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeChange {
    pub node: NodeId,
    pub labels_before: Vec<LabelId>,
    pub labels_after: Vec<LabelId>,
    pub props_before: Vec<Property>,
    pub props_after: Vec<Property>,
}

impl NodeChange {
    fn indexed_value(
        labels: &[LabelId],
        props: &[Property],
        descriptor: IndexDescriptor,
    ) -> Option<PropValueOwned> {
        if !labels.contains(&descriptor.label) {
            return None;
        }
        props
            .iter()
            .find(|p| p.key == descriptor.prop)
            .map(|p| p.value.clone())
    }

    /// The index entry change this node implies for `descriptor`, if any.
    pub fn update_for(&self, descriptor: IndexDescriptor) -> Option<IndexUpdate> {
        let before = Self::indexed_value(&self.labels_before, &self.props_before, descriptor);
        let after = Self::indexed_value(&self.labels_after, &self.props_after, descriptor);
        (before != after).then(|| IndexUpdate {
            node: self.node,
            before,
            after,
        })
    }
}

/// One entry change for one index.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexUpdate {
    pub node: NodeId,
    pub before: Option<PropValueOwned>,
    pub after: Option<PropValueOwned>,
}

/// Supplies the committed `(node, value)` pairs an index must contain.
pub trait PopulationSource: Send + Sync {
    fn scan(&self, descriptor: IndexDescriptor) -> Result<Vec<(NodeId, PropValueOwned)>>;
}

/// Population source reading the label scan store and the record store.
pub struct StorePopulationSource {
    records: Arc<dyn RecordStore>,
    labels: Arc<LabelScanStore>,
}

impl StorePopulationSource {
    pub fn new(records: Arc<dyn RecordStore>, labels: Arc<LabelScanStore>) -> Self {
        Self { records, labels }
    }
}

impl PopulationSource for StorePopulationSource {
    fn scan(&self, descriptor: IndexDescriptor) -> Result<Vec<(NodeId, PropValueOwned)>> {
        let mut entries = Vec::new();
        for node in self.labels.nodes(descriptor.label) {
            let record = match self.records.node_record(node) {
                Ok(record) => record,
                // deleted after the label snapshot was taken
                Err(KernelError::Storage(StorageError::InvalidRecord {
                    kind: EntityKind::Node,
                    ..
                })) => continue,
                Err(err) => return Err(err),
            };
            let props = read_properties(self.records.as_ref(), record.next_prop)?;
            if let Some(prop) = props.into_iter().find(|p| p.key == descriptor.prop) {
                entries.push((node, prop.value));
            }
        }
        Ok(entries)
    }
}

struct Posting {
    value: PropValueOwned,
    nodes: BTreeSet<NodeId>,
}

struct ProxyInner {
    state: IndexState,
    failure: Option<PopulationFailure>,
    postings: FxHashMap<Vec<u8>, Posting>,
    pending: Vec<IndexUpdate>,
    dropped: bool,
}

impl ProxyInner {
    fn add(&mut self, node: NodeId, value: &PropValueOwned) {
        self.postings
            .entry(value_key(value))
            .or_insert_with(|| Posting {
                value: value.clone(),
                nodes: BTreeSet::new(),
            })
            .nodes
            .insert(node);
    }

    fn remove(&mut self, node: NodeId, value: &PropValueOwned) {
        let key = value_key(value);
        if let Some(posting) = self.postings.get_mut(&key) {
            posting.nodes.remove(&node);
            if posting.nodes.is_empty() {
                self.postings.remove(&key);
            }
        }
    }

    fn apply(&mut self, update: &IndexUpdate) {
        if let Some(before) = &update.before {
            self.remove(update.node, before);
        }
        if let Some(after) = &update.after {
            self.add(update.node, after);
        }
    }

    fn first_duplicate(&self) -> Option<(&PropValueOwned, NodeId, NodeId)> {
        self.postings.values().find_map(|posting| {
            let mut nodes = posting.nodes.iter();
            match (nodes.next(), nodes.next()) {
                (Some(a), Some(b)) => Some((&posting.value, *a, *b)),
                _ => None,
            }
        })
    }
}

/// Lifecycle handle of one committed index.
pub struct IndexProxy {
    rule: RuleId,
    descriptor: IndexDescriptor,
    unique: bool,
    inner: Mutex<ProxyInner>,
    state_changed: Condvar,
}

impl IndexProxy {
    fn new(rule: RuleId, descriptor: IndexDescriptor, unique: bool) -> Self {
        Self {
            rule,
            descriptor,
            unique,
            inner: Mutex::new(ProxyInner {
                state: IndexState::Populating,
                failure: None,
                postings: FxHashMap::default(),
                pending: Vec::new(),
                dropped: false,
            }),
            state_changed: Condvar::new(),
        }
    }

    pub fn rule(&self) -> RuleId {
        self.rule
    }

    pub fn descriptor(&self) -> IndexDescriptor {
        self.descriptor
    }

    /// `true` when the index backs a uniqueness constraint.
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn state(&self) -> IndexState {
        self.inner.lock().state
    }

    pub fn population_failure(&self) -> Option<PopulationFailure> {
        self.inner.lock().failure.clone()
    }

    /// Blocks until the proxy leaves `POPULATING`. There is no timeout.
    pub fn await_population(&self) -> Result<IndexState> {
        let mut inner = self.inner.lock();
        while inner.state == IndexState::Populating && !inner.dropped {
            self.state_changed.wait(&mut inner);
        }
        if inner.dropped {
            return Err(KernelError::IndexProxyNotFound(self.rule));
        }
        Ok(inner.state)
    }

    /// Nodes other than `node` holding `value`, for uniqueness checks.
    pub fn holders_other_than(&self, node: NodeId, value: &PropValueOwned) -> Vec<NodeId> {
        let inner = self.inner.lock();
        inner
            .postings
            .get(&value_key(value))
            .map(|p| p.nodes.iter().copied().filter(|n| *n != node).collect())
            .unwrap_or_default()
    }

    fn lookup(&self, value: &PropValueOwned) -> Result<NodeIdStream> {
        let inner = self.inner.lock();
        if inner.state != IndexState::Online {
            return Err(KernelError::IndexNotOnline {
                rule: self.rule,
                state: inner.state,
            });
        }
        let nodes = inner
            .postings
            .get(&value_key(value))
            .map(|p| p.nodes.iter().copied().collect())
            .unwrap_or_default();
        Ok(SnapshotPostingStream::boxed(nodes))
    }

    fn apply_update(&self, update: &IndexUpdate) {
        let mut inner = self.inner.lock();
        match inner.state {
            IndexState::Populating => inner.pending.push(update.clone()),
            IndexState::Online => inner.apply(update),
            IndexState::Failed => {}
        }
    }

    fn populate(&self, source: &dyn PopulationSource) {
        debug!(rule = self.rule.0, descriptor = %self.descriptor, "index.population.start");
        let scanned = source.scan(self.descriptor);
        let mut inner = self.inner.lock();
        if inner.dropped {
            return;
        }
        let outcome = scanned.and_then(|entries| {
            for (node, value) in &entries {
                inner.add(*node, value);
            }
            let pending = std::mem::take(&mut inner.pending);
            for update in &pending {
                inner.apply(update);
            }
            if self.unique {
                if let Some((value, a, b)) = inner.first_duplicate() {
                    return Err(KernelError::TransactionFailure(format!(
                        "both node {a} and node {b} share the property value {value}"
                    )));
                }
            }
            Ok(entries.len())
        });
        match outcome {
            Ok(entries) => {
                inner.state = IndexState::Online;
                info!(rule = self.rule.0, entries, "index.population.online");
            }
            Err(err) => {
                let message = match err {
                    KernelError::TransactionFailure(message) => message,
                    other => other.to_string(),
                };
                error!(rule = self.rule.0, failure = %message, "index.population.failed");
                inner.postings.clear();
                inner.pending.clear();
                inner.state = IndexState::Failed;
                inner.failure = Some(PopulationFailure::new(message));
            }
        }
        self.state_changed.notify_all();
    }

    fn mark_dropped(&self) {
        let mut inner = self.inner.lock();
        inner.dropped = true;
        inner.postings.clear();
        inner.pending.clear();
        self.state_changed.notify_all();
    }
}

/// Point lookups against an online index.
pub trait IndexReader: Send + Sync {
    fn lookup(&self, value: &PropValueOwned) -> Result<NodeIdStream>;
}

struct ProxyReader {
    proxy: Arc<IndexProxy>,
}

impl IndexReader for ProxyReader {
    fn lookup(&self, value: &PropValueOwned) -> Result<NodeIdStream> {
        self.proxy.lookup(value)
    }
}

/// Owns every index proxy and drives their population.
pub struct IndexingService {
    proxies: RwLock<FxHashMap<RuleId, Arc<IndexProxy>>>,
    source: Arc<dyn PopulationSource>,
    background: bool,
    populators: Mutex<Vec<JoinHandle<()>>>,
}

impl IndexingService {
    pub fn new(source: Arc<dyn PopulationSource>, background: bool) -> Self {
        Self {
            proxies: RwLock::new(FxHashMap::default()),
            source,
            background,
            populators: Mutex::new(Vec::new()),
        }
    }

    /// Creates and populates proxies for every index rule among `rules`.
    pub fn start(&self, rules: &[SchemaRule]) -> Result<()> {
        for rule in rules.iter().filter(|r| r.is_index()) {
            self.create_index(rule)?;
        }
        debug!(proxies = self.proxies.read().len(), "index.service.started");
        Ok(())
    }

    /// Registers a proxy for `rule` in `POPULATING` and starts its population.
    pub fn create_index(&self, rule: &SchemaRule) -> Result<Arc<IndexProxy>> {
        let unique = matches!(rule, SchemaRule::ConstraintIndex { .. });
        let proxy = Arc::new(IndexProxy::new(rule.id(), rule.descriptor(), unique));
        self.proxies.write().insert(rule.id(), Arc::clone(&proxy));
        if self.background {
            let worker = Arc::clone(&proxy);
            let source = Arc::clone(&self.source);
            let spawned = thread::Builder::new()
                .name(format!("index-populator-{}", rule.id()))
                .spawn(move || worker.populate(source.as_ref()));
            match spawned {
                Ok(handle) => {
                    let mut populators = self.populators.lock();
                    populators.retain(|h| !h.is_finished());
                    populators.push(handle);
                }
                Err(err) => {
                    error!(rule = rule.id().0, error = %err, "index.population.spawn_failed");
                    proxy.populate(self.source.as_ref());
                }
            }
        } else {
            proxy.populate(self.source.as_ref());
        }
        Ok(proxy)
    }

    pub fn drop_index(&self, rule: RuleId) -> Result<()> {
        let proxy = self
            .proxies
            .write()
            .remove(&rule)
            .ok_or(KernelError::IndexProxyNotFound(rule))?;
        proxy.mark_dropped();
        debug!(rule = rule.0, "index.dropped");
        Ok(())
    }

    pub fn proxy_for_rule(&self, rule: RuleId) -> Result<Arc<IndexProxy>> {
        self.proxies
            .read()
            .get(&rule)
            .cloned()
            .ok_or(KernelError::IndexProxyNotFound(rule))
    }

    /// Reader for an online index; any other state fails with `IndexNotOnline`.
    pub fn reader(&self, rule: RuleId) -> Result<Box<dyn IndexReader>> {
        let proxy = self.proxy_for_rule(rule)?;
        let state = proxy.state();
        if state != IndexState::Online {
            return Err(KernelError::IndexNotOnline { rule, state });
        }
        Ok(Box::new(ProxyReader { proxy }))
    }

    /// Blocks until the index for `rule` is online; a failed population surfaces its
    /// diagnostic.
    pub fn await_online(&self, rule: RuleId) -> Result<()> {
        let proxy = self.proxy_for_rule(rule)?;
        match proxy.await_population()? {
            IndexState::Online => Ok(()),
            _ => Err(KernelError::IndexPopulationFailed {
                descriptor: proxy.descriptor(),
                failure: proxy
                    .population_failure()
                    .map(|f| f.as_text().to_owned())
                    .unwrap_or_default(),
            }),
        }
    }

    /// Proxies covering `label`.
    pub fn proxies_for_label(&self, label: LabelId) -> Vec<Arc<IndexProxy>> {
        self.proxies
            .read()
            .values()
            .filter(|p| p.descriptor().label == label)
            .cloned()
            .collect()
    }

    /// Feeds committed node changes to every affected index.
    pub fn apply_updates(&self, changes: &[NodeChange]) {
        let proxies: Vec<Arc<IndexProxy>> = self.proxies.read().values().cloned().collect();
        for proxy in proxies {
            for change in changes {
                if let Some(update) = change.update_for(proxy.descriptor()) {
                    trace!(rule = proxy.rule().0, node = change.node.0, "index.update");
                    proxy.apply_update(&update);
                }
            }
        }
    }

    /// Waits for every background population started so far.
    pub fn join_populators(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.populators.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!("index.population.panicked");
            }
        }
    }
}

impl Drop for IndexingService {
    fn drop(&mut self) {
        self.join_populators();
    }
}
