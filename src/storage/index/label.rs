use std::collections::BTreeSet;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::types::{LabelId, NodeId, Result};

use super::types::{NodeIdStream, SnapshotPostingStream};

/// Read side of the label scan store.
pub trait LabelScanReader: Send + Sync {
    /// Nodes currently carrying `label`, in ascending id order.
    fn nodes_with_label(&self, label: LabelId) -> Result<NodeIdStream>;
}

/// Label -> node membership kept up to date by commit application.
#[derive(Default)]
pub struct LabelScanStore {
    postings: RwLock<FxHashMap<LabelId, BTreeSet<NodeId>>>,
}

impl LabelScanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, label: LabelId, node: NodeId) {
        self.postings.write().entry(label).or_default().insert(node);
        trace!(label = label.0, node = node.0, "label_scan.insert");
    }

    pub fn remove(&self, label: LabelId, node: NodeId) {
        let mut postings = self.postings.write();
        if let Some(nodes) = postings.get_mut(&label) {
            nodes.remove(&node);
            if nodes.is_empty() {
                postings.remove(&label);
            }
        }
        trace!(label = label.0, node = node.0, "label_scan.remove");
    }

    /// Applies the difference between a node's old and new label sets.
    pub fn update_node(&self, node: NodeId, before: &[LabelId], after: &[LabelId]) {
        for label in before.iter().filter(|l| !after.contains(l)) {
            self.remove(*label, node);
        }
        for label in after.iter().filter(|l| !before.contains(l)) {
            self.insert(*label, node);
        }
    }

    /// Snapshot of the nodes carrying `label`.
    pub fn nodes(&self, label: LabelId) -> Vec<NodeId> {
        self.postings
            .read()
            .get(&label)
            .map(|nodes| nodes.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl LabelScanReader for LabelScanStore {
    fn nodes_with_label(&self, label: LabelId) -> Result<NodeIdStream> {
        Ok(SnapshotPostingStream::boxed(self.nodes(label)))
    }
}
