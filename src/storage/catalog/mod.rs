#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::types::{KernelError, Result, StorageError, TokenKind};

/// A resolved `(id, name)` pair from one token namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Token {
    pub id: u32,
    pub name: String,
}

impl Token {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

#[derive(Default)]
pub struct TokenMetrics {
    intern_calls: AtomicU64,
    intern_hits: AtomicU64,
    intern_misses: AtomicU64,
    resolve_calls: AtomicU64,
    resolve_misses: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TokenMetricsSnapshot {
    pub intern_calls: u64,
    pub intern_hits: u64,
    pub intern_misses: u64,
    pub resolve_calls: u64,
    pub resolve_misses: u64,
}

impl TokenMetricsSnapshot {
    pub fn intern_hit_rate(&self) -> f64 {
        if self.intern_calls == 0 {
            return 0.0;
        }
        self.intern_hits as f64 / self.intern_calls as f64
    }
}

impl TokenMetrics {
    pub fn snapshot(&self) -> TokenMetricsSnapshot {
        TokenMetricsSnapshot {
            intern_calls: self.intern_calls.load(Ordering::Relaxed),
            intern_hits: self.intern_hits.load(Ordering::Relaxed),
            intern_misses: self.intern_misses.load(Ordering::Relaxed),
            resolve_calls: self.resolve_calls.load(Ordering::Relaxed),
            resolve_misses: self.resolve_misses.load(Ordering::Relaxed),
        }
    }

    fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct TokenTable {
    by_name: FxHashMap<String, u32>,
    by_id: Vec<String>,
}

/// Append-only, process-wide name <-> id mapping for one token namespace.
///
/// Ids are dense and assigned in creation order starting at zero. Lookups take the
/// read lock; creation re-checks under the write lock so concurrent callers asking for
/// the same name always observe the same id.
pub struct TokenRegistry {
    kind: TokenKind,
    capacity: u32,
    table: RwLock<TokenTable>,
    metrics: Arc<TokenMetrics>,
}

impl TokenRegistry {
    pub fn new(kind: TokenKind, capacity: u32) -> Self {
        Self {
            kind,
            capacity,
            table: RwLock::new(TokenTable::default()),
            metrics: Arc::new(TokenMetrics::default()),
        }
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn metrics(&self) -> Arc<TokenMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn metrics_snapshot(&self) -> TokenMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Looks up the identifier for `name` without creating it.
    pub fn id_for_name(&self, name: &str) -> Option<u32> {
        self.table.read().by_name.get(name).copied()
    }

    /// Returns the id registered for `name`, registering it first when absent.
    ///
    /// Fails with [`StorageError::IdCapacityExceeded`] once the namespace is exhausted.
    pub fn get_or_create_id(&self, name: &str) -> Result<u32> {
        self.metrics.inc(&self.metrics.intern_calls);
        if let Some(id) = self.id_for_name(name) {
            self.metrics.inc(&self.metrics.intern_hits);
            trace!(kind = %self.kind, id, "token.intern.hit");
            return Ok(id);
        }
        let mut table = self.table.write();
        if let Some(id) = table.by_name.get(name).copied() {
            self.metrics.inc(&self.metrics.intern_hits);
            trace!(kind = %self.kind, id, "token.intern.race");
            return Ok(id);
        }
        let next = table.by_id.len() as u64;
        if next >= u64::from(self.capacity) {
            return Err(StorageError::IdCapacityExceeded(self.kind).into());
        }
        let id = next as u32;
        table.by_id.push(name.to_owned());
        table.by_name.insert(name.to_owned(), id);
        self.metrics.inc(&self.metrics.intern_misses);
        trace!(kind = %self.kind, id, len = name.len(), "token.intern.insert");
        Ok(id)
    }

    /// Resolves `id` back to its token, failing when the id was never assigned.
    pub fn token(&self, id: u32) -> Result<Token> {
        self.metrics.inc(&self.metrics.resolve_calls);
        let table = self.table.read();
        match table.by_id.get(id as usize) {
            Some(name) => Ok(Token::new(id, name.clone())),
            None => {
                self.metrics.inc(&self.metrics.resolve_misses);
                trace!(kind = %self.kind, id, "token.resolve.miss");
                Err(KernelError::TokenNotFound {
                    kind: self.kind,
                    id,
                })
            }
        }
    }

    /// Snapshot of every registered token in id order.
    pub fn all_tokens(&self) -> Vec<Token> {
        let table = self.table.read();
        table
            .by_id
            .iter()
            .enumerate()
            .map(|(id, name)| Token::new(id as u32, name.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
