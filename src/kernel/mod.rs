//! Statement and transaction layer.
//!
//! A [`Kernel`] owns the shared collaborators (token registries, record store, schema
//! storage, indexing service, label scan store, schema state cache). Callers begin a
//! [`KernelTransaction`], acquire typed statements from it and commit or roll back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::storage::index::{
    IndexingService, LabelScanStore, SchemaEpoch, SchemaStateCache, StorePopulationSource,
};
use crate::storage::{
    MemRecordStore, MemSchemaStore, PersistenceManager, RecordStore, SchemaStorage, SchemaStore,
};
use crate::types::Result;

mod commit;
mod legacy;
mod options;
mod statement;
mod store_ops;
mod transaction;
mod tx_state;

pub use legacy::{LegacyContext, LegacyTxManager, ResumeResult, TransitionalTransaction};
pub use options::{ConfigError, KernelOptions};
pub use statement::{DataStatement, ReadStatement, SchemaStatement};
pub use store_ops::{
    AuxiliaryStore, AuxiliaryStoreOperations, EntityWriteOperations, PropertyIter,
    StoreReads, StoreStatementOperations, TokenRegistries,
};
pub use transaction::{AccessMode, KernelTransaction, TxState};

/// Collaborators a kernel runs on top of.
#[derive(Clone)]
pub struct KernelStores {
    pub tokens: TokenRegistries,
    pub records: Arc<dyn RecordStore>,
    pub persistence: Arc<dyn PersistenceManager>,
    pub schema: Arc<dyn SchemaStore>,
    pub label_scan: Arc<LabelScanStore>,
}

impl KernelStores {
    /// Fresh in-memory collaborators shaped by `opts`.
    pub fn in_memory(opts: &KernelOptions) -> Self {
        let records = Arc::new(MemRecordStore::new(opts.record_store_options()));
        Self {
            tokens: TokenRegistries::new(
                opts.label_capacity,
                opts.property_key_capacity,
                opts.relationship_type_capacity,
            ),
            records: records.clone(),
            persistence: records,
            schema: Arc::new(MemSchemaStore::new()),
            label_scan: Arc::new(LabelScanStore::new()),
        }
    }
}

pub(crate) struct KernelInner {
    pub(crate) options: KernelOptions,
    pub(crate) store_ops: StoreStatementOperations,
    pub(crate) auxiliary: AuxiliaryStore,
    pub(crate) records: Arc<dyn RecordStore>,
    pub(crate) persistence: Arc<dyn PersistenceManager>,
    pub(crate) schema: SchemaStorage,
    pub(crate) indexing: Arc<IndexingService>,
    pub(crate) label_scan: Arc<LabelScanStore>,
    pub(crate) schema_state: SchemaStateCache<String>,
    pub(crate) commit_lock: Mutex<()>,
    next_tx: AtomicU64,
}

/// Entry point: shared state plus transaction factory.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    /// Opens a kernel over `stores`, creating and populating index proxies for every
    /// index rule already present in the schema store.
    pub fn open(options: KernelOptions, stores: KernelStores) -> Result<Self> {
        let options = options.validate()?;
        let schema = SchemaStorage::new(Arc::clone(&stores.schema));
        let source = StorePopulationSource::new(
            Arc::clone(&stores.records),
            Arc::clone(&stores.label_scan),
        );
        let indexing = Arc::new(IndexingService::new(
            Arc::new(source),
            options.populate_in_background,
        ));
        let store_ops = StoreStatementOperations::new(
            stores.tokens.clone(),
            Arc::clone(&stores.records),
            schema.clone(),
            Arc::clone(&indexing),
            stores.label_scan.clone(),
        );
        let rules = stores.schema.load_all_schema_rules()?;
        indexing.start(&rules)?;
        info!(
            rules = rules.len(),
            background_population = options.populate_in_background,
            "kernel.open"
        );
        Ok(Self {
            inner: Arc::new(KernelInner {
                options,
                store_ops,
                auxiliary: AuxiliaryStore::new(Arc::clone(&stores.persistence)),
                records: stores.records,
                persistence: stores.persistence,
                schema,
                indexing,
                label_scan: stores.label_scan,
                schema_state: SchemaStateCache::new(Arc::new(SchemaEpoch::default())),
                commit_lock: Mutex::new(()),
                next_tx: AtomicU64::new(1),
            }),
        })
    }

    /// Opens a kernel over fresh in-memory collaborators.
    pub fn in_memory(options: KernelOptions) -> Result<Self> {
        let options = options.validate()?;
        let stores = KernelStores::in_memory(&options);
        Self::open(options, stores)
    }

    pub fn begin_transaction(&self, mode: AccessMode) -> KernelTransaction {
        let id = self.inner.next_tx.fetch_add(1, Ordering::Relaxed);
        KernelTransaction::new(id, Arc::clone(&self.inner), mode)
    }

    pub fn options(&self) -> &KernelOptions {
        &self.inner.options
    }

    pub fn schema_state(&self) -> &SchemaStateCache<String> {
        &self.inner.schema_state
    }

    /// The store-backed layer statements read through.
    pub fn store_operations(&self) -> &StoreStatementOperations {
        &self.inner.store_ops
    }

    pub fn indexing(&self) -> &Arc<IndexingService> {
        &self.inner.indexing
    }

    pub fn label_scan_store(&self) -> &Arc<LabelScanStore> {
        &self.inner.label_scan
    }
}
