//! Bridge between kernel transactions and an ambient legacy transaction manager.
//!
//! The legacy side is modelled as an explicit context rather than thread-local state: a
//! [`TransitionalTransaction`] detaches the ambient transaction from a
//! [`LegacyTxManager`] with [`suspend`](TransitionalTransaction::suspend) and reattaches it
//! with [`resume`](TransitionalTransaction::resume).

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::types::{KernelError, Result};

use super::statement::{DataStatement, ReadStatement, SchemaStatement};
use super::transaction::{KernelTransaction, TxState};

/// Owner of the ambient legacy transaction.
pub trait LegacyTxManager {
    /// The manager's transaction handle.
    type Transaction;

    /// Detaches and returns the current transaction, or `None` when nothing is bound.
    fn suspend(&self) -> Result<Option<Self::Transaction>>;

    /// Rebinds a previously suspended transaction. A refused transaction is handed back
    /// with the error.
    fn resume(&self, tx: Self::Transaction) -> ResumeResult<Self::Transaction>;
}

/// Outcome of [`LegacyTxManager::resume`].
pub type ResumeResult<T> = std::result::Result<(), (KernelError, T)>;

/// A minimal [`LegacyTxManager`]: one optional bound transaction behind a mutex.
#[derive(Debug, Default)]
pub struct LegacyContext<T> {
    bound: Mutex<Option<T>>,
}

impl<T> LegacyContext<T> {
    pub fn new() -> Self {
        Self {
            bound: Mutex::new(None),
        }
    }

    /// Binds `tx` as the ambient transaction. Fails when one is already bound.
    pub fn begin(&self, tx: T) -> Result<()> {
        self.bind(tx).map_err(|(err, _)| err)
    }

    fn bind(&self, tx: T) -> ResumeResult<T> {
        let mut bound = self.bound.lock();
        if bound.is_some() {
            return Err((
                KernelError::LegacyBridge("a legacy transaction is already bound"),
                tx,
            ));
        }
        *bound = Some(tx);
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.bound.lock().is_some()
    }

    /// Unbinds and returns the ambient transaction.
    pub fn take(&self) -> Option<T> {
        self.bound.lock().take()
    }
}

impl<T: Clone> LegacyContext<T> {
    pub fn current(&self) -> Option<T> {
        self.bound.lock().clone()
    }
}

impl<T> LegacyTxManager for LegacyContext<T> {
    type Transaction = T;

    fn suspend(&self) -> Result<Option<T>> {
        Ok(self.bound.lock().take())
    }

    fn resume(&self, tx: T) -> ResumeResult<T> {
        self.bind(tx)
    }
}

/// A kernel transaction that can detach the legacy manager's ambient transaction while
/// it works and put it back afterwards.
pub struct TransitionalTransaction<M: LegacyTxManager> {
    tx: KernelTransaction,
    suspended: Suspended<M::Transaction>,
}

/// Holder of a suspended legacy transaction; reports it if dropped unresumed.
struct Suspended<T> {
    tx_id: u64,
    legacy: Option<T>,
}

impl<T> Drop for Suspended<T> {
    fn drop(&mut self) {
        if self.legacy.is_some() {
            error!(tx = self.tx_id, "legacy.dropped_suspended");
        }
    }
}

impl<M: LegacyTxManager> TransitionalTransaction<M> {
    pub fn new(tx: KernelTransaction) -> Self {
        let tx_id = tx.id();
        Self {
            tx,
            suspended: Suspended {
                tx_id,
                legacy: None,
            },
        }
    }

    pub fn transaction(&self) -> &KernelTransaction {
        &self.tx
    }

    pub fn state(&self) -> TxState {
        self.tx.state()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.legacy.is_some()
    }

    /// Detaches the ambient legacy transaction from `manager`.
    ///
    /// Fails when a transaction is already suspended here or when `manager` has none bound.
    pub fn suspend(&mut self, manager: &M) -> Result<()> {
        if self.is_suspended() {
            error!(tx = self.tx.id(), "legacy.suspend.twice");
            return Err(KernelError::LegacyBridge(
                "a legacy transaction is already suspended",
            ));
        }
        match manager.suspend()? {
            Some(legacy) => {
                self.suspended.legacy = Some(legacy);
                debug!(tx = self.tx.id(), "legacy.suspended");
                Ok(())
            }
            None => {
                error!(tx = self.tx.id(), "legacy.suspend.unbound");
                Err(KernelError::LegacyBridge(
                    "no legacy transaction is bound to suspend",
                ))
            }
        }
    }

    /// Rebinds the suspended legacy transaction to `manager`. When `manager` refuses it,
    /// the transaction stays suspended here.
    pub fn resume(&mut self, manager: &M) -> Result<()> {
        let Some(legacy) = self.suspended.legacy.take() else {
            error!(tx = self.tx.id(), "legacy.resume.not_suspended");
            return Err(KernelError::LegacyBridge("no legacy transaction is suspended"));
        };
        if let Err((err, legacy)) = manager.resume(legacy) {
            self.suspended.legacy = Some(legacy);
            error!(tx = self.tx.id(), error = %err, "legacy.resume.refused");
            return Err(err);
        }
        debug!(tx = self.tx.id(), "legacy.resumed");
        Ok(())
    }

    pub fn acquire_read_statement(&self) -> Result<ReadStatement<'_>> {
        self.tx.acquire_read_statement()
    }

    pub fn acquire_data_statement(&self) -> Result<DataStatement<'_>> {
        self.tx.acquire_data_statement()
    }

    pub fn acquire_schema_statement(&self) -> Result<SchemaStatement<'_>> {
        self.tx.acquire_schema_statement()
    }

    pub fn commit(&mut self) -> Result<()> {
        self.tx.commit()
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.tx.rollback()
    }

    pub fn execute<T, F>(&mut self, work: F) -> Result<T>
    where
        F: FnOnce(&KernelTransaction) -> Result<T>,
    {
        self.tx.execute(work)
    }

    /// Splits into the kernel transaction and any still-suspended legacy transaction.
    pub fn into_inner(self) -> (KernelTransaction, Option<M::Transaction>) {
        let TransitionalTransaction { tx, mut suspended } = self;
        (tx, suspended.legacy.take())
    }
}
