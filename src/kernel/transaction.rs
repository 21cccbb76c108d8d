use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::types::{KernelError, Result};

use super::statement::{DataStatement, ReadStatement, SchemaStatement};
use super::tx_state::TxChangeSet;
use super::KernelInner;

/// The state of a transaction. `Committed` and `RolledBack` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxState {
    Open,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TxState::Open => "OPEN",
            TxState::Committing => "COMMITTING",
            TxState::Committed => "COMMITTED",
            TxState::RollingBack => "ROLLING_BACK",
            TxState::RolledBack => "ROLLED_BACK",
        })
    }
}

/// Declared capability of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Which kind of writing statement a transaction has committed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    None,
    Data,
    Schema,
}

/// A unit of atomicity.
///
/// Statements borrow the transaction, and `commit`/`rollback` take it mutably, so every
/// statement has been released by the time either runs. Dropping an open transaction
/// rolls it back.
///
/// # Example
///
/// ```rust
/// use sombra_kernel::kernel::{AccessMode, EntityWriteOperations, Kernel, KernelOptions};
///
/// let kernel = Kernel::in_memory(KernelOptions::default())?;
/// let mut tx = kernel.begin_transaction(AccessMode::ReadWrite);
/// {
///     let data = tx.acquire_data_statement()?;
///     let person = data.label_get_or_create_for_name("Person")?;
///     let node = data.node_create()?;
///     data.node_add_label(node, person)?;
/// }
/// tx.commit()?;
/// # Ok::<(), sombra_kernel::KernelError>(())
/// ```
pub struct KernelTransaction {
    id: u64,
    kernel: Arc<KernelInner>,
    mode: AccessMode,
    state: TxState,
    write_kind: Mutex<WriteKind>,
    changes: Mutex<TxChangeSet>,
}

impl KernelTransaction {
    pub(crate) fn new(id: u64, kernel: Arc<KernelInner>, mode: AccessMode) -> Self {
        debug!(tx = id, ?mode, "tx.begin");
        Self {
            id,
            kernel,
            mode,
            state: TxState::Open,
            write_kind: Mutex::new(WriteKind::None),
            changes: Mutex::new(TxChangeSet::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub(crate) fn kernel(&self) -> &KernelInner {
        &self.kernel
    }

    pub(crate) fn changes(&self) -> &Mutex<TxChangeSet> {
        &self.changes
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            TxState::Open => Ok(()),
            state => Err(KernelError::TransactionNotOpen { state }),
        }
    }

    pub fn acquire_read_statement(&self) -> Result<ReadStatement<'_>> {
        self.ensure_open()?;
        Ok(ReadStatement::new(self, "read"))
    }

    /// Fails with `InvalidTransactionType` on read-only transactions and on transactions
    /// that already changed schema.
    pub fn acquire_data_statement(&self) -> Result<DataStatement<'_>> {
        self.ensure_open()?;
        self.claim_write_kind(WriteKind::Data, "data")?;
        Ok(DataStatement::new(self))
    }

    /// Fails with `InvalidTransactionType` on read-only transactions and on transactions
    /// that already changed data.
    pub fn acquire_schema_statement(&self) -> Result<SchemaStatement<'_>> {
        self.ensure_open()?;
        self.claim_write_kind(WriteKind::Schema, "schema")?;
        Ok(SchemaStatement::new(self))
    }

    fn claim_write_kind(&self, wanted: WriteKind, requested: &'static str) -> Result<()> {
        if self.mode == AccessMode::ReadOnly {
            return Err(KernelError::InvalidTransactionType {
                requested,
                reason: "the transaction is read-only",
            });
        }
        let mut kind = self.write_kind.lock();
        match (*kind, wanted) {
            (WriteKind::None, _) => {
                *kind = wanted;
                Ok(())
            }
            (current, wanted) if current == wanted => Ok(()),
            (WriteKind::Data, _) => Err(KernelError::InvalidTransactionType {
                requested,
                reason: "the transaction already performed data changes",
            }),
            _ => Err(KernelError::InvalidTransactionType {
                requested,
                reason: "the transaction already performed schema changes",
            }),
        }
    }

    /// Applies the pending changes. On failure the transaction ends rolled back and the
    /// failure is returned.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.state = TxState::Committing;
        let changes = std::mem::take(&mut *self.changes.lock());
        if changes.is_empty() {
            self.state = TxState::Committed;
            debug!(tx = self.id, "tx.commit.empty");
            return Ok(());
        }
        match self.kernel.apply_commit(self.id, changes) {
            Ok(summary) => {
                self.state = TxState::Committed;
                debug!(tx = self.id, ?summary, "tx.committed");
                Ok(())
            }
            Err(err) => {
                self.state = TxState::RolledBack;
                warn!(tx = self.id, error = %err, "tx.commit.failed");
                Err(err)
            }
        }
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.state = TxState::RollingBack;
        let discarded = std::mem::take(&mut *self.changes.lock());
        self.state = TxState::RolledBack;
        warn!(tx = self.id, empty = discarded.is_empty(), "tx.rollback");
        Ok(())
    }

    /// Runs `work` against this transaction, committing when it succeeds and rolling back
    /// when it fails. The failure of `work` is returned unchanged.
    pub fn execute<T, F>(&mut self, work: F) -> Result<T>
    where
        F: FnOnce(&KernelTransaction) -> Result<T>,
    {
        match work(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                if self.state == TxState::Open {
                    self.rollback()?;
                }
                Err(err)
            }
        }
    }
}

impl fmt::Debug for KernelTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelTransaction")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for KernelTransaction {
    fn drop(&mut self) {
        if self.state == TxState::Open {
            warn!(tx = self.id, "tx.dropped_open");
            let _ = self.rollback();
        }
    }
}
