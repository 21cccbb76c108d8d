#![allow(clippy::all)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

use sombra_kernel::kernel::{AccessMode, Kernel, KernelOptions, KernelTransaction};
use sombra_kernel::storage::{IndexDescriptor, UniquenessConstraint};
use sombra_kernel::types::{LabelId, PropId, Result};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("sombra_kernel=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn kernel() -> Result<Kernel> {
    init_tracing();
    Kernel::in_memory(KernelOptions::default().populate_in_background(false))
}

/// Label 1 and property key 1 exist, so schema writes can name them.
fn seeded_kernel() -> Result<Kernel> {
    let kernel = kernel()?;
    let mut tx = kernel.begin_transaction(AccessMode::ReadWrite);
    {
        let read = tx.acquire_read_statement()?;
        assert_eq!(read.label_get_or_create_for_name("zero")?, LabelId(0));
        assert_eq!(read.label_get_or_create_for_name("one")?, LabelId(1));
        assert_eq!(read.property_key_get_or_create_for_name("zero")?, PropId(0));
        assert_eq!(read.property_key_get_or_create_for_name("one")?, PropId(1));
    }
    tx.commit()?;
    Ok(kernel)
}

fn cached(tx: &KernelTransaction, value: &'static str) -> Result<String> {
    let read = tx.acquire_read_statement()?;
    let got = read.schema_state_get_or_create("test", |_| Ok(value.to_owned()))?;
    Ok(got.as_ref().clone())
}

fn commit_with<F>(kernel: &Kernel, work: F) -> Result<()>
where
    F: FnOnce(&KernelTransaction) -> Result<()>,
{
    let mut tx = kernel.begin_transaction(AccessMode::ReadWrite);
    tx.execute(work)
}

#[test]
fn schema_state_retains_value_without_schema_changes() -> Result<()> {
    let kernel = seeded_kernel()?;
    let tx = kernel.begin_transaction(AccessMode::ReadOnly);
    assert_eq!(cached(&tx, "before")?, "before");
    assert_eq!(cached(&tx, "after")?, "before");
    Ok(())
}

#[test]
fn committed_index_creation_flushes_schema_state() -> Result<()> {
    let kernel = seeded_kernel()?;
    {
        let tx = kernel.begin_transaction(AccessMode::ReadOnly);
        assert_eq!(cached(&tx, "before")?, "before");
    }
    commit_with(&kernel, |tx| {
        tx.acquire_schema_statement()?
            .index_create(LabelId(1), PropId(1))?;
        Ok(())
    })?;
    let tx = kernel.begin_transaction(AccessMode::ReadOnly);
    assert_eq!(cached(&tx, "after")?, "after");
    Ok(())
}

#[test]
fn committed_index_drop_flushes_schema_state() -> Result<()> {
    let kernel = seeded_kernel()?;
    commit_with(&kernel, |tx| {
        tx.acquire_schema_statement()?
            .index_create(LabelId(1), PropId(1))?;
        Ok(())
    })?;
    {
        let tx = kernel.begin_transaction(AccessMode::ReadOnly);
        assert_eq!(cached(&tx, "before")?, "before");
    }
    commit_with(&kernel, |tx| {
        tx.acquire_schema_statement()?
            .index_drop(IndexDescriptor::new(LabelId(1), PropId(1)))
    })?;
    let tx = kernel.begin_transaction(AccessMode::ReadOnly);
    assert_eq!(cached(&tx, "after")?, "after");
    Ok(())
}

#[test]
fn committed_constraint_creation_flushes_schema_state() -> Result<()> {
    let kernel = seeded_kernel()?;
    {
        let tx = kernel.begin_transaction(AccessMode::ReadOnly);
        assert_eq!(cached(&tx, "before")?, "before");
    }
    commit_with(&kernel, |tx| {
        tx.acquire_schema_statement()?
            .uniqueness_constraint_create(LabelId(1), PropId(1))?;
        Ok(())
    })?;
    let tx = kernel.begin_transaction(AccessMode::ReadOnly);
    assert_eq!(cached(&tx, "after")?, "after");
    Ok(())
}

#[test]
fn committed_constraint_drop_flushes_schema_state() -> Result<()> {
    let kernel = seeded_kernel()?;
    commit_with(&kernel, |tx| {
        tx.acquire_schema_statement()?
            .uniqueness_constraint_create(LabelId(1), PropId(1))?;
        Ok(())
    })?;
    {
        let tx = kernel.begin_transaction(AccessMode::ReadOnly);
        assert_eq!(cached(&tx, "before")?, "before");
    }
    commit_with(&kernel, |tx| {
        tx.acquire_schema_statement()?
            .constraint_drop(UniquenessConstraint::new(LabelId(1), PropId(1)))
    })?;
    let tx = kernel.begin_transaction(AccessMode::ReadOnly);
    assert_eq!(cached(&tx, "after")?, "after");
    Ok(())
}

#[test]
fn rolled_back_schema_change_keeps_schema_state() -> Result<()> {
    let kernel = seeded_kernel()?;
    {
        let tx = kernel.begin_transaction(AccessMode::ReadOnly);
        assert_eq!(cached(&tx, "before")?, "before");
    }
    let mut tx = kernel.begin_transaction(AccessMode::ReadWrite);
    tx.acquire_schema_statement()?
        .index_create(LabelId(1), PropId(1))?;
    tx.rollback()?;

    let tx = kernel.begin_transaction(AccessMode::ReadOnly);
    assert_eq!(cached(&tx, "after")?, "before");
    Ok(())
}

#[test]
fn data_commits_keep_schema_state() -> Result<()> {
    let kernel = seeded_kernel()?;
    {
        let tx = kernel.begin_transaction(AccessMode::ReadOnly);
        assert_eq!(cached(&tx, "before")?, "before");
    }
    commit_with(&kernel, |tx| {
        use sombra_kernel::kernel::EntityWriteOperations;
        let data = tx.acquire_data_statement()?;
        let node = data.node_create()?;
        data.node_add_label(node, LabelId(1))?;
        Ok(())
    })?;
    let tx = kernel.begin_transaction(AccessMode::ReadOnly);
    assert_eq!(cached(&tx, "after")?, "before");
    Ok(())
}

#[test]
fn producer_runs_once_per_generation() -> Result<()> {
    let kernel = seeded_kernel()?;
    let calls = AtomicUsize::new(0);
    let produce = |_: &str| -> Result<usize> { Ok(calls.fetch_add(1, Ordering::SeqCst)) };
    {
        let tx = kernel.begin_transaction(AccessMode::ReadOnly);
        let read = tx.acquire_read_statement()?;
        assert_eq!(*read.schema_state_get_or_create("n", produce)?, 0);
        assert_eq!(*read.schema_state_get_or_create("n", produce)?, 0);
    }
    commit_with(&kernel, |tx| {
        tx.acquire_schema_statement()?
            .index_create(LabelId(0), PropId(0))?;
        Ok(())
    })?;
    let tx = kernel.begin_transaction(AccessMode::ReadOnly);
    let read = tx.acquire_read_statement()?;
    assert_eq!(*read.schema_state_get_or_create("n", produce)?, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}
