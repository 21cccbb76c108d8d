#![allow(clippy::all)]

use std::sync::Once;

use sombra_kernel::kernel::{AccessMode, EntityWriteOperations, Kernel, KernelOptions, TxState};
use sombra_kernel::storage::{IndexDescriptor, PropValueOwned, Property, UniquenessConstraint};
use sombra_kernel::types::{EntityKind, KernelError, LabelId, NodeId, PropId, Result};
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

struct Fixture {
    kernel: Kernel,
    person: LabelId,
    email: PropId,
}

fn fixture() -> Result<Fixture> {
    init_tracing();
    let kernel = Kernel::in_memory(KernelOptions::default().populate_in_background(false))?;
    let ops = kernel.store_operations();
    let person = ops.label_get_or_create_for_name("Person")?;
    let email = ops.property_key_get_or_create_for_name("email")?;
    Ok(Fixture {
        kernel,
        person,
        email,
    })
}

fn create_person(fx: &Fixture, email: &str) -> Result<NodeId> {
    let mut tx = fx.kernel.begin_transaction(AccessMode::ReadWrite);
    let node = tx.execute(|tx| {
        let data = tx.acquire_data_statement()?;
        let node = data.node_create()?;
        data.node_add_label(node, fx.person)?;
        data.node_set_property(node, Property::new(fx.email, email))?;
        Ok(node)
    })?;
    assert_eq!(tx.state(), TxState::Committed);
    Ok(node)
}

#[test]
fn read_only_transactions_refuse_write_statements() -> Result<()> {
    let fx = fixture()?;
    let tx = fx.kernel.begin_transaction(AccessMode::ReadOnly);
    assert!(tx.acquire_read_statement().is_ok());
    assert!(matches!(
        tx.acquire_data_statement().map(|_| ()),
        Err(KernelError::InvalidTransactionType { .. })
    ));
    assert!(matches!(
        tx.acquire_schema_statement().map(|_| ()),
        Err(KernelError::InvalidTransactionType { .. })
    ));
    Ok(())
}

#[test]
fn data_and_schema_statements_do_not_mix() -> Result<()> {
    let fx = fixture()?;
    let tx = fx.kernel.begin_transaction(AccessMode::ReadWrite);
    drop(tx.acquire_data_statement()?);
    assert!(tx.acquire_data_statement().is_ok());
    assert!(matches!(
        tx.acquire_schema_statement().map(|_| ()),
        Err(KernelError::InvalidTransactionType { .. })
    ));

    let tx = fx.kernel.begin_transaction(AccessMode::ReadWrite);
    tx.acquire_schema_statement()?.release();
    assert!(matches!(
        tx.acquire_data_statement().map(|_| ()),
        Err(KernelError::InvalidTransactionType { .. })
    ));
    Ok(())
}

#[test]
fn finished_transactions_refuse_statements() -> Result<()> {
    let fx = fixture()?;
    let mut tx = fx.kernel.begin_transaction(AccessMode::ReadWrite);
    tx.commit()?;
    assert_eq!(tx.state(), TxState::Committed);
    assert!(matches!(
        tx.acquire_read_statement().map(|_| ()),
        Err(KernelError::TransactionNotOpen {
            state: TxState::Committed
        })
    ));
    assert!(tx.commit().is_err());
    assert!(tx.rollback().is_err());

    let mut tx = fx.kernel.begin_transaction(AccessMode::ReadWrite);
    tx.rollback()?;
    assert_eq!(tx.state(), TxState::RolledBack);
    assert!(tx.acquire_read_statement().is_err());
    Ok(())
}

#[test]
fn rollback_discards_pending_writes() -> Result<()> {
    let fx = fixture()?;
    let mut tx = fx.kernel.begin_transaction(AccessMode::ReadWrite);
    let node = tx.acquire_data_statement()?.node_create()?;
    tx.rollback()?;

    let ops = fx.kernel.store_operations();
    assert!(matches!(
        ops.node_get_all_properties(node).map(|p| p.count()),
        Err(KernelError::EntityNotFound {
            kind: EntityKind::Node,
            ..
        })
    ));
    Ok(())
}

#[test]
fn dropping_an_open_transaction_rolls_it_back() -> Result<()> {
    let fx = fixture()?;
    let node = {
        let tx = fx.kernel.begin_transaction(AccessMode::ReadWrite);
        let data = tx.acquire_data_statement()?;
        let node = data.node_create()?;
        node
    };
    assert!(fx
        .kernel
        .store_operations()
        .node_get_all_properties(node)
        .is_err());
    Ok(())
}

#[test]
fn failed_work_rolls_back_and_surfaces_the_error() -> Result<()> {
    let fx = fixture()?;
    let mut tx = fx.kernel.begin_transaction(AccessMode::ReadWrite);
    let result: Result<()> = tx.execute(|tx| {
        let data = tx.acquire_data_statement()?;
        data.node_create()?;
        data.node_add_label(NodeId(12345), fx.person)?;
        Ok(())
    });
    assert!(matches!(
        result,
        Err(KernelError::EntityNotFound {
            kind: EntityKind::Node,
            id: 12345
        })
    ));
    assert_eq!(tx.state(), TxState::RolledBack);
    Ok(())
}

#[test]
fn statement_writes_report_previous_values() -> Result<()> {
    let fx = fixture()?;
    let node = create_person(&fx, "a@example.com")?;

    let mut tx = fx.kernel.begin_transaction(AccessMode::ReadWrite);
    {
        let data = tx.acquire_data_statement()?;
        assert!(!data.node_add_label(node, fx.person)?);
        let previous = data.node_set_property(node, Property::new(fx.email, "b@example.com"))?;
        assert_eq!(previous, Some(Property::new(fx.email, "a@example.com")));
        let previous = data.node_set_property(node, Property::new(fx.email, "c@example.com"))?;
        assert_eq!(previous, Some(Property::new(fx.email, "b@example.com")));
        // Reads still answer from committed state.
        assert_eq!(
            data.node_get_property(node, fx.email)?,
            Some(Property::new(fx.email, "a@example.com"))
        );
    }
    tx.commit()?;

    let tx = fx.kernel.begin_transaction(AccessMode::ReadOnly);
    let read = tx.acquire_read_statement()?;
    assert_eq!(
        read.node_get_property(node, fx.email)?.map(|p| p.value),
        Some(PropValueOwned::Str("c@example.com".into()))
    );
    Ok(())
}

#[test]
fn node_delete_clears_labels_and_properties() -> Result<()> {
    let fx = fixture()?;
    let node = create_person(&fx, "gone@example.com")?;
    let mut tx = fx.kernel.begin_transaction(AccessMode::ReadWrite);
    tx.acquire_data_statement()?.node_delete(node)?;
    tx.commit()?;

    assert!(fx.kernel.label_scan_store().nodes(fx.person).is_empty());
    assert!(fx
        .kernel
        .store_operations()
        .node_get_all_properties(node)
        .is_err());
    Ok(())
}

#[test]
fn schema_statement_validates_against_committed_schema() -> Result<()> {
    let fx = fixture()?;
    let mut tx = fx.kernel.begin_transaction(AccessMode::ReadWrite);
    tx.acquire_schema_statement()?.index_create(fx.person, fx.email)?;
    tx.commit()?;

    let mut tx = fx.kernel.begin_transaction(AccessMode::ReadWrite);
    {
        let schema = tx.acquire_schema_statement()?;
        assert!(matches!(
            schema.index_create(fx.person, fx.email),
            Err(KernelError::AlreadyIndexed { .. })
        ));
        assert!(matches!(
            schema.uniqueness_constraint_create(fx.person, fx.email),
            Err(KernelError::AlreadyIndexed { .. })
        ));
        assert!(matches!(
            schema.constraint_drop(UniquenessConstraint::new(fx.person, fx.email)),
            Err(KernelError::ConstraintNotFound { .. })
        ));
        assert!(matches!(
            schema.index_drop(IndexDescriptor::new(fx.person, PropId(77))),
            Err(KernelError::IndexNotFound(_))
        ));
    }
    tx.rollback()?;
    Ok(())
}

#[test]
fn create_then_drop_in_one_transaction_cancels_out() -> Result<()> {
    let fx = fixture()?;
    let mut tx = fx.kernel.begin_transaction(AccessMode::ReadWrite);
    {
        let schema = tx.acquire_schema_statement()?;
        let descriptor = schema.index_create(fx.person, fx.email)?;
        schema.index_drop(descriptor)?;
    }
    tx.commit()?;
    assert_eq!(fx.kernel.store_operations().indexes_get_all()?.count(), 0);
    Ok(())
}

#[test]
fn unique_constraint_rejects_duplicate_commit() -> Result<()> {
    let fx = fixture()?;
    create_person(&fx, "dup@example.com")?;
    let mut tx = fx.kernel.begin_transaction(AccessMode::ReadWrite);
    tx.acquire_schema_statement()?
        .uniqueness_constraint_create(fx.person, fx.email)?;
    tx.commit()?;

    let err = create_person(&fx, "dup@example.com").unwrap_err();
    assert!(matches!(err, KernelError::UniquenessViolation { .. }));
    create_person(&fx, "other@example.com")?;
    Ok(())
}

#[test]
fn constraint_over_duplicates_fails_and_leaves_no_rules() -> Result<()> {
    let fx = fixture()?;
    create_person(&fx, "same@example.com")?;
    create_person(&fx, "same@example.com")?;

    let mut tx = fx.kernel.begin_transaction(AccessMode::ReadWrite);
    tx.acquire_schema_statement()?
        .uniqueness_constraint_create(fx.person, fx.email)?;
    match tx.commit() {
        Err(KernelError::ConstraintCreationFailed { label, prop, reason }) => {
            assert_eq!((label, prop), (fx.person, fx.email));
            assert!(!reason.is_empty());
        }
        other => panic!("expected ConstraintCreationFailed, got {other:?}"),
    }
    assert_eq!(tx.state(), TxState::RolledBack);

    let ops = fx.kernel.store_operations();
    assert_eq!(ops.constraints_get_all()?.count(), 0);
    assert_eq!(ops.unique_indexes_get_all()?.count(), 0);
    Ok(())
}

#[test]
fn constraint_metadata_links_index_and_constraint() -> Result<()> {
    let fx = fixture()?;
    let mut tx = fx.kernel.begin_transaction(AccessMode::ReadWrite);
    tx.acquire_schema_statement()?
        .uniqueness_constraint_create(fx.person, fx.email)?;
    tx.commit()?;

    let ops = fx.kernel.store_operations();
    let descriptor = IndexDescriptor::new(fx.person, fx.email);
    assert_eq!(
        ops.unique_indexes_get_for_label(fx.person)?.collect::<Vec<_>>(),
        vec![descriptor]
    );
    assert_eq!(ops.indexes_get_for_label(fx.person)?.count(), 0);
    assert!(ops.index_get_owning_uniqueness_constraint_id(descriptor)?.is_some());
    assert_ne!(
        ops.index_get_owning_uniqueness_constraint_id(descriptor)?,
        Some(ops.index_get_committed_id(descriptor)?)
    );
    assert_eq!(
        ops.constraints_get_for_label_and_property_key(fx.person, fx.email)?
            .collect::<Vec<_>>(),
        vec![UniquenessConstraint::new(fx.person, fx.email)]
    );
    assert_eq!(
        ops.constraints_get_for_label_and_property_key(fx.person, PropId(99))?
            .count(),
        0
    );
    Ok(())
}
