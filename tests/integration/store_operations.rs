#![allow(clippy::all)]

use std::sync::{Arc, Once};

use sombra_kernel::kernel::{
    AccessMode, EntityWriteOperations, Kernel, KernelOptions, KernelStores,
};
use sombra_kernel::storage::index::collect_all;
use sombra_kernel::storage::{
    encode_labels, LabelField, MemRecordStore, NodeRecord, PropValueOwned, Property,
    RecordStoreOptions,
};
use sombra_kernel::types::{
    EntityKind, KernelError, LabelId, NodeId, PropId, PropRecordId, Rejection, RelId, Result,
    TokenKind, TypeId,
};
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

fn assert_rejected<T: std::fmt::Debug>(result: Result<T>, expected: Rejection) {
    match result {
        Err(KernelError::Unsupported { rejection, .. }) => assert_eq!(rejection, expected),
        other => panic!("expected {expected:?} rejection, got {other:?}"),
    }
}

#[test]
fn token_lookups_are_idempotent() -> Result<()> {
    let kernel = kernel()?;
    let ops = kernel.store_operations();

    let person = ops.label_get_or_create_for_name("Person")?;
    assert_eq!(ops.label_get_or_create_for_name("Person")?, person);
    assert_eq!(ops.label_get_for_name("Person"), Some(person));
    assert_eq!(ops.label_get_for_name("Unknown"), None);
    assert_eq!(ops.label_get_name(person)?, "Person");

    let name = ops.property_key_get_or_create_for_name("name")?;
    assert_eq!(ops.property_key_get_or_create_for_name("name")?, name);
    assert_eq!(ops.property_key_get_for_name("missing"), None);

    let knows = ops.relationship_type_get_or_create_for_name("KNOWS")?;
    assert_eq!(ops.relationship_type_get_name(knows)?, "KNOWS");
    assert_eq!(
        ops.relationship_types_get_all_tokens()
            .map(|t| t.name)
            .collect::<Vec<_>>(),
        vec!["KNOWS".to_owned()]
    );

    match ops.label_get_name(LabelId(99)) {
        Err(KernelError::TokenNotFound { kind, id }) => {
            assert_eq!(kind, TokenKind::Label);
            assert_eq!(id, 99);
        }
        other => panic!("expected TokenNotFound, got {other:?}"),
    }
    Ok(())
}

#[test]
fn exhausted_label_namespace_is_too_many_labels() -> Result<()> {
    init_tracing();
    let kernel = Kernel::in_memory(KernelOptions::default().label_capacity(2))?;
    let ops = kernel.store_operations();
    ops.label_get_or_create_for_name("a")?;
    ops.label_get_or_create_for_name("b")?;
    assert!(matches!(
        ops.label_get_or_create_for_name("c"),
        Err(KernelError::TooManyLabels(_))
    ));
    assert!(ops.label_get_or_create_for_name("a").is_ok());
    Ok(())
}

#[test]
fn direct_writes_are_rejected() -> Result<()> {
    let kernel = kernel()?;
    let ops = kernel.store_operations();
    let node = NodeId(1);
    let rel = RelId(1);
    let prop = Property::new(PropId(0), 1i64);

    assert_rejected(ops.node_create(), Rejection::UseTransaction);
    assert_rejected(
        ops.relationship_create(TypeId(0), node, node),
        Rejection::UseTransaction,
    );
    assert_rejected(ops.node_add_label(node, LabelId(0)), Rejection::UseTransaction);
    assert_rejected(ops.node_remove_label(node, LabelId(0)), Rejection::UseTransaction);
    assert_rejected(ops.node_delete(node), Rejection::UseAuxiliary);
    assert_rejected(ops.relationship_delete(rel), Rejection::UseAuxiliary);
    assert_rejected(ops.node_set_property(node, prop.clone()), Rejection::UseAuxiliary);
    assert_rejected(
        ops.relationship_set_property(rel, prop.clone()),
        Rejection::UseAuxiliary,
    );
    assert_rejected(ops.graph_set_property(prop), Rejection::UseAuxiliary);
    assert_rejected(ops.node_remove_property(node, PropId(0)), Rejection::UseAuxiliary);
    assert_rejected(
        ops.relationship_remove_property(rel, PropId(0)),
        Rejection::UseAuxiliary,
    );
    assert_rejected(ops.graph_remove_property(PropId(0)), Rejection::UseAuxiliary);
    assert_rejected(ops.node_delete_record(node), Rejection::UseTransaction);
    assert_rejected(ops.relationship_delete_record(rel), Rejection::UseTransaction);
    Ok(())
}

#[test]
fn single_property_reads_belong_to_the_statement() -> Result<()> {
    let kernel = kernel()?;
    let ops = kernel.store_operations();
    assert_rejected(ops.node_get_property(NodeId(0), PropId(0)), Rejection::NotReachable);
    assert_rejected(ops.node_get_property_keys(NodeId(0)), Rejection::NotReachable);
    assert_rejected(ops.graph_get_property(PropId(0)), Rejection::NotReachable);
    assert_rejected(ops.graph_get_property_keys(), Rejection::NotReachable);
    assert_rejected(
        ops.relationship_get_property(RelId(0), PropId(0)),
        Rejection::NotReachable,
    );
    Ok(())
}

#[test]
fn committed_node_reads_back_labels_and_properties() -> Result<()> {
    let kernel = kernel()?;
    let mut tx = kernel.begin_transaction(AccessMode::ReadWrite);
    let (node, person, age) = {
        let data = tx.acquire_data_statement()?;
        let person = data.label_get_or_create_for_name("Person")?;
        let age = data.property_key_get_or_create_for_name("age")?;
        let node = data.node_create()?;
        data.node_add_label(node, person)?;
        data.node_set_property(node, Property::new(age, 42i64))?;
        (node, person, age)
    };
    tx.commit()?;

    let tx = kernel.begin_transaction(AccessMode::ReadOnly);
    let read = tx.acquire_read_statement()?;
    assert_eq!(read.node_get_labels(node).to_vec(), vec![person]);
    assert!(read.node_has_label(node, person));
    let props: Vec<Property> = read.node_get_all_properties(node)?.collect();
    assert_eq!(props, vec![Property::new(age, 42i64)]);
    assert_eq!(read.node_get_property(node, age)?, Some(Property::new(age, 42i64)));
    assert_eq!(read.node_get_property_keys(node)?, vec![age]);

    let mut stream = read.nodes_get_for_label(person)?;
    let mut nodes = Vec::new();
    collect_all(stream.as_mut(), &mut nodes)?;
    assert_eq!(nodes, vec![node]);
    Ok(())
}

#[test]
fn node_without_property_chain_has_no_properties() -> Result<()> {
    let kernel = kernel()?;
    let mut tx = kernel.begin_transaction(AccessMode::ReadWrite);
    let node = tx.acquire_data_statement()?.node_create()?;
    tx.commit()?;

    let tx = kernel.begin_transaction(AccessMode::ReadOnly);
    let read = tx.acquire_read_statement()?;
    assert_eq!(read.node_get_all_properties(node)?.count(), 0);
    assert!(read.node_get_labels(node).is_empty());
    Ok(())
}

#[test]
fn missing_entities_are_entity_not_found() -> Result<()> {
    let kernel = kernel()?;
    let ops = kernel.store_operations();
    match ops.node_get_all_properties(NodeId(404)) {
        Err(KernelError::EntityNotFound { kind, id }) => {
            assert_eq!(kind, EntityKind::Node);
            assert_eq!(id, 404);
        }
        other => panic!("expected EntityNotFound, got {:?}", other.map(|p| p.count())),
    }
    assert!(matches!(
        ops.relationship_get_all_properties(RelId(7)).map(|p| p.count()),
        Err(KernelError::EntityNotFound {
            kind: EntityKind::Relationship,
            ..
        })
    ));
    assert!(ops.node_get_labels(NodeId(404)).is_empty());
    assert_eq!(ops.graph_get_all_properties()?.count(), 0);
    Ok(())
}

#[test]
fn corrupt_label_field_reads_as_no_labels() -> Result<()> {
    init_tracing();
    let options = KernelOptions::default().populate_in_background(false);
    let records = Arc::new(MemRecordStore::new(RecordStoreOptions::default()));
    let mut stores = KernelStores::in_memory(&options);
    stores.records = records.clone();
    stores.persistence = records.clone();
    let kernel = Kernel::open(options, stores)?;

    let mut healthy = encode_labels(&[LabelId(3)])?;
    records.put_node_record(NodeRecord {
        id: NodeId(1),
        labels: LabelField::Inline(healthy.clone()),
        next_prop: None,
    });
    healthy.truncate(healthy.len() - 1);
    records.put_node_record(NodeRecord {
        id: NodeId(2),
        labels: LabelField::Inline(healthy),
        next_prop: None,
    });

    let ops = kernel.store_operations();
    assert_eq!(ops.node_get_labels(NodeId(1)).to_vec(), vec![LabelId(3)]);
    assert!(ops.node_get_labels(NodeId(2)).is_empty());
    assert!(!ops.node_has_label(NodeId(2), LabelId(3)));
    Ok(())
}

#[test]
fn broken_property_chain_is_entity_not_found() -> Result<()> {
    init_tracing();
    let options = KernelOptions::default().populate_in_background(false);
    let records = Arc::new(MemRecordStore::new(RecordStoreOptions::default()));
    let mut stores = KernelStores::in_memory(&options);
    stores.records = records.clone();
    stores.persistence = records.clone();
    let kernel = Kernel::open(options, stores)?;

    records.put_node_record(NodeRecord {
        id: NodeId(1),
        labels: LabelField::Inline(encode_labels(&[LabelId(3)])?),
        next_prop: Some(PropRecordId(999)),
    });

    let tx = kernel.begin_transaction(AccessMode::ReadOnly);
    let read = tx.acquire_read_statement()?;
    match read.node_get_all_properties(NodeId(1)) {
        Err(KernelError::EntityNotFound { kind, id }) => {
            assert_eq!(kind, EntityKind::Node);
            assert_eq!(id, 1);
        }
        other => panic!("expected EntityNotFound, got {:?}", other.map(|p| p.count())),
    }
    assert_eq!(read.node_get_labels(NodeId(1)).to_vec(), vec![LabelId(3)]);
    Ok(())
}

#[test]
fn relationship_and_graph_properties_round_trip() -> Result<()> {
    let kernel = kernel()?;
    let mut tx = kernel.begin_transaction(AccessMode::ReadWrite);
    let (rel, since, title) = {
        let data = tx.acquire_data_statement()?;
        let knows = data.relationship_type_get_or_create_for_name("KNOWS")?;
        let since = data.property_key_get_or_create_for_name("since")?;
        let title = data.property_key_get_or_create_for_name("title")?;
        let a = data.node_create()?;
        let b = data.node_create()?;
        let rel = data.relationship_create(knows, a, b)?;
        data.relationship_set_property(rel, Property::new(since, 2001i64))?;
        data.graph_set_property(Property::new(title, "social"))?;
        (rel, since, title)
    };
    tx.commit()?;

    let tx = kernel.begin_transaction(AccessMode::ReadOnly);
    let read = tx.acquire_read_statement()?;
    assert_eq!(
        read.relationship_get_property(rel, since)?,
        Some(Property::new(since, 2001i64))
    );
    assert_eq!(read.relationship_get_property_keys(rel)?, vec![since]);
    assert_eq!(
        read.graph_get_property(title)?.map(|p| p.value),
        Some(PropValueOwned::Str("social".into()))
    );
    assert_eq!(read.graph_get_property_keys()?, vec![title]);
    Ok(())
}
