#![allow(clippy::all)]

use std::sync::{mpsc, Arc, Mutex, Once};
use std::thread;

use sombra_kernel::kernel::{
    AccessMode, EntityWriteOperations, Kernel, KernelOptions, KernelStores,
};
use sombra_kernel::storage::index::{collect_all, IndexState};
use sombra_kernel::storage::{
    IndexDescriptor, MemSchemaStore, PropValueOwned, Property, SchemaRule, SchemaRuleKind,
    SchemaStore,
};
use sombra_kernel::types::{KernelError, LabelId, NodeId, PropId, Result, RuleId};
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

fn tokens(kernel: &Kernel) -> Result<(LabelId, PropId)> {
    let ops = kernel.store_operations();
    Ok((
        ops.label_get_or_create_for_name("City")?,
        ops.property_key_get_or_create_for_name("name")?,
    ))
}

fn create_city(kernel: &Kernel, label: LabelId, key: PropId, name: &str) -> Result<NodeId> {
    let mut tx = kernel.begin_transaction(AccessMode::ReadWrite);
    tx.execute(|tx| {
        let data = tx.acquire_data_statement()?;
        let node = data.node_create()?;
        data.node_add_label(node, label)?;
        data.node_set_property(node, Property::new(key, name))?;
        Ok(node)
    })
}

fn create_index(kernel: &Kernel, label: LabelId, key: PropId) -> Result<IndexDescriptor> {
    let mut tx = kernel.begin_transaction(AccessMode::ReadWrite);
    tx.execute(|tx| tx.acquire_schema_statement()?.index_create(label, key))
}

fn lookup(kernel: &Kernel, descriptor: IndexDescriptor, name: &str) -> Result<Vec<NodeId>> {
    let tx = kernel.begin_transaction(AccessMode::ReadOnly);
    let read = tx.acquire_read_statement()?;
    let mut stream =
        read.nodes_get_from_index_lookup(descriptor, &PropValueOwned::Str(name.into()))?;
    let mut out = Vec::new();
    collect_all(stream.as_mut(), &mut out)?;
    Ok(out)
}

#[test]
fn background_population_reaches_online() -> Result<()> {
    init_tracing();
    let kernel = Kernel::in_memory(KernelOptions::default())?;
    let (city, name) = tokens(&kernel)?;
    let malmo = create_city(&kernel, city, name, "Malmo")?;
    create_city(&kernel, city, name, "Lund")?;

    let descriptor = create_index(&kernel, city, name)?;
    let ops = kernel.store_operations();
    assert_eq!(
        ops.indexes_get_for_label(city)?.collect::<Vec<_>>(),
        vec![descriptor]
    );
    assert_eq!(ops.index_get_for_label_and_property_key(city, name)?, descriptor);

    ops.index_await_online(descriptor)?;
    assert_eq!(ops.index_get_state(descriptor)?, IndexState::Online);
    assert_eq!(ops.index_get_failure(descriptor)?, None);
    assert_eq!(lookup(&kernel, descriptor, "Malmo")?, vec![malmo]);
    Ok(())
}

#[test]
fn committed_changes_maintain_online_index() -> Result<()> {
    init_tracing();
    let kernel = Kernel::in_memory(KernelOptions::default().populate_in_background(false))?;
    let (city, name) = tokens(&kernel)?;
    let descriptor = create_index(&kernel, city, name)?;

    let node = create_city(&kernel, city, name, "Oslo")?;
    assert_eq!(lookup(&kernel, descriptor, "Oslo")?, vec![node]);

    let mut tx = kernel.begin_transaction(AccessMode::ReadWrite);
    tx.acquire_data_statement()?
        .node_set_property(node, Property::new(name, "Bergen"))?;
    tx.commit()?;
    assert!(lookup(&kernel, descriptor, "Oslo")?.is_empty());
    assert_eq!(lookup(&kernel, descriptor, "Bergen")?, vec![node]);

    let mut tx = kernel.begin_transaction(AccessMode::ReadWrite);
    tx.acquire_data_statement()?.node_remove_label(node, city)?;
    tx.commit()?;
    assert!(lookup(&kernel, descriptor, "Bergen")?.is_empty());
    Ok(())
}

#[test]
fn lookups_on_unknown_index_fail() -> Result<()> {
    init_tracing();
    let kernel = Kernel::in_memory(KernelOptions::default().populate_in_background(false))?;
    let descriptor = IndexDescriptor::new(LabelId(4), PropId(2));
    assert!(matches!(
        lookup(&kernel, descriptor, "x"),
        Err(KernelError::IndexNotFound(_))
    ));
    assert!(matches!(
        kernel.store_operations().index_get_state(descriptor),
        Err(KernelError::IndexNotFound(_))
    ));
    assert!(matches!(
        kernel
            .store_operations()
            .index_get_for_label_and_property_key(LabelId(4), PropId(2)),
        Err(KernelError::SchemaRuleNotFound { .. })
    ));
    Ok(())
}

#[test]
fn reopened_kernel_repopulates_committed_indexes() -> Result<()> {
    init_tracing();
    let options = KernelOptions::default().populate_in_background(false);
    let stores = KernelStores::in_memory(&options);
    let (descriptor, node) = {
        let kernel = Kernel::open(options.clone(), stores.clone())?;
        let (city, name) = tokens(&kernel)?;
        let node = create_city(&kernel, city, name, "Turku")?;
        (create_index(&kernel, city, name)?, node)
    };

    let kernel = Kernel::open(options, stores)?;
    let ops = kernel.store_operations();
    assert_eq!(ops.indexes_get_all()?.collect::<Vec<_>>(), vec![descriptor]);
    assert_eq!(ops.index_get_state(descriptor)?, IndexState::Online);
    assert_eq!(lookup(&kernel, descriptor, "Turku")?, vec![node]);
    Ok(())
}

#[test]
fn dropped_index_is_gone() -> Result<()> {
    init_tracing();
    let kernel = Kernel::in_memory(KernelOptions::default().populate_in_background(false))?;
    let (city, name) = tokens(&kernel)?;
    let descriptor = create_index(&kernel, city, name)?;
    let mut tx = kernel.begin_transaction(AccessMode::ReadWrite);
    tx.acquire_schema_statement()?.index_drop(descriptor)?;
    tx.commit()?;

    assert_eq!(kernel.store_operations().indexes_get_all()?.count(), 0);
    assert!(lookup(&kernel, descriptor, "any").is_err());
    Ok(())
}

/// Schema store that records every published rule and can hold the committer right after
/// the first constraint index is published.
#[derive(Default)]
struct WatchedSchemaStore {
    inner: MemSchemaStore,
    published: Mutex<Vec<SchemaRuleKind>>,
    hold: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
}

impl SchemaStore for WatchedSchemaStore {
    fn load_all_schema_rules(&self) -> Result<Vec<SchemaRule>> {
        self.inner.load_all_schema_rules()
    }

    fn next_rule_id(&self) -> RuleId {
        self.inner.next_rule_id()
    }

    fn add_rule(&self, rule: SchemaRule) -> Result<()> {
        let kind = rule.kind();
        self.inner.add_rule(rule)?;
        self.published.lock().unwrap().push(kind);
        if kind == SchemaRuleKind::ConstraintIndex {
            let hold = self.hold.lock().unwrap().take();
            if let Some((reached, release)) = hold {
                reached.send(()).unwrap();
                release.recv().unwrap();
            }
        }
        Ok(())
    }

    fn remove_rule(&self, id: RuleId) -> Result<()> {
        self.inner.remove_rule(id)
    }
}

fn watched_kernel(background: bool) -> Result<(Kernel, Arc<WatchedSchemaStore>)> {
    init_tracing();
    let options = KernelOptions::default().populate_in_background(background);
    let schema = Arc::new(WatchedSchemaStore::default());
    let mut stores = KernelStores::in_memory(&options);
    stores.schema = schema.clone();
    Ok((Kernel::open(options, stores)?, schema))
}

fn create_constraint(kernel: &Kernel, label: LabelId, key: PropId) -> Result<()> {
    let mut tx = kernel.begin_transaction(AccessMode::ReadWrite);
    tx.execute(|tx| {
        tx.acquire_schema_statement()?
            .uniqueness_constraint_create(label, key)
            .map(|_| ())
    })
}

#[test]
fn failed_constraint_publishes_no_rules() -> Result<()> {
    let (kernel, schema) = watched_kernel(true)?;
    let (city, name) = tokens(&kernel)?;
    create_city(&kernel, city, name, "Riga")?;
    create_city(&kernel, city, name, "Riga")?;

    assert!(matches!(
        create_constraint(&kernel, city, name),
        Err(KernelError::ConstraintCreationFailed { .. })
    ));
    assert!(schema.published.lock().unwrap().is_empty());
    assert_eq!(kernel.store_operations().unique_indexes_get_all()?.count(), 0);
    Ok(())
}

#[test]
fn published_constraint_index_is_already_online() -> Result<()> {
    let (kernel, schema) = watched_kernel(true)?;
    let (city, name) = tokens(&kernel)?;
    create_city(&kernel, city, name, "Tartu")?;

    let (reached_tx, reached_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    *schema.hold.lock().unwrap() = Some((reached_tx, release_rx));

    let committer = {
        let kernel = kernel.clone();
        thread::spawn(move || create_constraint(&kernel, city, name))
    };
    reached_rx.recv().unwrap();

    let ops = kernel.store_operations();
    let descriptor = IndexDescriptor::new(city, name);
    assert_eq!(
        ops.unique_indexes_get_all()?.collect::<Vec<_>>(),
        vec![descriptor]
    );
    assert_eq!(ops.index_get_state(descriptor)?, IndexState::Online);
    assert_eq!(ops.index_get_failure(descriptor)?, None);

    release_tx.send(()).unwrap();
    committer.join().unwrap()?;
    assert_eq!(
        *schema.published.lock().unwrap(),
        vec![
            SchemaRuleKind::ConstraintIndex,
            SchemaRuleKind::UniquenessConstraint
        ]
    );
    Ok(())
}
