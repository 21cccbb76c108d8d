use std::sync::atomic::{AtomicU64, Ordering};

/// Generation of the committed schema; every schema-changing commit produces a new one.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SchemaGeneration(pub u64);

/// Thread-safe schema generation counter shared by the kernel and the schema state cache.
#[derive(Debug, Default)]
pub struct SchemaEpoch {
    value: AtomicU64,
}

impl SchemaEpoch {
    pub fn new(initial: SchemaGeneration) -> Self {
        Self {
            value: AtomicU64::new(initial.0),
        }
    }

    pub fn current(&self) -> SchemaGeneration {
        SchemaGeneration(self.value.load(Ordering::SeqCst))
    }

    /// Advances to the next generation and returns it.
    pub fn bump(&self) -> SchemaGeneration {
        SchemaGeneration(self.value.fetch_add(1, Ordering::SeqCst).saturating_add(1))
    }
}
