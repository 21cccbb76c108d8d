#![forbid(unsafe_code)]

mod cache;
mod epoch;
mod label;
mod lifecycle;
mod types;

pub use cache::{SchemaStateCache, SchemaStateCacheStats};
pub use epoch::{SchemaEpoch, SchemaGeneration};
pub use label::{LabelScanReader, LabelScanStore};
pub use lifecycle::{
    IndexProxy, IndexReader, IndexState, IndexUpdate, IndexingService, NodeChange,
    PopulationFailure, PopulationSource, StorePopulationSource,
};
pub use types::{
    collect_all, EmptyPostingStream, NodeIdStream, PostingStream, SnapshotPostingStream,
};
