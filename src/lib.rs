//! Statement and transaction layer of a property-graph kernel.
//!
//! [`kernel`] hosts transactions, typed statements and commit application; [`storage`]
//! holds the collaborators they run on (token registries, records, schema rules, index
//! proxies, the label scan store and the schema state cache).

#![warn(missing_docs)]

pub mod kernel;
pub mod logging;
pub mod storage;
pub mod types;

pub use kernel::{
    AccessMode, ConfigError, DataStatement, Kernel, KernelOptions, KernelStores,
    KernelTransaction, ReadStatement, SchemaStatement, TxState,
};
pub use logging::init_logging;
pub use types::{KernelError, Rejection, Result, StorageError};
