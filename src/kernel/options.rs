use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::storage::RecordStoreOptions;

/// Errors raised while loading configuration or installing the log subscriber.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config{}: {source}", path.as_ref().map(|p| format!(" {}", p.display())).unwrap_or_default())]
    Parse {
        path: Option<PathBuf>,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),
    #[error("logging already initialized")]
    LoggingAlreadyInitialized,
}

/// Configuration supplied when opening a [`super::Kernel`].
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct KernelOptions {
    /// Number of ids available in the label namespace.
    pub label_capacity: u32,
    /// Number of ids available in the property key namespace.
    pub property_key_capacity: u32,
    /// Number of ids available in the relationship type namespace.
    pub relationship_type_capacity: u32,
    /// Whether index population runs on background threads.
    pub populate_in_background: bool,
    /// Property blocks packed into one property record by the in-memory record store.
    pub property_blocks_per_record: usize,
    /// Label sets larger than this spill into a dynamic label record.
    pub inline_label_limit: usize,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            label_capacity: u32::MAX,
            property_key_capacity: u32::MAX,
            relationship_type_capacity: u32::from(u16::MAX),
            populate_in_background: true,
            property_blocks_per_record: 4,
            inline_label_limit: 4,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    kernel: KernelOptions,
}

impl KernelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the size of the label id space.
    pub fn label_capacity(mut self, capacity: u32) -> Self {
        self.label_capacity = capacity;
        self
    }

    pub fn property_key_capacity(mut self, capacity: u32) -> Self {
        self.property_key_capacity = capacity;
        self
    }

    pub fn relationship_type_capacity(mut self, capacity: u32) -> Self {
        self.relationship_type_capacity = capacity;
        self
    }

    /// Runs index population on background threads, or inline during commit when `false`.
    pub fn populate_in_background(mut self, enabled: bool) -> Self {
        self.populate_in_background = enabled;
        self
    }

    pub fn property_blocks_per_record(mut self, blocks: usize) -> Self {
        self.property_blocks_per_record = blocks;
        self
    }

    pub fn inline_label_limit(mut self, labels: usize) -> Self {
        self.inline_label_limit = labels;
        self
    }

    /// Parses the `[kernel]` table of a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            toml::from_str(contents).map_err(|source| ConfigError::Parse { path: None, source })?;
        raw.kernel.validate()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })?;
        raw.kernel.validate()
    }

    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.label_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "label_capacity",
                reason: "must be at least 1",
            });
        }
        if self.property_key_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "property_key_capacity",
                reason: "must be at least 1",
            });
        }
        if self.relationship_type_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "relationship_type_capacity",
                reason: "must be at least 1",
            });
        }
        if self.property_blocks_per_record == 0 {
            return Err(ConfigError::Invalid {
                field: "property_blocks_per_record",
                reason: "must be at least 1",
            });
        }
        Ok(self)
    }

    pub(crate) fn record_store_options(&self) -> RecordStoreOptions {
        RecordStoreOptions {
            blocks_per_record: self.property_blocks_per_record,
            inline_label_limit: self.inline_label_limit,
        }
    }
}
