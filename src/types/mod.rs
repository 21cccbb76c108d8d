//! Identifier newtypes and the error taxonomy shared by every layer of the kernel.

#![forbid(unsafe_code)]

use std::fmt;

use thiserror::Error;

use crate::kernel::{ConfigError, TxState};
use crate::storage::index::IndexState;
use crate::storage::schema::IndexDescriptor;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(pub u64);
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RelId(pub u64);
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct LabelId(pub u32);
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TypeId(pub u32);
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PropId(pub u32);
/// Identifier of a committed schema rule (index, constraint index or constraint).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RuleId(pub u64);
/// Identifier of a property record inside a property chain.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PropRecordId(pub u64);
/// Identifier of an overflow (dynamic) label record.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct DynRecordId(pub u64);

/// Kind of entity an identifier refers to, used to tag lookup failures.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum EntityKind {
    Node,
    Relationship,
    Graph,
}

/// Token namespace.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum TokenKind {
    Label,
    PropertyKey,
    RelationshipType,
}

/// Why a write routed to the store-backed layer was refused.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Rejection {
    /// The store can only be changed by committing a transaction.
    UseTransaction,
    /// Only the auxiliary store-property channel may change stored properties.
    UseAuxiliary,
    /// The call is answered by a layer above and must never arrive here.
    NotReachable,
}

impl Rejection {
    pub fn message(self) -> &'static str {
        match self {
            Rejection::UseTransaction => {
                "the storage layer can not be written to directly, you have to go through a transaction"
            }
            Rejection::UseAuxiliary => {
                "this must not be called directly, use the auxiliary store operations instead"
            }
            Rejection::NotReachable => "this call should not reach all the way to the store",
        }
    }
}

/// Failures raised by the record/schema store adapters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("invalid {kind} record {id}")]
    InvalidRecord { kind: EntityKind, id: u64 },
    #[error("corruption: {0}")]
    Corruption(&'static str),
    #[error("id capacity exceeded for {0} tokens")]
    IdCapacityExceeded(TokenKind),
}

/// Error type returned by every kernel operation.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{kind} token with id {id} not found")]
    TokenNotFound { kind: TokenKind, id: u32 },
    #[error("too many labels: {0}")]
    TooManyLabels(#[source] StorageError),
    #[error("no {what} found for label {label} and property key {prop}")]
    SchemaRuleNotFound {
        what: &'static str,
        label: LabelId,
        prop: PropId,
    },
    #[error("index {0} not found")]
    IndexNotFound(IndexDescriptor),
    #[error("no index proxy registered for schema rule {0}")]
    IndexProxyNotFound(RuleId),
    #[error("index for rule {rule} is {state}, not online")]
    IndexNotOnline { rule: RuleId, state: IndexState },
    #[error("population of index {descriptor} failed: {failure}")]
    IndexPopulationFailed {
        descriptor: IndexDescriptor,
        failure: String,
    },
    #[error("{kind} {id} not found")]
    EntityNotFound { kind: EntityKind, id: u64 },
    #[error("unsupported operation {op}: {}", rejection.message())]
    Unsupported {
        op: &'static str,
        rejection: Rejection,
    },
    #[error("invalid transaction type for {requested} statement: {reason}")]
    InvalidTransactionType {
        requested: &'static str,
        reason: &'static str,
    },
    #[error("transaction is {state}, statements can only be used while it is open")]
    TransactionNotOpen { state: TxState },
    #[error("transaction failure: {0}")]
    TransactionFailure(String),
    #[error("label {label} already has an index on property key {prop}")]
    AlreadyIndexed { label: LabelId, prop: PropId },
    #[error("label {label} already has a uniqueness constraint on property key {prop}")]
    AlreadyConstrained { label: LabelId, prop: PropId },
    #[error("no uniqueness constraint on label {label} and property key {prop}")]
    ConstraintNotFound { label: LabelId, prop: PropId },
    #[error("could not create uniqueness constraint on label {label} and property key {prop}: {reason}")]
    ConstraintCreationFailed {
        label: LabelId,
        prop: PropId,
        reason: String,
    },
    #[error("node {node} violates uniqueness of index {descriptor}, value already held by node {existing}")]
    UniquenessViolation {
        descriptor: IndexDescriptor,
        node: NodeId,
        existing: NodeId,
    },
    #[error("legacy transaction bridge misuse: {0}")]
    LegacyBridge(&'static str),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl KernelError {
    /// Returns `true` when the error is a refused direct write rather than a lookup failure.
    pub fn is_rejection(&self) -> bool {
        matches!(self, KernelError::Unsupported { .. })
    }

    pub(crate) fn unsupported(op: &'static str, rejection: Rejection) -> Self {
        KernelError::Unsupported { op, rejection }
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PropId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Node => "node",
            EntityKind::Relationship => "relationship",
            EntityKind::Graph => "graph",
        })
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TokenKind::Label => "label",
            TokenKind::PropertyKey => "property key",
            TokenKind::RelationshipType => "relationship type",
        })
    }
}

impl From<u32> for LabelId {
    fn from(value: u32) -> Self {
        LabelId(value)
    }
}

impl From<LabelId> for u32 {
    fn from(value: LabelId) -> Self {
        value.0
    }
}

impl From<u32> for TypeId {
    fn from(value: u32) -> Self {
        TypeId(value)
    }
}

impl From<TypeId> for u32 {
    fn from(value: TypeId) -> Self {
        value.0
    }
}

impl From<u32> for PropId {
    fn from(value: u32) -> Self {
        PropId(value)
    }
}

impl From<PropId> for u32 {
    fn from(value: PropId) -> Self {
        value.0
    }
}
