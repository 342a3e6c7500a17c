//! # Error Types
//!
//! General error handling for the memory object model and traversal engine.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages.

use std::fmt;

use thiserror::Error;

use crate::memory::{ReadFailure, TranslationFailure};
use crate::types::Address;

/// Which catalog namespace a name belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind
{
    /// A global symbol (variable or function).
    Symbol,
    /// A named type (`struct foo`, `unsigned long`, a typedef, ...).
    Type,
}

impl fmt::Display for EntryKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            EntryKind::Symbol => write!(f, "symbol"),
            EntryKind::Type => write!(f, "type"),
        }
    }
}

/// How a doubly linked list broke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListCorruption
{
    /// A `next`/`prev` link was null.
    NullLink,
    /// The node a link points at could not be read.
    UnreadableLink
    {
        /// Where the link pointed.
        target: Address,
    },
    /// `node.next.prev != node` (or the mirrored check in reverse walks).
    BrokenBackLink
    {
        /// The address the back-link should have held.
        expected: Address,
        /// The address it actually held.
        found: Address,
    },
    /// The head itself is at address zero.
    NullHead,
    /// A klist node's `n_klist` names a different klist.
    WrongOwner
    {
        /// The klist being walked.
        expected: Address,
        /// The owner the node records, dead bit cleared.
        found: Address,
    },
}

impl fmt::Display for ListCorruption
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            ListCorruption::NullLink => write!(f, "link pointer is NULL"),
            ListCorruption::UnreadableLink { target } => write!(f, "link points to unreadable memory at {target}"),
            ListCorruption::BrokenBackLink { expected, found } => {
                write!(f, "broken back-link: expected {expected}, found {found}")
            }
            ListCorruption::NullHead => write!(f, "list head is a NULL pointer"),
            ListCorruption::WrongOwner { expected, found } => {
                write!(f, "klist node belongs to {found}, not {expected}")
            }
        }
    }
}

/// How a red-black tree broke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeCorruption
{
    /// The node's parent/color word does not name the node we came from.
    WrongParent
    {
        /// Parent the traversal descended from (zero for the root).
        expected: Address,
        /// Parent recorded in the node.
        found: Address,
    },
    /// The node could not be read.
    UnreadableNode,
    /// The root object itself is at address zero.
    NullRoot,
}

impl fmt::Display for TreeCorruption
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            TreeCorruption::WrongParent { expected, found } => {
                write!(f, "parent mismatch: descended from {expected}, node records {found}")
            }
            TreeCorruption::UnreadableNode => write!(f, "node is unreadable"),
            TreeCorruption::NullRoot => write!(f, "tree root is a NULL pointer"),
        }
    }
}

/// Main error type for the kscope core
///
/// Each variant corresponds to one entry of the failure taxonomy:
///
/// 1. **Session errors**: `IncompatibleHost` (fatal, the session cannot start)
/// 2. **Resolution errors**: `UnresolvedSymbol`, `UnresolvedType` (permanent),
///    `NotYetAvailable` (retryable, may resolve when more debug info loads)
/// 3. **Layout errors**: `NoSuchField`, `IndexOutOfRange`, `InvalidKind`,
///    `CpuOutOfRange`, `NotPerCpu` (caller logic errors against a known layout)
/// 4. **Memory errors**: `UnreadableMemory`, `Untranslatable`, `NullPointer`
/// 5. **Structural errors**: `CorruptList`, `CorruptTree`, `UnterminatedList`,
///    `UnterminatedTree`, always carrying the offending address
/// 6. **Input errors**: `InvalidArgument`, `DebugInfo`, `Io`
#[derive(Error, Debug)]
pub enum KscopeError
{
    /// The debug information does not describe the memory image's architecture
    ///
    /// Raised by `ArchitectureContext::establish` when, for example, a 32-bit
    /// catalog is attached to a 64-bit image. The session cannot start.
    #[error("Incompatible host: memory image is {expected}, debug information is {found}")]
    IncompatibleHost
    {
        /// Architecture reported by the memory source
        expected: String,
        /// Architecture reported by the debug information
        found: String,
    },

    /// No such global exists, and no further debug information will arrive
    #[error("Unresolved symbol: {0}")]
    UnresolvedSymbol(String),

    /// No such type exists, and no further debug information will arrive
    #[error("Unresolved type: {0}")]
    UnresolvedType(String),

    /// The name is not known yet, but a module that may define it has not loaded
    ///
    /// Retry later, or register an `on_resolved` callback.
    #[error("{kind} '{name}' is not available yet")]
    NotYetAvailable
    {
        /// Namespace of the name
        kind: EntryKind,
        /// The requested name
        name: String,
    },

    /// The structure or union has no member with this name
    #[error("No member '{field}' in '{type_name}'")]
    NoSuchField
    {
        /// Name of the aggregate that was searched
        type_name: String,
        /// Requested member (or dotted member path)
        field: String,
    },

    /// Index past the end of a fixed-size array
    #[error("Index {index} out of range for array of {count} elements")]
    IndexOutOfRange
    {
        /// Requested index
        index: u64,
        /// Number of elements in the array
        count: u64,
    },

    /// The operation does not apply to this kind of type
    ///
    /// Examples: `field()` on a scalar, `dereference()` on a struct.
    #[error("Cannot {operation} a value of type '{found}'")]
    InvalidKind
    {
        /// Operation that was attempted
        operation: &'static str,
        /// Name of the type it was attempted on
        found: String,
    },

    /// CPU index outside the per-CPU offset table
    #[error("CPU {cpu} out of range ({nr_cpus} CPUs in offset table)")]
    CpuOutOfRange
    {
        /// Requested CPU
        cpu: usize,
        /// Number of populated CPU offsets
        nr_cpus: usize,
    },

    /// `per_cpu()` was called on a value that is not a per-CPU variable
    #[error("Value at {0} is not a per-CPU variable")]
    NotPerCpu(Address),

    /// The backing memory source could not supply the bytes
    ///
    /// Transient for a live source, permanent for a static dump.
    #[error("Unreadable memory: {length} bytes at {address}: {source}")]
    UnreadableMemory
    {
        /// Start of the failed read
        address: Address,
        /// Requested length
        length: usize,
        /// What the memory source reported
        #[source]
        source: ReadFailure,
    },

    /// The memory source has no physical mapping for a virtual address
    #[error(transparent)]
    Untranslatable(#[from] TranslationFailure),

    /// Dereferenced a null pointer
    #[error("NULL pointer dereference of '{type_name}' at {address}")]
    NullPointer
    {
        /// Address of the pointer object itself (zero for immediates)
        address: Address,
        /// Type of the pointer
        type_name: String,
    },

    /// A linked list violated its structural invariants
    #[error("Corrupt list at {address}: {reason}")]
    CorruptList
    {
        /// The node where the invariant broke
        address: Address,
        /// What exactly went wrong
        reason: ListCorruption,
        /// Underlying read failure, for unreadable links
        #[source]
        source: Option<Box<KscopeError>>,
    },

    /// A red-black tree violated its structural invariants
    #[error("Corrupt tree at {address}: {reason}")]
    CorruptTree
    {
        /// The node where the invariant broke
        address: Address,
        /// What exactly went wrong
        reason: TreeCorruption,
        /// Underlying read failure, for unreadable nodes
        #[source]
        source: Option<Box<KscopeError>>,
    },

    /// A list walk never came back to its head
    #[error("Unterminated list headed at {head}: {detail}")]
    UnterminatedList
    {
        /// The declared head
        head: Address,
        /// The node that was revisited, if a cycle was identified
        cycle_at: Option<Address>,
        /// Nodes visited before giving up
        visited: usize,
        /// Human-readable summary
        detail: String,
    },

    /// A tree walk exceeded its node or depth budget
    #[error("Unterminated tree rooted at {root}: {detail}")]
    UnterminatedTree
    {
        /// The root that was walked
        root: Address,
        /// Nodes visited before giving up
        visited: usize,
        /// Human-readable summary
        detail: String,
    },

    /// Invalid argument passed to a core function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Debug information could not be parsed
    #[error("Debug information error: {0}")]
    DebugInfo(String),

    /// I/O error (reading debug-info files, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KscopeError
{
    /// Whether retrying the same operation later can succeed.
    ///
    /// `NotYetAvailable` resolves once the owning module's debug information
    /// loads; `UnreadableMemory` may succeed again against a live source.
    #[must_use]
    pub fn is_retryable(&self) -> bool
    {
        matches!(self, KscopeError::NotYetAvailable { .. } | KscopeError::UnreadableMemory { .. })
    }

    /// Whether the failure is permanent for the rest of the session.
    #[must_use]
    pub fn is_permanent(&self) -> bool
    {
        !matches!(self, KscopeError::NotYetAvailable { .. })
    }

    /// The address a structural or memory error points at, if any.
    #[must_use]
    pub fn address(&self) -> Option<Address>
    {
        match self {
            KscopeError::UnreadableMemory { address, .. }
            | KscopeError::NullPointer { address, .. }
            | KscopeError::CorruptList { address, .. }
            | KscopeError::CorruptTree { address, .. } => Some(*address),
            KscopeError::UnterminatedList { head, cycle_at, .. } => Some(cycle_at.unwrap_or(*head)),
            KscopeError::UnterminatedTree { root, .. } => Some(*root),
            KscopeError::NotPerCpu(address) => Some(*address),
            KscopeError::Untranslatable(failure) => Some(failure.address),
            _ => None,
        }
    }

    pub(crate) fn corrupt_list(address: Address, reason: ListCorruption) -> Self
    {
        KscopeError::CorruptList {
            address,
            reason,
            source: None,
        }
    }

    pub(crate) fn corrupt_tree(address: Address, reason: TreeCorruption) -> Self
    {
        KscopeError::CorruptTree {
            address,
            reason,
            source: None,
        }
    }
}

/// Convenience type alias for `Result<T, KscopeError>`
///
/// ```rust
/// use kscope_core::error::KscopeResult;
/// fn foo() -> KscopeResult<()>
/// {
///     Ok(())
/// }
/// ```
pub type KscopeResult<T> = std::result::Result<T, KscopeError>;
