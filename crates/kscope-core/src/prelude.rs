//! Common module for library exports

pub use crate::catalog::{EntryState, Resolution, SymbolEntry, SymbolTypeCatalog, TypeEntry};
pub use crate::config::TraversalConfig;
pub use crate::context::ArchitectureContext;
pub use crate::debuginfo::{DebugInfo, DwarfDebugInfo, StaticDebugInfo, SymbolInfo};
pub use crate::error::{EntryKind, KscopeError, KscopeResult, ListCorruption, TreeCorruption};
pub use crate::layout::{ScalarKind, StructBuilder, Type, TypeKind, TypeTable, TypeTableBuilder};
pub use crate::memory::{MemorySource, ReadFailure, SparseMemory, TranslationFailure};
pub use crate::percpu::{PerCpuTable, PerCpuVariable};
pub use crate::session::Session;
pub use crate::types::{AlignmentRule, Address, ArchSpec, ByteOrder, TargetArch};
pub use crate::value::{Scalar, Target, TypedValue};
pub use crate::walk::{KlistWalker, LinkCheck, ListWalker, TreeOrder, TreeWalker, WalkState};
