//! # kscope-core
//!
//! Typed memory object model and intrusive container traversal for kernel
//! memory images.
//!
//! This crate turns raw bytes from a memory image into typed values using
//! the kernel's debug information, including:
//! - Architecture context (pointer size, byte order, struct padding)
//! - Symbol and type resolution with late-arriving debug information
//! - Typed values with field, index, dereference and per-CPU navigation
//! - Verified walks over `list_head` lists and red-black trees
//!
//! ## Memory and debug information
//!
//! The image is reached through [`memory::MemorySource`] and described by
//! [`debuginfo::DebugInfo`]. Both are traits: dump formats and debug-info
//! formats plug in from outside. [`debuginfo::DwarfDebugInfo`] reads ELF +
//! DWARF through `object` and `gimli`.
//!
//! ## Trust model
//!
//! Image memory is untrusted. Walks check every back-link they follow and
//! stop at the first violation with the offending address; nothing is
//! skipped or repaired.

pub mod catalog;
pub mod config;
pub mod context;
pub mod debuginfo;
pub mod error;
pub mod layout;
pub mod memory;
pub mod percpu;
pub mod prelude;
pub mod session;
pub mod types;
pub mod value;
pub mod walk;

// Re-export commonly used types
pub use catalog::SymbolTypeCatalog;
pub use context::ArchitectureContext;
pub use error::{KscopeError, KscopeResult};
pub use session::Session;
pub use types::Address;
pub use value::TypedValue;
