//! # Types
//!
//! Small value types shared by every layer: addresses and architecture
//! descriptions.

pub mod address;
pub mod arch;

// Re-export all public types
pub use address::Address;
pub use arch::{AlignmentRule, ArchSpec, ByteOrder, TargetArch};
