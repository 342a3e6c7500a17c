//! # Architecture Context
//!
//! Pins pointer width, byte order and struct padding for the lifetime of one
//! session. Every byte-level decode in the crate goes through the helpers on
//! [`ArchitectureContext`], so nothing ever falls back to the host machine's
//! conventions.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use gimli::{Endianity, RunTimeEndian};
use tracing::debug;

use crate::debuginfo::DebugInfo;
use crate::error::{KscopeError, KscopeResult};
use crate::memory::MemorySource;
use crate::types::{Address, AlignmentRule, ArchSpec, ByteOrder, TargetArch};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Identifies one attached session in diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId
{
    fn next() -> Self
    {
        SessionId(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric identifier
    #[must_use]
    pub const fn as_u64(self) -> u64
    {
        self.0
    }
}

impl fmt::Display for SessionId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "session#{}", self.0)
    }
}

/// Architecture parameters of the inspected image, fixed for one session
///
/// Constructed only through [`ArchitectureContext::establish`] (or
/// [`ArchitectureContext::establish_with`] for synthetic images) and never
/// mutated afterwards.
#[derive(Debug)]
pub struct ArchitectureContext
{
    spec: ArchSpec,
    alignment: AlignmentRule,
    session: SessionId,
}

impl ArchitectureContext
{
    /// Derive the context from the memory source and the debug information.
    ///
    /// The memory source's report wins when it has one; the debug
    /// information must then agree on architecture, pointer width and byte
    /// order. A raw window that does not know its architecture adopts the
    /// debug information's.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::IncompatibleHost`] when the two disagree.
    pub fn establish(memory: &dyn MemorySource, debug_info: &dyn DebugInfo) -> KscopeResult<Self>
    {
        let described = debug_info.architecture();
        let spec = match memory.architecture() {
            Some(image) if image != described => {
                return Err(KscopeError::IncompatibleHost {
                    expected: image.to_string(),
                    found: described.to_string(),
                });
            }
            Some(image) => image,
            None => described,
        };

        let context = Self::establish_with(spec, default_alignment(spec.arch));
        debug!(
            session = %context.session,
            arch = %spec,
            module = debug_info.module_name(),
            "established architecture context"
        );
        Ok(context)
    }

    /// Pin the parameters explicitly.
    #[must_use]
    pub fn establish_with(spec: ArchSpec, alignment: AlignmentRule) -> Self
    {
        Self {
            spec,
            alignment,
            session: SessionId::next(),
        }
    }

    /// Pointer width in bytes.
    #[must_use]
    pub fn pointer_size(&self) -> u8
    {
        self.spec.pointer_size
    }

    #[must_use]
    pub fn byte_order(&self) -> ByteOrder
    {
        self.spec.byte_order
    }

    /// Padding rule for locally computed struct layouts.
    #[must_use]
    pub fn struct_padding_rule(&self) -> AlignmentRule
    {
        self.alignment
    }

    #[must_use]
    pub fn arch(&self) -> TargetArch
    {
        self.spec.arch
    }

    #[must_use]
    pub fn spec(&self) -> ArchSpec
    {
        self.spec
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId
    {
        self.session
    }

    fn endian(&self) -> RunTimeEndian
    {
        self.spec.byte_order.into()
    }

    /// Decode an unsigned integer of 1, 2, 4 or 8 bytes.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::InvalidArgument`] for any other width.
    pub fn read_uint(&self, bytes: &[u8]) -> KscopeResult<u64>
    {
        let endian = self.endian();
        match bytes.len() {
            1 => Ok(u64::from(bytes[0])),
            2 => Ok(u64::from(endian.read_u16(bytes))),
            4 => Ok(u64::from(endian.read_u32(bytes))),
            8 => Ok(endian.read_u64(bytes)),
            n => Err(KscopeError::InvalidArgument(format!("cannot decode a {n}-byte integer"))),
        }
    }

    /// Decode a two's-complement signed integer of 1, 2, 4 or 8 bytes.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::InvalidArgument`] for any other width.
    pub fn read_int(&self, bytes: &[u8]) -> KscopeResult<i64>
    {
        let endian = self.endian();
        match bytes.len() {
            1 => Ok(i64::from(i8::from_ne_bytes([bytes[0]]))),
            2 => Ok(i64::from(endian.read_i16(bytes))),
            4 => Ok(i64::from(endian.read_i32(bytes))),
            8 => Ok(endian.read_i64(bytes)),
            n => Err(KscopeError::InvalidArgument(format!("cannot decode a {n}-byte integer"))),
        }
    }

    /// Decode a pointer; `bytes` must be exactly pointer-sized.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::InvalidArgument`] when the slice has the wrong width.
    pub fn read_pointer(&self, bytes: &[u8]) -> KscopeResult<Address>
    {
        if bytes.len() != usize::from(self.pointer_size()) {
            return Err(KscopeError::InvalidArgument(format!(
                "pointer is {} bytes on {}, got {}",
                self.pointer_size(),
                self.spec,
                bytes.len()
            )));
        }
        self.read_uint(bytes).map(Address::new)
    }

    /// Encode an address as the image would store a pointer.
    #[must_use]
    pub fn encode_pointer(&self, address: Address) -> Vec<u8>
    {
        let mut buf = vec![0u8; usize::from(self.pointer_size())];
        if self.pointer_size() == 4 {
            // Truncation matches what a 32-bit image stores.
            #[allow(clippy::cast_possible_truncation)]
            self.endian().write_u32(&mut buf, address.value() as u32);
        } else {
            self.endian().write_u64(&mut buf, address.value());
        }
        buf
    }
}

/// Padding the kernel ABI uses on each architecture.
fn default_alignment(arch: TargetArch) -> AlignmentRule
{
    match arch {
        // i386 caps 8-byte members at 4-byte alignment inside structs.
        TargetArch::X86 => AlignmentRule::Natural { max_align: 4 },
        _ => AlignmentRule::Natural { max_align: 8 },
    }
}
