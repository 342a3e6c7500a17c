//! # Memory Sources
//!
//! The single read boundary between the object model and the inspected image.
//!
//! Every byte the core interprets passes through [`MemorySource::read`]. A
//! live-memory window and a captured dump are both just implementations of
//! this trait; dump container formats stay outside the core.
//!
//! [`SparseMemory`] is a region-map implementation for synthetic images:
//! fixtures, unit tests, and tools that stitch together memory from other
//! formats.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::types::{Address, ArchSpec, ByteOrder};

/// A read the memory source could not satisfy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadFailure
{
    /// Nothing is mapped at the address
    #[error("address {0} is not mapped")]
    Unmapped(Address),

    /// The read started inside a mapping but ran off its end
    #[error("mapping ends after {available} of {requested} bytes")]
    Truncated
    {
        /// Bytes that were readable
        available: usize,
        /// Bytes that were requested
        requested: usize,
    },

    /// Backend-specific failure (I/O on a dump file, a faulting live read, ...)
    #[error("{0}")]
    Backend(String),
}

/// A virtual address the memory source cannot translate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot translate virtual address {address}: {reason}")]
pub struct TranslationFailure
{
    /// The virtual address
    pub address: Address,
    /// Why translation failed
    pub reason: String,
}

/// Byte-addressable view of kernel memory
///
/// Implementations must be side-effect free from the core's point of view:
/// reading the same address twice may return different bytes (live memory),
/// but reading never changes what the image contains.
pub trait MemorySource
{
    /// Read exactly `length` bytes starting at `address`.
    ///
    /// ## Errors
    ///
    /// Any [`ReadFailure`] when the range is not fully backed.
    fn read(&self, address: Address, length: usize) -> Result<Vec<u8>, ReadFailure>;

    /// Translate a kernel virtual address to a physical one.
    ///
    /// ## Errors
    ///
    /// [`TranslationFailure`] when no mapping covers the address.
    fn translate_virtual(&self, address: Address) -> Result<Address, TranslationFailure>;

    /// Per-CPU base offsets (`__per_cpu_offset[]`), indexed by logical CPU.
    ///
    /// Captured once when a session attaches.
    fn per_cpu_offsets(&self) -> Vec<u64>;

    /// The architecture the image was captured from, when the source knows it.
    ///
    /// Raw memory windows usually do not; dumps carry it in their headers.
    fn architecture(&self) -> Option<ArchSpec>
    {
        None
    }
}

/// A shared source, so the caller can keep a handle (to rewrite a synthetic
/// image, or count its reads) while a session owns another.
impl<M: MemorySource + ?Sized> MemorySource for Rc<M>
{
    fn read(&self, address: Address, length: usize) -> Result<Vec<u8>, ReadFailure>
    {
        (**self).read(address, length)
    }

    fn translate_virtual(&self, address: Address) -> Result<Address, TranslationFailure>
    {
        (**self).translate_virtual(address)
    }

    fn per_cpu_offsets(&self) -> Vec<u64>
    {
        (**self).per_cpu_offsets()
    }

    fn architecture(&self) -> Option<ArchSpec>
    {
        (**self).architecture()
    }
}

/// Region-map memory source for synthetic images
///
/// Writes create or extend mappings on demand; reads outside any mapping fail
/// with [`ReadFailure::Unmapped`]. Interior mutability lets a test rewrite
/// memory while values borrow the session, the way a live image changes
/// underneath the debugger.
///
/// ## Example
///
/// ```rust
/// use kscope_core::memory::{MemorySource, SparseMemory};
/// use kscope_core::types::{Address, ArchSpec, TargetArch};
///
/// let memory = SparseMemory::new(ArchSpec::native(TargetArch::X86_64));
/// memory.write_u64(Address::from(0x1000), 0xdead_0000);
/// assert_eq!(memory.read(Address::from(0x1000), 8).unwrap(), 0xdead_0000u64.to_le_bytes());
/// assert!(memory.read(Address::from(0x2000), 8).is_err());
/// ```
pub struct SparseMemory
{
    spec: ArchSpec,
    regions: RefCell<BTreeMap<u64, Vec<u8>>>,
    per_cpu_offsets: Vec<u64>,
    direct_map: Option<(Address, u64)>,
    report_architecture: bool,
    reads: Cell<usize>,
}

impl fmt::Debug for SparseMemory
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("SparseMemory")
            .field("spec", &self.spec)
            .field("regions", &self.regions.borrow().len())
            .field("per_cpu_offsets", &self.per_cpu_offsets)
            .field("reads", &self.reads.get())
            .finish_non_exhaustive()
    }
}

impl SparseMemory
{
    /// Create an empty image for the given architecture.
    #[must_use]
    pub fn new(spec: ArchSpec) -> Self
    {
        Self {
            spec,
            regions: RefCell::new(BTreeMap::new()),
            per_cpu_offsets: Vec::new(),
            direct_map: None,
            report_architecture: true,
            reads: Cell::new(0),
        }
    }

    /// Set the per-CPU offset table reported to sessions.
    #[must_use]
    pub fn with_per_cpu_offsets(mut self, offsets: Vec<u64>) -> Self
    {
        self.per_cpu_offsets = offsets;
        self
    }

    /// Translate `[virt_base, virt_base + size)` linearly onto physical zero.
    ///
    /// Without a direct map, translation is the identity.
    #[must_use]
    pub fn with_direct_map(mut self, virt_base: Address, size: u64) -> Self
    {
        self.direct_map = Some((virt_base, size));
        self
    }

    /// Behave like a raw window that does not know its architecture.
    #[must_use]
    pub fn without_architecture(mut self) -> Self
    {
        self.report_architecture = false;
        self
    }

    /// Architecture this image encodes values for.
    #[must_use]
    pub fn spec(&self) -> ArchSpec
    {
        self.spec
    }

    /// Number of successful or failed `read` calls so far.
    #[must_use]
    pub fn read_count(&self) -> usize
    {
        self.reads.get()
    }

    /// Map (if needed) and write raw bytes.
    pub fn write_bytes(&self, address: Address, data: &[u8])
    {
        if data.is_empty() {
            return;
        }
        let start = address.value();
        let end = start.saturating_add(data.len() as u64);
        let mut regions = self.regions.borrow_mut();

        // Fast path: the write lands entirely inside one mapping.
        if let Some((&base, region)) = regions.range_mut(..=start).next_back() {
            let region_end = base + region.len() as u64;
            if end <= region_end {
                let offset = usize::try_from(start - base).unwrap_or(usize::MAX);
                region[offset..offset + data.len()].copy_from_slice(data);
                return;
            }
        }

        // Merge every mapping that overlaps or touches [start, end).
        let touching: Vec<u64> = regions
            .iter()
            .filter(|(&base, region)| base <= end && base + region.len() as u64 >= start)
            .map(|(&base, _)| base)
            .collect();
        let mut new_start = start;
        let mut new_end = end;
        for base in &touching {
            let len = regions[base].len() as u64;
            new_start = new_start.min(*base);
            new_end = new_end.max(base + len);
        }
        let size = usize::try_from(new_end - new_start).unwrap_or(usize::MAX);
        let mut merged = vec![0u8; size];
        for base in touching {
            if let Some(old) = regions.remove(&base) {
                let offset = usize::try_from(base - new_start).unwrap_or(usize::MAX);
                merged[offset..offset + old.len()].copy_from_slice(&old);
            }
        }
        let offset = usize::try_from(start - new_start).unwrap_or(usize::MAX);
        merged[offset..offset + data.len()].copy_from_slice(data);
        regions.insert(new_start, merged);
    }

    /// Map `size` zero bytes at `address`, keeping any existing contents.
    pub fn map_zeroed(&self, address: Address, size: usize)
    {
        let existing = self.peek(address, size);
        self.write_bytes(address, &existing.unwrap_or_else(|| vec![0; size]));
    }

    /// Write an unsigned integer of `size` bytes in the image's byte order.
    pub fn write_uint(&self, address: Address, value: u64, size: usize)
    {
        let bytes = match self.spec.byte_order {
            ByteOrder::Little => value.to_le_bytes()[..size].to_vec(),
            ByteOrder::Big => value.to_be_bytes()[8 - size..].to_vec(),
        };
        self.write_bytes(address, &bytes);
    }

    /// Write a 64-bit value in the image's byte order.
    pub fn write_u64(&self, address: Address, value: u64)
    {
        self.write_uint(address, value, 8);
    }

    /// Write a 32-bit value in the image's byte order.
    pub fn write_u32(&self, address: Address, value: u32)
    {
        self.write_uint(address, u64::from(value), 4);
    }

    /// Write a pointer-sized value in the image's byte order.
    pub fn write_pointer(&self, address: Address, target: Address)
    {
        self.write_uint(address, target.value(), usize::from(self.spec.pointer_size));
    }

    /// Remove the mapping that contains `address`, making it unreadable.
    pub fn unmap(&self, address: Address)
    {
        let mut regions = self.regions.borrow_mut();
        let hit = regions
            .range(..=address.value())
            .next_back()
            .filter(|(&base, region)| address.value() < base + region.len() as u64)
            .map(|(&base, _)| base);
        if let Some(base) = hit {
            regions.remove(&base);
        }
    }

    fn peek(&self, address: Address, length: usize) -> Option<Vec<u8>>
    {
        self.copy_out(address, length).ok()
    }

    fn copy_out(&self, address: Address, length: usize) -> Result<Vec<u8>, ReadFailure>
    {
        let regions = self.regions.borrow();
        let mut out = Vec::with_capacity(length);
        let mut cursor = address.value();
        while out.len() < length {
            let Some((&base, region)) = regions.range(..=cursor).next_back() else {
                return Err(Self::miss(address, cursor, out.len(), length));
            };
            let region_end = base + region.len() as u64;
            if cursor >= region_end {
                return Err(Self::miss(address, cursor, out.len(), length));
            }
            let offset = usize::try_from(cursor - base).unwrap_or(usize::MAX);
            let take = (length - out.len()).min(region.len() - offset);
            out.extend_from_slice(&region[offset..offset + take]);
            cursor += take as u64;
        }
        Ok(out)
    }

    fn miss(start: Address, cursor: u64, available: usize, requested: usize) -> ReadFailure
    {
        if cursor == start.value() {
            ReadFailure::Unmapped(start)
        } else {
            ReadFailure::Truncated { available, requested }
        }
    }
}

impl MemorySource for SparseMemory
{
    fn read(&self, address: Address, length: usize) -> Result<Vec<u8>, ReadFailure>
    {
        self.reads.set(self.reads.get() + 1);
        self.copy_out(address, length)
    }

    fn translate_virtual(&self, address: Address) -> Result<Address, TranslationFailure>
    {
        match self.direct_map {
            None => Ok(address),
            Some((base, size)) => {
                let offset = address.value().wrapping_sub(base.value());
                if address >= base && offset < size {
                    Ok(Address::new(offset))
                } else {
                    Err(TranslationFailure {
                        address,
                        reason: format!("outside direct map {base} (+0x{size:x})"),
                    })
                }
            }
        }
    }

    fn per_cpu_offsets(&self) -> Vec<u64>
    {
        self.per_cpu_offsets.clone()
    }

    fn architecture(&self) -> Option<ArchSpec>
    {
        self.report_architecture.then_some(self.spec)
    }
}
