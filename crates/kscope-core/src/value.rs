//! # Typed Values
//!
//! A [`TypedValue`] pairs a location (an address in the image, or bytes held
//! in hand) with a [`Type`]. Navigation (`field`, `index`, `dereference`)
//! only computes new locations; bytes are read from the [`MemorySource`]
//! when a scalar is actually requested, and re-read on every request.
//!
//! Values borrow their session's context and memory source, so they cannot
//! outlive the session that produced them.

use std::fmt;

use smallvec::SmallVec;

use crate::context::ArchitectureContext;
use crate::error::{KscopeError, KscopeResult};
use crate::layout::{BitRange, ScalarKind, Type, TypeKind};
use crate::memory::{MemorySource, ReadFailure};
use crate::percpu::PerCpuTable;
use crate::types::{Address, ByteOrder};

/// Everything a value needs to decode itself: the session's context, its
/// memory source and its per-CPU table
#[derive(Clone, Copy)]
pub struct Target<'s>
{
    context: &'s ArchitectureContext,
    memory: &'s dyn MemorySource,
    percpu: &'s PerCpuTable,
}

impl fmt::Debug for Target<'_>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Target")
            .field("session", &self.context.session_id())
            .field("arch", &self.context.spec())
            .field("nr_cpus", &self.percpu.nr_cpus())
            .finish_non_exhaustive()
    }
}

impl<'s> Target<'s>
{
    #[must_use]
    pub fn new(context: &'s ArchitectureContext, memory: &'s dyn MemorySource, percpu: &'s PerCpuTable) -> Self
    {
        Self { context, memory, percpu }
    }

    #[must_use]
    pub fn context(&self) -> &'s ArchitectureContext
    {
        self.context
    }

    #[must_use]
    pub fn memory(&self) -> &'s dyn MemorySource
    {
        self.memory
    }

    #[must_use]
    pub fn percpu(&self) -> &'s PerCpuTable
    {
        self.percpu
    }

    /// Read through the memory source, mapping failures to
    /// [`KscopeError::UnreadableMemory`].
    ///
    /// ## Errors
    ///
    /// [`KscopeError::UnreadableMemory`] when the source cannot supply
    /// exactly `length` bytes.
    pub fn read(&self, address: Address, length: usize) -> KscopeResult<Vec<u8>>
    {
        let bytes = self
            .memory
            .read(address, length)
            .map_err(|source| KscopeError::UnreadableMemory { address, length, source })?;
        if bytes.len() != length {
            return Err(KscopeError::UnreadableMemory {
                address,
                length,
                source: ReadFailure::Truncated {
                    available: bytes.len(),
                    requested: length,
                },
            });
        }
        Ok(bytes)
    }

    /// Read one pointer.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::UnreadableMemory`] when the read fails.
    pub fn read_pointer(&self, address: Address) -> KscopeResult<Address>
    {
        let bytes = self.read(address, usize::from(self.context.pointer_size()))?;
        self.context.read_pointer(&bytes)
    }
}

/// Decoded scalar contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scalar
{
    Unsigned(u64),
    Signed(i64),
    Bool(bool),
    /// Floating point or odd-sized data, undecoded
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
enum Location
{
    Memory(Address),
    /// Bytes held in hand; may extend past the type's size when sliced out
    /// of a larger immediate (bit-fields read past their declared type)
    Immediate(SmallVec<[u8; 16]>),
}

#[derive(Debug, Clone, Copy)]
struct PerCpuOrigin
{
    base: Address,
    offset: u64,
}

fn to_len(size: u64) -> KscopeResult<usize>
{
    usize::try_from(size).map_err(|_| KscopeError::InvalidArgument(format!("size {size} exceeds the address space")))
}

/// A typed view over image memory
#[derive(Clone)]
pub struct TypedValue<'s>
{
    target: Target<'s>,
    ty: Type,
    location: Location,
    bits: Option<BitRange>,
    percpu: Option<PerCpuOrigin>,
}

impl fmt::Debug for TypedValue<'_>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let mut debug = f.debug_struct("TypedValue");
        debug.field("type", &self.ty.name());
        match &self.location {
            Location::Memory(address) => debug.field("address", address),
            Location::Immediate(bytes) => debug.field("bytes", bytes),
        };
        if let Some(origin) = &self.percpu {
            debug.field("percpu_base", &origin.base);
        }
        debug.finish()
    }
}

impl<'s> TypedValue<'s>
{
    /// The object of type `ty` at `address`.
    #[must_use]
    pub fn at(target: Target<'s>, address: Address, ty: Type) -> Self
    {
        Self {
            target,
            ty,
            location: Location::Memory(address),
            bits: None,
            percpu: None,
        }
    }

    /// A value built from bytes already in hand.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::InvalidArgument`] when `bytes` is shorter than the type.
    pub fn immediate(target: Target<'s>, ty: Type, bytes: &[u8]) -> KscopeResult<Self>
    {
        if (bytes.len() as u64) < ty.size() {
            return Err(KscopeError::InvalidArgument(format!(
                "{} needs {} bytes, got {}",
                ty.name(),
                ty.size(),
                bytes.len()
            )));
        }
        Ok(Self {
            target,
            ty,
            location: Location::Immediate(SmallVec::from_slice(bytes)),
            bits: None,
            percpu: None,
        })
    }

    pub(crate) fn per_cpu_template(target: Target<'s>, address: Address, ty: Type) -> Self
    {
        Self {
            percpu: Some(PerCpuOrigin {
                base: address,
                offset: 0,
            }),
            ..Self::at(target, address, ty)
        }
    }

    #[must_use]
    pub fn ty(&self) -> &Type
    {
        &self.ty
    }

    #[must_use]
    pub fn target(&self) -> Target<'s>
    {
        self.target
    }

    /// Where the value lives; `None` for immediates.
    #[must_use]
    pub fn address(&self) -> Option<Address>
    {
        match self.location {
            Location::Memory(address) => Some(address),
            Location::Immediate(_) => None,
        }
    }

    /// Whether the value is (part of) a per-CPU template.
    #[must_use]
    pub fn is_per_cpu(&self) -> bool
    {
        self.percpu.is_some()
    }

    fn context(&self) -> &'s ArchitectureContext
    {
        self.target.context
    }

    /// A child located `offset` bytes in, keeping the per-CPU origin.
    fn child(&self, offset: u64, ty: Type, bits: Option<BitRange>) -> KscopeResult<Self>
    {
        let location = match &self.location {
            Location::Memory(address) => Location::Memory(*address + offset),
            Location::Immediate(bytes) => {
                let start = to_len(offset)?;
                let tail = bytes.get(start..).ok_or_else(|| {
                    KscopeError::InvalidArgument(format!("offset {offset} outside immediate of {} bytes", bytes.len()))
                })?;
                Location::Immediate(SmallVec::from_slice(tail))
            }
        };
        Ok(Self {
            target: self.target,
            ty,
            location,
            bits,
            percpu: self.percpu.map(|origin| PerCpuOrigin {
                base: origin.base,
                offset: origin.offset + offset,
            }),
        })
    }

    fn read_location(&self, length: usize) -> KscopeResult<Vec<u8>>
    {
        match &self.location {
            Location::Memory(address) => self.target.read(*address, length),
            Location::Immediate(bytes) => bytes.get(..length).map(<[u8]>::to_vec).ok_or_else(|| {
                KscopeError::InvalidArgument(format!("immediate holds {} bytes, {length} needed", bytes.len()))
            }),
        }
    }

    /// The value's raw bytes.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::UnreadableMemory`] when the read fails.
    pub fn read_bytes(&self) -> KscopeResult<Vec<u8>>
    {
        self.read_location(to_len(self.ty.size())?)
    }

    /// The aggregate to take members from: the value itself, or its pointee.
    fn aggregate(&self, operation: &'static str) -> KscopeResult<Self>
    {
        if self.ty.is_aggregate() {
            return Ok(self.clone());
        }
        if self.ty.pointee().is_some_and(|pointee| pointee.is_aggregate()) {
            return self.dereference();
        }
        Err(KscopeError::InvalidKind {
            operation,
            found: self.ty.name(),
        })
    }

    /// A struct or union member; anonymous members are searched too.
    ///
    /// Pointers to aggregates are dereferenced first.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::InvalidKind`] on non-aggregates,
    /// [`KscopeError::NoSuchField`] for unknown members.
    pub fn field(&self, name: &str) -> KscopeResult<Self>
    {
        let base = self.aggregate("access a member of")?;
        let found = base.ty.find_field(name).ok_or_else(|| KscopeError::NoSuchField {
            type_name: base.ty.name(),
            field: name.to_string(),
        })?;
        base.child(found.offset, found.ty, found.bits)
    }

    /// A nested member by dotted path (`"se.run_node"`).
    ///
    /// ## Errors
    ///
    /// As [`field`](Self::field), for whichever step fails.
    pub fn field_path(&self, path: &str) -> KscopeResult<Self>
    {
        let base = self.aggregate("access a member of")?;
        let found = base.ty.field_path(path)?;
        base.child(found.offset, found.ty, found.bits)
    }

    /// Whether the (pointed-to) aggregate has a member called `name`.
    #[must_use]
    pub fn has_field(&self, name: &str) -> bool
    {
        let ty = if self.ty.is_aggregate() {
            Some(self.ty.clone())
        } else {
            self.ty.pointee()
        };
        ty.is_some_and(|ty| ty.find_field(name).is_some())
    }

    /// The first of `names` the aggregate has, for members renamed across
    /// kernel versions.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::NoSuchField`] when none is present.
    pub fn first_field_of<'n>(&self, names: &[&'n str]) -> KscopeResult<&'n str>
    {
        names
            .iter()
            .copied()
            .find(|name| self.has_field(name))
            .ok_or_else(|| KscopeError::NoSuchField {
                type_name: self.ty.name(),
                field: names.join("|"),
            })
    }

    /// Array element or pointer arithmetic.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::IndexOutOfRange`] past a fixed array's end,
    /// [`KscopeError::InvalidKind`] on anything but arrays and data pointers.
    pub fn index(&self, index: u64) -> KscopeResult<Self>
    {
        if let Some((element, count)) = self.ty.element() {
            if let Some(count) = count {
                if index >= count {
                    return Err(KscopeError::IndexOutOfRange { index, count });
                }
            }
            let offset = index.saturating_mul(element.size());
            return self.child(offset, element, None);
        }
        if let Some(pointee) = self.ty.pointee() {
            let base = self.as_address()?;
            let address = base + index.wrapping_mul(pointee.size());
            return Ok(Self::at(self.target, address, pointee));
        }
        Err(KscopeError::InvalidKind {
            operation: "index",
            found: self.ty.name(),
        })
    }

    /// Number of elements of an array (zero for flexible arrays).
    ///
    /// ## Errors
    ///
    /// [`KscopeError::InvalidKind`] on non-arrays.
    pub fn array_len(&self) -> KscopeResult<u64>
    {
        match self.ty.element() {
            Some((_, count)) => Ok(count.unwrap_or(0)),
            None => Err(KscopeError::InvalidKind {
                operation: "take the length of",
                found: self.ty.name(),
            }),
        }
    }

    /// Follow a data pointer.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::InvalidKind`] on non-pointers and `void *`,
    /// [`KscopeError::NullPointer`] for null, [`KscopeError::UnreadableMemory`]
    /// when the pointer itself cannot be read.
    pub fn dereference(&self) -> KscopeResult<Self>
    {
        let Some(pointee) = self.ty.pointee() else {
            return Err(KscopeError::InvalidKind {
                operation: "dereference",
                found: self.ty.name(),
            });
        };
        let address = self.as_address()?;
        if address.is_null() {
            return Err(KscopeError::NullPointer {
                address: self.address().unwrap_or_default(),
                type_name: self.ty.name(),
            });
        }
        Ok(Self::at(self.target, address, pointee))
    }

    /// A pointer to this value, as an immediate.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::InvalidKind`] for immediates, which have no address.
    pub fn address_of(&self) -> KscopeResult<Self>
    {
        let Some(address) = self.address() else {
            return Err(KscopeError::InvalidKind {
                operation: "take the address of",
                found: self.ty.name(),
            });
        };
        let ty = self.ty.pointer_to(self.context().pointer_size());
        let bytes = self.context().encode_pointer(address);
        Self::immediate(self.target, ty, &bytes)
    }

    /// Reinterpret the same location as another type.
    #[must_use]
    pub fn cast(&self, ty: Type) -> Self
    {
        Self {
            target: self.target,
            ty,
            location: self.location.clone(),
            bits: None,
            percpu: self.percpu,
        }
    }

    /// The object of type `container` that embeds this value at
    /// `member_path` (the kernel's `container_of`).
    ///
    /// Accepts the embedded member itself or a pointer to it.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::NoSuchField`] when the container has no such member,
    /// [`KscopeError::InvalidKind`] for an immediate that is not a pointer,
    /// [`KscopeError::InvalidArgument`] when the subtraction underflows.
    pub fn container_of(&self, container: &Type, member_path: &str) -> KscopeResult<Self>
    {
        let member = container.field_path(member_path)?;
        let address = if self.ty.is_pointer() {
            self.as_address()?
        } else {
            self.address().ok_or_else(|| KscopeError::InvalidKind {
                operation: "find the container of",
                found: self.ty.name(),
            })?
        };
        let base = address.checked_sub(member.offset).ok_or_else(|| {
            KscopeError::InvalidArgument(format!(
                "{address} cannot be member '{member_path}' of {} (offset {})",
                container.name(),
                member.offset
            ))
        })?;
        Ok(Self::at(self.target, base, container.clone()))
    }

    /// Decode the value as a scalar.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::InvalidKind`] for aggregates and arrays,
    /// [`KscopeError::UnreadableMemory`] when the read fails.
    pub fn scalar_value(&self) -> KscopeResult<Scalar>
    {
        let (kind, signed) = match self.ty.kind() {
            TypeKind::Scalar(kind) => (*kind, matches!(kind, ScalarKind::Signed)),
            TypeKind::Pointer { .. } | TypeKind::FunctionPointer => (ScalarKind::Unsigned, false),
            TypeKind::Enum { signed, .. } => (
                if *signed { ScalarKind::Signed } else { ScalarKind::Unsigned },
                *signed,
            ),
            TypeKind::Struct { .. } | TypeKind::Union { .. } | TypeKind::Array { .. } => {
                return Err(KscopeError::InvalidKind {
                    operation: "read a scalar from",
                    found: self.ty.name(),
                });
            }
        };

        if let Some(bits) = self.bits {
            let raw = self.read_bit_field(bits)?;
            return Ok(match kind {
                ScalarKind::Bool => Scalar::Bool(raw != 0),
                _ if signed => Scalar::Signed(sign_extend(raw, bits.width)),
                _ => Scalar::Unsigned(raw),
            });
        }

        let bytes = self.read_bytes()?;
        if !matches!(bytes.len(), 1 | 2 | 4 | 8) || kind == ScalarKind::Float {
            return Ok(Scalar::Bytes(bytes));
        }
        let context = self.context();
        Ok(match kind {
            ScalarKind::Signed => Scalar::Signed(context.read_int(&bytes)?),
            ScalarKind::Bool => Scalar::Bool(context.read_uint(&bytes)? != 0),
            _ => Scalar::Unsigned(context.read_uint(&bytes)?),
        })
    }

    fn read_bit_field(&self, bits: BitRange) -> KscopeResult<u64>
    {
        let span = (usize::from(bits.offset) + usize::from(bits.width)).div_ceil(8);
        let bytes = self.read_location(span)?;
        let raw = match self.context().byte_order() {
            ByteOrder::Little => bytes
                .iter()
                .rev()
                .fold(0u128, |acc, byte| (acc << 8) | u128::from(*byte)),
            ByteOrder::Big => bytes.iter().fold(0u128, |acc, byte| (acc << 8) | u128::from(*byte)),
        };
        let shift = match self.context().byte_order() {
            ByteOrder::Little => u32::from(bits.offset),
            ByteOrder::Big => (span * 8 - usize::from(bits.offset) - usize::from(bits.width)) as u32,
        };
        let mask = if bits.width >= 64 { u128::from(u64::MAX) } else { (1u128 << bits.width) - 1 };
        #[allow(clippy::cast_possible_truncation)]
        Ok(((raw >> shift) & mask) as u64)
    }

    /// The value as an unsigned integer (signed values are reinterpreted).
    ///
    /// ## Errors
    ///
    /// As [`scalar_value`](Self::scalar_value), plus
    /// [`KscopeError::InvalidKind`] for undecodable scalars.
    pub fn as_u64(&self) -> KscopeResult<u64>
    {
        match self.scalar_value()? {
            Scalar::Unsigned(value) => Ok(value),
            #[allow(clippy::cast_sign_loss)]
            Scalar::Signed(value) => Ok(value as u64),
            Scalar::Bool(value) => Ok(u64::from(value)),
            Scalar::Bytes(_) => Err(KscopeError::InvalidKind {
                operation: "read an integer from",
                found: self.ty.name(),
            }),
        }
    }

    /// The value as a signed integer (unsigned values are reinterpreted).
    ///
    /// ## Errors
    ///
    /// As [`as_u64`](Self::as_u64).
    pub fn as_i64(&self) -> KscopeResult<i64>
    {
        match self.scalar_value()? {
            #[allow(clippy::cast_possible_wrap)]
            Scalar::Unsigned(value) => Ok(value as i64),
            Scalar::Signed(value) => Ok(value),
            Scalar::Bool(value) => Ok(i64::from(value)),
            Scalar::Bytes(_) => Err(KscopeError::InvalidKind {
                operation: "read an integer from",
                found: self.ty.name(),
            }),
        }
    }

    /// The value as an address (pointers and integers).
    ///
    /// ## Errors
    ///
    /// As [`as_u64`](Self::as_u64).
    pub fn as_address(&self) -> KscopeResult<Address>
    {
        self.as_u64().map(Address::new)
    }

    /// `cpu`'s instance of this per-CPU value.
    ///
    /// Performs no read when `cpu` is out of range.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::NotPerCpu`] when the value does not come from a per-CPU
    /// variable, [`KscopeError::CpuOutOfRange`] for unknown CPUs.
    pub fn per_cpu(&self, cpu: usize) -> KscopeResult<Self>
    {
        let Some(origin) = self.percpu else {
            return Err(KscopeError::NotPerCpu(self.address().unwrap_or_default()));
        };
        let base = self.target.percpu.instance_address(origin.base, cpu)?;
        Ok(Self {
            target: self.target,
            ty: self.ty.clone(),
            location: Location::Memory(base + origin.offset),
            bits: self.bits,
            percpu: None,
        })
    }

    /// Every CPU's instance, in CPU order.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::NotPerCpu`] as for [`per_cpu`](Self::per_cpu).
    pub fn per_cpu_all(&self) -> KscopeResult<Vec<Self>>
    {
        (0..self.target.percpu.nr_cpus()).map(|cpu| self.per_cpu(cpu)).collect()
    }

    /// Follow a `__percpu` pointer for one CPU: the pointee at the pointer's
    /// value relocated into `cpu`'s area.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::InvalidKind`] on non-pointers,
    /// [`KscopeError::CpuOutOfRange`] for unknown CPUs.
    pub fn per_cpu_ptr(&self, cpu: usize) -> KscopeResult<Self>
    {
        let Some(pointee) = self.ty.pointee() else {
            return Err(KscopeError::InvalidKind {
                operation: "follow a per-CPU pointer of",
                found: self.ty.name(),
            });
        };
        let percpu = self.target.percpu;
        percpu.offset(cpu)?;
        let address = percpu.instance_address(self.as_address()?, cpu)?;
        Ok(Self::at(self.target, address, pointee))
    }
}

fn sign_extend(raw: u64, width: u8) -> i64
{
    if width == 0 || width >= 64 {
        #[allow(clippy::cast_possible_wrap)]
        return raw as i64;
    }
    let shift = 64 - u32::from(width);
    #[allow(clippy::cast_possible_wrap)]
    let value = ((raw << shift) as i64) >> shift;
    value
}
