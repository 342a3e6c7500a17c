//! Target architecture descriptions.
//!
//! These describe the *inspected* kernel, never the machine kscope runs on.
//! Nothing in this module consults `cfg!(target_arch)`.

use std::fmt;

use gimli::RunTimeEndian;

/// Architecture of a kernel memory image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetArch
{
    /// 64-bit x86 (Intel/AMD)
    X86_64,
    /// 32-bit x86
    X86,
    /// 64-bit ARM
    Aarch64,
    /// 32-bit ARM
    Arm,
    /// 64-bit big-endian POWER
    Ppc64,
    /// 64-bit little-endian POWER
    Ppc64le,
    /// IBM Z
    S390x,
}

impl TargetArch
{
    /// Native pointer width in bytes.
    #[must_use]
    pub const fn pointer_size(self) -> u8
    {
        match self {
            TargetArch::X86 | TargetArch::Arm => 4,
            TargetArch::X86_64 | TargetArch::Aarch64 | TargetArch::Ppc64 | TargetArch::Ppc64le | TargetArch::S390x => 8,
        }
    }

    /// Native byte order.
    #[must_use]
    pub const fn byte_order(self) -> ByteOrder
    {
        match self {
            TargetArch::Ppc64 | TargetArch::S390x => ByteOrder::Big,
            _ => ByteOrder::Little,
        }
    }

    /// Map an `object` file architecture (and its endianness) to a target.
    ///
    /// Returns `None` for architectures kscope has no layout rules for.
    #[must_use]
    pub fn from_object(arch: object::Architecture, little_endian: bool) -> Option<Self>
    {
        match arch {
            object::Architecture::X86_64 => Some(TargetArch::X86_64),
            object::Architecture::I386 => Some(TargetArch::X86),
            object::Architecture::Aarch64 => Some(TargetArch::Aarch64),
            object::Architecture::Arm => Some(TargetArch::Arm),
            object::Architecture::PowerPc64 if little_endian => Some(TargetArch::Ppc64le),
            object::Architecture::PowerPc64 => Some(TargetArch::Ppc64),
            object::Architecture::S390x => Some(TargetArch::S390x),
            _ => None,
        }
    }
}

impl fmt::Display for TargetArch
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            TargetArch::X86_64 => "x86_64",
            TargetArch::X86 => "i386",
            TargetArch::Aarch64 => "aarch64",
            TargetArch::Arm => "arm",
            TargetArch::Ppc64 => "ppc64",
            TargetArch::Ppc64le => "ppc64le",
            TargetArch::S390x => "s390x",
        };
        write!(f, "{name}")
    }
}

/// Byte order of multi-byte values in the memory image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder
{
    /// Least significant byte first
    Little,
    /// Most significant byte first
    Big,
}

impl From<ByteOrder> for RunTimeEndian
{
    fn from(order: ByteOrder) -> Self
    {
        match order {
            ByteOrder::Little => RunTimeEndian::Little,
            ByteOrder::Big => RunTimeEndian::Big,
        }
    }
}

impl fmt::Display for ByteOrder
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            ByteOrder::Little => write!(f, "little-endian"),
            ByteOrder::Big => write!(f, "big-endian"),
        }
    }
}

/// How struct members are padded when a layout is computed locally
///
/// Layouts read from DWARF carry explicit offsets and ignore this rule; it
/// applies to descriptors synthesised with `StructBuilder` (overrides,
/// synthetic images).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlignmentRule
{
    /// Each member is aligned to its natural alignment, capped at `max_align`
    Natural
    {
        /// Largest alignment the ABI ever requires
        max_align: u8,
    },
    /// No padding at all (`__attribute__((packed))`)
    Packed,
}

impl AlignmentRule
{
    /// Alignment applied to a member whose natural alignment is `natural`.
    #[must_use]
    pub fn align_for(self, natural: u64) -> u64
    {
        match self {
            AlignmentRule::Natural { max_align } => natural.clamp(1, u64::from(max_align)),
            AlignmentRule::Packed => 1,
        }
    }
}

/// The architecture facts a memory source or debug catalog reports about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArchSpec
{
    /// Architecture family
    pub arch: TargetArch,
    /// Pointer width in bytes
    pub pointer_size: u8,
    /// Byte order
    pub byte_order: ByteOrder,
}

impl ArchSpec
{
    /// The architecture's native pointer width and byte order.
    #[must_use]
    pub const fn native(arch: TargetArch) -> Self
    {
        Self {
            arch,
            pointer_size: arch.pointer_size(),
            byte_order: arch.byte_order(),
        }
    }
}

impl From<TargetArch> for ArchSpec
{
    fn from(arch: TargetArch) -> Self
    {
        ArchSpec::native(arch)
    }
}

impl fmt::Display for ArchSpec
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{} ({}-bit, {})", self.arch, u32::from(self.pointer_size) * 8, self.byte_order)
    }
}
