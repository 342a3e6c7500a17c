//! Memory address type.

use std::fmt;
use std::ops::{Add, Sub};

/// Strongly typed address in the inspected memory image
///
/// This wrapper around `u64` keeps image addresses apart from sizes, offsets
/// and decoded scalar values, which all travel as `u64` through the object
/// model. Addresses are always 64-bit here even when the image is 32-bit;
/// the session's `ArchitectureContext` decides how many bytes a pointer
/// occupies in memory.
///
/// ## Example
///
/// ```rust
/// use kscope_core::types::Address;
///
/// let node = Address::from(0xffff_8880_0010_0000);
/// let link = node + 0x10; // member offset
/// assert_eq!(link.value(), 0xffff_8880_0010_0010);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address
{
    /// The null address (0x0)
    pub const ZERO: Self = Address(0);

    /// Create a new address from a `u64` value
    ///
    /// ```rust
    /// use kscope_core::types::Address;
    ///
    /// const KERNEL_BASE: Address = Address::new(0xffff_ffff_8100_0000);
    /// ```
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Get the raw `u64` value of this address
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Whether this is the null address
    pub const fn is_null(self) -> bool
    {
        self.0 == 0
    }

    /// Add an offset to this address, checking for overflow
    ///
    /// ```rust
    /// use kscope_core::types::Address;
    ///
    /// let addr = Address::from(0x1000);
    /// assert_eq!(addr.checked_add(0x100), Some(Address::from(0x1100)));
    /// assert_eq!(addr.checked_add(u64::MAX), None);
    /// ```
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }

    /// Subtract an offset from this address, checking for underflow
    ///
    /// Used by `container_of`, where an underflow means the embedded member
    /// cannot possibly sit inside a container at that offset.
    pub fn checked_sub(self, offset: u64) -> Option<Self>
    {
        self.0.checked_sub(offset).map(Address)
    }

    /// Clear the low bits selected by `mask`
    ///
    /// ```rust
    /// use kscope_core::types::Address;
    ///
    /// // red-black tree parent word: parent address | color bit
    /// let parent_color = Address::from(0xffff_8880_0000_1041);
    /// assert_eq!(parent_color.mask_low(0x3), Address::from(0xffff_8880_0000_1040));
    /// ```
    pub const fn mask_low(self, mask: u64) -> Self
    {
        Address(self.0 & !mask)
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

impl fmt::LowerHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Address
{
    type Output = Address;

    fn sub(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_sub(rhs))
    }
}
