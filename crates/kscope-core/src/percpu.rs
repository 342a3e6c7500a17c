//! # Per-CPU Variables
//!
//! A per-CPU variable is one template layout instantiated once per logical
//! CPU. The instance for CPU *n* lives at `__per_cpu_offset[n]` plus the
//! variable's offset inside the static per-CPU section.
//!
//! Kernels link the per-CPU section either at zero (symbol addresses already
//! are offsets) or at `__per_cpu_start` (symbol addresses must be made
//! section-relative first). [`PerCpuTable`] handles both.

use crate::error::{KscopeError, KscopeResult};
use crate::layout::Type;
use crate::types::Address;
use crate::value::{Target, TypedValue};

/// CPU offsets and the static per-CPU section, captured when a session attaches
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerCpuTable
{
    offsets: Vec<u64>,
    static_range: Option<(Address, u64)>,
}

impl PerCpuTable
{
    /// Table over `__per_cpu_offset[]`, one entry per possible CPU.
    #[must_use]
    pub fn new(offsets: Vec<u64>) -> Self
    {
        Self {
            offsets,
            static_range: None,
        }
    }

    /// Record `[__per_cpu_start, __per_cpu_end)` for relocation.
    #[must_use]
    pub fn with_static_range(mut self, start: Address, size: u64) -> Self
    {
        self.static_range = Some((start, size));
        self
    }

    #[must_use]
    pub fn nr_cpus(&self) -> usize
    {
        self.offsets.len()
    }

    #[must_use]
    pub fn offsets(&self) -> &[u64]
    {
        &self.offsets
    }

    #[must_use]
    pub fn static_range(&self) -> Option<(Address, u64)>
    {
        self.static_range
    }

    /// Offset of `cpu`'s per-CPU area.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::CpuOutOfRange`] when `cpu` is not in the table.
    pub fn offset(&self, cpu: usize) -> KscopeResult<u64>
    {
        self.offsets.get(cpu).copied().ok_or(KscopeError::CpuOutOfRange {
            cpu,
            nr_cpus: self.offsets.len(),
        })
    }

    /// Whether `address` falls inside the static per-CPU section, at either
    /// its link address or its zero-based offset.
    #[must_use]
    pub fn is_static_percpu(&self, address: Address) -> bool
    {
        let Some((start, size)) = self.static_range else {
            return false;
        };
        let value = address.value();
        value < size || (value >= start.value() && value - start.value() < size)
    }

    /// Section-relative offset of a per-CPU symbol address.
    #[must_use]
    pub fn relocated_offset(&self, address: Address) -> u64
    {
        match self.static_range {
            Some((start, size)) if address >= start && address.value() - start.value() < size => {
                address.value() - start.value()
            }
            _ => address.value(),
        }
    }

    /// Address of `cpu`'s instance of the variable at `template`.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::CpuOutOfRange`] when `cpu` is not in the table.
    pub fn instance_address(&self, template: Address, cpu: usize) -> KscopeResult<Address>
    {
        let offset = self.offset(cpu)?;
        Ok(Address::new(offset.wrapping_add(self.relocated_offset(template))))
    }
}

/// A per-CPU symbol: template layout plus its (unrelocated) address
#[derive(Debug, Clone)]
pub struct PerCpuVariable
{
    template: Type,
    base: Address,
}

impl PerCpuVariable
{
    #[must_use]
    pub fn new(template: Type, base: Address) -> Self
    {
        Self { template, base }
    }

    #[must_use]
    pub fn template(&self) -> &Type
    {
        &self.template
    }

    #[must_use]
    pub fn base(&self) -> Address
    {
        self.base
    }

    /// The template as a value; fields and array elements taken from it
    /// still resolve per CPU.
    #[must_use]
    pub fn value<'s>(&self, target: Target<'s>) -> TypedValue<'s>
    {
        TypedValue::per_cpu_template(target, self.base, self.template.clone())
    }

    /// `cpu`'s instance.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::CpuOutOfRange`] when `cpu` is not in the table.
    pub fn instance<'s>(&self, target: Target<'s>, cpu: usize) -> KscopeResult<TypedValue<'s>>
    {
        self.value(target).per_cpu(cpu)
    }

    /// Every CPU's instance, in CPU order.
    ///
    /// ## Errors
    ///
    /// Never in practice; the signature matches [`TypedValue::per_cpu_all`].
    pub fn all<'s>(&self, target: Target<'s>) -> KscopeResult<Vec<TypedValue<'s>>>
    {
        self.value(target).per_cpu_all()
    }
}

/// Sum a `struct percpu_counter`: the shared `count` plus every CPU's delta.
///
/// Accepts the counter or a pointer to it.
///
/// ## Errors
///
/// [`KscopeError::NoSuchField`] when the value is not shaped like a
/// `percpu_counter`, or any read error.
pub fn counter_sum(counter: &TypedValue<'_>) -> KscopeResult<i64>
{
    let count = counter.field("count")?.as_i64()?;
    let counters = counter.field("counters")?;
    let mut total = count;
    for cpu in 0..counter.target().percpu().nr_cpus() {
        total = total.wrapping_add(counters.per_cpu_ptr(cpu)?.as_i64()?);
    }
    Ok(total)
}
