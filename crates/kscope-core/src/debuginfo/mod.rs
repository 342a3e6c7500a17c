//! # Debug Information Sources
//!
//! Symbol addresses and type layouts come from a [`DebugInfo`]
//! implementation: the kernel image, a module that loaded later, or an
//! in-memory table built by a tool.
//!
//! The catalog consults its sources in the order they were added, so the
//! kernel image should come first and modules after it.

mod dwarf;

use std::collections::HashMap;
use std::sync::Arc;

pub use dwarf::DwarfDebugInfo;

use crate::context::ArchitectureContext;
use crate::error::KscopeResult;
use crate::layout::{Type, TypeTable};
use crate::types::{Address, ArchSpec};

/// A global symbol as a debug-information source reports it
#[derive(Debug, Clone)]
pub struct SymbolInfo
{
    pub name: String,
    pub address: Address,
    /// C spelling of the symbol's type, when the source knows it
    pub type_name: Option<String>,
    /// The decoded type itself, when the source could build it directly
    pub ty: Option<Type>,
    /// Size recorded in the symbol table (zero when unknown)
    pub size: u64,
}

/// Source of symbols and types for one binary (kernel image or module)
pub trait DebugInfo
{
    /// Short name used in log messages (`"vmlinux"`, `"ext4"`, ...).
    fn module_name(&self) -> &str;

    /// Architecture the binary was built for.
    fn architecture(&self) -> ArchSpec;

    /// Look up a global symbol by name.
    fn resolve_symbol(&self, name: &str) -> Option<SymbolInfo>;

    /// Look up a type by its C spelling (`"struct list_head"`,
    /// `"unsigned long"`, a typedef name).
    ///
    /// Pointer spellings (`"struct foo *"`) never reach the source; the
    /// catalog derives them.
    ///
    /// ## Errors
    ///
    /// When the debug information exists but cannot be decoded.
    fn resolve_type(&self, name: &str, context: &ArchitectureContext) -> KscopeResult<Option<Type>>;
}

/// In-memory debug information
///
/// Holds a symbol map and any number of frozen [`TypeTable`]s. Synthetic
/// sessions and tests describe their images with it; tools can also use it
/// to layer hand-written layouts over a real kernel.
///
/// ```rust
/// use kscope_core::debuginfo::{DebugInfo, StaticDebugInfo};
/// use kscope_core::types::{Address, ArchSpec, TargetArch};
///
/// let info = StaticDebugInfo::new("vmlinux", ArchSpec::native(TargetArch::X86_64))
///     .with_symbol("init_task", Address::new(0xffff_ffff_8200_0000), Some("struct task_struct"));
/// assert!(info.resolve_symbol("init_task").is_some());
/// ```
#[derive(Debug)]
pub struct StaticDebugInfo
{
    module: String,
    spec: ArchSpec,
    symbols: HashMap<String, SymbolInfo>,
    tables: Vec<Arc<TypeTable>>,
}

impl StaticDebugInfo
{
    #[must_use]
    pub fn new(module: &str, spec: ArchSpec) -> Self
    {
        Self {
            module: module.to_string(),
            spec,
            symbols: HashMap::new(),
            tables: Vec::new(),
        }
    }

    /// Make every name in `table` resolvable.
    #[must_use]
    pub fn with_types(mut self, table: Arc<TypeTable>) -> Self
    {
        self.tables.push(table);
        self
    }

    /// Add a symbol.
    #[must_use]
    pub fn with_symbol(mut self, name: &str, address: Address, type_name: Option<&str>) -> Self
    {
        self.add_symbol(name, address, type_name);
        self
    }

    /// Add a symbol in place.
    pub fn add_symbol(&mut self, name: &str, address: Address, type_name: Option<&str>)
    {
        self.symbols.insert(
            name.to_string(),
            SymbolInfo {
                name: name.to_string(),
                address,
                type_name: type_name.map(str::to_string),
                ty: None,
                size: 0,
            },
        );
    }

    /// Add a symbol whose type is given as a descriptor rather than a name.
    #[must_use]
    pub fn with_typed_symbol(mut self, name: &str, address: Address, ty: Type) -> Self
    {
        self.symbols.insert(
            name.to_string(),
            SymbolInfo {
                name: name.to_string(),
                address,
                type_name: Some(ty.name()),
                size: ty.size(),
                ty: Some(ty),
            },
        );
        self
    }
}

impl DebugInfo for StaticDebugInfo
{
    fn module_name(&self) -> &str
    {
        &self.module
    }

    fn architecture(&self) -> ArchSpec
    {
        self.spec
    }

    fn resolve_symbol(&self, name: &str) -> Option<SymbolInfo>
    {
        self.symbols.get(name).cloned()
    }

    fn resolve_type(&self, name: &str, _context: &ArchitectureContext) -> KscopeResult<Option<Type>>
    {
        Ok(self.tables.iter().find_map(|table| table.lookup(name)))
    }
}
