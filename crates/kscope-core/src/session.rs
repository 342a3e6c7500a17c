//! # Sessions
//!
//! A [`Session`] binds one memory image to its debug information for as long
//! as the image is being inspected. It owns the memory source, the catalog
//! (and through it the [`ArchitectureContext`]) and the per-CPU table
//! captured at attach time.
//!
//! Every [`TypedValue`] and walk borrows the session. Once
//! [`Session::close`] consumes it, the borrow checker rejects any further
//! use of values produced from it.
//!
//! ## Example
//!
//! ```rust
//! use kscope_core::prelude::*;
//!
//! let spec = ArchSpec::native(TargetArch::X86_64);
//! let memory = SparseMemory::new(spec);
//! let debug_info = StaticDebugInfo::new("vmlinux", spec);
//!
//! let session = Session::attach(Box::new(memory), Box::new(debug_info), TraversalConfig::default()).unwrap();
//! assert_eq!(session.target().context().pointer_size(), 8);
//! session.close();
//! ```

use tracing::debug;

use crate::catalog::{SymbolEntry, SymbolTypeCatalog, TypeEntry};
use crate::config::TraversalConfig;
use crate::context::ArchitectureContext;
use crate::debuginfo::DebugInfo;
use crate::error::{KscopeError, KscopeResult};
use crate::layout::Type;
use crate::memory::MemorySource;
use crate::percpu::{PerCpuTable, PerCpuVariable};
use crate::types::Address;
use crate::value::{Target, TypedValue};
use crate::walk::{KlistWalker, ListWalker, TreeWalker};

/// Linker symbols bounding the static per-CPU section
const PER_CPU_START: &str = "__per_cpu_start";
const PER_CPU_END: &str = "__per_cpu_end";
const KLIST_NODE: &str = "struct klist_node";

/// One inspected memory image and its debug information
pub struct Session
{
    memory: Box<dyn MemorySource>,
    catalog: SymbolTypeCatalog,
    percpu: PerCpuTable,
    config: TraversalConfig,
}

impl std::fmt::Debug for Session
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("Session")
            .field("catalog", &self.catalog)
            .field("percpu", &self.percpu)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Session
{
    /// Start a session over `memory`, described by `debug_info`.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::IncompatibleHost`] when the debug information was built
    /// for a different architecture than the image.
    pub fn attach(
        memory: Box<dyn MemorySource>,
        debug_info: Box<dyn DebugInfo>,
        config: TraversalConfig,
    ) -> KscopeResult<Self>
    {
        let context = ArchitectureContext::establish(memory.as_ref(), debug_info.as_ref())?;
        let catalog = SymbolTypeCatalog::new(context);
        catalog.add_debug_info(debug_info)?;

        let mut percpu = PerCpuTable::new(memory.per_cpu_offsets());
        if let (Ok(start), Ok(end)) = (catalog.lookup_symbol(PER_CPU_START), catalog.lookup_symbol(PER_CPU_END)) {
            if let Some(size) = end.address.value().checked_sub(start.address.value()) {
                percpu = percpu.with_static_range(start.address, size);
            }
        }

        debug!(
            session = %catalog.context().session_id(),
            arch = %catalog.context().spec(),
            nr_cpus = percpu.nr_cpus(),
            static_percpu = percpu.static_range().is_some(),
            "session attached"
        );

        Ok(Self {
            memory,
            catalog,
            percpu,
            config,
        })
    }

    /// End the session and release the memory source.
    pub fn close(self)
    {
        debug!(session = %self.catalog.context().session_id(), "session closed");
    }

    /// The handle values use to decode themselves.
    #[must_use]
    pub fn target(&self) -> Target<'_>
    {
        Target::new(self.catalog.context(), self.memory.as_ref(), &self.percpu)
    }

    #[must_use]
    pub fn context(&self) -> &ArchitectureContext
    {
        self.catalog.context()
    }

    #[must_use]
    pub fn catalog(&self) -> &SymbolTypeCatalog
    {
        &self.catalog
    }

    #[must_use]
    pub fn config(&self) -> &TraversalConfig
    {
        &self.config
    }

    #[must_use]
    pub fn percpu(&self) -> &PerCpuTable
    {
        &self.percpu
    }

    /// Attach a module's debug information that arrived after the session
    /// started.
    ///
    /// ## Errors
    ///
    /// As [`SymbolTypeCatalog::add_debug_info`].
    pub fn add_debug_info(&self, debug_info: Box<dyn DebugInfo>) -> KscopeResult<()>
    {
        self.catalog.add_debug_info(debug_info)
    }

    /// No more debug information will arrive; misses become permanent.
    pub fn seal(&self)
    {
        self.catalog.seal();
    }

    /// ## Errors
    ///
    /// As [`SymbolTypeCatalog::lookup_symbol`].
    pub fn lookup_symbol(&self, name: &str) -> KscopeResult<SymbolEntry>
    {
        self.catalog.lookup_symbol(name)
    }

    /// ## Errors
    ///
    /// As [`SymbolTypeCatalog::lookup_type`].
    pub fn lookup_type(&self, name: &str) -> KscopeResult<TypeEntry>
    {
        self.catalog.lookup_type(name)
    }

    /// The object of the named type at `address`.
    ///
    /// ## Errors
    ///
    /// Any lookup failure for `type_name`.
    pub fn value_at(&self, address: Address, type_name: &str) -> KscopeResult<TypedValue<'_>>
    {
        let entry = self.lookup_type(type_name)?;
        Ok(TypedValue::at(self.target(), address, entry.ty))
    }

    fn symbol_type(&self, entry: &SymbolEntry) -> KscopeResult<Type>
    {
        if let Some(ty) = &entry.ty {
            return Ok(ty.clone());
        }
        match &entry.type_name {
            Some(type_name) => Ok(self.lookup_type(type_name)?.ty),
            None => Err(KscopeError::InvalidArgument(format!(
                "symbol '{}' carries no type information",
                entry.name
            ))),
        }
    }

    /// The global variable `name`.
    ///
    /// Symbols inside the static per-CPU section come back as per-CPU
    /// templates, ready for [`TypedValue::per_cpu`].
    ///
    /// ## Errors
    ///
    /// Lookup failures for the symbol or its type, and
    /// [`KscopeError::InvalidArgument`] for symbols without a type.
    pub fn symbol_value(&self, name: &str) -> KscopeResult<TypedValue<'_>>
    {
        let entry = self.lookup_symbol(name)?;
        let ty = self.symbol_type(&entry)?;
        if self.percpu.is_static_percpu(entry.address) {
            return Ok(PerCpuVariable::new(ty, entry.address).value(self.target()));
        }
        Ok(TypedValue::at(self.target(), entry.address, ty))
    }

    /// The per-CPU variable `name`.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::NotPerCpu`] when the image's static per-CPU section is
    /// known and the symbol lies outside it, otherwise as
    /// [`symbol_value`](Self::symbol_value).
    pub fn per_cpu_variable(&self, name: &str) -> KscopeResult<PerCpuVariable>
    {
        let entry = self.lookup_symbol(name)?;
        if self.percpu.static_range().is_some() && !self.percpu.is_static_percpu(entry.address) {
            return Err(KscopeError::NotPerCpu(entry.address));
        }
        let ty = self.symbol_type(&entry)?;
        Ok(PerCpuVariable::new(ty, entry.address))
    }

    /// Physical address behind a kernel virtual address.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::Untranslatable`] when no mapping covers `address`.
    pub fn translate(&self, address: Address) -> KscopeResult<Address>
    {
        Ok(self.memory.translate_virtual(address)?)
    }

    /// A list walker bounded by this session's configuration.
    ///
    /// ## Errors
    ///
    /// As [`ListWalker::new`].
    pub fn list_walker<'s>(&'s self, head: &TypedValue<'s>) -> KscopeResult<ListWalker<'s>>
    {
        Ok(ListWalker::new(head)?.with_config(&self.config))
    }

    /// A tree walker bounded by this session's configuration.
    ///
    /// ## Errors
    ///
    /// As [`TreeWalker::new`].
    pub fn tree_walker<'s>(&'s self, root: &TypedValue<'s>) -> KscopeResult<TreeWalker<'s>>
    {
        Ok(TreeWalker::new(root)?.with_config(&self.config))
    }

    /// A klist walker over `struct klist_node`s, bounded by this session's
    /// configuration.
    ///
    /// ## Errors
    ///
    /// Lookup failures for `struct klist_node`, otherwise as
    /// [`KlistWalker::new`].
    pub fn klist_walker<'s>(&'s self, klist: &TypedValue<'s>) -> KscopeResult<KlistWalker<'s>>
    {
        let node_type = self.lookup_type(KLIST_NODE)?.ty;
        Ok(KlistWalker::new(klist, &node_type)?.with_config(&self.config))
    }
}
