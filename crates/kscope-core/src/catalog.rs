//! # Symbol and Type Catalog
//!
//! Lazy, cached resolution of global symbols and named types across every
//! debug-information source attached to a session.
//!
//! Debug information may arrive late (a module loads after the session
//! starts), so a miss is only permanent once the catalog is sealed. Until
//! then lookups report [`KscopeError::NotYetAvailable`] and consumers can
//! register callbacks that fire the moment a name resolves.
//!
//! ## Re-entrancy
//!
//! All state sits behind `RefCell`s and every borrow is released before a
//! callback runs, so callbacks may look up further names or register more
//! callbacks.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::mem;

use tracing::{debug, trace, warn};

use crate::context::ArchitectureContext;
use crate::debuginfo::DebugInfo;
use crate::error::{EntryKind, KscopeError, KscopeResult};
use crate::layout::{split_pointer_suffix, Type};
use crate::types::Address;

/// How a cached entry came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState
{
    /// Found in a debug-information source
    Resolved,
    /// Installed by an explicit override
    Overridden,
}

/// A resolved global symbol
#[derive(Debug, Clone)]
pub struct SymbolEntry
{
    pub name: String,
    pub address: Address,
    /// C spelling of the declared type, if known
    pub type_name: Option<String>,
    /// The declared type, when the source decoded it directly
    pub ty: Option<Type>,
    /// Module whose debug information supplied the symbol
    pub module: String,
    pub state: EntryState,
}

/// A resolved named type
#[derive(Debug, Clone)]
pub struct TypeEntry
{
    pub name: String,
    pub ty: Type,
    pub state: EntryState,
}

/// What a resolution callback receives
#[derive(Debug, Clone)]
pub enum Resolution
{
    Symbol(SymbolEntry),
    Type(TypeEntry),
}

impl Resolution
{
    #[must_use]
    pub fn kind(&self) -> EntryKind
    {
        match self {
            Resolution::Symbol(_) => EntryKind::Symbol,
            Resolution::Type(_) => EntryKind::Type,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str
    {
        match self {
            Resolution::Symbol(entry) => &entry.name,
            Resolution::Type(entry) => &entry.name,
        }
    }

    #[must_use]
    pub fn as_symbol(&self) -> Option<&SymbolEntry>
    {
        match self {
            Resolution::Symbol(entry) => Some(entry),
            Resolution::Type(_) => None,
        }
    }

    #[must_use]
    pub fn as_type(&self) -> Option<&TypeEntry>
    {
        match self {
            Resolution::Type(entry) => Some(entry),
            Resolution::Symbol(_) => None,
        }
    }
}

/// Outcome of a resolution callback
pub type CallbackResult = Result<(), Box<dyn Error + Send + Sync>>;

type Callback = Box<dyn FnOnce(&Resolution) -> CallbackResult>;

struct Pending
{
    kind: EntryKind,
    name: String,
    callback: Callback,
}

/// A callback that returned an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackFailure
{
    pub kind: EntryKind,
    pub name: String,
    pub message: String,
}

/// Resolves symbols and types on demand and caches the answers
pub struct SymbolTypeCatalog
{
    context: ArchitectureContext,
    sources: RefCell<Vec<Box<dyn DebugInfo>>>,
    symbols: RefCell<HashMap<String, SymbolEntry>>,
    types: RefCell<HashMap<String, TypeEntry>>,
    pending: RefCell<Vec<Pending>>,
    failures: RefCell<Vec<CallbackFailure>>,
    sealed: Cell<bool>,
}

impl fmt::Debug for SymbolTypeCatalog
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("SymbolTypeCatalog")
            .field("session", &self.context.session_id())
            .field("modules", &self.modules())
            .field("symbols", &self.symbols.borrow().len())
            .field("types", &self.types.borrow().len())
            .field("pending", &self.pending.borrow().len())
            .field("sealed", &self.sealed.get())
            .finish()
    }
}

/// `void` has no descriptor of its own; only pointers to it are built.
const VOID: &str = "void";

/// Normalised spelling: `"struct foo*"` and `"struct foo *"` share one entry.
fn type_key(name: &str) -> String
{
    let (base, depth) = split_pointer_suffix(name);
    if depth == 0 {
        base.to_string()
    } else {
        format!("{base} {}", "*".repeat(depth))
    }
}

fn is_miss(err: &KscopeError) -> bool
{
    matches!(
        err,
        KscopeError::NotYetAvailable { .. } | KscopeError::UnresolvedSymbol(_) | KscopeError::UnresolvedType(_)
    )
}

impl SymbolTypeCatalog
{
    /// An empty, unsealed catalog for the given session context.
    #[must_use]
    pub fn new(context: ArchitectureContext) -> Self
    {
        Self {
            context,
            sources: RefCell::new(Vec::new()),
            symbols: RefCell::new(HashMap::new()),
            types: RefCell::new(HashMap::new()),
            pending: RefCell::new(Vec::new()),
            failures: RefCell::new(Vec::new()),
            sealed: Cell::new(false),
        }
    }

    #[must_use]
    pub fn context(&self) -> &ArchitectureContext
    {
        &self.context
    }

    /// Names of the attached debug-information sources, in lookup order.
    #[must_use]
    pub fn modules(&self) -> Vec<String>
    {
        self.sources
            .borrow()
            .iter()
            .map(|source| source.module_name().to_string())
            .collect()
    }

    /// Attach another module's debug information and retry pending callbacks.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::IncompatibleHost`] when the module was built for a
    /// different architecture, [`KscopeError::InvalidArgument`] after
    /// [`seal`](Self::seal).
    pub fn add_debug_info(&self, source: Box<dyn DebugInfo>) -> KscopeResult<()>
    {
        if self.sealed.get() {
            return Err(KscopeError::InvalidArgument(format!(
                "catalog is sealed; cannot add {}",
                source.module_name()
            )));
        }
        if source.architecture() != self.context.spec() {
            return Err(KscopeError::IncompatibleHost {
                expected: self.context.spec().to_string(),
                found: source.architecture().to_string(),
            });
        }

        debug!(
            session = %self.context.session_id(),
            module = source.module_name(),
            "debug information attached"
        );
        self.sources.borrow_mut().push(source);

        let mut waiting: Vec<(EntryKind, String)> = Vec::new();
        for pending in self.pending.borrow().iter() {
            let key = (pending.kind, pending.name.clone());
            if !waiting.contains(&key) {
                waiting.push(key);
            }
        }
        for (kind, name) in waiting {
            let outcome = match kind {
                EntryKind::Symbol => self.lookup_symbol(&name).map(|_| ()),
                EntryKind::Type => self.lookup_type(&name).map(|_| ()),
            };
            match outcome {
                Err(err) if !is_miss(&err) => {
                    warn!(%kind, name = %name, error = %err, "retrying pending lookup failed");
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Declare that no further debug information will arrive.
    ///
    /// From now on a miss is [`KscopeError::UnresolvedSymbol`] /
    /// [`KscopeError::UnresolvedType`].
    pub fn seal(&self)
    {
        self.sealed.set(true);
        debug!(
            session = %self.context.session_id(),
            pending = self.pending.borrow().len(),
            "catalog sealed"
        );
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool
    {
        self.sealed.get()
    }

    fn miss(&self, kind: EntryKind, name: &str) -> KscopeError
    {
        match (self.sealed.get(), kind) {
            (true, EntryKind::Symbol) => KscopeError::UnresolvedSymbol(name.to_string()),
            (true, EntryKind::Type) => KscopeError::UnresolvedType(name.to_string()),
            (false, kind) => KscopeError::NotYetAvailable {
                kind,
                name: name.to_string(),
            },
        }
    }

    /// Resolve a global symbol.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::NotYetAvailable`] on a miss while unsealed,
    /// [`KscopeError::UnresolvedSymbol`] once sealed.
    pub fn lookup_symbol(&self, name: &str) -> KscopeResult<SymbolEntry>
    {
        if let Some(entry) = self.symbols.borrow().get(name) {
            return Ok(entry.clone());
        }

        let found = self.sources.borrow().iter().find_map(|source| {
            source
                .resolve_symbol(name)
                .map(|info| (source.module_name().to_string(), info))
        });
        let Some((module, info)) = found else {
            return Err(self.miss(EntryKind::Symbol, name));
        };

        let entry = SymbolEntry {
            name: name.to_string(),
            address: info.address,
            type_name: info.type_name,
            ty: info.ty,
            module,
            state: EntryState::Resolved,
        };
        trace!(name, address = %entry.address, module = %entry.module, "symbol resolved");
        self.symbols.borrow_mut().insert(name.to_string(), entry.clone());
        self.notify(&Resolution::Symbol(entry.clone()));
        Ok(entry)
    }

    /// Resolve a type by C spelling; trailing `*`s derive pointer types.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::NotYetAvailable`] on a miss while unsealed,
    /// [`KscopeError::UnresolvedType`] once sealed, or the source's error
    /// when its debug information is malformed.
    pub fn lookup_type(&self, name: &str) -> KscopeResult<TypeEntry>
    {
        let key = type_key(name);
        if let Some(entry) = self.types.borrow().get(&key) {
            return Ok(entry.clone());
        }

        let (base, depth) = split_pointer_suffix(&key);
        let ty = if depth > 0 {
            let pointer_size = self.context.pointer_size();
            let innermost = if base == VOID {
                Type::void_pointer(pointer_size)
            } else {
                self.lookup_type(base)?.ty.pointer_to(pointer_size)
            };
            (1..depth).fold(innermost, |ty, _| ty.pointer_to(pointer_size))
        } else {
            let mut found = None;
            for source in self.sources.borrow().iter() {
                if let Some(ty) = source.resolve_type(base, &self.context)? {
                    found = Some(ty);
                    break;
                }
            }
            found.ok_or_else(|| self.miss(EntryKind::Type, &key))?
        };

        let entry = TypeEntry {
            name: key.clone(),
            ty,
            state: EntryState::Resolved,
        };
        trace!(name = %key, size = entry.ty.size(), "type resolved");
        self.types.borrow_mut().insert(key, entry.clone());
        self.notify(&Resolution::Type(entry.clone()));
        Ok(entry)
    }

    /// Replace the cached descriptor for `name`.
    ///
    /// Values already built from the old descriptor keep it; only later
    /// lookups see the replacement. Cached pointer types derived from the
    /// old descriptor are rebuilt on the new one and stay resolved.
    pub fn override_type(&self, name: &str, ty: Type)
    {
        let key = type_key(name);
        let (base, depth) = split_pointer_suffix(&key);
        let entry = TypeEntry {
            name: key.clone(),
            ty,
            state: EntryState::Overridden,
        };
        {
            let pointer_size = self.context.pointer_size();
            let mut types = self.types.borrow_mut();
            for (cached, derived) in types.iter_mut() {
                let (cached_base, cached_depth) = split_pointer_suffix(cached);
                if cached_base == base && cached_depth > depth {
                    derived.ty = (depth..cached_depth).fold(entry.ty.clone(), |ty, _| ty.pointer_to(pointer_size));
                }
            }
            types.insert(key.clone(), entry.clone());
        }
        debug!(name = %key, "type overridden");
        self.notify(&Resolution::Type(entry));
    }

    /// Replace the cached entry for a symbol.
    pub fn override_symbol(&self, name: &str, address: Address, type_name: Option<&str>)
    {
        let entry = SymbolEntry {
            name: name.to_string(),
            address,
            type_name: type_name.map(type_key),
            ty: None,
            module: "override".to_string(),
            state: EntryState::Overridden,
        };
        self.symbols.borrow_mut().insert(name.to_string(), entry.clone());
        debug!(name, %address, "symbol overridden");
        self.notify(&Resolution::Symbol(entry));
    }

    /// Whether `name` is in the cache. Never resolves and never fires callbacks.
    #[must_use]
    pub fn is_resolved(&self, kind: EntryKind, name: &str) -> bool
    {
        match kind {
            EntryKind::Symbol => self.symbols.borrow().contains_key(name),
            EntryKind::Type => self.types.borrow().contains_key(&type_key(name)),
        }
    }

    /// Run `callback` exactly once, as soon as `name` resolves.
    ///
    /// If the name already resolves the callback runs before this returns.
    /// Callbacks for the same name run in registration order. A callback
    /// that returns an error is logged and recorded in
    /// [`callback_failures`](Self::callback_failures); it does not affect
    /// other callbacks.
    ///
    /// ## Errors
    ///
    /// Only when trying to resolve the name fails for a reason other than
    /// a miss (malformed debug information).
    pub fn on_resolved<F>(&self, kind: EntryKind, name: &str, callback: F) -> KscopeResult<()>
    where
        F: FnOnce(&Resolution) -> CallbackResult + 'static,
    {
        let name = match kind {
            EntryKind::Symbol => name.to_string(),
            EntryKind::Type => type_key(name),
        };
        let attempt = match kind {
            EntryKind::Symbol => self.lookup_symbol(&name).map(Resolution::Symbol),
            EntryKind::Type => self.lookup_type(&name).map(Resolution::Type),
        };
        match attempt {
            Ok(resolution) => {
                self.invoke(kind, &name, Box::new(callback), &resolution);
                Ok(())
            }
            Err(err) if is_miss(&err) => {
                trace!(%kind, name = %name, "callback deferred until resolution");
                self.pending.borrow_mut().push(Pending {
                    kind,
                    name,
                    callback: Box::new(callback),
                });
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// [`on_resolved`](Self::on_resolved) for a symbol.
    ///
    /// ## Errors
    ///
    /// As [`on_resolved`](Self::on_resolved).
    pub fn on_symbol_resolved<F>(&self, name: &str, callback: F) -> KscopeResult<()>
    where
        F: FnOnce(&SymbolEntry) -> CallbackResult + 'static,
    {
        self.on_resolved(EntryKind::Symbol, name, move |resolution| match resolution.as_symbol() {
            Some(entry) => callback(entry),
            None => Ok(()),
        })
    }

    /// [`on_resolved`](Self::on_resolved) for a type.
    ///
    /// ## Errors
    ///
    /// As [`on_resolved`](Self::on_resolved).
    pub fn on_type_resolved<F>(&self, name: &str, callback: F) -> KscopeResult<()>
    where
        F: FnOnce(&TypeEntry) -> CallbackResult + 'static,
    {
        self.on_resolved(EntryKind::Type, name, move |resolution| match resolution.as_type() {
            Some(entry) => callback(entry),
            None => Ok(()),
        })
    }

    /// Names with callbacks still waiting, in registration order.
    #[must_use]
    pub fn pending_callbacks(&self) -> Vec<(EntryKind, String)>
    {
        self.pending
            .borrow()
            .iter()
            .map(|pending| (pending.kind, pending.name.clone()))
            .collect()
    }

    /// Every callback error recorded so far.
    #[must_use]
    pub fn callback_failures(&self) -> Vec<CallbackFailure>
    {
        self.failures.borrow().clone()
    }

    fn notify(&self, resolution: &Resolution)
    {
        let kind = resolution.kind();
        let ready: Vec<Pending> = {
            let mut pending = self.pending.borrow_mut();
            let (ready, waiting): (Vec<Pending>, Vec<Pending>) = mem::take(&mut *pending)
                .into_iter()
                .partition(|pending| pending.kind == kind && pending.name == resolution.name());
            *pending = waiting;
            ready
        };
        for pending in ready {
            self.invoke(pending.kind, &pending.name, pending.callback, resolution);
        }
    }

    fn invoke(&self, kind: EntryKind, name: &str, callback: Callback, resolution: &Resolution)
    {
        if let Err(err) = callback(resolution) {
            warn!(%kind, name, error = %err, "resolution callback failed");
            self.failures.borrow_mut().push(CallbackFailure {
                kind,
                name: name.to_string(),
                message: err.to_string(),
            });
        }
    }
}
