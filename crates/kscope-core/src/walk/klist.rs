//! Kernel `struct klist`: a `list_head` (`k_list`) threading
//! `struct klist_node`s through their `n_node` members.
//!
//! Besides the list's own back-links, each node records the klist it belongs
//! to in `n_klist`. A node claiming a different owner ends the walk.

use tracing::trace;

use super::{pointer_member, EntryMapping, ListWalk, ListWalker, WalkState};
use crate::config::TraversalConfig;
use crate::error::{KscopeError, KscopeResult, ListCorruption};
use crate::layout::Type;
use crate::types::Address;
use crate::value::TypedValue;

const K_LIST: &str = "k_list";
const N_NODE: &str = "n_node";
const N_KLIST: &str = "n_klist";

/// Low bit of `n_klist` set once a node is deleted while still referenced.
const KNODE_DEAD: u64 = 1;

/// Configures walks over one klist
#[derive(Debug, Clone)]
pub struct KlistWalker<'s>
{
    nodes: ListWalker<'s>,
    klist: Address,
    owner_offset: u64,
    entries: Option<EntryMapping>,
}

impl<'s> KlistWalker<'s>
{
    /// Walker over `klist` (a `struct klist` or a pointer to one) whose
    /// nodes are laid out as `node_type`.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::InvalidKind`] when `klist` has no `k_list` member or
    /// `node_type` has no `n_klist` pointer, [`KscopeError::NoSuchField`]
    /// when `node_type` has no `n_node`, and [`KscopeError::NullPointer`]
    /// for a null klist pointer.
    pub fn new(klist: &TypedValue<'s>, node_type: &Type) -> KscopeResult<Self>
    {
        let klist = if klist.ty().is_pointer() {
            klist.dereference()?
        } else {
            klist.clone()
        };
        let address = match klist.address() {
            Some(address) if klist.ty().is_aggregate() && klist.has_field(K_LIST) => address,
            _ => {
                return Err(KscopeError::InvalidKind {
                    operation: "walk a klist headed by",
                    found: klist.ty().name(),
                });
            }
        };
        let owner_offset = pointer_member(node_type, N_KLIST, "walk klist nodes of")?;
        let nodes = ListWalker::new(&klist.field(K_LIST)?)?.entries(node_type, N_NODE)?;

        Ok(Self {
            nodes,
            klist: address,
            owner_offset,
            entries: None,
        })
    }

    /// Most nodes a walk may yield before failing with `UnterminatedList`.
    #[must_use]
    pub fn max_nodes(mut self, max: usize) -> Self
    {
        self.nodes = self.nodes.max_nodes(max);
        self
    }

    #[must_use]
    pub fn with_config(self, config: &TraversalConfig) -> Self
    {
        self.max_nodes(config.max_list_nodes)
    }

    /// Yield the `container` objects embedding each `struct klist_node` at
    /// `member_path`.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::NoSuchField`] when `container` has no such member.
    pub fn entries(mut self, container: &Type, member_path: &str) -> KscopeResult<Self>
    {
        self.entries = Some(EntryMapping::new(container, member_path)?);
        Ok(self)
    }

    /// Address of the `struct klist`.
    #[must_use]
    pub fn klist(&self) -> Address
    {
        self.klist
    }

    #[must_use]
    pub fn walk(&self) -> KlistWalk<'s>
    {
        KlistWalk {
            walker: self.clone(),
            nodes: self.nodes.walk(),
            state: WalkState::NotStarted,
        }
    }
}

/// A klist walk in progress; see [`KlistWalker::walk`]
#[derive(Debug)]
pub struct KlistWalk<'s>
{
    walker: KlistWalker<'s>,
    nodes: ListWalk<'s>,
    state: WalkState,
}

impl<'s> KlistWalk<'s>
{
    #[must_use]
    pub fn state(&self) -> WalkState
    {
        self.state
    }

    /// Nodes yielded so far.
    #[must_use]
    pub fn visited(&self) -> usize
    {
        self.nodes.visited()
    }

    fn check_owner(&self, node: &TypedValue<'s>) -> KscopeResult<TypedValue<'s>>
    {
        let Some(address) = node.address() else {
            return Err(KscopeError::InvalidKind {
                operation: "check the owner of",
                found: node.ty().name(),
            });
        };
        let target = node.target();
        let owner = target.read_pointer(address + self.walker.owner_offset)?.mask_low(KNODE_DEAD);
        if owner != self.walker.klist {
            return Err(KscopeError::corrupt_list(
                address,
                ListCorruption::WrongOwner {
                    expected: self.walker.klist,
                    found: owner,
                },
            ));
        }
        trace!(klist = %self.walker.klist, node = %address, "klist step");
        match &self.walker.entries {
            Some(mapping) => mapping.apply(target, address),
            None => Ok(node.clone()),
        }
    }
}

impl<'s> Iterator for KlistWalk<'s>
{
    type Item = KscopeResult<TypedValue<'s>>;

    fn next(&mut self) -> Option<Self::Item>
    {
        if self.state.is_finished() {
            return None;
        }
        let Some(item) = self.nodes.next() else {
            self.state = WalkState::Exhausted;
            return None;
        };
        self.state = WalkState::Advancing;

        let result = match item {
            Ok(node) => self.check_owner(&node),
            Err(err) => Err(err),
        };
        if result.is_err() {
            self.state = WalkState::Failed;
        }
        Some(result)
    }
}

/// Walk `klist`, yielding each `struct klist_node` after checking it
/// belongs to this klist.
///
/// ## Errors
///
/// As [`KlistWalker::new`].
pub fn walk_klist<'s>(klist: &TypedValue<'s>, node_type: &Type) -> KscopeResult<KlistWalk<'s>>
{
    Ok(KlistWalker::new(klist, node_type)?.walk())
}
