//! # Traversal Engine
//!
//! Walkers for the kernel's two pervasive intrusive containers: circular
//! doubly linked lists (`struct list_head`) and red-black trees
//! (`struct rb_root` / `struct rb_node`). Klists (`struct klist`) are walked
//! as lists with an extra ownership check per node.
//!
//! Both walkers treat memory as untrusted. Every step verifies the
//! container's back-link invariant, every walk is bounded, and the first
//! violation ends the walk with an error carrying the offending address.
//! Nothing is skipped or repaired.
//!
//! Walks are lazy iterators: each `next()` advances exactly one node, and
//! dropping the iterator abandons the walk. Starting a new walk from the same
//! walker restarts from the head.

pub mod klist;
pub mod list;
pub mod rbtree;

pub use klist::{walk_klist, KlistWalk, KlistWalker};
pub use list::{list_empty, list_len, walk_list, LinkCheck, ListWalk, ListWalker};
pub use rbtree::{walk_tree, TreeFields, TreeOrder, TreeWalk, TreeWalker};

use crate::error::{KscopeError, KscopeResult};
use crate::layout::Type;
use crate::types::Address;
use crate::value::{Target, TypedValue};

/// Progress of a walk
///
/// `Exhausted` and `Failed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkState
{
    NotStarted,
    Advancing,
    Exhausted,
    Failed,
}

impl WalkState
{
    #[must_use]
    pub fn is_finished(self) -> bool
    {
        matches!(self, WalkState::Exhausted | WalkState::Failed)
    }
}

/// Maps an embedded link node to the object that contains it
#[derive(Debug, Clone)]
pub(crate) struct EntryMapping
{
    container: Type,
    member_path: String,
    offset: u64,
}

impl EntryMapping
{
    pub(crate) fn new(container: &Type, member_path: &str) -> KscopeResult<Self>
    {
        let member = container.field_path(member_path)?;
        Ok(Self {
            container: container.clone(),
            member_path: member_path.to_string(),
            offset: member.offset,
        })
    }

    /// The container embedding the link node at `node`.
    pub(crate) fn apply<'s>(&self, target: Target<'s>, node: Address) -> KscopeResult<TypedValue<'s>>
    {
        let base = node.checked_sub(self.offset).ok_or_else(|| {
            KscopeError::InvalidArgument(format!(
                "{node} cannot be member '{}' of {} (offset {})",
                self.member_path,
                self.container.name(),
                self.offset
            ))
        })?;
        Ok(TypedValue::at(target, base, self.container.clone()))
    }
}

/// Offset of a pointer-sized member (a pointer, or a word such as
/// `__rb_parent_color`) in a link-node type.
pub(crate) fn pointer_member(node_type: &Type, name: &str, operation: &'static str) -> KscopeResult<u64>
{
    match node_type.find_field(name) {
        Some(field) if !field.ty.is_aggregate() && !field.ty.is_array() => Ok(field.offset),
        _ => Err(KscopeError::InvalidKind {
            operation,
            found: node_type.name(),
        }),
    }
}
