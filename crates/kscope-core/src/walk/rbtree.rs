//! Red-black trees (`struct rb_root`, `struct rb_node`).
//!
//! Colour lives in the low two bits of `__rb_parent_color`; the rest is the
//! parent address. The walk descends through `rb_left`/`rb_right` with an
//! explicit stack and checks that each child names the node it was reached
//! from as its parent. Key order is never consulted.

use tracing::trace;

use super::{pointer_member, EntryMapping, WalkState};
use crate::config::TraversalConfig;
use crate::error::{KscopeError, KscopeResult, TreeCorruption};
use crate::layout::Type;
use crate::types::Address;
use crate::value::{Target, TypedValue};

/// `struct rb_root_cached` wraps the plain root in this member.
const CACHED_ROOT: &str = "rb_root";

const OPERATION: &str = "walk a tree rooted at";

/// Member names of the tree link types
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeFields
{
    /// Root pointer inside `struct rb_root`
    pub root_node: String,
    /// Parent pointer with the colour packed into its low bits
    pub parent_color: String,
    pub left: String,
    pub right: String,
}

impl Default for TreeFields
{
    fn default() -> Self
    {
        Self {
            root_node: "rb_node".to_string(),
            parent_color: "__rb_parent_color".to_string(),
            left: "rb_left".to_string(),
            right: "rb_right".to_string(),
        }
    }
}

/// Order in which nodes are yielded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TreeOrder
{
    /// Left subtree, node, right subtree
    #[default]
    InOrder,
    /// Left subtree, right subtree, node; a node may be released once yielded
    PostOrder,
}

/// Where the first node comes from
#[derive(Debug, Clone, Copy)]
enum Start
{
    /// Read from the `rb_node` member of a root at this address; the first
    /// node must have no parent.
    Slot(Address),
    /// A node given directly; its parent is not checked.
    Node(Address),
}

/// Configures walks over one tree
#[derive(Debug, Clone)]
pub struct TreeWalker<'s>
{
    target: Target<'s>,
    root: Address,
    start: Start,
    node_type: Type,
    parent_offset: u64,
    left_offset: u64,
    right_offset: u64,
    order: TreeOrder,
    max_nodes: usize,
    max_depth: usize,
    entries: Option<EntryMapping>,
}

impl<'s> TreeWalker<'s>
{
    /// Walker over `root`: a `struct rb_root` (or `rb_root_cached`), a
    /// pointer to one, or a `struct rb_node *` naming a subtree.
    ///
    /// ## Errors
    ///
    /// See [`TreeWalker::with_fields`].
    pub fn new(root: &TypedValue<'s>) -> KscopeResult<Self>
    {
        Self::with_fields(root, TreeFields::default())
    }

    /// As [`TreeWalker::new`], for link types with non-default member names.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::InvalidKind`] when `root` is neither a root nor a node,
    /// [`KscopeError::NullPointer`] for a null pointer to a root,
    /// [`KscopeError::CorruptTree`] for a root at address zero.
    pub fn with_fields(root: &TypedValue<'s>, fields: TreeFields) -> KscopeResult<Self>
    {
        let target = root.target();

        // A null node pointer is an empty tree, so it is not dereferenced.
        if let Some(pointee) = root.ty().pointee().filter(|ty| ty.find_field(&fields.left).is_some()) {
            let node = root.as_address()?;
            return Self::assemble(target, node, Start::Node(node), pointee, &fields);
        }

        let mut value = if root.ty().is_pointer() {
            root.dereference()?
        } else {
            root.clone()
        };
        if !value.has_field(&fields.root_node) && value.has_field(CACHED_ROOT) {
            value = value.field(CACHED_ROOT)?;
        }
        let Some(address) = value.address() else {
            return Err(KscopeError::InvalidKind {
                operation: OPERATION,
                found: value.ty().name(),
            });
        };
        if address.is_null() {
            return Err(KscopeError::corrupt_tree(address, TreeCorruption::NullRoot));
        }

        // A bare `rb_node` lands here and is rejected; subtrees go by pointer.
        let slot = match value.ty().find_field(&fields.root_node) {
            Some(field) if field.ty.is_pointer() => field,
            _ => {
                return Err(KscopeError::InvalidKind {
                    operation: OPERATION,
                    found: value.ty().name(),
                });
            }
        };
        let node_type = slot.ty.pointee().ok_or_else(|| KscopeError::InvalidKind {
            operation: OPERATION,
            found: slot.ty.name(),
        })?;
        Self::assemble(target, address, Start::Slot(address + slot.offset), node_type, &fields)
    }

    fn assemble(target: Target<'s>, root: Address, start: Start, node_type: Type, fields: &TreeFields) -> KscopeResult<Self>
    {
        let defaults = TraversalConfig::default();
        Ok(Self {
            target,
            root,
            start,
            parent_offset: pointer_member(&node_type, &fields.parent_color, OPERATION)?,
            left_offset: pointer_member(&node_type, &fields.left, OPERATION)?,
            right_offset: pointer_member(&node_type, &fields.right, OPERATION)?,
            node_type,
            order: TreeOrder::InOrder,
            max_nodes: defaults.max_tree_nodes,
            max_depth: defaults.max_tree_depth,
            entries: None,
        })
    }

    #[must_use]
    pub fn order(mut self, order: TreeOrder) -> Self
    {
        self.order = order;
        self
    }

    /// Most nodes a walk may enter before failing with `UnterminatedTree`.
    #[must_use]
    pub fn max_nodes(mut self, max: usize) -> Self
    {
        self.max_nodes = max;
        self
    }

    /// Deepest level a walk may descend to; the first node is level 1.
    #[must_use]
    pub fn max_depth(mut self, max: usize) -> Self
    {
        self.max_depth = max;
        self
    }

    /// Take both bounds from a session's configuration.
    #[must_use]
    pub fn with_config(self, config: &TraversalConfig) -> Self
    {
        self.max_nodes(config.max_tree_nodes).max_depth(config.max_tree_depth)
    }

    /// Yield the `container` objects embedding each node at `member_path`.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::NoSuchField`] when `container` has no such member.
    pub fn entries(mut self, container: &Type, member_path: &str) -> KscopeResult<Self>
    {
        self.entries = Some(EntryMapping::new(container, member_path)?);
        Ok(self)
    }

    /// Address of the root object the walker was built from.
    #[must_use]
    pub fn root(&self) -> Address
    {
        self.root
    }

    /// Start a fresh walk.
    #[must_use]
    pub fn walk(&self) -> TreeWalk<'s>
    {
        TreeWalk {
            walker: self.clone(),
            state: WalkState::NotStarted,
            stack: Vec::new(),
            entered: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage
{
    Left,
    Right,
    Visit,
}

/// A node on the descent stack, with its links read once on entry
#[derive(Debug)]
struct Frame
{
    node: Address,
    left: Address,
    right: Address,
    depth: usize,
    stage: Stage,
}

/// A walk in progress; see [`TreeWalker::walk`]
#[derive(Debug)]
pub struct TreeWalk<'s>
{
    walker: TreeWalker<'s>,
    state: WalkState,
    stack: Vec<Frame>,
    entered: usize,
}

impl<'s> TreeWalk<'s>
{
    #[must_use]
    pub fn state(&self) -> WalkState
    {
        self.state
    }

    /// Nodes read so far.
    #[must_use]
    pub fn visited(&self) -> usize
    {
        self.entered
    }

    fn link(&self, bytes: &[u8], offset: u64, node: Address) -> KscopeResult<Address>
    {
        let context = self.walker.target.context();
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let width = usize::from(context.pointer_size());
        let slice = start
            .checked_add(width)
            .and_then(|end| bytes.get(start..end))
            .ok_or_else(|| KscopeError::InvalidArgument(format!("link at +{offset} lies outside node {node}")))?;
        context.read_pointer(slice)
    }

    /// Read `node` and push it, checking bounds and its parent link.
    fn enter(&mut self, node: Address, parent: Option<Address>, depth: usize) -> KscopeResult<()>
    {
        let root = self.walker.root;
        if depth > self.walker.max_depth {
            return Err(KscopeError::UnterminatedTree {
                root,
                visited: self.entered,
                detail: format!("depth exceeds {} at node {node}", self.walker.max_depth),
            });
        }
        if self.entered >= self.walker.max_nodes {
            return Err(KscopeError::UnterminatedTree {
                root,
                visited: self.entered,
                detail: format!("more than {} nodes", self.walker.max_nodes),
            });
        }

        let size = usize::try_from(self.walker.node_type.size()).unwrap_or(usize::MAX);
        let bytes = self
            .walker
            .target
            .read(node, size)
            .map_err(|err| KscopeError::CorruptTree {
                address: node,
                reason: TreeCorruption::UnreadableNode,
                source: Some(Box::new(err)),
            })?;

        let recorded = self.link(&bytes, self.walker.parent_offset, node)?.mask_low(0b11);
        if let Some(expected) = parent {
            if recorded != expected {
                return Err(KscopeError::corrupt_tree(
                    node,
                    TreeCorruption::WrongParent {
                        expected,
                        found: recorded,
                    },
                ));
            }
        }

        let left = self.link(&bytes, self.walker.left_offset, node)?;
        let right = self.link(&bytes, self.walker.right_offset, node)?;
        self.entered += 1;
        trace!(root = %root, node = %node, depth, "tree node");
        self.stack.push(Frame {
            node,
            left,
            right,
            depth,
            stage: Stage::Left,
        });
        Ok(())
    }

    fn begin(&mut self) -> KscopeResult<()>
    {
        let (first, parent) = match self.walker.start {
            Start::Slot(slot) => {
                let first = self.walker.target.read_pointer(slot).map_err(|err| KscopeError::CorruptTree {
                    address: self.walker.root,
                    reason: TreeCorruption::UnreadableNode,
                    source: Some(Box::new(err)),
                })?;
                (first, Some(Address::ZERO))
            }
            Start::Node(node) => (node, None),
        };
        if first.is_null() {
            return Ok(());
        }
        self.enter(first, parent, 1)
    }

    /// Descend until the next node to yield, or `None` once the stack drains.
    fn advance(&mut self) -> KscopeResult<Option<Address>>
    {
        let order = self.walker.order;
        loop {
            let Some(top) = self.stack.last_mut() else {
                return Ok(None);
            };
            match top.stage {
                Stage::Left => {
                    top.stage = match order {
                        TreeOrder::InOrder => Stage::Visit,
                        TreeOrder::PostOrder => Stage::Right,
                    };
                    let (child, parent, depth) = (top.left, top.node, top.depth + 1);
                    if !child.is_null() {
                        self.enter(child, Some(parent), depth)?;
                    }
                }
                Stage::Right => {
                    let (child, parent, depth) = (top.right, top.node, top.depth + 1);
                    match order {
                        TreeOrder::InOrder => {
                            self.stack.pop();
                        }
                        TreeOrder::PostOrder => top.stage = Stage::Visit,
                    }
                    if !child.is_null() {
                        self.enter(child, Some(parent), depth)?;
                    }
                }
                Stage::Visit => {
                    let node = top.node;
                    match order {
                        TreeOrder::InOrder => top.stage = Stage::Right,
                        TreeOrder::PostOrder => {
                            self.stack.pop();
                        }
                    }
                    return Ok(Some(node));
                }
            }
        }
    }

    fn emit(&self, node: Address) -> KscopeResult<TypedValue<'s>>
    {
        match &self.walker.entries {
            Some(mapping) => mapping.apply(self.walker.target, node),
            None => Ok(TypedValue::at(self.walker.target, node, self.walker.node_type.clone())),
        }
    }
}

impl<'s> Iterator for TreeWalk<'s>
{
    type Item = KscopeResult<TypedValue<'s>>;

    fn next(&mut self) -> Option<Self::Item>
    {
        if self.state.is_finished() {
            return None;
        }
        if self.state == WalkState::NotStarted {
            self.state = WalkState::Advancing;
            if let Err(err) = self.begin() {
                self.state = WalkState::Failed;
                return Some(Err(err));
            }
        }

        let result = self.advance().and_then(|node| node.map(|node| self.emit(node)).transpose());
        match result {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => {
                self.state = WalkState::Exhausted;
                None
            }
            Err(err) => {
                self.state = WalkState::Failed;
                Some(Err(err))
            }
        }
    }
}

/// In-order walk of the tree at `root` (see [`TreeWalker::new`]).
///
/// ## Errors
///
/// As [`TreeWalker::new`].
pub fn walk_tree<'s>(root: &TypedValue<'s>) -> KscopeResult<TreeWalk<'s>>
{
    Ok(TreeWalker::new(root)?.walk())
}
