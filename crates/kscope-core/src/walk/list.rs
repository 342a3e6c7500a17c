//! Circular doubly linked lists (`struct list_head`).
//!
//! The head is a sentinel: the walk starts at `head.next` and ends when a
//! link leads back to the head. Every node reached must point back at the
//! node it was reached from.

use std::collections::HashSet;

use tracing::{trace, warn};

use super::{pointer_member, EntryMapping, WalkState};
use crate::config::TraversalConfig;
use crate::error::{KscopeError, KscopeResult, ListCorruption};
use crate::layout::Type;
use crate::types::Address;
use crate::value::{Target, TypedValue};

const NEXT: &str = "next";
const PREV: &str = "prev";

/// How broken back-links are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkCheck
{
    /// Fail at the first broken back-link
    #[default]
    Strict,
    /// Log each broken back-link, keep walking, and report the first one
    /// after the walk returns to the head
    Deferred,
}

/// Configures walks over one list
#[derive(Debug, Clone)]
pub struct ListWalker<'s>
{
    target: Target<'s>,
    head: Address,
    node_type: Type,
    next_offset: u64,
    prev_offset: u64,
    include_head: bool,
    reverse: bool,
    link_check: LinkCheck,
    max_nodes: usize,
    entries: Option<EntryMapping>,
}

impl<'s> ListWalker<'s>
{
    /// Walker over the list headed by `head`: a `struct list_head` in memory
    /// or a pointer to one.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::InvalidKind`] when `head` has no `next`/`prev` links,
    /// [`KscopeError::NullPointer`] for a null head pointer.
    pub fn new(head: &TypedValue<'s>) -> KscopeResult<Self>
    {
        let head = if head.ty().is_pointer() {
            head.dereference()?
        } else {
            head.clone()
        };
        let Some(address) = head.address() else {
            return Err(KscopeError::InvalidKind {
                operation: "walk a list headed by",
                found: head.ty().name(),
            });
        };
        if address.is_null() {
            return Err(KscopeError::corrupt_list(address, ListCorruption::NullHead));
        }
        let node_type = head.ty().clone();
        let next_offset = pointer_member(&node_type, NEXT, "walk a list headed by")?;
        let prev_offset = pointer_member(&node_type, PREV, "walk a list headed by")?;

        Ok(Self {
            target: head.target(),
            head: address,
            node_type,
            next_offset,
            prev_offset,
            include_head: false,
            reverse: false,
            link_check: LinkCheck::Strict,
            max_nodes: TraversalConfig::default().max_list_nodes,
            entries: None,
        })
    }

    /// Yield the head itself first.
    #[must_use]
    pub fn include_head(mut self, include: bool) -> Self
    {
        self.include_head = include;
        self
    }

    /// Follow `prev` links (verifying `next`) instead.
    #[must_use]
    pub fn reverse(mut self, reverse: bool) -> Self
    {
        self.reverse = reverse;
        self
    }

    #[must_use]
    pub fn link_check(mut self, check: LinkCheck) -> Self
    {
        self.link_check = check;
        self
    }

    /// Most nodes a walk may yield before failing with `UnterminatedList`.
    #[must_use]
    pub fn max_nodes(mut self, max: usize) -> Self
    {
        self.max_nodes = max;
        self
    }

    /// Take the node bound from a session's configuration.
    #[must_use]
    pub fn with_config(self, config: &TraversalConfig) -> Self
    {
        self.max_nodes(config.max_list_nodes)
    }

    /// Yield the `container` objects whose `member_path` member is linked
    /// into the list, instead of the link nodes.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::NoSuchField`] when `container` has no such member.
    pub fn entries(mut self, container: &Type, member_path: &str) -> KscopeResult<Self>
    {
        self.entries = Some(EntryMapping::new(container, member_path)?);
        Ok(self)
    }

    /// Address of the head node.
    #[must_use]
    pub fn head(&self) -> Address
    {
        self.head
    }

    /// Start a fresh walk from the head.
    #[must_use]
    pub fn walk(&self) -> ListWalk<'s>
    {
        let (link_offset, back_offset) = if self.reverse {
            (self.prev_offset, self.next_offset)
        } else {
            (self.next_offset, self.prev_offset)
        };
        ListWalk {
            walker: self.clone(),
            link_offset,
            back_offset,
            state: WalkState::NotStarted,
            current: self.head,
            visited: HashSet::new(),
            count: 0,
            first_break: None,
        }
    }

    /// Whether the head links to itself.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::UnreadableMemory`] when the head cannot be read.
    pub fn is_empty(&self) -> KscopeResult<bool>
    {
        Ok(self.target.read_pointer(self.head + self.next_offset)? == self.head)
    }
}

/// A walk in progress; see [`ListWalker::walk`]
#[derive(Debug)]
pub struct ListWalk<'s>
{
    walker: ListWalker<'s>,
    link_offset: u64,
    back_offset: u64,
    state: WalkState,
    current: Address,
    visited: HashSet<Address>,
    count: usize,
    first_break: Option<KscopeError>,
}

impl<'s> ListWalk<'s>
{
    #[must_use]
    pub fn state(&self) -> WalkState
    {
        self.state
    }

    /// Nodes yielded so far, not counting the head.
    #[must_use]
    pub fn visited(&self) -> usize
    {
        self.count
    }

    fn read_link(&self, node: Address, offset: u64, target: Address) -> KscopeResult<Address>
    {
        self.walker
            .target
            .read_pointer(node + offset)
            .map_err(|err| KscopeError::CorruptList {
                address: node,
                reason: ListCorruption::UnreadableLink { target },
                source: Some(Box::new(err)),
            })
    }

    fn broken_link(&mut self, at: Address, expected: Address, found: Address) -> KscopeResult<()>
    {
        let err = KscopeError::corrupt_list(at, ListCorruption::BrokenBackLink { expected, found });
        match self.walker.link_check {
            LinkCheck::Strict => Err(err),
            LinkCheck::Deferred => {
                warn!(head = %self.walker.head, node = %at, %expected, %found, "broken list back-link");
                self.first_break.get_or_insert(err);
                Ok(())
            }
        }
    }

    /// Advance one node; `None` once the walk is back at the head.
    fn step(&mut self) -> KscopeResult<Option<Address>>
    {
        let head = self.walker.head;
        let current = self.current;
        let link = self.read_link(current, self.link_offset, current)?;

        if link.is_null() {
            return Err(KscopeError::corrupt_list(current, ListCorruption::NullLink));
        }

        if link == head {
            let back = self.read_link(head, self.back_offset, head)?;
            if back != current {
                self.broken_link(head, current, back)?;
            }
            return Ok(None);
        }

        if !self.visited.insert(link) {
            return Err(KscopeError::UnterminatedList {
                head,
                cycle_at: Some(link),
                visited: self.count,
                detail: format!("node {link} revisited without returning to the head"),
            });
        }

        if self.count >= self.walker.max_nodes {
            return Err(KscopeError::UnterminatedList {
                head,
                cycle_at: None,
                visited: self.count,
                detail: format!("more than {} nodes", self.walker.max_nodes),
            });
        }

        let back = self
            .walker
            .target
            .read_pointer(link + self.back_offset)
            .map_err(|err| KscopeError::CorruptList {
                address: current,
                reason: ListCorruption::UnreadableLink { target: link },
                source: Some(Box::new(err)),
            })?;
        if back != current {
            self.broken_link(link, current, back)?;
        }

        self.count += 1;
        self.current = link;
        trace!(head = %head, node = %link, index = self.count, "list step");
        Ok(Some(link))
    }

    fn emit(&self, node: Address) -> KscopeResult<TypedValue<'s>>
    {
        match &self.walker.entries {
            Some(mapping) => mapping.apply(self.walker.target, node),
            None => Ok(TypedValue::at(self.walker.target, node, self.walker.node_type.clone())),
        }
    }

    fn fail(&mut self, err: KscopeError) -> Option<KscopeResult<TypedValue<'s>>>
    {
        self.state = WalkState::Failed;
        Some(Err(err))
    }
}

impl<'s> Iterator for ListWalk<'s>
{
    type Item = KscopeResult<TypedValue<'s>>;

    fn next(&mut self) -> Option<Self::Item>
    {
        match self.state {
            WalkState::Exhausted | WalkState::Failed => return None,
            WalkState::NotStarted => {
                self.state = WalkState::Advancing;
                if self.walker.include_head {
                    return match self.emit(self.walker.head) {
                        Ok(value) => Some(Ok(value)),
                        Err(err) => self.fail(err),
                    };
                }
            }
            WalkState::Advancing => {}
        }

        match self.step() {
            Ok(Some(node)) => match self.emit(node) {
                Ok(value) => Some(Ok(value)),
                Err(err) => self.fail(err),
            },
            Ok(None) => match self.first_break.take() {
                Some(err) => self.fail(err),
                None => {
                    self.state = WalkState::Exhausted;
                    None
                }
            },
            Err(err) => self.fail(err),
        }
    }
}

/// Walk the list whose head sits at `link_field_path` inside `head` (or is
/// `head` itself when the path is empty), yielding the link nodes.
///
/// ## Errors
///
/// As [`ListWalker::new`], plus [`KscopeError::NoSuchField`] for a bad path.
pub fn walk_list<'s>(head: &TypedValue<'s>, link_field_path: &str, include_head: bool) -> KscopeResult<ListWalk<'s>>
{
    let sentinel = if link_field_path.is_empty() {
        head.clone()
    } else {
        head.field_path(link_field_path)?
    };
    Ok(ListWalker::new(&sentinel)?.include_head(include_head).walk())
}

/// Whether the list headed by `head` has no nodes.
///
/// ## Errors
///
/// As [`ListWalker::new`] and [`ListWalker::is_empty`].
pub fn list_empty(head: &TypedValue<'_>) -> KscopeResult<bool>
{
    ListWalker::new(head)?.is_empty()
}

/// Number of nodes in the list headed by `head`, verifying every link.
///
/// ## Errors
///
/// Any error the walk reports.
pub fn list_len(head: &TypedValue<'_>) -> KscopeResult<usize>
{
    let mut walk = ListWalker::new(head)?.walk();
    for node in walk.by_ref() {
        node?;
    }
    Ok(walk.visited())
}
