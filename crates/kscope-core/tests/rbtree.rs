//! Tests for red-black tree traversal

mod common;

use common::*;
use kscope_core::prelude::*;
use kscope_core::walk::{walk_tree, TreeFields};

fn numbers(session: &Session, root: &str, order: TreeOrder) -> Vec<i64>
{
    let root = session.symbol_value(root).unwrap();
    let number_node = session.lookup_type("struct number_node").unwrap().ty;
    TreeWalker::new(&root)
        .unwrap()
        .order(order)
        .entries(&number_node, "rb")
        .unwrap()
        .walk()
        .map(|node| number(&node.unwrap()))
        .collect()
}

#[test]
fn test_empty_tree()
{
    let (_memory, session) = session();
    let root = session.symbol_value("empty_tree_root").unwrap();
    let mut walk = walk_tree(&root).unwrap();
    assert!(walk.next().is_none());
    assert_eq!(walk.state(), WalkState::Exhausted);
}

#[test]
fn test_singular_tree()
{
    let (_memory, session) = session();
    let root = session.symbol_value("singular_tree_root").unwrap();
    let nodes: Vec<Address> = walk_tree(&root)
        .unwrap()
        .map(|node| node.unwrap().address().unwrap())
        .collect();
    assert_eq!(nodes, vec![SINGULAR_TREE]);
}

#[test]
fn test_full_binary_tree_in_order()
{
    let (_memory, session) = session();
    assert_eq!(
        numbers(&session, "full_binary_tree_root", TreeOrder::InOrder),
        vec![3, 1, 4, 0, 5, 2, 6]
    );
}

#[test]
fn test_full_binary_tree_post_order()
{
    let (_memory, session) = session();
    assert_eq!(
        numbers(&session, "full_binary_tree_root", TreeOrder::PostOrder),
        vec![3, 4, 1, 5, 6, 2, 0]
    );
}

#[test]
fn test_linear_binary_tree()
{
    let (_memory, session) = session();
    assert_eq!(numbers(&session, "linear_binary_tree_root", TreeOrder::InOrder), vec![1, 2, 0]);
    assert_eq!(numbers(&session, "linear_binary_tree_root", TreeOrder::PostOrder), vec![2, 1, 0]);
}

#[test]
fn test_cached_root()
{
    let (_memory, session) = session();
    assert_eq!(numbers(&session, "full_tree_cached", TreeOrder::InOrder).len(), 7);
}

#[test]
fn test_root_by_pointer()
{
    let (_memory, session) = session();
    let root = session.symbol_value("full_binary_tree_root").unwrap();
    let pointer = root.address_of().unwrap();
    assert_eq!(walk_tree(&pointer).unwrap().count(), 7);
}

#[test]
fn test_subtree_by_node_pointer()
{
    let (_memory, session) = session();
    let root = session.symbol_value("full_binary_tree_root").unwrap();
    let top = root.field("rb_node").unwrap().dereference().unwrap();
    let left = top.field("rb_left").unwrap();

    let number_node = session.lookup_type("struct number_node").unwrap().ty;
    let values: Vec<i64> = TreeWalker::new(&left)
        .unwrap()
        .entries(&number_node, "rb")
        .unwrap()
        .walk()
        .map(|node| number(&node.unwrap()))
        .collect();
    assert_eq!(values, vec![3, 1, 4]);
}

#[test]
fn test_null_node_pointer_is_empty()
{
    let (_memory, session) = session();
    let leaf = session.value_at(FULL_BINARY_TREE + 3 * 32 + 8, "struct rb_node").unwrap();
    let walker = TreeWalker::new(&leaf.field("rb_left").unwrap()).unwrap();
    assert_eq!(walker.walk().count(), 0);
}

#[test]
fn test_broken_parent()
{
    let (_memory, session) = session();
    let number_node = session.lookup_type("struct number_node").unwrap().ty;
    let root = session.symbol_value("broken_tree_root").unwrap();

    let mut values = Vec::new();
    let mut failure = None;
    for node in TreeWalker::new(&root).unwrap().entries(&number_node, "rb").unwrap().walk() {
        match node {
            Ok(node) => values.push(number(&node)),
            Err(err) => failure = Some(err),
        }
    }
    assert_eq!(values, vec![3, 1]);

    let node = |i: u64| BROKEN_TREE + i * 32 + 8;
    match failure {
        Some(KscopeError::CorruptTree {
            address,
            reason: TreeCorruption::WrongParent { expected, found },
            ..
        }) => {
            assert_eq!(address, node(4));
            assert_eq!(expected, node(1));
            assert_eq!(found, node(2));
        }
        other => panic!("expected a parent mismatch, got {other:?}"),
    }
}

#[test]
fn test_root_with_parent_is_corrupt()
{
    let (memory, session) = session();
    memory.write_u64(SINGULAR_TREE, NAKED_NODE.value() | 1);
    let root = session.symbol_value("singular_tree_root").unwrap();

    let result: KscopeResult<Vec<_>> = walk_tree(&root).unwrap().collect();
    assert!(matches!(
        result,
        Err(KscopeError::CorruptTree { reason: TreeCorruption::WrongParent { expected, .. }, .. }) if expected == Address::ZERO
    ));
}

#[test]
fn test_colour_bits_are_masked()
{
    let (memory, session) = session();
    // Red and black children both carry their parent in the upper bits.
    let node = |i: u64| FULL_BINARY_TREE + i * 32 + 8;
    memory.write_u64(node(3), node(1).value() | 0b11);
    assert_eq!(numbers(&session, "full_binary_tree_root", TreeOrder::InOrder).len(), 7);
}

#[test]
fn test_unreadable_node()
{
    let (memory, session) = session();
    let node = |i: u64| FULL_BINARY_TREE + i * 32 + 8;
    memory.write_pointer(node(2) + 8, WILD);
    let root = session.symbol_value("full_binary_tree_root").unwrap();

    let results: Vec<_> = walk_tree(&root).unwrap().collect();
    // 3, 1, 4, 0, 5, 2 come out before the right child of 2 is entered.
    assert_eq!(results.iter().filter(|node| node.is_ok()).count(), 6);
    match results.last() {
        Some(Err(KscopeError::CorruptTree {
            address,
            reason: TreeCorruption::UnreadableNode,
            source,
        })) => {
            assert_eq!(*address, WILD);
            assert!(matches!(source.as_deref(), Some(KscopeError::UnreadableMemory { .. })));
        }
        other => panic!("expected an unreadable node, got {other:?}"),
    }
}

#[test]
fn test_depth_bound()
{
    let (_memory, session) = session();
    let root = session.symbol_value("linear_binary_tree_root").unwrap();
    let results: Vec<_> = TreeWalker::new(&root).unwrap().max_depth(2).walk().collect();
    assert!(matches!(results.last(), Some(Err(KscopeError::UnterminatedTree { .. }))));
}

#[test]
fn test_node_bound()
{
    let (_memory, session) = session();
    let root = session.symbol_value("full_binary_tree_root").unwrap();
    let results: Vec<_> = TreeWalker::new(&root).unwrap().max_nodes(4).walk().collect();
    assert!(matches!(
        results.last(),
        Some(Err(KscopeError::UnterminatedTree { visited: 4, .. }))
    ));
}

#[test]
fn test_self_loop_is_bounded()
{
    let (memory, session) = session();
    // A node that is its own left child, with a matching parent word.
    memory.write_u64(SINGULAR_TREE, SINGULAR_TREE.value());
    memory.write_pointer(SINGULAR_TREE + 16, SINGULAR_TREE);
    memory.write_pointer(SINGULAR_TREE_ROOT, SINGULAR_TREE);
    let root = session.symbol_value("singular_tree_root").unwrap();

    // The root itself now fails the null-parent check.
    let result: KscopeResult<Vec<_>> = walk_tree(&root).unwrap().collect();
    assert!(matches!(result, Err(KscopeError::CorruptTree { .. })));

    // Entered directly, the loop runs into the depth bound instead.
    let pointer = root.field("rb_node").unwrap();
    let result: KscopeResult<Vec<_>> = TreeWalker::new(&pointer).unwrap().max_depth(16).walk().collect();
    assert!(matches!(result, Err(KscopeError::UnterminatedTree { .. })));
}

#[test]
fn test_not_a_tree()
{
    let (_memory, session) = session();
    let naked = session.symbol_value("naked_node").unwrap();
    assert!(matches!(TreeWalker::new(&naked), Err(KscopeError::InvalidKind { .. })));

    let scalar = session.symbol_value("nr_things").unwrap().field("count").unwrap();
    assert!(matches!(TreeWalker::new(&scalar), Err(KscopeError::InvalidKind { .. })));

    let pointer = session.value_at(FULL_BINARY_TREE_ROOT, "unsigned int *").unwrap();
    assert!(matches!(TreeWalker::new(&pointer), Err(KscopeError::InvalidKind { .. })));
}

#[test]
fn test_custom_field_names()
{
    let (_memory, session) = session();
    let root = session.symbol_value("full_binary_tree_root").unwrap();

    let fields = TreeFields {
        left: "rb_right".to_string(),
        right: "rb_left".to_string(),
        ..TreeFields::default()
    };
    let number_node = session.lookup_type("struct number_node").unwrap().ty;
    let mirrored: Vec<i64> = TreeWalker::with_fields(&root, fields)
        .unwrap()
        .entries(&number_node, "rb")
        .unwrap()
        .walk()
        .map(|node| number(&node.unwrap()))
        .collect();
    assert_eq!(mirrored, vec![6, 2, 5, 0, 4, 1, 3]);

    let bogus = TreeFields {
        parent_color: "parent".to_string(),
        ..TreeFields::default()
    };
    assert!(matches!(
        TreeWalker::with_fields(&root, bogus),
        Err(KscopeError::InvalidKind { .. })
    ));
}

#[test]
fn test_session_tree_walker_uses_config()
{
    kscope_utils::init_test_logging();
    let config = TraversalConfig {
        max_tree_nodes: 3,
        ..TraversalConfig::default()
    };
    let session = Session::attach(Box::new(common::memory()), Box::new(common::debug_info()), config).unwrap();
    let root = session.symbol_value("full_binary_tree_root").unwrap();
    let result: KscopeResult<Vec<_>> = session.tree_walker(&root).unwrap().walk().collect();
    assert!(matches!(result, Err(KscopeError::UnterminatedTree { .. })));
}
