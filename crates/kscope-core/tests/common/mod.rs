//! Synthetic x86_64 kernel image shared by the integration tests
//!
//! Mirrors the list, rbtree and per-CPU fixtures of the C test programs:
//! the same shapes, the same corruptions, laid out at fixed addresses.

#![allow(dead_code)]

use std::rc::Rc;
use std::sync::Arc;

use kscope_core::layout::TypeId;
use kscope_core::prelude::*;

pub const NATURAL: AlignmentRule = AlignmentRule::Natural { max_align: 8 };

const fn at(value: u64) -> Address
{
    Address::new(value)
}

// Lists: struct list_head is 16 bytes, struct container 24 with the link at 8.
pub const NORMAL_HEAD: Address = at(0xffff_ffff_8200_1000);
pub const SHORT_LIST: Address = at(0xffff_ffff_8200_1100);
pub const CYCLE_HEAD: Address = at(0xffff_ffff_8200_2000);
pub const SHORT_LIST_WITH_CYCLE: Address = at(0xffff_ffff_8200_2100);
pub const BAD_LIST_HEAD: Address = at(0xffff_ffff_8200_3000);
pub const SHORT_LIST_WITH_BAD_PREV: Address = at(0xffff_ffff_8200_3100);
pub const GOOD_CONTAINER_LIST: Address = at(0xffff_ffff_8200_4000);
pub const GOOD_CONTAINERS: Address = at(0xffff_ffff_8200_4100);
pub const CYCLE_CONTAINER_LIST: Address = at(0xffff_ffff_8200_5000);
pub const CYCLE_CONTAINERS: Address = at(0xffff_ffff_8200_5100);
pub const BAD_CONTAINER_LIST: Address = at(0xffff_ffff_8200_6000);
pub const BAD_CONTAINERS: Address = at(0xffff_ffff_8200_6100);
pub const BAD_NEXT_PTR_LIST: Address = at(0xffff_ffff_8200_7000);
pub const BAD_PREV_PTR_LIST: Address = at(0xffff_ffff_8200_7100);
pub const EMPTY_LIST: Address = at(0xffff_ffff_8200_7200);
pub const WILD: Address = at(0xdead_beef);

// Klists: struct klist is 24 bytes with k_list at 8, struct klist_node 32
// with n_node at 8, struct klist_user 40 with the knode at 8.
pub const GOOD_KLIST: Address = at(0xffff_ffff_8200_d000);
pub const GOOD_KLIST_USERS: Address = at(0xffff_ffff_8200_d100);
pub const BAD_KLIST: Address = at(0xffff_ffff_8200_e000);
pub const BAD_KLIST_USERS: Address = at(0xffff_ffff_8200_e100);
pub const KLIST_USERS: u64 = 3;

// Trees: struct rb_node is 24 bytes (parent, right, left), struct
// number_node 32 with the node at 8.
pub const NAKED_NODE: Address = at(0xffff_ffff_8200_8000);
pub const EMPTY_TREE_ROOT: Address = at(0xffff_ffff_8200_8100);
pub const SINGULAR_TREE_ROOT: Address = at(0xffff_ffff_8200_8200);
pub const SINGULAR_TREE: Address = at(0xffff_ffff_8200_8300);
pub const FULL_BINARY_TREE_ROOT: Address = at(0xffff_ffff_8200_9000);
pub const FULL_BINARY_TREE: Address = at(0xffff_ffff_8200_9100);
pub const FULL_TREE_CACHED: Address = at(0xffff_ffff_8200_9800);
pub const LINEAR_BINARY_TREE_ROOT: Address = at(0xffff_ffff_8200_a000);
pub const LINEAR_BINARY_TREE: Address = at(0xffff_ffff_8200_a100);
pub const BROKEN_TREE_ROOT: Address = at(0xffff_ffff_8200_b000);
pub const BROKEN_TREE: Address = at(0xffff_ffff_8200_b100);

// Per-CPU section and the areas it is instantiated into.
pub const NR_CPUS: usize = 4;
pub const PER_CPU_START: Address = at(0xffff_ffff_8300_0000);
pub const PER_CPU_SIZE: u64 = 0x1000;
pub const PER_CPU_AREAS: u64 = 0xffff_8880_1000_0000;
pub const PER_CPU_STRIDE: u64 = 0x1_0000;
pub const STRUCT_TEST: Address = at(0xffff_ffff_8300_0000);
pub const ULONG_TEST: Address = at(0xffff_ffff_8300_0018);
pub const VOIDP_TEST: Address = at(0xffff_ffff_8300_0020);
pub const PTR_TO_STRUCT_TEST: Address = at(0xffff_ffff_8300_0028);
pub const PTR_TO_ULONG_TEST: Address = at(0xffff_ffff_8300_0030);
pub const COUNTER_DELTAS: Address = at(0xffff_ffff_8300_0038);
pub const PERCPU_TEST: Address = at(0xffff_ffff_8200_c000);
pub const NON_PERCPU_TEST: Address = at(0xffff_ffff_8200_c008);
pub const NR_THINGS: Address = at(0xffff_ffff_8200_c100);
pub const COUNTER_BASE: i64 = 100;
pub const COUNTER_DELTA_VALUES: [i32; NR_CPUS] = [5, -3, 7, 1];

pub fn spec() -> ArchSpec
{
    ArchSpec::native(TargetArch::X86_64)
}

/// Start of `cpu`'s per-CPU area (`__per_cpu_offset[cpu]`).
pub fn cpu_area(cpu: usize) -> u64
{
    PER_CPU_AREAS + PER_CPU_STRIDE * cpu as u64
}

/// `cpu`'s instance of the per-CPU variable at `template`.
pub fn instance(template: Address, cpu: usize) -> Address
{
    at(cpu_area(cpu) + (template.value() - PER_CPU_START.value()))
}

fn strukt(types: &TypeTableBuilder, name: &str, fields: &[(&str, TypeId)]) -> kscope_core::layout::TypeDescriptor
{
    fields
        .iter()
        .fold(StructBuilder::new(name, NATURAL), |builder, (field, ty)| {
            builder.field(types, field, *ty).unwrap()
        })
        .finish()
}

/// The layouts the fixtures use, as the C compiler would lay them out.
pub fn kernel_types() -> Arc<TypeTable>
{
    let mut types = TypeTableBuilder::new(8);
    let int = types.scalar("int", 4, ScalarKind::Signed);
    let uint = types.scalar("unsigned int", 4, ScalarKind::Unsigned);
    let long = types.scalar("long", 8, ScalarKind::Signed);
    let ulong = types.scalar("unsigned long", 8, ScalarKind::Unsigned);
    types.alias("long unsigned int", ulong);
    let void_ptr = types.pointer(None);

    let list_head = types.reserve("struct list_head");
    let list_ptr = types.pointer_to(list_head);
    let desc = strukt(&types, "struct list_head", &[("next", list_ptr), ("prev", list_ptr)]);
    types.define(list_head, desc).unwrap();

    let container = strukt(&types, "struct container", &[("someval", ulong), ("list", list_head)]);
    let container = types.add(container);
    let containers = types.array_of(container, Some(5)).unwrap();
    types.alias("struct container [5]", containers);

    let klist = strukt(&types, "struct klist", &[("k_lock", uint), ("k_list", list_head)]);
    types.add(klist);
    let klist_node = strukt(
        &types,
        "struct klist_node",
        &[("n_klist", void_ptr), ("n_node", list_head), ("n_ref", int)],
    );
    let klist_node = types.add(klist_node);
    let klist_user = strukt(&types, "struct klist_user", &[("id", ulong), ("knode", klist_node)]);
    types.add(klist_user);

    let rb_node = types.reserve("struct rb_node");
    let rb_ptr = types.pointer_to(rb_node);
    let desc = strukt(
        &types,
        "struct rb_node",
        &[("__rb_parent_color", ulong), ("rb_right", rb_ptr), ("rb_left", rb_ptr)],
    );
    types.define(rb_node, desc).unwrap();
    let rb_root = strukt(&types, "struct rb_root", &[("rb_node", rb_ptr)]);
    let rb_root = types.add(rb_root);
    let cached = strukt(&types, "struct rb_root_cached", &[("rb_root", rb_root), ("rb_leftmost", rb_ptr)]);
    types.add(cached);
    let number_node = strukt(&types, "struct number_node", &[("v", int), ("rb", rb_node)]);
    types.add(number_node);

    let test_struct = strukt(&types, "struct test_struct", &[("x", int), ("ulong", ulong), ("ptr", void_ptr)]);
    types.add(test_struct);

    let int_ptr = types.pointer_to(int);
    let counter = strukt(&types, "struct percpu_counter", &[("count", long), ("counters", int_ptr)]);
    types.add(counter);

    types.build().unwrap()
}

fn link(memory: &SparseMemory, node: Address, next: Address, prev: Address)
{
    memory.write_pointer(node, next);
    memory.write_pointer(node + 8, prev);
}

fn nth(base: Address, index: u64, stride: u64) -> Address
{
    base + index * stride
}

fn write_lists(memory: &SparseMemory)
{
    let short = |i| nth(SHORT_LIST, i, 16);
    for i in 0..5 {
        let next = if i == 4 { NORMAL_HEAD } else { short(i + 1) };
        let prev = if i == 0 { NORMAL_HEAD } else { short(i - 1) };
        link(memory, short(i), next, prev);
    }
    link(memory, NORMAL_HEAD, short(0), short(4));

    let cycle = |i| nth(SHORT_LIST_WITH_CYCLE, i, 16);
    link(memory, cycle(0), cycle(1), CYCLE_HEAD);
    link(memory, cycle(1), cycle(2), cycle(0));
    link(memory, cycle(2), cycle(3), cycle(1));
    link(memory, cycle(3), cycle(1), cycle(2));
    link(memory, cycle(4), CYCLE_HEAD, cycle(3));
    link(memory, CYCLE_HEAD, cycle(0), cycle(4));

    let bad = |i| nth(SHORT_LIST_WITH_BAD_PREV, i, 16);
    link(memory, bad(0), bad(1), BAD_LIST_HEAD);
    link(memory, bad(1), bad(2), bad(0));
    link(memory, bad(2), bad(3), bad(0));
    link(memory, bad(3), bad(1), bad(2));
    link(memory, bad(4), BAD_LIST_HEAD, bad(3));
    link(memory, BAD_LIST_HEAD, short(0), short(4));

    write_containers(memory, GOOD_CONTAINER_LIST, GOOD_CONTAINERS, |i| i + 1, |i| i.checked_sub(1));
    write_containers(
        memory,
        CYCLE_CONTAINER_LIST,
        CYCLE_CONTAINERS,
        |i| if i == 3 { 1 } else { i + 1 },
        |i| i.checked_sub(1),
    );
    write_containers(
        memory,
        BAD_CONTAINER_LIST,
        BAD_CONTAINERS,
        |i| i + 1,
        |i| if i == 3 { Some(1) } else { i.checked_sub(1) },
    );

    link(memory, BAD_NEXT_PTR_LIST, WILD, BAD_NEXT_PTR_LIST);
    link(memory, BAD_PREV_PTR_LIST, BAD_PREV_PTR_LIST, WILD);
    link(memory, EMPTY_LIST, EMPTY_LIST, EMPTY_LIST);
}

/// Five `struct container`s tagged `0xdead0000..=0xdead0004`; `next`/`prev`
/// give each element's neighbour index (`None`/`5` meaning the head).
fn write_containers(
    memory: &SparseMemory,
    head: Address,
    base: Address,
    next: impl Fn(u64) -> u64,
    prev: impl Fn(u64) -> Option<u64>,
)
{
    let element = |i| nth(base, i, 24);
    let list = |i| element(i) + 8;
    for i in 0..5 {
        memory.write_u64(element(i), 0xdead_0000 + i);
        let next = match next(i) {
            5 => head,
            n => list(n),
        };
        let prev = prev(i).map_or(head, list);
        link(memory, list(i), next, prev);
    }
    link(memory, head, list(0), list(4));
}

/// `struct klist_user`'s `knode` address for user `index` of `users`.
pub fn klist_node(users: Address, index: u64) -> Address
{
    nth(users, index, 40) + 8
}

/// Three `struct klist_user`s with ids `0x1000..=0x1002` on `klist`;
/// `owner` gives each node's raw `n_klist`.
fn write_klist(memory: &SparseMemory, klist: Address, users: Address, owner: impl Fn(u64) -> u64)
{
    let head = klist + 8;
    let n_node = |i| klist_node(users, i) + 8;
    memory.write_u32(klist, 0);
    for i in 0..KLIST_USERS {
        memory.write_u64(nth(users, i, 40), 0x1000 + i);
        memory.write_u64(klist_node(users, i), owner(i));
        memory.write_u32(n_node(i) + 16, 1);
        let next = if i + 1 == KLIST_USERS { head } else { n_node(i + 1) };
        let prev = if i == 0 { head } else { n_node(i - 1) };
        link(memory, n_node(i), next, prev);
    }
    link(memory, head, n_node(0), n_node(KLIST_USERS - 1));
}

fn write_klists(memory: &SparseMemory)
{
    // The second node has been deleted but is still referenced.
    write_klist(memory, GOOD_KLIST, GOOD_KLIST_USERS, |i| {
        GOOD_KLIST.value() | u64::from(i == 1)
    });
    // The second node claims to be on good_klist.
    write_klist(memory, BAD_KLIST, BAD_KLIST_USERS, |i| {
        if i == 1 { GOOD_KLIST.value() } else { BAD_KLIST.value() }
    });
}

const RB_RED: u64 = 0;
const RB_BLACK: u64 = 1;

fn rb(memory: &SparseMemory, node: Address, parent: Address, color: u64, left: Address, right: Address)
{
    memory.write_u64(node, parent.value() | color);
    memory.write_pointer(node + 8, right);
    memory.write_pointer(node + 16, left);
}

/// Seven `struct number_node`s forming a full tree, `v` = index, root 0,
/// children of `i` at `2i + 1` and `2i + 2`.
fn write_full_tree(memory: &SparseMemory, base: Address, wrong_parent_of: Option<u64>)
{
    let node = |i: u64| nth(base, i, 32) + 8;
    for i in 0..7u64 {
        memory.write_u32(nth(base, i, 32), i as u32);
        let parent = if i == 0 { Address::ZERO } else { node((i - 1) / 2) };
        let parent = match wrong_parent_of {
            Some(bad) if bad == i => node(2),
            _ => parent,
        };
        let (left, right) = if i < 3 {
            (node(2 * i + 1), node(2 * i + 2))
        } else {
            (Address::ZERO, Address::ZERO)
        };
        let color = if i == 1 || i == 2 { RB_RED } else { RB_BLACK };
        rb(memory, node(i), parent, color, left, right);
    }
}

fn write_trees(memory: &SparseMemory)
{
    rb(memory, NAKED_NODE, Address::ZERO, RB_BLACK, Address::ZERO, Address::ZERO);
    memory.write_pointer(EMPTY_TREE_ROOT, Address::ZERO);

    rb(memory, SINGULAR_TREE, Address::ZERO, RB_BLACK, Address::ZERO, Address::ZERO);
    memory.write_pointer(SINGULAR_TREE_ROOT, SINGULAR_TREE);

    write_full_tree(memory, FULL_BINARY_TREE, None);
    memory.write_pointer(FULL_BINARY_TREE_ROOT, FULL_BINARY_TREE + 8);
    memory.write_pointer(FULL_TREE_CACHED, FULL_BINARY_TREE + 8);
    memory.write_pointer(FULL_TREE_CACHED + 8, nth(FULL_BINARY_TREE, 3, 32) + 8);

    // Left child 1 of the root, whose right child 2 is a leaf.
    let linear = |i: u64| nth(LINEAR_BINARY_TREE, i, 32) + 8;
    for i in 0..3u64 {
        memory.write_u32(nth(LINEAR_BINARY_TREE, i, 32), i as u32);
    }
    rb(memory, linear(0), Address::ZERO, RB_BLACK, linear(1), Address::ZERO);
    rb(memory, linear(1), linear(0), RB_RED, Address::ZERO, linear(2));
    rb(memory, linear(2), linear(1), RB_BLACK, Address::ZERO, Address::ZERO);
    memory.write_pointer(LINEAR_BINARY_TREE_ROOT, linear(0));

    // Node 4 claims node 2 as its parent instead of node 1.
    write_full_tree(memory, BROKEN_TREE, Some(4));
    memory.write_pointer(BROKEN_TREE_ROOT, BROKEN_TREE + 8);
}

fn write_percpu(memory: &SparseMemory)
{
    memory.map_zeroed(PER_CPU_START, PER_CPU_SIZE as usize);
    for cpu in 0..NR_CPUS {
        let area = at(cpu_area(cpu));
        memory.map_zeroed(area, PER_CPU_SIZE as usize);

        let test = instance(STRUCT_TEST, cpu);
        memory.write_u32(test, cpu as u32);
        memory.write_u64(test + 8, cpu as u64);
        memory.write_pointer(test + 16, Address::ZERO);

        memory.write_u64(instance(ULONG_TEST, cpu), cpu as u64);
        memory.write_pointer(instance(VOIDP_TEST, cpu), WILD);
        memory.write_pointer(instance(PTR_TO_STRUCT_TEST, cpu), test);
        memory.write_pointer(instance(PTR_TO_ULONG_TEST, cpu), test + 8);
        memory.write_u32(instance(COUNTER_DELTAS, cpu), COUNTER_DELTA_VALUES[cpu] as u32);
    }
    memory.write_pointer(PERCPU_TEST, STRUCT_TEST);
    memory.write_pointer(NON_PERCPU_TEST, instance(STRUCT_TEST, 0));
    memory.write_u64(NR_THINGS, COUNTER_BASE as u64);
    memory.write_pointer(NR_THINGS + 8, COUNTER_DELTAS);
}

/// The whole synthetic image.
pub fn memory() -> SparseMemory
{
    let offsets = (0..NR_CPUS).map(cpu_area).collect();
    let memory = SparseMemory::new(spec()).with_per_cpu_offsets(offsets);
    write_lists(&memory);
    write_klists(&memory);
    write_trees(&memory);
    write_percpu(&memory);
    memory
}

/// Debug information describing [`memory`].
pub fn debug_info() -> StaticDebugInfo
{
    let symbols: &[(&str, Address, Option<&str>)] = &[
        ("normal_head", NORMAL_HEAD, Some("struct list_head")),
        ("cycle_head", CYCLE_HEAD, Some("struct list_head")),
        ("bad_list_head", BAD_LIST_HEAD, Some("struct list_head")),
        ("good_container_list", GOOD_CONTAINER_LIST, Some("struct list_head")),
        ("good_containers", GOOD_CONTAINERS, Some("struct container [5]")),
        ("cycle_container_list", CYCLE_CONTAINER_LIST, Some("struct list_head")),
        ("bad_container_list", BAD_CONTAINER_LIST, Some("struct list_head")),
        ("bad_next_ptr_list", BAD_NEXT_PTR_LIST, Some("struct list_head")),
        ("bad_prev_ptr_list", BAD_PREV_PTR_LIST, Some("struct list_head")),
        ("empty_list", EMPTY_LIST, Some("struct list_head")),
        ("good_klist", GOOD_KLIST, Some("struct klist")),
        ("bad_klist", BAD_KLIST, Some("struct klist")),
        ("naked_node", NAKED_NODE, Some("struct rb_node")),
        ("empty_tree_root", EMPTY_TREE_ROOT, Some("struct rb_root")),
        ("singular_tree_root", SINGULAR_TREE_ROOT, Some("struct rb_root")),
        ("full_binary_tree_root", FULL_BINARY_TREE_ROOT, Some("struct rb_root")),
        ("full_tree_cached", FULL_TREE_CACHED, Some("struct rb_root_cached")),
        ("linear_binary_tree_root", LINEAR_BINARY_TREE_ROOT, Some("struct rb_root")),
        ("broken_tree_root", BROKEN_TREE_ROOT, Some("struct rb_root")),
        ("__per_cpu_start", PER_CPU_START, None),
        ("__per_cpu_end", PER_CPU_START + PER_CPU_SIZE, None),
        ("struct_test", STRUCT_TEST, Some("struct test_struct")),
        ("ulong_test", ULONG_TEST, Some("unsigned long")),
        ("voidp_test", VOIDP_TEST, Some("void *")),
        ("ptr_to_struct_test", PTR_TO_STRUCT_TEST, Some("struct test_struct *")),
        ("ptr_to_ulong_test", PTR_TO_ULONG_TEST, Some("unsigned long *")),
        ("percpu_test", PERCPU_TEST, Some("struct test_struct *")),
        ("non_percpu_test", NON_PERCPU_TEST, Some("struct test_struct *")),
        ("nr_things", NR_THINGS, Some("struct percpu_counter")),
    ];
    let mut info = StaticDebugInfo::new("vmlinux", spec()).with_types(kernel_types());
    for (name, address, type_name) in symbols {
        info.add_symbol(name, *address, *type_name);
    }
    info
}

/// A session over the fixture image, plus a handle on the image itself.
pub fn session() -> (Rc<SparseMemory>, Session)
{
    kscope_utils::init_test_logging();
    let memory = Rc::new(memory());
    let session = Session::attach(
        Box::new(Rc::clone(&memory)),
        Box::new(debug_info()),
        TraversalConfig::default(),
    )
    .unwrap();
    (memory, session)
}

/// `someval` of a `struct container`.
pub fn tag(container: &TypedValue<'_>) -> u64
{
    container.field("someval").unwrap().as_u64().unwrap()
}

/// `id` of a `struct klist_user`.
pub fn user_id(user: &TypedValue<'_>) -> u64
{
    user.field("id").unwrap().as_u64().unwrap()
}

/// `v` of a `struct number_node`.
pub fn number(node: &TypedValue<'_>) -> i64
{
    node.field("v").unwrap().as_i64().unwrap()
}
