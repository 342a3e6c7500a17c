//! Tests for session attachment and the architecture context

mod common;

use common::*;
use kscope_core::prelude::*;
use kscope_core::walk::list_len;

fn attach(memory: SparseMemory, debug_info: StaticDebugInfo) -> KscopeResult<Session>
{
    kscope_utils::init_test_logging();
    Session::attach(Box::new(memory), Box::new(debug_info), TraversalConfig::default())
}

/// A three-node list laid out for a 32-bit image.
fn i386_image(memory: &SparseMemory) -> StaticDebugInfo
{
    let mut types = TypeTableBuilder::new(4);
    let list_head = types.reserve("struct list_head");
    let list_ptr = types.pointer_to(list_head);
    let desc = StructBuilder::new("struct list_head", AlignmentRule::Natural { max_align: 4 })
        .field(&types, "next", list_ptr)
        .unwrap()
        .field(&types, "prev", list_ptr)
        .unwrap()
        .finish();
    types.define(list_head, desc).unwrap();

    let head = Address::new(0xc100_0000);
    let node = |i: u64| Address::new(0xc100_0100 + i * 8);
    let link = |at: Address, next: Address, prev: Address| {
        memory.write_pointer(at, next);
        memory.write_pointer(at + 4, prev);
    };
    link(head, node(0), node(2));
    link(node(0), node(1), head);
    link(node(1), node(2), node(0));
    link(node(2), head, node(1));

    StaticDebugInfo::new("vmlinux", ArchSpec::native(TargetArch::X86))
        .with_types(types.build().unwrap())
        .with_symbol("i386_head", head, Some("struct list_head"))
}

#[test]
fn test_context_from_image()
{
    let (_memory, session) = session();
    let context = session.context();
    assert_eq!(context.arch(), TargetArch::X86_64);
    assert_eq!(context.pointer_size(), 8);
    assert_eq!(context.byte_order(), ByteOrder::Little);
    assert_eq!(context.struct_padding_rule(), AlignmentRule::Natural { max_align: 8 });
    assert_eq!(session.target().context().session_id(), context.session_id());
}

#[test]
fn test_sessions_are_distinct()
{
    let (_first_memory, first) = session();
    let (_second_memory, second) = session();
    assert_ne!(first.context().session_id(), second.context().session_id());
}

#[test]
fn test_mismatched_debug_info_is_rejected()
{
    let memory = SparseMemory::new(spec());
    let debug_info = StaticDebugInfo::new("vmlinux", ArchSpec::native(TargetArch::X86));
    match attach(memory, debug_info) {
        Err(KscopeError::IncompatibleHost { expected, found }) => {
            assert!(expected.contains("x86_64"));
            assert!(found.contains("i386"));
        }
        other => panic!("expected IncompatibleHost, got {other:?}"),
    }
}

#[test]
fn test_byte_order_mismatch_is_rejected()
{
    let memory = SparseMemory::new(ArchSpec::native(TargetArch::Ppc64));
    let debug_info = StaticDebugInfo::new("vmlinux", ArchSpec::native(TargetArch::Ppc64le));
    assert!(matches!(
        attach(memory, debug_info),
        Err(KscopeError::IncompatibleHost { .. })
    ));
}

#[test]
fn test_raw_window_adopts_debug_info_architecture()
{
    let memory = SparseMemory::new(ArchSpec::native(TargetArch::X86)).without_architecture();
    let debug_info = i386_image(&memory);
    let session = attach(memory, debug_info).unwrap();
    assert_eq!(session.context().pointer_size(), 4);
    assert_eq!(session.context().struct_padding_rule(), AlignmentRule::Natural { max_align: 4 });
}

#[test]
fn test_32_bit_pointers_never_drift()
{
    let memory = SparseMemory::new(ArchSpec::native(TargetArch::X86));
    let debug_info = i386_image(&memory);
    let session = attach(memory, debug_info).unwrap();

    let head = session.symbol_value("i386_head").unwrap();
    assert_eq!(head.ty().size(), 8);
    assert_eq!(head.field("prev").unwrap().address(), Some(Address::new(0xc100_0004)));
    assert_eq!(list_len(&head).unwrap(), 3);

    let pointer = session.lookup_type("struct list_head *").unwrap().ty;
    assert_eq!(pointer.size(), 4);
    assert_eq!(head.address_of().unwrap().read_bytes().unwrap().len(), 4);
}

#[test]
fn test_big_endian_decoding()
{
    let big = ArchSpec::native(TargetArch::S390x);
    let memory = SparseMemory::new(big);
    memory.write_bytes(Address::new(0x1000), &[0, 0, 0, 0, 0x12, 0x34, 0x56, 0x78]);

    let session = attach(
        memory,
        StaticDebugInfo::new("vmlinux", big)
            .with_types(kernel_types())
            .with_symbol("jiffies", Address::new(0x1000), Some("unsigned long")),
    )
    .unwrap();
    assert_eq!(session.context().byte_order(), ByteOrder::Big);
    assert_eq!(session.symbol_value("jiffies").unwrap().as_u64().unwrap(), 0x1234_5678);
}

#[test]
fn test_translate()
{
    let base = Address::new(0xffff_8880_0000_0000);
    let memory = SparseMemory::new(spec()).with_direct_map(base, 0x1_0000_0000);
    let session = attach(memory, StaticDebugInfo::new("vmlinux", spec())).unwrap();

    assert_eq!(session.translate(base + 0x1234).unwrap(), Address::new(0x1234));
    let outside = Address::new(0xffff_ffff_8100_0000);
    match session.translate(outside) {
        Err(KscopeError::Untranslatable(failure)) => assert_eq!(failure.address, outside),
        other => panic!("expected Untranslatable, got {other:?}"),
    }
}

#[test]
fn test_without_per_cpu_section()
{
    let session = attach(SparseMemory::new(spec()), StaticDebugInfo::new("vmlinux", spec())).unwrap();
    assert_eq!(session.percpu().nr_cpus(), 0);
    assert_eq!(session.percpu().static_range(), None);
    assert_eq!(session.config(), &TraversalConfig::default());
}

#[test]
fn test_close()
{
    let (memory, session) = session();
    let reads = memory.read_count();
    session.close();
    assert_eq!(memory.read_count(), reads);
}
