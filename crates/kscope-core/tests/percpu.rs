//! Tests for per-CPU variable resolution

mod common;

use common::*;
use kscope_core::percpu::counter_sum;
use kscope_core::prelude::*;

#[test]
fn test_struct_instances()
{
    let (_memory, session) = session();
    let template = session.symbol_value("struct_test").unwrap();
    assert!(template.is_per_cpu());

    for cpu in 0..NR_CPUS {
        let value = template.per_cpu(cpu).unwrap();
        assert_eq!(value.address(), Some(instance(STRUCT_TEST, cpu)));
        assert_eq!(value.field("x").unwrap().as_i64().unwrap(), cpu as i64);
        assert_eq!(value.field("ulong").unwrap().as_u64().unwrap(), cpu as u64);
        assert!(!value.is_per_cpu());
    }
}

#[test]
fn test_member_of_template_resolves_per_cpu()
{
    let (_memory, session) = session();
    let ulong = session.symbol_value("struct_test").unwrap().field("ulong").unwrap();
    assert!(ulong.is_per_cpu());
    assert_eq!(ulong.per_cpu(3).unwrap().as_u64().unwrap(), 3);
}

#[test]
fn test_scalar_instances()
{
    let (_memory, session) = session();
    let values: Vec<u64> = session
        .symbol_value("ulong_test")
        .unwrap()
        .per_cpu_all()
        .unwrap()
        .iter()
        .map(|value| value.as_u64().unwrap())
        .collect();
    assert_eq!(values, vec![0, 1, 2, 3]);
}

#[test]
fn test_pointer_instances()
{
    let (_memory, session) = session();
    let voidp = session.symbol_value("voidp_test").unwrap();
    let to_struct = session.symbol_value("ptr_to_struct_test").unwrap();
    let to_ulong = session.symbol_value("ptr_to_ulong_test").unwrap();

    for cpu in 0..NR_CPUS {
        assert_eq!(voidp.per_cpu(cpu).unwrap().as_address().unwrap(), WILD);

        let test = to_struct.per_cpu(cpu).unwrap().dereference().unwrap();
        assert_eq!(test.field("x").unwrap().as_i64().unwrap(), cpu as i64);

        let ulong = to_ulong.per_cpu(cpu).unwrap().dereference().unwrap();
        assert_eq!(ulong.as_u64().unwrap(), cpu as u64);
    }
}

#[test]
fn test_void_pointer_cannot_be_dereferenced()
{
    let (_memory, session) = session();
    let voidp = session.symbol_value("voidp_test").unwrap().per_cpu(0).unwrap();
    assert!(matches!(voidp.dereference(), Err(KscopeError::InvalidKind { .. })));
}

#[test]
fn test_cpu_out_of_range_reads_nothing()
{
    let (memory, session) = session();
    let template = session.symbol_value("struct_test").unwrap();

    let reads = memory.read_count();
    assert!(matches!(
        template.per_cpu(NR_CPUS),
        Err(KscopeError::CpuOutOfRange { cpu: NR_CPUS, nr_cpus: NR_CPUS })
    ));
    assert!(matches!(
        session.symbol_value("percpu_test").unwrap().per_cpu_ptr(NR_CPUS),
        Err(KscopeError::CpuOutOfRange { .. })
    ));
    assert_eq!(memory.read_count(), reads);
}

#[test]
fn test_not_per_cpu()
{
    let (_memory, session) = session();
    let value = session.symbol_value("non_percpu_test").unwrap();
    assert!(!value.is_per_cpu());
    assert!(matches!(value.per_cpu(0), Err(KscopeError::NotPerCpu(address)) if address == NON_PERCPU_TEST));
    assert!(matches!(
        session.per_cpu_variable("non_percpu_test"),
        Err(KscopeError::NotPerCpu(_))
    ));
}

#[test]
fn test_per_cpu_pointer()
{
    let (_memory, session) = session();
    let pointer = session.symbol_value("percpu_test").unwrap();
    for cpu in 0..NR_CPUS {
        let test = pointer.per_cpu_ptr(cpu).unwrap();
        assert_eq!(test.address(), Some(instance(STRUCT_TEST, cpu)));
        assert_eq!(test.field("x").unwrap().as_i64().unwrap(), cpu as i64);
    }

    let scalar = session.symbol_value("nr_things").unwrap().field("count").unwrap();
    assert!(matches!(scalar.per_cpu_ptr(0), Err(KscopeError::InvalidKind { .. })));
}

#[test]
fn test_counter_sum()
{
    let (_memory, session) = session();
    let counter = session.symbol_value("nr_things").unwrap();
    let expected = COUNTER_BASE + COUNTER_DELTA_VALUES.iter().map(|delta| i64::from(*delta)).sum::<i64>();
    assert_eq!(expected, 110);
    assert_eq!(counter_sum(&counter).unwrap(), expected);
    assert_eq!(counter_sum(&counter.address_of().unwrap()).unwrap(), expected);
}

#[test]
fn test_per_cpu_variable()
{
    let (_memory, session) = session();
    let variable = session.per_cpu_variable("ulong_test").unwrap();
    assert_eq!(variable.base(), ULONG_TEST);
    assert_eq!(variable.template().name(), "unsigned long");

    let target = session.target();
    assert_eq!(variable.instance(target, 2).unwrap().as_u64().unwrap(), 2);
    assert_eq!(variable.all(target).unwrap().len(), NR_CPUS);
}

#[test]
fn test_table_from_attach()
{
    let (_memory, session) = session();
    let table = session.percpu();
    assert_eq!(table.nr_cpus(), NR_CPUS);
    assert_eq!(table.static_range(), Some((PER_CPU_START, PER_CPU_SIZE)));
    assert_eq!(table.offset(1).unwrap(), cpu_area(1));
    assert!(table.is_static_percpu(COUNTER_DELTAS));
    assert!(!table.is_static_percpu(NR_THINGS));
}

#[test]
fn test_zero_based_section()
{
    kscope_utils::init_test_logging();
    // Without the section symbols, symbol addresses are used as offsets.
    let memory = SparseMemory::new(spec()).with_per_cpu_offsets(vec![0x1000, 0x2000]);
    memory.write_u64(Address::new(0x1010), 7);
    memory.write_u64(Address::new(0x2010), 9);

    let session = Session::attach(
        Box::new(memory),
        Box::new(StaticDebugInfo::new("vmlinux", spec()).with_types(kernel_types())),
        TraversalConfig::default(),
    )
    .unwrap();
    let ulong = session.lookup_type("unsigned long").unwrap().ty;
    let variable = PerCpuVariable::new(ulong, Address::new(0x10));

    let values: Vec<u64> = variable
        .all(session.target())
        .unwrap()
        .iter()
        .map(|value| value.as_u64().unwrap())
        .collect();
    assert_eq!(values, vec![7, 9]);
}
