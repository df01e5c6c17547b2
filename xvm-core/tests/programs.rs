//! End-to-end tests: whole programs through the public API

use std::sync::{Arc, Mutex};
use xvm_core::*;

fn vm() -> VirtualMachine {
    VirtualMachine::with_clock(
        VmConfig::default().with_max_scripts(4),
        Arc::new(ManualClock::stepping(1)),
    )
}

/// Registers a `PrintString` that appends its argument to the returned buffer
fn capture_output(vm: &mut VirtualMachine) -> Arc<Mutex<String>> {
    let out = Arc::new(Mutex::new(String::new()));
    let sink = Arc::clone(&out);
    vm.register_host_api("PrintString", HostScope::Global, move |vm, slot| {
        let text = vm.param_as_string(slot, 0)?;
        sink.lock().unwrap().push_str(&text);
        vm.return_from_host(slot, 1)
    })
    .unwrap();
    out
}

/// `Fact(n)`: recursive factorial through CALL/RET
fn factorial_program(n: i32) -> ProgramBuilder {
    let mut b = ProgramBuilder::new();
    let fact = b.begin_function("Fact", 1, 1);
    // [-1] frame record, [-2] local, [-3] return address, [-4] n
    let test = b.emit(Opcode::Jg, &[Value::AbsStack(-4), Value::Int(1), Value::Instr(0)]);
    b.emit(Opcode::Mov, &[Value::Reg(0), Value::Int(1)]);
    b.emit(Opcode::Ret, &[]);
    let recurse = b.emit(Opcode::Mov, &[Value::AbsStack(-2), Value::AbsStack(-4)]);
    b.emit(Opcode::Dec, &[Value::AbsStack(-2)]);
    b.emit(Opcode::Push, &[Value::AbsStack(-2)]);
    b.emit(Opcode::Call, &[Value::Func(fact)]);
    b.emit(Opcode::Mul, &[Value::Reg(0), Value::AbsStack(-4)]);
    b.emit(Opcode::Ret, &[]);
    b.patch(test, 2, Value::Instr(recurse));

    b.begin_function("Main", 0, 0);
    b.emit(Opcode::Push, &[Value::Int(n)]);
    b.emit(Opcode::Call, &[Value::Func(fact)]);
    b.emit(Opcode::Exit, &[Value::Reg(0)]);
    b.main("Main");
    b
}

#[test]
fn test_recursive_factorial() {
    let mut vm = vm();
    let slot = vm.load_bytes(&factorial_program(5).to_bytes(), None).unwrap();
    let before = vm.status(slot).unwrap();
    vm.start(slot).unwrap();
    assert_eq!(vm.run(Budget::Infinite).unwrap(), RunOutcome::Idle);

    let after = vm.status(slot).unwrap();
    assert_eq!(after.exit_code, Some(120));
    assert_eq!((after.stack_top, after.frame), (before.stack_top, before.frame));
}

#[test]
fn test_factorial_called_from_host() {
    let mut vm = vm();
    let slot = vm.load_bytes(&factorial_program(1).to_bytes(), None).unwrap();
    vm.pass_int_param(slot, 6).unwrap();
    vm.call_function(slot, "fact").unwrap();
    assert_eq!(vm.return_as_int(slot).unwrap(), 720);
    assert_eq!(vm.return_as_string(slot).unwrap(), "720");
}

#[test]
fn test_loop_over_globals() {
    // global [0] = counter, [1] = sum of 1..=10
    let mut b = ProgramBuilder::new();
    b.begin_function("Main", 0, 0);
    b.emit(Opcode::Mov, &[Value::AbsStack(0), Value::Int(0)]);
    b.emit(Opcode::Mov, &[Value::AbsStack(1), Value::Int(0)]);
    let top = b.emit(Opcode::Inc, &[Value::AbsStack(0)]);
    b.emit(Opcode::Add, &[Value::AbsStack(1), Value::AbsStack(0)]);
    b.emit(Opcode::Jl, &[Value::AbsStack(0), Value::Int(10), Value::Instr(top)]);
    b.emit(Opcode::Exit, &[Value::AbsStack(1)]);
    let bytes = b.main("Main").global_data_size(2).to_bytes();

    let mut vm = vm();
    let slot = vm.load_bytes(&bytes, None).unwrap();
    vm.start(slot).unwrap();
    vm.run(Budget::Infinite).unwrap();
    assert_eq!(vm.exit_code(slot).unwrap(), Some(55));
    assert_eq!(vm.status(slot).unwrap().executed, 2 + 10 * 3 + 1);
}

#[test]
fn test_string_building_and_printing() {
    let mut b = ProgramBuilder::new();
    let hello = b.string("Hello");
    let space = b.string(", ");
    let world = b.string("world");
    let print = b.host_api("PrintString");
    b.begin_function("Main", 0, 2);
    b.emit(Opcode::Mov, &[Value::AbsStack(-2), Value::Str(hello)]);
    b.emit(Opcode::Concat, &[Value::AbsStack(-2), Value::Str(space)]);
    b.emit(Opcode::Concat, &[Value::AbsStack(-2), Value::Str(world)]);
    b.emit(Opcode::Concat, &[Value::AbsStack(-2), Value::Int(2)]);
    b.emit(Opcode::GetChar, &[Value::AbsStack(-3), Value::AbsStack(-2), Value::Int(7)]);
    b.emit(Opcode::Push, &[Value::AbsStack(-2)]);
    b.emit(Opcode::CallHost, &[Value::HostApi(print)]);
    b.emit(Opcode::Push, &[Value::AbsStack(-3)]);
    b.emit(Opcode::CallHost, &[Value::HostApi(print)]);
    b.emit(Opcode::Exit, &[Value::Int(0)]);

    let mut vm = vm();
    let out = capture_output(&mut vm);
    let slot = vm.load_bytes(&b.main("Main").to_bytes(), None).unwrap();
    vm.start(slot).unwrap();
    vm.run(Budget::Infinite).unwrap();

    assert_eq!(out.lock().unwrap().as_str(), "Hello, world2w");
    let strings: Vec<&str> = vm.script(slot).unwrap().strings().iter().collect();
    assert!(strings.contains(&"Hello, world2"));
    // the literal the accumulator started from is untouched
    assert_eq!(strings[hello as usize], "Hello");
}

#[test]
fn test_fault_reports_slot_and_instruction() {
    let mut b = ProgramBuilder::new();
    b.begin_function("Main", 0, 1);
    b.emit(Opcode::Mov, &[Value::AbsStack(-2), Value::Int(7)]);
    b.emit(Opcode::Div, &[Value::AbsStack(-2), Value::Int(0)]);
    b.emit(Opcode::Exit, &[Value::Int(0)]);

    let mut vm = vm();
    vm.load_bytes(&factorial_program(3).to_bytes(), None).unwrap();
    let slot = vm.load_bytes(&b.main("Main").to_bytes(), None).unwrap();
    vm.start(0).unwrap();
    vm.start(slot).unwrap();

    assert_eq!(
        vm.run(Budget::Infinite),
        Err(VmError::Fault {
            slot,
            instr: 1,
            fault: Fault::DivisionByZero,
        })
    );
    // the healthy script still finishes
    assert_eq!(vm.run(Budget::Infinite), Ok(RunOutcome::Idle));
    assert_eq!(vm.exit_code(0).unwrap(), Some(6));
    assert_eq!(vm.exit_code(slot).unwrap(), None);
}

#[test]
fn test_load_from_file_and_inspect() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fact.xse");
    let image = factorial_program(4).priority(Priority::High).build();
    image.save(&path).unwrap();

    let loaded = ProgramImage::load(&path).unwrap();
    assert_eq!(loaded, image);
    assert_eq!(loaded.header.priority, Priority::High);
    assert_eq!(loaded.main_function().map(|f| f.name.as_str()), Some("Main"));

    let listing = loaded.disassemble();
    assert!(listing.starts_with("Fact:\n"));
    assert!(listing.contains("Main:\n"));
    assert!(listing.contains("MUL _RetVal, [-4]"));

    let mut vm = vm();
    let slot = vm.load_file(&path, None).unwrap();
    assert_eq!(vm.status(slot).unwrap().timeslice_ms, 80);
    vm.start(slot).unwrap();
    vm.run(Budget::Infinite).unwrap();
    assert_eq!(vm.exit_code(slot).unwrap(), Some(24));
}

#[test]
fn test_corrupt_files_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut bytes = factorial_program(2).to_bytes();

    let truncated = dir.path().join("short.xse");
    std::fs::write(&truncated, &bytes[..bytes.len() - 3]).unwrap();
    let mut vm = vm();
    assert!(matches!(
        vm.load_file(&truncated, None),
        Err(VmError::Load(LoadError::InvalidFormat(_)))
    ));

    bytes[4] = 9;
    let future = dir.path().join("future.xse");
    std::fs::write(&future, &bytes).unwrap();
    assert!(matches!(
        vm.load_file(&future, None),
        Err(VmError::Load(LoadError::UnsupportedVersion { major: 9, .. }))
    ));
    assert!(vm.active_slots().is_empty());
}
