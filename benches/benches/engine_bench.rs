//! # Engine Benchmarks
//!
//! Measures the interpreter loop: raw instruction throughput, call/return
//! overhead, string operations and context switching between scripts.
//!
//! Run: `cargo bench --bench engine_bench`

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use xvm_core::*;

fn vm(scripts: usize) -> VirtualMachine {
    VirtualMachine::with_clock(
        VmConfig::default().with_max_scripts(scripts),
        Arc::new(ManualClock::stepping(1)),
    )
}

/// Counts a local down from `n` to zero
fn countdown(n: i32) -> Vec<u8> {
    let mut b = ProgramBuilder::new();
    b.begin_function("Main", 0, 1);
    b.emit(Opcode::Mov, &[Value::AbsStack(-2), Value::Int(n)]);
    let top = b.emit(Opcode::Dec, &[Value::AbsStack(-2)]);
    b.emit(Opcode::Jg, &[Value::AbsStack(-2), Value::Int(0), Value::Instr(top)]);
    b.emit(Opcode::Exit, &[Value::Int(0)]);
    b.main("Main").to_bytes()
}

/// Main calls an empty two-parameter function `n` times
fn call_loop(n: i32) -> Vec<u8> {
    let mut b = ProgramBuilder::new();
    let callee = b.begin_function("Nop", 2, 0);
    b.emit(Opcode::Ret, &[]);
    b.begin_function("Main", 0, 1);
    b.emit(Opcode::Mov, &[Value::AbsStack(-2), Value::Int(n)]);
    let top = b.emit(Opcode::Push, &[Value::Int(1)]);
    b.emit(Opcode::Push, &[Value::Float(2.0)]);
    b.emit(Opcode::Call, &[Value::Func(callee)]);
    b.emit(Opcode::Dec, &[Value::AbsStack(-2)]);
    b.emit(Opcode::Jg, &[Value::AbsStack(-2), Value::Int(0), Value::Instr(top)]);
    b.emit(Opcode::Exit, &[Value::Int(0)]);
    b.main("Main").to_bytes()
}

/// Builds a string by repeated CONCAT, `n` rounds
fn concat_loop(n: i32) -> Vec<u8> {
    let mut b = ProgramBuilder::new();
    let empty = b.string("");
    let piece = b.string("ab");
    b.begin_function("Main", 0, 2);
    b.emit(Opcode::Mov, &[Value::AbsStack(-2), Value::Int(n)]);
    b.emit(Opcode::Mov, &[Value::AbsStack(-3), Value::Str(empty)]);
    let top = b.emit(Opcode::Concat, &[Value::AbsStack(-3), Value::Str(piece)]);
    b.emit(Opcode::Dec, &[Value::AbsStack(-2)]);
    b.emit(Opcode::Jg, &[Value::AbsStack(-2), Value::Int(0), Value::Instr(top)]);
    b.emit(Opcode::Exit, &[Value::Int(0)]);
    b.main("Main").to_bytes()
}

fn run_to_end(bytes: &[u8]) -> u64 {
    let mut vm = vm(1);
    let slot = vm.load_bytes(bytes, None).unwrap();
    vm.start(slot).unwrap();
    vm.run(Budget::Infinite).unwrap();
    vm.status(slot).unwrap().executed
}

/// Instruction throughput of a tight loop
fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");

    for n in [1_000, 10_000] {
        let bytes = countdown(n);
        group.throughput(Throughput::Elements(2 * n as u64 + 2));
        group.bench_with_input(BenchmarkId::new("countdown", n), &bytes, |b, bytes| {
            b.iter(|| black_box(run_to_end(bytes)))
        });
    }

    group.finish();
}

/// CALL/RET with parameters
fn bench_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("calls");

    let bytes = call_loop(1_000);
    group.throughput(Throughput::Elements(1_000));
    group.bench_function("call_ret_1000", |b| b.iter(|| black_box(run_to_end(&bytes))));

    let mut host = vm(1);
    let slot = host.load_bytes(&call_loop(1), None).unwrap();
    group.bench_function("blocking_call_from_host", |b| {
        b.iter(|| {
            host.pass_int_param(slot, 1).unwrap();
            host.pass_int_param(slot, 2).unwrap();
            host.call_function(slot, "Nop").unwrap();
        })
    });

    group.finish();
}

/// CONCAT interning cost as the string table grows
fn bench_strings(c: &mut Criterion) {
    let mut group = c.benchmark_group("strings");

    for n in [100, 500] {
        let bytes = concat_loop(n);
        group.bench_with_input(BenchmarkId::new("concat", n), &bytes, |b, bytes| {
            b.iter(|| black_box(run_to_end(bytes)))
        });
    }

    group.finish();
}

/// Round-robin scheduling across several looping scripts
fn bench_scheduler(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler");

    for scripts in [1, 4, 16] {
        let bytes = countdown(i32::MAX);
        group.bench_with_input(BenchmarkId::new("slice_1000ms", scripts), &scripts, |b, &scripts| {
            b.iter_batched(
                || {
                    let mut vm = vm(scripts);
                    for _ in 0..scripts {
                        let slot = vm.load_bytes(&bytes, None).unwrap();
                        vm.start(slot).unwrap();
                    }
                    vm
                },
                |mut vm| black_box(vm.run(Budget::Millis(1_000)).unwrap()),
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_dispatch, bench_calls, bench_strings, bench_scheduler);
criterion_main!(benches);
