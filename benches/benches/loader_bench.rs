//! # Loader Benchmarks
//!
//! Measures decoding and encoding of `.XSE` program images and the cost of
//! installing a script into a slot.
//!
//! Run: `cargo bench --bench loader_bench`

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use xvm_core::*;

/// Program with `functions` functions of 16 mixed instructions each
fn synthetic_image(functions: u32) -> ProgramImage {
    let mut b = ProgramBuilder::new();
    let api = b.host_api("PrintString");
    for f in 0..functions {
        let name = format!("Func{}", f);
        let text = b.string(&name);
        let entry = b.begin_function(&name, 2, 4);
        let start = b.here();
        for i in 0..3 {
            b.emit(Opcode::Mov, &[Value::AbsStack(-2), Value::Int(i)]);
            b.emit(Opcode::Add, &[Value::AbsStack(-3), Value::Float(1.5)]);
            b.emit(Opcode::Concat, &[Value::AbsStack(-4), Value::Str(text)]);
            b.emit(Opcode::Mov, &[Value::RelStack { base: -5, offset: -2 }, Value::Reg(0)]);
        }
        b.emit(Opcode::Push, &[Value::Str(text)]);
        b.emit(Opcode::CallHost, &[Value::HostApi(api)]);
        b.emit(Opcode::Jl, &[Value::AbsStack(-2), Value::Int(0), Value::Instr(start)]);
        b.emit(Opcode::Call, &[Value::Func(entry)]);
    }
    b.begin_function("Main", 0, 0);
    b.emit(Opcode::Exit, &[Value::Int(0)]);
    b.main("Main").build()
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for functions in [10, 100, 1_000] {
        let bytes = synthetic_image(functions).to_bytes();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::new("from_bytes", functions), &bytes, |b, bytes| {
            b.iter(|| black_box(ProgramImage::from_bytes(bytes).unwrap()))
        });
    }

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for functions in [10, 100, 1_000] {
        let image = synthetic_image(functions);
        group.bench_with_input(BenchmarkId::new("to_bytes", functions), &image, |b, image| {
            b.iter(|| black_box(image.to_bytes()))
        });
    }

    group.finish();
}

fn bench_install(c: &mut Criterion) {
    let mut group = c.benchmark_group("install");
    let bytes = synthetic_image(100).to_bytes();

    group.bench_function("load_unload", |b| {
        let mut vm = VirtualMachine::with_config(VmConfig::default().with_max_scripts(1));
        b.iter(|| {
            let slot = vm.load_bytes(&bytes, None).unwrap();
            vm.unload(slot).unwrap();
        })
    });

    group.finish();
}

criterion_group!(benches, bench_decode, bench_encode, bench_install);
criterion_main!(benches);
