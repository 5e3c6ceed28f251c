//! Benchmarks for evaluation passes over chains and fan-outs.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};

use datadep_core::{Instance, ProducerSpec};

/// `s0 <- s1 <- ... <- s{n-1}`, each adding one to its dependency.
fn chain(n: usize) -> Instance {
    let data = Instance::new();
    data.set("s0", json!(0)).unwrap();
    for i in 1..n {
        data.set(
            format!("s{}", i),
            ProducerSpec::compute([format!("s{}", i - 1)], |args| {
                Ok(json!(args[0].as_u64().unwrap_or(0) + 1))
            }),
        )
        .unwrap();
    }
    data.get(format!("s{}", n - 1), |values: &[Value]| {
        black_box(values);
    });
    data
}

/// One root read by `n` eager leaves.
fn fan_out(n: usize) -> Instance {
    let data = Instance::new();
    data.set("root", json!(0)).unwrap();
    for i in 0..n {
        data.set(
            format!("leaf{}", i),
            ProducerSpec::compute(["root"], |args| Ok(args[0].clone())).eager(true),
        )
        .unwrap();
    }
    data
}

/// Benchmark the first pass over a fresh chain
fn bench_cold_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("cold_chain");

    for n in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter_with_setup(|| chain(n), |data| black_box(data.evaluate()));
        });
    }

    group.finish();
}

/// Benchmark a pass after changing the root of a chain
fn bench_chain_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_update");

    for n in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let data = chain(n);
            data.evaluate();
            let mut value = 0;

            b.iter(|| {
                value += 1;
                data.set("s0", json!(value)).unwrap();
                black_box(data.evaluate());
            });
        });
    }

    group.finish();
}

/// Benchmark eager fan-out after a root change
fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");

    for n in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let data = fan_out(n);
            data.evaluate();
            let mut value = 0;

            b.iter(|| {
                value += 1;
                data.set("root", json!(value)).unwrap();
                black_box(data.evaluate());
            });
        });
    }

    group.finish();
}

/// Benchmark a pass with nothing to do
fn bench_steady_state(c: &mut Criterion) {
    let data = chain(100);
    data.evaluate();

    c.bench_function("steady_state_chain_100", |b| {
        b.iter(|| black_box(data.evaluate()));
    });
}

criterion_group!(
    benches,
    bench_cold_chain,
    bench_chain_update,
    bench_fan_out,
    bench_steady_state
);
criterion_main!(benches);
