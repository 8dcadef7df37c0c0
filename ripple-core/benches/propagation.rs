use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ripple_core::graph::Graph;
use ripple_core::reactive::{Calculation, Engine, Field};

/// A field followed by `length` calculations, each adding one to the last.
fn chain(engine: &Engine, length: usize) -> (Field<u64>, Calculation<u64>) {
    let source = engine.field(0u64);
    let mut tail = {
        let source = source.clone();
        engine.calc(move || Ok(source.get()))
    };
    for _ in 1..length {
        let previous = tail.clone();
        tail = engine.calc(move || Ok(previous.get()? + 1));
    }
    (source, tail)
}

pub fn propagation(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_propagation");
    for length in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(length), &length, |b, &length| {
            let engine = Engine::new();
            let (source, tail) = chain(&engine, length);
            let _subscription = tail.subscribe(|_| {});

            let mut next = 0u64;
            b.iter(|| {
                next += 1;
                source.set(next);
                engine.flush();
                black_box(tail.get())
            });
        });
    }
    group.finish();
}

pub fn reverse_insertion(c: &mut Criterion) {
    c.bench_function("reverse_edge_insertion_1000", |b| {
        b.iter(|| {
            let mut graph = Graph::new();
            for vertex in 0..1000u32 {
                graph.add_vertex(vertex);
            }
            // Every edge points backwards in insertion order.
            for vertex in 1..1000u32 {
                graph.add_edge(&vertex, &(vertex - 1));
            }
            while graph.next_action().is_some() {}
            black_box(graph.topological_index(&0))
        })
    });
}

criterion_group!(benches, propagation, reverse_insertion);
criterion_main!(benches);
