//! Benchmarks for graph walks and module parsing.
//!
//! Run with: cargo bench
//!
//! Results include 95% confidence intervals via Criterion.

use convergent::core::parser;
use convergent::graph::{Graph, WalkOptions};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// `layers` layers of `width` vertices; every vertex depends on the whole previous layer.
fn layered(layers: usize, width: usize) -> Graph<u64> {
    let mut g = Graph::new();
    for layer in 0..layers {
        for i in 0..width {
            let id = format!("root/task.l{}_{}", layer, i);
            g.add(id.clone(), (layer * width + i) as u64).unwrap();
            if layer > 0 {
                for j in 0..width {
                    g.connect(&id, &format!("root/task.l{}_{}", layer - 1, j)).unwrap();
                }
            }
        }
    }
    g
}

fn bench_walk(c: &mut Criterion) {
    let graph = layered(16, 16);
    let mut group = c.benchmark_group("graph_walk");
    for workers in [1, 4, 8] {
        let opts = WalkOptions::with_workers(workers);
        group.bench_with_input(BenchmarkId::from_parameter(workers), &opts, |b, opts| {
            b.iter(|| {
                graph
                    .walk(opts, |_, value, _| {
                        black_box(blake3::hash(&value.to_le_bytes()));
                        Ok(())
                    })
                    .unwrap();
            });
        });
    }
    group.finish();
}

fn bench_transform(c: &mut Criterion) {
    let graph = layered(16, 16);
    let opts = WalkOptions::with_workers(4);
    c.bench_function("graph_transform", |b| {
        b.iter(|| {
            let out = graph
                .transform(&opts, |handle| {
                    let sum: u64 = handle.dependencies().values().sum();
                    let value = *handle.value() + sum;
                    handle.set(value);
                    Ok(())
                })
                .unwrap();
            black_box(out);
        });
    });
}

fn bench_cycles(c: &mut Criterion) {
    let mut group = c.benchmark_group("cycle_detection");
    for width in [8, 32] {
        let graph = layered(8, width);
        group.bench_with_input(BenchmarkId::from_parameter(width), &graph, |b, graph| {
            b.iter(|| black_box(graph.cycles()));
        });
    }
    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    let mut text = String::from("param \"who\" { default = \"world\" }\n");
    for i in 0..200 {
        text.push_str(&format!(
            "task \"t{}\" {{\n  check = \"test -f /tmp/{{{{param \\\"who\\\"}}}}-{}\"\n  apply = \"touch /tmp/x\"\n}}\n",
            i, i
        ));
    }
    c.bench_function("parse_200_tasks", |b| {
        b.iter(|| black_box(parser::parse("bench.hcl", black_box(&text)).unwrap()));
    });
}

criterion_group!(benches, bench_walk, bench_transform, bench_cycles, bench_parse);
criterion_main!(benches);
