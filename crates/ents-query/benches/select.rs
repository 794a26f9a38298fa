//! Query benchmarks over generated todo stores.

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ents_query::{SelectExt, parse_program, tokenize};
use ents_store::{Component, ComponentDef, EntitySet, PropertySpec};

fn todo_store(count: u32) -> EntitySet {
    let mut es = EntitySet::new();
    let title = es.register(ComponentDef::new(
        "/component/title",
        vec![PropertySpec::new("text")],
    ));
    let completed = es.register(ComponentDef::new("/component/completed", vec![]));

    let mut coms = Vec::new();
    for i in 1..=count {
        coms.push(Component::new(i, title.id()).with("text", format!("task {i}")));
        if i % 3 == 0 {
            coms.push(Component::new(i, completed.id()));
        }
    }
    es.add_components(coms).unwrap();
    es.apply_updates();
    es
}

fn tokenize_benchmarks(c: &mut Criterion) {
    let program = r#"
        [ /component/title !bf @c text pluck ] titles define
        /* block comment */
        [ "/component/completed" !bf @e ] select
        titles 10 limit
    "#
    .repeat(50);

    let mut group = c.benchmark_group("tokenize");
    group.throughput(Throughput::Bytes(program.len() as u64));
    group.bench_function("tokens", |b| b.iter(|| black_box(tokenize(&program))));
    group.bench_function("program", |b| b.iter(|| black_box(parse_program(&program))));
    group.finish();
}

fn select_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("select");

    for count in [100, 1000, 10000] {
        let mut es = todo_store(count);
        group.throughput(Throughput::Elements(u64::from(count)));

        group.bench_with_input(BenchmarkId::new("by_def", count), &count, |b, _| {
            b.iter(|| black_box(es.select("/component/completed !bf @e").unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("pluck", count), &count, |b, _| {
            b.iter(|| black_box(es.select("/component/title !bf @c text pluck").unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("attr_filter", count), &count, |b, _| {
            b.iter(|| {
                black_box(
                    es.select(r#"/component/title#text !ca "task 7" == @eid"#)
                        .unwrap(),
                )
            });
        });
    }

    group.finish();
}

criterion_group!(benches, tokenize_benchmarks, select_benchmarks);
criterion_main!(benches);
