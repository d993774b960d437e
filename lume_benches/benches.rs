use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

use lume::{GcCommand, Lua, Value};

fn new_lua() -> Lua {
    Lua::new().unwrap()
}

fn bench_intern(c: &mut Criterion) {
    let mut group = c.benchmark_group("intern");

    group.bench_function("existing", |b| {
        let mut lua = new_lua();
        let string = lua.new_string("__index").unwrap();
        b.iter(|| {
            let found = lua.new_string(black_box("__index")).unwrap();
            assert_eq!(found, string);
        })
    });

    group.bench_function("fresh", |b| {
        b.iter_batched(
            new_lua,
            |mut lua| {
                for i in 0..1000 {
                    black_box(lua.new_string(&format!("key {i}")).unwrap());
                }
                lua
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation");

    // Garbage only, paid for by incremental steps
    group.bench_function("garbage_tables", |b| {
        let mut lua = new_lua();
        b.iter(|| {
            for _ in 0..1000 {
                black_box(lua.new_table(0, 0).unwrap());
            }
        })
    });

    group.bench_function("linked_tables", |b| {
        b.iter_batched(
            new_lua,
            |mut lua| {
                let main = lua.main_thread();
                let head = lua.new_table(0, 0).unwrap();
                lua.push(main, Value::Table(head)).unwrap();

                let mut previous = head;
                for i in 0..1000 {
                    let table = lua.new_table(0, 0).unwrap();
                    lua.table_set(previous, Value::Number(1.0), Value::Table(table)).unwrap();
                    lua.table_set(table, Value::Number(2.0), Value::Number(i as f64)).unwrap();
                    previous = table;
                }
                lua
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_full_gc(c: &mut Criterion) {
    let mut lua = new_lua();
    let main = lua.main_thread();
    let holder = lua.new_table(0, 0).unwrap();
    lua.push(main, Value::Table(holder)).unwrap();

    for i in 1..=10_000 {
        let table = lua.new_table(0, 0).unwrap();
        lua.table_set(holder, Value::Number(i as f64), Value::Table(table)).unwrap();
    }

    c.bench_function("full_gc_10k_live", |b| {
        b.iter(|| lua.gc(black_box(GcCommand::Collect)))
    });
}

criterion_group!(benches, bench_intern, bench_allocation, bench_full_gc);
criterion_main!(benches);
