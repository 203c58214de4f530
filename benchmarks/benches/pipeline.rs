//! Pipeline benchmarks using Criterion

use arcanum_core::{local_obfuscate, parse, print_chunk, Settings};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

const MODULE: &str = r#"
local Inventory = {}
Inventory.__index = Inventory

function Inventory.new(owner)
    return setmetatable({owner = owner, items = {}, count = 0}, Inventory)
end

function Inventory:add(name, amount)
    local slot = self.items[name] or 0
    self.items[name] = slot + amount
    self.count = self.count + amount
end

local inv = Inventory.new("player")
for i = 1, 20 do
    if i % 3 == 0 then
        inv:add("ore", i)
    elseif i % 3 == 1 then
        inv:add("wood", i * 2)
    else
        inv:add("stone", 1)
    end
end
local total = 0
local n = 0
while n < 10 do
    n = n + 1
    total = total + n * inv.count
end
print(inv.owner, inv.count, total)
"#;

fn generate_source(copies: usize) -> String {
    (0..copies)
        .map(|i| format!("do\n{}\nend\n-- block {}\n", MODULE, i))
        .collect()
}

fn frontend_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("frontend");
    let source = generate_source(20);
    group.throughput(Throughput::Bytes(source.len() as u64));

    group.bench_function("parse_20_modules", |b| {
        b.iter(|| black_box(parse(&source).unwrap()))
    });

    let chunk = parse(&source).unwrap();
    group.bench_function("emit_20_modules", |b| {
        b.iter(|| black_box(print_chunk(&chunk)))
    });

    group.finish();
}

fn pipeline_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");
    group.sample_size(20);
    let source = generate_source(1);
    group.throughput(Throughput::Bytes(source.len() as u64));

    let passes_only = Settings {
        stack_machine: false,
        ..Settings::default()
    };
    let configs = [
        ("all_disabled", Settings::all_disabled()),
        ("dead_code_only", Settings { dead_code_percent: 95, ..Settings::all_disabled() }),
        ("passes_without_vm", passes_only),
        ("defaults", Settings::default()),
    ];
    for (name, settings) in configs {
        group.bench_function(name, |b| {
            b.iter(|| black_box(local_obfuscate(&source, &settings).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(benches, frontend_benchmarks, pipeline_benchmarks);
criterion_main!(benches);
