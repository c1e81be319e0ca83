//! Benchmarks the radix sort tool against the standard library sort.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use riptide_backends::Device;
use riptide_core::tools::RadixSort;
use riptide_core::{execute, CalcServer, Settings, Tool};

fn benchmark_radix_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("radix_sort");

    for size in [1_024usize, 16_384, 262_144] {
        group.bench_with_input(BenchmarkId::new("std_sort_unstable", size), &size, |b, &n| {
            let keys: Vec<u32> = (0..n as u32).map(|i| i.wrapping_mul(2_654_435_761)).collect();
            b.iter(|| {
                let mut copy = keys.clone();
                copy.sort_unstable();
                black_box(copy);
            });
        });

        group.bench_with_input(BenchmarkId::new("radix_sort_tool", size), &size, |b, &n| {
            let (server, device) = CalcServer::new(&Settings::default());
            let vars = server.variables();
            vars.register("n_radix", "unsigned int", "", &n.to_string()).unwrap();
            vars.register("keys", "unsigned int*", "n_radix", "").unwrap();

            let keys: Vec<u8> = (0..n as u32)
                .flat_map(|i| i.wrapping_mul(2_654_435_761).to_ne_bytes())
                .collect();
            let keys_var = vars.require("keys").unwrap();

            let mut sort = RadixSort::new("sort", "keys", "perm", "inv");
            sort.setup(&server).unwrap();

            b.iter(|| {
                device.write_buffer(keys_var.buffer().unwrap(), 0, &keys).unwrap();
                execute(&mut sort, &server).unwrap();
                server.finish().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_radix_sort);
criterion_main!(benches);
