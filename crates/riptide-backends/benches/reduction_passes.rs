//! Benchmarks the device-side reduction pass against a host fold.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use riptide_backends::{ArgValue, Context, Device, NdRange};

fn benchmark_reduction_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("reduction_pass");

    for size in [1_024usize, 65_536, 1_048_576] {
        group.bench_with_input(BenchmarkId::new("host_fold", size), &size, |b, &n| {
            let data: Vec<f32> = (0..n).map(|i| i as f32).collect();
            b.iter(|| black_box(data.iter().copied().fold(0.0f32, |a, v| a + v)));
        });

        group.bench_with_input(BenchmarkId::new("device_pass", size), &size, |b, &n| {
            let (ctx, device) = Context::with_cpu_device(false);
            let local = 256usize;
            let groups = n.div_ceil(local);

            let input = device.allocate_buffer(n * 4).unwrap();
            let output = device.allocate_buffer(groups * 4).unwrap();
            let data: Vec<u8> = (0..n).flat_map(|i| (i as f32).to_ne_bytes()).collect();
            device.write_buffer(input, 0, &data).unwrap();

            let options = ctx
                .build_options()
                .define("T", "float")
                .define("OPERATION", "c = a + b;")
                .define("IDENTITY", "0")
                .define("LOCAL_WORK_SIZE", local.to_string());
            let mut kernel = ctx.compile_kernel("payload", "reduction", options).unwrap();
            kernel.set_arg(0, ArgValue::Buffer(input)).unwrap();
            kernel.set_arg(1, ArgValue::Buffer(output)).unwrap();
            kernel.set_arg(2, ArgValue::scalar(n as u32)).unwrap();
            kernel.set_arg(3, ArgValue::Local(local * 4)).unwrap();
            let range = NdRange::new(n, local).unwrap();

            b.iter(|| {
                let event = ctx.queue().enqueue_kernel(&kernel, range, &[]).unwrap();
                event.wait().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_reduction_pass);
criterion_main!(benches);
