//! Instrumentation Overhead Benchmarks
//!
//! Measures what race checking costs relative to uninstrumented access:
//! - per-access cost of `DefaultAccessor` vs `RaceConditionAccessor`
//! - snapshot, log and detector cost of one region as the buffer grows
//! - registry contention when many workers capture the same buffer

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use twinspace::{
    worker, DefaultAccessor, DetectorConfig, ExecutionSpace, Forall, RaceConditionAccessor,
    RegionContext, SafeFactory, SharedArray, SpaceBuilder, WorkerId,
};

fn bench_access(c: &mut Criterion) {
    let mut group = c.benchmark_group("element_access");
    const LEN: usize = 4096;
    group.throughput(Throughput::Elements(LEN as u64));

    let plain: SharedArray<u64, DefaultAccessor<u64>> = SharedArray::new(LEN);
    group.bench_function("default_accessor", |b| {
        b.iter(|| {
            for i in 0..LEN {
                plain.write(i, black_box(i as u64));
            }
        })
    });

    let checked: SharedArray<u64, RaceConditionAccessor<u64>> = SharedArray::new(LEN);
    group.bench_function("race_accessor_outside_region", |b| {
        b.iter(|| {
            for i in 0..LEN {
                checked.write(i, black_box(i as u64));
            }
        })
    });

    group.bench_function("race_accessor_in_region", |b| {
        b.iter(|| {
            let region = RegionContext::parallel(ExecutionSpace::Host);
            {
                let _scope = worker::enter(WorkerId(0));
                let local = checked.capture(&region);
                for i in 0..LEN {
                    local.write(i, black_box(i as u64));
                }
            }
            black_box(region.finish())
        })
    });

    group.finish();
}

fn bench_forall(c: &mut Criterion) {
    let mut group = c.benchmark_group("forall_region");

    for len in [1_024usize, 16_384, 131_072] {
        group.throughput(Throughput::Elements(len as u64));

        let plain: SharedArray<u32, DefaultAccessor<u32>> = SharedArray::new(len);
        group.bench_with_input(BenchmarkId::new("uninstrumented", len), &len, |b, &len| {
            b.iter(|| {
                Forall::new(4)
                    .run_captured(&plain, 0..len, |d, i| d.write(i, i as u32))
                    .map(|summary| black_box(summary.reports))
            })
        });

        let checked: SharedArray<u32, RaceConditionAccessor<u32>> = SharedArray::new(len);
        group.bench_with_input(BenchmarkId::new("race_checked", len), &len, |b, &len| {
            b.iter(|| {
                Forall::new(4)
                    .with_config(DetectorConfig::default())
                    .run_captured(&checked, 0..len, |d, i| d.write(i, i as u32))
                    .map(|summary| black_box(summary.reports))
            })
        });
    }

    group.finish();
}

fn bench_capture_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("capture_contention");

    for workers in [2usize, 8, 32] {
        let data: SharedArray<u8, RaceConditionAccessor<u8>> = SharedArray::new(64);
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            b.iter(|| {
                Forall::new(workers)
                    .with_config(DetectorConfig::default())
                    .run_captured(&data, 0..workers, |_, _| {})
            })
        });
    }

    group.finish();
}

struct Pair;

impl SpaceBuilder<[f64]> for Pair {
    fn build_host(&self) -> twinspace::Result<Box<[f64]>> {
        Ok(vec![0.0; 16].into_boxed_slice())
    }

    fn build_device(&self, _device: &twinspace::Device) -> twinspace::Result<Box<[f64]>> {
        Ok(vec![0.0; 16].into_boxed_slice())
    }
}

fn bench_handles(c: &mut Criterion) {
    let factory = SafeFactory::<[f64]>::default();

    c.bench_function("handle_make_free", |b| {
        b.iter(|| {
            let mut handle = factory.make(Some(&Pair));
            black_box(handle.free())
        })
    });

    let handle = factory.make(Some(&Pair));
    c.bench_function("handle_clone_drop", |b| b.iter(|| black_box(handle.clone())));
}

criterion_group!(
    benches,
    bench_access,
    bench_forall,
    bench_capture_contention,
    bench_handles
);
criterion_main!(benches);
