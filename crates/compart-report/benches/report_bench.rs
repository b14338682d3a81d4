//! Report engine benchmarks.
//!
//! Measures:
//! - Index repacking for views of growing size
//! - Frame, window and neuron loads from the synthetic dummy source
//! - Producer throughput into the null sink

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use compart_report::{AccessMode, CompartmentIndex, GidSet, ReportConfig, ReportEngine, ReportMetadata};

const CELLS: u32 = 200;
const SECTIONS: &[u16] = &[1, 8, 16, 25];

// ============================================================================
// Test Data Generation
// ============================================================================

fn compartments() -> usize {
    SECTIONS.iter().map(|&c| usize::from(c)).sum()
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_repack(c: &mut Criterion) {
    let index = CompartmentIndex::from_counts((0..10_000).map(|gid| (gid, SECTIONS.to_vec())).collect());
    let mut group = c.benchmark_group("repack");
    for size in [10u32, 1_000, 10_000] {
        let subset: GidSet = (0..size).map(|i| i * (10_000 / size)).collect();
        group.throughput(Throughput::Elements(u64::from(size)));
        group.bench_with_input(BenchmarkId::from_parameter(size), &subset, |b, subset| {
            b.iter(|| index.repack(black_box(subset)).unwrap())
        });
    }
    group.finish();
}

fn bench_dummy_loads(c: &mut Criterion) {
    let engine = ReportEngine::new(ReportConfig::workstation()).unwrap();
    let report = engine.open(&format!("dummy://?size={}&randomValues", CELLS)).unwrap();
    let gids: Vec<u32> = report.gids().into_iter().collect();
    let full = report.create_view(&GidSet::new()).unwrap();
    let subset = report.create_view(&gids.iter().copied().step_by(10).collect()).unwrap();
    let mut group = c.benchmark_group("dummy_load");

    group.throughput(Throughput::Bytes((full.frame_size() * 4) as u64));
    group.bench_function("frame_full", |b| b.iter(|| full.load_frame(black_box(4.0)).wait().unwrap()));
    group.throughput(Throughput::Bytes((subset.frame_size() * 4) as u64));
    group.bench_function("frame_subset", |b| b.iter(|| subset.load_frame(black_box(4.0)).wait().unwrap()));
    group.throughput(Throughput::Bytes((subset.frame_size() * 4 * 20) as u64));
    group.bench_function("window_subset", |b| {
        b.iter(|| subset.load_frames(black_box(20.0), black_box(40.0)).wait().unwrap())
    });
    group.throughput(Throughput::Elements(report.metadata().frame_count as u64));
    group.bench_function("neuron", |b| b.iter(|| subset.load_neuron(black_box(gids[0])).wait().unwrap()));
    group.finish();
}

fn bench_null_sink(c: &mut Criterion) {
    let engine = ReportEngine::new(ReportConfig::workstation()).unwrap();
    let values = vec![0.0f32; compartments()];
    let mut group = c.benchmark_group("null_sink");
    group.throughput(Throughput::Elements(u64::from(CELLS)));
    group.bench_function("write_frame", |b| {
        let mut writer = engine.create("null://", AccessMode::Write).unwrap();
        writer.write_header(&ReportMetadata::new(0.0, 10.0, 0.1)).unwrap();
        for gid in 0..CELLS {
            writer.write_compartments(gid, SECTIONS).unwrap();
        }
        b.iter(|| {
            for gid in 0..CELLS {
                writer.write_frame(gid, black_box(&values), 0.0).unwrap();
            }
        })
    });
    group.finish();
}

criterion_group!(benches, bench_repack, bench_dummy_loads, bench_null_sink);
criterion_main!(benches);
