//! Integration tests: reading synthetic binary reports through the engine.

mod common;

use std::path::Path;

use compart_report::{
    AccessMode, GidSet, ReadStrategy, ReportConfig, ReportEngine, ReportError, ReportMetadata, ReportWarning,
};

use common::{circuit, init_tracing, value, SyntheticCell, SyntheticReport};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn engine() -> ReportEngine {
    init_tracing();
    ReportEngine::new(ReportConfig::workstation()).unwrap()
}

fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

// ---------------------------------------------------------------------------
// Metadata and time
// ---------------------------------------------------------------------------

#[test]
fn test_metadata_from_header() {
    let synthetic = circuit(0.0, 10.0, 0.1);
    let (_dir, path) = synthetic.write_temp(false);
    let report = engine().open(&file_uri(&path)).unwrap();

    let meta = report.metadata();
    assert_eq!(meta.start_time, 0.0);
    assert_eq!(meta.end_time, 10.0);
    assert_eq!(meta.time_step, 0.1);
    assert_eq!(meta.frame_count, 101);
    assert_eq!(meta.cell_count, 4);
    assert_eq!(meta.compartment_count, synthetic.frame_size());
    assert_eq!(meta.data_unit, "mV");
    assert_eq!(meta.time_unit, "ms");
    assert_eq!(report.gids(), GidSet::from([1, 394, 400, 512]));
    assert_eq!(report.backend_name(), "binary");
}

#[test]
fn test_load_frame_inside_and_outside_range() {
    let synthetic = circuit(0.0, 10.0, 0.1);
    let (_dir, path) = synthetic.write_temp(false);
    let report = engine().open(&file_uri(&path)).unwrap();
    let view = report.create_view(&GidSet::new()).unwrap();

    let frame = view.load_frame(4.5).wait().unwrap();
    assert!((frame.timestamp - 4.5).abs() < 1e-9);
    assert_eq!(frame.data, synthetic.expected(&[1, 394, 400, 512], 45));

    assert!(matches!(
        view.load_frame(10.1).wait(),
        Err(ReportError::TimestampOutOfRange { .. })
    ));
}

#[test]
fn test_load_frames_window() {
    let synthetic = circuit(0.0, 10.0, 0.1);
    let (_dir, path) = synthetic.write_temp(false);
    let report = engine().open(&file_uri(&path)).unwrap();
    let view = report.create_view(&GidSet::new()).unwrap();

    let batch = view.load_frames(1.05, 1.25).wait().unwrap();
    assert_eq!(batch.len(), 3);
    assert_eq!(batch.frame(0), synthetic.expected(&[1, 394, 400, 512], 10).as_slice());
    assert_eq!(batch.frame(2), synthetic.expected(&[1, 394, 400, 512], 12).as_slice());
    assert!(batch.timestamps.windows(2).all(|w| w[0] < w[1]));

    let all = view.load_all().wait().unwrap();
    assert_eq!(all.len(), 101);
    assert_eq!(all.frame(100)[0], value(100, 0));
}

#[test]
fn test_stepped_load_validation() {
    let synthetic = circuit(0.0, 10.0, 0.1);
    let (_dir, path) = synthetic.write_temp(false);
    let report = engine().open(&file_uri(&path)).unwrap();
    let view = report.create_view(&GidSet::new()).unwrap();

    assert!(matches!(
        view.load_frames_every(0.0, 10.0, 0.25).wait(),
        Err(ReportError::InvalidStep { .. })
    ));
    assert!(matches!(
        view.load_frames_every(0.0, 10.0, 0.05).wait(),
        Err(ReportError::InvalidStep { .. })
    ));

    let stepped = view.load_frames_every(1.0, 3.0, 0.1).wait().unwrap();
    let plain = view.load_frames(1.0, 3.0).wait().unwrap();
    assert_eq!(stepped, plain);

    let sparse = view.load_frames_every(0.0, 1.0, 0.3).wait().unwrap();
    assert_eq!(sparse.len(), 4);
    assert_eq!(sparse.frame(1), synthetic.expected(&[1, 394, 400, 512], 3).as_slice());
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[test]
fn test_subset_view_is_repacked() {
    let synthetic = circuit(0.0, 10.0, 0.1);
    let (_dir, path) = synthetic.write_temp(false);
    let report = engine().open(&file_uri(&path)).unwrap();
    let view = report.create_view(&GidSet::from([394, 400])).unwrap();

    assert_eq!(view.mapping().offsets().len(), 2);
    assert_eq!(view.gids(), &[394, 400]);
    assert_eq!(view.frame_size(), 5 + 7);
    assert!(view.warnings().is_empty());
    // cell 400 has no compartments in section 1
    assert_eq!(view.mapping().offsets()[1][1], compart_report::UNDEFINED_OFFSET);
    assert_eq!(view.mapping().offsets()[0][0], 0);
    assert_eq!(view.mapping().index().len(), view.frame_size());

    let frame = view.load_frame(0.0).wait().unwrap();
    assert_eq!(frame.data.len(), 12);
    assert_eq!(frame.data, synthetic.expected(&[394, 400], 0));
}

#[test]
fn test_partial_and_empty_intersections() {
    let synthetic = circuit(0.0, 1.0, 0.1);
    let (_dir, path) = synthetic.write_temp(false);
    let report = engine().open(&file_uri(&path)).unwrap();

    let view = report.create_view(&GidSet::from([394, 9999])).unwrap();
    assert_eq!(view.gids(), &[394]);
    assert_eq!(
        view.warnings(),
        &[ReportWarning::PartialGids { requested: 2, missing: vec![9999] }]
    );

    assert!(matches!(
        report.create_view(&GidSet::from([9999])),
        Err(ReportError::GidsOutOfRange { requested: 1 })
    ));
}

#[test]
fn test_load_neuron() {
    let synthetic = circuit(0.0, 10.0, 0.1);
    let (_dir, path) = synthetic.write_temp(false);
    let report = engine().open(&file_uri(&path)).unwrap();
    let view = report.create_view(&GidSet::from([1, 400])).unwrap();

    let trace = view.load_neuron(400).wait().unwrap();
    assert_eq!(trace.frame_size, 7);
    assert_eq!(trace.len(), 101);
    for frame in [0, 50, 100] {
        assert_eq!(trace.frame(frame), synthetic.expected(&[400], frame).as_slice());
    }
    assert!(view.load_neuron(394).wait().is_err());
}

// ---------------------------------------------------------------------------
// Byte order and read strategies
// ---------------------------------------------------------------------------

#[test]
fn test_byte_swapped_report_reads_identically() {
    let synthetic = circuit(0.0, 2.0, 0.5);
    let (_native_dir, native_path) = synthetic.write_temp(false);
    let (_swapped_dir, swapped_path) = synthetic.write_temp(true);
    let engine = engine();
    let native = engine.open(&file_uri(&native_path)).unwrap();
    let swapped = engine.open(&file_uri(&swapped_path)).unwrap();

    assert_eq!(native.metadata(), swapped.metadata());
    assert_eq!(native.gids(), swapped.gids());

    let gids = GidSet::from([394, 512]);
    let a = native.create_view(&gids).unwrap().load_all().wait().unwrap();
    let b = swapped.create_view(&gids).unwrap().load_all().wait().unwrap();
    assert_eq!(a, b);
    assert_eq!(a.frame(3), synthetic.expected(&[394, 512], 3).as_slice());
}

#[test]
fn test_read_strategies_agree() {
    let synthetic = circuit(0.0, 5.0, 0.5);
    for swapped in [false, true] {
        let (_dir, path) = synthetic.write_temp(swapped);
        let engine = engine();
        let mapped = engine.open(&format!("{}?strategy=mmap", file_uri(&path))).unwrap();
        let batched = engine.open(&format!("{}?strategy=batched", file_uri(&path))).unwrap();

        for gids in [GidSet::new(), GidSet::from([1, 400]), GidSet::from([512])] {
            let a = mapped.create_view(&gids).unwrap();
            let b = batched.create_view(&gids).unwrap();
            assert_eq!(a.load_all().wait().unwrap(), b.load_all().wait().unwrap());
            assert_eq!(
                a.load_neuron(a.gids()[0]).wait().unwrap(),
                b.load_neuron(b.gids()[0]).wait().unwrap()
            );
        }
    }
}

#[test]
fn test_batched_reads_split_across_batches() {
    let synthetic = circuit(0.0, 10.0, 0.1);
    let config = ReportConfig {
        read_strategy: ReadStrategy::Batched,
        io_batch_size: 3,
        ..ReportConfig::workstation()
    };
    for swapped in [false, true] {
        let (_dir, path) = synthetic.write_temp(swapped);
        let report = ReportEngine::new(config.clone()).unwrap().open(&file_uri(&path)).unwrap();
        let view = report.create_view(&GidSet::from([1, 394, 512])).unwrap();

        let batch = view.load_frames(2.0, 3.0).wait().unwrap();
        assert_eq!(batch.len(), 10);
        for i in 0..batch.len() {
            assert_eq!(batch.frame(i), synthetic.expected(&[1, 394, 512], 20 + i).as_slice());
        }

        let whole = report.create_view(&GidSet::new()).unwrap().load_frame(7.0).wait().unwrap();
        assert_eq!(whole.data, synthetic.expected(&[1, 394, 400, 512], 70));
    }
}

// ---------------------------------------------------------------------------
// Damaged and unsupported input
// ---------------------------------------------------------------------------

#[test]
fn test_truncated_report_serves_complete_frames() {
    let mut synthetic = circuit(0.0, 10.0, 0.1);
    synthetic.stored_frames = Some(50);
    let (_dir, path) = synthetic.write_temp(false);
    let report = engine().open(&file_uri(&path)).unwrap();
    assert_eq!(report.metadata().frame_count, 50);

    let view = report.create_view(&GidSet::new()).unwrap();
    assert_eq!(view.load_all().wait().unwrap().len(), 50);
}

#[test]
fn test_unsorted_cell_table() {
    let synthetic = SyntheticReport::new(
        0.0,
        1.0,
        0.5,
        vec![SyntheticCell::new(20, &[2]), SyntheticCell::new(10, &[1, 1])],
    );
    let (_dir, path) = synthetic.write_temp(false);
    let report = engine().open(&file_uri(&path)).unwrap();
    let view = report.create_view(&GidSet::new()).unwrap();

    // views are ordered by gid, not by file position
    assert_eq!(view.gids(), &[10, 20]);
    let frame = view.load_frame(0.5).wait().unwrap();
    assert_eq!(frame.data, synthetic.expected(&[10, 20], 1));
}

#[test]
fn test_interleaved_sections() {
    // cell 20 stores section 2 first, then sections 0 and 1
    let synthetic = SyntheticReport::new(
        0.0,
        1.0,
        0.5,
        vec![SyntheticCell::new(10, &[1, 1]), SyntheticCell::interleaved(20, &[2, 3, 1], &[2, 0, 1])],
    );
    for swapped in [false, true] {
        let (_dir, path) = synthetic.write_temp(swapped);
        let report = engine().open(&file_uri(&path)).unwrap();
        assert_eq!(report.index().section_counts(20), Some(&[2u16, 3, 1][..]));

        let view = report.create_view(&GidSet::from([20])).unwrap();
        assert_eq!(view.mapping().counts(), &[vec![2u16, 3, 1]]);
        assert_eq!(view.mapping().offsets(), &[vec![1u64, 3, 0]]);
        assert_eq!(
            view.mapping().index(),
            vec![(20, 2), (20, 0), (20, 0), (20, 1), (20, 1), (20, 1)]
        );
        let frame = view.load_frame(1.0).wait().unwrap();
        assert_eq!(frame.data, synthetic.expected(&[20], 2));
    }
}

#[test]
fn test_unsupported_uris() {
    let engine = engine();
    assert!(matches!(engine.open("report.txt"), Err(ReportError::UnsupportedFormat { .. })));
    assert!(matches!(engine.open("hdf5:///a/b.h5"), Err(ReportError::UnsupportedFormat { .. })));
    assert!(matches!(
        engine.open("/nonexistent/report.bbp"),
        Err(ReportError::Io { kind: std::io::ErrorKind::NotFound, .. })
    ));
}

#[test]
fn test_binary_writer_not_implemented() {
    let dir = tempfile::TempDir::new().unwrap();
    let uri = file_uri(&dir.path().join("out.bbp"));
    let mut writer = engine().create(&uri, AccessMode::Write).unwrap();
    assert!(matches!(
        writer.write_header(&ReportMetadata::new(0.0, 1.0, 0.1)),
        Err(ReportError::NotImplemented { backend: "binary", .. })
    ));
}
