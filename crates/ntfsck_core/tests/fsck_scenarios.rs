//! End-to-end checker scenarios over synthetic NTFS images.

mod support;

use ntfsck_core::{
    CheckOptions, CheckSession, NoProgress, ProblemEngine, RepairMode, Report, Volume,
};
use std::sync::{Arc, Mutex};
use support::{SharedDevice, VolumeBuilder, ROOT_BLOCK_OFFSET};

fn run_fsck(image: &Arc<Mutex<Vec<u8>>>, mode: RepairMode) -> Report {
    let dev = SharedDevice::new(Arc::clone(image), !mode.allows_write());
    let mut problems = ProblemEngine::new(mode);
    let vol = Volume::mount(Box::new(dev), &mut problems).expect("mount");
    let mut session = CheckSession::new(vol, problems, CheckOptions::default());
    session.run(&mut NoProgress).expect("run")
}

fn shared(image: Vec<u8>) -> Arc<Mutex<Vec<u8>>> {
    Arc::new(Mutex::new(image))
}

#[test]
fn clean_volume_read_only_reports_nothing() {
    let image = shared(VolumeBuilder::new().build());
    // The device is read-only: any attempted write would fail the run.
    let report = run_fsck(&image, RepairMode::No);
    assert_eq!(report.errors, 0);
    assert_eq!(report.fixes, 0);
    assert_eq!(report.exit_code(), 0);
}

#[test]
fn clean_volume_repair_yes_is_clean() {
    let image = shared(VolumeBuilder::new().build());
    let report = run_fsck(&image, RepairMode::Yes);
    assert_eq!(report.errors_left(), 0);
    assert_eq!(report.errors, 0);
    assert_eq!(report.exit_code(), 0);
}

#[test]
fn clean_volume_with_files_is_clean() {
    let mut b = VolumeBuilder::new();
    b.add_regular_file(40, "alpha.txt", &[(100, 4)], 10000);
    b.add_regular_file(41, "beta.bin", &[(120, 2), (130, 1)], 9000);
    let image = shared(b.build());
    let report = run_fsck(&image, RepairMode::No);
    assert_eq!(report.errors, 0);
    assert_eq!(report.exit_code(), 0);
}

#[test]
fn dirty_flag_round_trip() {
    let mut b = VolumeBuilder::new();
    b.set_dirty();
    let image = shared(b.build());

    {
        let dev = SharedDevice::new(Arc::clone(&image), true);
        let mut problems = ProblemEngine::new(RepairMode::No);
        let vol = Volume::mount(Box::new(dev), &mut problems).unwrap();
        assert!(vol.is_dirty());
    }

    // A clean repair run clears the flag.
    let report = run_fsck(&image, RepairMode::Yes);
    assert_eq!(report.errors_left(), 0);

    let dev = SharedDevice::new(Arc::clone(&image), true);
    let mut problems = ProblemEngine::new(RepairMode::No);
    let vol = Volume::mount(Box::new(dev), &mut problems).unwrap();
    assert!(!vol.is_dirty());
}

#[test]
fn orphan_file_is_relinked() {
    let mut b = VolumeBuilder::new();
    b.add_orphan_file(42, "stray.dat", &[(100, 2)], 5000);
    let image = shared(b.build());

    let report = run_fsck(&image, RepairMode::Yes);
    assert!(report.fixes >= 1, "orphan repair should count as a fix");
    assert_eq!(report.errors_left(), 0);
    assert_eq!(report.exit_code(), 1);

    // Second run: the entry exists, nothing left to do.
    let rerun = run_fsck(&image, RepairMode::Yes);
    assert_eq!(rerun.errors, 0, "relinked volume must check clean");
    assert_eq!(rerun.exit_code(), 0);
}

#[test]
fn orphan_repair_is_idempotent() {
    let mut b = VolumeBuilder::new();
    b.add_orphan_file(42, "stray.dat", &[(100, 2)], 5000);
    let image = shared(b.build());

    run_fsck(&image, RepairMode::Yes);
    let after_first = image.lock().unwrap().clone();
    run_fsck(&image, RepairMode::Yes);
    let after_second = image.lock().unwrap().clone();
    assert_eq!(after_first, after_second);
}

#[test]
fn read_only_mode_never_writes() {
    let mut b = VolumeBuilder::new();
    b.add_orphan_file(42, "stray.dat", &[(100, 2)], 5000);
    let image = shared(b.build());
    let before = image.lock().unwrap().clone();

    let report = run_fsck(&image, RepairMode::No);
    assert!(report.errors_left() > 0);
    assert_eq!(report.exit_code(), 4);
    assert_eq!(*image.lock().unwrap(), before);
}

#[test]
fn duplicated_clusters_are_relocated() {
    let mut b = VolumeBuilder::new();
    b.add_regular_file(40, "first.dat", &[(100, 4)], 16000);
    b.add_regular_file(41, "second.dat", &[(100, 4)], 16000);
    let image = shared(b.build());

    let report = run_fsck(&image, RepairMode::Yes);
    assert!(report.fixes >= 1);
    assert_eq!(report.errors_left(), 0);
    assert_eq!(report.exit_code(), 1);

    // The second file now owns its own clusters with the same content.
    let rerun = run_fsck(&image, RepairMode::Yes);
    assert_eq!(rerun.errors, 0);
    assert_eq!(rerun.exit_code(), 0);
}

#[test]
fn attr_length_overflow_left_uncorrected_read_only() {
    let mut b = VolumeBuilder::new();
    b.add_regular_file(40, "broken.dat", &[(100, 2)], 8000);
    b.corrupt_attr_length(40);
    let image = shared(b.build());

    let report = run_fsck(&image, RepairMode::No);
    assert!(report.errors_left() > 0);
    assert_eq!(report.exit_code(), 4);
}

#[test]
fn attr_length_overflow_cleaned_by_repair() {
    let mut b = VolumeBuilder::new();
    b.add_regular_file(40, "broken.dat", &[(100, 2)], 8000);
    b.corrupt_attr_length(40);
    let image = shared(b.build());

    let report = run_fsck(&image, RepairMode::Yes);
    assert_eq!(report.errors_left(), 0);

    let rerun = run_fsck(&image, RepairMode::Yes);
    assert_eq!(rerun.errors, 0);
    assert_eq!(rerun.exit_code(), 0);
}

#[test]
fn corrupt_root_index_block_is_initialized_and_children_relinked() {
    let mut b = VolumeBuilder::new();
    b.add_regular_file(40, "alpha.txt", &[(100, 4)], 10000);
    b.add_regular_file(41, "beta.bin", &[(120, 2)], 6000);
    let image = shared(b.build());
    {
        let mut data = image.lock().unwrap();
        data[ROOT_BLOCK_OFFSET..ROOT_BLOCK_OFFSET + 4].copy_from_slice(b"BAAD");
    }

    let report = run_fsck(&image, RepairMode::Yes);
    assert!(report.fixes >= 1, "index initialization should count");
    assert_eq!(report.errors_left(), 0);
    assert_eq!(report.exit_code(), 1);

    // The files resurface through the rebuilt index.
    let rerun = run_fsck(&image, RepairMode::Yes);
    assert_eq!(rerun.errors, 0, "reinitialized volume must check clean");
    assert_eq!(rerun.exit_code(), 0);
}

#[test]
fn cluster_bitmap_mismatch_is_reconciled() {
    let mut b = VolumeBuilder::new();
    b.add_regular_file(40, "alpha.txt", &[(100, 4)], 10000);
    let image = shared(b.build());
    {
        // Claim an unrelated cluster in the on-disk bitmap.
        let mut data = image.lock().unwrap();
        let lcnbmp_at = support::LCNBMP_LCN as usize * support::CLUSTER;
        data[lcnbmp_at + 150] |= 0x01; // cluster 1200, allocated by nobody
    }

    let report = run_fsck(&image, RepairMode::Yes);
    assert!(report.fixes >= 1);
    assert_eq!(report.errors_left(), 0);

    let rerun = run_fsck(&image, RepairMode::Yes);
    assert_eq!(rerun.errors, 0);
}
