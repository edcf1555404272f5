use std::path::Path;

use crate::archive::manager::{ArchiveManager, DumpArchiveManager};
use crate::config::{Command, DumpMode, JobConfig};
use crate::record::bitmap::Bitmap;
use crate::record::{DigestBlock, DigestHeader, DumpBlock, DumpHeader};
use crate::testutil::{read_dump_file, write_digest_file, write_dump_file};
use crate::VdumpError;

const BS: u64 = 512;

fn block(offset: u64, byte: u8) -> DumpBlock {
    DumpBlock::from_raw(offset, vec![byte; BS as usize])
}

/// A consistent previous generation: full dump + matching digest.
fn prev_generation(dir: &Path, disk_size: u64) -> (DumpHeader, DigestHeader) {
    let dump_h = DumpHeader::new(disk_size, BS, 0);
    let blocks: Vec<DumpBlock> = (0..disk_size).map(|o| block(o, o as u8 + 1)).collect();
    write_dump_file(&dir.join("prev.dump"), &dump_h, &blocks);

    let digest_h = DigestHeader::derive_from(&dump_h);
    let digests: Vec<DigestBlock> = blocks.iter().map(DigestBlock::of_block).collect();
    write_digest_file(&dir.join("prev.digest"), &digest_h, &digests);
    (dump_h, digest_h)
}

fn diff_config(dir: &Path) -> JobConfig {
    let mut cfg = JobConfig::new(Command::Dump);
    cfg.mode = Some(DumpMode::Diff);
    cfg.block_size = BS;
    cfg.dump_in = Some(dir.join("prev.dump"));
    cfg.digest_in = Some(dir.join("prev.digest"));
    cfg.dump_out = Some(dir.join("new.dump"));
    cfg.digest_out = Some(dir.join("new.digest"));
    cfg.rdiff_out = Some(dir.join("new.rdiff"));
    cfg
}

#[test]
fn dump_full_requires_both_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = JobConfig::new(Command::Dump);
    cfg.mode = Some(DumpMode::Full);
    cfg.block_size = BS;
    cfg.dump_out = Some(dir.path().join("new.dump"));
    // Missing digest_out.
    assert!(matches!(
        ArchiveManager::open(&cfg),
        Err(VdumpError::Config(_))
    ));

    cfg.digest_out = Some(dir.path().join("new.digest"));
    ArchiveManager::open(&cfg).unwrap();
}

#[test]
fn dump_diff_requires_five_streams() {
    let dir = tempfile::tempdir().unwrap();
    prev_generation(dir.path(), 4);

    let full = diff_config(dir.path());
    for missing in ["dump_in", "digest_in", "dump_out", "digest_out", "rdiff_out"] {
        let mut cfg = full.clone();
        match missing {
            "dump_in" => cfg.dump_in = None,
            "digest_in" => cfg.digest_in = None,
            "dump_out" => cfg.dump_out = None,
            "digest_out" => cfg.digest_out = None,
            _ => cfg.rdiff_out = None,
        }
        assert!(
            matches!(ArchiveManager::open(&cfg), Err(VdumpError::Config(_))),
            "diff without {missing} should be rejected"
        );
    }
    ArchiveManager::open(&full).unwrap();
}

#[test]
fn dump_incr_additionally_requires_bitmap() {
    let dir = tempfile::tempdir().unwrap();
    prev_generation(dir.path(), 4);

    let mut cfg = diff_config(dir.path());
    cfg.mode = Some(DumpMode::Incr);
    assert!(matches!(
        ArchiveManager::open(&cfg),
        Err(VdumpError::Config(_))
    ));

    let bmp_path = dir.path().join("changed.bmp");
    let mut bmp_file = std::fs::File::create(&bmp_path).unwrap();
    Bitmap::new(4).write_to(&mut bmp_file).unwrap();
    drop(bmp_file);
    cfg.bitmap_in = Some(bmp_path);
    ArchiveManager::open(&cfg).unwrap();
}

#[test]
fn restore_needs_digest_only_with_san() {
    let cfg = {
        let mut cfg = JobConfig::new(Command::Restore);
        cfg.block_size = BS;
        cfg
    };
    ArchiveManager::open(&cfg).unwrap();

    let mut san = cfg.clone();
    san.use_san = true;
    assert!(matches!(
        ArchiveManager::open(&san),
        Err(VdumpError::Config(_))
    ));
}

#[test]
fn print_needs_some_input() {
    let dir = tempfile::tempdir().unwrap();
    prev_generation(dir.path(), 2);

    let mut cfg = JobConfig::new(Command::Print);
    cfg.block_size = BS;
    assert!(matches!(
        ArchiveManager::open(&cfg),
        Err(VdumpError::Config(_))
    ));

    cfg.dump_in = Some(dir.path().join("prev.dump"));
    ArchiveManager::open(&cfg).unwrap();
}

#[test]
fn merge_accepts_either_output() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = JobConfig::new(Command::Merge);
    cfg.block_size = BS;
    assert!(matches!(
        ArchiveManager::open(&cfg),
        Err(VdumpError::Config(_))
    ));

    cfg.rdiff_out = Some(dir.path().join("merged.rdiff"));
    ArchiveManager::open(&cfg).unwrap();
}

#[test]
fn read_prev_pair_passes_consistent_generation() {
    let dir = tempfile::tempdir().unwrap();
    prev_generation(dir.path(), 4);
    let cfg = diff_config(dir.path());

    let mut mgr = DumpArchiveManager::open(&cfg).unwrap();
    let prev = mgr.read_prev_headers().unwrap().expect("diff has previous");
    assert!(prev.dump.is_full);

    for offset in 0..4 {
        let (b, _) = mgr.read_prev_pair().unwrap();
        assert_eq!(b.offset, offset);
    }
}

#[test]
fn read_prev_pair_detects_corrupt_digest() {
    let dir = tempfile::tempdir().unwrap();
    let (_, digest_h) = prev_generation(dir.path(), 4);

    // Rewrite the digest with a wrong fingerprint at offset 2.
    let (_, blocks) = read_dump_file(&dir.path().join("prev.dump"));
    let mut digests: Vec<DigestBlock> = blocks.iter().map(DigestBlock::of_block).collect();
    digests[2] = DigestBlock::of_block(&block(2, 0xEE));
    write_digest_file(&dir.path().join("prev.digest"), &digest_h, &digests);

    let cfg = diff_config(dir.path());
    let mut mgr = DumpArchiveManager::open(&cfg).unwrap();
    mgr.read_prev_headers().unwrap();

    mgr.read_prev_pair().unwrap();
    mgr.read_prev_pair().unwrap();
    let err = mgr.read_prev_pair().unwrap_err();
    assert!(matches!(err, VdumpError::Consistency(_)));
}

#[test]
fn mismatched_prev_pair_rejected_at_header_stage() {
    let dir = tempfile::tempdir().unwrap();
    prev_generation(dir.path(), 4);

    // Replace the digest with one from an unrelated dump.
    let other = DumpHeader::new(4, BS, 0);
    let digest_h = DigestHeader::derive_from(&other);
    write_digest_file(&dir.path().join("prev.digest"), &digest_h, &[]);

    let cfg = diff_config(dir.path());
    let mut mgr = DumpArchiveManager::open(&cfg).unwrap();
    assert!(matches!(
        mgr.read_prev_headers(),
        Err(VdumpError::Consistency(_))
    ));
}

#[test]
fn rdiff_previous_must_be_full() {
    let dir = tempfile::tempdir().unwrap();
    let mut dump_h = DumpHeader::new(4, BS, 0);
    dump_h.is_full = false;
    let blocks: Vec<DumpBlock> = (0..4).map(|o| block(o, 1)).collect();
    write_dump_file(&dir.path().join("prev.dump"), &dump_h, &blocks);
    let digest_h = DigestHeader::derive_from(&dump_h);
    let digests: Vec<DigestBlock> = blocks.iter().map(DigestBlock::of_block).collect();
    write_digest_file(&dir.path().join("prev.digest"), &digest_h, &digests);

    let cfg = diff_config(dir.path());
    let mut mgr = DumpArchiveManager::open(&cfg).unwrap();
    assert!(matches!(
        mgr.read_prev_headers(),
        Err(VdumpError::Consistency(_))
    ));
}

#[test]
fn manager_pause_resume_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = JobConfig::new(Command::Dump);
    cfg.mode = Some(DumpMode::Full);
    cfg.block_size = BS;
    cfg.dump_out = Some(dir.path().join("out.dump"));
    cfg.digest_out = Some(dir.path().join("out.digest"));

    let header = DumpHeader::new(32, BS, 0);
    let mut mgr = ArchiveManager::open(&cfg).unwrap();
    mgr.write_dump_header(&header).unwrap();
    mgr.write_digest_header(&DigestHeader::derive_from(&header))
        .unwrap();

    let mut expected = Vec::new();
    for offset in 0..16 {
        let b = block(offset, offset as u8);
        mgr.write_dump_block(b.clone()).unwrap();
        mgr.write_digest_block(DigestBlock::of_block(&b)).unwrap();
        expected.push(b);
    }
    // Simulated fork window.
    mgr.pause();
    mgr.resume();
    for offset in 16..32 {
        let b = block(offset, offset as u8);
        mgr.write_dump_block(b.clone()).unwrap();
        mgr.write_digest_block(DigestBlock::of_block(&b)).unwrap();
        expected.push(b);
    }
    mgr.finish().unwrap();
    drop(mgr);

    let (got_header, got_blocks) = read_dump_file(&dir.path().join("out.dump"));
    assert_eq!(got_header, header);
    assert_eq!(got_blocks, expected);
}

#[test]
fn reading_past_end_is_consistency_error() {
    let dir = tempfile::tempdir().unwrap();
    prev_generation(dir.path(), 2);

    let mut cfg = JobConfig::new(Command::Print);
    cfg.block_size = BS;
    cfg.dump_in = Some(dir.path().join("prev.dump"));
    let mut mgr = ArchiveManager::open(&cfg).unwrap();

    mgr.read_dump_block().unwrap();
    mgr.read_dump_block().unwrap();
    assert!(!mgr.can_read_dump().unwrap());
    assert!(matches!(
        mgr.read_dump_block(),
        Err(VdumpError::Consistency(_))
    ));
}
