//! End-to-end flows over real files: dump generations, digest, check,
//! merge, and restore against flat disk images.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use vdump_core::archive::{open_digest_input, open_dump_input};
use vdump_core::commands::{check, digest, dump, merge, restore};
use vdump_core::config::{Command, DumpMode, IoProfile, JobConfig};
use vdump_core::provider::{FileProviderFactory, InProcessSession};
use vdump_core::record::{DigestBlock, DigestHeader, DumpBlock, DumpHeader};

const BS: usize = 512;

fn zeros() -> Vec<u8> {
    vec![0u8; BS]
}

fn filled(byte: u8) -> Vec<u8> {
    vec![byte; BS]
}

fn write_image(path: &Path, blocks: &[Vec<u8>]) {
    let mut data = Vec::with_capacity(blocks.len() * BS);
    for b in blocks {
        assert_eq!(b.len(), BS);
        data.extend_from_slice(b);
    }
    std::fs::write(path, data).unwrap();
}

fn session_for(image: &Path) -> InProcessSession {
    let factory = Arc::new(FileProviderFactory {
        path: image.to_path_buf(),
        block_size: BS as u64,
    });
    InProcessSession::new(factory, true, false)
}

fn gen_cfg(dir: &Path, mode: DumpMode, prev: Option<&str>, out: &str) -> JobConfig {
    let mut cfg = JobConfig::new(Command::Dump);
    cfg.mode = Some(mode);
    cfg.block_size = BS as u64;
    cfg.dump_out = Some(dir.join(format!("{out}.dump")));
    cfg.digest_out = Some(dir.join(format!("{out}.digest")));
    if let Some(prev) = prev {
        cfg.dump_in = Some(dir.join(format!("{prev}.dump")));
        cfg.digest_in = Some(dir.join(format!("{prev}.digest")));
        cfg.rdiff_out = Some(dir.join(format!("{out}.rdiff")));
    }
    cfg
}

fn run_dump(dir: &Path, image: &Path, mode: DumpMode, prev: Option<&str>, out: &str) {
    let cfg = gen_cfg(dir, mode, prev, out);
    let mut session = session_for(image);
    dump::run(&cfg, &mut session, None).unwrap();
}

fn read_dump(path: &Path) -> (DumpHeader, Vec<DumpBlock>) {
    let mut input = open_dump_input(path, IoProfile::Single).unwrap();
    let header = (*input.header()).clone();
    let mut blocks = Vec::new();
    while let Some(b) = input.next_block().unwrap() {
        blocks.push(b);
    }
    (header, blocks)
}

fn read_digest(path: &Path) -> (DigestHeader, Vec<DigestBlock>) {
    let mut input = open_digest_input(path, IoProfile::Single).unwrap();
    let header = (*input.header()).clone();
    let mut blocks = Vec::new();
    while let Some(b) = input.next_block().unwrap() {
        blocks.push(b);
    }
    (header, blocks)
}

/// Generations must have distinct dump timestamps for the rdiff chain's
/// temporal ordering; the wire format stores whole seconds.
fn next_generation_tick() {
    std::thread::sleep(std::time::Duration::from_millis(1100));
}

/// Build three generations of one disk and return (dir, image path).
///
/// gen0: [zero, A, zero, B]
/// gen1: block 2 -> C (diff)
/// gen2: block 3 -> D (diff)
fn three_generations(dir: &Path) -> PathBuf {
    let image = dir.join("disk.img");
    write_image(&image, &[zeros(), filled(b'A'), zeros(), filled(b'B')]);
    run_dump(dir, &image, DumpMode::Full, None, "gen0");

    next_generation_tick();
    write_image(&image, &[zeros(), filled(b'A'), filled(b'C'), filled(b'B')]);
    run_dump(dir, &image, DumpMode::Diff, Some("gen0"), "gen1");

    next_generation_tick();
    write_image(&image, &[zeros(), filled(b'A'), filled(b'C'), filled(b'D')]);
    run_dump(dir, &image, DumpMode::Diff, Some("gen1"), "gen2");
    image
}

#[test]
fn full_dump_restore_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    let source = dir.join("source.img");
    write_image(&source, &[zeros(), filled(b'A'), zeros(), filled(b'B')]);
    run_dump(dir, &source, DumpMode::Full, None, "gen0");

    // Restore into a freshly created image.
    let target = dir.join("restored.img");
    let mut cfg = JobConfig::new(Command::Restore);
    cfg.block_size = BS as u64;
    cfg.create = true;
    cfg.archives = vec![dir.join("gen0.dump")];
    let mut session = {
        let factory = Arc::new(FileProviderFactory {
            path: target.clone(),
            block_size: BS as u64,
        });
        InProcessSession::new(factory, false, false)
    };
    let outcome = restore::run(&cfg, &mut session, None).unwrap();
    assert_eq!(outcome.blocks_written, 4);

    assert_eq!(
        std::fs::read(&source).unwrap(),
        std::fs::read(&target).unwrap()
    );

    // Backing up the restored image reproduces the same digests.
    run_dump(dir, &target, DumpMode::Full, None, "again");
    let (_, original) = read_digest(&dir.join("gen0.digest"));
    let (_, again) = read_digest(&dir.join("again.digest"));
    assert_eq!(original, again);
}

#[test]
fn digest_command_reproduces_dump_digest_byte_identically() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    let image = dir.join("disk.img");
    write_image(&image, &[filled(3), zeros(), filled(9), filled(9)]);
    run_dump(dir, &image, DumpMode::Full, None, "gen0");

    let mut cfg = JobConfig::new(Command::Digest);
    cfg.dump_in = Some(dir.join("gen0.dump"));
    cfg.digest_out = Some(dir.join("recomputed.digest"));
    let outcome = digest::run(&cfg, None).unwrap();
    assert_eq!(outcome.blocks_digested, 4);

    assert_eq!(
        std::fs::read(dir.join("gen0.digest")).unwrap(),
        std::fs::read(dir.join("recomputed.digest")).unwrap()
    );
}

#[test]
fn merge_rolls_generations_backwards() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    three_generations(dir);

    // Newest full plus both reverse deltas reconstructs generation 0,
    // byte for byte.
    let mut cfg = JobConfig::new(Command::Merge);
    cfg.block_size = BS as u64;
    cfg.dump_out = Some(dir.join("merged0.dump"));
    cfg.archives = vec![
        dir.join("gen2.dump"),
        dir.join("gen2.rdiff"),
        dir.join("gen1.rdiff"),
    ];
    let outcome = merge::run(&cfg, None).unwrap();
    assert!(outcome.wrote_full);
    assert_eq!(
        std::fs::read(dir.join("merged0.dump")).unwrap(),
        std::fs::read(dir.join("gen0.dump")).unwrap()
    );

    // One rdiff back reconstructs generation 1.
    let mut cfg = JobConfig::new(Command::Merge);
    cfg.block_size = BS as u64;
    cfg.dump_out = Some(dir.join("merged1.dump"));
    cfg.archives = vec![dir.join("gen2.dump"), dir.join("gen2.rdiff")];
    merge::run(&cfg, None).unwrap();
    assert_eq!(
        std::fs::read(dir.join("merged1.dump")).unwrap(),
        std::fs::read(dir.join("gen1.dump")).unwrap()
    );
}

#[test]
fn merge_two_rdiffs_into_one() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    three_generations(dir);

    let mut cfg = JobConfig::new(Command::Merge);
    cfg.block_size = BS as u64;
    cfg.rdiff_out = Some(dir.join("combined.rdiff"));
    cfg.archives = vec![dir.join("gen2.rdiff"), dir.join("gen1.rdiff")];
    let outcome = merge::run(&cfg, None).unwrap();
    assert!(!outcome.wrote_full);

    // Blocks 2 and 3 changed across the chain; both must appear, with the
    // oldest values (block 2 was zero in gen0, block 3 carried B).
    let (header, blocks) = read_dump(&dir.join("combined.rdiff"));
    assert!(!header.is_full);
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0], DumpBlock::all_zero(2));
    assert_eq!(blocks[1].offset, 3);
    assert_eq!(blocks[1].payload().unwrap(), filled(b'B').as_slice());

    // Applying the combined rdiff to the newest full still yields gen0.
    let mut cfg = JobConfig::new(Command::Merge);
    cfg.block_size = BS as u64;
    cfg.dump_out = Some(dir.join("via_combined.dump"));
    cfg.archives = vec![dir.join("gen2.dump"), dir.join("combined.rdiff")];
    merge::run(&cfg, None).unwrap();
    let (_, via) = read_dump(&dir.join("via_combined.dump"));
    let (_, gen0) = read_dump(&dir.join("gen0.dump"));
    assert_eq!(via, gen0);
}

#[test]
fn check_accepts_good_archives_and_flags_corruption() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    let image = dir.join("disk.img");
    write_image(&image, &[zeros(), filled(b'A'), zeros(), filled(b'B')]);
    run_dump(dir, &image, DumpMode::Full, None, "gen0");

    let mut cfg = JobConfig::new(Command::Check);
    cfg.block_size = BS as u64;
    cfg.digest_in = Some(dir.join("gen0.digest"));
    cfg.archives = vec![dir.join("gen0.dump")];
    let report = check::run(&cfg, None).unwrap();
    assert!(report.is_ok());
    assert_eq!(report.blocks_checked, 4);

    // Corrupt the digest: block 1 claims the fingerprint of "X"*512.
    let (header, mut digests) = read_digest(&dir.join("gen0.digest"));
    digests[1] = DigestBlock::of_block(&DumpBlock::from_raw(1, filled(b'X')));
    let corrupt = dir.join("corrupt.digest");
    {
        use vdump_core::archive::DigestOutput;
        let mut out = DigestOutput::create(&corrupt, IoProfile::Single).unwrap();
        out.write_header(&header).unwrap();
        for d in &digests {
            out.put(*d).unwrap();
        }
        out.stop().unwrap();
    }

    let mut cfg = JobConfig::new(Command::Check);
    cfg.block_size = BS as u64;
    cfg.digest_in = Some(corrupt);
    cfg.archives = vec![dir.join("gen0.dump")];
    let report = check::run(&cfg, None).unwrap();
    assert!(!report.is_ok());
    assert!(report.headers_match);
    assert_eq!(report.mismatched_offsets, vec![1]);
}

#[test]
fn check_verifies_a_full_plus_rdiff_chain() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    three_generations(dir);

    // The chain [gen2, rdiff2] reconstructs gen1, so gen1's digest matches.
    let mut cfg = JobConfig::new(Command::Check);
    cfg.block_size = BS as u64;
    cfg.digest_in = Some(dir.join("gen1.digest"));
    cfg.archives = vec![dir.join("gen2.dump"), dir.join("gen2.rdiff")];
    let report = check::run(&cfg, None).unwrap();
    assert!(report.is_ok(), "report: {report:?}");
}

#[test]
fn gzip_archives_work_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    let image = dir.join("disk.img");
    write_image(&image, &[zeros(), filled(b'G'), zeros(), zeros()]);

    let mut cfg = JobConfig::new(Command::Dump);
    cfg.mode = Some(DumpMode::Full);
    cfg.block_size = BS as u64;
    cfg.dump_out = Some(dir.join("gen0.dump.gz"));
    cfg.digest_out = Some(dir.join("gen0.digest.gz"));
    let mut session = session_for(&image);
    dump::run(&cfg, &mut session, None).unwrap();

    let raw = std::fs::read(dir.join("gen0.dump.gz")).unwrap();
    assert_eq!(&raw[..2], &[0x1f, 0x8b]);

    let mut cfg = JobConfig::new(Command::Check);
    cfg.block_size = BS as u64;
    cfg.digest_in = Some(dir.join("gen0.digest.gz"));
    cfg.archives = vec![dir.join("gen0.dump.gz")];
    let report = check::run(&cfg, None).unwrap();
    assert!(report.is_ok());
}

#[test]
fn rdiff2bmp_marks_exactly_the_changed_blocks() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    three_generations(dir);

    let bmp_path = dir.join("gen1.bmp");
    let bmp = vdump_core::commands::bitmap::bitmap_from_rdiff(
        &dir.join("gen1.rdiff"),
        &bmp_path,
        IoProfile::Single,
    )
    .unwrap();
    assert_eq!(bmp.len(), 4);
    // Only block 2 changed between gen0 and gen1.
    assert!(!bmp.get(0));
    assert!(!bmp.get(1));
    assert!(bmp.get(2));
    assert!(!bmp.get(3));

    let mut printed = Vec::new();
    vdump_core::commands::bitmap::print_bitmap(&bmp_path, &mut printed).unwrap();
    assert_eq!(String::from_utf8(printed).unwrap(), "size: 4\n0010\n");
}

#[test]
fn incremental_generation_via_bitmap() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    let image = dir.join("disk.img");
    write_image(&image, &[zeros(), filled(b'A'), zeros(), filled(b'B')]);
    run_dump(dir, &image, DumpMode::Full, None, "gen0");

    next_generation_tick();
    write_image(&image, &[zeros(), filled(b'A'), zeros(), filled(b'D')]);
    let mut bmp = vdump_core::record::bitmap::Bitmap::new(4);
    bmp.set(3, true);
    let bmp_path = dir.join("changed.bmp");
    let mut f = std::fs::File::create(&bmp_path).unwrap();
    bmp.write_to(&mut f).unwrap();
    drop(f);

    let mut cfg = gen_cfg(dir, DumpMode::Incr, Some("gen0"), "gen1");
    cfg.bitmap_in = Some(bmp_path);
    let mut session = session_for(&image);
    let outcome = dump::run(&cfg, &mut session, None).unwrap();
    assert_eq!(outcome.blocks_read, 1);

    // The incremental output is a complete full image regardless.
    let (header, blocks) = read_dump(&dir.join("gen1.dump"));
    assert!(header.is_full);
    assert_eq!(blocks.len(), 4);
    assert_eq!(blocks[3].payload().unwrap(), filled(b'D').as_slice());

    let (_, rdiff_blocks) = read_dump(&dir.join("gen1.rdiff"));
    assert_eq!(rdiff_blocks.len(), 1);
    assert_eq!(rdiff_blocks[0].offset, 3);
    assert_eq!(rdiff_blocks[0].payload().unwrap(), filled(b'B').as_slice());
}
