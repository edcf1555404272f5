mod cli;
mod progress;
mod signal;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use vdump_core::archive::read_archive_header;
use vdump_core::commands;
use vdump_core::commands::check::CheckProgressEvent;
use vdump_core::commands::dump::DumpProgressEvent;
use vdump_core::commands::restore::{BlockWrite, RestoreProgressEvent};
use vdump_core::config::{Command, DumpMode, IoProfile, JobConfig};
use vdump_core::provider::controller::ProviderController;
use vdump_core::provider::FileProviderFactory;
use vdump_types::error::Result;

use cli::{Cli, Commands, Mode};
use progress::BlockTicker;

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    signal::install_signal_handlers();

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Dump {
            local,
            mode,
            dump_in,
            digest_in,
            dump_out,
            digest_out,
            bitmap_in,
            rdiff_out,
            block_size,
            san,
        } => {
            let mut cfg = JobConfig::new(Command::Dump);
            cfg.mode = Some(match mode {
                Mode::Full => DumpMode::Full,
                Mode::Diff => DumpMode::Diff,
                Mode::Incr => DumpMode::Incr,
            });
            cfg.dump_in = dump_in;
            cfg.digest_in = digest_in;
            cfg.dump_out = dump_out;
            cfg.digest_out = digest_out;
            cfg.bitmap_in = bitmap_in;
            cfg.rdiff_out = rdiff_out;
            if let Some(bs) = block_size {
                cfg.block_size = bs;
            }
            cfg.use_san = san;
            cfg.validate()?;
            run_dump(cfg, local)
        }

        Commands::Restore {
            local,
            digest_in,
            create,
            metadata,
            omit_zero_block,
            san,
            archives,
        } => {
            let mut cfg = JobConfig::new(Command::Restore);
            cfg.digest_in = digest_in;
            cfg.archives = archives;
            cfg.create = create;
            cfg.write_metadata = metadata;
            cfg.write_zero_blocks = !omit_zero_block;
            cfg.use_san = san;
            run_restore(cfg, local)
        }

        Commands::Check { digest_in, archives } => {
            let mut cfg = JobConfig::new(Command::Check);
            cfg.digest_in = Some(digest_in);
            cfg.archives = archives;
            run_check(cfg)
        }

        Commands::Print { dump_in, digest_in } => {
            let mut cfg = JobConfig::new(Command::Print);
            cfg.dump_in = dump_in;
            cfg.digest_in = digest_in;
            let mut out = std::io::stdout().lock();
            commands::print::run(&cfg, &mut out)
        }

        Commands::Digest { dump_in, digest_out } => {
            let mut cfg = JobConfig::new(Command::Digest);
            cfg.dump_in = Some(dump_in);
            cfg.digest_out = Some(digest_out);
            let outcome = commands::digest::run(&cfg, Some(&signal::SHUTDOWN))?;
            println!("Digested {} blocks", outcome.blocks_digested);
            Ok(())
        }

        Commands::Merge {
            dump_out,
            rdiff_out,
            archives,
        } => {
            let mut cfg = JobConfig::new(Command::Merge);
            cfg.dump_out = dump_out;
            cfg.rdiff_out = rdiff_out;
            cfg.archives = archives;
            let outcome = commands::merge::run(&cfg, Some(&signal::SHUTDOWN))?;
            println!(
                "Merged {} blocks into a {} ({} offsets untouched)",
                outcome.blocks_written,
                if outcome.wrote_full { "full dump" } else { "rdiff" },
                outcome.blocks_skipped,
            );
            Ok(())
        }

        Commands::Rdiff2bmp {
            dump_in,
            bitmap_out,
        } => {
            let bmp =
                commands::bitmap::bitmap_from_rdiff(&dump_in, &bitmap_out, IoProfile::Parallel)?;
            println!(
                "Bitmap written: {} of {} blocks changed",
                bmp.count_set(),
                bmp.len(),
            );
            Ok(())
        }

        Commands::Printbmp { bitmap_in } => {
            let mut out = std::io::stdout().lock();
            commands::bitmap::print_bitmap(&bitmap_in, &mut out)
        }
    }
}

fn run_dump(cfg: JobConfig, local: PathBuf) -> Result<()> {
    let factory = Arc::new(FileProviderFactory {
        path: local,
        block_size: cfg.block_size,
    });
    // The child must fork before any archive worker thread exists; the
    // orchestrator opens the streams only after this.
    let mut provider = ProviderController::new(factory, cfg.block_size, true, cfg.use_san);
    provider.start()?;

    let mut ticker = BlockTicker::new();
    let mut on_block = |event: DumpProgressEvent| {
        let DumpProgressEvent::BlockDone {
            offset,
            read,
            changed,
        } = event;
        let symbol = if !read {
            '_'
        } else if changed {
            'o'
        } else {
            '.'
        };
        ticker.tick(offset, symbol);
    };
    let outcome = commands::dump::run_with_progress(
        &cfg,
        &mut provider,
        Some(&signal::SHUTDOWN),
        Some(&mut on_block),
    )?;
    provider.stop();

    ticker.finish("dump");
    println!(
        "Dumped {} blocks ({} read from the disk, {} changed, {} provider resets)",
        outcome.blocks_total, outcome.blocks_read, outcome.blocks_changed, outcome.resets,
    );
    Ok(())
}

fn run_restore(mut cfg: JobConfig, local: PathBuf) -> Result<()> {
    // The target's block size is whatever the archives were written with.
    let header = read_archive_header(cfg.archives.first().ok_or_else(|| {
        vdump_types::error::VdumpError::Config(
            "restore needs one or more dump/rdiff archives".into(),
        )
    })?)?;
    cfg.block_size = header.block_size;
    tracing::info!(
        block_size = header.block_size,
        full = header.is_full,
        "restore target geometry taken from the base archive"
    );

    let factory = Arc::new(FileProviderFactory {
        path: local,
        block_size: header.block_size,
    });
    // Not started here: the restore orchestrator starts it with the archive
    // workers paused around the fork.
    let mut provider = ProviderController::new(factory, header.block_size, false, cfg.use_san);

    let mut ticker = BlockTicker::new();
    let mut on_block = |event: RestoreProgressEvent| {
        let RestoreProgressEvent::BlockDone { offset, kind } = event;
        let symbol = match kind {
            BlockWrite::Skipped => '_',
            BlockWrite::Zero => '.',
            BlockWrite::Data => 'o',
        };
        ticker.tick(offset, symbol);
    };
    let outcome = commands::restore::run_with_progress(
        &cfg,
        &mut provider,
        Some(&signal::SHUTDOWN),
        Some(&mut on_block),
    )?;
    provider.stop();

    ticker.finish("restore");
    println!(
        "Restored {} blocks ({} skipped{})",
        outcome.blocks_written,
        outcome.blocks_skipped,
        if outcome.used_san {
            format!(", {} allocated via SAN pre-pass", outcome.blocks_allocated)
        } else {
            String::new()
        },
    );
    Ok(())
}

fn run_check(cfg: JobConfig) -> Result<()> {
    let mut ticker = BlockTicker::new();
    let mut on_block = |event: CheckProgressEvent| {
        let CheckProgressEvent::BlockDone {
            offset,
            present,
            valid,
        } = event;
        let symbol = if !present {
            '_'
        } else if valid {
            '.'
        } else {
            'X'
        };
        ticker.tick(offset, symbol);
    };
    let report =
        commands::check::run_with_progress(&cfg, Some(&signal::SHUTDOWN), Some(&mut on_block))?;
    ticker.finish("check");

    if report.is_ok() {
        println!("Check: OK");
        Ok(())
    } else {
        if !report.headers_match {
            println!("Headers do not describe the same snapshot");
        }
        for offset in &report.mismatched_offsets {
            println!("Digest mismatch at block {offset}");
        }
        println!("Check: WRONG");
        std::process::exit(1);
    }
}
