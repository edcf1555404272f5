use std::io::Write;
use std::time::Instant;

/// Per-block progress display: one symbol per block, the offset at the
/// start of each row, and the row's throughput at its end.
///
/// Symbols: `o` changed/written, `.` read but unchanged (or zero), `_` not
/// touched, `X` mismatch (check).
pub struct BlockTicker {
    row: u64,
    row_start: Instant,
    started: Instant,
    count: u64,
}

/// Blocks per display row.
const ROW: u64 = 64;

impl BlockTicker {
    pub fn new() -> Self {
        let now = Instant::now();
        BlockTicker {
            row: 0,
            row_start: now,
            started: now,
            count: 0,
        }
    }

    pub fn tick(&mut self, offset: u64, symbol: char) {
        let mut out = std::io::stdout().lock();
        if offset % ROW == 0 {
            let _ = write!(out, "{offset} ");
        }
        let _ = write!(out, "{symbol}");
        if offset % ROW == ROW - 1 {
            let elapsed = self.row_start.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 {
                (offset - self.row + 1) as f64 / elapsed
            } else {
                0.0
            };
            let _ = writeln!(out, " {rate:.1} blks/s");
            self.row = offset + 1;
            self.row_start = Instant::now();
        }
        let _ = out.flush();
        self.count += 1;
    }

    /// Terminate the display and report total elapsed time.
    pub fn finish(&mut self, what: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(
            out,
            "\nElapsed time to {what}: {:.3} sec ({} blocks)",
            self.started.elapsed().as_secs_f64(),
            self.count,
        );
    }
}

impl Default for BlockTicker {
    fn default() -> Self {
        Self::new()
    }
}
