//! Statistics aggregation and periodic reporting
//!
//! The aggregator owns a signature-keyed histogram of observed copy
//! patterns plus a small set of named diagnostic counters. Once per report
//! interval the full table is serialized, ranked by descending count, to a
//! fixed-name file in overwrite mode, so the file always reflects the
//! complete window since process start.

use fnv::FnvHashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::classify::CallSignature;

static AGGREGATOR: OnceLock<Aggregator> = OnceLock::new();

/// Process-wide aggregator, created lazily from the active configuration.
pub fn aggregator() -> &'static Aggregator {
    AGGREGATOR.get_or_init(|| {
        let cfg = crate::active_config();
        Aggregator::new(cfg.stats_path.clone(), cfg.report_interval())
    })
}

/// Keyed histogram of call signatures plus scalar diagnostic counters.
///
/// The histogram sits behind its own mutex; the scalar counters are plain
/// atomic increments since they carry no compound invariant. Holding the
/// histogram lock never blocks any other subsystem.
pub struct Aggregator {
    table: Mutex<FnvHashMap<CallSignature, u64>>,
    total_calls: AtomicU64,
    copy_calls: AtomicU64,
    tex2d_copies: AtomicU64,
    staging_dst_copies: AtomicU64,
    transient_src_copies: AtomicU64,
    pattern_matches: AtomicU64,
    readback_maps: AtomicU64,
    flush_calls: AtomicU64,
    draw_calls: AtomicU64,
    start: Mutex<Instant>,
    last_report: Mutex<Instant>,
    report_interval: Duration,
    stats_path: PathBuf,
}

impl Aggregator {
    pub fn new(stats_path: PathBuf, report_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            table: Mutex::new(FnvHashMap::default()),
            total_calls: AtomicU64::new(0),
            copy_calls: AtomicU64::new(0),
            tex2d_copies: AtomicU64::new(0),
            staging_dst_copies: AtomicU64::new(0),
            transient_src_copies: AtomicU64::new(0),
            pattern_matches: AtomicU64::new(0),
            readback_maps: AtomicU64::new(0),
            flush_calls: AtomicU64::new(0),
            draw_calls: AtomicU64::new(0),
            start: Mutex::new(now),
            last_report: Mutex::new(now),
            report_interval,
            stats_path,
        }
    }

    /// Increment the entry for `sig`, creating it with count 1 if absent.
    /// Never fails; a poisoned lock only skips the one update.
    pub fn record(&self, sig: CallSignature) {
        if let Ok(mut table) = self.table.lock() {
            *table.entry(sig).or_insert(0) += 1;
        }
    }

    pub fn note_call(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_copy_call(&self) {
        self.copy_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_tex2d_copy(&self) {
        self.tex2d_copies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_staging_dst_copy(&self) {
        self.staging_dst_copies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_transient_src_copy(&self) {
        self.transient_src_copies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_pattern_match(&self) {
        self.pattern_matches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_readback_map(&self) {
        self.readback_maps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_flush(&self) {
        self.flush_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_draw(&self) {
        self.draw_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    pub fn pattern_matches(&self) -> u64 {
        self.pattern_matches.load(Ordering::Relaxed)
    }

    pub fn readback_maps(&self) -> u64 {
        self.readback_maps.load(Ordering::Relaxed)
    }

    /// Count recorded for one signature, 0 if never seen.
    pub fn signature_count(&self, sig: &CallSignature) -> u64 {
        self.table
            .lock()
            .map(|t| t.get(sig).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Number of distinct signatures in the table.
    pub fn unique_signatures(&self) -> usize {
        self.table.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Emit a report if the interval has elapsed since the previous one.
    pub fn maybe_emit_report(&self, now: Instant) {
        {
            let Ok(mut last) = self.last_report.lock() else {
                return;
            };
            if now.duration_since(*last) < self.report_interval {
                return;
            }
            *last = now;
        }
        self.write_report();
    }

    /// Serialize the full table to the stats sink, fully replacing the
    /// previous report. An IO failure drops this emission and leaves the
    /// in-memory state untouched; the next interval retries.
    pub fn write_report(&self) {
        let elapsed = self
            .start
            .lock()
            .map(|s| s.elapsed())
            .unwrap_or_default();
        let report = self.render_report(elapsed);
        if let Err(e) = std::fs::write(&self.stats_path, report) {
            tracing::warn!(
                "failed to write stats report {}: {}",
                self.stats_path.display(),
                e
            );
        }
    }

    /// Render the report text for a given elapsed time. Aside from the
    /// elapsed-seconds header, the output depends only on recorded state.
    pub fn render_report(&self, elapsed: Duration) -> String {
        use std::fmt::Write as _;

        let mut out = String::new();
        let _ = writeln!(
            out,
            "=== READBACK DIAGNOSTIC STATISTICS ({:.3}s) ===",
            elapsed.as_secs_f64()
        );
        out.push('\n');
        out.push_str("DIAGNOSTICS:\n");
        let _ = writeln!(
            out,
            "  Total intercepted calls: {}",
            self.total_calls.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "  Copy calls: {}",
            self.copy_calls.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "  Tex2D->Tex2D copies: {}",
            self.tex2d_copies.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "  Copies with STAGING dst: {}",
            self.staging_dst_copies.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "  Copies with DYNAMIC src: {}",
            self.transient_src_copies.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "  Read-capable STAGING maps: {}",
            self.readback_maps.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "  Flush calls: {}",
            self.flush_calls.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "  Draw calls: {}",
            self.draw_calls.load(Ordering::Relaxed)
        );
        out.push('\n');
        out.push_str("READBACK PATTERN:\n");
        let _ = writeln!(
            out,
            "  512x512 DYNAMIC->STAGING copies: {}",
            self.pattern_matches.load(Ordering::Relaxed)
        );
        out.push('\n');

        let mut entries: Vec<(String, u64)> = match self.table.lock() {
            Ok(table) => table
                .iter()
                .map(|(sig, count)| (sig.to_string(), *count))
                .collect(),
            Err(_) => Vec::new(),
        };
        // Descending by count; ties broken by signature text so two
        // emissions of the same state are byte-identical.
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let _ = writeln!(out, "Copy patterns ({} unique):", entries.len());
        for (sig, count) in entries {
            let _ = writeln!(out, "  {}: count={}", sig, count);
        }
        out.push_str("==========================================================\n");
        out
    }

    /// Drop all recorded state and restart the timestamp origin. Used at
    /// module teardown and by tests that share the process-wide instance.
    pub fn reset(&self) {
        if let Ok(mut table) = self.table.lock() {
            table.clear();
        }
        for counter in [
            &self.total_calls,
            &self.copy_calls,
            &self.tex2d_copies,
            &self.staging_dst_copies,
            &self.transient_src_copies,
            &self.pattern_matches,
            &self.readback_maps,
            &self.flush_calls,
            &self.draw_calls,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        let now = Instant::now();
        if let Ok(mut start) = self.start.lock() {
            *start = now;
        }
        if let Ok(mut last) = self.last_report.lock() {
            *last = now;
        }
    }
}
