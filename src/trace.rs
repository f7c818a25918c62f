//! Trace session recording
//!
//! An operator-toggleable, timestamped event log of individual intercepted
//! calls. While a session is active every interesting call appends one
//! self-describing `key=value` line, flushed immediately so a crash never
//! loses already-written events. While inactive the whole recorder is a
//! single atomic load on the hot path.
//!
//! Open-access regions observed during a session are tracked by resource
//! handle so a memory-close can be paired with its open and report the
//! content fingerprint. Handles are reused by the host's own allocator, so
//! pairing is keyed by handle value, never by allocation order, and a
//! handle has at most one open region at a time (the intercepted interface
//! itself forbids re-opening before closing).

use fnv::FnvHashMap;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::classify::{CallSignature, MapMode, ResourceDesc};

static RECORDER: OnceLock<SessionRecorder> = OnceLock::new();

/// Process-wide recorder, created lazily from the active configuration.
pub fn recorder() -> &'static SessionRecorder {
    RECORDER.get_or_init(|| SessionRecorder::new(crate::active_config().trace_path.clone()))
}

/// One open CPU-access window on a resource of diagnostic interest.
///
/// Read-side regions carry the fingerprint computed right after the open
/// transferred the content; write-side regions carry the mapped pointer so
/// the written content can be fingerprinted at close time, while the
/// mapping is still valid.
#[derive(Debug, Clone, Copy)]
pub struct TrackedRegion {
    /// Mapped base address, kept as an integer; only dereferenced at the
    /// abi boundary before the close is forwarded.
    pub data: usize,
    pub row_pitch: u32,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    /// Present for read-side regions; computed at close for write-side.
    pub fingerprint: Option<u64>,
}

struct SinkState {
    sink: Option<File>,
    origin: Instant,
}

/// Process-wide trace session: Inactive -> (toggle) -> Active -> (toggle)
/// -> Inactive, repeatable indefinitely.
pub struct SessionRecorder {
    active: AtomicBool,
    state: Mutex<SinkState>,
    regions: Mutex<FnvHashMap<usize, TrackedRegion>>,
    path: PathBuf,
}

impl SessionRecorder {
    pub fn new(path: PathBuf) -> Self {
        Self {
            active: AtomicBool::new(false),
            state: Mutex::new(SinkState {
                sink: None,
                origin: Instant::now(),
            }),
            regions: Mutex::new(FnvHashMap::default()),
            path,
        }
    }

    /// Hot-path check; a single relaxed atomic load.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Flip the session state. Activation truncates and reopens the sink,
    /// resets the timestamp origin, and clears stale region pairings from
    /// any previous session. Deactivation closes the sink. Returns the new
    /// state.
    pub fn toggle(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return self.is_active();
        };

        if self.is_active() {
            self.active.store(false, Ordering::SeqCst);
            state.sink = None; // drop closes the file
            tracing::info!("trace session stopped, log saved to {}", self.path.display());
            return false;
        }

        match File::create(&self.path) {
            Ok(mut file) => {
                let header = "# vtprobe trace log - timestamps in microseconds\n\
                              # Format: [timestamp_us] EventKind key=value ...\n";
                if let Err(e) = file.write_all(header.as_bytes()).and_then(|_| file.flush()) {
                    tracing::warn!("failed to write trace header: {}", e);
                }
                state.origin = Instant::now();
                state.sink = Some(file);
                if let Ok(mut regions) = self.regions.lock() {
                    regions.clear();
                }
                self.active.store(true, Ordering::SeqCst);
                tracing::info!("trace session started, writing {}", self.path.display());
                true
            }
            Err(e) => {
                tracing::warn!(
                    "failed to open trace log {}: {}",
                    self.path.display(),
                    e
                );
                false
            }
        }
    }

    /// Remember an open region for `handle`. No-op while inactive. A second
    /// open on the same handle replaces the stale entry rather than losing
    /// the new one.
    pub fn track_region(&self, handle: usize, region: TrackedRegion) {
        if !self.is_active() {
            return;
        }
        if let Ok(mut regions) = self.regions.lock() {
            if regions.insert(handle, region).is_some() {
                tracing::warn!("handle {:#x} re-opened before close", handle);
            }
        }
    }

    /// Consume and return the open region for `handle`, if any.
    pub fn finish_region(&self, handle: usize) -> Option<TrackedRegion> {
        self.regions.lock().ok()?.remove(&handle)
    }

    /// Record a memory-open event.
    pub fn record_open(&self, handle: usize, mode: MapMode, desc: &ResourceDesc) {
        self.append(|ts| {
            format!(
                "[{}] Map resource={:#x} mode={} usage={} dim={}x{} fmt={}",
                ts,
                handle,
                mode.as_str(),
                desc.usage.as_str(),
                desc.width,
                desc.height,
                desc.format
            )
        });
    }

    /// Record a memory-close event; the finalized fingerprint rides along
    /// when the close pairs with a tracked open.
    pub fn record_close(&self, handle: usize, region: Option<&TrackedRegion>) {
        let Some(region) = region else {
            return;
        };
        let checksum = region.fingerprint.unwrap_or(0);
        self.append(|ts| {
            format!(
                "[{}] Unmap resource={:#x} checksum={:#x}",
                ts, handle, checksum
            )
        });
    }

    /// Record a copy event.
    pub fn record_copy(&self, src_handle: usize, dst_handle: usize, sig: &CallSignature) {
        self.append(|ts| {
            format!(
                "[{}] Copy src={:#x} dst={:#x} sig={}",
                ts, src_handle, dst_handle, sig
            )
        });
    }

    /// Close any open sink; used on module teardown.
    pub fn close(&self) {
        if self.is_active() {
            self.toggle();
        }
    }

    // Append one line if the session is active, flushing immediately. The
    // render closure only runs once the cheap activity check has passed.
    fn append<F: FnOnce(u64) -> String>(&self, render: F) {
        if !self.is_active() {
            return;
        }
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let ts = state.origin.elapsed().as_micros() as u64;
        if let Some(file) = state.sink.as_mut() {
            let line = render(ts);
            if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
                tracing::warn!("dropped trace event: {}", e);
            }
        }
    }
}

/// Background thread that watches an external toggle source at a fixed
/// low-frequency interval and flips the session on each rising edge. This
/// is the only thread that mutates session transition state.
pub struct TogglePoller {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TogglePoller {
    /// Spawn the poller. `source` reports whether the operator signal is
    /// currently asserted; a transition from false to true toggles the
    /// session exactly once, not once per poll tick.
    pub fn spawn<F>(recorder: &'static SessionRecorder, mut source: F, interval: Duration) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();
        let handle = thread::Builder::new()
            .name("vtprobe-toggle".into())
            .spawn(move || {
                let mut last = false;
                while !stop.load(Ordering::SeqCst) {
                    let signaled = source();
                    if signaled && !last {
                        recorder.toggle();
                    }
                    last = signaled;
                    thread::sleep(interval);
                }
            })
            .expect("failed to spawn toggle poller thread");
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Signal the poller to stop and join it.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TogglePoller {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
