//! Probe configuration
//!
//! The probe has no command-line surface; the only knobs are the fixed
//! output filenames in the host's working directory and two timing
//! intervals. An optional TOML file named by the `VTPROBE_CONFIG`
//! environment variable overrides the defaults; anything unreadable falls
//! back silently so a bad config can never take the host down.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default statistics report filename.
pub const DEFAULT_STATS_PATH: &str = "vtprobe_stats.log";
/// Default trace session filename.
pub const DEFAULT_TRACE_PATH: &str = "vtprobe_trace.log";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProbeConfig {
    /// Where the ranked statistics report is overwritten.
    pub stats_path: PathBuf,
    /// Where trace-session events are appended.
    pub trace_path: PathBuf,
    /// Wall-clock gap between statistics report emissions.
    pub report_interval_ms: u64,
    /// Poll period of the background toggle thread.
    pub toggle_poll_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            stats_path: PathBuf::from(DEFAULT_STATS_PATH),
            trace_path: PathBuf::from(DEFAULT_TRACE_PATH),
            report_interval_ms: 1000,
            toggle_poll_ms: 50,
        }
    }
}

impl ProbeConfig {
    /// Load from the file named by `VTPROBE_CONFIG`, or fall back to the
    /// defaults.
    pub fn load() -> Self {
        let Ok(path) = std::env::var("VTPROBE_CONFIG") else {
            return Self::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!("ignoring malformed config {}: {}", path, e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("ignoring unreadable config {}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn toggle_poll(&self) -> Duration {
        Duration::from_millis(self.toggle_poll_ms)
    }
}
