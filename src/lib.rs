//! vtprobe - in-process call interception and readback diagnostics
//!
//! A passive probe that hooks the dispatch table of a graphics driver's
//! submission contexts, forwards every intercepted call unchanged, and
//! aggregates what it sees into two operator-facing artifacts:
//!
//! - a periodically rewritten statistics report ranking copy-call
//!   signatures and readback-pattern matches
//! - an on-demand trace session log with timestamped per-call events and
//!   content fingerprints
//!
//! The probe never alters host behavior: calls are always forwarded with
//! their original arguments, classification failures are absorbed, and all
//! diagnostic output goes to files of its own.
//!
//! Module layout:
//! - [`abi`]: raw dispatch-table access, the only unsafe-heavy module
//! - [`hooks`]: hook installation and the interception thunks
//! - [`classify`]: reduces calls to structural signatures
//! - [`fingerprint`]: content checksums over mapped regions
//! - [`stats`]: signature histogram and ranked report emission
//! - [`trace`]: toggleable trace sessions and the toggle poller
//! - [`config`]: file paths and timing knobs

pub mod abi;
pub mod classify;
pub mod config;
pub mod fingerprint;
pub mod hooks;
pub mod stats;
pub mod trace;

use std::sync::{Mutex, OnceLock};

use anyhow::Result;

use config::ProbeConfig;

static CONFIG: OnceLock<ProbeConfig> = OnceLock::new();
static POLLER: Mutex<Option<trace::TogglePoller>> = Mutex::new(None);

/// Install an explicit configuration before anything initializes. First
/// caller wins; returns `false` when a configuration was already active.
pub fn set_config(cfg: ProbeConfig) -> bool {
    CONFIG.set(cfg).is_ok()
}

/// The active configuration, loading from the environment on first use.
pub fn active_config() -> &'static ProbeConfig {
    CONFIG.get_or_init(ProbeConfig::load)
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    // A host may load and unload the probe repeatedly; a second init is
    // fine and keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

/// Bring the probe up: logging, configuration, and the background toggle
/// poller. `toggle_source` reports whether the operator signal is asserted;
/// each rising edge flips the trace session.
///
/// Hooks are installed separately, per context, via
/// [`hooks::hook_context`] as contexts are discovered.
pub fn init<F>(toggle_source: F) -> Result<()>
where
    F: FnMut() -> bool + Send + 'static,
{
    init_tracing();

    let mut guard = POLLER
        .lock()
        .map_err(|_| anyhow::anyhow!("toggle poller state poisoned"))?;
    if guard.is_some() {
        anyhow::bail!("probe already initialized");
    }

    let cfg = active_config();
    tracing::info!(
        "vtprobe up; stats -> {}, trace -> {}",
        cfg.stats_path.display(),
        cfg.trace_path.display()
    );

    *guard = Some(trace::TogglePoller::spawn(
        trace::recorder(),
        toggle_source,
        cfg.toggle_poll(),
    ));
    Ok(())
}

/// Tear the probe down: stop the poller, write a final statistics report,
/// close any active trace session, and restore every patched slot.
pub fn shutdown() {
    if let Ok(mut guard) = POLLER.lock() {
        if let Some(poller) = guard.take() {
            poller.stop();
        }
    }
    trace::recorder().close();
    stats::aggregator().write_report();
    hooks::restore_all();
    tracing::info!("vtprobe down");
}
