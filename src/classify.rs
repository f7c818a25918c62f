//! Call classification
//!
//! Decides whether an intercepted call matches a known diagnostic pattern
//! and reduces its arguments to plain structured values. Everything here is
//! safe code over descriptions already extracted at the abi boundary; the
//! thunks in [`crate::hooks`] feed this module and forward regardless of
//! what it concludes.

use std::fmt;

use crate::abi::Texture2dDescRaw;
use crate::stats;
use crate::trace;

/// CPU-access flag: the host may write the resource through a mapping.
pub const CPU_ACCESS_WRITE: u32 = 0x10000;
/// CPU-access flag: the host may read the resource through a mapping.
pub const CPU_ACCESS_READ: u32 = 0x20000;

/// Source extent of the diagnostic readback pattern.
pub const READBACK_SOURCE_EXTENT: u32 = 512;

/// Requested direction of a memory-open call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapMode {
    Read = 1,
    Write = 2,
    ReadWrite = 3,
    WriteDiscard = 4,
    WriteNoOverwrite = 5,
}

impl MapMode {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(MapMode::Read),
            2 => Some(MapMode::Write),
            3 => Some(MapMode::ReadWrite),
            4 => Some(MapMode::WriteDiscard),
            5 => Some(MapMode::WriteNoOverwrite),
            _ => None,
        }
    }

    /// Read-capable opens are where GPU-to-CPU synchronization stalls occur.
    pub fn is_read_capable(self) -> bool {
        matches!(self, MapMode::Read | MapMode::ReadWrite)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MapMode::Read => "READ",
            MapMode::Write => "WRITE",
            MapMode::ReadWrite => "READ_WRITE",
            MapMode::WriteDiscard => "WRITE_DISCARD",
            MapMode::WriteNoOverwrite => "WRITE_NO_OVERWRITE",
        }
    }
}

/// Usage class of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Usage {
    /// GPU-resident, GPU read/write.
    Default = 0,
    /// GPU-resident, written once at creation.
    Immutable = 1,
    /// Transient GPU-readable memory the CPU re-fills every frame.
    Dynamic = 2,
    /// CPU-readable staging memory used for GPU-to-CPU transfers.
    Staging = 3,
}

impl Usage {
    pub fn from_raw(raw: u32) -> Usage {
        match raw {
            1 => Usage::Immutable,
            2 => Usage::Dynamic,
            3 => Usage::Staging,
            _ => Usage::Default,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Usage::Default => "DEFAULT",
            Usage::Immutable => "IMMUTABLE",
            Usage::Dynamic => "DYNAMIC",
            Usage::Staging => "STAGING",
        }
    }
}

/// Structural description of one 2-D resource, reduced from the raw
/// driver-side description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceDesc {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub usage: Usage,
    pub cpu_access: u32,
    pub bind_flags: u32,
}

impl ResourceDesc {
    pub fn from_raw(raw: &Texture2dDescRaw) -> Self {
        Self {
            width: raw.width,
            height: raw.height,
            format: raw.format,
            usage: Usage::from_raw(raw.usage),
            cpu_access: raw.cpu_access_flags,
            bind_flags: raw.bind_flags,
        }
    }

    /// CPU-readable staging memory, the destination side of a readback.
    pub fn is_staging_readback(&self) -> bool {
        self.usage == Usage::Staging && self.cpu_access & CPU_ACCESS_READ != 0
    }

    /// Transient GPU-writable memory the CPU fills, the source side.
    pub fn is_transient_write(&self) -> bool {
        self.usage == Usage::Dynamic && self.cpu_access & CPU_ACCESS_WRITE != 0
    }
}

impl fmt::Display for ResourceDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} {} cpu={:#x}",
            self.width,
            self.height,
            self.usage.as_str(),
            self.cpu_access
        )
    }
}

/// Structural key describing one classified copy call. Two calls with
/// identical signatures are the same diagnostic pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSignature {
    pub src: ResourceDesc,
    pub dst: ResourceDesc,
}

impl CallSignature {
    pub fn new(src: ResourceDesc, dst: ResourceDesc) -> Self {
        Self { src, dst }
    }

    /// The diagnostic pattern of interest: a fixed 512x512 transient
    /// GPU-writable source copied into CPU-readable staging memory. The
    /// destination extent varies and deliberately does not participate.
    pub fn is_readback_pattern(&self) -> bool {
        self.src.width == READBACK_SOURCE_EXTENT
            && self.src.height == READBACK_SOURCE_EXTENT
            && self.src.usage == Usage::Dynamic
            && self.src.cpu_access == CPU_ACCESS_WRITE
            && self.dst.usage == Usage::Staging
            && self.dst.cpu_access == CPU_ACCESS_READ
    }
}

impl fmt::Display for CallSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} -> {}]", self.src, self.dst)
    }
}

/// Classify one copy between two 2-D resources and record it.
///
/// Always updates the aggregator; emits a trace event only while a session
/// is active.
pub fn observe_copy(
    src_handle: usize,
    dst_handle: usize,
    src: ResourceDesc,
    dst: ResourceDesc,
) {
    let sig = CallSignature::new(src, dst);
    let agg = stats::aggregator();

    agg.note_tex2d_copy();
    if dst.usage == Usage::Staging {
        agg.note_staging_dst_copy();
    }
    if src.usage == Usage::Dynamic {
        agg.note_transient_src_copy();
    }
    if sig.is_readback_pattern() {
        agg.note_pattern_match();
    }
    agg.record(sig);

    trace::recorder().record_copy(src_handle, dst_handle, &sig);
}

/// Classify a memory-open call after it has been forwarded.
///
/// Read-capable opens on staging memory are readbacks: the just-transferred
/// content is fingerprinted by the caller and tracked so the matching close
/// can report it. Write opens on transient memory are tracked so the written
/// content can be fingerprinted at close time.
pub fn observe_map_open(
    handle: usize,
    mode: MapMode,
    desc: ResourceDesc,
    region: Option<trace::TrackedRegion>,
) {
    let agg = stats::aggregator();
    if mode.is_read_capable() && desc.is_staging_readback() {
        agg.note_readback_map();
    }

    // Only resources of diagnostic interest produce tracked regions and
    // trace events; everything else is a counted pass-through.
    if let Some(region) = region {
        let rec = trace::recorder();
        rec.track_region(handle, region);
        rec.record_open(handle, mode, &desc);
    }
}

/// Classify a memory-close call; runs before the close is forwarded. The
/// caller has already consumed the paired tracked region and, for
/// write-side regions, finalized the pending fingerprint while the mapping
/// was still valid.
pub fn observe_map_close(handle: usize, region: Option<&trace::TrackedRegion>) {
    trace::recorder().record_close(handle, region);
}
