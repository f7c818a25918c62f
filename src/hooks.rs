//! Hook installation and interception thunks
//!
//! The hook manager locates a live submission context's dispatch table,
//! replaces the entry points of diagnostic interest with thunks, and keeps
//! the captured originals so every call still reaches the real
//! implementation. The two context categories (immediate and deferred) are
//! hooked independently the first time an instance of each is seen.
//!
//! Every thunk observes, then forwards. Nothing here may change whether the
//! host's own call succeeds or fails: classification errors are absorbed,
//! and the return value of the original is handed back untouched.

use fnv::FnvHashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use crate::abi::{self, MappedSubresource, PatchError, RawObject, RawSlot};
use crate::classify::{self, MapMode, ResourceDesc};
use crate::fingerprint;
use crate::stats;
use crate::trace::{self, TrackedRegion};

/// The two categories of submission context in the intercepted family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextClass {
    Immediate,
    Deferred,
}

impl ContextClass {
    fn from_category(raw: u32) -> ContextClass {
        if raw == abi::CONTEXT_CATEGORY_IMMEDIATE {
            ContextClass::Immediate
        } else {
            ContextClass::Deferred
        }
    }

    fn index(self) -> usize {
        match self {
            ContextClass::Immediate => 0,
            ContextClass::Deferred => 1,
        }
    }

    fn bit(self) -> u32 {
        1 << self.index()
    }
}

/// Captured original entry points for one context class.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextProcs {
    pub map: Option<abi::MapProc>,
    pub unmap: Option<abi::UnmapProc>,
    pub copy_resource: Option<abi::CopyResourceProc>,
    pub copy_subresource_region: Option<abi::CopySubresourceRegionProc>,
    pub flush: Option<abi::FlushProc>,
    pub draw: Option<abi::DrawProc>,
    pub draw_indexed: Option<abi::DrawIndexedProc>,
}

/// One installed hook: enough to forward and to restore at shutdown.
#[derive(Debug, Clone, Copy)]
pub struct HookRecord {
    pub class: ContextClass,
    pub slot: usize,
    pub table: usize,
    pub original: usize,
    pub replacement: usize,
    pub installed: bool,
}

#[derive(Default)]
struct HookState {
    procs: [ContextProcs; 2],
    records: FnvHashMap<(ContextClass, usize), HookRecord>,
    installed_classes: u32,
}

// Single mutex guarding both the "is this class already patched" check and
// the patch action itself; deferred contexts can be created concurrently.
fn state() -> &'static Mutex<HookState> {
    static STATE: OnceLock<Mutex<HookState>> = OnceLock::new();
    STATE.get_or_init(|| Mutex::new(HookState::default()))
}

/// Determine which class a context belongs to.
fn class_of(ctx: RawObject) -> Option<ContextClass> {
    unsafe { abi::context_category(ctx) }.map(ContextClass::from_category)
}

fn install_locked(
    st: &mut HookState,
    class: ContextClass,
    object: RawObject,
    slot: usize,
    replacement: RawSlot,
) -> Result<HookRecord, PatchError> {
    if let Some(existing) = st.records.get(&(class, slot)) {
        if existing.installed {
            // Idempotent: one stored original, one patch action per
            // class/slot. Re-patching here could lose the original.
            tracing::debug!("slot {} already hooked for {:?}, no-op", slot, class);
            return Ok(*existing);
        }
    }
    let (table, original) = unsafe { abi::patch_slot(object, slot, replacement)? };
    let record = HookRecord {
        class,
        slot,
        table: table as usize,
        original: original as usize,
        replacement: replacement as usize,
        installed: true,
    };
    st.records.insert((class, slot), record);
    Ok(record)
}

/// Install a single hook on `object`'s dispatch table.
///
/// Idempotent per (class, slot): a second call returns the existing record
/// without touching the table. On failure the slot is left fully functional
/// and unintercepted; the host keeps working.
pub fn install_hook(
    object: RawObject,
    slot: usize,
    replacement: RawSlot,
) -> Result<HookRecord, PatchError> {
    let class = class_of(object).ok_or(PatchError::NullObject)?;
    let Ok(mut st) = state().lock() else {
        return Err(PatchError::NullObject);
    };
    install_locked(&mut st, class, object, slot, replacement)
}

fn try_hook(
    st: &mut HookState,
    class: ContextClass,
    ctx: RawObject,
    slot: usize,
    replacement: RawSlot,
) -> Option<usize> {
    match install_locked(st, class, ctx, slot, replacement) {
        Ok(record) => Some(record.original),
        Err(PatchError::AlreadyIntercepted { slot }) => {
            // A shared table already routes this slot through our thunk;
            // the propagated original keeps forwarding working.
            tracing::debug!("slot {} already carries the replacement", slot);
            None
        }
        Err(e) => {
            tracing::warn!("leaving slot {} unintercepted: {}", slot, e);
            None
        }
    }
}

macro_rules! hook_slot {
    ($st:expr, $class:expr, $ctx:expr, $slot:expr, $thunk:expr, $field:ident, $ty:ty) => {{
        let replacement = $thunk as $ty as usize as RawSlot;
        if let Some(original) = try_hook($st, $class, $ctx, $slot, replacement) {
            // Option<fn> shares the fn-pointer layout; 0 becomes None.
            $st.procs[$class.index()].$field =
                unsafe { std::mem::transmute::<usize, Option<$ty>>(original) };
        }
    }};
}

/// Hook a submission context the first time its class is seen.
///
/// Immediate and deferred contexts may share method addresses, so after
/// hooking the immediate class its original-pointer table is propagated to
/// the deferred class. That only avoids redundant patch attempts; a
/// deferred context with its own table still gets patched when it appears.
pub fn hook_context(ctx: RawObject) {
    let Some(class) = class_of(ctx) else {
        tracing::warn!("context category unavailable, not hooking");
        return;
    };

    {
        let Ok(mut st) = state().lock() else {
            return;
        };
        if st.installed_classes & class.bit() != 0 {
            tracing::debug!("{:?} context already hooked", class);
            return;
        }
        tracing::info!("installing hooks for {:?} context", class);

        hook_slot!(&mut st, class, ctx, abi::SLOT_MAP, map_thunk, map, abi::MapProc);
        hook_slot!(&mut st, class, ctx, abi::SLOT_UNMAP, unmap_thunk, unmap, abi::UnmapProc);
        hook_slot!(
            &mut st,
            class,
            ctx,
            abi::SLOT_COPY_SUBRESOURCE_REGION,
            copy_subresource_region_thunk,
            copy_subresource_region,
            abi::CopySubresourceRegionProc
        );
        hook_slot!(
            &mut st,
            class,
            ctx,
            abi::SLOT_COPY_RESOURCE,
            copy_resource_thunk,
            copy_resource,
            abi::CopyResourceProc
        );
        hook_slot!(&mut st, class, ctx, abi::SLOT_FLUSH, flush_thunk, flush, abi::FlushProc);
        hook_slot!(&mut st, class, ctx, abi::SLOT_DRAW, draw_thunk, draw, abi::DrawProc);
        hook_slot!(
            &mut st,
            class,
            ctx,
            abi::SLOT_DRAW_INDEXED,
            draw_indexed_thunk,
            draw_indexed,
            abi::DrawIndexedProc
        );

        st.installed_classes |= class.bit();

        if class == ContextClass::Immediate {
            let immediate = st.procs[ContextClass::Immediate.index()];
            st.procs[ContextClass::Deferred.index()] = immediate;
        }
    }

    // Initial report, so a sink-creation failure surfaces right away
    // instead of a silent missing file one interval later.
    stats::aggregator().write_report();
}

/// Forwarding table for the class `ctx` belongs to.
fn procs_for(ctx: RawObject) -> ContextProcs {
    let class = class_of(ctx).unwrap_or(ContextClass::Immediate);
    state()
        .lock()
        .map(|st| st.procs[class.index()])
        .unwrap_or_default()
}

/// Clean-shutdown path: write captured originals back into every table
/// actually patched, then forget all hook state.
pub fn restore_all() {
    let Ok(mut st) = state().lock() else {
        return;
    };
    for record in st.records.values_mut() {
        if record.installed {
            unsafe {
                abi::restore_slot(
                    record.table as *mut RawSlot,
                    record.slot,
                    record.original as RawSlot,
                )
            };
            record.installed = false;
        }
    }
    st.records.clear();
    st.procs = [ContextProcs::default(); 2];
    st.installed_classes = 0;
}

fn describe_tex2d(resource: RawObject) -> Option<ResourceDesc> {
    // Null arguments or an unavailable description skip classification for
    // this one call; the call itself is still forwarded.
    if unsafe { abi::resource_dimension(resource) }? != abi::RESOURCE_DIMENSION_TEXTURE2D {
        return None;
    }
    let raw = unsafe { abi::texture2d_desc(resource)? };
    Some(ResourceDesc::from_raw(&raw))
}

/// Build a tracked region for a just-opened mapping, fingerprinting
/// read-side content immediately. Only called while a session is active.
fn open_region(
    mode: MapMode,
    desc: &ResourceDesc,
    mapped: *mut MappedSubresource,
) -> Option<TrackedRegion> {
    if mapped.is_null() {
        return None;
    }
    let mapping = unsafe { *mapped };
    if mapping.data.is_null() {
        return None;
    }

    if mode.is_read_capable() && desc.is_staging_readback() {
        let bytes = unsafe { abi::mapped_bytes(&mapping, desc.height)? };
        let fp = fingerprint::fingerprint_rows(
            bytes,
            mapping.row_pitch as usize,
            desc.width as usize,
            desc.height as usize,
            fingerprint::bytes_per_pixel(desc.format),
        );
        Some(TrackedRegion {
            data: mapping.data as usize,
            row_pitch: mapping.row_pitch,
            width: desc.width,
            height: desc.height,
            format: desc.format,
            fingerprint: Some(fp),
        })
    } else if !mode.is_read_capable() && desc.is_transient_write() {
        // Write side: keep the mapped pointer, fingerprint at close once
        // the host has finished writing.
        Some(TrackedRegion {
            data: mapping.data as usize,
            row_pitch: mapping.row_pitch,
            width: desc.width,
            height: desc.height,
            format: desc.format,
            fingerprint: None,
        })
    } else {
        None
    }
}

/// Compute the pending write-side fingerprint while the mapping is still
/// valid.
fn finalize_region(mut region: TrackedRegion) -> TrackedRegion {
    if region.fingerprint.is_none() && region.data != 0 {
        let mapping = MappedSubresource {
            data: region.data as *mut u8,
            row_pitch: region.row_pitch,
            depth_pitch: 0,
        };
        if let Some(bytes) = unsafe { abi::mapped_bytes(&mapping, region.height) } {
            region.fingerprint = Some(fingerprint::fingerprint_rows(
                bytes,
                region.row_pitch as usize,
                region.width as usize,
                region.height as usize,
                fingerprint::bytes_per_pixel(region.format),
            ));
        }
    }
    region
}

// Thunks. Each reproduces the original call's parameter list and calling
// convention exactly and returns whatever the original returns. A missing
// original cannot happen by construction (it is captured before the patch
// is applied); if it somehow did, crashing loudly beats silently corrupting
// the host.

/// Memory-open interception.
///
/// # Safety
///
/// Installed into a live dispatch table; only the host calls this, with the
/// intercepted interface's own contract.
pub unsafe extern "system" fn map_thunk(
    ctx: RawObject,
    resource: RawObject,
    subresource: u32,
    map_type: u32,
    map_flags: u32,
    mapped: *mut MappedSubresource,
) -> i32 {
    let Some(orig) = procs_for(ctx).map else {
        panic!("memory-open thunk reached with no captured original");
    };

    let agg = stats::aggregator();
    agg.note_call();

    let mode = MapMode::from_raw(map_type);
    let desc = describe_tex2d(resource);

    let hr = unsafe { orig(ctx, resource, subresource, map_type, map_flags, mapped) };

    // Read-style classification runs after forwarding, once the transferred
    // content is available.
    if hr >= 0 {
        if let (Some(mode), Some(desc)) = (mode, desc) {
            let region = if trace::recorder().is_active() {
                open_region(mode, &desc, mapped)
            } else {
                None
            };
            classify::observe_map_open(resource as usize, mode, desc, region);
        }
    }

    hr
}

/// Memory-close interception; classification runs before forwarding, while
/// the mapping is still valid.
///
/// # Safety
///
/// See [`map_thunk`].
pub unsafe extern "system" fn unmap_thunk(ctx: RawObject, resource: RawObject, subresource: u32) {
    let Some(orig) = procs_for(ctx).unmap else {
        panic!("memory-close thunk reached with no captured original");
    };

    stats::aggregator().note_call();

    if !resource.is_null() && trace::recorder().is_active() {
        let handle = resource as usize;
        let region = trace::recorder().finish_region(handle).map(finalize_region);
        classify::observe_map_close(handle, region.as_ref());
    }

    unsafe { orig(ctx, resource, subresource) };
}

/// Partial-copy interception.
///
/// # Safety
///
/// See [`map_thunk`].
pub unsafe extern "system" fn copy_subresource_region_thunk(
    ctx: RawObject,
    dst: RawObject,
    dst_subresource: u32,
    dst_x: u32,
    dst_y: u32,
    dst_z: u32,
    src: RawObject,
    src_subresource: u32,
    src_box: *const abi::CopyBox,
) {
    let Some(orig) = procs_for(ctx).copy_subresource_region else {
        panic!("copy thunk reached with no captured original");
    };

    let agg = stats::aggregator();
    agg.note_call();
    agg.note_copy_call();

    if let (Some(src_desc), Some(dst_desc)) = (describe_tex2d(src), describe_tex2d(dst)) {
        classify::observe_copy(src as usize, dst as usize, src_desc, dst_desc);
    }

    // Always the actual copy; no skipping.
    unsafe {
        orig(
            ctx,
            dst,
            dst_subresource,
            dst_x,
            dst_y,
            dst_z,
            src,
            src_subresource,
            src_box,
        )
    };

    agg.maybe_emit_report(Instant::now());
}

/// Whole-resource-copy interception.
///
/// # Safety
///
/// See [`map_thunk`].
pub unsafe extern "system" fn copy_resource_thunk(ctx: RawObject, dst: RawObject, src: RawObject) {
    let Some(orig) = procs_for(ctx).copy_resource else {
        panic!("copy thunk reached with no captured original");
    };

    let agg = stats::aggregator();
    agg.note_call();
    agg.note_copy_call();

    if let (Some(src_desc), Some(dst_desc)) = (describe_tex2d(src), describe_tex2d(dst)) {
        classify::observe_copy(src as usize, dst as usize, src_desc, dst_desc);
    }

    unsafe { orig(ctx, dst, src) };

    agg.maybe_emit_report(Instant::now());
}

/// Submission interception.
///
/// # Safety
///
/// See [`map_thunk`].
pub unsafe extern "system" fn flush_thunk(ctx: RawObject) {
    let Some(orig) = procs_for(ctx).flush else {
        panic!("flush thunk reached with no captured original");
    };
    let agg = stats::aggregator();
    agg.note_call();
    agg.note_flush();
    unsafe { orig(ctx) };
    agg.maybe_emit_report(Instant::now());
}

/// Draw interception.
///
/// # Safety
///
/// See [`map_thunk`].
pub unsafe extern "system" fn draw_thunk(ctx: RawObject, vertex_count: u32, start_vertex: u32) {
    let Some(orig) = procs_for(ctx).draw else {
        panic!("draw thunk reached with no captured original");
    };
    let agg = stats::aggregator();
    agg.note_call();
    agg.note_draw();
    unsafe { orig(ctx, vertex_count, start_vertex) };
}

/// Indexed-draw interception.
///
/// # Safety
///
/// See [`map_thunk`].
pub unsafe extern "system" fn draw_indexed_thunk(
    ctx: RawObject,
    index_count: u32,
    start_index: u32,
    base_vertex: i32,
) {
    let Some(orig) = procs_for(ctx).draw_indexed else {
        panic!("draw thunk reached with no captured original");
    };
    let agg = stats::aggregator();
    agg.note_call();
    agg.note_draw();
    unsafe { orig(ctx, index_count, start_index, base_vertex) };
}
