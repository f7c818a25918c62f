//! Shared fixtures for integration tests: synthetic driver objects whose
//! dispatch tables carry recording "original" entry points, so the full
//! hook-install / forward / restore cycle can be exercised in-process.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Once, OnceLock};

use vtprobe::abi::{self, MappedSubresource, RawObject, RawSlot, Texture2dDescRaw};

/// Invocation counters for the synthetic originals. Every forwarded call
/// lands here, proving pass-through.
pub struct OriginalCalls {
    pub map: AtomicUsize,
    pub unmap: AtomicUsize,
    pub copy_region: AtomicUsize,
    pub copy_resource: AtomicUsize,
    pub flush: AtomicUsize,
    pub draw: AtomicUsize,
    pub draw_indexed: AtomicUsize,
    pub last_map_type: AtomicU32,
    pub last_subresource: AtomicU32,
}

pub static CALLS: OriginalCalls = OriginalCalls {
    map: AtomicUsize::new(0),
    unmap: AtomicUsize::new(0),
    copy_region: AtomicUsize::new(0),
    copy_resource: AtomicUsize::new(0),
    flush: AtomicUsize::new(0),
    draw: AtomicUsize::new(0),
    draw_indexed: AtomicUsize::new(0),
    last_map_type: AtomicU32::new(0),
    last_subresource: AtomicU32::new(0),
};

pub fn reset_calls() {
    CALLS.map.store(0, Ordering::SeqCst);
    CALLS.unmap.store(0, Ordering::SeqCst);
    CALLS.copy_region.store(0, Ordering::SeqCst);
    CALLS.copy_resource.store(0, Ordering::SeqCst);
    CALLS.flush.store(0, Ordering::SeqCst);
    CALLS.draw.store(0, Ordering::SeqCst);
    CALLS.draw_indexed.store(0, Ordering::SeqCst);
}

/// Point the process-wide config at a temp directory before any singleton
/// initializes. The directory is leaked so the paths stay valid for the
/// whole test binary.
pub fn setup() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let dir = tempfile::tempdir().unwrap();
        let cfg = vtprobe::config::ProbeConfig {
            stats_path: dir.path().join("stats.log"),
            trace_path: dir.path().join("trace.log"),
            ..Default::default()
        };
        std::mem::forget(dir);
        vtprobe::set_config(cfg);
    });
}

// --- synthetic resources ---------------------------------------------------

/// First word is the dispatch-table pointer, exactly like the real objects;
/// the rest is backing state the synthetic originals read through the
/// object pointer.
#[repr(C)]
pub struct SyntheticResource {
    table: *mut RawSlot,
    dimension: u32,
    desc: Texture2dDescRaw,
    data: *mut u8,
}

unsafe extern "system" fn resource_get_type(resource: RawObject, out: *mut u32) {
    unsafe { *out = (*(resource as *const SyntheticResource)).dimension };
}

unsafe extern "system" fn texture2d_get_desc(resource: RawObject, out: *mut Texture2dDescRaw) {
    unsafe { *out = (*(resource as *const SyntheticResource)).desc };
}

fn resource_table() -> *mut RawSlot {
    static TABLE: OnceLock<usize> = OnceLock::new();
    *TABLE.get_or_init(|| {
        let mut slots: Vec<RawSlot> = vec![std::ptr::null(); 16];
        slots[abi::SLOT_RESOURCE_GET_TYPE] =
            resource_get_type as unsafe extern "system" fn(RawObject, *mut u32) as usize
                as RawSlot;
        slots[abi::SLOT_TEXTURE2D_GET_DESC] = texture2d_get_desc
            as unsafe extern "system" fn(RawObject, *mut Texture2dDescRaw)
            as usize as RawSlot;
        Box::leak(slots.into_boxed_slice()).as_mut_ptr() as usize
    }) as *mut RawSlot
}

/// Leak a synthetic resource with a filled backing buffer sized
/// `width * 4 * height` (tight pitch, 4 bytes per pixel).
pub fn leak_resource(desc: Texture2dDescRaw, dimension: u32) -> RawObject {
    let len = desc.width as usize * 4 * desc.height as usize;
    let mut backing: Vec<u8> = (0..len).map(|i| (i % 251) as u8 + 1).collect();
    let data = backing.as_mut_ptr();
    std::mem::forget(backing);
    let resource = Box::leak(Box::new(SyntheticResource {
        table: resource_table(),
        dimension,
        desc,
        data,
    }));
    resource as *mut SyntheticResource as RawObject
}

pub fn staging_desc(width: u32, height: u32) -> Texture2dDescRaw {
    Texture2dDescRaw {
        width,
        height,
        mip_levels: 1,
        array_size: 1,
        format: 28,
        usage: 3,
        cpu_access_flags: 0x20000,
        ..Default::default()
    }
}

pub fn dynamic_desc(width: u32, height: u32) -> Texture2dDescRaw {
    Texture2dDescRaw {
        width,
        height,
        mip_levels: 1,
        array_size: 1,
        format: 28,
        usage: 2,
        bind_flags: 0x8,
        cpu_access_flags: 0x10000,
        ..Default::default()
    }
}

// --- synthetic context -----------------------------------------------------

unsafe extern "system" fn ctx_get_type(_ctx: RawObject) -> u32 {
    abi::CONTEXT_CATEGORY_IMMEDIATE
}

unsafe extern "system" fn ctx_get_type_deferred(_ctx: RawObject) -> u32 {
    abi::CONTEXT_CATEGORY_DEFERRED
}

unsafe extern "system" fn orig_map(
    _ctx: RawObject,
    resource: RawObject,
    subresource: u32,
    map_type: u32,
    _map_flags: u32,
    mapped: *mut MappedSubresource,
) -> i32 {
    CALLS.map.fetch_add(1, Ordering::SeqCst);
    CALLS.last_map_type.store(map_type, Ordering::SeqCst);
    CALLS.last_subresource.store(subresource, Ordering::SeqCst);
    if !mapped.is_null() && !resource.is_null() {
        let res = unsafe { &*(resource as *const SyntheticResource) };
        unsafe {
            *mapped = MappedSubresource {
                data: res.data,
                row_pitch: res.desc.width * 4,
                depth_pitch: 0,
            };
        }
    }
    0
}

unsafe extern "system" fn orig_unmap(_ctx: RawObject, _resource: RawObject, _subresource: u32) {
    CALLS.unmap.fetch_add(1, Ordering::SeqCst);
}

unsafe extern "system" fn orig_copy_region(
    _ctx: RawObject,
    _dst: RawObject,
    _dst_subresource: u32,
    _dst_x: u32,
    _dst_y: u32,
    _dst_z: u32,
    _src: RawObject,
    _src_subresource: u32,
    _src_box: *const abi::CopyBox,
) {
    CALLS.copy_region.fetch_add(1, Ordering::SeqCst);
}

unsafe extern "system" fn orig_copy_resource(_ctx: RawObject, _dst: RawObject, _src: RawObject) {
    CALLS.copy_resource.fetch_add(1, Ordering::SeqCst);
}

unsafe extern "system" fn orig_flush(_ctx: RawObject) {
    CALLS.flush.fetch_add(1, Ordering::SeqCst);
}

unsafe extern "system" fn orig_draw(_ctx: RawObject, _vertex_count: u32, _start: u32) {
    CALLS.draw.fetch_add(1, Ordering::SeqCst);
}

unsafe extern "system" fn orig_draw_indexed(
    _ctx: RawObject,
    _index_count: u32,
    _start: u32,
    _base: i32,
) {
    CALLS.draw_indexed.fetch_add(1, Ordering::SeqCst);
}

/// Leak a synthetic immediate context whose table carries the recording
/// originals at the published slot indices.
pub fn leak_context() -> RawObject {
    leak_context_with_category(false)
}

/// Same, reporting the deferred category instead.
pub fn leak_deferred_context() -> RawObject {
    leak_context_with_category(true)
}

fn leak_context_with_category(deferred: bool) -> RawObject {
    let mut slots: Vec<RawSlot> = vec![std::ptr::null(); 120];
    let get_type: unsafe extern "system" fn(RawObject) -> u32 = if deferred {
        ctx_get_type_deferred
    } else {
        ctx_get_type
    };
    slots[abi::SLOT_CONTEXT_GET_TYPE] = get_type as usize as RawSlot;
    slots[abi::SLOT_MAP] = orig_map as abi::MapProc as usize as RawSlot;
    slots[abi::SLOT_UNMAP] = orig_unmap as abi::UnmapProc as usize as RawSlot;
    slots[abi::SLOT_COPY_SUBRESOURCE_REGION] =
        orig_copy_region as abi::CopySubresourceRegionProc as usize as RawSlot;
    slots[abi::SLOT_COPY_RESOURCE] =
        orig_copy_resource as abi::CopyResourceProc as usize as RawSlot;
    slots[abi::SLOT_FLUSH] = orig_flush as abi::FlushProc as usize as RawSlot;
    slots[abi::SLOT_DRAW] = orig_draw as abi::DrawProc as usize as RawSlot;
    slots[abi::SLOT_DRAW_INDEXED] = orig_draw_indexed as abi::DrawIndexedProc as usize as RawSlot;
    let table = Box::leak(slots.into_boxed_slice()).as_mut_ptr();
    let object: &'static mut *mut RawSlot = Box::leak(Box::new(table));
    object as *mut *mut RawSlot as RawObject
}

/// One hooked context per test binary.
pub fn hooked_context() -> RawObject {
    static CTX: OnceLock<usize> = OnceLock::new();
    *CTX.get_or_init(|| {
        setup();
        let ctx = leak_context();
        vtprobe::hooks::hook_context(ctx);
        ctx as usize
    }) as RawObject
}

// --- typed dispatch helpers ------------------------------------------------
//
// Drive a context exactly the way the host would: look the entry point up
// in the (patched) dispatch table and call through it.

pub unsafe fn call_map(
    ctx: RawObject,
    resource: RawObject,
    subresource: u32,
    map_type: u32,
) -> (i32, MappedSubresource) {
    let slot = unsafe { abi::read_slot(ctx, abi::SLOT_MAP) }.unwrap();
    let f: abi::MapProc = unsafe { std::mem::transmute(slot) };
    let mut mapped = MappedSubresource {
        data: std::ptr::null_mut(),
        row_pitch: 0,
        depth_pitch: 0,
    };
    let hr = unsafe { f(ctx, resource, subresource, map_type, 0, &mut mapped) };
    (hr, mapped)
}

pub unsafe fn call_unmap(ctx: RawObject, resource: RawObject, subresource: u32) {
    let slot = unsafe { abi::read_slot(ctx, abi::SLOT_UNMAP) }.unwrap();
    let f: abi::UnmapProc = unsafe { std::mem::transmute(slot) };
    unsafe { f(ctx, resource, subresource) };
}

pub unsafe fn call_copy_region(ctx: RawObject, dst: RawObject, src: RawObject) {
    let slot = unsafe { abi::read_slot(ctx, abi::SLOT_COPY_SUBRESOURCE_REGION) }.unwrap();
    let f: abi::CopySubresourceRegionProc = unsafe { std::mem::transmute(slot) };
    unsafe { f(ctx, dst, 0, 0, 0, 0, src, 0, std::ptr::null()) };
}

pub unsafe fn call_copy_resource(ctx: RawObject, dst: RawObject, src: RawObject) {
    let slot = unsafe { abi::read_slot(ctx, abi::SLOT_COPY_RESOURCE) }.unwrap();
    let f: abi::CopyResourceProc = unsafe { std::mem::transmute(slot) };
    unsafe { f(ctx, dst, src) };
}

pub unsafe fn call_flush(ctx: RawObject) {
    let slot = unsafe { abi::read_slot(ctx, abi::SLOT_FLUSH) }.unwrap();
    let f: abi::FlushProc = unsafe { std::mem::transmute(slot) };
    unsafe { f(ctx) };
}

pub unsafe fn call_draw(ctx: RawObject, vertex_count: u32, start: u32) {
    let slot = unsafe { abi::read_slot(ctx, abi::SLOT_DRAW) }.unwrap();
    let f: abi::DrawProc = unsafe { std::mem::transmute(slot) };
    unsafe { f(ctx, vertex_count, start) };
}
