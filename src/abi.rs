//! Foreign binary interface boundary
//!
//! Everything the probe knows about the intercepted driver objects lives
//! here: the first machine word of every object is a pointer to an array of
//! function-pointer slots, and each entry point sits at a fixed, published
//! slot index. This module owns all raw pointer arithmetic; the rest of the
//! crate operates on plain structured values returned from here.

use std::ffi::c_void;
use thiserror::Error;

/// One entry in a dispatch table.
pub type RawSlot = *const c_void;

/// An opaque object owned by the host process.
pub type RawObject = *mut c_void;

// Submission-context slot indices. These are part of the target interface's
// published binary layout and must match exactly, or the wrong method gets
// patched and host behavior is corrupted.
pub const SLOT_DRAW_INDEXED: usize = 12;
pub const SLOT_DRAW: usize = 13;
pub const SLOT_MAP: usize = 14;
pub const SLOT_UNMAP: usize = 15;
pub const SLOT_COPY_SUBRESOURCE_REGION: usize = 46;
pub const SLOT_COPY_RESOURCE: usize = 47;
pub const SLOT_FLUSH: usize = 111;
pub const SLOT_CONTEXT_GET_TYPE: usize = 112;

// Resource-object slot indices.
pub const SLOT_RESOURCE_GET_TYPE: usize = 7;
pub const SLOT_TEXTURE2D_GET_DESC: usize = 10;

/// Context category reported by the GetType slot.
pub const CONTEXT_CATEGORY_IMMEDIATE: u32 = 0;
/// Deferred submission context.
pub const CONTEXT_CATEGORY_DEFERRED: u32 = 1;

/// Resource dimension value for a 2-D texture.
pub const RESOURCE_DIMENSION_TEXTURE2D: u32 = 3;

/// CPU-access output of a memory-open call.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MappedSubresource {
    pub data: *mut u8,
    pub row_pitch: u32,
    pub depth_pitch: u32,
}

/// Source region argument of a partial copy.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CopyBox {
    pub left: u32,
    pub top: u32,
    pub front: u32,
    pub right: u32,
    pub bottom: u32,
    pub back: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleDesc {
    pub count: u32,
    pub quality: u32,
}

/// Raw 2-D texture description, laid out exactly as the driver returns it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Texture2dDescRaw {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub array_size: u32,
    pub format: u32,
    pub sample: SampleDesc,
    pub usage: u32,
    pub bind_flags: u32,
    pub cpu_access_flags: u32,
    pub misc_flags: u32,
}

// Entry-point signatures. Replacements must reproduce these exactly,
// including the calling convention.
pub type MapProc = unsafe extern "system" fn(
    RawObject,
    RawObject,
    u32,
    u32,
    u32,
    *mut MappedSubresource,
) -> i32;
pub type UnmapProc = unsafe extern "system" fn(RawObject, RawObject, u32);
pub type CopyResourceProc = unsafe extern "system" fn(RawObject, RawObject, RawObject);
pub type CopySubresourceRegionProc = unsafe extern "system" fn(
    RawObject,
    RawObject,
    u32,
    u32,
    u32,
    u32,
    RawObject,
    u32,
    *const CopyBox,
);
pub type FlushProc = unsafe extern "system" fn(RawObject);
pub type DrawProc = unsafe extern "system" fn(RawObject, u32, u32);
pub type DrawIndexedProc = unsafe extern "system" fn(RawObject, u32, u32, i32);

type ContextGetTypeProc = unsafe extern "system" fn(RawObject) -> u32;
type ResourceGetTypeProc = unsafe extern "system" fn(RawObject, *mut u32);
type Texture2dGetDescProc = unsafe extern "system" fn(RawObject, *mut Texture2dDescRaw);

/// Errors reported by the patch primitive.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PatchError {
    #[error("null object pointer")]
    NullObject,
    #[error("object exposes a null dispatch table")]
    NullTable,
    #[error("slot {slot} is already intercepted")]
    AlreadyIntercepted { slot: usize },
}

/// Read an object's dispatch table pointer (its first machine word).
///
/// # Safety
///
/// `object` must be null or point to a live object of the intercepted
/// interface family.
pub unsafe fn dispatch_table(object: RawObject) -> Result<*mut RawSlot, PatchError> {
    if object.is_null() {
        return Err(PatchError::NullObject);
    }
    let table = unsafe { *(object as *mut *mut RawSlot) };
    if table.is_null() {
        return Err(PatchError::NullTable);
    }
    Ok(table)
}

/// Read one slot of an object's dispatch table.
///
/// # Safety
///
/// `object` must point to a live object whose table has at least
/// `slot + 1` entries.
pub unsafe fn read_slot(object: RawObject, slot: usize) -> Result<RawSlot, PatchError> {
    let table = unsafe { dispatch_table(object)? };
    Ok(unsafe { *table.add(slot) })
}

/// Patch one slot: capture the current value as the original and write
/// `replacement` in its place. Returns the table pointer and the captured
/// original so the slot can later be restored.
///
/// A slot that already holds `replacement` is reported as
/// `AlreadyIntercepted` and left untouched.
///
/// # Safety
///
/// Same requirements as [`read_slot`], and the table memory must be
/// writable (true for the intercepted interface family, whose tables live
/// in writable driver heap allocations).
pub unsafe fn patch_slot(
    object: RawObject,
    slot: usize,
    replacement: RawSlot,
) -> Result<(*mut RawSlot, RawSlot), PatchError> {
    let table = unsafe { dispatch_table(object)? };
    let entry = unsafe { table.add(slot) };
    let original = unsafe { *entry };
    if original == replacement {
        return Err(PatchError::AlreadyIntercepted { slot });
    }
    unsafe { *entry = replacement };
    Ok((table, original))
}

/// Write a previously captured original back into a patched slot.
///
/// # Safety
///
/// `table` must be the pointer returned by [`patch_slot`] and the table
/// must still be live.
pub unsafe fn restore_slot(table: *mut RawSlot, slot: usize, original: RawSlot) {
    unsafe { *table.add(slot) = original };
}

/// Ask a submission context for its category (immediate or deferred).
///
/// The GetType slot is never hooked, so this always reaches the real
/// implementation.
///
/// # Safety
///
/// `ctx` must point to a live submission context.
pub unsafe fn context_category(ctx: RawObject) -> Option<u32> {
    let slot = unsafe { read_slot(ctx, SLOT_CONTEXT_GET_TYPE).ok()? };
    if slot.is_null() {
        return None;
    }
    let get_type: ContextGetTypeProc = unsafe { std::mem::transmute(slot) };
    Some(unsafe { get_type(ctx) })
}

/// Ask a resource for its dimension. Returns `None` when the resource or
/// its query slot is unavailable (ClassificationSkip).
///
/// # Safety
///
/// `resource` must be null or point to a live resource object.
pub unsafe fn resource_dimension(resource: RawObject) -> Option<u32> {
    if resource.is_null() {
        return None;
    }
    let slot = unsafe { read_slot(resource, SLOT_RESOURCE_GET_TYPE).ok()? };
    if slot.is_null() {
        return None;
    }
    let get_type: ResourceGetTypeProc = unsafe { std::mem::transmute(slot) };
    let mut dim = 0u32;
    unsafe { get_type(resource, &mut dim) };
    Some(dim)
}

/// Fetch a 2-D texture's description. Callers must have already checked the
/// resource dimension.
///
/// # Safety
///
/// `resource` must point to a live 2-D texture object.
pub unsafe fn texture2d_desc(resource: RawObject) -> Option<Texture2dDescRaw> {
    let slot = unsafe { read_slot(resource, SLOT_TEXTURE2D_GET_DESC).ok()? };
    if slot.is_null() {
        return None;
    }
    let get_desc: Texture2dGetDescProc = unsafe { std::mem::transmute(slot) };
    let mut desc = Texture2dDescRaw::default();
    unsafe { get_desc(resource, &mut desc) };
    Some(desc)
}

/// View the mapped bytes of an open region as a slice covering
/// `row_pitch * height` bytes.
///
/// # Safety
///
/// The mapping must stay valid for the returned lifetime, which in practice
/// means the slice is consumed before the matching memory-close call is
/// forwarded.
pub unsafe fn mapped_bytes<'a>(mapped: &MappedSubresource, height: u32) -> Option<&'a [u8]> {
    if mapped.data.is_null() {
        return None;
    }
    let len = mapped.row_pitch as usize * height as usize;
    Some(unsafe { std::slice::from_raw_parts(mapped.data, len) })
}
