//! Content fingerprints for mapped memory regions
//!
//! A fingerprint correlates a CPU write to a resource with a later CPU read
//! of the same memory without storing or comparing full buffers. It is a
//! diagnostic aid, not a security boundary: FNV-1a over the logical bytes is
//! deterministic, order-dependent, and changes with overwhelming probability
//! after any single-byte edit.
//!
//! Rows are hashed individually: the row pitch handed back by the driver may
//! exceed the logical row width, and the padding bytes between rows are
//! uninitialized, so only the first `width * bytes_per_pixel` bytes of each
//! row contribute.

use fnv::FnvHasher;
use std::hash::Hasher;

/// Bytes per pixel for the texel formats the probe encounters.
///
/// Coarse by design: formats are grouped by their published bit width, and
/// anything unrecognized falls back to 32-bit, which is what every resource
/// observed in practice uses.
pub fn bytes_per_pixel(format: u32) -> usize {
    match format {
        1..=4 => 16,   // 128-bit RGBA
        5..=8 => 12,   // 96-bit RGB
        9..=22 => 8,   // 64-bit formats
        23..=47 => 4,  // 32-bit formats
        48..=59 => 2,  // 16-bit formats
        60..=65 => 1,  // 8-bit formats
        87..=93 => 4,  // 32-bit BGRA variants
        _ => 4,
    }
}

/// Hash the logical content of a row-pitched buffer.
///
/// `data` must cover `row_pitch * height` bytes; rows shorter than the
/// logical width (a truncated mapping) simply stop contributing, since a
/// partial fingerprint is still better than none for correlation.
pub fn fingerprint_rows(
    data: &[u8],
    row_pitch: usize,
    width: usize,
    height: usize,
    bpp: usize,
) -> u64 {
    let logical = width * bpp;
    let mut hasher = FnvHasher::default();
    for row in 0..height {
        let start = row * row_pitch;
        let end = start + logical;
        let Some(bytes) = data.get(start..end.min(data.len())) else {
            break;
        };
        hasher.write(bytes);
    }
    hasher.finish()
}
