use std::path::Path;

use image::{ImageBuffer, Luma};

/// Write a horizontal-gradient PNG fixture; distinct enough that dHash
/// produces a stable non-trivial hash.
pub fn write_gradient_png(path: &Path, width: u32, height: u32) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let img = ImageBuffer::from_fn(width, height, |x, _| {
        Luma([(255u32.saturating_sub(x * 255 / width.max(1))) as u8])
    });
    img.save(path).unwrap();
}

/// Write a solid-gray PNG fixture.
#[allow(dead_code)]
pub fn write_solid_png(path: &Path, width: u32, height: u32, value: u8) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let img = ImageBuffer::from_pixel(width, height, Luma([value]));
    img.save(path).unwrap();
}
