//! Stitches cached segment results back into one output image.

use crate::cache::{CacheKey, SegmentCache};
use crate::error::ProcessError;
use crate::raster::{PixelLayout, RasterImage};
use crate::tiling::TileRect;

/// Draw every cached tile onto a fresh canvas, in the given order.
///
/// The canvas is the source size scaled by the model's factor; each tile's
/// origin is scaled the same way, while its drawn dimensions come from the
/// cached tile itself (already at the model's native output size). The
/// planner's boundary policy produces overlapping edge tiles; later tiles
/// overwrite earlier ones at the overlap, which keeps the result
/// deterministic for a fixed iteration order.
///
/// A missing key is a broken invariant (the cache was cleared mid-run) and
/// fails the whole composition.
pub fn composite(
    cache: &SegmentCache,
    source_width: u32,
    source_height: u32,
    tile_results: &[(TileRect, CacheKey)],
    scale_factor: u32,
) -> Result<RasterImage, ProcessError> {
    let canvas_w = source_width * scale_factor;
    let canvas_h = source_height * scale_factor;
    let mut canvas = vec![0u8; canvas_w as usize * canvas_h as usize * 3];

    for (index, (rect, key)) in tile_results.iter().enumerate() {
        let tile = cache.read(key)?.ok_or_else(|| ProcessError::CacheMiss {
            key: key.to_string(),
            segment: index + 1,
        })?;
        let tile = tile.to_rgb8()?;

        let dst_x = rect.x * scale_factor;
        let dst_y = rect.y * scale_factor;
        draw_tile(&mut canvas, canvas_w, canvas_h, &tile, dst_x, dst_y);
    }

    RasterImage::new(canvas, canvas_w, canvas_h, PixelLayout::Rgb8)
}

fn draw_tile(
    canvas: &mut [u8],
    canvas_w: u32,
    canvas_h: u32,
    tile: &RasterImage,
    dst_x: u32,
    dst_y: u32,
) {
    let copy_w = tile.width().min(canvas_w.saturating_sub(dst_x)) as usize;
    let copy_h = tile.height().min(canvas_h.saturating_sub(dst_y)) as usize;
    let canvas_stride = canvas_w as usize * 3;
    let tile_stride = tile.width() as usize * 3;
    let tile_data = tile.data();

    for row in 0..copy_h {
        let dst_start = (dst_y as usize + row) * canvas_stride + dst_x as usize * 3;
        let src_start = row * tile_stride;
        canvas[dst_start..dst_start + copy_w * 3]
            .copy_from_slice(&tile_data[src_start..src_start + copy_w * 3]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn solid_tile(width: u32, height: u32, rgb: [u8; 3]) -> RasterImage {
        let data: Vec<u8> = rgb
            .iter()
            .copied()
            .cycle()
            .take((width * height * 3) as usize)
            .collect();
        RasterImage::new(data, width, height, PixelLayout::Rgb8).unwrap()
    }

    fn write_tile(cache: &SegmentCache, tile: &RasterImage) -> CacheKey {
        let key = CacheKey::generate();
        cache.write(tile, &key).unwrap();
        key
    }

    #[test]
    fn later_tiles_overwrite_earlier_ones_at_overlaps() {
        let dir = tempdir().expect("tempdir");
        let cache = SegmentCache::new(dir.path()).unwrap();

        let red = write_tile(&cache, &solid_tile(2, 2, [255, 0, 0]));
        let blue = write_tile(&cache, &solid_tile(2, 2, [0, 0, 255]));
        let results = vec![
            (
                TileRect {
                    x: 0,
                    y: 0,
                    width: 2,
                    height: 2,
                },
                red,
            ),
            (
                TileRect {
                    x: 1,
                    y: 0,
                    width: 2,
                    height: 2,
                },
                blue,
            ),
        ];

        let out = composite(&cache, 3, 2, &results, 1).unwrap();
        // Pixel (0,0) kept the first tile; the overlap column (1,0) took the second.
        assert_eq!(&out.data()[..3], &[255, 0, 0]);
        assert_eq!(&out.data()[3..6], &[0, 0, 255]);
    }

    #[test]
    fn compositing_is_deterministic() {
        let dir = tempdir().expect("tempdir");
        let cache = SegmentCache::new(dir.path()).unwrap();

        let a = write_tile(&cache, &solid_tile(2, 2, [10, 20, 30]));
        let b = write_tile(&cache, &solid_tile(2, 2, [40, 50, 60]));
        let results = vec![
            (
                TileRect {
                    x: 0,
                    y: 0,
                    width: 2,
                    height: 2,
                },
                a,
            ),
            (
                TileRect {
                    x: 1,
                    y: 1,
                    width: 2,
                    height: 2,
                },
                b,
            ),
        ];

        let first = composite(&cache, 3, 3, &results, 1).unwrap();
        let second = composite(&cache, 3, 3, &results, 1).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn scale_factor_grows_the_canvas_and_tile_origins() {
        let dir = tempdir().expect("tempdir");
        let cache = SegmentCache::new(dir.path()).unwrap();

        // A x4 model turns a 2x2 source tile into an 8x8 result tile.
        let key = write_tile(&cache, &solid_tile(8, 8, [9, 9, 9]));
        let results = vec![(
            TileRect {
                x: 2,
                y: 0,
                width: 2,
                height: 2,
            },
            key,
        )];

        let out = composite(&cache, 4, 2, &results, 4).unwrap();
        assert_eq!(out.width(), 16);
        assert_eq!(out.height(), 8);
        // Origin (2,0) maps to canvas x=8.
        assert_eq!(&out.data()[8 * 3..8 * 3 + 3], &[9, 9, 9]);
        assert_eq!(&out.data()[7 * 3..8 * 3], &[0, 0, 0]);
    }

    #[test]
    fn missing_key_is_a_fatal_cache_miss() {
        let dir = tempdir().expect("tempdir");
        let cache = SegmentCache::new(dir.path()).unwrap();

        let results = vec![(
            TileRect {
                x: 0,
                y: 0,
                width: 2,
                height: 2,
            },
            CacheKey::generate(),
        )];

        let err = composite(&cache, 2, 2, &results, 1).unwrap_err();
        match err {
            ProcessError::CacheMiss { segment, .. } => assert_eq!(segment, 1),
            other => panic!("expected CacheMiss, got {other:?}"),
        }
    }
}
