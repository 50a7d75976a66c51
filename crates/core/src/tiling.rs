//! Tile geometry planning: fixed-size segment grid over an arbitrary image.

/// One fixed-size crop rectangle, in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Plan the ordered segment grid for an image.
///
/// Walks one row/column past the floor division so the grid always covers
/// the full image, clamping boundary origins to `dim - tile_size`. Boundary
/// tiles therefore overlap their neighbors instead of shrinking — the model
/// always sees a full-size tile, and the compositor resolves the overlap by
/// draw order. Rectangles are emitted row-major; progress reporting, cache
/// keys, and compositing all consume this exact order.
///
/// Returns an empty plan when either dimension is smaller than `tile_size`;
/// such images take the whole-image path instead.
pub fn plan_tiles(image_width: u32, image_height: u32, tile_size: u32) -> Vec<TileRect> {
    if image_width < tile_size || image_height < tile_size {
        return Vec::new();
    }

    let h_segments = image_width / tile_size;
    let v_segments = image_height / tile_size;

    let mut rects = Vec::with_capacity(((h_segments + 1) * (v_segments + 1)) as usize);
    for vs in 0..=v_segments {
        for hs in 0..=h_segments {
            let mut x = hs * tile_size;
            let mut y = vs * tile_size;

            if x + tile_size > image_width {
                x = image_width - tile_size;
            }
            if y + tile_size > image_height {
                y = image_height - tile_size;
            }

            rects.push(TileRect {
                x,
                y,
                width: tile_size,
                height: tile_size,
            });
        }
    }
    rects
}
