//! Owned raster buffers and the crop/resize primitives the pipeline uses.

use image::{imageops, RgbImage};

use crate::error::ProcessError;
use crate::tiling::TileRect;

/// Byte layout of a decoded pixel buffer.
///
/// Decoders hand us either tightly packed RGB or little-endian BGRA; the
/// tensor encoder has to know which, since channel order is significant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Rgb8,
    Bgra8,
}

impl PixelLayout {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb8 => 3,
            Self::Bgra8 => 4,
        }
    }
}

/// Decoded pixel buffer. Immutable once produced by a pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    data: Vec<u8>,
    width: u32,
    height: u32,
    layout: PixelLayout,
}

impl RasterImage {
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        layout: PixelLayout,
    ) -> Result<Self, ProcessError> {
        let expected = width as usize * height as usize * layout.bytes_per_pixel();
        if data.len() != expected {
            return Err(ProcessError::Raster(format!(
                "buffer length mismatch: expected {expected} ({width}x{height}x{bpp}), got {got}",
                bpp = layout.bytes_per_pixel(),
                got = data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            layout,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Crop a sub-rectangle. The rect must lie fully inside the image; the
    /// tiling planner guarantees this for planned tiles.
    pub fn crop(&self, rect: &TileRect) -> Result<RasterImage, ProcessError> {
        if rect.x + rect.width > self.width || rect.y + rect.height > self.height {
            return Err(ProcessError::Raster(format!(
                "crop rect {rect:?} exceeds image bounds {}x{}",
                self.width, self.height
            )));
        }

        let bpp = self.layout.bytes_per_pixel();
        let src_stride = self.width as usize * bpp;
        let row_bytes = rect.width as usize * bpp;
        let mut out = Vec::with_capacity(rect.height as usize * row_bytes);

        for row in 0..rect.height as usize {
            let src_y = rect.y as usize + row;
            let start = src_y * src_stride + rect.x as usize * bpp;
            out.extend_from_slice(&self.data[start..start + row_bytes]);
        }

        RasterImage::new(out, rect.width, rect.height, self.layout)
    }

    /// Center-crop to the largest square that fits.
    pub fn center_square(&self) -> Result<RasterImage, ProcessError> {
        let side = self.width.min(self.height);
        let rect = TileRect {
            x: (self.width - side) / 2,
            y: (self.height - side) / 2,
            width: side,
            height: side,
        };
        self.crop(&rect)
    }

    /// Resample to the given dimensions (triangle filter).
    pub fn resized(&self, width: u32, height: u32) -> Result<RasterImage, ProcessError> {
        let rgb = self.to_rgb8()?;
        let img = RgbImage::from_raw(rgb.width, rgb.height, rgb.data)
            .ok_or_else(|| ProcessError::Raster("RGB buffer rejected by resampler".to_string()))?;
        let resized = imageops::resize(&img, width, height, imageops::FilterType::Triangle);
        RasterImage::new(resized.into_raw(), width, height, PixelLayout::Rgb8)
    }

    /// Convert to packed RGB8, dropping alpha and swapping BGRA byte order.
    pub fn to_rgb8(&self) -> Result<RasterImage, ProcessError> {
        match self.layout {
            PixelLayout::Rgb8 => Ok(self.clone()),
            PixelLayout::Bgra8 => {
                let pixels = self.width as usize * self.height as usize;
                let mut rgb = Vec::with_capacity(pixels * 3);
                for px in self.data.chunks_exact(4) {
                    rgb.push(px[2]);
                    rgb.push(px[1]);
                    rgb.push(px[0]);
                }
                RasterImage::new(rgb, self.width, self.height, PixelLayout::Rgb8)
            }
        }
    }
}
