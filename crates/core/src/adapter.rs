//! Per-tile inference adapters over a loaded `ort::Session`.
//!
//! Two invocation styles share one contract (raster tile in, raster tile
//! out). Dense-tensor models need manual pixel↔tensor work: channels are
//! encoded **blue, green, red** and normalized to `[0,1]` — the order the
//! underlying models were exported with, so it must be preserved. The
//! vision-pipeline style submits the tile as a u8 image tensor and gets an
//! image tensor back, with no manual normalization.

use anyhow::{bail, Context, Result};
use ndarray::Array4;
use ort::{session::Session, value::Tensor};
use tracing::warn;

use crate::model::{ExecutionStyle, ModelSpec};
use crate::raster::{PixelLayout, RasterImage};

pub enum InferenceAdapter {
    DenseTensor {
        session: Session,
        input_size: u32,
        scale_factor: u32,
        input_name: String,
        output_name: String,
    },
    VisionPipeline {
        session: Session,
        input_size: u32,
        input_name: String,
        output_name: String,
    },
}

impl InferenceAdapter {
    /// Wrap a loaded session in the invocation style the model requires.
    pub fn for_model(spec: &ModelSpec, session: Session) -> Result<Self> {
        let input_name = session
            .inputs()
            .first()
            .context("model has no inputs")?
            .name()
            .to_string();
        let output_name = session
            .outputs()
            .first()
            .context("model has no outputs")?
            .name()
            .to_string();

        Ok(match spec.style {
            ExecutionStyle::DenseTensor => Self::DenseTensor {
                session,
                input_size: spec.input_size,
                scale_factor: spec.scale_factor,
                input_name,
                output_name,
            },
            ExecutionStyle::VisionPipeline => Self::VisionPipeline {
                session,
                input_size: spec.input_size,
                input_name,
                output_name,
            },
        })
    }

    pub fn input_size(&self) -> u32 {
        match self {
            Self::DenseTensor { input_size, .. } | Self::VisionPipeline { input_size, .. } => {
                *input_size
            }
        }
    }

    /// Run one full-size tile through the model.
    pub fn infer_tile(&mut self, tile: &RasterImage) -> Result<RasterImage> {
        match self {
            Self::DenseTensor {
                session,
                input_size,
                scale_factor,
                input_name,
                output_name,
            } => {
                if tile.width() != *input_size || tile.height() != *input_size {
                    bail!(
                        "dense-tensor tile must be {size}x{size}, got {}x{}",
                        tile.width(),
                        tile.height(),
                        size = *input_size
                    );
                }
                let out_side = *input_size * *scale_factor;
                let tensor = encode_bgr_tensor(tile)?;
                let output = run_dense(session, &tensor, input_name, output_name)?;
                decode_bgr_tensor(&output, out_side)
            }
            Self::VisionPipeline {
                session,
                input_name,
                output_name,
                ..
            } => run_vision(session, tile, input_name, output_name),
        }
    }

    /// Non-tiled whole-image path, for images smaller than the model input.
    ///
    /// Dense-tensor models only accept their fixed square resolution, so the
    /// image is center-cropped to a square and resampled up to it first. The
    /// vision pipeline takes the image as-is.
    pub fn infer_whole(&mut self, image: &RasterImage) -> Result<RasterImage> {
        match self {
            Self::DenseTensor { input_size, .. } => {
                let side = *input_size;
                let squared = image.center_square()?.resized(side, side)?;
                self.infer_tile(&squared)
            }
            Self::VisionPipeline {
                session,
                input_name,
                output_name,
                ..
            } => run_vision(session, image, input_name, output_name),
        }
    }
}

fn run_dense(
    session: &mut Session,
    input: &Array4<f32>,
    input_name: &str,
    output_name: &str,
) -> Result<Vec<f32>> {
    let input_tensor = Tensor::from_array(input.clone())?;
    let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
    let output_view = outputs[output_name].try_extract_array::<f32>()?;

    let owned_contig;
    let slice = if let Some(s) = output_view.as_slice() {
        s
    } else {
        owned_contig = output_view.as_standard_layout().into_owned();
        owned_contig.as_slice().context("non-contiguous output")?
    };
    Ok(slice.to_vec())
}

fn run_vision(
    session: &mut Session,
    image: &RasterImage,
    input_name: &str,
    output_name: &str,
) -> Result<RasterImage> {
    let input_tensor = Tensor::from_array(encode_image_tensor(image)?)?;
    let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
    let output_view = outputs[output_name].try_extract_array::<u8>()?;

    let shape = output_view.shape().to_vec();
    if shape.len() != 4 || shape[0] != 1 || shape[3] != 3 {
        bail!("unexpected vision output shape {shape:?} (expected [1, H, W, 3])");
    }
    let (out_h, out_w) = (shape[1] as u32, shape[2] as u32);

    let owned_contig;
    let slice = if let Some(s) = output_view.as_slice() {
        s
    } else {
        owned_contig = output_view.as_standard_layout().into_owned();
        owned_contig.as_slice().context("non-contiguous output")?
    };

    RasterImage::new(slice.to_vec(), out_w, out_h, PixelLayout::Rgb8).map_err(Into::into)
}

/// Interleaved RGB → `[1,3,S,S]` f32, channel order B,G,R, values in `[0,1]`.
fn encode_bgr_tensor(tile: &RasterImage) -> Result<Array4<f32>> {
    let rgb = tile.to_rgb8()?;
    let h = rgb.height() as usize;
    let w = rgb.width() as usize;
    let hw = h * w;
    let data = rgb.data();

    let mut nchw = Array4::<f32>::zeros((1, 3, h, w));
    let slice = nchw.as_slice_mut().context("NCHW buffer not contiguous")?;

    for i in 0..hw {
        let src = i * 3;
        slice[i] = data[src + 2] as f32 / 255.0; // B plane
        slice[hw + i] = data[src + 1] as f32 / 255.0; // G plane
        slice[2 * hw + i] = data[src] as f32 / 255.0; // R plane
    }
    Ok(nchw)
}

/// Interleaved RGB → `[1,H,W,3]` u8 image tensor (vision pipeline input).
fn encode_image_tensor(image: &RasterImage) -> Result<Array4<u8>> {
    let rgb = image.to_rgb8()?;
    let h = rgb.height() as usize;
    let w = rgb.width() as usize;
    let arr = Array4::from_shape_vec((1, h, w, 3), rgb.into_data())
        .context("image buffer does not match its dimensions")?;
    Ok(arr)
}

/// Decode a B,G,R-ordered `[0,1]` channel buffer back into an RGB tile.
///
/// NaN channel values are substituted with the nearest following non-NaN
/// value in the flattened buffer; a fully-NaN tail decodes to zero. The
/// models occasionally emit NaN pixels and a run must never abort on them.
fn decode_bgr_tensor(channels: &[f32], side: u32) -> Result<RasterImage> {
    let s = side as usize;
    let hw = s * s;
    let capacity = hw * 3;
    if channels.len() != capacity {
        bail!(
            "dense output length mismatch: expected {capacity} (3x{s}x{s}), got {}",
            channels.len()
        );
    }

    let mut rgb = vec![0u8; capacity];
    for i in 0..hw {
        let mut b = channels[i];
        if b.is_nan() {
            b = find_near_non_nan(channels, i);
        }
        let mut g = channels[hw + i];
        if g.is_nan() {
            g = find_near_non_nan(channels, hw + i);
        }
        let mut r = channels[2 * hw + i];
        if r.is_nan() {
            r = find_near_non_nan(channels, 2 * hw + i);
        }

        rgb[i * 3] = (r * 255.0).clamp(0.0, 255.0) as u8;
        rgb[i * 3 + 1] = (g * 255.0).clamp(0.0, 255.0) as u8;
        rgb[i * 3 + 2] = (b * 255.0).clamp(0.0, 255.0) as u8;
    }

    RasterImage::new(rgb, side, side, PixelLayout::Rgb8).map_err(Into::into)
}

/// Scan forward from `index` for the nearest non-NaN value.
fn find_near_non_nan(channels: &[f32], index: usize) -> f32 {
    let mut idx = index;
    let mut value = channels[idx];
    while value.is_nan() && idx < channels.len() - 1 {
        idx += 1;
        value = channels[idx];
    }
    if value.is_nan() {
        warn!("all channel values from index {index} are NaN; substituting zero");
        return 0.0;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile_with_one_pixel(r: u8, g: u8, b: u8) -> RasterImage {
        RasterImage::new(vec![r, g, b], 1, 1, PixelLayout::Rgb8).unwrap()
    }

    #[test]
    fn encode_orders_channels_blue_green_red() {
        let tile = tile_with_one_pixel(255, 128, 0);
        let tensor = encode_bgr_tensor(&tile).unwrap();
        let flat = tensor.as_slice().unwrap();
        assert_eq!(flat.len(), 3);
        assert!((flat[0] - 0.0).abs() < 1e-6); // blue first
        assert!((flat[1] - 128.0 / 255.0).abs() < 1e-6);
        assert!((flat[2] - 1.0).abs() < 1e-6); // red last
    }

    #[test]
    fn encode_accepts_bgra_sources() {
        let bgra = RasterImage::new(vec![0, 128, 255, 255], 1, 1, PixelLayout::Bgra8).unwrap();
        let tensor = encode_bgr_tensor(&bgra).unwrap();
        let flat = tensor.as_slice().unwrap();
        assert!((flat[0] - 0.0).abs() < 1e-6);
        assert!((flat[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn decode_round_trips_encode() {
        let side = 4u32;
        let mut data = Vec::new();
        for i in 0..(side * side) {
            data.push((i * 16) as u8);
            data.push((i * 8) as u8);
            data.push((i * 4) as u8);
        }
        let tile = RasterImage::new(data, side, side, PixelLayout::Rgb8).unwrap();
        let tensor = encode_bgr_tensor(&tile).unwrap();
        let decoded = decode_bgr_tensor(tensor.as_slice().unwrap(), side).unwrap();
        assert_eq!(decoded, tile);
    }

    #[test]
    fn decode_substitutes_nearest_following_non_nan() {
        // 1x1: channels are [b, g, r]. Green is NaN; the next valid value in
        // scan order is the red channel's 1.0.
        let channels = vec![0.0, f32::NAN, 1.0];
        let decoded = decode_bgr_tensor(&channels, 1).unwrap();
        assert_eq!(decoded.data(), &[255, 255, 0]); // r=1.0, g←1.0, b=0.0
    }

    #[test]
    fn decode_of_fully_nan_tail_substitutes_zero() {
        let channels = vec![0.5, f32::NAN, f32::NAN];
        let decoded = decode_bgr_tensor(&channels, 1).unwrap();
        assert_eq!(decoded.data(), &[0, 0, 127]);
    }

    #[test]
    fn decode_clamps_out_of_range_values() {
        let channels = vec![-0.5, 2.0, 1.5];
        let decoded = decode_bgr_tensor(&channels, 1).unwrap();
        assert_eq!(decoded.data(), &[255, 255, 0]);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert!(decode_bgr_tensor(&[0.0; 10], 2).is_err());
    }

    #[test]
    fn image_tensor_is_nhwc() {
        let img = RasterImage::new(vec![1, 2, 3, 4, 5, 6], 2, 1, PixelLayout::Rgb8).unwrap();
        let tensor = encode_image_tensor(&img).unwrap();
        assert_eq!(tensor.shape(), &[1, 1, 2, 3]);
        assert_eq!(tensor[[0, 0, 1, 0]], 4);
    }

    #[test]
    fn find_near_non_nan_skips_a_nan_run() {
        let buf = vec![f32::NAN, f32::NAN, f32::NAN, 0.25, 0.75];
        assert_eq!(find_near_non_nan(&buf, 0), 0.25);
        assert_eq!(find_near_non_nan(&buf, 4), 0.75);
    }
}
