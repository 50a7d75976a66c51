//! Core crate for restora: tiled neural photo restoration and upscaling.

pub mod adapter;
pub mod cache;
pub mod compositor;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod raster;
pub mod tiling;
