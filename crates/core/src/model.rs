//! Model catalog and ONNX session loading.

use std::path::{Path, PathBuf};

use ort::session::{builder::GraphOptimizationLevel, Session};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ProcessError;

/// How a model is invoked per tile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExecutionStyle {
    /// Manual pixel↔tensor encode/decode around a raw session run.
    DenseTensor,
    /// Image-typed tensor in, image-typed tensor out; no manual tensor math.
    VisionPipeline,
}

/// One restorable model variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub filename: String,
    pub style: ExecutionStyle,
    /// Fixed square input resolution the model accepts.
    pub input_size: u32,
    /// Output/input resolution multiplier: 1 for restoration, 4 for super-resolution.
    pub scale_factor: u32,
    pub description: String,
}

fn builtin_catalog() -> Vec<ModelSpec> {
    vec![
        ModelSpec {
            name: "uformer-motion".into(),
            filename: "uformer_motion_256.onnx".into(),
            style: ExecutionStyle::DenseTensor,
            input_size: 256,
            scale_factor: 1,
            description: "Uformer motion-deblur model, 256 px tiles".into(),
        },
        ModelSpec {
            name: "restormer-defocus".into(),
            filename: "restormer_defocus_128.onnx".into(),
            style: ExecutionStyle::DenseTensor,
            input_size: 128,
            scale_factor: 1,
            description: "Restormer defocus-restoration model, 128 px tiles".into(),
        },
        ModelSpec {
            name: "realesrgan-x4".into(),
            filename: "realesrgan_512.onnx".into(),
            style: ExecutionStyle::VisionPipeline,
            input_size: 512,
            scale_factor: 4,
            description: "Real-ESRGAN x4 super-resolution model, 512 px tiles".into(),
        },
    ]
}

/// Catalog of known models plus the directory their ONNX files live in.
pub struct ModelRegistry {
    models_dir: PathBuf,
    entries: Vec<ModelSpec>,
}

impl ModelRegistry {
    pub fn with_builtin_models(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: builtin_catalog(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn list(&self) -> &[ModelSpec] {
        &self.entries
    }

    pub fn model_path(&self, spec: &ModelSpec) -> PathBuf {
        self.models_dir.join(&spec.filename)
    }

    /// Build an `ort::Session` for the given model. CPU execution; load
    /// failure is terminal for the run that requested it.
    pub fn load_session(&self, spec: &ModelSpec) -> Result<Session, ProcessError> {
        let path = self.model_path(spec);
        debug!(model = %spec.name, path = %path.display(), "loading ONNX model");

        let session = build_session(&path).map_err(|err| ProcessError::ModelLoad {
            name: spec.name.clone(),
            reason: err.to_string(),
        })?;

        info!(model = %spec.name, input_size = spec.input_size, scale = spec.scale_factor, "model loaded and ready");
        Ok(session)
    }
}

fn build_session(model_path: &Path) -> anyhow::Result<Session> {
    use anyhow::Context;

    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .commit_from_file(model_path)
        .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?;
    Ok(session)
}
