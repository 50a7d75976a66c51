use thiserror::Error;

/// Failures a pipeline run can surface to its caller.
///
/// A run delivers at most one of these; there is no partial output and no
/// automatic retry. `CacheMiss` indicates a broken internal invariant (a key
/// the pipeline produced is gone before compositing) and is always fatal.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The ONNX model file could not be loaded into a session.
    #[error("failed to load model '{name}': {reason}")]
    ModelLoad { name: String, reason: String },

    /// The requested model name is not in the registry.
    #[error("unsupported model: '{0}'")]
    UnsupportedModel(String),

    /// Inference failed on one tile; the whole run is aborted.
    #[error("inference failed on segment {segment} of {total}: {reason}")]
    Inference {
        segment: usize,
        total: usize,
        reason: String,
    },

    /// The compositor could not find a cached tile it was promised.
    #[error("segment cache miss for key '{key}' (segment {segment}): cache was invalidated mid-run")]
    CacheMiss { key: String, segment: usize },

    /// The run was cancelled between tiles.
    #[error("run cancelled after {completed} of {total} segments")]
    Cancelled { completed: usize, total: usize },

    /// A raster buffer did not match its declared geometry.
    #[error("raster error: {0}")]
    Raster(String),

    /// Writing or reading a cached segment failed at the storage layer.
    #[error("segment cache I/O error: {0}")]
    CacheIo(#[from] std::io::Error),
}
