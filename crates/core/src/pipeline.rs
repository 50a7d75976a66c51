//! Segment pipeline orchestration.
//!
//! [`SegmentProcessor`] is the explicit pipeline context: it owns at most
//! one loaded model at a time and the segment cache namespace that goes
//! with it. A run is strictly sequential — one tile's inference and cache
//! write complete before the next tile's crop begins — and executes on a
//! blocking worker so progress callbacks never stall the async caller.

use tokio::sync::watch;
use tracing::{debug, info};

use crate::adapter::InferenceAdapter;
use crate::cache::{CacheKey, SegmentCache};
use crate::compositor::composite;
use crate::error::ProcessError;
use crate::model::{ModelRegistry, ModelSpec};
use crate::raster::RasterImage;
use crate::tiling::{plan_tiles, TileRect};

/// Percent progress callback, invoked once per completed tile.
pub type ProgressCallback = dyn Fn(u8) + Send;

/// Ephemeral per-run state: the ordered tile results and completion count.
pub struct SegmentRun {
    pub tiles: Vec<(TileRect, CacheKey)>,
    pub completed: usize,
    pub spec: ModelSpec,
}

impl SegmentRun {
    fn new(spec: ModelSpec, capacity: usize) -> Self {
        Self {
            tiles: Vec::with_capacity(capacity),
            completed: 0,
            spec,
        }
    }
}

enum ProcessorState {
    Idle,
    Loaded {
        spec: ModelSpec,
        adapter: InferenceAdapter,
    },
}

/// Pipeline context owning the model state machine (`Idle → Loaded`) and
/// the segment cache. At most one run is in flight per processor — `process`
/// takes `&mut self`.
pub struct SegmentProcessor {
    registry: ModelRegistry,
    cache: SegmentCache,
    state: ProcessorState,
}

impl SegmentProcessor {
    pub fn new(registry: ModelRegistry, cache: SegmentCache) -> Self {
        Self {
            registry,
            cache,
            state: ProcessorState::Idle,
        }
    }

    pub fn current_model(&self) -> Option<&ModelSpec> {
        match &self.state {
            ProcessorState::Idle => None,
            ProcessorState::Loaded { spec, .. } => Some(spec),
        }
    }

    /// Drop the loaded model and invalidate its cached segments.
    pub fn unload(&mut self) -> Result<(), ProcessError> {
        self.state = ProcessorState::Idle;
        self.cache.clear_all()
    }

    /// Run one image through the named model.
    ///
    /// Images smaller than the model input take the whole-image path;
    /// everything else is tiled, inferred, cached, and composited. Any tile
    /// failure aborts the run with no partial output. Progress percentages
    /// are delivered in tile order, one per tile; cancellation (if a
    /// receiver is supplied) is honored between tiles only.
    ///
    /// Must be called from a multi-threaded tokio runtime: the tile loop
    /// runs under `block_in_place` so it never starves the async executor.
    pub async fn process(
        &mut self,
        image: &RasterImage,
        model_name: &str,
        progress_callback: Option<Box<dyn Fn(u8) + Send>>,
        cancel_rx: Option<watch::Receiver<bool>>,
    ) -> Result<RasterImage, ProcessError> {
        self.ensure_loaded(model_name)?;

        let ProcessorState::Loaded { spec, adapter } = &mut self.state else {
            return Err(ProcessError::UnsupportedModel(model_name.to_string()));
        };
        let spec = spec.clone();
        let cache = &self.cache;

        tokio::task::block_in_place(|| {
            if image.width() < spec.input_size || image.height() < spec.input_size {
                debug!(
                    width = image.width(),
                    height = image.height(),
                    input_size = spec.input_size,
                    "image smaller than model input; taking whole-image path"
                );
                return adapter
                    .infer_whole(image)
                    .map_err(|err| ProcessError::Inference {
                        segment: 1,
                        total: 1,
                        reason: err.to_string(),
                    });
            }

            run_segmented(
                image,
                &spec,
                cache,
                |tile| adapter.infer_tile(tile),
                progress_callback.as_deref(),
                cancel_rx.as_ref(),
            )
        })
    }

    /// Make the named model current. Every run starts by invalidating the
    /// previous run's segments; switching models additionally reloads the
    /// session. A load failure leaves the processor idle.
    fn ensure_loaded(&mut self, model_name: &str) -> Result<(), ProcessError> {
        self.cache.clear_all()?;

        let already_loaded = matches!(
            &self.state,
            ProcessorState::Loaded { spec, .. } if spec.name == model_name
        );
        if already_loaded {
            return Ok(());
        }

        self.state = ProcessorState::Idle;
        let spec = self
            .registry
            .get(model_name)
            .cloned()
            .ok_or_else(|| ProcessError::UnsupportedModel(model_name.to_string()))?;

        let session = self.registry.load_session(&spec)?;
        let adapter =
            InferenceAdapter::for_model(&spec, session).map_err(|err| ProcessError::ModelLoad {
                name: spec.name.clone(),
                reason: err.to_string(),
            })?;

        self.state = ProcessorState::Loaded { spec, adapter };
        Ok(())
    }
}

/// The tiled run: crop → infer → cache write → progress, per tile in plan
/// order, then composite. Generic over the tile inference so the loop's
/// sequencing, abort, progress, and cancellation behavior are testable
/// without a model.
fn run_segmented<F>(
    image: &RasterImage,
    spec: &ModelSpec,
    cache: &SegmentCache,
    mut infer: F,
    progress: Option<&ProgressCallback>,
    cancel_rx: Option<&watch::Receiver<bool>>,
) -> Result<RasterImage, ProcessError>
where
    F: FnMut(&RasterImage) -> anyhow::Result<RasterImage>,
{
    let rects = plan_tiles(image.width(), image.height(), spec.input_size);
    let total = rects.len();
    info!(segments = total, model = %spec.name, "planned segment grid");

    let mut run = SegmentRun::new(spec.clone(), total);

    for (index, rect) in rects.into_iter().enumerate() {
        if let Some(rx) = cancel_rx {
            if *rx.borrow() {
                return Err(ProcessError::Cancelled {
                    completed: run.completed,
                    total,
                });
            }
        }

        let tile = image.crop(&rect)?;
        let result = infer(&tile).map_err(|err| ProcessError::Inference {
            segment: index + 1,
            total,
            reason: err.to_string(),
        })?;

        let key = CacheKey::generate();
        cache.write(&result, &key)?;
        run.tiles.push((rect, key));
        run.completed += 1;

        // Integer division: the final tile may report less than 100 when
        // total does not divide evenly. Downstream consumers rely on the
        // exact sequence, so it is reproduced as-is.
        let percent = ((index + 1) * 100 / total) as u8;
        debug!(segment = index + 1, total, percent, "segment complete");
        if let Some(progress) = progress {
            progress(percent);
        }
    }

    composite(
        cache,
        image.width(),
        image.height(),
        &run.tiles,
        run.spec.scale_factor,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExecutionStyle;
    use crate::raster::PixelLayout;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    fn spec_with(input_size: u32, scale_factor: u32) -> ModelSpec {
        ModelSpec {
            name: "test-model".into(),
            filename: "test.onnx".into(),
            style: ExecutionStyle::DenseTensor,
            input_size,
            scale_factor,
            description: String::new(),
        }
    }

    fn gradient(width: u32, height: u32) -> RasterImage {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                data.push((x % 256) as u8);
                data.push((y % 256) as u8);
                data.push(0);
            }
        }
        RasterImage::new(data, width, height, PixelLayout::Rgb8).unwrap()
    }

    fn identity(tile: &RasterImage) -> anyhow::Result<RasterImage> {
        Ok(tile.clone())
    }

    fn collecting_progress() -> (Box<dyn Fn(u8) + Send>, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: Box<dyn Fn(u8) + Send> = Box::new(move |p| sink.lock().unwrap().push(p));
        (cb, seen)
    }

    #[test]
    fn identity_inference_reconstructs_the_image() {
        let dir = tempdir().expect("tempdir");
        let cache = SegmentCache::new(dir.path()).unwrap();
        let image = gradient(300, 300);

        let out = run_segmented(&image, &spec_with(128, 1), &cache, identity, None, None).unwrap();
        // Overlapping identity tiles overwrite with identical pixels.
        assert_eq!(out, image.to_rgb8().unwrap());
    }

    #[test]
    fn progress_is_monotone_with_exactly_one_update_per_tile() {
        let dir = tempdir().expect("tempdir");
        let cache = SegmentCache::new(dir.path()).unwrap();
        let image = gradient(300, 300);
        let (cb, seen) = collecting_progress();

        run_segmented(&image, &spec_with(128, 1), &cache, identity, Some(&*cb), None).unwrap();

        let seen = seen.lock().unwrap();
        // 300x300 at 128 plans 9 tiles.
        assert_eq!(seen.len(), 9);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(
            *seen,
            vec![11, 22, 33, 44, 55, 66, 77, 88, 100]
        );
    }

    #[test]
    fn progress_under_reports_when_total_does_not_divide_100() {
        let dir = tempdir().expect("tempdir");
        let cache = SegmentCache::new(dir.path()).unwrap();
        let image = gradient(300, 300);
        let (cb, seen) = collecting_progress();
        run_segmented(&image, &spec_with(128, 1), &cache, identity, Some(&*cb), None).unwrap();
        // 4*100/9 = 44, not 44.4 — integer division is preserved.
        assert_eq!(seen.lock().unwrap()[3], 44);
    }

    #[test]
    fn first_failure_aborts_with_no_output() {
        let dir = tempdir().expect("tempdir");
        let cache = SegmentCache::new(dir.path()).unwrap();
        let image = gradient(300, 300);
        let (cb, seen) = collecting_progress();

        let mut calls = 0;
        let err = run_segmented(
            &image,
            &spec_with(128, 1),
            &cache,
            |tile| {
                calls += 1;
                if calls == 3 {
                    anyhow::bail!("synthetic failure");
                }
                Ok(tile.clone())
            },
            Some(&*cb),
            None,
        )
        .unwrap_err();

        match err {
            ProcessError::Inference { segment, total, .. } => {
                assert_eq!(segment, 3);
                assert_eq!(total, 9);
            }
            other => panic!("expected Inference, got {other:?}"),
        }
        // Progress stopped after the two successful tiles; no retry happened.
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(calls, 3);
    }

    #[test]
    fn cancellation_is_honored_between_tiles() {
        let dir = tempdir().expect("tempdir");
        let cache = SegmentCache::new(dir.path()).unwrap();
        let image = gradient(300, 300);

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let err =
            run_segmented(&image, &spec_with(128, 1), &cache, identity, None, Some(&rx))
                .unwrap_err();
        match err {
            ProcessError::Cancelled { completed, total } => {
                assert_eq!(completed, 0);
                assert_eq!(total, 9);
            }
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }

    #[test]
    fn upscaling_run_produces_a_scaled_composite() {
        let dir = tempdir().expect("tempdir");
        let cache = SegmentCache::new(dir.path()).unwrap();
        let image = gradient(256, 256);

        // Fake x4 model: every 128px tile comes back 512px.
        let out = run_segmented(
            &image,
            &spec_with(128, 4),
            &cache,
            |tile| tile.resized(tile.width() * 4, tile.height() * 4).map_err(Into::into),
            None,
            None,
        )
        .unwrap();

        assert_eq!(out.width(), 1024);
        assert_eq!(out.height(), 1024);
    }

    #[test]
    fn cache_holds_one_entry_per_tile_during_a_run() {
        let dir = tempdir().expect("tempdir");
        let cache = SegmentCache::new(dir.path()).unwrap();
        let image = gradient(300, 300);

        run_segmented(&image, &spec_with(128, 1), &cache, identity, None, None).unwrap();

        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 9);
    }
}
