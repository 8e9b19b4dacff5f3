//! End-to-end ePSF preparation run.
//!
//! ```text
//! source ─► BackgroundFlattener ─► tmp.fits ─► StarEngine ─► stars.txt, star<N>.fits, epsf.fits
//!                                                               │
//!        ┌──────────────────────────────────────────────────────┘
//!        ▼
//!  CutoutReconstructor ─► mosaic        ModelDecimator ─► ePSF
//!        source + centers ─► detection overlay
//! ```
//!
//! A run either produces all three outputs or none. Any error, including a
//! cooperative abort, drops every intermediate buffer and the temporary
//! scratch directory.

use crate::config::PipelineConfig;
use crate::engine::interchange::ScratchDir;
use crate::engine::{EngineJob, StarEngine};
use crate::errors::{InterchangeError, PipelineError, Result, Stage};
use crate::image_proc::background::BackgroundFlattener;
use crate::image_proc::cutout::{CutoutReconstructor, StarRecord};
use crate::image_proc::decimate::ModelDecimator;
use crate::image_proc::image::{ensure_non_empty, Sample};
use crate::io::fits::write_image_fits;
use crate::viz::{compose_mosaic, detection_overlay, DisplayImage};
use log::{info, warn};
use ndarray::ArrayView2;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation shared between a run and its controller.
///
/// Checked only at stage boundaries: before background flattening, before
/// the engine call, before reconstruction, before the detection overlay and
/// before the mosaic.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// `Err(Aborted(stage))` if an abort was requested.
    pub fn check(&self, stage: Stage) -> Result<()> {
        if self.is_aborted() {
            info!("Abort requested, stopping before {stage}");
            return Err(PipelineError::Aborted(stage));
        }
        Ok(())
    }
}

/// Suffixes appended to the output stem, one per output image.
pub const DETECTION_SUFFIX: &str = "_star_detection";
pub const MOSAIC_SUFFIX: &str = "_extracted_stars";
pub const MODEL_SUFFIX: &str = "_ePSF";

/// Products of a successful run.
#[derive(Debug, Clone)]
pub struct PipelineOutputs<T: Sample> {
    /// Accepted stars in engine order, with their canonical cutouts
    pub stars: Vec<StarRecord<T>>,
    /// Source frame with a hollow square around each star
    pub detection: DisplayImage<T>,
    /// Canonical cutouts tiled row-major
    pub mosaic: DisplayImage<T>,
    /// `star_size x star_size` model normalized to `[0, 1]`
    pub model: DisplayImage<T>,
    /// Scratch directory left on disk, if requested
    pub kept_scratch: Option<PathBuf>,
}

impl<T: Sample> PipelineOutputs<T> {
    fn named(&self) -> [(&'static str, &DisplayImage<T>); 3] {
        [
            (DETECTION_SUFFIX, &self.detection),
            (MOSAIC_SUFFIX, &self.mosaic),
            (MODEL_SUFFIX, &self.model),
        ]
    }

    /// Write the three outputs as `<stem><suffix>.fits` into `dir`.
    pub fn write_fits<P: AsRef<Path>>(&self, dir: P, stem: &str) -> Result<Vec<PathBuf>> {
        let dir = create_output_dir(dir.as_ref())?;
        self.named()
            .into_iter()
            .map(|(suffix, output)| {
                let path = dir.join(format!("{stem}{suffix}.fits"));
                let extname = suffix.trim_start_matches('_').to_uppercase();
                write_image_fits(&path, output.image.view(), &extname)
                    .map_err(|e| PipelineError::interchange(Stage::Output, e))?;
                info!("Wrote {}", path.display());
                Ok(path)
            })
            .collect()
    }

    /// Write auto-stretched 8-bit PNG previews as `<stem><suffix>.png`.
    pub fn write_previews<P: AsRef<Path>>(&self, dir: P, stem: &str) -> Result<Vec<PathBuf>> {
        let dir = create_output_dir(dir.as_ref())?;
        self.named()
            .into_iter()
            .map(|(suffix, output)| {
                let path = dir.join(format!("{stem}{suffix}.png"));
                output.preview().save(&path).map_err(|source| {
                    PipelineError::interchange(
                        Stage::Output,
                        InterchangeError::Encode {
                            path: path.clone(),
                            source,
                        },
                    )
                })?;
                info!("Wrote preview {}", path.display());
                Ok(path)
            })
            .collect()
    }
}

fn create_output_dir(dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).map_err(|source| {
        PipelineError::interchange(
            Stage::Output,
            InterchangeError::Io {
                path: dir.to_path_buf(),
                source,
            },
        )
    })?;
    Ok(dir.to_path_buf())
}

/// Pipeline at sample precision `T` driving engine `E`.
///
/// The engine is owned for the pipeline's lifetime and reused by every
/// call to [`run`](Self::run).
pub struct EpsfPipeline<T: Sample, E: StarEngine> {
    config: PipelineConfig,
    engine: E,
    abort: AbortFlag,
    flattener: BackgroundFlattener,
    reconstructor: CutoutReconstructor,
    decimator: ModelDecimator,
    _precision: PhantomData<T>,
}

impl<T: Sample, E: StarEngine> EpsfPipeline<T, E> {
    /// Validate `config` and build every stage.
    pub fn new(config: PipelineConfig, engine: E) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            flattener: BackgroundFlattener::with_config(config.star_size, config.background)?,
            reconstructor: CutoutReconstructor::new(config.star_size)?,
            decimator: ModelDecimator::new(config.star_size, config.oversampling)?,
            config,
            engine,
            abort: AbortFlag::new(),
            _precision: PhantomData,
        })
    }

    /// Share an existing abort flag.
    pub fn with_abort_flag(mut self, abort: AbortFlag) -> Self {
        self.abort = abort;
        self
    }

    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn into_engine(self) -> E {
        self.engine
    }

    fn open_scratch(&self) -> Result<ScratchDir> {
        let scratch = match &self.config.scratch_dir {
            Some(dir) => ScratchDir::at(dir),
            None => ScratchDir::temporary(),
        }
        .map_err(|e| PipelineError::interchange(Stage::EngineRequest, e))?;
        scratch
            .clear_response()
            .map_err(|e| PipelineError::interchange(Stage::EngineRequest, e))?;
        Ok(scratch)
    }

    /// Run every stage on `source`.
    pub fn run(&mut self, source: ArrayView2<T>) -> Result<PipelineOutputs<T>> {
        ensure_non_empty(source, Stage::Validation)?;
        let star_size = self.config.star_size;
        let (height, width) = source.dim();
        info!(
            "ePSF run on {width}x{height} frame at {}-bit precision, star size {star_size}",
            T::BITS
        );

        self.abort.check(Stage::BackgroundFlattening)?;
        let flattened = self.flattener.flatten(source)?;

        self.abort.check(Stage::Engine)?;
        let scratch = self.open_scratch()?;
        let request = scratch
            .write_request(flattened.view())
            .map_err(|e| PipelineError::interchange(Stage::EngineRequest, e))?;
        drop(flattened);

        let job = EngineJob {
            request,
            output_dir: scratch.path().to_path_buf(),
            params: self.config.engine_params(),
        };
        self.engine
            .run(&job)
            .map_err(|e| PipelineError::interchange(Stage::Engine, e))?;

        let response = scratch
            .read_response::<T>(star_size, source.dim())
            .map_err(|e| PipelineError::interchange(Stage::EngineResponse, e))?;
        if response.stars.len() > self.config.max_stars {
            warn!(
                "Engine {} returned {} stars, more than max_stars = {}",
                self.engine.name(),
                response.stars.len(),
                self.config.max_stars
            );
        }

        self.abort.check(Stage::CutoutReconstruction)?;
        let cutouts = self.reconstructor.reconstruct(&response.stars)?;
        let model = self.decimator.decimate(response.model.view())?;

        self.abort.check(Stage::DetectionOverlay)?;
        let detection = detection_overlay(source, &response.stars, star_size)?;

        self.abort.check(Stage::Mosaic)?;
        let mosaic = compose_mosaic(&cutouts, star_size)?;

        let stars = response
            .stars
            .into_iter()
            .zip(cutouts)
            .map(|(record, image)| StarRecord { image, ..record })
            .collect::<Vec<_>>();

        let outputs = PipelineOutputs {
            detection: DisplayImage::new(detection)?,
            mosaic: DisplayImage::new(mosaic)?,
            model: DisplayImage::new(model)?,
            stars,
            kept_scratch: None,
        };

        let kept_scratch = if self.config.keep_scratch || !scratch.is_temporary() {
            let path = scratch.keep();
            info!("Engine scratch files kept in {}", path.display());
            Some(path)
        } else {
            None
        };

        info!(
            "ePSF run complete: {} stars, {}x{} model",
            outputs.stars.len(),
            star_size,
            star_size
        );
        Ok(PipelineOutputs {
            kept_scratch,
            ..outputs
        })
    }
}
