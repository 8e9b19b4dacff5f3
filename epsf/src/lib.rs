//! ePSF preparation: starlet background flattening ahead of star detection,
//! and reconstruction of the detector's empirical PSF from an external
//! detection and fitting engine.
//!
//! A run takes a single-channel floating-point frame through:
//!
//! 1. [`BackgroundFlattener`] removes large-scale background with a starlet
//!    (à trous B3-spline) decomposition sized to the expected star footprint.
//! 2. The flattened frame is exchanged with a [`StarEngine`] through a
//!    scratch directory of FITS and text files.
//! 3. [`CutoutReconstructor`] crops every returned star to the canonical
//!    size; [`ModelDecimator`] block-averages the oversampled model back to
//!    detector resolution.
//! 4. [`viz`] composes the detection overlay and cutout mosaic; every output
//!    carries its own median/MAD auto-stretch.
//!
//! # Usage
//!
//! ```no_run
//! use epsf::{EpsfPipeline, ExternalEngine, PipelineConfig};
//! use epsf::io::read_image_fits;
//! use ndarray::Array2;
//!
//! let frame: Array2<f32> = read_image_fits("m31.fits")?;
//! let engine = ExternalEngine::new("python3").with_args(["epsf_engine.py"]);
//! let mut pipeline = EpsfPipeline::new(PipelineConfig::default(), engine)?;
//!
//! let outputs = pipeline.run(frame.view())?;
//! outputs.write_fits("out", "m31")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod engine;
pub mod errors;
pub mod image_proc;
pub mod io;
pub mod pipeline;
pub mod viz;

pub use config::PipelineConfig;
pub use engine::{EngineJob, EngineParams, ExternalEngine, SmoothingKernel, StarEngine};
pub use errors::{InterchangeError, PipelineError, Stage};
pub use image_proc::{
    BackgroundConfig, BackgroundFlattener, CutoutReconstructor, ModelDecimator, RobustStretch,
    Sample, StarRecord, StarletTransform,
};
pub use pipeline::{AbortFlag, EpsfPipeline, PipelineOutputs};
pub use viz::DisplayImage;
