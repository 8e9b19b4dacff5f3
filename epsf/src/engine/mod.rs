//! Star detection and ePSF fitting engine boundary.
//!
//! Detection, extraction and model fitting happen outside this crate. The
//! pipeline talks to an engine through a scratch directory: it writes the
//! flattened frame there, makes one blocking [`StarEngine::run`] call, and
//! reads the star list, per-star images and oversampled model back (see
//! [`interchange`] for the file layout).
//!
//! An engine is an ordinary value owned by the caller. Construct it once and
//! hand it to as many pipeline runs as needed.

pub mod external;
pub mod interchange;

pub use external::ExternalEngine;
pub use interchange::{EngineResponse, ScratchDir};

use crate::errors::InterchangeError;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Smoothing kernel applied by the engine between model iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SmoothingKernel {
    /// Fourth-order polynomial kernel
    Quartic,
    /// Second-order polynomial kernel
    #[default]
    Quadratic,
}

impl SmoothingKernel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SmoothingKernel::Quartic => "quartic",
            SmoothingKernel::Quadratic => "quadratic",
        }
    }
}

impl fmt::Display for SmoothingKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar parameters of one engine invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineParams {
    /// Expected stellar FWHM in pixels
    pub fwhm: f64,
    /// Detection threshold above background
    pub threshold: f64,
    /// Sources peaking above this value are rejected; `None` disables the cut
    pub peak_max: Option<f64>,
    /// Maximum number of raw detections considered
    pub brightest_limit: usize,
    /// Side of the per-star extraction window
    pub extract_size: usize,
    /// Maximum number of stars written back
    pub max_stars: usize,
    /// Model oversampling factor
    pub oversampling: usize,
    pub max_iterations: usize,
    pub smoothing_kernel: SmoothingKernel,
}

impl EngineParams {
    /// Parameters as `--name value` command-line pairs.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--fwhm".to_string(),
            self.fwhm.to_string(),
            "--threshold".to_string(),
            self.threshold.to_string(),
        ];
        if let Some(peak_max) = self.peak_max {
            args.push("--peak-max".to_string());
            args.push(peak_max.to_string());
        }
        args.extend([
            "--brightest-limit".to_string(),
            self.brightest_limit.to_string(),
            "--extract-size".to_string(),
            self.extract_size.to_string(),
            "--max-stars".to_string(),
            self.max_stars.to_string(),
            "--oversampling".to_string(),
            self.oversampling.to_string(),
            "--max-iterations".to_string(),
            self.max_iterations.to_string(),
            "--smoothing-kernel".to_string(),
            self.smoothing_kernel.to_string(),
        ]);
        args
    }
}

/// One request to an engine.
#[derive(Debug, Clone)]
pub struct EngineJob {
    /// Flattened frame to detect stars in
    pub request: PathBuf,
    /// Directory the response files must be written to
    pub output_dir: PathBuf,
    pub params: EngineParams,
}

/// A star detection and PSF fitting service.
pub trait StarEngine {
    /// Name used in log messages and errors.
    fn name(&self) -> &str;

    /// Process `job` to completion, leaving the response files in
    /// `job.output_dir`. Blocks until the engine finishes or fails.
    fn run(&mut self, job: &EngineJob) -> Result<(), InterchangeError>;
}

impl<E: StarEngine + ?Sized> StarEngine for Box<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn run(&mut self, job: &EngineJob) -> Result<(), InterchangeError> {
        (**self).run(job)
    }
}
