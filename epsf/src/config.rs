//! Run configuration for the ePSF pipeline.
//!
//! Parameter defaults and ranges follow the usual photutils-style
//! DAOStarFinder + EPSFBuilder workflow:
//!
//! | field              | default   | range        |
//! |--------------------|-----------|--------------|
//! | `max_stars`        | 100       | 10..=500     |
//! | `star_max_peak`    | 0.7       | 0.1..=1.0    |
//! | `star_threshold`   | 0.01      | 0.0..=1.0    |
//! | `star_fwhm`        | 3.0       | 1.0..=10.0   |
//! | `star_size`        | 45        | 5..=100      |
//! | `oversampling`     | 2         | 1..=4        |
//! | `smoothing_kernel` | quadratic |              |
//! | `max_iterations`   | 5         | 1..=10       |
//!
//! # Usage
//!
//! ```rust
//! use epsf::config::PipelineConfig;
//!
//! let config = PipelineConfig {
//!     star_size: 21,
//!     max_stars: 50,
//!     ..Default::default()
//! };
//! config.validate().unwrap();
//!
//! let params = config.engine_params();
//! assert_eq!(params.brightest_limit, 150);
//! assert_eq!(params.extract_size, 32); // round(21 * 1.5)
//! ```

use crate::engine::{EngineParams, SmoothingKernel};
use crate::errors::{PipelineError, Result, Stage};
use crate::image_proc::background::BackgroundConfig;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

pub const MAX_STARS_RANGE: RangeInclusive<usize> = 10..=500;
pub const STAR_MAX_PEAK_RANGE: RangeInclusive<f64> = 0.1..=1.0;
pub const STAR_THRESHOLD_RANGE: RangeInclusive<f64> = 0.0..=1.0;
pub const STAR_FWHM_RANGE: RangeInclusive<f64> = 1.0..=10.0;
pub const STAR_SIZE_RANGE: RangeInclusive<usize> = 5..=100;
pub const OVERSAMPLING_RANGE: RangeInclusive<usize> = 1..=4;
pub const MAX_ITERATIONS_RANGE: RangeInclusive<usize> = 1..=10;

/// The engine over-detects by this factor before isolating stars.
pub const BRIGHTEST_FACTOR: usize = 3;

/// Engine extraction windows are this much larger than the star size.
pub const EXTRACT_MARGIN: f64 = 1.5;

/// Complete parameter set of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum number of stars used to build the model
    pub max_stars: usize,
    /// Reject sources peaking above this normalized value; `None` keeps all
    pub star_max_peak: Option<f64>,
    /// Detection threshold on the flattened frame
    pub star_threshold: f64,
    /// Expected stellar FWHM in pixels
    pub star_fwhm: f64,
    /// Side of the canonical star cutout and PSF model
    pub star_size: usize,
    pub oversampling: usize,
    pub smoothing_kernel: SmoothingKernel,
    pub max_iterations: usize,
    pub background: BackgroundConfig,
    /// Engine scratch directory; a temporary one is used when unset
    pub scratch_dir: Option<PathBuf>,
    /// Leave a temporary scratch directory on disk after the run
    pub keep_scratch: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_stars: 100,
            star_max_peak: Some(0.7),
            star_threshold: 0.01,
            star_fwhm: 3.0,
            star_size: 45,
            oversampling: 2,
            smoothing_kernel: SmoothingKernel::Quadratic,
            max_iterations: 5,
            background: BackgroundConfig::default(),
            scratch_dir: None,
            keep_scratch: false,
        }
    }
}

fn check_range<V>(name: &str, value: V, range: &RangeInclusive<V>) -> Result<()>
where
    V: PartialOrd + Display,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(PipelineError::invalid(
            Stage::Validation,
            format!(
                "{name} = {value} is outside {}..={}",
                range.start(),
                range.end()
            ),
        ))
    }
}

impl PipelineConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::invalid(
                Stage::Validation,
                format!("cannot read config {}: {e}", path.display()),
            )
        })?;
        serde_json::from_str(&text).map_err(|e| {
            PipelineError::invalid(
                Stage::Validation,
                format!("cannot parse config {}: {e}", path.display()),
            )
        })
    }

    /// Reject out-of-range parameters.
    pub fn validate(&self) -> Result<()> {
        check_range("max_stars", self.max_stars, &MAX_STARS_RANGE)?;
        if let Some(peak) = self.star_max_peak {
            check_range("star_max_peak", peak, &STAR_MAX_PEAK_RANGE)?;
        }
        check_range("star_threshold", self.star_threshold, &STAR_THRESHOLD_RANGE)?;
        check_range("star_fwhm", self.star_fwhm, &STAR_FWHM_RANGE)?;
        check_range("star_size", self.star_size, &STAR_SIZE_RANGE)?;
        check_range("oversampling", self.oversampling, &OVERSAMPLING_RANGE)?;
        check_range("max_iterations", self.max_iterations, &MAX_ITERATIONS_RANGE)?;
        self.background.validate()
    }

    /// Cap on raw detections handed to star isolation.
    pub fn brightest_limit(&self) -> usize {
        BRIGHTEST_FACTOR * self.max_stars
    }

    /// Side of the engine's per-star extraction window.
    pub fn extract_size(&self) -> usize {
        (self.star_size as f64 * EXTRACT_MARGIN).round() as usize
    }

    pub fn engine_params(&self) -> EngineParams {
        EngineParams {
            fwhm: self.star_fwhm,
            threshold: self.star_threshold,
            peak_max: self.star_max_peak,
            brightest_limit: self.brightest_limit(),
            extract_size: self.extract_size(),
            max_stars: self.max_stars,
            oversampling: self.oversampling,
            max_iterations: self.max_iterations,
            smoothing_kernel: self.smoothing_kernel,
        }
    }
}
