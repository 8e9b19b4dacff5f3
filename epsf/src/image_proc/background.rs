//! Large-scale background removal ahead of star detection.
//!
//! The source frame is decomposed with the starlet transform, the residual
//! smooth layer is dropped, and the remaining detail layers are summed back.
//! The detail layers telescope to `source - c_n`, so only the residual is
//! computed.
//! The number of layers grows with the expected star footprint so that
//! stellar profiles stay entirely inside the retained detail scales:
//!
//! ```text
//! num_layers = floor(log2(star_size) + layer_offset)      (layer_offset = 2.5)
//! ```
//!
//! The result is truncated to `[truncate_low, truncate_high]` and min/max
//! normalized to `[0, 1]`.

use crate::errors::{PipelineError, Result, Stage};
use crate::image_proc::image::{ensure_non_empty, normalize_min_max, truncate, Sample};
use crate::image_proc::wavelet::StarletTransform;
use log::{debug, info};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// Empirical tuning constants of the background flattener.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Added to `log2(star_size)` before flooring to get the layer count
    pub layer_offset: f64,
    /// Lower truncation bound, slightly negative to keep the noise floor
    pub truncate_low: f64,
    /// Upper truncation bound
    pub truncate_high: f64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            layer_offset: 2.5,
            truncate_low: -0.001,
            truncate_high: 1.0,
        }
    }
}

impl BackgroundConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.layer_offset.is_finite() {
            return Err(PipelineError::invalid(
                Stage::Validation,
                format!("layer_offset must be finite, got {}", self.layer_offset),
            ));
        }
        if self.truncate_low.is_nan()
            || self.truncate_high.is_nan()
            || self.truncate_low >= self.truncate_high
        {
            return Err(PipelineError::invalid(
                Stage::Validation,
                format!(
                    "truncation range [{}, {}] is empty",
                    self.truncate_low, self.truncate_high
                ),
            ));
        }
        Ok(())
    }
}

/// Number of wavelet layers for a given star size.
///
/// # Examples
/// ```
/// use epsf::image_proc::background::layer_count;
///
/// assert_eq!(layer_count(45, 2.5).unwrap(), 7);
/// assert_eq!(layer_count(5, 2.5).unwrap(), 4);
/// assert_eq!(layer_count(100, 2.5).unwrap(), 9);
/// ```
pub fn layer_count(star_size: usize, layer_offset: f64) -> Result<usize> {
    if star_size == 0 {
        return Err(PipelineError::invalid(
            Stage::BackgroundFlattening,
            "star size must be positive",
        ));
    }

    let layers = ((star_size as f64).log2() + layer_offset).floor();
    if layers < 1.0 {
        return Err(PipelineError::invalid(
            Stage::BackgroundFlattening,
            format!("star size {star_size} with offset {layer_offset} gives {layers} wavelet layers"),
        ));
    }
    Ok(layers as usize)
}

/// Produces background-suppressed, `[0, 1]`-normalized copies of source frames.
#[derive(Debug, Clone)]
pub struct BackgroundFlattener {
    star_size: usize,
    config: BackgroundConfig,
    transform: StarletTransform,
}

impl BackgroundFlattener {
    pub fn new(star_size: usize) -> Result<Self> {
        Self::with_config(star_size, BackgroundConfig::default())
    }

    pub fn with_config(star_size: usize, config: BackgroundConfig) -> Result<Self> {
        config.validate()?;
        let num_layers = layer_count(star_size, config.layer_offset)?;
        Ok(Self {
            star_size,
            config,
            transform: StarletTransform::new(num_layers)?,
        })
    }

    pub fn star_size(&self) -> usize {
        self.star_size
    }

    pub fn num_layers(&self) -> usize {
        self.transform.num_layers()
    }

    pub fn config(&self) -> &BackgroundConfig {
        &self.config
    }

    /// Flatten `source` into a new buffer; `source` is never modified.
    ///
    /// # Errors
    /// * `InvalidArgument` - empty source
    /// * `DegenerateImage` - the truncated image is constant; normalization
    ///   is skipped and the run cannot continue
    pub fn flatten<T: Sample>(&self, source: ArrayView2<T>) -> Result<Array2<T>> {
        ensure_non_empty(source, Stage::BackgroundFlattening)?;
        info!(
            "Removing background: {}x{} frame, {} starlet layers for star size {}",
            source.ncols(),
            source.nrows(),
            self.num_layers(),
            self.star_size
        );

        let residual = self.transform.residual(source)?;
        let mut flattened = source.to_owned();
        flattened.zip_mut_with(&residual, |v, &c| *v = *v - c);
        drop(residual);

        truncate(
            &mut flattened,
            T::from_f64_lossy(self.config.truncate_low),
            T::from_f64_lossy(self.config.truncate_high),
        );
        normalize_min_max(&mut flattened, Stage::BackgroundFlattening)?;

        debug!("Background flattening complete");
        Ok(flattened)
    }
}
