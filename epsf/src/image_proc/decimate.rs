//! Reduction of an oversampled PSF model to the canonical star size.
//!
//! The engine builds its model on a grid `oversampling` times finer than the
//! detector. The model is cropped to its central
//! `star_size * oversampling` square, block-averaged back to detector
//! resolution and min/max normalized.

use crate::errors::{PipelineError, Result, Stage};
use crate::image_proc::image::{center_crop, normalize_min_max, Sample};
use log::debug;
use ndarray::{s, Array2, ArrayView2};

/// Mean of each non-overlapping `factor x factor` block.
///
/// Both axes must be divisible by `factor`. A factor of 1 is a copy.
pub fn block_average<T: Sample>(image: ArrayView2<T>, factor: usize) -> Result<Array2<T>> {
    if factor == 0 {
        return Err(PipelineError::invalid(
            Stage::ModelDecimation,
            "decimation factor must be at least 1",
        ));
    }

    let (height, width) = image.dim();
    if width % factor != 0 || height % factor != 0 {
        return Err(PipelineError::invalid(
            Stage::ModelDecimation,
            format!("{width}x{height} image is not divisible into {factor}x{factor} blocks"),
        ));
    }

    let block_len = T::from_f64_lossy((factor * factor) as f64);
    Ok(Array2::from_shape_fn(
        (height / factor, width / factor),
        |(y, x)| {
            let block = image.slice(s![
                y * factor..(y + 1) * factor,
                x * factor..(x + 1) * factor
            ]);
            block.iter().fold(T::zero(), |acc, &v| acc + v) / block_len
        },
    ))
}

/// Crops, decimates and normalizes oversampled PSF models.
#[derive(Debug, Clone, Copy)]
pub struct ModelDecimator {
    star_size: usize,
    oversampling: usize,
}

impl ModelDecimator {
    pub fn new(star_size: usize, oversampling: usize) -> Result<Self> {
        if star_size == 0 || oversampling == 0 {
            return Err(PipelineError::invalid(
                Stage::ModelDecimation,
                format!("star size {star_size} and oversampling {oversampling} must be positive"),
            ));
        }
        Ok(Self {
            star_size,
            oversampling,
        })
    }

    /// Side of the oversampled window taken from the model.
    pub fn oversampled_size(&self) -> usize {
        self.star_size * self.oversampling
    }

    /// Crop to the block-averaged footprint without normalizing.
    pub fn resample<T: Sample>(&self, model: ArrayView2<T>) -> Result<Array2<T>> {
        let cropped = center_crop(model, self.oversampled_size(), Stage::ModelDecimation)?;
        block_average(cropped.view(), self.oversampling)
    }

    /// Canonical `star_size x star_size` model scaled to `[0, 1]`.
    ///
    /// # Errors
    /// * `CutoutTooSmall` - model narrower than `star_size * oversampling`
    /// * `DegenerateImage` - the decimated model is constant
    pub fn decimate<T: Sample>(&self, model: ArrayView2<T>) -> Result<Array2<T>> {
        let (height, width) = model.dim();
        debug!(
            "Decimating {width}x{height} model: crop {size}x{size}, factor {}",
            self.oversampling,
            size = self.oversampled_size()
        );

        let mut decimated = self.resample(model)?;
        normalize_min_max(&mut decimated, Stage::ModelDecimation)?;
        Ok(decimated)
    }
}
