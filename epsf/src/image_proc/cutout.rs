//! Per-star records returned by the star engine and their reduction to
//! canonical `star_size x star_size` cutouts.

use crate::errors::{PipelineError, Result, Stage};
use crate::image_proc::image::{center_crop, Sample};
use log::debug;
use ndarray::Array2;
use rayon::prelude::*;

/// One star accepted by the engine.
///
/// `origin` is the integer pixel offset of the extraction window in the
/// source frame, `center` the sub-pixel centroid in source coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct StarRecord<T: Sample> {
    pub origin: (i64, i64),
    pub center: (f64, f64),
    pub flux: f64,
    pub image: Array2<T>,
}

impl<T: Sample> StarRecord<T> {
    /// Centroid rounded to the nearest pixel, as `(x, y)`.
    pub fn rounded_center(&self) -> (i64, i64) {
        (self.center.0.round() as i64, self.center.1.round() as i64)
    }

    /// `(width, height)` of the extracted image.
    pub fn image_size(&self) -> (usize, usize) {
        let (height, width) = self.image.dim();
        (width, height)
    }
}

/// Crops engine cutouts to the canonical star size.
#[derive(Debug, Clone, Copy)]
pub struct CutoutReconstructor {
    star_size: usize,
}

impl CutoutReconstructor {
    pub fn new(star_size: usize) -> Result<Self> {
        if star_size == 0 {
            return Err(PipelineError::invalid(
                Stage::CutoutReconstruction,
                "star size must be positive",
            ));
        }
        Ok(Self { star_size })
    }

    pub fn star_size(&self) -> usize {
        self.star_size
    }

    /// Centered `star_size` crop of every record, in record order.
    ///
    /// Fails if any record's image is smaller than `star_size` along either
    /// axis; nothing is returned in that case. Records are cropped in
    /// parallel and collected in input order.
    pub fn reconstruct<T: Sample>(&self, records: &[StarRecord<T>]) -> Result<Vec<Array2<T>>> {
        let cutouts = records
            .par_iter()
            .enumerate()
            .map(|(index, record)| {
                let (width, height) = record.image_size();
                debug!(
                    "Cropping star {index}: {width}x{height} -> {size}x{size}",
                    size = self.star_size
                );
                center_crop(record.image.view(), self.star_size, Stage::CutoutReconstruction)
            })
            .collect::<Result<Vec<_>>>()?;

        debug!("Reconstructed {} cutouts", cutouts.len());
        Ok(cutouts)
    }
}
