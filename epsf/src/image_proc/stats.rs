//! Robust image statistics and the auto-stretch parameters derived from them.
//!
//! The median and the median absolute deviation (MAD) drive the display
//! stretch of every output image. `sigma = 1.4826 * MAD` is the MAD scaled to
//! the standard deviation of a normal distribution.
//!
//! NaN samples are ignored; infinite samples take part in the ordering.

use crate::errors::{PipelineError, Result, Stage};
use crate::image_proc::image::Sample;
use ndarray::ArrayView2;

/// Scale factor from MAD to a Gaussian-equivalent standard deviation.
pub const MAD_TO_SIGMA: f64 = 1.4826;

/// Shadows clipping point, in sigma units below the median.
pub const DEFAULT_SHADOWS_CLIPPING: f64 = -2.8;

/// Target mean background of a stretched image.
pub const DEFAULT_TARGET_BACKGROUND: f64 = 0.25;

/// Median of `values`, reordering the slice in place.
///
/// Exact order statistic for odd counts; the mean of the two central order
/// statistics for even counts. NaN must already be filtered out.
fn median_in_place(values: &mut [f64]) -> Option<f64> {
    let n = values.len();
    if n == 0 {
        return None;
    }

    let mid = n / 2;
    let (lower, upper, _) = values.select_nth_unstable_by(mid, f64::total_cmp);
    let upper = *upper;

    if n % 2 == 1 {
        Some(upper)
    } else {
        // Largest element of the lower partition is order statistic mid - 1
        let lower_max = lower
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        Some((lower_max + upper) / 2.0)
    }
}

fn finite_samples<T: Sample>(image: ArrayView2<T>) -> Vec<f64> {
    image
        .iter()
        .filter(|v| !v.is_nan())
        .map(|v| v.as_f64())
        .collect()
}

/// Median sample value of an image.
///
/// # Errors
/// `InvalidArgument` if the image has no non-NaN samples.
pub fn median<T: Sample>(image: ArrayView2<T>) -> Result<f64> {
    let mut values = finite_samples(image);
    median_in_place(&mut values).ok_or_else(|| {
        PipelineError::invalid(
            Stage::Statistics,
            format!(
                "cannot compute median of {}x{} image without valid samples",
                image.ncols(),
                image.nrows()
            ),
        )
    })
}

/// Median absolute deviation of an image about `center`.
pub fn mad<T: Sample>(image: ArrayView2<T>, center: f64) -> Result<f64> {
    let mut deviations: Vec<f64> = image
        .iter()
        .filter(|v| !v.is_nan())
        .map(|v| (v.as_f64() - center).abs())
        .collect();
    median_in_place(&mut deviations).ok_or_else(|| {
        PipelineError::invalid(
            Stage::Statistics,
            "cannot compute MAD of an image without valid samples",
        )
    })
}

/// Auto-stretch parameters of one image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobustStretch {
    /// Median sample value
    pub center: f64,
    /// `1.4826 * MAD`
    pub sigma: f64,
}

impl RobustStretch {
    /// Compute the stretch parameters for `image`.
    pub fn from_image<T: Sample>(image: ArrayView2<T>) -> Result<Self> {
        let mut values = finite_samples(image);
        let center = median_in_place(&mut values).ok_or_else(|| {
            PipelineError::invalid(
                Stage::Statistics,
                format!(
                    "cannot stretch {}x{} image without valid samples",
                    image.ncols(),
                    image.nrows()
                ),
            )
        })?;

        values.iter_mut().for_each(|v| *v = (*v - center).abs());
        let mad = median_in_place(&mut values).unwrap_or(0.0);

        Ok(Self {
            center,
            sigma: MAD_TO_SIGMA * mad,
        })
    }

    /// Screen transfer function using the default clipping and target background.
    pub fn screen_transfer(&self) -> ScreenTransfer {
        self.screen_transfer_with(DEFAULT_SHADOWS_CLIPPING, DEFAULT_TARGET_BACKGROUND)
    }

    /// Screen transfer function for normalized `[0, 1]` data.
    ///
    /// Shadows are clipped at `center + shadows_clipping * sigma`; the
    /// midtones balance is picked so the clipped and rescaled median lands
    /// on `target_background`.
    pub fn screen_transfer_with(&self, shadows_clipping: f64, target_background: f64) -> ScreenTransfer {
        let shadows = (self.center + shadows_clipping * self.sigma).clamp(0.0, 1.0);
        let median_after_clip = if shadows < 1.0 {
            (self.center - shadows) / (1.0 - shadows)
        } else {
            0.0
        };
        let midtones = midtones_transfer(target_background, median_after_clip);
        ScreenTransfer {
            shadows,
            midtones,
            highlights: 1.0,
        }
    }
}

/// Midtones transfer function `MTF(m, x)`.
///
/// `MTF(m, 0) = 0`, `MTF(m, m) = 0.5`, `MTF(m, 1) = 1`.
pub fn midtones_transfer(m: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    if x == m {
        return 0.5;
    }
    ((m - 1.0) * x) / ((2.0 * m - 1.0) * x - m)
}

/// Histogram transformation applied when displaying an image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenTransfer {
    pub shadows: f64,
    pub midtones: f64,
    pub highlights: f64,
}

impl ScreenTransfer {
    /// Map one sample to display intensity in `[0, 1]`.
    pub fn apply(&self, value: f64) -> f64 {
        if value.is_nan() {
            return 0.0;
        }
        let range = self.highlights - self.shadows;
        if range <= 0.0 {
            return if value >= self.highlights { 1.0 } else { 0.0 };
        }
        let clipped = ((value - self.shadows) / range).clamp(0.0, 1.0);
        midtones_transfer(self.midtones, clipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};

    #[test]
    fn test_median_mad_sigma_of_one_to_five() {
        let img = array![[1.0f64, 2.0, 3.0, 4.0, 5.0]];
        let med = median(img.view()).unwrap();
        assert_eq!(med, 3.0);
        assert_eq!(mad(img.view(), med).unwrap(), 1.0);

        let stretch = RobustStretch::from_image(img.view()).unwrap();
        assert_eq!(stretch.center, 3.0);
        assert_relative_eq!(stretch.sigma, 1.4826, epsilon = 1e-12);
    }

    #[test]
    fn test_median_even_count_averages_central_pair() {
        let img = array![[4.0f32, 1.0], [3.0, 2.0]];
        assert_eq!(median(img.view()).unwrap(), 2.5);
    }

    #[test]
    fn test_median_ignores_nan() {
        let img = array![[f64::NAN, 7.0, 1.0], [5.0, f64::NAN, 3.0]];
        assert_eq!(median(img.view()).unwrap(), 4.0);
    }

    #[test]
    fn test_median_orders_infinities() {
        let img = array![[f64::INFINITY, 2.0, f64::NEG_INFINITY], [9.0, 1.0, -3.0]];
        assert_eq!(median(img.view()).unwrap(), 1.5);

        let img = array![[f64::INFINITY, f64::INFINITY, 0.5]];
        assert_eq!(median(img.view()).unwrap(), f64::INFINITY);
    }

    #[test]
    fn test_median_of_all_nan_fails() {
        let img = Array2::<f64>::from_elem((2, 3), f64::NAN);
        let err = median(img.view()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidArgument {
                stage: Stage::Statistics,
                ..
            }
        ));
    }

    #[test]
    fn test_constant_image_has_zero_sigma() {
        let img = Array2::from_elem((4, 4), 0.3f64);
        let stretch = RobustStretch::from_image(img.view()).unwrap();
        assert_relative_eq!(stretch.center, 0.3);
        assert_eq!(stretch.sigma, 0.0);
    }

    #[test]
    fn test_midtones_transfer_fixed_points() {
        assert_eq!(midtones_transfer(0.3, 0.0), 0.0);
        assert_eq!(midtones_transfer(0.3, 1.0), 1.0);
        assert_eq!(midtones_transfer(0.3, 0.3), 0.5);
        assert_relative_eq!(midtones_transfer(0.5, 0.2), 0.2, epsilon = 1e-12);
    }

    #[test]
    fn test_screen_transfer_moves_median_to_target() {
        let stretch = RobustStretch {
            center: 0.1,
            sigma: 0.01,
        };
        let stf = stretch.screen_transfer();
        assert_relative_eq!(stf.shadows, 0.1 - 0.028, epsilon = 1e-12);
        assert_relative_eq!(stf.apply(0.1), DEFAULT_TARGET_BACKGROUND, epsilon = 1e-9);
        assert_eq!(stf.apply(0.0), 0.0);
        assert_eq!(stf.apply(1.0), 1.0);
    }
}
