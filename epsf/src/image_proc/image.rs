//! Floating-point image buffers and the elementwise operations shared by
//! every stage: extrema, truncation, min/max normalization and centered
//! cropping.
//!
//! Images are `ndarray::Array2<T>` indexed `[[y, x]]`, so `dim()` returns
//! `(height, width)`. The sample precision `T` is chosen once through the
//! [`Sample`] trait; no stage branches on pixel format at runtime.

use crate::errors::{PipelineError, Result, Stage};
use fitsio::compat::fitsfile::FitsFile;
use fitsio::compat::hdu::FitsHdu;
use fitsio::compat::images::{ImageType, WriteImage};
use image::{GrayImage, Luma};
use ndarray::{s, Array2, ArrayView2};
use num_traits::{Float, FromPrimitive, ToPrimitive};
use std::fmt::{Debug, Display};

/// Floating-point sample type an image can be processed at.
pub trait Sample:
    Float + FromPrimitive + ToPrimitive + Debug + Display + Default + Send + Sync + 'static
{
    /// FITS storage type (`BITPIX`) matching this precision.
    const IMAGE_TYPE: ImageType;

    /// Bits per sample, for log messages.
    const BITS: u32;

    /// Lossy conversion from `f64`; both implementors accept any finite value.
    fn from_f64_lossy(value: f64) -> Self;

    fn as_f64(self) -> f64;

    /// Write row-major samples into an image HDU at this precision.
    fn write_hdu(
        fptr: &mut FitsFile,
        hdu: &FitsHdu,
        data: &[Self],
    ) -> std::result::Result<(), fitsio::compat::errors::Error>;
}

impl Sample for f32 {
    const IMAGE_TYPE: ImageType = ImageType::Float;
    const BITS: u32 = 32;

    fn from_f64_lossy(value: f64) -> Self {
        value as f32
    }

    fn as_f64(self) -> f64 {
        self as f64
    }

    fn write_hdu(
        fptr: &mut FitsFile,
        hdu: &FitsHdu,
        data: &[Self],
    ) -> std::result::Result<(), fitsio::compat::errors::Error> {
        f32::write_image(fptr, hdu, data)
    }
}

impl Sample for f64 {
    const IMAGE_TYPE: ImageType = ImageType::Double;
    const BITS: u32 = 64;

    fn from_f64_lossy(value: f64) -> Self {
        value
    }

    fn as_f64(self) -> f64 {
        self
    }

    fn write_hdu(
        fptr: &mut FitsFile,
        hdu: &FitsHdu,
        data: &[Self],
    ) -> std::result::Result<(), fitsio::compat::errors::Error> {
        f64::write_image(fptr, hdu, data)
    }
}

/// Convert an image to another precision.
pub fn convert_precision<S: Sample, T: Sample>(image: ArrayView2<S>) -> Array2<T> {
    image.mapv(|v| T::from_f64_lossy(v.as_f64()))
}

/// Minimum and maximum sample values, ignoring NaN.
///
/// Returns `None` when the image has no non-NaN samples.
pub fn min_max<T: Sample>(image: ArrayView2<T>) -> Option<(T, T)> {
    image
        .iter()
        .filter(|v| !v.is_nan())
        .fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

/// Clamp every sample into `[low, high]` in place.
pub fn truncate<T: Sample>(image: &mut Array2<T>, low: T, high: T) {
    image.mapv_inplace(|v| v.max(low).min(high));
}

/// Linear min/max stretch in place so the minimum maps to 0 and the maximum to 1.
///
/// When the image has no dynamic range the buffer is left untouched and
/// `DegenerateImage` is returned with the constant value; the caller decides
/// whether that is fatal.
pub fn normalize_min_max<T: Sample>(image: &mut Array2<T>, stage: Stage) -> Result<()> {
    let (lo, hi) = min_max(image.view()).ok_or_else(|| {
        PipelineError::invalid(stage, "cannot normalize an image with no finite samples")
    })?;

    if hi <= lo {
        return Err(PipelineError::DegenerateImage {
            stage,
            value: lo.as_f64(),
        });
    }

    let range = hi - lo;
    image.mapv_inplace(|v| (v - lo) / range);
    Ok(())
}

/// Offsets `(x0, y0)` of a centered `size x size` window.
///
/// Uses integer floor division so odd leftovers go to the right/bottom edge.
pub fn centered_window(width: usize, height: usize, size: usize) -> (usize, usize) {
    ((width - size) / 2, (height - size) / 2)
}

/// Crop a `size x size` window centered in `image`.
///
/// The window is `[x0, x0 + size) x [y0, y0 + size)` with
/// `x0 = (width - size) / 2` and `y0 = (height - size) / 2`.
///
/// # Errors
/// `CutoutTooSmall` if either axis is smaller than `size`;
/// `InvalidArgument` if `size` is zero.
pub fn center_crop<T: Clone>(image: ArrayView2<T>, size: usize, stage: Stage) -> Result<Array2<T>> {
    if size == 0 {
        return Err(PipelineError::invalid(stage, "crop size must be positive"));
    }

    let (height, width) = image.dim();
    if width < size || height < size {
        return Err(PipelineError::CutoutTooSmall {
            stage,
            width,
            height,
            required: size,
        });
    }

    let (x0, y0) = centered_window(width, height, size);
    Ok(image.slice(s![y0..y0 + size, x0..x0 + size]).to_owned())
}

/// Reject empty buffers before any transform touches them.
pub fn ensure_non_empty<T>(image: ArrayView2<T>, stage: Stage) -> Result<()> {
    let (height, width) = image.dim();
    if width == 0 || height == 0 {
        return Err(PipelineError::invalid(
            stage,
            format!("image must be non-empty, got {width}x{height}"),
        ));
    }
    Ok(())
}

/// Converts an ndarray Array2<u8> to an image::GrayImage
///
/// Array indices `[y, x]` map to pixel coordinates `(x, y)`.
pub fn array2_to_gray_image(arr: &Array2<u8>) -> GrayImage {
    let (height, width) = arr.dim();
    let mut img = GrayImage::new(width as u32, height as u32);

    for y in 0..height {
        for x in 0..width {
            img.put_pixel(x as u32, y as u32, Luma([arr[[y, x]]]));
        }
    }

    img
}
