//! Isotropic undecimated wavelet transform (starlet / à trous B3-spline).
//!
//! The transform splits an image into `n` detail layers plus one residual
//! smooth layer, all at the input resolution:
//!
//! ```text
//! c_0     = image
//! c_{s+1} = h_s * c_s                 (h dilated by 2^s, separable)
//! w_s     = c_s - c_{s+1}             for s = 0..n-1
//! layers  = [w_0, w_1, ..., w_{n-1}, c_n]
//! ```
//!
//! Summing all layers telescopes back to `c_0`, so reconstruction with no
//! disabled layers returns the input up to floating-point rounding.
//!
//! # Border Handling
//!
//! Samples outside the image are mirrored with the edge sample repeated
//! (`-1 -> 0`, `n -> n - 1`), folded periodically so dilated taps that reach
//! several image widths away still land on a valid pixel. The rule is pure
//! integer arithmetic and gives identical results on every platform.
//!
//! # Parallelism
//!
//! Each separable pass is evaluated per output pixel with
//! `ndarray::Zip::par_for_each`. Every pixel accumulates its five taps in the
//! same fixed order, so results do not depend on the thread count.

use crate::errors::{PipelineError, Result, Stage};
use crate::image_proc::image::{ensure_non_empty, Sample};
use log::debug;
use ndarray::{Array2, ArrayView2, Zip};

/// B3-spline scaling function coefficients `[1, 4, 6, 4, 1] / 16`.
pub const B3_SPLINE: [f64; 5] = [1.0 / 16.0, 1.0 / 4.0, 3.0 / 8.0, 1.0 / 4.0, 1.0 / 16.0];

/// Map an out-of-range index into `0..size` by whole-sample symmetric reflection.
///
/// The extension is periodic with period `2 * size`, so any offset is valid.
pub fn reflect_index(idx: isize, size: usize) -> usize {
    let n = size as isize;
    let period = 2 * n;
    let folded = idx.rem_euclid(period);
    if folded < n {
        folded as usize
    } else {
        (period - 1 - folded) as usize
    }
}

#[derive(Debug, Clone, Copy)]
enum Axis {
    Rows,
    Columns,
}

/// `2^scale` reduced modulo the reflection period `period`.
///
/// Offsets only matter modulo the period, so the reduced step indexes the
/// same samples as the full dilation at any scale.
fn dilation_step(scale: usize, period: usize) -> usize {
    (0..scale).fold(1 % period, |step, _| (step * 2) % period)
}

/// One separable pass of the kernel dilated for `scale` along `axis`.
fn convolve_axis<T: Sample>(
    input: ArrayView2<T>,
    kernel: &[T; 5],
    scale: usize,
    axis: Axis,
) -> Array2<T> {
    let (height, width) = input.dim();
    let len = match axis {
        Axis::Rows => width,
        Axis::Columns => height,
    };
    let half = (kernel.len() / 2) as isize;
    let step = dilation_step(scale, 2 * len) as isize;
    let mut output = Array2::<T>::zeros((height, width));

    Zip::indexed(&mut output).par_for_each(|(y, x), out| {
        let mut sum = T::zero();
        for (k, &weight) in kernel.iter().enumerate() {
            let offset = (k as isize - half) * step;
            let sample = match axis {
                Axis::Rows => input[[y, reflect_index(x as isize + offset, width)]],
                Axis::Columns => input[[reflect_index(y as isize + offset, height), x]],
            };
            sum = sum + weight * sample;
        }
        *out = sum;
    });

    output
}

/// Smooth `input` with the kernel dilated for `scale` (gap of `2^scale - 1`).
fn smooth_at_scale<T: Sample>(input: ArrayView2<T>, kernel: &[T; 5], scale: usize) -> Array2<T> {
    let horizontal = convolve_axis(input, kernel, scale, Axis::Rows);
    convolve_axis(horizontal.view(), kernel, scale, Axis::Columns)
}

/// Result of a forward starlet decomposition.
///
/// Holds `num_layers` detail layers followed by the residual smooth layer.
#[derive(Debug, Clone)]
pub struct WaveletLayers<T: Sample> {
    layers: Vec<Array2<T>>,
}

impl<T: Sample> WaveletLayers<T> {
    /// Wrap an existing layer stack; all layers must share one shape.
    pub fn from_layers(layers: Vec<Array2<T>>) -> Result<Self> {
        let first = layers.first().ok_or_else(|| {
            PipelineError::invalid(Stage::WaveletTransform, "layer stack is empty")
        })?;
        let dim = first.dim();
        if let Some((idx, bad)) = layers.iter().enumerate().find(|(_, l)| l.dim() != dim) {
            return Err(PipelineError::invalid(
                Stage::WaveletTransform,
                format!(
                    "layer {idx} is {}x{}, expected {}x{}",
                    bad.ncols(),
                    bad.nrows(),
                    dim.1,
                    dim.0
                ),
            ));
        }
        Ok(Self { layers })
    }

    /// Number of detail layers (excludes the residual layer).
    pub fn num_detail_layers(&self) -> usize {
        self.layers.len() - 1
    }

    /// Total number of layers including the residual.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Index of the residual smooth layer.
    pub fn residual_index(&self) -> usize {
        self.layers.len() - 1
    }

    pub fn layer(&self, index: usize) -> Option<&Array2<T>> {
        self.layers.get(index)
    }

    pub fn residual(&self) -> &Array2<T> {
        &self.layers[self.residual_index()]
    }

    pub fn layers(&self) -> &[Array2<T>] {
        &self.layers
    }

    pub fn into_layers(self) -> Vec<Array2<T>> {
        self.layers
    }

    /// `(height, width)` shared by every layer.
    pub fn dim(&self) -> (usize, usize) {
        self.layers[0].dim()
    }

    /// Sum every layer whose index is not in `disabled`.
    ///
    /// Layers are accumulated in index order. Disabling every layer yields a
    /// zero image.
    ///
    /// # Errors
    /// `InvalidArgument` if `disabled` names an index past the residual layer.
    pub fn reconstruct(&self, disabled: &[usize]) -> Result<Array2<T>> {
        if let Some(&bad) = disabled.iter().find(|&&i| i >= self.layers.len()) {
            return Err(PipelineError::invalid(
                Stage::WaveletTransform,
                format!(
                    "cannot disable layer {bad}: only layers 0..={} exist",
                    self.residual_index()
                ),
            ));
        }

        let mut output = Array2::<T>::zeros(self.dim());
        for (idx, layer) in self.layers.iter().enumerate() {
            if disabled.contains(&idx) {
                continue;
            }
            output.zip_mut_with(layer, |acc, &v| *acc = *acc + v);
        }
        Ok(output)
    }
}

/// Starlet transform with a separable 5-tap scaling kernel.
#[derive(Debug, Clone)]
pub struct StarletTransform {
    kernel: [f64; 5],
    num_layers: usize,
}

impl StarletTransform {
    /// B3-spline starlet with `num_layers` detail layers.
    ///
    /// # Errors
    /// `InvalidArgument` if `num_layers` is zero.
    pub fn new(num_layers: usize) -> Result<Self> {
        Self::with_kernel(B3_SPLINE, num_layers)
    }

    /// Starlet with a custom symmetric 5-tap kernel.
    pub fn with_kernel(kernel: [f64; 5], num_layers: usize) -> Result<Self> {
        if num_layers == 0 {
            return Err(PipelineError::invalid(
                Stage::WaveletTransform,
                "number of wavelet layers must be positive",
            ));
        }
        Ok(Self { kernel, num_layers })
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn kernel(&self) -> &[f64; 5] {
        &self.kernel
    }

    /// Forward transform of `image` into `num_layers + 1` layers.
    ///
    /// # Errors
    /// `InvalidArgument` if `image` is empty.
    pub fn decompose<T: Sample>(&self, image: ArrayView2<T>) -> Result<WaveletLayers<T>> {
        ensure_non_empty(image, Stage::WaveletTransform)?;

        let kernel = self.kernel.map(T::from_f64_lossy);
        let mut layers = Vec::with_capacity(self.num_layers + 1);
        let mut approx = image.to_owned();

        for scale in 0..self.num_layers {
            debug!(
                "Starlet scale {}: kernel step 2^{} on {}x{} image",
                scale,
                scale,
                image.ncols(),
                image.nrows()
            );
            let smoothed = smooth_at_scale(approx.view(), &kernel, scale);
            let mut detail = approx;
            detail.zip_mut_with(&smoothed, |d, &s| *d = *d - s);
            layers.push(detail);
            approx = smoothed;
        }
        layers.push(approx);

        Ok(WaveletLayers { layers })
    }

    /// Residual smooth layer `c_n` alone.
    ///
    /// Equal to the last layer of [`StarletTransform::decompose`] without
    /// keeping any detail layer alive.
    pub fn residual<T: Sample>(&self, image: ArrayView2<T>) -> Result<Array2<T>> {
        ensure_non_empty(image, Stage::WaveletTransform)?;

        let kernel = self.kernel.map(T::from_f64_lossy);
        let mut approx = image.to_owned();
        for scale in 0..self.num_layers {
            approx = smooth_at_scale(approx.view(), &kernel, scale);
        }
        Ok(approx)
    }
}

/// Forward starlet decomposition with the B3-spline kernel.
pub fn decompose<T: Sample>(image: ArrayView2<T>, num_layers: usize) -> Result<WaveletLayers<T>> {
    StarletTransform::new(num_layers)?.decompose(image)
}

/// Sum all layers not listed in `disabled`.
pub fn reconstruct<T: Sample>(layers: &WaveletLayers<T>, disabled: &[usize]) -> Result<Array2<T>> {
    layers.reconstruct(disabled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn random_image(height: usize, width: usize, seed: u64) -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Array2::from_shape_fn((height, width), |_| rng.random_range(0.0..1.0))
    }

    #[test]
    fn test_reflect_index_single_fold() {
        assert_eq!(reflect_index(-1, 5), 0);
        assert_eq!(reflect_index(-2, 5), 1);
        assert_eq!(reflect_index(5, 5), 4);
        assert_eq!(reflect_index(6, 5), 3);
        assert_eq!(reflect_index(3, 5), 3);
    }

    #[test]
    fn test_reflect_index_far_offsets() {
        // Period is 2 * size: ... 0 1 2 | 2 1 0 | 0 1 2 | 2 1 0 ...
        assert_eq!(reflect_index(6, 3), 0);
        assert_eq!(reflect_index(9, 3), 2);
        assert_eq!(reflect_index(-7, 3), 0);
        assert_eq!(reflect_index(100, 1), 0);
        assert_eq!(reflect_index(-64, 1), 0);
    }

    #[test]
    fn test_b3_kernel_is_normalized() {
        let sum: f64 = B3_SPLINE.iter().sum();
        assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-15);
    }

    #[test]
    fn test_reconstruction_identity() {
        let image = random_image(37, 53, 11);
        for num_layers in 1..=6 {
            let layers = decompose(image.view(), num_layers).unwrap();
            assert_eq!(layers.len(), num_layers + 1);
            let rebuilt = layers.reconstruct(&[]).unwrap();
            let max_err = (&rebuilt - &image)
                .iter()
                .fold(0.0f64, |m, v| m.max(v.abs()));
            assert!(max_err < 1e-5, "layers={num_layers} max error {max_err}");
        }
    }

    #[test]
    fn test_reconstruction_identity_single_precision() {
        let image = random_image(20, 16, 3).mapv(|v| v as f32);
        let layers = decompose(image.view(), 4).unwrap();
        let rebuilt = layers.reconstruct(&[]).unwrap();
        for (a, b) in rebuilt.iter().zip(image.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_constant_image_has_zero_details() {
        let image = Array2::from_elem((16, 16), 0.75f64);
        let layers = decompose(image.view(), 3).unwrap();
        for s in 0..3 {
            let detail = layers.layer(s).unwrap();
            assert!(detail.iter().all(|v| v.abs() < 1e-12));
        }
        assert!(layers.residual().iter().all(|v| (v - 0.75).abs() < 1e-12));
    }

    #[test]
    fn test_detail_layers_have_near_zero_mean_for_interior_impulse() {
        let mut image = Array2::<f64>::zeros((65, 65));
        image[[32, 32]] = 1.0;
        let layers = decompose(image.view(), 3).unwrap();
        for s in 0..3 {
            let sum: f64 = layers.layer(s).unwrap().sum();
            assert_abs_diff_eq!(sum, 0.0, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(layers.residual().sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_first_scale_smoothing_matches_kernel() {
        let mut image = Array2::<f64>::zeros((9, 9));
        image[[4, 4]] = 1.0;
        let layers = decompose(image.view(), 1).unwrap();
        let smooth = layers.residual();
        // Separable response: h[i] * h[j]
        assert_abs_diff_eq!(smooth[[4, 4]], 0.375 * 0.375, epsilon = 1e-15);
        assert_abs_diff_eq!(smooth[[4, 6]], 0.375 / 16.0, epsilon = 1e-15);
        assert_abs_diff_eq!(smooth[[3, 5]], 0.25 * 0.25, epsilon = 1e-15);
    }

    #[test]
    fn test_dilation_uses_gaps() {
        // At scale 1 the taps sit at offsets 0, +-2, +-4.
        let mut image = Array2::<f64>::zeros((1, 21));
        image[[0, 10]] = 1.0;
        let kernel = B3_SPLINE;
        let smoothed = smooth_at_scale(image.view(), &kernel, 1);
        assert_abs_diff_eq!(smoothed[[0, 11]], 0.0, epsilon = 1e-15);
        assert_abs_diff_eq!(smoothed[[0, 12]], 0.25, epsilon = 1e-15);
        assert_abs_diff_eq!(smoothed[[0, 14]], 1.0 / 16.0, epsilon = 1e-15);
    }

    #[test]
    fn test_disable_residual_removes_offset() {
        let image = Array2::from_shape_fn((32, 32), |(y, x)| 0.5 + 0.001 * (x + y) as f64);
        let layers = decompose(image.view(), 4).unwrap();
        let flattened = layers.reconstruct(&[layers.residual_index()]).unwrap();
        let mean = flattened.mean().unwrap();
        assert!(mean.abs() < 0.01, "mean {mean}");
    }

    #[test]
    fn test_disable_everything_gives_zero() {
        let image = random_image(8, 8, 5);
        let layers = decompose(image.view(), 2).unwrap();
        let out = layers.reconstruct(&[0, 1, 2]).unwrap();
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_invalid_arguments() {
        let image = random_image(8, 8, 1);
        assert!(matches!(
            decompose(image.view(), 0),
            Err(PipelineError::InvalidArgument { .. })
        ));

        let empty = Array2::<f64>::zeros((0, 4));
        assert!(matches!(
            decompose(empty.view(), 2),
            Err(PipelineError::InvalidArgument { .. })
        ));

        let layers = decompose(image.view(), 2).unwrap();
        assert!(matches!(
            layers.reconstruct(&[3]),
            Err(PipelineError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_from_layers_rejects_mismatched_shapes() {
        let layers = vec![Array2::<f64>::zeros((4, 4)), Array2::<f64>::zeros((4, 5))];
        assert!(WaveletLayers::from_layers(layers).is_err());
        assert!(WaveletLayers::<f64>::from_layers(Vec::new()).is_err());
    }

    #[test]
    fn test_dilation_step_wraps_at_reflection_period() {
        assert_eq!(dilation_step(0, 10), 1);
        assert_eq!(dilation_step(3, 10), 8);
        assert_eq!(dilation_step(4, 10), 6);
        assert_eq!(dilation_step(70, 2), 0);
        assert_eq!(dilation_step(5, 64), 32);
    }

    #[test]
    fn test_layer_count_past_word_size_does_not_overflow() {
        let image = Array2::from_elem((4, 4), 0.5f64);
        let layers = decompose(image.view(), 64).unwrap();
        assert_eq!(layers.len(), 65);
        assert!(layers.residual().iter().all(|v| (v - 0.5).abs() < 1e-12));

        let image = random_image(5, 7, 3);
        let layers = decompose(image.view(), 70).unwrap();
        let rebuilt = layers.reconstruct(&[]).unwrap();
        for (a, b) in rebuilt.iter().zip(image.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_residual_matches_last_decomposed_layer() {
        let image = random_image(20, 17, 4);
        let transform = StarletTransform::new(5).unwrap();
        let layers = transform.decompose(image.view()).unwrap();
        let residual = transform.residual(image.view()).unwrap();
        assert_eq!(&residual, layers.residual());

        let empty = Array2::<f64>::zeros((3, 0));
        assert!(transform.residual(empty.view()).is_err());
    }

    #[test]
    fn test_tiny_image_with_many_layers() {
        let image = random_image(3, 2, 9);
        let layers = decompose(image.view(), 7).unwrap();
        let rebuilt = layers.reconstruct(&[]).unwrap();
        for (a, b) in rebuilt.iter().zip(image.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
    }
}
