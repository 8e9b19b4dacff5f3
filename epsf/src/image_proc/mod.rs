//! Image processing for ePSF preparation
//!
//! This module holds the numeric core of the pipeline: robust statistics,
//! the starlet wavelet transform, background flattening ahead of detection,
//! and the cropping and decimation that turn engine output back into
//! canonical star-size images.

pub mod background;
pub mod cutout;
pub mod decimate;
pub mod image;
pub mod stats;
pub mod wavelet;

// Re-export key functionality for easier access
pub use background::{layer_count, BackgroundConfig, BackgroundFlattener};
pub use cutout::{CutoutReconstructor, StarRecord};
pub use decimate::{block_average, ModelDecimator};
pub use image::{center_crop, normalize_min_max, Sample};
pub use stats::{mad, median, RobustStretch, ScreenTransfer};
pub use wavelet::{StarletTransform, WaveletLayers};
