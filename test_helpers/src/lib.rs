//! Testing infrastructure for the ePSF preparation pipeline.
//!
//! Provides workspace-root discovery, a shared `test_output/` directory for
//! artifacts worth inspecting by eye (flattened frames, mosaics, previews),
//! and deterministic synthetic star fields built from Gaussian point sources
//! on top of sloped sky backgrounds.
//!
//! # Output Organization
//! ```text
//! test_output/
//! ├── flatten/          # Background-flattened frames
//! ├── mosaics/          # Cutout mosaics and detection overlays
//! └── previews/         # Auto-stretched PNG previews
//! ```
//!
//! # Usage
//! ```rust
//! use test_helpers::{output_path, StarField};
//!
//! let field = StarField::new(64, 48)
//!     .with_background(0.1, 0.002, 0.0)
//!     .with_star(20.0, 24.0, 0.8, 1.5);
//! let frame = field.render();
//! assert_eq!(frame.dim(), (48, 64));
//!
//! let path = output_path("flatten/example.fits");
//! assert!(path.ends_with("flatten/example.fits"));
//! ```

use ndarray::Array2;
use once_cell::sync::Lazy;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use std::env;
use std::path::{Path, PathBuf};

/// Error types for test infrastructure operations.
#[derive(thiserror::Error, Debug)]
pub enum TestHelperError {
    /// Project root directory could not be located or accessed.
    ///
    /// Occurs when tests run outside the workspace or the root Cargo.toml
    /// cannot be read.
    #[error("Failed to find project root: {0}")]
    ProjectRootNotFound(String),
}

/// Locate the workspace root by walking up from the current directory.
///
/// The root is the first ancestor whose Cargo.toml contains a `[workspace]`
/// section.
///
/// # Returns
/// * `Ok(PathBuf)` - Absolute path to workspace root directory
/// * `Err(TestHelperError)` - Traversal reached the filesystem root, or a
///   Cargo.toml could not be read
pub fn find_project_root() -> Result<PathBuf, TestHelperError> {
    let mut current_dir = env::current_dir().map_err(|e| {
        TestHelperError::ProjectRootNotFound(format!("Failed to get current directory: {e}"))
    })?;

    loop {
        let cargo_toml = current_dir.join("Cargo.toml");
        if cargo_toml.exists() {
            let content = std::fs::read_to_string(&cargo_toml).map_err(|e| {
                TestHelperError::ProjectRootNotFound(format!("Failed to read Cargo.toml: {e}"))
            })?;

            if content.contains("[workspace]") {
                return Ok(current_dir);
            }
        }

        if !current_dir.pop() {
            break;
        }
    }

    Err(TestHelperError::ProjectRootNotFound(
        "Workspace root not found".to_string(),
    ))
}

static PROJECT_ROOT: Lazy<PathBuf> =
    Lazy::new(|| find_project_root().expect("Failed to find project root directory"));

/// Get the test output directory, creating it when missing.
pub fn get_output_dir() -> PathBuf {
    let output_dir = PROJECT_ROOT.join("test_output");

    if !output_dir.exists() {
        std::fs::create_dir_all(&output_dir).expect("Failed to create output directory");
    }

    output_dir
}

/// Construct a path inside the test output directory.
///
/// Parent directories of `path` are created so the result can be written
/// immediately.
pub fn output_path<P: AsRef<Path>>(path: P) -> PathBuf {
    let full = get_output_dir().join(path);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create output subdirectory");
    }
    full
}

/// A single Gaussian point source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticStar {
    pub x: f64,
    pub y: f64,
    pub amplitude: f64,
    pub sigma: f64,
}

/// Builder for deterministic synthetic star fields.
///
/// The background is a plane `offset + slope_x * x + slope_y * y`; stars are
/// added on top and optional Gaussian read noise is seeded so every render is
/// reproducible.
#[derive(Debug, Clone)]
pub struct StarField {
    width: usize,
    height: usize,
    offset: f64,
    slope_x: f64,
    slope_y: f64,
    stars: Vec<SyntheticStar>,
    noise: Option<(f64, u64)>,
}

impl StarField {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            offset: 0.0,
            slope_x: 0.0,
            slope_y: 0.0,
            stars: Vec::new(),
            noise: None,
        }
    }

    pub fn with_background(mut self, offset: f64, slope_x: f64, slope_y: f64) -> Self {
        self.offset = offset;
        self.slope_x = slope_x;
        self.slope_y = slope_y;
        self
    }

    pub fn with_star(mut self, x: f64, y: f64, amplitude: f64, sigma: f64) -> Self {
        self.stars.push(SyntheticStar {
            x,
            y,
            amplitude,
            sigma,
        });
        self
    }

    pub fn with_noise(mut self, std_dev: f64, seed: u64) -> Self {
        self.noise = Some((std_dev, seed));
        self
    }

    pub fn stars(&self) -> &[SyntheticStar] {
        &self.stars
    }

    /// Render the field as a `(height, width)` array.
    pub fn render(&self) -> Array2<f64> {
        let mut frame = Array2::from_shape_fn((self.height, self.width), |(y, x)| {
            self.offset + self.slope_x * x as f64 + self.slope_y * y as f64
        });

        for star in &self.stars {
            add_gaussian(&mut frame, star);
        }

        if let Some((std_dev, seed)) = self.noise {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let normal = Normal::new(0.0, std_dev).expect("Invalid noise standard deviation");
            frame
                .iter_mut()
                .for_each(|pixel| *pixel += normal.sample(&mut rng));
        }

        frame
    }
}

/// Add a Gaussian PSF to `frame`, truncated at 5 sigma.
pub fn add_gaussian(frame: &mut Array2<f64>, star: &SyntheticStar) {
    let (height, width) = frame.dim();
    let radius = (5.0 * star.sigma).ceil();
    let x_min = (star.x - radius).max(0.0) as usize;
    let x_max = ((star.x + radius).max(0.0) as usize).min(width.saturating_sub(1));
    let y_min = (star.y - radius).max(0.0) as usize;
    let y_max = ((star.y + radius).max(0.0) as usize).min(height.saturating_sub(1));
    let sigma2 = star.sigma * star.sigma;

    for y in y_min..=y_max {
        for x in x_min..=x_max {
            let dx = x as f64 - star.x;
            let dy = y as f64 - star.y;
            frame[[y, x]] += star.amplitude * (-(dx * dx + dy * dy) / (2.0 * sigma2)).exp();
        }
    }
}

/// Render a centered Gaussian stamp, as returned by a star extraction step.
pub fn gaussian_stamp(size: usize, amplitude: f64, sigma: f64) -> Array2<f64> {
    let mut stamp = Array2::zeros((size, size));
    let center = (size as f64 - 1.0) / 2.0;
    add_gaussian(
        &mut stamp,
        &SyntheticStar {
            x: center,
            y: center,
            amplitude,
            sigma,
        },
    );
    stamp
}
