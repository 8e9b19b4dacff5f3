//! Scratch-directory file protocol shared with the star engine.
//!
//! ```text
//! <scratch>/
//! ├── tmp.fits        # request: flattened frame at working precision
//! ├── stars.txt       # response: "origin_x origin_y center_x center_y flux" per star
//! ├── star0.fits      # response: extraction window of line 0
//! ├── star1.fits      # ...
//! └── epsf.fits       # response: oversampled PSF model
//! ```
//!
//! A response is validated in full before anything is handed on: every line
//! must hold five finite numbers with the center inside the request frame,
//! every listed star image must exist and be at least `star_size` on both
//! axes, and so must the model.
//!
//! Every FITS file is written with an empty primary HDU; the image sits in
//! HDU 1 (`tmp.fits` carries `EXTNAME = 'FLATTENED'`). Response files are
//! read from their first 2-D HDU, so engines may write either the primary
//! HDU or an image extension.

use crate::errors::InterchangeError;
use crate::image_proc::cutout::StarRecord;
use crate::image_proc::image::Sample;
use crate::io::fits::{read_image_fits, write_image_fits};
use log::{debug, info};
use ndarray::{Array2, ArrayView2};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const REQUEST_FILE: &str = "tmp.fits";
pub const STAR_LIST_FILE: &str = "stars.txt";
pub const MODEL_FILE: &str = "epsf.fits";

/// File name of the image for star list line `index`.
pub fn star_file_name(index: usize) -> String {
    format!("star{index}.fits")
}

fn io_error(path: &Path, source: std::io::Error) -> InterchangeError {
    InterchangeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One parsed line of the star list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StarLine {
    /// 1-based line number in the star list
    pub line: usize,
    pub origin: (i64, i64),
    pub center: (f64, f64),
    pub flux: f64,
}

/// Parse `origin_x origin_y center_x center_y flux`.
///
/// `line` is 1-based and only used for error messages. Origins are written
/// as integers by well-behaved engines; fractional origins are rounded.
pub fn parse_star_line(path: &Path, line: usize, content: &str) -> Result<StarLine, InterchangeError> {
    let malformed = || InterchangeError::MalformedLine {
        path: path.to_path_buf(),
        line,
        content: content.to_string(),
    };

    let values = content
        .split_whitespace()
        .map(|field| field.parse::<f64>().ok().filter(|v| v.is_finite()))
        .collect::<Option<Vec<f64>>>()
        .ok_or_else(malformed)?;

    match values.as_slice() {
        &[ox, oy, cx, cy, flux] => Ok(StarLine {
            line,
            origin: (ox.round() as i64, oy.round() as i64),
            center: (cx, cy),
            flux,
        }),
        _ => Err(malformed()),
    }
}

/// Parse a whole star list. Blank lines are skipped.
pub fn parse_star_list(path: &Path, text: &str) -> Result<Vec<StarLine>, InterchangeError> {
    text.lines()
        .enumerate()
        .filter(|(_, content)| !content.trim().is_empty())
        .map(|(idx, content)| parse_star_line(path, idx + 1, content))
        .collect()
}

/// Everything the engine returned for one run.
#[derive(Debug, Clone)]
pub struct EngineResponse<T: Sample> {
    pub stars: Vec<StarRecord<T>>,
    /// Oversampled PSF model as written by the engine
    pub model: Array2<T>,
}

fn check_size<T>(path: &Path, image: &Array2<T>, required: usize) -> Result<(), InterchangeError> {
    let (height, width) = image.dim();
    if width < required || height < required {
        return Err(InterchangeError::Undersized {
            path: path.to_path_buf(),
            width,
            height,
            required,
        });
    }
    Ok(())
}

fn check_center(path: &Path, star: &StarLine, frame_dim: (usize, usize)) -> Result<(), InterchangeError> {
    let (height, width) = frame_dim;
    let (x, y) = star.center;
    let inside = |v: f64, len: usize| (0.0..len as f64).contains(&v.round());
    if !inside(x, width) || !inside(y, height) {
        return Err(InterchangeError::CenterOutsideFrame {
            path: path.to_path_buf(),
            line: star.line,
            x,
            y,
            width,
            height,
        });
    }
    Ok(())
}

/// Working directory of one engine exchange.
///
/// Either a caller-supplied directory, which is left in place, or a fresh
/// temporary directory removed when the `ScratchDir` is dropped.
#[derive(Debug)]
pub struct ScratchDir {
    root: PathBuf,
    temp: Option<TempDir>,
}

impl ScratchDir {
    /// Fresh directory under the system temp location.
    pub fn temporary() -> Result<Self, InterchangeError> {
        let temp = tempfile::Builder::new()
            .prefix("epsf-")
            .tempdir()
            .map_err(|e| io_error(&std::env::temp_dir(), e))?;
        Ok(Self {
            root: temp.path().to_path_buf(),
            temp: Some(temp),
        })
    }

    /// Use `path`, creating it if needed.
    pub fn at<P: AsRef<Path>>(path: P) -> Result<Self, InterchangeError> {
        let root = path.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| io_error(&root, e))?;
        Ok(Self { root, temp: None })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }

    /// Give up automatic removal and return the directory path.
    pub fn keep(self) -> PathBuf {
        match self.temp {
            Some(temp) => temp.keep(),
            None => self.root,
        }
    }

    pub fn request_path(&self) -> PathBuf {
        self.root.join(REQUEST_FILE)
    }

    pub fn star_list_path(&self) -> PathBuf {
        self.root.join(STAR_LIST_FILE)
    }

    pub fn star_path(&self, index: usize) -> PathBuf {
        self.root.join(star_file_name(index))
    }

    pub fn model_path(&self) -> PathBuf {
        self.root.join(MODEL_FILE)
    }

    /// Delete response files left over from an earlier run so they can never
    /// be mistaken for the current response.
    pub fn clear_response(&self) -> Result<(), InterchangeError> {
        let entries = fs::read_dir(&self.root).map_err(|e| io_error(&self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&self.root, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let is_star_image = name
                .strip_prefix("star")
                .and_then(|rest| rest.strip_suffix(".fits"))
                .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()));

            if is_star_image || name == STAR_LIST_FILE || name == MODEL_FILE {
                let path = entry.path();
                fs::remove_file(&path).map_err(|e| io_error(&path, e))?;
                debug!("Removed stale response file {}", path.display());
            }
        }
        Ok(())
    }

    /// Write the request frame and return its path.
    pub fn write_request<T: Sample>(&self, image: ArrayView2<T>) -> Result<PathBuf, InterchangeError> {
        let path = self.request_path();
        write_image_fits(&path, image, "FLATTENED")?;
        Ok(path)
    }

    /// Read and validate the engine's response.
    ///
    /// # Errors
    /// * `MissingFile` - star list, a star image or the model is absent
    /// * `MalformedLine` - a star list line is not five finite numbers
    /// * `Undersized` - a star image or the model is smaller than `star_size`
    /// * `CenterOutsideFrame` - a rounded star center is not a pixel of the
    ///   `(height, width)` request frame
    /// * `NoStars` - the star list is empty
    pub fn read_response<T: Sample>(
        &self,
        star_size: usize,
        frame_dim: (usize, usize),
    ) -> Result<EngineResponse<T>, InterchangeError> {
        let list_path = self.star_list_path();
        if !list_path.exists() {
            return Err(InterchangeError::MissingFile(list_path));
        }
        let text = fs::read_to_string(&list_path).map_err(|e| io_error(&list_path, e))?;
        let lines = parse_star_list(&list_path, &text)?;
        if lines.is_empty() {
            return Err(InterchangeError::NoStars);
        }
        for line in &lines {
            check_center(&list_path, line, frame_dim)?;
        }

        let stars = lines
            .into_iter()
            .enumerate()
            .map(|(index, line)| {
                let path = self.star_path(index);
                let image = read_image_fits::<T, _>(&path)?;
                check_size(&path, &image, star_size)?;
                Ok(StarRecord {
                    origin: line.origin,
                    center: line.center,
                    flux: line.flux,
                    image,
                })
            })
            .collect::<Result<Vec<_>, InterchangeError>>()?;

        let model_path = self.model_path();
        let model = read_image_fits::<T, _>(&model_path)?;
        check_size(&model_path, &model, star_size)?;

        let (model_height, model_width) = model.dim();
        info!(
            "Engine returned {} stars and a {}x{} model",
            stars.len(),
            model_width,
            model_height
        );
        Ok(EngineResponse { stars, model })
    }
}
