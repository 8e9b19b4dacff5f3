//! FITS image I/O for the engine interchange and the pipeline outputs.
//!
//! Rows are stored in array order: FITS pixel `(x, y)` (0-based) is array
//! element `[[y, x]]`. No vertical flip is applied, so star coordinates the
//! engine reports against a request file index the source frame directly.

use crate::errors::InterchangeError;
use crate::image_proc::image::{convert_precision, Sample};
use fitsio::compat::fitsfile::FitsFile;
use fitsio::compat::images::{ImageDescription, ReadImage};
use log::debug;
use ndarray::{Array2, ArrayView2};
use std::path::Path;

fn fits_error(path: &Path, source: fitsio::compat::errors::Error) -> InterchangeError {
    InterchangeError::Fits {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `image` to a new file at `T`'s precision.
///
/// The primary HDU is left empty (`NAXIS = 0`); the pixels go to image
/// extension HDU 1 named `extname`. An existing file at `path` is replaced.
pub fn write_image_fits<T: Sample, P: AsRef<Path>>(
    path: P,
    image: ArrayView2<T>,
    extname: &str,
) -> Result<(), InterchangeError> {
    let path = path.as_ref();
    let (height, width) = image.dim();

    let mut fptr = FitsFile::create(path)
        .overwrite()
        .open()
        .map_err(|e| fits_error(path, e))?;

    let description = ImageDescription {
        data_type: T::IMAGE_TYPE,
        dimensions: vec![width, height],
    };
    let hdu = fptr
        .create_image(extname, &description)
        .map_err(|e| fits_error(path, e))?;

    let flat: Vec<T> = image.iter().copied().collect();
    T::write_hdu(&mut fptr, &hdu, &flat).map_err(|e| fits_error(path, e))?;
    hdu.write_key(&mut fptr, "EXTNAME", &extname.to_string())
        .map_err(|e| fits_error(path, e))?;

    debug!(
        "Wrote {width}x{height} {}-bit image to {}",
        T::BITS,
        path.display()
    );
    Ok(())
}

/// Read the first 2-D image HDU of `path`, converted to precision `T`.
///
/// # Errors
/// * `MissingFile` - `path` does not exist
/// * `NoImage` - no HDU has `NAXIS == 2`
/// * `BadShape` - the data length disagrees with `NAXIS1 x NAXIS2`
pub fn read_image_fits<T: Sample, P: AsRef<Path>>(path: P) -> Result<Array2<T>, InterchangeError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(InterchangeError::MissingFile(path.to_path_buf()));
    }

    let fptr = FitsFile::open(path).map_err(|e| fits_error(path, e))?;

    let mut hdu_idx = 0;
    while let Ok(hdu) = fptr.hdu(hdu_idx) {
        hdu_idx += 1;

        let naxis = hdu.read_key::<i64>(&fptr, "NAXIS").unwrap_or(0);
        if naxis != 2 {
            continue;
        }

        let width = hdu.read_key::<i64>(&fptr, "NAXIS1").unwrap_or(0).max(0) as usize;
        let height = hdu.read_key::<i64>(&fptr, "NAXIS2").unwrap_or(0).max(0) as usize;
        let data = f64::read_image(&fptr, &hdu).map_err(|e| fits_error(path, e))?;

        let image = Array2::from_shape_vec((height, width), data).map_err(|_| {
            InterchangeError::BadShape {
                path: path.to_path_buf(),
                width,
                height,
            }
        })?;

        debug!(
            "Read {width}x{height} image from HDU {} of {}",
            hdu_idx - 1,
            path.display()
        );
        return Ok(convert_precision(image.view()));
    }

    Err(InterchangeError::NoImage(path.to_path_buf()))
}
