//! Visualization outputs of a pipeline run.
//!
//! Three images leave the pipeline: the source frame with a hollow square
//! drawn around every accepted star, a tiled mosaic of the canonical
//! cutouts, and the canonical PSF model. Each travels as a [`DisplayImage`]
//! carrying its own [`RobustStretch`] so a viewer can auto-stretch it; the
//! sample data itself is never stretched.

use crate::errors::{PipelineError, Result, Stage};
use crate::image_proc::cutout::StarRecord;
use crate::image_proc::image::{array2_to_gray_image, Sample};
use crate::image_proc::stats::{RobustStretch, ScreenTransfer};
use image::GrayImage;
use log::debug;
use ndarray::{s, Array2, ArrayView2};

/// Sample value of detection outline pixels.
pub const OUTLINE_VALUE: f64 = 1.0;

/// Copy of `source` with a `star_size` hollow square around each star.
///
/// The square's top-left corner is `rounded_center - star_size / 2`; the
/// outline is clipped to the frame, so stars near the edge get partial
/// squares. Interior pixels keep their source values.
pub fn detection_overlay<T: Sample>(
    source: ArrayView2<T>,
    records: &[StarRecord<T>],
    star_size: usize,
) -> Result<Array2<T>> {
    if star_size == 0 {
        return Err(PipelineError::invalid(
            Stage::DetectionOverlay,
            "star size must be positive",
        ));
    }

    let mut overlay = source.to_owned();
    let (height, width) = overlay.dim();
    let outline = T::from_f64_lossy(OUTLINE_VALUE);
    let size = i64::try_from(star_size).unwrap_or(i64::MAX);

    // Clip a span to `0..len`, `None` when nothing of it is visible.
    let clip = |lo: i64, hi: i64, len: usize| -> Option<(usize, usize)> {
        let last = len as i64 - 1;
        (len > 0 && hi >= 0 && lo <= last).then(|| (lo.max(0) as usize, hi.min(last) as usize))
    };
    let visible = |v: i64, len: usize| (0..len as i64).contains(&v);

    for record in records {
        let (cx, cy) = record.rounded_center();
        let x0 = cx.saturating_sub(size / 2);
        let y0 = cy.saturating_sub(size / 2);
        let x1 = x0.saturating_add(size - 1);
        let y1 = y0.saturating_add(size - 1);

        if let Some((xa, xb)) = clip(x0, x1, width) {
            for y in [y0, y1].into_iter().filter(|&y| visible(y, height)) {
                overlay.slice_mut(s![y as usize, xa..=xb]).fill(outline);
            }
        }
        if let Some((ya, yb)) = clip(y0, y1, height) {
            for x in [x0, x1].into_iter().filter(|&x| visible(x, width)) {
                overlay.slice_mut(s![ya..=yb, x as usize]).fill(outline);
            }
        }
    }

    debug!("Drew {} detection outlines", records.len());
    Ok(overlay)
}

/// Grid geometry of a cutout mosaic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MosaicLayout {
    pub columns: usize,
    pub rows: usize,
    pub cell_size: usize,
}

impl MosaicLayout {
    /// `columns = max(2, round(sqrt(count)))`, `rows = ceil(count / columns)`.
    pub fn for_count(count: usize, cell_size: usize) -> Result<Self> {
        if count == 0 || cell_size == 0 {
            return Err(PipelineError::invalid(
                Stage::Mosaic,
                format!("cannot lay out {count} cutouts of size {cell_size}"),
            ));
        }

        let columns = ((count as f64).sqrt().round() as usize).max(2);
        let rows = count.div_ceil(columns);
        Ok(Self {
            columns,
            rows,
            cell_size,
        })
    }

    /// `(row, column)` of cutout `index`.
    pub fn cell_position(&self, index: usize) -> (usize, usize) {
        (index / self.columns, index % self.columns)
    }

    /// Canvas `(height, width)`.
    pub fn canvas_dim(&self) -> (usize, usize) {
        (self.rows * self.cell_size, self.columns * self.cell_size)
    }

    pub fn capacity(&self) -> usize {
        self.rows * self.columns
    }
}

/// Tile `cutouts` row-major into a zero-filled canvas.
pub fn compose_mosaic<T: Sample>(cutouts: &[Array2<T>], star_size: usize) -> Result<Array2<T>> {
    let layout = MosaicLayout::for_count(cutouts.len(), star_size)?;
    let mut canvas = Array2::zeros(layout.canvas_dim());

    for (index, cutout) in cutouts.iter().enumerate() {
        if cutout.dim() != (star_size, star_size) {
            let (height, width) = cutout.dim();
            return Err(PipelineError::invalid(
                Stage::Mosaic,
                format!("cutout {index} is {width}x{height}, expected {star_size}x{star_size}"),
            ));
        }
        let (row, col) = layout.cell_position(index);
        let y = row * star_size;
        let x = col * star_size;
        canvas
            .slice_mut(s![y..y + star_size, x..x + star_size])
            .assign(cutout);
    }

    debug!(
        "Mosaic of {} cutouts on a {}x{} grid",
        cutouts.len(),
        layout.columns,
        layout.rows
    );
    Ok(canvas)
}

/// Render `image` to 8 bits through a screen transfer function.
pub fn render_preview<T: Sample>(image: ArrayView2<T>, transfer: &ScreenTransfer) -> GrayImage {
    let bytes = image.mapv(|v| (transfer.apply(v.as_f64()) * 255.0).round() as u8);
    array2_to_gray_image(&bytes)
}

/// An output image together with its auto-stretch parameters.
#[derive(Debug, Clone)]
pub struct DisplayImage<T: Sample> {
    pub image: Array2<T>,
    pub stretch: RobustStretch,
}

impl<T: Sample> DisplayImage<T> {
    pub fn new(image: Array2<T>) -> Result<Self> {
        let stretch = RobustStretch::from_image(image.view())?;
        Ok(Self { image, stretch })
    }

    /// `(width, height)`
    pub fn size(&self) -> (usize, usize) {
        let (height, width) = self.image.dim();
        (width, height)
    }

    pub fn preview(&self) -> GrayImage {
        render_preview(self.image.view(), &self.stretch.screen_transfer())
    }
}
