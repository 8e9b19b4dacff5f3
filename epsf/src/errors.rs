//! Error types for the ePSF preparation pipeline.
//!
//! Every failure is terminal for the current run. Errors carry the [`Stage`]
//! that raised them plus the offending dimensions or values so a caller can
//! diagnose a failed run from the message alone.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Validation,
    Statistics,
    WaveletTransform,
    BackgroundFlattening,
    EngineRequest,
    Engine,
    EngineResponse,
    CutoutReconstruction,
    ModelDecimation,
    DetectionOverlay,
    Mosaic,
    Output,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validation => "validation",
            Stage::Statistics => "robust statistics",
            Stage::WaveletTransform => "wavelet transform",
            Stage::BackgroundFlattening => "background flattening",
            Stage::EngineRequest => "engine request",
            Stage::Engine => "star engine",
            Stage::EngineResponse => "engine response",
            Stage::CutoutReconstruction => "cutout reconstruction",
            Stage::ModelDecimation => "model decimation",
            Stage::DetectionOverlay => "detection overlay",
            Stage::Mosaic => "mosaic composition",
            Stage::Output => "output",
        };
        f.write_str(name)
    }
}

/// Errors raised by the file-based exchange with the star engine.
#[derive(Error, Debug)]
pub enum InterchangeError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("FITS error on {path}: {source}")]
    Fits {
        path: PathBuf,
        #[source]
        source: fitsio::compat::errors::Error,
    },

    #[error("Cannot encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("No 2-D image HDU in {0}")]
    NoImage(PathBuf),

    #[error("Cannot reshape {width}x{height} image data in {path}")]
    BadShape {
        path: PathBuf,
        width: usize,
        height: usize,
    },

    #[error("Missing response file {0}")]
    MissingFile(PathBuf),

    #[error("Malformed line {line} in {path}: {content:?}")]
    MalformedLine {
        path: PathBuf,
        line: usize,
        content: String,
    },

    #[error("Line {line} in {path}: center ({x}, {y}) lies outside the {width}x{height} frame")]
    CenterOutsideFrame {
        path: PathBuf,
        line: usize,
        x: f64,
        y: f64,
        width: usize,
        height: usize,
    },

    #[error("Image {path} is {width}x{height}, smaller than the {required}x{required} star size")]
    Undersized {
        path: PathBuf,
        width: usize,
        height: usize,
        required: usize,
    },

    #[error("Engine returned no stars")]
    NoStars,

    #[error("Engine '{engine}' failed: {reason}")]
    EngineFailed { engine: String, reason: String },
}

/// Errors produced by any stage of the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid argument in {stage}: {reason}")]
    InvalidArgument { stage: Stage, reason: String },

    #[error("Degenerate image in {stage}: all samples equal {value}")]
    DegenerateImage { stage: Stage, value: f64 },

    #[error("Cutout too small in {stage}: {width}x{height} cannot hold a {required}x{required} window")]
    CutoutTooSmall {
        stage: Stage,
        width: usize,
        height: usize,
        required: usize,
    },

    #[error("Interchange error in {stage}: {source}")]
    Interchange {
        stage: Stage,
        #[source]
        source: InterchangeError,
    },

    #[error("Aborted before {0}")]
    Aborted(Stage),
}

impl PipelineError {
    pub fn invalid(stage: Stage, reason: impl Into<String>) -> Self {
        PipelineError::InvalidArgument {
            stage,
            reason: reason.into(),
        }
    }

    pub fn interchange(stage: Stage, source: InterchangeError) -> Self {
        PipelineError::Interchange { stage, source }
    }

    /// Stage the error was raised in.
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::InvalidArgument { stage, .. }
            | PipelineError::DegenerateImage { stage, .. }
            | PipelineError::CutoutTooSmall { stage, .. }
            | PipelineError::Interchange { stage, .. } => *stage,
            PipelineError::Aborted(stage) => *stage,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
