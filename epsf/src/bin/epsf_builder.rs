//! Build an empirical PSF from a single-channel FITS frame
//!
//! Flattens the frame's background, hands it to an external star engine,
//! and writes the detection overlay, cutout mosaic and canonical ePSF model.
//!
//! # Usage
//!
//! ```bash
//! # Defaults, engine implemented as a Python script
//! cargo run --release --bin epsf_builder -- frame.fits \
//!     --engine python3 --engine-arg scripts/epsf_engine.py
//!
//! # Smaller stars, four-times oversampled model, PNG previews
//! cargo run --release --bin epsf_builder -- frame.fits --engine ./engine \
//!     --star-size 21 --oversampling 4 --previews -o out/
//!
//! # Parameters from JSON, single precision, keep the scratch files
//! RUST_LOG=debug cargo run --release --bin epsf_builder -- frame.fits \
//!     --engine ./engine --config epsf.json --precision f32 --keep-scratch
//! ```
//!
//! Outputs are `<stem>_star_detection.fits`, `<stem>_extracted_stars.fits`
//! and `<stem>_ePSF.fits`, where `<stem>` defaults to the input file stem.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use epsf::io::read_image_fits;
use epsf::{EpsfPipeline, ExternalEngine, PipelineConfig, Sample, SmoothingKernel};
use log::info;
use ndarray::Array2;
use std::path::{Path, PathBuf};

/// Sample precision the pipeline runs at.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Precision {
    /// 32-bit IEEE floating point
    F32,
    /// 64-bit IEEE floating point
    F64,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input FITS frame (first 2-D image HDU is used)
    input: PathBuf,

    /// Star engine program
    #[arg(long)]
    engine: PathBuf,

    /// Extra argument passed to the engine before the generated ones (repeatable)
    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    engine_args: Vec<String>,

    /// JSON configuration file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output directory
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Output file stem (defaults to the input file stem)
    #[arg(long)]
    stem: Option<String>,

    /// Processing precision
    #[arg(long, value_enum, default_value_t = Precision::F64)]
    precision: Precision,

    /// Also write auto-stretched PNG previews
    #[arg(long)]
    previews: bool,

    /// Maximum number of stars (10-500)
    #[arg(long)]
    max_stars: Option<usize>,

    /// Maximum star peak value (0.1-1)
    #[arg(long, conflicts_with = "no_peak_limit")]
    star_max_peak: Option<f64>,

    /// Accept stars of any peak value
    #[arg(long)]
    no_peak_limit: bool,

    /// Detection threshold (0-1)
    #[arg(long)]
    star_threshold: Option<f64>,

    /// Expected star FWHM in pixels (1-10)
    #[arg(long)]
    star_fwhm: Option<f64>,

    /// Canonical star size in pixels (5-100)
    #[arg(long)]
    star_size: Option<usize>,

    /// Model oversampling factor (1-4)
    #[arg(long)]
    oversampling: Option<usize>,

    /// Model smoothing kernel
    #[arg(long, value_enum)]
    smoothing_kernel: Option<SmoothingKernel>,

    /// Maximum model iterations (1-10)
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Engine scratch directory (a temporary one is used otherwise)
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Keep the scratch directory after the run
    #[arg(long)]
    keep_scratch: bool,
}

impl Args {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_json_file(path)?,
            None => PipelineConfig::default(),
        };

        if let Some(v) = self.max_stars {
            config.max_stars = v;
        }
        if let Some(v) = self.star_max_peak {
            config.star_max_peak = Some(v);
        }
        if self.no_peak_limit {
            config.star_max_peak = None;
        }
        if let Some(v) = self.star_threshold {
            config.star_threshold = v;
        }
        if let Some(v) = self.star_fwhm {
            config.star_fwhm = v;
        }
        if let Some(v) = self.star_size {
            config.star_size = v;
        }
        if let Some(v) = self.oversampling {
            config.oversampling = v;
        }
        if let Some(v) = self.smoothing_kernel {
            config.smoothing_kernel = v;
        }
        if let Some(v) = self.max_iterations {
            config.max_iterations = v;
        }
        if let Some(dir) = &self.scratch_dir {
            config.scratch_dir = Some(dir.clone());
        }
        config.keep_scratch |= self.keep_scratch;

        config.validate()?;
        Ok(config)
    }

    fn stem(&self) -> String {
        self.stem.clone().unwrap_or_else(|| {
            self.input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "epsf".to_string())
        })
    }
}

fn run<T: Sample>(args: &Args, config: PipelineConfig, engine: ExternalEngine) -> Result<()> {
    let frame: Array2<T> = read_image_fits(&args.input)
        .with_context(|| format!("Failed to read {}", args.input.display()))?;

    let mut pipeline = EpsfPipeline::<T, _>::new(config, engine)?;
    let outputs = pipeline.run(frame.view()).context("ePSF run failed")?;

    let stem = args.stem();
    let written = outputs
        .write_fits(&args.output_dir, &stem)
        .with_context(|| format!("Failed to write outputs to {}", args.output_dir.display()))?;
    if args.previews {
        outputs.write_previews(&args.output_dir, &stem)?;
    }

    for (label, output) in [
        ("detection", &outputs.detection),
        ("mosaic", &outputs.mosaic),
        ("ePSF", &outputs.model),
    ] {
        let (width, height) = output.size();
        info!(
            "{label}: {width}x{height}, median {:.5}, sigma {:.5}",
            output.stretch.center, output.stretch.sigma
        );
    }
    println!("{} stars used", outputs.stars.len());
    for path in &written {
        println!("{}", path.display());
    }
    if let Some(dir) = &outputs.kept_scratch {
        println!("scratch: {}", display_path(dir));
    }
    Ok(())
}

fn display_path(path: &Path) -> String {
    path.canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = args.pipeline_config()?;
    let engine = ExternalEngine::new(&args.engine).with_args(args.engine_args.iter());
    info!("Using star engine {}", args.engine.display());

    match args.precision {
        Precision::F32 => run::<f32>(&args, config, engine),
        Precision::F64 => run::<f64>(&args, config, engine),
    }
}
