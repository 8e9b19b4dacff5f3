//! End-to-end runs against an in-process engine that answers through the
//! scratch directory exactly like an external program would.

use approx::assert_relative_eq;
use epsf::engine::interchange::{star_file_name, MODEL_FILE, STAR_LIST_FILE};
use epsf::io::{read_image_fits, write_image_fits};
use epsf::{
    AbortFlag, EngineJob, EpsfPipeline, InterchangeError, PipelineConfig, PipelineError, Stage,
    StarEngine,
};
use ndarray::{s, Array2};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;
use test_helpers::{gaussian_stamp, output_path, StarField};

const STAR_SIZE: usize = 15;
const STARS: [(f64, f64); 3] = [(40.0, 45.0), (100.0, 60.0), (70.0, 120.0)];

#[derive(Debug, Clone, Copy, PartialEq)]
enum Reply {
    Good,
    MalformedLine,
    NoStars,
    UndersizedStar,
    CenterOffFrame,
}

/// Extracts windows around known star positions from the request frame.
struct ScriptedEngine {
    stars: Vec<(f64, f64)>,
    reply: Reply,
    calls: usize,
    abort_during_run: Option<AbortFlag>,
    last_job: Option<EngineJob>,
}

impl ScriptedEngine {
    fn new(reply: Reply) -> Self {
        Self {
            stars: STARS.to_vec(),
            reply,
            calls: 0,
            abort_during_run: None,
            last_job: None,
        }
    }
}

impl StarEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn run(&mut self, job: &EngineJob) -> Result<(), InterchangeError> {
        self.calls += 1;
        self.last_job = Some(job.clone());
        if let Some(flag) = &self.abort_during_run {
            flag.abort();
        }

        let request: Array2<f64> = read_image_fits(&job.request)?;
        let extract = job.params.extract_size;
        let half = (extract / 2) as i64;

        let mut lines = String::new();
        if self.reply != Reply::NoStars {
            for (index, &(cx, cy)) in self.stars.iter().enumerate() {
                let ox = cx.round() as i64 - half;
                let oy = cy.round() as i64 - half;
                let size = if self.reply == Reply::UndersizedStar && index == 1 {
                    STAR_SIZE - 2
                } else {
                    extract
                };
                let window = request
                    .slice(s![oy as usize..oy as usize + size, ox as usize..ox as usize + size])
                    .to_owned();
                write_image_fits(job.output_dir.join(star_file_name(index)), window.view(), "STAR")?;

                let flux: f64 = window.sum();
                lines.push_str(&format!("{ox} {oy} {cx} {cy} {flux}\n"));
            }
        }
        if self.reply == Reply::MalformedLine {
            lines.push_str("12 14 oops 3 1\n");
        }
        if self.reply == Reply::CenterOffFrame {
            let window = request.slice(s![0..extract, 0..extract]).to_owned();
            let index = self.stars.len();
            write_image_fits(job.output_dir.join(star_file_name(index)), window.view(), "STAR")?;
            lines.push_str("0 0 1e19 5 1\n");
        }
        fs::write(job.output_dir.join(STAR_LIST_FILE), lines).map_err(|source| {
            InterchangeError::Io {
                path: job.output_dir.join(STAR_LIST_FILE),
                source,
            }
        })?;

        let model = gaussian_stamp(STAR_SIZE * job.params.oversampling + 5, 1.0, 3.0);
        write_image_fits(job.output_dir.join(MODEL_FILE), model.view(), "EPSF")?;
        Ok(())
    }
}

fn field() -> Array2<f64> {
    STARS
        .iter()
        .fold(
            StarField::new(160, 160).with_background(0.1, 0.0004, 0.0002),
            |field, &(x, y)| field.with_star(x, y, 0.5, 1.5),
        )
        .with_noise(0.001, 11)
        .render()
}

fn config() -> PipelineConfig {
    PipelineConfig {
        star_size: STAR_SIZE,
        max_stars: 10,
        oversampling: 2,
        ..Default::default()
    }
}

#[test]
fn test_full_run_produces_three_outputs() {
    let source = field();
    let mut pipeline = EpsfPipeline::<f64, _>::new(config(), ScriptedEngine::new(Reply::Good)).unwrap();
    let outputs = pipeline.run(source.view()).unwrap();

    let job = pipeline.engine().last_job.clone().unwrap();
    assert_eq!(job.params.extract_size, 23); // round(15 * 1.5)
    assert_eq!(job.params.brightest_limit, 30);
    assert!(job.request.ends_with("tmp.fits"));
    // Temporary scratch is gone after the run
    assert!(!job.output_dir.exists());
    assert!(outputs.kept_scratch.is_none());

    assert_eq!(outputs.stars.len(), 3);
    for (star, &(cx, cy)) in outputs.stars.iter().zip(STARS.iter()) {
        assert_eq!(star.image.dim(), (STAR_SIZE, STAR_SIZE));
        assert_eq!(star.center, (cx, cy));
        // Star sits in the middle of its canonical cutout
        let (peak, _) = star
            .image
            .indexed_iter()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap();
        assert_eq!(peak, (7, 7));
    }

    // Three cutouts: 2 columns, 2 rows, last cell empty
    assert_eq!(outputs.mosaic.image.dim(), (30, 30));
    assert!(outputs
        .mosaic
        .image
        .slice(s![15..30, 15..30])
        .iter()
        .all(|&v| v == 0.0));

    let model = &outputs.model.image;
    assert_eq!(model.dim(), (STAR_SIZE, STAR_SIZE));
    let min = model.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = model.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    assert_eq!(min, 0.0);
    assert_eq!(max, 1.0);
    assert_eq!(model[[7, 7]], 1.0);

    // Overlay drawn on the source frame, not the flattened one
    let detection = &outputs.detection.image;
    assert_eq!(detection.dim(), source.dim());
    assert_eq!(detection[[38, 33]], 1.0);
    assert_eq!(detection[[52, 47]], 1.0);
    assert_eq!(detection[[45, 40]], source[[45, 40]]);
    assert_eq!(detection[[10, 10]], source[[10, 10]]);

    assert!(outputs.detection.stretch.sigma > 0.0);
    assert_relative_eq!(
        outputs.detection.stretch.center,
        epsf::image_proc::median(source.view()).unwrap(),
        epsilon = 1e-3
    );
}

#[test]
fn test_single_precision_run() {
    let source: Array2<f32> = field().mapv(|v| v as f32);
    let mut pipeline = EpsfPipeline::<f32, _>::new(config(), ScriptedEngine::new(Reply::Good)).unwrap();
    let outputs = pipeline.run(source.view()).unwrap();
    assert_eq!(outputs.stars.len(), 3);
    assert_eq!(outputs.model.image.dim(), (STAR_SIZE, STAR_SIZE));
}

#[test]
fn test_outputs_written_to_disk() {
    let source = field();
    let mut pipeline = EpsfPipeline::<f64, _>::new(config(), ScriptedEngine::new(Reply::Good)).unwrap();
    let outputs = pipeline.run(source.view()).unwrap();

    let dir = TempDir::new().unwrap();
    let fits = outputs.write_fits(dir.path(), "frame").unwrap();
    let names: Vec<String> = fits
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        [
            "frame_star_detection.fits",
            "frame_extracted_stars.fits",
            "frame_ePSF.fits"
        ]
    );

    let model: Array2<f64> = read_image_fits(&fits[2]).unwrap();
    assert_eq!(model.dim(), (STAR_SIZE, STAR_SIZE));
    let mosaic: Array2<f64> = read_image_fits(&fits[1]).unwrap();
    assert_eq!(mosaic, outputs.mosaic.image);

    let previews = outputs.write_previews(dir.path().join("png"), "frame").unwrap();
    assert_eq!(previews.len(), 3);
    assert!(previews.iter().all(|p| p.exists()));

    // Kept under test_output/ for inspection
    outputs
        .write_previews(output_path("previews"), "synthetic_field")
        .unwrap();
}

#[test]
fn test_abort_before_start_never_calls_engine() {
    let mut pipeline = EpsfPipeline::<f64, _>::new(config(), ScriptedEngine::new(Reply::Good)).unwrap();
    pipeline.abort_flag().abort();

    let err = pipeline.run(field().view()).unwrap_err();
    assert!(matches!(err, PipelineError::Aborted(Stage::BackgroundFlattening)));
    assert_eq!(pipeline.engine().calls, 0);
}

#[test]
fn test_abort_during_engine_stops_before_reconstruction() {
    let abort = AbortFlag::new();
    let mut engine = ScriptedEngine::new(Reply::Good);
    engine.abort_during_run = Some(abort.clone());

    let mut pipeline = EpsfPipeline::<f64, _>::new(config(), engine)
        .unwrap()
        .with_abort_flag(abort.clone());
    let err = pipeline.run(field().view()).unwrap_err();

    assert!(matches!(err, PipelineError::Aborted(Stage::CutoutReconstruction)));
    let job = pipeline.engine().last_job.clone().unwrap();
    assert!(!job.output_dir.exists());

    // Clearing the flag makes the same pipeline usable again
    abort.reset();
    pipeline.engine_mut().abort_during_run = None;
    assert!(pipeline.run(field().view()).is_ok());
    assert_eq!(pipeline.engine().calls, 2);
}

#[test]
fn test_malformed_star_line_aborts_run() {
    let mut pipeline =
        EpsfPipeline::<f64, _>::new(config(), ScriptedEngine::new(Reply::MalformedLine)).unwrap();
    let err = pipeline.run(field().view()).unwrap_err();

    match err {
        PipelineError::Interchange {
            stage: Stage::EngineResponse,
            source: InterchangeError::MalformedLine { line, content, .. },
        } => {
            assert_eq!(line, 4);
            assert_eq!(content, "12 14 oops 3 1");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn test_center_outside_frame_is_an_interchange_error() {
    let mut pipeline =
        EpsfPipeline::<f64, _>::new(config(), ScriptedEngine::new(Reply::CenterOffFrame)).unwrap();
    let err = pipeline.run(field().view()).unwrap_err();

    match err {
        PipelineError::Interchange {
            stage: Stage::EngineResponse,
            source: InterchangeError::CenterOutsideFrame { line, width, height, .. },
        } => {
            assert_eq!(line, 4);
            assert_eq!((width, height), (160, 160));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn test_no_stars_is_an_interchange_error() {
    let mut pipeline = EpsfPipeline::<f64, _>::new(config(), ScriptedEngine::new(Reply::NoStars)).unwrap();
    let err = pipeline.run(field().view()).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Interchange {
            source: InterchangeError::NoStars,
            ..
        }
    ));
}

#[test]
fn test_undersized_star_image_is_rejected() {
    let mut pipeline =
        EpsfPipeline::<f64, _>::new(config(), ScriptedEngine::new(Reply::UndersizedStar)).unwrap();
    let err = pipeline.run(field().view()).unwrap_err();
    match err {
        PipelineError::Interchange {
            stage: Stage::EngineResponse,
            source: InterchangeError::Undersized { path, required, .. },
        } => {
            assert!(path.ends_with("star1.fits"));
            assert_eq!(required, STAR_SIZE);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn test_constant_frame_is_degenerate_before_engine() {
    let source = Array2::from_elem((64, 64), 0.2f64);
    let mut pipeline = EpsfPipeline::<f64, _>::new(config(), ScriptedEngine::new(Reply::Good)).unwrap();
    let err = pipeline.run(source.view()).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::DegenerateImage {
            stage: Stage::BackgroundFlattening,
            ..
        }
    ));
    assert_eq!(pipeline.engine().calls, 0);
}

#[test]
fn test_persistent_scratch_dir_is_cleaned_and_kept() {
    let dir = TempDir::new().unwrap();
    let scratch: PathBuf = dir.path().join("scratch");
    fs::create_dir_all(&scratch).unwrap();
    fs::write(scratch.join("star7.fits"), b"stale").unwrap();

    let config = PipelineConfig {
        scratch_dir: Some(scratch.clone()),
        ..config()
    };
    let mut pipeline = EpsfPipeline::<f64, _>::new(config, ScriptedEngine::new(Reply::Good)).unwrap();
    let outputs = pipeline.run(field().view()).unwrap();

    assert_eq!(outputs.kept_scratch.as_deref(), Some(scratch.as_path()));
    assert!(!scratch.join("star7.fits").exists());
    assert!(scratch.join("star2.fits").exists());
    assert!(scratch.join("tmp.fits").exists());
}

#[test]
fn test_invalid_config_rejected_up_front() {
    let config = PipelineConfig {
        oversampling: 5,
        ..config()
    };
    let err = EpsfPipeline::<f64, _>::new(config, ScriptedEngine::new(Reply::Good))
        .err()
        .unwrap();
    assert_eq!(err.stage(), Stage::Validation);
}
