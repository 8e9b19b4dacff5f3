//! Star engine running as a separate program.

use super::{EngineJob, StarEngine};
use crate::errors::InterchangeError;
use log::{debug, info, warn};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Runs an external program once per job.
///
/// The command line is
///
/// ```text
/// <program> [extra args..] --input <tmp.fits> --output-dir <scratch> --fwhm <v> ...
/// ```
///
/// with one `--<parameter> <value>` pair per [`EngineParams`](super::EngineParams)
/// field. A zero exit status means the response files are in place.
#[derive(Debug, Clone)]
pub struct ExternalEngine {
    program: PathBuf,
    extra_args: Vec<OsString>,
    name: String,
}

impl ExternalEngine {
    pub fn new<P: AsRef<Path>>(program: P) -> Self {
        let program = program.as_ref().to_path_buf();
        let name = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string());
        Self {
            program,
            extra_args: Vec::new(),
            name,
        }
    }

    /// Arguments placed before the generated ones, e.g. a script path for an
    /// interpreter.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Full command for `job`, without running it.
    pub fn command(&self, job: &EngineJob) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.extra_args)
            .arg("--input")
            .arg(&job.request)
            .arg("--output-dir")
            .arg(&job.output_dir)
            .args(job.params.to_args());
        cmd
    }

    fn failed(&self, reason: impl Into<String>) -> InterchangeError {
        InterchangeError::EngineFailed {
            engine: self.name.clone(),
            reason: reason.into(),
        }
    }
}

impl StarEngine for ExternalEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, job: &EngineJob) -> Result<(), InterchangeError> {
        let mut cmd = self.command(job);
        info!("Running star engine {}", self.name);
        debug!("Command: {cmd:?}");

        let output = cmd
            .output()
            .map_err(|e| self.failed(format!("cannot start {}: {e}", self.program.display())))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(self.failed(format!("{}: {}", output.status, stderr.trim())));
        }
        if !stderr.trim().is_empty() {
            warn!("{} stderr: {}", self.name, stderr.trim());
        }
        debug!("{} stdout: {}", self.name, String::from_utf8_lossy(&output.stdout).trim());
        Ok(())
    }
}
