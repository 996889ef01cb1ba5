//! The `optimization` module calibrates the lenses of a rig against its seams.
//!
//! [`SeamOptimizer`] runs a random local search. Trial 0 renders the rig as
//! configured; every later trial starts again from that baseline and draws
//!
//! 1. a field of view offset in `[-delta_fov / 2, delta_fov / 2)` per lens,
//! 2. a center displacement of up to `delta_center` pixels in a random
//!    direction per lens,
//! 3. three extra rotations of the front lens, about all three axes in one of
//!    the six possible orders, each of at most `delta_theta`.
//!
//! The back lens keeps its configured rotations and serves as the reference
//! frame. Each trial only renders the seam blend zones and is scored by
//! [`SeamError`]. A trial that beats the best error so far is saved as a
//! replay-ready parameter file plus the rendered seam strip; other trials leave
//! no artifact. There is no convergence test, the search runs for the whole
//! trial budget.

use crate::camera::{Axis, CameraModel, EquidistantModel, Rig, Rotation};
use crate::compositor::{render_direct, Region, StitchError, StitchInputs};
use crate::config::{BlendConfig, OptimizerSettings, Settings};
use crate::frame::{save_image, EquirectImage, FrameError};
use crate::params::{ParamsError, RigParams};
use crate::sampler::{SeamError, LENS_COUNT};
use log::{debug, info, warn};
use nalgebra::Vector2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum OptimizationError {
    #[error(transparent)]
    Stitch(#[from] StitchError),
    #[error(transparent)]
    Params(#[from] ParamsError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Failed to write trial log {path}: {source}")]
    TrialLog { path: String, source: csv::Error },
    #[error("Failed to write report {path}: {source}")]
    Report {
        path: String,
        source: serde_json::Error,
    },
    #[error("IO Error for {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("The calibration search needs at least 2 trials, got {0}")]
    TooFewTrials(usize),
}

/// The six orders in which the three extra rotations can be applied.
pub const ROTATION_ORDERS: [[Axis; 3]; 6] = [
    [Axis::Tilt, Axis::Roll, Axis::Pan],
    [Axis::Tilt, Axis::Pan, Axis::Roll],
    [Axis::Roll, Axis::Pan, Axis::Tilt],
    [Axis::Roll, Axis::Tilt, Axis::Pan],
    [Axis::Pan, Axis::Tilt, Axis::Roll],
    [Axis::Pan, Axis::Roll, Axis::Tilt],
];

/// Perturbation ranges of one trial, angles in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Perturbation {
    /// Full range of the half field of view offset.
    pub delta_fov: f64,
    /// Maximum center displacement in pixels.
    pub delta_center: f64,
    /// Maximum magnitude of each extra rotation.
    pub delta_theta: f64,
}

impl From<&OptimizerSettings> for Perturbation {
    fn from(settings: &OptimizerSettings) -> Self {
        Perturbation {
            delta_fov: settings.delta_fov_degrees.to_radians(),
            delta_center: settings.delta_center,
            delta_theta: settings.delta_theta_degrees.to_radians(),
        }
    }
}

/// Draws a new field of view and center for `baseline`.
///
/// The displaced center is rounded to whole pixels.
pub fn perturb_lens<R: Rng>(
    baseline: &EquidistantModel,
    perturbation: &Perturbation,
    rng: &mut R,
) -> EquidistantModel {
    let mut lens = baseline.clone();
    lens.fov = baseline.fov + (rng.random::<f64>() - 0.5) * perturbation.delta_fov;
    let r = rng.random::<f64>() * perturbation.delta_center;
    let theta = rng.random::<f64>() * TAU;
    lens.center = Vector2::new(
        (baseline.center.x + r * theta.cos()).round(),
        (baseline.center.y + r * theta.sin()).round(),
    );
    lens
}

/// Three rotations about distinct axes, in a random order.
pub fn random_rotations<R: Rng>(perturbation: &Perturbation, rng: &mut R) -> [Rotation; 3] {
    let order = ROTATION_ORDERS[rng.random_range(0..ROTATION_ORDERS.len())];
    order.map(|axis| {
        let angle = 2.0 * (rng.random::<f64>() - 0.5) * perturbation.delta_theta;
        Rotation::new(axis, angle)
    })
}

/// Outcome of one trial.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub trial: usize,
    /// Per-pixel seam error; NaN when the trial could not be scored.
    pub error: f64,
    pub accepted: bool,
}

/// A trial that improved on every earlier one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedTrial {
    pub trial: usize,
    pub error: f64,
    pub params_file: PathBuf,
    pub image_file: PathBuf,
}

/// Summary of a finished search, written as `<base>_report.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub seed: u64,
    pub trials: usize,
    pub best_error: Option<f64>,
    pub accepted: Vec<AcceptedTrial>,
    pub params: RigParams,
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

pub struct SeamOptimizer {
    inputs: StitchInputs,
    blend: BlendConfig,
    search: OptimizerSettings,
    perturbation: Perturbation,
    base: PathBuf,
    seed: u64,
    rng: StdRng,
    best_error: f64,
    best: Rig,
    history: Vec<TrialRecord>,
    accepted: Vec<AcceptedTrial>,
    out: EquirectImage,
}

impl SeamOptimizer {
    /// Prepares a search over the lenses of `inputs`.
    ///
    /// # Arguments
    ///
    /// * `inputs` - Parameter record, finalized rig and mirrored frame pair.
    /// * `settings` - Blend geometry and the [`OptimizerSettings`] of the run.
    /// * `base` - Path prefix of the artifacts, usually the parameter file
    ///   without its extension.
    ///
    /// # Errors
    ///
    /// Fails with [`OptimizationError::TooFewTrials`] when the budget leaves no
    /// room for a perturbed trial.
    pub fn new(
        inputs: StitchInputs,
        settings: &Settings,
        base: impl Into<PathBuf>,
    ) -> Result<Self, OptimizationError> {
        let search = settings.optimizer.clone();
        if search.trials < 2 {
            return Err(OptimizationError::TooFewTrials(search.trials));
        }

        let mut blend = settings.blend_config();
        if blend.blend_width <= 0.0 {
            warn!(
                "Blending is required for optimisation, using a blend width of {} degrees",
                (2.0 * BlendConfig::MIN_SEARCH_BLEND_WIDTH).to_degrees()
            );
            blend.blend_width = BlendConfig::MIN_SEARCH_BLEND_WIDTH;
        }

        let seed = search.seed.unwrap_or_else(|| rand::rng().random());
        info!("Random search seed: {seed}");

        Ok(SeamOptimizer {
            best: inputs.rig.clone(),
            out: EquirectImage::new(blend.output_width, blend.output_height),
            perturbation: Perturbation::from(&search),
            rng: StdRng::seed_from_u64(seed),
            inputs,
            blend,
            search,
            base: base.into(),
            seed,
            best_error: f64::INFINITY,
            history: Vec::new(),
            accepted: Vec::new(),
        })
    }

    pub fn blend(&self) -> &BlendConfig {
        &self.blend
    }

    pub fn best_error(&self) -> f64 {
        self.best_error
    }

    pub fn best_rig(&self) -> &Rig {
        &self.best
    }

    pub fn history(&self) -> &[TrialRecord] {
        &self.history
    }

    pub fn accepted(&self) -> &[AcceptedTrial] {
        &self.accepted
    }

    /// Lens models of trial `trial`: the baseline for trial 0, a fresh
    /// perturbation of the baseline otherwise.
    pub fn trial_lenses(&mut self, trial: usize) -> [EquidistantModel; LENS_COUNT] {
        let baseline = &self.inputs.rig.lenses;
        if trial == 0 {
            return baseline.clone();
        }
        let mut lenses = [
            perturb_lens(&baseline[0], &self.perturbation, &mut self.rng),
            perturb_lens(&baseline[1], &self.perturbation, &mut self.rng),
        ];
        lenses[0]
            .rotations
            .extend(random_rotations(&self.perturbation, &mut self.rng));
        lenses
    }

    fn header(&self, trial: usize, error: f64) -> Vec<String> {
        vec![
            format!("Optimisation step {} of {}", trial, self.search.trials),
            format!("Error: {error}"),
            format!("delta fov: {} degrees", self.search.delta_fov_degrees),
            format!("delta center: {} pixels", self.search.delta_center),
            format!("delta theta: {} degrees", self.search.delta_theta_degrees),
            format!(
                "blend width: {} degrees",
                (2.0 * self.blend.blend_width).to_degrees()
            ),
        ]
    }

    fn save_accepted(
        &mut self,
        trial: usize,
        error: f64,
        rig: &Rig,
    ) -> Result<(), OptimizationError> {
        let index = self.accepted.len();
        let params_file = with_suffix(&self.base, &format!("_{index:02}.txt"));
        let image_file = with_suffix(&self.base, &format!("_{index:02}.jpg"));

        let params = rig.to_params(&self.inputs.params);
        params.save_to_file(
            &params_file,
            &self.header(trial, error),
            Some(&self.inputs.params),
        )?;
        save_image(&self.out, &image_file)?;

        info!(
            "Optimisation step {:8} of {:8} Error: {:5.1} Saved to {}",
            trial,
            self.search.trials,
            error,
            params_file.display()
        );
        self.accepted.push(AcceptedTrial {
            trial,
            error,
            params_file,
            image_file,
        });
        Ok(())
    }

    /// Renders and scores one trial, saving it when it improves the best error.
    pub fn run_trial(&mut self, trial: usize) -> Result<TrialRecord, OptimizationError> {
        let lenses = self.trial_lenses(trial);
        if let Some(e) = lenses
            .iter()
            .map(|lens| lens.validate_params())
            .find_map(Result::err)
        {
            warn!("Trial {trial} skipped: {e}");
            return Ok(self.record(trial, f64::NAN, false));
        }

        self.out.clear();
        let error: SeamError = render_direct(
            &lenses,
            &self.inputs.images,
            &self.blend,
            Region::BlendZones,
            &mut self.out,
        );
        let error = error.value();
        debug!("Trial {trial}: error {error}");

        // A NaN error never compares lower.
        let accepted = error < self.best_error;
        if accepted {
            let rig = Rig { lenses };
            self.save_accepted(trial, error, &rig)?;
            self.best_error = error;
            self.best = rig;
        }
        Ok(self.record(trial, error, accepted))
    }

    fn record(&mut self, trial: usize, error: f64, accepted: bool) -> TrialRecord {
        let record = TrialRecord {
            trial,
            error,
            accepted,
        };
        self.history.push(record);
        record
    }

    /// Runs the whole trial budget, then writes the trial log and the report.
    pub fn optimize(&mut self) -> Result<OptimizationReport, OptimizationError> {
        let trials = self.search.trials;
        let progress_step = (trials / 100).max(1);
        info!(
            "Starting seam optimisation: {} trials, blend width {:.2} degrees",
            trials,
            (2.0 * self.blend.blend_width).to_degrees()
        );

        for trial in 0..trials {
            if trial % progress_step == 0 {
                info!("Optimisation step {trial:8} of {trials:8}");
            }
            self.run_trial(trial)?;
        }

        self.write_trial_log()?;
        let report = self.report();
        self.write_report(&report)?;
        info!(
            "Optimisation finished, {} improvements, best error {:?}",
            report.accepted.len(),
            report.best_error
        );
        Ok(report)
    }

    pub fn report(&self) -> OptimizationReport {
        OptimizationReport {
            seed: self.seed,
            trials: self.search.trials,
            best_error: self.best_error.is_finite().then_some(self.best_error),
            accepted: self.accepted.clone(),
            params: self.best.to_params(&self.inputs.params),
        }
    }

    fn write_trial_log(&self) -> Result<PathBuf, OptimizationError> {
        let path = with_suffix(&self.base, "_trials.csv");
        let csv_err = |source| OptimizationError::TrialLog {
            path: path.display().to_string(),
            source,
        };
        let mut writer = csv::Writer::from_path(&path).map_err(csv_err)?;
        for record in &self.history {
            writer.serialize(record).map_err(csv_err)?;
        }
        writer.flush().map_err(|source| OptimizationError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(path)
    }

    fn write_report(&self, report: &OptimizationReport) -> Result<PathBuf, OptimizationError> {
        let path = with_suffix(&self.base, "_report.json");
        let io_err = |source| OptimizationError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = File::create(&path).map_err(io_err)?;
        serde_json::to_writer_pretty(BufWriter::new(file), report).map_err(|source| {
            OptimizationError::Report {
                path: path.display().to_string(),
                source,
            }
        })?;
        Ok(path)
    }
}

/// Loads the inputs of a calibration run and searches for better lens
/// parameters.
pub fn optimize_seams(
    settings: &Settings,
    params_path: &Path,
    images: Option<&[PathBuf; LENS_COUNT]>,
) -> Result<OptimizationReport, OptimizationError> {
    let inputs = crate::compositor::load_inputs(params_path, images)?;
    let base = crate::compositor::base_name(params_path);
    let mut optimizer = SeamOptimizer::new(inputs, settings, base)?;
    optimizer.optimize()
}
