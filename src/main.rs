//! Dual fisheye to equirectangular converter
//!
//! Converts a front/back fisheye pair, or a numbered sequence of pairs, into
//! equirectangular images, and optionally searches for lens parameters that
//! align the two lenses along their seams.
//!
//! Usage:
//! ```bash
//! # One pair, images named in the parameter file
//! dualfish2sphere -w 4096 -a 2 -b 6 rig.txt
//!
//! # Calibration search over 2000 trials
//! dualfish2sphere -b 6 -e 2000 -p 10 20 5 -f front.jpg back.jpg rig.txt
//!
//! # Frame sequence through a cached lookup table
//! dualfish2sphere --sequence front_%04d.jpg back_%04d.jpg --first 1 --last 300 \
//!   -o sphere_%04d.jpg rig.txt
//! ```

use clap::Parser;
use dualfish_sphere::compositor::{stitch_sequence, stitch_single, Sequence};
use dualfish_sphere::config::Settings;
use dualfish_sphere::frame::SequenceName;
use dualfish_sphere::optimization::optimize_seams;
use flexi_logger::{colored_detailed_format, detailed_format, Duplicate, FileSpec, Logger};
use log::info;
use std::path::PathBuf;

/// Dual fisheye to equirectangular converter
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Lens parameter file with one block per lens
    params: PathBuf,

    /// YAML settings file, overridden by the flags below
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output width in pixels, rounded down to a multiple of 4
    #[arg(short = 'w', long)]
    width: Option<u32>,

    /// Antialiasing factor
    #[arg(short = 'a', long)]
    antialias: Option<u32>,

    /// Full width of each blend zone, in degrees
    #[arg(short = 'b', long)]
    blend_width: Option<f64>,

    /// Exponent of the blend S-curve
    #[arg(short = 'q', long)]
    blend_power: Option<f64>,

    /// Angle between the two seams, in degrees
    #[arg(short = 'm', long)]
    blend_mid: Option<f64>,

    /// Number of calibration trials, more than 1 runs the search
    #[arg(short = 'e', long)]
    trials: Option<usize>,

    /// Perturbation ranges of the search: fov (degrees), center (pixels), theta (degrees)
    #[arg(short = 'p', long, num_args = 3, value_names = ["DFOV", "DCENTER", "DTHETA"])]
    perturb: Option<Vec<f64>>,

    /// Seed of the calibration search
    #[arg(long)]
    seed: Option<u64>,

    /// Apply the radial intensity correction
    #[arg(short = 'i', long)]
    intensity: bool,

    /// Debug logging and seam guides in the output
    #[arg(short = 'd', long)]
    debug: bool,

    /// Front and back images, overriding the parameter file
    #[arg(short = 'f', long, num_args = 2, value_names = ["FRONT", "BACK"])]
    images: Option<Vec<PathBuf>>,

    /// Output image, or output name template in sequence mode
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Front and back frame name templates with one %d field
    #[arg(long, num_args = 2, value_names = ["FRONT", "BACK"])]
    sequence: Option<Vec<String>>,

    /// First frame of the sequence
    #[arg(long, default_value_t = 0)]
    first: u32,

    /// Last frame of the sequence
    #[arg(long, default_value_t = 0)]
    last: u32,

    /// Directory of the lookup table caches
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

impl Cli {
    fn settings(&self) -> Result<Settings, Box<dyn std::error::Error>> {
        let mut settings = match &self.config {
            Some(path) => Settings::load_from_yaml(path)?,
            None => Settings::default(),
        };

        if let Some(width) = self.width {
            settings.output_width = width;
        }
        if let Some(antialias) = self.antialias {
            settings.antialias = antialias.max(1);
        }
        if let Some(width) = self.blend_width {
            settings.blend_width_degrees = width.max(0.0);
        }
        if let Some(power) = self.blend_power {
            settings.blend_power = power;
        }
        if let Some(mid) = self.blend_mid {
            settings.blend_mid_degrees = mid;
        }
        if let Some(trials) = self.trials {
            settings.optimizer.trials = trials;
        }
        if let Some(perturb) = &self.perturb {
            settings.optimizer.delta_fov_degrees = perturb[0];
            settings.optimizer.delta_center = perturb[1];
            settings.optimizer.delta_theta_degrees = perturb[2];
        }
        if self.seed.is_some() {
            settings.optimizer.seed = self.seed;
        }
        if self.intensity {
            settings.intensity_correction = true;
        }
        if self.debug {
            settings.draw_seam_guides = true;
        }
        if let Some(dir) = &self.cache_dir {
            settings.cache_dir = dir.clone();
        }

        settings.validate()?;
        Ok(settings)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logger, debug level when requested
    Logger::try_with_str(if cli.debug { "debug" } else { "info" })?
        .log_to_file(
            FileSpec::default()
                .directory("logs")
                .suppress_timestamp()
                .suffix("log"),
        )
        .duplicate_to_stdout(Duplicate::All)
        .format_for_files(detailed_format)
        .format_for_stdout(colored_detailed_format)
        // Format: "error;warn;info;debug;trace"
        .set_palette("196;208;76;39;178".to_string())
        .start()?;

    let settings = cli.settings()?;
    info!("Parameter file: {:?}", cli.params);

    let images: Option<[PathBuf; 2]> = match &cli.images {
        Some(paths) => Some(
            paths
                .clone()
                .try_into()
                .map_err(|_| "expected two fisheye images")?,
        ),
        None => None,
    };

    if let Some(names) = &cli.sequence {
        let output = cli
            .output
            .as_ref()
            .ok_or("sequence mode needs an output name template (-o)")?;
        let sequence = Sequence {
            front: SequenceName::parse(&names[0])?,
            back: SequenceName::parse(&names[1])?,
            output: SequenceName::parse(&output.display().to_string())?,
            first: cli.first,
            last: cli.last,
        };
        let summary = stitch_sequence(&settings, &cli.params, &sequence)?;
        println!(
            "Converted {} frames, skipped {:?}",
            summary.written.len(),
            summary.skipped
        );
    } else if settings.optimizer.trials > 1 {
        let report = optimize_seams(&settings, &cli.params, images.as_ref())?;
        println!("\n=== OPTIMISATION RESULTS ===");
        println!("Trials: {}", report.trials);
        println!("Seed: {}", report.seed);
        println!("Improvements: {}", report.accepted.len());
        if let Some(best) = report.accepted.last() {
            println!("Best error: {:.3} (trial {})", best.error, best.trial);
            println!("Parameters: {}", best.params_file.display());
        }
        println!("============================");
    } else {
        let path = stitch_single(
            &settings,
            &cli.params,
            images.as_ref(),
            cli.output.as_deref(),
        )?;
        println!("Wrote {}", path.display());
    }

    Ok(())
}
