//! Run settings.
//!
//! [`Settings`] gathers every knob of a stitching or calibration run in the
//! units users think in (degrees, full angles). It can be loaded from and saved
//! to YAML; missing keys take their defaults. The numerical core consumes the
//! derived [`BlendConfig`], which carries half angles in radians.

use crate::color::IntensityCorrection;
use crate::frame::FrameTemplate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    #[error("IO Error: {0}")]
    IOError(String),
    #[error("Invalid settings: {0}")]
    InvalidParams(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IOError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::YamlError(err.to_string())
    }
}

/// Perturbation ranges and budget of the calibration search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    /// Number of trials, the baseline included. `1` disables the search.
    pub trials: usize,
    /// Full range of the field of view perturbation, in degrees.
    pub delta_fov_degrees: f64,
    /// Maximum lens center displacement, in pixels.
    pub delta_center: f64,
    /// Maximum magnitude of each extra rotation, in degrees.
    pub delta_theta_degrees: f64,
    /// Seed of the random search; taken from the clock when unset.
    pub seed: Option<u64>,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        OptimizerSettings {
            trials: 1,
            delta_fov_degrees: 10.0,
            delta_center: 20.0,
            delta_theta_degrees: 5.0,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Output width in pixels, rounded down to a multiple of 4.
    pub output_width: u32,
    /// Side of the supersampling grid.
    pub antialias: u32,
    /// Full angle between the two seams, in degrees.
    pub blend_mid_degrees: f64,
    /// Full width of each blend zone, in degrees. `0` gives a hard seam.
    pub blend_width_degrees: f64,
    /// S-curve exponent of the cross-dissolve, applied when above 1.
    pub blend_power: f64,
    pub intensity_correction: bool,
    pub intensity_coefficients: [f64; 6],
    pub optimizer: OptimizerSettings,
    /// Directory holding lookup table caches.
    pub cache_dir: PathBuf,
    pub frame_templates: Vec<FrameTemplate>,
    /// Overlay the seam meridians and blend zone edges in red.
    pub draw_seam_guides: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            output_width: 4096,
            antialias: 2,
            blend_mid_degrees: 180.0,
            blend_width_degrees: 0.0,
            blend_power: 1.0,
            intensity_correction: false,
            intensity_coefficients: IntensityCorrection::default().ifcn,
            optimizer: OptimizerSettings::default(),
            cache_dir: PathBuf::from("."),
            frame_templates: FrameTemplate::defaults(),
            draw_seam_guides: false,
        }
    }
}

impl Settings {
    pub fn load_from_yaml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let settings: Settings = serde_yaml::from_str(&contents)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save_to_yaml(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_width < 4 {
            return Err(ConfigError::InvalidParams(format!(
                "output width must be at least 4, got {}",
                self.output_width
            )));
        }
        if !self.blend_mid_degrees.is_finite() || self.blend_mid_degrees <= 0.0 {
            return Err(ConfigError::InvalidParams(
                "blend mid angle must be positive".to_string(),
            ));
        }
        if !self.blend_width_degrees.is_finite() || !self.blend_power.is_finite() {
            return Err(ConfigError::InvalidParams(
                "blend width and power must be finite".to_string(),
            ));
        }
        Ok(())
    }

    /// Output size, width a multiple of 4 and height half the width.
    pub fn output_size(&self) -> (u32, u32) {
        let width = self.output_width / 4 * 4;
        (width, width / 2)
    }

    pub fn intensity(&self) -> Option<IntensityCorrection> {
        self.intensity_correction.then_some(IntensityCorrection {
            ifcn: self.intensity_coefficients,
        })
    }

    pub fn blend_config(&self) -> BlendConfig {
        let (output_width, output_height) = self.output_size();
        BlendConfig {
            blend_mid: (self.blend_mid_degrees / 2.0).to_radians(),
            blend_width: (self.blend_width_degrees.max(0.0) / 2.0).to_radians(),
            blend_power: self.blend_power,
            antialias: self.antialias.max(1),
            output_width,
            output_height,
            intensity: self.intensity(),
        }
    }
}

/// Seam geometry and sampling resolution of one pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlendConfig {
    /// Longitude of the seam center, in radians.
    pub blend_mid: f64,
    /// Half width of each blend zone, in radians.
    pub blend_width: f64,
    pub blend_power: f64,
    /// Side of the supersampling grid, at least 1.
    pub antialias: u32,
    pub output_width: u32,
    pub output_height: u32,
    pub intensity: Option<IntensityCorrection>,
}

impl BlendConfig {
    /// Half width forced on the blend zones when the calibration search runs
    /// without blending.
    pub const MIN_SEARCH_BLEND_WIDTH: f64 = 3.0 * std::f64::consts::PI / 180.0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.output_size(), (4096, 2048));
        let blend = settings.blend_config();
        assert_relative_eq!(blend.blend_mid, std::f64::consts::FRAC_PI_2);
        assert_eq!(blend.blend_width, 0.0);
        assert_eq!(blend.antialias, 2);
        assert!(blend.intensity.is_none());
    }

    #[test]
    fn test_output_width_rounds_to_multiple_of_four() {
        let settings = Settings {
            output_width: 1003,
            ..Settings::default()
        };
        assert_eq!(settings.output_size(), (1000, 500));
    }

    #[test]
    fn test_yaml_round_trip_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        fs::write(
            &path,
            "output_width: 1024\nblend_width_degrees: 6\noptimizer:\n  trials: 50\n  seed: 7\n",
        )
        .unwrap();

        let settings = Settings::load_from_yaml(&path).unwrap();
        assert_eq!(settings.output_width, 1024);
        assert_eq!(settings.optimizer.trials, 50);
        assert_eq!(settings.optimizer.seed, Some(7));
        assert_eq!(settings.optimizer.delta_center, 20.0);
        assert_relative_eq!(settings.blend_config().blend_width, 3f64.to_radians());

        let saved = dir.path().join("saved.yaml");
        settings.save_to_yaml(&saved).unwrap();
        assert_eq!(Settings::load_from_yaml(&saved).unwrap(), settings);
    }

    #[test]
    fn test_invalid_settings() {
        let settings = Settings {
            output_width: 2,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }
}
