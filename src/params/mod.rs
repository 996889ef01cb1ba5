//! Lens parameter records.
//!
//! A parameter file holds one block of `KEY: value` lines per lens, each block
//! opened by an `IMAGE:` line:
//!
//! ```text
//! # front lens
//! IMAGE: front.jpg
//! RADIUS: 1430
//! CENTER: 1525 1520
//! FOV: 190
//! ROTATEX: 0.5
//! ROTATEZ: -1.2
//! ```
//!
//! Lines starting with `#`, unknown keys and malformed values are ignored.
//! Rotations are kept in file order. Exactly two blocks are required.

use crate::camera::Axis;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum ParamsError {
    #[error("Failed to read parameter file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to write parameter file {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("Expected two fisheye lens blocks, found {0}")]
    WrongLensCount(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RotationParam {
    pub axis: Axis,
    pub degrees: f64,
}

/// Parameters of one lens as written in a parameter file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LensParams {
    pub image: Option<String>,
    /// Fisheye circle radius in pixels, half the frame height when unset.
    pub radius: Option<f64>,
    /// Lens center with a top-left origin, the frame center when unset.
    pub center: Option<(f64, f64)>,
    /// Full field of view in degrees.
    pub fov_degrees: f64,
    pub hflip: i8,
    pub vflip: i8,
    pub rotations: Vec<RotationParam>,
}

impl Default for LensParams {
    fn default() -> Self {
        LensParams {
            image: None,
            radius: None,
            center: None,
            fov_degrees: 180.0,
            hflip: 1,
            vflip: 1,
            rotations: Vec::new(),
        }
    }
}

/// The two lens blocks of a dual fisheye parameter file, front first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigParams {
    pub lenses: [LensParams; 2],
}

fn parse_number(value: Option<&str>) -> Option<f64> {
    value?.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_flip(value: Option<&str>) -> Option<i8> {
    parse_number(value).map(|v| if v < 0.0 { -1 } else { 1 })
}

impl LensParams {
    fn apply_line(&mut self, key: &str, mut values: std::str::SplitWhitespace<'_>) {
        match key {
            "IMAGE" => self.image = values.next().map(str::to_string),
            "RADIUS" => {
                if let Some(radius) = parse_number(values.next()) {
                    self.radius = (radius >= 0.0).then_some(radius);
                }
            }
            "CENTER" => {
                if let (Some(x), Some(y)) =
                    (parse_number(values.next()), parse_number(values.next()))
                {
                    self.center = (x >= 0.0 && y >= 0.0).then_some((x, y));
                }
            }
            "FOV" | "APERTURE" => {
                if let Some(fov) = parse_number(values.next()) {
                    self.fov_degrees = fov;
                }
            }
            "HFLIP" => {
                if let Some(flip) = parse_flip(values.next()) {
                    self.hflip = flip;
                }
            }
            "VFLIP" => {
                if let Some(flip) = parse_flip(values.next()) {
                    self.vflip = flip;
                }
            }
            "ROTATEX" | "ROTATEY" | "ROTATEZ" => {
                let axis = match key {
                    "ROTATEX" => Axis::Tilt,
                    "ROTATEY" => Axis::Roll,
                    _ => Axis::Pan,
                };
                if let Some(degrees) = parse_number(values.next()) {
                    self.rotations.push(RotationParam { axis, degrees });
                }
            }
            _ => {}
        }
    }

    fn write_block(&self, out: &mut String, index: usize, baseline: Option<&LensParams>) {
        let _ = writeln!(out, "# image {index}");
        let _ = writeln!(out, "IMAGE: {}", self.image.as_deref().unwrap_or("-"));
        if let Some(radius) = self.radius {
            let _ = writeln!(out, "RADIUS: {radius}");
        }
        if let Some((x, y)) = self.center {
            let _ = writeln!(out, "CENTER: {x} {y}");
            if let Some((bx, by)) = baseline.and_then(|b| b.center) {
                let _ = writeln!(out, "# Was: {bx} {by}");
            }
        }
        let _ = writeln!(out, "FOV: {:.4}", self.fov_degrees);
        if let Some(b) = baseline {
            let _ = writeln!(out, "# Was: {:.4}", b.fov_degrees);
        }
        if self.hflip < 0 {
            let _ = writeln!(out, "HFLIP: -1");
        }
        if self.vflip < 0 {
            let _ = writeln!(out, "VFLIP: -1");
        }
        for rotation in &self.rotations {
            let _ = writeln!(out, "{}: {:.4}", rotation.axis.keyword(), rotation.degrees);
        }
    }
}

impl RigParams {
    /// Parses the text of a parameter file.
    pub fn parse(text: &str) -> Result<Self, ParamsError> {
        let mut lenses: Vec<LensParams> = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut tokens = line.split_whitespace();
            let Some(key) = tokens.next().and_then(|t| t.strip_suffix(':')) else {
                continue;
            };
            if key == "IMAGE" {
                lenses.push(LensParams::default());
            }
            if let Some(lens) = lenses.last_mut() {
                lens.apply_line(key, tokens);
            }
        }

        let count = lenses.len();
        let lenses: [LensParams; 2] = lenses
            .try_into()
            .map_err(|_| ParamsError::WrongLensCount(count))?;
        Ok(RigParams { lenses })
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ParamsError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ParamsError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Renders the record in the parameter file vocabulary.
    ///
    /// `header` lines are written as leading comments. When `baseline` is given,
    /// each lens block carries `# Was:` comments with the baseline center and
    /// field of view.
    pub fn to_text(&self, header: &[String], baseline: Option<&RigParams>) -> String {
        let mut out = String::new();
        for line in header {
            let _ = writeln!(out, "# {line}");
        }
        if !header.is_empty() {
            out.push('\n');
        }
        for (index, lens) in self.lenses.iter().enumerate() {
            lens.write_block(&mut out, index, baseline.map(|b| &b.lenses[index]));
        }
        out
    }

    pub fn save_to_file(
        &self,
        path: impl AsRef<Path>,
        header: &[String],
        baseline: Option<&RigParams>,
    ) -> Result<(), ParamsError> {
        let path = path.as_ref();
        fs::write(path, self.to_text(header, baseline)).map_err(|source| ParamsError::Write {
            path: path.display().to_string(),
            source,
        })
    }
}
