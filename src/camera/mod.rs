//! Lens geometry for dual fisheye rigs.
//!
//! This module defines the [`CameraModel`] trait implemented by the lens models
//! of the crate, the shared [`CameraModelError`] type, the source [`Resolution`]
//! and the tagged [`Rotation`] operations applied to incoming rays before they
//! are projected onto the sensor.
//!
//! Rays use the shared spherical frame of the output image: `y` points along the
//! optical axis of the front lens, `x` to the right and `z` up.

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod equidistant;
pub mod rig;

pub use equidistant::EquidistantModel;
pub use rig::Rig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum CameraModelError {
    #[error("Field of view must be in (0, 360] degrees, got {0}")]
    FieldOfViewOutOfRange(f64),
    #[error("Fisheye radius must be positive, got {0}")]
    RadiusMustBePositive(f64),
    #[error("Lens center must be finite")]
    CenterMustBeFinite,
    #[error("Source resolution must be non-zero")]
    EmptyResolution,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
}

/// Axis of a single lens correction rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// Rotation about the x axis.
    Tilt,
    /// Rotation about the y axis.
    Roll,
    /// Rotation about the z axis.
    Pan,
}

impl Axis {
    /// Parameter file keyword for this axis.
    pub fn keyword(&self) -> &'static str {
        match self {
            Axis::Tilt => "ROTATEX",
            Axis::Roll => "ROTATEY",
            Axis::Pan => "ROTATEZ",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Tilt => write!(f, "tilt"),
            Axis::Roll => write!(f, "roll"),
            Axis::Pan => write!(f, "pan"),
        }
    }
}

/// A rotation about one lens axis, with its matrix precomputed.
///
/// Rotations of a lens are applied in sequence order and do not commute, so a
/// lens stores them as an ordered `Vec<Rotation>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Rotation {
    pub axis: Axis,
    /// Angle in radians.
    pub angle: f64,
    matrix: Matrix3<f64>,
}

impl Rotation {
    pub fn new(axis: Axis, angle: f64) -> Self {
        let (s, c) = angle.sin_cos();
        let matrix = match axis {
            Axis::Tilt => Matrix3::new(
                1.0, 0.0, 0.0, //
                0.0, c, s, //
                0.0, -s, c,
            ),
            Axis::Roll => Matrix3::new(
                c, 0.0, s, //
                0.0, 1.0, 0.0, //
                -s, 0.0, c,
            ),
            Axis::Pan => Matrix3::new(
                c, s, 0.0, //
                -s, c, 0.0, //
                0.0, 0.0, 1.0,
            ),
        };
        Rotation {
            axis,
            angle,
            matrix,
        }
    }

    pub fn from_degrees(axis: Axis, degrees: f64) -> Self {
        Self::new(axis, degrees.to_radians())
    }

    pub fn apply(&self, ray: &Vector3<f64>) -> Vector3<f64> {
        self.matrix * ray
    }
}

/// Integer pixel hit on a source lens image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourcePixel {
    /// Column, counted from the left edge.
    pub u: u32,
    /// Row, counted from the bottom edge.
    pub v: u32,
    /// Angular distance from the optical axis normalised by the half field of
    /// view; 1.0 at the rim of the lens circle.
    pub radius: f64,
}

impl SourcePixel {
    /// Flattened row-major index of this pixel in a buffer of the given width.
    pub fn index(&self, width: u32) -> usize {
        self.v as usize * width as usize + self.u as usize
    }
}

/// Trait defining the core functionality for fisheye lens models
pub trait CameraModel {
    /// Project a unit ray of the shared spherical frame onto the source image.
    ///
    /// Returns `None` when the ray lands outside the source image. A miss is an
    /// expected per-sample outcome, not an error.
    fn project(&self, ray: &Vector3<f64>) -> Option<SourcePixel>;

    /// Continuous image coordinate of the ray, before bounds checking.
    fn project_continuous(&self, ray: &Vector3<f64>) -> (Vector2<f64>, f64);

    /// Validate camera parameters
    fn validate_params(&self) -> Result<(), CameraModelError>;

    fn get_resolution(&self) -> Resolution;
}

/// Ray of the shared spherical frame for a latitude/longitude pair.
pub fn spherical_ray(latitude: f64, longitude: f64) -> Vector3<f64> {
    let (sin_lat, cos_lat) = latitude.sin_cos();
    let (sin_lon, cos_lon) = longitude.sin_cos();
    Vector3::new(cos_lat * sin_lon, cos_lat * cos_lon, sin_lat)
}
