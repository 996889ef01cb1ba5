//! Implements the equidistant fisheye lens model.
//!
//! This module provides the [`EquidistantModel`] struct, the lens model of one
//! half of a dual fisheye rig. It adheres to the [`CameraModel`] trait defined
//! in the parent `camera` module ([`crate::camera`]). The equidistant model maps
//! the angle between a ray and the optical axis linearly to the distance from
//! the lens center on the sensor, reaching `radius` pixels at half the field of
//! view.

use crate::camera::{CameraModel, CameraModelError, Resolution, Rotation, SourcePixel};
use crate::params::{LensParams, RotationParam};
use nalgebra::{Vector2, Vector3};
use std::f64::consts::PI;
use std::fmt;

/// A finalized equidistant fisheye lens.
///
/// Instances are built once from a [`LensParams`] record with
/// [`EquidistantModel::from_params`], which converts the full field of view in
/// degrees into a half angle in radians, defaults the center and radius, and
/// moves the center to a bottom-left origin. After that the model is only read;
/// the calibration search works on mutated clones.
#[derive(Clone, PartialEq)]
pub struct EquidistantModel {
    /// Half field of view in radians.
    pub fov: f64,
    /// Radius of the fisheye circle in pixels.
    pub radius: f64,
    /// Lens center in pixels, origin at the bottom-left corner.
    pub center: Vector2<f64>,
    /// `-1` when the source image is mirrored horizontally about the center.
    pub hflip: i8,
    /// `-1` when the source image is mirrored vertically about the center.
    pub vflip: i8,
    /// Correction rotations, applied to incoming rays in order.
    pub rotations: Vec<Rotation>,
    pub resolution: Resolution,
}

impl EquidistantModel {
    /// Finalizes a parameter record against the size of its source frames.
    ///
    /// # Arguments
    ///
    /// * `params` - The lens block read from a parameter file. Its center uses
    ///   the top-left origin of the file format.
    /// * `resolution` - Size of the decoded source frames of this lens.
    ///
    /// # Errors
    ///
    /// Returns a [`CameraModelError`] when the resulting geometry is invalid,
    /// see [`CameraModel::validate_params`].
    pub fn from_params(
        params: &LensParams,
        resolution: Resolution,
    ) -> Result<Self, CameraModelError> {
        let width = resolution.width as f64;
        let height = resolution.height as f64;

        let (cx, cy) = params
            .center
            .unwrap_or(((width / 2.0).floor(), (height / 2.0).floor()));
        let radius = params.radius.unwrap_or((height / 2.0).floor());

        let model = EquidistantModel {
            fov: (params.fov_degrees / 2.0).to_radians(),
            radius,
            center: Vector2::new(cx, height - 1.0 - cy),
            hflip: params.hflip,
            vflip: params.vflip,
            rotations: params
                .rotations
                .iter()
                .map(|r| Rotation::from_degrees(r.axis, r.degrees))
                .collect(),
            resolution,
        };

        model.validate_params()?;
        Ok(model)
    }

    /// Converts the model back into a replay-ready parameter record, with the
    /// center in the top-left origin of the file format.
    pub fn to_params(&self, image: Option<String>) -> LensParams {
        LensParams {
            image,
            radius: Some(self.radius),
            center: Some((self.center.x, self.file_center_y())),
            fov_degrees: (self.fov * 2.0).to_degrees(),
            hflip: self.hflip,
            vflip: self.vflip,
            rotations: self
                .rotations
                .iter()
                .map(|r| RotationParam {
                    axis: r.axis,
                    degrees: r.angle.to_degrees(),
                })
                .collect(),
        }
    }

    /// Center row in the top-left origin used by parameter files.
    pub fn file_center_y(&self) -> f64 {
        self.resolution.height as f64 - 1.0 - self.center.y
    }
}

impl fmt::Debug for EquidistantModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EquidistantModel [ fov: {:.3} deg, radius: {}, center: ({}, {}), flip: ({}, {}), rotations: {:?}, resolution: {}x{} ]",
            (self.fov * 2.0).to_degrees(),
            self.radius,
            self.center.x,
            self.file_center_y(),
            self.hflip,
            self.vflip,
            self.rotations
                .iter()
                .map(|r| format!("{} {:.2}", r.axis, r.angle.to_degrees()))
                .collect::<Vec<_>>(),
            self.resolution.width,
            self.resolution.height
        )
    }
}

impl CameraModel for EquidistantModel {
    /// Projects a ray onto the source image.
    ///
    /// The ray is rotated by each correction rotation in order, then mapped with
    /// `theta = atan2(z, x)`, `phi = atan2(hypot(x, z), y)` and
    /// `r = phi / fov` to `u = cx + radius * r * cos(theta)`,
    /// `v = cy + radius * r * sin(theta)`. Coordinates outside
    /// `[0, width) x [0, height)` are a miss; they are never clamped.
    fn project(&self, ray: &Vector3<f64>) -> Option<SourcePixel> {
        let (uv, radius) = self.project_continuous(ray);

        // Written so that NaN also falls through as a miss.
        if !(uv.x >= 0.0 && uv.x < self.resolution.width as f64) {
            return None;
        }
        if !(uv.y >= 0.0 && uv.y < self.resolution.height as f64) {
            return None;
        }

        Some(SourcePixel {
            u: uv.x as u32,
            v: uv.y as u32,
            radius,
        })
    }

    fn project_continuous(&self, ray: &Vector3<f64>) -> (Vector2<f64>, f64) {
        let p = self
            .rotations
            .iter()
            .fold(*ray, |p, rotation| rotation.apply(&p));

        let theta = p.z.atan2(p.x);
        let phi = p.x.hypot(p.z).atan2(p.y);
        let r = phi / self.fov;

        let uv = Vector2::new(
            self.center.x + self.radius * r * theta.cos(),
            self.center.y + self.radius * r * theta.sin(),
        );
        (uv, r)
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        if !(self.fov > 0.0 && self.fov <= PI) {
            return Err(CameraModelError::FieldOfViewOutOfRange(
                (self.fov * 2.0).to_degrees(),
            ));
        }
        if !(self.radius > 0.0) {
            return Err(CameraModelError::RadiusMustBePositive(self.radius));
        }
        if !self.center.x.is_finite() || !self.center.y.is_finite() {
            return Err(CameraModelError::CenterMustBeFinite);
        }
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(CameraModelError::EmptyResolution);
        }
        if self.hflip.abs() != 1 || self.vflip.abs() != 1 {
            return Err(CameraModelError::InvalidParams(
                "flip factors must be 1 or -1".to_string(),
            ));
        }
        Ok(())
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }
}
