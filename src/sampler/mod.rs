//! Projection and sampling engine.
//!
//! For every output pixel of the equirectangular image this module computes the
//! base latitude/longitude, the cross-dissolve weight between the two lenses,
//! the blend zone membership, and the antialiased colour seen by each lens.
//!
//! Lens `0` looks along longitude `0`; lens `1` looks the other way and sees a
//! longitude advanced by `pi`. Each lens only owns the longitudes it can ever
//! contribute to, see [`lens_covers`], so rays outside that window are rejected
//! before any trigonometry is done.

use crate::camera::{spherical_ray, CameraModel, SourcePixel};
use crate::color::{Colour, IntensityCorrection};
use crate::config::BlendConfig;
use crate::frame::SourceImage;
use nalgebra::Vector3;
use std::f64::consts::{FRAC_PI_2, PI, TAU};

/// Number of lenses on a dual fisheye rig.
pub const LENS_COUNT: usize = 2;

/// Latitude of output row `j`, from `-pi/2` at row 0.
pub fn pixel_latitude(j: u32, height: u32) -> f64 {
    PI * j as f64 / height as f64 - FRAC_PI_2
}

/// Longitude of output column `i`, from `-pi` at column 0.
pub fn pixel_longitude(i: u32, width: u32) -> f64 {
    TAU * i as f64 / width as f64 - PI
}

/// Weight of lens 0 in the cross-dissolve at base longitude `longitude0`.
///
/// Inside a blend zone the weight falls linearly from 1 to 0 as `|longitude0|`
/// crosses `blend_mid`, reshaped by an odd power law when `blend_power > 1`.
/// Without blending the seam is a hard edge at `blend_mid`.
pub fn blend_weight(longitude0: f64, blend: &BlendConfig) -> f64 {
    if blend.blend_width > 0.0 {
        let t = ((blend.blend_mid + blend.blend_width - longitude0.abs())
            / (2.0 * blend.blend_width))
            .clamp(0.0, 1.0);
        if blend.blend_power > 1.0 {
            let s = 2.0 * t - 1.0;
            0.5 + 0.5 * s.signum() * s.abs().powf(1.0 / blend.blend_power)
        } else {
            t
        }
    } else if longitude0.abs() <= blend.blend_mid {
        1.0
    } else {
        0.0
    }
}

/// Whether `longitude0` lies within `blend_width` of either seam.
pub fn in_blend_zone(longitude0: f64, blend: &BlendConfig) -> bool {
    let (lo, hi) = (
        blend.blend_mid - blend.blend_width,
        blend.blend_mid + blend.blend_width,
    );
    (longitude0 >= lo && longitude0 <= hi) || (longitude0 >= -hi && longitude0 <= -lo)
}

/// Whether lens `lens` may contribute at `longitude`.
pub fn lens_covers(lens: usize, longitude: f64, blend: &BlendConfig) -> bool {
    let outer = blend.blend_mid + blend.blend_width;
    let inner = blend.blend_mid - blend.blend_width;
    if lens == 0 {
        longitude <= outer && longitude >= -outer
    } else {
        !(longitude > -inner && longitude < inner)
    }
}

/// Ray seen by lens `lens` for a latitude/longitude of the output sphere.
pub fn lens_ray(lens: usize, latitude: f64, longitude: f64) -> Vector3<f64> {
    if lens == 1 {
        spherical_ray(latitude, longitude + PI)
    } else {
        spherical_ray(latitude, longitude)
    }
}

/// Projects one antialias sample onto lens `lens`, or `None` on a miss.
pub fn project_sample<M: CameraModel>(
    lens: usize,
    model: &M,
    blend: &BlendConfig,
    latitude: f64,
    longitude: f64,
) -> Option<SourcePixel> {
    if !lens_covers(lens, longitude, blend) {
        return None;
    }
    model.project(&lens_ray(lens, latitude, longitude))
}

/// Colour of a source pixel, with the optional brightness roll-off applied.
pub fn sample_colour(
    image: &SourceImage,
    index: usize,
    radius: f64,
    intensity: Option<&IntensityCorrection>,
) -> Colour {
    let colour = Colour::from_rgb8(image.at(index));
    match intensity {
        Some(correction) => correction.apply(colour, radius),
        None => colour,
    }
}

/// Sub-pixel `(longitude, latitude)` offsets of the supersampling grid, in the
/// order samples are taken: longitude steps outer, latitude steps inner.
pub fn antialias_offsets(blend: &BlendConfig) -> impl Iterator<Item = (f64, f64)> {
    let a = blend.antialias.max(1);
    let dlon = TAU / (a as f64 * blend.output_width as f64);
    let dlat = PI / (a as f64 * blend.output_height as f64);
    (0..a).flat_map(move |ai| (0..a).map(move |aj| (ai as f64 * dlon, aj as f64 * dlat)))
}

/// Running sum of one lens' antialias samples.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LensAccumulator {
    pub sum: Colour,
    pub hits: u32,
}

impl LensAccumulator {
    pub fn add(&mut self, colour: Colour) {
        self.sum += colour;
        self.hits += 1;
    }

    /// Average over the lens' own hits, black when it saw nothing.
    pub fn mean(&self) -> Colour {
        if self.hits > 0 {
            self.sum / self.hits as f64
        } else {
            Colour::BLACK
        }
    }
}

/// Base geometry of one output pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelGeometry {
    pub latitude0: f64,
    pub longitude0: f64,
    pub blend: f64,
    pub in_blend_zone: bool,
}

impl PixelGeometry {
    pub fn new(i: u32, j: u32, blend: &BlendConfig) -> Self {
        let latitude0 = pixel_latitude(j, blend.output_height);
        let longitude0 = pixel_longitude(i, blend.output_width);
        PixelGeometry {
            latitude0,
            longitude0,
            blend: blend_weight(longitude0, blend),
            in_blend_zone: in_blend_zone(longitude0, blend),
        }
    }
}

/// Both lens averages of one output pixel, before blending.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelSample {
    pub geometry: PixelGeometry,
    pub lenses: [LensAccumulator; LENS_COUNT],
}

impl PixelSample {
    pub fn new(geometry: PixelGeometry) -> Self {
        PixelSample {
            geometry,
            lenses: [LensAccumulator::default(); LENS_COUNT],
        }
    }

    pub fn lens_colours(&self) -> [Colour; LENS_COUNT] {
        [self.lenses[0].mean(), self.lenses[1].mean()]
    }

    /// Cross-dissolve of the two lens averages.
    pub fn composite(&self) -> Colour {
        let [front, back] = self.lens_colours();
        let w = self.geometry.blend;
        front * w + back * (1.0 - w)
    }

    /// Seam error weight: 1 at the seam center, 0 at the blend zone edges.
    pub fn seam_weight(&self) -> f64 {
        1.0 - 2.0 * (0.5 - self.geometry.blend).abs()
    }
}

/// Weighted colour mismatch between the two lenses along the seams.
///
/// Only blend zone pixels strictly inside the band `0.2 H < j < 0.8 H`
/// contribute; the poles are too distorted to carry a useful signal.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SeamError {
    pub weighted_sum: f64,
    pub weight_sum: f64,
}

impl SeamError {
    pub fn add(&mut self, sample: &PixelSample, j: u32, height: u32) {
        let j = j as f64;
        let height = height as f64;
        if !sample.geometry.in_blend_zone || j <= 0.2 * height || j >= 0.8 * height {
            return;
        }
        let weight = sample.seam_weight();
        let [front, back] = sample.lens_colours();
        self.weighted_sum += front.squared_distance(&back) * weight;
        self.weight_sum += weight;
    }

    pub fn merge(&mut self, other: SeamError) {
        self.weighted_sum += other.weighted_sum;
        self.weight_sum += other.weight_sum;
    }

    /// Per-pixel error; NaN when no pixel carried any weight.
    pub fn value(&self) -> f64 {
        self.weighted_sum / self.weight_sum
    }
}

/// Samples output pixel `(i, j)` through both lenses.
pub fn sample_pixel<M: CameraModel>(
    lenses: &[M; LENS_COUNT],
    images: &[SourceImage; LENS_COUNT],
    blend: &BlendConfig,
    i: u32,
    j: u32,
) -> PixelSample {
    sample_geometry(lenses, images, blend, PixelGeometry::new(i, j, blend))
}

/// Samples a pixel whose base geometry is already known, so callers can
/// reject it on its blend zone membership before paying for any projection.
pub fn sample_geometry<M: CameraModel>(
    lenses: &[M; LENS_COUNT],
    images: &[SourceImage; LENS_COUNT],
    blend: &BlendConfig,
    geometry: PixelGeometry,
) -> PixelSample {
    let mut sample = PixelSample::new(geometry);
    let intensity = blend.intensity.as_ref();

    for (dlon, dlat) in antialias_offsets(blend) {
        let longitude = sample.geometry.longitude0 + dlon;
        let latitude = sample.geometry.latitude0 + dlat;
        for (n, (model, image)) in lenses.iter().zip(images).enumerate() {
            if let Some(pixel) = project_sample(n, model, blend, latitude, longitude) {
                let index = pixel.index(image.width());
                sample.lenses[n].add(sample_colour(image, index, pixel.radius, intensity));
            }
        }
    }
    sample
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Axis, EquidistantModel, Resolution, Rotation};
    use crate::params::LensParams;
    use approx::assert_relative_eq;

    fn blend(mid_deg: f64, width_deg: f64, power: f64) -> BlendConfig {
        BlendConfig {
            blend_mid: (mid_deg / 2.0).to_radians(),
            blend_width: (width_deg / 2.0).to_radians(),
            blend_power: power,
            antialias: 1,
            output_width: 360,
            output_height: 180,
            intensity: None,
        }
    }

    fn lens(fov_degrees: f64) -> EquidistantModel {
        let params = LensParams {
            radius: Some(30.0),
            center: Some((32.0, 32.0)),
            fov_degrees,
            ..LensParams::default()
        };
        EquidistantModel::from_params(
            &params,
            Resolution {
                width: 64,
                height: 64,
            },
        )
        .unwrap()
    }

    fn solid(rgb: [u8; 3]) -> SourceImage {
        SourceImage::from_fn(
            Resolution {
                width: 64,
                height: 64,
            },
            |_, _| rgb,
        )
    }

    #[test]
    fn test_pixel_coordinates() {
        assert_relative_eq!(pixel_latitude(0, 180), -FRAC_PI_2);
        assert_relative_eq!(pixel_latitude(90, 180), 0.0);
        assert_relative_eq!(pixel_longitude(0, 360), -PI);
        assert_relative_eq!(pixel_longitude(180, 360), 0.0);
    }

    #[test]
    fn test_blend_is_half_at_seam_center() {
        let config = blend(180.0, 10.0, 1.0);
        assert_relative_eq!(blend_weight(config.blend_mid, &config), 0.5, epsilon = 1e-12);
        assert_relative_eq!(blend_weight(-config.blend_mid, &config), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_blend_is_monotonic_and_clamped() {
        for power in [1.0, 2.5] {
            let config = blend(180.0, 20.0, power);
            let mut previous = f64::INFINITY;
            for step in 0..=400 {
                let longitude = step as f64 * PI / 400.0;
                let w = blend_weight(longitude, &config);
                assert!((0.0..=1.0).contains(&w));
                assert!(w <= previous + 1e-15, "not monotonic at {longitude}");
                previous = w;
            }
            assert_eq!(blend_weight(0.0, &config), 1.0);
            assert_eq!(blend_weight(PI, &config), 0.0);
        }
    }

    #[test]
    fn test_blend_power_keeps_seam_center() {
        let config = blend(180.0, 20.0, 3.0);
        assert_relative_eq!(blend_weight(config.blend_mid, &config), 0.5, epsilon = 1e-4);
        // The S-curve pushes weights towards the center faster than linear.
        let linear = blend(180.0, 20.0, 1.0);
        let inside = config.blend_mid - 0.5 * config.blend_width;
        assert!(blend_weight(inside, &config) > blend_weight(inside, &linear));
    }

    #[test]
    fn test_hard_edge_without_blending() {
        let config = blend(180.0, 0.0, 1.0);
        assert_eq!(blend_weight(config.blend_mid, &config), 1.0);
        assert_eq!(blend_weight(-config.blend_mid, &config), 1.0);
        assert_eq!(blend_weight(config.blend_mid + 1e-9, &config), 0.0);
    }

    #[test]
    fn test_blend_zones() {
        let config = blend(180.0, 10.0, 1.0);
        assert!(in_blend_zone(FRAC_PI_2, &config));
        assert!(in_blend_zone(-FRAC_PI_2 + 0.05, &config));
        assert!(!in_blend_zone(0.0, &config));
        assert!(!in_blend_zone(PI, &config));
    }

    #[test]
    fn test_lens_windows() {
        let config = blend(180.0, 10.0, 1.0);
        let edge = config.blend_mid + config.blend_width;
        assert!(lens_covers(0, 0.0, &config));
        assert!(lens_covers(0, edge, &config));
        assert!(!lens_covers(0, edge + 1e-6, &config));
        assert!(!lens_covers(1, 0.0, &config));
        assert!(lens_covers(1, PI, &config));
        assert!(lens_covers(1, config.blend_mid - config.blend_width, &config));
        assert!(lens_covers(1, FRAC_PI_2, &config) && lens_covers(0, FRAC_PI_2, &config));
    }

    #[test]
    fn test_hard_seam_selects_one_lens() {
        let config = blend(180.0, 0.0, 1.0);
        let lenses = [lens(190.0), lens(190.0)];
        let images = [solid([200, 0, 0]), solid([0, 0, 200])];

        // Column 180 is longitude 0.
        let front = sample_pixel(&lenses, &images, &config, 180, 90);
        assert_eq!(front.geometry.blend, 1.0);
        assert_eq!(front.lenses[1].hits, 0);
        assert_eq!(front.composite().to_rgb8(), [200, 0, 0]);

        // Column 359 is longitude 179 degrees.
        let back = sample_pixel(&lenses, &images, &config, 359, 90);
        assert_relative_eq!(back.geometry.longitude0, 179f64.to_radians(), epsilon = 1e-12);
        assert_eq!(back.geometry.blend, 0.0);
        assert_eq!(back.lenses[0].hits, 0);
        assert_eq!(back.composite().to_rgb8(), [0, 0, 200]);
    }

    #[test]
    fn test_lenses_are_normalised_independently() {
        let mut config = blend(180.0, 10.0, 1.0);
        config.antialias = 3;
        let lenses = [lens(190.0), lens(190.0)];
        let images = [solid([90, 90, 90]), solid([30, 30, 30])];

        // A pixel in the blend zone is seen by both lenses.
        let sample = sample_pixel(&lenses, &images, &config, 270, 90);
        assert!(sample.geometry.in_blend_zone);
        assert_eq!(sample.lenses[0].hits, 9);
        assert_eq!(sample.lenses[1].hits, 9);
        let [front, back] = sample.lens_colours();
        assert_relative_eq!(front.r, 90.0);
        assert_relative_eq!(back.r, 30.0);
        let expected = 90.0 * sample.geometry.blend + 30.0 * (1.0 - sample.geometry.blend);
        assert_relative_eq!(sample.composite().r, expected, epsilon = 1e-9);
    }

    #[test]
    fn test_uncovered_pixel_is_black() {
        let config = blend(180.0, 0.0, 1.0);
        // A narrow lens cannot see the pole.
        let lenses = [lens(60.0), lens(60.0)];
        let images = [solid([255, 255, 255]), solid([255, 255, 255])];
        let sample = sample_pixel(&lenses, &images, &config, 180, 0);
        assert_eq!(sample.lenses[0].hits + sample.lenses[1].hits, 0);
        assert_eq!(sample.composite(), Colour::BLACK);
    }

    #[test]
    fn test_mirrored_lens_matches_half_turn_roll() {
        let res = Resolution {
            width: 64,
            height: 64,
        };
        let coords = SourceImage::from_fn(res, |u, v| [u as u8, v as u8, 0]);

        let mirrored_lens = EquidistantModel::from_params(
            &LensParams {
                radius: Some(30.0),
                center: Some((32.0, 32.0)),
                hflip: -1,
                vflip: -1,
                ..LensParams::default()
            },
            res,
        )
        .unwrap();
        let mut mirrored = coords.clone();
        mirrored.mirror(
            mirrored_lens.center,
            mirrored_lens.radius,
            mirrored_lens.hflip,
            mirrored_lens.vflip,
        );

        let mut rolled_lens = lens(180.0);
        rolled_lens.rotations.push(Rotation::new(Axis::Roll, PI));

        for (lat, lon) in [(0.2, 0.3), (-0.4, 0.1), (0.05, -0.6)] {
            let ray = spherical_ray(lat, lon);
            let a = mirrored_lens.project(&ray).unwrap();
            let b = rolled_lens.project(&ray).unwrap();
            let from_mirrored = mirrored.get(a.u, a.v);
            let from_rolled = coords.get(b.u, b.v);
            for c in 0..2 {
                assert!(
                    (from_mirrored[c] as i32 - from_rolled[c] as i32).abs() <= 1,
                    "{from_mirrored:?} vs {from_rolled:?}"
                );
            }
        }
    }

    #[test]
    fn test_seam_error_weighting() {
        let config = blend(180.0, 10.0, 1.0);
        let mut sample = PixelSample::new(PixelGeometry::new(270, 90, &config));
        sample.lenses[0].add(Colour::new(10.0, 0.0, 0.0));
        sample.lenses[1].add(Colour::new(13.0, 4.0, 0.0));
        assert_relative_eq!(sample.seam_weight(), 1.0, epsilon = 1e-9);

        let mut error = SeamError::default();
        error.add(&sample, 90, 180);
        assert_relative_eq!(error.value(), 25.0, epsilon = 1e-6);

        // Rows near the poles are ignored.
        let mut polar = SeamError::default();
        polar.add(&sample, 20, 180);
        polar.add(&sample, 150, 180);
        assert_eq!(polar.weight_sum, 0.0);
        assert!(polar.value().is_nan());

        // So are pixels away from the seams.
        let outside = PixelSample::new(PixelGeometry::new(180, 90, &config));
        error.add(&outside, 90, 180);
        assert_eq!(error.weight_sum, sample.seam_weight());
    }

    #[test]
    fn test_antialias_offsets_order() {
        let mut config = blend(180.0, 0.0, 1.0);
        config.antialias = 2;
        let offsets: Vec<_> = antialias_offsets(&config).collect();
        assert_eq!(offsets.len(), 4);
        assert_eq!(offsets[0], (0.0, 0.0));
        assert_eq!(offsets[1].0, 0.0);
        assert!(offsets[1].1 > 0.0);
        assert!(offsets[2].0 > 0.0);
        assert_eq!(offsets[2].1, 0.0);
    }
}
