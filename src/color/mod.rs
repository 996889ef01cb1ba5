//! Colour arithmetic used while sampling the lenses.
//!
//! Samples are accumulated as [`Colour`] triples in `f64` on the `0..=255`
//! scale of the source images. [`Hsv`] conversion works on the unit scale, with
//! hue in degrees, and backs the optional [`IntensityCorrection`] roll-off.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Div, Mul, Sub};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Colour {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

impl Colour {
    pub const BLACK: Colour = Colour {
        r: 0.0,
        g: 0.0,
        b: 0.0,
    };

    pub fn new(r: f64, g: f64, b: f64) -> Self {
        Colour { r, g, b }
    }

    pub fn from_rgb8(rgb: [u8; 3]) -> Self {
        Colour::new(rgb[0] as f64, rgb[1] as f64, rgb[2] as f64)
    }

    /// Rounds to the nearest 8-bit value per channel, clamped to `0..=255`.
    pub fn to_rgb8(self) -> [u8; 3] {
        let quantize = |c: f64| c.round().clamp(0.0, 255.0) as u8;
        [quantize(self.r), quantize(self.g), quantize(self.b)]
    }

    pub fn squared_distance(&self, other: &Colour) -> f64 {
        let d = *self - *other;
        d.r * d.r + d.g * d.g + d.b * d.b
    }
}

impl Add for Colour {
    type Output = Colour;
    fn add(self, rhs: Colour) -> Colour {
        Colour::new(self.r + rhs.r, self.g + rhs.g, self.b + rhs.b)
    }
}

impl AddAssign for Colour {
    fn add_assign(&mut self, rhs: Colour) {
        *self = *self + rhs;
    }
}

impl Sub for Colour {
    type Output = Colour;
    fn sub(self, rhs: Colour) -> Colour {
        Colour::new(self.r - rhs.r, self.g - rhs.g, self.b - rhs.b)
    }
}

impl Mul<f64> for Colour {
    type Output = Colour;
    fn mul(self, rhs: f64) -> Colour {
        Colour::new(self.r * rhs, self.g * rhs, self.b * rhs)
    }
}

impl Div<f64> for Colour {
    type Output = Colour;
    fn div(self, rhs: f64) -> Colour {
        Colour::new(self.r / rhs, self.g / rhs, self.b / rhs)
    }
}

/// Hue in degrees `[0, 360)`, saturation and value in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Hsv {
    pub h: f64,
    pub s: f64,
    pub v: f64,
}

/// Converts a unit-scale RGB colour to HSV.
pub fn rgb_to_hsv(c: Colour) -> Hsv {
    let min = c.r.min(c.g).min(c.b);
    let max = c.r.max(c.g).max(c.b);
    let delta = max - min;

    let s = if max > 0.0 { delta / max } else { 0.0 };
    let mut h = 0.0;
    if delta > 0.0 {
        if max == c.r && max != c.g {
            h += (c.g - c.b) / delta;
        }
        if max == c.g && max != c.b {
            h += 2.0 + (c.b - c.r) / delta;
        }
        if max == c.b && max != c.r {
            h += 4.0 + (c.r - c.g) / delta;
        }
        h *= 60.0;
        if h < 0.0 {
            h += 360.0;
        }
    }
    Hsv { h, s, v: max }
}

/// Converts HSV back to a unit-scale RGB colour, the inverse of [`rgb_to_hsv`].
pub fn hsv_to_rgb(c: Hsv) -> Colour {
    let h = c.h.rem_euclid(360.0);

    let (sr, sg, sb) = if h < 120.0 {
        ((120.0 - h) / 60.0, h / 60.0, 0.0)
    } else if h < 240.0 {
        (0.0, (240.0 - h) / 60.0, (h - 120.0) / 60.0)
    } else {
        ((h - 240.0) / 60.0, 0.0, (360.0 - h) / 60.0)
    };
    let channel = |sat: f64| (1.0 - c.s + c.s * sat.min(1.0)) * c.v;

    Colour::new(channel(sr), channel(sg), channel(sb))
}

/// Polynomial brightness roll-off towards the rim of a fisheye circle.
///
/// The gain at normalised radius `r` is
/// `ifcn[0] + ifcn[1] r + ifcn[2] r^2 + ... + ifcn[5] r^5`; it scales the HSV
/// value of a sample, which is then clamped to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntensityCorrection {
    pub ifcn: [f64; 6],
}

impl Default for IntensityCorrection {
    /// Rises to roughly 1.1 at the rim.
    fn default() -> Self {
        IntensityCorrection {
            ifcn: [1.0, 0.1, -1.0417, 3.6458, -5.2083, 2.6042],
        }
    }
}

impl IntensityCorrection {
    pub fn gain(&self, r: f64) -> f64 {
        self.ifcn.iter().rev().fold(0.0, |acc, &a| acc * r + a)
    }

    /// Applies the roll-off to a `0..=255` colour sampled at radius `r`.
    pub fn apply(&self, colour: Colour, r: f64) -> Colour {
        let mut hsv = rgb_to_hsv(colour / 255.0);
        hsv.v = (hsv.v * self.gain(r)).clamp(0.0, 1.0);
        hsv_to_rgb(hsv) * 255.0
    }
}
