//! Raw pixel buffers exchanged with the image codecs.
//!
//! Both [`SourceImage`] and [`EquirectImage`] store rows bottom to top, so row
//! `0` is the bottom edge. Lens centers use the same bottom-left origin, and
//! row `0` of an equirectangular image is the south pole. Conversion to and from
//! the top-down buffers of the `image` crate happens only in this module.

use crate::camera::Resolution;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageError, RgbImage};
use log::debug;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

pub type Rgb8 = [u8; 3];

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("Failed to decode image {path}: {source}")]
    Decode { path: String, source: ImageError },
    #[error("Failed to encode image {path}: {source}")]
    Encode { path: String, source: ImageError },
    #[error("IO Error for {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Front and back frames differ in size: {0}x{1} != {2}x{3}")]
    SizeMismatch(u32, u32, u32, u32),
    #[error("No known frame template matches {0}x{1}")]
    UnknownTemplate(u32, u32),
    #[error("Frame name template {0:?} must contain exactly one %d field")]
    BadSequenceName(String),
}

/// A decoded lens frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceImage {
    pub resolution: Resolution,
    pixels: Vec<Rgb8>,
}

impl SourceImage {
    pub fn from_fn(resolution: Resolution, f: impl Fn(u32, u32) -> Rgb8) -> Self {
        let pixels = (0..resolution.height)
            .flat_map(|v| (0..resolution.width).map(move |u| (u, v)))
            .map(|(u, v)| f(u, v))
            .collect();
        SourceImage { resolution, pixels }
    }

    pub fn from_rgb_image(img: &RgbImage) -> Self {
        let (width, height) = img.dimensions();
        let pixels = (0..height)
            .rev()
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| img.get_pixel(x, y).0)
            .collect();
        SourceImage {
            resolution: Resolution { width, height },
            pixels,
        }
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// Pixel at a flattened bottom-up row-major index.
    pub fn at(&self, index: usize) -> Rgb8 {
        self.pixels[index]
    }

    pub fn get(&self, u: u32, v: u32) -> Rgb8 {
        self.pixels[v as usize * self.resolution.width as usize + u as usize]
    }

    fn index_of(&self, x: i64, y: i64) -> Option<usize> {
        let (w, h) = (self.resolution.width as i64, self.resolution.height as i64);
        (x >= 0 && y >= 0 && x < w && y < h).then(|| (y * w + x) as usize)
    }

    fn swap_mirrored(&mut self, a: (i64, i64), b: (i64, i64)) {
        let ia = self.index_of(a.0, a.1);
        let ib = self.index_of(b.0, b.1);
        let ca = ia.map_or([0, 0, 0], |i| self.pixels[i]);
        let cb = ib.map_or([0, 0, 0], |i| self.pixels[i]);
        if let Some(i) = ia {
            self.pixels[i] = cb;
        }
        if let Some(i) = ib {
            self.pixels[i] = ca;
        }
    }

    /// Mirrors the fisheye circle about its center.
    ///
    /// With `hflip < 0` columns `cx - i` and `cx + i` are exchanged, with
    /// `vflip < 0` rows `cy - j` and `cy + j`, over the square of half side
    /// `radius` around the center. A partner outside the image reads as black and
    /// is not written.
    pub fn mirror(&mut self, center: Vector2<f64>, radius: f64, hflip: i8, vflip: i8) {
        let (cx, cy) = (center.x.round() as i64, center.y.round() as i64);
        let radius = radius.round() as i64;

        if hflip < 0 {
            for i in 1..=radius {
                for j in -radius..=radius {
                    self.swap_mirrored((cx - i, cy + j), (cx + i, cy + j));
                }
            }
        }
        if vflip < 0 {
            for i in -radius..=radius {
                for j in 1..=radius {
                    self.swap_mirrored((cx + i, cy - j), (cx + i, cy + j));
                }
            }
        }
    }
}

/// An equirectangular output buffer, `height` rows from south to north pole.
#[derive(Debug, Clone, PartialEq)]
pub struct EquirectImage {
    pub width: u32,
    pub height: u32,
    pixels: Vec<Rgb8>,
}

impl EquirectImage {
    pub fn new(width: u32, height: u32) -> Self {
        EquirectImage {
            width,
            height,
            pixels: vec![[0, 0, 0]; width as usize * height as usize],
        }
    }

    pub fn get(&self, i: u32, j: u32) -> Rgb8 {
        self.pixels[j as usize * self.width as usize + i as usize]
    }

    pub fn put(&mut self, i: u32, j: u32, rgb: Rgb8) {
        if i < self.width && j < self.height {
            self.pixels[j as usize * self.width as usize + i as usize] = rgb;
        }
    }

    /// Erases every pixel to black.
    pub fn clear(&mut self) {
        self.pixels.fill([0, 0, 0]);
    }

    pub fn pixels_mut(&mut self) -> &mut [Rgb8] {
        &mut self.pixels
    }

    pub fn to_rgb_image(&self) -> RgbImage {
        RgbImage::from_fn(self.width, self.height, |x, y| {
            image::Rgb(self.get(x, self.height - 1 - y))
        })
    }
}

/// Ensure the parent directory of `path` exists
pub fn ensure_parent_dir(path: &Path) -> Result<(), FrameError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|source| FrameError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
    }
    Ok(())
}

/// Load a lens frame from file path
pub fn load_image(path: impl AsRef<Path>) -> Result<SourceImage, FrameError> {
    let path = path.as_ref();
    let img = image::open(path).map_err(|source| FrameError::Decode {
        path: path.display().to_string(),
        source,
    })?;
    debug!("Decoded {} ({}x{})", path.display(), img.width(), img.height());
    Ok(SourceImage::from_rgb_image(&img.to_rgb8()))
}

/// Writes an equirectangular image. JPEG output uses quality 100; other
/// extensions use the default encoder of the `image` crate.
pub fn save_image(img: &EquirectImage, path: impl AsRef<Path>) -> Result<(), FrameError> {
    let path = path.as_ref();
    ensure_parent_dir(path)?;
    let encode_err = |source| FrameError::Encode {
        path: path.display().to_string(),
        source,
    };

    let rgb = img.to_rgb_image();
    let is_jpeg = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"));

    if is_jpeg {
        let file = File::create(path).map_err(|source| FrameError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut encoder = JpegEncoder::new_with_quality(BufWriter::new(file), 100);
        encoder.encode_image(&rgb).map_err(encode_err)?;
    } else {
        rgb.save(path).map_err(encode_err)?;
    }
    debug!("Wrote {}", path.display());
    Ok(())
}

/// Size of a known dual fisheye frame layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameTemplate {
    pub width: u32,
    pub height: u32,
}

impl FrameTemplate {
    pub fn defaults() -> Vec<FrameTemplate> {
        vec![
            FrameTemplate {
                width: 3104,
                height: 3000,
            },
            FrameTemplate {
                width: 2704,
                height: 2624,
            },
            FrameTemplate {
                width: 1568,
                height: 1504,
            },
        ]
    }
}

/// Index of the template matching a pair of front/back frames.
pub fn detect_template(
    templates: &[FrameTemplate],
    front: Resolution,
    back: Resolution,
) -> Result<usize, FrameError> {
    if front != back {
        return Err(FrameError::SizeMismatch(
            front.width,
            front.height,
            back.width,
            back.height,
        ));
    }
    templates
        .iter()
        .position(|t| t.width == front.width && t.height == front.height)
        .ok_or(FrameError::UnknownTemplate(front.width, front.height))
}

/// A printf-style frame name with one `%d` or `%0Nd` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceName {
    prefix: String,
    width: usize,
    suffix: String,
}

impl SequenceName {
    pub fn parse(template: &str) -> Result<Self, FrameError> {
        let bad = || FrameError::BadSequenceName(template.to_string());
        if template.matches('%').count() != 1 {
            return Err(bad());
        }
        let (prefix, rest) = template.split_once('%').ok_or_else(bad)?;
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        let suffix = rest[digits.len()..].strip_prefix('d').ok_or_else(bad)?;
        let width = if digits.is_empty() {
            0
        } else {
            digits.parse().map_err(|_| bad())?
        };
        Ok(SequenceName {
            prefix: prefix.to_string(),
            width,
            suffix: suffix.to_string(),
        })
    }

    pub fn format(&self, frame: u32) -> String {
        format!(
            "{}{:0width$}{}",
            self.prefix,
            frame,
            self.suffix,
            width = self.width
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(width: u32, height: u32) -> Resolution {
        Resolution { width, height }
    }

    #[test]
    fn test_rgb_image_rows_are_flipped() {
        let mut img = RgbImage::new(2, 3);
        img.put_pixel(0, 0, image::Rgb([10, 0, 0]));
        img.put_pixel(1, 2, image::Rgb([0, 20, 0]));
        let source = SourceImage::from_rgb_image(&img);
        assert_eq!(source.get(0, 2), [10, 0, 0]);
        assert_eq!(source.get(1, 0), [0, 20, 0]);
    }

    #[test]
    fn test_equirect_round_trip_orientation() {
        let mut out = EquirectImage::new(4, 2);
        out.put(3, 0, [1, 2, 3]);
        let rgb = out.to_rgb_image();
        assert_eq!(rgb.get_pixel(3, 1).0, [1, 2, 3]);
        out.put(9, 9, [9, 9, 9]);
        out.clear();
        assert_eq!(out.get(3, 0), [0, 0, 0]);
    }

    #[test]
    fn test_mirror_horizontal() {
        let mut img = SourceImage::from_fn(res(9, 9), |u, v| [u as u8, v as u8, 0]);
        img.mirror(Vector2::new(4.0, 4.0), 4.0, -1, 1);
        assert_eq!(img.get(0, 3), [8, 3, 0]);
        assert_eq!(img.get(8, 3), [0, 3, 0]);
        assert_eq!(img.get(4, 3), [4, 3, 0]);
    }

    #[test]
    fn test_mirror_out_of_bounds_partner_is_black() {
        let mut img = SourceImage::from_fn(res(6, 3), |_, _| [50, 50, 50]);
        img.mirror(Vector2::new(1.0, 1.0), 2.0, -1, 1);
        // Column 3 swapped with column -1, which lies outside the image.
        assert_eq!(img.get(3, 1), [0, 0, 0]);
        assert_eq!(img.get(0, 1), [50, 50, 50]);
    }

    #[test]
    fn test_mirror_vertical_twice_is_identity() {
        let original = SourceImage::from_fn(res(7, 7), |u, v| [u as u8, v as u8, 7]);
        let mut img = original.clone();
        img.mirror(Vector2::new(3.0, 3.0), 3.0, 1, -1);
        assert_ne!(img, original);
        img.mirror(Vector2::new(3.0, 3.0), 3.0, 1, -1);
        assert_eq!(img, original);
    }

    #[test]
    fn test_detect_template() {
        let templates = FrameTemplate::defaults();
        assert_eq!(
            detect_template(&templates, res(2704, 2624), res(2704, 2624)).unwrap(),
            1
        );
        assert!(matches!(
            detect_template(&templates, res(100, 100), res(100, 100)),
            Err(FrameError::UnknownTemplate(100, 100))
        ));
        assert!(matches!(
            detect_template(&templates, res(2704, 2624), res(1568, 1504)),
            Err(FrameError::SizeMismatch(..))
        ));
    }

    #[test]
    fn test_sequence_name() {
        let name = SequenceName::parse("front/frame_%04d.jpg").unwrap();
        assert_eq!(name.format(7), "front/frame_0007.jpg");
        let name = SequenceName::parse("out%d.jpg").unwrap();
        assert_eq!(name.format(12), "out12.jpg");
        assert!(SequenceName::parse("frame.jpg").is_err());
        assert!(SequenceName::parse("%d_%d.jpg").is_err());
        assert!(SequenceName::parse("frame_%s.jpg").is_err());
    }
}
