//! Disk-persisted lookup tables for batch conversion.
//!
//! A [`LookupTable`] records, for every output pixel, which lens and source
//! pixel each antialias sample landed on. Frames of a sequence that share their
//! camera geometry are then converted by replaying the table, without any
//! trigonometry.
//!
//! The table is dense: every output pixel owns a fixed run of
//! `2 * antialias^2 + 1` entries. Hits come first in sample order, followed by
//! an [`LookupEntry::End`] sentinel and padding. A table is only reused for the
//! exact [`CacheKey`] it was built for, and only if the geometry fingerprint
//! stored in its header still matches the lens parameters; anything else is a
//! cache miss and the table is rebuilt.
//!
//! Entries only name the lens and source pixel. When intensity correction is
//! on, the normalised radius of every hit is kept in a separate array so the
//! correction replays exactly as the direct path computes it.

use crate::camera::{CameraModel, EquidistantModel, Resolution, Rig};
use crate::config::BlendConfig;
use crate::frame::{EquirectImage, SourceImage};
use crate::sampler::{
    antialias_offsets, project_sample, sample_colour, PixelGeometry, PixelSample, LENS_COUNT,
};
use bincode::config::standard;
use bincode::serde::{decode_from_std_read, encode_into_std_write};
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum LookupError {
    #[error("IO Error for {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to encode lookup table {path}: {source}")]
    Encode {
        path: String,
        source: bincode::error::EncodeError,
    },
    #[error("Failed to decode lookup table {path}: {source}")]
    Decode {
        path: String,
        source: bincode::error::DecodeError,
    },
    #[error("Lookup table {path} does not match the current geometry: {reason}")]
    Stale { path: String, reason: String },
    #[error("Lookup table was built for {expected:?} frames, got {actual:?}")]
    SourceMismatch {
        expected: Resolution,
        actual: Resolution,
    },
    #[error("Lookup table covers a {expected:?} output, got {actual:?}")]
    OutputMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("Lookup table holds no sample radii, rebuild it with intensity correction on")]
    MissingRadii,
}

/// Identity of a lookup table: frame template, output size and antialiasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub template: usize,
    pub width: u32,
    pub height: u32,
    pub antialias: u32,
}

impl CacheKey {
    pub fn new(template: usize, blend: &BlendConfig) -> Self {
        CacheKey {
            template,
            width: blend.output_width,
            height: blend.output_height,
            antialias: blend.antialias,
        }
    }

    /// Cache file name, `f_{template}_{width}_{height}_{antialias}.data`.
    pub fn file_name(&self) -> String {
        format!(
            "f_{}_{}_{}_{}.data",
            self.template, self.width, self.height, self.antialias
        )
    }

    /// Entries reserved per output pixel: one per sample and lens, plus the
    /// end-of-pixel sentinel.
    pub fn stride(&self) -> usize {
        LENS_COUNT * (self.antialias as usize).pow(2) + 1
    }

    /// Total number of entries of a table with this key.
    pub fn table_len(&self) -> usize {
        self.width as usize * self.height as usize * self.stride()
    }
}

/// One slot of a pixel's run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupEntry {
    /// A sample landed on `pixel` of lens `lens`.
    Hit { lens: u8, pixel: u32 },
    /// End of the pixel's run.
    End,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TableHeader {
    key: CacheKey,
    fingerprint: u64,
    sources: [Resolution; LENS_COUNT],
    len: u64,
    radii: bool,
}

/// Folds the lens geometry and seam windows into a 64 bit FNV-1a hash.
///
/// Blend power and the intensity coefficients are applied at replay time and
/// are left out. Whether intensity correction is on is folded in, since it
/// decides whether the table records sample radii.
pub fn geometry_fingerprint(lenses: &[EquidistantModel; LENS_COUNT], blend: &BlendConfig) -> u64 {
    let mut words: Vec<u64> = vec![
        blend.blend_mid.to_bits(),
        blend.blend_width.to_bits(),
        blend.intensity.is_some() as u64,
    ];
    for lens in lenses {
        words.extend([
            lens.fov.to_bits(),
            lens.radius.to_bits(),
            lens.center.x.to_bits(),
            lens.center.y.to_bits(),
            lens.hflip as u64,
            lens.vflip as u64,
            lens.resolution.width as u64,
            lens.resolution.height as u64,
        ]);
        for rotation in &lens.rotations {
            words.extend([rotation.axis as u64, rotation.angle.to_bits()]);
        }
    }

    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in words.iter().flat_map(|w| w.to_le_bytes()) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Precomputed sample runs of every output pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupTable {
    key: CacheKey,
    fingerprint: u64,
    sources: [Resolution; LENS_COUNT],
    entries: Vec<LookupEntry>,
    /// Normalised radius of each slot, parallel to `entries`.
    radii: Option<Vec<f64>>,
}

impl LookupTable {
    /// Projects every antialias sample of every output pixel through both lenses.
    ///
    /// # Arguments
    ///
    /// * `key` - Identity of the table; its size and antialiasing must agree
    ///   with `blend`.
    /// * `lenses` - The front and back lens models.
    /// * `blend` - Seam windows and sampling resolution. Sample radii are
    ///   recorded when it carries an intensity correction.
    /// * `fingerprint` - Geometry hash stored in the header, see
    ///   [`geometry_fingerprint`].
    pub fn build<M: CameraModel + Sync>(
        key: CacheKey,
        lenses: &[M; LENS_COUNT],
        blend: &BlendConfig,
        fingerprint: u64,
    ) -> Self {
        let stride = key.stride();
        let row_len = key.width as usize * stride;
        let mut entries = vec![LookupEntry::End; key.table_len()];
        let mut radii = blend.intensity.map(|_| vec![0.0; key.table_len()]);
        let radius_rows: Vec<Option<&mut [f64]>> = match radii.as_mut() {
            Some(radii) => radii.chunks_mut(row_len).map(Some).collect(),
            None => (0..key.height).map(|_| None).collect(),
        };

        entries
            .par_chunks_mut(row_len)
            .zip(radius_rows)
            .enumerate()
            .for_each(|(j, (row, mut radius_row))| {
                for (i, run) in row.chunks_mut(stride).enumerate() {
                    let geometry = PixelGeometry::new(i as u32, j as u32, blend);
                    let mut slot = 0;
                    for (dlon, dlat) in antialias_offsets(blend) {
                        let longitude = geometry.longitude0 + dlon;
                        let latitude = geometry.latitude0 + dlat;
                        for (n, model) in lenses.iter().enumerate() {
                            if let Some(pixel) =
                                project_sample(n, model, blend, latitude, longitude)
                            {
                                let width = model.get_resolution().width;
                                run[slot] = LookupEntry::Hit {
                                    lens: n as u8,
                                    pixel: pixel.index(width) as u32,
                                };
                                if let Some(radius_row) = radius_row.as_deref_mut() {
                                    radius_row[i * stride + slot] = pixel.radius;
                                }
                                slot += 1;
                            }
                        }
                    }
                }
            });

        LookupTable {
            key,
            fingerprint,
            sources: [lenses[0].get_resolution(), lenses[1].get_resolution()],
            entries,
            radii,
        }
    }

    /// Whether the table can replay intensity corrected samples.
    pub fn has_radii(&self) -> bool {
        self.radii.is_some()
    }

    /// Number of recorded hits over the whole table.
    pub fn hits(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, LookupEntry::Hit { .. }))
            .count()
    }

    fn run_start(&self, i: u32, j: u32) -> usize {
        (j as usize * self.key.width as usize + i as usize) * self.key.stride()
    }

    /// Hits of output pixel `(i, j)`, in sample order.
    pub fn run(&self, i: u32, j: u32) -> impl Iterator<Item = &LookupEntry> {
        let start = self.run_start(i, j);
        self.entries[start..start + self.key.stride()]
            .iter()
            .take_while(|e| matches!(e, LookupEntry::Hit { .. }))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), LookupError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let io_err = |source| LookupError::Io {
            path: display.clone(),
            source,
        };
        let encode_err = |source| LookupError::Encode {
            path: display.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = File::create(path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        let header = TableHeader {
            key: self.key,
            fingerprint: self.fingerprint,
            sources: self.sources,
            len: self.entries.len() as u64,
            radii: self.radii.is_some(),
        };
        encode_into_std_write(&header, &mut writer, standard()).map_err(encode_err)?;
        encode_into_std_write(&self.entries, &mut writer, standard()).map_err(encode_err)?;
        if let Some(radii) = &self.radii {
            encode_into_std_write(radii, &mut writer, standard()).map_err(encode_err)?;
        }
        writer.flush().map_err(io_err)?;
        Ok(())
    }

    /// Loads a table, rejecting it when its header disagrees with the expected
    /// key, fingerprint or size.
    pub fn load(
        path: impl AsRef<Path>,
        key: CacheKey,
        fingerprint: u64,
    ) -> Result<Self, LookupError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let stale = |reason: String| LookupError::Stale {
            path: display.clone(),
            reason,
        };
        let decode_err = |source| LookupError::Decode {
            path: display.clone(),
            source,
        };

        let file = File::open(path).map_err(|source| LookupError::Io {
            path: display.clone(),
            source,
        })?;
        let mut reader = BufReader::new(file);

        let header: TableHeader =
            decode_from_std_read(&mut reader, standard()).map_err(decode_err)?;
        if header.key != key {
            return Err(stale(format!("key {:?} != {:?}", header.key, key)));
        }
        if header.fingerprint != fingerprint {
            return Err(stale("lens geometry changed".to_string()));
        }
        if header.len as usize != key.table_len() {
            return Err(stale(format!(
                "{} entries, expected {}",
                header.len,
                key.table_len()
            )));
        }

        let entries: Vec<LookupEntry> =
            decode_from_std_read(&mut reader, standard()).map_err(decode_err)?;
        if entries.len() != key.table_len() {
            return Err(stale(format!(
                "{} entries read, expected {}",
                entries.len(),
                key.table_len()
            )));
        }

        let radii = if header.radii {
            let radii: Vec<f64> =
                decode_from_std_read(&mut reader, standard()).map_err(decode_err)?;
            if radii.len() != entries.len() {
                return Err(stale(format!(
                    "{} radii read, expected {}",
                    radii.len(),
                    entries.len()
                )));
            }
            Some(radii)
        } else {
            None
        };

        Ok(LookupTable {
            key,
            fingerprint,
            sources: header.sources,
            entries,
            radii,
        })
    }

    /// Reuses the cached table for `key` under `cache_dir`, or builds and
    /// persists a fresh one.
    ///
    /// A missing, stale or unreadable cache file is a cache miss, never an
    /// error. Failing to write the rebuilt table only costs the next run a
    /// rebuild and is logged.
    pub fn load_or_build(
        cache_dir: impl AsRef<Path>,
        key: CacheKey,
        rig: &Rig,
        blend: &BlendConfig,
    ) -> Self {
        let path: PathBuf = cache_dir.as_ref().join(key.file_name());
        let fingerprint = geometry_fingerprint(&rig.lenses, blend);

        if path.exists() {
            match LookupTable::load(&path, key, fingerprint) {
                Ok(table) => {
                    info!("Reusing lookup table {}", path.display());
                    return table;
                }
                Err(e) => warn!("Rebuilding lookup table: {e}"),
            }
        }

        info!(
            "Building lookup table {} ({} entries)",
            path.display(),
            key.table_len()
        );
        let table = LookupTable::build(key, &rig.lenses, blend, fingerprint);
        info!("Lookup table holds {} hits", table.hits());
        if let Err(e) = table.save(&path) {
            warn!("Failed to save lookup table: {e}");
        }
        table
    }

    /// Checks that a frame pair has the size the table was built for.
    pub fn check_sources(&self, images: &[SourceImage; LENS_COUNT]) -> Result<(), LookupError> {
        for (expected, image) in self.sources.iter().zip(images) {
            if *expected != image.resolution {
                return Err(LookupError::SourceMismatch {
                    expected: *expected,
                    actual: image.resolution,
                });
            }
        }
        Ok(())
    }

    /// Replays the run of output pixel `(i, j)` against a frame pair.
    ///
    /// Samples are accumulated per lens in the order they were projected, so
    /// the result is bit-identical to [`crate::sampler::sample_pixel`]. A table
    /// without radii replays intensity correction at radius 0; [`render`]
    /// refuses that combination.
    ///
    /// [`render`]: LookupTable::render
    pub fn sample_pixel(
        &self,
        images: &[SourceImage; LENS_COUNT],
        blend: &BlendConfig,
        i: u32,
        j: u32,
    ) -> PixelSample {
        let mut sample = PixelSample::new(PixelGeometry::new(i, j, blend));
        let intensity = blend.intensity.as_ref();
        let start = self.run_start(i, j);
        for (slot, entry) in self.run(i, j).enumerate() {
            if let LookupEntry::Hit { lens, pixel } = *entry {
                let n = lens as usize;
                let radius = self.radii.as_ref().map_or(0.0, |r| r[start + slot]);
                sample.lenses[n].add(sample_colour(&images[n], pixel as usize, radius, intensity));
            }
        }
        sample
    }

    /// Converts a frame pair into `out` by replaying every pixel run.
    pub fn render(
        &self,
        images: &[SourceImage; LENS_COUNT],
        blend: &BlendConfig,
        out: &mut EquirectImage,
    ) -> Result<(), LookupError> {
        self.check_sources(images)?;
        let expected = (self.key.width, self.key.height);
        if (out.width, out.height) != expected {
            return Err(LookupError::OutputMismatch {
                expected,
                actual: (out.width, out.height),
            });
        }
        if blend.intensity.is_some() && self.radii.is_none() {
            return Err(LookupError::MissingRadii);
        }
        let width = out.width as usize;
        out.pixels_mut()
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(j, row)| {
                for (i, pixel) in row.iter_mut().enumerate() {
                    *pixel = self
                        .sample_pixel(images, blend, i as u32, j as u32)
                        .composite()
                        .to_rgb8();
                }
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Axis;
    use crate::params::{LensParams, RigParams, RotationParam};
    use crate::sampler::sample_pixel;

    fn blend_config(antialias: u32) -> BlendConfig {
        BlendConfig {
            blend_mid: 90f64.to_radians(),
            blend_width: 5f64.to_radians(),
            blend_power: 2.0,
            antialias,
            output_width: 48,
            output_height: 24,
            intensity: None,
        }
    }

    fn rig() -> Rig {
        let lens = |rotations| LensParams {
            fov_degrees: 195.0,
            rotations,
            ..LensParams::default()
        };
        let params = RigParams {
            lenses: [
                lens(vec![RotationParam {
                    axis: Axis::Pan,
                    degrees: 1.5,
                }]),
                lens(vec![]),
            ],
        };
        let res = Resolution {
            width: 40,
            height: 40,
        };
        Rig::from_params(&params, [res, res]).unwrap()
    }

    fn frames() -> [SourceImage; 2] {
        let res = Resolution {
            width: 40,
            height: 40,
        };
        [
            SourceImage::from_fn(res, |u, v| [(u * 6) as u8, (v * 6) as u8, 17]),
            SourceImage::from_fn(res, |u, v| [(v * 5) as u8, 200, (u * 3) as u8]),
        ]
    }

    #[test]
    fn test_cache_file_name() {
        let key = CacheKey {
            template: 1,
            width: 4096,
            height: 2048,
            antialias: 2,
        };
        assert_eq!(key.file_name(), "f_1_4096_2048_2.data");
        assert_eq!(key.stride(), 9);
        assert_eq!(key.table_len(), 4096 * 2048 * 9);
    }

    #[test]
    fn test_runs_end_with_sentinel() {
        let blend = blend_config(2);
        let rig = rig();
        let key = CacheKey::new(0, &blend);
        let table = LookupTable::build(key, &rig.lenses, &blend, 0);

        assert_eq!(table.entries.len(), key.table_len());
        for j in 0..blend.output_height {
            for i in 0..blend.output_width {
                let hits = table.run(i, j).count();
                assert!(hits < key.stride());
                let last = (j as usize * key.width as usize + i as usize + 1) * key.stride() - 1;
                assert_eq!(table.entries[last], LookupEntry::End);
            }
        }
        assert!(table.hits() > 0);
    }

    #[test]
    fn test_entries_are_compact() {
        assert_eq!(std::mem::size_of::<LookupEntry>(), 8);

        let mut blend = blend_config(2);
        let rig = rig();
        let key = CacheKey::new(0, &blend);
        let plain = LookupTable::build(key, &rig.lenses, &blend, 0);
        assert!(!plain.has_radii());

        blend.intensity = Some(Default::default());
        let corrected = LookupTable::build(key, &rig.lenses, &blend, 0);
        assert!(corrected.has_radii());
        assert_eq!(corrected.entries, plain.entries);
        assert_eq!(
            corrected.radii.as_ref().map(Vec::len),
            Some(key.table_len())
        );
    }

    #[test]
    fn test_replay_matches_direct_projection() {
        for intensity in [None, Some(Default::default())] {
            let mut blend = blend_config(2);
            blend.intensity = intensity;
            let rig = rig();
            let images = frames();
            let table = LookupTable::build(CacheKey::new(0, &blend), &rig.lenses, &blend, 0);

            for j in 0..blend.output_height {
                for i in 0..blend.output_width {
                    let direct = sample_pixel(&rig.lenses, &images, &blend, i, j);
                    let replayed = table.sample_pixel(&images, &blend, i, j);
                    assert_eq!(direct, replayed, "pixel ({i}, {j})");
                }
            }
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut blend = blend_config(1);
        let rig = rig();
        let key = CacheKey::new(2, &blend);
        let path = dir.path().join(key.file_name());

        blend.intensity = Some(Default::default());
        let fingerprint = geometry_fingerprint(&rig.lenses, &blend);
        let corrected = LookupTable::build(key, &rig.lenses, &blend, fingerprint);
        corrected.save(&path).unwrap();
        assert_eq!(LookupTable::load(&path, key, fingerprint).unwrap(), corrected);

        blend.intensity = None;
        let fingerprint = geometry_fingerprint(&rig.lenses, &blend);
        let table = LookupTable::build(key, &rig.lenses, &blend, fingerprint);
        table.save(&path).unwrap();
        let loaded = LookupTable::load(&path, key, fingerprint).unwrap();
        assert_eq!(loaded, table);
        assert!(!loaded.has_radii());

        let other_key = CacheKey { antialias: 2, ..key };
        assert!(matches!(
            LookupTable::load(&path, other_key, fingerprint),
            Err(LookupError::Stale { .. })
        ));
        assert!(matches!(
            LookupTable::load(&path, key, fingerprint ^ 1),
            Err(LookupError::Stale { .. })
        ));
    }

    #[test]
    fn test_corrupt_cache_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let blend = blend_config(1);
        let rig = rig();
        let key = CacheKey::new(0, &blend);
        let path = dir.path().join(key.file_name());
        std::fs::write(&path, b"not a table").unwrap();

        let table = LookupTable::load_or_build(dir.path(), key, &rig, &blend);
        assert_eq!(table.entries.len(), key.table_len());
        let reloaded =
            LookupTable::load(&path, key, geometry_fingerprint(&rig.lenses, &blend)).unwrap();
        assert_eq!(reloaded, table);
    }

    #[test]
    fn test_fingerprint_tracks_geometry() {
        let blend = blend_config(1);
        let rig = rig();
        let before = geometry_fingerprint(&rig.lenses, &blend);
        assert_eq!(before, geometry_fingerprint(&rig.lenses, &blend));

        let mut moved = rig.clone();
        moved.lenses[1].fov += 1e-9;
        assert_ne!(before, geometry_fingerprint(&moved.lenses, &blend));

        let mut narrower = blend;
        narrower.blend_width = 2f64.to_radians();
        assert_ne!(before, geometry_fingerprint(&rig.lenses, &narrower));

        // Replay-time settings do not invalidate the table.
        let mut steeper = blend;
        steeper.blend_power = 5.0;
        assert_eq!(before, geometry_fingerprint(&rig.lenses, &steeper));

        // Turning intensity correction on needs a table with radii.
        let mut corrected = blend;
        corrected.intensity = Some(Default::default());
        let with_radii = geometry_fingerprint(&rig.lenses, &corrected);
        assert_ne!(before, with_radii);
        let mut coefficients = corrected;
        if let Some(intensity) = coefficients.intensity.as_mut() {
            intensity.ifcn[1] = 0.5;
        }
        assert_eq!(with_radii, geometry_fingerprint(&rig.lenses, &coefficients));
    }

    #[test]
    fn test_source_size_is_checked() {
        let blend = blend_config(1);
        let rig = rig();
        let table = LookupTable::build(CacheKey::new(0, &blend), &rig.lenses, &blend, 0);
        let small = SourceImage::from_fn(
            Resolution {
                width: 8,
                height: 8,
            },
            |_, _| [0, 0, 0],
        );
        let images = [small.clone(), small];
        let mut out = EquirectImage::new(blend.output_width, blend.output_height);
        assert!(matches!(
            table.render(&images, &blend, &mut out),
            Err(LookupError::SourceMismatch { .. })
        ));
    }

    #[test]
    fn test_render_checks_output_size() {
        let blend = blend_config(1);
        let rig = rig();
        let images = frames();
        let table = LookupTable::build(CacheKey::new(0, &blend), &rig.lenses, &blend, 0);

        let mut wide = EquirectImage::new(blend.output_width * 2, blend.output_height);
        assert!(matches!(
            table.render(&images, &blend, &mut wide),
            Err(LookupError::OutputMismatch {
                expected: (48, 24),
                actual: (96, 24),
            })
        ));

        let mut corrected = blend;
        corrected.intensity = Some(Default::default());
        let mut out = EquirectImage::new(blend.output_width, blend.output_height);
        assert!(matches!(
            table.render(&images, &corrected, &mut out),
            Err(LookupError::MissingRadii)
        ));
        assert!(table.render(&images, &blend, &mut out).is_ok());
    }
}
