//! Output assembly and the conversion drivers.
//!
//! The compositor owns the output buffer of a pass. It fills it either by
//! projecting every pixel directly through the lens models, or by replaying a
//! [`LookupTable`]. Rows are independent and are processed in parallel; every
//! pixel is written by exactly one worker, so the result does not depend on
//! scheduling.
//!
//! Two drivers sit on top:
//! * [`stitch_single`] converts one front/back pair named on the command line
//!   or in the parameter file.
//! * [`stitch_sequence`] converts a numbered frame sequence, building or
//!   reusing the lookup table of its frame template once for the whole batch.

use crate::camera::{CameraModel, CameraModelError, Rig};
use crate::config::{BlendConfig, ConfigError, Settings};
use crate::frame::{
    detect_template, load_image, save_image, EquirectImage, FrameError, SequenceName, SourceImage,
};
use crate::lookup::{CacheKey, LookupError, LookupTable};
use crate::params::{ParamsError, RigParams};
use crate::sampler::{sample_geometry, PixelGeometry, SeamError, LENS_COUNT};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::f64::consts::TAU;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(thiserror::Error, Debug)]
pub enum StitchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Params(#[from] ParamsError),
    #[error(transparent)]
    Camera(#[from] CameraModelError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error("No image given for lens {0}")]
    MissingImage(usize),
}

const SEAM_GUIDE: [u8; 3] = [255, 0, 0];

/// Output pixels computed by a direct pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// Every output pixel.
    Full,
    /// Only the seam blend zones; the rest of the buffer is left untouched.
    BlendZones,
}

/// Renders a frame pair by projecting every pixel through both lenses.
///
/// Returns the seam error accumulated over the rendered blend zone pixels.
pub fn render_direct<M: CameraModel + Sync>(
    lenses: &[M; LENS_COUNT],
    images: &[SourceImage; LENS_COUNT],
    blend: &BlendConfig,
    region: Region,
    out: &mut EquirectImage,
) -> SeamError {
    let (width, height) = (out.width, out.height);
    let row_errors: Vec<SeamError> = out
        .pixels_mut()
        .par_chunks_mut(width as usize)
        .enumerate()
        .map(|(j, row)| {
            let j = j as u32;
            let mut error = SeamError::default();
            for (i, pixel) in row.iter_mut().enumerate() {
                let geometry = PixelGeometry::new(i as u32, j, blend);
                if region == Region::BlendZones && !geometry.in_blend_zone {
                    continue;
                }
                let sample = sample_geometry(lenses, images, blend, geometry);
                *pixel = sample.composite().to_rgb8();
                error.add(&sample, j, height);
            }
            error
        })
        .collect();

    row_errors
        .into_iter()
        .fold(SeamError::default(), |mut total, row| {
            total.merge(row);
            total
        })
}

/// Draws the seam meridians and, when blending, the blend zone edges in red.
pub fn draw_seam_guides(out: &mut EquirectImage, blend: &BlendConfig) {
    let width = out.width as f64;
    let quarter = width / 4.0;
    let mut columns = vec![quarter, 3.0 * quarter];
    if blend.blend_width > 0.0 {
        let offset = width * blend.blend_width / TAU;
        columns.extend([
            quarter + offset,
            quarter - offset,
            3.0 * quarter + offset,
            3.0 * quarter - offset,
        ]);
    }
    for column in columns {
        if column < 0.0 {
            continue;
        }
        for j in 0..out.height {
            out.put(column as u32, j, SEAM_GUIDE);
        }
    }
}

/// A parameter file with its lenses finalized against a decoded frame pair.
#[derive(Debug, Clone)]
pub struct StitchInputs {
    pub params: RigParams,
    pub rig: Rig,
    pub images: [SourceImage; LENS_COUNT],
}

/// Loads the parameter file and the frame pair, and mirrors the frames.
///
/// # Arguments
///
/// * `params_path` - Parameter file with exactly two lens blocks.
/// * `images` - Frame paths overriding the `IMAGE:` entries of the file.
pub fn load_inputs(
    params_path: &Path,
    images: Option<&[PathBuf; LENS_COUNT]>,
) -> Result<StitchInputs, StitchError> {
    let mut params = RigParams::load_from_file(params_path)?;
    if let Some(paths) = images {
        for (lens, path) in params.lenses.iter_mut().zip(paths) {
            lens.image = Some(path.display().to_string());
        }
    }

    let mut decoded = Vec::with_capacity(LENS_COUNT);
    for (n, lens) in params.lenses.iter().enumerate() {
        let path = lens.image.as_ref().ok_or(StitchError::MissingImage(n))?;
        decoded.push(load_image(path)?);
    }
    let back = decoded.pop().ok_or(StitchError::MissingImage(1))?;
    let front = decoded.pop().ok_or(StitchError::MissingImage(0))?;
    let mut images = [front, back];

    let rig = Rig::from_params(&params, [images[0].resolution, images[1].resolution])?;
    rig.mirror_sources(&mut images);
    Ok(StitchInputs {
        params,
        rig,
        images,
    })
}

/// Base name of the run artifacts: the parameter file without its extension.
pub fn base_name(params_path: &Path) -> PathBuf {
    params_path.with_extension("")
}

/// Output path of a single conversion, `<base>_sph.jpg` unless given.
pub fn single_output_path(params_path: &Path, output: Option<&Path>) -> PathBuf {
    match output {
        Some(path) if path.extension().is_some() => path.to_path_buf(),
        Some(path) => path.with_extension("jpg"),
        None => {
            let mut name = base_name(params_path).into_os_string();
            name.push("_sph.jpg");
            PathBuf::from(name)
        }
    }
}

/// Converts one frame pair and writes the equirectangular image.
pub fn stitch_single(
    settings: &Settings,
    params_path: &Path,
    images: Option<&[PathBuf; LENS_COUNT]>,
    output: Option<&Path>,
) -> Result<PathBuf, StitchError> {
    let inputs = load_inputs(params_path, images)?;
    let blend = settings.blend_config();
    debug!("Blend configuration: {blend:?}");

    let mut out = EquirectImage::new(blend.output_width, blend.output_height);
    let start = Instant::now();
    render_direct(
        &inputs.rig.lenses,
        &inputs.images,
        &blend,
        Region::Full,
        &mut out,
    );
    debug!("Time for sampling: {:?}", start.elapsed());

    if settings.draw_seam_guides {
        draw_seam_guides(&mut out, &blend);
    }
    let path = single_output_path(params_path, output);
    save_image(&out, &path)?;
    info!("Wrote {}", path.display());
    Ok(path)
}

/// Printf-style names of a numbered frame sequence.
#[derive(Debug, Clone)]
pub struct Sequence {
    pub front: SequenceName,
    pub back: SequenceName,
    pub output: SequenceName,
    pub first: u32,
    pub last: u32,
}

/// Frames written and skipped by a batch conversion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub written: Vec<PathBuf>,
    pub skipped: Vec<u32>,
}

fn load_pair(sequence: &Sequence, frame: u32) -> Result<[SourceImage; LENS_COUNT], FrameError> {
    Ok([
        load_image(sequence.front.format(frame))?,
        load_image(sequence.back.format(frame))?,
    ])
}

/// Converts every frame of a sequence through one shared lookup table.
///
/// The first frame pair fixes the frame template, which must be one of
/// `settings.frame_templates`; failing to read it aborts the batch. Later
/// frames that fail to decode, or whose size differs, are skipped.
pub fn stitch_sequence(
    settings: &Settings,
    params_path: &Path,
    sequence: &Sequence,
) -> Result<BatchSummary, StitchError> {
    let params = RigParams::load_from_file(params_path)?;
    let first = load_pair(sequence, sequence.first)?;
    let template = detect_template(
        &settings.frame_templates,
        first[0].resolution,
        first[1].resolution,
    )?;
    info!(
        "Frames are {}x{}, template {}",
        first[0].width(),
        first[0].height(),
        template
    );

    let rig = Rig::from_params(&params, [first[0].resolution, first[1].resolution])?;
    let blend = settings.blend_config();
    let key = CacheKey::new(template, &blend);
    let table = LookupTable::load_or_build(&settings.cache_dir, key, &rig, &blend);

    let mut summary = BatchSummary::default();
    let mut out = EquirectImage::new(blend.output_width, blend.output_height);
    let mut pending = Some(first);

    for frame in sequence.first..=sequence.last {
        let loaded = match pending.take() {
            Some(pair) => Ok(pair),
            None => load_pair(sequence, frame),
        };
        let mut images = match loaded {
            Ok(images) => images,
            Err(e) => {
                warn!("Skipping frame {frame}: {e}");
                summary.skipped.push(frame);
                continue;
            }
        };
        if let Err(e) = table.check_sources(&images) {
            warn!("Skipping frame {frame}: {e}");
            summary.skipped.push(frame);
            continue;
        }
        rig.mirror_sources(&mut images);

        out.clear();
        table.render(&images, &blend, &mut out)?;
        if settings.draw_seam_guides {
            draw_seam_guides(&mut out, &blend);
        }
        let path = PathBuf::from(sequence.output.format(frame));
        save_image(&out, &path)?;
        debug!("Frame {frame} written to {}", path.display());
        summary.written.push(path);
    }

    info!(
        "Converted {} frames, skipped {}",
        summary.written.len(),
        summary.skipped.len()
    );
    Ok(summary)
}
