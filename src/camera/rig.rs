//! The two lenses of a dual fisheye camera, front lens first.

use crate::camera::{CameraModelError, EquidistantModel, Resolution};
use crate::frame::SourceImage;
use crate::params::RigParams;
use log::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct Rig {
    pub lenses: [EquidistantModel; 2],
}

impl Rig {
    /// Finalizes both lens blocks against the size of their frames.
    pub fn from_params(
        params: &RigParams,
        resolutions: [Resolution; 2],
    ) -> Result<Self, CameraModelError> {
        let front = EquidistantModel::from_params(&params.lenses[0], resolutions[0])?;
        let back = EquidistantModel::from_params(&params.lenses[1], resolutions[1])?;
        debug!("Front lens: {front:?}");
        debug!("Back lens: {back:?}");
        Ok(Rig {
            lenses: [front, back],
        })
    }

    /// Replay-ready parameters, image names taken from `source`.
    pub fn to_params(&self, source: &RigParams) -> RigParams {
        RigParams {
            lenses: [
                self.lenses[0].to_params(source.lenses[0].image.clone()),
                self.lenses[1].to_params(source.lenses[1].image.clone()),
            ],
        }
    }

    /// Applies the `HFLIP`/`VFLIP` mirroring of each lens to its decoded frame.
    pub fn mirror_sources(&self, images: &mut [SourceImage; 2]) {
        for (lens, image) in self.lenses.iter().zip(images.iter_mut()) {
            if lens.hflip < 0 || lens.vflip < 0 {
                image.mirror(lens.center, lens.radius, lens.hflip, lens.vflip);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::LensParams;

    #[test]
    fn test_rig_round_trips_params() {
        let params = RigParams {
            lenses: [
                LensParams {
                    image: Some("front.jpg".to_string()),
                    radius: Some(50.0),
                    center: Some((60.0, 49.0)),
                    fov_degrees: 190.0,
                    ..LensParams::default()
                },
                LensParams {
                    image: Some("back.jpg".to_string()),
                    hflip: -1,
                    ..LensParams::default()
                },
            ],
        };
        let res = Resolution {
            width: 120,
            height: 100,
        };
        let rig = Rig::from_params(&params, [res, res]).unwrap();
        let back = rig.to_params(&params);

        assert_eq!(back.lenses[0].image.as_deref(), Some("front.jpg"));
        assert_eq!(back.lenses[0].center, Some((60.0, 49.0)));
        assert_eq!(back.lenses[1].center, Some((60.0, 50.0)));
        assert_eq!(back.lenses[1].radius, Some(50.0));
        assert_eq!(back.lenses[1].hflip, -1);
    }
}
