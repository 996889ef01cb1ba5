//! Dual Fisheye to Sphere Library
//!
//! A Rust library that maps the two images of a dual fisheye camera onto one
//! equirectangular (spherical) image. It provides:
//! - The equidistant lens model with ordered correction rotations
//! - An antialiased, cross-dissolved projection and sampling engine
//! - Disk-persisted lookup tables for fast conversion of frame sequences
//! - A random local search that calibrates the lenses against their seams
//!
//! Image decoding and encoding go through the `image` crate; everything in
//! between works on raw bottom-up pixel buffers.

pub mod camera;
pub mod color;
pub mod compositor;
pub mod config;
pub mod frame;
pub mod lookup;
pub mod optimization;
pub mod params;
pub mod sampler;

// Re-export commonly used types
pub use camera::{CameraModel, CameraModelError, EquidistantModel, Resolution, Rig};
pub use compositor::{stitch_sequence, stitch_single, Sequence, StitchError};
pub use config::{BlendConfig, Settings};
pub use lookup::{CacheKey, LookupTable};
pub use optimization::{optimize_seams, OptimizationError, SeamOptimizer};
pub use params::RigParams;
