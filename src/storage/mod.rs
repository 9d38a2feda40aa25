//! On-disk output for frame sinks.
//!
//! - [`codec`]: single-image files (`.png`, `.tif`/`.tiff`, `.bmp`) through the
//!   `image` crate.
//! - [`envi`]: memory-mapped ENVI cubes (band-interleaved-by-pixel, 16-bit)
//!   and their companion timing log.

pub mod codec;
pub mod envi;

pub use codec::{FrameWriter, ImageCodecWriter};
pub use envi::{CubeShape, EnviCube, TimingLog};
