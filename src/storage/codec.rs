//! Image file export for captured frames.
//!
//! [`ImageCodecWriter`] encodes one frame per file with the `image` crate.
//! The format is picked from the file extension at construction:
//!
//! | extension       | mono 8-bit | mono 12/16-bit | RGB/BGR | RGBA/BGRA |
//! |-----------------|------------|----------------|---------|-----------|
//! | `.png`          | yes        | yes            | yes     | yes       |
//! | `.tif`, `.tiff` | yes        | yes            | yes     | yes       |
//! | `.bmp`          | yes        | no             | yes     | yes       |
//!
//! BGR-ordered modes are swapped to RGB before encoding. Row stride padding
//! is removed. Encoder failures surface as [`CameraError::Codec`], file
//! system failures as [`CameraError::Io`].

use crate::driver::ColorMode;
use crate::error::{CameraError, Result};
use crate::frame::FrameView;
use image::{GrayImage, ImageBuffer, ImageFormat, Luma, RgbImage, RgbaImage};
use std::path::Path;

/// Extensions accepted by [`ImageCodecWriter::for_extension`].
pub const SUPPORTED_EXTENSIONS: &[&str] = &[".png", ".tif", ".tiff", ".bmp"];

/// Writes a frame to a file.
pub trait FrameWriter: Send {
    /// Encode `frame` to `path`, creating or overwriting the file.
    fn write(&self, path: &Path, frame: &dyn FrameView) -> Result<()>;

    /// File extension including the leading dot.
    fn extension(&self) -> &str;
}

/// [`FrameWriter`] backed by the `image` crate encoders.
#[derive(Debug, Clone)]
pub struct ImageCodecWriter {
    format: ImageFormat,
    extension: String,
}

impl ImageCodecWriter {
    /// Writer for the given extension (with or without the leading dot).
    pub fn for_extension(extension: &str) -> Result<Self> {
        let normalized = format!(".{}", extension.trim_start_matches('.').to_ascii_lowercase());
        let format = match normalized.as_str() {
            ".png" => ImageFormat::Png,
            ".tif" | ".tiff" => ImageFormat::Tiff,
            ".bmp" => ImageFormat::Bmp,
            _ => {
                return Err(CameraError::Configuration(format!(
                    "unsupported file type '{extension}', expected one of {SUPPORTED_EXTENSIONS:?}"
                )))
            }
        };
        Ok(Self {
            format,
            extension: normalized,
        })
    }

    /// PNG writer.
    pub fn png() -> Self {
        Self {
            format: ImageFormat::Png,
            extension: ".png".into(),
        }
    }
}

fn codec_error(what: &str) -> CameraError {
    CameraError::Codec(format!("pixel buffer does not match {what} geometry"))
}

/// Swap the first and third byte of every `step`-byte pixel.
fn swap_red_blue(pixels: &mut [u8], step: usize) {
    for px in pixels.chunks_exact_mut(step) {
        px.swap(0, 2);
    }
}

impl FrameWriter for ImageCodecWriter {
    fn write(&self, path: &Path, frame: &dyn FrameView) -> Result<()> {
        let layout = frame.layout();
        let (width, height) = (layout.width, layout.height);

        match layout.color_mode {
            ColorMode::Mono8 => {
                let packed = layout.packed(frame.pixels())?;
                let image = GrayImage::from_raw(width, height, packed)
                    .ok_or_else(|| codec_error("mono8"))?;
                image.save_with_format(path, self.format)?;
            }
            ColorMode::Mono12 | ColorMode::Mono16 => {
                let values = frame.to_u16_image()?.into_raw_vec_and_offset().0;
                let image: ImageBuffer<Luma<u16>, Vec<u16>> =
                    ImageBuffer::from_raw(width, height, values)
                        .ok_or_else(|| codec_error("mono16"))?;
                image.save_with_format(path, self.format)?;
            }
            ColorMode::Rgb8Packed | ColorMode::Bgr8Packed => {
                let mut packed = layout.packed(frame.pixels())?;
                if layout.color_mode == ColorMode::Bgr8Packed {
                    swap_red_blue(&mut packed, 3);
                }
                let image = RgbImage::from_raw(width, height, packed)
                    .ok_or_else(|| codec_error("rgb8"))?;
                image.save_with_format(path, self.format)?;
            }
            ColorMode::Rgba8Packed | ColorMode::Bgra8Packed => {
                let mut packed = layout.packed(frame.pixels())?;
                if layout.color_mode == ColorMode::Bgra8Packed {
                    swap_red_blue(&mut packed, 4);
                }
                let image = RgbaImage::from_raw(width, height, packed)
                    .ok_or_else(|| codec_error("rgba8"))?;
                image.save_with_format(path, self.format)?;
            }
        }

        tracing::debug!(
            path = %path.display(),
            width,
            height,
            color_mode = ?layout.color_mode,
            "Frame written"
        );
        Ok(())
    }

    fn extension(&self) -> &str {
        &self.extension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameLayout, OwnedFrame};
    use bytes::Bytes;
    use chrono::Utc;
    use tempfile::tempdir;

    fn frame(color_mode: ColorMode, width: u32, height: u32, data: Vec<u8>) -> OwnedFrame {
        let layout = FrameLayout {
            width,
            height,
            stride: width as usize * color_mode.bytes_per_pixel(),
            color_mode,
        };
        OwnedFrame::from_parts(layout, Bytes::from(data), 0, Utc::now())
    }

    #[test]
    fn extension_selects_format() {
        assert_eq!(ImageCodecWriter::for_extension("TIFF").unwrap().extension(), ".tiff");
        assert_eq!(ImageCodecWriter::for_extension(".bmp").unwrap().extension(), ".bmp");
        assert!(matches!(
            ImageCodecWriter::for_extension(".jpg"),
            Err(CameraError::Configuration(_))
        ));
    }

    #[test]
    fn writes_mono8_png() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frame.png");
        let data: Vec<u8> = (0..12).collect();
        ImageCodecWriter::png()
            .write(&path, &frame(ColorMode::Mono8, 4, 3, data))
            .unwrap();

        let decoded = image::open(&path).unwrap().to_luma8();
        assert_eq!(decoded.dimensions(), (4, 3));
        assert_eq!(decoded.get_pixel(1, 2).0[0], 9);
    }

    #[test]
    fn writes_mono16_tiff() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frame.tiff");
        let data: Vec<u8> = [1000u16, 2000, 3000, 4000]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        ImageCodecWriter::for_extension(".tiff")
            .unwrap()
            .write(&path, &frame(ColorMode::Mono16, 2, 2, data))
            .unwrap();

        let decoded = image::open(&path).unwrap().to_luma16();
        assert_eq!(decoded.get_pixel(1, 1).0[0], 4000);
    }

    #[test]
    fn bgr_is_swapped_to_rgb() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frame.png");
        ImageCodecWriter::png()
            .write(&path, &frame(ColorMode::Bgr8Packed, 1, 1, vec![10, 20, 30]))
            .unwrap();

        let decoded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(decoded.get_pixel(0, 0).0, [30, 20, 10]);
    }

    #[test]
    fn missing_folder_is_io_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("frame.png");
        let err = ImageCodecWriter::png()
            .write(&path, &frame(ColorMode::Mono8, 1, 1, vec![0]))
            .unwrap_err();
        assert!(matches!(err, CameraError::Io(_)));
    }
}
