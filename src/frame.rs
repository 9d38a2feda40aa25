//! Frame claims and pixel views.
//!
//! A [`CapturedFrame`] is the transient claim on one pool buffer between the
//! driver hand-off and the unlock that returns the buffer to the capture
//! sequence. It must be unlocked exactly once: explicitly through
//! [`CapturedFrame::unlock`], or implicitly when dropped, so every exit path
//! (including a panicking sink) gives the buffer back.
//!
//! [`OwnedFrame`] holds a copy of the pixels taken before the unlock, for
//! callers that keep frames around (`capture_one`, `capture_n`).
//!
//! Both implement [`FrameView`], which exposes the pixels as `ndarray` views
//! laid out as rows x cols x channels.

use crate::buffer_pool::FrameBuffer;
use crate::driver::{ops, CameraDriver, ColorMode, MemId};
use crate::error::{CameraError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use ndarray::{Array2, ArrayView3, ShapeBuilder};
use std::sync::Arc;

/// Geometry of the pixels behind a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Row stride in bytes.
    pub stride: usize,
    /// Pixel format.
    pub color_mode: ColorMode,
}

impl FrameLayout {
    /// Layout of a pool buffer.
    pub fn of(buffer: &FrameBuffer) -> Self {
        Self {
            width: buffer.width(),
            height: buffer.height(),
            stride: buffer.stride(),
            color_mode: buffer.color_mode(),
        }
    }

    /// Bytes of pixel data in one row, without padding.
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.color_mode.bytes_per_pixel()
    }

    fn check_len(&self, data: &[u8]) -> Result<()> {
        let needed = self.stride * self.height as usize;
        if self.stride == 0 || data.len() < needed || self.stride < self.row_bytes() {
            return Err(CameraError::Codec(format!(
                "frame data holds {} bytes, layout {}x{} (stride {}) needs {}",
                data.len(),
                self.width,
                self.height,
                self.stride,
                needed
            )));
        }
        Ok(())
    }

    /// Rows of pixel data with stride padding removed.
    pub fn rows<'a>(&self, data: &'a [u8]) -> Result<impl Iterator<Item = &'a [u8]> + 'a> {
        self.check_len(data)?;
        let row_bytes = self.row_bytes();
        Ok(data
            .chunks(self.stride)
            .take(self.height as usize)
            .map(move |row| &row[..row_bytes]))
    }

    /// Contiguous copy of the pixel data without stride padding.
    pub fn packed(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.row_bytes() * self.height as usize);
        for row in self.rows(data)? {
            out.extend_from_slice(row);
        }
        Ok(out)
    }

    /// View 8-bit pixel data as rows x cols x channels.
    pub fn view<'a>(&self, data: &'a [u8]) -> Result<ArrayView3<'a, u8>> {
        if self.color_mode.is_wide() {
            return Err(CameraError::Codec(format!(
                "{:?} stores 16-bit samples; use to_u16_image",
                self.color_mode
            )));
        }
        self.check_len(data)?;
        let channels = self.color_mode.channels();
        let shape = (self.height as usize, self.width as usize, channels)
            .strides((self.stride, channels, 1));
        ArrayView3::from_shape(shape, data).map_err(|e| CameraError::Codec(e.to_string()))
    }

    /// Single-channel pixel data as 16-bit values.
    ///
    /// 8-bit samples are widened, 16-bit samples are read little-endian.
    pub fn to_u16(&self, data: &[u8]) -> Result<Array2<u16>> {
        if self.color_mode.channels() != 1 {
            return Err(CameraError::Codec(format!(
                "{:?} has {} channels, expected 1",
                self.color_mode,
                self.color_mode.channels()
            )));
        }
        let wide = self.color_mode.is_wide();
        let mut values = Vec::with_capacity(self.width as usize * self.height as usize);
        for row in self.rows(data)? {
            if wide {
                values.extend(
                    row.chunks_exact(2)
                        .map(|px| u16::from_le_bytes([px[0], px[1]])),
                );
            } else {
                values.extend(row.iter().map(|&v| u16::from(v)));
            }
        }
        Array2::from_shape_vec((self.height as usize, self.width as usize), values)
            .map_err(|e| CameraError::Codec(e.to_string()))
    }
}

/// Read access shared by claimed and owned frames.
pub trait FrameView {
    /// Pixel geometry.
    fn layout(&self) -> FrameLayout;
    /// Raw pixel bytes, rows separated by the layout stride.
    fn pixels(&self) -> &[u8];
    /// Time the frame was fetched.
    fn timestamp(&self) -> DateTime<Utc>;

    /// Capture time in whole milliseconds since the Unix epoch.
    fn timestamp_millis(&self) -> i64 {
        self.timestamp().timestamp_millis()
    }

    /// 8-bit pixels as rows x cols x channels.
    fn as_array(&self) -> Result<ArrayView3<'_, u8>> {
        self.layout().view(self.pixels())
    }

    /// Single-channel pixels as rows x cols of `u16`.
    fn to_u16_image(&self) -> Result<Array2<u16>> {
        self.layout().to_u16(self.pixels())
    }
}

/// Claim on a pool buffer handed out by the driver.
pub struct CapturedFrame {
    driver: Arc<dyn CameraDriver>,
    buffer: Arc<FrameBuffer>,
    data: Bytes,
    sequence: u64,
    timestamp: DateTime<Utc>,
    unlocked: bool,
}

impl std::fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedFrame")
            .field("mem", &self.buffer.mem_id())
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .field("unlocked", &self.unlocked)
            .finish()
    }
}

impl CapturedFrame {
    /// Wrap a buffer the caller has already claimed.
    pub(crate) fn new(
        driver: Arc<dyn CameraDriver>,
        buffer: Arc<FrameBuffer>,
        data: Bytes,
        sequence: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            driver,
            buffer,
            data,
            sequence,
            timestamp,
            unlocked: false,
        }
    }

    /// Driver id of the underlying buffer.
    pub fn buffer_id(&self) -> MemId {
        self.buffer.mem_id()
    }

    /// Underlying pool buffer.
    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    /// Driver frame counter.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Copy the pixels out so they survive the unlock.
    pub fn to_owned_frame(&self) -> OwnedFrame {
        OwnedFrame {
            layout: self.layout(),
            data: Bytes::copy_from_slice(&self.data),
            sequence: self.sequence,
            timestamp: self.timestamp,
        }
    }

    /// Return the buffer to the driver's capture sequence.
    pub fn unlock(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.unlocked {
            return Ok(());
        }
        self.unlocked = true;
        let mem = self.buffer.mem_id();
        // The pool claim goes even if the driver refuses the unlock.
        let unlocked = self.driver.unlock_seq_buf(mem);
        self.buffer.release();
        unlocked.map_err(|code| CameraError::device(ops::UNLOCK_SEQ_BUF, code))?;
        tracing::trace!(%mem, sequence = self.sequence, "Buffer unlocked");
        Ok(())
    }
}

impl FrameView for CapturedFrame {
    fn layout(&self) -> FrameLayout {
        FrameLayout::of(&self.buffer)
    }

    fn pixels(&self) -> &[u8] {
        &self.data
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Drop for CapturedFrame {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::error!(mem = %self.buffer.mem_id(), error = %e, "Failed to unlock buffer");
        }
    }
}

/// Frame whose pixels were copied out of driver memory.
#[derive(Debug, Clone)]
pub struct OwnedFrame {
    layout: FrameLayout,
    data: Bytes,
    sequence: u64,
    timestamp: DateTime<Utc>,
}

impl OwnedFrame {
    /// Build a frame from raw parts.
    pub fn from_parts(layout: FrameLayout, data: Bytes, sequence: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            layout,
            data,
            sequence,
            timestamp,
        }
    }

    /// Driver frame counter.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl FrameView for OwnedFrame {
    fn layout(&self) -> FrameLayout {
        self.layout
    }

    fn pixels(&self) -> &[u8] {
        &self.data
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(width: u32, height: u32, stride: usize, color_mode: ColorMode) -> FrameLayout {
        FrameLayout {
            width,
            height,
            stride,
            color_mode,
        }
    }

    #[test]
    fn view_skips_stride_padding() {
        // 2x2 mono8 with one padding byte per row.
        let data = [1u8, 2, 0xFF, 3, 4, 0xFF];
        let l = layout(2, 2, 3, ColorMode::Mono8);
        let view = l.view(&data).unwrap();
        assert_eq!(view.shape(), &[2, 2, 1]);
        assert_eq!(view[[1, 0, 0]], 3);
        assert_eq!(l.packed(&data).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn rgb_view_has_three_channels() {
        let data: Vec<u8> = (0..12).collect();
        let l = layout(2, 2, 6, ColorMode::Rgb8Packed);
        let view = l.view(&data).unwrap();
        assert_eq!(view.shape(), &[2, 2, 3]);
        assert_eq!(view[[1, 1, 2]], 11);
    }

    #[test]
    fn wide_modes_need_u16_access() {
        let data = [0x34u8, 0x12, 0xFF, 0x0F];
        let l = layout(2, 1, 4, ColorMode::Mono12);
        assert!(l.view(&data).is_err());
        let image = l.to_u16(&data).unwrap();
        assert_eq!(image[[0, 0]], 0x1234);
        assert_eq!(image[[0, 1]], 0x0FFF);
    }

    #[test]
    fn short_data_is_rejected() {
        let l = layout(4, 4, 4, ColorMode::Mono8);
        assert!(matches!(l.view(&[0u8; 8]), Err(CameraError::Codec(_))));
    }

    #[test]
    fn owned_frame_exposes_view() {
        let frame = OwnedFrame::from_parts(
            layout(2, 1, 2, ColorMode::Mono8),
            Bytes::from_static(&[7, 9]),
            4,
            DateTime::from_timestamp_millis(1_500).unwrap(),
        );
        assert_eq!(frame.timestamp_millis(), 1_500);
        assert_eq!(frame.to_u16_image().unwrap()[[0, 1]], 9);
        assert_eq!(frame.sequence(), 4);
    }
}
