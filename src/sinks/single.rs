//! Single-frame capture to a fixed path.

use super::{FrameContext, FrameSink, SinkControl};
use crate::error::Result;
use crate::frame::CapturedFrame;
use crate::storage::FrameWriter;
use std::path::{Path, PathBuf};

/// Writes the first frame to `path`, then stops the worker.
///
/// At most one file is written per instance, even if the worker delivers
/// another frame before it observes the stop.
pub struct SingleCapture {
    path: PathBuf,
    writer: Box<dyn FrameWriter>,
    written: bool,
}

impl SingleCapture {
    /// Capture to `path` with the given writer.
    pub fn new(path: impl Into<PathBuf>, writer: impl FrameWriter + 'static) -> Self {
        Self {
            path: path.into(),
            writer: Box::new(writer),
            written: false,
        }
    }

    /// Target path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file has been written.
    pub fn is_written(&self) -> bool {
        self.written
    }
}

impl FrameSink for SingleCapture {
    fn name(&self) -> &'static str {
        "single_capture"
    }

    fn on_frame(&mut self, frame: &CapturedFrame, ctx: &FrameContext) -> Result<SinkControl> {
        if self.written {
            return Ok(SinkControl::Stop);
        }
        self.writer.write(&self.path, frame)?;
        self.written = true;
        tracing::info!(path = %self.path.display(), frame_index = ctx.index, "Image saved");
        Ok(SinkControl::Stop)
    }
}
