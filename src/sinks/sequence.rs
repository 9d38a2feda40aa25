//! Multi-frame capture, one file per frame.

use super::{FrameContext, FrameSink, SinkControl, StopCondition};
use crate::error::Result;
use crate::frame::CapturedFrame;
use crate::storage::FrameWriter;
use std::path::{Path, PathBuf};

/// Writes every frame to `<folder>/<base_name><millis><ext>`.
///
/// `millis` is the capture time truncated to milliseconds, so two frames
/// fetched within the same millisecond map to the same file and the later
/// one overwrites the earlier.
///
/// With a bounded [`StopCondition`] this is a bounded capture, otherwise it
/// streams until the worker is stopped.
pub struct SequenceCapture {
    folder: PathBuf,
    base_name: String,
    writer: Box<dyn FrameWriter>,
    stop: StopCondition,
    folder_ready: bool,
    written: u64,
    last_path: Option<PathBuf>,
}

impl SequenceCapture {
    /// Capture into `folder` with file names starting with `base_name`.
    pub fn new(
        folder: impl Into<PathBuf>,
        base_name: impl Into<String>,
        writer: impl FrameWriter + 'static,
        stop: StopCondition,
    ) -> Self {
        Self {
            folder: folder.into(),
            base_name: base_name.into(),
            writer: Box::new(writer),
            stop,
            folder_ready: false,
            written: 0,
            last_path: None,
        }
    }

    /// Path a frame captured at `millis` is written to.
    pub fn path_for(&self, millis: i64) -> PathBuf {
        self.folder
            .join(format!("{}{}{}", self.base_name, millis, self.writer.extension()))
    }

    /// Files written so far.
    pub fn files_written(&self) -> u64 {
        self.written
    }

    /// Most recently written file.
    pub fn last_path(&self) -> Option<&Path> {
        self.last_path.as_deref()
    }
}

impl FrameSink for SequenceCapture {
    fn name(&self) -> &'static str {
        "sequence_capture"
    }

    fn on_frame(&mut self, frame: &CapturedFrame, ctx: &FrameContext) -> Result<SinkControl> {
        if !self.folder_ready {
            std::fs::create_dir_all(&self.folder)?;
            self.folder_ready = true;
        }
        let path = self.path_for(ctx.capture_time.timestamp_millis());
        self.writer.write(&path, frame)?;
        self.written += 1;
        self.last_path = Some(path);

        if self.stop.should_stop(ctx.index) {
            tracing::info!(
                written = self.written,
                max_frames = ?self.stop.max_frames(),
                policy = ?self.stop.policy(),
                "Frame budget reached"
            );
            return Ok(SinkControl::Stop);
        }
        Ok(SinkControl::Continue)
    }
}
