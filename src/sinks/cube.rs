//! Hyperspectral cube streaming.

use super::{FrameContext, FrameSink, SinkControl, StopCondition, StopPolicy};
use crate::driver::Rect;
use crate::error::{CameraError, Result};
use crate::frame::{CapturedFrame, FrameView};
use crate::storage::{CubeShape, EnviCube, TimingLog};
use std::path::{Path, PathBuf};

/// Frames between periodic flushes.
pub const DEFAULT_FLUSH_EVERY: u64 = 100;

/// When a cube flush happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPoint {
    /// Periodic flush after the frame at this index.
    Periodic(u64),
    /// Flush at the end of the run.
    Final,
}

/// Streams frames into an ENVI cube at `<folder>/<base_name>`.
///
/// The cube is created on the first frame with `bands = aoi.height`,
/// `lines = aoi.width` and `samples = max_frames`. The frame at index `d`
/// lands at sample `d`. Its timestamp is appended to the timing log. Every
/// `flush_every`-th index (starting at 0) flushes the cube, and `finish`
/// always flushes once more.
pub struct CubeStream {
    base: PathBuf,
    aoi: Rect,
    max_frames: u64,
    flush_every: u64,
    stop: StopCondition,
    cube: Option<EnviCube>,
    timings: Option<TimingLog>,
    flushes: Vec<FlushPoint>,
    frames_written: u64,
}

impl CubeStream {
    /// Cube sink for frames of the given AOI.
    ///
    /// `max_frames` sizes the cube and must be non-zero.
    pub fn new(
        folder: impl AsRef<Path>,
        base_name: &str,
        aoi: Rect,
        max_frames: u64,
        policy: StopPolicy,
    ) -> Result<Self> {
        if max_frames == 0 {
            return Err(CameraError::Configuration(
                "cube streaming requires max_frames > 0".into(),
            ));
        }
        if aoi.width == 0 || aoi.height == 0 {
            return Err(CameraError::Configuration(format!(
                "cube AOI must be non-empty, got {}x{}",
                aoi.width, aoi.height
            )));
        }
        Ok(Self {
            base: folder.as_ref().join(base_name),
            aoi,
            max_frames,
            flush_every: DEFAULT_FLUSH_EVERY,
            stop: StopCondition::new(Some(max_frames), policy),
            cube: None,
            timings: None,
            flushes: Vec::new(),
            frames_written: 0,
        })
    }

    /// Override the flush cadence. Zero disables periodic flushes.
    pub fn with_flush_every(mut self, flush_every: u64) -> Self {
        self.flush_every = flush_every;
        self
    }

    /// Base path of the cube files.
    pub fn base_path(&self) -> &Path {
        &self.base
    }

    /// Flushes performed so far, in order.
    pub fn flushes(&self) -> &[FlushPoint] {
        &self.flushes
    }

    /// Number of flushes performed so far.
    pub fn flush_count(&self) -> usize {
        self.flushes.len()
    }

    /// Frames stored in the cube.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// The cube, once created.
    pub fn cube(&self) -> Option<&EnviCube> {
        self.cube.as_ref()
    }

    fn open(&mut self) -> Result<()> {
        if let Some(parent) = self.base.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let shape = CubeShape::for_frames(self.aoi.width, self.aoi.height, self.max_frames as usize);
        self.cube = Some(EnviCube::create(&self.base, shape)?);
        self.timings = Some(TimingLog::open(TimingLog::path_for(&self.base))?);
        Ok(())
    }

    fn flush(&mut self, point: FlushPoint) -> Result<()> {
        if let Some(cube) = &self.cube {
            cube.flush()?;
        }
        if let Some(timings) = &mut self.timings {
            timings.flush()?;
        }
        self.flushes.push(point);
        tracing::debug!(?point, frames = self.frames_written, "Cube flushed");
        Ok(())
    }
}

impl FrameSink for CubeStream {
    fn name(&self) -> &'static str {
        "cube_stream"
    }

    fn on_frame(&mut self, frame: &CapturedFrame, ctx: &FrameContext) -> Result<SinkControl> {
        if self.cube.is_none() {
            self.open()?;
        }
        let image = frame.to_u16_image()?;
        if let Some(cube) = &mut self.cube {
            cube.write_frame(ctx.index as usize, &image.view())?;
        }
        if let Some(timings) = &mut self.timings {
            timings.append(ctx.capture_time.timestamp_millis())?;
        }
        self.frames_written += 1;

        if self.flush_every > 0 && ctx.index % self.flush_every == 0 {
            self.flush(FlushPoint::Periodic(ctx.index))?;
        }

        if self.stop.should_stop(ctx.index) {
            tracing::info!(
                frame_index = ctx.index,
                written = self.frames_written,
                "Cube frame budget reached"
            );
            return Ok(SinkControl::Stop);
        }
        Ok(SinkControl::Continue)
    }

    fn finish(&mut self) -> Result<()> {
        self.flush(FlushPoint::Final)?;
        tracing::info!(
            path = %self.base.display(),
            frames = self.frames_written,
            "Cube stream finished"
        );
        Ok(())
    }
}
