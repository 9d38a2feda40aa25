//! Frame sinks: the consumers an acquisition worker dispatches frames to.
//!
//! A sink sees every successfully fetched frame, in arrival order, through
//! [`FrameSink::on_frame`]. It returns [`SinkControl::Stop`] to end the run
//! or an error to abort it. The worker unlocks the frame after `on_frame`
//! returns, whatever the outcome, so sinks never unlock themselves.
//!
//! | sink                 | writes                          | stops                   |
//! |----------------------|---------------------------------|-------------------------|
//! | [`LiveView`]         | nothing (forwards to handlers)  | never                   |
//! | [`SingleCapture`]    | one image file                  | after the first frame   |
//! | [`SequenceCapture`]  | one image file per frame        | per [`StopCondition`]   |
//! | [`CubeStream`]       | ENVI cube + timing log          | per [`StopCondition`]   |

pub mod cube;
pub mod live;
pub mod recording;
pub mod sequence;
pub mod single;

pub use cube::{CubeStream, FlushPoint, DEFAULT_FLUSH_EVERY};
pub use live::{FrameHandler, LiveView};
pub use recording::{recording_sink, RecordingRequest};
pub use sequence::SequenceCapture;
pub use single::SingleCapture;

use crate::error::Result;
use crate::frame::CapturedFrame;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the worker should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkControl {
    /// Keep fetching.
    Continue,
    /// End the run after this frame.
    Stop,
}

/// Per-frame information supplied by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    /// Frames processed before this one (missed fetches are not counted).
    pub index: u64,
    /// Time the frame was fetched.
    pub capture_time: DateTime<Utc>,
}

/// Consumer of captured frames.
pub trait FrameSink: Send {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Handle one frame. The frame is unlocked by the caller afterwards.
    fn on_frame(&mut self, frame: &CapturedFrame, ctx: &FrameContext) -> Result<SinkControl>;

    /// Called once when the run ends, however it ends.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl FrameSink for Box<dyn FrameSink> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn on_frame(&mut self, frame: &CapturedFrame, ctx: &FrameContext) -> Result<SinkControl> {
        (**self).on_frame(frame, ctx)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

/// How a frame budget is turned into a stop decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopPolicy {
    /// Stop once `written + 2 > max_frames`, i.e. after `max_frames - 1`
    /// frames (at least one).
    #[default]
    Legacy,
    /// Stop once exactly `max_frames` frames are written.
    Exact,
}

/// Frame budget check run after each written frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StopCondition {
    max_frames: Option<u64>,
    policy: StopPolicy,
}

impl StopCondition {
    /// Never stop on count.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Stop according to `policy` once `max_frames` is reached. `None` or
    /// zero means unbounded.
    pub fn new(max_frames: Option<u64>, policy: StopPolicy) -> Self {
        Self { max_frames, policy }
    }

    /// Configured budget.
    pub fn max_frames(&self) -> Option<u64> {
        self.max_frames.filter(|&max| max > 0)
    }

    /// Configured policy.
    pub fn policy(&self) -> StopPolicy {
        self.policy
    }

    /// Whether to stop after the frame at `index` has been written.
    pub fn should_stop(&self, index: u64) -> bool {
        let Some(max) = self.max_frames() else {
            return false;
        };
        let written = index + 1;
        match self.policy {
            StopPolicy::Legacy => written + 2 > max,
            StopPolicy::Exact => written >= max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames_written(condition: StopCondition) -> u64 {
        (0..1000).find(|&i| condition.should_stop(i)).map_or(1000, |i| i + 1)
    }

    #[test]
    fn legacy_policy_stops_one_short() {
        let condition = StopCondition::new(Some(5), StopPolicy::Legacy);
        assert!(!condition.should_stop(2));
        assert!(condition.should_stop(3));
        assert_eq!(frames_written(condition), 4);
    }

    #[test]
    fn exact_policy_honors_budget() {
        let condition = StopCondition::new(Some(5), StopPolicy::Exact);
        assert!(!condition.should_stop(3));
        assert!(condition.should_stop(4));
        assert_eq!(frames_written(condition), 5);
    }

    #[test]
    fn tiny_budgets_stop_after_first_frame() {
        assert!(StopCondition::new(Some(1), StopPolicy::Legacy).should_stop(0));
        assert!(StopCondition::new(Some(2), StopPolicy::Legacy).should_stop(0));
        assert!(StopCondition::new(Some(1), StopPolicy::Exact).should_stop(0));
    }

    #[test]
    fn zero_or_missing_budget_is_unbounded() {
        assert!(!StopCondition::new(Some(0), StopPolicy::Legacy).should_stop(10_000));
        assert!(!StopCondition::unbounded().should_stop(10_000));
    }
}
