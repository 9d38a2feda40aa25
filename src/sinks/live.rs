//! Live view dispatch.

use super::{FrameContext, FrameSink, SinkControl};
use crate::error::Result;
use crate::frame::CapturedFrame;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// A view consuming frames (display widget, histogram, ...).
///
/// Closures `FnMut(&CapturedFrame) -> anyhow::Result<()>` implement it.
pub trait FrameHandler: Send {
    /// Consume one frame. The frame must not be retained.
    fn handle(&mut self, frame: &CapturedFrame) -> anyhow::Result<()>;
}

impl<F> FrameHandler for F
where
    F: FnMut(&CapturedFrame) -> anyhow::Result<()> + Send,
{
    fn handle(&mut self, frame: &CapturedFrame) -> anyhow::Result<()> {
        self(frame)
    }
}

/// Forwards every frame to registered handlers in registration order.
///
/// A failing or panicking handler is logged and counted; the remaining
/// handlers still run and the acquisition continues.
#[derive(Default)]
pub struct LiveView {
    handlers: Vec<Box<dyn FrameHandler>>,
    dispatched: u64,
    failures: u64,
}

impl LiveView {
    /// Live view without handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Handlers run in the order they were added.
    pub fn add_handler(&mut self, handler: impl FrameHandler + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// Builder-style [`add_handler`](Self::add_handler).
    pub fn with_handler(mut self, handler: impl FrameHandler + 'static) -> Self {
        self.add_handler(handler);
        self
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Frames dispatched so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Handler calls that returned an error or panicked.
    pub fn handler_failures(&self) -> u64 {
        self.failures
    }
}

impl FrameSink for LiveView {
    fn name(&self) -> &'static str {
        "live_view"
    }

    fn on_frame(&mut self, frame: &CapturedFrame, ctx: &FrameContext) -> Result<SinkControl> {
        for (handler_index, handler) in self.handlers.iter_mut().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(frame))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.failures += 1;
                    tracing::warn!(
                        handler_index,
                        frame_index = ctx.index,
                        error = %e,
                        "View handler failed"
                    );
                }
                Err(_) => {
                    self.failures += 1;
                    tracing::error!(handler_index, frame_index = ctx.index, "View handler panicked");
                }
            }
        }
        self.dispatched += 1;
        Ok(SinkControl::Continue)
    }
}
