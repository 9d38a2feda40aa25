//! Background acquisition worker.
//!
//! An [`AcquisitionWorker`] pulls frames from a [`CaptureSession`] on the
//! tokio blocking pool and hands each one to a [`FrameSink`]. It is
//! single-use: `Idle -> Capturing -> Stopping -> Stopped`.
//!
//! # Run loop
//!
//! ```text
//! while running:
//!     fetch_next(timeout)
//!       Missed  -> warn (frame index, missed count), d unchanged
//!       Frame   -> capt_time = now
//!                  sink.on_frame(frame, {index: d, capt_time})
//!                  unlock frame            (always, also on error or panic)
//!                  d += 1
//!                  Stop  -> stop session, leave loop
//!                  Err   -> leave loop with the error
//!                  panic -> leave loop with SinkPanicked
//! stop session, sink.finish()
//! ```
//!
//! `stop()` only flips the running flag and stops the hardware; a fetch
//! already in progress completes or times out, and a frame it returns is
//! still processed before the loop sees the flag.
//!
//! Counters (`d`, missed, `capt_time`) live in the loop and are returned in
//! the [`WorkerReport`] by [`AcquisitionWorker::join`].

use crate::error::{CameraError, Result};
use crate::frame::FrameView;
use crate::session::{CaptureSession, FetchOutcome};
use crate::sinks::{FrameContext, FrameSink, SinkControl};
use crate::driver::WaitMode;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Fetch timeout used by workers unless configured otherwise.
pub const DEFAULT_WORKER_TIMEOUT_MS: u32 = 1000;

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Created, not started.
    Idle,
    /// Run loop active.
    Capturing,
    /// Stop requested, loop finishing its current fetch.
    Stopping,
    /// Loop exited and capture stopped.
    Stopped,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    /// Frames handed to the sink (`d`).
    pub processed: u64,
    /// Fetches that timed out.
    pub missed: u64,
    /// Fetch time of the last frame, if any arrived.
    pub last_capture: Option<DateTime<Utc>>,
    /// State when the report was taken.
    pub state: WorkerState,
}

struct Shared {
    running: AtomicBool,
    state: Mutex<WorkerState>,
}

impl Shared {
    fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }

    fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut state = self.state.lock();
        match *state {
            WorkerState::Capturing => *state = WorkerState::Stopping,
            WorkerState::Idle => *state = WorkerState::Stopped,
            WorkerState::Stopping | WorkerState::Stopped => {}
        }
    }
}

/// Cloneable handle that stops a running worker from another task.
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
    session: Arc<CaptureSession>,
}

impl StopHandle {
    /// Request the worker to stop and stop the hardware capture.
    pub fn stop(&self) -> Result<()> {
        self.shared.request_stop();
        self.session.stop()
    }

    /// Current worker state.
    pub fn state(&self) -> WorkerState {
        *self.shared.state.lock()
    }
}

/// Stops the session and marks the worker stopped when the loop exits,
/// including by panic.
struct StopGuard {
    shared: Arc<Shared>,
    session: Arc<CaptureSession>,
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!("Acquisition loop panicked, stopping capture");
        }
        self.shared.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.session.stop() {
            tracing::error!(error = %e, "Failed to stop capture after acquisition loop");
        }
        self.shared.set_state(WorkerState::Stopped);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Background task feeding one sink from one capture session.
pub struct AcquisitionWorker<S: FrameSink + 'static> {
    session: Arc<CaptureSession>,
    sink: Option<S>,
    timeout_ms: u32,
    wait_mode: WaitMode,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<(S, Result<WorkerReport>)>>,
}

impl<S: FrameSink + 'static> AcquisitionWorker<S> {
    /// Idle worker with the default 1000 ms fetch timeout.
    pub fn new(session: Arc<CaptureSession>, sink: S) -> Self {
        Self {
            session,
            sink: Some(sink),
            timeout_ms: DEFAULT_WORKER_TIMEOUT_MS,
            wait_mode: WaitMode::DontWait,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                state: Mutex::new(WorkerState::Idle),
            }),
            handle: None,
        }
    }

    /// Override the fetch timeout.
    pub fn with_timeout(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Wait mode used when starting capture.
    pub fn with_wait_mode(mut self, wait_mode: WaitMode) -> Self {
        self.wait_mode = wait_mode;
        self
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        *self.shared.state.lock()
    }

    /// Whether the run loop is still active.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Handle for stopping the worker from elsewhere.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: Arc::clone(&self.shared),
            session: Arc::clone(&self.session),
        }
    }

    /// Start capture and spawn the run loop.
    ///
    /// Must be called from within a tokio runtime. Fails with
    /// `InvalidState` unless the worker is `Idle`.
    pub fn start(&mut self) -> Result<()> {
        let state = self.state();
        if state != WorkerState::Idle {
            return Err(CameraError::InvalidState(format!(
                "worker cannot start from {state:?}; workers are single-use"
            )));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            CameraError::InvalidState(format!("worker needs a tokio runtime: {e}"))
        })?;
        let Some(sink) = self.sink.take() else {
            return Err(CameraError::InvalidState("worker sink already consumed".into()));
        };

        if let Err(e) = self.session.start(self.wait_mode) {
            self.sink = Some(sink);
            return Err(e);
        }
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.set_state(WorkerState::Capturing);
        tracing::info!(sink = sink.name(), timeout_ms = self.timeout_ms, "Acquisition worker started");

        let session = Arc::clone(&self.session);
        let shared = Arc::clone(&self.shared);
        let timeout_ms = self.timeout_ms;
        // The loop runs on a pool thread; carry the caller's span over.
        let span = tracing::info_span!("acquisition", sink = sink.name());
        self.handle = Some(runtime.spawn_blocking(move || {
            let _entered = span.entered();
            run_loop(session, shared, sink, timeout_ms)
        }));
        Ok(())
    }

    /// Request the loop to stop and stop the hardware capture.
    ///
    /// Returns immediately; use [`join`](Self::join) to wait for the loop.
    pub fn stop(&self) -> Result<()> {
        self.stop_handle().stop()
    }

    /// Wait for the loop to exit.
    ///
    /// Returns the run summary, or the error that ended the run (sink I/O
    /// failure, sink panic, driver failure).
    pub async fn join(self) -> Result<WorkerReport> {
        self.join_with_sink().await.1
    }

    /// Like [`join`](Self::join), also handing back the sink. The sink is
    /// `None` only if the loop task itself was lost.
    pub async fn join_with_sink(mut self) -> (Option<S>, Result<WorkerReport>) {
        let Some(handle) = self.handle.take() else {
            let report = WorkerReport {
                processed: 0,
                missed: 0,
                last_capture: None,
                state: self.state(),
            };
            return (self.sink.take(), Ok(report));
        };
        match handle.await {
            Ok((sink, result)) => (Some(sink), result),
            Err(e) => (None, Err(CameraError::WorkerJoin(e.to_string()))),
        }
    }
}

impl<S: FrameSink + 'static> Drop for AcquisitionWorker<S> {
    fn drop(&mut self) {
        if self.handle.is_some() && self.is_running() {
            tracing::warn!("Acquisition worker dropped while running, stopping");
            if let Err(e) = self.stop() {
                tracing::error!(error = %e, "Failed to stop capture on drop");
            }
        }
    }
}

fn run_loop<S: FrameSink>(
    session: Arc<CaptureSession>,
    shared: Arc<Shared>,
    mut sink: S,
    timeout_ms: u32,
) -> (S, Result<WorkerReport>) {
    let guard = StopGuard {
        shared: Arc::clone(&shared),
        session: Arc::clone(&session),
    };

    let mut d: u64 = 0;
    let mut missed: u64 = 0;
    let mut capt_time: Option<DateTime<Utc>> = None;

    let outcome: Result<()> = loop {
        if !shared.running.load(Ordering::SeqCst) {
            break Ok(());
        }

        let frame = match session.fetch_next(timeout_ms) {
            Ok(FetchOutcome::Frame(frame)) => frame,
            Ok(FetchOutcome::Missed) => {
                missed += 1;
                tracing::warn!(frame_index = d, missed, "Missed frame");
                continue;
            }
            Err(e) if !shared.running.load(Ordering::SeqCst) => {
                tracing::debug!(error = %e, "Fetch interrupted by stop");
                break Ok(());
            }
            Err(e) => break Err(e),
        };

        let capture_time = frame.timestamp();
        capt_time = Some(capture_time);
        let ctx = FrameContext {
            index: d,
            capture_time,
        };
        let dispatched = catch_unwind(AssertUnwindSafe(|| sink.on_frame(&frame, &ctx)));
        let unlocked = frame.unlock();
        d += 1;

        match dispatched {
            Ok(Ok(SinkControl::Continue)) => {}
            Ok(Ok(SinkControl::Stop)) => {
                shared.request_stop();
                if let Err(e) = session.stop() {
                    tracing::error!(error = %e, "Failed to stop capture");
                }
            }
            Ok(Err(e)) => {
                tracing::error!(sink = sink.name(), frame_index = ctx.index, error = %e, "Sink failed");
                break Err(e);
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(sink = sink.name(), frame_index = ctx.index, %message, "Sink panicked");
                break Err(CameraError::SinkPanicked(format!("{}: {message}", sink.name())));
            }
        }
        if let Err(e) = unlocked {
            break Err(e);
        }
    };

    drop(guard);

    let finished = match catch_unwind(AssertUnwindSafe(|| sink.finish())) {
        Ok(result) => result,
        Err(payload) => Err(CameraError::SinkPanicked(format!(
            "{}: {}",
            sink.name(),
            panic_message(payload.as_ref())
        ))),
    };

    let state = *shared.state.lock();
    tracing::info!(sink = sink.name(), processed = d, missed, "Acquisition worker stopped");

    let result = outcome.and(finished).map(|()| WorkerReport {
        processed: d,
        missed,
        last_capture: capt_time,
        state,
    });
    (sink, result)
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::device::DeviceHandle;
    use crate::driver::mock::{IdleBehavior, SimEvent, SimulatedDriver};
    use crate::frame::CapturedFrame;
    use tracing_test::traced_test;

    struct Counting {
        seen: u64,
        stop_after: u64,
        finished: bool,
    }

    impl FrameSink for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn on_frame(&mut self, _frame: &CapturedFrame, ctx: &FrameContext) -> Result<SinkControl> {
            assert_eq!(ctx.index, self.seen);
            self.seen += 1;
            if self.seen >= self.stop_after {
                Ok(SinkControl::Stop)
            } else {
                Ok(SinkControl::Continue)
            }
        }

        fn finish(&mut self) -> Result<()> {
            self.finished = true;
            Ok(())
        }
    }

    fn session() -> Arc<CaptureSession> {
        let driver = Arc::new(SimulatedDriver::builder().sensor(32, 16).build());
        let device = Arc::new(DeviceHandle::open_new(driver, 0).unwrap());
        Arc::new(CaptureSession::new(device, 3).unwrap())
    }

    fn counting(stop_after: u64) -> Counting {
        Counting {
            seen: 0,
            stop_after,
            finished: false,
        }
    }

    #[test]
    fn start_outside_runtime_is_invalid() {
        let mut worker = AcquisitionWorker::new(session(), counting(1));
        assert!(matches!(worker.start(), Err(CameraError::InvalidState(_))));
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sink_stop_ends_run_and_finishes_sink() {
        let session = session();
        let mut worker = AcquisitionWorker::new(Arc::clone(&session), counting(3));
        worker.start().unwrap();

        let (sink, report) = worker.join_with_sink().await;
        let report = report.unwrap();
        let sink = sink.unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(report.state, WorkerState::Stopped);
        assert!(report.last_capture.is_some());
        assert!(sink.finished);
        assert!(!session.is_capturing());
        assert_eq!(session.locked_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn worker_is_single_use() {
        let mut worker = AcquisitionWorker::new(session(), counting(1));
        worker.start().unwrap();
        assert!(matches!(worker.start(), Err(CameraError::InvalidState(_))));
        worker.join().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_before_start_prevents_run() {
        let worker = AcquisitionWorker::new(session(), counting(1));
        worker.stop().unwrap();
        worker.stop().unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
        let report = worker.join().await.unwrap();
        assert_eq!(report.processed, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[traced_test]
    async fn missed_frames_do_not_advance_index() {
        let driver = Arc::new(
            SimulatedDriver::builder()
                .sensor(32, 16)
                .script([SimEvent::Timeout, SimEvent::Timeout, SimEvent::Timeout])
                .build(),
        );
        let device = Arc::new(DeviceHandle::open_new(driver, 0).unwrap());
        let session = Arc::new(CaptureSession::new(device, 3).unwrap());

        // Counting asserts the first frame after the misses is index 0.
        let mut worker = AcquisitionWorker::new(session, counting(1)).with_timeout(5);
        worker.start().unwrap();
        let report = worker.join().await.unwrap();

        assert_eq!(report.missed, 3);
        assert_eq!(report.processed, 1);
        assert!(logs_contain("Missed frame"));
        assert!(logs_contain("frame_index=0"));
        assert!(logs_contain("missed=3"));
    }

    #[tokio::test(flavor = "multi_thread")]
    #[traced_test]
    async fn three_timeouts_without_frames_are_all_missed() {
        let driver = Arc::new(
            SimulatedDriver::builder()
                .sensor(32, 16)
                .script([SimEvent::Timeout, SimEvent::Timeout, SimEvent::Timeout])
                .idle(IdleBehavior::Stall)
                .build(),
        );
        let device = Arc::new(DeviceHandle::open_new(driver.clone(), 0).unwrap());
        let session = Arc::new(CaptureSession::new(device, 3).unwrap());

        let mut worker = AcquisitionWorker::new(Arc::clone(&session), counting(1)).with_timeout(5);
        worker.start().unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while session.missed_count() < 3 && std::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        // The fourth wait hangs until capture stops, then fails without a miss.
        worker.stop().unwrap();
        let report = worker.join().await.unwrap();

        assert_eq!(report.missed, 3);
        assert_eq!(report.processed, 0);
        assert!(report.last_capture.is_none());
        assert_eq!(report.state, WorkerState::Stopped);
        assert_eq!(driver.stats().frames_delivered, 0);
        logs_assert(|lines: &[&str]| {
            let missed = lines.iter().filter(|line| line.contains("Missed frame")).count();
            if missed == 3 {
                Ok(())
            } else {
                Err(format!("expected 3 missed frame warnings, got {missed}"))
            }
        });
    }

    #[test]
    fn panic_payloads_are_readable() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&String::from("bang")), "bang");
        assert_eq!(panic_message(&42u8), "unknown panic");
    }
}
