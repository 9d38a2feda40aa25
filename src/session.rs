//! Capture session: start/stop and the blocking fetch primitive.
//!
//! [`CaptureSession`] owns the [`BufferPool`] of one device and drives the
//! driver's continuous capture. `fetch_next` is the only blocking call of
//! the pipeline: it waits up to the given timeout for the driver to hand over
//! a buffer. A timeout is not an error, it yields [`FetchOutcome::Missed`].
//!
//! The session is shared between the controlling thread and the acquisition
//! worker (`Arc<CaptureSession>`); `stop` may be called from either side
//! while a fetch is pending.

use crate::buffer_pool::{BufferPool, FrameBuffer};
use crate::device::DeviceHandle;
use crate::driver::{ops, GpioState, WaitMode, IS_TIMED_OUT};
use crate::error::{CameraError, Result};
use crate::frame::{CapturedFrame, OwnedFrame};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Result of one fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    /// A frame arrived; the buffer stays claimed until the frame is unlocked.
    Frame(CapturedFrame),
    /// The timeout elapsed without a frame.
    Missed,
}

impl FetchOutcome {
    /// Whether the fetch timed out.
    pub fn is_missed(&self) -> bool {
        matches!(self, FetchOutcome::Missed)
    }

    /// The frame, if one arrived.
    pub fn into_frame(self) -> Option<CapturedFrame> {
        match self {
            FetchOutcome::Frame(frame) => Some(frame),
            FetchOutcome::Missed => None,
        }
    }
}

/// Timeout derived from a frame rate: `1.5 / fps + 1` seconds, truncated to
/// whole seconds. A rate of zero counts as 1 fps.
pub fn timeout_for_fps(fps: f64) -> u32 {
    let fps = if fps > 0.0 { fps } else { 1.0 };
    let seconds = (1.5 * (1.0 / fps) + 1.0).floor();
    // Rates slower than ~0.0015 fps would overflow u32 milliseconds.
    (seconds * 1000.0).min(f64::from(u32::MAX)) as u32
}

/// Continuous or single-shot acquisition against one device.
pub struct CaptureSession {
    device: Arc<DeviceHandle>,
    pool: Mutex<BufferPool>,
    capturing: AtomicBool,
    missed: AtomicU64,
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("device", &self.device)
            .field("pool", &*self.pool.lock())
            .field("capturing", &self.is_capturing())
            .finish()
    }
}

impl CaptureSession {
    /// Create a session with its own pool of `buffer_count` buffers.
    pub fn new(device: Arc<DeviceHandle>, buffer_count: usize) -> Result<Self> {
        Ok(Self::with_pool(device, BufferPool::new(buffer_count)?))
    }

    /// Create a session around an existing pool.
    pub fn with_pool(device: Arc<DeviceHandle>, pool: BufferPool) -> Self {
        Self {
            device,
            pool: Mutex::new(pool),
            capturing: AtomicBool::new(false),
            missed: AtomicU64::new(0),
        }
    }

    /// Device this session captures from.
    pub fn device(&self) -> &Arc<DeviceHandle> {
        &self.device
    }

    /// Whether continuous capture is running.
    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    /// Buffers currently claimed by frames.
    pub fn locked_count(&self) -> usize {
        self.pool.lock().locked_count()
    }

    /// Snapshot of the pool buffers.
    pub fn buffers(&self) -> Vec<Arc<FrameBuffer>> {
        self.pool.lock().buffers().to_vec()
    }

    /// Fetches that timed out over the session's lifetime.
    pub fn missed_count(&self) -> u64 {
        self.missed.load(Ordering::Relaxed)
    }

    /// (Re)allocate the buffer pool for the device's current geometry.
    ///
    /// Rejected while capturing.
    pub fn alloc(&self) -> Result<()> {
        if self.is_capturing() {
            return Err(CameraError::InvalidState(
                "cannot reallocate buffers while capturing".into(),
            ));
        }
        self.pool.lock().allocate(&self.device)
    }

    /// Allocate buffers and start continuous capture.
    ///
    /// `WaitMode::Wait` blocks until the first frame is available.
    pub fn start(&self, wait: WaitMode) -> Result<()> {
        if self.is_capturing() || !self.device.try_claim_capture() {
            return Err(CameraError::InvalidState(
                "capture already running on this device".into(),
            ));
        }
        if let Err(e) = self.begin_capture(wait) {
            self.device.set_capture_active(false);
            return Err(e);
        }
        self.capturing.store(true, Ordering::SeqCst);
        tracing::info!(device_id = self.device.device_id(), ?wait, "Capture started");
        Ok(())
    }

    fn begin_capture(&self, wait: WaitMode) -> Result<()> {
        self.pool.lock().allocate(&self.device)?;
        self.device
            .driver()
            .capture_video(wait)
            .map_err(|code| CameraError::device(ops::CAPTURE_VIDEO, code))
    }

    /// Force capture to stop. Calling it when stopped does nothing.
    pub fn stop(&self) -> Result<()> {
        if !self.is_capturing() {
            return Ok(());
        }
        self.device
            .driver()
            .stop_live_video()
            .map_err(|code| CameraError::device(ops::STOP_LIVE_VIDEO, code))?;
        if self.capturing.swap(false, Ordering::SeqCst) {
            self.device.set_capture_active(false);
            tracing::info!(device_id = self.device.device_id(), "Capture stopped");
        }
        Ok(())
    }

    /// Capture a single frame without starting continuous capture.
    ///
    /// The frame is then collected with [`fetch_next`](Self::fetch_next).
    pub fn freeze(&self, wait: WaitMode) -> Result<()> {
        if self.is_capturing() {
            return Err(CameraError::InvalidState(
                "cannot freeze while capturing".into(),
            ));
        }
        if self.pool.lock().is_empty() {
            self.alloc()?;
        }
        self.device
            .driver()
            .freeze_video(wait)
            .map_err(|code| CameraError::device(ops::FREEZE_VIDEO, code))
    }

    /// Timeout for the current frame rate, in milliseconds.
    pub fn default_timeout(&self) -> Result<u32> {
        Ok(timeout_for_fps(self.device.fps()?))
    }

    /// Block until the driver hands over a frame or `timeout_ms` elapses.
    pub fn fetch_next(&self, timeout_ms: u32) -> Result<FetchOutcome> {
        let driver = self.device.driver();
        let handoff = match driver.wait_for_next_image(timeout_ms) {
            Ok(handoff) => handoff,
            Err(IS_TIMED_OUT) => {
                self.missed.fetch_add(1, Ordering::Relaxed);
                return Ok(FetchOutcome::Missed);
            }
            Err(code) => return Err(CameraError::device(ops::WAIT_FOR_NEXT_IMAGE, code)),
        };
        let timestamp = Utc::now();

        let Some(buffer) = self.pool.lock().find(handoff.mem) else {
            // Not ours: give it straight back.
            let _ = driver.unlock_seq_buf(handoff.mem);
            return Err(CameraError::InvalidState(format!(
                "driver returned unknown buffer {}",
                handoff.mem
            )));
        };
        if !buffer.try_claim() {
            let _ = driver.unlock_seq_buf(handoff.mem);
            return Err(CameraError::InvalidState(format!(
                "buffer {} handed out while still claimed",
                handoff.mem
            )));
        }
        Ok(FetchOutcome::Frame(CapturedFrame::new(
            Arc::clone(driver),
            buffer,
            handoff.data,
            handoff.sequence,
            timestamp,
        )))
    }

    /// Start, fetch one frame, unlock it and stop.
    ///
    /// On timeout returns `Ok(None)` and leaves capture running; the caller
    /// must call [`stop`](Self::stop).
    pub fn capture_one(&self, timeout_ms: Option<u32>) -> Result<Option<OwnedFrame>> {
        let timeout_ms = match timeout_ms {
            Some(ms) => ms,
            None => self.default_timeout()?,
        };
        self.start(WaitMode::DontWait)?;
        match self.fetch_next(timeout_ms)? {
            FetchOutcome::Frame(frame) => {
                let owned = frame.to_owned_frame();
                frame.unlock()?;
                self.stop()?;
                Ok(Some(owned))
            }
            FetchOutcome::Missed => {
                tracing::warn!(timeout_ms, "No frame received, capture left running");
                Ok(None)
            }
        }
    }

    /// Start, fetch `count` frames and stop.
    ///
    /// Missed frames are logged and recorded as `None` slots. When `gpio` is
    /// given the line is driven high after start and low before stop.
    pub fn capture_n(
        &self,
        count: usize,
        timeout_ms: Option<u32>,
        gpio: Option<u32>,
    ) -> Result<Vec<Option<OwnedFrame>>> {
        let timeout_ms = match timeout_ms {
            Some(ms) => ms,
            None => self.default_timeout()?,
        };
        self.start(WaitMode::DontWait)?;

        let collected = self.collect_frames(count, timeout_ms, gpio);

        let lowered = match gpio {
            Some(line) => self.device.set_gpio(line, GpioState::Low),
            None => Ok(()),
        };
        let stopped = self.stop();

        let frames = collected?;
        lowered?;
        stopped?;
        Ok(frames)
    }

    fn collect_frames(
        &self,
        count: usize,
        timeout_ms: u32,
        gpio: Option<u32>,
    ) -> Result<Vec<Option<OwnedFrame>>> {
        if let Some(line) = gpio {
            self.device.set_gpio(line, GpioState::High)?;
        }
        let mut frames = Vec::with_capacity(count);
        let mut missed = 0u64;
        for index in 0..count {
            match self.fetch_next(timeout_ms)? {
                FetchOutcome::Frame(frame) => {
                    frames.push(Some(frame.to_owned_frame()));
                    frame.unlock()?;
                }
                FetchOutcome::Missed => {
                    missed += 1;
                    tracing::warn!(frame_index = index, missed, "Missed frame");
                    frames.push(None);
                }
            }
        }
        Ok(frames)
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!(error = %e, "Failed to stop capture on drop");
        }
        if self.device.is_open() {
            if let Err(e) = self.pool.lock().free(&self.device) {
                tracing::warn!(error = %e, "Failed to free buffers on drop");
            }
        }
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::driver::mock::{IdleBehavior, SimEvent, SimulatedDriver};
    use crate::driver::IS_NO_SUCCESS;
    use crate::frame::FrameView;

    fn session_with(driver: SimulatedDriver) -> (Arc<SimulatedDriver>, CaptureSession) {
        let driver = Arc::new(driver);
        let device = Arc::new(DeviceHandle::open_new(driver.clone(), 0).unwrap());
        device.set_aoi(0, 0, 16, 8).unwrap();
        let session = CaptureSession::new(device, 3).unwrap();
        (driver, session)
    }

    #[test]
    fn timeout_follows_frame_rate() {
        assert_eq!(timeout_for_fps(0.0), 2000);
        assert_eq!(timeout_for_fps(1.0), 2000);
        assert_eq!(timeout_for_fps(30.0), 1000);
        assert_eq!(timeout_for_fps(0.5), 4000);
    }

    #[test]
    fn double_start_is_invalid() {
        let (_driver, session) = session_with(SimulatedDriver::default());
        session.start(WaitMode::DontWait).unwrap();
        assert!(matches!(
            session.start(WaitMode::DontWait),
            Err(CameraError::InvalidState(_))
        ));
        assert!(matches!(session.alloc(), Err(CameraError::InvalidState(_))));
    }

    #[test]
    fn stop_is_idempotent() {
        let (driver, session) = session_with(SimulatedDriver::default());
        session.start(WaitMode::DontWait).unwrap();
        session.stop().unwrap();
        session.stop().unwrap();
        assert!(!session.is_capturing());
        assert_eq!(driver.stats().capture_stops, 1);
        assert!(!session.device().is_capture_active());
    }

    #[test]
    fn timeout_is_missed_not_error() {
        let (_driver, session) = session_with(
            SimulatedDriver::builder()
                .sensor(64, 64)
                .idle(IdleBehavior::Timeouts)
                .build(),
        );
        session.start(WaitMode::DontWait).unwrap();
        assert!(session.fetch_next(10).unwrap().is_missed());
        assert_eq!(session.missed_count(), 1);
    }

    #[test]
    fn frame_holds_buffer_until_unlocked() {
        let (driver, session) = session_with(SimulatedDriver::default());
        session.start(WaitMode::DontWait).unwrap();

        let frame = session.fetch_next(100).unwrap().into_frame().unwrap();
        assert_eq!(session.locked_count(), 1);
        assert_eq!(frame.as_array().unwrap().shape(), &[8, 16, 1]);
        frame.unlock().unwrap();
        assert_eq!(session.locked_count(), 0);

        let dropped = session.fetch_next(100).unwrap().into_frame().unwrap();
        drop(dropped);
        assert_eq!(session.locked_count(), 0);
        assert_eq!(driver.stats().unlocks, 2);
        assert_eq!(driver.stats().invalid_unlocks, 0);
    }

    #[test]
    fn capture_one_stops_after_frame() {
        let (driver, session) = session_with(SimulatedDriver::default());
        let frame = session.capture_one(Some(100)).unwrap().unwrap();
        assert_eq!(frame.layout().width, 16);
        assert!(!session.is_capturing());
        assert_eq!(driver.locked_buffers(), 0);
        assert_eq!(driver.stats().capture_waits, vec![WaitMode::DontWait]);
    }

    #[test]
    fn capture_one_timeout_leaves_capture_running() {
        let (_driver, session) = session_with(
            SimulatedDriver::builder()
                .script([SimEvent::Timeout])
                .build(),
        );
        assert!(session.capture_one(Some(10)).unwrap().is_none());
        assert!(session.is_capturing());
        session.stop().unwrap();
    }

    #[test]
    fn capture_n_records_missed_slots_and_toggles_gpio() {
        let (driver, session) = session_with(
            SimulatedDriver::builder()
                .script([SimEvent::Frame, SimEvent::Timeout, SimEvent::Frame])
                .build(),
        );
        let frames = session.capture_n(3, Some(10), Some(1)).unwrap();

        assert_eq!(frames.len(), 3);
        assert!(frames[0].is_some());
        assert!(frames[1].is_none());
        assert!(frames[2].is_some());
        assert_eq!(
            driver.stats().gpio_writes,
            vec![GpioState::High, GpioState::Low]
        );
        assert!(!session.is_capturing());
        assert_eq!(driver.stats().capture_waits, vec![WaitMode::DontWait]);
    }

    #[test]
    fn claim_conflict_gives_buffer_back_to_driver() {
        let (driver, session) = session_with(SimulatedDriver::default());
        session.start(WaitMode::DontWait).unwrap();
        let buffers = session.buffers();
        for buffer in &buffers {
            assert!(buffer.try_claim());
        }

        assert!(matches!(session.fetch_next(10), Err(CameraError::InvalidState(_))));
        assert_eq!(driver.locked_buffers(), 0);
        assert_eq!(driver.stats().unlocks, 1);

        for buffer in &buffers {
            buffer.release();
        }
        session.stop().unwrap();
    }

    #[test]
    fn failed_start_releases_device() {
        let (driver, session) = session_with(SimulatedDriver::default());
        driver.fail_next(ops::CAPTURE_VIDEO, IS_NO_SUCCESS);

        assert!(matches!(
            session.start(WaitMode::DontWait),
            Err(CameraError::Device { code: IS_NO_SUCCESS, .. })
        ));
        assert!(!session.is_capturing());
        assert!(!session.device().is_capture_active());

        session.start(WaitMode::DontWait).unwrap();
        assert!(session.device().is_capture_active());
        session.stop().unwrap();
    }

    #[test]
    fn concurrent_starts_on_one_device_admit_one() {
        let (driver, first) = session_with(SimulatedDriver::default());
        let second = CaptureSession::new(Arc::clone(first.device()), 2).unwrap();
        let barrier = std::sync::Barrier::new(2);

        let (a, b) = std::thread::scope(|scope| {
            let a = scope.spawn(|| {
                barrier.wait();
                first.start(WaitMode::DontWait)
            });
            let b = scope.spawn(|| {
                barrier.wait();
                second.start(WaitMode::DontWait)
            });
            (a.join().unwrap(), b.join().unwrap())
        });

        assert_eq!(usize::from(a.is_ok()) + usize::from(b.is_ok()), 1);
        assert_eq!(driver.stats().capture_starts, 1);
        first.stop().unwrap();
        second.stop().unwrap();
        assert!(!first.device().is_capture_active());
    }

    #[test]
    fn freeze_delivers_one_frame() {
        let (driver, session) = session_with(SimulatedDriver::default());
        session.freeze(WaitMode::Wait).unwrap();
        let frame = session.fetch_next(10).unwrap().into_frame().unwrap();
        frame.unlock().unwrap();
        assert!(session.fetch_next(10).unwrap().is_missed());
        assert_eq!(driver.stats().freezes, 1);
    }

    #[test]
    fn driver_failure_during_wait_is_device_error() {
        let (_driver, session) = session_with(
            SimulatedDriver::builder()
                .script([SimEvent::Error(-1)])
                .build(),
        );
        session.start(WaitMode::DontWait).unwrap();
        assert!(matches!(
            session.fetch_next(10),
            Err(CameraError::Device { code: -1, .. })
        ));
    }
}
