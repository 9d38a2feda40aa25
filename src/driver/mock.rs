//! Simulated camera driver.
//!
//! `SimulatedDriver` implements [`CameraDriver`] entirely in process so the
//! buffer pool, capture session and acquisition worker can be exercised
//! without hardware. It reproduces the parts of the vendor contract the
//! acquisition layer depends on:
//!
//! - image memories are allocated, sequenced, locked on hand-off and freed
//!   only while unlocked;
//! - `wait_for_next_image` hands out sequence buffers round-robin, skipping
//!   locked ones (a fully locked sequence behaves like a dropped frame);
//! - frame rate requests are quantized to the frame time increment, so the
//!   applied rate differs slightly from the requested one.
//!
//! Frame delivery is scripted: queued [`SimEvent`]s are consumed first, then
//! the configured [`IdleBehavior`] applies. Every call is counted in
//! [`SimStats`], and one-shot failures can be injected per operation.
//!
//! # Example
//!
//! ```
//! use ueye_daq::driver::mock::{SimEvent, SimulatedDriver};
//!
//! let driver = SimulatedDriver::builder()
//!     .sensor(640, 480)
//!     .script([SimEvent::Frame, SimEvent::Timeout, SimEvent::Frame])
//!     .build();
//! assert_eq!(driver.stats().allocations, 0);
//! ```

use super::{
    ops, AutoParameter, CameraDriver, ColorMode, DriverResult, FlashMode, FlashParams, FrameTimeRange,
    GpioConfig, GpioState, HardwareGain, ImageFormat, ImageHandoff, MemId, PixelClockRange, Rect,
    StatusCode, Subsampling, TriggerMode, WaitMode, IS_CAPTURE_RUNNING, IS_INVALID_CAMERA_HANDLE,
    IS_INVALID_PARAMETER, IS_NO_SUCCESS, IS_SEQ_BUFFER_IS_LOCKED, IS_TIMED_OUT,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

/// One scripted outcome of `wait_for_next_image`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    /// Deliver the next frame.
    Frame,
    /// Report a wait timeout.
    Timeout,
    /// Fail the wait with the given status.
    Error(StatusCode),
}

/// What `wait_for_next_image` does once the script is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdleBehavior {
    /// Keep delivering frames.
    #[default]
    Frames,
    /// Keep timing out.
    Timeouts,
    /// Hang until capture is stopped, then fail with `IS_NO_SUCCESS`.
    /// The wait timeout is ignored.
    Stall,
}

/// Call accounting for assertions in tests.
#[derive(Debug, Clone, Default)]
pub struct SimStats {
    /// `init_camera` calls that succeeded.
    pub inits: u32,
    /// `exit_camera` calls, successful or not.
    pub exit_calls: u32,
    /// Image memories allocated.
    pub allocations: u64,
    /// Image memories freed.
    pub frees: u64,
    /// Frames handed out by `wait_for_next_image`.
    pub frames_delivered: u64,
    /// Waits that timed out.
    pub timeouts: u64,
    /// Successful `unlock_seq_buf` calls.
    pub unlocks: u64,
    /// Unlock calls for a buffer that was not locked.
    pub invalid_unlocks: u64,
    /// Highest number of simultaneously locked buffers.
    pub max_locked: usize,
    /// `capture_video` calls that succeeded.
    pub capture_starts: u32,
    /// Wait mode of every successful `capture_video` call, in order.
    pub capture_waits: Vec<WaitMode>,
    /// `stop_live_video` calls.
    pub capture_stops: u32,
    /// `freeze_video` calls that succeeded.
    pub freezes: u32,
    /// GPIO levels written, in order.
    pub gpio_writes: Vec<GpioState>,
}

#[derive(Debug, Clone, Copy)]
struct SimBuffer {
    width: u32,
    height: u32,
    bits_per_pixel: u32,
    in_sequence: bool,
    locked: bool,
}

#[derive(Debug, Clone, Copy)]
struct InjectedFailure {
    op: &'static str,
    successes_left: u32,
    code: StatusCode,
}

#[derive(Debug)]
struct SimState {
    initialized: bool,
    sensor: (u32, u32),
    aoi: Rect,
    color_mode: ColorMode,
    subsampling: Option<Subsampling>,
    frame_time: FrameTimeRange,
    fps: f64,
    exposure_ms: f64,
    pixel_clock: u32,
    pixel_clock_range: PixelClockRange,
    gain: HardwareGain,
    gain_factor: i32,
    auto: HashMap<AutoParameter, bool>,
    trigger: TriggerMode,
    flash_mode: FlashMode,
    flash_params: FlashParams,
    buffers: BTreeMap<i32, SimBuffer>,
    sequence: Vec<MemId>,
    next_slot: usize,
    next_mem: i32,
    queue_enabled: bool,
    capturing: bool,
    pending_freezes: u32,
    frame_counter: u64,
    script: VecDeque<SimEvent>,
    idle: IdleBehavior,
    failures: Vec<InjectedFailure>,
    stats: SimStats,
}

impl SimState {
    /// Consume an injected failure for `op`, if one is due.
    fn injected(&mut self, op: &'static str) -> DriverResult<()> {
        let Some(pos) = self.failures.iter().position(|f| f.op == op) else {
            return Ok(());
        };
        if self.failures[pos].successes_left > 0 {
            self.failures[pos].successes_left -= 1;
            return Ok(());
        }
        let failure = self.failures.remove(pos);
        Err(failure.code)
    }

    fn ensure_open(&mut self, op: &'static str) -> DriverResult<()> {
        self.injected(op)?;
        if self.initialized {
            Ok(())
        } else {
            Err(IS_INVALID_CAMERA_HANDLE)
        }
    }

    fn locked_count(&self) -> usize {
        self.buffers.values().filter(|b| b.locked).count()
    }

    /// Pick the next unlocked sequence buffer, round-robin.
    fn next_free_slot(&mut self) -> Option<MemId> {
        let len = self.sequence.len();
        for step in 0..len {
            let slot = (self.next_slot + step) % len;
            let mem = self.sequence[slot];
            if self.buffers.get(&mem.0).is_some_and(|b| !b.locked) {
                self.next_slot = (slot + 1) % len;
                return Some(mem);
            }
        }
        None
    }
}

/// Builder for [`SimulatedDriver`].
pub struct SimulatedDriverBuilder {
    sensor: (u32, u32),
    color_mode: ColorMode,
    frame_time: FrameTimeRange,
    pixel_clock_range: PixelClockRange,
    script: Vec<SimEvent>,
    idle: IdleBehavior,
    frame_interval: Duration,
    timeout_delay: Option<Duration>,
}

impl SimulatedDriverBuilder {
    fn new() -> Self {
        Self {
            sensor: (1280, 1024),
            color_mode: ColorMode::Mono8,
            frame_time: FrameTimeRange {
                min: 0.01,
                max: 2.0,
                interval: 0.0001,
            },
            pixel_clock_range: PixelClockRange {
                min: 5,
                max: 43,
                increment: 1,
            },
            script: Vec::new(),
            idle: IdleBehavior::Frames,
            frame_interval: Duration::ZERO,
            timeout_delay: Some(Duration::from_millis(1)),
        }
    }

    /// Full sensor size; the initial AOI covers it.
    pub fn sensor(mut self, width: u32, height: u32) -> Self {
        self.sensor = (width, height);
        self
    }

    /// Initial color mode.
    pub fn color_mode(mut self, mode: ColorMode) -> Self {
        self.color_mode = mode;
        self
    }

    /// Frame time range in seconds.
    pub fn frame_time_range(mut self, min: f64, max: f64, interval: f64) -> Self {
        self.frame_time = FrameTimeRange { min, max, interval };
        self
    }

    /// Pixel clock range in MHz.
    pub fn pixel_clock_range(mut self, min: u32, max: u32) -> Self {
        self.pixel_clock_range = PixelClockRange {
            min,
            max,
            increment: 1,
        };
        self
    }

    /// Events consumed by successive waits.
    pub fn script(mut self, events: impl IntoIterator<Item = SimEvent>) -> Self {
        self.script = events.into_iter().collect();
        self
    }

    /// Behavior after the script runs out.
    pub fn idle(mut self, idle: IdleBehavior) -> Self {
        self.idle = idle;
        self
    }

    /// Delay before each delivered frame.
    pub fn frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Delay before reporting a timeout. `None` waits the full requested
    /// timeout, like the hardware does.
    pub fn timeout_delay(mut self, delay: Option<Duration>) -> Self {
        self.timeout_delay = delay;
        self
    }

    /// Build the driver.
    pub fn build(self) -> SimulatedDriver {
        let (width, height) = self.sensor;
        let fps = 1.0 / self.frame_time.min.max(f64::EPSILON);
        let state = SimState {
            initialized: false,
            sensor: self.sensor,
            aoi: Rect::new(0, 0, width, height),
            color_mode: self.color_mode,
            subsampling: None,
            frame_time: self.frame_time,
            fps,
            exposure_ms: 10.0,
            pixel_clock: self.pixel_clock_range.min,
            pixel_clock_range: self.pixel_clock_range,
            gain: HardwareGain::default(),
            gain_factor: 100,
            auto: HashMap::new(),
            trigger: TriggerMode::Off,
            flash_mode: FlashMode::Off,
            flash_params: FlashParams::default(),
            buffers: BTreeMap::new(),
            sequence: Vec::new(),
            next_slot: 0,
            next_mem: 1,
            queue_enabled: false,
            capturing: false,
            pending_freezes: 0,
            frame_counter: 0,
            script: self.script.into_iter().collect(),
            idle: self.idle,
            failures: Vec::new(),
            stats: SimStats::default(),
        };
        SimulatedDriver {
            state: Mutex::new(state),
            frame_interval: self.frame_interval,
            timeout_delay: self.timeout_delay,
        }
    }
}

/// In-process implementation of the camera driver contract.
pub struct SimulatedDriver {
    state: Mutex<SimState>,
    frame_interval: Duration,
    timeout_delay: Option<Duration>,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SimulatedDriver {
    /// Create a builder with a 1280x1024 mono8 sensor.
    pub fn builder() -> SimulatedDriverBuilder {
        SimulatedDriverBuilder::new()
    }

    /// Snapshot of the call accounting.
    pub fn stats(&self) -> SimStats {
        self.state.lock().stats.clone()
    }

    /// Append events to the wait script.
    pub fn push_events(&self, events: impl IntoIterator<Item = SimEvent>) {
        self.state.lock().script.extend(events);
    }

    /// Change the behavior after the script runs out.
    pub fn set_idle(&self, idle: IdleBehavior) {
        self.state.lock().idle = idle;
    }

    /// Fail the next call of `op` with `code`.
    pub fn fail_next(&self, op: &'static str, code: StatusCode) {
        self.fail_after(op, 0, code);
    }

    /// Let `successes` calls of `op` pass, then fail the following one with `code`.
    pub fn fail_after(&self, op: &'static str, successes: u32, code: StatusCode) {
        self.state.lock().failures.push(InjectedFailure {
            op,
            successes_left: successes,
            code,
        });
    }

    /// Image memories currently allocated.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Image memories currently locked by consumers.
    pub fn locked_buffers(&self) -> usize {
        self.state.lock().locked_count()
    }

    /// Whether continuous capture is running.
    pub fn is_capturing(&self) -> bool {
        self.state.lock().capturing
    }

    /// Whether the image queue was initialized.
    pub fn image_queue_enabled(&self) -> bool {
        self.state.lock().queue_enabled
    }

    /// Current subsampling, if any was applied.
    pub fn subsampling(&self) -> Option<Subsampling> {
        self.state.lock().subsampling
    }

    /// Current hardware gain.
    pub fn hardware_gain(&self) -> HardwareGain {
        self.state.lock().gain
    }

    /// State of an automatic control loop.
    pub fn auto_enabled(&self, parameter: AutoParameter) -> bool {
        self.state.lock().auto.get(&parameter).copied().unwrap_or(false)
    }

    /// Current trigger mode.
    pub fn trigger_mode(&self) -> TriggerMode {
        self.state.lock().trigger
    }

    fn stall_until_stopped(&self) -> DriverResult<ImageHandoff> {
        while self.state.lock().capturing {
            std::thread::sleep(Duration::from_millis(1));
        }
        Err(IS_NO_SUCCESS)
    }

    fn sleep_for_timeout(&self, timeout_ms: u32) {
        let requested = Duration::from_millis(u64::from(timeout_ms));
        let delay = self
            .timeout_delay
            .map_or(requested, |delay| delay.min(requested));
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

/// Fill image memory with a diagonal gradient that shifts every frame.
fn render_frame(width: u32, height: u32, bits_per_pixel: u32, frame: u64) -> Bytes {
    let bytes_pp = (bits_per_pixel / 8).max(1) as usize;
    let (w, h) = (width as usize, height as usize);
    let mut pixels = vec![0u8; w * h * bytes_pp];
    for (y, row) in pixels.chunks_exact_mut(w * bytes_pp).enumerate() {
        for (x, px) in row.chunks_exact_mut(bytes_pp).enumerate() {
            let base = (x + y) as u64 + frame;
            if bytes_pp == 2 {
                px.copy_from_slice(&((base % 4096) as u16).to_le_bytes());
            } else {
                for (c, byte) in px.iter_mut().enumerate() {
                    *byte = ((base + c as u64 * 64) % 256) as u8;
                }
            }
        }
    }
    Bytes::from(pixels)
}

impl CameraDriver for SimulatedDriver {
    fn init_camera(&self) -> DriverResult<()> {
        let mut st = self.state.lock();
        st.injected(ops::INIT_CAMERA)?;
        st.initialized = true;
        st.stats.inits += 1;
        Ok(())
    }

    fn exit_camera(&self) -> DriverResult<()> {
        let mut st = self.state.lock();
        st.stats.exit_calls += 1;
        st.ensure_open(ops::EXIT_CAMERA)?;
        st.initialized = false;
        st.capturing = false;
        st.buffers.clear();
        st.sequence.clear();
        Ok(())
    }

    fn aoi(&self) -> DriverResult<Rect> {
        let mut st = self.state.lock();
        st.ensure_open(ops::GET_AOI)?;
        Ok(st.aoi)
    }

    fn set_aoi(&self, rect: Rect) -> DriverResult<()> {
        let mut st = self.state.lock();
        st.ensure_open(ops::SET_AOI)?;
        if st.capturing {
            return Err(IS_CAPTURE_RUNNING);
        }
        let (sensor_w, sensor_h) = st.sensor;
        let fits = rect.width > 0
            && rect.height > 0
            && rect.x + rect.width <= sensor_w
            && rect.y + rect.height <= sensor_h;
        if !fits {
            return Err(IS_INVALID_PARAMETER);
        }
        st.aoi = rect;
        Ok(())
    }

    fn color_mode(&self) -> DriverResult<ColorMode> {
        let mut st = self.state.lock();
        st.ensure_open(ops::GET_COLOR_MODE)?;
        Ok(st.color_mode)
    }

    fn set_color_mode(&self, mode: ColorMode) -> DriverResult<()> {
        let mut st = self.state.lock();
        st.ensure_open(ops::SET_COLOR_MODE)?;
        if st.capturing {
            return Err(IS_CAPTURE_RUNNING);
        }
        st.color_mode = mode;
        Ok(())
    }

    fn set_subsampling(&self, subsampling: Subsampling) -> DriverResult<()> {
        let mut st = self.state.lock();
        st.ensure_open(ops::SET_SUBSAMPLING)?;
        if !(1..=4).contains(&subsampling.factor) {
            return Err(IS_INVALID_PARAMETER);
        }
        st.subsampling = Some(subsampling);
        Ok(())
    }

    fn image_formats(&self) -> DriverResult<Vec<ImageFormat>> {
        let mut st = self.state.lock();
        st.ensure_open(ops::IMAGE_FORMAT)?;
        let (w, h) = st.sensor;
        Ok(vec![
            ImageFormat {
                id: 1,
                width: w,
                height: h,
                name: format!("{w}x{h} full sensor"),
            },
            ImageFormat {
                id: 2,
                width: w / 2,
                height: h / 2,
                name: format!("{}x{} centered", w / 2, h / 2),
            },
        ])
    }

    fn alloc_image_mem(&self, width: u32, height: u32, bits_per_pixel: u32) -> DriverResult<MemId> {
        let mut st = self.state.lock();
        st.ensure_open(ops::ALLOC_IMAGE_MEM)?;
        if width == 0 || height == 0 || bits_per_pixel == 0 {
            return Err(IS_INVALID_PARAMETER);
        }
        let mem = MemId(st.next_mem);
        st.next_mem += 1;
        st.buffers.insert(
            mem.0,
            SimBuffer {
                width,
                height,
                bits_per_pixel,
                in_sequence: false,
                locked: false,
            },
        );
        st.stats.allocations += 1;
        Ok(mem)
    }

    fn free_image_mem(&self, mem: MemId) -> DriverResult<()> {
        let mut st = self.state.lock();
        st.ensure_open(ops::FREE_IMAGE_MEM)?;
        match st.buffers.get(&mem.0) {
            None => return Err(IS_INVALID_PARAMETER),
            Some(buffer) if buffer.locked => return Err(IS_SEQ_BUFFER_IS_LOCKED),
            Some(_) => {}
        }
        st.buffers.remove(&mem.0);
        st.sequence.retain(|m| *m != mem);
        st.next_slot = 0;
        st.stats.frees += 1;
        Ok(())
    }

    fn add_to_sequence(&self, mem: MemId) -> DriverResult<()> {
        let mut st = self.state.lock();
        st.ensure_open(ops::ADD_TO_SEQUENCE)?;
        let Some(buffer) = st.buffers.get_mut(&mem.0) else {
            return Err(IS_INVALID_PARAMETER);
        };
        buffer.in_sequence = true;
        st.sequence.push(mem);
        Ok(())
    }

    fn init_image_queue(&self) -> DriverResult<()> {
        let mut st = self.state.lock();
        st.ensure_open(ops::INIT_IMAGE_QUEUE)?;
        st.queue_enabled = true;
        Ok(())
    }

    fn capture_video(&self, wait: WaitMode) -> DriverResult<()> {
        let mut st = self.state.lock();
        st.ensure_open(ops::CAPTURE_VIDEO)?;
        if st.sequence.is_empty() {
            return Err(IS_INVALID_PARAMETER);
        }
        st.capturing = true;
        st.stats.capture_starts += 1;
        st.stats.capture_waits.push(wait);
        Ok(())
    }

    fn freeze_video(&self, _wait: WaitMode) -> DriverResult<()> {
        let mut st = self.state.lock();
        st.ensure_open(ops::FREEZE_VIDEO)?;
        if st.sequence.is_empty() {
            return Err(IS_INVALID_PARAMETER);
        }
        st.stats.freezes += 1;
        st.pending_freezes += 1;
        Ok(())
    }

    fn stop_live_video(&self) -> DriverResult<()> {
        let mut st = self.state.lock();
        st.ensure_open(ops::STOP_LIVE_VIDEO)?;
        st.capturing = false;
        st.stats.capture_stops += 1;
        Ok(())
    }

    fn wait_for_next_image(&self, timeout_ms: u32) -> DriverResult<ImageHandoff> {
        let event = {
            let mut st = self.state.lock();
            st.ensure_open(ops::WAIT_FOR_NEXT_IMAGE)?;
            if st.pending_freezes > 0 {
                st.pending_freezes -= 1;
                SimEvent::Frame
            } else if !st.capturing {
                SimEvent::Timeout
            } else {
                let scripted = st.script.pop_front();
                match scripted {
                    Some(event) => event,
                    None if st.idle == IdleBehavior::Stall => {
                        drop(st);
                        return self.stall_until_stopped();
                    }
                    None if st.idle == IdleBehavior::Timeouts => SimEvent::Timeout,
                    None => SimEvent::Frame,
                }
            }
        };

        match event {
            SimEvent::Error(code) => Err(code),
            SimEvent::Timeout => {
                self.sleep_for_timeout(timeout_ms);
                self.state.lock().stats.timeouts += 1;
                Err(IS_TIMED_OUT)
            }
            SimEvent::Frame => {
                if !self.frame_interval.is_zero() {
                    std::thread::sleep(self.frame_interval);
                }
                let mut st = self.state.lock();
                let Some(mem) = st.next_free_slot() else {
                    // Every buffer is held by a consumer: the frame is dropped.
                    drop(st);
                    self.sleep_for_timeout(timeout_ms);
                    self.state.lock().stats.timeouts += 1;
                    return Err(IS_TIMED_OUT);
                };
                let sequence = st.frame_counter;
                st.frame_counter += 1;
                let Some(buffer) = st.buffers.get_mut(&mem.0) else {
                    return Err(IS_INVALID_PARAMETER);
                };
                buffer.locked = true;
                let (width, height, bpp) = (buffer.width, buffer.height, buffer.bits_per_pixel);
                let locked = st.locked_count();
                st.stats.max_locked = st.stats.max_locked.max(locked);
                st.stats.frames_delivered += 1;
                drop(st);
                Ok(ImageHandoff {
                    mem,
                    sequence,
                    data: render_frame(width, height, bpp, sequence),
                })
            }
        }
    }

    fn unlock_seq_buf(&self, mem: MemId) -> DriverResult<()> {
        let mut st = self.state.lock();
        st.ensure_open(ops::UNLOCK_SEQ_BUF)?;
        match st.buffers.get_mut(&mem.0) {
            Some(buffer) if buffer.locked => {
                buffer.locked = false;
                st.stats.unlocks += 1;
                Ok(())
            }
            _ => {
                st.stats.invalid_unlocks += 1;
                Err(IS_INVALID_PARAMETER)
            }
        }
    }

    fn frame_time_range(&self) -> DriverResult<FrameTimeRange> {
        let mut st = self.state.lock();
        st.ensure_open(ops::FRAME_TIME_RANGE)?;
        Ok(st.frame_time)
    }

    fn set_frame_rate(&self, fps: f64) -> DriverResult<f64> {
        let mut st = self.state.lock();
        st.ensure_open(ops::SET_FRAME_RATE)?;
        if fps.is_nan() || fps <= 0.0 {
            return Err(IS_INVALID_PARAMETER);
        }
        let range = st.frame_time;
        let steps = ((1.0 / fps) / range.interval).round();
        let frame_time = (steps * range.interval).clamp(range.min, range.max);
        st.fps = 1.0 / frame_time;
        Ok(st.fps)
    }

    fn frames_per_second(&self) -> DriverResult<f64> {
        let mut st = self.state.lock();
        st.ensure_open(ops::GET_FPS)?;
        Ok(if st.capturing { st.fps } else { 0.0 })
    }

    fn exposure(&self) -> DriverResult<f64> {
        let mut st = self.state.lock();
        st.ensure_open(ops::GET_EXPOSURE)?;
        Ok(st.exposure_ms)
    }

    fn set_exposure(&self, exposure_ms: f64) -> DriverResult<f64> {
        let mut st = self.state.lock();
        st.ensure_open(ops::SET_EXPOSURE)?;
        if exposure_ms < 0.0 {
            return Err(IS_INVALID_PARAMETER);
        }
        let longest = 1000.0 / st.fps;
        st.exposure_ms = exposure_ms.clamp(0.01, longest);
        Ok(st.exposure_ms)
    }

    fn pixel_clock(&self) -> DriverResult<u32> {
        let mut st = self.state.lock();
        st.ensure_open(ops::GET_PIXEL_CLOCK)?;
        Ok(st.pixel_clock)
    }

    fn pixel_clock_range(&self) -> DriverResult<PixelClockRange> {
        let mut st = self.state.lock();
        st.ensure_open(ops::PIXEL_CLOCK_RANGE)?;
        Ok(st.pixel_clock_range)
    }

    fn set_pixel_clock(&self, mhz: u32) -> DriverResult<()> {
        let mut st = self.state.lock();
        st.ensure_open(ops::SET_PIXEL_CLOCK)?;
        let range = st.pixel_clock_range;
        if mhz < range.min || mhz > range.max {
            return Err(IS_INVALID_PARAMETER);
        }
        st.pixel_clock = mhz;
        Ok(())
    }

    fn set_hardware_gain(&self, gain: HardwareGain) -> DriverResult<()> {
        let mut st = self.state.lock();
        st.ensure_open(ops::SET_HARDWARE_GAIN)?;
        let valid = |v: i32| (0..=100).contains(&v);
        if ![gain.master, gain.red, gain.green, gain.blue]
            .into_iter()
            .all(valid)
        {
            return Err(IS_INVALID_PARAMETER);
        }
        st.gain = gain;
        Ok(())
    }

    fn set_gain_factor(&self, factor: i32) -> DriverResult<i32> {
        let mut st = self.state.lock();
        st.ensure_open(ops::SET_GAIN_FACTOR)?;
        st.gain_factor = factor.clamp(100, 1000);
        Ok(st.gain_factor)
    }

    fn set_auto_parameter(&self, parameter: AutoParameter, enabled: bool) -> DriverResult<()> {
        let mut st = self.state.lock();
        st.ensure_open(ops::SET_AUTO_PARAMETER)?;
        st.auto.insert(parameter, enabled);
        Ok(())
    }

    fn set_external_trigger(&self, mode: TriggerMode) -> DriverResult<()> {
        let mut st = self.state.lock();
        st.ensure_open(ops::SET_EXTERNAL_TRIGGER)?;
        st.trigger = mode;
        Ok(())
    }

    fn flash_mode(&self) -> DriverResult<FlashMode> {
        let mut st = self.state.lock();
        st.ensure_open(ops::GET_FLASH_MODE)?;
        Ok(st.flash_mode)
    }

    fn set_flash_mode(&self, mode: FlashMode) -> DriverResult<()> {
        let mut st = self.state.lock();
        st.ensure_open(ops::SET_FLASH_MODE)?;
        st.flash_mode = mode;
        Ok(())
    }

    fn flash_params(&self) -> DriverResult<FlashParams> {
        let mut st = self.state.lock();
        st.ensure_open(ops::GET_FLASH_PARAMS)?;
        Ok(st.flash_params)
    }

    fn min_flash_params(&self) -> DriverResult<FlashParams> {
        let mut st = self.state.lock();
        st.ensure_open(ops::GET_FLASH_PARAMS_MIN)?;
        Ok(FlashParams {
            delay_us: 0,
            duration_us: 8,
        })
    }

    fn set_flash_params(&self, params: FlashParams) -> DriverResult<()> {
        let mut st = self.state.lock();
        st.ensure_open(ops::SET_FLASH_PARAMS)?;
        if params.delay_us < 0 || params.duration_us < 8 {
            return Err(IS_INVALID_PARAMETER);
        }
        st.flash_params = params;
        Ok(())
    }

    fn configure_gpio(&self, config: GpioConfig) -> DriverResult<()> {
        let mut st = self.state.lock();
        st.ensure_open(ops::SET_GPIO)?;
        if config.gpio == 0 || config.gpio > 2 {
            return Err(IS_INVALID_PARAMETER);
        }
        st.stats.gpio_writes.push(config.state);
        Ok(())
    }
}
