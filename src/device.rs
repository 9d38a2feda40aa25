//! Device handle: driver session ownership and parameter access.
//!
//! [`DeviceHandle`] owns one driver session. It moves through
//! `Uninitialized -> Open -> Closed`; parameter calls are only valid while
//! `Open`. Most accessors are thin pass-throughs that turn a non-success
//! status into [`CameraError::Device`]. The exceptions carry extra logic:
//!
//! - `set_fps` clamps into the range derived from the frame time range and
//!   caches the rate the driver actually applied;
//! - `set_pixelclock` clamps into the driver range and warns, since frame
//!   rate and exposure limits depend on the pixel clock;
//! - geometry changes (AOI, color mode, subsampling) are rejected while a
//!   capture session is running, because they would race the buffer pool.
//!
//! The handle is shared (`Arc<DeviceHandle>`) between the controlling thread
//! and the acquisition worker, so all state uses interior synchronization.

use crate::driver::{
    ops, AutoParameter, CameraDriver, ColorMode, FlashMode, FlashParams, GpioConfig, GpioState,
    HardwareGain, ImageFormat, Rect, StatusCode, Subsampling, SubsamplingDirection, TriggerMode,
    IS_CAPTURE_RUNNING, IS_INVALID_PARAMETER,
};
use crate::error::{CameraError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lifecycle state of a driver session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Not opened yet.
    Uninitialized,
    /// Session open; parameters may be read and written.
    Open,
    /// Session closed (or a failed open). The handle cannot be reopened.
    Closed,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Uninitialized => "uninitialized",
            DeviceState::Open => "open",
            DeviceState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Owner of one camera driver session.
pub struct DeviceHandle {
    driver: Arc<dyn CameraDriver>,
    device_id: u32,
    state: Mutex<DeviceState>,
    current_fps: Mutex<Option<f64>>,
    capture_active: AtomicBool,
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("device_id", &self.device_id)
            .field("state", &*self.state.lock())
            .field("current_fps", &*self.current_fps.lock())
            .field("capture_active", &self.capture_active.load(Ordering::SeqCst))
            .finish()
    }
}

fn check(operation: &'static str, result: std::result::Result<(), StatusCode>) -> Result<()> {
    result.map_err(|code| CameraError::device(operation, code))
}

impl DeviceHandle {
    /// Create an unopened handle for the given camera.
    pub fn new(driver: Arc<dyn CameraDriver>, device_id: u32) -> Self {
        Self {
            driver,
            device_id,
            state: Mutex::new(DeviceState::Uninitialized),
            current_fps: Mutex::new(None),
            capture_active: AtomicBool::new(false),
        }
    }

    /// Create a handle and open it.
    pub fn open_new(driver: Arc<dyn CameraDriver>, device_id: u32) -> Result<Self> {
        let handle = Self::new(driver, device_id);
        handle.open()?;
        Ok(handle)
    }

    /// Driver behind this handle.
    pub fn driver(&self) -> &Arc<dyn CameraDriver> {
        &self.driver
    }

    /// Camera id this handle was created for.
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    /// Whether the session is open.
    pub fn is_open(&self) -> bool {
        self.state() == DeviceState::Open
    }

    /// Open the driver session.
    ///
    /// Only valid from `Uninitialized`. If the driver reports failure the
    /// handle moves to `Closed` and stays unusable.
    pub fn open(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != DeviceState::Uninitialized {
            return Err(CameraError::InvalidState(format!(
                "cannot open device {} in state {}",
                self.device_id, *state
            )));
        }
        match self.driver.init_camera() {
            Ok(()) => {
                *state = DeviceState::Open;
                tracing::info!(device_id = self.device_id, "Camera opened");
                Ok(())
            }
            Err(code) => {
                *state = DeviceState::Closed;
                tracing::error!(
                    device_id = self.device_id,
                    operation = ops::INIT_CAMERA,
                    code,
                    "Failed to open camera"
                );
                Err(CameraError::device(ops::INIT_CAMERA, code))
            }
        }
    }

    /// Close the driver session.
    ///
    /// No-op unless `Open`. On driver failure the state is left unchanged so
    /// the caller may retry.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != DeviceState::Open {
            return Ok(());
        }
        check(ops::EXIT_CAMERA, self.driver.exit_camera())?;
        *state = DeviceState::Closed;
        self.capture_active.store(false, Ordering::SeqCst);
        *self.current_fps.lock() = None;
        tracing::info!(device_id = self.device_id, "Camera closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        let state = self.state();
        if state == DeviceState::Open {
            Ok(())
        } else {
            Err(CameraError::InvalidState(format!(
                "device {} is {}",
                self.device_id, state
            )))
        }
    }

    fn ensure_idle(&self, what: &str) -> Result<()> {
        if self.is_capture_active() {
            return Err(CameraError::InvalidState(format!(
                "cannot change {what} while a capture is running"
            )));
        }
        Ok(())
    }

    /// Mark whether a capture session is running on this device.
    pub(crate) fn set_capture_active(&self, active: bool) {
        self.capture_active.store(active, Ordering::SeqCst);
    }

    /// Claim the device for a capture session. Only one caller wins.
    pub(crate) fn try_claim_capture(&self) -> bool {
        self.capture_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Whether a capture session is running on this device.
    pub fn is_capture_active(&self) -> bool {
        self.capture_active.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Geometry
    // =========================================================================

    /// Current area of interest.
    pub fn aoi(&self) -> Result<Rect> {
        self.ensure_open()?;
        self.driver
            .aoi()
            .map_err(|code| CameraError::device(ops::GET_AOI, code))
    }

    /// Apply a new area of interest.
    ///
    /// Fails with `Parameter` when the driver rejects the rectangle and with
    /// `InvalidState` while capturing. Buffers must be re-allocated afterwards.
    pub fn set_aoi(&self, x: u32, y: u32, width: u32, height: u32) -> Result<()> {
        self.ensure_open()?;
        self.ensure_idle("AOI")?;
        let rect = Rect::new(x, y, width, height);
        match self.driver.set_aoi(rect) {
            Ok(()) => {
                tracing::debug!(x, y, width, height, "AOI set");
                Ok(())
            }
            Err(IS_CAPTURE_RUNNING) => Err(CameraError::InvalidState(
                "driver refused AOI change during capture".into(),
            )),
            Err(code) => Err(CameraError::parameter(ops::SET_AOI, code)),
        }
    }

    /// Current color mode.
    pub fn color_mode(&self) -> Result<ColorMode> {
        self.ensure_open()?;
        self.driver
            .color_mode()
            .map_err(|code| CameraError::device(ops::GET_COLOR_MODE, code))
    }

    /// Apply a color mode. Buffers must be re-allocated afterwards.
    pub fn set_color_mode(&self, mode: ColorMode) -> Result<()> {
        self.ensure_open()?;
        self.ensure_idle("color mode")?;
        self.driver
            .set_color_mode(mode)
            .map_err(|code| CameraError::parameter(ops::SET_COLOR_MODE, code))
    }

    /// Bits per pixel of the current color mode.
    pub fn bits_per_pixel(&self) -> Result<u32> {
        Ok(self.color_mode()?.bits_per_pixel())
    }

    /// Apply readout subsampling. `factor` must be within 1..=4.
    pub fn set_subsampling(&self, factor: u8, direction: SubsamplingDirection) -> Result<()> {
        self.ensure_open()?;
        self.ensure_idle("subsampling")?;
        if !(1..=4).contains(&factor) {
            return Err(CameraError::parameter(ops::SET_SUBSAMPLING, IS_INVALID_PARAMETER));
        }
        self.driver
            .set_subsampling(Subsampling { factor, direction })
            .map_err(|code| CameraError::parameter(ops::SET_SUBSAMPLING, code))
    }

    /// Image formats supported by the camera.
    pub fn format_list(&self) -> Result<Vec<ImageFormat>> {
        self.ensure_open()?;
        self.driver
            .image_formats()
            .map_err(|code| CameraError::device(ops::IMAGE_FORMAT, code))
    }

    // =========================================================================
    // Timing
    // =========================================================================

    /// Frame rate range `(min, max)`.
    ///
    /// The minimum rate is the reciprocal of the *longest* frame time and
    /// the maximum the reciprocal of the *shortest*.
    pub fn fps_range(&self) -> Result<(f64, f64)> {
        self.ensure_open()?;
        let range = self
            .driver
            .frame_time_range()
            .map_err(|code| CameraError::device(ops::FRAME_TIME_RANGE, code))?;
        if range.min.is_nan() || range.max.is_nan() || range.min <= 0.0 || range.max < range.min {
            tracing::error!(min = range.min, max = range.max, "Driver reported an invalid frame time range");
            return Err(CameraError::device(ops::FRAME_TIME_RANGE, IS_INVALID_PARAMETER));
        }
        Ok((1.0 / range.max, 1.0 / range.min))
    }

    /// Request a frame rate.
    ///
    /// The target is clamped into [`fps_range`](Self::fps_range). Returns the
    /// rate the driver applied, which is cached and reported by
    /// [`fps`](Self::fps).
    pub fn set_fps(&self, target: f64) -> Result<f64> {
        let (min, max) = self.fps_range()?;
        let clamped = if target.is_nan() { min } else { target.clamp(min, max) };
        if clamped != target {
            tracing::debug!(requested = target, clamped, "Frame rate clamped into range");
        }
        let actual = self
            .driver
            .set_frame_rate(clamped)
            .map_err(|code| CameraError::device(ops::SET_FRAME_RATE, code))?;
        *self.current_fps.lock() = Some(actual);
        Ok(actual)
    }

    /// Current frame rate: the cached applied rate, or the driver's
    /// measured rate when none was set.
    pub fn fps(&self) -> Result<f64> {
        if let Some(fps) = *self.current_fps.lock() {
            return Ok(fps);
        }
        self.ensure_open()?;
        self.driver
            .frames_per_second()
            .map_err(|code| CameraError::device(ops::GET_FPS, code))
    }

    /// Cached frame rate, without touching the driver.
    pub fn cached_fps(&self) -> Option<f64> {
        *self.current_fps.lock()
    }

    /// Exposure time in milliseconds.
    pub fn exposure(&self) -> Result<f64> {
        self.ensure_open()?;
        self.driver
            .exposure()
            .map_err(|code| CameraError::device(ops::GET_EXPOSURE, code))
    }

    /// Request an exposure time in milliseconds; returns the applied value.
    pub fn set_exposure(&self, exposure_ms: f64) -> Result<f64> {
        self.ensure_open()?;
        self.driver
            .set_exposure(exposure_ms)
            .map_err(|code| CameraError::device(ops::SET_EXPOSURE, code))
    }

    /// Pixel clock in MHz.
    pub fn pixelclock(&self) -> Result<u32> {
        self.ensure_open()?;
        self.driver
            .pixel_clock()
            .map_err(|code| CameraError::device(ops::GET_PIXEL_CLOCK, code))
    }

    /// Valid pixel clock range `(min, max)` in MHz.
    pub fn pixelclock_range(&self) -> Result<(u32, u32)> {
        self.ensure_open()?;
        let range = self
            .driver
            .pixel_clock_range()
            .map_err(|code| CameraError::device(ops::PIXEL_CLOCK_RANGE, code))?;
        Ok((range.min, range.max))
    }

    /// Apply a pixel clock, clamping it into the valid range.
    ///
    /// Returns the value applied.
    pub fn set_pixelclock(&self, mhz: u32) -> Result<u32> {
        let (min, max) = self.pixelclock_range()?;
        tracing::warn!(
            "Changing the pixel clock alters the valid frame rate and exposure ranges; re-check them"
        );
        let applied = mhz.clamp(min, max);
        if mhz < min {
            tracing::warn!(requested = mhz, min, "Pixel clock below range, using minimum");
        } else if mhz > max {
            tracing::warn!(requested = mhz, max, "Pixel clock above range, using maximum");
        }
        check(ops::SET_PIXEL_CLOCK, self.driver.set_pixel_clock(applied))?;
        // Applied rate may no longer be reachable.
        *self.current_fps.lock() = None;
        Ok(applied)
    }

    // =========================================================================
    // Gain
    // =========================================================================

    /// Apply hardware gain (master, red, green, blue; 0..=100 each).
    pub fn set_gain(&self, master: i32, red: i32, green: i32, blue: i32) -> Result<()> {
        self.ensure_open()?;
        let gain = HardwareGain {
            master,
            red,
            green,
            blue,
        };
        check(ops::SET_HARDWARE_GAIN, self.driver.set_hardware_gain(gain))
    }

    /// Apply the master gain factor (100 = 1.0x); returns the applied factor.
    pub fn set_gain_factor(&self, factor: i32) -> Result<i32> {
        self.ensure_open()?;
        self.driver
            .set_gain_factor(factor)
            .map_err(|code| CameraError::device(ops::SET_GAIN_FACTOR, code))
    }

    /// Toggle automatic exposure.
    pub fn set_exposure_auto(&self, enabled: bool) -> Result<()> {
        self.ensure_open()?;
        check(
            ops::SET_AUTO_PARAMETER,
            self.driver.set_auto_parameter(AutoParameter::Shutter, enabled),
        )
    }

    /// Toggle automatic gain.
    pub fn set_gain_auto(&self, enabled: bool) -> Result<()> {
        self.ensure_open()?;
        check(
            ops::SET_AUTO_PARAMETER,
            self.driver.set_auto_parameter(AutoParameter::Gain, enabled),
        )
    }

    // =========================================================================
    // Trigger, flash, GPIO
    // =========================================================================

    /// Apply an external trigger mode.
    pub fn set_trigger_mode(&self, mode: TriggerMode) -> Result<()> {
        self.ensure_open()?;
        check(ops::SET_EXTERNAL_TRIGGER, self.driver.set_external_trigger(mode))
    }

    /// Current flash mode.
    pub fn flash_mode(&self) -> Result<FlashMode> {
        self.ensure_open()?;
        self.driver
            .flash_mode()
            .map_err(|code| CameraError::device(ops::GET_FLASH_MODE, code))
    }

    /// Apply a flash mode.
    pub fn set_flash_mode(&self, mode: FlashMode) -> Result<()> {
        self.ensure_open()?;
        check(ops::SET_FLASH_MODE, self.driver.set_flash_mode(mode))
    }

    /// Current flash timing.
    pub fn flash_params(&self) -> Result<FlashParams> {
        self.ensure_open()?;
        self.driver
            .flash_params()
            .map_err(|code| CameraError::device(ops::GET_FLASH_PARAMS, code))
    }

    /// Minimum flash timing supported by the camera.
    pub fn min_flash_params(&self) -> Result<FlashParams> {
        self.ensure_open()?;
        self.driver
            .min_flash_params()
            .map_err(|code| CameraError::device(ops::GET_FLASH_PARAMS_MIN, code))
    }

    /// Apply flash timing.
    pub fn set_flash_params(&self, delay_us: i32, duration_us: u32) -> Result<()> {
        self.ensure_open()?;
        let params = FlashParams {
            delay_us,
            duration_us,
        };
        check(ops::SET_FLASH_PARAMS, self.driver.set_flash_params(params))
    }

    /// Drive a GPIO line as output at the given level.
    pub fn set_gpio(&self, gpio: u32, state: GpioState) -> Result<()> {
        self.ensure_open()?;
        check(
            ops::SET_GPIO,
            self.driver.configure_gpio(GpioConfig { gpio, state }),
        )
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(device_id = self.device_id, error = %e, "Failed to close camera on drop");
        }
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::driver::mock::SimulatedDriver;
    use crate::driver::IS_NO_SUCCESS;
    use tracing_test::traced_test;

    fn open_device(driver: &Arc<SimulatedDriver>) -> DeviceHandle {
        let dyn_driver: Arc<dyn CameraDriver> = driver.clone();
        DeviceHandle::open_new(dyn_driver, 0).unwrap()
    }

    #[test]
    fn open_failure_leaves_handle_closed() {
        let driver = Arc::new(SimulatedDriver::default());
        driver.fail_next(ops::INIT_CAMERA, IS_NO_SUCCESS);
        let handle = DeviceHandle::new(driver.clone(), 0);

        let err = handle.open().unwrap_err();
        assert!(matches!(err, CameraError::Device { code: IS_NO_SUCCESS, .. }));
        assert_eq!(handle.state(), DeviceState::Closed);
        assert!(matches!(handle.open(), Err(CameraError::InvalidState(_))));
        assert!(matches!(handle.aoi(), Err(CameraError::InvalidState(_))));
    }

    #[test]
    fn close_is_idempotent() {
        let driver = Arc::new(SimulatedDriver::default());
        let handle = open_device(&driver);

        handle.close().unwrap();
        handle.close().unwrap();
        assert_eq!(handle.state(), DeviceState::Closed);
        assert_eq!(driver.stats().exit_calls, 1);
    }

    #[test]
    fn failed_close_keeps_state_for_retry() {
        let driver = Arc::new(SimulatedDriver::default());
        let handle = open_device(&driver);
        driver.fail_next(ops::EXIT_CAMERA, IS_NO_SUCCESS);

        assert!(handle.close().is_err());
        assert_eq!(handle.state(), DeviceState::Open);
        handle.close().unwrap();
        assert_eq!(handle.state(), DeviceState::Closed);
    }

    #[test]
    fn drop_closes_open_device() {
        let driver = Arc::new(SimulatedDriver::default());
        drop(open_device(&driver));
        assert_eq!(driver.stats().exit_calls, 1);
    }

    #[test]
    fn rejected_aoi_is_parameter_error() {
        let driver = Arc::new(SimulatedDriver::builder().sensor(640, 480).build());
        let handle = open_device(&driver);

        let err = handle.set_aoi(0, 0, 1000, 480).unwrap_err();
        assert!(matches!(err, CameraError::Parameter { .. }));
        handle.set_aoi(0, 0, 320, 240).unwrap();
        assert_eq!(handle.aoi().unwrap(), Rect::new(0, 0, 320, 240));
    }

    #[test]
    fn geometry_changes_rejected_while_capturing() {
        let driver = Arc::new(SimulatedDriver::default());
        let handle = open_device(&driver);
        handle.set_capture_active(true);

        assert!(matches!(
            handle.set_aoi(0, 0, 64, 64),
            Err(CameraError::InvalidState(_))
        ));
        assert!(matches!(
            handle.set_color_mode(ColorMode::Mono16),
            Err(CameraError::InvalidState(_))
        ));
    }

    #[test]
    fn fps_range_is_inverted_frame_time_range() {
        let driver = Arc::new(
            SimulatedDriver::builder()
                .frame_time_range(0.01, 2.0, 0.0001)
                .build(),
        );
        let handle = open_device(&driver);
        let (min, max) = handle.fps_range().unwrap();
        assert!((min - 0.5).abs() < 1e-9);
        assert!((max - 100.0).abs() < 1e-9);
    }

    #[test]
    fn inverted_frame_time_range_is_a_device_error() {
        let driver = Arc::new(
            SimulatedDriver::builder()
                .frame_time_range(0.5, 0.1, 0.0001)
                .build(),
        );
        let handle = open_device(&driver);

        assert!(matches!(
            handle.fps_range(),
            Err(CameraError::Device { code: IS_INVALID_PARAMETER, .. })
        ));
        assert!(matches!(handle.set_fps(25.0), Err(CameraError::Device { .. })));
        assert_eq!(handle.cached_fps(), None);
    }

    #[test]
    fn set_fps_clamps_and_reports_actual() {
        let driver = Arc::new(
            SimulatedDriver::builder()
                .frame_time_range(0.01, 2.0, 0.003)
                .build(),
        );
        let handle = open_device(&driver);

        let low = handle.set_fps(0.01).unwrap();
        assert!((low - 0.5).abs() < 0.01);

        let high = handle.set_fps(1000.0).unwrap();
        assert!((high - 100.0).abs() < 1e-6);

        let actual = handle.set_fps(30.0).unwrap();
        assert!((actual - 30.0).abs() > 1e-6);
        assert_eq!(handle.fps().unwrap(), actual);
    }

    #[test]
    fn fps_queries_driver_without_cache() {
        let driver = Arc::new(SimulatedDriver::default());
        let handle = open_device(&driver);
        assert_eq!(handle.cached_fps(), None);
        assert_eq!(handle.fps().unwrap(), 0.0);
    }

    #[test]
    #[traced_test]
    fn pixelclock_out_of_range_is_clamped_with_warning() {
        let driver = Arc::new(SimulatedDriver::builder().pixel_clock_range(5, 43).build());
        let handle = open_device(&driver);

        assert_eq!(handle.set_pixelclock(100).unwrap(), 43);
        assert_eq!(handle.pixelclock().unwrap(), 43);
        assert!(logs_contain("Pixel clock above range"));
        assert!(logs_contain("re-check them"));

        assert_eq!(handle.set_pixelclock(1).unwrap(), 5);
        assert!(logs_contain("Pixel clock below range"));
    }

    #[test]
    fn subsampling_factor_is_validated() {
        let driver = Arc::new(SimulatedDriver::default());
        let handle = open_device(&driver);

        assert!(matches!(
            handle.set_subsampling(5, SubsamplingDirection::Vertical),
            Err(CameraError::Parameter { .. })
        ));
        handle
            .set_subsampling(2, SubsamplingDirection::Horizontal)
            .unwrap();
        assert_eq!(driver.subsampling().map(|s| s.factor), Some(2));
    }

    #[test]
    fn pass_through_accessors_reach_driver() {
        let driver = Arc::new(SimulatedDriver::default());
        let handle = open_device(&driver);

        handle.set_gain(50, 10, 20, 30).unwrap();
        assert_eq!(driver.hardware_gain().master, 50);
        handle.set_exposure_auto(true).unwrap();
        assert!(driver.auto_enabled(AutoParameter::Shutter));
        handle.set_trigger_mode(TriggerMode::LoHi).unwrap();
        assert_eq!(driver.trigger_mode(), TriggerMode::LoHi);
        handle.set_flash_mode(FlashMode::ConstantHigh).unwrap();
        assert_eq!(handle.flash_mode().unwrap(), FlashMode::ConstantHigh);
        let min = handle.min_flash_params().unwrap();
        handle.set_flash_params(0, min.duration_us).unwrap();
        handle.set_gpio(1, GpioState::High).unwrap();
        assert_eq!(driver.stats().gpio_writes, vec![GpioState::High]);
        assert!(matches!(
            handle.set_gain(200, 0, 0, 0),
            Err(CameraError::Device { .. })
        ));
    }
}
