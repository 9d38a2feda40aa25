//! Camera driver boundary.
//!
//! Every device, buffer and capture operation of the acquisition layer goes
//! through [`CameraDriver`]. Implementations wrap the vendor SDK (or, with the
//! `mock` feature, the in-process [`mock::SimulatedDriver`]). Each call reports
//! success or a raw status code; the layers above translate non-success codes
//! into [`crate::CameraError`] values.
//!
//! The trait takes `&self` everywhere: the vendor API is callable from any
//! thread once a camera is initialized, so implementations carry their own
//! interior synchronization. This lets the acquisition worker block in
//! [`CameraDriver::wait_for_next_image`] while the controlling thread issues
//! `stop_live_video` or reads parameters.

#[cfg(feature = "mock")]
pub mod mock;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Raw status code returned by the driver.
pub type StatusCode = i32;

/// Result of a driver call: the payload, or the non-success status code.
pub type DriverResult<T> = std::result::Result<T, StatusCode>;

/// Generic failure.
pub const IS_NO_SUCCESS: StatusCode = -1;
/// Success.
pub const IS_SUCCESS: StatusCode = 0;
/// The camera handle is not valid (camera not initialized or already exited).
pub const IS_INVALID_CAMERA_HANDLE: StatusCode = 1;
/// A wait call elapsed before an image arrived.
pub const IS_TIMED_OUT: StatusCode = 122;
/// A parameter was out of range or otherwise rejected.
pub const IS_INVALID_PARAMETER: StatusCode = 125;
/// The operation is not permitted while a capture is running.
pub const IS_CAPTURE_RUNNING: StatusCode = 140;
/// The image memory is locked by a consumer.
pub const IS_SEQ_BUFFER_IS_LOCKED: StatusCode = 151;

/// Vendor operation names, used to tag errors and to inject simulated failures.
pub mod ops {
    #![allow(missing_docs)]
    pub const INIT_CAMERA: &str = "is_InitCamera";
    pub const EXIT_CAMERA: &str = "is_ExitCamera";
    pub const GET_AOI: &str = "is_AOI(get)";
    pub const SET_AOI: &str = "is_AOI(set)";
    pub const GET_COLOR_MODE: &str = "is_SetColorMode(get)";
    pub const SET_COLOR_MODE: &str = "is_SetColorMode";
    pub const SET_SUBSAMPLING: &str = "is_SetSubSampling";
    pub const IMAGE_FORMAT: &str = "is_ImageFormat";
    pub const ALLOC_IMAGE_MEM: &str = "is_AllocImageMem";
    pub const FREE_IMAGE_MEM: &str = "is_FreeImageMem";
    pub const ADD_TO_SEQUENCE: &str = "is_AddToSequence";
    pub const INIT_IMAGE_QUEUE: &str = "is_InitImageQueue";
    pub const CAPTURE_VIDEO: &str = "is_CaptureVideo";
    pub const FREEZE_VIDEO: &str = "is_FreezeVideo";
    pub const STOP_LIVE_VIDEO: &str = "is_StopLiveVideo";
    pub const WAIT_FOR_NEXT_IMAGE: &str = "is_WaitForNextImage";
    pub const UNLOCK_SEQ_BUF: &str = "is_UnlockSeqBuf";
    pub const FRAME_TIME_RANGE: &str = "is_GetFrameTimeRange";
    pub const SET_FRAME_RATE: &str = "is_SetFrameRate";
    pub const GET_FPS: &str = "is_GetFramesPerSecond";
    pub const GET_EXPOSURE: &str = "is_Exposure(get)";
    pub const SET_EXPOSURE: &str = "is_Exposure(set)";
    pub const GET_PIXEL_CLOCK: &str = "is_PixelClock(get)";
    pub const PIXEL_CLOCK_RANGE: &str = "is_PixelClock(range)";
    pub const SET_PIXEL_CLOCK: &str = "is_PixelClock(set)";
    pub const SET_HARDWARE_GAIN: &str = "is_SetHardwareGain";
    pub const SET_GAIN_FACTOR: &str = "is_SetHWGainFactor";
    pub const SET_AUTO_PARAMETER: &str = "is_SetAutoParameter";
    pub const SET_EXTERNAL_TRIGGER: &str = "is_SetExternalTrigger";
    pub const GET_FLASH_MODE: &str = "is_IO(flash_get_mode)";
    pub const SET_FLASH_MODE: &str = "is_IO(flash_set_mode)";
    pub const GET_FLASH_PARAMS: &str = "is_IO(flash_get_params)";
    pub const GET_FLASH_PARAMS_MIN: &str = "is_IO(flash_get_params_min)";
    pub const SET_FLASH_PARAMS: &str = "is_IO(flash_set_params)";
    pub const SET_GPIO: &str = "is_IO(gpio_set_configuration)";
}

/// Rectangular area of interest on the sensor, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    /// Horizontal offset.
    pub x: u32,
    /// Vertical offset.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Rect {
    /// Create a new rectangle.
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Pixel color mode of the sensor output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    /// 8-bit monochrome.
    Mono8,
    /// 12-bit monochrome in 16-bit containers.
    Mono12,
    /// 16-bit monochrome.
    Mono16,
    /// 24-bit packed RGB.
    Rgb8Packed,
    /// 24-bit packed BGR.
    Bgr8Packed,
    /// 32-bit packed RGBA.
    Rgba8Packed,
    /// 32-bit packed BGRA.
    Bgra8Packed,
}

impl ColorMode {
    /// Bits occupied by one pixel in image memory.
    pub const fn bits_per_pixel(self) -> u32 {
        match self {
            ColorMode::Mono8 => 8,
            ColorMode::Mono12 | ColorMode::Mono16 => 16,
            ColorMode::Rgb8Packed | ColorMode::Bgr8Packed => 24,
            ColorMode::Rgba8Packed | ColorMode::Bgra8Packed => 32,
        }
    }

    /// Number of color channels per pixel.
    pub const fn channels(self) -> usize {
        match self {
            ColorMode::Mono8 | ColorMode::Mono12 | ColorMode::Mono16 => 1,
            ColorMode::Rgb8Packed | ColorMode::Bgr8Packed => 3,
            ColorMode::Rgba8Packed | ColorMode::Bgra8Packed => 4,
        }
    }

    /// Bytes occupied by one pixel in image memory.
    pub const fn bytes_per_pixel(self) -> usize {
        (self.bits_per_pixel() / 8) as usize
    }

    /// Whether each channel is stored in two bytes.
    pub const fn is_wide(self) -> bool {
        matches!(self, ColorMode::Mono12 | ColorMode::Mono16)
    }
}

/// Whether a capture call blocks until the first image is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitMode {
    /// Block until the first frame arrives.
    Wait,
    /// Return immediately.
    #[default]
    DontWait,
}

/// Driver-assigned identifier of an image memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemId(pub i32);

impl std::fmt::Display for MemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mem#{}", self.0)
    }
}

/// Image memory handed over by a successful wait.
///
/// The buffer stays locked inside the driver until
/// [`CameraDriver::unlock_seq_buf`] is called with the same id.
#[derive(Debug, Clone)]
pub struct ImageHandoff {
    /// Memory that received the image.
    pub mem: MemId,
    /// Driver frame counter.
    pub sequence: u64,
    /// Read-only image bytes (row stride as allocated).
    pub data: Bytes,
}

/// Frame time range reported by the driver, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTimeRange {
    /// Shortest frame time.
    pub min: f64,
    /// Longest frame time.
    pub max: f64,
    /// Frame time increment.
    pub interval: f64,
}

/// Pixel clock range reported by the driver, in MHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelClockRange {
    /// Lowest pixel clock.
    pub min: u32,
    /// Highest pixel clock.
    pub max: u32,
    /// Increment between valid values.
    pub increment: u32,
}

/// Hardware gain settings (0..=100 each).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HardwareGain {
    /// Master gain.
    pub master: i32,
    /// Red channel gain.
    pub red: i32,
    /// Green channel gain.
    pub green: i32,
    /// Blue channel gain.
    pub blue: i32,
}

/// Automatic parameter control toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AutoParameter {
    /// Automatic exposure (shutter).
    Shutter,
    /// Automatic gain.
    Gain,
}

/// Readout subsampling direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubsamplingDirection {
    /// Skip rows.
    Vertical,
    /// Skip columns.
    Horizontal,
}

/// Subsampling setting: factor 1 disables subsampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subsampling {
    /// Subsampling factor (1..=4).
    pub factor: u8,
    /// Direction the factor applies to.
    pub direction: SubsamplingDirection,
}

/// External trigger mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Free run, no external trigger.
    #[default]
    Off,
    /// Falling edge.
    HiLo,
    /// Rising edge.
    LoHi,
    /// Software trigger.
    Software,
}

/// Flash output mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashMode {
    /// Flash output disabled.
    #[default]
    Off,
    /// Active low in trigger mode.
    TriggerLoActive,
    /// Active high in trigger mode.
    TriggerHiActive,
    /// Constant high.
    ConstantHigh,
    /// Constant low.
    ConstantLow,
    /// Active low in free run mode.
    FreerunLoActive,
    /// Active high in free run mode.
    FreerunHiActive,
}

/// Flash timing, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlashParams {
    /// Delay after exposure start.
    pub delay_us: i32,
    /// Pulse duration.
    pub duration_us: u32,
}

/// Logic level for a GPIO output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioState {
    /// Logic low.
    Low,
    /// Logic high.
    High,
}

/// Output configuration for one GPIO line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpioConfig {
    /// GPIO line number (1-based).
    pub gpio: u32,
    /// Output level.
    pub state: GpioState,
}

/// One entry of the camera's image format list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFormat {
    /// Format identifier.
    pub id: u32,
    /// Output width.
    pub width: u32,
    /// Output height.
    pub height: u32,
    /// Human readable name.
    pub name: String,
}

/// Low-level camera driver API.
///
/// Mirrors the call surface of the vendor SDK one to one. Implementations
/// must tolerate concurrent calls from the acquisition thread and the
/// controlling thread.
pub trait CameraDriver: Send + Sync {
    // --- session ---

    /// Initialize the camera and open the driver session.
    fn init_camera(&self) -> DriverResult<()>;
    /// Close the driver session.
    fn exit_camera(&self) -> DriverResult<()>;

    // --- geometry ---

    /// Current area of interest.
    fn aoi(&self) -> DriverResult<Rect>;
    /// Apply a new area of interest.
    fn set_aoi(&self, rect: Rect) -> DriverResult<()>;
    /// Current color mode.
    fn color_mode(&self) -> DriverResult<ColorMode>;
    /// Apply a color mode.
    fn set_color_mode(&self, mode: ColorMode) -> DriverResult<()>;
    /// Apply a subsampling setting.
    fn set_subsampling(&self, subsampling: Subsampling) -> DriverResult<()>;
    /// Supported image formats.
    fn image_formats(&self) -> DriverResult<Vec<ImageFormat>>;

    // --- image memory ---

    /// Allocate image memory of the given geometry.
    fn alloc_image_mem(&self, width: u32, height: u32, bits_per_pixel: u32) -> DriverResult<MemId>;
    /// Release image memory.
    fn free_image_mem(&self, mem: MemId) -> DriverResult<()>;
    /// Append image memory to the capture sequence.
    fn add_to_sequence(&self, mem: MemId) -> DriverResult<()>;
    /// Enable the driver's internal image queue.
    fn init_image_queue(&self) -> DriverResult<()>;

    // --- capture ---

    /// Start continuous capture.
    fn capture_video(&self, wait: WaitMode) -> DriverResult<()>;
    /// Capture a single image.
    fn freeze_video(&self, wait: WaitMode) -> DriverResult<()>;
    /// Force capture to stop.
    fn stop_live_video(&self) -> DriverResult<()>;
    /// Block until the next image arrives or `timeout_ms` elapses
    /// ([`IS_TIMED_OUT`]).
    fn wait_for_next_image(&self, timeout_ms: u32) -> DriverResult<ImageHandoff>;
    /// Return a locked image memory to the capture sequence.
    fn unlock_seq_buf(&self, mem: MemId) -> DriverResult<()>;

    // --- timing ---

    /// Frame time range in seconds.
    fn frame_time_range(&self) -> DriverResult<FrameTimeRange>;
    /// Request a frame rate; returns the rate actually applied.
    fn set_frame_rate(&self, fps: f64) -> DriverResult<f64>;
    /// Frame rate measured by the driver.
    fn frames_per_second(&self) -> DriverResult<f64>;
    /// Exposure time in milliseconds.
    fn exposure(&self) -> DriverResult<f64>;
    /// Request an exposure time; returns the value actually applied.
    fn set_exposure(&self, exposure_ms: f64) -> DriverResult<f64>;
    /// Pixel clock in MHz.
    fn pixel_clock(&self) -> DriverResult<u32>;
    /// Valid pixel clock range.
    fn pixel_clock_range(&self) -> DriverResult<PixelClockRange>;
    /// Apply a pixel clock.
    fn set_pixel_clock(&self, mhz: u32) -> DriverResult<()>;

    // --- gain & auto ---

    /// Apply hardware gain.
    fn set_hardware_gain(&self, gain: HardwareGain) -> DriverResult<()>;
    /// Apply master gain factor (100 = 1.0x); returns the factor applied.
    fn set_gain_factor(&self, factor: i32) -> DriverResult<i32>;
    /// Toggle an automatic control loop.
    fn set_auto_parameter(&self, parameter: AutoParameter, enabled: bool) -> DriverResult<()>;

    // --- I/O ---

    /// Apply an external trigger mode.
    fn set_external_trigger(&self, mode: TriggerMode) -> DriverResult<()>;
    /// Current flash mode.
    fn flash_mode(&self) -> DriverResult<FlashMode>;
    /// Apply a flash mode.
    fn set_flash_mode(&self, mode: FlashMode) -> DriverResult<()>;
    /// Current flash timing.
    fn flash_params(&self) -> DriverResult<FlashParams>;
    /// Minimum flash timing.
    fn min_flash_params(&self) -> DriverResult<FlashParams>;
    /// Apply flash timing.
    fn set_flash_params(&self, params: FlashParams) -> DriverResult<()>;
    /// Configure a GPIO line as output at the given level.
    fn configure_gpio(&self, config: GpioConfig) -> DriverResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_mode_geometry() {
        assert_eq!(ColorMode::Mono8.bits_per_pixel(), 8);
        assert_eq!(ColorMode::Mono12.bytes_per_pixel(), 2);
        assert_eq!(ColorMode::Bgr8Packed.channels(), 3);
        assert_eq!(ColorMode::Rgba8Packed.bytes_per_pixel(), 4);
        assert!(ColorMode::Mono16.is_wide());
        assert!(!ColorMode::Rgb8Packed.is_wide());
    }

    #[test]
    fn wait_mode_defaults_to_non_blocking() {
        assert_eq!(WaitMode::default(), WaitMode::DontWait);
    }
}
