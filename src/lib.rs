//! # uEye DAQ Library
//!
//! Control and acquisition layer over a uEye-style camera driver. The crate
//! manages the driver session, the ring of image buffers the driver cycles
//! through, capture start/stop, and a background worker that pulls frames
//! and routes them to pluggable sinks.
//!
//! ## Crate Structure
//!
//! Data flows driver -> buffer pool -> capture session -> worker -> sink:
//!
//! - **`driver`**: the `CameraDriver` trait every hardware call goes through,
//!   plus `driver::mock::SimulatedDriver` (feature `mock`).
//! - **`device`**: `DeviceHandle`, owner of the driver session and the
//!   parameter accessors (AOI, fps, exposure, gain, pixel clock, trigger,
//!   flash, GPIO).
//! - **`buffer_pool`**: `BufferPool`, allocation and registration of the
//!   capture ring against the current AOI and color mode.
//! - **`session`**: `CaptureSession`, start/stop and the blocking
//!   `fetch_next` primitive, plus single-shot helpers.
//! - **`frame`**: `CapturedFrame` (claim on a buffer, unlocked exactly once)
//!   and `OwnedFrame`, with `ndarray` views.
//! - **`worker`**: `AcquisitionWorker`, the background run loop.
//! - **`sinks`**: `LiveView`, `SingleCapture`, `SequenceCapture`, `CubeStream`.
//! - **`storage`**: image codec writer and ENVI cube files.
//! - **`config`** / **`logging`**: Figment settings and tracing setup.
//! - **`error`**: the crate-wide `CameraError`.
//!
//! ## Example
//!
//! ```no_run
//! # #[cfg(feature = "mock")]
//! # async fn run() -> ueye_daq::Result<()> {
//! use std::sync::Arc;
//! use ueye_daq::driver::mock::SimulatedDriver;
//! use ueye_daq::sinks::{LiveView, StopCondition};
//! use ueye_daq::{AcquisitionWorker, CaptureSession, DeviceHandle};
//!
//! let device = Arc::new(DeviceHandle::open_new(Arc::new(SimulatedDriver::default()), 0)?);
//! device.set_aoi(0, 0, 640, 480)?;
//! let session = Arc::new(CaptureSession::new(device, 3)?);
//!
//! let view = LiveView::new().with_handler(|frame: &ueye_daq::CapturedFrame| -> anyhow::Result<()> {
//!     tracing::info!(sequence = frame.sequence(), "frame");
//!     Ok(())
//! });
//! let mut worker = AcquisitionWorker::new(session, view);
//! worker.start()?;
//! worker.stop()?;
//! let report = worker.join().await?;
//! # let _ = (report, StopCondition::unbounded());
//! # Ok(())
//! # }
//! ```

pub mod buffer_pool;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod frame;
pub mod logging;
pub mod session;
pub mod sinks;
pub mod storage;
pub mod worker;

pub use buffer_pool::{BufferPool, FrameBuffer};
pub use device::{DeviceHandle, DeviceState};
pub use error::{CameraError, Result};
pub use frame::{CapturedFrame, FrameView, OwnedFrame};
pub use session::{CaptureSession, FetchOutcome};
pub use sinks::{FrameContext, FrameSink, SinkControl};
pub use worker::{AcquisitionWorker, WorkerReport, WorkerState};
