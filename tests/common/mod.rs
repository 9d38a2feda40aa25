//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use ueye_daq::driver::mock::SimulatedDriver;
use ueye_daq::{CaptureSession, DeviceHandle};

/// Simulated camera with a small sensor and a frame every 2 ms.
///
/// The frame interval keeps millisecond-stamped file names unique.
pub fn simulated_camera(width: u32, height: u32) -> Arc<SimulatedDriver> {
    Arc::new(
        SimulatedDriver::builder()
            .sensor(width, height)
            .frame_interval(Duration::from_millis(2))
            .build(),
    )
}

/// Opened device on the given driver.
pub fn open_device(driver: &Arc<SimulatedDriver>) -> Arc<DeviceHandle> {
    let device = DeviceHandle::open_new(driver.clone(), 0).expect("Failed to open simulated camera");
    Arc::new(device)
}

/// Session with `buffers` buffers on a freshly opened device.
pub fn open_session(driver: &Arc<SimulatedDriver>, buffers: usize) -> Arc<CaptureSession> {
    let session = CaptureSession::new(open_device(driver), buffers).expect("Failed to create session");
    Arc::new(session)
}

/// Number of files in `dir` with the given extension (without dot).
pub fn count_files(dir: &Path, extension: &str) -> usize {
    std::fs::read_dir(dir)
        .expect("Failed to read output folder")
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
        })
        .count()
}

/// Poll `condition` every millisecond until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    condition()
}
