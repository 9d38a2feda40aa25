//! Recording sinks assembled from settings.
//!
//! `[output]` decides the target: `file_type = "envi"` streams into a cube,
//! any image extension writes one file per frame. Fields of a
//! [`RecordingRequest`] override the matching settings.

use super::{CubeStream, FrameSink, SequenceCapture, StopCondition};
use crate::config::Settings;
use crate::device::DeviceHandle;
use crate::driver::Rect;
use crate::error::{CameraError, Result};
use crate::storage::ImageCodecWriter;
use std::path::PathBuf;

/// Per-run overrides of the output settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingRequest {
    /// Output folder instead of `output.folder`.
    pub folder: Option<PathBuf>,
    /// File name prefix instead of `output.base_name`.
    pub base_name: Option<String>,
    /// Frame budget instead of `acquisition.max_frames`.
    pub max_frames: Option<u64>,
    /// Cube AOI instead of `cube.aoi`.
    pub cube_aoi: Option<Rect>,
    /// Stream into a cube whatever `output.file_type` says.
    pub force_cube: bool,
}

/// Build the sink for a recording.
///
/// Cube recordings apply the cube AOI to `device` so frames match the cube
/// geometry; call this before the capture session starts.
pub fn recording_sink(
    settings: &Settings,
    device: &DeviceHandle,
    request: RecordingRequest,
) -> Result<Box<dyn FrameSink>> {
    let folder = request
        .folder
        .unwrap_or_else(|| settings.output.folder.clone());
    let base_name = request
        .base_name
        .unwrap_or_else(|| settings.output.base_name.clone());

    if request.force_cube || settings.is_cube() {
        let max_frames = request
            .max_frames
            .or(settings.acquisition.max_frames)
            .filter(|&max| max > 0)
            .ok_or_else(|| {
                CameraError::Configuration(
                    "cube recording needs max_frames (argument or acquisition.max_frames)".into(),
                )
            })?;
        let aoi = request.cube_aoi.or_else(|| settings.cube_aoi()).ok_or_else(|| {
            CameraError::Configuration("cube recording needs an AOI (argument or cube.aoi)".into())
        })?;
        device.set_aoi(aoi.x, aoi.y, aoi.width, aoi.height)?;
        tracing::info!(folder = %folder.display(), %base_name, max_frames, "Recording to ENVI cube");
        let sink = CubeStream::new(&folder, &base_name, aoi, max_frames, settings.acquisition.stop_policy)?
            .with_flush_every(settings.acquisition.flush_every);
        return Ok(Box::new(sink));
    }

    let stop = match request.max_frames {
        Some(max) => StopCondition::new(Some(max), settings.acquisition.stop_policy),
        None => settings.stop_condition(),
    };
    let writer = ImageCodecWriter::for_extension(&settings.output.file_type)?;
    tracing::info!(
        folder = %folder.display(),
        %base_name,
        file_type = %settings.output.file_type,
        max_frames = ?stop.max_frames(),
        "Recording image sequence"
    );
    Ok(Box::new(SequenceCapture::new(folder, base_name, writer, stop)))
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::driver::mock::SimulatedDriver;
    use std::sync::Arc;

    fn device() -> DeviceHandle {
        DeviceHandle::open_new(Arc::new(SimulatedDriver::default()), 0).unwrap()
    }

    #[test]
    fn envi_file_type_selects_cube() {
        let settings = Settings::from_toml_str(
            r#"
            [acquisition]
            max_frames = 10
            [output]
            file_type = "envi"
            [cube]
            aoi = [0, 0, 64, 32]
            "#,
        )
        .unwrap();
        assert!(settings.validate().is_ok());

        let device = device();
        let sink = recording_sink(&settings, &device, RecordingRequest::default()).unwrap();
        assert_eq!(sink.name(), "cube_stream");
        assert_eq!(device.aoi().unwrap(), Rect::new(0, 0, 64, 32));
    }

    #[test]
    fn image_file_type_selects_sequence() {
        let settings = Settings::default();
        let sink = recording_sink(&settings, &device(), RecordingRequest::default()).unwrap();
        assert_eq!(sink.name(), "sequence_capture");
    }

    #[test]
    fn cube_without_budget_or_aoi_is_rejected() {
        let device = device();
        let request = RecordingRequest {
            force_cube: true,
            ..Default::default()
        };
        assert!(matches!(
            recording_sink(&Settings::default(), &device, request.clone()),
            Err(CameraError::Configuration(_))
        ));

        let request = RecordingRequest {
            max_frames: Some(5),
            ..request
        };
        let err = recording_sink(&Settings::default(), &device, request).err().unwrap();
        assert!(err.to_string().contains("AOI"));
    }
}
