//! CLI entry point for ueye-daq.
//!
//! Runs acquisitions against the simulated driver:
//! - `info`: print device parameters
//! - `config`: print the effective configuration
//! - `snap`: save a single frame
//! - `record`: record per the `[output]` settings (image files, or an ENVI cube
//!   when `file_type = "envi"`), until `max_frames` or Ctrl+C
//! - `cube`: stream frames into an ENVI cube
//!
//! # Usage
//!
//! ```bash
//! ueye-daq --config config/ueye_daq.toml snap frame.png
//! ueye-daq record data frame_ --max-frames 20
//! ueye-daq record            # folder and prefix from [output]
//! ueye-daq cube data scan --max-frames 250 --aoi 0,0,640,480
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use ueye_daq::config::Settings;
use ueye_daq::driver::mock::SimulatedDriver;
use ueye_daq::driver::Rect;
use ueye_daq::sinks::{recording_sink, FrameSink, RecordingRequest, SingleCapture};
use ueye_daq::storage::ImageCodecWriter;
use ueye_daq::{logging, AcquisitionWorker, CaptureSession, DeviceHandle};

#[derive(Parser)]
#[command(name = "ueye-daq")]
#[command(about = "Buffered frame acquisition for uEye cameras", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = ueye_daq::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print device parameters
    Info,

    /// Print the effective configuration
    Config,

    /// Save a single frame
    Snap {
        /// Output file (extension selects the format)
        path: PathBuf,
    },

    /// Record using the `[output]` settings (image files or ENVI cube)
    Record {
        /// Output folder (default: output.folder)
        folder: Option<PathBuf>,
        /// File name prefix (default: output.base_name)
        base_name: Option<String>,
        /// Stop after this many frames (policy from config)
        #[arg(long)]
        max_frames: Option<u64>,
    },

    /// Stream frames into an ENVI cube
    Cube {
        /// Output folder (default: output.folder)
        folder: Option<PathBuf>,
        /// Cube base name (default: output.base_name)
        base_name: Option<String>,
        /// Cube depth (default: acquisition.max_frames)
        #[arg(long)]
        max_frames: Option<u64>,
        /// Cube AOI as x,y,width,height (default: cube.aoi)
        #[arg(long, value_delimiter = ',', num_args = 4)]
        aoi: Option<Vec<u32>>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_validated(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init_from_settings(&settings).map_err(anyhow::Error::msg)?;

    let driver = Arc::new(SimulatedDriver::default());
    let device = Arc::new(DeviceHandle::open_new(driver, settings.camera.device_id)?);

    match cli.command {
        Commands::Info => print_info(&device),
        Commands::Config => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
        Commands::Snap { path } => {
            let sink = snap_sink(&settings, path)?;
            run_worker(&settings, device, Box::new(sink)).await
        }
        Commands::Record {
            folder,
            base_name,
            max_frames,
        } => {
            let request = RecordingRequest {
                folder,
                base_name,
                max_frames,
                ..Default::default()
            };
            let sink = recording_sink(&settings, &device, request)?;
            run_worker(&settings, device, sink).await
        }
        Commands::Cube {
            folder,
            base_name,
            max_frames,
            aoi,
        } => {
            let cube_aoi = match aoi.as_deref() {
                Some([x, y, w, h]) => Some(Rect::new(*x, *y, *w, *h)),
                Some(_) => bail!("--aoi takes x,y,width,height"),
                None => None,
            };
            let request = RecordingRequest {
                folder,
                base_name,
                max_frames,
                cube_aoi,
                force_cube: true,
            };
            let sink = recording_sink(&settings, &device, request)?;
            run_worker(&settings, device, sink).await
        }
    }
}

fn print_info(device: &DeviceHandle) -> Result<()> {
    let aoi = device.aoi()?;
    let (fps_min, fps_max) = device.fps_range()?;
    let (clock_min, clock_max) = device.pixelclock_range()?;
    println!("Device {}", device.device_id());
    println!("  AOI:         {}x{} at ({}, {})", aoi.width, aoi.height, aoi.x, aoi.y);
    println!("  Color mode:  {:?}", device.color_mode()?);
    println!("  Frame rate:  {fps_min:.3} - {fps_max:.3} fps");
    println!("  Exposure:    {:.3} ms", device.exposure()?);
    println!("  Pixel clock: {} MHz ({clock_min} - {clock_max})", device.pixelclock()?);
    for format in device.format_list()? {
        println!("  Format {}: {}", format.id, format.name);
    }
    Ok(())
}

fn snap_sink(settings: &Settings, path: PathBuf) -> Result<SingleCapture> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map_or_else(|| settings.output.file_type.clone(), str::to_string);
    let writer = ImageCodecWriter::for_extension(&extension)?;
    Ok(SingleCapture::new(path, writer))
}

async fn run_worker(
    settings: &Settings,
    device: Arc<DeviceHandle>,
    sink: Box<dyn FrameSink>,
) -> Result<()> {
    let session = Arc::new(CaptureSession::new(device, settings.camera.buffer_count)?);
    let mut worker = AcquisitionWorker::new(session, sink)
        .with_timeout(settings.acquisition.worker_timeout_ms);
    worker.start()?;

    let stopper = worker.stop_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            if let Err(e) = stopper.stop() {
                tracing::error!(error = %e, "Failed to stop acquisition");
            }
        }
    });

    let report = worker.join().await;
    ctrl_c.abort();
    let report = report?;
    println!(
        "Processed {} frame(s), missed {}",
        report.processed, report.missed
    );
    Ok(())
}
