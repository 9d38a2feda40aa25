//! ENVI cube files backed by a memory-mapped data file.
//!
//! A cube is three files sharing a base path:
//!
//! - `<base>.hdr`: plain-text ENVI header;
//! - `<base>.img`: raw data, `u16` little-endian, band-interleaved-by-pixel,
//!   pre-sized to `samples * lines * bands * 2` bytes;
//! - `<base>_timings.csv`: one `"<millis>,"` entry per frame ([`TimingLog`]).
//!
//! A frame is one `bands x lines` slice (image rows map to bands, image
//! columns to lines) stored at one index of the sample axis. The byte offset
//! of `(line, sample, band)` is `((line * samples + sample) * bands + band) * 2`.

#![allow(unsafe_code)]

use crate::error::{CameraError, Result};
use memmap2::{MmapMut, MmapOptions};
use ndarray::ArrayView2;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// ENVI data type code for unsigned 16-bit integers.
pub const ENVI_DATA_TYPE_U16: u32 = 12;

const BYTES_PER_VALUE: usize = 2;

/// Cube dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CubeShape {
    /// Frames the cube can hold.
    pub samples: usize,
    /// Image columns.
    pub lines: usize,
    /// Image rows.
    pub bands: usize,
}

impl CubeShape {
    /// Shape for frames of `width x height` pixels, `max_frames` deep.
    pub fn for_frames(width: u32, height: u32, max_frames: usize) -> Self {
        Self {
            samples: max_frames,
            lines: width as usize,
            bands: height as usize,
        }
    }

    /// Size of the data file in bytes.
    pub fn data_len(&self) -> usize {
        self.samples * self.lines * self.bands * BYTES_PER_VALUE
    }

    fn offset(&self, line: usize, sample: usize, band: usize) -> usize {
        ((line * self.samples + sample) * self.bands + band) * BYTES_PER_VALUE
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Text of the ENVI header for `shape`.
pub fn header_text(shape: &CubeShape) -> String {
    format!(
        "ENVI\n\
         description = {{ueye_daq acquisition cube}}\n\
         samples = {}\n\
         lines = {}\n\
         bands = {}\n\
         header offset = 0\n\
         file type = ENVI Standard\n\
         data type = {}\n\
         interleave = bip\n\
         byte order = 0\n",
        shape.samples, shape.lines, shape.bands, ENVI_DATA_TYPE_U16
    )
}

/// Fixed-size ENVI cube open for writing.
pub struct EnviCube {
    shape: CubeShape,
    header_path: PathBuf,
    data_path: PathBuf,
    _file: File,
    mmap: MmapMut,
}

impl std::fmt::Debug for EnviCube {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnviCube")
            .field("shape", &self.shape)
            .field("data_path", &self.data_path)
            .finish()
    }
}

impl EnviCube {
    /// Create `<base>.hdr` and a zeroed `<base>.img`, replacing existing files.
    pub fn create(base: impl AsRef<Path>, shape: CubeShape) -> Result<Self> {
        let base = base.as_ref();
        if shape.samples == 0 || shape.lines == 0 || shape.bands == 0 {
            return Err(CameraError::Configuration(format!(
                "cube dimensions must be non-zero, got {shape:?}"
            )));
        }

        let header_path = with_suffix(base, ".hdr");
        let data_path = with_suffix(base, ".img");
        std::fs::write(&header_path, header_text(&shape))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&data_path)?;
        file.set_len(shape.data_len() as u64)?;

        // SAFETY: the file was just created and sized by us and stays open for
        // the lifetime of the mapping; nothing else in this process maps it.
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        debug_assert!(mmap.len() >= shape.data_len(), "mmap shorter than cube");

        tracing::info!(
            path = %data_path.display(),
            samples = shape.samples,
            lines = shape.lines,
            bands = shape.bands,
            "ENVI cube created"
        );

        Ok(Self {
            shape,
            header_path,
            data_path,
            _file: file,
            mmap,
        })
    }

    /// Cube dimensions.
    pub fn shape(&self) -> CubeShape {
        self.shape
    }

    /// Path of the header file.
    pub fn header_path(&self) -> &Path {
        &self.header_path
    }

    /// Path of the data file.
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Store one frame (rows = bands, cols = lines) at `sample`.
    pub fn write_frame(&mut self, sample: usize, image: &ArrayView2<'_, u16>) -> Result<()> {
        let shape = self.shape;
        if sample >= shape.samples {
            return Err(CameraError::InvalidState(format!(
                "sample index {sample} outside cube of {} samples",
                shape.samples
            )));
        }
        let (rows, cols) = image.dim();
        if rows != shape.bands || cols != shape.lines {
            return Err(CameraError::Configuration(format!(
                "frame is {cols}x{rows}, cube expects {}x{}",
                shape.lines, shape.bands
            )));
        }

        for ((band, line), value) in image.indexed_iter() {
            let offset = shape.offset(line, sample, band);
            self.mmap[offset..offset + BYTES_PER_VALUE].copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    /// Read back one value.
    pub fn value(&self, line: usize, sample: usize, band: usize) -> Option<u16> {
        let shape = self.shape;
        if line >= shape.lines || sample >= shape.samples || band >= shape.bands {
            return None;
        }
        let offset = shape.offset(line, sample, band);
        let bytes = self.mmap.get(offset..offset + BYTES_PER_VALUE)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Write dirty pages to disk.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

/// Append-only log of frame timestamps (`"<millis>,"` per frame).
#[derive(Debug)]
pub struct TimingLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl TimingLog {
    /// Log path for a cube base path.
    pub fn path_for(base: &Path) -> PathBuf {
        with_suffix(base, "_timings.csv")
    }

    /// Open (or create) the log in append mode.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamp.
    pub fn append(&mut self, millis: i64) -> Result<()> {
        write!(self.writer, "{millis},")?;
        Ok(())
    }

    /// Push buffered entries to the file.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use tempfile::tempdir;

    #[test]
    fn header_lists_bip_u16_layout() {
        let text = header_text(&CubeShape::for_frames(640, 480, 250));
        assert!(text.starts_with("ENVI\n"));
        assert!(text.contains("samples = 250\n"));
        assert!(text.contains("lines = 640\n"));
        assert!(text.contains("bands = 480\n"));
        assert!(text.contains("data type = 12\n"));
        assert!(text.contains("interleave = bip\n"));
        assert!(text.contains("byte order = 0\n"));
    }

    #[test]
    fn frame_lands_at_bip_offsets() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("cube");
        let shape = CubeShape::for_frames(3, 2, 4);
        let mut cube = EnviCube::create(&base, shape).unwrap();
        assert_eq!(std::fs::metadata(cube.data_path()).unwrap().len(), 3 * 2 * 4 * 2);

        let image = Array2::from_shape_fn((2, 3), |(r, c)| (r * 10 + c) as u16);
        cube.write_frame(1, &image.view()).unwrap();
        cube.flush().unwrap();

        assert_eq!(cube.value(2, 1, 1), Some(12));
        assert_eq!(cube.value(2, 0, 1), Some(0));

        let raw = std::fs::read(cube.data_path()).unwrap();
        let offset = ((2 * 4 + 1) * 2 + 1) * 2;
        assert_eq!(u16::from_le_bytes([raw[offset], raw[offset + 1]]), 12);
    }

    #[test]
    fn rejects_out_of_range_sample_and_wrong_geometry() {
        let dir = tempdir().unwrap();
        let mut cube = EnviCube::create(dir.path().join("c"), CubeShape::for_frames(2, 2, 1)).unwrap();
        let image = Array2::<u16>::zeros((2, 2));
        assert!(matches!(
            cube.write_frame(1, &image.view()),
            Err(CameraError::InvalidState(_))
        ));
        let wrong = Array2::<u16>::zeros((3, 2));
        assert!(matches!(
            cube.write_frame(0, &wrong.view()),
            Err(CameraError::Configuration(_))
        ));
    }

    #[test]
    fn timing_log_appends() {
        let dir = tempdir().unwrap();
        let path = TimingLog::path_for(&dir.path().join("cube"));
        assert!(path.ends_with("cube_timings.csv"));
        {
            let mut log = TimingLog::open(&path).unwrap();
            log.append(1000).unwrap();
            log.append(1033).unwrap();
            log.flush().unwrap();
        }
        let mut log = TimingLog::open(&path).unwrap();
        log.append(1066).unwrap();
        log.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1000,1033,1066,");
    }
}
