//! Ring buffer pool registered with the driver's capture sequence.
//!
//! The driver cycles through a fixed set of image memories during continuous
//! capture. [`BufferPool`] allocates that set against the device's *current*
//! AOI and color mode, registers every buffer into the capture sequence and
//! enables the driver image queue.
//!
//! # Lifecycle
//!
//! - `allocate` must run before the first capture, and again after every AOI
//!   or color mode change. It frees the previous buffers first and refuses to
//!   do so while any of them is locked by a consumer.
//! - A driver error in the middle of the allocation loop is returned as is.
//!   Buffers allocated before the failure stay tracked so the next
//!   `allocate` (or `free`) releases them; nothing is rolled back.
//!
//! # Locking
//!
//! Each [`FrameBuffer`] carries a lock flag mirroring the driver-side lock:
//! it is set when the driver hands the buffer out and cleared when the
//! consumer unlocks it. Only one claim per buffer can exist at a time.

use crate::device::DeviceHandle;
use crate::driver::{ops, ColorMode, MemId, IS_SEQ_BUFFER_IS_LOCKED};
use crate::error::{CameraError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Number of buffers allocated when nothing else is configured.
pub const DEFAULT_BUFFER_COUNT: usize = 3;

/// One image memory owned by the pool.
#[derive(Debug)]
pub struct FrameBuffer {
    mem: MemId,
    width: u32,
    height: u32,
    bits_per_pixel: u32,
    stride: usize,
    color_mode: ColorMode,
    locked: AtomicBool,
    reuse_count: AtomicU64,
}

impl FrameBuffer {
    fn new(mem: MemId, width: u32, height: u32, color_mode: ColorMode) -> Self {
        let bits_per_pixel = color_mode.bits_per_pixel();
        Self {
            mem,
            width,
            height,
            bits_per_pixel,
            stride: width as usize * color_mode.bytes_per_pixel(),
            color_mode,
            locked: AtomicBool::new(false),
            reuse_count: AtomicU64::new(0),
        }
    }

    /// Driver id of the memory.
    pub fn mem_id(&self) -> MemId {
        self.mem
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bits per pixel.
    pub fn bits_per_pixel(&self) -> u32 {
        self.bits_per_pixel
    }

    /// Row stride in bytes.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Color mode at allocation time.
    pub fn color_mode(&self) -> ColorMode {
        self.color_mode
    }

    /// Total size of the memory in bytes.
    pub fn size_bytes(&self) -> usize {
        self.stride * self.height as usize
    }

    /// Whether a consumer currently holds this buffer.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// How many times the buffer was handed out and returned.
    pub fn reuse_count(&self) -> u64 {
        self.reuse_count.load(Ordering::Relaxed)
    }

    /// Claim the buffer. Returns `false` if it is already claimed.
    pub(crate) fn try_claim(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release a claim. Returns `false` if the buffer was not claimed.
    pub(crate) fn release(&self) -> bool {
        let released = self
            .locked
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if released {
            self.reuse_count.fetch_add(1, Ordering::Relaxed);
        }
        released
    }
}

/// Fixed-size set of driver image memories sharing one geometry.
#[derive(Debug)]
pub struct BufferPool {
    buffer_count: usize,
    buffers: Vec<Arc<FrameBuffer>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self {
            buffer_count: DEFAULT_BUFFER_COUNT,
            buffers: Vec::new(),
        }
    }
}

impl BufferPool {
    /// Create an empty pool that allocates `buffer_count` buffers.
    pub fn new(buffer_count: usize) -> Result<Self> {
        if buffer_count == 0 {
            return Err(CameraError::Configuration(
                "buffer_count must be at least 1".into(),
            ));
        }
        Ok(Self {
            buffer_count,
            buffers: Vec::new(),
        })
    }

    /// Configured number of buffers.
    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    /// Buffers currently tracked, in sequence order.
    pub fn buffers(&self) -> &[Arc<FrameBuffer>] {
        &self.buffers
    }

    /// Number of buffers currently tracked.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no buffers are tracked.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Number of buffers currently claimed by consumers.
    pub fn locked_count(&self) -> usize {
        self.buffers.iter().filter(|b| b.is_locked()).count()
    }

    /// Look up a tracked buffer by driver id.
    pub fn find(&self, mem: MemId) -> Option<Arc<FrameBuffer>> {
        self.buffers.iter().find(|b| b.mem == mem).cloned()
    }

    /// Allocate `buffer_count` buffers matching the device's current AOI and
    /// color mode, register them and initialize the image queue.
    ///
    /// Previously tracked buffers are freed first. Fails with `ResourceBusy`
    /// if any of them is still locked.
    pub fn allocate(&mut self, device: &DeviceHandle) -> Result<()> {
        let aoi = device.aoi()?;
        let color_mode = device.color_mode()?;

        self.free(device)?;

        let driver = device.driver();
        for index in 0..self.buffer_count {
            let mem = driver
                .alloc_image_mem(aoi.width, aoi.height, color_mode.bits_per_pixel())
                .map_err(|code| CameraError::device(ops::ALLOC_IMAGE_MEM, code))?;
            // Track before registering so a failed registration is still freed later.
            self.buffers
                .push(Arc::new(FrameBuffer::new(mem, aoi.width, aoi.height, color_mode)));
            driver
                .add_to_sequence(mem)
                .map_err(|code| CameraError::device(ops::ADD_TO_SEQUENCE, code))?;
            tracing::debug!(%mem, index, "Image memory allocated");
        }

        driver
            .init_image_queue()
            .map_err(|code| CameraError::device(ops::INIT_IMAGE_QUEUE, code))?;

        tracing::info!(
            count = self.buffer_count,
            width = aoi.width,
            height = aoi.height,
            bits_per_pixel = color_mode.bits_per_pixel(),
            "Buffer pool allocated"
        );
        Ok(())
    }

    /// Free every tracked buffer.
    ///
    /// Fails with `ResourceBusy` before touching the driver if any buffer is
    /// locked.
    pub fn free(&mut self, device: &DeviceHandle) -> Result<()> {
        let locked = self.locked_count();
        if locked > 0 {
            tracing::warn!(locked, "Refusing to free buffers still held by consumers");
            return Err(CameraError::ResourceBusy { locked });
        }

        let driver = device.driver();
        while let Some(buffer) = self.buffers.last() {
            match driver.free_image_mem(buffer.mem) {
                Ok(()) => {}
                Err(IS_SEQ_BUFFER_IS_LOCKED) => {
                    return Err(CameraError::ResourceBusy { locked: 1 });
                }
                Err(code) => return Err(CameraError::device(ops::FREE_IMAGE_MEM, code)),
            }
            self.buffers.pop();
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::driver::mock::SimulatedDriver;
    use crate::driver::{CameraDriver, IS_NO_SUCCESS};

    fn setup(width: u32, height: u32) -> (Arc<SimulatedDriver>, DeviceHandle) {
        let driver = Arc::new(SimulatedDriver::builder().sensor(1280, 1024).build());
        let device = DeviceHandle::open_new(driver.clone(), 0).unwrap();
        device.set_aoi(0, 0, width, height).unwrap();
        (driver, device)
    }

    #[test]
    fn zero_buffers_rejected() {
        assert!(matches!(
            BufferPool::new(0),
            Err(CameraError::Configuration(_))
        ));
    }

    #[test]
    fn allocate_matches_current_geometry() {
        let (driver, device) = setup(640, 480);
        let mut pool = BufferPool::default();
        pool.allocate(&device).unwrap();

        assert_eq!(pool.len(), 3);
        for buffer in pool.buffers() {
            assert_eq!((buffer.width(), buffer.height()), (640, 480));
            assert_eq!(buffer.bits_per_pixel(), 8);
            assert_eq!(buffer.size_bytes(), 640 * 480);
        }
        assert_eq!(driver.live_buffers(), 3);
        assert!(driver.image_queue_enabled());
    }

    #[test]
    fn reallocation_refused_while_locked() {
        let (driver, device) = setup(64, 48);
        let mut pool = BufferPool::new(2).unwrap();
        pool.allocate(&device).unwrap();
        assert!(pool.buffers()[0].try_claim());

        let err = pool.allocate(&device).unwrap_err();
        assert!(matches!(err, CameraError::ResourceBusy { locked: 1 }));
        assert_eq!(driver.live_buffers(), 2);

        assert!(pool.buffers()[0].release());
        pool.allocate(&device).unwrap();
        assert_eq!(driver.stats().frees, 2);
    }

    #[test]
    fn claim_is_exclusive() {
        let (_driver, device) = setup(8, 8);
        let mut pool = BufferPool::new(1).unwrap();
        pool.allocate(&device).unwrap();
        let buffer = &pool.buffers()[0];

        assert!(buffer.try_claim());
        assert!(!buffer.try_claim());
        assert!(buffer.release());
        assert!(!buffer.release());
        assert_eq!(buffer.reuse_count(), 1);
    }

    #[test]
    fn partial_allocation_failure_propagates_without_rollback() {
        let (driver, device) = setup(64, 48);
        driver.fail_after(ops::ALLOC_IMAGE_MEM, 1, IS_NO_SUCCESS);
        let mut pool = BufferPool::default();

        let err = pool.allocate(&device).unwrap_err();
        assert!(matches!(
            err,
            CameraError::Device {
                operation: ops::ALLOC_IMAGE_MEM,
                ..
            }
        ));
        assert_eq!(pool.len(), 1);
        assert_eq!(driver.live_buffers(), 1);

        // A full retry frees the leftover and starts over.
        pool.allocate(&device).unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(driver.live_buffers(), 3);
    }

    #[test]
    fn find_by_mem_id() {
        let (driver, device) = setup(8, 8);
        let mut pool = BufferPool::default();
        pool.allocate(&device).unwrap();
        let mem = pool.buffers()[1].mem_id();
        assert_eq!(pool.find(mem).map(|b| b.mem_id()), Some(mem));
        assert!(pool.find(MemId(9999)).is_none());
        assert!(driver.aoi().is_ok());
    }
}
