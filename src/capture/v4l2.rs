//! V4L2 capture device with a memory-mapped buffer ring

use std::io;
use std::mem;
use std::os::raw::c_void;
use std::sync::Arc;
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, info, warn};
use v4l::buffer::Type as BufferType;
use v4l::capability::Flags as CapFlags;
use v4l::device::Handle;
use v4l::format::FieldOrder;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::error::DeviceError;

use super::device::{CaptureDevice, Dequeued, FormatRequest};

/// Longest single wait for a filled buffer before `dequeue` gives up.
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

fn buffer_desc(index: usize) -> v4l2_buffer {
    v4l2_buffer {
        index: index as u32,
        type_: BufferType::VideoCapture as u32,
        memory: Memory::Mmap as u32,
        // SAFETY: all-zero is a valid `v4l2_buffer`.
        ..unsafe { mem::zeroed() }
    }
}

/// V4L2 device driven through the streaming I/O ioctls
pub struct V4l2Device {
    // Unmapped before the handle closes the descriptor.
    buffers: Vec<MmapMut>,
    path: String,
    device: Device,
    handle: Arc<Handle>,
    timeout: Duration,
}

impl V4l2Device {
    pub fn open(path: &str) -> Result<Self, DeviceError> {
        info!("Opening V4L2 device: {}", path);

        let device = Device::with_path(path).map_err(|source| DeviceError::OpenFailed {
            path: path.to_string(),
            source,
        })?;
        let handle = device.handle();

        Ok(Self {
            buffers: Vec::new(),
            path: path.to_string(),
            device,
            handle,
            timeout: DEQUEUE_TIMEOUT,
        })
    }

    /// Issue `request` with `arg` as its argument block.
    ///
    /// # Safety
    /// `T` must be the argument type the kernel expects for `request`.
    unsafe fn ioctl<T>(&self, request: v4l2::vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
        v4l2::ioctl(self.handle.fd(), request, arg as *mut T as *mut c_void)
    }

    fn switch_stream(&self, request: v4l2::vidioc::_IOC_TYPE) -> io::Result<()> {
        let mut buf_type = BufferType::VideoCapture as u32;
        // SAFETY: STREAMON/STREAMOFF take the buffer type as an `int`.
        unsafe { self.ioctl(request, &mut buf_type) }
    }
}

impl CaptureDevice for V4l2Device {
    fn name(&self) -> &str {
        &self.path
    }

    fn query_capability(&mut self) -> Result<(), DeviceError> {
        let caps = self
            .device
            .query_caps()
            .map_err(|e| DeviceError::FormatRejected {
                reason: format!("query capabilities failed: {e}"),
            })?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(DeviceError::FormatRejected {
                reason: "device doesn't support video capture".into(),
            });
        }
        if !caps.capabilities.contains(CapFlags::STREAMING) {
            return Err(DeviceError::FormatRejected {
                reason: "device doesn't support streaming I/O".into(),
            });
        }
        Ok(())
    }

    fn negotiate_format(&mut self, request: &FormatRequest) -> Result<(), DeviceError> {
        let rejected = |e: io::Error| DeviceError::FormatRejected {
            reason: e.to_string(),
        };

        let mut fmt = self.device.format().map_err(rejected)?;
        fmt.width = request.width;
        fmt.height = request.height;
        fmt.fourcc = FourCC::new(&request.format.fourcc());
        fmt.field_order = FieldOrder::Progressive;

        let applied = self.device.set_format(&fmt).map_err(rejected)?;
        if applied.fourcc != fmt.fourcc {
            return Err(DeviceError::FormatRejected {
                reason: format!("driver substituted {} for {}", applied.fourcc, fmt.fourcc),
            });
        }
        if applied.width != request.width || applied.height != request.height {
            warn!(
                "Driver adjusted resolution to {}x{} (requested {}x{})",
                applied.width, applied.height, request.width, request.height
            );
        }
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> Result<usize, DeviceError> {
        let mut req = v4l2_requestbuffers {
            count,
            type_: BufferType::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            // SAFETY: all-zero is a valid `v4l2_requestbuffers`.
            ..unsafe { mem::zeroed() }
        };
        // SAFETY: REQBUFS takes a `v4l2_requestbuffers`.
        unsafe { self.ioctl(v4l2::vidioc::VIDIOC_REQBUFS, &mut req) }.map_err(|e| {
            DeviceError::BufferRequestFailed {
                reason: e.to_string(),
            }
        })?;

        let granted = req.count as usize;
        let mut buffers = Vec::with_capacity(granted);
        for index in 0..granted {
            let mut info = buffer_desc(index);
            // SAFETY: QUERYBUF takes a `v4l2_buffer`.
            unsafe { self.ioctl(v4l2::vidioc::VIDIOC_QUERYBUF, &mut info) }.map_err(|e| {
                DeviceError::BufferRequestFailed {
                    reason: format!("query buffer {index}: {e}"),
                }
            })?;

            // SAFETY: QUERYBUF on an mmap buffer fills `m.offset`. The mapping is
            // shared with the driver and unmapped before the descriptor closes.
            let map = unsafe {
                MmapOptions::new()
                    .offset(info.m.offset as u64)
                    .len(info.length as usize)
                    .map_mut(self.handle.fd())
            }
            .map_err(|source| DeviceError::MapFailed { index, source })?;
            debug!("Mapped buffer {} ({} bytes)", index, map.len());
            buffers.push(map);
        }

        self.buffers = buffers;
        Ok(granted)
    }

    fn slot(&self, index: usize) -> &[u8] {
        &self.buffers[index]
    }

    fn enqueue(&mut self, index: usize) -> Result<(), DeviceError> {
        let mut buf = buffer_desc(index);
        // SAFETY: QBUF takes a `v4l2_buffer`.
        unsafe { self.ioctl(v4l2::vidioc::VIDIOC_QBUF, &mut buf) }
            .map_err(|source| DeviceError::EnqueueFailed { index, source })
    }

    fn dequeue(&mut self) -> Result<Dequeued, DeviceError> {
        let timeout_ms = self.timeout.as_millis().min(i32::MAX as u128) as i32;
        loop {
            match self.handle.poll(libc::POLLIN, timeout_ms) {
                Ok(0) => return Err(DeviceError::Timeout(self.timeout)),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(DeviceError::DequeueFailed(e)),
            }

            let mut buf = buffer_desc(0);
            // SAFETY: DQBUF takes a `v4l2_buffer`.
            match unsafe { self.ioctl(v4l2::vidioc::VIDIOC_DQBUF, &mut buf) } {
                Ok(()) => {
                    return Ok(Dequeued {
                        index: buf.index as usize,
                        bytes_used: buf.bytesused as usize,
                    })
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(DeviceError::DequeueFailed(e)),
            }
        }
    }

    fn start_stream(&mut self) -> Result<(), DeviceError> {
        self.switch_stream(v4l2::vidioc::VIDIOC_STREAMON)
            .map_err(|source| DeviceError::StreamFailed { state: "on", source })?;
        info!("Capture stream started on {}", self.path);
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<(), DeviceError> {
        let result = self.switch_stream(v4l2::vidioc::VIDIOC_STREAMOFF);
        // Mappings go before the descriptor is closed on drop.
        self.buffers.clear();
        result.map_err(|source| DeviceError::StreamFailed {
            state: "off",
            source,
        })?;
        info!("Capture stream stopped on {}", self.path);
        Ok(())
    }
}
