//! Synthetic capture device (`synthetic://`).
//!
//! Behaves like a driver-backed ring: slots must be queued before they can be
//! filled, and are filled in the order they were queued. Frames are either a
//! generated JPEG test pattern, paced at a fixed rate, or a scripted list of
//! payloads used by tests.

use std::collections::VecDeque;
use std::io;
use std::thread;
use std::time::{Duration, Instant};

use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

use crate::error::DeviceError;

use super::device::{CaptureDevice, Dequeued, FormatRequest};

pub const SYNTHETIC_PREFIX: &str = "synthetic://";

const STALL_WAIT: Duration = Duration::from_millis(5);

/// Calls made against the device, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOp {
    QueryCapability,
    NegotiateFormat,
    RequestBuffers(u32),
    Enqueue(usize),
    Dequeue(usize),
    StartStream,
    StopStream,
}

/// Initialization step a test wants to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStage {
    Capability,
    Format,
    Buffers,
    Map,
    Stream,
}

enum Frames {
    Pattern { interval: Duration, next_due: Option<Instant> },
    Scripted(VecDeque<Vec<u8>>),
}

pub struct SyntheticDevice {
    name: String,
    frames: Frames,
    format: Option<FormatRequest>,
    slot_capacity: usize,
    slots: Vec<Vec<u8>>,
    queue: VecDeque<usize>,
    streaming: bool,
    produced: u64,
    ops: Vec<DeviceOp>,
    // failure injection
    fail_init: Option<InitStage>,
    fail_dequeue: Option<usize>,
    dequeue_calls: usize,
    granted: Option<usize>,
    bytes_used_override: Option<usize>,
    stall_when_exhausted: bool,
}

impl SyntheticDevice {
    /// Generated test pattern at `fps` frames per second.
    pub fn pattern(fps: u32) -> Self {
        let interval = Duration::from_secs(1) / fps.max(1);
        Self::with_frames(
            SYNTHETIC_PREFIX.to_string(),
            Frames::Pattern {
                interval,
                next_due: None,
            },
            0,
        )
    }

    /// Serve `frames` once each, in order, from slots of `slot_capacity` bytes.
    pub fn scripted(frames: Vec<Vec<u8>>, slot_capacity: usize) -> Self {
        Self::with_frames(
            format!("{SYNTHETIC_PREFIX}scripted"),
            Frames::Scripted(frames.into()),
            slot_capacity,
        )
    }

    fn with_frames(name: String, frames: Frames, slot_capacity: usize) -> Self {
        Self {
            name,
            frames,
            format: None,
            slot_capacity,
            slots: Vec::new(),
            queue: VecDeque::new(),
            streaming: false,
            produced: 0,
            ops: Vec::new(),
            fail_init: None,
            fail_dequeue: None,
            dequeue_calls: 0,
            granted: None,
            bytes_used_override: None,
            stall_when_exhausted: false,
        }
    }

    pub fn fail_init_at(&mut self, stage: InitStage) {
        self.fail_init = Some(stage);
    }

    /// Make the `call`-th dequeue (zero based) fail without consuming a slot.
    pub fn fail_dequeue_at(&mut self, call: usize) {
        self.fail_dequeue = Some(call);
    }

    /// Grant fewer (or more) buffers than requested.
    pub fn grant_buffers(&mut self, count: usize) {
        self.granted = Some(count);
    }

    /// Report this byte count on every dequeue regardless of the payload.
    pub fn report_bytes_used(&mut self, bytes_used: usize) {
        self.bytes_used_override = Some(bytes_used);
    }

    /// Once scripted frames run out, behave like a camera that stopped
    /// delivering: every dequeue waits briefly and times out.
    pub fn stall_when_exhausted(&mut self) {
        self.stall_when_exhausted = true;
    }

    pub fn ops(&self) -> &[DeviceOp] {
        &self.ops
    }

    fn failing(&self, stage: InitStage) -> bool {
        self.fail_init == Some(stage)
    }

    fn next_payload(&mut self) -> Result<Vec<u8>, DeviceError> {
        match &mut self.frames {
            Frames::Scripted(frames) => match frames.pop_front() {
                Some(frame) => Ok(frame),
                None if self.stall_when_exhausted => {
                    thread::sleep(STALL_WAIT);
                    Err(DeviceError::Timeout(STALL_WAIT))
                }
                None => Err(DeviceError::DequeueFailed(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "scripted frames exhausted",
                ))),
            },
            Frames::Pattern { interval, next_due } => {
                let now = Instant::now();
                let due = next_due.unwrap_or(now);
                if due > now {
                    thread::sleep(due - now);
                }
                *next_due = Some(due.max(now) + *interval);

                let format = self.format.unwrap_or(FormatRequest {
                    width: 320,
                    height: 240,
                    format: super::PixelFormat::Mjpeg,
                });
                render_pattern(format.width, format.height, self.produced)
            }
        }
    }
}

/// Vertical bar sweeping across a gradient, one column step per frame.
fn render_pattern(width: u32, height: u32, sequence: u64) -> Result<Vec<u8>, DeviceError> {
    let width = width.max(16);
    let height = height.max(16);
    let bar = (sequence.wrapping_mul(8) % width as u64) as u32;
    let image = RgbImage::from_fn(width, height, |x, y| {
        if x.abs_diff(bar) < 6 {
            Rgb([255, 255, 255])
        } else {
            Rgb([
                (x * 255 / width) as u8,
                (y * 255 / height) as u8,
                (sequence % 256) as u8,
            ])
        }
    });

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, 75)
        .encode_image(&image)
        .map_err(|e| DeviceError::DequeueFailed(io::Error::other(e)))?;
    Ok(jpeg)
}

impl CaptureDevice for SyntheticDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_capability(&mut self) -> Result<(), DeviceError> {
        self.ops.push(DeviceOp::QueryCapability);
        if self.failing(InitStage::Capability) {
            return Err(DeviceError::FormatRejected {
                reason: "device does not support video capture".into(),
            });
        }
        Ok(())
    }

    fn negotiate_format(&mut self, request: &FormatRequest) -> Result<(), DeviceError> {
        self.ops.push(DeviceOp::NegotiateFormat);
        if self.failing(InitStage::Format) {
            return Err(DeviceError::FormatRejected {
                reason: format!("{}x{} not supported", request.width, request.height),
            });
        }
        self.format = Some(*request);
        if self.slot_capacity == 0 {
            // Room for an uncompressed RGB frame; JPEG output is far smaller.
            let raw = (request.width.max(16) * request.height.max(16) * 3) as usize;
            self.slot_capacity = raw.max(64 * 1024);
        }
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> Result<usize, DeviceError> {
        self.ops.push(DeviceOp::RequestBuffers(count));
        if self.failing(InitStage::Buffers) {
            return Err(DeviceError::BufferRequestFailed {
                reason: "out of memory".into(),
            });
        }
        let granted = self.granted.unwrap_or(count as usize);
        if self.failing(InitStage::Map) {
            return Err(DeviceError::MapFailed {
                index: 0,
                source: io::Error::from(io::ErrorKind::OutOfMemory),
            });
        }
        self.slots = vec![vec![0; self.slot_capacity]; granted];
        Ok(granted)
    }

    fn slot(&self, index: usize) -> &[u8] {
        &self.slots[index]
    }

    fn enqueue(&mut self, index: usize) -> Result<(), DeviceError> {
        self.ops.push(DeviceOp::Enqueue(index));
        if index >= self.slots.len() || self.queue.contains(&index) {
            return Err(DeviceError::EnqueueFailed {
                index,
                source: io::Error::from(io::ErrorKind::InvalidInput),
            });
        }
        self.queue.push_back(index);
        Ok(())
    }

    fn dequeue(&mut self) -> Result<Dequeued, DeviceError> {
        let call = self.dequeue_calls;
        self.dequeue_calls += 1;
        if self.fail_dequeue == Some(call) {
            return Err(DeviceError::DequeueFailed(io::Error::other(
                "injected dequeue failure",
            )));
        }
        if !self.streaming {
            return Err(DeviceError::DequeueFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "stream is off",
            )));
        }
        if self.queue.is_empty() {
            return Err(DeviceError::DequeueFailed(io::Error::new(
                io::ErrorKind::WouldBlock,
                "no buffer queued",
            )));
        }

        let payload = self.next_payload()?;
        let index = match self.queue.pop_front() {
            Some(index) => index,
            None => {
                return Err(DeviceError::DequeueFailed(io::Error::from(
                    io::ErrorKind::WouldBlock,
                )))
            }
        };
        let slot = &mut self.slots[index];
        let written = payload.len().min(slot.len());
        slot[..written].copy_from_slice(&payload[..written]);

        self.produced += 1;
        self.ops.push(DeviceOp::Dequeue(index));
        Ok(Dequeued {
            index,
            bytes_used: self.bytes_used_override.unwrap_or(written),
        })
    }

    fn start_stream(&mut self) -> Result<(), DeviceError> {
        self.ops.push(DeviceOp::StartStream);
        if self.failing(InitStage::Stream) {
            return Err(DeviceError::StreamFailed {
                state: "on",
                source: io::Error::from(io::ErrorKind::Unsupported),
            });
        }
        self.streaming = true;
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<(), DeviceError> {
        self.ops.push(DeviceOp::StopStream);
        self.streaming = false;
        self.queue.clear();
        Ok(())
    }
}
