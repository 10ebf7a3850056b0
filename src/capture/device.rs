//! Device boundary consumed by the frame ring.
//!
//! The ring never talks to a driver directly. It drives an implementation of
//! [`CaptureDevice`] through a fixed initialization order:
//! query capability, negotiate format, request (and map) buffers, enqueue every
//! slot, start the stream. After that only `enqueue`/`dequeue` are used until
//! `stop_stream`.

use crate::error::DeviceError;

use super::frame::PixelFormat;

/// Format the ring asks the device for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// A slot handed back by the driver after it finished filling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dequeued {
    pub index: usize,
    pub bytes_used: usize,
}

pub trait CaptureDevice {
    /// Human readable identity, used in logs.
    fn name(&self) -> &str;

    fn query_capability(&mut self) -> Result<(), DeviceError>;

    fn negotiate_format(&mut self, request: &FormatRequest) -> Result<(), DeviceError>;

    /// Ask the driver for `count` buffers and map each of them.
    ///
    /// Returns the number of slots actually mapped.
    fn request_buffers(&mut self, count: u32) -> Result<usize, DeviceError>;

    /// Memory of a mapped slot. Only valid for indices below the count
    /// returned by `request_buffers`.
    fn slot(&self, index: usize) -> &[u8];

    /// Hand a slot to the driver for filling.
    fn enqueue(&mut self, index: usize) -> Result<(), DeviceError>;

    /// Block until the driver has filled a queued slot.
    fn dequeue(&mut self) -> Result<Dequeued, DeviceError>;

    fn start_stream(&mut self) -> Result<(), DeviceError>;

    fn stop_stream(&mut self) -> Result<(), DeviceError>;
}
