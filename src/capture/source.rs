//! Fixed ring of driver-owned frame buffers.
//!
//! The ring mirrors the driver's ownership contract: a slot is either free,
//! queued (the driver may write into it) or owned by the caller (the driver
//! must not touch it). At most one slot is owned at a time. The owned slot is
//! given back lazily, on the next [`FrameSource::acquire_frame`], so the view
//! handed out stays valid for as long as the caller holds it.

use tracing::{debug, info, instrument, warn};

use crate::error::DeviceError;

use super::device::{CaptureDevice, FormatRequest};

/// Number of ring slots used unless configured otherwise.
pub const DEFAULT_BUFFER_COUNT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Queued,
    Owned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Streaming,
    Closed,
}

impl Lifecycle {
    fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Uninitialized => "uninitialized",
            Lifecycle::Streaming => "streaming",
            Lifecycle::Closed => "closed",
        }
    }
}

/// Read-only view over the slot currently owned by the caller.
///
/// Borrows the source, so a new frame cannot be acquired while it is alive.
#[derive(Debug)]
pub struct CapturedFrame<'a> {
    index: usize,
    bytes: &'a [u8],
}

impl<'a> CapturedFrame<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

pub struct FrameSource<D: CaptureDevice> {
    device: D,
    state: Lifecycle,
    slots: Vec<SlotState>,
    outstanding: Option<usize>,
}

impl<D: CaptureDevice> FrameSource<D> {
    /// Bring the device up and start streaming.
    ///
    /// Either every step succeeds and the ring is streaming, or the device is
    /// dropped and the first failure is returned.
    #[instrument(skip(device), fields(device = device.name()))]
    pub fn initialize(
        device: D,
        request: FormatRequest,
        buffer_count: u32,
    ) -> Result<Self, DeviceError> {
        let mut source = Self {
            device,
            state: Lifecycle::Uninitialized,
            slots: Vec::new(),
            outstanding: None,
        };
        source.start(request, buffer_count)?;
        Ok(source)
    }

    fn start(&mut self, request: FormatRequest, buffer_count: u32) -> Result<(), DeviceError> {
        if self.state != Lifecycle::Uninitialized {
            return Err(DeviceError::NotStreaming(self.state.as_str()));
        }

        self.device.query_capability()?;
        self.device.negotiate_format(&request)?;

        let granted = self.device.request_buffers(buffer_count)?;
        if granted != buffer_count as usize {
            return Err(DeviceError::BufferRequestFailed {
                reason: format!("requested {buffer_count} buffers, driver granted {granted}"),
            });
        }
        self.slots = vec![SlotState::Free; granted];

        for index in 0..granted {
            self.device.enqueue(index)?;
            self.slots[index] = SlotState::Queued;
        }

        self.device.start_stream()?;
        self.state = Lifecycle::Streaming;

        info!(
            "Capture ring streaming: {} buffers, {}x{} {:?}",
            granted, request.width, request.height, request.format
        );
        Ok(())
    }

    /// Return the slot handed out last, then wait for the next filled one.
    pub fn acquire_frame(&mut self) -> Result<CapturedFrame<'_>, DeviceError> {
        if self.state != Lifecycle::Streaming {
            return Err(DeviceError::NotStreaming(self.state.as_str()));
        }

        if let Some(index) = self.outstanding {
            self.device.enqueue(index)?;
            self.slots[index] = SlotState::Queued;
            self.outstanding = None;
        }

        let dequeued = self.device.dequeue()?;
        let index = dequeued.index;
        if self.slots.get(index) != Some(&SlotState::Queued) {
            return Err(DeviceError::UnexpectedSlot { index });
        }

        let memory = self.device.slot(index);
        if dequeued.bytes_used > memory.len() {
            // Keep ownership consistent: the slot is out of the driver's hands.
            self.slots[index] = SlotState::Owned;
            self.outstanding = Some(index);
            return Err(DeviceError::Overrun {
                index,
                bytes_used: dequeued.bytes_used,
                capacity: memory.len(),
            });
        }

        self.slots[index] = SlotState::Owned;
        self.outstanding = Some(index);

        Ok(CapturedFrame {
            index,
            bytes: &memory[..dequeued.bytes_used],
        })
    }

    /// Stop the stream and release the device.
    pub fn shutdown(&mut self) -> Result<(), DeviceError> {
        if self.state != Lifecycle::Streaming {
            return Err(DeviceError::NotStreaming(self.state.as_str()));
        }
        self.state = Lifecycle::Closed;
        self.outstanding = None;
        self.slots.iter_mut().for_each(|slot| *slot = SlotState::Free);

        debug!("Stopping capture stream on {}", self.device.name());
        self.device.stop_stream()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state
    }

    pub fn slot_states(&self) -> &[SlotState] {
        &self.slots
    }

    pub fn slot_capacity(&self, index: usize) -> Option<usize> {
        (index < self.slots.len()).then(|| self.device.slot(index).len())
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    #[cfg(test)]
    fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }
}

impl<D: CaptureDevice> Drop for FrameSource<D> {
    fn drop(&mut self) {
        if self.state == Lifecycle::Streaming {
            if let Err(e) = self.shutdown() {
                warn!("Failed to stop capture stream: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::{DeviceOp, InitStage, SyntheticDevice};
    use crate::capture::PixelFormat;

    fn request() -> FormatRequest {
        FormatRequest {
            width: 640,
            height: 480,
            format: PixelFormat::Mjpeg,
        }
    }

    fn scripted(frames: &[&[u8]]) -> SyntheticDevice {
        SyntheticDevice::scripted(frames.iter().map(|f| f.to_vec()).collect(), 64)
    }

    #[test]
    fn initialization_follows_device_protocol() {
        let source = FrameSource::initialize(scripted(&[b"a"]), request(), 3).unwrap();

        assert_eq!(source.lifecycle(), Lifecycle::Streaming);
        assert_eq!(source.slot_states(), &[SlotState::Queued; 3]);
        assert_eq!(
            source.device().ops(),
            &[
                DeviceOp::QueryCapability,
                DeviceOp::NegotiateFormat,
                DeviceOp::RequestBuffers(3),
                DeviceOp::Enqueue(0),
                DeviceOp::Enqueue(1),
                DeviceOp::Enqueue(2),
                DeviceOp::StartStream,
            ]
        );
    }

    #[test]
    fn frames_arrive_in_order_and_previous_slot_is_requeued_first() {
        let mut source =
            FrameSource::initialize(scripted(&[b"first", b"second", b"third"]), request(), 3)
                .unwrap();

        let first = source.acquire_frame().unwrap();
        assert_eq!((first.index(), first.bytes()), (0, &b"first"[..]));

        let second = source.acquire_frame().unwrap();
        assert_eq!((second.index(), second.bytes()), (1, &b"second"[..]));

        let third = source.acquire_frame().unwrap();
        assert_eq!((third.index(), third.bytes()), (2, &b"third"[..]));

        let ops = &source.device().ops()[7..];
        assert_eq!(
            ops,
            &[
                DeviceOp::Dequeue(0),
                DeviceOp::Enqueue(0),
                DeviceOp::Dequeue(1),
                DeviceOp::Enqueue(1),
                DeviceOp::Dequeue(2),
            ]
        );
    }

    #[test]
    fn exactly_one_slot_is_owned_after_acquire() {
        let mut source =
            FrameSource::initialize(scripted(&[b"one", b"two"]), request(), 3).unwrap();

        source.acquire_frame().unwrap();
        assert_eq!(
            source.slot_states(),
            &[SlotState::Owned, SlotState::Queued, SlotState::Queued]
        );

        source.acquire_frame().unwrap();
        assert_eq!(
            source.slot_states(),
            &[SlotState::Queued, SlotState::Owned, SlotState::Queued]
        );
    }

    #[test]
    fn frame_length_never_exceeds_slot_capacity() {
        let mut source =
            FrameSource::initialize(scripted(&[&[7u8; 64], &[1u8; 10]]), request(), 3).unwrap();

        for _ in 0..2 {
            let frame = source.acquire_frame().unwrap();
            let index = frame.index();
            let len = frame.len();
            assert!(len <= source.slot_capacity(index).unwrap());
        }
    }

    #[test]
    fn owned_slot_is_not_refilled_while_driver_runs() {
        let mut source = FrameSource::initialize(
            scripted(&[b"stable", b"second", b"third"]),
            request(),
            3,
        )
        .unwrap();

        let (index, copy) = {
            let frame = source.acquire_frame().unwrap();
            (frame.index(), frame.bytes().to_vec())
        };
        assert_eq!(index, 0);

        // The driver fills every slot it still holds; the owned one is not among them.
        let device = source.device_mut();
        assert_eq!(device.dequeue().unwrap().index, 1);
        assert_eq!(device.dequeue().unwrap().index, 2);
        assert!(device.dequeue().is_err());

        assert_eq!(&source.device().slot(index)[..copy.len()], copy.as_slice());
        assert_eq!(source.slot_states()[index], SlotState::Owned);
    }

    #[test]
    fn oversized_driver_report_is_rejected() {
        let mut device = scripted(&[b"abc"]);
        device.report_bytes_used(1_000);
        let mut source = FrameSource::initialize(device, request(), 3).unwrap();

        let err = source.acquire_frame().unwrap_err();
        assert!(matches!(err, DeviceError::Overrun { index: 0, .. }));

        // The slot still goes back to the driver on the next call.
        let _ = source.acquire_frame();
        assert!(source.device().ops().contains(&DeviceOp::Enqueue(0)));
    }

    #[test]
    fn dequeue_failure_surfaces_and_ring_stays_usable() {
        let mut device = scripted(&[b"one", b"two"]);
        device.fail_dequeue_at(1);
        let mut source = FrameSource::initialize(device, request(), 3).unwrap();

        source.acquire_frame().unwrap();
        assert!(matches!(
            source.acquire_frame(),
            Err(DeviceError::DequeueFailed(_))
        ));
        let frame = source.acquire_frame().unwrap();
        assert_eq!(frame.bytes(), b"two");
    }

    #[test]
    fn initialization_failures_map_to_their_stage() {
        let cases = [
            (InitStage::Capability, "format"),
            (InitStage::Format, "format"),
            (InitStage::Buffers, "buffer"),
            (InitStage::Map, "map"),
            (InitStage::Stream, "stream"),
        ];
        for (stage, expected) in cases {
            let mut device = scripted(&[b"x"]);
            device.fail_init_at(stage);
            let err = FrameSource::initialize(device, request(), 3).err().unwrap();
            let matched = match err {
                DeviceError::FormatRejected { .. } => "format",
                DeviceError::BufferRequestFailed { .. } => "buffer",
                DeviceError::MapFailed { .. } => "map",
                DeviceError::StreamFailed { .. } => "stream",
                other => panic!("unexpected error {other:?}"),
            };
            assert_eq!(matched, expected, "stage {stage:?}");
        }
    }

    #[test]
    fn short_buffer_grant_is_rejected() {
        let mut device = scripted(&[b"x"]);
        device.grant_buffers(2);
        let err = FrameSource::initialize(device, request(), 3).err().unwrap();
        assert!(matches!(err, DeviceError::BufferRequestFailed { .. }));
    }

    #[test]
    fn acquire_after_shutdown_is_refused() {
        let mut source = FrameSource::initialize(scripted(&[b"x"]), request(), 3).unwrap();
        source.shutdown().unwrap();

        assert_eq!(source.lifecycle(), Lifecycle::Closed);
        assert!(matches!(
            source.acquire_frame(),
            Err(DeviceError::NotStreaming("closed"))
        ));
        assert!(source.shutdown().is_err());
        assert_eq!(source.device().ops().last(), Some(&DeviceOp::StopStream));
    }
}
