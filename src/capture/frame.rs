use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::source::CapturedFrame;

/// Frame published to viewers, detached from the ring slot it came from.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Encoded JPEG payload - shared by every viewer without copying
    pub data: Bytes,

    pub meta: FrameMetadata,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    /// Ring slot the payload was dequeued from
    pub slot: usize,
}

impl Frame {
    /// Copy a borrowed ring view out so the slot can go back to the driver.
    pub fn from_captured(captured: &CapturedFrame<'_>, sequence: u64) -> Self {
        Self {
            data: Bytes::copy_from_slice(captured.bytes()),
            meta: FrameMetadata {
                sequence,
                slot: captured.index(),
            },
            timestamp: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Pixel formats whose frames are already JPEG encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Mjpeg,
    Jpeg,
}

impl PixelFormat {
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Jpeg => *b"JPEG",
        }
    }
}
