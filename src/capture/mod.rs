pub mod device;
pub mod feed;
pub mod frame;
pub mod source;
pub mod synthetic;
pub mod v4l2;

pub use device::{CaptureDevice, Dequeued, FormatRequest};
pub use feed::{spawn_capture, CaptureHandle, FeedEvent, FeedOptions, FrameFeed, FramePublisher};
pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use source::{CapturedFrame, FrameSource, Lifecycle, SlotState, DEFAULT_BUFFER_COUNT};
pub use synthetic::SyntheticDevice;
pub use v4l2::V4l2Device;
