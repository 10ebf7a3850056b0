//! Capture loop and latest-frame fan-out.
//!
//! A single thread owns the [`FrameSource`] and is the only caller of
//! `acquire_frame`. Every acquired frame is copied out of its slot once and
//! published on a watch channel, so all viewers share one acquisition and
//! frames reach each viewer in acquisition order (a slow viewer skips frames,
//! it never sees them reordered).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::DeviceError;

use super::device::CaptureDevice;
use super::frame::Frame;
use super::source::FrameSource;

/// Latest state published by the capture loop.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Pending,
    Frame(Frame),
    Fault(String),
}

/// Capture loop tuning.
#[derive(Debug, Clone, Copy)]
pub struct FeedOptions {
    pub retry_delay: Duration,
    pub max_consecutive_failures: u32,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(10),
            max_consecutive_failures: 50,
        }
    }
}

/// Publishing side of the feed.
pub struct FramePublisher {
    tx: watch::Sender<FeedEvent>,
    sequence: u64,
}

impl FramePublisher {
    pub fn publish(&mut self, frame: Frame) {
        self.sequence = frame.meta.sequence;
        self.tx.send_replace(FeedEvent::Frame(frame));
    }

    pub fn fault(&self, reason: impl Into<String>) {
        self.tx.send_replace(FeedEvent::Fault(reason.into()));
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence + 1
    }
}

/// Receiving side, cloned into every connection.
#[derive(Clone)]
pub struct FrameFeed {
    rx: watch::Receiver<FeedEvent>,
}

impl FrameFeed {
    pub fn channel() -> (FramePublisher, FrameFeed) {
        let (tx, rx) = watch::channel(FeedEvent::Pending);
        (FramePublisher { tx, sequence: 0 }, FrameFeed { rx })
    }

    /// Wait for a frame newer than the last one this handle returned.
    ///
    /// A fresh handle returns the most recent frame right away if one has been
    /// published.
    pub async fn next_frame(&mut self) -> Result<Frame, DeviceError> {
        loop {
            self.rx
                .changed()
                .await
                .map_err(|_| DeviceError::Unavailable("capture loop stopped".into()))?;

            let event = self.rx.borrow_and_update().clone();
            match event {
                FeedEvent::Pending => continue,
                FeedEvent::Frame(frame) => return Ok(frame),
                FeedEvent::Fault(reason) => return Err(DeviceError::Unavailable(reason)),
            }
        }
    }
}

/// Handle to the running capture thread.
pub struct CaptureHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Ask the loop to exit and wait for it to shut the device down.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("Capture thread panicked");
            }
        }
    }
}

/// Move `source` onto a dedicated thread that keeps the feed fresh.
pub fn spawn_capture<D>(
    source: FrameSource<D>,
    publisher: FramePublisher,
    options: FeedOptions,
) -> std::io::Result<CaptureHandle>
where
    D: CaptureDevice + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let stop_thread = stop.clone();
    let join = thread::Builder::new()
        .name("capture".into())
        .spawn(move || run_capture(source, publisher, options, &stop_thread))?;

    Ok(CaptureHandle {
        stop,
        join: Some(join),
    })
}

fn run_capture<D: CaptureDevice>(
    mut source: FrameSource<D>,
    mut publisher: FramePublisher,
    options: FeedOptions,
    stop: &AtomicBool,
) {
    info!("Capture loop started on {}", source.device().name());
    let mut failures = 0u32;

    while !stop.load(Ordering::SeqCst) {
        let sequence = publisher.next_sequence();
        match source.acquire_frame() {
            Ok(captured) => {
                failures = 0;
                let frame = Frame::from_captured(&captured, sequence);
                metrics::counter!("camserve_frames_captured_total").increment(1);
                debug!(sequence, slot = frame.meta.slot, bytes = frame.len(), "frame captured");
                publisher.publish(frame);
            }
            // Not a failure: nothing changed hands, and `stop` is re-checked.
            Err(DeviceError::Timeout(waited)) => {
                debug!("No frame within {:?}", waited);
            }
            Err(e) => {
                failures += 1;
                metrics::counter!("camserve_capture_errors_total").increment(1);
                warn!("Capture error ({} in a row): {}", failures, e);
                publisher.fault(e.to_string());

                if failures >= options.max_consecutive_failures {
                    error!("Giving up on capture after {} consecutive failures", failures);
                    break;
                }
                thread::sleep(options.retry_delay);
            }
        }
    }

    if let Err(e) = source.shutdown() {
        warn!("Capture shutdown failed: {}", e);
    }
    info!("Capture loop stopped");
    // Dropping the publisher wakes every waiting viewer with an error.
}
