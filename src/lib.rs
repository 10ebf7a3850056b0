pub mod capture;
pub mod error;
pub mod server;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use capture::frame::PixelFormat;
use capture::synthetic::SYNTHETIC_PREFIX;
use capture::{
    spawn_capture, CaptureHandle, FeedOptions, FormatRequest, FrameFeed, FrameSource,
    SyntheticDevice, V4l2Device,
};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use server::PageVariant;
use tracing::info;

/// Configuration file looked up in the working directory.
pub const CONFIG_FILE: &str = "camserve.toml";
/// Prefix of environment overrides, e.g. `CAMSERVE__SERVER__LISTEN`.
pub const ENV_PREFIX: &str = "CAMSERVE";

/// System configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Device node, `auto`, or `synthetic://`
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    pub retry_delay_ms: u64,
    pub max_consecutive_failures: u32,
    pub synthetic_fps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen: String,
    pub page: PageVariant,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                device: "/dev/video0".into(),
                width: 1280,
                height: 720,
                format: PixelFormat::Mjpeg,
                buffer_count: capture::DEFAULT_BUFFER_COUNT,
                retry_delay_ms: 10,
                max_consecutive_failures: 50,
                synthetic_fps: 15,
            },
            server: ServerConfig {
                listen: "0.0.0.0:8080".into(),
                page: PageVariant::WebSocket,
            },
        }
    }
}

impl Config {
    /// Defaults, then `camserve.toml` if present, then `CAMSERVE__*` variables.
    pub fn load() -> std::result::Result<Self, config::ConfigError> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> std::result::Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

impl CaptureConfig {
    pub fn format_request(&self) -> FormatRequest {
        FormatRequest {
            width: self.width,
            height: self.height,
            format: self.format,
        }
    }

    pub fn feed_options(&self) -> FeedOptions {
        FeedOptions {
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_consecutive_failures: self.max_consecutive_failures.max(1),
        }
    }
}

/// Bring up the configured device and start the capture thread.
///
/// Fails if the device cannot be initialized; nothing is left running then.
pub fn start_capture(config: &CaptureConfig) -> Result<(FrameFeed, CaptureHandle)> {
    let (publisher, feed) = FrameFeed::channel();
    let request = config.format_request();

    let handle = if config.device.starts_with(SYNTHETIC_PREFIX) {
        info!("Using synthetic capture device at {} fps", config.synthetic_fps);
        let device = SyntheticDevice::pattern(config.synthetic_fps);
        let source = FrameSource::initialize(device, request, config.buffer_count)?;
        spawn_capture(source, publisher, config.feed_options())?
    } else {
        let path = utils::resolve_device(&config.device)?;
        let device = V4l2Device::open(&path)?;
        let source = FrameSource::initialize(device, request, config.buffer_count)?;
        spawn_capture(source, publisher, config.feed_options())?
    };

    Ok((feed, handle))
}
