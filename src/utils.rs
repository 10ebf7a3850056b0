use color_eyre::{eyre::eyre, Result};
use tracing::info;
use v4l::{capability::Flags, video::Capture, Device, FourCC};

/// Device path to open for a configured `device` value.
pub fn resolve_device(configured: &str) -> Result<String> {
    if configured.is_empty() || configured == "auto" {
        auto_detect_device()
    } else {
        Ok(configured.to_string())
    }
}

/// Auto-detect the first capture device offering MJPEG
pub fn auto_detect_device() -> Result<String> {
    use std::path::Path;

    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }
        if let Ok(formats) = dev.enum_formats() {
            if formats.iter().any(|fmt| fmt.fourcc == FourCC::new(b"MJPG")) {
                info!("Found MJPEG device: {} - {}", path, caps.card);
                return Ok(path);
            }
        }
    }

    Err(eyre!("No MJPEG capture device found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_paths_are_used_verbatim() {
        assert_eq!(resolve_device("/dev/video3").unwrap(), "/dev/video3");
    }
}
