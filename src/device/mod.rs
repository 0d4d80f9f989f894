use std::sync::Arc;

use crate::config::Config;
use crate::error::PilotError;

mod adb;
mod mock;

pub use adb::AdbDevice;
pub use mock::MockDevice;

/// Raw capture result. `png` holds the image bytes after the vertical crop;
/// `crop_top` is the number of rows removed from the top of the display so
/// callers can translate matched coordinates back to full-screen pixels.
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub crop_top: u32,
}

/// Safe-area insets in pixels (status bar above, navigation bar below).
#[derive(Debug, Clone, Copy, Default)]
pub struct Insets {
    pub top: u32,
    pub bottom: u32,
}

/// Android key codes the executor issues by name.
pub const KEY_HOME: &str = "KEYCODE_HOME";
pub const KEY_BACK: &str = "KEYCODE_BACK";
pub const KEY_ENTER: &str = "KEYCODE_ENTER";

/// The narrow command surface to one device binding. Commands are strictly
/// serialized by the caller; implementations may block. Every operation
/// returns a typed error instead of panicking across the boundary.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    fn tap(&self, x: i32, y: i32) -> Result<(), PilotError>;
    fn long_press(&self, x: i32, y: i32, duration_ms: u64) -> Result<(), PilotError>;
    fn swipe(&self, x1: i32, y1: i32, x2: i32, y2: i32, duration_ms: u64)
        -> Result<(), PilotError>;

    /// Text input. Plain `input text` for ASCII; wide characters go through
    /// the base64 broadcast channel with a raw-broadcast fallback.
    fn input_text(&self, text: &str) -> Result<(), PilotError>;

    fn key_event(&self, code: &str) -> Result<(), PilotError>;

    fn launch_app(&self, package: &str) -> Result<(), PilotError>;
    fn stop_app(&self, package: &str) -> Result<(), PilotError>;

    /// Open a URL through the system view intent.
    fn open_url(&self, url: &str) -> Result<(), PilotError>;

    /// Start a phone call through the dial intent.
    fn call(&self, number: &str) -> Result<(), PilotError>;

    /// Foreground package, or `None` when the query is unsupported on this
    /// device build (callers fall back to screenshot detection).
    fn foreground_app(&self) -> Result<Option<String>, PilotError>;

    fn screen_size(&self) -> Result<(u32, u32), PilotError>;
    fn safe_insets(&self) -> Result<Insets, PilotError>;

    /// Capture the display, cropped to the safe area.
    fn screenshot(&self) -> Result<Screenshot, PilotError>;

    /// Two consecutive HOME presses with a brief interval. A single press may
    /// only back out to an app's own root screen.
    fn go_home(&self) -> Result<(), PilotError> {
        self.key_event(KEY_HOME)?;
        std::thread::sleep(std::time::Duration::from_millis(300));
        self.key_event(KEY_HOME)
    }
}

/// Whether text needs the wide-character input path.
pub fn needs_wide_input(text: &str) -> bool {
    text.chars().any(|c| c as u32 >= 0x80)
}

/// Pick the device backend from configuration.
pub fn open_device(config: &Config) -> Arc<dyn Device> {
    if config.debug.mock_device {
        Arc::new(MockDevice::new(
            config.debug.device_name.clone(),
            config.debug.screen_width,
            config.debug.screen_height,
        ))
    } else {
        Arc::new(AdbDevice::new(
            config.device.default_device.clone(),
            config.device.command_timeout,
            config.screenshot.capture_timeout,
        ))
    }
}

/// List serials of connected adb devices (for the `devices` subcommand).
pub fn list_adb_devices() -> Result<Vec<String>, PilotError> {
    let out = std::process::Command::new("adb")
        .arg("devices")
        .output()
        .map_err(|e| PilotError::DeviceUnavailable(format!("adb not found: {e}")))?;
    let text = String::from_utf8_lossy(&out.stdout);
    Ok(text
        .lines()
        .filter(|l| l.ends_with("\tdevice") || l.ends_with(" device"))
        .filter_map(|l| l.split_whitespace().next())
        .map(String::from)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_input_detection() {
        assert!(!needs_wide_input("hello world 123"));
        assert!(needs_wide_input("你好"));
        assert!(needs_wide_input("hi 张三"));
        assert!(needs_wide_input("café"));
    }
}
