use std::sync::Mutex;
use std::time::Duration;

use tracing::info;

use super::{Device, Insets, Screenshot};
use crate::error::PilotError;

/// Mock backend used when `DEBUG_MODE` is set. Logs every operation, sleeps
/// proportionally to the work a real device would do, and synthesizes a
/// placeholder screenshot at the configured resolution. The core treats this
/// and the adb backend identically.
pub struct MockDevice {
    name: String,
    width: u32,
    height: u32,
    foreground: Mutex<Option<String>>,
    op_log: Mutex<Vec<String>>,
}

const MOCK_INSET_TOP: u32 = 80;
const MOCK_INSET_BOTTOM: u32 = 48;

impl MockDevice {
    pub fn new(name: String, width: u32, height: u32) -> Self {
        Self {
            name,
            width,
            height,
            foreground: Mutex::new(None),
            op_log: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, op: String, cost: Duration) {
        info!("[mock:{}] {}", self.name, op);
        self.op_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(op);
        std::thread::sleep(cost);
    }

    /// Operations issued so far, for assertions in tests.
    pub fn operations(&self) -> Vec<String> {
        self.op_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn screenshot_count(&self) -> usize {
        self.operations()
            .iter()
            .filter(|op| op.starts_with("screenshot"))
            .count()
    }
}

impl Device for MockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn tap(&self, x: i32, y: i32) -> Result<(), PilotError> {
        self.record(format!("tap {x},{y}"), Duration::from_millis(30));
        Ok(())
    }

    fn long_press(&self, x: i32, y: i32, duration_ms: u64) -> Result<(), PilotError> {
        self.record(
            format!("long_press {x},{y} {duration_ms}ms"),
            Duration::from_millis(duration_ms.min(200)),
        );
        Ok(())
    }

    fn swipe(
        &self,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        duration_ms: u64,
    ) -> Result<(), PilotError> {
        self.record(
            format!("swipe {x1},{y1} -> {x2},{y2} {duration_ms}ms"),
            Duration::from_millis(duration_ms.min(200)),
        );
        Ok(())
    }

    fn input_text(&self, text: &str) -> Result<(), PilotError> {
        let mode = if super::needs_wide_input(text) {
            "wide"
        } else {
            "plain"
        };
        self.record(
            format!("input_text[{mode}] {} chars", text.chars().count()),
            Duration::from_millis((text.chars().count() as u64 * 5).min(300)),
        );
        Ok(())
    }

    fn key_event(&self, code: &str) -> Result<(), PilotError> {
        if code == super::KEY_HOME {
            *self.foreground.lock().unwrap_or_else(|e| e.into_inner()) = None;
        }
        self.record(format!("keyevent {code}"), Duration::from_millis(20));
        Ok(())
    }

    fn launch_app(&self, package: &str) -> Result<(), PilotError> {
        *self.foreground.lock().unwrap_or_else(|e| e.into_inner()) = Some(package.to_string());
        self.record(format!("launch_app {package}"), Duration::from_millis(150));
        Ok(())
    }

    fn stop_app(&self, package: &str) -> Result<(), PilotError> {
        let mut fg = self.foreground.lock().unwrap_or_else(|e| e.into_inner());
        if fg.as_deref() == Some(package) {
            *fg = None;
        }
        drop(fg);
        self.record(format!("stop_app {package}"), Duration::from_millis(80));
        Ok(())
    }

    fn open_url(&self, url: &str) -> Result<(), PilotError> {
        self.record(format!("open_url {url}"), Duration::from_millis(120));
        Ok(())
    }

    fn call(&self, number: &str) -> Result<(), PilotError> {
        self.record(format!("call {number}"), Duration::from_millis(120));
        Ok(())
    }

    fn foreground_app(&self) -> Result<Option<String>, PilotError> {
        Ok(self
            .foreground
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    fn screen_size(&self) -> Result<(u32, u32), PilotError> {
        Ok((self.width, self.height))
    }

    fn safe_insets(&self) -> Result<Insets, PilotError> {
        Ok(Insets {
            top: MOCK_INSET_TOP,
            bottom: MOCK_INSET_BOTTOM,
        })
    }

    fn screenshot(&self) -> Result<Screenshot, PilotError> {
        let h = self.height - MOCK_INSET_TOP - MOCK_INSET_BOTTOM;
        // Flat gray with a diagonal band: enough texture that the locator's
        // template stage returns a clean no-match instead of noise.
        let img = image::RgbaImage::from_fn(self.width, h, |x, y| {
            if (x + y) % 97 < 8 {
                image::Rgba([90, 90, 110, 255])
            } else {
                image::Rgba([245, 245, 245, 255])
            }
        });
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(
                &mut std::io::Cursor::new(&mut buf),
                image::ImageFormat::Png,
            )
            .map_err(|e| PilotError::DeviceCommandFailed(format!("mock png encode: {e}")))?;
        self.record(
            format!("screenshot {}x{h}", self.width),
            Duration::from_millis(60),
        );
        Ok(Screenshot {
            png: buf,
            width: self.width,
            height: h,
            crop_top: MOCK_INSET_TOP,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock() -> MockDevice {
        MockDevice::new("test".into(), 320, 640)
    }

    #[test]
    fn go_home_presses_home_twice() {
        let dev = mock();
        dev.launch_app("com.example.app").unwrap();
        dev.go_home().unwrap();
        let ops = dev.operations();
        let home_presses = ops
            .iter()
            .filter(|op| op.contains("KEYCODE_HOME"))
            .count();
        assert_eq!(home_presses, 2);
        assert_eq!(dev.foreground_app().unwrap(), None);
    }

    #[test]
    fn launch_sets_foreground() {
        let dev = mock();
        assert_eq!(dev.foreground_app().unwrap(), None);
        dev.launch_app("com.tencent.mm").unwrap();
        assert_eq!(
            dev.foreground_app().unwrap().as_deref(),
            Some("com.tencent.mm")
        );
        dev.stop_app("com.tencent.mm").unwrap();
        assert_eq!(dev.foreground_app().unwrap(), None);
    }

    #[test]
    fn screenshot_is_cropped_and_decodable() {
        let dev = mock();
        let shot = dev.screenshot().unwrap();
        assert_eq!(shot.crop_top, MOCK_INSET_TOP);
        assert_eq!(shot.height, 640 - MOCK_INSET_TOP - MOCK_INSET_BOTTOM);
        let decoded = image::load_from_memory(&shot.png).unwrap();
        assert_eq!(decoded.width(), 320);
    }

    #[test]
    fn operations_are_logged_in_order() {
        let dev = mock();
        dev.tap(10, 20).unwrap();
        dev.input_text("hi").unwrap();
        let ops = dev.operations();
        assert!(ops[0].starts_with("tap 10,20"));
        assert!(ops[1].starts_with("input_text[plain]"));
    }
}
