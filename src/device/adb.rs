use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use super::{needs_wide_input, Device, Insets, Screenshot};
use crate::error::PilotError;

/// Real device backend over the adb shell bridge.
pub struct AdbDevice {
    serial: Option<String>,
    timeout: Duration,
    /// Screenshots include a pull transfer and get their own, longer bound.
    screenshot_timeout: Duration,
    /// Insets are stable for a run; parse `dumpsys window` once.
    insets_cache: Mutex<Option<Insets>>,
    size_cache: Mutex<Option<(u32, u32)>>,
}

static RESUMED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:mResumedActivity|topResumedActivity).*?\s([A-Za-z0-9_.]+)/").unwrap()
});
static STATUS_BAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"statusBars[^\[]*frame=\[\d+,\d+\]\[\d+,(\d+)\]").unwrap());
static NAV_BAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"navigationBars[^\[]*frame=\[\d+,(\d+)\]\[\d+,(\d+)\]").unwrap());
static WM_SIZE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:Override size|Physical size):\s*(\d+)x(\d+)").unwrap());

impl AdbDevice {
    pub fn new(serial: Option<String>, timeout: Duration, screenshot_timeout: Duration) -> Self {
        Self {
            serial,
            timeout,
            screenshot_timeout,
            insets_cache: Mutex::new(None),
            size_cache: Mutex::new(None),
        }
    }

    fn base_cmd(&self) -> Command {
        let mut cmd = Command::new("adb");
        if let Some(serial) = &self.serial {
            cmd.args(["-s", serial]);
        }
        cmd
    }

    /// Run an adb command with a deadline. Timeout maps to
    /// `DeviceUnavailable`, a non-zero exit to `DeviceCommandFailed` with
    /// stderr attached.
    fn run(&self, args: &[&str]) -> Result<Vec<u8>, PilotError> {
        self.run_with_timeout(args, self.timeout)
    }

    fn run_with_timeout(&self, args: &[&str], timeout: Duration) -> Result<Vec<u8>, PilotError> {
        let mut cmd = self.base_cmd();
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| PilotError::DeviceUnavailable(format!("cannot spawn adb: {e}")))?;

        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let mut stdout = Vec::new();
                    let mut stderr = String::new();
                    if let Some(mut out) = child.stdout.take() {
                        let _ = out.read_to_end(&mut stdout);
                    }
                    if let Some(mut err) = child.stderr.take() {
                        let _ = err.read_to_string(&mut stderr);
                    }
                    if status.success() {
                        return Ok(stdout);
                    }
                    let stderr = stderr.trim();
                    return Err(PilotError::DeviceCommandFailed(format!(
                        "adb {}: {}",
                        args.join(" "),
                        if stderr.is_empty() { "unknown error" } else { stderr }
                    )));
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(PilotError::DeviceUnavailable(format!(
                            "adb {} timed out after {:?}",
                            args.join(" "),
                            timeout
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(e) => {
                    return Err(PilotError::DeviceUnavailable(format!(
                        "adb wait failed: {e}"
                    )));
                }
            }
        }
    }

    fn run_text(&self, args: &[&str]) -> Result<String, PilotError> {
        let bytes = self.run(args)?;
        Ok(String::from_utf8_lossy(&bytes).trim().to_string())
    }

    /// Shell-escape text for `input text`. `input` splits on spaces, so they
    /// become `%s`; shell metacharacters get backslashes.
    fn escape_for_input(text: &str) -> String {
        let mut escaped = String::with_capacity(text.len() * 2);
        for c in text.chars() {
            match c {
                ' ' => escaped.push_str("%s"),
                '\\' | '&' | '<' | '>' | '|' | ';' | '(' | ')' | '\'' | '"' | '$' | '`' | '*' => {
                    escaped.push('\\');
                    escaped.push(c);
                }
                _ => escaped.push(c),
            }
        }
        escaped
    }
}

impl Device for AdbDevice {
    fn name(&self) -> &str {
        self.serial.as_deref().unwrap_or("default")
    }

    fn tap(&self, x: i32, y: i32) -> Result<(), PilotError> {
        self.run(&["shell", "input", "tap", &x.to_string(), &y.to_string()])?;
        Ok(())
    }

    fn long_press(&self, x: i32, y: i32, duration_ms: u64) -> Result<(), PilotError> {
        // input has no dedicated long-press; a same-point swipe with a
        // duration is the standard trick.
        let (xs, ys) = (x.to_string(), y.to_string());
        self.run(&[
            "shell",
            "input",
            "swipe",
            &xs,
            &ys,
            &xs,
            &ys,
            &duration_ms.to_string(),
        ])?;
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
        self.run(&[
            "shell",
            "input",
            "swipe",
            &x1.to_string(),
            &y1.to_string(),
            &x2.to_string(),
            &y2.to_string(),
            &duration_ms.to_string(),
        ])?;
        Ok(())
    }

    fn input_text(&self, text: &str) -> Result<(), PilotError> {
        if text.is_empty() {
            return Ok(());
        }
        if needs_wide_input(text) {
            // Wide characters can't go through `input text`. The broadcast
            // keyboard accepts a base64-encoded UTF-8 payload; older builds
            // only understand the raw-string form.
            let encoded = base64::engine::general_purpose::STANDARD.encode(text.as_bytes());
            match self.run(&[
                "shell",
                "am",
                "broadcast",
                "-a",
                "ADB_INPUT_B64",
                "--es",
                "msg",
                &encoded,
            ]) {
                Ok(_) => Ok(()),
                Err(e) => {
                    warn!("base64 input broadcast failed ({e}), trying raw broadcast");
                    self.run(&[
                        "shell",
                        "am",
                        "broadcast",
                        "-a",
                        "ADB_INPUT_TEXT",
                        "--es",
                        "msg",
                        text,
                    ])?;
                    Ok(())
                }
            }
        } else {
            let escaped = Self::escape_for_input(text);
            self.run(&["shell", "input", "text", &escaped])?;
            Ok(())
        }
    }

    fn key_event(&self, code: &str) -> Result<(), PilotError> {
        self.run(&["shell", "input", "keyevent", code])?;
        Ok(())
    }

    fn launch_app(&self, package: &str) -> Result<(), PilotError> {
        self.run(&[
            "shell",
            "monkey",
            "-p",
            package,
            "-c",
            "android.intent.category.LAUNCHER",
            "1",
        ])?;
        Ok(())
    }

    fn stop_app(&self, package: &str) -> Result<(), PilotError> {
        self.run(&["shell", "am", "force-stop", package])?;
        Ok(())
    }

    fn open_url(&self, url: &str) -> Result<(), PilotError> {
        self.run(&[
            "shell",
            "am",
            "start",
            "-a",
            "android.intent.action.VIEW",
            "-d",
            url,
        ])?;
        Ok(())
    }

    fn call(&self, number: &str) -> Result<(), PilotError> {
        let uri = format!("tel:{number}");
        self.run(&[
            "shell",
            "am",
            "start",
            "-a",
            "android.intent.action.CALL",
            "-d",
            &uri,
        ])?;
        Ok(())
    }

    fn foreground_app(&self) -> Result<Option<String>, PilotError> {
        let raw = self.run_text(&["shell", "dumpsys", "activity", "activities"])?;
        for line in raw.lines() {
            if line.contains("mResumedActivity") || line.contains("topResumedActivity") {
                if let Some(caps) = RESUMED_RE.captures(line) {
                    return Ok(Some(caps[1].to_string()));
                }
            }
        }
        debug!("foreground query returned no resumed activity");
        Ok(None)
    }

    fn screen_size(&self) -> Result<(u32, u32), PilotError> {
        if let Some(size) = *self.size_cache.lock().unwrap_or_else(|e| e.into_inner()) {
            return Ok(size);
        }
        let raw = self.run_text(&["shell", "wm", "size"])?;
        // Prefer the override size when present (display scaling).
        let size = WM_SIZE_RE
            .captures_iter(&raw)
            .last()
            .and_then(|caps| {
                Some((caps[1].parse::<u32>().ok()?, caps[2].parse::<u32>().ok()?))
            })
            .ok_or_else(|| {
                PilotError::DeviceCommandFailed(format!("cannot parse wm size output: {raw}"))
            })?;
        *self.size_cache.lock().unwrap_or_else(|e| e.into_inner()) = Some(size);
        Ok(size)
    }

    fn safe_insets(&self) -> Result<Insets, PilotError> {
        if let Some(insets) = *self.insets_cache.lock().unwrap_or_else(|e| e.into_inner()) {
            return Ok(insets);
        }
        let raw = self.run_text(&["shell", "dumpsys", "window", "displays"])?;
        let top = STATUS_BAR_RE
            .captures(&raw)
            .and_then(|c| c[1].parse::<u32>().ok())
            .unwrap_or(0);
        let bottom = NAV_BAR_RE
            .captures(&raw)
            .and_then(|c| {
                let y1 = c[1].parse::<u32>().ok()?;
                let y2 = c[2].parse::<u32>().ok()?;
                Some(y2.saturating_sub(y1))
            })
            .unwrap_or(0);
        let insets = Insets { top, bottom };
        *self.insets_cache.lock().unwrap_or_else(|e| e.into_inner()) = Some(insets);
        Ok(insets)
    }

    fn screenshot(&self) -> Result<Screenshot, PilotError> {
        let png = self.run_with_timeout(&["exec-out", "screencap", "-p"], self.screenshot_timeout)?;
        if png.len() < 8 {
            return Err(PilotError::DeviceCommandFailed(
                "screencap produced no image data".into(),
            ));
        }
        let insets = self.safe_insets().unwrap_or_default();
        crop_screenshot(&png, insets)
    }
}

/// Decode, crop status/navigation bars, and re-encode. A decode failure is a
/// command failure: the bridge handed back something that isn't a PNG.
pub(super) fn crop_screenshot(png: &[u8], insets: Insets) -> Result<Screenshot, PilotError> {
    let img = image::load_from_memory(png)
        .map_err(|e| PilotError::DeviceCommandFailed(format!("bad screenshot data: {e}")))?;
    let (w, h) = (img.width(), img.height());
    let top = insets.top.min(h / 4);
    let bottom = insets.bottom.min(h / 4);
    let cropped_h = h - top - bottom;

    let cropped = image::imageops::crop_imm(&img, 0, top, w, cropped_h).to_image();
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgba8(cropped)
        .write_to(
            &mut std::io::Cursor::new(&mut buf),
            image::ImageFormat::Png,
        )
        .map_err(|e| PilotError::DeviceCommandFailed(format!("png encode failed: {e}")))?;

    Ok(Screenshot {
        png: buf,
        width: w,
        height: cropped_h,
        crop_top: top,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_escaping_handles_shell_metachars() {
        assert_eq!(AdbDevice::escape_for_input("hello world"), "hello%sworld");
        assert_eq!(AdbDevice::escape_for_input("a&b"), "a\\&b");
        assert_eq!(AdbDevice::escape_for_input("$(x)"), "\\$\\(x\\)");
    }

    #[test]
    fn resumed_activity_regex_matches_both_forms() {
        let line = "    mResumedActivity: ActivityRecord{1234 u0 com.tencent.mm/.ui.LauncherUI t5}";
        let caps = RESUMED_RE.captures(line).unwrap();
        assert_eq!(&caps[1], "com.tencent.mm");

        let line2 = "  topResumedActivity=ActivityRecord{9 u0 com.android.launcher3/.Launcher t1}";
        let caps2 = RESUMED_RE.captures(line2).unwrap();
        assert_eq!(&caps2[1], "com.android.launcher3");
    }

    #[test]
    fn wm_size_regex_prefers_override() {
        let raw = "Physical size: 1080x2400\nOverride size: 1080x2340";
        let caps = WM_SIZE_RE.captures_iter(raw).last().unwrap();
        assert_eq!(&caps[1], "1080");
        assert_eq!(&caps[2], "2340");
    }

    #[test]
    fn crop_removes_insets_and_records_offset() {
        let img = image::RgbaImage::from_pixel(100, 200, image::Rgba([40, 40, 40, 255]));
        let mut png = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let shot = crop_screenshot(&png, Insets { top: 30, bottom: 20 }).unwrap();
        assert_eq!(shot.crop_top, 30);
        assert_eq!(shot.height, 150);
        assert_eq!(shot.width, 100);
        let decoded = image::load_from_memory(&shot.png).unwrap();
        assert_eq!(decoded.height(), 150);
    }
}
