//! HID function definitions and report writers.
use crate::error::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Deadline for one report write to `/dev/hidg<N>`.
const WRITE_DEADLINE: Duration = Duration::from_millis(10);

/// Keys carried per keyboard report (boot protocol).
pub const MAX_KEYS: usize = 6;
/// Absolute-coordinate range announced in the mouse descriptor.
pub const ABS_MAX: u16 = 32767;

/// One HID function as composed into configfs.
pub struct HidFunction {
    pub protocol: u8,
    pub subclass: u8,
    pub report_length: u8,
    pub report_desc: &'static [u8],
}

/// Boot-protocol keyboard: modifier byte, reserved byte, six key codes;
/// one LED output byte.
pub const KEYBOARD: HidFunction = HidFunction {
    protocol: 1,
    subclass: 1,
    report_length: 8,
    report_desc: &[
        0x05, 0x01, // Usage Page (Generic Desktop)
        0x09, 0x06, // Usage (Keyboard)
        0xA1, 0x01, // Collection (Application)
        0x05, 0x07, //   Usage Page (Key Codes)
        0x19, 0xE0, //   Usage Minimum (Left Control)
        0x29, 0xE7, //   Usage Maximum (Right GUI)
        0x15, 0x00, //   Logical Minimum (0)
        0x25, 0x01, //   Logical Maximum (1)
        0x75, 0x01, //   Report Size (1)
        0x95, 0x08, //   Report Count (8)
        0x81, 0x02, //   Input (Data, Variable, Absolute)
        0x95, 0x01, //   Report Count (1)
        0x75, 0x08, //   Report Size (8)
        0x81, 0x01, //   Input (Constant)
        0x95, 0x05, //   Report Count (5)
        0x75, 0x01, //   Report Size (1)
        0x05, 0x08, //   Usage Page (LEDs)
        0x19, 0x01, //   Usage Minimum (Num Lock)
        0x29, 0x05, //   Usage Maximum (Kana)
        0x91, 0x02, //   Output (Data, Variable, Absolute)
        0x95, 0x01, //   Report Count (1)
        0x75, 0x03, //   Report Size (3)
        0x91, 0x01, //   Output (Constant)
        0x95, 0x06, //   Report Count (6)
        0x75, 0x08, //   Report Size (8)
        0x15, 0x00, //   Logical Minimum (0)
        0x25, 0x65, //   Logical Maximum (101)
        0x05, 0x07, //   Usage Page (Key Codes)
        0x19, 0x00, //   Usage Minimum (0)
        0x29, 0x65, //   Usage Maximum (101)
        0x81, 0x00, //   Input (Data, Array)
        0xC0, // End Collection
    ],
};

/// Absolute mouse with two top-level collections: report 1 is the pointer
/// (3 buttons, 16-bit X/Y in [0, 32767]), report 2 is the wheel.
pub const MOUSE: HidFunction = HidFunction {
    protocol: 2,
    subclass: 1,
    report_length: 6,
    report_desc: &[
        0x05, 0x01, // Usage Page (Generic Desktop)
        0x09, 0x02, // Usage (Mouse)
        0xA1, 0x01, // Collection (Application)
        0x85, 0x01, //   Report ID (1)
        0x09, 0x01, //   Usage (Pointer)
        0xA1, 0x00, //   Collection (Physical)
        0x05, 0x09, //     Usage Page (Buttons)
        0x19, 0x01, //     Usage Minimum (1)
        0x29, 0x03, //     Usage Maximum (3)
        0x15, 0x00, //     Logical Minimum (0)
        0x25, 0x01, //     Logical Maximum (1)
        0x95, 0x03, //     Report Count (3)
        0x75, 0x01, //     Report Size (1)
        0x81, 0x02, //     Input (Data, Variable, Absolute)
        0x95, 0x01, //     Report Count (1)
        0x75, 0x05, //     Report Size (5)
        0x81, 0x01, //     Input (Constant)
        0x05, 0x01, //     Usage Page (Generic Desktop)
        0x09, 0x30, //     Usage (X)
        0x09, 0x31, //     Usage (Y)
        0x16, 0x00, 0x00, // Logical Minimum (0)
        0x26, 0xFF, 0x7F, // Logical Maximum (32767)
        0x75, 0x10, //     Report Size (16)
        0x95, 0x02, //     Report Count (2)
        0x81, 0x02, //     Input (Data, Variable, Absolute)
        0xC0, //   End Collection
        0xC0, // End Collection
        0x05, 0x01, // Usage Page (Generic Desktop)
        0x09, 0x02, // Usage (Mouse)
        0xA1, 0x01, // Collection (Application)
        0x85, 0x02, //   Report ID (2)
        0x09, 0x38, //   Usage (Wheel)
        0x15, 0x81, //   Logical Minimum (-127)
        0x25, 0x7F, //   Logical Maximum (127)
        0x75, 0x08, //   Report Size (8)
        0x95, 0x01, //   Report Count (1)
        0x81, 0x06, //   Input (Data, Variable, Relative)
        0xC0, // End Collection
    ],
};

/// Build the 8-byte boot keyboard report. Keys beyond six are dropped.
pub fn keyboard_report(modifiers: u8, keys: &[u8]) -> [u8; 8] {
    let mut report = [0u8; 8];
    report[0] = modifiers;
    for (slot, key) in report[2..].iter_mut().zip(keys.iter().take(MAX_KEYS)) {
        *slot = *key;
    }
    report
}

/// Build the absolute pointer report, report ID 1.
pub fn mouse_report(buttons: u8, x: u16, y: u16) -> [u8; 6] {
    let x = x.min(ABS_MAX).to_le_bytes();
    let y = y.min(ABS_MAX).to_le_bytes();
    [0x01, buttons & 0x07, x[0], x[1], y[0], y[1]]
}

/// Build the wheel report, report ID 2.
pub fn wheel_report(delta: i8) -> [u8; 2] {
    [0x02, delta as u8]
}

/// Writes reports to one `/dev/hidg<N>` device.
pub struct HidWriter {
    path: PathBuf,
    file: Option<tokio::fs::File>,
}

impl HidWriter {
    pub fn new(index: u32) -> Self {
        Self::with_path(format!("/dev/hidg{index}"))
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn file(&mut self) -> Result<&mut tokio::fs::File, Error> {
        if self.file.is_none() {
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&self.path)
                .await
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => {
                        Error::HidDeviceNotFound(self.path.display().to_string())
                    }
                    std::io::ErrorKind::PermissionDenied => {
                        Error::PermissionDenied(self.path.display().to_string())
                    }
                    _ => Error::HidOperationFailed(e),
                })?;
            self.file = Some(file);
        }
        Ok(self.file.as_mut().expect("file just set"))
    }

    /// Write one report within the write deadline. The host not polling
    /// the endpoint stalls gadget writes, hence the hard timeout.
    pub async fn write_report(&mut self, report: &[u8]) -> Result<(), Error> {
        let file = self.file().await?;
        let write = async {
            file.write_all(report).await?;
            file.flush().await
        };
        match tokio::time::timeout(WRITE_DEADLINE, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                // A failed endpoint write poisons the open handle.
                self.file = None;
                Err(Error::HidOperationFailed(e))
            }
            Err(_) => {
                self.file = None;
                Err(Error::OperationTimeout)
            }
        }
    }

    /// Send a keyboard report, then decide separately when to release.
    pub async fn send_keys(&mut self, modifiers: u8, keys: &[u8]) -> Result<(), Error> {
        self.write_report(&keyboard_report(modifiers, keys)).await
    }

    /// Send an absolute pointer report.
    pub async fn send_pointer(&mut self, buttons: u8, x: u16, y: u16) -> Result<(), Error> {
        self.write_report(&mouse_report(buttons, x, y)).await
    }

    /// Send a wheel report. Zero deltas are skipped.
    pub async fn send_wheel(&mut self, delta: i8) -> Result<(), Error> {
        if delta == 0 {
            return Ok(());
        }
        self.write_report(&wheel_report(delta)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyboard_report_layout() {
        let report = keyboard_report(0x02, &[0x04, 0x05]);
        assert_eq!(report, [0x02, 0, 0x04, 0x05, 0, 0, 0, 0]);
    }

    #[test]
    fn keyboard_report_truncates_to_six_keys() {
        let report = keyboard_report(0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&report[2..], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn mouse_report_layout() {
        let report = mouse_report(0x01, 0x1234, 0x7FFF);
        assert_eq!(report, [0x01, 0x01, 0x34, 0x12, 0xFF, 0x7F]);
    }

    #[test]
    fn mouse_report_clamps_coordinates() {
        let report = mouse_report(0xFF, 0xFFFF, 0);
        assert_eq!(report[1], 0x07);
        assert_eq!(u16::from_le_bytes([report[2], report[3]]), ABS_MAX);
    }

    #[test]
    fn wheel_report_layout() {
        assert_eq!(wheel_report(-3), [0x02, 0xFD]);
    }

    #[tokio::test]
    async fn zero_wheel_is_skipped() {
        // No device path exists; a zero delta must not try to open it.
        let mut writer = HidWriter::with_path("/nonexistent/hidg9");
        assert!(writer.send_wheel(0).await.is_ok());
    }

    #[tokio::test]
    async fn missing_device_reported() {
        let mut writer = HidWriter::with_path("/nonexistent/hidg9");
        assert!(matches!(
            writer.send_keys(0, &[]).await,
            Err(Error::HidDeviceNotFound(_))
        ));
    }

    #[test]
    fn descriptor_lengths() {
        assert_eq!(KEYBOARD.report_desc.len(), 63);
        assert_eq!(KEYBOARD.report_length as usize, keyboard_report(0, &[]).len());
        assert_eq!(MOUSE.report_length as usize, mouse_report(0, 0, 0).len());
    }
}
