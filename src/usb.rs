//! USB camera discovery for passthrough.
//!
//! Discovery is best effort: it pattern-matches the human-readable output of
//! the USB lister (`lsusb`), which varies with vendor strings and locale. A
//! failed or empty probe only means the camera is not passed through.

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Description tokens that identify a camera (matched case-insensitively).
const CAMERA_TOKENS: &[&str] = &["camera", "webcam"];

/// A USB device identified by vendor and product ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    /// Vendor ID as four hex digits.
    pub vendor: String,
    /// Product ID as four hex digits.
    pub product: String,
    /// Description from the lister output.
    pub name: String,
}

/// Source of the camera device to pass through.
///
/// This is the only input to command construction that depends on the host
/// at build time.
pub trait CameraProbe {
    /// Look for a camera.
    ///
    /// Returns `Ok(None)` when the probe ran but found nothing, and `Err`
    /// when the probe itself could not run.
    fn find_camera(&self) -> Result<Option<UsbDevice>>;
}

/// Probe that runs a USB lister with `lsusb`-style output.
#[derive(Debug, Clone)]
pub struct LsusbProbe {
    program: PathBuf,
}

impl LsusbProbe {
    /// Create a probe running `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl CameraProbe for LsusbProbe {
    fn find_camera(&self) -> Result<Option<UsbDevice>> {
        let output = Command::new(&self.program)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| Error::Probe(format!("could not run {}: {}", self.program.display(), e)))?;

        if !output.status.success() {
            return Err(Error::Probe(format!(
                "{} exited with {}",
                self.program.display(),
                output.status
            )));
        }

        Ok(parse_camera(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Probe with a fixed answer.
#[derive(Debug, Clone, Default)]
pub struct FixedProbe(pub Option<UsbDevice>);

impl CameraProbe for FixedProbe {
    fn find_camera(&self) -> Result<Option<UsbDevice>> {
        Ok(self.0.clone())
    }
}

/// Find the first camera in `lsusb` output.
///
/// Lines look like `Bus 001 Device 003: ID 04f2:b6dd Chicony Electronics
/// Integrated Camera`.
pub fn parse_camera(output: &str) -> Option<UsbDevice> {
    output.lines().filter(|l| is_camera_line(l)).find_map(parse_line)
}

fn is_camera_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    CAMERA_TOKENS.iter().any(|t| lower.contains(t))
}

fn parse_line(line: &str) -> Option<UsbDevice> {
    let (_, rest) = line.split_once("ID ")?;
    let rest = rest.trim_start();
    let (ids, name) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let (vendor, product) = ids.split_once(':')?;

    if !is_hex_id(vendor) || !is_hex_id(product) {
        return None;
    }

    Some(UsbDevice {
        vendor: vendor.to_ascii_lowercase(),
        product: product.to_ascii_lowercase(),
        name: name.trim().to_string(),
    })
}

fn is_hex_id(s: &str) -> bool {
    s.len() == 4 && s.chars().all(|c| c.is_ascii_hexdigit())
}
