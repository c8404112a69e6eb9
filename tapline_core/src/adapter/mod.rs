//! Virtual network adapter discovery and control.
//!
//! Platform specifics sit behind three narrow seams:
//!
//! - [`DeviceEnumerator`] lists present network-class devices and their
//!   hardware ids, instance id and description;
//! - [`DeviceDriver`] turns a native device path into an open channel;
//! - [`DeviceChannel`] is that open channel: frame read/write plus
//!   numbered device-control requests.
//!
//! [`AdapterLocator`] and [`VirtualInterface`] are written purely against
//! those traits. The TAP-Windows implementation lives in `windows`; `mock`
//! provides an in-memory one.

mod handle;
mod locator;
pub mod mock;
#[cfg(windows)]
pub mod windows;

pub use handle::{InterfaceState, VirtualInterface};
pub use locator::{AdapterLocator, DEFAULT_COMPONENT_IDS, DEFAULT_DESCRIPTION_MARKERS};

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{TunnelError, TunnelResult};

/// Nominal frame buffer capacity.
pub const DEFAULT_FRAME_CAPACITY: usize = 4096;

/// Length of an Ethernet MAC address.
pub const MAC_LEN: usize = 6;

/// Hardware address reported by the adapter.
pub type MacAddress = [u8; MAC_LEN];

const FILE_DEVICE_UNKNOWN: u32 = 0x0000_0022;
const METHOD_BUFFERED: u32 = 0;
const FILE_ANY_ACCESS: u32 = 0;

const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

const fn tap_control_code(request: u32) -> u32 {
    ctl_code(FILE_DEVICE_UNKNOWN, request, METHOD_BUFFERED, FILE_ANY_ACCESS)
}

/// Query the adapter MAC: no input, 6 bytes of output.
pub const TAP_IOCTL_GET_MAC: u32 = tap_control_code(1);

/// Set simulated media status: 4-byte little-endian input (1 = connected), no output.
pub const TAP_IOCTL_SET_MEDIA_STATUS: u32 = tap_control_code(6);

/// Stable instance identifier of a virtual adapter.
///
/// Always a GUID. Parsing accepts braced or bare forms in any case; the
/// canonical text form is upper-case and braced, and equality ignores case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdapterIdentifier(Uuid);

impl AdapterIdentifier {
    /// Normalize external text into an identifier.
    pub fn parse(text: &str) -> TunnelResult<Self> {
        let trimmed = text.trim();
        let inner = trimmed
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .unwrap_or(trimmed);
        Uuid::try_parse(inner)
            .map(AdapterIdentifier)
            .map_err(|e| {
                TunnelError::Config(format!("invalid adapter identifier {:?}: {}", text, e))
            })
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for AdapterIdentifier {
    fn from(uuid: Uuid) -> Self {
        AdapterIdentifier(uuid)
    }
}

impl FromStr for AdapterIdentifier {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for AdapterIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = Uuid::encode_buffer();
        write!(f, "{{{}}}", self.0.hyphenated().encode_upper(&mut buf))
    }
}

/// Raw properties of one enumerated device, before any filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProperties {
    /// Hardware identifier list (e.g. `tap0901`, `root\tap0901`)
    pub hardware_ids: Vec<String>,
    /// Instance identifier, as stored by the OS
    pub instance_id: Option<String>,
    /// Human-readable device description
    pub description: Option<String>,
}

/// A virtual adapter found by discovery. Rebuilt on every query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterRecord {
    pub device_path: String,
    pub instance_id: AdapterIdentifier,
    /// Driver component tag that made this device a candidate
    pub component_id: String,
    pub description: String,
}

/// Lists network-class devices.
pub trait DeviceEnumerator: Send + Sync {
    /// All present devices of the network adapter class.
    fn network_devices(&self) -> TunnelResult<Vec<DeviceProperties>>;

    /// Native path that opens the adapter with the given instance id.
    fn device_path(&self, instance_id: &AdapterIdentifier) -> String;
}

/// Opens native adapter handles.
pub trait DeviceDriver: Send + Sync {
    /// Open `path` for overlapped read/write. Failures are `TunnelError::Open`.
    fn open(&self, path: &str) -> TunnelResult<Arc<dyn DeviceChannel>>;
}

/// An open adapter handle.
///
/// Reads and writes may run concurrently from different tasks; the
/// implementation must support that without external locking.
#[async_trait]
pub trait DeviceChannel: Send + Sync {
    /// Read one frame into `buf`. `Ok(0)` means nothing was pending.
    async fn read(&self, buf: &mut [u8]) -> TunnelResult<usize>;

    /// Write one frame, returning the number of bytes accepted.
    async fn write(&self, frame: &[u8]) -> TunnelResult<usize>;

    /// Issue a device-control request, returning the output length.
    fn control(&self, code: u32, input: &[u8], output: &mut [u8]) -> io::Result<usize>;

    /// Release the native handle. Pending reads finish with `Closed`.
    fn close(&self);
}

/// The platform pieces a [`VirtualInterface`] needs.
#[derive(Clone)]
pub struct AdapterBackend {
    locator: AdapterLocator,
    driver: Arc<dyn DeviceDriver>,
}

impl fmt::Debug for AdapterBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterBackend")
            .field("locator", &self.locator)
            .finish_non_exhaustive()
    }
}

impl AdapterBackend {
    pub fn new(locator: AdapterLocator, driver: Arc<dyn DeviceDriver>) -> Self {
        AdapterBackend { locator, driver }
    }

    /// The backend for the running OS.
    ///
    /// `read_poll` bounds how long a single adapter read waits before
    /// reporting that nothing was pending.
    #[cfg(windows)]
    pub fn native(read_poll: Duration) -> TunnelResult<Self> {
        let locator = AdapterLocator::new(Arc::new(windows::SetupApiEnumerator::new()));
        Ok(AdapterBackend::new(
            locator,
            Arc::new(windows::TapDriver::new(read_poll)),
        ))
    }

    /// The backend for the running OS.
    #[cfg(not(windows))]
    pub fn native(_read_poll: Duration) -> TunnelResult<Self> {
        Err(TunnelError::Discovery(format!(
            "no virtual adapter backend is available on {}",
            std::env::consts::OS
        )))
    }

    /// Replace the locator's candidate markers.
    pub fn with_markers(mut self, component_ids: Vec<String>, description_markers: Vec<String>) -> Self {
        self.locator = self.locator.with_markers(component_ids, description_markers);
        self
    }

    pub fn locator(&self) -> &AdapterLocator {
        &self.locator
    }

    pub fn driver(&self) -> Arc<dyn DeviceDriver> {
        Arc::clone(&self.driver)
    }
}

/// Format a MAC as `aa:bb:cc:dd:ee:ff`.
pub fn format_mac(mac: &MacAddress) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_control_codes() {
        assert_eq!(TAP_IOCTL_GET_MAC, 0x0022_0004);
        assert_eq!(TAP_IOCTL_SET_MEDIA_STATUS, 0x0022_0018);
    }

    #[test]
    fn identifier_normalization() {
        let braced = AdapterIdentifier::parse("{6a1b2c3d-0000-4e5f-8a9b-0123456789ab}").unwrap();
        let bare = AdapterIdentifier::parse("6A1B2C3D-0000-4E5F-8A9B-0123456789AB").unwrap();
        let mixed = AdapterIdentifier::parse("  {6a1B2c3D-0000-4e5F-8A9b-0123456789aB} ").unwrap();

        assert_eq!(braced, bare);
        assert_eq!(braced, mixed);
        assert_eq!(
            braced.to_string(),
            "{6A1B2C3D-0000-4E5F-8A9B-0123456789AB}"
        );
        assert_eq!("6a1b2c3d-0000-4e5f-8a9b-0123456789ab".parse::<AdapterIdentifier>().unwrap(), bare);
    }

    #[test]
    fn identifier_rejects_non_guid() {
        for text in ["", "{}", "tap0", "{6a1b2c3d-0000-4e5f-8a9b}", "{6a1b2c3d-0000-4e5f-8a9b-0123456789ab"] {
            assert!(
                matches!(AdapterIdentifier::parse(text), Err(TunnelError::Config(_))),
                "{:?} should be rejected",
                text
            );
        }
    }

    #[test]
    fn mac_formatting() {
        assert_eq!(format_mac(&[0x00, 0xff, 0x1a, 0x2b, 0x3c, 0x4d]), "00:ff:1a:2b:3c:4d");
    }

    #[test]
    fn native_backend_availability() {
        let backend = AdapterBackend::native(Duration::from_millis(100));
        if cfg!(windows) {
            assert!(backend.is_ok());
        } else {
            assert!(matches!(backend, Err(TunnelError::Discovery(_))));
        }
    }
}
