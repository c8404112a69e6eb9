//! In-memory adapter backend.
//!
//! Used by the test suites and the loopback demo. A [`MockDevice`] behaves
//! like an open TAP handle: frames injected with [`MockDevice::inject`] come
//! out of `read`, frames written to it are queued for
//! [`MockDevice::next_written`], and the two TAP control codes are honoured.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use super::{
    AdapterBackend, AdapterIdentifier, AdapterLocator, DeviceChannel, DeviceDriver,
    DeviceEnumerator, DeviceProperties, MacAddress, MAC_LEN, TAP_IOCTL_GET_MAC,
    TAP_IOCTL_SET_MEDIA_STATUS,
};
use crate::error::{TunnelError, TunnelResult};

/// MAC reported by a freshly built [`MockDevice`].
pub const MOCK_MAC: MacAddress = [0x00, 0xff, 0x5a, 0x1c, 0x7e, 0x01];

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Enumerator over a fixed device list.
#[derive(Debug, Default)]
pub struct MockEnumerator {
    devices: Mutex<Vec<DeviceProperties>>,
    failure: Mutex<Option<String>>,
}

impl MockEnumerator {
    pub fn new(devices: Vec<DeviceProperties>) -> Self {
        MockEnumerator {
            devices: Mutex::new(devices),
            failure: Mutex::new(None),
        }
    }

    /// Make every later enumeration fail with `message`.
    pub fn fail_with(&self, message: impl Into<String>) {
        *lock(&self.failure) = Some(message.into());
    }

    pub fn set_devices(&self, devices: Vec<DeviceProperties>) {
        *lock(&self.devices) = devices;
    }
}

impl DeviceEnumerator for MockEnumerator {
    fn network_devices(&self) -> TunnelResult<Vec<DeviceProperties>> {
        if let Some(message) = lock(&self.failure).clone() {
            return Err(TunnelError::Discovery(message));
        }
        Ok(lock(&self.devices).clone())
    }

    fn device_path(&self, instance_id: &AdapterIdentifier) -> String {
        format!("mock://{}", instance_id)
    }
}

/// Driver that hands out registered [`MockDevice`]s by path.
#[derive(Debug, Default)]
pub struct MockDriver {
    devices: Mutex<HashMap<String, Arc<MockDevice>>>,
    open_failure: Mutex<Option<i32>>,
    opens: AtomicUsize,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: impl Into<String>, device: Arc<MockDevice>) {
        lock(&self.devices).insert(path.into(), device);
    }

    /// Make every later open fail with the raw OS error `code`.
    pub fn fail_open(&self, code: i32) {
        *lock(&self.open_failure) = Some(code);
    }

    /// Number of successful opens so far.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl DeviceDriver for MockDriver {
    fn open(&self, path: &str) -> TunnelResult<Arc<dyn DeviceChannel>> {
        if let Some(code) = *lock(&self.open_failure) {
            return Err(TunnelError::open(path, io::Error::from_raw_os_error(code)));
        }
        let device = lock(&self.devices).get(path).cloned().ok_or_else(|| {
            TunnelError::open(path, io::Error::new(io::ErrorKind::NotFound, "no such device"))
        })?;
        device.reopen();
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(device)
    }
}

/// One simulated adapter.
#[derive(Debug)]
pub struct MockDevice {
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    written_tx: mpsc::UnboundedSender<Vec<u8>>,
    written_rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    written: AtomicUsize,
    mac: Mutex<Option<MacAddress>>,
    controls: Mutex<Vec<(u32, Vec<u8>)>>,
    fail_link: AtomicBool,
    fail_writes: AtomicBool,
    media_connected: AtomicBool,
    control_delay: Mutex<Duration>,
    closed: Mutex<CancellationToken>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        MockDevice {
            inbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            written_tx,
            written_rx: AsyncMutex::new(written_rx),
            written: AtomicUsize::new(0),
            mac: Mutex::new(Some(MOCK_MAC)),
            controls: Mutex::new(Vec::new()),
            fail_link: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            media_connected: AtomicBool::new(false),
            control_delay: Mutex::new(Duration::ZERO),
            closed: Mutex::new(CancellationToken::new()),
        }
    }

    /// A device whose MAC query fails.
    pub fn without_mac() -> Self {
        let device = Self::new();
        *lock(&device.mac) = None;
        device
    }

    /// Queue a frame for the next adapter read.
    pub fn inject(&self, frame: impl Into<Vec<u8>>) {
        let _ = self.inbound_tx.send(frame.into());
    }

    /// Wait up to `wait` for the next frame written to the adapter.
    pub async fn next_written(&self, wait: Duration) -> Option<Vec<u8>> {
        let mut rx = self.written_rx.lock().await;
        tokio::time::timeout(wait, rx.recv()).await.ok().flatten()
    }

    pub fn written_count(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }

    /// Every control request received, with its input payload.
    pub fn control_log(&self) -> Vec<(u32, Vec<u8>)> {
        lock(&self.controls).clone()
    }

    /// Make media-status requests fail.
    pub fn set_fail_link(&self, fail: bool) {
        self.fail_link.store(fail, Ordering::SeqCst);
    }

    /// Block the calling thread this long on every control request.
    pub fn set_control_delay(&self, delay: Duration) {
        *lock(&self.control_delay) = delay;
    }

    /// Make frame writes fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn is_media_connected(&self) -> bool {
        self.media_connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.token().is_cancelled()
    }

    fn token(&self) -> CancellationToken {
        lock(&self.closed).clone()
    }

    fn reopen(&self) {
        let mut closed = lock(&self.closed);
        if closed.is_cancelled() {
            *closed = CancellationToken::new();
        }
    }
}

#[async_trait]
impl DeviceChannel for MockDevice {
    async fn read(&self, buf: &mut [u8]) -> TunnelResult<usize> {
        let closed = self.token();
        if closed.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        let mut rx = self.inbound_rx.lock().await;
        let frame = tokio::select! {
            biased;
            _ = closed.cancelled() => return Err(TunnelError::Closed),
            frame = rx.recv() => frame.ok_or(TunnelError::Closed)?,
        };
        if frame.len() > buf.len() {
            return Err(TunnelError::FrameTooLarge { capacity: buf.len() });
        }
        buf[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    }

    async fn write(&self, frame: &[u8]) -> TunnelResult<usize> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TunnelError::Io(io::Error::other("simulated write failure")));
        }
        self.written.fetch_add(1, Ordering::SeqCst);
        let _ = self.written_tx.send(frame.to_vec());
        Ok(frame.len())
    }

    fn control(&self, code: u32, input: &[u8], output: &mut [u8]) -> io::Result<usize> {
        lock(&self.controls).push((code, input.to_vec()));
        let delay = *lock(&self.control_delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device closed"));
        }
        match code {
            TAP_IOCTL_GET_MAC => {
                let mac = (*lock(&self.mac))
                    .ok_or_else(|| io::Error::other("MAC query not supported"))?;
                if output.len() < MAC_LEN {
                    return Err(io::Error::new(io::ErrorKind::InvalidInput, "output too small"));
                }
                output[..MAC_LEN].copy_from_slice(&mac);
                Ok(MAC_LEN)
            }
            TAP_IOCTL_SET_MEDIA_STATUS => {
                if self.fail_link.load(Ordering::SeqCst) {
                    return Err(io::Error::other("media status rejected"));
                }
                let status: [u8; 4] = input
                    .try_into()
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "expected 4 bytes"))?;
                self.media_connected
                    .store(u32::from_le_bytes(status) != 0, Ordering::SeqCst);
                Ok(0)
            }
            _ => Err(io::Error::new(io::ErrorKind::Unsupported, "unknown control code")),
        }
    }

    fn close(&self) {
        self.token().cancel();
    }
}

/// A backend exposing exactly one TAP adapter with instance id `id`.
pub fn tap_backend(id: &AdapterIdentifier) -> (AdapterBackend, Arc<MockDevice>, Arc<MockDriver>) {
    let enumerator = MockEnumerator::new(vec![DeviceProperties {
        hardware_ids: vec!["root\\tap0901".to_string()],
        instance_id: Some(id.to_string()),
        description: Some("TAP-Windows Adapter V9".to_string()),
    }]);
    let path = enumerator.device_path(id);

    let device = Arc::new(MockDevice::new());
    let driver = Arc::new(MockDriver::new());
    driver.register(path, Arc::clone(&device));

    let backend = AdapterBackend::new(
        AdapterLocator::new(Arc::new(enumerator)),
        Arc::clone(&driver) as Arc<dyn DeviceDriver>,
    );
    (backend, device, driver)
}
