use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio_util::sync::CancellationToken;

use super::{
    format_mac, AdapterBackend, AdapterIdentifier, AdapterLocator, DeviceChannel, DeviceDriver,
    MacAddress, MAC_LEN, TAP_IOCTL_GET_MAC, TAP_IOCTL_SET_MEDIA_STATUS,
};
use crate::error::{TunnelError, TunnelResult};
use crate::logging::EventLog;

/// Lifecycle of a [`VirtualInterface`]. Every failure unwinds to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    Closed,
    Opening,
    Open,
    Closing,
}

struct Inner {
    state: InterfaceState,
    channel: Option<Arc<dyn DeviceChannel>>,
    link_up: bool,
    path: Option<String>,
}

/// Owned handle to one virtual adapter.
///
/// Reads and writes take `&self` and may run on different tasks at the
/// same time; lifecycle calls are serialized internally.
///
/// `open`, `close` and `set_link_state` issue device-control requests that
/// block the calling thread. Async callers run them on the blocking pool.
pub struct VirtualInterface {
    locator: AdapterLocator,
    driver: Arc<dyn DeviceDriver>,
    inner: Mutex<Inner>,
    /// Held across media-status requests; `inner` never is.
    control: Mutex<()>,
    mac: OnceLock<MacAddress>,
    log: EventLog,
}

impl fmt::Debug for VirtualInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("VirtualInterface")
            .field("state", &inner.state)
            .field("path", &inner.path)
            .field("link_up", &inner.link_up)
            .field("mac", &self.mac.get().map(format_mac))
            .finish_non_exhaustive()
    }
}

impl VirtualInterface {
    pub fn new(backend: &AdapterBackend, log: EventLog) -> Self {
        VirtualInterface {
            locator: backend.locator().clone(),
            driver: backend.driver(),
            inner: Mutex::new(Inner {
                state: InterfaceState::Closed,
                channel: None,
                link_up: false,
                path: None,
            }),
            control: Mutex::new(()),
            mac: OnceLock::new(),
            log,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> InterfaceState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == InterfaceState::Open
    }

    /// Native path of the open adapter.
    pub fn device_path(&self) -> Option<String> {
        self.lock().path.clone()
    }

    /// Resolve, open and bring up the adapter with `identifier`.
    ///
    /// The link is set connected before this returns; if that fails the
    /// handle is released again and the control error is returned.
    pub fn open(&self, identifier: &AdapterIdentifier) -> TunnelResult<()> {
        {
            let mut inner = self.lock();
            if inner.state != InterfaceState::Closed {
                return Err(TunnelError::InvalidState(format!(
                    "adapter is {:?}, not Closed",
                    inner.state
                )));
            }
            inner.state = InterfaceState::Opening;
        }

        match self.acquire(identifier) {
            Ok((path, channel)) => {
                let mut inner = self.lock();
                inner.state = InterfaceState::Open;
                inner.channel = Some(channel);
                inner.link_up = true;
                inner.path = Some(path.clone());
                drop(inner);
                self.log.info(format!("Adapter {} opened at {}", identifier, path));
                Ok(())
            }
            Err(e) => {
                self.lock().state = InterfaceState::Closed;
                self.log.error(format!("Failed to open adapter {}: {}", identifier, e));
                Err(e)
            }
        }
    }

    fn acquire(&self, identifier: &AdapterIdentifier) -> TunnelResult<(String, Arc<dyn DeviceChannel>)> {
        let path = self.locator.find_device_path(identifier)?.ok_or_else(|| {
            TunnelError::Discovery(format!("no virtual adapter with instance id {}", identifier))
        })?;

        let channel = self.driver.open(&path)?;

        if self.query_mac(channel.as_ref()).is_none() {
            self.log.warn(format!("Could not read MAC address of adapter {}", identifier));
        }

        if let Err(source) = send_media_status(channel.as_ref(), true) {
            channel.close();
            return Err(TunnelError::Control {
                code: TAP_IOCTL_SET_MEDIA_STATUS,
                source,
            });
        }

        Ok((path, channel))
    }

    /// Set the simulated media status.
    ///
    /// Returns false when the adapter is not open or the request fails.
    /// Asking for the state the link is already in succeeds without a
    /// device request.
    pub fn set_link_state(&self, connected: bool) -> bool {
        let _control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        let channel = {
            let inner = self.lock();
            match (&inner.state, &inner.channel) {
                (InterfaceState::Open, Some(_)) if inner.link_up == connected => return true,
                (InterfaceState::Open, Some(channel)) => Arc::clone(channel),
                _ => return false,
            }
        };
        match send_media_status(channel.as_ref(), connected) {
            Ok(()) => {
                self.lock().link_up = connected;
                true
            }
            Err(e) => {
                self.log.warn(format!(
                    "Setting link {} failed: {}",
                    if connected { "up" } else { "down" },
                    e
                ));
                false
            }
        }
    }

    pub fn is_link_up(&self) -> bool {
        let inner = self.lock();
        inner.state == InterfaceState::Open && inner.link_up
    }

    /// The adapter MAC, queried once and cached for the life of the handle.
    pub fn mac_address(&self) -> Option<MacAddress> {
        if let Some(mac) = self.mac.get() {
            return Some(*mac);
        }
        let channel = self.open_channel().ok()?;
        self.query_mac(channel.as_ref())
    }

    /// The cached MAC, without issuing a device request.
    pub fn known_mac_address(&self) -> Option<MacAddress> {
        self.mac.get().copied()
    }

    fn query_mac(&self, channel: &dyn DeviceChannel) -> Option<MacAddress> {
        if let Some(mac) = self.mac.get() {
            return Some(*mac);
        }
        let mut out = [0u8; MAC_LEN];
        match channel.control(TAP_IOCTL_GET_MAC, &[], &mut out) {
            Ok(n) if n >= MAC_LEN => Some(*self.mac.get_or_init(|| out)),
            Ok(n) => {
                self.log.debug(format!("MAC query returned {} bytes", n));
                None
            }
            Err(e) => {
                self.log.debug(format!("MAC query failed: {}", e));
                None
            }
        }
    }

    fn open_channel(&self) -> TunnelResult<Arc<dyn DeviceChannel>> {
        let inner = self.lock();
        match (&inner.state, &inner.channel) {
            (InterfaceState::Open, Some(channel)) => Ok(Arc::clone(channel)),
            _ => Err(TunnelError::Closed),
        }
    }

    /// Read one frame into `buf`.
    ///
    /// `Ok(0)` means nothing was pending. Cancellation abandons the pending
    /// read and returns `Cancelled`.
    pub async fn read_frame(&self, buf: &mut [u8], cancel: &CancellationToken) -> TunnelResult<usize> {
        if cancel.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }
        let channel = self.open_channel()?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
            result = channel.read(buf) => result,
        }
    }

    /// Write all of `frame` to the adapter.
    pub async fn write_frame(&self, frame: &[u8], cancel: &CancellationToken) -> TunnelResult<()> {
        if cancel.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }
        let channel = self.open_channel()?;
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
            result = channel.write(frame) => result?,
        };
        if written != frame.len() {
            return Err(TunnelError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {} of {} bytes", written, frame.len()),
            )));
        }
        Ok(())
    }

    /// Take the link down and release the handle. Later calls do nothing.
    pub fn close(&self) {
        let _control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        let (channel, link_up, path) = {
            let mut inner = self.lock();
            if inner.state != InterfaceState::Open {
                return;
            }
            inner.state = InterfaceState::Closing;
            (inner.channel.take(), inner.link_up, inner.path.take())
        };

        if let Some(channel) = channel {
            if link_up {
                if let Err(e) = send_media_status(channel.as_ref(), false) {
                    self.log.warn(format!("Setting link down failed: {}", e));
                }
            }
            channel.close();
        }

        let mut inner = self.lock();
        inner.link_up = false;
        inner.state = InterfaceState::Closed;
        drop(inner);
        if let Some(path) = path {
            self.log.info(format!("Adapter at {} closed", path));
        }
    }
}

impl Drop for VirtualInterface {
    fn drop(&mut self) {
        self.close();
    }
}

fn send_media_status(channel: &dyn DeviceChannel, connected: bool) -> io::Result<()> {
    let status = u32::from(connected).to_le_bytes();
    channel
        .control(TAP_IOCTL_SET_MEDIA_STATUS, &status, &mut [])
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::{tap_backend, MockDevice, MockDriver, MOCK_MAC};
    use crate::logging::MemorySink;
    use std::time::Duration;

    fn id() -> AdapterIdentifier {
        AdapterIdentifier::parse("{5C0FFEE5-0001-4000-8000-00000000BEEF}").unwrap()
    }

    fn interface() -> (VirtualInterface, Arc<MockDevice>, Arc<MockDriver>) {
        let (backend, device, driver) = tap_backend(&id());
        (VirtualInterface::new(&backend, EventLog::silent()), device, driver)
    }

    fn media_requests(device: &MockDevice) -> Vec<Vec<u8>> {
        device
            .control_log()
            .into_iter()
            .filter(|(code, _)| *code == TAP_IOCTL_SET_MEDIA_STATUS)
            .map(|(_, input)| input)
            .collect()
    }

    #[test]
    fn open_brings_link_up_and_reads_mac() {
        let (iface, device, _) = interface();
        iface.open(&id()).unwrap();

        assert_eq!(iface.state(), InterfaceState::Open);
        assert!(iface.is_link_up());
        assert!(device.is_media_connected());
        assert_eq!(iface.mac_address(), Some(MOCK_MAC));
        assert_eq!(media_requests(&device), vec![1u32.to_le_bytes().to_vec()]);
        assert_eq!(iface.device_path(), Some(format!("mock://{}", id())));
    }

    #[test]
    fn open_twice_is_invalid_state() {
        let (iface, _, _) = interface();
        iface.open(&id()).unwrap();
        assert!(matches!(iface.open(&id()), Err(TunnelError::InvalidState(_))));
        assert_eq!(iface.state(), InterfaceState::Open);
    }

    #[test]
    fn unknown_adapter_is_discovery_error() {
        let (iface, _, driver) = interface();
        let other = AdapterIdentifier::parse("{00000000-0000-4000-8000-000000000001}").unwrap();
        assert!(matches!(iface.open(&other), Err(TunnelError::Discovery(_))));
        assert_eq!(iface.state(), InterfaceState::Closed);
        assert_eq!(driver.open_count(), 0);
    }

    #[test]
    fn open_failure_reports_os_code() {
        let (iface, _, driver) = interface();
        driver.fail_open(5);
        match iface.open(&id()) {
            Err(TunnelError::Open { code, .. }) => assert_eq!(code, Some(5)),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(iface.state(), InterfaceState::Closed);
    }

    #[test]
    fn link_failure_unwinds_open() {
        let (iface, device, _) = interface();
        device.set_fail_link(true);
        assert!(matches!(
            iface.open(&id()),
            Err(TunnelError::Control { code, .. }) if code == TAP_IOCTL_SET_MEDIA_STATUS
        ));
        assert_eq!(iface.state(), InterfaceState::Closed);
        assert!(device.is_closed());

        // Recovers once the device cooperates.
        device.set_fail_link(false);
        iface.open(&id()).unwrap();
        assert!(iface.is_open());
    }

    #[test]
    fn missing_mac_is_only_a_warning() {
        let (backend, _, _) = tap_backend(&id());
        let driver = Arc::new(MockDriver::new());
        driver.register(format!("mock://{}", id()), Arc::new(MockDevice::without_mac()));
        let backend = AdapterBackend::new(backend.locator().clone(), driver);

        let sink = Arc::new(MemorySink::new());
        let iface = VirtualInterface::new(&backend, EventLog::new(sink.clone()));
        iface.open(&id()).unwrap();
        assert_eq!(iface.mac_address(), None);
        assert!(sink.contains("MAC"));
        assert!(iface.is_link_up());
    }

    #[test]
    fn link_state_rules() {
        let (iface, device, _) = interface();
        assert!(!iface.set_link_state(true));

        iface.open(&id()).unwrap();
        assert!(iface.set_link_state(true));
        assert!(iface.set_link_state(true));
        assert_eq!(media_requests(&device).len(), 1);

        assert!(iface.set_link_state(false));
        assert!(!device.is_media_connected());
        assert!(iface.set_link_state(true));
        assert_eq!(media_requests(&device).len(), 3);
    }

    #[test]
    fn close_is_idempotent_and_drops_link_first() {
        let (iface, device, _) = interface();
        iface.open(&id()).unwrap();
        iface.close();
        iface.close();

        assert_eq!(iface.state(), InterfaceState::Closed);
        assert!(device.is_closed());
        assert!(!device.is_media_connected());
        let requests = media_requests(&device);
        assert_eq!(requests.last().unwrap(), &0u32.to_le_bytes().to_vec());
        assert_eq!(requests.len(), 2);
        assert!(!iface.set_link_state(true));
    }

    #[test]
    fn mac_is_cached_after_first_query() {
        let (iface, device, _) = interface();
        iface.open(&id()).unwrap();
        let queries = || {
            device
                .control_log()
                .iter()
                .filter(|(code, _)| *code == TAP_IOCTL_GET_MAC)
                .count()
        };
        assert_eq!(queries(), 1);
        iface.mac_address();
        iface.mac_address();
        assert_eq!(queries(), 1);

        iface.close();
        assert_eq!(iface.mac_address(), Some(MOCK_MAC));
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (iface, device, _) = interface();
        iface.open(&id()).unwrap();
        let cancel = CancellationToken::new();

        device.inject(b"frame-in".to_vec());
        let mut buf = [0u8; 64];
        let n = iface.read_frame(&mut buf, &cancel).await.unwrap();
        assert_eq!(&buf[..n], b"frame-in");

        iface.write_frame(b"frame-out", &cancel).await.unwrap();
        assert_eq!(
            device.next_written(Duration::from_secs(1)).await.unwrap(),
            b"frame-out"
        );
    }

    #[tokio::test]
    async fn read_honours_cancellation() {
        let (iface, _, _) = interface();
        iface.open(&id()).unwrap();
        let iface = Arc::new(iface);
        let cancel = CancellationToken::new();

        let reader = {
            let iface = Arc::clone(&iface);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                iface.read_frame(&mut buf, &cancel).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TunnelError::Cancelled)));
        assert!(matches!(
            iface.write_frame(b"x", &cancel).await,
            Err(TunnelError::Cancelled)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn link_change_does_not_block_frame_io() {
        let (iface, device, _) = interface();
        iface.open(&id()).unwrap();
        let iface = Arc::new(iface);
        device.set_control_delay(Duration::from_millis(300));

        let toggle = {
            let iface = Arc::clone(&iface);
            tokio::task::spawn_blocking(move || iface.set_link_state(false))
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let began = std::time::Instant::now();
        iface.write_frame(b"during", &CancellationToken::new()).await.unwrap();
        assert!(iface.is_open());
        assert!(began.elapsed() < Duration::from_millis(200));

        assert!(toggle.await.unwrap());
        assert!(!iface.is_link_up());
        assert!(!device.is_media_connected());
        device.set_control_delay(Duration::ZERO);
    }

    #[tokio::test]
    async fn io_on_closed_interface_fails() {
        let (iface, _, _) = interface();
        let cancel = CancellationToken::new();
        let mut buf = [0u8; 16];
        assert!(matches!(
            iface.read_frame(&mut buf, &cancel).await,
            Err(TunnelError::Closed)
        ));
        assert!(matches!(
            iface.write_frame(b"x", &cancel).await,
            Err(TunnelError::Closed)
        ));
    }
}
