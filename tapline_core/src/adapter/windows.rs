//! TAP-Windows backend: SetupAPI enumeration and overlapped device I/O.

use async_trait::async_trait;
use std::ffi::c_void;
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use windows_sys::core::GUID;
use windows_sys::Win32::Devices::DeviceAndDriverInstallation::{
    SetupDiDestroyDeviceInfoList, SetupDiEnumDeviceInfo, SetupDiGetClassDevsW,
    SetupDiGetDeviceRegistryPropertyW, SetupDiOpenDevRegKey, DICS_FLAG_GLOBAL, DIGCF_PRESENT,
    DIREG_DRV, HDEVINFO, SPDRP_DEVICEDESC, SPDRP_HARDWAREID, SP_DEVINFO_DATA,
};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_INSUFFICIENT_BUFFER, ERROR_IO_PENDING, ERROR_MORE_DATA,
    ERROR_NO_MORE_ITEMS, ERROR_OPERATION_ABORTED, ERROR_SUCCESS, GENERIC_READ, GENERIC_WRITE,
    HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadFile, WriteFile, FILE_ATTRIBUTE_SYSTEM, FILE_FLAG_OVERLAPPED,
    FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Registry::{RegCloseKey, RegQueryValueExW, HKEY, KEY_READ};
use windows_sys::Win32::System::Threading::{CreateEventW, WaitForSingleObject, INFINITE};
use windows_sys::Win32::System::IO::{CancelIoEx, DeviceIoControl, GetOverlappedResult, OVERLAPPED};

use super::{AdapterIdentifier, DeviceChannel, DeviceDriver, DeviceEnumerator, DeviceProperties};
use crate::error::{TunnelError, TunnelResult};

/// Upper bound on one device-control request.
const CONTROL_TIMEOUT_MS: u32 = 5_000;

/// Network adapter device setup class.
const GUID_DEVCLASS_NET: GUID = GUID {
    data1: 0x4d36_e972,
    data2: 0xe325,
    data3: 0x11ce,
    data4: [0xbf, 0xc1, 0x08, 0x00, 0x2b, 0xe1, 0x03, 0x18],
};

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

fn bytes_to_wide(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Split a REG_MULTI_SZ / REG_SZ buffer into its strings.
fn wide_strings(buf: &[u16]) -> Vec<String> {
    buf.split(|&c| c == 0)
        .filter(|s| !s.is_empty())
        .map(String::from_utf16_lossy)
        .collect()
}

fn is_invalid(handle: *mut c_void) -> bool {
    handle.is_null() || handle == INVALID_HANDLE_VALUE
}

struct DeviceInfoList(HDEVINFO);

impl Drop for DeviceInfoList {
    fn drop(&mut self) {
        unsafe {
            SetupDiDestroyDeviceInfoList(self.0);
        }
    }
}

struct RegKey(HKEY);

impl Drop for RegKey {
    fn drop(&mut self) {
        unsafe {
            RegCloseKey(self.0);
        }
    }
}

/// Enumerates network-class devices through SetupAPI.
#[derive(Debug, Default)]
pub struct SetupApiEnumerator;

impl SetupApiEnumerator {
    pub fn new() -> Self {
        SetupApiEnumerator
    }

    fn registry_property(list: &DeviceInfoList, info: &SP_DEVINFO_DATA, property: u32) -> Vec<String> {
        let mut required = 0u32;
        let mut data_type = 0u32;
        unsafe {
            SetupDiGetDeviceRegistryPropertyW(
                list.0,
                info,
                property,
                &mut data_type,
                ptr::null_mut(),
                0,
                &mut required,
            );
            if GetLastError() != ERROR_INSUFFICIENT_BUFFER || required == 0 {
                return Vec::new();
            }
            let mut buf = vec![0u8; required as usize];
            let ok = SetupDiGetDeviceRegistryPropertyW(
                list.0,
                info,
                property,
                &mut data_type,
                buf.as_mut_ptr(),
                required,
                ptr::null_mut(),
            );
            if ok == 0 {
                return Vec::new();
            }
            wide_strings(&bytes_to_wide(&buf))
        }
    }

    fn instance_id(list: &DeviceInfoList, info: &SP_DEVINFO_DATA) -> Option<String> {
        let key = unsafe { SetupDiOpenDevRegKey(list.0, info, DICS_FLAG_GLOBAL, 0, DIREG_DRV, KEY_READ) };
        if is_invalid(key) {
            return None;
        }
        let key = RegKey(key);
        let name = wide("NetCfgInstanceId");

        let mut size = 0u32;
        let status = unsafe {
            RegQueryValueExW(key.0, name.as_ptr(), ptr::null(), ptr::null_mut(), ptr::null_mut(), &mut size)
        };
        if status != ERROR_SUCCESS || size == 0 {
            return None;
        }
        let mut buf = vec![0u8; size as usize];
        let status = unsafe {
            RegQueryValueExW(key.0, name.as_ptr(), ptr::null(), ptr::null_mut(), buf.as_mut_ptr(), &mut size)
        };
        if status != ERROR_SUCCESS {
            return None;
        }
        buf.truncate(size as usize);
        wide_strings(&bytes_to_wide(&buf)).into_iter().next()
    }
}

impl DeviceEnumerator for SetupApiEnumerator {
    fn network_devices(&self) -> TunnelResult<Vec<DeviceProperties>> {
        let handle = unsafe {
            SetupDiGetClassDevsW(&GUID_DEVCLASS_NET, ptr::null(), ptr::null_mut(), DIGCF_PRESENT)
        };
        if is_invalid(handle) {
            return Err(TunnelError::Discovery(format!(
                "SetupDiGetClassDevsW failed: {}",
                io::Error::last_os_error()
            )));
        }
        let list = DeviceInfoList(handle);

        let mut devices = Vec::new();
        for index in 0.. {
            let mut info: SP_DEVINFO_DATA = unsafe { mem::zeroed() };
            info.cbSize = mem::size_of::<SP_DEVINFO_DATA>() as u32;
            if unsafe { SetupDiEnumDeviceInfo(list.0, index, &mut info) } == 0 {
                let code = unsafe { GetLastError() };
                if code == ERROR_NO_MORE_ITEMS {
                    break;
                }
                return Err(TunnelError::Discovery(format!(
                    "SetupDiEnumDeviceInfo failed at index {}: {}",
                    index,
                    io::Error::from_raw_os_error(code as i32)
                )));
            }

            devices.push(DeviceProperties {
                hardware_ids: Self::registry_property(&list, &info, SPDRP_HARDWAREID),
                instance_id: Self::instance_id(&list, &info),
                description: Self::registry_property(&list, &info, SPDRP_DEVICEDESC)
                    .into_iter()
                    .next(),
            });
        }
        Ok(devices)
    }

    fn device_path(&self, instance_id: &AdapterIdentifier) -> String {
        format!(r"\\.\Global\{}.tap", instance_id)
    }
}

/// Opens TAP device files for overlapped I/O.
#[derive(Debug, Clone)]
pub struct TapDriver {
    poll_interval: Duration,
}

impl TapDriver {
    /// `poll_interval` bounds a single read before it reports no data.
    pub fn new(poll_interval: Duration) -> Self {
        TapDriver { poll_interval }
    }
}

impl DeviceDriver for TapDriver {
    fn open(&self, path: &str) -> TunnelResult<Arc<dyn DeviceChannel>> {
        let name = wide(path);
        let handle = unsafe {
            CreateFileW(
                name.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                ptr::null(),
                OPEN_EXISTING,
                FILE_ATTRIBUTE_SYSTEM | FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if is_invalid(handle) {
            return Err(TunnelError::open(path, io::Error::last_os_error()));
        }
        Ok(Arc::new(TapChannel {
            handle: Arc::new(TapHandle {
                raw: handle,
                closed: AtomicBool::new(false),
            }),
            poll_ms: self.poll_interval.as_millis().clamp(1, u128::from(u32::MAX - 1)) as u32,
            scratch: Mutex::new(Vec::new()),
        }))
    }
}

/// Owned TAP device handle, closed on drop.
struct TapHandle {
    raw: HANDLE,
    closed: AtomicBool,
}

// SAFETY: the raw handle is only used with thread-safe kernel calls, and
// every overlapped operation owns its own OVERLAPPED and event.
unsafe impl Send for TapHandle {}
unsafe impl Sync for TapHandle {}

impl Drop for TapHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.raw);
        }
    }
}

/// Manual-reset event owned by one overlapped operation.
struct Event(HANDLE);

impl Event {
    fn new() -> io::Result<Self> {
        let raw = unsafe { CreateEventW(ptr::null(), 1, 0, ptr::null()) };
        if raw.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Event(raw))
    }

    fn overlapped(&self) -> OVERLAPPED {
        let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
        overlapped.hEvent = self.0;
        overlapped
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

enum Completion {
    Done(u32),
    TimedOut,
}

impl TapHandle {
    /// Wait for an overlapped operation started on this handle.
    ///
    /// `started` is the BOOL returned by the call that issued it.
    fn complete(&self, started: i32, event: &Event, overlapped: &OVERLAPPED, wait_ms: u32) -> io::Result<Completion> {
        if started == 0 {
            let code = unsafe { GetLastError() };
            if code != ERROR_IO_PENDING {
                return Err(io::Error::from_raw_os_error(code as i32));
            }
            match unsafe { WaitForSingleObject(event.0, wait_ms) } {
                WAIT_OBJECT_0 => {}
                WAIT_TIMEOUT => {
                    unsafe {
                        CancelIoEx(self.raw, overlapped);
                    }
                    return match self.result(overlapped) {
                        Ok(n) => Ok(Completion::Done(n)),
                        Err(e) if e.raw_os_error() == Some(ERROR_OPERATION_ABORTED as i32) => {
                            Ok(Completion::TimedOut)
                        }
                        Err(e) => Err(e),
                    };
                }
                _ => {
                    let error = io::Error::last_os_error();
                    // The kernel still owns `overlapped` and the buffer until
                    // the request is cancelled and reaped.
                    unsafe {
                        CancelIoEx(self.raw, overlapped);
                    }
                    let _ = self.result(overlapped);
                    return Err(error);
                }
            }
        }
        self.result(overlapped).map(Completion::Done)
    }

    fn result(&self, overlapped: &OVERLAPPED) -> io::Result<u32> {
        let mut transferred = 0u32;
        if unsafe { GetOverlappedResult(self.raw, overlapped, &mut transferred, 1) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(transferred)
    }

    fn read(&self, buf: &mut [u8], poll_ms: u32) -> TunnelResult<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TunnelError::Closed);
        }
        let event = Event::new()?;
        let mut overlapped = event.overlapped();
        let started = unsafe {
            ReadFile(self.raw, buf.as_mut_ptr(), buf.len() as u32, ptr::null_mut(), &mut overlapped)
        };
        match self.complete(started, &event, &overlapped, poll_ms) {
            Ok(Completion::Done(n)) => Ok(n as usize),
            Ok(Completion::TimedOut) if self.closed.load(Ordering::SeqCst) => Err(TunnelError::Closed),
            Ok(Completion::TimedOut) => Ok(0),
            Err(e) => Err(self.classify(e, buf.len())),
        }
    }

    fn write(&self, frame: &[u8]) -> TunnelResult<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TunnelError::Closed);
        }
        let event = Event::new()?;
        let mut overlapped = event.overlapped();
        let started = unsafe {
            WriteFile(self.raw, frame.as_ptr(), frame.len() as u32, ptr::null_mut(), &mut overlapped)
        };
        match self.complete(started, &event, &overlapped, INFINITE) {
            Ok(Completion::Done(n)) => Ok(n as usize),
            Ok(Completion::TimedOut) => Err(TunnelError::Closed),
            Err(e) => Err(self.classify(e, frame.len())),
        }
    }

    fn control(&self, code: u32, input: &[u8], output: &mut [u8]) -> io::Result<usize> {
        let event = Event::new()?;
        let mut overlapped = event.overlapped();
        let started = unsafe {
            DeviceIoControl(
                self.raw,
                code,
                input.as_ptr() as *const c_void,
                input.len() as u32,
                output.as_mut_ptr() as *mut c_void,
                output.len() as u32,
                ptr::null_mut(),
                &mut overlapped,
            )
        };
        match self.complete(started, &event, &overlapped, CONTROL_TIMEOUT_MS)? {
            Completion::Done(n) => Ok(n as usize),
            Completion::TimedOut => Err(io::Error::from(io::ErrorKind::TimedOut)),
        }
    }

    fn classify(&self, error: io::Error, capacity: usize) -> TunnelError {
        match error.raw_os_error() {
            Some(code) if code == ERROR_MORE_DATA as i32 => TunnelError::FrameTooLarge { capacity },
            Some(code) if code == ERROR_OPERATION_ABORTED as i32 && self.closed.load(Ordering::SeqCst) => {
                TunnelError::Closed
            }
            _ => TunnelError::Io(error),
        }
    }
}

/// Open TAP adapter. Blocking kernel waits run on the blocking thread pool.
///
/// `control` blocks for at most [`CONTROL_TIMEOUT_MS`]; callers on an async
/// runtime run it off the worker threads.
struct TapChannel {
    handle: Arc<TapHandle>,
    poll_ms: u32,
    /// Read buffer handed to the blocking pool and back between polls.
    scratch: Mutex<Vec<u8>>,
}

impl TapChannel {
    fn take_scratch(&self, len: usize) -> Vec<u8> {
        let mut scratch = mem::take(&mut *self.scratch.lock().unwrap_or_else(PoisonError::into_inner));
        scratch.resize(len, 0);
        scratch
    }

    fn return_scratch(&self, scratch: Vec<u8>) {
        *self.scratch.lock().unwrap_or_else(PoisonError::into_inner) = scratch;
    }
}

fn join_error(e: tokio::task::JoinError) -> TunnelError {
    TunnelError::Io(io::Error::other(e))
}

#[async_trait]
impl DeviceChannel for TapChannel {
    async fn read(&self, buf: &mut [u8]) -> TunnelResult<usize> {
        let handle = Arc::clone(&self.handle);
        let poll_ms = self.poll_ms;
        let mut scratch = self.take_scratch(buf.len());
        let (result, scratch) = tokio::task::spawn_blocking(move || {
            let result = handle.read(&mut scratch, poll_ms);
            (result, scratch)
        })
        .await
        .map_err(join_error)?;
        let copied = result.map(|n| {
            buf[..n].copy_from_slice(&scratch[..n]);
            n
        });
        self.return_scratch(scratch);
        copied
    }

    async fn write(&self, frame: &[u8]) -> TunnelResult<usize> {
        let handle = Arc::clone(&self.handle);
        let frame = frame.to_vec();
        tokio::task::spawn_blocking(move || handle.write(&frame))
            .await
            .map_err(join_error)?
    }

    fn control(&self, code: u32, input: &[u8], output: &mut [u8]) -> io::Result<usize> {
        self.handle.control(code, input, output)
    }

    fn close(&self) {
        if !self.handle.closed.swap(true, Ordering::SeqCst) {
            unsafe {
                CancelIoEx(self.handle.raw, ptr::null());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_sz_parsing() {
        let raw: Vec<u16> = "root\\tap0901\0tap0901\0\0".encode_utf16().collect();
        assert_eq!(wide_strings(&raw), vec!["root\\tap0901", "tap0901"]);
    }

    #[test]
    fn tap_device_path() {
        let id = AdapterIdentifier::parse("3f2504e0-4f89-11d3-9a0c-0305e82c3301").unwrap();
        assert_eq!(
            SetupApiEnumerator::new().device_path(&id),
            r"\\.\Global\{3F2504E0-4F89-11D3-9A0C-0305E82C3301}.tap"
        );
    }

    #[test]
    fn opening_missing_device_fails_with_code() {
        let driver = TapDriver::new(Duration::from_millis(50));
        match driver.open(r"\\.\Global\{00000000-0000-0000-0000-000000000000}.tap") {
            Err(TunnelError::Open { code, .. }) => assert!(code.is_some()),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opened a nonexistent device"),
        }
    }
}
