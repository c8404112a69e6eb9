//! Session orchestration.
//!
//! A [`TunnelEngine`] owns one adapter handle and one transport for the
//! duration of a session and runs the two pump loops between them.
//!
//! # Examples
//!
//! ```no_run
//! use tapline_core::adapter::{AdapterBackend, AdapterIdentifier};
//! use tapline_core::crypto::TunnelKey;
//! use tapline_core::engine::{EngineOptions, TunnelEngine};
//! use tapline_core::logging::EventLog;
//! use std::time::Duration;
//!
//! # async fn run() -> tapline_core::error::TunnelResult<()> {
//! let backend = AdapterBackend::native(Duration::from_millis(250))?;
//! let mut engine = TunnelEngine::new(backend, EngineOptions::default(), EventLog::silent());
//!
//! let adapter = AdapterIdentifier::parse("{3F2504E0-4F89-11D3-9A0C-0305E82C3301}")?;
//! let key = TunnelKey::from_base64("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")?;
//! engine.start(&adapter, "203.0.113.7:5555".parse().unwrap(), key).await?;
//!
//! tokio::signal::ctrl_c().await?;
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

mod pump;
mod stats;

pub use stats::{StatsSnapshot, TunnelStats};

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapter::{
    AdapterBackend, AdapterIdentifier, MacAddress, VirtualInterface, DEFAULT_FRAME_CAPACITY,
};
use crate::crypto::{TunnelCipher, TunnelKey};
use crate::error::{TunnelError, TunnelResult};
use crate::logging::EventLog;
use crate::transport::{Transport, UdpTransport};
use pump::PumpContext;

/// Pause after an unexpected pump error.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// How long `stop` waits for each pump.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// The validated record a session is started from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub adapter_id: AdapterIdentifier,
    pub remote: SocketAddr,
    pub key: TunnelKey,
}

/// Engine tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Adapter read buffer size
    pub frame_capacity: usize,
    /// Pause after an unexpected pump error
    pub retry_delay: Duration,
    /// Bound on waiting for each pump during `stop`
    pub shutdown_timeout: Duration,
    /// Local address to bind; `None` picks an ephemeral port
    pub local_bind: Option<SocketAddr>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            frame_capacity: DEFAULT_FRAME_CAPACITY,
            retry_delay: DEFAULT_RETRY_DELAY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            local_bind: None,
        }
    }
}

/// Lifecycle of a [`TunnelEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Never started
    Idle,
    /// Pumps launched
    Running,
    /// Torn down; may be started again
    Stopped,
}

struct Session {
    adapter: AdapterIdentifier,
    interface: Arc<VirtualInterface>,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    stats: Arc<TunnelStats>,
    outbound: JoinHandle<()>,
    inbound: JoinHandle<()>,
}

/// Drives one tunnel session end to end.
pub struct TunnelEngine {
    backend: AdapterBackend,
    options: EngineOptions,
    log: EventLog,
    state: EngineState,
    session: Option<Session>,
    last_stats: StatsSnapshot,
}

impl fmt::Debug for TunnelEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelEngine")
            .field("state", &self.state)
            .field("options", &self.options)
            .field("adapter", &self.session.as_ref().map(|s| s.adapter))
            .finish_non_exhaustive()
    }
}

impl TunnelEngine {
    pub fn new(backend: AdapterBackend, options: EngineOptions, log: EventLog) -> Self {
        TunnelEngine {
            backend,
            options,
            log,
            state: EngineState::Idle,
            session: None,
            last_stats: StatsSnapshot::default(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// True while a session is up and both pumps are still alive.
    pub fn is_running(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| !s.outbound.is_finished() && !s.inbound.is_finished())
    }

    /// Counters of the current session, or of the last one after `stop`.
    pub fn stats(&self) -> StatsSnapshot {
        self.session
            .as_ref()
            .map(|s| s.stats.snapshot())
            .unwrap_or(self.last_stats)
    }

    /// Local address of the session transport.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.session.as_ref().and_then(|s| s.transport.local_addr().ok())
    }

    /// MAC of the session adapter, if the driver reported one.
    pub fn mac_address(&self) -> Option<MacAddress> {
        self.session.as_ref().and_then(|s| s.interface.known_mac_address())
    }

    /// Start a session from a validated configuration record.
    pub async fn start_with(&mut self, session: &SessionConfig) -> TunnelResult<()> {
        self.start(&session.adapter_id, session.remote, session.key.clone())
            .await
    }

    /// Open the adapter, bind the transport and launch both pumps.
    ///
    /// On failure everything acquired so far is released again.
    pub async fn start(
        &mut self,
        adapter: &AdapterIdentifier,
        remote: SocketAddr,
        key: TunnelKey,
    ) -> TunnelResult<()> {
        self.ensure_startable()?;
        self.log.info(format!("Starting tunnel on adapter {} to {}", adapter, remote));

        let interface = Arc::new(VirtualInterface::new(&self.backend, self.log.clone()));
        open_interface(&interface, *adapter).await?;

        let bound = match self.options.local_bind {
            Some(local) => UdpTransport::bind_on(local, remote).await,
            None => UdpTransport::bind(remote).await,
        };
        let transport = match bound {
            Ok(transport) => transport,
            Err(e) => {
                close_interface(interface).await;
                self.log.error(format!("Failed to bind transport for {}: {}", remote, e));
                return Err(e);
            }
        };

        self.launch(*adapter, interface, Arc::new(transport), key);
        Ok(())
    }

    /// Like [`TunnelEngine::start`] with a caller-supplied transport.
    ///
    /// The transport is closed if the adapter cannot be opened.
    pub async fn start_with_transport(
        &mut self,
        adapter: &AdapterIdentifier,
        transport: Arc<dyn Transport>,
        key: TunnelKey,
    ) -> TunnelResult<()> {
        self.ensure_startable()?;
        self.log.info(format!(
            "Starting tunnel on adapter {} to {}",
            adapter,
            transport.remote_addr()
        ));

        let interface = Arc::new(VirtualInterface::new(&self.backend, self.log.clone()));
        if let Err(e) = open_interface(&interface, *adapter).await {
            transport.close();
            return Err(e);
        }

        self.launch(*adapter, interface, transport, key);
        Ok(())
    }

    fn ensure_startable(&self) -> TunnelResult<()> {
        if self.session.is_some() {
            return Err(TunnelError::InvalidState(
                "tunnel is already running".to_string(),
            ));
        }
        Ok(())
    }

    fn launch(
        &mut self,
        adapter: AdapterIdentifier,
        interface: Arc<VirtualInterface>,
        transport: Arc<dyn Transport>,
        key: TunnelKey,
    ) {
        let ctx = PumpContext {
            interface,
            transport,
            cipher: Arc::new(TunnelCipher::new(key)),
            cancel: CancellationToken::new(),
            stats: Arc::new(TunnelStats::new()),
            log: self.log.clone(),
            retry_delay: self.options.retry_delay,
            frame_capacity: self.options.frame_capacity,
        };

        let session = Session {
            adapter,
            interface: Arc::clone(&ctx.interface),
            transport: Arc::clone(&ctx.transport),
            cancel: ctx.cancel.clone(),
            stats: Arc::clone(&ctx.stats),
            outbound: tokio::spawn(pump::run_outbound(ctx.clone())),
            inbound: tokio::spawn(pump::run_inbound(ctx)),
        };

        match session.transport.local_addr() {
            Ok(local) => self.log.info(format!(
                "Tunnel running: {} <-> {}",
                local,
                session.transport.remote_addr()
            )),
            Err(_) => self.log.info("Tunnel running"),
        }
        self.session = Some(session);
        self.state = EngineState::Running;
    }

    /// Tear the session down. Safe to call at any time; repeated calls do nothing.
    pub async fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        self.log.info(format!("Stopping tunnel on adapter {}", session.adapter));

        session.cancel.cancel();
        session.transport.close();

        for (name, task) in [("Outbound", session.outbound), ("Inbound", session.inbound)] {
            let abort = task.abort_handle();
            match tokio::time::timeout(self.options.shutdown_timeout, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.log.warn(format!("{} pump ended abnormally: {}", name, e)),
                Err(_) => {
                    self.log.warn(format!(
                        "{} pump did not finish within {:?}; aborting it",
                        name, self.options.shutdown_timeout
                    ));
                    abort.abort();
                }
            }
        }

        close_interface(Arc::clone(&session.interface)).await;
        self.last_stats = session.stats.snapshot();
        self.state = EngineState::Stopped;
        self.log.info(format!(
            "Tunnel stopped: {} frames out, {} frames in, {} datagrams dropped",
            self.last_stats.frames_sent, self.last_stats.frames_received, self.last_stats.datagrams_dropped
        ));
    }
}

/// Device-control requests block; keep them off the async worker threads.
async fn blocking_call<T, F>(call: F) -> TunnelResult<T>
where
    F: FnOnce() -> TunnelResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| TunnelError::Io(io::Error::other(e)))?
}

async fn open_interface(interface: &Arc<VirtualInterface>, adapter: AdapterIdentifier) -> TunnelResult<()> {
    let interface = Arc::clone(interface);
    blocking_call(move || interface.open(&adapter)).await
}

async fn close_interface(interface: Arc<VirtualInterface>) {
    let _ = blocking_call(move || {
        interface.close();
        Ok(())
    })
    .await;
}

impl Drop for TunnelEngine {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel.cancel();
            session.transport.close();
            session.outbound.abort();
            session.inbound.abort();
            session.interface.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::tap_backend;
    use crate::logging::MemorySink;

    fn id() -> AdapterIdentifier {
        AdapterIdentifier::parse("{0BADF00D-0000-4000-8000-000000000001}").unwrap()
    }

    #[tokio::test]
    async fn stop_without_start_is_noop() {
        let (backend, _, _) = tap_backend(&id());
        let mut engine = TunnelEngine::new(backend, EngineOptions::default(), EventLog::silent());
        engine.stop().await;
        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(!engine.is_running());
        assert_eq!(engine.stats(), StatsSnapshot::default());
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let (backend, _, driver) = tap_backend(&id());
        let mut engine = TunnelEngine::new(backend, EngineOptions::default(), EventLog::silent());
        let remote: SocketAddr = "127.0.0.1:9".parse().unwrap();

        engine.start(&id(), remote, TunnelKey::generate()).await.unwrap();
        assert!(matches!(
            engine.start(&id(), remote, TunnelKey::generate()).await,
            Err(TunnelError::InvalidState(_))
        ));
        assert_eq!(driver.open_count(), 1);
        engine.stop().await;
    }

    #[tokio::test]
    async fn start_failure_leaves_engine_idle() {
        let (backend, device, _) = tap_backend(&id());
        device.set_fail_link(true);
        let sink = Arc::new(MemorySink::new());
        let mut engine = TunnelEngine::new(backend, EngineOptions::default(), EventLog::new(sink.clone()));

        let result = engine
            .start(&id(), "127.0.0.1:9".parse().unwrap(), TunnelKey::generate())
            .await;
        assert!(matches!(result, Err(TunnelError::Control { .. })));
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(engine.local_addr().is_none());
        assert!(device.is_closed());
        assert!(sink.contains("Failed to open adapter"));
    }

    #[tokio::test]
    async fn engine_drop_releases_adapter() {
        let (backend, device, _) = tap_backend(&id());
        let mut engine = TunnelEngine::new(backend, EngineOptions::default(), EventLog::silent());
        engine
            .start(&id(), "127.0.0.1:9".parse().unwrap(), TunnelKey::generate())
            .await
            .unwrap();
        assert!(device.is_media_connected());
        drop(engine);
        assert!(device.is_closed());
        assert!(!device.is_media_connected());
    }
}
