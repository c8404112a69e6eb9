use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::Transport;
use crate::error::{TunnelError, TunnelResult};

/// Largest datagram `receive` accepts.
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

/// UDP socket bound to an ephemeral local port, talking to one remote.
///
/// Datagrams arriving from any other source are discarded and counted.
pub struct UdpTransport {
    socket: UdpSocket,
    remote: SocketAddr,
    closed: CancellationToken,
    foreign_dropped: AtomicU64,
    /// Receive buffer reused across datagrams.
    recv_buf: Mutex<Vec<u8>>,
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpTransport")
            .field("local", &self.socket.local_addr().ok())
            .field("remote", &self.remote)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl UdpTransport {
    /// Bind an OS-assigned port on the wildcard address of `remote`'s family.
    pub async fn bind(remote: SocketAddr) -> TunnelResult<Self> {
        let local: SocketAddr = match remote {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        Self::bind_on(local, remote).await
    }

    /// Bind on an explicit local address.
    pub async fn bind_on(local: SocketAddr, remote: SocketAddr) -> TunnelResult<Self> {
        let socket = UdpSocket::bind(local).await?;
        debug!(local = %socket.local_addr()?, %remote, "UDP transport bound");
        Ok(UdpTransport {
            socket,
            remote,
            closed: CancellationToken::new(),
            foreign_dropped: AtomicU64::new(0),
            recv_buf: Mutex::new(vec![0u8; MAX_DATAGRAM_SIZE]),
        })
    }

    /// Datagrams discarded because they did not come from the remote.
    pub fn foreign_dropped(&self) -> u64 {
        self.foreign_dropped.load(Ordering::Relaxed)
    }
}

fn is_transient(error: &io::Error) -> bool {
    // ICMP port-unreachable surfaces on the next receive on some platforms.
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, datagram: &[u8]) -> TunnelResult<()> {
        if self.closed.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        let sent = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(TunnelError::Closed),
            sent = self.socket.send_to(datagram, self.remote) => sent?,
        };
        if sent != datagram.len() {
            return Err(TunnelError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("sent {} of {} bytes", sent, datagram.len()),
            )));
        }
        Ok(())
    }

    async fn receive(&self) -> TunnelResult<Vec<u8>> {
        let mut buf = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(TunnelError::Closed),
            buf = self.recv_buf.lock() => buf,
        };
        loop {
            let received = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(TunnelError::Closed),
                received = self.socket.recv_from(&mut buf[..]) => received,
            };
            match received {
                Ok((len, source)) if source == self.remote => return Ok(buf[..len].to_vec()),
                Ok((len, source)) => {
                    self.foreign_dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(%source, len, "Dropping datagram from unexpected source");
                }
                Err(e) if is_transient(&e) => {
                    trace!(error = %e, "Ignoring transient receive error");
                }
                Err(e) => return Err(TunnelError::Io(e)),
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn local_addr(&self) -> TunnelResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}
