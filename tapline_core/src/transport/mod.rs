//! Datagram transport to one fixed remote peer.

mod udp;

pub use udp::{UdpTransport, MAX_DATAGRAM_SIZE};

use async_trait::async_trait;
use std::net::SocketAddr;

use crate::error::TunnelResult;

/// A bound datagram endpoint addressed to one remote peer.
///
/// `send` and `receive` may run concurrently from different tasks. There is
/// no cancellation parameter: [`Transport::close`] is what unblocks a pending
/// `receive`, which then fails with `TunnelError::Closed`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one datagram to the remote peer.
    async fn send(&self, datagram: &[u8]) -> TunnelResult<()>;

    /// Wait for the next datagram from the remote peer.
    async fn receive(&self) -> TunnelResult<Vec<u8>>;

    /// Close the endpoint. Pending and later calls fail with `Closed`.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Address the endpoint is bound to.
    fn local_addr(&self) -> TunnelResult<SocketAddr>;

    /// The fixed peer every datagram goes to.
    fn remote_addr(&self) -> SocketAddr;
}
