//! The two per-session pump loops.
//!
//! Outbound moves frames from the adapter to the peer, inbound moves them
//! back. Each loop ends on cancellation or when its own resource fails; it
//! never stops its sibling.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::stats::TunnelStats;
use crate::adapter::VirtualInterface;
use crate::crypto::TunnelCipher;
use crate::error::TunnelError;
use crate::logging::EventLog;
use crate::transport::Transport;

/// Everything a pump loop shares with its sibling.
#[derive(Clone)]
pub(crate) struct PumpContext {
    pub interface: Arc<VirtualInterface>,
    pub transport: Arc<dyn Transport>,
    pub cipher: Arc<TunnelCipher>,
    pub cancel: CancellationToken,
    pub stats: Arc<TunnelStats>,
    pub log: EventLog,
    pub retry_delay: Duration,
    pub frame_capacity: usize,
}

impl PumpContext {
    /// Sleep for the retry delay. Returns false if cancelled meanwhile.
    async fn pause(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.retry_delay) => true,
        }
    }

    fn fatal(&self, direction: &str, error: &TunnelError) {
        if self.cancel.is_cancelled() {
            self.log.debug(format!("{} pump ended during shutdown: {}", direction, error));
        } else {
            self.log.error(format!("{} pump stopped: {}", direction, error));
        }
    }
}

/// Adapter → transport.
pub(crate) async fn run_outbound(ctx: PumpContext) {
    let mut buf = vec![0u8; ctx.frame_capacity];
    ctx.log.debug("Outbound pump started");

    while !ctx.cancel.is_cancelled() {
        let len = match ctx.interface.read_frame(&mut buf, &ctx.cancel).await {
            Ok(0) => {
                tokio::task::yield_now().await;
                continue;
            }
            Ok(len) => len,
            Err(TunnelError::Cancelled) => break,
            Err(TunnelError::FrameTooLarge { capacity }) => {
                ctx.stats.record_oversized();
                ctx.log.warn(format!("Dropped adapter frame larger than {} bytes", capacity));
                continue;
            }
            Err(e) if e.is_fatal_io() => {
                ctx.fatal("Outbound", &e);
                break;
            }
            Err(e) => {
                ctx.log.warn(format!("Adapter read failed: {}", e));
                if !ctx.pause().await {
                    break;
                }
                continue;
            }
        };

        let sent = match ctx.cipher.encrypt(&buf[..len]) {
            Ok(envelope) => ctx.transport.send(envelope.as_bytes()).await,
            Err(e) => Err(e),
        };
        match sent {
            Ok(()) => ctx.stats.record_sent(len),
            Err(e) if e.is_fatal_io() => {
                ctx.fatal("Outbound", &e);
                break;
            }
            Err(e) => {
                ctx.log.warn(format!("Sending {} byte frame failed: {}", len, e));
                if !ctx.pause().await {
                    break;
                }
            }
        }
    }

    ctx.log.debug("Outbound pump finished");
}

/// Transport → adapter.
pub(crate) async fn run_inbound(ctx: PumpContext) {
    ctx.log.debug("Inbound pump started");

    while !ctx.cancel.is_cancelled() {
        let datagram = match ctx.transport.receive().await {
            Ok(datagram) => datagram,
            Err(TunnelError::Closed) | Err(TunnelError::Cancelled) => break,
            Err(e) if e.is_fatal_io() => {
                ctx.fatal("Inbound", &e);
                break;
            }
            Err(e) => {
                ctx.log.warn(format!("Receive failed: {}", e));
                if !ctx.pause().await {
                    break;
                }
                continue;
            }
        };

        let frame = match ctx.cipher.decrypt(&datagram) {
            Ok(frame) => frame,
            Err(e) if e.is_malformed_input() => {
                ctx.stats.record_dropped();
                ctx.log.warn(format!("Dropped {} byte datagram: {}", datagram.len(), e));
                continue;
            }
            Err(e) => {
                ctx.log.warn(format!("Decrypt failed: {}", e));
                if !ctx.pause().await {
                    break;
                }
                continue;
            }
        };
        if frame.is_empty() {
            continue;
        }

        match ctx.interface.write_frame(&frame, &ctx.cancel).await {
            Ok(()) => ctx.stats.record_received(frame.len()),
            Err(TunnelError::Cancelled) => break,
            Err(e) if e.is_fatal_io() => {
                ctx.fatal("Inbound", &e);
                break;
            }
            Err(e) => {
                ctx.log.warn(format!("Adapter write failed: {}", e));
                if !ctx.pause().await {
                    break;
                }
            }
        }
    }

    ctx.log.debug("Inbound pump finished");
}
