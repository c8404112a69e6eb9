//! Two tunnel engines wired back to back over loopback UDP.
//!
//! Each side uses an in-memory adapter, so this runs anywhere without a TAP
//! driver: a frame injected into one adapter comes out of the other.

use std::sync::Arc;
use std::time::Duration;

use tapline_core::adapter::mock::tap_backend;
use tapline_core::adapter::AdapterIdentifier;
use tapline_core::crypto::TunnelKey;
use tapline_core::engine::{EngineOptions, TunnelEngine};
use tapline_core::logging::{init_default_logging, EventLog};
use tapline_core::transport::UdpTransport;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = init_default_logging();

    let left_id = AdapterIdentifier::parse("{A1A1A1A1-0000-4000-8000-000000000001}")?;
    let right_id = AdapterIdentifier::parse("{B2B2B2B2-0000-4000-8000-000000000002}")?;
    let (left_backend, left_device, _) = tap_backend(&left_id);
    let (right_backend, right_device, _) = tap_backend(&right_id);

    // Reserve two loopback ports so each side knows the other's address.
    let left_addr = std::net::UdpSocket::bind("127.0.0.1:0")?.local_addr()?;
    let right_addr = std::net::UdpSocket::bind("127.0.0.1:0")?.local_addr()?;

    let key = TunnelKey::generate();
    println!("Session key: {}", key.to_base64());

    let log = EventLog::new(Arc::new(|message: &str| println!("[tunnel] {}", message)));
    let mut left = TunnelEngine::new(left_backend, EngineOptions::default(), log.clone());
    let mut right = TunnelEngine::new(right_backend, EngineOptions::default(), log);

    left.start_with_transport(
        &left_id,
        Arc::new(UdpTransport::bind_on(left_addr, right_addr).await?),
        key.clone(),
    )
    .await?;
    right
        .start_with_transport(
            &right_id,
            Arc::new(UdpTransport::bind_on(right_addr, left_addr).await?),
            key,
        )
        .await?;

    left_device.inject(b"hello from the left".to_vec());
    right_device.inject(b"and hello from the right".to_vec());

    let wait = Duration::from_secs(2);
    if let Some(frame) = right_device.next_written(wait).await {
        println!("right adapter received: {}", String::from_utf8_lossy(&frame));
    }
    if let Some(frame) = left_device.next_written(wait).await {
        println!("left adapter received: {}", String::from_utf8_lossy(&frame));
    }

    left.stop().await;
    right.stop().await;
    println!("left stats: {:?}", left.stats());
    println!("right stats: {:?}", right.stats());
    Ok(())
}
