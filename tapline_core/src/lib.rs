//! Core of tapline, a point-to-point tunnel that bridges a TAP virtual
//! adapter to one remote peer over UDP.
//!
//! Every Ethernet frame read from the adapter is sealed with AES-128-CBC and
//! HMAC-SHA256, base64-encoded and sent as one datagram; datagrams from the
//! peer go the other way. The crate provides adapter discovery and control,
//! the frame cipher, the UDP transport, the session engine that pumps
//! between them, plus configuration and logging setup for front ends.

pub mod adapter;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod logging;
pub mod transport;

// Re-export commonly used types for convenience
pub use adapter::{AdapterBackend, AdapterIdentifier, AdapterLocator, AdapterRecord, VirtualInterface};
pub use config::{Config, ConfigError};
pub use crypto::{TunnelCipher, TunnelKey};
pub use engine::{EngineOptions, EngineState, SessionConfig, StatsSnapshot, TunnelEngine};
pub use error::{TunnelError, TunnelResult};
pub use logging::{EventLog, LogSink};
pub use transport::{Transport, UdpTransport};
