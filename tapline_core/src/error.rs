//! Error types shared by every tunnel component.

use std::io;
use thiserror::Error;

/// Result type for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Error types that can occur while discovering, driving or tearing down a tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Adapter enumeration failed or no adapter matched
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Native handle acquisition failed
    #[error("Failed to open {path}: {}", os_code_text(.code))]
    Open {
        path: String,
        code: Option<i32>,
        #[source]
        source: io::Error,
    },

    /// A device-control request failed
    #[error("Device control 0x{code:08X} failed: {source}")]
    Control {
        code: u32,
        #[source]
        source: io::Error,
    },

    /// Read or write on an owned resource failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The resource was closed, locally or mid-operation
    #[error("Resource closed")]
    Closed,

    /// Key is not exactly 32 bytes
    #[error("Invalid key length: expected 32 bytes, got {0}")]
    KeyLength(usize),

    /// Envelope is malformed
    #[error("Malformed envelope: {0}")]
    Format(String),

    /// Envelope authentication tag did not verify
    #[error("Envelope authentication failed")]
    Authentication,

    /// Operation aborted because of shutdown
    #[error("Operation cancelled")]
    Cancelled,

    /// A frame did not fit in the read buffer and was dropped
    #[error("Frame larger than {capacity} byte buffer dropped")]
    FrameTooLarge { capacity: usize },

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),
}

fn os_code_text(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("OS error {}", code),
        None => "unknown OS error".to_string(),
    }
}

impl TunnelError {
    /// Build a [`TunnelError::Open`] from the OS error that caused it.
    pub fn open(path: impl Into<String>, source: io::Error) -> Self {
        TunnelError::Open {
            path: path.into(),
            code: source.raw_os_error(),
            source,
        }
    }

    /// True for failures that mean the underlying handle or socket is gone.
    ///
    /// Pump loops stop on these; everything else is either a per-packet
    /// problem or transient.
    pub fn is_fatal_io(&self) -> bool {
        matches!(self, TunnelError::Io(_) | TunnelError::Closed)
    }

    /// True for per-datagram failures that must never end a session.
    pub fn is_malformed_input(&self) -> bool {
        matches!(self, TunnelError::Format(_) | TunnelError::Authentication)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_error_carries_os_code() {
        let err = TunnelError::open(r"\\.\Global\{X}.tap", io::Error::from_raw_os_error(5));
        match &err {
            TunnelError::Open { code, .. } => assert_eq!(*code, Some(5)),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("OS error 5"));
    }

    #[test]
    fn classification() {
        assert!(TunnelError::Closed.is_fatal_io());
        assert!(TunnelError::Io(io::Error::other("gone")).is_fatal_io());
        assert!(!TunnelError::Cancelled.is_fatal_io());
        assert!(TunnelError::Authentication.is_malformed_input());
        assert!(TunnelError::Format("short".into()).is_malformed_input());
        assert!(!TunnelError::KeyLength(3).is_malformed_input());
    }
}
