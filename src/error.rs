//! Error types and the integer codes surfaced at the handle boundary.

use std::io;

use thiserror::Error;

use crate::ipc::IpcError;

// ── Boundary return codes ───────────────────────────────────────────────────

/// Unrecoverable failure (bad input, rejected configuration, dead handle).
pub const ERROR_GENERAL_FAILURE: i32 = -1;

/// Transient failure that is expected to succeed on retry.
pub const ERROR_INTERMITTENT_FAILURE: i32 = -2;

// ── TunnelError ─────────────────────────────────────────────────────────────

/// Errors raised by device bootstrap, configuration and socket plumbing.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("configuration error: {0}")]
    Config(String),

    /// Transient setup failure (e.g. the in-memory TUN could not be
    /// constructed right now). Retryable.
    #[error("intermittent failure: {0}")]
    Intermittent(String),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    #[error("device is not up")]
    NotUp,

    #[error("handle table is full")]
    TableFull,
}

impl TunnelError {
    /// Map this error onto the boundary return-code convention.
    pub fn code(&self) -> i32 {
        match self {
            TunnelError::Intermittent(_) => ERROR_INTERMITTENT_FAILURE,
            _ => ERROR_GENERAL_FAILURE,
        }
    }
}

/// Per-target probe failure: resolution, send, read, parse or mismatch.
/// Absorbed by the prober — the send counter advances, the receive counter
/// does not, and the run continues.
#[derive(Debug, Error)]
pub enum PingError {
    /// Opening the echo socket failed; for hostname targets this covers
    /// resolution through the tunnel DNS.
    #[error("dial failed: {0}")]
    Dial(String),

    #[error("send failed: {0}")]
    Send(io::Error),

    #[error("read failed: {0}")]
    Recv(io::Error),

    #[error("invalid echo reply")]
    InvalidReply,

    #[error("reply payload does not match request")]
    PayloadMismatch,
}

/// Download-leg failure, recorded as display text in the probe response.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid url: {0}")]
    Url(String),

    #[error("connect failed: {0}")]
    Connect(io::Error),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("request failed: {0}")]
    Io(#[from] io::Error),

    #[error("status {0}")]
    Status(u16),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("download timed out")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_codes() {
        assert_eq!(TunnelError::Config("x".into()).code(), ERROR_GENERAL_FAILURE);
        assert_eq!(
            TunnelError::Intermittent("tun".into()).code(),
            ERROR_INTERMITTENT_FAILURE
        );
        assert_eq!(TunnelError::NotUp.code(), ERROR_GENERAL_FAILURE);
    }
}
