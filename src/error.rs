use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Convenient type alias for `Result<T, QmuxError>`.
pub type Result<T> = std::result::Result<T, QmuxError>;

/// Error types for the qmux library.
///
/// The type is `Clone` so the session's single terminal error can be
/// delivered to every `wait()` caller; I/O errors are shared via `Arc`.
#[derive(Debug, Clone, Error)]
pub enum QmuxError {
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("Session closed")]
    SessionClosed,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Channel open failed on remote side")]
    OpenRejected,

    #[error("Unexpected message in response to channel open: type {0}")]
    UnexpectedOpenReply(u8),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Invalid channel: {0}")]
    UnknownChannel(u32),

    #[error("Invalid max packet size: {0}")]
    InvalidMaxPacketSize(u32),

    #[error("Data payload too large: {length} bytes (max: {max})")]
    PayloadTooLarge { length: u32, max: u32 },

    #[error("Receive window exceeded: {length} bytes ({window} available)")]
    WindowExceeded { length: u32, window: u32 },

    #[error("Window adjust overflows 32 bits")]
    WindowOverflow,
}

impl From<io::Error> for QmuxError {
    fn from(err: io::Error) -> Self {
        QmuxError::Io(Arc::new(err))
    }
}

impl QmuxError {
    /// True for violations of the wire protocol. A protocol error observed
    /// by the demultiplex loop terminates the whole session.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            QmuxError::UnknownMessageType(_)
                | QmuxError::UnknownChannel(_)
                | QmuxError::InvalidMaxPacketSize(_)
                | QmuxError::PayloadTooLarge { .. }
                | QmuxError::WindowExceeded { .. }
                | QmuxError::WindowOverflow
        )
    }
}
