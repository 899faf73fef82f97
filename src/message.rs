use bytes::Bytes;

/// Largest DATA payload this side accepts in a single frame. 32 KiB, the
/// RFC 4253 §6.1 minimum; we follow OpenSSH.
pub const CHANNEL_MAX_PACKET: u32 = 1 << 15;

/// Receive window advertised when a channel opens: 64 packets (2 MiB).
pub const CHANNEL_WINDOW_SIZE: u32 = 64 * CHANNEL_MAX_PACKET;

/// Bounds accepted for `max_packet_size` in an inbound OPEN.
pub(crate) const MIN_PACKET_LENGTH: u32 = 9;
pub(crate) const MAX_PACKET_LENGTH: u32 = 1 << 31;

/// One wire frame.
///
/// Every message except [`Message::Open`] carries the ID of the channel it
/// is addressed to: the *recipient's* local ID, which is the sender's
/// `remote_id` for that channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Open {
        sender_id: u32,
        window_size: u32,
        max_packet_size: u32,
    },
    OpenConfirm {
        recipient_id: u32,
        sender_id: u32,
        window_size: u32,
        max_packet_size: u32,
    },
    OpenFailure {
        recipient_id: u32,
    },
    WindowAdjust {
        recipient_id: u32,
        additional_bytes: u32,
    },
    Data {
        recipient_id: u32,
        payload: Bytes,
    },
    Eof {
        recipient_id: u32,
    },
    Close {
        recipient_id: u32,
    },
}

impl Message {
    pub const OPEN: u8 = 100;
    pub const OPEN_CONFIRM: u8 = 101;
    pub const OPEN_FAILURE: u8 = 102;
    pub const WINDOW_ADJUST: u8 = 103;
    pub const DATA: u8 = 104;
    pub const EOF: u8 = 105;
    pub const CLOSE: u8 = 106;

    pub fn type_byte(&self) -> u8 {
        match self {
            Message::Open { .. } => Self::OPEN,
            Message::OpenConfirm { .. } => Self::OPEN_CONFIRM,
            Message::OpenFailure { .. } => Self::OPEN_FAILURE,
            Message::WindowAdjust { .. } => Self::WINDOW_ADJUST,
            Message::Data { .. } => Self::DATA,
            Message::Eof { .. } => Self::EOF,
            Message::Close { .. } => Self::CLOSE,
        }
    }

    /// Size of the fixed body following the type byte, or `None` for an
    /// unknown type. DATA frames carry `length` payload bytes beyond this.
    pub(crate) fn fixed_body_len(type_byte: u8) -> Option<usize> {
        match type_byte {
            Self::OPEN => Some(12),
            Self::OPEN_CONFIRM => Some(16),
            Self::OPEN_FAILURE => Some(4),
            Self::WINDOW_ADJUST => Some(8),
            Self::DATA => Some(8),
            Self::EOF => Some(4),
            Self::CLOSE => Some(4),
            _ => None,
        }
    }

    /// The channel this message is addressed to. OPEN is the only message
    /// without a recipient; the session handles it directly.
    pub fn channel_id(&self) -> Option<u32> {
        match self {
            Message::Open { .. } => None,
            Message::OpenConfirm { recipient_id, .. }
            | Message::OpenFailure { recipient_id }
            | Message::WindowAdjust { recipient_id, .. }
            | Message::Data { recipient_id, .. }
            | Message::Eof { recipient_id }
            | Message::Close { recipient_id } => Some(*recipient_id),
        }
    }

    /// Encoded size of the whole frame, type byte included.
    pub(crate) fn wire_len(&self) -> usize {
        let payload = match self {
            Message::Data { payload, .. } => payload.len(),
            _ => 0,
        };
        // fixed_body_len covers every type this enum can produce
        1 + Self::fixed_body_len(self.type_byte()).unwrap_or(0) + payload
    }
}
