use crate::{
    error::{QmuxError, Result},
    message::{Message, MAX_PACKET_LENGTH},
};
use bytes::{Buf, BufMut, BytesMut};
use futures::{Sink, SinkExt};
use std::{pin::Pin, sync::Arc};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder};

/// Frames [`Message`]s over the raw transport.
///
/// Decoding is driven solely by the session's demultiplex loop, so inbound
/// frames are totally ordered without locking. Encoding goes through
/// [`FrameWriter`], which serializes concurrent senders.
#[derive(Debug, Default, Clone)]
pub struct Codec;

impl Codec {
    pub fn new() -> Self {
        Codec
    }
}

impl Decoder for Codec {
    type Item = Message;
    type Error = QmuxError;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Message>, QmuxError> {
        if src.is_empty() {
            return Ok(None);
        }

        let type_byte = src[0];
        let fixed = match Message::fixed_body_len(type_byte) {
            Some(n) => n,
            None => return Err(QmuxError::UnknownMessageType(type_byte)),
        };

        if src.len() < 1 + fixed {
            src.reserve(1 + fixed - src.len());
            return Ok(None);
        }

        let mut data_len = 0;
        if type_byte == Message::DATA {
            let length = u32::from_be_bytes([src[5], src[6], src[7], src[8]]);
            if length > MAX_PACKET_LENGTH {
                return Err(QmuxError::PayloadTooLarge {
                    length,
                    max: MAX_PACKET_LENGTH,
                });
            }
            data_len = length as usize;
            if src.len() < 1 + fixed + data_len {
                src.reserve(1 + fixed + data_len - src.len());
                return Ok(None);
            }
        }

        src.advance(1);
        let msg = match type_byte {
            Message::OPEN => Message::Open {
                sender_id: src.get_u32(),
                window_size: src.get_u32(),
                max_packet_size: src.get_u32(),
            },
            Message::OPEN_CONFIRM => Message::OpenConfirm {
                recipient_id: src.get_u32(),
                sender_id: src.get_u32(),
                window_size: src.get_u32(),
                max_packet_size: src.get_u32(),
            },
            Message::OPEN_FAILURE => Message::OpenFailure {
                recipient_id: src.get_u32(),
            },
            Message::WINDOW_ADJUST => Message::WindowAdjust {
                recipient_id: src.get_u32(),
                additional_bytes: src.get_u32(),
            },
            Message::DATA => {
                let recipient_id = src.get_u32();
                let _length = src.get_u32();
                Message::Data {
                    recipient_id,
                    payload: src.split_to(data_len).freeze(),
                }
            }
            Message::EOF => Message::Eof {
                recipient_id: src.get_u32(),
            },
            Message::CLOSE => Message::Close {
                recipient_id: src.get_u32(),
            },
            other => return Err(QmuxError::UnknownMessageType(other)),
        };

        Ok(Some(msg))
    }
}

impl Encoder<Message> for Codec {
    type Error = QmuxError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> std::result::Result<(), QmuxError> {
        dst.reserve(msg.wire_len());
        dst.put_u8(msg.type_byte());

        match msg {
            Message::Open {
                sender_id,
                window_size,
                max_packet_size,
            } => {
                dst.put_u32(sender_id);
                dst.put_u32(window_size);
                dst.put_u32(max_packet_size);
            }
            Message::OpenConfirm {
                recipient_id,
                sender_id,
                window_size,
                max_packet_size,
            } => {
                dst.put_u32(recipient_id);
                dst.put_u32(sender_id);
                dst.put_u32(window_size);
                dst.put_u32(max_packet_size);
            }
            Message::OpenFailure { recipient_id } => {
                dst.put_u32(recipient_id);
            }
            Message::WindowAdjust {
                recipient_id,
                additional_bytes,
            } => {
                dst.put_u32(recipient_id);
                dst.put_u32(additional_bytes);
            }
            Message::Data {
                recipient_id,
                payload,
            } => {
                dst.put_u32(recipient_id);
                dst.put_u32(payload.len() as u32);
                dst.extend_from_slice(&payload);
            }
            Message::Eof { recipient_id } | Message::Close { recipient_id } => {
                dst.put_u32(recipient_id);
            }
        }

        Ok(())
    }
}

/// Serialized write half of the transport.
///
/// Every frame producer (channel writes, window adjusts, the session's open
/// handler) shares one sink behind a mutex, so each frame is emitted
/// atomically and frames interleave at frame boundaries only.
#[derive(Clone)]
pub(crate) struct FrameWriter {
    sink: Arc<Mutex<Pin<Box<dyn Sink<Message, Error = QmuxError> + Send>>>>,
}

impl FrameWriter {
    pub(crate) fn new<S>(sink: S) -> Self
    where
        S: Sink<Message, Error = QmuxError> + Send + 'static,
    {
        Self {
            sink: Arc::new(Mutex::new(Box::pin(sink))),
        }
    }

    /// Encode one message and flush it to the transport.
    pub(crate) async fn send(&self, msg: Message) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(msg).await
    }

    /// Flush and shut down the write half of the transport.
    pub(crate) async fn shutdown(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.close().await
    }
}
