use crate::{
    buffer::Buffer,
    codec::FrameWriter,
    error::{QmuxError, Result},
    message::{
        Message, CHANNEL_MAX_PACKET, CHANNEL_WINDOW_SIZE, MAX_PACKET_LENGTH, MIN_PACKET_LENGTH,
    },
    window::Window,
};
use bytes::Bytes;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};
use tokio::sync::Mutex;

/// Who initiated the channel open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// What the demultiplex loop should do with a channel after it handled one
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleOutcome {
    Keep,
    Remove,
}

/// One bidirectional byte stream within a session.
///
/// Handles are cheap to clone; reads and writes may run concurrently from
/// separate tasks.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

pub(crate) struct ChannelInner {
    local_id: u32,
    /// The peer's ID for this channel. Learned from OPEN (inbound) or
    /// OPEN_CONFIRM (outbound) before the channel is handed to user code.
    remote_id: AtomicU32,
    direction: Direction,
    established: AtomicBool,

    /// Bytes the peer may still send us before waiting for WINDOW_ADJUST.
    my_window: Mutex<u32>,
    /// Bytes we may still send the peer.
    remote_window: Window,
    max_incoming_payload: u32,
    max_remote_payload: AtomicU32,

    /// Received payload bytes not yet consumed by `read`.
    pending: Buffer,
    /// Inbox for the open/close protocol (OPEN_CONFIRM, OPEN_FAILURE).
    msg_tx: flume::Sender<Message>,
    msg_rx: flume::Receiver<Message>,

    sent_eof: AtomicBool,
    sent_close: AtomicBool,
    remote_sent_eof: AtomicBool,
    remote_sent_close: AtomicBool,

    writer: FrameWriter,
}

impl ChannelInner {
    pub(crate) fn new(
        local_id: u32,
        direction: Direction,
        writer: FrameWriter,
        inbox_bound: usize,
    ) -> Arc<Self> {
        let (msg_tx, msg_rx) = flume::bounded(inbox_bound);
        Arc::new(Self {
            local_id,
            remote_id: AtomicU32::new(0),
            direction,
            established: AtomicBool::new(false),
            my_window: Mutex::new(CHANNEL_WINDOW_SIZE),
            remote_window: Window::new(),
            max_incoming_payload: CHANNEL_MAX_PACKET,
            max_remote_payload: AtomicU32::new(0),
            pending: Buffer::new(),
            msg_tx,
            msg_rx,
            sent_eof: AtomicBool::new(false),
            sent_close: AtomicBool::new(false),
            remote_sent_eof: AtomicBool::new(false),
            remote_sent_close: AtomicBool::new(false),
            writer,
        })
    }

    pub(crate) fn local_id(&self) -> u32 {
        self.local_id
    }

    fn remote_id(&self) -> u32 {
        self.remote_id.load(Ordering::Relaxed)
    }

    /// Record what the peer told us in OPEN or OPEN_CONFIRM and seed the
    /// send window. `max_packet_size` gets the same bounds check as an
    /// inbound OPEN; accepting 0 would wedge `write` on empty fragments.
    /// Repeated confirms are ignored.
    pub(crate) async fn complete_open(
        &self,
        remote_id: u32,
        window_size: u32,
        max_packet_size: u32,
    ) -> Result<()> {
        if !(MIN_PACKET_LENGTH..=MAX_PACKET_LENGTH).contains(&max_packet_size) {
            return Err(QmuxError::InvalidMaxPacketSize(max_packet_size));
        }
        if self.established.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        self.remote_id.store(remote_id, Ordering::Relaxed);
        self.max_remote_payload
            .store(max_packet_size, Ordering::Relaxed);
        self.remote_window.add(window_size).await
    }

    /// Next control message destined for a pending open call, or `None`
    /// once the session is tearing down.
    pub(crate) async fn recv_control(&self) -> Option<Message> {
        self.msg_rx.recv_async().await.ok()
    }

    /// Route one inbound message from the demultiplex loop. An error here
    /// is a protocol violation and terminates the session.
    pub(crate) async fn handle_message(&self, msg: Message) -> Result<HandleOutcome> {
        match msg {
            Message::Data { payload, .. } => {
                let length = payload.len() as u32;
                if length > self.max_incoming_payload {
                    return Err(QmuxError::PayloadTooLarge {
                        length,
                        max: self.max_incoming_payload,
                    });
                }
                {
                    let mut window = self.my_window.lock().await;
                    if length > *window {
                        return Err(QmuxError::WindowExceeded {
                            length,
                            window: *window,
                        });
                    }
                    *window -= length;
                }
                self.pending.write(payload).await;
                Ok(HandleOutcome::Keep)
            }
            Message::WindowAdjust {
                additional_bytes, ..
            } => {
                self.remote_window.add(additional_bytes).await?;
                Ok(HandleOutcome::Keep)
            }
            Message::Eof { .. } => {
                self.remote_sent_eof.store(true, Ordering::Relaxed);
                self.pending.eof().await;
                Ok(HandleOutcome::Keep)
            }
            Message::Close { .. } => {
                self.remote_sent_close.store(true, Ordering::Relaxed);
                if !self.sent_close.swap(true, Ordering::Relaxed) {
                    self.writer
                        .send(Message::Close {
                            recipient_id: self.remote_id(),
                        })
                        .await?;
                }
                self.shutdown().await;
                Ok(HandleOutcome::Remove)
            }
            Message::OpenConfirm {
                recipient_id,
                sender_id,
                window_size,
                max_packet_size,
            } => {
                self.complete_open(sender_id, window_size, max_packet_size)
                    .await?;
                self.deliver(Message::OpenConfirm {
                    recipient_id,
                    sender_id,
                    window_size,
                    max_packet_size,
                })
                .await;
                Ok(HandleOutcome::Keep)
            }
            Message::OpenFailure { recipient_id } => {
                self.deliver(Message::OpenFailure { recipient_id }).await;
                Ok(HandleOutcome::Keep)
            }
            Message::Open { .. } => Err(QmuxError::UnknownMessageType(Message::OPEN)),
        }
    }

    /// Queue a control message for a pending open call. The inbox is
    /// bounded (control traffic is O(1) outstanding per channel); a send to
    /// a full inbox parks the reader loop rather than dropping the message.
    async fn deliver(&self, msg: Message) {
        let _ = self.msg_tx.send_async(msg).await;
    }

    /// Replenish the receive window by `n` consumed bytes and tell the peer.
    async fn adjust_window(&self, n: u32) -> Result<()> {
        {
            let mut window = self.my_window.lock().await;
            *window += n;
        }
        self.writer
            .send(Message::WindowAdjust {
                recipient_id: self.remote_id(),
                additional_bytes: n,
            })
            .await
    }

    fn closing(&self) -> bool {
        self.sent_close.load(Ordering::Relaxed) || self.remote_sent_close.load(Ordering::Relaxed)
    }

    /// Unblock every pending read and write on this channel. Called when
    /// the close handshake completes and on session teardown.
    pub(crate) async fn shutdown(&self) {
        self.sent_close.store(true, Ordering::Relaxed);
        self.remote_window.close().await;
        self.pending.eof().await;
    }
}

impl Channel {
    pub(crate) fn new(inner: Arc<ChannelInner>) -> Self {
        Self { inner }
    }

    /// Local channel ID. Unique within the session for this channel's
    /// lifetime; eligible for reuse after the channel is fully dropped.
    pub fn id(&self) -> u32 {
        self.inner.local_id
    }

    /// Who initiated this channel.
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// True once the peer half-closed its sending direction (EOF or CLOSE
    /// received).
    pub fn is_read_closed(&self) -> bool {
        self.inner.remote_sent_eof.load(Ordering::Relaxed)
            || self.inner.remote_sent_close.load(Ordering::Relaxed)
    }

    /// True once this side sent EOF or CLOSE.
    pub fn is_write_closed(&self) -> bool {
        self.inner.sent_eof.load(Ordering::Relaxed)
            || self.inner.sent_close.load(Ordering::Relaxed)
    }

    /// True once both sides have sent CLOSE.
    pub fn is_closed(&self) -> bool {
        self.inner.sent_close.load(Ordering::Relaxed)
            && self.inner.remote_sent_close.load(Ordering::Relaxed)
    }

    /// Read bytes into `dst`, blocking until data arrives. Each successful
    /// read replenishes the receive window by exactly the bytes consumed.
    /// Returns 0 once the peer half-closed and the buffer has drained.
    pub async fn read(&self, dst: &mut [u8]) -> Result<usize> {
        let n = self.inner.pending.read(dst).await;
        if n > 0 && !self.inner.closing() {
            self.inner.adjust_window(n as u32).await?;
        }
        Ok(n)
    }

    /// Write all of `src`, fragmenting into DATA frames no larger than the
    /// peer's advertised packet size. Blocks while the peer's receive
    /// window is exhausted.
    pub async fn write(&self, src: &[u8]) -> Result<usize> {
        let inner = &self.inner;
        let mut rest = src;
        while !rest.is_empty() {
            if inner.sent_eof.load(Ordering::Relaxed) || inner.sent_close.load(Ordering::Relaxed) {
                return Err(QmuxError::ChannelClosed);
            }
            let max = inner.max_remote_payload.load(Ordering::Relaxed) as usize;
            let want = rest.len().min(max) as u32;
            let n = inner.remote_window.reserve(want).await? as usize;
            inner
                .writer
                .send(Message::Data {
                    recipient_id: inner.remote_id(),
                    payload: Bytes::copy_from_slice(&rest[..n]),
                })
                .await?;
            rest = &rest[n..];
        }
        Ok(src.len())
    }

    /// Half-close the write side: the peer's reads will report EOF once it
    /// drains what we sent. Idempotent.
    pub async fn close_write(&self) -> Result<()> {
        if self.inner.sent_close.load(Ordering::Relaxed) {
            return Err(QmuxError::ChannelClosed);
        }
        if !self.inner.sent_eof.swap(true, Ordering::Relaxed) {
            self.inner
                .writer
                .send(Message::Eof {
                    recipient_id: self.inner.remote_id(),
                })
                .await?;
        }
        Ok(())
    }

    /// Send CLOSE once and mark the channel locally closed. The channel
    /// leaves the session's table when the peer's CLOSE is observed; its ID
    /// becomes reusable then. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.sent_close.swap(true, Ordering::Relaxed) {
            self.inner
                .writer
                .send(Message::Close {
                    recipient_id: self.inner.remote_id(),
                })
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use futures::StreamExt;
    use tokio::io::DuplexStream;
    use tokio_util::codec::Framed;

    /// Channel wired to one end of a duplex pipe; the returned stream sees
    /// every frame the channel emits.
    fn harness() -> (Channel, futures::stream::SplitStream<Framed<DuplexStream, Codec>>) {
        let (local, peer) = tokio::io::duplex(64 * 1024);
        let (sink, _local_stream) = Framed::new(local, Codec::new()).split();
        let (_peer_sink, peer_stream) = Framed::new(peer, Codec::new()).split();

        let inner = ChannelInner::new(0, Direction::Outbound, FrameWriter::new(sink), 16);
        (Channel::new(inner), peer_stream)
    }

    async fn establish(ch: &Channel, remote_id: u32, window: u32, max_packet: u32) {
        ch.inner
            .complete_open(remote_id, window, max_packet)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_write_emits_data_frame() {
        let (ch, mut peer) = harness();
        establish(&ch, 7, 1024, 512).await;

        let n = ch.write(b"hello").await.unwrap();
        assert_eq!(n, 5);

        let frame = peer.next().await.unwrap().unwrap();
        assert_eq!(
            frame,
            Message::Data {
                recipient_id: 7,
                payload: Bytes::from_static(b"hello"),
            }
        );
    }

    #[tokio::test]
    async fn test_write_fragments_at_max_remote_payload() {
        let (ch, mut peer) = harness();
        establish(&ch, 1, 1024, 16).await;

        ch.write(&[7u8; 40]).await.unwrap();

        let mut lengths = Vec::new();
        for _ in 0..3 {
            match peer.next().await.unwrap().unwrap() {
                Message::Data { payload, .. } => lengths.push(payload.len()),
                other => panic!("Expected DATA, got {other:?}"),
            }
        }
        assert_eq!(lengths, vec![16, 16, 8]);
    }

    #[tokio::test]
    async fn test_confirm_with_out_of_bounds_packet_size_is_rejected() {
        let (ch, _peer) = harness();

        let result = ch.inner.complete_open(1, 1024, 0).await;
        assert!(matches!(result, Err(QmuxError::InvalidMaxPacketSize(0))));

        let result = ch
            .inner
            .handle_message(Message::OpenConfirm {
                recipient_id: 0,
                sender_id: 1,
                window_size: 1024,
                max_packet_size: 8,
            })
            .await;
        assert!(matches!(result, Err(QmuxError::InvalidMaxPacketSize(8))));

        // a well-formed confirm still establishes the channel
        ch.inner.complete_open(1, 1024, 512).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_blocks_on_exhausted_window() {
        let (ch, mut peer) = harness();
        establish(&ch, 1, 6, 32).await;

        let writer = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.write(b"0123456789").await })
        };

        // first fragment uses the whole window
        match peer.next().await.unwrap().unwrap() {
            Message::Data { payload, .. } => assert_eq!(payload.len(), 6),
            other => panic!("Expected DATA, got {other:?}"),
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        // grant credit the way the demultiplex loop would
        ch.inner
            .handle_message(Message::WindowAdjust {
                recipient_id: 0,
                additional_bytes: 6,
            })
            .await
            .unwrap();

        match peer.next().await.unwrap().unwrap() {
            Message::Data { payload, .. } => assert_eq!(payload.as_ref(), b"6789"),
            other => panic!("Expected DATA, got {other:?}"),
        }
        assert_eq!(writer.await.unwrap().unwrap(), 10);
    }

    #[tokio::test]
    async fn test_read_replenishes_window() {
        let (ch, mut peer) = harness();
        establish(&ch, 3, 1024, 512).await;

        ch.inner
            .handle_message(Message::Data {
                recipient_id: 0,
                payload: Bytes::from_static(b"abcd"),
            })
            .await
            .unwrap();

        let mut dst = [0u8; 8];
        let n = ch.read(&mut dst).await.unwrap();
        assert_eq!(&dst[..n], b"abcd");

        let frame = peer.next().await.unwrap().unwrap();
        assert_eq!(
            frame,
            Message::WindowAdjust {
                recipient_id: 3,
                additional_bytes: 4,
            }
        );
    }

    #[tokio::test]
    async fn test_data_beyond_receive_window_is_protocol_error() {
        let (ch, _peer) = harness();
        establish(&ch, 1, 1024, 512).await;

        *ch.inner.my_window.lock().await = 3;

        let result = ch
            .inner
            .handle_message(Message::Data {
                recipient_id: 0,
                payload: Bytes::from_static(b"toolong"),
            })
            .await;
        assert!(matches!(result, Err(QmuxError::WindowExceeded { .. })));
    }

    #[tokio::test]
    async fn test_oversize_payload_is_protocol_error() {
        let (ch, _peer) = harness();
        establish(&ch, 1, u32::MAX, 512).await;

        let payload = Bytes::from(vec![0u8; CHANNEL_MAX_PACKET as usize + 1]);
        let result = ch
            .inner
            .handle_message(Message::Data {
                recipient_id: 0,
                payload,
            })
            .await;
        assert!(matches!(result, Err(QmuxError::PayloadTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_half_close_flags() {
        let (ch, _peer) = harness();
        establish(&ch, 1, 64, 32).await;

        assert!(!ch.is_read_closed());
        assert!(!ch.is_write_closed());

        ch.close_write().await.unwrap();
        assert!(ch.is_write_closed());
        assert!(!ch.is_read_closed());

        ch.inner
            .handle_message(Message::Eof { recipient_id: 0 })
            .await
            .unwrap();
        assert!(ch.is_read_closed());
        assert!(!ch.is_closed());
    }

    #[tokio::test]
    async fn test_eof_then_read_returns_zero_after_drain() {
        let (ch, _peer) = harness();
        establish(&ch, 1, 1024, 512).await;

        ch.inner
            .handle_message(Message::Data {
                recipient_id: 0,
                payload: Bytes::from_static(b"tail"),
            })
            .await
            .unwrap();
        ch.inner
            .handle_message(Message::Eof { recipient_id: 0 })
            .await
            .unwrap();

        let mut dst = [0u8; 16];
        assert_eq!(ch.read(&mut dst).await.unwrap(), 4);
        assert_eq!(ch.read(&mut dst).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_write_is_idempotent() {
        let (ch, mut peer) = harness();
        establish(&ch, 2, 64, 32).await;

        ch.close_write().await.unwrap();
        ch.close_write().await.unwrap();

        assert_eq!(
            peer.next().await.unwrap().unwrap(),
            Message::Eof { recipient_id: 2 }
        );
        // exactly one EOF on the wire: the next frame is the close below
        ch.close().await.unwrap();
        assert_eq!(
            peer.next().await.unwrap().unwrap(),
            Message::Close { recipient_id: 2 }
        );
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (ch, _peer) = harness();
        establish(&ch, 2, 64, 32).await;

        ch.close().await.unwrap();
        assert!(matches!(
            ch.write(b"nope").await,
            Err(QmuxError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (ch, mut peer) = harness();
        establish(&ch, 2, 64, 32).await;

        ch.close().await.unwrap();
        ch.close().await.unwrap();
        ch.close().await.unwrap();

        assert_eq!(
            peer.next().await.unwrap().unwrap(),
            Message::Close { recipient_id: 2 }
        );
        // only the single CLOSE was emitted; a subsequent EOF would have
        // been next on the wire if close had re-sent
        ch.inner
            .handle_message(Message::Close { recipient_id: 0 })
            .await
            .unwrap();
        assert!(ch.is_closed());
    }

    #[tokio::test]
    async fn test_peer_close_is_mirrored_once() {
        let (ch, mut peer) = harness();
        establish(&ch, 4, 64, 32).await;

        let outcome = ch
            .inner
            .handle_message(Message::Close { recipient_id: 0 })
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::Remove);

        assert_eq!(
            peer.next().await.unwrap().unwrap(),
            Message::Close { recipient_id: 4 }
        );
        assert!(ch.is_closed());
    }

    #[tokio::test]
    async fn test_close_before_peer_close_does_not_mirror() {
        let (ch, mut peer) = harness();
        establish(&ch, 4, 64, 32).await;

        ch.close().await.unwrap();
        assert_eq!(
            peer.next().await.unwrap().unwrap(),
            Message::Close { recipient_id: 4 }
        );

        let outcome = ch
            .inner
            .handle_message(Message::Close { recipient_id: 0 })
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::Remove);

        // no second CLOSE: shut the write side and confirm the stream ends
        ch.inner.writer.shutdown().await.unwrap();
        assert!(peer.next().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_reader_and_writer() {
        let (ch, _peer) = harness();
        establish(&ch, 1, 4, 32).await;

        let reader = {
            let ch = ch.clone();
            tokio::spawn(async move {
                let mut dst = [0u8; 8];
                ch.read(&mut dst).await
            })
        };
        let writer = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.write(&[0u8; 64]).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        ch.inner.shutdown().await;

        let read_result = tokio::time::timeout(std::time::Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read_result.unwrap(), 0);

        let write_result = tokio::time::timeout(std::time::Duration::from_secs(1), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(write_result, Err(QmuxError::ChannelClosed)));
    }
}
