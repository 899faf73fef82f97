use crate::{
    channel::{Channel, ChannelInner, Direction, HandleOutcome},
    channel_table::ChannelTable,
    codec::{Codec, FrameWriter},
    error::{QmuxError, Result},
    message::{
        Message, CHANNEL_MAX_PACKET, CHANNEL_WINDOW_SIZE, MAX_PACKET_LENGTH, MIN_PACKET_LENGTH,
    },
};
use futures::{stream::SplitStream, StreamExt};
use std::sync::Arc;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::watch,
};
use tokio_util::{codec::Framed, sync::CancellationToken};

/// Depth of the accept queue and of each channel's control inbox. Kept
/// small so lost wakeups and deadlocks surface quickly under test.
pub(crate) const CHAN_SIZE: usize = 16;

/// A multiplexed session over a single ordered, reliable byte transport.
///
/// The session owns the transport. Exactly one task (the demultiplex loop
/// spawned by [`Session::new`]) reads it; any number of tasks may write
/// through it, serialized per frame. Handles are cheap to clone and all
/// methods take `&self`, so `open`, `accept` and per-channel I/O can run
/// concurrently.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    writer: FrameWriter,
    table: ChannelTable,
    incoming_tx: flume::Sender<Channel>,
    incoming_rx: flume::Receiver<Channel>,
    err_tx: watch::Sender<Option<QmuxError>>,
    err_rx: watch::Receiver<Option<QmuxError>>,
    cancel: CancellationToken,
}

impl Session {
    /// Bind a session to `transport` and start its demultiplex loop.
    pub fn new<T>(transport: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, frames) = Framed::new(transport, Codec::new()).split();
        let (incoming_tx, incoming_rx) = flume::bounded(CHAN_SIZE);
        let (err_tx, err_rx) = watch::channel(None);

        let inner = Arc::new(SessionInner {
            writer: FrameWriter::new(sink),
            table: ChannelTable::new(),
            incoming_tx,
            incoming_rx,
            err_tx,
            err_rx,
            cancel: CancellationToken::new(),
        });

        let loop_inner = Arc::clone(&inner);
        tokio::spawn(demux_loop(loop_inner, frames));

        Session { inner }
    }

    /// Open an outbound channel and wait for the peer's reply.
    pub async fn open(&self) -> Result<Channel> {
        if self.is_closed() {
            return Err(QmuxError::SessionClosed);
        }
        let inner = &self.inner;
        let ch = inner
            .table
            .add(|id| ChannelInner::new(id, Direction::Outbound, inner.writer.clone(), CHAN_SIZE))
            .await;

        let open = Message::Open {
            sender_id: ch.local_id(),
            window_size: CHANNEL_WINDOW_SIZE,
            max_packet_size: CHANNEL_MAX_PACKET,
        };
        if let Err(err) = inner.writer.send(open).await {
            inner.table.remove(ch.local_id()).await;
            return Err(err);
        }

        let reply = tokio::select! {
            reply = ch.recv_control() => reply,
            _ = inner.cancel.cancelled() => None,
        };

        match reply {
            Some(Message::OpenConfirm { .. }) => Ok(Channel::new(ch)),
            Some(Message::OpenFailure { .. }) => {
                inner.table.remove(ch.local_id()).await;
                Err(QmuxError::OpenRejected)
            }
            Some(other) => {
                inner.table.remove(ch.local_id()).await;
                Err(QmuxError::UnexpectedOpenReply(other.type_byte()))
            }
            None => {
                inner.table.remove(ch.local_id()).await;
                Err(QmuxError::SessionClosed)
            }
        }
    }

    /// Wait for the peer to open a channel.
    pub async fn accept(&self) -> Result<Channel> {
        tokio::select! {
            ch = self.inner.incoming_rx.recv_async() => {
                ch.map_err(|_| QmuxError::SessionClosed)
            }
            _ = self.inner.cancel.cancelled() => Err(QmuxError::SessionClosed),
        }
    }

    /// Block until the session terminates. Resolves `Ok` when the
    /// transport ended cleanly (EOF or local close), and with the terminal
    /// transport or protocol error otherwise.
    pub async fn wait(&self) -> Result<()> {
        let mut err_rx = self.inner.err_rx.clone();
        let err = {
            let value = err_rx
                .wait_for(|err| err.is_some())
                .await
                .map_err(|_| QmuxError::SessionClosed)?;
            (*value).clone().unwrap_or(QmuxError::SessionClosed)
        };
        match err {
            QmuxError::SessionClosed => Ok(()),
            err => Err(err),
        }
    }

    /// Tear the session down: the demultiplex loop exits, every channel is
    /// dropped, and all pending calls unblock.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Token cancelled when the session shuts down. Cancelling it is
    /// equivalent to [`Session::close`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }
}

impl SessionInner {
    /// Route one decoded frame. OPEN is handled here; everything else is
    /// addressed to a registered channel.
    async fn dispatch(&self, msg: Message) -> Result<()> {
        match msg {
            Message::Open {
                sender_id,
                window_size,
                max_packet_size,
            } => self.handle_open(sender_id, window_size, max_packet_size).await,
            msg => {
                let Some(id) = msg.channel_id() else {
                    return Err(QmuxError::UnknownMessageType(msg.type_byte()));
                };
                let ch = self
                    .table
                    .get(id)
                    .await
                    .ok_or(QmuxError::UnknownChannel(id))?;
                if ch.handle_message(msg).await? == HandleOutcome::Remove {
                    self.table.remove(id).await;
                }
                Ok(())
            }
        }
    }

    /// Allocate an inbound channel, queue it for `accept`, and confirm.
    /// The channel is enqueued before OPEN_CONFIRM goes out so the peer's
    /// immediate DATA always finds it registered.
    async fn handle_open(
        &self,
        sender_id: u32,
        window_size: u32,
        max_packet_size: u32,
    ) -> Result<()> {
        if !(MIN_PACKET_LENGTH..=MAX_PACKET_LENGTH).contains(&max_packet_size) {
            tracing::debug!(sender_id, max_packet_size, "rejecting channel open");
            return self
                .writer
                .send(Message::OpenFailure {
                    recipient_id: sender_id,
                })
                .await;
        }

        let ch = self
            .table
            .add(|id| ChannelInner::new(id, Direction::Inbound, self.writer.clone(), CHAN_SIZE))
            .await;
        ch.complete_open(sender_id, window_size, max_packet_size)
            .await?;

        tokio::select! {
            sent = self.incoming_tx.send_async(Channel::new(Arc::clone(&ch))) => {
                if sent.is_err() {
                    return Err(QmuxError::SessionClosed);
                }
            }
            _ = self.cancel.cancelled() => return Err(QmuxError::SessionClosed),
        }

        self.writer
            .send(Message::OpenConfirm {
                recipient_id: sender_id,
                sender_id: ch.local_id(),
                window_size: CHANNEL_WINDOW_SIZE,
                max_packet_size: CHANNEL_MAX_PACKET,
            })
            .await
    }
}

/// The connection machine: the sole reader of the transport. Processes
/// frames until an error or EOF, then drops every channel, closes the
/// transport, and publishes the terminal error for `wait`.
async fn demux_loop<T>(inner: Arc<SessionInner>, mut frames: SplitStream<Framed<T, Codec>>)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let err = loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break QmuxError::SessionClosed,
            frame = frames.next() => match frame {
                Some(Ok(msg)) => {
                    if let Err(err) = inner.dispatch(msg).await {
                        tracing::error!(%err, "demultiplex loop terminating");
                        break err;
                    }
                }
                Some(Err(err)) => break err,
                None => break QmuxError::SessionClosed,
            },
        }
    };

    for ch in inner.table.drop_all().await {
        ch.shutdown().await;
    }
    let _ = inner.writer.shutdown().await;
    drop(frames);
    inner.cancel.cancel();
    tracing::debug!(%err, "session terminated");
    let _ = inner.err_tx.send(Some(err));
}
