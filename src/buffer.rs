use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Default)]
struct BufferState {
    chunks: VecDeque<Bytes>,
    eof: bool,
}

/// Unbounded FIFO of byte chunks with EOF signaling.
///
/// Writes never block and never drop; flow control (the peer respecting our
/// advertised window) is the only bound on its size. Reads block until at
/// least one byte is available.
#[derive(Debug, Default)]
pub(crate) struct Buffer {
    state: Mutex<BufferState>,
    readable: Notify,
}

impl Buffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a chunk, taking ownership. Empty chunks are dropped so a
    /// blocked read never wakes to zero bytes before EOF.
    pub(crate) async fn write(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.state.lock().await.chunks.push_back(data);
        self.readable.notify_waiters();
    }

    /// Copy queued bytes into `dst` in arrival order, blocking until at
    /// least one byte is available. Returns 0 once EOF is set and the queue
    /// has drained.
    pub(crate) async fn read(&self, dst: &mut [u8]) -> usize {
        if dst.is_empty() {
            return 0;
        }
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().await;
                if !state.chunks.is_empty() {
                    let mut copied = 0;
                    while copied < dst.len() {
                        let Some(mut chunk) = state.chunks.pop_front() else {
                            break;
                        };
                        let n = chunk.len().min(dst.len() - copied);
                        dst[copied..copied + n].copy_from_slice(&chunk[..n]);
                        copied += n;
                        if n < chunk.len() {
                            chunk.advance(n);
                            state.chunks.push_front(chunk);
                        }
                    }
                    return copied;
                }
                if state.eof {
                    return 0;
                }
            }
            notified.await;
        }
    }

    /// Mark end of stream and wake blocked readers. Queued bytes remain
    /// readable until drained.
    pub(crate) async fn eof(&self) {
        self.state.lock().await.eof = true;
        self.readable.notify_waiters();
    }
}
