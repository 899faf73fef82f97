use crate::error::{QmuxError, Result};
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Default)]
struct WindowState {
    available: u32,
    closed: bool,
}

/// Flow-control credit counter for one channel direction.
///
/// `add` grants credit and wakes waiters, `reserve` blocks while the
/// counter is zero, and `close` unblocks every pending reservation so
/// senders never hang on shutdown.
#[derive(Debug, Default)]
pub(crate) struct Window {
    state: Mutex<WindowState>,
    readable: Notify,
}

impl Window {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Grant `n` bytes of credit. Growing the counter past `u32::MAX` is a
    /// protocol violation.
    pub(crate) async fn add(&self, n: u32) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.available = state
                .available
                .checked_add(n)
                .ok_or(QmuxError::WindowOverflow)?;
        }
        self.readable.notify_waiters();
        Ok(())
    }

    /// Take up to `want` bytes of credit, waiting while none is available.
    /// Fails once the window is closed, even if credit remains.
    pub(crate) async fn reserve(&self, want: u32) -> Result<u32> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(QmuxError::ChannelClosed);
                }
                if state.available > 0 {
                    let n = want.min(state.available);
                    state.available -= n;
                    return Ok(n);
                }
            }
            notified.await;
        }
    }

    /// Wake all waiters with a closed indication.
    pub(crate) async fn close(&self) {
        self.state.lock().await.closed = true;
        self.readable.notify_waiters();
    }
}
