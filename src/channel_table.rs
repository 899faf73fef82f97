use crate::channel::ChannelInner;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Dense slot table mapping local channel IDs to live channels.
///
/// IDs are slot indexes: `add` fills the lowest free slot, so an ID freed
/// by `remove` is reused by the next allocation.
#[derive(Default)]
pub(crate) struct ChannelTable {
    slots: Mutex<Vec<Option<Arc<ChannelInner>>>>,
}

impl ChannelTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocate the lowest free local ID and register the channel built
    /// for it.
    pub(crate) async fn add<F>(&self, build: F) -> Arc<ChannelInner>
    where
        F: FnOnce(u32) -> Arc<ChannelInner>,
    {
        let mut slots = self.slots.lock().await;
        for (id, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                let ch = build(id as u32);
                *slot = Some(Arc::clone(&ch));
                return ch;
            }
        }
        let ch = build(slots.len() as u32);
        slots.push(Some(Arc::clone(&ch)));
        ch
    }

    pub(crate) async fn get(&self, id: u32) -> Option<Arc<ChannelInner>> {
        self.slots.lock().await.get(id as usize).cloned().flatten()
    }

    /// Free the slot, making the ID eligible for reuse.
    pub(crate) async fn remove(&self, id: u32) -> Option<Arc<ChannelInner>> {
        self.slots
            .lock()
            .await
            .get_mut(id as usize)
            .and_then(Option::take)
    }

    /// Atomically empty the table, returning the channels that were live so
    /// the caller can shut each one down.
    pub(crate) async fn drop_all(&self) -> Vec<Arc<ChannelInner>> {
        self.slots.lock().await.drain(..).flatten().collect()
    }
}
