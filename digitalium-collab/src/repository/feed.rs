//! Per-document broadcast feeds.
//!
//! One `broadcast` channel per document, created lazily on first subscribe.
//! Publishing to a document nobody watches is a no-op and drops its channel;
//! creating a channel also drops every other abandoned one.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::broadcast;
use uuid::Uuid;

pub struct ChangeFeed<T: Clone> {
    rooms: RwLock<HashMap<Uuid, broadcast::Sender<T>>>,
    capacity: usize,
}

impl<T: Clone> ChangeFeed<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub fn subscribe(&self, document_id: Uuid) -> broadcast::Receiver<T> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().unwrap_or_else(|p| p.into_inner());
            if let Some(sender) = rooms.get(&document_id) {
                return sender.subscribe();
            }
        }
        let mut rooms = self.rooms.write().unwrap_or_else(|p| p.into_inner());
        if !rooms.contains_key(&document_id) {
            rooms.retain(|_, sender| sender.receiver_count() > 0);
        }
        rooms
            .entry(document_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Returns the number of receivers reached.
    pub fn publish(&self, document_id: Uuid, value: T) -> usize {
        {
            let rooms = self.rooms.read().unwrap_or_else(|p| p.into_inner());
            match rooms.get(&document_id) {
                Some(sender) if sender.receiver_count() > 0 => {
                    return sender.send(value).unwrap_or(0);
                }
                Some(_) => {}
                None => return 0,
            }
        }
        let mut rooms = self.rooms.write().unwrap_or_else(|p| p.into_inner());
        // A subscriber may have arrived between the two locks
        if let Some(sender) = rooms.get(&document_id) {
            if sender.receiver_count() > 0 {
                return sender.send(value).unwrap_or(0);
            }
            rooms.remove(&document_id);
            log::trace!("Dropped abandoned feed for {document_id}");
        }
        0
    }

    pub fn subscriber_count(&self, document_id: Uuid) -> usize {
        let rooms = self.rooms.read().unwrap_or_else(|p| p.into_inner());
        rooms
            .get(&document_id)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Number of documents with a live channel.
    pub fn feed_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
