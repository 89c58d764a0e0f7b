//! Per-image progress broadcast (spec §4.C `subscribeProgress`). A fresh
//! subscriber always receives the current snapshot first, then every
//! subsequent transition up to and including the terminal one — a plain
//! `broadcast::Sender` doesn't replay history, so the latest event is kept
//! alongside the channel for that initial catch-up.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use vmkit_core::progress::ProgressEvent;

const CHANNEL_CAPACITY: usize = 64;

struct Entry {
    sender: broadcast::Sender<ProgressEvent>,
    latest: ProgressEvent,
}

#[derive(Clone)]
pub struct ProgressHub {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self { entries: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub async fn publish(&self, id: &str, event: ProgressEvent) {
        let mut entries = self.entries.write().await;
        match entries.get_mut(id) {
            Some(entry) => {
                entry.latest = event.clone();
                let _ = entry.sender.send(event);
            }
            None => {
                let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
                let _ = sender.send(event.clone());
                entries.insert(id.to_string(), Entry { sender, latest: event });
            }
        }
    }

    /// Forward the current snapshot plus every subsequent update for `id`
    /// into `tx`, stopping once a terminal event is delivered, `tx` is
    /// dropped, or a lagged receiver skips ahead (treated as a hard stop
    /// rather than silently resuming mid-stream).
    pub async fn subscribe(&self, id: &str, tx: tokio::sync::mpsc::Sender<ProgressEvent>) {
        let (snapshot, mut receiver) = {
            let entries = self.entries.read().await;
            match entries.get(id) {
                Some(entry) => (entry.latest.clone(), entry.sender.subscribe()),
                None => return,
            }
        };

        if tx.send(snapshot.clone()).await.is_err() || snapshot.is_terminal() {
            return;
        }

        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    if tx.send(event).await.is_err() || terminal {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    }

    pub async fn remove(&self, id: &str) {
        self.entries.write().await.remove(id);
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmkit_core::image::ImageStatus;

    #[tokio::test]
    async fn fresh_subscriber_gets_current_snapshot_first() {
        let hub = ProgressHub::new();
        hub.publish("img-1", ProgressEvent::pending(Some(2))).await;
        hub.publish(
            "img-1",
            ProgressEvent { status: ImageStatus::Pulling, percent: 10, queue_position: None, error: None },
        )
        .await;

        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let hub2 = hub.clone();
        tokio::spawn(async move { hub2.subscribe("img-1", tx).await });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.status, ImageStatus::Pulling);
        assert_eq!(first.percent, 10);
    }

    #[tokio::test]
    async fn subscriber_sees_events_up_to_and_including_terminal() {
        let hub = ProgressHub::new();
        hub.publish("img-2", ProgressEvent::pending(None)).await;

        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let hub2 = hub.clone();
        let task = tokio::spawn(async move { hub2.subscribe("img-2", tx).await });

        assert_eq!(rx.recv().await.unwrap().status, ImageStatus::Pending);
        hub.publish("img-2", ProgressEvent::ready()).await;
        let terminal = rx.recv().await.unwrap();
        assert!(terminal.is_terminal());
        assert!(rx.recv().await.is_none());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn subscribe_to_unknown_id_closes_immediately() {
        let hub = ProgressHub::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        hub.subscribe("never-published", tx).await;
        assert!(rx.recv().await.is_none());
    }
}
