//! Event sinks
//!
//! Polling loops hand every normalized interaction to an [`EventSink`].
//! [`InteractionLog`] is the standard sink: a per-tab feed with unread
//! counters, optional persistence through the store, and a broadcast
//! channel that live consumers (the `watch` and `run` commands)
//! subscribe to.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::provider::OastEvent;
use crate::store::Store;

const CHANNEL_CAPACITY: usize = 256;

/// Receives events as polling loops surface them
pub trait EventSink: Send + Sync {
    fn add_interaction(&self, tab_id: &str, event: OastEvent);
}

/// One delivered interaction, as published on the live channel
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tab_id: String,
    pub event: OastEvent,
}

#[derive(Default)]
struct TabFeed {
    events: Vec<OastEvent>,
    unread: usize,
}

pub struct InteractionLog {
    feeds: RwLock<HashMap<String, TabFeed>>,
    store: Option<Arc<Store>>,
    notifier: broadcast::Sender<Delivery>,
}

impl InteractionLog {
    pub fn new() -> Self {
        let (notifier, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            feeds: RwLock::new(HashMap::new()),
            store: None,
            notifier,
        }
    }

    /// Persist every interaction and preload the feeds with what the
    /// store already holds. Preloaded events count as read.
    pub fn with_store(store: Arc<Store>) -> Self {
        let mut log = Self::new();
        {
            let mut feeds = log.feeds.write();
            for stored in store.interactions(None) {
                feeds
                    .entry(stored.tab_id)
                    .or_default()
                    .events
                    .push(stored.event);
            }
        }
        log.store = Some(store);
        log
    }

    /// Live feed of deliveries across all tabs
    pub fn subscribe(&self) -> broadcast::Receiver<Delivery> {
        self.notifier.subscribe()
    }

    pub fn interactions(&self, tab_id: &str) -> Vec<OastEvent> {
        self.feeds
            .read()
            .get(tab_id)
            .map(|feed| feed.events.clone())
            .unwrap_or_default()
    }

    pub fn unread_count(&self, tab_id: &str) -> usize {
        self.feeds.read().get(tab_id).map_or(0, |feed| feed.unread)
    }

    pub fn mark_read(&self, tab_id: &str) {
        if let Some(feed) = self.feeds.write().get_mut(tab_id) {
            feed.unread = 0;
        }
    }

    /// Drop a tab's feed, including anything persisted for it.
    pub fn clear(&self, tab_id: &str) {
        self.feeds.write().remove(tab_id);
        if let Some(store) = &self.store {
            if let Err(e) = store.clear_interactions(tab_id) {
                warn!(tab = tab_id, error = %e, "could not clear persisted interactions");
            }
        }
    }

    pub fn tabs(&self) -> Vec<String> {
        self.feeds.read().keys().cloned().collect()
    }
}

impl Default for InteractionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for InteractionLog {
    fn add_interaction(&self, tab_id: &str, event: OastEvent) {
        {
            let mut feeds = self.feeds.write();
            let feed = feeds.entry(tab_id.to_string()).or_default();
            feed.events.push(event.clone());
            feed.unread += 1;
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.append_interaction(tab_id, &event) {
                warn!(tab = tab_id, error = %e, "could not persist interaction");
            }
        }
        debug!(tab = tab_id, id = %event.id, kind = %event.kind, "interaction recorded");
        // nobody listening is fine
        let _ = self.notifier.send(Delivery {
            tab_id: tab_id.to_string(),
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;
    use chrono::Utc;

    fn event(id: &str) -> OastEvent {
        OastEvent {
            id: id.to_string(),
            kind: ProviderKind::Boast,
            protocol: Some("dns".to_string()),
            method: None,
            source: Some("198.51.100.7".to_string()),
            destination: None,
            timestamp: Utc::now(),
            correlation_id: id.to_string(),
            raw_request: None,
            raw_response: None,
            data: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_add_interaction_tracks_unread() {
        let log = InteractionLog::new();
        log.add_interaction("tab-1", event("evt-1"));
        log.add_interaction("tab-1", event("evt-2"));
        log.add_interaction("tab-2", event("evt-3"));

        assert_eq!(log.interactions("tab-1").len(), 2);
        assert_eq!(log.unread_count("tab-1"), 2);
        assert_eq!(log.unread_count("tab-2"), 1);
        assert_eq!(log.unread_count("tab-3"), 0);
    }

    #[test]
    fn test_mark_read_resets_counter_keeps_events() {
        let log = InteractionLog::new();
        log.add_interaction("tab-1", event("evt-1"));
        log.mark_read("tab-1");
        assert_eq!(log.unread_count("tab-1"), 0);
        assert_eq!(log.interactions("tab-1").len(), 1);
    }

    #[test]
    fn test_clear_drops_feed_and_persisted_rows() {
        let store = Arc::new(Store::in_memory());
        let log = InteractionLog::with_store(store.clone());
        log.add_interaction("tab-1", event("evt-1"));
        log.add_interaction("tab-2", event("evt-2"));

        log.clear("tab-1");
        assert!(log.interactions("tab-1").is_empty());
        assert!(store.interactions(Some("tab-1")).is_empty());
        assert_eq!(store.interactions(None).len(), 1);
    }

    #[test]
    fn test_with_store_preloads_existing_feed_as_read() {
        let store = Arc::new(Store::in_memory());
        store.append_interaction("tab-1", &event("evt-1")).unwrap();

        let log = InteractionLog::with_store(store);
        assert_eq!(log.interactions("tab-1").len(), 1);
        assert_eq!(log.unread_count("tab-1"), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_deliveries() {
        let log = InteractionLog::new();
        let mut rx = log.subscribe();
        log.add_interaction("tab-1", event("evt-1"));

        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.tab_id, "tab-1");
        assert_eq!(delivery.event.id, "evt-1");
    }
}
