//! Ordered notification list fed by the notification channel.

use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;

use crate::channel::NotificationSink;
use crate::messages::{EventId, NotificationEvent};

const UPDATE_CAPACITY: usize = 64;

#[derive(Default)]
struct Inner {
    list: Vec<NotificationEvent>,
    alerts: Vec<String>,
}

/// Insertion-ordered notifications plus the transient alerts not yet shown.
pub struct NotificationStore {
    inner: Mutex<Inner>,
    updates: broadcast::Sender<NotificationEvent>,
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            updates,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receive every event appended from now on.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<NotificationEvent> {
        self.updates.subscribe()
    }

    pub fn list(&self) -> Vec<NotificationEvent> {
        self.lock().list.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().list.is_empty()
    }

    pub fn unread_count(&self) -> usize {
        self.lock().list.iter().filter(|n| !n.is_read).count()
    }

    /// Returns false if no notification has this id.
    pub fn mark_read(&self, id: EventId) -> bool {
        let mut inner = self.lock();
        match inner.list.iter_mut().find(|n| n.id == id) {
            Some(n) => {
                n.is_read = true;
                true
            }
            None => false,
        }
    }

    /// Swap in a freshly fetched list. Pending alerts are kept.
    pub fn replace_all(&self, events: Vec<NotificationEvent>) {
        self.lock().list = events;
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.list.clear();
        inner.alerts.clear();
    }

    /// Drain alerts raised since the last call.
    pub fn take_alerts(&self) -> Vec<String> {
        std::mem::take(&mut self.lock().alerts)
    }
}

impl NotificationSink for NotificationStore {
    fn deliver(&self, event: NotificationEvent) {
        self.lock().list.push(event.clone());
        // No listeners is fine.
        let _ = self.updates.send(event);
    }

    fn alert(&self, message: &str) {
        self.lock().alerts.push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::NotificationPayload;

    fn event(message: &str) -> NotificationEvent {
        NotificationEvent::received(NotificationPayload {
            message: message.into(),
            kind: None,
            extra: Default::default(),
        })
    }

    #[test]
    fn keeps_insertion_order_and_read_state() {
        let store = NotificationStore::new();
        let first = event("one");
        let first_id = first.id;
        store.deliver(first);
        store.deliver(event("two"));
        store.alert("one");

        let messages: Vec<_> = store.list().into_iter().map(|n| n.message).collect();
        assert_eq!(messages, ["one", "two"]);
        assert_eq!(store.unread_count(), 2);
        assert!(store.mark_read(first_id));
        assert_eq!(store.unread_count(), 1);
        assert_eq!(store.take_alerts(), ["one"]);
        assert!(store.take_alerts().is_empty());

        store.clear();
        assert!(store.is_empty());
        assert!(!store.mark_read(first_id));
    }

    #[test]
    fn replace_all_swaps_list() {
        let store = NotificationStore::new();
        store.deliver(event("live"));
        let mut fetched = event("fetched");
        fetched.is_read = true;
        store.replace_all(vec![fetched, event("unread")]);

        let messages: Vec<_> = store.list().into_iter().map(|n| n.message).collect();
        assert_eq!(messages, ["fetched", "unread"]);
        assert_eq!(store.unread_count(), 1);
    }
}
