//! In-process store.

use std::collections::HashMap;

use async_trait::async_trait;
use ssehub_protocol::Event;
use tokio::sync::RwLock;

use super::{EventPage, Store, StoreError};

/// Per-event-type append logs held in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    logs: RwLock<HashMap<String, Vec<Event>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events stored for a type.
    pub async fn len(&self, event_type: &str) -> usize {
        self.logs
            .read()
            .await
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save(&self, event: &Event) -> Result<(), StoreError> {
        self.logs
            .write()
            .await
            .entry(event.event_type.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn list_by_last_id(
        &self,
        event_type: &str,
        last_id: &str,
        page_size: usize,
    ) -> Result<EventPage, StoreError> {
        let logs = self.logs.read().await;
        let Some(log) = logs.get(event_type) else {
            return Ok(EventPage::default());
        };

        let start = if last_id.is_empty() {
            0
        } else {
            match log.iter().position(|event| event.id == last_id) {
                Some(index) => index + 1,
                None => return Ok(EventPage::default()),
            }
        };

        let end = start.saturating_add(page_size.max(1)).min(log.len());
        let events = log[start..end].to_vec();
        let next_id = if end < log.len() {
            events.last().map(|e| e.id.clone()).unwrap_or_default()
        } else {
            String::new()
        };

        Ok(EventPage { events, next_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded(n: usize) -> MemoryStore {
        let store = MemoryStore::new();
        for i in 1..=n {
            let event = Event::new("tick", json!(i)).with_id(i.to_string());
            store.save(&event).await.unwrap();
        }
        store
    }

    fn ids(page: &EventPage) -> Vec<&str> {
        page.events.iter().map(|e| e.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_pages_in_append_order() {
        let store = seeded(5).await;

        let page = store.list_by_last_id("tick", "", 2).await.unwrap();
        assert_eq!(ids(&page), vec!["1", "2"]);
        assert_eq!(page.next_id, "2");

        let page = store.list_by_last_id("tick", &page.next_id, 2).await.unwrap();
        assert_eq!(ids(&page), vec!["3", "4"]);
        assert_eq!(page.next_id, "4");

        let page = store.list_by_last_id("tick", &page.next_id, 2).await.unwrap();
        assert_eq!(ids(&page), vec!["5"]);
        assert!(page.is_exhausted());
    }

    #[tokio::test]
    async fn test_exact_page_boundary_is_exhausted() {
        let store = seeded(4).await;
        let page = store.list_by_last_id("tick", "2", 2).await.unwrap();
        assert_eq!(ids(&page), vec!["3", "4"]);
        assert!(page.is_exhausted());
    }

    #[tokio::test]
    async fn test_types_are_separate_logs() {
        let store = seeded(3).await;
        store
            .save(&Event::new("other", json!(0)).with_id("x"))
            .await
            .unwrap();

        let page = store.list_by_last_id("other", "", 10).await.unwrap();
        assert_eq!(ids(&page), vec!["x"]);
        assert_eq!(store.len("tick").await, 3);

        let page = store.list_by_last_id("missing", "", 10).await.unwrap();
        assert!(page.events.is_empty());
        assert!(page.is_exhausted());
    }

    #[tokio::test]
    async fn test_unknown_last_id_yields_nothing() {
        let store = seeded(3).await;
        let page = store.list_by_last_id("tick", "99", 10).await.unwrap();
        assert!(page.events.is_empty());
        assert!(page.is_exhausted());
    }

    #[tokio::test]
    async fn test_last_id_at_tail() {
        let store = seeded(3).await;
        let page = store.list_by_last_id("tick", "3", 10).await.unwrap();
        assert!(page.events.is_empty());
        assert!(page.is_exhausted());
    }
}
