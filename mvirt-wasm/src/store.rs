//! In-memory registry of task handles.
//!
//! The store only indexes handles. Removing an entry does not stop its
//! worker; `destroy_task` does that before it deletes.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::handle::TaskHandle;

#[derive(Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<String, Arc<TaskHandle>>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<TaskHandle>> {
        self.tasks.read().await.get(id).cloned()
    }

    pub async fn set(&self, id: &str, handle: Arc<TaskHandle>) {
        self.tasks.write().await.insert(id.to_string(), handle);
    }

    /// Insert unless the id is taken. Returns whether the handle was stored.
    pub async fn insert_if_absent(&self, id: &str, handle: Arc<TaskHandle>) -> bool {
        match self.tasks.write().await.entry(id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handle);
                true
            }
        }
    }

    pub async fn delete(&self, id: &str) -> Option<Arc<TaskHandle>> {
        self.tasks.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.tasks.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskConfig;
    use crate::handle::testing::{FakeController, handle_for};

    #[tokio::test]
    async fn test_store_crud() {
        let store = TaskStore::new();
        assert!(store.is_empty().await);

        let (controller, _exit) = FakeController::new(100);
        let handle = handle_for(TaskConfig::new("a", "alpha"), controller);
        store.set("a", handle.clone()).await;

        let fetched = store.get("a").await.unwrap();
        assert!(Arc::ptr_eq(&fetched, &handle));
        assert_eq!(store.ids().await, vec!["a".to_string()]);

        let removed = store.delete("a").await.unwrap();
        assert!(Arc::ptr_eq(&removed, &handle));
        assert!(store.get("a").await.is_none());
        assert!(store.delete("a").await.is_none());
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_first() {
        let store = TaskStore::new();
        let (first, _e1) = FakeController::new(1);
        let (second, _e2) = FakeController::new(2);
        let first = handle_for(TaskConfig::new("dup", "first"), first);
        let second = handle_for(TaskConfig::new("dup", "second"), second);

        assert!(store.insert_if_absent("dup", first.clone()).await);
        assert!(!store.insert_if_absent("dup", second).await);

        let stored = store.get("dup").await.unwrap();
        assert!(Arc::ptr_eq(&stored, &first));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts() {
        let store = Arc::new(TaskStore::new());
        let mut joins = Vec::new();

        for i in 0..64u32 {
            let store = Arc::clone(&store);
            joins.push(tokio::spawn(async move {
                let id = format!("task-{i}");
                let (controller, _exit) = FakeController::new(1000 + i);
                let handle = handle_for(TaskConfig::new(id.clone(), "concurrent"), controller);
                store.insert_if_absent(&id, handle).await
            }));
        }
        for join in joins {
            assert!(join.await.unwrap());
        }

        assert_eq!(store.len().await, 64);
        for i in 0..64 {
            assert!(store.get(&format!("task-{i}")).await.is_some());
        }
    }
}
