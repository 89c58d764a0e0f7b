//! Per-instance ordering: all mutating operations on one instance id are
//! totally ordered by a writer lock (spec §5 Ordering guarantees).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

/// A registry of per-instance `RwLock`s, created lazily on first access and
/// kept alive for the process lifetime. Readers may run concurrently;
/// mutating operations (create/delete/standby/restore/reboot/exec-admin)
/// take the write side so they are totally ordered per instance.
#[derive(Default)]
pub struct InstanceLocks {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, instance_id: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(instance_id.to_string()).or_insert_with(|| Arc::new(RwLock::new(()))).clone()
    }

    /// Drop the entry for a deleted instance so the map doesn't grow without
    /// bound. Safe to call even if nothing is registered.
    pub async fn remove(&self, instance_id: &str) {
        self.locks.lock().await.remove(instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_instance_returns_same_lock() {
        let locks = InstanceLocks::new();
        let a = locks.get("i-1").await;
        let b = locks.get("i-1").await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn different_instances_get_different_locks() {
        let locks = InstanceLocks::new();
        let a = locks.get("i-1").await;
        let b = locks.get("i-2").await;
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn writers_on_one_instance_are_serialized() {
        let locks = InstanceLocks::new();
        let lock = locks.get("i-1").await;
        let _guard = lock.write().await;
        assert!(lock.try_write().is_err());
    }

    #[tokio::test]
    async fn remove_then_get_creates_a_fresh_lock() {
        let locks = InstanceLocks::new();
        let a = locks.get("i-1").await;
        locks.remove("i-1").await;
        let b = locks.get("i-1").await;
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
