//! Keyed async locks used to serialize commands per owner and ticks per group.

use std::{
  collections::HashMap,
  hash::Hash,
  sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub(crate) struct KeyedLocks<K> {
  inner: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
  fn default() -> Self { Self { inner: Mutex::new(HashMap::new()) } }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
  /// Wait for exclusive access to `key`. The guard releases it on drop.
  pub(crate) async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
    let slot = {
      let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
      // Drop slots nobody holds or waits on so the map tracks live keys only.
      map.retain(|_, m| Arc::strong_count(m) > 1);
      map.entry(key.clone()).or_default().clone()
    };
    slot.lock_owned().await
  }
}
