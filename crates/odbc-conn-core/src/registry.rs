//! Process-lifetime caches of connection options and pool groups.
//!
//! Both are append-mostly maps behind read/write locks: lookups take the
//! read lock, and create-if-absent re-checks under the write lock so that
//! exactly one instance wins per key. Nothing that touches a driver ever
//! runs while either lock is held.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::Result;
use crate::driver::Driver;
use crate::options::{CanonicalKey, ConnectionOptions, KeywordPolicy};
use crate::pool_group::ConnectionPoolGroup;

#[derive(Default)]
struct OptionsEntries {
   by_raw: HashMap<(KeywordPolicy, String), Arc<ConnectionOptions>>,
   by_key: HashMap<(KeywordPolicy, CanonicalKey), Arc<ConnectionOptions>>,
}

/// Cache from raw connection strings to shared, normalized options
#[derive(Default)]
pub(crate) struct OptionsCache {
   entries: RwLock<OptionsEntries>,
}

impl OptionsCache {
   /// Return the cached options for `raw`, parsing and inserting on first sight.
   ///
   /// A new raw string whose canonical key was already seen shares the
   /// existing instance rather than allocating a duplicate.
   pub fn get_or_create(
      &self,
      raw: &str,
      policy: KeywordPolicy,
      max_len: usize,
   ) -> Result<Arc<ConnectionOptions>> {
      let raw_key = (policy, raw.to_string());
      if let Some(found) = self.entries.read().by_raw.get(&raw_key) {
         return Ok(Arc::clone(found));
      }

      let parsed = ConnectionOptions::parse(raw, policy, max_len)?;

      let mut entries = self.entries.write();
      if let Some(found) = entries.by_raw.get(&raw_key) {
         return Ok(Arc::clone(found));
      }

      let shared = Arc::clone(
         entries
            .by_key
            .entry((policy, parsed.canonical_key().clone()))
            .or_insert_with(|| Arc::new(parsed)),
      );
      entries.by_raw.insert(raw_key, Arc::clone(&shared));
      trace!(options = %shared.redacted(), "Cached connection options");
      Ok(shared)
   }

   pub fn len(&self) -> usize {
      self.entries.read().by_key.len()
   }
}

/// Cache of pool groups keyed by canonical options key
pub(crate) struct PoolGroupRegistry<D: Driver> {
   groups: RwLock<HashMap<CanonicalKey, Arc<ConnectionPoolGroup<D>>>>,
}

impl<D: Driver> PoolGroupRegistry<D> {
   pub fn new() -> Self {
      Self {
         groups: RwLock::new(HashMap::new()),
      }
   }

   /// Atomic create-if-absent.
   ///
   /// `create` runs under the write lock and at most once per key; concurrent
   /// callers for the same key all receive the winner's instance. A disabled
   /// group in the map is replaced.
   pub fn get_or_create(
      &self,
      key: &CanonicalKey,
      create: impl FnOnce() -> ConnectionPoolGroup<D>,
   ) -> Arc<ConnectionPoolGroup<D>> {
      {
         let groups = self.groups.read();
         if let Some(group) = groups.get(key)
            && !group.is_disabled()
         {
            return Arc::clone(group);
         }
      }

      let mut groups = self.groups.write();
      if let Some(group) = groups.get(key)
         && !group.is_disabled()
      {
         return Arc::clone(group);
      }

      let group = Arc::new(create());
      groups.insert(key.clone(), Arc::clone(&group));
      debug!(group = ?key, total = groups.len(), "Created pool group");
      group
   }

   pub fn remove(&self, key: &CanonicalKey) -> Option<Arc<ConnectionPoolGroup<D>>> {
      self.groups.write().remove(key)
   }

   pub fn drain(&self) -> Vec<Arc<ConnectionPoolGroup<D>>> {
      self.groups.write().drain().map(|(_, group)| group).collect()
   }

   pub fn len(&self) -> usize {
      self.groups.read().len()
   }
}
