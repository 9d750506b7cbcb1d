//! Pool groups: the reuse boundary for one canonical configuration

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, trace};

use crate::config::{FactoryConfig, PoolingMode};
use crate::driver::Driver;
use crate::inner::{InnerConnection, InnerState};
use crate::options::{CanonicalKey, ConnectionOptions, Keyword};

/// Provider-specific metadata attached to a pool group when it is created
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderInfo {
   /// Driver named by the configuration, if any
   pub driver_name: Option<String>,
   /// DSN, file DSN or server the configuration points at
   pub data_source: Option<String>,
}

impl ProviderInfo {
   pub fn from_options(options: &ConnectionOptions) -> Self {
      Self {
         driver_name: options.get(Keyword::Driver).map(str::to_string),
         data_source: options.data_source().map(str::to_string),
      }
   }
}

/// Point-in-time counters for a pool group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolGroupStats {
   /// Inner connections whose physical session was established for this group
   pub created: u64,
   /// Acquires satisfied from the idle set
   pub reused: u64,
   /// Inner connections torn down (broken, expired, over capacity, cleared)
   pub discarded: u64,
   /// Inner connections currently idle
   pub idle: usize,
}

struct IdleEntry<D: Driver> {
   inner: Arc<InnerConnection<D>>,
   since: Instant,
}

/// All connections sharing one canonical configuration.
///
/// Exactly one group exists per canonical key in a factory. The idle set is
/// its own lock and is never held across a driver call.
pub struct ConnectionPoolGroup<D: Driver> {
   key: CanonicalKey,
   options: Arc<ConnectionOptions>,
   provider_info: ProviderInfo,
   pooling: PoolingMode,
   max_idle: usize,
   idle_timeout: Duration,
   idle: Mutex<Vec<IdleEntry<D>>>,
   disabled: AtomicBool,
   created: AtomicU64,
   reused: AtomicU64,
   discarded: AtomicU64,
}

impl<D: Driver> ConnectionPoolGroup<D> {
   pub(crate) fn new(
      options: Arc<ConnectionOptions>,
      provider_info: ProviderInfo,
      config: &FactoryConfig,
   ) -> Self {
      Self {
         key: options.canonical_key().clone(),
         options,
         provider_info,
         pooling: config.pooling,
         max_idle: config.max_idle_per_group,
         idle_timeout: config.idle_timeout(),
         idle: Mutex::new(Vec::new()),
         disabled: AtomicBool::new(false),
         created: AtomicU64::new(0),
         reused: AtomicU64::new(0),
         discarded: AtomicU64::new(0),
      }
   }

   pub fn key(&self) -> &CanonicalKey {
      &self.key
   }

   pub fn options(&self) -> &Arc<ConnectionOptions> {
      &self.options
   }

   pub fn provider_info(&self) -> &ProviderInfo {
      &self.provider_info
   }

   pub fn pooling(&self) -> PoolingMode {
      self.pooling
   }

   /// A disabled group hands out nothing and tears down everything released to it
   pub fn is_disabled(&self) -> bool {
      self.disabled.load(Ordering::Acquire)
   }

   pub fn idle_count(&self) -> usize {
      self.idle.lock().len()
   }

   pub fn stats(&self) -> PoolGroupStats {
      PoolGroupStats {
         created: self.created.load(Ordering::Relaxed),
         reused: self.reused.load(Ordering::Relaxed),
         discarded: self.discarded.load(Ordering::Relaxed),
         idle: self.idle_count(),
      }
   }

   pub(crate) fn record_created(&self) {
      self.created.fetch_add(1, Ordering::Relaxed);
   }

   fn pop_idle(&self) -> Option<IdleEntry<D>> {
      self.idle.lock().pop()
   }

   fn drain_idle(&self) -> Vec<IdleEntry<D>> {
      std::mem::take(&mut *self.idle.lock())
   }

   /// Take a healthy idle connection, if there is one.
   ///
   /// Most recently released first. Expired members and members that fail
   /// the liveness probe are torn down and never returned.
   pub async fn acquire(&self, driver: &D) -> Option<Arc<InnerConnection<D>>> {
      if self.pooling == PoolingMode::Native || self.is_disabled() {
         return None;
      }

      while let Some(entry) = self.pop_idle() {
         let inner = entry.inner;
         inner.set_pooled(false);

         if entry.since.elapsed() >= self.idle_timeout {
            trace!(inner_id = inner.id(), "Idle connection expired");
            self.discard(inner, driver).await;
            continue;
         }

         if inner.state() != InnerState::Open || !inner.probe(driver).await {
            debug!(
               inner_id = inner.id(),
               "Pooled connection failed liveness probe; discarding"
            );
            inner.mark_broken();
            self.discard(inner, driver).await;
            continue;
         }

         self.reused.fetch_add(1, Ordering::Relaxed);
         trace!(inner_id = inner.id(), "Reusing pooled connection");
         return Some(inner);
      }

      None
   }

   /// Return an inner connection to the idle set, or tear it down.
   ///
   /// Only an Open connection released to an enabled, managed group with
   /// room in its idle set is kept.
   pub async fn release(&self, inner: Arc<InnerConnection<D>>, driver: &D) {
      let reusable = inner.state() == InnerState::Open
         && self.pooling == PoolingMode::Managed
         && !self.is_disabled();

      if !reusable {
         self.discard(inner, driver).await;
         return;
      }

      if !inner.set_pooled(true) {
         error!(inner_id = inner.id(), "Inner connection released twice; ignoring");
         return;
      }

      let rejected = {
         let mut idle = self.idle.lock();
         if idle.len() < self.max_idle {
            idle.push(IdleEntry {
               inner,
               since: Instant::now(),
            });
            None
         } else {
            Some(inner)
         }
      };

      match rejected {
         None => {
            // A concurrent disable may have drained the set before this push
            if self.is_disabled() {
               self.clear(driver).await;
            }
         }
         Some(inner) => {
            inner.set_pooled(false);
            debug!(inner_id = inner.id(), max_idle = self.max_idle, "Idle set full; discarding");
            self.discard(inner, driver).await;
         }
      }
   }

   /// Tear down an inner connection that will not be reused
   pub(crate) async fn discard(&self, inner: Arc<InnerConnection<D>>, driver: &D) {
      self.discarded.fetch_add(1, Ordering::Relaxed);
      inner.teardown(driver).await;
   }

   /// Tear down every idle member. Returns how many were removed.
   pub async fn clear(&self, driver: &D) -> usize {
      let drained = self.drain_idle();
      let count = drained.len();
      for entry in drained {
         entry.inner.set_pooled(false);
         self.discard(entry.inner, driver).await;
      }
      count
   }

   pub(crate) fn disable(&self) {
      self.disabled.store(true, Ordering::Release);
   }
}

impl<D: Driver> std::fmt::Debug for ConnectionPoolGroup<D> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ConnectionPoolGroup")
         .field("key", &self.key)
         .field("provider_info", &self.provider_info)
         .field("pooling", &self.pooling)
         .field("disabled", &self.is_disabled())
         .field("stats", &self.stats())
         .finish()
   }
}

impl<D: Driver> Drop for ConnectionPoolGroup<D> {
   fn drop(&mut self) {
      let idle = self.idle.get_mut().len();
      if idle > 0 {
         // Sessions are dropped without a driver close; clear() first to avoid this
         error!(group = ?self.key, idle, "Pool group dropped with idle connections");
      }
   }
}
