//! The connection factory: caches, inner-connection lifecycle and the
//! outer/inner binding protocol.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::Result;
use crate::binding::{Binding, BindingSlot, SessionHandle};
use crate::capability::OuterConnection;
use crate::config::FactoryConfig;
use crate::connection::ConnectionState;
use crate::driver::{AllowAll, Driver, PermissionPolicy};
use crate::error::Error;
use crate::events::{StateChange, StateChangeBroker, StateChangeStream};
use crate::inner::{InnerConnection, InnerState};
use crate::options::{ConnectionOptions, KeywordPolicy};
use crate::pool_group::{ConnectionPoolGroup, ProviderInfo};
use crate::registry::{OptionsCache, PoolGroupRegistry};
use crate::sessions::SessionTable;

/// Coordinator for one driver.
///
/// Owns the options cache, the pool-group cache and the session table, and
/// is the only component that changes which inner connection an outer
/// connection is bound to. Construct one per driver at the composition root
/// and share it behind the returned `Arc`.
pub struct ConnectionFactory<D: Driver> {
   driver: Arc<D>,
   config: FactoryConfig,
   permission_policy: Arc<dyn PermissionPolicy>,
   options_cache: OptionsCache,
   pool_groups: PoolGroupRegistry<D>,
   sessions: SessionTable<Arc<InnerConnection<D>>>,
   events: StateChangeBroker,
   next_inner_id: AtomicU64,
   closed: AtomicBool,
}

impl<D: Driver> ConnectionFactory<D> {
   pub fn new(driver: D, config: FactoryConfig) -> Arc<Self> {
      Self::with_permission_policy(driver, config, Arc::new(AllowAll))
   }

   pub fn with_permission_policy(
      driver: D,
      config: FactoryConfig,
      permission_policy: Arc<dyn PermissionPolicy>,
   ) -> Arc<Self> {
      Arc::new(Self {
         driver: Arc::new(driver),
         events: StateChangeBroker::new(config.event_channel_capacity),
         config,
         permission_policy,
         options_cache: OptionsCache::default(),
         pool_groups: PoolGroupRegistry::new(),
         sessions: SessionTable::new(),
         next_inner_id: AtomicU64::new(1),
         closed: AtomicBool::new(false),
      })
   }

   pub fn driver(&self) -> &D {
      &self.driver
   }

   pub fn config(&self) -> &FactoryConfig {
      &self.config
   }

   /// Default policy for outer connections that do not carry their own
   pub fn permission_policy(&self) -> &Arc<dyn PermissionPolicy> {
      &self.permission_policy
   }

   pub fn is_closed(&self) -> bool {
      self.closed.load(Ordering::Acquire)
   }

   /// Normalize `raw` and return the shared options instance for it.
   ///
   /// With `previous` set (the reconfiguration path) the new options are
   /// parsed under the previous instance's keyword policy.
   ///
   /// # Errors
   ///
   /// Returns `Error::Configuration` if the string is malformed, empty or too long.
   pub fn get_or_create_options(
      &self,
      raw: &str,
      previous: Option<&ConnectionOptions>,
   ) -> Result<Arc<ConnectionOptions>> {
      let policy = previous.map(ConnectionOptions::policy).unwrap_or(KeywordPolicy {
         ignore_unknown: self.config.ignore_unknown_keywords,
      });
      self
         .options_cache
         .get_or_create(raw, policy, self.config.max_connection_string_len)
   }

   /// Atomic create-if-absent of the pool group for `options`.
   ///
   /// Concurrent callers for the same canonical key all receive one instance.
   ///
   /// # Errors
   ///
   /// Returns `Error::FactoryClosed` after [`shutdown`](Self::shutdown).
   pub fn get_or_create_pool_group(
      &self,
      options: &Arc<ConnectionOptions>,
   ) -> Result<Arc<ConnectionPoolGroup<D>>> {
      if self.is_closed() {
         return Err(Error::FactoryClosed);
      }

      Ok(self.pool_groups.get_or_create(options.canonical_key(), || {
         ConnectionPoolGroup::new(
            Arc::clone(options),
            self.pool_group_provider_info(options),
            &self.config,
         )
      }))
   }

   /// Provider metadata for a new pool group. Called once per group.
   pub fn pool_group_provider_info(&self, options: &ConnectionOptions) -> ProviderInfo {
      self.driver.pool_group_provider_info(options)
   }

   /// Allocate an inner connection for `options` in the outer's pool group.
   ///
   /// The physical session is not established; the inner connection stays
   /// `Created` until it is opened.
   ///
   /// # Errors
   ///
   /// Returns `Error::ConnectionCreation` if the options cannot be used to
   /// establish a session.
   pub fn create_inner_connection(
      &self,
      outer: &dyn OuterConnection<D>,
      options: &Arc<ConnectionOptions>,
   ) -> Result<Arc<InnerConnection<D>>> {
      let group = self.resolve_pool_group(outer, options)?;
      let inner = self.allocate_inner(options, &group)?;
      trace!(
         connection_id = %outer.connection_id(),
         inner_id = inner.id(),
         "Created inner connection"
      );
      Ok(inner)
   }

   fn allocate_inner(
      &self,
      options: &Arc<ConnectionOptions>,
      group: &Arc<ConnectionPoolGroup<D>>,
   ) -> Result<Arc<InnerConnection<D>>> {
      options.validate_for_connect()?;
      let id = self.next_inner_id.fetch_add(1, Ordering::Relaxed);
      Ok(Arc::new(InnerConnection::new(id, Arc::clone(options), group)))
   }

   /// Reuse the outer's cached group if it still matches, otherwise resolve a fresh one
   fn resolve_pool_group(
      &self,
      outer: &dyn OuterConnection<D>,
      options: &Arc<ConnectionOptions>,
   ) -> Result<Arc<ConnectionPoolGroup<D>>> {
      if let Some(group) = outer.pool_group()
         && !group.is_disabled()
         && group.key() == options.canonical_key()
      {
         return Ok(group);
      }

      let group = self.get_or_create_pool_group(options)?;
      outer.set_pool_group(Some(Arc::clone(&group)));
      Ok(group)
   }

   /// Forward a security check to the outer connection's own policy
   pub fn permission_demand(&self, outer: &dyn OuterConnection<D>) -> Result<()> {
      outer.permission_demand()
   }

   /// The inner connection currently bound to `outer`, if any
   pub fn get_inner_connection(
      &self,
      outer: &dyn OuterConnection<D>,
   ) -> Option<Arc<InnerConnection<D>>> {
      outer
         .binding_slot()
         .load()
         .handle()
         .and_then(|handle| self.sessions.get(handle))
   }

   /// Observable state of `outer`, derived from its binding and inner connection
   pub fn connection_state(&self, outer: &dyn OuterConnection<D>) -> ConnectionState {
      match outer.binding_slot().load() {
         Binding::Unbound => ConnectionState::Closed,
         Binding::Binding => ConnectionState::Connecting,
         Binding::Unbinding => ConnectionState::Closing,
         Binding::Bound(handle) => match self.sessions.get(handle).map(|inner| inner.state()) {
            Some(InnerState::Open) => ConnectionState::Open,
            Some(InnerState::Busy) => ConnectionState::Executing,
            Some(InnerState::Created) => ConnectionState::Connecting,
            Some(InnerState::Broken | InnerState::Closed) => ConnectionState::Broken,
            // Rebound between the two loads
            None => ConnectionState::Closing,
         },
      }
   }

   /// Bind an open inner connection to an unbound outer connection.
   ///
   /// Only `Unbound` is accepted: an outer connection in `Binding` belongs to
   /// the open that claimed it. A rejected inner connection is returned to
   /// its pool group, or torn down, before the error is reported.
   ///
   /// # Errors
   ///
   /// Returns `Error::InvalidState` if the outer connection is not unbound
   /// or the inner connection is not open.
   pub async fn bind(
      self: &Arc<Self>,
      outer: &dyn OuterConnection<D>,
      inner: Arc<InnerConnection<D>>,
   ) -> Result<SessionHandle> {
      let state = inner.state();
      if state != InnerState::Open {
         self.release_detached(inner).await;
         return Err(Error::InvalidState(format!(
            "cannot bind inner connection in state {state:?}"
         )));
      }

      let handle = match self.sessions.insert(Arc::clone(&inner)) {
         Ok(handle) => handle,
         Err(e) => {
            self.release_detached(inner).await;
            return Err(e);
         }
      };

      let slot = outer.binding_slot();
      if slot.compare_and_set(Binding::Unbound, Binding::Bound(handle)) {
         self.events.publish(
            outer.connection_id(),
            ConnectionState::Closed,
            ConnectionState::Open,
         );
         return Ok(handle);
      }

      self.sessions.remove(handle);
      let current = slot.load();
      self.release_detached(inner).await;
      Err(Error::InvalidState(format!(
         "connection is {current:?}, expected it to be unbound"
      )))
   }

   /// Detach the inner connection bound under `from` and return it to its group.
   ///
   /// Returns false, changing nothing, if `outer` is no longer bound under
   /// `from`. Exactly one caller wins the unbind of a given binding. The
   /// release runs to completion even if this future is dropped.
   pub async fn unbind(self: &Arc<Self>, outer: &dyn OuterConnection<D>, from: SessionHandle) -> bool {
      let slot = Arc::clone(outer.binding_slot());
      if !slot.compare_and_set(Binding::Bound(from), Binding::Unbinding) {
         return false;
      }

      let inner = self.sessions.remove(from);
      let factory = Arc::clone(self);
      let release_slot = Arc::clone(&slot);
      let task = tokio::spawn(async move {
         if let Some(inner) = inner {
            factory.release_inner(inner).await;
         }
         release_slot.compare_and_set(Binding::Unbinding, Binding::Unbound);
      });

      if let Err(e) = task.await {
         error!(connection_id = %outer.connection_id(), error = %e, "Release task failed");
         slot.compare_and_set(Binding::Unbinding, Binding::Unbound);
      }
      true
   }

   /// Compare-and-set on the outer connection's binding.
   ///
   /// Succeeds only if `outer` is bound exactly as `from`; otherwise returns
   /// false and leaves the binding untouched. The caller owns whatever the
   /// session table entries behind `from` and `to` imply.
   pub fn swap(&self, outer: &dyn OuterConnection<D>, from: Binding, to: Binding) -> bool {
      outer.binding_slot().compare_and_set(from, to)
   }

   /// Replace the inner connection bound under `from` with `to`.
   ///
   /// On success the replaced inner connection is returned to its group. On
   /// a lost race the binding is left as it was, `to` is returned to its
   /// group instead, and false is returned.
   ///
   /// # Errors
   ///
   /// Returns `Error::InvalidState` if `to` is not open; `to` is released
   /// all the same.
   pub async fn swap_inner(
      self: &Arc<Self>,
      outer: &dyn OuterConnection<D>,
      from: SessionHandle,
      to: Arc<InnerConnection<D>>,
   ) -> Result<bool> {
      let state = to.state();
      if state != InnerState::Open {
         self.release_detached(to).await;
         return Err(Error::InvalidState(format!(
            "cannot swap in inner connection in state {state:?}"
         )));
      }

      let to_id = to.id();
      let handle = match self.sessions.insert(Arc::clone(&to)) {
         Ok(handle) => handle,
         Err(e) => {
            self.release_detached(to).await;
            return Err(e);
         }
      };

      if !self.swap(outer, Binding::Bound(from), Binding::Bound(handle)) {
         self.sessions.remove(handle);
         trace!(
            connection_id = %outer.connection_id(),
            inner_id = to_id,
            "Lost swap; returning candidate to its pool group"
         );
         self.release_detached(to).await;
         return Ok(false);
      }

      if let Some(replaced) = self.sessions.remove(from) {
         debug!(
            connection_id = %outer.connection_id(),
            from = replaced.id(),
            to = to_id,
            "Swapped inner connection"
         );
         self.release_detached(replaced).await;
      }
      Ok(true)
   }

   /// Obtain an open inner connection for the outer's current options.
   ///
   /// Tries the pool group first and falls back to establishing a new
   /// physical session. The work runs on its own task: if this future is
   /// dropped or the outer's connect timeout expires, the connection that
   /// eventually arrives is torn down instead of being left bound to nothing.
   ///
   /// # Errors
   ///
   /// Returns `Error::Timeout`, `Error::ConnectionCreation` or
   /// `Error::FactoryClosed`.
   pub async fn obtain_inner_connection(
      self: &Arc<Self>,
      outer: &dyn OuterConnection<D>,
   ) -> Result<Arc<InnerConnection<D>>> {
      let options = outer.options();
      let group = self.resolve_pool_group(outer, &options)?;
      let timeout = outer.connect_timeout();

      let (tx, rx) = oneshot::channel();
      let factory = Arc::clone(self);
      tokio::spawn(async move {
         let result = factory.acquire_or_create(&group, &options).await;
         if let Err(Ok(orphan)) = tx.send(result) {
            debug!(inner_id = orphan.id(), "Caller gave up waiting; tearing down connection");
            group.discard(orphan, &factory.driver).await;
         }
      });

      match tokio::time::timeout(timeout, rx).await {
         Ok(Ok(result)) => result,
         Ok(Err(_)) => Err(Error::creation("connection task ended before reporting")),
         Err(_) => {
            warn!(connection_id = %outer.connection_id(), ?timeout, "Timed out obtaining connection");
            Err(Error::Timeout(timeout))
         }
      }
   }

   async fn acquire_or_create(
      &self,
      group: &Arc<ConnectionPoolGroup<D>>,
      options: &Arc<ConnectionOptions>,
   ) -> Result<Arc<InnerConnection<D>>> {
      if let Some(inner) = group.acquire(&self.driver).await {
         return Ok(inner);
      }

      let inner = self.allocate_inner(options, group)?;
      inner.open(&self.driver).await?;
      group.record_created();
      Ok(inner)
   }

   async fn release_inner(&self, inner: Arc<InnerConnection<D>>) {
      match inner.pool_group() {
         Some(group) => group.release(inner, &self.driver).await,
         None => inner.teardown(&self.driver).await,
      }
   }

   /// Release on a task of its own, so dropping the caller cannot cut it short
   async fn release_detached(self: &Arc<Self>, inner: Arc<InnerConnection<D>>) {
      let inner_id = inner.id();
      let factory = Arc::clone(self);
      if let Err(e) = tokio::spawn(async move { factory.release_inner(inner).await }).await {
         error!(inner_id, error = %e, "Release task failed");
      }
   }

   /// Open `outer`: resolve its pool group, obtain an inner connection and bind it.
   ///
   /// # Errors
   ///
   /// Returns `Error::InvalidState` if `outer` is already open or opening,
   /// `Error::PermissionDenied` if the security check fails, and any error
   /// from [`obtain_inner_connection`](Self::obtain_inner_connection).
   pub async fn open_connection(self: &Arc<Self>, outer: &dyn OuterConnection<D>) -> Result<()> {
      if self.is_closed() {
         return Err(Error::FactoryClosed);
      }
      let claim = BindingClaim::acquire(self, outer)?;
      self.open_claimed(outer, claim).await
   }

   async fn open_claimed(
      self: &Arc<Self>,
      outer: &dyn OuterConnection<D>,
      mut claim: BindingClaim<'_, D>,
   ) -> Result<()> {
      claim.announce();
      self.permission_demand(outer)?;

      let inner = self.obtain_inner_connection(outer).await?;
      let inner_id = inner.id();

      // No await from here on: the inner connection is in the table and
      // bound, or released, before this future can be dropped again
      let handle = match self.sessions.insert(Arc::clone(&inner)) {
         Ok(handle) => handle,
         Err(e) => {
            let factory = Arc::clone(self);
            tokio::spawn(async move { factory.release_inner(inner).await });
            return Err(e);
         }
      };
      if !claim.complete(handle) {
         self.sessions.remove(handle);
         let factory = Arc::clone(self);
         tokio::spawn(async move { factory.release_inner(inner).await });
         return Err(Error::InvalidState(
            "binding changed while the connection was opening".into(),
         ));
      }

      self.events.publish(
         outer.connection_id(),
         ConnectionState::Connecting,
         ConnectionState::Open,
      );
      debug!(
         connection_id = %outer.connection_id(),
         inner_id,
         options = %outer.options().redacted(),
         "Connection opened"
      );
      Ok(())
   }

   /// Close `outer`, returning its inner connection to the pool group.
   ///
   /// Closing an unbound connection is a no-op. Closing one that another
   /// task is already closing waits for that close to finish.
   ///
   /// # Errors
   ///
   /// Returns `Error::InvalidState` if an open is still in progress.
   pub async fn close_connection(self: &Arc<Self>, outer: &dyn OuterConnection<D>) -> Result<()> {
      loop {
         match outer.binding_slot().load() {
            Binding::Unbound => return Ok(()),
            Binding::Unbinding => {
               outer.binding_slot().unbinding_finished().await;
               return Ok(());
            }
            Binding::Binding => {
               return Err(Error::InvalidState(
                  "cannot close a connection that is still opening".into(),
               ));
            }
            Binding::Bound(handle) => {
               let original = self.connection_state(outer);
               if self.unbind(outer, handle).await {
                  self.events
                     .publish(outer.connection_id(), original, ConnectionState::Closed);
                  debug!(connection_id = %outer.connection_id(), "Connection closed");
                  return Ok(());
               }
               // Lost to a concurrent close or swap; look again
            }
         }
      }
   }

   /// Point `outer` at a new connection string.
   ///
   /// The old inner connection is fully unbound before the new options are
   /// installed. A connection that was open is reopened against the new
   /// pool group.
   ///
   /// # Errors
   ///
   /// Returns `Error::Configuration` for an invalid string, leaving `outer`
   /// untouched, or any error from closing or reopening.
   pub async fn reconfigure_connection(
      self: &Arc<Self>,
      outer: &dyn OuterConnection<D>,
      raw: &str,
   ) -> Result<()> {
      let previous = outer.options();
      let options = self.get_or_create_options(raw, Some(&*previous))?;
      let was_open = matches!(outer.binding_slot().load(), Binding::Bound(_));

      self.close_connection(outer).await?;

      let claim = BindingClaim::acquire(self, outer)?;
      outer.set_options(options);
      outer.set_pool_group(None);
      debug!(connection_id = %outer.connection_id(), was_open, "Connection reconfigured");

      if was_open {
         self.open_claimed(outer, claim).await
      } else {
         drop(claim);
         Ok(())
      }
   }

   /// Disable the pool group for `options` and tear down its idle members.
   ///
   /// Outer connections still bound to one of its inner connections keep
   /// working; those inner connections are torn down on release.
   pub async fn clear_pool(&self, options: &ConnectionOptions) -> usize {
      match self.pool_groups.remove(options.canonical_key()) {
         Some(group) => self.retire_group(&group).await,
         None => 0,
      }
   }

   /// [`clear_pool`](Self::clear_pool) for every group. Returns idle members torn down.
   pub async fn clear_all_pools(&self) -> usize {
      let mut cleared = 0;
      for group in self.pool_groups.drain() {
         cleared += self.retire_group(&group).await;
      }
      cleared
   }

   async fn retire_group(&self, group: &ConnectionPoolGroup<D>) -> usize {
      group.disable();
      let cleared = group.clear(&self.driver).await;
      debug!(group = ?group.key(), cleared, "Pool group cleared");
      cleared
   }

   /// Refuse further opens and clear every pool group.
   ///
   /// Connections that are still open remain usable until closed.
   pub async fn shutdown(&self) {
      if self.closed.swap(true, Ordering::AcqRel) {
         return;
      }
      let cleared = self.clear_all_pools().await;
      debug!(cleared, open = self.sessions.len(), "Connection factory shut down");
   }

   pub fn subscribe_state_changes(&self) -> tokio::sync::broadcast::Receiver<StateChange> {
      self.events.subscribe()
   }

   /// State changes as a stream, optionally limited to one connection
   pub fn state_change_stream(&self, connection_id: Option<Uuid>) -> StateChangeStream {
      let stream = StateChangeStream::new(self.events.subscribe());
      match connection_id {
         Some(id) => stream.for_connection(id),
         None => stream,
      }
   }

   pub(crate) fn publish_state_change(
      &self,
      connection_id: Uuid,
      original: ConnectionState,
      current: ConnectionState,
   ) {
      self.events.publish(connection_id, original, current);
   }

   pub fn pool_group_count(&self) -> usize {
      self.pool_groups.len()
   }

   pub fn cached_options_count(&self) -> usize {
      self.options_cache.len()
   }

   /// Inner connections currently bound to an outer connection
   pub fn open_session_count(&self) -> usize {
      self.sessions.len()
   }

   /// The inner connection stored under `handle`, if the handle is still current
   pub(crate) fn session(&self, handle: SessionHandle) -> Option<Arc<InnerConnection<D>>> {
      self.sessions.get(handle)
   }

   /// Release the inner connection of an outer connection dropped while bound.
   ///
   /// The caller has already moved the binding to `Unbinding`.
   pub(crate) fn release_abandoned(self: &Arc<Self>, connection_id: Uuid, handle: SessionHandle) {
      let Some(inner) = self.sessions.remove(handle) else {
         return;
      };
      self.events
         .publish(connection_id, ConnectionState::Open, ConnectionState::Closed);

      match tokio::runtime::Handle::try_current() {
         Ok(runtime) => {
            debug!(%connection_id, inner_id = inner.id(), "Releasing connection dropped while open");
            let factory = Arc::clone(self);
            runtime.spawn(async move { factory.release_inner(inner).await });
         }
         Err(_) => {
            inner.mark_broken();
            warn!(
               %connection_id,
               inner_id = inner.id(),
               "Connection dropped while open outside a runtime; session closed without the driver"
            );
         }
      }
   }
}

impl<D: Driver> std::fmt::Debug for ConnectionFactory<D> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ConnectionFactory")
         .field("config", &self.config)
         .field("pool_groups", &self.pool_groups.len())
         .field("open_sessions", &self.sessions.len())
         .field("closed", &self.is_closed())
         .finish()
   }
}

/// Exclusive claim on an outer connection's `Unbound → Binding` transition.
///
/// Dropping the claim without completing it reverts the binding to
/// `Unbound`, so a failed or cancelled open leaves the connection closed.
struct BindingClaim<'a, D: Driver> {
   factory: &'a ConnectionFactory<D>,
   slot: &'a BindingSlot,
   connection_id: Uuid,
   announced: bool,
   completed: bool,
}

impl<'a, D: Driver> BindingClaim<'a, D> {
   fn acquire(factory: &'a ConnectionFactory<D>, outer: &'a dyn OuterConnection<D>) -> Result<Self> {
      let slot: &BindingSlot = outer.binding_slot();
      if !slot.compare_and_set(Binding::Unbound, Binding::Binding) {
         return Err(Error::InvalidState(match slot.load() {
            Binding::Binding => "connection is already opening".to_string(),
            Binding::Unbinding => "connection is closing".to_string(),
            _ => "connection is already open".to_string(),
         }));
      }
      Ok(Self {
         factory,
         slot,
         connection_id: outer.connection_id(),
         announced: false,
         completed: false,
      })
   }

   fn announce(&mut self) {
      self.announced = true;
      self.factory.events.publish(
         self.connection_id,
         ConnectionState::Closed,
         ConnectionState::Connecting,
      );
   }

   fn complete(mut self, handle: SessionHandle) -> bool {
      self.completed = self
         .slot
         .compare_and_set(Binding::Binding, Binding::Bound(handle));
      self.completed
   }
}

impl<D: Driver> Drop for BindingClaim<'_, D> {
   fn drop(&mut self) {
      if self.completed {
         return;
      }
      self.slot.compare_and_set(Binding::Binding, Binding::Unbound);
      if self.announced {
         self.factory.events.publish(
            self.connection_id,
            ConnectionState::Connecting,
            ConnectionState::Closed,
         );
      }
   }
}
