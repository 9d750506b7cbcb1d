//! Inner connections: one physical session each

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::Result;
use crate::driver::Driver;
use crate::error::{DriverError, Error};
use crate::options::ConnectionOptions;
use crate::pool_group::ConnectionPoolGroup;

/// Lifecycle state of an inner connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum InnerState {
   /// Allocated, physical session not yet established
   Created = 0,
   Open = 1,
   /// Running caller work on its session
   Busy = 2,
   /// Physical session torn down; never reused
   Closed = 3,
   /// Failed a liveness probe or reported an I/O failure
   Broken = 4,
}

impl InnerState {
   fn from_u8(value: u8) -> Self {
      match value {
         0 => Self::Created,
         1 => Self::Open,
         2 => Self::Busy,
         3 => Self::Closed,
         _ => Self::Broken,
      }
   }
}

/// One physical session to the backing system.
///
/// Owned by exactly one outer connection while Open or Busy, ownerless while
/// idle in its pool group.
pub struct InnerConnection<D: Driver> {
   id: u64,
   options: Arc<ConnectionOptions>,
   group: Weak<ConnectionPoolGroup<D>>,
   state: AtomicU8,
   pooled: AtomicBool,
   session: Mutex<Option<D::Session>>,
   created_at: Instant,
}

impl<D: Driver> InnerConnection<D> {
   pub(crate) fn new(
      id: u64,
      options: Arc<ConnectionOptions>,
      group: &Arc<ConnectionPoolGroup<D>>,
   ) -> Self {
      Self {
         id,
         options,
         group: Arc::downgrade(group),
         state: AtomicU8::new(InnerState::Created as u8),
         pooled: AtomicBool::new(false),
         session: Mutex::new(None),
         created_at: Instant::now(),
      }
   }

   pub fn id(&self) -> u64 {
      self.id
   }

   pub fn options(&self) -> &Arc<ConnectionOptions> {
      &self.options
   }

   /// The pool group this connection was created for, if it still exists
   pub fn pool_group(&self) -> Option<Arc<ConnectionPoolGroup<D>>> {
      self.group.upgrade()
   }

   pub fn state(&self) -> InnerState {
      InnerState::from_u8(self.state.load(Ordering::Acquire))
   }

   pub fn created_at(&self) -> Instant {
      self.created_at
   }

   pub(crate) fn transition(&self, from: InnerState, to: InnerState) -> bool {
      self
         .state
         .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
         .is_ok()
   }

   /// Mark the connection unusable. A closed connection stays closed.
   ///
   /// Returns true if this call performed the transition.
   pub fn mark_broken(&self) -> bool {
      let mut current = self.state.load(Ordering::Acquire);
      loop {
         let state = InnerState::from_u8(current);
         if matches!(state, InnerState::Closed | InnerState::Broken) {
            return false;
         }
         match self.state.compare_exchange(
            current,
            InnerState::Broken as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
         ) {
            Ok(_) => {
               debug!(inner_id = self.id, from = ?state, "Inner connection marked broken");
               return true;
            }
            Err(actual) => current = actual,
         }
      }
   }

   /// Flag the connection as sitting in its group's idle set.
   ///
   /// Returns false if it was already idle, which would be a double release.
   pub(crate) fn set_pooled(&self, pooled: bool) -> bool {
      self.pooled.swap(pooled, Ordering::AcqRel) != pooled
   }

   /// Establish the physical session through the driver
   pub(crate) async fn open(&self, driver: &D) -> Result<()> {
      if self.state() != InnerState::Created {
         return Err(Error::InvalidState(format!(
            "inner connection {} was already opened",
            self.id
         )));
      }

      match driver.open_physical_session(&self.options).await {
         Ok(session) => {
            // Freshly created and not yet shared, so the lock is uncontended
            *self.session.lock().await = Some(session);
            self.transition(InnerState::Created, InnerState::Open);
            debug!(inner_id = self.id, "Physical session established");
            Ok(())
         }
         Err(e) => {
            self
               .state
               .store(InnerState::Closed as u8, Ordering::Release);
            Err(Error::ConnectionCreation {
               reason: format!(
                  "driver could not open a session for {}",
                  self.options.data_source().unwrap_or("<unnamed data source>")
               ),
               source: Some(e),
            })
         }
      }
   }

   /// Run the driver's liveness probe against the session
   pub(crate) async fn probe(&self, driver: &D) -> bool {
      let mut session = self.session.lock().await;
      match session.as_mut() {
         Some(session) => driver.probe_liveness(session).await,
         None => false,
      }
   }

   /// Close the physical session. Safe to call more than once.
   pub(crate) async fn teardown(&self, driver: &D) {
      let session = self.session.lock().await.take();
      self
         .state
         .store(InnerState::Closed as u8, Ordering::Release);

      if let Some(session) = session {
         match driver.close_physical_session(session).await {
            Ok(()) => trace!(inner_id = self.id, "Physical session closed"),
            Err(e) => warn!(inner_id = self.id, error = %e, "Driver failed to close physical session"),
         }
      }
   }

   /// Run caller work against the session, moving Open → Busy → Open.
   ///
   /// `still_owned` is checked once the connection is Busy; if the caller
   /// lost the connection before that, nothing runs. A connection-failure
   /// error leaves the connection Broken. If the returned future is dropped
   /// mid-operation the session state is unknown, so the connection is
   /// marked Broken as well.
   pub(crate) async fn run<T, F, O>(&self, still_owned: O, f: F) -> Result<T>
   where
      T: Send,
      F: for<'s> FnOnce(&'s mut D::Session) -> BoxFuture<'s, std::result::Result<T, DriverError>>
         + Send,
      O: FnOnce() -> bool + Send,
   {
      if !self.transition(InnerState::Open, InnerState::Busy) {
         return Err(match self.state() {
            InnerState::Broken => Error::BrokenConnection(
               DriverError::new("connection was previously marked broken").fatal(),
            ),
            InnerState::Busy => {
               Error::InvalidState("connection is busy with another operation".into())
            }
            state => Error::InvalidState(format!("inner connection is {state:?}")),
         });
      }

      let guard = BusyGuard {
         inner: self,
         finished: false,
      };

      // A close may have released this connection between lookup and Busy
      if !still_owned() {
         guard.finish(InnerState::Open);
         return Err(Error::InvalidState(
            "connection was closed before the operation started".into(),
         ));
      }

      let mut session = self.session.lock().await;
      let Some(session) = session.as_mut() else {
         guard.finish(InnerState::Broken);
         return Err(Error::BrokenConnection(
            DriverError::new("physical session is gone").fatal(),
         ));
      };

      match f(session).await {
         Ok(value) => {
            guard.finish(InnerState::Open);
            Ok(value)
         }
         Err(e) if e.is_connection_failure() => {
            guard.finish(InnerState::Broken);
            Err(Error::BrokenConnection(e))
         }
         Err(e) => {
            guard.finish(InnerState::Open);
            Err(Error::Driver(e))
         }
      }
   }
}

impl<D: Driver> std::fmt::Debug for InnerConnection<D> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("InnerConnection")
         .field("id", &self.id)
         .field("state", &self.state())
         .field("pooled", &self.pooled.load(Ordering::Relaxed))
         .finish()
   }
}

struct BusyGuard<'a, D: Driver> {
   inner: &'a InnerConnection<D>,
   finished: bool,
}

impl<D: Driver> BusyGuard<'_, D> {
   fn finish(mut self, to: InnerState) {
      self.finished = true;
      if to == InnerState::Broken {
         self.inner.mark_broken();
      } else {
         // Fails harmlessly if a concurrent close already tore the session down
         self.inner.transition(InnerState::Busy, to);
      }
   }
}

impl<D: Driver> Drop for BusyGuard<'_, D> {
   fn drop(&mut self) {
      if !self.finished {
         warn!(inner_id = self.inner.id, "Operation abandoned mid-flight; marking connection broken");
         self.inner.mark_broken();
      }
   }
}
