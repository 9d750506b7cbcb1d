//! The outer connection: a stable, user-visible handle

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::Result;
use crate::binding::{Binding, BindingSlot, SessionHandle};
use crate::capability::{InnerConnectionHolder, OuterConnection, PermissionCheckable, PoolGroupHolder};
use crate::driver::{Driver, Permission, PermissionContext, PermissionPolicy};
use crate::error::{DriverError, Error};
use crate::factory::ConnectionFactory;
use crate::inner::InnerConnection;
use crate::options::ConnectionOptions;
use crate::pool_group::ConnectionPoolGroup;

/// Caller-visible state of an outer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
   Closed,
   Connecting,
   Open,
   /// Running work on its session
   Executing,
   /// Bound to an inner connection that failed; close it and open again
   Broken,
   Closing,
}

struct Shared<D: Driver> {
   id: Uuid,
   factory: Arc<ConnectionFactory<D>>,
   binding: Arc<BindingSlot>,
   options: RwLock<Arc<ConnectionOptions>>,
   pool_group: RwLock<Option<Arc<ConnectionPoolGroup<D>>>>,
   connect_timeout: RwLock<Duration>,
   permission_policy: RwLock<Option<Arc<dyn PermissionPolicy>>>,
}

/// A connection handle whose identity survives open, close and reconfigure.
///
/// Clones share one identity and one binding. Dropping the last clone while
/// open returns the inner connection to its pool group.
///
/// # Example
///
/// ```ignore
/// let conn = OdbcConnection::new(&factory, "Driver=X;Server=s1;UID=u")?;
/// conn.open().await?;
/// conn.close().await?;
/// ```
pub struct OdbcConnection<D: Driver> {
   shared: Arc<Shared<D>>,
}

impl<D: Driver> Clone for OdbcConnection<D> {
   fn clone(&self) -> Self {
      Self {
         shared: Arc::clone(&self.shared),
      }
   }
}

impl<D: Driver> OdbcConnection<D> {
   /// Create a closed connection for `connection_string`.
   ///
   /// # Errors
   ///
   /// Returns `Error::Configuration` if the string does not normalize.
   pub fn new(factory: &Arc<ConnectionFactory<D>>, connection_string: &str) -> Result<Self> {
      let options = factory.get_or_create_options(connection_string, None)?;
      Ok(Self {
         shared: Arc::new(Shared {
            id: Uuid::new_v4(),
            factory: Arc::clone(factory),
            binding: Arc::new(BindingSlot::new()),
            options: RwLock::new(options),
            pool_group: RwLock::new(None),
            connect_timeout: RwLock::new(factory.config().connect_timeout()),
            permission_policy: RwLock::new(None),
         }),
      })
   }

   pub fn id(&self) -> Uuid {
      self.shared.id
   }

   pub fn factory(&self) -> &Arc<ConnectionFactory<D>> {
      &self.shared.factory
   }

   pub fn state(&self) -> ConnectionState {
      self.shared.factory.connection_state(self)
   }

   pub fn binding(&self) -> Binding {
      self.shared.binding.load()
   }

   pub fn set_connect_timeout(&self, timeout: Duration) {
      *self.shared.connect_timeout.write() = timeout;
   }

   /// Use `policy` for this connection instead of the factory default
   pub fn set_permission_policy(&self, policy: Arc<dyn PermissionPolicy>) {
      *self.shared.permission_policy.write() = Some(policy);
   }

   pub async fn open(&self) -> Result<()> {
      self.shared.factory.open_connection(self).await
   }

   /// Close the connection. Closing a closed connection does nothing.
   pub async fn close(&self) -> Result<()> {
      self.shared.factory.close_connection(self).await
   }

   pub async fn reconfigure(&self, connection_string: &str) -> Result<()> {
      self
         .shared
         .factory
         .reconfigure_connection(self, connection_string)
         .await
   }

   /// Run `f` against the bound physical session.
   ///
   /// # Errors
   ///
   /// Returns `Error::InvalidState` if the connection is not open,
   /// `Error::BrokenConnection` if the driver reports a connection failure
   /// (the connection must then be closed), or `Error::Driver` for any other
   /// driver error.
   pub async fn with_session<T, F>(&self, f: F) -> Result<T>
   where
      T: Send,
      F: for<'s> FnOnce(&'s mut D::Session) -> BoxFuture<'s, std::result::Result<T, DriverError>>
         + Send,
   {
      let Binding::Bound(handle) = self.shared.binding.load() else {
         return Err(Error::InvalidState("connection is not open".into()));
      };
      let inner = self
         .shared
         .factory
         .session(handle)
         .ok_or_else(|| Error::InvalidState("connection is not open".into()))?;

      self.run_bound(&inner, handle, f).await
   }

   async fn run_bound<T, F>(
      &self,
      inner: &InnerConnection<D>,
      handle: SessionHandle,
      f: F,
   ) -> Result<T>
   where
      T: Send,
      F: for<'s> FnOnce(&'s mut D::Session) -> BoxFuture<'s, std::result::Result<T, DriverError>>
         + Send,
   {
      let binding = &self.shared.binding;
      let result = inner
         .run(|| binding.load() == Binding::Bound(handle), f)
         .await;

      if let Err(Error::BrokenConnection(e)) = &result {
         warn!(connection_id = %self.id(), error = %e, "Connection broken");
         self.shared.factory.publish_state_change(
            self.id(),
            ConnectionState::Open,
            ConnectionState::Broken,
         );
      }
      result
   }
}

impl<D: Driver> InnerConnectionHolder for OdbcConnection<D> {
   fn connection_id(&self) -> Uuid {
      self.shared.id
   }

   fn binding_slot(&self) -> &Arc<BindingSlot> {
      &self.shared.binding
   }
}

impl<D: Driver> PoolGroupHolder<D> for OdbcConnection<D> {
   fn pool_group(&self) -> Option<Arc<ConnectionPoolGroup<D>>> {
      self.shared.pool_group.read().clone()
   }

   fn set_pool_group(&self, group: Option<Arc<ConnectionPoolGroup<D>>>) {
      *self.shared.pool_group.write() = group;
   }
}

impl<D: Driver> PermissionCheckable for OdbcConnection<D> {
   fn permission_demand(&self) -> Result<()> {
      let policy = self
         .shared
         .permission_policy
         .read()
         .clone()
         .unwrap_or_else(|| Arc::clone(self.shared.factory.permission_policy()));
      let options = self.options();
      let context = PermissionContext {
         connection_id: self.shared.id,
         options: &options,
      };

      match policy.check_permission(&context) {
         Permission::Allow => Ok(()),
         Permission::Deny(reason) => {
            trace!(connection_id = %self.shared.id, %reason, "Permission denied");
            Err(Error::PermissionDenied(reason))
         }
      }
   }
}

impl<D: Driver> OuterConnection<D> for OdbcConnection<D> {
   fn options(&self) -> Arc<ConnectionOptions> {
      Arc::clone(&self.shared.options.read())
   }

   fn set_options(&self, options: Arc<ConnectionOptions>) {
      *self.shared.options.write() = options;
   }

   fn connect_timeout(&self) -> Duration {
      *self.shared.connect_timeout.read()
   }
}

impl<D: Driver> std::fmt::Debug for OdbcConnection<D> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("OdbcConnection")
         .field("id", &self.shared.id)
         .field("binding", &self.shared.binding.load())
         .field("options", &*self.shared.options.read())
         .finish()
   }
}

impl<D: Driver> Drop for Shared<D> {
   fn drop(&mut self) {
      if let Binding::Bound(handle) = self.binding.load()
         && self
            .binding
            .compare_and_set(Binding::Bound(handle), Binding::Unbinding)
      {
         self.factory.release_abandoned(self.id, handle);
      }
   }
}

#[cfg(test)]
mod tests {
   use async_trait::async_trait;
   use futures::FutureExt;

   use super::*;
   use crate::config::FactoryConfig;
   use crate::inner::InnerState;

   struct NullDriver;

   #[async_trait]
   impl Driver for NullDriver {
      type Session = ();

      async fn open_physical_session(
         &self,
         _options: &ConnectionOptions,
      ) -> std::result::Result<(), DriverError> {
         Ok(())
      }

      async fn close_physical_session(&self, _session: ()) -> std::result::Result<(), DriverError> {
         Ok(())
      }

      async fn probe_liveness(&self, _session: &mut ()) -> bool {
         true
      }
   }

   #[tokio::test]
   async fn test_session_work_refused_after_close_wins_the_race() {
      let factory = ConnectionFactory::new(NullDriver, FactoryConfig::default());
      let conn = OdbcConnection::new(&factory, "Driver=X;Server=s1").unwrap();
      conn.open().await.unwrap();

      // Resolve the inner connection as with_session does, then lose it to a close
      let Binding::Bound(handle) = conn.binding() else {
         panic!("connection should be bound after open");
      };
      let inner = factory.session(handle).unwrap();
      conn.close().await.unwrap();
      let group = conn.pool_group().unwrap();
      assert_eq!(group.idle_count(), 1);

      let err = conn
         .run_bound(&inner, handle, |_| async { Ok::<_, DriverError>(()) }.boxed())
         .await
         .unwrap_err();

      assert!(matches!(err, Error::InvalidState(_)));
      // Still idle and healthy, ready for the next owner
      assert_eq!(inner.state(), InnerState::Open);
      assert_eq!(group.idle_count(), 1);

      conn.open().await.unwrap();
      assert_eq!(group.stats().reused, 1);
      conn
         .with_session(|_| async { Ok::<_, DriverError>(()) }.boxed())
         .await
         .unwrap();
   }
}
