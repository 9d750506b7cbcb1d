use std::sync::Arc;

use odbc_conn_core::{AllowAll, ConnectionFactory, Driver, PermissionPolicy};
use tracing::debug;

mod environment;
mod error;

pub use environment::ConnectionEnvironment;
pub use error::{Error, Result};

// The factory layer, for callers that need more than the environment exposes
pub use odbc_conn_core;
pub use odbc_conn_core::{
   ConnectionState, FactoryConfig, OdbcConnection, PermissionContext, Permission, PoolingMode,
   StateChange,
};

/// Builder for a connection environment.
///
/// Wires a driver, a permission policy and a factory configuration into one
/// explicitly owned [`ConnectionEnvironment`]. Build one per driver at the
/// application's composition root; tests build a fresh one per case.
///
/// # Example
///
/// ```no_run
/// use odbc_conn_factory::{Builder, FactoryConfig, PoolingMode};
/// use odbc_conn_sqlite::SqliteDriver;
///
/// # async fn example() -> odbc_conn_factory::Result<()> {
/// let env = Builder::new()
///     .config(FactoryConfig {
///         pooling: PoolingMode::Managed,
///         connect_timeout_secs: 5,
///         ..Default::default()
///     })
///     .build(SqliteDriver::new());
///
/// let conn = env.open("Driver=SQLite;Database=app.db").await?;
/// env.close(&conn).await?;
///
/// env.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct Builder {
   config: FactoryConfig,
   permission_policy: Option<Arc<dyn PermissionPolicy>>,
}

impl Builder {
   /// Create a new builder with the default configuration.
   pub fn new() -> Self {
      Self::default()
   }

   /// Replace the factory configuration.
   pub fn config(mut self, config: FactoryConfig) -> Self {
      self.config = config;
      self
   }

   /// Security policy consulted before every connection is bound.
   ///
   /// Defaults to allowing everything.
   pub fn permission_policy(mut self, policy: impl PermissionPolicy + 'static) -> Self {
      self.permission_policy = Some(Arc::new(policy));
      self
   }

   /// Build the environment around `driver`.
   pub fn build<D: Driver>(self, driver: D) -> ConnectionEnvironment<D> {
      let policy = self
         .permission_policy
         .unwrap_or_else(|| Arc::new(AllowAll));

      debug!(config = ?self.config, "Building connection environment");
      ConnectionEnvironment::new(ConnectionFactory::with_permission_policy(
         driver,
         self.config,
         policy,
      ))
   }
}
