use std::str::FromStr;

use async_trait::async_trait;
use odbc_conn_core::{ConnectionOptions, Driver, DriverError, Keyword, ProviderInfo};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};
use tracing::{debug, trace};

use crate::config::SqliteDriverConfig;
use crate::error::{DRIVER_NOT_FOUND, UNABLE_TO_CONNECT, to_driver_error};

const MEMORY_DATABASE: &str = ":memory:";

/// Driver collaborator opening one `SqliteConnection` per physical session.
///
/// Accepts connection strings of the form `Driver=SQLite;Database=<path>`,
/// where `<path>` may be `:memory:`.
#[derive(Debug, Clone, Default)]
pub struct SqliteDriver {
   config: SqliteDriverConfig,
}

impl SqliteDriver {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn with_config(config: SqliteDriverConfig) -> Self {
      Self { config }
   }

   pub fn config(&self) -> &SqliteDriverConfig {
      &self.config
   }

   /// Translate normalized options into sqlx connect options
   fn connect_options(&self, options: &ConnectionOptions) -> Result<SqliteConnectOptions, DriverError> {
      let driver = options.get(Keyword::Driver).unwrap_or_default();
      if !driver.to_ascii_lowercase().contains("sqlite") {
         return Err(
            DriverError::new(format!("driver '{driver}' is not handled by the SQLite driver"))
               .with_sqlstate(DRIVER_NOT_FOUND),
         );
      }

      let database = database_path(options).ok_or_else(|| {
         DriverError::new("connection string names no database").with_sqlstate(UNABLE_TO_CONNECT)
      })?;

      let connect_options = if database == MEMORY_DATABASE {
         SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| to_driver_error(&e))?
      } else {
         SqliteConnectOptions::new()
            .filename(database)
            .create_if_missing(self.config.create_if_missing)
      };

      Ok(connect_options.busy_timeout(self.config.busy_timeout()))
   }
}

fn database_path(options: &ConnectionOptions) -> Option<&str> {
   options
      .get(Keyword::Database)
      .filter(|path| !path.trim().is_empty())
}

#[async_trait]
impl Driver for SqliteDriver {
   type Session = SqliteConnection;

   async fn open_physical_session(
      &self,
      options: &ConnectionOptions,
   ) -> Result<SqliteConnection, DriverError> {
      let connect_options = self.connect_options(options)?;
      let mut conn = connect_options
         .connect()
         .await
         .map_err(|e| to_driver_error(&e))?;

      if self.config.enable_wal && database_path(options) != Some(MEMORY_DATABASE) {
         sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&mut conn)
            .await
            .map_err(|e| to_driver_error(&e))?;

         // https://www.sqlite.org/wal.html#performance_considerations
         sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&mut conn)
            .await
            .map_err(|e| to_driver_error(&e))?;
      }

      debug!(database = ?database_path(options), "Opened SQLite session");
      Ok(conn)
   }

   async fn close_physical_session(&self, session: SqliteConnection) -> Result<(), DriverError> {
      session.close().await.map_err(|e| to_driver_error(&e))
   }

   async fn probe_liveness(&self, session: &mut SqliteConnection) -> bool {
      match session.ping().await {
         Ok(()) => true,
         Err(e) => {
            trace!(error = %e, "SQLite session failed ping");
            false
         }
      }
   }

   fn pool_group_provider_info(&self, options: &ConnectionOptions) -> ProviderInfo {
      ProviderInfo {
         driver_name: Some("SQLite".to_string()),
         data_source: database_path(options).map(str::to_string),
      }
   }
}
