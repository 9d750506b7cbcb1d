//! # odbc-conn-sqlite
//!
//! A SQLite driver collaborator for `odbc-conn-core`, backed by SQLx.
//!
//! ## Core Types
//!
//! - **[`SqliteDriver`]**: Opens, probes and closes one `SqliteConnection` per
//!   physical session
//! - **[`SqliteDriverConfig`]**: Busy timeout, file creation and journaling settings
//! - **[`to_driver_error`]**: Maps sqlx errors onto SQLSTATE-tagged driver errors
//!
//! ## Usage
//!
//! ```no_run
//! use futures::FutureExt;
//! use odbc_conn_core::{ConnectionFactory, FactoryConfig, OdbcConnection};
//! use odbc_conn_sqlite::{SqliteDriver, to_driver_error};
//!
//! #[tokio::main]
//! async fn main() -> odbc_conn_core::Result<()> {
//!     let factory = ConnectionFactory::new(SqliteDriver::new(), FactoryConfig::default());
//!
//!     let conn = OdbcConnection::new(&factory, "Driver=SQLite;Database=example.db")?;
//!     conn.open().await?;
//!
//!     conn.with_session(|session| {
//!         async move {
//!             sqlx::query("CREATE TABLE IF NOT EXISTS users (name TEXT)")
//!                 .execute(&mut *session)
//!                 .await
//!                 .map_err(|e| to_driver_error(&e))?;
//!             Ok(())
//!         }
//!         .boxed()
//!     })
//!     .await?;
//!
//!     // Returns the session to its pool group for the next open
//!     conn.close().await?;
//!     Ok(())
//! }
//! ```
//!
mod config;
mod driver;
mod error;

// Re-export public types
pub use config::SqliteDriverConfig;
pub use driver::SqliteDriver;
pub use error::to_driver_error;
