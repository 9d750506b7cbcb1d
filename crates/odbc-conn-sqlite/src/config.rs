//! Configuration for SQLite physical sessions

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for sessions opened by [`SqliteDriver`](crate::SqliteDriver)
///
/// # Examples
///
/// ```
/// use odbc_conn_sqlite::SqliteDriverConfig;
///
/// // Use defaults
/// let config = SqliteDriverConfig::default();
///
/// // Override just one field
/// let config = SqliteDriverConfig {
///     busy_timeout_secs: 1,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteDriverConfig {
   /// How long a session waits on a locked database before failing (in seconds)
   ///
   /// Default: 5
   pub busy_timeout_secs: u64,

   /// Create the database file on first open if it does not exist
   ///
   /// Default: true
   pub create_if_missing: bool,

   /// Switch file databases to WAL journaling when a session opens
   ///
   /// Readers and the writer then no longer block each other, which matters
   /// once several pooled sessions share one file.
   ///
   /// Default: true
   pub enable_wal: bool,
}

impl Default for SqliteDriverConfig {
   fn default() -> Self {
      Self {
         busy_timeout_secs: 5,
         create_if_missing: true,
         enable_wal: true,
      }
   }
}

impl SqliteDriverConfig {
   pub fn busy_timeout(&self) -> Duration {
      Duration::from_secs(self.busy_timeout_secs)
   }
}
