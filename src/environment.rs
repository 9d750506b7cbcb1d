use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use odbc_conn_core::{
   ConnectionFactory, ConnectionState, Driver, OdbcConnection, PoolGroupHolder, PoolGroupStats,
   StateChangeStream,
};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Connections handed out by an environment, in the order they were opened.
type Tracked<D> = Arc<RwLock<IndexMap<Uuid, OdbcConnection<D>>>>;

/// The caller-facing surface over one connection factory.
///
/// Owns the factory it was built with and keeps track of every connection it
/// opened, so they can all be closed together on shutdown. Clones share the
/// same factory and tracking.
pub struct ConnectionEnvironment<D: Driver> {
   factory: Arc<ConnectionFactory<D>>,
   connections: Tracked<D>,
}

impl<D: Driver> Clone for ConnectionEnvironment<D> {
   fn clone(&self) -> Self {
      Self {
         factory: Arc::clone(&self.factory),
         connections: Arc::clone(&self.connections),
      }
   }
}

impl<D: Driver> ConnectionEnvironment<D> {
   pub(crate) fn new(factory: Arc<ConnectionFactory<D>>) -> Self {
      Self {
         factory,
         connections: Arc::default(),
      }
   }

   pub fn factory(&self) -> &Arc<ConnectionFactory<D>> {
      &self.factory
   }

   /// Open a new connection for `connection_string`.
   ///
   /// # Errors
   ///
   /// Returns the factory's configuration, creation, permission or timeout
   /// error; nothing is tracked on failure.
   pub async fn open(&self, connection_string: &str) -> Result<OdbcConnection<D>> {
      let conn = OdbcConnection::new(&self.factory, connection_string)?;
      conn.open().await?;

      let mut connections = self.connections.write().await;
      // Drop connections that were closed directly rather than through the environment
      connections.retain(|_, tracked| tracked.state() != ConnectionState::Closed);
      connections.insert(conn.id(), conn.clone());
      drop(connections);
      debug!(connection_id = %conn.id(), "Tracking opened connection");
      Ok(conn)
   }

   /// Close a connection and stop tracking it. Closing twice is a no-op.
   pub async fn close(&self, conn: &OdbcConnection<D>) -> Result<()> {
      self.connections.write().await.shift_remove(&conn.id());
      conn.close().await?;
      Ok(())
   }

   /// Point an open or closed connection at a new connection string
   pub async fn reconfigure(&self, conn: &OdbcConnection<D>, connection_string: &str) -> Result<()> {
      conn.reconfigure(connection_string).await?;
      Ok(())
   }

   /// A tracked connection by id
   pub async fn get(&self, id: Uuid) -> Option<OdbcConnection<D>> {
      self.connections.read().await.get(&id).cloned()
   }

   pub async fn connection_count(&self) -> usize {
      self.connections.read().await.len()
   }

   /// Close every tracked connection in parallel.
   ///
   /// # Errors
   ///
   /// Returns `Error::CleanupTimedOut` if closing takes longer than five
   /// seconds, or `Error::CleanupFailed` if any close failed. Every
   /// connection is untracked either way.
   pub async fn close_all(&self) -> Result<()> {
      let connections: Vec<OdbcConnection<D>> = {
         let mut guard = self.connections.write().await;
         guard.drain(..).map(|(_, conn)| conn).collect()
      };

      if connections.is_empty() {
         return Ok(());
      }

      let mut set = tokio::task::JoinSet::new();
      for conn in connections {
         set.spawn(async move { conn.close().await });
      }

      let mut failed = 0;
      let timeout_result = tokio::time::timeout(CLEANUP_TIMEOUT, async {
         while let Some(result) = set.join_next().await {
            match result {
               Ok(Err(e)) => {
                  warn!("Error closing connection: {:?}", e);
                  failed += 1;
               }
               Err(e) => {
                  warn!("Connection close task panicked: {:?}", e);
                  failed += 1;
               }
               Ok(Ok(())) => {}
            }
         }
      })
      .await;

      if timeout_result.is_err() {
         let pending = set.len();
         warn!(pending, "Connection cleanup timed out after 5 seconds");
         // Let the stragglers finish in the background
         set.detach_all();
         return Err(Error::CleanupTimedOut {
            secs: CLEANUP_TIMEOUT.as_secs(),
            pending,
         });
      }

      if failed > 0 {
         return Err(Error::CleanupFailed { failed });
      }

      debug!("Connection cleanup complete");
      Ok(())
   }

   /// Close every tracked connection, then shut the factory down.
   ///
   /// The factory is shut down even if closing failed; opens made through
   /// it afterwards fail with `FACTORY_CLOSED`.
   pub async fn shutdown(&self) -> Result<()> {
      let closed = self.close_all().await;
      self.factory.shutdown().await;
      debug!("Connection environment shut down");
      closed
   }

   /// State changes for every connection, or only for `connection_id`
   pub fn subscribe(&self, connection_id: Option<Uuid>) -> StateChangeStream {
      self.factory.state_change_stream(connection_id)
   }

   /// Counters of the pool group `conn` currently resolves to
   pub fn pool_stats(&self, conn: &OdbcConnection<D>) -> Option<PoolGroupStats> {
      conn.pool_group().map(|group| group.stats())
   }
}
