use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use odbc_conn_core::{ConnectionOptions, DriverError, PermissionPolicy};
use odbc_conn_factory::{
   Builder, ConnectionState, Error, FactoryConfig, Permission, PermissionContext, PoolingMode,
};
use odbc_conn_sqlite::SqliteDriver;
use tempfile::TempDir;

fn connection_string(path: &Path) -> String {
   format!("Driver=SQLite;Database={{{}}}", path.display())
}

/// Driver whose sessions take a minute to tear down
struct SlowCloseDriver;

#[async_trait]
impl odbc_conn_core::Driver for SlowCloseDriver {
   type Session = ();

   async fn open_physical_session(&self, _options: &ConnectionOptions) -> Result<(), DriverError> {
      Ok(())
   }

   async fn close_physical_session(&self, _session: ()) -> Result<(), DriverError> {
      tokio::time::sleep(Duration::from_secs(60)).await;
      Ok(())
   }

   async fn probe_liveness(&self, _session: &mut ()) -> bool {
      true
   }
}

struct DenyAll;

impl PermissionPolicy for DenyAll {
   fn check_permission(&self, _context: &PermissionContext<'_>) -> Permission {
      Permission::Deny("no connections allowed".into())
   }
}

#[tokio::test]
async fn test_open_and_close_track_connections() {
   let temp_dir = TempDir::new().unwrap();
   let raw = connection_string(&temp_dir.path().join("tracked.db"));
   let env = Builder::new().build(SqliteDriver::new());

   let conn = env.open(&raw).await.unwrap();
   assert_eq!(conn.state(), ConnectionState::Open);
   assert_eq!(env.connection_count().await, 1);
   assert!(env.get(conn.id()).await.is_some());

   env.close(&conn).await.unwrap();
   assert_eq!(conn.state(), ConnectionState::Closed);
   assert_eq!(env.connection_count().await, 0);

   // Second close is a no-op
   env.close(&conn).await.unwrap();
}

#[tokio::test]
async fn test_directly_closed_connections_are_pruned() {
   let env = Builder::new().build(SqliteDriver::new());

   let first = env.open("Driver=SQLite;Database=:memory:").await.unwrap();
   first.close().await.unwrap();
   assert_eq!(env.connection_count().await, 1);

   let second = env.open("Driver=SQLite;Database=:memory:").await.unwrap();

   assert_eq!(env.connection_count().await, 1);
   assert!(env.get(first.id()).await.is_none());
   assert!(env.get(second.id()).await.is_some());
}

#[tokio::test]
async fn test_equivalent_strings_share_a_pool() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("shared.db");
   let env = Builder::new().build(SqliteDriver::new());

   let first = env.open(&connection_string(&path)).await.unwrap();
   env.close(&first).await.unwrap();

   let reordered = format!("DATABASE={{{}}};driver=SQLite", path.display());
   let second = env.open(&reordered).await.unwrap();

   let stats = env.pool_stats(&second).unwrap();
   assert_eq!(stats.created, 1);
   assert_eq!(stats.reused, 1);
   assert_eq!(env.factory().pool_group_count(), 1);
}

#[tokio::test]
async fn test_failed_open_is_not_tracked() {
   let env = Builder::new().build(SqliteDriver::new());

   let err = env.open("Driver=SQLite;Bogus=1").await.unwrap_err();
   assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
   assert_eq!(env.connection_count().await, 0);
}

#[tokio::test]
async fn test_close_all_closes_every_connection() {
   let temp_dir = TempDir::new().unwrap();
   let env = Builder::new().build(SqliteDriver::new());

   let mut opened = Vec::new();
   for name in ["a.db", "b.db", "c.db"] {
      let raw = connection_string(&temp_dir.path().join(name));
      opened.push(env.open(&raw).await.unwrap());
   }
   assert_eq!(env.connection_count().await, 3);

   env.close_all().await.unwrap();

   assert_eq!(env.connection_count().await, 0);
   for conn in &opened {
      assert_eq!(conn.state(), ConnectionState::Closed);
   }
}

#[tokio::test(start_paused = true)]
async fn test_close_all_times_out_on_slow_teardown() {
   let env = Builder::new()
      .config(FactoryConfig {
         pooling: PoolingMode::Native,
         ..Default::default()
      })
      .build(SlowCloseDriver);

   env.open("Driver=Slow;Server=s1").await.unwrap();

   match env.close_all().await.unwrap_err() {
      Error::CleanupTimedOut { secs, pending } => {
         assert_eq!(secs, 5);
         assert_eq!(pending, 1);
      }
      other => panic!("expected CleanupTimedOut, got {other:?}"),
   }
   assert_eq!(env.connection_count().await, 0);
}

#[tokio::test]
async fn test_shutdown_refuses_new_opens() {
   let temp_dir = TempDir::new().unwrap();
   let raw = connection_string(&temp_dir.path().join("shutdown.db"));
   let env = Builder::new().build(SqliteDriver::new());

   let conn = env.open(&raw).await.unwrap();
   env.shutdown().await.unwrap();

   assert_eq!(conn.state(), ConnectionState::Closed);
   assert!(env.factory().is_closed());
   assert_eq!(env.factory().pool_group_count(), 0);

   let err = env.open(&raw).await.unwrap_err();
   assert_eq!(err.error_code(), "FACTORY_CLOSED");

   // Shutting down twice is harmless
   env.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_builder_permission_policy_is_enforced() {
   let env = Builder::new()
      .permission_policy(DenyAll)
      .build(SqliteDriver::new());

   let err = env.open("Driver=SQLite;Database=:memory:").await.unwrap_err();
   assert_eq!(err.error_code(), "PERMISSION_DENIED");

   let value = serde_json::to_value(&err).unwrap();
   assert_eq!(value["code"], "PERMISSION_DENIED");
   assert!(value["message"].as_str().unwrap().contains("no connections allowed"));

   assert_eq!(env.connection_count().await, 0);
   assert_eq!(env.factory().open_session_count(), 0);
}

#[tokio::test]
async fn test_reconfigure_moves_connection_to_new_database() {
   let temp_dir = TempDir::new().unwrap();
   let first_path = temp_dir.path().join("first.db");
   let second_path = temp_dir.path().join("second.db");
   let env = Builder::new().build(SqliteDriver::new());

   let conn = env.open(&connection_string(&first_path)).await.unwrap();
   let first_group = env.pool_stats(&conn).unwrap();
   assert_eq!(first_group.created, 1);

   env.reconfigure(&conn, &connection_string(&second_path))
      .await
      .unwrap();

   assert_eq!(conn.state(), ConnectionState::Open);
   assert!(second_path.exists());
   assert_eq!(env.factory().pool_group_count(), 2);

   env.close(&conn).await.unwrap();
}

#[tokio::test]
async fn test_subscribe_sees_open_and_close() {
   let env = Builder::new().build(SqliteDriver::new());
   let mut stream = env.subscribe(None);

   let conn = env.open("Driver=SQLite;Database=:memory:").await.unwrap();
   env.close(&conn).await.unwrap();

   let connecting = stream.next().await.unwrap();
   assert_eq!(connecting.connection_id, conn.id());
   assert_eq!(connecting.original, ConnectionState::Closed);
   assert_eq!(connecting.current, ConnectionState::Connecting);

   let open = stream.next().await.unwrap();
   assert_eq!(open.original, ConnectionState::Connecting);
   assert_eq!(open.current, ConnectionState::Open);

   let closed = stream.next().await.unwrap();
   assert_eq!(closed.original, ConnectionState::Open);
   assert_eq!(closed.current, ConnectionState::Closed);
}
