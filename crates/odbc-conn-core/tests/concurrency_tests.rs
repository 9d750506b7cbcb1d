//! Concurrency tests: single-winner caches and compare-and-set rebinding
//! under real multi-threaded contention.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{S1, S1_REORDERED, setup};
use odbc_conn_core::{
   Binding, ConnectionState, Error, FactoryConfig, OdbcConnection, PoolGroupHolder,
};
use tokio::sync::Barrier;

const TASKS: usize = 32;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pool_group_creation_has_single_winner() {
   let (factory, _) = setup(FactoryConfig::default());
   let barrier = Arc::new(Barrier::new(TASKS));

   let handles: Vec<_> = (0..TASKS)
      .map(|i| {
         let (factory, barrier) = (Arc::clone(&factory), Arc::clone(&barrier));
         tokio::spawn(async move {
            barrier.wait().await;
            // Alternate spellings so the options cache is contended too
            let raw = if i % 2 == 0 { S1 } else { S1_REORDERED };
            let options = factory.get_or_create_options(raw, None).unwrap();
            factory.get_or_create_pool_group(&options).unwrap()
         })
      })
      .collect();

   let mut groups = Vec::with_capacity(TASKS);
   for handle in handles {
      groups.push(handle.await.unwrap());
   }

   let winner = &groups[0];
   assert!(groups.iter().all(|group| Arc::ptr_eq(group, winner)));
   assert_eq!(factory.pool_group_count(), 1);
   assert_eq!(factory.cached_options_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_swaps_have_exactly_one_winner() {
   let (factory, _) = setup(FactoryConfig::default());
   let conn = OdbcConnection::new(&factory, S1).unwrap();
   conn.open().await.unwrap();

   let Binding::Bound(original) = conn.binding() else {
      panic!("connection should be bound after open");
   };
   let replaced = factory.get_inner_connection(&conn).unwrap();

   let candidates = [
      factory.obtain_inner_connection(&conn).await.unwrap(),
      factory.obtain_inner_connection(&conn).await.unwrap(),
   ];

   let barrier = Arc::new(Barrier::new(candidates.len()));
   let handles: Vec<_> = candidates
      .iter()
      .map(|candidate| {
         let (factory, conn, barrier) = (Arc::clone(&factory), conn.clone(), Arc::clone(&barrier));
         let candidate = Arc::clone(candidate);
         tokio::spawn(async move {
            barrier.wait().await;
            factory.swap_inner(&conn, original, candidate).await.unwrap()
         })
      })
      .collect();

   let mut outcomes = Vec::new();
   for handle in handles {
      outcomes.push(handle.await.unwrap());
   }
   assert_eq!(outcomes.iter().filter(|won| **won).count(), 1);

   let winner_index = outcomes.iter().position(|won| *won).unwrap();
   let bound = factory.get_inner_connection(&conn).unwrap();
   assert!(Arc::ptr_eq(&bound, &candidates[winner_index]));
   assert_eq!(factory.open_session_count(), 1);

   // Both the replaced inner and the losing candidate went back to the pool
   let group = conn.pool_group().unwrap();
   assert_eq!(group.idle_count(), 2);
   assert!(Arc::ptr_eq(&replaced.pool_group().unwrap(), &group));
   assert!(Arc::ptr_eq(&candidates[1 - winner_index].pool_group().unwrap(), &group));

   // A stale handle never matches again, and the candidate is not leaked
   let late = factory.obtain_inner_connection(&conn).await.unwrap();
   assert_eq!(group.idle_count(), 1);
   assert!(!factory.swap_inner(&conn, original, late).await.unwrap());
   assert_eq!(group.idle_count(), 2);
   assert_eq!(factory.open_session_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_raw_swaps_have_exactly_one_winner() {
   let (factory, _) = setup(FactoryConfig::default());
   let conn = OdbcConnection::new(&factory, S1).unwrap();

   let barrier = Arc::new(Barrier::new(8));
   let handles: Vec<_> = (0..8)
      .map(|_| {
         let (factory, conn, barrier) = (Arc::clone(&factory), conn.clone(), Arc::clone(&barrier));
         tokio::spawn(async move {
            barrier.wait().await;
            factory.swap(&conn, Binding::Unbound, Binding::Binding)
         })
      })
      .collect();

   let mut winners = 0;
   for handle in handles {
      if handle.await.unwrap() {
         winners += 1;
      }
   }
   assert_eq!(winners, 1);
   assert_eq!(conn.binding(), Binding::Binding);

   assert!(factory.swap(&conn, Binding::Binding, Binding::Unbound));
   assert_eq!(conn.binding(), Binding::Unbound);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_opens_on_one_connection() {
   let (factory, driver) = setup(FactoryConfig::default());
   driver.set_open_delay(Duration::from_millis(50));
   let conn = OdbcConnection::new(&factory, S1).unwrap();
   let barrier = Arc::new(Barrier::new(2));

   let handles: Vec<_> = (0..2)
      .map(|_| {
         let (conn, barrier) = (conn.clone(), Arc::clone(&barrier));
         tokio::spawn(async move {
            barrier.wait().await;
            conn.open().await
         })
      })
      .collect();

   let mut results = Vec::new();
   for handle in handles {
      results.push(handle.await.unwrap());
   }

   assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
   assert!(
      results
         .iter()
         .any(|r| matches!(r, Err(Error::InvalidState(_))))
   );
   assert_eq!(driver.opened(), 1);
   assert_eq!(conn.state(), ConnectionState::Open);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_closes_release_once() {
   let (factory, driver) = setup(FactoryConfig::default());
   let conn = OdbcConnection::new(&factory, S1).unwrap();
   conn.open().await.unwrap();
   let barrier = Arc::new(Barrier::new(TASKS));

   let handles: Vec<_> = (0..TASKS)
      .map(|_| {
         let (conn, barrier) = (conn.clone(), Arc::clone(&barrier));
         tokio::spawn(async move {
            barrier.wait().await;
            conn.close().await
         })
      })
      .collect();

   for handle in handles {
      handle.await.unwrap().unwrap();
   }

   assert_eq!(conn.pool_group().unwrap().idle_count(), 1);
   assert_eq!(driver.closed(), 0);
   assert_eq!(conn.binding(), Binding::Unbound);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_open_close_reuses_sessions() {
   let (factory, driver) = setup(FactoryConfig::default());
   let connections: Vec<_> = (0..8)
      .map(|_| OdbcConnection::new(&factory, S1).unwrap())
      .collect();

   let handles: Vec<_> = connections
      .iter()
      .cloned()
      .map(|conn| {
         tokio::spawn(async move {
            for _ in 0..25 {
               conn.open().await.unwrap();
               conn.close().await.unwrap();
            }
         })
      })
      .collect();

   for handle in handles {
      handle.await.unwrap();
   }

   assert!(driver.opened() <= connections.len());
   assert_eq!(driver.closed(), 0);
   assert_eq!(factory.open_session_count(), 0);

   let stats = connections[0].pool_group().unwrap().stats();
   assert_eq!(stats.created as usize, driver.opened());
   assert_eq!(stats.idle, driver.opened());
   assert_eq!(stats.reused as usize + driver.opened(), 8 * 25);
}
