//! Scripted in-memory driver shared by the integration suites

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use odbc_conn_core::{
   ConnectionFactory, ConnectionOptions, Driver, DriverError, FactoryConfig, Permission,
   PermissionContext, PermissionPolicy,
};

pub const S1: &str = "Driver=X;Server=s1;UID=u";
pub const S1_REORDERED: &str = "UID=u;Driver=X;Server=s1";
pub const S2: &str = "Driver=X;Server=s2;UID=u";

/// Call counters and knobs, shared between the test and the factory's driver
#[derive(Debug)]
pub struct MockState {
   pub opened: AtomicUsize,
   pub closed: AtomicUsize,
   pub probes: AtomicUsize,
   pub alive: AtomicBool,
   pub fail_open: AtomicBool,
   pub open_delay_ms: AtomicU64,
   pub close_delay_ms: AtomicU64,
   next_session: AtomicU64,
}

impl MockState {
   pub fn opened(&self) -> usize {
      self.opened.load(Ordering::SeqCst)
   }

   pub fn closed(&self) -> usize {
      self.closed.load(Ordering::SeqCst)
   }

   pub fn probes(&self) -> usize {
      self.probes.load(Ordering::SeqCst)
   }

   pub fn set_alive(&self, alive: bool) {
      self.alive.store(alive, Ordering::SeqCst);
   }

   pub fn set_fail_open(&self, fail: bool) {
      self.fail_open.store(fail, Ordering::SeqCst);
   }

   pub fn set_open_delay(&self, delay: Duration) {
      self.open_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
   }

   pub fn set_close_delay(&self, delay: Duration) {
      self.close_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
   }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockSession {
   pub id: u64,
   pub server: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MockDriver {
   pub state: Arc<MockState>,
}

impl MockDriver {
   pub fn new() -> Self {
      Self {
         state: Arc::new(MockState {
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            alive: AtomicBool::new(true),
            fail_open: AtomicBool::new(false),
            open_delay_ms: AtomicU64::new(0),
            close_delay_ms: AtomicU64::new(0),
            next_session: AtomicU64::new(1),
         }),
      }
   }
}

#[async_trait]
impl Driver for MockDriver {
   type Session = MockSession;

   async fn open_physical_session(
      &self,
      options: &ConnectionOptions,
   ) -> Result<MockSession, DriverError> {
      let delay = self.state.open_delay_ms.load(Ordering::SeqCst);
      if delay > 0 {
         tokio::time::sleep(Duration::from_millis(delay)).await;
      }

      if self.state.fail_open.load(Ordering::SeqCst) {
         return Err(DriverError::new("login failed").with_sqlstate("28000"));
      }

      self.state.opened.fetch_add(1, Ordering::SeqCst);
      Ok(MockSession {
         id: self.state.next_session.fetch_add(1, Ordering::SeqCst),
         server: options.data_source().map(str::to_string),
      })
   }

   async fn close_physical_session(&self, _session: MockSession) -> Result<(), DriverError> {
      let delay = self.state.close_delay_ms.load(Ordering::SeqCst);
      if delay > 0 {
         tokio::time::sleep(Duration::from_millis(delay)).await;
      }

      self.state.closed.fetch_add(1, Ordering::SeqCst);
      Ok(())
   }

   async fn probe_liveness(&self, _session: &mut MockSession) -> bool {
      self.state.probes.fetch_add(1, Ordering::SeqCst);
      self.state.alive.load(Ordering::SeqCst)
   }
}

/// Rejects every connection to the given server
pub struct DenyServer(pub &'static str);

impl PermissionPolicy for DenyServer {
   fn check_permission(&self, context: &PermissionContext<'_>) -> Permission {
      if context.options.data_source() == Some(self.0) {
         Permission::Deny(format!("server {} is not allowed", self.0))
      } else {
         Permission::Allow
      }
   }
}

pub fn setup(config: FactoryConfig) -> (Arc<ConnectionFactory<MockDriver>>, Arc<MockState>) {
   // Set RUST_LOG to see factory logs while debugging a test
   let _ = tracing_subscriber::fmt()
      .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
      .with_test_writer()
      .try_init();

   let driver = MockDriver::new();
   let state = Arc::clone(&driver.state);
   (ConnectionFactory::new(driver, config), state)
}

/// Let spawned release and teardown tasks run to completion
pub async fn settle() {
   tokio::time::sleep(Duration::from_millis(20)).await;
}
