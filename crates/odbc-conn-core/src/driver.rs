//! Collaborator interfaces the factory depends on: the driver that owns
//! physical sessions and the security policy consulted before binding.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DriverError;
use crate::options::ConnectionOptions;
use crate::pool_group::ProviderInfo;

/// The wire-level driver collaborator.
///
/// The factory calls each method exactly once per inner-connection
/// transition into or out of `Open`. Implementations may block on network
/// I/O inside `open_physical_session`; the factory runs that call on a
/// spawned task so a cancelled caller never orphans the session.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
   /// The driver's handle to one physical session
   type Session: Send + 'static;

   /// Establish a physical session for the given options
   async fn open_physical_session(
      &self,
      options: &ConnectionOptions,
   ) -> Result<Self::Session, DriverError>;

   /// Tear down a physical session. Errors are logged by the caller, never surfaced.
   async fn close_physical_session(&self, session: Self::Session) -> Result<(), DriverError>;

   /// Lightweight check that a pooled session is still usable
   async fn probe_liveness(&self, session: &mut Self::Session) -> bool;

   /// Provider metadata attached to a pool group when it is created.
   ///
   /// Called at most once per distinct canonical key.
   fn pool_group_provider_info(&self, options: &ConnectionOptions) -> ProviderInfo {
      ProviderInfo::from_options(options)
   }
}

/// What the security collaborator sees when asked for a decision
#[derive(Debug, Clone, Copy)]
pub struct PermissionContext<'a> {
   pub connection_id: Uuid,
   pub options: &'a ConnectionOptions,
}

/// Outcome of a permission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permission {
   Allow,
   Deny(String),
}

/// The security collaborator consulted before a binding completes
pub trait PermissionPolicy: Send + Sync {
   fn check_permission(&self, context: &PermissionContext<'_>) -> Permission;
}

/// Policy that allows every connection
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionPolicy for AllowAll {
   fn check_permission(&self, _context: &PermissionContext<'_>) -> Permission {
      Permission::Allow
   }
}
