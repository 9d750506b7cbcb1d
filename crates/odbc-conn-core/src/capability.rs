//! Capabilities the factory requires of an outer connection.
//!
//! The factory never inspects a concrete handle type. Anything that can hold
//! a binding, remember its pool group and answer a permission demand can be
//! opened, closed and reconfigured through it.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::Result;
use crate::binding::BindingSlot;
use crate::driver::Driver;
use crate::options::ConnectionOptions;
use crate::pool_group::ConnectionPoolGroup;

/// Holds the binding to the inner connection currently backing it
pub trait InnerConnectionHolder {
   /// Stable identity, unchanged across rebinding
   fn connection_id(&self) -> Uuid;

   fn binding_slot(&self) -> &Arc<BindingSlot>;
}

/// Remembers the pool group resolved for its current options
pub trait PoolGroupHolder<D: Driver> {
   fn pool_group(&self) -> Option<Arc<ConnectionPoolGroup<D>>>;

   fn set_pool_group(&self, group: Option<Arc<ConnectionPoolGroup<D>>>);
}

/// Answers a security check against its current state
pub trait PermissionCheckable {
   /// # Errors
   ///
   /// Returns `Error::PermissionDenied` if the policy rejects the connection.
   fn permission_demand(&self) -> Result<()>;
}

/// The full interface an outer connection exposes to the factory
pub trait OuterConnection<D: Driver>:
   InnerConnectionHolder + PoolGroupHolder<D> + PermissionCheckable + Send + Sync
{
   fn options(&self) -> Arc<ConnectionOptions>;

   fn set_options(&self, options: Arc<ConnectionOptions>);

   /// How long obtaining an inner connection may take
   fn connect_timeout(&self) -> Duration;
}
