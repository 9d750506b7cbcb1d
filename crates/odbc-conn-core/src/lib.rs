//! # odbc-conn-core
//!
//! The connection-factory layer between a user-facing connection handle and
//! the physical sessions backing it, for ODBC-style connection strings.
//!
//! ## Core Types
//!
//! - **[`ConnectionFactory`]**: Caches options and pool groups, creates inner
//!   connections and owns the outer/inner binding protocol
//! - **[`OdbcConnection`]**: Stable outer handle; delegates to whichever inner
//!   connection it is currently bound to
//! - **[`ConnectionOptions`]**: Immutable, normalized configuration with an
//!   order- and case-independent [`CanonicalKey`]
//! - **[`ConnectionPoolGroup`]**: One per canonical key; the reuse boundary
//!   holding idle [`InnerConnection`]s
//! - **[`Driver`]** / **[`PermissionPolicy`]**: The collaborators the factory
//!   calls out to
//! - **[`Error`]**: Error type for factory operations
//!
//! ## Architecture
//!
//! - **Create-if-absent caches**: Options and pool groups are looked up under
//!   a read lock and created under a write lock, exactly once per key
//! - **Generation-tagged binding**: An outer connection holds an index and
//!   generation into the factory's session table, packed into one atomic
//!   word; every bind, unbind and swap is a single compare-and-set
//! - **Orphan-free opens**: Physical sessions are established on a spawned
//!   task. A caller that times out or is cancelled never leaks one
//! - **Health-checked reuse**: Idle members are probed before being handed
//!   out; broken ones are torn down and never returned
//!
//! ## Usage
//!
//! ```ignore
//! use odbc_conn_core::{ConnectionFactory, FactoryConfig, OdbcConnection};
//!
//! let factory = ConnectionFactory::new(my_driver, FactoryConfig::default());
//!
//! let conn = OdbcConnection::new(&factory, "Driver={My Driver};Server=s1;UID=u")?;
//! conn.open().await?;
//!
//! // Same configuration, different spelling: same pool group
//! let other = OdbcConnection::new(&factory, "uid=u;SERVER=s1;Driver={My Driver}")?;
//!
//! conn.close().await?;
//! other.open().await?; // reuses the session conn released
//! ```
//!
mod binding;
mod capability;
mod config;
mod connection;
mod driver;
mod error;
mod events;
mod factory;
mod inner;
mod options;
mod pool_group;
mod registry;
mod sessions;

// Re-export public types
pub use binding::{Binding, BindingSlot, SessionHandle};
pub use capability::{InnerConnectionHolder, OuterConnection, PermissionCheckable, PoolGroupHolder};
pub use config::{FactoryConfig, PoolingMode};
pub use connection::{ConnectionState, OdbcConnection};
pub use driver::{AllowAll, Driver, Permission, PermissionContext, PermissionPolicy};
pub use error::{DriverError, Error};
pub use events::{StateChange, StateChangeStream};
pub use factory::ConnectionFactory;
pub use inner::{InnerConnection, InnerState};
pub use options::{CanonicalKey, ConnectionOptions, Keyword, KeywordPolicy};
pub use pool_group::{ConnectionPoolGroup, PoolGroupStats, ProviderInfo};
pub use sessions::SessionTable;

// Drivers implement the collaborator trait with this
pub use async_trait::async_trait;

/// A type alias for Results with our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
