//! Error types for odbc-conn-core

use std::time::Duration;

use thiserror::Error;

/// Error reported by a driver collaborator.
///
/// Mirrors the diagnostic record an ODBC driver manager returns: a message,
/// an optional five-character SQLSTATE, and whether the driver considers the
/// session unusable afterwards.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", format_driver_error(.message, .sqlstate.as_deref()))]
pub struct DriverError {
   pub message: String,
   pub sqlstate: Option<String>,
   pub fatal: bool,
}

fn format_driver_error(message: &str, sqlstate: Option<&str>) -> String {
   match sqlstate {
      Some(state) => format!("[{state}] {message}"),
      None => message.to_string(),
   }
}

impl DriverError {
   pub fn new(message: impl Into<String>) -> Self {
      Self {
         message: message.into(),
         sqlstate: None,
         fatal: false,
      }
   }

   pub fn with_sqlstate(mut self, sqlstate: impl Into<String>) -> Self {
      self.sqlstate = Some(sqlstate.into());
      self
   }

   pub fn fatal(mut self) -> Self {
      self.fatal = true;
      self
   }

   /// True when the session that produced this error can no longer be used.
   ///
   /// SQLSTATE class `08` is the ODBC "connection exception" class
   /// (e.g. `08S01` communication link failure).
   pub fn is_connection_failure(&self) -> bool {
      self.fatal
         || self
            .sqlstate
            .as_deref()
            .is_some_and(|state| state.starts_with("08"))
   }
}

/// Errors that may occur while resolving, opening, or closing connections
#[derive(Error, Debug)]
pub enum Error {
   /// Malformed, empty, or unsupported connection string. The caller fixes
   /// the input; never retried automatically.
   #[error("invalid connection string: {0}")]
   Configuration(String),

   /// Establishing a physical session failed. Pool-group membership is not
   /// affected and the caller may retry.
   #[error("failed to create connection: {reason}")]
   ConnectionCreation {
      reason: String,
      #[source]
      source: Option<DriverError>,
   },

   /// Obtaining an inner connection took longer than the connect timeout
   #[error("timed out after {0:?} waiting for a connection")]
   Timeout(Duration),

   /// The security collaborator rejected the operation
   #[error("permission denied: {0}")]
   PermissionDenied(String),

   /// Protocol violation such as opening an already-open connection
   #[error("invalid connection state: {0}")]
   InvalidState(String),

   /// A previously-open inner connection failed its liveness probe or
   /// reported an I/O failure. It has been discarded from the pool.
   #[error("connection is broken: {0}")]
   BrokenConnection(#[source] DriverError),

   /// A non-fatal error reported by the driver while running caller work on
   /// a bound session
   #[error(transparent)]
   Driver(DriverError),

   /// The factory has been shut down and cannot hand out connections
   #[error("connection factory has been shut down")]
   FactoryClosed,
}

impl Error {
   pub(crate) fn creation(reason: impl Into<String>) -> Self {
      Error::ConnectionCreation {
         reason: reason.into(),
         source: None,
      }
   }

   /// Machine-readable error code
   pub fn error_code(&self) -> &'static str {
      match self {
         Error::Configuration(_) => "CONFIGURATION_ERROR",
         Error::ConnectionCreation { .. } => "CONNECTION_CREATION_ERROR",
         Error::Timeout(_) => "CONNECTION_TIMEOUT",
         Error::PermissionDenied(_) => "PERMISSION_DENIED",
         Error::InvalidState(_) => "INVALID_STATE",
         Error::BrokenConnection(_) => "BROKEN_CONNECTION",
         Error::Driver(_) => "DRIVER_ERROR",
         Error::FactoryClosed => "FACTORY_CLOSED",
      }
   }

   /// Whether a fresh attempt at the same operation may succeed.
   ///
   /// Creation failures, timeouts and broken connections are transient;
   /// configuration, permission and protocol errors are not.
   pub fn is_retryable(&self) -> bool {
      matches!(
         self,
         Error::ConnectionCreation { .. } | Error::Timeout(_) | Error::BrokenConnection(_)
      )
   }
}
