use serde::{Serialize, Serializer};

/// Result type alias for environment operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Structured error response for callers that report errors as data.
#[derive(Serialize)]
struct ErrorResponse {
   code: String,
   message: String,
}

/// Error types for the connection environment.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from the connection factory.
   #[error(transparent)]
   Connection(#[from] odbc_conn_core::Error),

   /// Closing tracked connections did not finish in time.
   #[error("closing connections timed out after {secs} seconds with {pending} still closing")]
   CleanupTimedOut { secs: u64, pending: usize },

   /// One or more tracked connections failed to close.
   #[error("{failed} connection(s) failed to close")]
   CleanupFailed { failed: usize },
}

impl Error {
   /// Extract a structured error code from the error type.
   ///
   /// Factory errors keep their own codes so callers can match on them.
   pub fn error_code(&self) -> String {
      match self {
         Error::Connection(e) => e.error_code().to_string(),
         Error::CleanupTimedOut { .. } => "CLEANUP_TIMED_OUT".to_string(),
         Error::CleanupFailed { .. } => "CLEANUP_FAILED".to_string(),
      }
   }
}

impl Serialize for Error {
   fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
   where
      S: Serializer,
   {
      let response = ErrorResponse {
         code: self.error_code(),
         message: self.to_string(),
      };
      response.serialize(serializer)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_serializes_code_and_message() {
      let err = Error::from(odbc_conn_core::Error::PermissionDenied("server s2".into()));
      let value = serde_json::to_value(&err).unwrap();

      assert_eq!(value["code"], "PERMISSION_DENIED");
      assert_eq!(value["message"], "permission denied: server s2");
   }

   #[test]
   fn test_cleanup_errors_have_codes() {
      let err = Error::CleanupTimedOut { secs: 5, pending: 2 };
      assert_eq!(err.error_code(), "CLEANUP_TIMED_OUT");
      assert!(err.to_string().contains("2 still closing"));
   }
}
