//! Mapping of sqlx errors onto driver diagnostics

use odbc_conn_core::DriverError;

/// SQLSTATE for "client unable to establish connection"
pub(crate) const UNABLE_TO_CONNECT: &str = "08001";
/// SQLSTATE for "data source name not found and no default driver specified"
pub(crate) const DRIVER_NOT_FOUND: &str = "IM002";

/// Translate a sqlx error into the diagnostic record the factory understands.
///
/// SQLite reports numeric result codes rather than SQLSTATEs, so the primary
/// result code is mapped onto the nearest SQLSTATE class. Transport-level
/// failures are always connection failures.
pub fn to_driver_error(err: &sqlx::Error) -> DriverError {
   match err {
      sqlx::Error::Database(db) => {
         let code = db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| code & 0xff);
         DriverError::new(db.message()).with_sqlstate(sqlstate_for(code))
      }
      sqlx::Error::Io(e) => DriverError::new(e.to_string())
         .with_sqlstate("08S01")
         .fatal(),
      sqlx::Error::Protocol(message) => DriverError::new(message.clone())
         .with_sqlstate("08S01")
         .fatal(),
      sqlx::Error::WorkerCrashed => DriverError::new(err.to_string())
         .with_sqlstate("08S01")
         .fatal(),
      sqlx::Error::Configuration(_) => {
         DriverError::new(err.to_string()).with_sqlstate(UNABLE_TO_CONNECT)
      }
      other => DriverError::new(other.to_string()).with_sqlstate("HY000"),
   }
}

fn sqlstate_for(primary_code: Option<i32>) -> &'static str {
   match primary_code {
      // SQLITE_ERROR: generic SQL error or missing database object
      Some(1) => "42000",
      // SQLITE_BUSY / SQLITE_LOCKED
      Some(5 | 6) => "HYT00",
      // SQLITE_READONLY
      Some(8) => "25006",
      // SQLITE_IOERR / SQLITE_CORRUPT / SQLITE_NOTADB
      Some(10 | 11 | 26) => "08S01",
      // SQLITE_CANTOPEN
      Some(14) => UNABLE_TO_CONNECT,
      // SQLITE_CONSTRAINT
      Some(19) => "23000",
      // SQLITE_MISMATCH
      Some(20) => "22018",
      _ => "HY000",
   }
}
