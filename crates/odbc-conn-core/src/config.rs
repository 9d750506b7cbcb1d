//! Configuration for the connection factory

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Who keeps idle physical sessions around between uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingMode {
   /// Pool groups keep released inner connections for reuse
   #[default]
   Managed,
   /// The driver pools internally. Pool groups still exist for identity, but
   /// release always tears down and acquire always misses.
   Native,
}

/// Configuration for a `ConnectionFactory`
///
/// # Examples
///
/// ```
/// use odbc_conn_core::FactoryConfig;
///
/// // Use defaults
/// let config = FactoryConfig::default();
///
/// // Override just one field
/// let config = FactoryConfig {
///     connect_timeout_secs: 5,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
   /// Whether this layer or the driver pools connections
   ///
   /// Default: `Managed`
   pub pooling: PoolingMode,

   /// Drop unrecognized connection-string keywords instead of rejecting them
   ///
   /// Default: false
   pub ignore_unknown_keywords: bool,

   /// How long obtaining an inner connection may take (seconds)
   ///
   /// Individual connections may override this.
   ///
   /// Default: 15
   pub connect_timeout_secs: u64,

   /// Upper bound on idle inner connections retained per pool group
   ///
   /// Default: 100
   pub max_idle_per_group: usize,

   /// Idle inner connections older than this are torn down rather than reused (seconds)
   ///
   /// Default: 30
   pub idle_timeout_secs: u64,

   /// Longest raw connection string accepted
   ///
   /// Default: 1024
   pub max_connection_string_len: usize,

   /// Capacity of the state-change broadcast channel
   ///
   /// Default: 256
   pub event_channel_capacity: usize,
}

impl Default for FactoryConfig {
   fn default() -> Self {
      Self {
         pooling: PoolingMode::Managed,
         ignore_unknown_keywords: false,
         connect_timeout_secs: 15,
         max_idle_per_group: 100,
         idle_timeout_secs: 30,
         max_connection_string_len: 1024,
         event_channel_capacity: 256,
      }
   }
}

impl FactoryConfig {
   pub fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_secs)
   }

   pub fn idle_timeout(&self) -> Duration {
      Duration::from_secs(self.idle_timeout_secs)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_partial_config_deserializes_with_defaults() {
      let config: FactoryConfig =
         serde_json::from_str(r#"{ "pooling": "native", "connect_timeout_secs": 3 }"#).unwrap();

      assert_eq!(config.pooling, PoolingMode::Native);
      assert_eq!(config.connect_timeout(), Duration::from_secs(3));
      assert_eq!(config.max_idle_per_group, 100);
      assert_eq!(config.max_connection_string_len, 1024);
      assert!(!config.ignore_unknown_keywords);
   }
}
