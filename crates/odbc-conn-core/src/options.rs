//! Connection string normalization
//!
//! A raw ODBC-style connection string (`Driver={SQL Server};Server=s1;UID=u`)
//! is parsed into a keyword/value map and re-serialized into a canonical key.
//! Two strings that differ only in keyword order, keyword casing, keyword
//! aliases or optional bracing produce the same canonical key, which is what
//! the factory's caches and pool groups are keyed by.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::Result;
use crate::error::Error;

/// A connection-string keyword this layer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
   App,
   Database,
   Driver,
   Dsn,
   Encrypt,
   FileDsn,
   Port,
   Pwd,
   SaveFile,
   Server,
   TrustedConnection,
   Uid,
}

impl Keyword {
   /// Canonical (lower-case) spelling used in the canonical key
   pub fn as_str(&self) -> &'static str {
      match self {
         Self::App => "app",
         Self::Database => "database",
         Self::Driver => "driver",
         Self::Dsn => "dsn",
         Self::Encrypt => "encrypt",
         Self::FileDsn => "filedsn",
         Self::Port => "port",
         Self::Pwd => "pwd",
         Self::SaveFile => "savefile",
         Self::Server => "server",
         Self::TrustedConnection => "trusted_connection",
         Self::Uid => "uid",
      }
   }

   /// Resolve a keyword case-insensitively, accepting the common aliases.
   pub fn lookup(name: &str) -> Option<Self> {
      let name = name
         .split_whitespace()
         .collect::<Vec<_>>()
         .join(" ")
         .to_ascii_lowercase();

      match name.as_str() {
         "app" => Some(Self::App),
         "database" | "initial catalog" => Some(Self::Database),
         "driver" => Some(Self::Driver),
         "dsn" => Some(Self::Dsn),
         "encrypt" => Some(Self::Encrypt),
         "filedsn" => Some(Self::FileDsn),
         "port" => Some(Self::Port),
         "pwd" | "password" => Some(Self::Pwd),
         "savefile" => Some(Self::SaveFile),
         "server" | "host" => Some(Self::Server),
         "trusted_connection" => Some(Self::TrustedConnection),
         "uid" | "user id" | "user" => Some(Self::Uid),
         _ => None,
      }
   }
}

impl fmt::Display for Keyword {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

/// How unrecognized keywords are treated while parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeywordPolicy {
   /// Drop unknown keywords (logged at debug level) instead of failing
   pub ignore_unknown: bool,
}

/// The order- and case-independent cache key for a configuration.
///
/// Contains credentials, so it is deliberately not `Display`; `Debug` prints
/// a fingerprint only.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CanonicalKey(Arc<str>);

impl CanonicalKey {
   pub fn as_str(&self) -> &str {
      &self.0
   }

   /// Short stable fingerprint, safe to log
   pub fn fingerprint(&self) -> u64 {
      let mut hasher = DefaultHasher::new();
      self.0.hash(&mut hasher);
      hasher.finish()
   }
}

impl fmt::Debug for CanonicalKey {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "CanonicalKey(#{:016x})", self.fingerprint())
   }
}

/// Immutable, normalized configuration derived from a connection string
#[derive(Clone)]
pub struct ConnectionOptions {
   raw: String,
   values: IndexMap<Keyword, String>,
   canonical: CanonicalKey,
   policy: KeywordPolicy,
}

impl ConnectionOptions {
   /// Parse and normalize a raw connection string
   ///
   /// Keywords are case-insensitive and the last occurrence of a duplicated
   /// keyword wins. Unknown keywords fail unless `policy.ignore_unknown` is set.
   ///
   /// # Errors
   ///
   /// Returns `Error::Configuration` if the string is empty, longer than
   /// `max_len`, syntactically malformed, or contains no recognized keyword.
   pub fn parse(raw: &str, policy: KeywordPolicy, max_len: usize) -> Result<Self> {
      if raw.trim().is_empty() {
         return Err(Error::Configuration("connection string is empty".into()));
      }

      if raw.len() > max_len {
         return Err(Error::Configuration(format!(
            "connection string is {} characters long, the limit is {max_len}",
            raw.len()
         )));
      }

      let mut values = IndexMap::new();
      for (key, value) in split_pairs(raw)? {
         match Keyword::lookup(&key) {
            Some(keyword) => {
               // IndexMap keeps the first position and replaces the value
               values.insert(keyword, value);
            }
            None if policy.ignore_unknown => {
               debug!(keyword = %key, "Ignoring unrecognized connection string keyword");
            }
            None => {
               return Err(Error::Configuration(format!("unrecognized keyword '{key}'")));
            }
         }
      }

      if values.is_empty() {
         return Err(Error::Configuration(
            "connection string contains no recognized keywords".into(),
         ));
      }

      if let Some(port) = values.get(&Keyword::Port)
         && port.parse::<u16>().is_err()
      {
         return Err(Error::Configuration(format!("invalid port '{port}'")));
      }

      let canonical = CanonicalKey(serialize(&values, false).into());

      Ok(Self {
         raw: raw.to_string(),
         values,
         canonical,
         policy,
      })
   }

   /// The string this instance was parsed from. May contain credentials.
   pub fn connection_string(&self) -> &str {
      &self.raw
   }

   pub fn canonical_key(&self) -> &CanonicalKey {
      &self.canonical
   }

   pub fn policy(&self) -> KeywordPolicy {
      self.policy
   }

   pub fn get(&self, keyword: Keyword) -> Option<&str> {
      self.values.get(&keyword).map(String::as_str)
   }

   /// Recognized keywords in the order they first appeared
   pub fn keywords(&self) -> impl Iterator<Item = Keyword> + '_ {
      self.values.keys().copied()
   }

   /// Canonical form with the password masked, for logs and diagnostics
   pub fn redacted(&self) -> String {
      serialize(&self.values, true)
   }

   /// The data source this configuration points at, if named
   pub fn data_source(&self) -> Option<&str> {
      self
         .get(Keyword::Dsn)
         .or_else(|| self.get(Keyword::FileDsn))
         .or_else(|| self.get(Keyword::Server))
   }

   /// Check that a physical session could be requested with these options.
   ///
   /// The driver manager needs a driver, a DSN or a file DSN to locate the
   /// driver; anything else is rejected before reaching it.
   pub fn validate_for_connect(&self) -> Result<()> {
      let has_target = [Keyword::Driver, Keyword::Dsn, Keyword::FileDsn]
         .iter()
         .any(|keyword| self.get(*keyword).is_some_and(|v| !v.trim().is_empty()));

      if !has_target {
         return Err(Error::creation(
            "connection string names no driver, dsn or filedsn",
         ));
      }
      Ok(())
   }
}

impl fmt::Debug for ConnectionOptions {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("ConnectionOptions")
         .field("options", &self.redacted())
         .field("policy", &self.policy)
         .finish()
   }
}

/// Split a raw string into trimmed `(key, value)` pairs, honoring `{...}` bracing.
fn split_pairs(raw: &str) -> Result<Vec<(String, String)>> {
   let bytes = raw.as_bytes();
   let mut pairs = Vec::new();
   let mut pos = 0;

   while pos < bytes.len() {
      while pos < bytes.len() && (bytes[pos] == b';' || bytes[pos].is_ascii_whitespace()) {
         pos += 1;
      }
      if pos >= bytes.len() {
         break;
      }

      let key_start = pos;
      while pos < bytes.len() && bytes[pos] != b'=' && bytes[pos] != b';' {
         pos += 1;
      }
      let key = raw[key_start..pos].trim();

      if pos >= bytes.len() || bytes[pos] == b';' {
         return Err(Error::Configuration(format!("keyword '{key}' has no value")));
      }
      if key.is_empty() {
         return Err(Error::Configuration(format!(
            "missing keyword before '=' at position {pos}"
         )));
      }

      // Skip '=' and any leading whitespace of the value
      pos += 1;
      while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
         pos += 1;
      }

      let value = if pos < bytes.len() && bytes[pos] == b'{' {
         pos += 1;
         let mut value = String::new();
         let mut segment_start = pos;
         loop {
            if pos >= bytes.len() {
               return Err(Error::Configuration(format!(
                  "unterminated '{{' in value of '{key}'"
               )));
            }
            if bytes[pos] == b'}' {
               if pos + 1 < bytes.len() && bytes[pos + 1] == b'}' {
                  // "}}" is an escaped brace; keep one
                  value.push_str(&raw[segment_start..=pos]);
                  pos += 2;
                  segment_start = pos;
                  continue;
               }
               value.push_str(&raw[segment_start..pos]);
               pos += 1;
               break;
            }
            pos += 1;
         }

         while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
         }
         if pos < bytes.len() && bytes[pos] != b';' {
            return Err(Error::Configuration(format!(
               "unexpected characters after braced value of '{key}'"
            )));
         }
         value
      } else {
         let start = pos;
         while pos < bytes.len() && bytes[pos] != b';' {
            pos += 1;
         }
         raw[start..pos].trim_end().to_string()
      };

      pairs.push((key.to_string(), value));
   }

   Ok(pairs)
}

/// Re-serialize with keywords in lexicographic order and a fixed escaping rule.
fn serialize(values: &IndexMap<Keyword, String>, mask_password: bool) -> String {
   let mut entries: Vec<(&'static str, &str)> = values
      .iter()
      .map(|(keyword, value)| {
         let value = if mask_password && *keyword == Keyword::Pwd {
            "***"
         } else {
            value.as_str()
         };
         (keyword.as_str(), value)
      })
      .collect();
   entries.sort_by(|a, b| a.0.cmp(b.0));

   let mut out = String::new();
   for (keyword, value) in entries {
      out.push_str(keyword);
      out.push('=');
      push_escaped(&mut out, value);
      out.push(';');
   }
   out
}

fn push_escaped(out: &mut String, value: &str) {
   let needs_braces = value.contains([';', '{', '}', '='])
      || value.starts_with(char::is_whitespace)
      || value.ends_with(char::is_whitespace);

   if needs_braces {
      out.push('{');
      out.push_str(&value.replace('}', "}}"));
      out.push('}');
   } else {
      out.push_str(value);
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn parse(raw: &str) -> Result<ConnectionOptions> {
      ConnectionOptions::parse(raw, KeywordPolicy::default(), 1024)
   }

   #[test]
   fn test_order_and_case_do_not_change_canonical_key() {
      let a = parse("Driver=X;Server=s1;UID=u").unwrap();
      let b = parse("UID=u;driver=X;SERVER=s1").unwrap();
      assert_eq!(a.canonical_key(), b.canonical_key());
      assert_eq!(a.canonical_key().as_str(), "driver=X;server=s1;uid=u;");
   }

   #[test]
   fn test_aliases_and_bracing_normalize() {
      let a = parse("Driver={SQL Server};Server=s1;User ID=u;Password=p").unwrap();
      let b = parse("pwd=p;uid=u;host=s1;driver=SQL Server").unwrap();
      assert_eq!(a.canonical_key(), b.canonical_key());
      assert_eq!(a.get(Keyword::Driver), Some("SQL Server"));
   }

   #[test]
   fn test_values_stay_case_sensitive() {
      let a = parse("Driver=X;Database=Sales").unwrap();
      let b = parse("Driver=X;Database=sales").unwrap();
      assert_ne!(a.canonical_key(), b.canonical_key());
   }

   #[test]
   fn test_last_duplicate_wins() {
      let options = parse("Driver=X;Server=s1;server=s2").unwrap();
      assert_eq!(options.get(Keyword::Server), Some("s2"));
      assert_eq!(
         options.keywords().collect::<Vec<_>>(),
         vec![Keyword::Driver, Keyword::Server]
      );
   }

   #[test]
   fn test_empty_and_whitespace_strings_fail() {
      assert!(matches!(parse(""), Err(Error::Configuration(_))));
      assert!(matches!(parse("  ;; "), Err(Error::Configuration(_))));
   }

   #[test]
   fn test_malformed_strings_fail() {
      assert!(matches!(parse("Driver"), Err(Error::Configuration(_))));
      assert!(matches!(parse("Driver;Server=s"), Err(Error::Configuration(_))));
      assert!(matches!(parse("=x"), Err(Error::Configuration(_))));
      assert!(matches!(parse("Driver={X"), Err(Error::Configuration(_))));
      assert!(matches!(parse("Driver={X}y"), Err(Error::Configuration(_))));
      assert!(matches!(parse("Driver=X;Port=abc"), Err(Error::Configuration(_))));
   }

   #[test]
   fn test_unknown_keyword_policy() {
      assert!(matches!(
         parse("Driver=X;Flavor=mint"),
         Err(Error::Configuration(msg)) if msg.contains("flavor") || msg.contains("Flavor")
      ));

      let lenient = KeywordPolicy {
         ignore_unknown: true,
      };
      let a = ConnectionOptions::parse("Driver=X;Flavor=mint", lenient, 1024).unwrap();
      let b = ConnectionOptions::parse("Driver=X", lenient, 1024).unwrap();
      assert_eq!(a.canonical_key(), b.canonical_key());
   }

   #[test]
   fn test_length_limit() {
      let long = format!("Driver=X;Database={}", "d".repeat(64));
      assert!(ConnectionOptions::parse(&long, KeywordPolicy::default(), 32).is_err());
      assert!(ConnectionOptions::parse(&long, KeywordPolicy::default(), 1024).is_ok());
   }

   #[test]
   fn test_escaped_values_round_trip_through_canonical_form() {
      let options = parse("Driver=X;PWD={a;b}}c}").unwrap();
      assert_eq!(options.get(Keyword::Pwd), Some("a;b}c"));
      assert_eq!(options.canonical_key().as_str(), "driver=X;pwd={a;b}}c};");

      let reparsed = parse(options.canonical_key().as_str()).unwrap();
      assert_eq!(reparsed.canonical_key(), options.canonical_key());
   }

   #[test]
   fn test_redaction_hides_password() {
      let options = parse("Driver=X;UID=u;PWD=secret").unwrap();
      assert_eq!(options.redacted(), "driver=X;pwd=***;uid=u;");
      assert!(!format!("{options:?}").contains("secret"));
      assert!(!format!("{:?}", options.canonical_key()).contains("secret"));
   }

   #[test]
   fn test_validate_for_connect_requires_a_target() {
      assert!(parse("Driver=X").unwrap().validate_for_connect().is_ok());
      assert!(parse("DSN=warehouse").unwrap().validate_for_connect().is_ok());
      assert!(matches!(
         parse("Server=s1;UID=u").unwrap().validate_for_connect(),
         Err(Error::ConnectionCreation { .. })
      ));
   }
}
