//! Component configuration and per-operation metadata.
//!
//! Configuration arrives once, as the string map in the sidecar's `Init`
//! request; metadata arrives on every operation. Both use the property names
//! the sidecar protocol fixes (`connectionString`, `tenantId`, ...), so the
//! constants below are spelled in that convention rather than ours.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::StoreError;

/// Recognized `Init.properties` keys. Unknown keys are ignored.
pub mod properties {
    pub const CONNECTION_STRING: &str = "connectionString";
    pub const TENANT: &str = "tenant";
    pub const SCHEMA: &str = "schema";
    pub const TABLE: &str = "table";
    pub const CLEANUP_INTERVAL_IN_SECONDS: &str = "cleanupIntervalInSeconds";
    pub const MAX_CONNECTIONS: &str = "maxConnections";
}

/// Recognized per-operation metadata keys. Unknown keys are ignored.
pub mod metadata {
    pub const TENANT_ID: &str = "tenantId";
    pub const TTL_IN_SECONDS: &str = "ttlInSeconds";
}

pub const DEFAULT_SCHEMA: &str = "public";
pub const DEFAULT_TABLE: &str = "state";
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

/// How the tenant id in operation metadata rewrites the routing target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantMode {
    /// No tenant rewriting; every operation lands in the default target.
    None,
    /// The tenant id prefixes the schema name.
    Schema,
    /// The tenant id prefixes the table name.
    Table,
}

/// Validated component configuration, parsed from `Init.properties`.
#[derive(Clone)]
pub struct StoreConfig {
    pub connection_string: String,
    pub tenant_mode: TenantMode,
    pub schema: String,
    pub table: String,
    pub cleanup_interval: Duration,
    pub max_connections: usize,
}

impl StoreConfig {
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self, StoreError> {
        let connection_string = properties
            .get(properties::CONNECTION_STRING)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                StoreError::Config(format!(
                    "missing mandatory property {:?}",
                    properties::CONNECTION_STRING
                ))
            })?
            .clone();

        let tenant_mode = match properties.get(properties::TENANT).map(String::as_str) {
            None | Some("") => TenantMode::None,
            Some("schema") => TenantMode::Schema,
            Some("table") => TenantMode::Table,
            Some(other) => {
                return Err(StoreError::Config(format!(
                    "unrecognized {:?} value {other:?}; expected \"schema\" or \"table\"",
                    properties::TENANT
                )))
            }
        };

        let schema = properties
            .get(properties::SCHEMA)
            .filter(|s| !s.is_empty())
            .map_or_else(|| DEFAULT_SCHEMA.to_owned(), Clone::clone);
        let table = properties
            .get(properties::TABLE)
            .filter(|s| !s.is_empty())
            .map_or_else(|| DEFAULT_TABLE.to_owned(), Clone::clone);

        let cleanup_interval = match properties.get(properties::CLEANUP_INTERVAL_IN_SECONDS) {
            None => DEFAULT_CLEANUP_INTERVAL,
            Some(raw) => {
                let secs = raw.parse::<u64>().map_err(|_| {
                    StoreError::Config(format!(
                        "{:?} must be a positive integer, got {raw:?}",
                        properties::CLEANUP_INTERVAL_IN_SECONDS
                    ))
                })?;
                if secs == 0 {
                    return Err(StoreError::Config(format!(
                        "{:?} must be a positive integer, got {raw:?}",
                        properties::CLEANUP_INTERVAL_IN_SECONDS
                    )));
                }
                Duration::from_secs(secs)
            }
        };

        let max_connections = match properties.get(properties::MAX_CONNECTIONS) {
            None => DEFAULT_MAX_CONNECTIONS,
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(StoreError::Config(format!(
                        "{:?} must be a positive integer, got {raw:?}",
                        properties::MAX_CONNECTIONS
                    )))
                }
            },
        };

        Ok(StoreConfig {
            connection_string,
            tenant_mode,
            schema,
            table,
            cleanup_interval,
            max_connections,
        })
    }
}

// The connection string carries credentials; keep it out of logs.
impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("connection_string", &"<redacted>")
            .field("tenant_mode", &self.tenant_mode)
            .field("schema", &self.schema)
            .field("table", &self.table)
            .field("cleanup_interval", &self.cleanup_interval)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Parse `ttlInSeconds` from operation metadata. Absent or `0` both mean "no
/// expiry" (and clear any previous one).
pub fn ttl_from_metadata(metadata: &HashMap<String, String>) -> Result<Option<u32>, StoreError> {
    match metadata.get(metadata::TTL_IN_SECONDS) {
        None => Ok(None),
        Some(raw) => match raw.parse::<u32>() {
            Ok(0) => Ok(None),
            Ok(secs) => Ok(Some(secs)),
            Err(_) => Err(StoreError::InvalidArgument(format!(
                "metadata.{} must be a non-negative integer, got {raw:?}",
                metadata::TTL_IN_SECONDS
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply() {
        let config =
            StoreConfig::from_properties(&props(&[("connectionString", "host=localhost")]))
                .unwrap();
        assert_eq!(config.tenant_mode, TenantMode::None);
        assert_eq!(config.schema, "public");
        assert_eq!(config.table, "state");
        assert_eq!(config.cleanup_interval, Duration::from_secs(5));
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn tenant_modes_parse() {
        for (value, expected) in [("schema", TenantMode::Schema), ("table", TenantMode::Table)] {
            let config = StoreConfig::from_properties(&props(&[
                ("connectionString", "host=localhost"),
                ("tenant", value),
            ]))
            .unwrap();
            assert_eq!(config.tenant_mode, expected);
        }
    }

    #[test]
    fn missing_connection_string_is_config_error() {
        let err = StoreConfig::from_properties(&props(&[("tenant", "schema")])).unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn unrecognized_tenant_mode_is_config_error() {
        let err = StoreConfig::from_properties(&props(&[
            ("connectionString", "host=localhost"),
            ("tenant", "database"),
        ]))
        .unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn unknown_properties_are_ignored() {
        let config = StoreConfig::from_properties(&props(&[
            ("connectionString", "host=localhost"),
            ("actorStateStore", "true"),
        ]))
        .unwrap();
        assert_eq!(config.schema, "public");
    }

    #[test]
    fn cleanup_interval_overrides() {
        let config = StoreConfig::from_properties(&props(&[
            ("connectionString", "host=localhost"),
            ("cleanupIntervalInSeconds", "30"),
        ]))
        .unwrap();
        assert_eq!(config.cleanup_interval, Duration::from_secs(30));

        for bad in ["0", "-1", "soon"] {
            let err = StoreConfig::from_properties(&props(&[
                ("connectionString", "host=localhost"),
                ("cleanupIntervalInSeconds", bad),
            ]))
            .unwrap_err();
            assert!(matches!(err, StoreError::Config(_)), "{bad:?}");
        }
    }

    #[test]
    fn ttl_parses_and_zero_clears() {
        let meta = props(&[("ttlInSeconds", "15")]);
        assert_eq!(ttl_from_metadata(&meta).unwrap(), Some(15));

        let meta = props(&[("ttlInSeconds", "0")]);
        assert_eq!(ttl_from_metadata(&meta).unwrap(), None);

        assert_eq!(ttl_from_metadata(&HashMap::new()).unwrap(), None);
    }

    #[test]
    fn malformed_ttl_is_rejected() {
        for bad in ["-3", "forever", "1.5"] {
            let meta = props(&[("ttlInSeconds", bad)]);
            let err = ttl_from_metadata(&meta).unwrap_err();
            assert!(matches!(err, StoreError::InvalidArgument(_)), "{bad:?}");
        }
    }

    #[test]
    fn debug_redacts_credentials() {
        let config = StoreConfig::from_properties(&props(&[(
            "connectionString",
            "host=localhost password=hunter2",
        )]))
        .unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
