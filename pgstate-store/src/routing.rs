//! Derivation of the physical `(schema, table)` target for an operation.
//!
//! The derivation is total: it either produces a [`StateTarget`] or fails
//! with a classified error. Identifiers built here are the only identifiers
//! the adapter ever interpolates into SQL, and they are always emitted
//! double-quoted; everything user-controlled beyond the tenant id flows
//! through bound parameters.

use std::collections::HashMap;

use crate::config::{metadata, StoreConfig, TenantMode};
use crate::error::StoreError;

/// PostgreSQL truncates identifiers beyond this many bytes (`NAMEDATALEN - 1`).
/// Truncation would let two long tenant ids collide on the same physical
/// target, so oversized identifiers are rejected instead.
pub const MAX_IDENTIFIER_BYTES: usize = 63;

/// A concrete physical location for state rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateTarget {
    schema: String,
    table: String,
}

impl StateTarget {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        StateTarget {
            schema: schema.into(),
            table: table.into(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// The quoted, schema-qualified name, e.g. `"T1-public"."state"`. Safe to
    /// interpolate into SQL and parseable by `to_regclass`.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// Provisioner key for the schema half of this target.
    pub fn schema_resource_key(&self) -> String {
        format!("S:{}", self.schema)
    }

    /// Provisioner key for the table half of this target.
    pub fn table_resource_key(&self) -> String {
        format!("T:{}.{}", self.schema, self.table)
    }
}

/// Double-quote an identifier, escaping embedded quotes by doubling them.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn check_identifier(ident: &str, role: &str) -> Result<(), StoreError> {
    if ident.len() > MAX_IDENTIFIER_BYTES {
        return Err(StoreError::InvalidArgument(format!(
            "derived {role} name is {} bytes long; the maximum is {MAX_IDENTIFIER_BYTES}",
            ident.len()
        )));
    }
    if ident.contains('\0') {
        return Err(StoreError::InvalidArgument(format!(
            "derived {role} name contains a NUL byte"
        )));
    }
    Ok(())
}

/// Resolve the routing target for one operation.
pub fn resolve_target(
    config: &StoreConfig,
    operation_metadata: &HashMap<String, String>,
) -> Result<StateTarget, StoreError> {
    let tenant_id = operation_metadata
        .get(metadata::TENANT_ID)
        .map(String::as_str)
        .filter(|id| !id.is_empty());

    let target = match (config.tenant_mode, tenant_id) {
        (TenantMode::None, _) => StateTarget::new(&*config.schema, &*config.table),
        (TenantMode::Schema, Some(tenant)) => {
            StateTarget::new(format!("{tenant}-{}", config.schema), &*config.table)
        }
        (TenantMode::Table, Some(tenant)) => {
            StateTarget::new(&*config.schema, format!("{tenant}-{}", config.table))
        }
        (TenantMode::Schema | TenantMode::Table, None) => return Err(StoreError::MissingTenant),
    };

    check_identifier(&target.schema, "schema")?;
    check_identifier(&target.table, "table")?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::StoreConfig;

    fn config(tenant_mode: TenantMode) -> StoreConfig {
        StoreConfig {
            connection_string: "host=localhost".into(),
            tenant_mode,
            schema: "public".into(),
            table: "state".into(),
            cleanup_interval: std::time::Duration::from_secs(5),
            max_connections: 4,
        }
    }

    fn tenant_meta(id: &str) -> HashMap<String, String> {
        HashMap::from([("tenantId".to_string(), id.to_string())])
    }

    #[test]
    fn no_tenant_mode_uses_defaults() {
        let target = resolve_target(&config(TenantMode::None), &HashMap::new()).unwrap();
        assert_eq!(target, StateTarget::new("public", "state"));

        // A tenant id is ignored when no tenant mode is configured.
        let target = resolve_target(&config(TenantMode::None), &tenant_meta("T1")).unwrap();
        assert_eq!(target, StateTarget::new("public", "state"));
    }

    #[test]
    fn schema_mode_prefixes_schema_only() {
        let target = resolve_target(&config(TenantMode::Schema), &tenant_meta("T1")).unwrap();
        assert_eq!(target, StateTarget::new("T1-public", "state"));
    }

    #[test]
    fn table_mode_prefixes_table_only() {
        let target = resolve_target(&config(TenantMode::Table), &tenant_meta("T1")).unwrap();
        assert_eq!(target, StateTarget::new("public", "T1-state"));
    }

    #[test]
    fn tenant_required_but_absent_fails() {
        for mode in [TenantMode::Schema, TenantMode::Table] {
            let err = resolve_target(&config(mode), &HashMap::new()).unwrap_err();
            assert!(matches!(err, StoreError::MissingTenant));

            let err = resolve_target(&config(mode), &tenant_meta("")).unwrap_err();
            assert!(matches!(err, StoreError::MissingTenant));
        }
    }

    #[test]
    fn oversized_tenant_is_rejected() {
        let long = "t".repeat(80);
        let err = resolve_target(&config(TenantMode::Schema), &tenant_meta(&long)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn quoting_doubles_embedded_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(
            StateTarget::new("T1-public", "state").qualified(),
            "\"T1-public\".\"state\""
        );
    }

    // Distinct tenants must never resolve to the same physical target, no
    // matter what their ids look like.
    #[test_strategy::proptest]
    fn distinct_tenants_get_distinct_targets(
        #[strategy(r#"["'a-zA-Z0-9.;$ -]{1,20}"#)] t1: String,
        #[strategy(r#"["'a-zA-Z0-9.;$ -]{1,20}"#)] t2: String,
    ) {
        proptest::prop_assume!(t1 != t2);
        for mode in [TenantMode::Schema, TenantMode::Table] {
            let a = resolve_target(&config(mode), &tenant_meta(&t1)).unwrap();
            let b = resolve_target(&config(mode), &tenant_meta(&t2)).unwrap();
            proptest::prop_assert_ne!(&a, &b);
            proptest::prop_assert_ne!(a.qualified(), b.qualified());
        }
    }

    // The tenant id appears in exactly the component the mode selects.
    #[test_strategy::proptest]
    fn tenant_prefix_lands_where_configured(#[strategy("[a-zA-Z0-9_-]{1,20}")] tenant: String) {
        let schema_mode = resolve_target(&config(TenantMode::Schema), &tenant_meta(&tenant))
            .unwrap();
        let expected_schema = format!("{tenant}-public");
        proptest::prop_assert_eq!(schema_mode.schema(), expected_schema.as_str());
        proptest::prop_assert_eq!(schema_mode.table(), "state");

        let table_mode = resolve_target(&config(TenantMode::Table), &tenant_meta(&tenant))
            .unwrap();
        proptest::prop_assert_eq!(table_mode.schema(), "public");
        let expected_table = format!("{tenant}-state");
        proptest::prop_assert_eq!(table_mode.table(), expected_table.as_str());
    }
}
