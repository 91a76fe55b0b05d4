//! The shared `pluggable_metadata` schema: the tenant registry the janitor
//! sweeps from, and the dynamic-target delete helpers.
//!
//! Targets are registered on the upsert path (inside the provisioner's table
//! factory), so the registry row is written in the same provisioning round as
//! the table DDL, once per target per process lifetime. The registry itself
//! is created at `Init`.

use tokio_postgres::GenericClient;

use crate::error::StoreError;
use crate::routing::StateTarget;

pub const METADATA_SCHEMA: &str = "pluggable_metadata";

const CREATE_METADATA_SCHEMA: &str =
    "CREATE SCHEMA IF NOT EXISTS pluggable_metadata";

const CREATE_TENANT_TABLE: &str = "CREATE TABLE IF NOT EXISTS pluggable_metadata.tenant (
    tenant_id       text        NOT NULL,
    schema_id       text        NOT NULL,
    table_id        text        NOT NULL,
    last_expired_at timestamptz,
    PRIMARY KEY (schema_id, table_id)
)";

// The delete helpers take the target as a regclass so the dynamic table name
// never reaches the statement as raw text; a NULL regclass (missing table)
// reports "nothing deleted" instead of raising.
const CREATE_DELETE_FN: &str = r#"
CREATE OR REPLACE FUNCTION pluggable_metadata.delete_key_v1(target regclass, state_key text)
RETURNS boolean
LANGUAGE plpgsql
AS $fn$
DECLARE
    deleted integer;
BEGIN
    IF target IS NULL THEN
        RETURN false;
    END IF;
    EXECUTE format('DELETE FROM %s WHERE key = $1', target) USING state_key;
    GET DIAGNOSTICS deleted = ROW_COUNT;
    RETURN deleted > 0;
END;
$fn$
"#;

const CREATE_DELETE_WITH_ETAG_FN: &str = r#"
CREATE OR REPLACE FUNCTION pluggable_metadata.delete_key_with_etag_v1(
    target regclass,
    state_key text,
    expected_etag uuid
)
RETURNS boolean
LANGUAGE plpgsql
AS $fn$
DECLARE
    deleted integer;
BEGIN
    IF target IS NULL THEN
        RETURN false;
    END IF;
    EXECUTE format('DELETE FROM %s WHERE key = $1 AND etag = $2', target)
        USING state_key, expected_etag;
    GET DIAGNOSTICS deleted = ROW_COUNT;
    RETURN deleted > 0;
END;
$fn$
"#;

/// Create the metadata schema, the tenant registry and the delete helpers.
/// Idempotent; runs once per `Init`.
pub async fn ensure_metadata_objects<C: GenericClient>(client: &C) -> Result<(), StoreError> {
    for stmt in [
        CREATE_METADATA_SCHEMA,
        CREATE_TENANT_TABLE,
        CREATE_DELETE_FN,
        CREATE_DELETE_WITH_ETAG_FN,
    ] {
        client.execute(stmt, &[]).await?;
    }
    Ok(())
}

/// A registry row: the tenant that provisioned a target, and the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredTarget {
    pub tenant_id: String,
    pub target: StateTarget,
}

/// Record a provisioned target so the janitor can find it. Targets are
/// keyed physically; re-registration is a no-op.
pub async fn register_target<C: GenericClient>(
    client: &C,
    tenant_id: &str,
    target: &StateTarget,
) -> Result<(), StoreError> {
    client
        .execute(
            "INSERT INTO pluggable_metadata.tenant (tenant_id, schema_id, table_id) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (schema_id, table_id) DO NOTHING",
            &[&tenant_id, &target.schema(), &target.table()],
        )
        .await?;
    Ok(())
}

/// The registered target that has gone longest without an expiration sweep.
/// Never-swept targets sort first.
pub async fn least_recently_expired<C: GenericClient>(
    client: &C,
) -> Result<Option<RegisteredTarget>, StoreError> {
    let row = client
        .query_opt(
            "SELECT tenant_id, schema_id, table_id FROM pluggable_metadata.tenant \
             ORDER BY last_expired_at ASC NULLS FIRST \
             LIMIT 1",
            &[],
        )
        .await?;
    row.map(|row| {
        let schema: String = row.try_get(1)?;
        let table: String = row.try_get(2)?;
        Ok(RegisteredTarget {
            tenant_id: row.try_get(0)?,
            target: StateTarget::new(schema, table),
        })
    })
    .transpose()
}

/// Stamp a target as just swept.
pub async fn mark_expired<C: GenericClient>(
    client: &C,
    target: &StateTarget,
) -> Result<(), StoreError> {
    client
        .execute(
            "UPDATE pluggable_metadata.tenant SET last_expired_at = now() \
             WHERE schema_id = $1 AND table_id = $2",
            &[&target.schema(), &target.table()],
        )
        .await?;
    Ok(())
}
