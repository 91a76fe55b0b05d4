//! Primitive operations against a single `(schema, table)` target.
//!
//! Everything here is generic over [`GenericClient`] so the same statements
//! run on a pooled client or inside an open transaction. Target identifiers
//! come exclusively from the routing helper and are interpolated
//! double-quoted; keys, documents, etags and ttls are bound parameters.
//!
//! The row-version token is a v4 UUID regenerated on every successful write
//! and stored in the `etag` column. Caller-supplied tokens are parsed before
//! any SQL is sent, which is what makes `EtagInvalid` distinguishable from
//! `EtagMismatch`.

use tokio_postgres::GenericClient;
use uuid::Uuid;

use crate::error::StoreError;
use crate::registry::METADATA_SCHEMA;
use crate::routing::StateTarget;

/// A stored document together with its current row-version token.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRow {
    pub value: serde_json::Value,
    pub etag: Uuid,
}

/// Parse a caller-supplied etag under the store's representation.
pub fn parse_etag(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|_| StoreError::EtagInvalid(raw.to_owned()))
}

pub async fn create_schema_if_absent<C: GenericClient>(
    client: &C,
    target: &StateTarget,
) -> Result<(), StoreError> {
    let stmt = format!(
        "CREATE SCHEMA IF NOT EXISTS {}",
        crate::routing::quote_ident(target.schema())
    );
    client.execute(stmt.as_str(), &[]).await?;
    Ok(())
}

pub async fn create_table_if_absent<C: GenericClient>(
    client: &C,
    target: &StateTarget,
) -> Result<(), StoreError> {
    let stmt = format!(
        "CREATE TABLE IF NOT EXISTS {} (
            key         text        PRIMARY KEY,
            value       jsonb       NOT NULL,
            etag        uuid        NOT NULL,
            inserted_at timestamptz NOT NULL DEFAULT now(),
            updated_at  timestamptz,
            expires_at  timestamptz
        )",
        target.qualified()
    );
    client.execute(stmt.as_str(), &[]).await?;
    Ok(())
}

/// Read one row. Rows whose `expires_at` has passed are reported as absent
/// even if the janitor has not reaped them yet.
pub async fn get<C: GenericClient>(
    client: &C,
    target: &StateTarget,
    key: &str,
) -> Result<Option<StateRow>, StoreError> {
    let stmt = format!(
        "SELECT value, etag FROM {} \
         WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        target.qualified()
    );
    let row = client.query_opt(stmt.as_str(), &[&key]).await?;
    row.map(|row| {
        Ok(StateRow {
            value: row.try_get(0)?,
            etag: row.try_get(1)?,
        })
    })
    .transpose()
}

/// Insert or update one row, returning the fresh etag.
///
/// Without an expected etag this is a plain upsert. With one, it is a
/// conditional update: zero matched rows (no such key, a different stored
/// etag, or an expired row) is an [`StoreError::EtagMismatch`].
pub async fn upsert<C: GenericClient>(
    client: &C,
    target: &StateTarget,
    key: &str,
    value: &serde_json::Value,
    expected_etag: Option<Uuid>,
    ttl_seconds: Option<u32>,
) -> Result<Uuid, StoreError> {
    let new_etag = Uuid::new_v4();
    // A NULL ttl clears expires_at: make_interval is strict, so the whole
    // expression collapses to NULL.
    let ttl = ttl_seconds.map(f64::from);

    match expected_etag {
        None => {
            let stmt = format!(
                "INSERT INTO {} (key, value, etag, expires_at) \
                 VALUES ($1, $2, $3, now() + make_interval(secs => $4::double precision)) \
                 ON CONFLICT (key) DO UPDATE \
                 SET value = excluded.value, \
                     etag = excluded.etag, \
                     updated_at = now(), \
                     expires_at = excluded.expires_at",
                target.qualified()
            );
            client
                .execute(stmt.as_str(), &[&key, value, &new_etag, &ttl])
                .await?;
        }
        Some(expected) => {
            let stmt = format!(
                "UPDATE {} \
                 SET value = $2, \
                     etag = $3, \
                     updated_at = now(), \
                     expires_at = now() + make_interval(secs => $4::double precision) \
                 WHERE key = $1 AND etag = $5 \
                   AND (expires_at IS NULL OR expires_at > now())",
                target.qualified()
            );
            let updated = client
                .execute(stmt.as_str(), &[&key, value, &new_etag, &ttl, &expected])
                .await?;
            if updated == 0 {
                return Err(StoreError::EtagMismatch);
            }
        }
    }
    Ok(new_etag)
}

/// Delete one row, optionally conditional on its etag.
///
/// The target table name is dynamic, so deletion goes through the
/// `delete_key_v1` helper functions: the target is passed as text, resolved
/// with `to_regclass`, and executed inside the function. A missing table
/// resolves to NULL and the helpers report "nothing deleted", which keeps the
/// unconditional path a no-op rather than an error.
pub async fn delete<C: GenericClient>(
    client: &C,
    target: &StateTarget,
    key: &str,
    expected_etag: Option<Uuid>,
) -> Result<(), StoreError> {
    match expected_etag {
        None => {
            let stmt =
                format!("SELECT {METADATA_SCHEMA}.delete_key_v1(to_regclass($1), $2)");
            client.execute(stmt.as_str(), &[&target.qualified(), &key]).await?;
            Ok(())
        }
        Some(expected) => {
            let stmt = format!(
                "SELECT {METADATA_SCHEMA}.delete_key_with_etag_v1(to_regclass($1), $2, $3)"
            );
            let row = client
                .query_one(stmt.as_str(), &[&target.qualified(), &key, &expected])
                .await?;
            let deleted: bool = row.try_get(0)?;
            if deleted {
                Ok(())
            } else {
                Err(StoreError::EtagMismatch)
            }
        }
    }
}

/// Reap every expired row in the target, returning how many were deleted.
pub async fn delete_expired<C: GenericClient>(
    client: &C,
    target: &StateTarget,
) -> Result<u64, StoreError> {
    let stmt = format!(
        "DELETE FROM {} WHERE expires_at IS NOT NULL AND expires_at < now()",
        target.qualified()
    );
    Ok(client.execute(stmt.as_str(), &[]).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_etags_parse() {
        let etag = Uuid::new_v4();
        assert_eq!(parse_etag(&etag.to_string()).unwrap(), etag);
    }

    #[test]
    fn malformed_etags_are_invalid_not_mismatched() {
        for raw in ["", "not-a-valid-etag", "12345", "g2f0b3c4-..."] {
            match parse_etag(raw) {
                Err(StoreError::EtagInvalid(reported)) => assert_eq!(reported, raw),
                other => panic!("expected EtagInvalid for {raw:?}, got {other:?}"),
            }
        }
    }
}
