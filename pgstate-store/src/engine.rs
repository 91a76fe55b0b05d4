//! The outward-facing state-store operations.
//!
//! Each operation takes a fresh pooled connection, derives its routing
//! target, opens a transaction where the contract requires one and delegates
//! to the adapter. The engine owns no mutable state beyond the configuration
//! snapshot taken at `Init`; the only cross-operation memory is the
//! process-global provisioner handed in at construction.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Transaction};
use futures::future::join_all;
use metrics::counter;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::{metadata, ttl_from_metadata, StoreConfig};
use crate::error::StoreError;
use crate::janitor::ExpirationJanitor;
use crate::pg::{self, StateRow};
use crate::provision::ResourceProvisioner;
use crate::registry;
use crate::routing::{resolve_target, StateTarget};

/// Capabilities advertised to the sidecar.
pub const FEATURES: &[&str] = &["ETAG", "TRANSACTIONAL"];

#[derive(Debug, Clone)]
pub struct GetOperation {
    pub key: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SetOperation {
    pub key: String,
    pub value: serde_json::Value,
    /// Raw caller-supplied etag; parsed (and possibly rejected) before any
    /// SQL runs.
    pub etag: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct DeleteOperation {
    pub key: String,
    pub etag: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// One element of a transactional batch. Every element carries its own
/// metadata, so a single batch may span several tenants.
#[derive(Debug, Clone)]
pub enum TransactOperation {
    Set(SetOperation),
    Delete(DeleteOperation),
}

/// Per-item outcome of a bulk read.
#[derive(Debug)]
pub struct BulkGetEntry {
    pub key: String,
    pub result: Result<Option<StateRow>, StoreError>,
}

struct EngineInner {
    config: StoreConfig,
    pool: Pool,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

/// The tenant-isolating PostgreSQL state store.
pub struct StateStore {
    provisioner: Arc<ResourceProvisioner>,
    janitor_shutdown: CancellationToken,
    inner: tokio::sync::RwLock<Option<Arc<EngineInner>>>,
}

impl StateStore {
    /// `shutdown` is the host's token: cancelling it stops the janitor; call
    /// [`StateStore::shutdown`] afterwards to join it.
    pub fn new(provisioner: Arc<ResourceProvisioner>, shutdown: &CancellationToken) -> Self {
        StateStore {
            provisioner,
            janitor_shutdown: shutdown.child_token(),
            inner: tokio::sync::RwLock::new(None),
        }
    }

    /// Validate and store the configuration, probe connectivity, create the
    /// shared metadata objects and start the janitor. Idempotent: a second
    /// `Init` on an initialized store is a no-op.
    pub async fn init(&self, properties: &HashMap<String, String>) -> Result<(), StoreError> {
        let mut slot = self.inner.write().await;
        if slot.is_some() {
            info!("state store already initialized, ignoring repeated Init");
            return Ok(());
        }

        let config = StoreConfig::from_properties(properties)?;
        let pool = build_pool(&config)?;
        {
            let client = pool.get().await?;
            client.execute("SELECT 1", &[]).await?;
            registry::ensure_metadata_objects(&**client).await?;
        }
        let janitor = ExpirationJanitor::spawn(
            pool.clone(),
            config.cleanup_interval,
            self.janitor_shutdown.clone(),
        );
        info!(?config, "state store initialized");
        *slot = Some(Arc::new(EngineInner {
            config,
            pool,
            janitor: Mutex::new(Some(janitor)),
        }));
        Ok(())
    }

    /// Healthy iff a pooled connection completes a round-trip.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let inner = self.snapshot().await?;
        let client = inner.pool.get().await?;
        client.execute("SELECT 1", &[]).await?;
        Ok(())
    }

    pub fn features(&self) -> &'static [&'static str] {
        FEATURES
    }

    #[instrument(level = "debug", skip_all, fields(key = %operation.key))]
    pub async fn get(&self, operation: &GetOperation) -> Result<Option<StateRow>, StoreError> {
        let inner = self.snapshot().await?;
        let target = resolve_target(&inner.config, &operation.metadata)?;
        let client = inner.pool.get().await?;
        counter!("pgstate_operations_total", "op" => "get").increment(1);
        // An absent tenant table is equivalent to an absent row.
        match pg::get(&**client, &target, &operation.key).await {
            Err(StoreError::TableMissing) => Ok(None),
            other => other,
        }
    }

    #[instrument(level = "debug", skip_all, fields(key = %operation.key))]
    pub async fn set(&self, operation: &SetOperation) -> Result<(), StoreError> {
        let inner = self.snapshot().await?;
        let plan = SetPlan::new(&inner.config, operation)?;
        self.ensure_target(&inner, &plan.tenant_id, &plan.target)
            .await?;

        let mut client = inner.pool.get().await?;
        let txn = client.transaction().await?;
        match pg::upsert(
            &*txn,
            &plan.target,
            &operation.key,
            &operation.value,
            plan.etag,
            plan.ttl,
        )
        .await
        {
            Ok(_new_etag) => {
                txn.commit().await?;
                counter!("pgstate_operations_total", "op" => "set").increment(1);
                Ok(())
            }
            Err(err) => {
                if matches!(err, StoreError::EtagMismatch) {
                    counter!("pgstate_etag_conflicts_total").increment(1);
                }
                rollback_quietly(txn).await;
                Err(err)
            }
        }
    }

    #[instrument(level = "debug", skip_all, fields(key = %operation.key))]
    pub async fn delete(&self, operation: &DeleteOperation) -> Result<(), StoreError> {
        let inner = self.snapshot().await?;
        let target = resolve_target(&inner.config, &operation.metadata)?;
        let etag = operation.etag.as_deref().map(pg::parse_etag).transpose()?;

        let mut client = inner.pool.get().await?;
        let txn = client.transaction().await?;
        match pg::delete(&*txn, &target, &operation.key, etag).await {
            Ok(()) => {
                txn.commit().await?;
                counter!("pgstate_operations_total", "op" => "delete").increment(1);
                Ok(())
            }
            // Deleting from a tenant that never wrote anything is a no-op.
            Err(StoreError::TableMissing) => {
                rollback_quietly(txn).await;
                Ok(())
            }
            Err(err) => {
                if matches!(err, StoreError::EtagMismatch) {
                    counter!("pgstate_etag_conflicts_total").increment(1);
                }
                rollback_quietly(txn).await;
                Err(err)
            }
        }
    }

    /// Run a heterogeneous batch of sets and deletes in one transaction:
    /// either every operation commits or the first failure rolls all of them
    /// back.
    #[instrument(level = "debug", skip_all, fields(operations = operations.len()))]
    pub async fn bulk_transact(&self, operations: &[TransactOperation]) -> Result<(), StoreError> {
        let inner = self.snapshot().await?;
        if operations.is_empty() {
            return Ok(());
        }

        // Validate and route everything up-front so malformed input fails
        // before any SQL runs.
        let mut planned = Vec::with_capacity(operations.len());
        for operation in operations {
            planned.push(Planned::new(&inner.config, operation)?);
        }

        // DDL inside the transaction would be undone by a rollback, so all
        // write targets are provisioned first.
        let mut provisioned = HashSet::new();
        for plan in &planned {
            if let Planned::Set(_, set_plan) = plan {
                if provisioned.insert(set_plan.target.clone()) {
                    self.ensure_target(&inner, &set_plan.tenant_id, &set_plan.target)
                        .await?;
                }
            }
        }

        let mut client = inner.pool.get().await?;
        let txn = client.transaction().await?;
        for plan in &planned {
            let result = match plan {
                Planned::Set(op, set_plan) => pg::upsert(
                    &*txn,
                    &set_plan.target,
                    &op.key,
                    &op.value,
                    set_plan.etag,
                    set_plan.ttl,
                )
                .await
                .map(drop),
                Planned::Delete(op, target, etag) => {
                    match pg::delete(&*txn, target, &op.key, *etag).await {
                        Err(StoreError::TableMissing) => Ok(()),
                        other => other,
                    }
                }
            };
            if let Err(err) = result {
                rollback_quietly(txn).await;
                return Err(err);
            }
        }
        txn.commit().await?;
        counter!("pgstate_operations_total", "op" => "bulk_transact").increment(1);
        Ok(())
    }

    /// Independent concurrent reads; per-item outcomes, no transaction.
    pub async fn bulk_get(&self, items: &[GetOperation]) -> Result<Vec<BulkGetEntry>, StoreError> {
        self.snapshot().await?;
        Ok(join_all(items.iter().map(|item| async move {
            BulkGetEntry {
                key: item.key.clone(),
                result: self.get(item).await,
            }
        }))
        .await)
    }

    pub async fn bulk_set(&self, items: &[SetOperation]) -> Result<(), StoreError> {
        let operations: Vec<_> = items.iter().cloned().map(TransactOperation::Set).collect();
        self.bulk_transact(&operations).await
    }

    pub async fn bulk_delete(&self, items: &[DeleteOperation]) -> Result<(), StoreError> {
        let operations: Vec<_> = items
            .iter()
            .cloned()
            .map(TransactOperation::Delete)
            .collect();
        self.bulk_transact(&operations).await
    }

    /// Join the janitor after its token has been cancelled. Safe to call on
    /// a store that was never initialized.
    pub async fn shutdown(&self) {
        self.janitor_shutdown.cancel();
        let handle = match self.inner.read().await.as_ref() {
            Some(inner) => inner.janitor.lock().take(),
            None => None,
        };
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(%err, "janitor task failed during shutdown");
                }
            }
        }
    }

    async fn snapshot(&self) -> Result<Arc<EngineInner>, StoreError> {
        self.inner
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or(StoreError::NotInitialized)
    }

    /// Lazily provision the target's schema and table (and register the
    /// target for expiration sweeps), gated so concurrent first writes issue
    /// one DDL round-trip per resource.
    async fn ensure_target(
        &self,
        inner: &Arc<EngineInner>,
        tenant_id: &str,
        target: &StateTarget,
    ) -> Result<(), StoreError> {
        let pool = &inner.pool;
        self.provisioner
            .ensure(&target.schema_resource_key(), || async {
                let client = pool.get().await?;
                pg::create_schema_if_absent(&**client, target).await
            })
            .await?;
        self.provisioner
            .ensure(&target.table_resource_key(), || async {
                let client = pool.get().await?;
                pg::create_table_if_absent(&**client, target).await?;
                registry::register_target(&**client, tenant_id, target).await
            })
            .await?;
        Ok(())
    }
}

/// Validated routing and parameters for one set, computed before any SQL.
struct SetPlan {
    target: StateTarget,
    tenant_id: String,
    etag: Option<Uuid>,
    ttl: Option<u32>,
}

impl SetPlan {
    fn new(config: &StoreConfig, operation: &SetOperation) -> Result<Self, StoreError> {
        let target = resolve_target(config, &operation.metadata)?;
        let etag = operation.etag.as_deref().map(pg::parse_etag).transpose()?;
        let ttl = ttl_from_metadata(&operation.metadata)?;
        let tenant_id = operation
            .metadata
            .get(metadata::TENANT_ID)
            .cloned()
            .unwrap_or_default();
        Ok(SetPlan {
            target,
            tenant_id,
            etag,
            ttl,
        })
    }
}

enum Planned<'a> {
    Set(&'a SetOperation, SetPlan),
    Delete(&'a DeleteOperation, StateTarget, Option<Uuid>),
}

impl<'a> Planned<'a> {
    fn new(config: &StoreConfig, operation: &'a TransactOperation) -> Result<Self, StoreError> {
        match operation {
            TransactOperation::Set(op) => Ok(Planned::Set(op, SetPlan::new(config, op)?)),
            TransactOperation::Delete(op) => Ok(Planned::Delete(
                op,
                resolve_target(config, &op.metadata)?,
                op.etag.as_deref().map(pg::parse_etag).transpose()?,
            )),
        }
    }
}

fn build_pool(config: &StoreConfig) -> Result<Pool, StoreError> {
    let pg_config: tokio_postgres::Config = config
        .connection_string
        .parse()
        .map_err(|err| StoreError::Config(format!("unparseable connection string: {err}")))?;
    let manager = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    Pool::builder(manager)
        .max_size(config.max_connections)
        .build()
        .map_err(|err| StoreError::Internal(format!("failed to build connection pool: {err}")))
}

async fn rollback_quietly(txn: Transaction<'_>) {
    if let Err(err) = txn.rollback().await {
        warn!(%err, "explicit rollback failed; the connection will roll back on reuse");
    }
}
