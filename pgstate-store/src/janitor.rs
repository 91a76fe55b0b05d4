//! Background expiration of TTL'd rows.
//!
//! One registered target is swept per tick, least-recently-swept first,
//! which bounds per-tick work and keeps the sweep fair across tenants. The
//! timer does not re-enter: a slow sweep delays the next tick instead of
//! overlapping it.

use std::time::Duration;

use deadpool_postgres::Pool;
use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::pg;
use crate::registry::{self, RegisteredTarget};

/// Outcome of one sweep.
#[derive(Debug)]
pub struct SweepReport {
    pub swept: RegisteredTarget,
    pub reaped_rows: u64,
}

pub struct ExpirationJanitor;

impl ExpirationJanitor {
    /// Start the periodic sweep. The task exits when `shutdown` is
    /// cancelled; a tick in progress finishes first.
    pub fn spawn(pool: Pool, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("expiration janitor stopping");
                        return;
                    }
                    _ = timer.tick() => {}
                }
                match Self::tick(&pool).await {
                    Ok(Some(report)) if report.reaped_rows > 0 => {
                        counter!("pgstate_expired_rows_total").increment(report.reaped_rows);
                        debug!(
                            tenant = %report.swept.tenant_id,
                            schema = %report.swept.target.schema(),
                            table = %report.swept.target.table(),
                            rows = report.reaped_rows,
                            "reaped expired rows"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => warn!(%err, "expiration sweep failed"),
                }
            }
        })
    }

    /// Sweep the least-recently-swept registered target, if any. Public so
    /// tests can drive the janitor without waiting out the timer.
    pub async fn tick(pool: &Pool) -> Result<Option<SweepReport>, StoreError> {
        let client = pool.get().await?;
        let Some(swept) = registry::least_recently_expired(&**client).await? else {
            return Ok(None);
        };
        // A target dropped behind our back still gets its stamp advanced so
        // it cannot wedge the rotation.
        let reaped_rows = match pg::delete_expired(&**client, &swept.target).await {
            Ok(rows) => rows,
            Err(StoreError::TableMissing) => {
                warn!(
                    schema = %swept.target.schema(),
                    table = %swept.target.table(),
                    "registered target no longer exists"
                );
                0
            }
            Err(err) => return Err(err),
        };
        registry::mark_expired(&**client, &swept.target).await?;
        Ok(Some(SweepReport { swept, reaped_rows }))
    }
}
