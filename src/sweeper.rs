//! Expiry sweeper for TTL'd KV entries.
//!
//! Runs on a fixed interval and hard-deletes rows whose `expires_at` has
//! passed. The session is not bound to any tenant; a dedicated row-level
//! security policy permits deleting (and only deleting) expired rows across
//! tenants, so expired data disappears everywhere without iterating
//! tenants.
//!
//! Reads never depend on the sweeper: the KV engine filters expired rows on
//! the latest-value path, so this task only reclaims storage.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::store::Store;

pub struct Sweeper {
    store: Store,
    interval: Duration,
}

impl Sweeper {
    pub fn new(store: Store, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Runs sweep ticks until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately; skip it so
        // startup is not serialized behind a full-table sweep.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Expiry sweeper shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    match sweep_expired(&self.store).await {
                        Ok(0) => tracing::debug!("Expiry sweep found nothing to remove"),
                        Ok(removed) => tracing::info!(removed, "Removed expired kv entries"),
                        Err(err) => tracing::error!(error = %err, "Expiry sweep failed"),
                    }
                }
            }
        }
    }
}

/// Deletes every expired entry row. Callable directly for tests and
/// operational tooling.
pub async fn sweep_expired(store: &Store) -> Result<u64> {
    let removed = sqlx::query("DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at < now()")
        .execute(store.pool())
        .await?
        .rows_affected();
    Ok(removed)
}
