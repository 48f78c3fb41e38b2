//! Best-effort persistence of the scheduling counter.
//!
//! The write runs in a detached task so it never delays a pass. It re-reads
//! the target, touches only `status.fastReconcileCount` and writes it back.
//! Conflicts with concurrent writers are expected and dropped: the counter
//! only shapes polling cadence, and the scheduler tolerates a stale value.

use crate::constants::COUNTER_UPDATE_TIMEOUT;
use crate::prelude::*;
use crate::store::{ResourceStore, StoreError};
use crate::target::TargetKey;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Spawns the counter write. The handle is only awaited by tests.
pub(crate) fn spawn_counter_update(
    store: Arc<dyn ResourceStore>,
    key: TargetKey,
    count: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::time::timeout(COUNTER_UPDATE_TIMEOUT, write_counter(store.as_ref(), &key, count))
            .await
        {
            Ok(Ok(())) => debug!("Scheduling counter updated: target={key}, count={count}"),
            Ok(Err(e)) => debug!("Scheduling counter not updated: target={key}, count={count}, error={e}"),
            Err(_) => debug!("Scheduling counter update timed out: target={key}, count={count}"),
        }
    })
}

async fn write_counter(
    store: &dyn ResourceStore,
    key: &TargetKey,
    count: u32,
) -> Result<(), StoreError> {
    let mut target = store.get_target(key).await?;
    if target.status.fast_reconcile_count == Some(count) {
        return Ok(());
    }
    target.status.fast_reconcile_count = Some(count);
    store.update_target_status(&target).await?;
    Ok(())
}
