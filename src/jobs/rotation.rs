//! Full-catalog rebuild under a fresh pepper.
//!
//! One cycle walks Idle -> RetiringOldPepper -> Rebuilding -> Publishing ->
//! Idle:
//! 1. retire the previous pepper's rows (best-effort, never blocks rotation),
//! 2. read the current pepper (required),
//! 3. mint a new pepper,
//! 4. concurrently shift current -> previous and rebuild every user's hashes
//!    under the new pepper (strict batch),
//! 5. publish the new pepper into the `current` slot.
//!
//! The publish happens only after the rebuild succeeds, so a reader never
//! observes a current pepper with an empty catalog. If step 4 fails the
//! `current` slot is untouched and the old pepper stays authoritative until
//! the next scheduled cycle.

use super::JobError;
use crate::directory::{HomeserverView, UserDirectory};
use crate::filter::ActiveUserFilter;
use crate::hasher::HashEngine;
use crate::pool::{FailurePolicy, HashComputationPool, UpdatableFieldsBatch, UserFields};
use crate::store::{
    CatalogStore, MatrixAddress, Pepper, PepperSlot, PepperStore, UserHistoryEntry,
};
use std::sync::Arc;
use tracing::{info, warn};

/// What one rotation cycle accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationOutcome {
    /// Rows deleted while retiring the old previous pepper.
    pub retired_rows: u64,
    /// Hash rows written under the new pepper.
    pub rebuilt_rows: usize,
}

/// Periodic full rebuild job. Exactly one instance may run at a time.
pub struct PepperRotationJob<S, H> {
    store: Arc<S>,
    directory: Arc<dyn UserDirectory>,
    view: Option<Arc<dyn HomeserverView>>,
    pool: HashComputationPool<S, H>,
    server_name: String,
}

impl<S, H> PepperRotationJob<S, H>
where
    S: PepperStore + CatalogStore,
    H: HashEngine,
{
    pub fn new(
        store: Arc<S>,
        directory: Arc<dyn UserDirectory>,
        view: Option<Arc<dyn HomeserverView>>,
        pool: HashComputationPool<S, H>,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            directory,
            view,
            pool,
            server_name: server_name.into(),
        }
    }

    /// One full rotation cycle. Requires a current pepper; use
    /// [`bootstrap`](Self::bootstrap) for the very first build.
    pub async fn run_cycle(&self) -> Result<RotationOutcome, JobError> {
        let retired_rows = self.retire_previous_pepper().await;

        let current = self
            .store
            .pepper(PepperSlot::Current)
            .await?
            .ok_or(JobError::MissingCurrentPepper)?;

        let next = Pepper::generate();
        let batch = self.build_batch().await?;

        // Shift the slot and rebuild concurrently; both must succeed before
        // the new pepper is published.
        let (shift, rebuild) = tokio::join!(
            self.store.set_pepper(PepperSlot::Previous, &current),
            self.pool
                .submit(&batch, Some(next.clone()), FailurePolicy::Strict),
        );
        shift?;
        let outcome = rebuild?;

        self.store.set_pepper(PepperSlot::Current, &next).await?;
        self.seed_history(&batch).await;

        info!(
            rebuilt_rows = outcome.inserted,
            retired_rows, "pepper rotation complete"
        );
        Ok(RotationOutcome {
            retired_rows,
            rebuilt_rows: outcome.inserted,
        })
    }

    /// First-run path: no current pepper exists and the catalog is empty.
    /// Mints and publishes an initial pepper after building the catalog from
    /// scratch; retirement and the slot shift degenerate to no-ops.
    pub async fn bootstrap(&self) -> Result<RotationOutcome, JobError> {
        let next = Pepper::generate();
        let batch = self.build_batch().await?;

        let outcome = self
            .pool
            .submit(&batch, Some(next.clone()), FailurePolicy::Strict)
            .await?;

        self.store.set_pepper(PepperSlot::Current, &next).await?;
        self.seed_history(&batch).await;

        info!(rebuilt_rows = outcome.inserted, "initial catalog bootstrap complete");
        Ok(RotationOutcome {
            retired_rows: 0,
            rebuilt_rows: outcome.inserted,
        })
    }

    /// Step 1: delete every row computed under the retiring previous pepper.
    /// Best-effort; a failure here never blocks the rotation.
    async fn retire_previous_pepper(&self) -> u64 {
        let previous = match self.store.pepper(PepperSlot::Previous).await {
            Ok(Some(pepper)) => pepper,
            Ok(None) => return 0,
            Err(err) => {
                warn!(error = %err, "could not read previous pepper, skipping retirement");
                return 0;
            }
        };
        match self.store.delete_hashes_by_pepper(previous.as_str()).await {
            Ok(deleted) => {
                info!(deleted, "retired previous pepper's hashes");
                deleted
            }
            Err(err) => {
                warn!(error = %err, "failed to retire previous pepper's hashes, continuing");
                0
            }
        }
    }

    /// Annotate all local users with liveness and shape them into a batch.
    async fn build_batch(&self) -> Result<UpdatableFieldsBatch, JobError> {
        let users = self.directory.list_users().await?;
        let filter = ActiveUserFilter::from_view(self.view.as_deref()).await?;

        let mut batch = UpdatableFieldsBatch::new();
        for annotated in filter.annotate(users) {
            let address = MatrixAddress::for_user(&annotated.user.uid, &self.server_name);
            batch.insert(
                address,
                UserFields {
                    email: annotated.user.email,
                    phone: annotated.user.phone,
                    active: annotated.active,
                },
            );
        }
        Ok(batch)
    }

    /// Append activation entries for active addresses the trail has never
    /// seen, so the audit history starts at first build. Best-effort.
    async fn seed_history(&self, batch: &UpdatableFieldsBatch) {
        for (address, fields) in batch {
            if !fields.active {
                continue;
            }
            let trail = match self.store.history_for(address).await {
                Ok(trail) => trail,
                Err(err) => {
                    warn!(address = %address, error = %err, "could not read history, skipping seed");
                    continue;
                }
            };
            if !trail.is_empty() {
                continue;
            }
            if let Err(err) = self
                .store
                .append_history(UserHistoryEntry::now(address.clone(), true))
                .await
            {
                warn!(address = %address, error = %err, "failed to seed history entry");
            }
        }
    }
}
