//! Interval-driven job scheduler.
//!
//! Owns the three maintenance jobs and runs each on its own interval. A
//! failed cycle is logged and the loop continues; the next tick retries from
//! scratch. At startup, an empty catalog triggers an initial full bootstrap
//! so the service never runs with a published pepper and no hashes.
//!
//! Single-process, single active scheduler: no distributed coordination.

use crate::hasher::HashEngine;
use crate::jobs::federation::FederationSyncJob;
use crate::jobs::incremental::IncrementalUserSyncJob;
use crate::jobs::rotation::PepperRotationJob;
use crate::jobs::JobError;
use crate::store::{CatalogStore, PepperSlot, PepperStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// How often each job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleIntervals {
    pub rotation: Duration,
    pub incremental: Duration,
    pub federation: Duration,
}

impl Default for ScheduleIntervals {
    fn default() -> Self {
        Self {
            rotation: Duration::from_secs(24 * 60 * 60),
            incremental: Duration::from_secs(10 * 60),
            federation: Duration::from_secs(60 * 60),
        }
    }
}

/// Drives the maintenance jobs until the process stops.
pub struct Scheduler<S, H> {
    store: Arc<S>,
    rotation: PepperRotationJob<S, H>,
    incremental: IncrementalUserSyncJob<S, H>,
    /// One sync job per configured peer list.
    federation: Vec<FederationSyncJob<H>>,
    intervals: ScheduleIntervals,
}

impl<S, H> Scheduler<S, H>
where
    S: PepperStore + CatalogStore,
    H: HashEngine,
{
    pub fn new(
        store: Arc<S>,
        rotation: PepperRotationJob<S, H>,
        incremental: IncrementalUserSyncJob<S, H>,
        federation: Vec<FederationSyncJob<H>>,
        intervals: ScheduleIntervals,
    ) -> Self {
        Self {
            store,
            rotation,
            incremental,
            federation,
            intervals,
        }
    }

    /// Build the initial catalog if this is a fresh deployment. Returns
    /// whether a bootstrap ran.
    pub async fn bootstrap_if_empty(&self) -> Result<bool, JobError> {
        let has_pepper = self.store.pepper(PepperSlot::Current).await?.is_some();
        let count = self.store.count_hashes().await?;
        if has_pepper && count > 0 {
            return Ok(false);
        }
        info!("empty catalog detected, running initial bootstrap");
        self.rotation.bootstrap().await?;
        Ok(true)
    }

    /// Run forever. Ticks fire one cycle each; a failed cycle never stops
    /// the loop.
    pub async fn run(&self) -> Result<(), JobError> {
        self.bootstrap_if_empty().await?;

        let mut rotation = tokio::time::interval(self.intervals.rotation);
        let mut incremental = tokio::time::interval(self.intervals.incremental);
        let mut federation = tokio::time::interval(self.intervals.federation);
        for interval in [&mut rotation, &mut incremental, &mut federation] {
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately; the
            // bootstrap already covered startup work.
            interval.tick().await;
        }

        loop {
            tokio::select! {
                _ = rotation.tick() => {
                    match self.rotation.run_cycle().await {
                        Ok(outcome) => info!(?outcome, "rotation cycle done"),
                        Err(err) => error!(error = %err, "rotation cycle failed"),
                    }
                }
                _ = incremental.tick() => {
                    match self.incremental.run_cycle().await {
                        Ok(outcome) => info!(?outcome, "incremental sync cycle done"),
                        Err(err) => error!(error = %err, "incremental sync cycle failed"),
                    }
                }
                _ = federation.tick() => {
                    for job in &self.federation {
                        match job.run_cycle().await {
                            Ok(outcome) => info!(?outcome, "federation sync cycle done"),
                            Err(err) => error!(error = %err, "federation sync cycle failed"),
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{LocalUser, StaticDirectory, UserDirectory};
    use crate::hasher::BuiltinHashEngine;
    use crate::pool::HashComputationPool;
    use crate::store::MemoryStore;

    fn scheduler(store: &MemoryStore, users: Vec<LocalUser>) -> Scheduler<MemoryStore, BuiltinHashEngine> {
        let store = Arc::new(store.clone());
        let engine = Arc::new(BuiltinHashEngine::new());
        let directory = Arc::new(StaticDirectory::new(users)) as Arc<dyn UserDirectory>;
        let rotation = PepperRotationJob::new(
            store.clone(),
            directory.clone(),
            None,
            HashComputationPool::new(store.clone(), engine.clone()),
            "example.com",
        );
        let incremental = IncrementalUserSyncJob::new(
            store.clone(),
            directory,
            None,
            HashComputationPool::new(store.clone(), engine),
            "example.com",
            false,
        );
        Scheduler::new(store, rotation, incremental, vec![], ScheduleIntervals::default())
    }

    #[tokio::test]
    async fn test_bootstrap_runs_once_on_empty_catalog() {
        let store = MemoryStore::new();
        let scheduler = scheduler(
            &store,
            vec![LocalUser::new("dwho").with_email("dwho@company.com")],
        );

        assert!(scheduler.bootstrap_if_empty().await.unwrap());
        assert_eq!(store.count_hashes().await.unwrap(), 2);

        // Second call sees the populated catalog and does nothing.
        assert!(!scheduler.bootstrap_if_empty().await.unwrap());
        assert_eq!(store.count_hashes().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_bootstrap_skipped_without_users_but_pepper_published() {
        // A deployment with no local users still gets a current pepper, so
        // lookups can answer (negatively) right away.
        let store = MemoryStore::new();
        let scheduler = scheduler(&store, vec![]);

        assert!(scheduler.bootstrap_if_empty().await.unwrap());
        assert!(store
            .pepper(PepperSlot::Current)
            .await
            .unwrap()
            .is_some());
    }
}
