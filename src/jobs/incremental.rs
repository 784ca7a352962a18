//! Differential user-state reconciliation.
//!
//! The cheap counterpart to the full rebuild, intended to run frequently
//! between rotations. One cycle compares the local user directory against
//! the addresses already represented in the hash catalog and:
//! - hashes new users under the current pepper (strict batch),
//! - reactivates known users that reappeared in the homeserver view,
//! - deactivates known users that vanished from the directory,
//! maintaining the append-only activity audit trail throughout.
//!
//! Per-user update operations run concurrently and are best-effort: one
//! failed row is logged and never aborts the others. Only the new-user
//! batch submission is strict.

use super::JobError;
use crate::directory::{HomeserverView, UserDirectory};
use crate::filter::ActiveUserFilter;
use crate::hasher::HashEngine;
use crate::pool::{FailurePolicy, HashComputationPool, UpdatableFieldsBatch, UserFields};
use crate::store::{
    CatalogStore, MatrixAddress, PepperStore, UserHistoryEntry,
};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

/// What one reconciliation cycle accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncOutcome {
    pub new_users: usize,
    pub reactivated: usize,
    pub deactivated: usize,
    /// Hash rows written for the new-user batch.
    pub hashed_rows: usize,
}

/// Incremental reconciliation job.
pub struct IncrementalUserSyncJob<S, H> {
    store: Arc<S>,
    directory: Arc<dyn UserDirectory>,
    view: Option<Arc<dyn HomeserverView>>,
    pool: HashComputationPool<S, H>,
    server_name: String,
    /// Whether any federation peers are configured. When true, identifiers
    /// of accounts not yet provisioned on the homeserver are withheld from
    /// hashing so they cannot leak to peers.
    peers_configured: bool,
}

impl<S, H> IncrementalUserSyncJob<S, H>
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
        peers_configured: bool,
    ) -> Self {
        Self {
            store,
            directory,
            view,
            pool,
            server_name: server_name.into(),
            peers_configured,
        }
    }

    /// One reconciliation cycle.
    pub async fn run_cycle(&self) -> Result<SyncOutcome, JobError> {
        let users = self.directory.list_users().await?;
        let filter = ActiveUserFilter::from_view(self.view.as_deref()).await?;

        // Addresses already in the catalog, with any-row-active semantics.
        // The raw list carries one entry per hash row, hence the fold.
        let mut known: HashMap<MatrixAddress, bool> = HashMap::new();
        for (address, active) in self.store.catalog_addresses().await? {
            let entry = known.entry(address).or_insert(false);
            *entry = *entry || active;
        }

        let mut outcome = SyncOutcome::default();
        let mut touched: HashSet<MatrixAddress> = HashSet::new();
        let mut local_addresses: HashSet<MatrixAddress> = HashSet::new();
        let mut batch = UpdatableFieldsBatch::new();
        let mut updates = Vec::new();

        for user in &users {
            let address = MatrixAddress::for_user(&user.uid, &self.server_name);
            local_addresses.insert(address.clone());
            let active = filter.is_active(&user.uid);

            match known.get(&address) {
                None => {
                    info!(address = %address, "detected new local user");
                    outcome.new_users += 1;
                    touched.insert(address.clone());
                    if active {
                        updates.push(self.apply_liveness(address.clone(), true, false));
                    }
                    let withheld = self.peers_configured && filter.has_view() && !active;
                    if withheld {
                        info!(
                            address = %address,
                            "user not provisioned on homeserver, withholding from hash batch"
                        );
                    } else {
                        batch.insert(
                            address,
                            UserFields {
                                email: user.email.clone(),
                                phone: user.phone.clone(),
                                active,
                            },
                        );
                    }
                }
                Some(false) if active => {
                    outcome.reactivated += 1;
                    touched.insert(address.clone());
                    updates.push(self.apply_liveness(address, true, true));
                }
                _ => {}
            }
        }

        join_all(updates).await;

        if !batch.is_empty() {
            let submitted = self
                .pool
                .submit(&batch, None, FailurePolicy::Strict)
                .await?;
            outcome.hashed_rows = submitted.inserted;
        }

        // Known addresses that no longer exist locally. The known map is
        // already deduplicated; `touched` keeps an address processed earlier
        // this cycle from being deactivated too.
        let mut removals = Vec::new();
        for address in known.keys() {
            if local_addresses.contains(address) || touched.contains(address) {
                continue;
            }
            outcome.deactivated += 1;
            removals.push(self.apply_liveness(address.clone(), false, true));
        }
        join_all(removals).await;

        Ok(outcome)
    }

    /// One best-effort per-user update: optionally flip the address's hash
    /// rows, then append the audit entry. Failures are logged, never
    /// propagated.
    async fn apply_liveness(&self, address: MatrixAddress, active: bool, flip_records: bool) {
        if flip_records {
            if let Err(err) = self.store.set_active(&address, active).await {
                warn!(address = %address, active, error = %err, "failed to update hash rows");
            }
        }
        if let Err(err) = self
            .store
            .append_history(UserHistoryEntry::now(address.clone(), active))
            .await
        {
            warn!(address = %address, active, error = %err, "failed to append history entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{LocalUser, StaticDirectory, StaticHomeserverView};
    use crate::hasher::BuiltinHashEngine;
    use crate::jobs::rotation::PepperRotationJob;
    use crate::store::MemoryStore;

    struct Fixture {
        store: MemoryStore,
        directory: Arc<StaticDirectory>,
        view: Option<Arc<StaticHomeserverView>>,
    }

    impl Fixture {
        fn new(users: Vec<LocalUser>, view_names: Option<Vec<&str>>) -> Self {
            Self {
                store: MemoryStore::new(),
                directory: Arc::new(StaticDirectory::new(users)),
                view: view_names.map(|names| {
                    Arc::new(StaticHomeserverView::new(
                        names.into_iter().map(String::from).collect(),
                    ))
                }),
            }
        }

        fn view_arg(&self) -> Option<Arc<dyn HomeserverView>> {
            self.view
                .clone()
                .map(|v| v as Arc<dyn HomeserverView>)
        }

        async fn bootstrap(&self) {
            let store = Arc::new(self.store.clone());
            let engine = Arc::new(BuiltinHashEngine::new());
            let rotation = PepperRotationJob::new(
                store.clone(),
                self.directory.clone() as Arc<dyn UserDirectory>,
                self.view_arg(),
                HashComputationPool::new(store, engine),
                "example.com",
            );
            rotation.bootstrap().await.unwrap();
        }

        fn job(
            &self,
            peers_configured: bool,
        ) -> IncrementalUserSyncJob<MemoryStore, BuiltinHashEngine> {
            let store = Arc::new(self.store.clone());
            let engine = Arc::new(BuiltinHashEngine::new());
            IncrementalUserSyncJob::new(
                store.clone(),
                self.directory.clone() as Arc<dyn UserDirectory>,
                self.view_arg(),
                HashComputationPool::new(store, engine),
                "example.com",
                peers_configured,
            )
        }
    }

    fn dwho() -> LocalUser {
        LocalUser::new("dwho")
            .with_email("dwho@company.com")
            .with_phone("33612345678")
    }

    fn rtyler() -> LocalUser {
        LocalUser::new("rtyler").with_email("rtyler@company.com")
    }

    #[tokio::test]
    async fn test_new_user_hashed_under_current_pepper() {
        let fixture = Fixture::new(vec![dwho()], None);
        fixture.bootstrap().await;

        fixture.directory.set_users(vec![dwho(), rtyler()]);
        let outcome = fixture.job(false).run_cycle().await.unwrap();

        assert_eq!(outcome.new_users, 1);
        assert_eq!(outcome.hashed_rows, 2); // one email x two algorithms

        let current = fixture
            .store
            .pepper(crate::store::PepperSlot::Current)
            .await
            .unwrap()
            .unwrap();
        let rtyler_rows: Vec<_> = fixture
            .store
            .hashes()
            .into_iter()
            .filter(|r| r.address.as_str() == "@rtyler:example.com")
            .collect();
        assert_eq!(rtyler_rows.len(), 2);
        assert!(rtyler_rows.iter().all(|r| r.pepper == current.as_str()));

        let trail = fixture
            .store
            .history_for(&MatrixAddress("@rtyler:example.com".into()))
            .await
            .unwrap();
        assert_eq!(trail.len(), 1);
        assert!(trail[0].active);
    }

    #[tokio::test]
    async fn test_idempotent_when_nothing_changed() {
        let fixture = Fixture::new(vec![dwho(), rtyler()], None);
        fixture.bootstrap().await;

        fixture.job(false).run_cycle().await.unwrap();
        let hashes_before = fixture.store.hashes();
        let history_before = fixture.store.history();

        let outcome = fixture.job(false).run_cycle().await.unwrap();

        assert_eq!(outcome, SyncOutcome::default());
        assert_eq!(fixture.store.hashes(), hashes_before);
        assert_eq!(fixture.store.history(), history_before);
    }

    #[tokio::test]
    async fn test_disappeared_user_deactivated_once() {
        let fixture = Fixture::new(vec![dwho(), rtyler()], None);
        fixture.bootstrap().await;

        fixture.directory.set_users(vec![dwho()]);
        let outcome = fixture.job(false).run_cycle().await.unwrap();
        assert_eq!(outcome.deactivated, 1);

        let rtyler_addr = MatrixAddress("@rtyler:example.com".into());
        assert!(fixture
            .store
            .hashes()
            .iter()
            .filter(|r| r.address == rtyler_addr)
            .all(|r| !r.active));

        let trail = fixture.store.history_for(&rtyler_addr).await.unwrap();
        let deactivations: Vec<_> = trail.iter().filter(|e| !e.active).collect();
        assert_eq!(deactivations.len(), 1);

        // A second cycle with the same directory adds nothing further.
        let outcome = fixture.job(false).run_cycle().await.unwrap();
        assert_eq!(outcome.deactivated, 0);
        let trail = fixture.store.history_for(&rtyler_addr).await.unwrap();
        assert_eq!(trail.iter().filter(|e| !e.active).count(), 1);
    }

    #[tokio::test]
    async fn test_reappeared_user_reactivated() {
        let fixture = Fixture::new(
            vec![dwho(), rtyler()],
            Some(vec!["@dwho:example.com", "@rtyler:example.com"]),
        );
        fixture.bootstrap().await;

        // rtyler disappears, then comes back.
        fixture.directory.set_users(vec![dwho()]);
        fixture.job(false).run_cycle().await.unwrap();
        fixture.directory.set_users(vec![dwho(), rtyler()]);
        let outcome = fixture.job(false).run_cycle().await.unwrap();

        assert_eq!(outcome.reactivated, 1);
        assert_eq!(outcome.new_users, 0, "known address must not count as new");

        let rtyler_addr = MatrixAddress("@rtyler:example.com".into());
        assert!(fixture
            .store
            .hashes()
            .iter()
            .filter(|r| r.address == rtyler_addr)
            .all(|r| r.active));

        let trail = fixture.store.history_for(&rtyler_addr).await.unwrap();
        assert!(trail.last().map(|e| e.active).unwrap_or(false));
    }

    #[tokio::test]
    async fn test_unprovisioned_user_withheld_when_peers_configured() {
        let fixture = Fixture::new(vec![dwho()], Some(vec!["@dwho:example.com"]));
        fixture.bootstrap().await;

        // ghost exists locally but not on the homeserver.
        fixture
            .directory
            .set_users(vec![dwho(), LocalUser::new("ghost").with_email("g@x")]);
        let outcome = fixture.job(true).run_cycle().await.unwrap();

        assert_eq!(outcome.new_users, 1);
        assert_eq!(outcome.hashed_rows, 0, "ghost must not be hashed");
        assert!(fixture
            .store
            .hashes()
            .iter()
            .all(|r| r.address.as_str() != "@ghost:example.com"));
    }

    #[tokio::test]
    async fn test_unprovisioned_user_included_without_peers() {
        let fixture = Fixture::new(vec![dwho()], Some(vec!["@dwho:example.com"]));
        fixture.bootstrap().await;

        fixture
            .directory
            .set_users(vec![dwho(), LocalUser::new("ghost").with_email("g@x")]);
        let outcome = fixture.job(false).run_cycle().await.unwrap();

        // No peers: the inactive account is hashed (rows carry active=0) so
        // the catalog stays complete for local lookups.
        assert_eq!(outcome.hashed_rows, 2);
        assert!(fixture
            .store
            .hashes()
            .iter()
            .filter(|r| r.address.as_str() == "@ghost:example.com")
            .all(|r| !r.active));
    }

    #[tokio::test]
    async fn test_row_failure_does_not_abort_other_updates() {
        let fixture = Fixture::new(vec![dwho(), rtyler()], None);
        fixture.bootstrap().await;

        // Both users disappear; rtyler's update is made to fail.
        fixture
            .store
            .fail_updates_for(MatrixAddress("@rtyler:example.com".into()));
        fixture.directory.set_users(vec![]);
        let outcome = fixture.job(false).run_cycle().await.unwrap();

        assert_eq!(outcome.deactivated, 2);
        // dwho's rows were still flipped despite rtyler's failure.
        assert!(fixture
            .store
            .hashes()
            .iter()
            .filter(|r| r.address.as_str() == "@dwho:example.com")
            .all(|r| !r.active));
    }
}
