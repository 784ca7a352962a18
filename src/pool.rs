//! Bounded-concurrency hash batch executor.
//!
//! Given a batch of {matrix-address -> 3PID values}, computes every
//! (field x algorithm) digest and persists each as one catalog row. A
//! semaphore caps in-flight storage operations (default 5) so a large batch
//! cannot overload the backing store.
//!
//! When no pepper is supplied the pool lazily reads the `current` slot the
//! first time any work unit needs it; concurrent lazy reads collapse into
//! one idempotent initialization. The value cannot rotate mid-call (single
//! rotation instance), so this is safe.
//!
//! Failure handling is an explicit, named mode per call: [`FailurePolicy::Strict`]
//! rejects the whole batch on the first failed insert (the rebuild and
//! new-user paths), [`FailurePolicy::BestEffort`] logs failed units and lets
//! the rest of the batch proceed.

use crate::hasher::{field_digest, HashAlgorithm, HashEngine, HashError};
use crate::store::{
    CatalogStore, FieldKind, HashRecord, MatrixAddress, Pepper, PepperSlot, PepperStore,
    StoreError,
};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OnceCell, Semaphore};
use tracing::warn;

/// Default cap on simultaneous work units.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// 3PID values for one address, the unit of work handed to the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserFields {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub active: bool,
}

/// Ephemeral batch built fresh for each job run; never persisted.
pub type UpdatableFieldsBatch = HashMap<MatrixAddress, UserFields>;

/// Per-call failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Any single insert failure rejects the whole batch.
    Strict,
    /// Failed units are logged; the rest of the batch proceeds.
    BestEffort,
}

/// Pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no current pepper in storage")]
    MissingPepper,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Hash(#[from] HashError),

    #[error("pool internal error: {0}")]
    Internal(String),
}

/// What a batch submission accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub failed: usize,
}

/// Bounded-concurrency executor over a store and a hash engine.
pub struct HashComputationPool<S, H> {
    store: Arc<S>,
    engine: Arc<H>,
    semaphore: Arc<Semaphore>,
}

impl<S, H> HashComputationPool<S, H>
where
    S: PepperStore + CatalogStore,
    H: HashEngine,
{
    pub fn new(store: Arc<S>, engine: Arc<H>) -> Self {
        Self::with_concurrency(store, engine, DEFAULT_CONCURRENCY)
    }

    pub fn with_concurrency(store: Arc<S>, engine: Arc<H>, concurrency: usize) -> Self {
        Self {
            store,
            engine,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Compute and persist every (address, non-empty field, algorithm) digest
    /// in `batch` under `pepper`, or under the stored current pepper when
    /// `pepper` is `None`.
    pub async fn submit(
        &self,
        batch: &UpdatableFieldsBatch,
        pepper: Option<Pepper>,
        policy: FailurePolicy,
    ) -> Result<BatchOutcome, PoolError> {
        let pepper_cell: OnceCell<Pepper> = OnceCell::new_with(pepper);
        let cell = &pepper_cell;

        let mut units = Vec::new();
        for (address, fields) in batch {
            let active = fields.active;
            let values = [
                (FieldKind::Email, fields.email.as_deref()),
                (FieldKind::Phone, fields.phone.as_deref()),
            ];
            for (kind, value) in values {
                let Some(value) = value else { continue };
                if value.is_empty() {
                    continue;
                }
                for &algorithm in self.engine.supported_algorithms() {
                    units.push(async move {
                        let outcome = self
                            .run_unit(address, kind, value, active, algorithm, cell)
                            .await;
                        (address, kind, algorithm, outcome)
                    });
                }
            }
        }

        let results = join_all(units).await;

        let mut outcome = BatchOutcome {
            inserted: 0,
            failed: 0,
        };
        for (address, kind, algorithm, result) in results {
            match result {
                Ok(()) => outcome.inserted += 1,
                Err(err) => match policy {
                    FailurePolicy::Strict => return Err(err),
                    FailurePolicy::BestEffort => {
                        outcome.failed += 1;
                        warn!(
                            address = %address,
                            kind = kind.as_str(),
                            algorithm = %algorithm,
                            error = %err,
                            "hash unit failed, continuing batch"
                        );
                    }
                },
            }
        }
        Ok(outcome)
    }

    /// One work unit: acquire a permit, resolve the pepper, digest, insert.
    async fn run_unit(
        &self,
        address: &MatrixAddress,
        kind: FieldKind,
        value: &str,
        active: bool,
        algorithm: HashAlgorithm,
        pepper: &OnceCell<Pepper>,
    ) -> Result<(), PoolError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| PoolError::Internal(e.to_string()))?;

        let pepper = pepper
            .get_or_try_init(|| async {
                self.store
                    .pepper(PepperSlot::Current)
                    .await?
                    .ok_or(PoolError::MissingPepper)
            })
            .await?;

        let digest = field_digest(self.engine.as_ref(), algorithm, kind, value, pepper.as_str())?;
        self.store
            .insert_hash(HashRecord {
                digest,
                pepper: pepper.as_str().to_string(),
                kind,
                address: address.clone(),
                active,
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::BuiltinHashEngine;
    use crate::store::MemoryStore;

    fn batch_of(entries: Vec<(&str, UserFields)>) -> UpdatableFieldsBatch {
        entries
            .into_iter()
            .map(|(addr, fields)| (MatrixAddress(addr.to_string()), fields))
            .collect()
    }

    fn pool(store: &MemoryStore) -> HashComputationPool<MemoryStore, BuiltinHashEngine> {
        HashComputationPool::new(Arc::new(store.clone()), Arc::new(BuiltinHashEngine::new()))
    }

    #[tokio::test]
    async fn test_records_per_field_and_algorithm() {
        let store = MemoryStore::new();
        let batch = batch_of(vec![(
            "@dwho:example.com",
            UserFields {
                email: Some("dwho@company.com".into()),
                phone: Some("33612345678".into()),
                active: true,
            },
        )]);

        let outcome = pool(&store)
            .submit(&batch, Some(Pepper::new("mypepper")), FailurePolicy::Strict)
            .await
            .unwrap();

        // 2 non-empty fields x 2 supported algorithms
        assert_eq!(outcome.inserted, 4);
        assert_eq!(store.count_hashes().await.unwrap(), 4);
        assert!(store
            .hashes()
            .iter()
            .all(|r| r.address.as_str() == "@dwho:example.com" && r.pepper == "mypepper"));
    }

    #[tokio::test]
    async fn test_empty_and_missing_fields_skipped() {
        let store = MemoryStore::new();
        let batch = batch_of(vec![
            (
                "@a:x",
                UserFields {
                    email: Some(String::new()),
                    phone: None,
                    active: true,
                },
            ),
            (
                "@b:x",
                UserFields {
                    email: Some("b@x".into()),
                    phone: None,
                    active: true,
                },
            ),
        ]);

        let outcome = pool(&store)
            .submit(&batch, Some(Pepper::new("p")), FailurePolicy::Strict)
            .await
            .unwrap();

        assert_eq!(outcome.inserted, 2); // @b:x email only, 2 algorithms
        assert!(store.hashes().iter().all(|r| r.address.as_str() == "@b:x"));
    }

    #[tokio::test]
    async fn test_phone_hashed_under_msisdn_label() {
        let store = MemoryStore::new();
        let batch = batch_of(vec![(
            "@dwho:example.com",
            UserFields {
                email: None,
                phone: Some("+33612345678".into()),
                active: true,
            },
        )]);

        pool(&store)
            .submit(&batch, Some(Pepper::new("mypepper")), FailurePolicy::Strict)
            .await
            .unwrap();

        // sha256("33612345678 msisdn mypepper")
        assert!(store
            .hashes()
            .iter()
            .any(|r| r.digest == "CVMgkvy_pLfXrKgVMA9vTvhtKBxEIMZMMO0TYs5k-A8"));
    }

    #[tokio::test]
    async fn test_lazy_pepper_read_from_store() {
        let store = MemoryStore::new();
        store
            .set_pepper(PepperSlot::Current, &Pepper::new("stored-pepper"))
            .await
            .unwrap();
        let batch = batch_of(vec![(
            "@a:x",
            UserFields {
                email: Some("a@x".into()),
                phone: None,
                active: true,
            },
        )]);

        pool(&store)
            .submit(&batch, None, FailurePolicy::Strict)
            .await
            .unwrap();

        assert!(store.hashes().iter().all(|r| r.pepper == "stored-pepper"));
    }

    #[tokio::test]
    async fn test_missing_pepper_rejects_batch() {
        let store = MemoryStore::new();
        let batch = batch_of(vec![(
            "@a:x",
            UserFields {
                email: Some("a@x".into()),
                phone: None,
                active: true,
            },
        )]);

        let err = pool(&store)
            .submit(&batch, None, FailurePolicy::Strict)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::MissingPepper));
    }

    #[tokio::test]
    async fn test_strict_policy_rejects_on_single_failure() {
        let store = MemoryStore::new();
        store.fail_next_inserts(1);
        let batch = batch_of(vec![(
            "@a:x",
            UserFields {
                email: Some("a@x".into()),
                phone: Some("123".into()),
                active: true,
            },
        )]);

        let result = pool(&store)
            .submit(&batch, Some(Pepper::new("p")), FailurePolicy::Strict)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_best_effort_policy_keeps_going() {
        let store = MemoryStore::new();
        store.fail_next_inserts(1);
        let batch = batch_of(vec![(
            "@a:x",
            UserFields {
                email: Some("a@x".into()),
                phone: Some("123".into()),
                active: true,
            },
        )]);

        let outcome = pool(&store)
            .submit(&batch, Some(Pepper::new("p")), FailurePolicy::BestEffort)
            .await
            .unwrap();
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.inserted, 3);
        assert_eq!(store.count_hashes().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_concurrency_cap_observed() {
        let store = MemoryStore::new();
        let mut entries = Vec::new();
        let emails: Vec<String> = (0..20).map(|i| format!("user{i}@x")).collect();
        let addresses: Vec<String> = (0..20).map(|i| format!("@user{i}:x")).collect();
        for i in 0..20 {
            entries.push((
                addresses[i].as_str(),
                UserFields {
                    email: Some(emails[i].clone()),
                    phone: None,
                    active: true,
                },
            ));
        }
        let batch = batch_of(entries);

        let pool = HashComputationPool::with_concurrency(
            Arc::new(store.clone()),
            Arc::new(BuiltinHashEngine::new()),
            3,
        );
        pool.submit(&batch, Some(Pepper::new("p")), FailurePolicy::Strict)
            .await
            .unwrap();

        assert_eq!(store.count_hashes().await.unwrap(), 40);
        assert!(store.max_in_flight() <= 3, "cap exceeded: {}", store.max_in_flight());
    }
}
