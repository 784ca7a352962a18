//! Scheduled maintenance jobs.
//!
//! Three jobs keep the catalog and the peers in sync:
//! - [`rotation::PepperRotationJob`]: full-catalog rebuild under a fresh
//!   pepper.
//! - [`incremental::IncrementalUserSyncJob`]: cheap differential
//!   reconciliation between full rotations.
//! - [`federation::FederationSyncJob`]: republish the catalog to remote
//!   peers under their peppers and algorithms.
//!
//! Failure taxonomy: a missing current pepper is fatal to the cycle and
//! surfaces as an error from `run_cycle`; per-peer failures are isolated and
//! logged; individual row failures during retirement and reconciliation are
//! logged and swallowed; pool failures on the strict path abort their batch
//! and surface to the caller.

pub mod federation;
pub mod incremental;
pub mod rotation;

use crate::directory::DirectoryError;
use crate::pool::PoolError;
use crate::store::StoreError;
use thiserror::Error;

/// Errors that abort a job cycle.
#[derive(Debug, Error)]
pub enum JobError {
    /// Rotation requires an existing current pepper; bootstrap is the only
    /// path that may run without one.
    #[error("no current pepper in storage; catalog was never bootstrapped")]
    MissingCurrentPepper,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}
