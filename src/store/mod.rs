//! Storage abstractions for the hash catalog, pepper slots, and user history.
//!
//! The pepper is modeled as an explicit two-slot record (`current`,
//! `previous`) behind [`PepperStore`] rather than ad hoc key lookups: exactly
//! one `current` pepper is authoritative at any time, and `previous` exists
//! only so recently-superseded hashes stay valid for one rotation cycle.
//!
//! Two backends ship: [`MemoryStore`] (reference implementation, used heavily
//! in tests) and [`SqliteStore`] (production). Both rely on the backing
//! engine's own atomicity; this crate performs no in-process locking and
//! assumes a single active rotation instance.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of generated peppers (alphanumeric characters).
pub const PEPPER_LENGTH: usize = 32;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("invalid row: {0}")]
    InvalidRow(String),
}

/// A server-held secret concatenated into a 3PID before hashing.
///
/// Zeroized on drop; `Debug` is redacted so peppers never end up in logs.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Pepper(String);

impl Pepper {
    /// Wrap an existing pepper value (e.g. read back from storage).
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Mint a fresh random pepper of [`PEPPER_LENGTH`] alphanumeric chars.
    pub fn generate() -> Self {
        let value: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(PEPPER_LENGTH)
            .map(char::from)
            .collect();
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Pepper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pepper(<redacted>)")
    }
}

/// The two named pepper slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PepperSlot {
    /// The authoritative pepper for new hash computations.
    Current,
    /// The pepper superseded by the last rotation; its hashes remain valid
    /// until the next rotation retires them.
    Previous,
}

impl PepperSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            PepperSlot::Current => "current",
            PepperSlot::Previous => "previous",
        }
    }
}

/// A fully-qualified Matrix user address (`@localpart:server`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MatrixAddress(pub String);

impl MatrixAddress {
    /// Build the address for a local directory uid on the given server.
    pub fn for_user(uid: &str, server_name: &str) -> Self {
        Self(format!("@{uid}:{server_name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MatrixAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which 3PID field a hash record covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Email,
    Phone,
}

impl FieldKind {
    /// Storage column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Email => "email",
            FieldKind::Phone => "phone",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "email" => Some(FieldKind::Email),
            "phone" => Some(FieldKind::Phone),
            _ => None,
        }
    }
}

/// One persisted 3PID hash.
///
/// Many records reference one pepper and one user; records are bulk-deleted
/// when their pepper is retired, and the active flag is mutated in place when
/// a user's liveness changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRecord {
    pub digest: String,
    pub pepper: String,
    pub kind: FieldKind,
    pub address: MatrixAddress,
    pub active: bool,
}

/// One append-only activation/deactivation audit event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserHistoryEntry {
    pub address: MatrixAddress,
    pub timestamp: u64,
    pub active: bool,
}

impl UserHistoryEntry {
    /// Create an entry stamped with the current wall clock.
    pub fn now(address: MatrixAddress, active: bool) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            address,
            timestamp,
            active,
        }
    }
}

/// The two-slot pepper record.
#[async_trait]
pub trait PepperStore: Send + Sync {
    /// Read a slot. `None` means the slot has never been written (or was
    /// cleared).
    async fn pepper(&self, slot: PepperSlot) -> Result<Option<Pepper>, StoreError>;

    /// Overwrite a slot.
    async fn set_pepper(&self, slot: PepperSlot, value: &Pepper) -> Result<(), StoreError>;
}

/// Hash catalog and user history tables.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn insert_hash(&self, record: HashRecord) -> Result<(), StoreError>;

    /// Bulk-delete every record computed under the given pepper value.
    /// Returns the number of rows removed.
    async fn delete_hashes_by_pepper(&self, pepper: &str) -> Result<u64, StoreError>;

    /// Every (address, active) pair currently in the catalog. One user
    /// typically yields several rows (field x algorithm), so the result may
    /// contain duplicates; callers deduplicate.
    async fn catalog_addresses(&self) -> Result<Vec<(MatrixAddress, bool)>, StoreError>;

    /// Flip the active flag on all of an address's records. Returns the
    /// number of rows touched.
    async fn set_active(&self, address: &MatrixAddress, active: bool) -> Result<u64, StoreError>;

    async fn count_hashes(&self) -> Result<u64, StoreError>;

    /// Append an audit event. History rows are never updated.
    async fn append_history(&self, entry: UserHistoryEntry) -> Result<(), StoreError>;

    async fn history_for(
        &self,
        address: &MatrixAddress,
    ) -> Result<Vec<UserHistoryEntry>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pepper_generation_length_and_charset() {
        let pepper = Pepper::generate();
        assert_eq!(pepper.as_str().len(), PEPPER_LENGTH);
        assert!(pepper.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_pepper_generation_unique() {
        assert_ne!(Pepper::generate(), Pepper::generate());
    }

    #[test]
    fn test_pepper_debug_redacted() {
        let pepper = Pepper::new("supersecret");
        assert_eq!(format!("{:?}", pepper), "Pepper(<redacted>)");
    }

    #[test]
    fn test_matrix_address_for_user() {
        let addr = MatrixAddress::for_user("dwho", "example.com");
        assert_eq!(addr.as_str(), "@dwho:example.com");
    }

    #[test]
    fn test_field_kind_round_trip() {
        assert_eq!(FieldKind::parse("email"), Some(FieldKind::Email));
        assert_eq!(FieldKind::parse("phone"), Some(FieldKind::Phone));
        assert_eq!(FieldKind::parse("msisdn"), None);
        assert_eq!(FieldKind::Email.as_str(), "email");
        assert_eq!(FieldKind::Phone.as_str(), "phone");
    }

    #[test]
    fn test_pepper_slot_names() {
        assert_eq!(PepperSlot::Current.as_str(), "current");
        assert_eq!(PepperSlot::Previous.as_str(), "previous");
    }
}
