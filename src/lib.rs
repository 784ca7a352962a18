//! Saltern - Identifier-Privacy Subsystem for a Matrix Identity Service
//!
//! Lets a homeserver answer "does this email/phone belong to a known Matrix
//! account?" without ever exposing the raw identifier, and keeps that same
//! privacy-preserving answer synchronized with federation peers that do not
//! share the local database.
//!
//! Key principles:
//! - Raw 3PIDs are never published; only peppered digests leave the process
//! - The pepper rotates periodically so retired catalogs become unusable
//! - One peer's failure never serializes or aborts a sync cycle for others
//! - Exactly one instance performs pepper rotation (no distributed locking)

pub mod directory;
pub mod filter;
pub mod hasher;
pub mod jobs;
pub mod peers;
pub mod pool;
pub mod scheduler;
pub mod store;
