//! Shared cross-partition replication domain primitives.
//!
//! This crate owns the deterministic parts of replication: change-event and
//! work-item contracts, event ordering, version-record claim rules, and key
//! filtering. It intentionally excludes AWS SDK and Lambda runtime concerns.

pub mod contract;
pub mod error;
pub mod filter;
pub mod ordering;
pub mod version;
