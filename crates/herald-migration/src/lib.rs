//! Identity migration for the persisted record store.
//!
//! A run scans the store for legacy identifiers, resolves them through the
//! live session in paced batches, then rewrites, renames or deletes the
//! affected documents. Running it again over a migrated store is a no-op.

pub mod identity_resolve;
pub mod identity_rewrite;
pub mod identity_scan;
pub mod migration_engine;
pub mod migration_report;

pub use identity_resolve::*;
pub use identity_rewrite::*;
pub use identity_scan::*;
pub use migration_engine::*;
pub use migration_report::*;
