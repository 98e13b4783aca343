//! Memory-aware cache tiers for the herald runtime.
//!
//! Hosts the tier manager (independently policed namespaces with transparent
//! value wrapping), the resource monitor that drives graduated eviction, and
//! the reentrant-safe emergency cleanup coordinator.

pub mod cache_tiers;
pub mod cache_value;
pub mod emergency_cleanup;
pub mod error_signature;
pub mod resource_monitor;

pub use cache_tiers::*;
pub use cache_value::*;
pub use emergency_cleanup::*;
pub use error_signature::*;
pub use resource_monitor::*;
