//! Foundational low-level utilities shared across herald crates.
//!
//! Provides atomic document writes used by the record store migration and the
//! unix-time helpers behind cache expiry and queue timestamps.

pub mod atomic_io;
pub mod time_utils;

pub use atomic_io::{write_json_atomic, write_text_atomic};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms, is_expired_unix_ms};
