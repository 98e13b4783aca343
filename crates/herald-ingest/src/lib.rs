//! Bounded-concurrency ingestion queue for inbound message batches.
//!
//! Items start in enqueue order on at most `max_workers` concurrent tasks.
//! A failing item rejects only its own ticket and is reported to the
//! registered error handler.

pub mod ingest_queue;

pub use ingest_queue::*;
