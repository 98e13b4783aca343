use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use futures_util::future::join_all;
use herald_session::IdentifierResolver;

pub const DEFAULT_BATCH_SIZE: usize = 5;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_millis(100);
pub const DEFAULT_BATCH_PAUSE: Duration = Duration::from_millis(200);

/// Pacing for identifier lookups against the live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvePacing {
    pub batch_size: usize,
    pub max_attempts: u32,
    /// Delay before retry `n` is `backoff_step * n`.
    pub backoff_step: Duration,
    pub batch_pause: Duration,
}

impl Default for ResolvePacing {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_step: DEFAULT_BACKOFF_STEP,
            batch_pause: DEFAULT_BATCH_PAUSE,
        }
    }
}

/// Resolved identifiers and orphans; disjoint, together covering every candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub mapping: BTreeMap<String, String>,
    pub orphans: BTreeSet<String>,
    /// Lookups that ended in an error after every attempt.
    pub failed_lookups: usize,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty() && self.orphans.is_empty()
    }
}

enum LookupOutcome {
    Resolved(String),
    Missing,
    Failed,
}

/// Resolves `candidates` in sequential batches; lookups inside a batch run concurrently.
pub async fn resolve_candidates(
    candidates: &BTreeSet<String>,
    resolver: &dyn IdentifierResolver,
    pacing: ResolvePacing,
) -> Resolution {
    let mut resolution = Resolution::default();
    let ordered = candidates.iter().collect::<Vec<_>>();
    let batch_size = pacing.batch_size.max(1);
    let batch_count = ordered.len().div_ceil(batch_size);

    for (index, batch) in ordered.chunks(batch_size).enumerate() {
        let outcomes = join_all(
            batch
                .iter()
                .map(|legacy_id| lookup_with_retry(resolver, legacy_id, pacing)),
        )
        .await;
        for (legacy_id, outcome) in batch.iter().zip(outcomes) {
            match outcome {
                LookupOutcome::Resolved(new_id) => {
                    resolution.mapping.insert((*legacy_id).clone(), new_id);
                }
                LookupOutcome::Missing => {
                    resolution.orphans.insert((*legacy_id).clone());
                }
                LookupOutcome::Failed => {
                    resolution.failed_lookups += 1;
                    resolution.orphans.insert((*legacy_id).clone());
                }
            }
        }
        tracing::debug!(
            batch = index + 1,
            batches = batch_count,
            resolved = resolution.mapping.len(),
            orphans = resolution.orphans.len(),
            "identifier batch resolved"
        );
        if index + 1 < batch_count && !pacing.batch_pause.is_zero() {
            tokio::time::sleep(pacing.batch_pause).await;
        }
    }
    resolution
}

async fn lookup_with_retry(
    resolver: &dyn IdentifierResolver,
    legacy_id: &str,
    pacing: ResolvePacing,
) -> LookupOutcome {
    let attempts = pacing.max_attempts.max(1);
    for attempt in 1..=attempts {
        match resolver.resolve(legacy_id).await {
            Ok(Some(new_id)) if !new_id.trim().is_empty() => {
                return LookupOutcome::Resolved(new_id);
            }
            Ok(_) => return LookupOutcome::Missing,
            Err(error) => {
                tracing::warn!(
                    legacy_id,
                    attempt,
                    attempts,
                    error = %format!("{error:#}"),
                    "identifier lookup failed"
                );
                if attempt < attempts {
                    tokio::time::sleep(pacing.backoff_step * attempt).await;
                }
            }
        }
    }
    LookupOutcome::Failed
}
