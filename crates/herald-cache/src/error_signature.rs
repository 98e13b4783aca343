use std::sync::OnceLock;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};

/// Error text fragments that indicate the process is running out of memory,
/// disk space or file descriptors.
pub const RESOURCE_EXHAUSTION_SIGNATURES: &[&str] = &[
    "enospc",
    "no space left on device",
    "enomem",
    "out of memory",
    "cannot allocate memory",
    "memory allocation failed",
    "memory allocation of",
    "heap limit",
    "emfile",
    "too many open files",
    "disk quota exceeded",
];

fn signature_matcher() -> Option<&'static AhoCorasick> {
    static MATCHER: OnceLock<Option<AhoCorasick>> = OnceLock::new();
    MATCHER
        .get_or_init(|| {
            AhoCorasickBuilder::new()
                .ascii_case_insensitive(true)
                .match_kind(MatchKind::LeftmostFirst)
                .build(RESOURCE_EXHAUSTION_SIGNATURES)
                .ok()
        })
        .as_ref()
}

/// Returns the first resource-exhaustion signature found in `text`.
pub fn resource_exhaustion_signature(text: &str) -> Option<&'static str> {
    let matcher = signature_matcher()?;
    matcher
        .find(text)
        .map(|found| RESOURCE_EXHAUSTION_SIGNATURES[found.pattern().as_usize()])
}

pub fn is_resource_exhaustion(text: &str) -> bool {
    resource_exhaustion_signature(text).is_some()
}
