//! Failure classification from agent output.

const TRANSIENT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "token limit",
    "token_limit",
    "overloaded",
    "too many requests",
    "usage limit",
];

/// Whether the output of a failed run points at a rate/token limit or an
/// overloaded backend, i.e. a failure worth retrying after a delay.
pub fn is_transient_rate_or_token_limit_error(output: &str) -> bool {
    let lower = output.to_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
}
