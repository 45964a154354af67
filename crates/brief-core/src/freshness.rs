use std::time::Duration;

/// Reference TTL: six hours.
pub const DEFAULT_TTL: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreshnessState {
    pub is_first_run: bool,
    pub should_refresh: bool,
}

/// Pure freshness decision.
///
/// - no prior refresh: first run, refresh
/// - otherwise refresh once the elapsed time exceeds `ttl`
///
/// Elapsed time is the absolute distance between `now` and the last refresh, so a
/// ledger entry that lies in the future (clock rolled back) is treated as recent
/// rather than immediately due. This is a policy choice, not an observed guarantee.
pub fn evaluate(last_timestamp_unix: Option<i64>, now_unix: i64, ttl: Duration) -> FreshnessState {
    match last_timestamp_unix {
        None => FreshnessState { is_first_run: true, should_refresh: true },
        Some(last) => FreshnessState {
            is_first_run: false,
            should_refresh: elapsed(last, now_unix) > ttl,
        },
    }
}

/// Absolute distance between two unix timestamps.
pub fn elapsed(a_unix: i64, b_unix: i64) -> Duration {
    Duration::from_secs(a_unix.abs_diff(b_unix))
}

/// Seconds until the next refresh is due, or zero when already stale.
pub fn remaining(last_timestamp_unix: Option<i64>, now_unix: i64, ttl: Duration) -> Duration {
    match last_timestamp_unix {
        None => Duration::ZERO,
        Some(last) => ttl.saturating_sub(elapsed(last, now_unix)),
    }
}
