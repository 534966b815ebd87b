//! Reconnect backoff for queue connectivity loss.
//!
//! The deterministic part (attempt → ceiling) is a pure function so it can
//! be unit-tested without timing or network dependencies; jitter sampling is
//! layered on top. Workers use full jitter: a uniform delay in
//! `[0, ceiling]`, with ceiling doubling per attempt from
//! [`RECONNECT_BASE`] up to [`RECONNECT_CAP`].

use std::time::Duration;

use rand::Rng;

/// Default base delay for the first reconnect attempt.
pub const RECONNECT_BASE: Duration = Duration::from_secs(1);

/// Default upper bound on the backoff ceiling.
pub const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Default reconnect attempts before a worker reports itself unhealthy and
/// exits its loop.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Deterministic backoff ceiling for a 1-based attempt count.
///
/// `ceiling(n) = min(cap, base * 2^(n-1))`, saturating on overflow.
pub fn backoff_ceiling(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let factor = 2u32.saturating_pow(exponent);
    base.saturating_mul(factor).min(cap)
}

/// Sample a full-jitter delay: uniform in `[0, ceiling]`.
pub fn with_full_jitter<R: Rng>(ceiling: Duration, rng: &mut R) -> Duration {
    if ceiling.is_zero() {
        return Duration::ZERO;
    }
    let millis = rng.gen_range(0..=ceiling.as_millis() as u64);
    Duration::from_millis(millis)
}

/// Jittered delay before the given reconnect attempt.
pub fn reconnect_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let ceiling = backoff_ceiling(attempt, base, cap);
    with_full_jitter(ceiling, &mut rand::thread_rng())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn ceiling_doubles_per_attempt() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(30);
        assert_eq!(backoff_ceiling(1, base, cap), Duration::from_secs(1));
        assert_eq!(backoff_ceiling(2, base, cap), Duration::from_secs(2));
        assert_eq!(backoff_ceiling(3, base, cap), Duration::from_secs(4));
        assert_eq!(backoff_ceiling(5, base, cap), Duration::from_secs(16));
    }

    #[test]
    fn ceiling_is_capped() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(30);
        assert_eq!(backoff_ceiling(6, base, cap), Duration::from_secs(30));
        assert_eq!(backoff_ceiling(100, base, cap), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_ceiling() {
        let mut rng = StdRng::seed_from_u64(42);
        let ceiling = Duration::from_secs(4);
        for _ in 0..1000 {
            let delay = with_full_jitter(ceiling, &mut rng);
            assert!(delay <= ceiling);
        }
    }

    #[test]
    fn zero_ceiling_yields_zero_delay() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(with_full_jitter(Duration::ZERO, &mut rng), Duration::ZERO);
    }
}
