//! Per-user token-bucket bandwidth limiter (spec.md §4.B).
//!
//! Grounded in the general "per-user limiter with a background loader and
//! a per-call throttle" shape of
//! `examples/original_source/internal/traffic/traffic_controller.go`, but
//! implements the spec's own, more precise token-bucket algorithm rather
//! than the original's session-speed-based throttle (the original computes
//! `sessionBytes/elapsedSeconds`; this is a real continuous-refill bucket).
//! The per-user-mutex-released-before-suspend pattern and cancellable wait
//! are grounded in `other_examples`'s RustSocks relay (`proxy_upload`'s
//! `tokio::select!` over a `CancellationToken`).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

const MAX_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Bucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate: f64, now: Instant) -> Self {
        let capacity = 2.0 * rate;
        Self {
            rate,
            capacity,
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}

/// Outcome of a `throttle` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleOutcome {
    /// Credit was available (or the user is unlimited); proceed.
    Ok,
    /// The wait was cancelled before the cap elapsed; caller should tear
    /// the session down rather than forward bytes.
    Cancelled,
}

/// Per-user token buckets. Each bucket is guarded by its own entry's
/// mutex; the map's own mutex is only ever held for the lookup/insert,
/// never across the suspension (spec.md §5, Token buckets).
pub struct Limiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Limiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Enforce (or reset) this user's configured rate. `rate_bytes_per_sec
    /// == 0` means unlimited; such users get no bucket at all so
    /// `throttle` is a pure pass-through. Called whenever the credential
    /// cache refreshes and a user's configured rate has changed
    /// (spec.md §4.B, hot-reload).
    pub fn set_rate(&self, user_id: &str, rate_bytes_per_sec: u64) {
        let mut buckets = self.buckets.lock().unwrap();
        if rate_bytes_per_sec == 0 {
            buckets.remove(user_id);
            return;
        }
        buckets.insert(
            user_id.to_string(),
            Bucket::new(rate_bytes_per_sec as f64, Instant::now()),
        );
    }

    /// Acquire credit for `n_bytes` already read on `user_id`'s
    /// connection. Returns immediately if the user has no bucket
    /// (unlimited). Otherwise refills, deducts if possible, or computes a
    /// capped wait and suspends — cancellable via `cancel`.
    pub async fn throttle(&self, user_id: &str, n_bytes: u64, cancel: &CancellationToken) -> ThrottleOutcome {
        let wait = {
            let mut buckets = self.buckets.lock().unwrap();
            let Some(bucket) = buckets.get_mut(user_id) else {
                return ThrottleOutcome::Ok;
            };

            bucket.refill(Instant::now());
            let need = n_bytes as f64;
            if bucket.tokens >= need {
                bucket.tokens -= need;
                None
            } else {
                let deficit = need - bucket.tokens;
                bucket.tokens = 0.0;
                let wait_secs = (deficit / bucket.rate).min(MAX_WAIT.as_secs_f64());
                Some(Duration::from_secs_f64(wait_secs))
            }
        };
        // mutex released here; suspension below never holds it (spec.md §4.B)

        let Some(wait) = wait else {
            return ThrottleOutcome::Ok;
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => ThrottleOutcome::Ok,
            _ = cancel.cancelled() => ThrottleOutcome::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_user_passes_through_immediately() {
        let limiter = Limiter::new();
        let cancel = CancellationToken::new();
        let outcome = limiter.throttle("nouser", 10_000_000, &cancel).await;
        assert_eq!(outcome, ThrottleOutcome::Ok);
    }

    #[tokio::test]
    async fn full_bucket_absorbs_small_write_without_delay() {
        let limiter = Limiter::new();
        limiter.set_rate("alice", 1000);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let outcome = limiter.throttle("alice", 500, &cancel).await;
        assert_eq!(outcome, ThrottleOutcome::Ok);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_write_waits_and_is_capped_at_five_seconds() {
        let limiter = Limiter::new();
        limiter.set_rate("bob", 100); // capacity = 200
        let cancel = CancellationToken::new();

        // First call drains the full bucket (200 tokens) for free.
        let first = limiter.throttle("bob", 200, &cancel).await;
        assert_eq!(first, ThrottleOutcome::Ok);

        // A huge follow-up request needs far more than 5s of refill; the
        // wait is capped at MAX_WAIT and still reports success.
        let before = Instant::now();
        let second = limiter.throttle("bob", 1_000_000, &cancel).await;
        assert_eq!(second, ThrottleOutcome::Ok);
        assert_eq!(before.elapsed(), MAX_WAIT);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let limiter = Limiter::new();
        limiter.set_rate("carol", 10); // capacity = 20
        let cancel = CancellationToken::new();

        let _ = limiter.throttle("carol", 20, &cancel).await; // drain
        cancel.cancel();
        let outcome = limiter.throttle("carol", 1000, &cancel).await;
        assert_eq!(outcome, ThrottleOutcome::Cancelled);
    }

    #[test]
    fn rate_zero_removes_any_existing_bucket() {
        let limiter = Limiter::new();
        limiter.set_rate("dan", 500);
        limiter.set_rate("dan", 0);
        assert!(limiter.buckets.lock().unwrap().get("dan").is_none());
    }
}
