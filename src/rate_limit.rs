use crate::settings::{ClassLimit, RateLimit as RateLimitCfg};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Endpoint classes for admission control. Classification is an ordered
/// first-match over the request method and path; unmatched requests fall
/// into Fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    BatchWrite,
    SingleWrite,
    Read,
    ProjectRead,
    OverviewRead,
    DeviceInit,
    DeviceConfirm,
    Fallback,
}

impl EndpointClass {
    pub fn classify(method: &str, path: &str) -> Self {
        if path.starts_with("/api/activity") && path.ends_with("/batch") {
            EndpointClass::BatchWrite
        } else if path.starts_with("/api/activity") && method == "POST" {
            EndpointClass::SingleWrite
        } else if path.starts_with("/api/activity") && method == "GET" {
            EndpointClass::Read
        } else if path.starts_with("/api/projects") {
            EndpointClass::ProjectRead
        } else if path.starts_with("/api/overview") {
            EndpointClass::OverviewRead
        } else if path.starts_with("/api/auth/device") && !path.contains("confirm") {
            EndpointClass::DeviceInit
        } else if path.starts_with("/api/auth/device/confirm") {
            EndpointClass::DeviceConfirm
        } else {
            EndpointClass::Fallback
        }
    }
}

/// Outcome of a consume attempt
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub retry_after: Duration,
}

impl Decision {
    /// Seconds until retry, rounded up so clients never retry early
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

/// Interval-refill token bucket: the full refill amount lands once per
/// elapsed period, never fractionally.
#[derive(Debug)]
struct Bucket {
    capacity: u64,
    refill_amount: u64,
    refill_period: Duration,
    available: u64,
    last_refill: Instant,
}

impl Bucket {
    fn new(limit: ClassLimit, now: Instant) -> Self {
        Self {
            capacity: limit.capacity,
            refill_amount: limit.capacity,
            refill_period: Duration::from_secs(limit.refill_period_secs.max(1)),
            available: limit.capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let periods = (elapsed.as_nanos() / self.refill_period.as_nanos()) as u64;
        if periods > 0 {
            self.available = self
                .available
                .saturating_add(periods.saturating_mul(self.refill_amount))
                .min(self.capacity);
            self.last_refill += self.refill_period * periods as u32;
        }
    }

    fn try_consume(&mut self, cost: u64, now: Instant) -> Decision {
        self.refill(now);

        if self.available >= cost {
            self.available -= cost;
            Decision {
                allowed: true,
                limit: self.capacity,
                remaining: self.available,
                retry_after: Duration::ZERO,
            }
        } else {
            let deficit = cost - self.available;
            let periods_needed = deficit.div_ceil(self.refill_amount.max(1));
            let ready_at = self.last_refill + self.refill_period * periods_needed as u32;
            Decision {
                allowed: false,
                limit: self.capacity,
                remaining: self.available,
                retry_after: ready_at.saturating_duration_since(now),
            }
        }
    }
}

/// Admission control per (caller key, endpoint class).
///
/// Owns its bucket table: a fresh limiter starts empty, and dropping it
/// drops all accumulated state. Buckets are created on first use, exactly
/// once per key, and each bucket is locked independently so contention
/// stays within one key.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: RateLimitCfg,
    buckets: Mutex<HashMap<(String, EndpointClass), Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitCfg) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                buckets: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.inner.cfg.enabled
    }

    fn limit_for(&self, class: EndpointClass) -> ClassLimit {
        let cfg = &self.inner.cfg;
        match class {
            EndpointClass::BatchWrite => cfg.batch_write,
            EndpointClass::SingleWrite => cfg.single_write,
            EndpointClass::Read => cfg.read,
            EndpointClass::ProjectRead => cfg.project_read,
            EndpointClass::OverviewRead => cfg.overview_read,
            EndpointClass::DeviceInit => cfg.device_init,
            EndpointClass::DeviceConfirm => cfg.device_confirm,
            EndpointClass::Fallback => cfg.fallback,
        }
    }

    pub fn try_consume(&self, key: &str, class: EndpointClass, cost: u64) -> Decision {
        self.try_consume_at(key, class, cost, Instant::now())
    }

    fn try_consume_at(&self, key: &str, class: EndpointClass, cost: u64, now: Instant) -> Decision {
        // Kill switch: allow without touching bucket state
        if !self.inner.cfg.enabled {
            return Decision {
                allowed: true,
                limit: u64::MAX,
                remaining: u64::MAX,
                retry_after: Duration::ZERO,
            };
        }

        let bucket = {
            let mut map = self
                .inner
                .buckets
                .lock()
                .expect("rate limiter bucket map poisoned");
            map.entry((key.to_string(), class))
                .or_insert_with(|| Arc::new(Mutex::new(Bucket::new(self.limit_for(class), now))))
                .clone()
        };

        let mut bucket = bucket.lock().expect("rate limiter bucket poisoned");
        bucket.try_consume(cost, now)
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.inner.buckets.lock().expect("bucket map poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::RateLimit as RateLimitCfg;

    fn limiter(enabled: bool) -> RateLimiter {
        RateLimiter::new(RateLimitCfg {
            enabled,
            ..RateLimitCfg::default()
        })
    }

    #[test]
    fn test_classify_ordered_first_match() {
        use EndpointClass::*;

        assert_eq!(EndpointClass::classify("POST", "/api/activity/batch"), BatchWrite);
        assert_eq!(EndpointClass::classify("POST", "/api/activity"), SingleWrite);
        assert_eq!(EndpointClass::classify("GET", "/api/activity"), Read);
        assert_eq!(EndpointClass::classify("GET", "/api/projects/42"), ProjectRead);
        assert_eq!(EndpointClass::classify("GET", "/api/overview"), OverviewRead);
        assert_eq!(EndpointClass::classify("POST", "/api/auth/device"), DeviceInit);
        assert_eq!(
            EndpointClass::classify("POST", "/api/auth/device/token"),
            DeviceInit
        );
        assert_eq!(
            EndpointClass::classify("POST", "/api/auth/device/confirm"),
            DeviceConfirm
        );
        assert_eq!(EndpointClass::classify("GET", "/api/unknown"), Fallback);
        assert_eq!(EndpointClass::classify("DELETE", "/api/activity"), Fallback);
    }

    #[test]
    fn test_bucket_capacity_then_deny() {
        let limit = ClassLimit::new(10, 60);
        let now = Instant::now();
        let mut bucket = Bucket::new(limit, now);

        for _ in 0..10 {
            assert!(bucket.try_consume(1, now).allowed);
        }

        let denied = bucket.try_consume(1, now);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after > Duration::ZERO);
        assert!(denied.retry_after <= Duration::from_secs(60));
    }

    #[test]
    fn test_bucket_refills_after_period() {
        let limit = ClassLimit::new(5, 60);
        let now = Instant::now();
        let mut bucket = Bucket::new(limit, now);

        for _ in 0..5 {
            assert!(bucket.try_consume(1, now).allowed);
        }
        assert!(!bucket.try_consume(1, now).allowed);

        // A full period later the whole refill amount is back
        let later = now + Duration::from_secs(60);
        for _ in 0..5 {
            assert!(bucket.try_consume(1, later).allowed);
        }
        assert!(!bucket.try_consume(1, later).allowed);
    }

    #[test]
    fn test_bucket_no_partial_refill() {
        let limit = ClassLimit::new(5, 60);
        let now = Instant::now();
        let mut bucket = Bucket::new(limit, now);

        for _ in 0..5 {
            assert!(bucket.try_consume(1, now).allowed);
        }

        // Half a period is not enough for an interval refill
        let halfway = now + Duration::from_secs(30);
        let denied = bucket.try_consume(1, halfway);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_secs(30));
    }

    #[test]
    fn test_bucket_refill_capped_at_capacity() {
        let limit = ClassLimit::new(5, 60);
        let now = Instant::now();
        let mut bucket = Bucket::new(limit, now);

        assert!(bucket.try_consume(1, now).allowed);

        // Many idle periods never push available past capacity
        let much_later = now + Duration::from_secs(600);
        let decision = bucket.try_consume(1, much_later);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[test]
    fn test_scenario_batch_write_bucket() {
        let limiter = limiter(true);
        let now = Instant::now();

        for _ in 0..10 {
            let d = limiter.try_consume_at("user:42", EndpointClass::BatchWrite, 1, now);
            assert!(d.allowed);
        }

        let denied = limiter.try_consume_at("user:42", EndpointClass::BatchWrite, 1, now);
        assert!(!denied.allowed);
        assert_eq!(denied.limit, 10);
        assert_eq!(denied.retry_after, Duration::from_secs(60));
        assert_eq!(denied.retry_after_secs(), 60);
    }

    #[test]
    fn test_buckets_are_isolated_per_key_and_class() {
        let limiter = limiter(true);
        let now = Instant::now();

        for _ in 0..5 {
            assert!(limiter
                .try_consume_at("user:1", EndpointClass::DeviceInit, 1, now)
                .allowed);
        }
        assert!(!limiter
            .try_consume_at("user:1", EndpointClass::DeviceInit, 1, now)
            .allowed);

        // Another key and another class are untouched
        assert!(limiter
            .try_consume_at("user:2", EndpointClass::DeviceInit, 1, now)
            .allowed);
        assert!(limiter
            .try_consume_at("user:1", EndpointClass::DeviceConfirm, 1, now)
            .allowed);
    }

    #[test]
    fn test_bucket_created_once_per_key() {
        let limiter = limiter(true);
        let now = Instant::now();

        let first = limiter.try_consume_at("user:1", EndpointClass::Read, 1, now);
        let second = limiter.try_consume_at("user:1", EndpointClass::Read, 1, now);

        assert_eq!(limiter.bucket_count(), 1);
        // Same bucket: consumption is cumulative, not reset by a re-resolve
        assert_eq!(first.remaining, 29);
        assert_eq!(second.remaining, 28);
    }

    #[test]
    fn test_kill_switch_allows_without_state() {
        let limiter = limiter(false);

        for _ in 0..1000 {
            let d = limiter.try_consume("user:1", EndpointClass::DeviceInit, 1);
            assert!(d.allowed);
        }

        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let d = Decision {
            allowed: false,
            limit: 1,
            remaining: 0,
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(d.retry_after_secs(), 2);
    }
}
