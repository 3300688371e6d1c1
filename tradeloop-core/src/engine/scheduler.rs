use crate::engine::delta::{CoalescingQueue, PendingDiscovery, PushOutcome};
use crate::types::{EngineError, EngineResult};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Token bucket guarding a sensitive operation, refilled lazily on acquire
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity: capacity.max(1) as f64,
            tokens: capacity.max(1) as f64,
            refill_per_sec: refill_per_sec.max(1) as f64,
            last_refill: Instant::now(),
        }
    }

    pub fn try_acquire(&mut self, now: Instant) -> Result<(), u64> {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            let retry_after_ms = (deficit / self.refill_per_sec * 1_000.0).ceil() as u64;
            Err(retry_after_ms)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

/// Circuit breaker around an external-dependent operation. A streak of
/// failures opens it for a cooldown; the first call after the cooldown probes
/// half-open and a success closes it again.
pub struct CircuitBreaker {
    state: BreakerState,
    failure_streak: u32,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_streak: 0,
            threshold: threshold.max(1),
            cooldown,
        }
    }

    pub fn check(&mut self, now: Instant) -> EngineResult<()> {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open { until } if now >= until => {
                self.state = BreakerState::HalfOpen;
                Ok(())
            }
            BreakerState::Open { .. } => Err(EngineError::Unavailable),
        }
    }

    pub fn record_success(&mut self) {
        self.failure_streak = 0;
        self.state = BreakerState::Closed;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.failure_streak += 1;
        if self.failure_streak >= self.threshold || self.state == BreakerState::HalfOpen {
            self.state = BreakerState::Open {
                until: now + self.cooldown,
            };
            warn!(streak = self.failure_streak, "circuit breaker opened");
        }
    }

    pub fn is_open(&self, now: Instant) -> bool {
        matches!(self.state, BreakerState::Open { until } if now < until)
    }
}

/// Whether a discovery may start now
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryAdmission {
    Started,
    /// The same fingerprint is already being discovered
    AlreadyRunning,
    /// The in-flight cap is reached; the task was queued instead
    AtCapacity,
}

/// Per-tenant admission control: a bounded coalescing queue, an at-most-one
/// guarantee per discovery fingerprint, concurrency caps, a token bucket for
/// collection expansion, and a circuit breaker for collection resolution.
///
/// The scheduler owns no threads or timers; rate state advances lazily on the
/// operations themselves and sweeps run from explicit engine ticks.
pub struct TenantScheduler {
    pending: CoalescingQueue,
    queue_depth: usize,
    in_flight: Mutex<HashSet<String>>,
    max_in_flight: usize,
    expansion_bucket: Mutex<TokenBucket>,
    resolution_breaker: Mutex<CircuitBreaker>,
}

impl TenantScheduler {
    pub fn new(
        queue_depth: usize,
        max_in_flight: usize,
        expansion_burst: u32,
        expansion_per_second: u32,
        breaker_threshold: u32,
        breaker_cooldown: Duration,
    ) -> Self {
        Self {
            pending: CoalescingQueue::new(queue_depth),
            queue_depth: queue_depth.max(1),
            in_flight: Mutex::new(HashSet::new()),
            max_in_flight: max_in_flight.max(1),
            expansion_bucket: Mutex::new(TokenBucket::new(expansion_burst, expansion_per_second)),
            resolution_breaker: Mutex::new(CircuitBreaker::new(breaker_threshold, breaker_cooldown)),
        }
    }

    /// Ingestion backpressure: callers observe `Busy` once the pending queue
    /// is at capacity.
    pub fn admit_event(&self) -> EngineResult<()> {
        if self.pending.len() >= self.queue_depth {
            return Err(EngineError::Busy);
        }
        Ok(())
    }

    /// Try to start discovering for a fingerprint. Exactly one discovery per
    /// fingerprint runs at a time; excess work is parked in the queue.
    pub fn begin_discovery(&self, task: PendingDiscovery) -> DiscoveryAdmission {
        let mut in_flight = self.in_flight.lock();
        if in_flight.contains(&task.fingerprint) {
            drop(in_flight);
            if self.pending.push(task) == PushOutcome::Full {
                warn!("pending discovery queue full, coalesced burst dropped");
            }
            return DiscoveryAdmission::AlreadyRunning;
        }
        if in_flight.len() >= self.max_in_flight {
            drop(in_flight);
            if self.pending.push(task) == PushOutcome::Full {
                warn!("pending discovery queue full, task dropped");
            }
            return DiscoveryAdmission::AtCapacity;
        }
        in_flight.insert(task.fingerprint);
        DiscoveryAdmission::Started
    }

    pub fn finish_discovery(&self, fingerprint: &str) {
        self.in_flight.lock().remove(fingerprint);
    }

    /// Pop parked work that can start now, claiming its fingerprint.
    pub fn next_pending(&self) -> Option<PendingDiscovery> {
        let mut in_flight = self.in_flight.lock();
        if in_flight.len() >= self.max_in_flight {
            return None;
        }
        let task = self.pending.pop()?;
        if in_flight.contains(&task.fingerprint) {
            // Raced with a restart of the same fingerprint; put it back.
            drop(in_flight);
            let _ = self.pending.push(task);
            return None;
        }
        in_flight.insert(task.fingerprint.clone());
        debug!(fingerprint = %task.fingerprint, "dequeued pending discovery");
        Some(task)
    }

    pub fn discoveries_in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Rate-limit gate for collection expansion
    pub fn acquire_expansion_token(&self, now: Instant) -> EngineResult<()> {
        self.expansion_bucket
            .lock()
            .try_acquire(now)
            .map_err(|retry_after_ms| EngineError::RateLimited { retry_after_ms })
    }

    /// Circuit-breaker gate for collection resolution
    pub fn check_resolution(&self, now: Instant) -> EngineResult<()> {
        self.resolution_breaker.lock().check(now)
    }

    pub fn record_resolution_success(&self) {
        self.resolution_breaker.lock().record_success();
    }

    pub fn record_resolution_failure(&self, now: Instant) {
        self.resolution_breaker.lock().record_failure(now);
    }

    pub fn resolution_open(&self, now: Instant) -> bool {
        self.resolution_breaker.lock().is_open(now)
    }
}
