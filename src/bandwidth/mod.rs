//! Per-connection bandwidth limiting with priority classes (§4.4).

use std::time::Instant;

use crate::config::BandwidthConfig;

/// Priority classes, high index first. Ordering matters: `Ord` reflects send-scheduler priority,
/// not numeric value, so `Priority::Ack < Priority::UnreliableLow` reads naturally as "Ack is
/// scheduled before UnreliableLow".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Ack,
    Reliable,
    UnreliableHigh,
    Unreliable,
    UnreliableLow,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Ack,
        Priority::Reliable,
        Priority::UnreliableHigh,
        Priority::Unreliable,
        Priority::UnreliableLow,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Packets in this class (and below) may be discarded under bandwidth pressure; only
    /// `Reliable` and `Ack` must never be dropped by the scheduler (§4.3 step 4).
    pub fn is_droppable(&self) -> bool {
        *self > Priority::Reliable
    }
}

/// Capability set a bandwidth limiter must provide (§4.4).
pub trait Limiter: Send {
    /// Refreshes token pools based on elapsed time since the last call.
    fn iter(&mut self, now: Instant);
    /// Returns `true` and debits the pools if `bytes` may be sent at priority `pri` right now.
    fn check(&mut self, bytes: usize, pri: Priority) -> bool;
    /// Called when a reliable packet is freshly acknowledged.
    fn adjust_for_ack(&mut self);
    /// Called when a reliable packet is retried.
    fn adjust_for_retry(&mut self);
    /// How many outstanding reliable packets the client may have in flight (§4.2).
    fn can_buffer_packets(&self) -> u32;
    fn info(&self) -> String;
}

/// No-limit variant: `check` always succeeds.
pub struct NoLimit {
    can_buffer: u32,
}

impl NoLimit {
    pub fn new() -> Self {
        Self { can_buffer: 30 }
    }
}

impl Default for NoLimit {
    fn default() -> Self {
        Self::new()
    }
}

impl Limiter for NoLimit {
    fn iter(&mut self, _now: Instant) {}

    fn check(&mut self, _bytes: usize, _pri: Priority) -> bool {
        true
    }

    fn adjust_for_ack(&mut self) {}

    fn adjust_for_retry(&mut self) {}

    fn can_buffer_packets(&self) -> u32 {
        self.can_buffer
    }

    fn info(&self) -> String {
        "no-limit".to_string()
    }
}

/// Token-bucket limiter with per-priority reservation (§4.4, the default variant).
///
/// Each priority class owns a pool. On `iter`, elapsed time is converted into bytes at the
/// current `limit` and added to every pool (capped at `burst`). `check(bytes, pri)` succeeds only
/// if `bytes` fits in pool `pri` *and* every lower-priority pool (so that high-priority traffic
/// can always still fit inside the reservation made for it), then debits all of them.
pub struct TokenBucket {
    limit: f64,
    limit_minimum: f64,
    limit_maximum: f64,
    burst: usize,
    use_hit_limit: bool,

    shares: [u8; 5],
    pools: [f64; 5],

    last_iter: Instant,
}

impl TokenBucket {
    pub fn new(config: &BandwidthConfig) -> Self {
        let now = Instant::now();
        Self {
            limit: config.limit_minimum as f64,
            limit_minimum: config.limit_minimum as f64,
            limit_maximum: config.limit_maximum as f64,
            burst: config.burst,
            use_hit_limit: config.use_hit_limit,
            shares: config.priority_shares.0,
            pools: [0.0; 5],
            last_iter: now,
        }
    }

    fn pool_burst(&self, idx: usize) -> f64 {
        (self.burst as f64) * (self.shares[idx] as f64) / 100.0
    }
}

impl Limiter for TokenBucket {
    fn iter(&mut self, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_iter).as_millis() as f64;
        self.last_iter = now;

        let bytes_available = self.limit * elapsed_ms / 1000.0;

        for idx in 0..5 {
            let cap = self.pool_burst(idx);
            self.pools[idx] = (self.pools[idx] + bytes_available * (self.shares[idx] as f64) / 100.0).min(cap);
        }
    }

    fn check(&mut self, bytes: usize, pri: Priority) -> bool {
        let bytes = bytes as f64;
        let pri_idx = pri.index();

        // Must fit in this priority's pool and in every lower-priority pool (reservation model).
        for idx in pri_idx..5 {
            if bytes > self.pools[idx] {
                if self.use_hit_limit {
                    self.limit = (self.limit * 0.9).max(self.limit_minimum);
                }
                return false;
            }
        }

        for idx in pri_idx..5 {
            self.pools[idx] -= bytes;
        }

        true
    }

    fn adjust_for_ack(&mut self) {
        // Additive increase toward the high limit.
        self.limit = (self.limit + self.limit_minimum * 0.1).min(self.limit_maximum);
    }

    fn adjust_for_retry(&mut self) {
        // Multiplicative decrease toward the low limit.
        self.limit = (self.limit * 0.5).max(self.limit_minimum);
    }

    fn can_buffer_packets(&self) -> u32 {
        30
    }

    fn info(&self) -> String {
        format!("token-bucket limit={:.0}B/s burst={}", self.limit, self.burst)
    }
}
