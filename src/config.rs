//! Plain configuration structs mirroring the `Net` section and bandwidth keys described in the
//! base specification. Parsing the text configuration format is explicitly out of scope for this
//! crate -- a collaborator is expected to populate these structs from whatever format it reads.

use std::net::IpAddr;
use std::time::Duration;

use crate::error::{Result, ZoneError};

/// Top-level `Net` section configuration.
#[derive(Clone, Debug)]
pub struct NetConfig {
    /// Milliseconds of silence before a connection is considered lagged out.
    pub drop_timeout: Duration,
    /// Ceiling on total queued outbound bytes across all priority classes.
    pub max_outlist_size: usize,
    /// Maximum reliable send attempts before a connection is kicked.
    pub max_retries: u32,
    /// Incoming reliable window size (§4.2).
    pub reliable_window_size: u32,
    /// Number of reliable-dispatch worker threads.
    pub reliable_threads: usize,
    /// Estimated per-packet overhead (IP + UDP headers) used by the bandwidth limiter.
    pub per_packet_overhead: usize,
    /// How often ping-socket population counters are refreshed.
    pub ping_data_refresh_time: Duration,
    /// How many reliable packets a client may have outstanding (§4.2 congestion proxy).
    pub can_buffer_packets: u32,
    /// Reliable out-list depth below which the send sweep keeps pumping presized chunks onto a
    /// connection (§3, §4.1).
    pub presized_queue_threshold: usize,
    /// Maximum presized chunks queued per connection per send sweep.
    pub presized_queue_packets: usize,
}

impl Default for NetConfig {
    /// Creates a `NetConfig` with the defaults named in the base specification:
    ///   * `drop_timeout`: 3000 ms
    ///   * `max_outlist_size`: 200
    ///   * `max_retries`: 15
    ///   * `reliable_window_size`: 32
    ///   * `reliable_threads`: 1
    ///   * `per_packet_overhead`: 28 bytes
    ///   * `ping_data_refresh_time`: 200 ms
    ///   * `can_buffer_packets`: 30
    ///   * `presized_queue_threshold`: 5
    ///   * `presized_queue_packets`: 25
    fn default() -> Self {
        Self {
            drop_timeout: Duration::from_millis(3000),
            max_outlist_size: 200,
            max_retries: 15,
            reliable_window_size: 32,
            reliable_threads: 1,
            per_packet_overhead: 28,
            ping_data_refresh_time: Duration::from_millis(200),
            can_buffer_packets: 30,
            presized_queue_threshold: 5,
            presized_queue_packets: 25,
        }
    }
}

impl NetConfig {
    /// Returns `true` if every field holds a usable value.
    pub fn is_valid(&self) -> bool {
        self.max_outlist_size > 0
            && self.max_retries > 0
            && self.reliable_window_size > 0
            && self.reliable_threads > 0
            && self.can_buffer_packets > 0
            && self.presized_queue_packets > 0
    }
}

/// One `Listen`, `Listen1`, `Listen2`, ... bucket: a game/ping socket pair with accept policy.
#[derive(Clone, Debug)]
pub struct ListenerConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    pub allow_vie: bool,
    pub allow_cont: bool,
    /// Names the default arena group new connections on this bucket land in.
    pub connect_as: String,
}

impl ListenerConfig {
    /// The ping socket always lives at `port + 1`.
    pub fn ping_port(&self) -> u16 {
        self.port + 1
    }
}

/// Per-priority bandwidth shares, `PriLimit0..4`, must sum to 100.
#[derive(Clone, Copy, Debug)]
pub struct PriorityShares(pub [u8; 5]);

impl Default for PriorityShares {
    /// 20/40/20/15/5, matching the `PriLimit0..4` defaults.
    fn default() -> Self {
        Self([20, 40, 20, 15, 5])
    }
}

impl PriorityShares {
    pub fn validate(&self) -> Result<()> {
        let sum: u16 = self.0.iter().map(|&x| x as u16).sum();
        if sum != 100 {
            return Err(ZoneError::InvalidPriorityShares { sum: sum as u8 });
        }
        Ok(())
    }
}

/// Bandwidth limiter configuration (§4.4).
#[derive(Clone, Debug)]
pub struct BandwidthConfig {
    pub limit_minimum: usize,
    pub limit_maximum: usize,
    pub send_at_once: usize,
    pub limit_scale: usize,
    pub burst: usize,
    pub use_hit_limit: bool,
    pub priority_shares: PriorityShares,
}

impl Default for BandwidthConfig {
    /// `LimitMinimum=2500`, `LimitMaximum=102400`, `SendAtOnce=30`, `UseHitLimit=0`, and
    /// `LimitScale`/`Burst` set to one and four maximum packets respectively, per the base spec.
    fn default() -> Self {
        let max_packet = crate::transport::frame::MAX_PACKET_SIZE;
        Self {
            limit_minimum: 2500,
            limit_maximum: 102_400,
            send_at_once: 30,
            limit_scale: max_packet,
            burst: 4 * max_packet,
            use_hit_limit: false,
            priority_shares: PriorityShares::default(),
        }
    }
}

impl BandwidthConfig {
    pub fn is_valid(&self) -> bool {
        self.limit_minimum > 0
            && self.limit_maximum >= self.limit_minimum
            && self.limit_scale > 0
            && self.burst > 0
            && self.priority_shares.validate().is_ok()
    }
}

/// Aggregate configuration handed to a [`Transport`](crate::transport::Transport) at construction.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub net: NetConfig,
    pub bandwidth: BandwidthConfig,
    pub listeners: Vec<ListenerConfig>,
}

impl Config {
    pub fn is_valid(&self) -> bool {
        self.net.is_valid() && self.bandwidth.is_valid() && !self.listeners.is_empty()
    }
}
