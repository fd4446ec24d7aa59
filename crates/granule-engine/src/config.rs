//! Engine configuration
//!
//! Timing defaults follow RFC 7252 §4.8. Everything is passed in
//! explicitly; there is no process-wide configuration state.

use std::time::Duration;
use tracing::warn;

/// Deduplicator strategy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeduplicatorMode {
    /// Insert on first sight, periodic sweep evicts expired entries
    #[default]
    MarkAndSweep,
    /// Three generations rotated on a timer
    CropRotation,
    /// Always reports "not seen"
    Noop,
}

impl DeduplicatorMode {
    /// Parse a strategy name. The truncated crop-rotation spelling is a
    /// legacy config key that must keep working; it logs a warning.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "MarkAndSweep" | "MARK_AND_SWEEP" | "DEDUPLICATOR_MARK_AND_SWEEP" => {
                Some(DeduplicatorMode::MarkAndSweep)
            }
            "CropRotation" | "DEDUPLICATOR_CROP_ROTATION" => Some(DeduplicatorMode::CropRotation),
            "CropRotatio" | "DEDUPLICATOR_CROP_ROTATIO" => {
                warn!("accepting legacy misspelled deduplicator name {:?}", name);
                Some(DeduplicatorMode::CropRotation)
            }
            "Noop" | "NOOP" | "DEDUPLICATOR_NOOP" => Some(DeduplicatorMode::Noop),
            _ => None,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base retransmit timeout
    pub ack_timeout: Duration,
    /// Upper bound of the initial-timeout jitter multiplier (>= 1.0)
    pub ack_random_factor: f64,
    /// Retransmit attempts before a CON fails
    pub max_retransmit: u32,
    /// Dedup window and exchange max age
    pub exchange_lifetime: Duration,
    /// Sweep period for the mark-and-sweep deduplicator (also the
    /// crop-rotation period)
    pub mark_and_sweep_interval: Duration,
    /// Deduplicator strategy
    pub deduplicator: DeduplicatorMode,
    /// Default token length in bytes (0-8); -1 picks a random length
    /// per request
    pub token_length: i8,
    /// Seed the MID counter with a random value at start
    pub use_random_mid_start: bool,
    /// Preferred block size for blockwise transfers (16-1024, power of two)
    pub preferred_block_size: usize,
    /// Max age of a partial blockwise body
    pub blockwise_status_lifetime: Duration,
    /// Every n-th notification goes out CON as a freshness probe
    pub notification_check_interval_count: u32,
    /// A CON freshness probe at least this often
    pub notification_check_interval_time: Duration,
    /// Worker tasks driving the stack
    pub executor_workers: usize,
    /// Per-worker job queue depth
    pub executor_queue_depth: usize,
    /// SO_RCVBUF hint handed to the channel
    pub channel_receive_buffer_size: Option<usize>,
    /// SO_SNDBUF hint handed to the channel
    pub channel_send_buffer_size: Option<usize>,
    /// Largest datagram accepted on receive
    pub channel_receive_packet_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            exchange_lifetime: Duration::from_secs(247),
            mark_and_sweep_interval: Duration::from_secs(10),
            deduplicator: DeduplicatorMode::MarkAndSweep,
            token_length: 8,
            use_random_mid_start: true,
            preferred_block_size: 1024,
            blockwise_status_lifetime: Duration::from_secs(300),
            notification_check_interval_count: 100,
            notification_check_interval_time: Duration::from_secs(120),
            executor_workers: 2,
            executor_queue_depth: 1024,
            channel_receive_buffer_size: None,
            channel_send_buffer_size: None,
            channel_receive_packet_size: 2048,
        }
    }
}

impl Config {
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_max_retransmit(mut self, attempts: u32) -> Self {
        self.max_retransmit = attempts;
        self
    }

    pub fn with_exchange_lifetime(mut self, lifetime: Duration) -> Self {
        self.exchange_lifetime = lifetime;
        self
    }

    pub fn with_deduplicator(mut self, mode: DeduplicatorMode) -> Self {
        self.deduplicator = mode;
        self
    }

    pub fn with_token_length(mut self, length: i8) -> Self {
        self.token_length = length;
        self
    }

    pub fn with_preferred_block_size(mut self, size: usize) -> Self {
        self.preferred_block_size = size.clamp(16, 1024).next_power_of_two();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_mode_names() {
        assert_eq!(
            DeduplicatorMode::from_name("MarkAndSweep"),
            Some(DeduplicatorMode::MarkAndSweep)
        );
        assert_eq!(
            DeduplicatorMode::from_name("CropRotation"),
            Some(DeduplicatorMode::CropRotation)
        );
        // legacy truncated spelling still resolves
        assert_eq!(
            DeduplicatorMode::from_name("DEDUPLICATOR_CROP_ROTATIO"),
            Some(DeduplicatorMode::CropRotation)
        );
        assert_eq!(DeduplicatorMode::from_name("Noop"), Some(DeduplicatorMode::Noop));
        assert_eq!(DeduplicatorMode::from_name("bogus"), None);
    }

    #[test]
    fn test_defaults_follow_rfc() {
        let config = Config::default();
        assert_eq!(config.ack_timeout, Duration::from_secs(2));
        assert_eq!(config.max_retransmit, 4);
        assert!((config.ack_random_factor - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.exchange_lifetime, Duration::from_secs(247));
    }

    #[test]
    fn test_block_size_clamped() {
        assert_eq!(Config::default().with_preferred_block_size(100).preferred_block_size, 128);
        assert_eq!(Config::default().with_preferred_block_size(4096).preferred_block_size, 1024);
    }
}
