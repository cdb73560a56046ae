//! Peerdrop configuration.
//!
//! Tracker, transfer, liveness and assignment settings, with defaults,
//! `PEERDROP_*` environment overrides and a fast profile for tests.

use std::net::SocketAddr;
use std::time::Duration;

/// Central configuration for all Peerdrop components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct PeerdropConfig {
    pub tracker: TrackerConfig,
    pub transfer: TransferConfig,
    pub liveness: LivenessConfig,
    pub assignment: AssignmentConfig,
}

/// Tracker-side registry and sweep configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Address the tracker HTTP server binds to
    pub bind_address: SocketAddr,
    /// Peers silent for longer than this are evicted
    pub eviction_timeout: Duration,
    /// Period of the eviction sweep
    pub sweep_interval: Duration,
    /// Busy peers not released within this window are forced back to idle
    pub busy_timeout: Duration,
    /// HTTP request timeout for peers talking to the tracker
    pub request_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 1108)),
            eviction_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(300), // 5 minutes
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Piece transfer and download scheduling configuration.
///
/// Controls piece sizing, the concurrent fetch window, per-piece retry
/// budget and the timeouts applied to every data-plane operation.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Piece size used when describing newly shared files
    pub piece_size: u32,
    /// Maximum concurrent piece fetches per download job
    pub fetch_concurrency: usize,
    /// Failure rounds a single piece may accumulate before the job fails
    pub max_retries: u32,
    /// Timeout covering one complete piece fetch
    pub piece_timeout: Duration,
    /// Timeout for establishing a peer connection
    pub connect_timeout: Duration,
    /// First retry delay, doubled on every further failure round
    pub retry_base_delay: Duration,
    /// Cap for the retry delay
    pub retry_max_delay: Duration,
    /// Suffix for partially written downloads
    pub temp_file_suffix: &'static str,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            piece_size: 1_048_576, // 1 MiB
            fetch_concurrency: 4,
            max_retries: 3,
            piece_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(10),
            temp_file_suffix: ".part",
        }
    }
}

/// Peer-side heartbeat configuration.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Interval between heartbeats sent to the tracker
    pub heartbeat_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Client-side polling policy for file-to-peer assignment.
#[derive(Debug, Clone)]
pub struct AssignmentConfig {
    /// Attempts before reporting `NotEnoughPeers`
    pub max_attempts: u32,
    /// Delay between attempts
    pub retry_delay: Duration,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl PeerdropConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(address) = env_parse::<SocketAddr>("PEERDROP_TRACKER_BIND") {
            config.tracker.bind_address = address;
        }

        if let Some(seconds) = env_parse::<u64>("PEERDROP_EVICTION_TIMEOUT") {
            config.tracker.eviction_timeout = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_parse::<u64>("PEERDROP_SWEEP_INTERVAL") {
            config.tracker.sweep_interval = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_parse::<u64>("PEERDROP_HEARTBEAT_INTERVAL") {
            config.liveness.heartbeat_interval = Duration::from_secs(seconds);
        }

        if let Some(piece_size) = env_parse::<u32>("PEERDROP_PIECE_SIZE")
            && piece_size > 0
        {
            config.transfer.piece_size = piece_size;
        }

        if let Some(concurrency) = env_parse::<usize>("PEERDROP_FETCH_CONCURRENCY")
            && concurrency > 0
        {
            config.transfer.fetch_concurrency = concurrency;
        }

        if let Some(retries) = env_parse::<u32>("PEERDROP_MAX_RETRIES") {
            config.transfer.max_retries = retries;
        }

        config
    }

    /// Creates a configuration with short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            tracker: TrackerConfig {
                bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
                eviction_timeout: Duration::from_secs(2),
                sweep_interval: Duration::from_millis(500),
                busy_timeout: Duration::from_secs(30),
                request_timeout: Duration::from_secs(5),
            },
            transfer: TransferConfig {
                piece_size: 1024,
                fetch_concurrency: 2,
                max_retries: 2,
                piece_timeout: Duration::from_secs(5),
                connect_timeout: Duration::from_secs(2),
                retry_base_delay: Duration::from_millis(10),
                retry_max_delay: Duration::from_millis(50),
                temp_file_suffix: ".part",
            },
            liveness: LivenessConfig {
                heartbeat_interval: Duration::from_millis(200),
            },
            assignment: AssignmentConfig {
                max_attempts: 1,
                retry_delay: Duration::from_millis(50),
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = PeerdropConfig::default();

        assert_eq!(config.tracker.eviction_timeout, Duration::from_secs(60));
        assert_eq!(config.tracker.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.liveness.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.transfer.fetch_concurrency, 4);
        assert_eq!(config.transfer.piece_timeout, Duration::from_secs(30));
        assert_eq!(config.assignment.max_attempts, 5);
    }

    #[test]
    fn test_heartbeat_outpaces_eviction() {
        for config in [PeerdropConfig::default(), PeerdropConfig::for_testing()] {
            assert!(config.liveness.heartbeat_interval < config.tracker.eviction_timeout);
            assert!(config.tracker.sweep_interval < config.tracker.eviction_timeout);
        }
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("PEERDROP_EVICTION_TIMEOUT", "90");
            std::env::set_var("PEERDROP_FETCH_CONCURRENCY", "8");
            std::env::set_var("PEERDROP_PIECE_SIZE", "0");
            std::env::set_var("PEERDROP_TRACKER_BIND", "127.0.0.1:7000");
        }

        let config = PeerdropConfig::from_env();

        assert_eq!(config.tracker.eviction_timeout, Duration::from_secs(90));
        assert_eq!(config.transfer.fetch_concurrency, 8);
        // Zero piece size is ignored
        assert_eq!(config.transfer.piece_size, 1_048_576);
        assert_eq!(
            config.tracker.bind_address,
            "127.0.0.1:7000".parse::<SocketAddr>().unwrap()
        );

        unsafe {
            std::env::remove_var("PEERDROP_EVICTION_TIMEOUT");
            std::env::remove_var("PEERDROP_FETCH_CONCURRENCY");
            std::env::remove_var("PEERDROP_PIECE_SIZE");
            std::env::remove_var("PEERDROP_TRACKER_BIND");
        }
    }
}
