//! Runtime configuration.
//!
//! Every field has a default taken from [`crate::constants`]; a partially
//! specified configuration deserializes with the remaining fields defaulted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;

/// Top-level configuration of a DHT node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    pub protocol: ProtocolConfig,
    pub bucket: BucketConfig,
    pub value: ValueConfig,
    pub task: TaskConfig,
    pub broadcast: BroadcastConfig,
    pub send: SendConfig,
    /// Interval of the routing/value refresh tick.
    pub refresh_tick: Duration,
    /// Interval of the task wake-up tick.
    pub wake_tick: Duration,
}

/// Wire-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub magic: u16,
    pub version: u16,
    pub app_id: u32,
    pub mtu: usize,
    /// Decoded ttl values are clamped to this.
    pub max_ttl: u8,
    /// Hop budget of outgoing FIND_PEER requests.
    pub find_peer_ttl: u8,
    /// Hop budget of outgoing FIND_VALUE / UPDATE_VALUE requests.
    pub value_ttl: u8,
}

/// Routing table settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    pub bucket_size: usize,
    pub bucket_count: usize,
    pub peer_timeout: Duration,
    pub ping_interval: Duration,
    pub max_pings_per_tick: usize,
    pub find_self_interval: Duration,
    /// Peers silent for a ping interval whose settled requests were lost
    /// at least this often are dropped early.
    pub max_packet_loss: f32,
}

/// Value table settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValueConfig {
    pub value_timeout: Duration,
    pub republish_interval: Duration,
    pub max_tables: usize,
    pub replicas: usize,
}

/// Task engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub timeout: Duration,
    pub relay_timeout: Duration,
    pub max_idle: Duration,
    pub alpha: usize,
    pub k: usize,
    pub max_closer_hints: usize,
    pub recommend_neighbors: usize,
    pub hole_call_delay: Duration,
    pub handshake_timeout: Duration,
}

/// Broadcast flooding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub timeout: Duration,
    pub flood_limit: usize,
    pub retry_batch: usize,
    pub disclose_count: usize,
}

/// Resend and statistics settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SendConfig {
    pub resend_interval: Duration,
    pub resend_max_tries: u32,
    /// Retries try the alternate transport protocol.
    pub try_alternate: bool,
    pub resend_high_water: usize,
    pub resend_stale: Duration,
    pub piece_timeout: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            bucket: BucketConfig::default(),
            value: ValueConfig::default(),
            task: TaskConfig::default(),
            broadcast: BroadcastConfig::default(),
            send: SendConfig::default(),
            refresh_tick: REFRESH_TICK,
            wake_tick: TASK_WAKE_TICK,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            app_id: DEFAULT_APP_ID,
            mtu: DEFAULT_MTU,
            max_ttl: DEFAULT_MAX_TTL,
            find_peer_ttl: 0,
            value_ttl: 1,
        }
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            bucket_size: BUCKET_SIZE,
            bucket_count: BUCKET_COUNT,
            peer_timeout: PEER_TIMEOUT,
            ping_interval: PING_INTERVAL,
            max_pings_per_tick: MAX_PINGS_PER_TICK,
            find_self_interval: FIND_SELF_INTERVAL,
            max_packet_loss: MAX_PACKET_LOSS,
        }
    }
}

impl Default for ValueConfig {
    fn default() -> Self {
        Self {
            value_timeout: VALUE_TIMEOUT,
            republish_interval: VALUE_REPUBLISH_INTERVAL,
            max_tables: MAX_VALUE_TABLES,
            replicas: SAVE_VALUE_REPLICAS,
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            timeout: TASK_TIMEOUT,
            relay_timeout: RELAY_TASK_TIMEOUT,
            max_idle: TASK_MAX_IDLE,
            alpha: LOOKUP_ALPHA,
            k: LOOKUP_K,
            max_closer_hints: MAX_CLOSER_HINTS,
            recommend_neighbors: RECOMMEND_NEIGHBORS,
            hole_call_delay: HOLE_CALL_DELAY,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            timeout: BROADCAST_TIMEOUT,
            flood_limit: BROADCAST_FLOOD_LIMIT,
            retry_batch: BROADCAST_RETRY_BATCH,
            disclose_count: BROADCAST_DISCLOSE_COUNT,
        }
    }
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            resend_interval: RESEND_INTERVAL,
            resend_max_tries: RESEND_MAX_TRIES,
            try_alternate: false,
            resend_high_water: RESEND_HIGH_WATER,
            resend_stale: RESEND_STALE,
            piece_timeout: PIECE_TIMEOUT,
        }
    }
}

impl DhtConfig {
    /// Configuration tuned for a virtual clock: short timeouts so tests
    /// converge in a few simulated seconds.
    pub fn fast() -> Self {
        let mut config = Self::default();
        config.task.timeout = Duration::from_secs(3);
        config.task.relay_timeout = Duration::from_millis(1500);
        config.task.max_idle = Duration::from_secs(2);
        config.task.hole_call_delay = Duration::from_millis(200);
        config.task.handshake_timeout = Duration::from_secs(3);
        config.broadcast.timeout = Duration::from_secs(5);
        config.send.resend_interval = Duration::from_millis(200);
        config
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.bucket.bucket_size == 0 {
            return Err("bucket size must be at least 1".into());
        }
        if self.bucket.bucket_count == 0 || self.bucket.bucket_count > HASH_BIT_COUNT as usize {
            return Err(format!(
                "bucket count must be within 1..={}",
                HASH_BIT_COUNT
            ));
        }
        if self.protocol.mtu <= HEADER_LENGTH + 64 {
            return Err(format!("mtu {} is too small", self.protocol.mtu));
        }
        if self.protocol.mtu > u16::MAX as usize {
            return Err(format!("mtu {} does not fit the length field", self.protocol.mtu));
        }
        if self.task.alpha == 0 || self.task.k == 0 {
            return Err("lookup alpha and k must be positive".into());
        }
        if self.send.resend_max_tries == 0 {
            return Err("resend max tries must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.bucket.max_packet_loss) {
            return Err("max packet loss must be within 0..=1".into());
        }
        if self.broadcast.flood_limit == 0 {
            return Err("broadcast flood limit must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = DhtConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bucket.bucket_size, 8);
        assert_eq!(config.bucket.bucket_count, 16);
        assert_eq!(config.protocol.mtu, 1450);
        assert!(DhtConfig::fast().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = DhtConfig::default();
        config.bucket.bucket_count = 33;
        assert!(config.validate().is_err());

        let mut config = DhtConfig::default();
        config.protocol.mtu = 40;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_deserialize() {
        let config: DhtConfig =
            serde_json::from_str(r#"{"bucket": {"bucket_size": 4}}"#).unwrap();
        assert_eq!(config.bucket.bucket_size, 4);
        assert_eq!(config.bucket.bucket_count, BUCKET_COUNT);
        assert_eq!(config.protocol.magic, MAGIC);
    }
}
