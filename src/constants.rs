//! Protocol constants and tuning defaults.
//!
//! Wire-level values (magic, version, header layout, command space) are fixed
//! per deployment. Tuning values are only the defaults of [`crate::DhtConfig`].

use std::time::Duration;

// ============================================================================
// Wire format
// ============================================================================

/// Magic number at the start of every datagram ("DH", little-endian).
pub const MAGIC: u16 = 0x4844;

/// Protocol version carried in the header.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default application id; peers with a different id are ignored.
pub const DEFAULT_APP_ID: u32 = 0;

/// Size of the fixed little-endian header.
pub const HEADER_LENGTH: usize = 36;

/// Default path MTU for a single datagram.
pub const DEFAULT_MTU: usize = 1450;

/// Upper bound for the hop budget of forwarded requests.
pub const DEFAULT_MAX_TTL: u8 = 3;

/// Maximum length of a peer id in bytes.
pub const MAX_PEERID_LENGTH: usize = 128;

/// Maximum number of endpoints remembered for a single peer.
pub const MAX_EP_COUNT: usize = 8;

/// Maximum number of pieces a single split package may have.
pub const MAX_PIECE_COUNT: u32 = 256;

/// Service descriptor flag of a peer serving the path.
pub const SERVICE_FLAG_SERVER: u32 = 0x1;

// ============================================================================
// Routing
// ============================================================================

/// Number of bits in a peer hash.
pub const HASH_BIT_COUNT: u32 = 32;

/// Capacity of one sub-bucket.
pub const BUCKET_SIZE: usize = 8;

/// Maximum number of sub-buckets in a routing table.
pub const BUCKET_COUNT: usize = 16;

/// A peer that has not been heard from for this long is dropped.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Idle peers are pinged after this long without traffic.
pub const PING_INTERVAL: Duration = Duration::from_secs(25);

/// Maximum pings sent per refresh tick.
pub const MAX_PINGS_PER_TICK: usize = 8;

/// Share of unacknowledged requests above which a silent peer is dropped
/// before its timeout.
pub const MAX_PACKET_LOSS: f32 = 0.8;

/// Self lookups run at most this often while the root table is sparse.
pub const FIND_SELF_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// Values
// ============================================================================

/// Reserved key that addresses a whole value table.
pub const TOTAL_KEY: &str = "__total__";

/// Stored values expire after this long without being rewritten.
pub const VALUE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Owned values are pushed again to the closest peers at this interval.
pub const VALUE_REPUBLISH_INTERVAL: Duration = Duration::from_secs(60);

/// Maximum number of value tables kept per service.
pub const MAX_VALUE_TABLES: usize = 256;

/// Number of peers a value is written to.
pub const SAVE_VALUE_REPLICAS: usize = 8;

/// Tables considered for hand-off when a peer is first heard from.
pub const MAX_HAND_OFF_TABLES: usize = 8;

// ============================================================================
// Tasks
// ============================================================================

/// Absolute deadline of a user task.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline of a task forwarding a request on behalf of a remote peer.
pub const RELAY_TASK_TIMEOUT: Duration = Duration::from_secs(4);

/// A task with no activity for this long completes with a timeout.
pub const TASK_MAX_IDLE: Duration = Duration::from_secs(5);

/// Number of concurrent requests of a lookup.
pub const LOOKUP_ALPHA: usize = 3;

/// Number of peers tracked by a lookup.
pub const LOOKUP_K: usize = 8;

/// Maximum number of closer-peer hints in a find response.
pub const MAX_CLOSER_HINTS: usize = 8;

/// Random neighbors piggybacked on outgoing requests.
pub const RECOMMEND_NEIGHBORS: usize = 2;

/// Delay before a handshake source asks its agency to hole-call the target.
pub const HOLE_CALL_DELAY: Duration = Duration::from_millis(500);

/// Handshake deadline for all three roles.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Broadcast
// ============================================================================

/// Lifetime of a broadcast task (origin and relays).
pub const BROADCAST_TIMEOUT: Duration = Duration::from_secs(30);

/// Initial number of peers a broadcast sends to before any response.
pub const BROADCAST_FLOOD_LIMIT: usize = 1;

/// Number of in-flight broadcast peers retried per wake-up.
pub const BROADCAST_RETRY_BATCH: usize = 2;

/// Number of arrived peers disclosed to one asker.
pub const BROADCAST_DISCLOSE_COUNT: usize = 16;

// ============================================================================
// Send / resend
// ============================================================================

/// First resend interval; doubles on every retry.
pub const RESEND_INTERVAL: Duration = Duration::from_millis(400);

/// Attempts per resend controller, including the first send.
pub const RESEND_MAX_TRIES: u32 = 5;

/// Registry size above which resend controllers are pruned.
pub const RESEND_HIGH_WATER: usize = 1024;

/// A controller older than this is pruned regardless of state.
pub const RESEND_STALE: Duration = Duration::from_secs(60);

/// Number of recent requests kept for RTT sampling.
pub const RTT_SAMPLE_QUEUE: usize = 256;

/// Number of destinations traced for packet-loss attribution.
pub const MAX_SEND_TRACES: usize = 1024;

/// Requests kept per destination trace.
pub const SEND_TRACE_DEPTH: usize = 16;

/// Incomplete piece buffers are discarded after this long.
pub const PIECE_TIMEOUT: Duration = Duration::from_secs(20);

// ============================================================================
// Ticks
// ============================================================================

/// Routing/value refresh tick.
pub const REFRESH_TICK: Duration = Duration::from_secs(1);

/// Task wake-up tick.
pub const TASK_WAKE_TICK: Duration = Duration::from_millis(200);
