use std::time::Duration;

/// Protocol version advertised in the p2p handshake.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Hard cap on a single wire frame, header included.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Pings that may go unanswered before the connection is dropped.
pub const MAX_MISSED_PINGS: u32 = 2;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(300);

/// A deal that makes no phase progress within this window enters recovery.
pub const SWAP_PHASE_TIMEOUT: Duration = Duration::from_secs(60);
pub const SWAP_RECOVERY_INTERVAL: Duration = Duration::from_secs(300);
/// Minimum excess of the taker CLTV delta over the maker CLTV delta.
pub const CLTV_SAFETY_MARGIN: u32 = 24;

/// Reputation score at or below which a node is banned automatically.
pub const BAN_THRESHOLD: i64 = -50;

/// Minimum interval between two alerts on the same subject.
pub const ALERT_COOLDOWN: Duration = Duration::from_secs(60);
