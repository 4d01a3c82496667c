use std::time::Duration;

/// Client identification sent in logs and the demo binary banner
pub const APP_NAME: &str = "chainpost";

/// Maximum number of retries before a pending transaction is failed
pub const MAX_RETRY: u32 = 3;

/// Minimum spacing between two retries of the same transaction
pub const RETRY_SPACING: Duration = Duration::from_secs(30);

/// Failure reason recorded when the retry budget is exhausted
pub const MAX_RETRY_REASON: &str = "max retry count exceeded";

/// Terminal pool entries are kept this long before cleanup removes them
pub const TERMINAL_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Interval of the pool cleanup task
pub const POOL_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Delivered messages become eligible for pruning after this window
pub const PRUNE_WINDOW: Duration = Duration::from_secs(48 * 60 * 60);

/// Tracking records older than this are dropped even if the network never acknowledged the prune
pub const PRUNE_GC_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default interval of the pruning sweep
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Default interval of the sync heartbeat
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default interval of the retry sweep
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Default time to wait for the connection handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Base delay of the reconnect backoff (doubled per attempt)
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Automatic reconnect attempts before giving up
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Capacity of each per-recipient inbound stream
pub const SUBSCRIBER_BUFFER: usize = 64;

/// Number of block heights kept in the consensus view
pub const CONSENSUS_WINDOW: usize = 100;

/// WebSocket close code for a normal closure
pub const NORMAL_CLOSURE_CODE: u16 = 1000;
