/// Caller-side deadline for an unanswered outgoing call, in seconds
pub const RING_TIMEOUT_SECS: u64 = 60;

/// Callee-side deadline before a surfaced incoming call is declined, in seconds
pub const AUTO_DECLINE_TIMEOUT_SECS: u64 = 30;

/// Call timer tick interval in milliseconds
pub const TIMER_TICK_MS: u64 = 1000;

/// Default STUN server used when no relay list is configured
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Default number of history entries returned to the UI
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
