use std::time::Duration;

/// Default TCP port for direct (`https`) endpoints that do not name one.
pub const fn port() -> u16 {
    10933
}

pub const fn max_frame_length() -> usize {
    1024 * 1024
}

/// Upper bound on a single preamble or turn-token line.
pub const fn max_line_length() -> usize {
    4096
}

/// Deadline applied to an outbound request when the caller does not supply
/// one of its own.
pub const fn request_timeout() -> Duration {
    Duration::from_secs(60)
}

/// How long a subscriber-serving session waits on an empty pending-request
/// queue before ending its turn.
pub const fn polling_queue_wait() -> Duration {
    Duration::from_secs(30)
}

pub const fn pool_capacity_per_endpoint() -> usize {
    5
}

/// Idle connections older than this are destroyed instead of reused.
pub const fn pool_idle_timeout() -> Duration {
    Duration::from_secs(90)
}

pub const fn polling_backoff_initial() -> Duration {
    Duration::from_secs(1)
}

pub const fn polling_backoff_max() -> Duration {
    Duration::from_secs(60)
}
