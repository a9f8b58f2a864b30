use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the wall-clock time in milliseconds since the Unix epoch.
///
/// Timers are keyed on this value. The wall clock can be stepped backwards,
/// which is why [`TimerManager`](crate::time::TimerManager) carries its own
/// rollover detection instead of trusting this value to be monotonic.
pub(crate) fn current_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
