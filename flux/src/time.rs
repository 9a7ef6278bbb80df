use std::time::SystemTime;

/// The unit a wall-clock timestamp can be encoded in, matching the script DSL's
/// `seconds` / `milliseconds` / `microseconds` / `nanoseconds` tokens.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimeUnit {
    Seconds,
    Milliseconds,
    Microseconds,
    Nanoseconds,
}

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Returns the current wall-clock time truncated to the requested unit.
#[inline]
pub fn timestamp_as(unit: TimeUnit) -> u64 {
    let elapsed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised");

    match unit {
        TimeUnit::Seconds => elapsed.as_secs(),
        TimeUnit::Milliseconds => elapsed.as_millis() as u64,
        TimeUnit::Microseconds => elapsed.as_micros() as u64,
        TimeUnit::Nanoseconds => elapsed.as_nanos() as u64,
    }
}
