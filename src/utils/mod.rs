/// Utility functions and helpers
use lazy_static::lazy_static;
use std::time::{Duration, Instant};

lazy_static! {
    static ref CLOCK_BASE: Instant = Instant::now();
}

/// Monotonic microseconds since the first call in this process
pub fn now_us() -> u64 {
    CLOCK_BASE.elapsed().as_micros() as u64
}

/// Elapsed microseconds since `begin_us`, saturating at zero
pub fn elapsed_us(begin_us: u64) -> u64 {
    now_us().saturating_sub(begin_us)
}

/// Integer division rounding up; a zero divisor yields zero
pub fn divide_ceil(dividend: usize, divisor: usize) -> usize {
    if divisor == 0 {
        return 0;
    }
    (dividend + divisor - 1) / divisor
}

/// Extract the shard id from a discovery tag.
///
/// Tags are comma separated `key:value` items; the shard is the value of
/// the `shard` item. Records without one belong to shard 0.
pub fn shard_id_from_tag(tag: &str) -> u32 {
    tag.split(',')
        .filter_map(|item| item.split_once(':'))
        .find(|(key, _)| key.trim() == "shard")
        .and_then(|(_, value)| btoi::btou::<u32>(value.trim().as_bytes()).ok())
        .unwrap_or(0)
}

/// Split `ip:port` into its parts
pub fn parse_ip_port(addr: &str) -> Option<(String, u16)> {
    let (ip, port) = addr.trim().rsplit_once(':')?;
    if ip.is_empty() {
        return None;
    }
    let port = btoi::btou::<u16>(port.as_bytes()).ok()?;
    Some((ip.to_string(), port))
}

/// Format duration for human-readable output
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1000 {
        return format!("{}ms", millis);
    }
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
