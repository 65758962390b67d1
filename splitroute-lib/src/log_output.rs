use humantime::format_duration;
use serde::ser::Serialize;

use std::net::Ipv4Addr;
use std::time::SystemTime;

pub fn serialize<T>(v: &T) -> String
where
    T: ?Sized + Serialize,
{
    match serde_json::to_string(&v) {
        Ok(s) => s,
        Err(e) => format!("serialization error: {e}"),
    }
}

pub fn elapsed(timestamp: &SystemTime) -> String {
    match timestamp.elapsed() {
        Ok(elapsed) => truncate_after_second_space(format_duration(elapsed).to_string().as_str()).to_string(),
        Err(e) => format!("error displaying duration: {e}"),
    }
}

/// Lists IPs for log lines, e.g. `[93.184.216.34, 1.1.1.1]`.
pub fn ips(ips: &[Ipv4Addr]) -> String {
    let joined = ips.iter().map(|ip| ip.to_string()).collect::<Vec<_>>().join(", ");
    format!("[{joined}]")
}

fn truncate_after_second_space(s: &str) -> &str {
    if let Some((index, _)) = s.match_indices(' ').nth(1) {
        &s[..index]
    } else {
        s
    }
}
