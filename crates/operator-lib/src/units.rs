//! Kubernetes quantity and duration helpers
//!
//! CPU quantities are handled in millicores, memory quantities in bytes.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub const KIB: u64 = 1024;
pub const MIB: u64 = KIB * 1024;
pub const GIB: u64 = MIB * 1024;
pub const TIB: u64 = GIB * 1024;

/// Parse a CPU quantity (`500m`, `2`, `1.5`) into millicores
pub fn parse_cpu(quantity: &str) -> Option<u64> {
    let q = quantity.trim();
    if q.is_empty() {
        return None;
    }
    if let Some(milli) = q.strip_suffix('m') {
        return milli.parse::<f64>().ok().filter(|v| *v >= 0.0).map(|v| v.round() as u64);
    }
    q.parse::<f64>()
        .ok()
        .filter(|v| *v >= 0.0)
        .map(|cores| (cores * 1000.0).round() as u64)
}

/// Parse a memory quantity (`512Mi`, `1Gi`, `1G`, `1048576`) into bytes
pub fn parse_memory(quantity: &str) -> Option<u64> {
    const SUFFIXES: &[(&str, u64)] = &[
        ("Ki", KIB),
        ("Mi", MIB),
        ("Gi", GIB),
        ("Ti", TIB),
        ("K", 1000),
        ("M", 1000 * 1000),
        ("G", 1000 * 1000 * 1000),
        ("T", 1000 * 1000 * 1000 * 1000),
    ];

    let q = quantity.trim();
    if q.is_empty() {
        return None;
    }
    for (suffix, multiplier) in SUFFIXES {
        if let Some(number) = q.strip_suffix(suffix) {
            return number
                .parse::<f64>()
                .ok()
                .filter(|v| *v >= 0.0)
                .map(|v| (v * *multiplier as f64).round() as u64);
        }
    }
    q.parse::<f64>().ok().filter(|v| *v >= 0.0).map(|v| v.round() as u64)
}

/// Format millicores as a CPU quantity
pub fn format_cpu(millicores: u64) -> String {
    if millicores >= 1000 && millicores % 1000 == 0 {
        format!("{}", millicores / 1000)
    } else {
        format!("{}m", millicores)
    }
}

/// Format bytes as a memory quantity, using the largest exact binary unit
/// and falling back to whole mebibytes
pub fn format_memory(bytes: u64) -> String {
    if bytes >= GIB && bytes % GIB == 0 {
        format!("{}Gi", bytes / GIB)
    } else if bytes >= MIB {
        format!("{}Mi", (bytes + MIB - 1) / MIB)
    } else if bytes >= KIB {
        format!("{}Ki", (bytes + KIB - 1) / KIB)
    } else {
        format!("{}", bytes)
    }
}

/// Parse a duration such as `45s`, `30m`, `24h` or `7d`
pub fn parse_duration(value: &str) -> Option<Duration> {
    let v = value.trim();
    if v.len() < 2 {
        return None;
    }
    let (number, unit) = v.split_at(v.len() - 1);
    let n: u64 = number.parse().ok()?;
    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86_400,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

/// Format a duration with the largest unit that divides it exactly
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs > 0 && secs % 86_400 == 0 {
        format!("{}d", secs / 86_400)
    } else if secs > 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Serde adapter for durations written as `7d` / `30m` strings
pub mod duration_str {
    use super::*;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration '{}'", raw)))
    }
}
