//! Utility functions for shardalloc

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

/// Parse a byte size string (e.g., "512", "500mb", "2gb", "1.5tb")
pub fn parse_bytes(s: &str) -> crate::Result<u64> {
    let lower = s.trim().to_ascii_lowercase();
    if lower.is_empty() {
        return Err(crate::Error::InvalidConfig("empty byte size".into()));
    }

    let split = lower
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(lower.len());
    let (num_str, unit) = lower.split_at(split);

    let num: f64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid byte size: {}", s)))?;

    let multiplier: u64 = match unit.trim() {
        "" | "b" => 1,
        "kb" | "k" => 1 << 10,
        "mb" | "m" => 1 << 20,
        "gb" | "g" => 1 << 30,
        "tb" | "t" => 1 << 40,
        "pb" | "p" => 1 << 50,
        other => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown byte unit: {}",
                other
            )))
        }
    };

    Ok((num * multiplier as f64) as u64)
}
