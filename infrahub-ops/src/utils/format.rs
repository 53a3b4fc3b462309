//! Human-readable formatting helpers.

/// Formats a byte count using binary units, e.g. `1.5 MiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let units = ["KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
    let mut value = bytes as f64 / UNIT as f64;
    let mut idx = 0;
    while value >= UNIT as f64 && idx < units.len() - 1 {
        value /= UNIT as f64;
        idx += 1;
    }
    format!("{:.1} {}", value, units[idx])
}

/// Non-empty, trimmed lines of command output.
pub fn non_empty_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
