//! Utility functions and helpers
//!
//! Formatting helpers shared by log lines and telemetry output.

/// Format bytes as a human-readable string
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}

/// Format a hash count (e.g. an expected difficulty) as a human-readable string
pub fn format_hashes(hashes: f64) -> String {
    const UNITS: &[&str] = &["h", "Kh", "Mh", "Gh", "Th", "Ph"];
    let mut value = hashes;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Format a millisecond duration for log lines
pub fn format_elapsed(millis: f64) -> String {
    if millis < 1000.0 {
        format!("{:.0} ms", millis)
    } else if millis < 60_000.0 {
        format!("{:.2} s", millis / 1000.0)
    } else {
        format!("{:.1} min", millis / 60_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1_073_741_824), "1.00 GB");
    }

    #[test]
    fn test_format_hashes() {
        assert_eq!(format_hashes(500.0), "500.00 h");
        assert_eq!(format_hashes(1_500_000.0), "1.50 Mh");
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(250.0), "250 ms");
        assert_eq!(format_elapsed(2500.0), "2.50 s");
        assert_eq!(format_elapsed(120_000.0), "2.0 min");
    }
}
