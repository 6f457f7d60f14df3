//! Time formatting helpers.

/// Format a duration in milliseconds to a human-readable string.
pub fn format_duration(millis: u64) -> String {
    let secs = millis / 1000;
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::format_duration;

    #[test]
    fn formats_each_scale() {
        assert_eq!(format_duration(42_000), "42s");
        assert_eq!(format_duration(125_000), "2m 5s");
        assert_eq!(format_duration(3_660_000), "1h 1m");
        assert_eq!(format_duration(90_000_000), "1d 1h");
    }
}
