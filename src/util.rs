use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the epoch; the timestamp base for frames, files and
/// the playback clock.
pub fn getmsec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn mix(x: f64, a: f64, b: f64) -> f64 {
    (1.0 - x) * a + x * b
}

/// Expand `%daily`-style shorthands and strftime patterns in a file-name
/// template.
pub fn apply_date_to_string(template: &str, timestamp_ms: u64) -> String {
    let expanded = template
        .replace("%monthly", "%Y-%m")
        .replace("%weekly", "%Y-%V")
        .replace("%daily", "%Y-%m-%d")
        .replace("%hourly", "%Y-%m-%d-%H:00")
        .replace("%minutely", "%Y-%m-%d-%H:%M");

    if !expanded.contains('%') {
        return expanded;
    }

    let secs = (timestamp_ms / 1000) as i64;
    let datetime = chrono::DateTime::from_timestamp(secs, 0)
        .unwrap_or_default()
        .naive_local();
    datetime.format(&expanded).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names_pass_through() {
        assert_eq!(apply_date_to_string("track.log", 0), "track.log");
    }

    #[test]
    fn daily_template_expands() {
        let name = apply_date_to_string("log-%daily.txt", 86_400_000);
        assert_eq!(name, "log-1970-01-02.txt");
    }
}
