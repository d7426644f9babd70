/// Parse a duration string like "30s", "5m", "1h" into seconds.
///
/// Bare numbers are seconds. Unparseable input falls back to 30 seconds.
pub fn parse_duration_secs(s: &str) -> u64 {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().unwrap_or(30)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().map(|m| m * 60).unwrap_or(300)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().map(|h| h * 3600).unwrap_or(3600)
    } else {
        s.parse::<u64>().unwrap_or(30)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_secs_values() {
        assert_eq!(parse_duration_secs("30s"), 30);
        assert_eq!(parse_duration_secs("5m"), 300);
        assert_eq!(parse_duration_secs("2h"), 7200);
        assert_eq!(parse_duration_secs("0s"), 0);
        assert_eq!(parse_duration_secs(" 15 "), 15);
        assert_eq!(parse_duration_secs("invalid"), 30);
        assert_eq!(parse_duration_secs("xm"), 300);
    }
}
