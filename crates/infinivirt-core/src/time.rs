use chrono::{DateTime, SecondsFormat, Utc};

/// Current UTC timestamp in ISO 8601 form, second precision.
pub fn utc_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Age of an ISO 8601 timestamp relative to now. None for unparseable input
/// or timestamps in the future.
pub fn age_of(timestamp: &str) -> Option<std::time::Duration> {
    let parsed: DateTime<Utc> = timestamp.parse().ok()?;
    (Utc::now() - parsed).to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utc_now_format() {
        let ts = utc_now();
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), 20);
        assert_eq!(&ts[10..11], "T");
    }

    #[test]
    fn test_age_of() {
        assert!(age_of("2020-01-01T00:00:00Z").unwrap().as_secs() > 0);
        assert!(age_of("not a timestamp").is_none());
        assert!(age_of("2999-01-01T00:00:00Z").is_none());
    }
}
