use chrono::{SecondsFormat, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch, used to mint session identifiers.
pub fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// ISO-8601 UTC timestamp with millisecond precision, the normalized form
/// every event and metric record carries.
pub fn iso_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_timestamp_is_utc_with_millis() {
        let ts = iso_timestamp();
        assert!(ts.ends_with('Z'), "{ts}");
        assert_eq!(24, ts.len(), "{ts}");
    }
}
