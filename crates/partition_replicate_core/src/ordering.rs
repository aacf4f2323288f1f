use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Width the S3 sequencer is left-padded to before comparison.
pub const SEQUENCER_WIDTH: usize = 32;

/// Totally ordered position of a change event within its object key.
///
/// S3 version ids are opaque, so "newer" is decided by the event time and,
/// for events sharing a timestamp, by the hexadecimal sequencer S3 attaches
/// to notifications of the same key. The token is a fixed-width string so
/// that byte-wise comparison (including inside a storage condition
/// expression) matches the logical order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderToken(String);

impl OrderToken {
    pub fn new(event_time: DateTime<Utc>, sequencer: Option<&str>) -> Self {
        let sequencer = sequencer
            .map(|value| value.trim().to_ascii_uppercase())
            .unwrap_or_default();
        Self(format!(
            "{}#{sequencer:0>width$}",
            event_time.format("%Y-%m-%dT%H:%M:%S%.6fZ"),
            width = SEQUENCER_WIDTH,
        ))
    }

    /// Rebuilds a token read back from the version table.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OrderToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + seconds, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn later_event_time_orders_after_earlier() {
        let early = OrderToken::new(at(0), Some("FFFFFFFFFFFFFFFF"));
        let late = OrderToken::new(at(1), Some("0001"));
        assert!(early < late);
    }

    #[test]
    fn sequencer_breaks_ties_regardless_of_length() {
        let short = OrderToken::new(at(0), Some("9A"));
        let long = OrderToken::new(at(0), Some("0055B9C3A1D2"));
        assert!(short < long);
    }

    #[test]
    fn sequencer_comparison_ignores_case() {
        let lower = OrderToken::new(at(0), Some("00abc"));
        let upper = OrderToken::new(at(0), Some("00ABC"));
        assert_eq!(lower, upper);
    }

    #[test]
    fn missing_sequencer_sorts_first_within_the_same_instant() {
        let without = OrderToken::new(at(0), None);
        let with = OrderToken::new(at(0), Some("01"));
        assert!(without < with);
        assert_eq!(
            without.as_str(),
            "2025-10-09T08:53:20.000000Z#00000000000000000000000000000000"
        );
    }
}
