use chrono::{DateTime, FixedOffset, Utc};

/// Header carrying a frozen "now" to the application under test.
pub const TEST_NOW_HEADER: &str = "x-test-now";

/// Source of the current time handed to both the runner and the application.
///
/// A frozen clock is forwarded with every request so the application can
/// pin its own notion of "now" to the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Clock {
    #[default]
    System,
    Frozen(DateTime<FixedOffset>),
}

impl Clock {
    pub fn frozen(at: DateTime<FixedOffset>) -> Self {
        Clock::Frozen(at)
    }

    /// Parses an RFC 3339 timestamp into a frozen clock.
    pub fn parse(at: &str) -> Result<Self, chrono::ParseError> {
        DateTime::parse_from_rfc3339(at).map(Clock::Frozen)
    }

    pub fn now(&self) -> DateTime<FixedOffset> {
        match self {
            Clock::System => Utc::now().fixed_offset(),
            Clock::Frozen(at) => *at,
        }
    }

    /// The pinned instant, if any. Only frozen clocks are sent over the wire.
    pub fn test_now(&self) -> Option<DateTime<FixedOffset>> {
        match self {
            Clock::System => None,
            Clock::Frozen(at) => Some(*at),
        }
    }
}
