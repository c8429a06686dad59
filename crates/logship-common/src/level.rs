//! Severity levels for event channels and trace providers

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Severity threshold attached to a channel or provider.
///
/// The order is total: `Critical < Error < Warning < Information < Verbose`.
/// A selector configured at level `L` accepts every event whose severity is
/// less than or equal to `L`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Information,
    Verbose,
}

/// String names accepted in the configuration file, matched case-insensitively.
const LEVEL_NAMES: [(&str, LogLevel); 5] = [
    ("Critical", LogLevel::Critical),
    ("Error", LogLevel::Error),
    ("Warning", LogLevel::Warning),
    ("Information", LogLevel::Information),
    ("Verbose", LogLevel::Verbose),
];

impl LogLevel {
    /// Numeric value used on the wire and in selector expressions (1..=5).
    pub fn as_number(self) -> u8 {
        match self {
            LogLevel::Critical => 1,
            LogLevel::Error => 2,
            LogLevel::Warning => 3,
            LogLevel::Information => 4,
            LogLevel::Verbose => 5,
        }
    }

    /// Inverse of [`LogLevel::as_number`]; out-of-range values are clamped to
    /// `Verbose`, which is how unknown severities stay visible.
    pub fn from_number(n: u8) -> LogLevel {
        match n {
            0 | 1 => LogLevel::Critical,
            2 => LogLevel::Error,
            3 => LogLevel::Warning,
            4 => LogLevel::Information,
            _ => LogLevel::Verbose,
        }
    }

    /// Whether an event of severity `event_level` passes a selector set to
    /// `self`.
    pub fn accepts(self, event_level: LogLevel) -> bool {
        event_level <= self
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Critical => "Critical",
            LogLevel::Error => "Error",
            LogLevel::Warning => "Warning",
            LogLevel::Information => "Information",
            LogLevel::Verbose => "Verbose",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        for (name, level) in LEVEL_NAMES {
            if s.eq_ignore_ascii_case(name) {
                return Ok(level);
            }
        }
        Err(ConfigError::Invalid(format!("unknown log level '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_total() {
        assert!(LogLevel::Critical < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Information);
        assert!(LogLevel::Information < LogLevel::Verbose);
    }

    #[test]
    fn accepts_at_or_below_threshold() {
        assert!(LogLevel::Warning.accepts(LogLevel::Critical));
        assert!(LogLevel::Warning.accepts(LogLevel::Warning));
        assert!(!LogLevel::Warning.accepts(LogLevel::Information));
        assert!(LogLevel::Verbose.accepts(LogLevel::Verbose));
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("error".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert_eq!("VERBOSE".parse::<LogLevel>().unwrap(), LogLevel::Verbose);
        assert_eq!("Information".parse::<LogLevel>().unwrap(), LogLevel::Information);
        assert!("debug".parse::<LogLevel>().is_err());
    }

    #[test]
    fn numbers_round_trip() {
        for level in [
            LogLevel::Critical,
            LogLevel::Error,
            LogLevel::Warning,
            LogLevel::Information,
            LogLevel::Verbose,
        ] {
            assert_eq!(LogLevel::from_number(level.as_number()), level);
        }
    }
}
