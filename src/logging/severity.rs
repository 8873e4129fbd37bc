// SPDX-License-Identifier: Apache-2.0 OR MIT
// Log severity levels

use serde::{Deserialize, Serialize};

/// Log severity (lower is more severe).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Error conditions (failed router-group join, invariant violation)
    Error = 0,
    /// Warning conditions (timer queue overflow, unroutable event)
    Warning = 1,
    /// Significant normal condition (querier started, upstream change)
    Notice = 2,
    /// Informational (record applied, group expired)
    Info = 3,
    /// Debug-level messages (per-record traces, stale timer drops)
    Debug = 4,
}

impl Severity {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
            Severity::Notice => "NOTICE",
            Severity::Info => "INFO",
            Severity::Debug => "DEBUG",
        }
    }

    /// Create from u8 value (returns None if out of range).
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Severity::Error),
            1 => Some(Severity::Warning),
            2 => Some(Severity::Notice),
            3 => Some(Severity::Info),
            4 => Some(Severity::Debug),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Error < Severity::Warning);
        assert!(Severity::Warning < Severity::Notice);
        assert!(Severity::Notice < Severity::Info);
        assert!(Severity::Info < Severity::Debug);
    }

    #[test]
    fn test_severity_round_trip() {
        for value in 0..=4 {
            let severity = Severity::from_u8(value).unwrap();
            assert_eq!(severity.as_u8(), value);
        }
        assert_eq!(Severity::from_u8(5), None);
    }

    #[test]
    fn test_severity_display() {
        assert_eq!(format!("{}", Severity::Error), "ERROR");
        assert_eq!(format!("{}", Severity::Debug), "DEBUG");
    }
}
