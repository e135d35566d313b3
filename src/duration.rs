//! Duration-typed field input.
//!
//! Duration fields accept either integer seconds or a duration string such as
//! `"90s"`, `"1m"`, `"1h30m"` or `"60"`.

use crate::{AzSecretsError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Raw duration value as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationInput {
    /// Whole seconds
    Seconds(u64),
    /// Seconds carried as a float (JSON numbers like `3600.0`)
    Float(f64),
    /// Duration string
    Text(String),
}

impl DurationInput {
    /// Parses the input, naming `field` in the error.
    pub fn parse(&self, field: &str) -> Result<Duration> {
        match self {
            Self::Seconds(secs) => Ok(Duration::from_secs(*secs)),
            Self::Float(secs) => {
                if !secs.is_finite() || *secs < 0.0 || secs.fract() != 0.0 {
                    return Err(AzSecretsError::invalid(format!(
                        "{}: expected a non-negative whole number of seconds, got {}",
                        field, secs
                    )));
                }
                Ok(Duration::from_secs(*secs as u64))
            }
            Self::Text(text) => parse_duration_str(field, text),
        }
    }
}

impl From<u64> for DurationInput {
    fn from(secs: u64) -> Self {
        Self::Seconds(secs)
    }
}

impl From<&str> for DurationInput {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// Parses a duration string. Bare integers are seconds; the empty string is
/// zero.
pub fn parse_duration_str(field: &str, text: &str) -> Result<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Duration::ZERO);
    }

    if text.bytes().all(|b| b.is_ascii_digit()) {
        return text.parse::<u64>().map(Duration::from_secs).map_err(|e| {
            AzSecretsError::invalid(format!("{}: invalid duration {:?}: {}", field, text, e))
        });
    }

    humantime::parse_duration(text).map_err(|e| {
        AzSecretsError::invalid(format!("{}: invalid duration {:?}: {}", field, text, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_strings() {
        assert_eq!(parse_duration_str("ttl", "1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration_str("ttl", "1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration_str("ttl", "60").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration_str("ttl", "").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_invalid_string() {
        let err = parse_duration_str("root_password_ttl", "soon").unwrap_err();
        assert!(matches!(err, AzSecretsError::InvalidConfiguration(_)));
        assert!(err.to_string().contains("root_password_ttl"));
    }

    #[test]
    fn test_deserialize_variants() {
        let secs: DurationInput = serde_json::from_str("86400").unwrap();
        assert_eq!(secs.parse("ttl").unwrap(), Duration::from_secs(86400));

        let float: DurationInput = serde_json::from_str("3600.0").unwrap();
        assert_eq!(float.parse("ttl").unwrap(), Duration::from_secs(3600));

        let text: DurationInput = serde_json::from_str("\"1h\"").unwrap();
        assert_eq!(text.parse("ttl").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_reject_negative_and_fractional() {
        let negative: DurationInput = serde_json::from_str("-5").unwrap();
        assert!(negative.parse("ttl").is_err());

        let fractional: DurationInput = serde_json::from_str("1.5").unwrap();
        assert!(fractional.parse("ttl").is_err());
    }
}
