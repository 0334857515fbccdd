//! Server-published error map with retry advice.
//!
//! Servers that negotiate the extended-error feature publish a JSON map
//! keyed by hex status code. Each entry names the condition and may carry
//! a retry specification the client is expected to honor.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, ShoalError};

/// The full error map as published by a server.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorMap {
    /// Format version.
    pub version: u16,
    /// Monotonically increasing revision of the map contents.
    pub revision: u16,
    /// Entries keyed by lowercase hex status code, without a 0x prefix.
    #[serde(default)]
    pub errors: HashMap<String, ErrorAttributes>,
}

impl ErrorMap {
    /// Parses an error map from its JSON wire form.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| ShoalError::Protocol(format!("invalid error map: {e}")))
    }

    /// Looks up the attributes for a status code.
    pub fn attributes(&self, status: u16) -> Option<&ErrorAttributes> {
        self.errors.get(&format!("{status:x}"))
    }

    /// Returns the retry strategy the server advises for a status, if any.
    pub fn retry_for(&self, status: u16) -> Option<&RetrySpec> {
        self.attributes(status).and_then(|attrs| attrs.retry.as_ref())
    }
}

/// One error map entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorAttributes {
    /// Short identifier, e.g. `ETMPFAIL`.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub desc: String,
    /// Attribute labels such as `temp` or `item-only`.
    #[serde(default)]
    pub attrs: Vec<String>,
    /// Server retry advice; absent means "do not auto-retry".
    #[serde(default)]
    pub retry: Option<RetrySpec>,
}

impl ErrorAttributes {
    /// Returns `true` if the entry carries the given attribute label.
    pub fn has_attr(&self, attr: &str) -> bool {
        self.attrs.iter().any(|a| a == attr)
    }
}

/// Retry specification attached to an error map entry.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySpec {
    /// Growth strategy for the retry interval.
    pub strategy: RetryStrategy,
    /// Base interval in milliseconds.
    pub interval: u64,
    /// Delay before the first retry, in milliseconds.
    #[serde(default)]
    pub after: u64,
    /// Upper bound on a single delay, in milliseconds.
    #[serde(default)]
    pub ceil: Option<u64>,
    /// Total time budget for retries, in milliseconds.
    #[serde(default, rename = "max-duration")]
    pub max_duration: Option<u64>,
}

impl RetrySpec {
    /// Computes the delay before retry attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let millis = match self.strategy {
            RetryStrategy::None => return Duration::ZERO,
            RetryStrategy::Constant => self.interval,
            RetryStrategy::Linear => self.interval * (attempt as u64 + 1),
            RetryStrategy::Exponential => {
                self.interval.saturating_mul(1u64 << attempt.min(20))
            }
        };

        let millis = match self.ceil {
            Some(ceil) => millis.min(ceil),
            None => millis,
        };

        Duration::from_millis(if attempt == 0 { millis.max(self.after) } else { millis })
    }

    /// Returns the total retry budget, if the server bounded it.
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration.map(Duration::from_millis)
    }
}

/// Growth strategies the server may advise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// Do not retry.
    None,
    /// Fixed interval between attempts.
    Constant,
    /// Interval grows linearly with the attempt count.
    Linear,
    /// Interval doubles with each attempt.
    Exponential,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "version": 1,
        "revision": 4,
        "errors": {
            "1": {"name": "KEY_ENOENT", "desc": "key not found", "attrs": ["item-only"]},
            "86": {
                "name": "ETMPFAIL",
                "desc": "temporary failure",
                "attrs": ["temp", "retry-now"],
                "retry": {"strategy": "exponential", "interval": 2, "after": 1, "ceil": 500, "max-duration": 2000}
            },
            "9": {
                "name": "LOCKED",
                "attrs": ["item-locked"],
                "retry": {"strategy": "constant", "interval": 10}
            }
        }
    }"#;

    #[test]
    fn test_parse_sample_map() {
        let map = ErrorMap::parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(map.version, 1);
        assert_eq!(map.revision, 4);
        assert_eq!(map.errors.len(), 3);
    }

    #[test]
    fn test_attribute_lookup_by_status() {
        let map = ErrorMap::parse(SAMPLE.as_bytes()).unwrap();
        let entry = map.attributes(0x86).unwrap();
        assert_eq!(entry.name, "ETMPFAIL");
        assert!(entry.has_attr("temp"));
        assert!(!entry.has_attr("fetch-config"));
    }

    #[test]
    fn test_missing_status_has_no_entry() {
        let map = ErrorMap::parse(SAMPLE.as_bytes()).unwrap();
        assert!(map.attributes(0x9999).is_none());
        assert!(map.retry_for(0x01).is_none());
    }

    #[test]
    fn test_constant_strategy_delay() {
        let map = ErrorMap::parse(SAMPLE.as_bytes()).unwrap();
        let spec = map.retry_for(0x09).unwrap();
        assert_eq!(spec.delay(0), Duration::from_millis(10));
        assert_eq!(spec.delay(5), Duration::from_millis(10));
    }

    #[test]
    fn test_exponential_strategy_delay_capped() {
        let map = ErrorMap::parse(SAMPLE.as_bytes()).unwrap();
        let spec = map.retry_for(0x86).unwrap();
        assert_eq!(spec.delay(1), Duration::from_millis(4));
        assert_eq!(spec.delay(2), Duration::from_millis(8));
        // 2 * 2^20 would overflow the ceiling; stays at 500.
        assert_eq!(spec.delay(30), Duration::from_millis(500));
    }

    #[test]
    fn test_max_duration() {
        let map = ErrorMap::parse(SAMPLE.as_bytes()).unwrap();
        let spec = map.retry_for(0x86).unwrap();
        assert_eq!(spec.max_duration(), Some(Duration::from_millis(2000)));
    }

    #[test]
    fn test_linear_strategy() {
        let spec = RetrySpec {
            strategy: RetryStrategy::Linear,
            interval: 5,
            after: 0,
            ceil: None,
            max_duration: None,
        };
        assert_eq!(spec.delay(0), Duration::from_millis(5));
        assert_eq!(spec.delay(3), Duration::from_millis(20));
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(ErrorMap::parse(b"not json").is_err());
    }
}
