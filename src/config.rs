//! Cache Configuration
//!
//! Policy knobs for the orchestrator, loadable from YAML. Durations are
//! written as compact strings (`"30d"`, `"1h30m"`, `"250ms"`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fingerprint::FINGERPRINT_BITS;

/// Default Hamming distance accepted as "the same picture"
pub const DEFAULT_SIMILARITY_THRESHOLD_BITS: u32 = 5;

/// Default lifetime of a durable record (30 days)
pub const DEFAULT_DURABLE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Default lifetime of a volatile copy (1 hour)
pub const DEFAULT_VOLATILE_TTL: Duration = Duration::from_secs(60 * 60);

/// Longest accepted record or volatile lifetime (10 years)
pub const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Default bound on a single compute call
pub const DEFAULT_COMPUTE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bound on a single tier round-trip
pub const DEFAULT_TIER_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of LSH bands in the similarity index
pub const DEFAULT_SIMILARITY_BANDS: u32 = 8;

/// Default interval between expiry sweeps (10 minutes)
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Default size at which volatile payloads are compressed
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 512;

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Maximum Hamming distance for a similarity hit (inclusive)
    pub similarity_threshold_bits: u32,

    /// Number of bands the similarity index splits a fingerprint into
    pub similarity_bands: u32,

    /// Lifetime of a durable record
    #[serde(with = "duration_str")]
    pub durable_ttl: Duration,

    /// Lifetime of a volatile copy
    #[serde(with = "duration_str")]
    pub volatile_ttl: Duration,

    /// Bound on one compute call
    #[serde(with = "duration_str")]
    pub compute_timeout: Duration,

    /// Bound on one tier round-trip
    #[serde(with = "duration_str")]
    pub tier_timeout: Duration,

    /// Use the volatile tier at all
    pub enable_volatile_tier: bool,

    /// How often the sweeper removes tombstoned records
    #[serde(with = "duration_str")]
    pub sweep_interval: Duration,

    /// Volatile payloads at or above this size are LZ4-compressed
    pub compression_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            similarity_threshold_bits: DEFAULT_SIMILARITY_THRESHOLD_BITS,
            similarity_bands: DEFAULT_SIMILARITY_BANDS,
            durable_ttl: DEFAULT_DURABLE_TTL,
            volatile_ttl: DEFAULT_VOLATILE_TTL,
            compute_timeout: DEFAULT_COMPUTE_TIMEOUT,
            tier_timeout: DEFAULT_TIER_TIMEOUT,
            enable_volatile_tier: true,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}

impl CacheConfig {
    /// Parse a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    /// Reject settings the orchestrator cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.similarity_threshold_bits > FINGERPRINT_BITS {
            return Err(Error::Config(format!(
                "similarityThresholdBits must be <= {}, got {}",
                FINGERPRINT_BITS, self.similarity_threshold_bits
            )));
        }
        if self.similarity_bands == 0 || self.similarity_bands > FINGERPRINT_BITS {
            return Err(Error::Config(format!(
                "similarityBands must be in 1..={}, got {}",
                FINGERPRINT_BITS, self.similarity_bands
            )));
        }
        for (name, value) in [
            ("durableTtl", self.durable_ttl),
            ("volatileTtl", self.volatile_ttl),
            ("computeTimeout", self.compute_timeout),
            ("tierTimeout", self.tier_timeout),
            ("sweepInterval", self.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be greater than 0", name)));
            }
        }
        for (name, value) in [
            ("durableTtl", self.durable_ttl),
            ("volatileTtl", self.volatile_ttl),
        ] {
            if value > MAX_TTL {
                return Err(Error::Config(format!(
                    "{} must be at most {}, got {}",
                    name,
                    format_duration(MAX_TTL),
                    format_duration(value)
                )));
            }
        }
        Ok(())
    }

    /// Whether the similarity index can answer this threshold from band buckets alone
    pub fn banding_is_exhaustive(&self) -> bool {
        self.similarity_threshold_bits < self.similarity_bands
    }
}

/// Parse a compact duration such as `"30d"`, `"1h30m"`, `"90s"` or `"250ms"`.
///
/// A trailing bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let multiplier = match c.to_ascii_lowercase() {
            'd' => 86_400_000,
            'h' => 3_600_000,
            'm' if chars.peek().map(|n| n.eq_ignore_ascii_case(&'s')) == Some(true) => {
                chars.next();
                1
            }
            'm' => 60_000,
            's' => 1_000,
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };

        total_ms = total_ms.saturating_add(num.saturating_mul(multiplier));
    }

    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_ms = total_ms.saturating_add(num.saturating_mul(1_000));
    }

    if total_ms == 0 {
        return Err(Error::DurationParse(
            "duration must be greater than 0".to_string(),
        ));
    }

    Ok(Duration::from_millis(total_ms))
}

/// Render a duration in the largest unit that divides it exactly.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis() as u64;
    for (unit, size) in [("d", 86_400_000), ("h", 3_600_000), ("m", 60_000), ("s", 1_000)] {
        if ms >= size && ms % size == 0 {
            return format!("{}{}", ms / size, unit);
        }
    }
    format!("{}ms", ms)
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults_match_policy() {
        let config = CacheConfig::default();
        assert_eq!(config.similarity_threshold_bits, 5);
        assert_eq!(config.durable_ttl, Duration::from_secs(30 * 86_400));
        assert_eq!(config.volatile_ttl, Duration::from_secs(3_600));
        assert!(config.enable_volatile_tier);
        assert!(config.validate().is_ok());
        assert!(config.banding_is_exhaustive());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("30d").unwrap(), Duration::from_secs(2_592_000));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1H").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_duration_combined() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1d12h").unwrap(), Duration::from_secs(129_600));
        assert_eq!(parse_duration("1s500ms").unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert_matches!(parse_duration(""), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("0s"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("5w"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("h"), Err(Error::DurationParse(_)));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30 * 86_400)), "30d");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
similarityThresholdBits: 3
durableTtl: 7d
volatileTtl: 10m
computeTimeout: 20s
enableVolatileTier: false
"#;
        let config = CacheConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.similarity_threshold_bits, 3);
        assert_eq!(config.durable_ttl, Duration::from_secs(7 * 86_400));
        assert_eq!(config.volatile_ttl, Duration::from_secs(600));
        assert_eq!(config.compute_timeout, Duration::from_secs(20));
        assert!(!config.enable_volatile_tier);
        // untouched fields keep their defaults
        assert_eq!(config.tier_timeout, DEFAULT_TIER_TIMEOUT);
    }

    #[test]
    fn test_yaml_round_trip_through_serializer() {
        let config = CacheConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("durableTtl: 30d"));
        assert_eq!(CacheConfig::from_yaml(&yaml).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = CacheConfig {
            similarity_threshold_bits: 65,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let config = CacheConfig {
            similarity_bands: 0,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let config = CacheConfig {
            compute_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("computeTimeout"));
    }

    #[test]
    fn test_validate_caps_lifetimes() {
        let err = CacheConfig::from_yaml("durableTtl: 100000000d").unwrap_err();
        assert_matches!(err, Error::Config(msg) if msg.contains("durableTtl"));

        let err = CacheConfig::from_yaml("volatileTtl: 4000d").unwrap_err();
        assert_matches!(err, Error::Config(msg) if msg.contains("volatileTtl"));

        let config = CacheConfig {
            durable_ttl: MAX_TTL,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_duration_in_yaml() {
        let err = CacheConfig::from_yaml("durableTtl: forever").unwrap_err();
        assert_matches!(err, Error::Config(_));
    }
}
