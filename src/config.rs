//! Configuration loading using Figment
//!
//! Configuration is loaded from:
//! 1. `config/packet_cache.toml` (or an explicit path)
//! 2. Environment variables prefixed with `PACKET_CACHE_`, with `__` separating
//!    nested keys, e.g. `PACKET_CACHE_CACHE__MAX_TOTAL_PACKETS=50000`
//!
//! Every field has a default, so an empty or missing file yields a usable
//! configuration.
//!
//! # Example
//! ```no_run
//! use packet_cache::config::CacheConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CacheConfig::load()?;
//! config.validate()?;
//! println!("Per-channel capacity: {}", config.cache.max_packets_per_channel);
//! # Ok(())
//! # }
//! ```

use crate::codec::MessageFormat;
use crate::collection::CollectionSettings;
use crate::error::{AppResult, CacheError};
use crate::interpolate::DEFAULT_MAX_POINTS;
use crate::packet::ChannelId;
use crate::pattern::Blacklist;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/packet_cache.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "PACKET_CACHE_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Capacity and ingestion settings
    pub cache: CacheSection,
    /// Waveform reconstruction settings
    pub interpolation: InterpolationSection,
    /// Client-side request settings
    pub requestor: RequestorSection,
    /// Logging settings
    pub logging: LoggingSection,
}

/// Capacity and ingestion configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Packets retained per channel
    pub max_packets_per_channel: usize,
    /// Packets retained across all channels
    pub max_total_packets: usize,
    /// Channel-code glob patterns to discard, matched case-insensitively (e.g. "LH*")
    pub blacklist: Vec<String>,
    /// Capacity of the bounded packet ingestion queue
    pub ingest_queue_capacity: usize,
    /// Capacity of the bounded request queue
    pub request_queue_capacity: usize,
    /// Threads answering queries
    pub query_workers: usize,
}

/// Interpolation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpolationSection {
    /// Holes in coverage up to this long are interpolated across
    #[serde(with = "humantime_serde")]
    pub gap_tolerance: Duration,
    /// Output rate when a request does not name one; unset means the packets' own rate
    pub default_sampling_rate: Option<f64>,
    /// Output rate per channel (`NET.STA.CHA.LOC`), taking precedence over the default
    pub channel_sampling_rates: BTreeMap<String, f64>,
    /// Most output samples a single query may ask for
    pub max_query_samples: usize,
}

/// Requestor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestorSection {
    /// How long a request waits for its response
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Envelope encoding
    pub format: MessageFormat,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (pretty, compact, json)
    pub format: String,
}

// Default value functions
fn default_max_packets_per_channel() -> usize {
    300
}

fn default_max_total_packets() -> usize {
    1_000_000
}

fn default_ingest_queue_capacity() -> usize {
    8192
}

fn default_request_queue_capacity() -> usize {
    1024
}

fn default_query_workers() -> usize {
    4
}

fn default_gap_tolerance() -> Duration {
    Duration::from_millis(50)
}

fn default_max_query_samples() -> usize {
    DEFAULT_MAX_POINTS
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_packets_per_channel: default_max_packets_per_channel(),
            max_total_packets: default_max_total_packets(),
            blacklist: Vec::new(),
            ingest_queue_capacity: default_ingest_queue_capacity(),
            request_queue_capacity: default_request_queue_capacity(),
            query_workers: default_query_workers(),
        }
    }
}

impl Default for InterpolationSection {
    fn default() -> Self {
        Self {
            gap_tolerance: default_gap_tolerance(),
            default_sampling_rate: None,
            channel_sampling_rates: BTreeMap::new(),
            max_query_samples: default_max_query_samples(),
        }
    }
}

impl Default for RequestorSection {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            format: MessageFormat::default(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from `config/packet_cache.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `PACKET_CACHE_`.
    /// Example: `PACKET_CACHE_LOGGING__LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(CacheError::from)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }

        let cache = &self.cache;
        for (name, value) in [
            ("max_packets_per_channel", cache.max_packets_per_channel),
            ("max_total_packets", cache.max_total_packets),
            ("ingest_queue_capacity", cache.ingest_queue_capacity),
            ("request_queue_capacity", cache.request_queue_capacity),
            ("query_workers", cache.query_workers),
            ("max_query_samples", self.interpolation.max_query_samples),
        ] {
            if value == 0 {
                return Err(format!("Invalid {name} 0. Must be at least 1"));
            }
        }

        Blacklist::new(&cache.blacklist).map_err(|e| e.to_string())?;

        if let Some(rate) = self.interpolation.default_sampling_rate {
            check_rate("default_sampling_rate", rate)?;
        }
        for (channel, &rate) in &self.interpolation.channel_sampling_rates {
            channel
                .parse::<ChannelId>()
                .map_err(|e| format!("Invalid channel in channel_sampling_rates: {e}"))?;
            check_rate(channel, rate)?;
        }

        if self.requestor.timeout.is_zero() {
            return Err("Invalid requestor timeout 0. Must be positive".to_string());
        }

        Ok(())
    }

    /// Collection limits derived from the `[cache]` section.
    ///
    /// Fails when a blacklist entry is not a valid glob pattern.
    pub fn collection_settings(&self) -> AppResult<CollectionSettings> {
        let blacklist = Blacklist::new(&self.cache.blacklist)?;
        Ok(CollectionSettings::new(
            self.cache.max_packets_per_channel,
            self.cache.max_total_packets,
        )
        .with_blacklist(blacklist))
    }

    /// Configured output rate for a channel, if any.
    ///
    /// A per-channel entry wins over the default rate.
    pub fn sampling_rate_for(&self, channel: &ChannelId) -> Option<f64> {
        let key = channel.to_string();
        self.interpolation
            .channel_sampling_rates
            .iter()
            .find(|(configured, _)| configured.eq_ignore_ascii_case(&key))
            .map(|(_, &rate)| rate)
            .or(self.interpolation.default_sampling_rate)
    }
}

fn check_rate(name: &str, rate: f64) -> Result<(), String> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(format!(
            "Invalid sampling rate {rate} for {name}. Must be positive"
        ));
    }
    Ok(())
}
