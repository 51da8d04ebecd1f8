//! Channel identities, packets and time helpers.
//!
//! A [`Packet`] is one timestamped, fixed-rate chunk of samples for one
//! [`ChannelId`]. Times are integer microseconds since the Unix epoch (UTC) so that
//! packet boundaries compare exactly; sample times are derived by rounding
//! `i * 1e6 / rate` to the nearest microsecond.
//!
//! Packets are generic over the sample element type through the [`Sample`] trait,
//! so one buffer type serves integer counts from digitizers and floating-point
//! data from processing stages alike.

use crate::error::{AppResult, CacheError};
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Microseconds per second.
pub const MICROSECONDS_PER_SECOND: f64 = 1_000_000.0;

/// Location code used when a station reports an empty one.
pub const EMPTY_LOCATION_CODE: &str = "--";

/// Converts epochal seconds to microseconds, rounding to the nearest microsecond.
pub fn seconds_to_microseconds(seconds: f64) -> i64 {
    (seconds * MICROSECONDS_PER_SECOND).round() as i64
}

/// Converts microseconds to epochal seconds.
pub fn microseconds_to_seconds(microseconds: i64) -> f64 {
    microseconds as f64 / MICROSECONDS_PER_SECOND
}

/// Sampling period in (possibly fractional) microseconds.
pub fn sampling_period_microseconds(sampling_rate: f64) -> f64 {
    MICROSECONDS_PER_SECOND / sampling_rate
}

/// Offset of the `index`th sample from the first one, in whole microseconds.
pub fn sample_offset(index: usize, sampling_rate: f64) -> i64 {
    (index as f64 * MICROSECONDS_PER_SECOND / sampling_rate).round() as i64
}

/// Formats a microsecond timestamp as RFC 3339, falling back to the raw count.
pub fn format_timestamp(microseconds: i64) -> String {
    match Utc.timestamp_micros(microseconds).single() {
        Some(time) => time.to_rfc3339(),
        None => format!("{microseconds}us"),
    }
}

/// Converts a UTC date-time to microseconds since the epoch.
pub fn datetime_to_microseconds(time: &DateTime<Utc>) -> i64 {
    time.timestamp_micros()
}

/// Unique identity of one sensor data stream.
///
/// Codes are trimmed, stripped of interior blanks and upper-cased on construction.
/// The display form is `NET.STA.CHA.LOC`, e.g. `UU.FORK.HHZ.01`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId {
    network: String,
    station: String,
    channel: String,
    location: String,
}

fn normalize_code(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

impl ChannelId {
    /// Builds a channel identity, rejecting empty network/station/channel codes.
    pub fn new(network: &str, station: &str, channel: &str, location: &str) -> AppResult<Self> {
        let network = normalize_code(network);
        let station = normalize_code(station);
        let channel = normalize_code(channel);
        let mut location = normalize_code(location);
        if network.is_empty() {
            return Err(CacheError::InvalidPacket("network code is empty".into()));
        }
        if station.is_empty() {
            return Err(CacheError::InvalidPacket("station code is empty".into()));
        }
        if channel.is_empty() {
            return Err(CacheError::InvalidPacket("channel code is empty".into()));
        }
        if location.is_empty() {
            location = EMPTY_LOCATION_CODE.to_string();
        }
        Ok(Self {
            network,
            station,
            channel,
            location,
        })
    }

    /// Network code, e.g. `UU`.
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Station code, e.g. `FORK`.
    pub fn station(&self) -> &str {
        &self.station
    }

    /// Channel code, e.g. `HHZ`.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Location code, e.g. `01`.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Same network, station and location with another channel code.
    ///
    /// Handy for addressing the horizontal components of a vertical channel.
    pub fn with_channel(&self, channel: &str) -> AppResult<Self> {
        Self::new(&self.network, &self.station, channel, &self.location)
    }

    /// True when both identities name the same site (network, station, location).
    pub fn same_site(&self, other: &ChannelId) -> bool {
        self.network == other.network
            && self.station == other.station
            && self.location == other.location
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.network, self.station, self.channel, self.location
        )
    }
}

impl FromStr for ChannelId {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [network, station, channel] => Self::new(network, station, channel, ""),
            [network, station, channel, location] => {
                Self::new(network, station, channel, location)
            }
            _ => Err(CacheError::InvalidPacket(format!(
                "'{s}' is not of the form NET.STA.CHA[.LOC]"
            ))),
        }
    }
}

/// Sample element stored in a packet.
pub trait Sample:
    Copy + PartialEq + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Widens the sample for interpolation.
    fn to_f64(self) -> f64;
}

impl Sample for i32 {
    fn to_f64(self) -> f64 {
        f64::from(self)
    }
}

impl Sample for i64 {
    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Sample for f32 {
    fn to_f64(self) -> f64 {
        f64::from(self)
    }
}

impl Sample for f64 {
    fn to_f64(self) -> f64 {
        self
    }
}

/// One timestamped, fixed-rate chunk of samples for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "T: Sample")]
pub struct Packet<T: Sample> {
    channel: ChannelId,
    start_time: i64,
    sampling_rate: f64,
    samples: Vec<T>,
}

impl<T: Sample> Packet<T> {
    /// Builds a packet; see [`Packet::validate`] for the accepted inputs.
    pub fn new(
        channel: ChannelId,
        start_time: i64,
        sampling_rate: f64,
        samples: Vec<T>,
    ) -> AppResult<Self> {
        let packet = Self {
            channel,
            start_time,
            sampling_rate,
            samples,
        };
        packet.validate()?;
        Ok(packet)
    }

    /// Checks the sampling rate is positive and finite, that samples exist and
    /// that the last sample time fits in an `i64`.
    ///
    /// Packets arriving through deserialization bypass [`Packet::new`], so the
    /// cache revalidates on insert.
    pub fn validate(&self) -> AppResult<()> {
        if !self.sampling_rate.is_finite() || self.sampling_rate <= 0.0 {
            return Err(CacheError::InvalidPacket(format!(
                "{}: sampling rate {} must be positive",
                self.channel, self.sampling_rate
            )));
        }
        if self.samples.is_empty() {
            return Err(CacheError::InvalidPacket(format!(
                "{}: packet has no samples",
                self.channel
            )));
        }
        let span = sample_offset(self.samples.len() - 1, self.sampling_rate);
        if self.start_time.checked_add(span).is_none() {
            return Err(CacheError::InvalidPacket(format!(
                "{}: last sample falls past the representable time range",
                self.channel
            )));
        }
        Ok(())
    }

    /// Channel identity.
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Time of the first sample (microseconds since the epoch).
    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    /// Time of the last sample (microseconds since the epoch).
    pub fn end_time(&self) -> i64 {
        let last = self.samples.len().saturating_sub(1);
        self.start_time
            .saturating_add(sample_offset(last, self.sampling_rate))
    }

    /// Sampling rate in Hz.
    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    /// Samples in time order.
    pub fn samples(&self) -> &[T] {
        &self.samples
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when the packet carries no samples (never the case for a valid packet).
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Time of the `index`th sample.
    pub fn sample_time(&self, index: usize) -> i64 {
        self.start_time
            .saturating_add(sample_offset(index, self.sampling_rate))
    }

    /// True when `[start_time, end_time]` intersects `[start, end]`.
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.start_time <= end && self.end_time() >= start
    }

    /// Start time as a UTC date-time, when representable.
    pub fn start_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_micros(self.start_time).single()
    }
}
