//! Uniformly sampled waveforms reconstructed from cached packets.

use crate::error::{AppResult, CacheError};
use crate::interpolate::WigginsInterpolator;
use crate::packet::{sample_offset, ChannelId, Packet, Sample};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::time::Duration;

/// One channel evaluated on a uniform grid; `None` entries are gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleComponentWaveform {
    channel: ChannelId,
    start_time: i64,
    sampling_rate: f64,
    gap_tolerance: Duration,
    samples: Vec<Option<f64>>,
}

impl SingleComponentWaveform {
    /// Wraps already evaluated samples.
    pub fn new(
        channel: ChannelId,
        start_time: i64,
        sampling_rate: f64,
        gap_tolerance: Duration,
        samples: Vec<Option<f64>>,
    ) -> Self {
        Self {
            channel,
            start_time,
            sampling_rate,
            gap_tolerance,
            samples,
        }
    }

    /// Interpolates packets of `channel` onto the grid of `[start, end)`.
    pub fn from_packets<T, P>(
        interpolator: &WigginsInterpolator,
        channel: ChannelId,
        packets: &[P],
        start: i64,
        end: i64,
    ) -> AppResult<Self>
    where
        T: Sample,
        P: Borrow<Packet<T>>,
    {
        let samples = interpolator.interpolate(packets, start, end)?;
        Ok(Self::new(
            channel,
            start,
            interpolator.sampling_rate(),
            interpolator.gap_tolerance(),
            samples,
        ))
    }

    /// Channel the samples belong to.
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Time of the first grid point (microseconds since the epoch).
    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    /// Time of the last grid point.
    pub fn end_time(&self) -> i64 {
        self.sample_time(self.samples.len().saturating_sub(1))
    }

    /// Time of the `index`th grid point.
    pub fn sample_time(&self, index: usize) -> i64 {
        self.start_time
            .saturating_add(sample_offset(index, self.sampling_rate))
    }

    /// Grid rate in Hz.
    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    /// Tolerance used when the samples were evaluated.
    pub fn gap_tolerance(&self) -> Duration {
        self.gap_tolerance
    }

    /// Evaluated samples; `None` marks a gap.
    pub fn samples(&self) -> &[Option<f64>] {
        &self.samples
    }

    /// Number of grid points.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when the grid is empty.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// True when at least one grid point is a gap.
    pub fn has_gaps(&self) -> bool {
        self.samples.iter().any(Option::is_none)
    }

    /// Number of grid points that are gaps.
    pub fn gap_count(&self) -> usize {
        self.samples.iter().filter(|s| s.is_none()).count()
    }

    /// True when every grid point is a gap.
    pub fn is_all_gap(&self) -> bool {
        self.samples.iter().all(Option::is_none)
    }

    /// Per-point flags, `true` where the waveform has a gap.
    pub fn gap_indicator(&self) -> Vec<bool> {
        self.samples.iter().map(Option::is_none).collect()
    }

    /// Samples with gaps replaced by `fill`.
    pub fn values_or(&self, fill: f64) -> Vec<f64> {
        self.samples.iter().map(|s| s.unwrap_or(fill)).collect()
    }

    fn mask(&mut self, gaps: &[bool]) {
        for (sample, &gap) in self.samples.iter_mut().zip(gaps) {
            if gap {
                *sample = None;
            }
        }
    }
}

/// Vertical, north and east components of one station on a shared grid.
///
/// A gap in any component is a gap in all three.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreeComponentWaveform {
    vertical: SingleComponentWaveform,
    north: SingleComponentWaveform,
    east: SingleComponentWaveform,
}

impl ThreeComponentWaveform {
    /// Combines three components, masking gaps across them.
    ///
    /// The components must share network, station and location, carry distinct
    /// channel codes, and be evaluated on the same grid.
    pub fn new(
        vertical: SingleComponentWaveform,
        north: SingleComponentWaveform,
        east: SingleComponentWaveform,
    ) -> AppResult<Self> {
        check_components(vertical.channel(), north.channel(), east.channel())?;
        for other in [&north, &east] {
            if other.start_time != vertical.start_time
                || other.len() != vertical.len()
                || other.sampling_rate != vertical.sampling_rate
            {
                return Err(CacheError::InvalidWaveform(format!(
                    "{} is not aligned with {}",
                    other.channel, vertical.channel
                )));
            }
        }

        let gaps: Vec<bool> = (0..vertical.len())
            .map(|i| {
                vertical.samples[i].is_none()
                    || north.samples[i].is_none()
                    || east.samples[i].is_none()
            })
            .collect();
        let mut waveform = Self {
            vertical,
            north,
            east,
        };
        waveform.vertical.mask(&gaps);
        waveform.north.mask(&gaps);
        waveform.east.mask(&gaps);
        Ok(waveform)
    }

    /// Interpolates each component's packets onto the grid of `[start, end)`.
    pub fn from_packets<T, P>(
        interpolator: &WigginsInterpolator,
        channels: [ChannelId; 3],
        packets: [&[P]; 3],
        start: i64,
        end: i64,
    ) -> AppResult<Self>
    where
        T: Sample,
        P: Borrow<Packet<T>>,
    {
        let [vertical_id, north_id, east_id] = channels;
        check_components(&vertical_id, &north_id, &east_id)?;
        let [vertical, north, east] = packets;
        Self::new(
            SingleComponentWaveform::from_packets(interpolator, vertical_id, vertical, start, end)?,
            SingleComponentWaveform::from_packets(interpolator, north_id, north, start, end)?,
            SingleComponentWaveform::from_packets(interpolator, east_id, east, start, end)?,
        )
    }

    /// Vertical component.
    pub fn vertical(&self) -> &SingleComponentWaveform {
        &self.vertical
    }

    /// North (or first horizontal) component.
    pub fn north(&self) -> &SingleComponentWaveform {
        &self.north
    }

    /// East (or second horizontal) component.
    pub fn east(&self) -> &SingleComponentWaveform {
        &self.east
    }

    /// Shared grid start.
    pub fn start_time(&self) -> i64 {
        self.vertical.start_time()
    }

    /// Shared grid rate.
    pub fn sampling_rate(&self) -> f64 {
        self.vertical.sampling_rate()
    }

    /// Shared grid length.
    pub fn len(&self) -> usize {
        self.vertical.len()
    }

    /// True when the shared grid is empty.
    pub fn is_empty(&self) -> bool {
        self.vertical.is_empty()
    }

    /// True when the shared grid has gaps.
    pub fn has_gaps(&self) -> bool {
        self.vertical.has_gaps()
    }
}

/// Checks that three channels belong to one site and are distinct.
pub fn check_components(
    vertical: &ChannelId,
    north: &ChannelId,
    east: &ChannelId,
) -> AppResult<()> {
    if !vertical.same_site(north) || !vertical.same_site(east) {
        return Err(CacheError::InvalidWaveform(format!(
            "{vertical}, {north} and {east} are not from the same site"
        )));
    }
    if vertical.channel() == north.channel()
        || vertical.channel() == east.channel()
        || north.channel() == east.channel()
    {
        return Err(CacheError::InvalidWaveform(format!(
            "{vertical}, {north} and {east} repeat a channel code"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(channel: &str) -> ChannelId {
        ChannelId::new("UU", "FORK", channel, "01").unwrap()
    }

    fn waveform(channel: &str, samples: Vec<Option<f64>>) -> SingleComponentWaveform {
        SingleComponentWaveform::new(id(channel), 0, 100.0, Duration::from_millis(50), samples)
    }

    #[test]
    fn test_single_component_accessors() {
        let w = waveform("HHZ", vec![Some(1.0), None, Some(3.0)]);
        assert_eq!(w.len(), 3);
        assert_eq!(w.end_time(), 20_000);
        assert!(w.has_gaps());
        assert_eq!(w.gap_count(), 1);
        assert_eq!(w.gap_indicator(), vec![false, true, false]);
        assert_eq!(w.values_or(0.0), vec![1.0, 0.0, 3.0]);
        assert!(!w.is_all_gap());
    }

    #[test]
    fn test_gap_in_one_component_masks_all() {
        let z = waveform("HHZ", vec![Some(1.0), Some(2.0), Some(3.0)]);
        let n = waveform("HHN", vec![Some(1.0), None, Some(3.0)]);
        let e = waveform("HHE", vec![None, Some(2.0), Some(3.0)]);
        let three = ThreeComponentWaveform::new(z, n, e).unwrap();
        for component in [three.vertical(), three.north(), three.east()] {
            assert_eq!(component.gap_indicator(), vec![true, true, false]);
        }
    }

    #[test]
    fn test_components_must_share_site() {
        let z = waveform("HHZ", vec![Some(1.0)]);
        let n = SingleComponentWaveform::new(
            ChannelId::new("UU", "CTU", "HHN", "01").unwrap(),
            0,
            100.0,
            Duration::from_millis(50),
            vec![Some(1.0)],
        );
        let e = waveform("HHE", vec![Some(1.0)]);
        assert!(matches!(
            ThreeComponentWaveform::new(z, n, e),
            Err(CacheError::InvalidWaveform(_))
        ));
    }

    #[test]
    fn test_components_must_be_distinct() {
        assert!(check_components(&id("HHZ"), &id("HHZ"), &id("HHE")).is_err());
        assert!(check_components(&id("HHZ"), &id("HHN"), &id("HHE")).is_ok());
    }

    #[test]
    fn test_components_must_be_aligned() {
        let z = waveform("HHZ", vec![Some(1.0), Some(2.0)]);
        let n = waveform("HHN", vec![Some(1.0)]);
        let e = waveform("HHE", vec![Some(1.0), Some(2.0)]);
        assert!(ThreeComponentWaveform::new(z, n, e).is_err());
    }

    #[test]
    fn test_from_packets_uses_interpolator_grid() {
        let interpolator = WigginsInterpolator::default();
        let packet = Packet::new(id("HHZ"), 0, 100.0, vec![1i32, 2, 3, 4]).unwrap();
        let w =
            SingleComponentWaveform::from_packets(&interpolator, id("HHZ"), &[packet], 0, 40_000)
                .unwrap();
        assert_eq!(w.samples(), &[Some(1.0), Some(2.0), Some(3.0), Some(4.0)]);
        assert_eq!(w.gap_tolerance(), Duration::from_millis(50));
    }
}
