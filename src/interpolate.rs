//! Gap-tolerant reconstruction of uniformly sampled signals from packets.
//!
//! [`WigginsInterpolator`] merges possibly overlapping, possibly out-of-order packets
//! into a single sample stream and evaluates it on a uniform grid:
//!
//! 1. Samples are merged in time order. When two packets carry a sample at the same
//!    instant, the packet appearing later in the input wins.
//! 2. The grid is `t_i = start + round(i * 1e6 / rate)` for every `t_i < end`. A window
//!    with `start == end` yields a single point. Windows needing more than the
//!    interpolator's point limit are rejected before anything is allocated.
//! 3. A grid point strictly closer than half a sample period to an input sample takes
//!    that sample's value directly.
//! 4. Other points lying between two samples are evaluated with Wiggins' weighted
//!    average slopes: a piecewise cubic Hermite whose node derivatives average the
//!    adjacent secant slopes, each weighted by the inverse of its magnitude. The
//!    result does not overshoot monotone data.
//! 5. A point is a gap (`None`) when it falls inside a hole in packet coverage longer
//!    than the gap tolerance, more than half a period from both edges, or when it
//!    lies outside the sampled span.
//!
//! Reference: Wiggins, R. A. (1976), "Interpolation of digitized curves", BSSA 66(6).

use crate::error::{AppResult, CacheError};
use crate::packet::{sample_offset, sampling_period_microseconds, Packet, Sample};
use std::borrow::Borrow;
use std::time::Duration;

/// Output rate used when none is configured.
pub const DEFAULT_SAMPLING_RATE: f64 = 100.0;

/// Gap tolerance used when none is configured.
pub const DEFAULT_GAP_TOLERANCE: Duration = Duration::from_millis(50);

/// Most grid points a single window may produce: one day at 100 Hz.
pub const DEFAULT_MAX_POINTS: usize = 8_640_000;

/// Relative difference under which two sampling rates are considered equal.
const RATE_TOLERANCE: f64 = 1.0e-6;

/// Floor on slope magnitudes when forming weights.
const SLOPE_EPSILON: f64 = 1.0e-12;

/// True when `actual` matches `expected` to within one part per million.
pub fn rates_match(expected: f64, actual: f64) -> bool {
    ((actual - expected) / expected).abs() <= RATE_TOLERANCE
}

/// Uniform-grid interpolator with explicit gap marking.
#[derive(Debug, Clone, PartialEq)]
pub struct WigginsInterpolator {
    sampling_rate: f64,
    gap_tolerance: Duration,
    max_points: usize,
}

impl Default for WigginsInterpolator {
    fn default() -> Self {
        Self {
            sampling_rate: DEFAULT_SAMPLING_RATE,
            gap_tolerance: DEFAULT_GAP_TOLERANCE,
            max_points: DEFAULT_MAX_POINTS,
        }
    }
}

impl WigginsInterpolator {
    /// Creates an interpolator for the given output rate (Hz) and gap tolerance.
    pub fn new(sampling_rate: f64, gap_tolerance: Duration) -> AppResult<Self> {
        if !sampling_rate.is_finite() || sampling_rate <= 0.0 {
            return Err(CacheError::Configuration(format!(
                "sampling rate {sampling_rate} must be positive"
            )));
        }
        Ok(Self {
            sampling_rate,
            gap_tolerance,
            max_points: DEFAULT_MAX_POINTS,
        })
    }

    /// Caps the number of grid points a single window may produce.
    pub fn with_max_points(mut self, max_points: usize) -> Self {
        self.max_points = max_points;
        self
    }

    /// Output sampling rate in Hz.
    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    /// Largest hole in coverage that is interpolated across.
    pub fn gap_tolerance(&self) -> Duration {
        self.gap_tolerance
    }

    /// Most grid points a single window may produce.
    pub fn max_points(&self) -> usize {
        self.max_points
    }

    fn gap_tolerance_microseconds(&self) -> i64 {
        i64::try_from(self.gap_tolerance.as_micros()).unwrap_or(i64::MAX)
    }

    /// Grid times for the half-open window `[start, end)`.
    ///
    /// Fails with [`CacheError::WindowTooLarge`] when the window holds more than
    /// [`WigginsInterpolator::max_points`] grid points.
    pub fn grid(&self, start: i64, end: i64) -> AppResult<Vec<i64>> {
        if start > end {
            return Err(CacheError::InvalidTimeWindow { start, end });
        }
        if start == end {
            return Ok(vec![start]);
        }
        let too_large = CacheError::WindowTooLarge {
            start,
            end,
            limit: self.max_points,
        };
        let Some(span) = end.checked_sub(start) else {
            return Err(too_large);
        };
        let points = (span as f64 / sampling_period_microseconds(self.sampling_rate)).ceil();
        if points > self.max_points as f64 {
            return Err(too_large);
        }
        let mut times = Vec::with_capacity(points as usize + 1);
        for i in 0.. {
            match start.checked_add(sample_offset(i, self.sampling_rate)) {
                Some(t) if t < end => times.push(t),
                _ => break,
            }
        }
        Ok(times)
    }

    /// Evaluates the packets on the grid of `[start, end)`.
    ///
    /// Returns one entry per grid point; `None` marks a gap. Where packets carry
    /// samples at the same instant, the one later in `packets` wins, so callers
    /// wanting the freshest data pass packets in arrival order.
    pub fn interpolate<T, P>(
        &self,
        packets: &[P],
        start: i64,
        end: i64,
    ) -> AppResult<Vec<Option<f64>>>
    where
        T: Sample,
        P: Borrow<Packet<T>>,
    {
        let grid = self.grid(start, end)?;
        let packets: Vec<&Packet<T>> = packets
            .iter()
            .map(|p| <P as Borrow<Packet<T>>>::borrow(p))
            .collect();
        for packet in &packets {
            if !rates_match(self.sampling_rate, packet.sampling_rate()) {
                return Err(CacheError::IncompatibleSamplingRate {
                    expected: self.sampling_rate,
                    actual: packet.sampling_rate(),
                });
            }
        }
        if packets.is_empty() {
            return Ok(vec![None; grid.len()]);
        }

        let (times, values) = merge_samples(&packets);
        let gaps = coverage_gaps(&packets, self.gap_tolerance_microseconds());
        let slopes = weighted_average_slopes(&times, &values);
        let half_period = sampling_period_microseconds(self.sampling_rate) / 2.0;

        let first = times[0];
        let last = times[times.len() - 1];
        let signal = grid
            .iter()
            .map(|&t| {
                // Index of the first sample at or after t.
                let upper = times.partition_point(|&x| x < t);
                let nearest = [upper.checked_sub(1), Some(upper)]
                    .into_iter()
                    .flatten()
                    .filter(|&i| i < times.len())
                    .min_by_key(|&i| (times[i] - t).abs());
                if let Some(i) = nearest {
                    if (((times[i] - t).abs()) as f64) < half_period {
                        return Some(values[i]);
                    }
                }
                if t < first || t > last || upper == 0 {
                    return None;
                }
                let lower = upper - 1;
                let (t0, t1) = (times[lower], times[upper]);
                if in_gap(&gaps, t0, t1, t, half_period) {
                    return None;
                }
                Some(hermite(
                    (t0 - first) as f64,
                    (t1 - first) as f64,
                    values[lower],
                    values[upper],
                    slopes[lower],
                    slopes[upper],
                    (t - first) as f64,
                ))
            })
            .collect();
        Ok(signal)
    }
}

/// Time-ordered, de-duplicated samples; later packets win on identical timestamps.
fn merge_samples<T: Sample>(packets: &[&Packet<T>]) -> (Vec<i64>, Vec<f64>) {
    let total: usize = packets.iter().map(|p| p.len()).sum();
    let mut samples: Vec<(i64, f64)> = Vec::with_capacity(total);
    for packet in packets {
        samples.extend(
            packet
                .samples()
                .iter()
                .enumerate()
                .map(|(i, &v)| (packet.sample_time(i), v.to_f64())),
        );
    }
    // Stable sort keeps input order among equal times, so the last entry of each run wins.
    samples.sort_by_key(|&(t, _)| t);

    let mut times: Vec<i64> = Vec::with_capacity(samples.len());
    let mut values: Vec<f64> = Vec::with_capacity(samples.len());
    for (t, v) in samples {
        if times.last() == Some(&t) {
            if let Some(last) = values.last_mut() {
                *last = v;
            }
        } else {
            times.push(t);
            values.push(v);
        }
    }
    (times, values)
}

/// Holes between merged packet intervals that exceed the tolerance, as `(end, next_start)`.
fn coverage_gaps<T: Sample>(packets: &[&Packet<T>], tolerance: i64) -> Vec<(i64, i64)> {
    let mut intervals: Vec<(i64, i64)> = packets
        .iter()
        .map(|p| (p.start_time(), p.end_time()))
        .collect();
    intervals.sort_unstable();

    let mut gaps = Vec::new();
    let mut covered_end = intervals[0].1;
    for &(start, end) in &intervals[1..] {
        if start > covered_end && start - covered_end > tolerance {
            gaps.push((covered_end, start));
        }
        covered_end = covered_end.max(end);
    }
    gaps
}

/// True when `t`, bracketed by consecutive samples `t0 < t < t1`, sits inside a gap.
fn in_gap(gaps: &[(i64, i64)], t0: i64, t1: i64, t: i64, half_period: f64) -> bool {
    let index = gaps.partition_point(|&(gap_start, _)| gap_start < t0);
    match gaps.get(index) {
        Some(&(gap_start, gap_end)) if gap_start == t0 && gap_end == t1 => {
            (gap_start as f64 + half_period) < t as f64 && (t as f64) < gap_end as f64 - half_period
        }
        _ => false,
    }
}

/// Node derivatives from Wiggins' weighted average of adjacent secant slopes.
fn weighted_average_slopes(times: &[i64], values: &[f64]) -> Vec<f64> {
    let n = times.len();
    if n < 2 {
        return vec![0.0; n];
    }
    let secants: Vec<f64> = (0..n - 1)
        .map(|i| (values[i + 1] - values[i]) / (times[i + 1] - times[i]) as f64)
        .collect();

    let mut slopes = Vec::with_capacity(n);
    slopes.push(secants[0]);
    for pair in secants.windows(2) {
        let (left, right) = (pair[0], pair[1]);
        let w_left = 1.0 / left.abs().max(SLOPE_EPSILON);
        let w_right = 1.0 / right.abs().max(SLOPE_EPSILON);
        slopes.push((w_left * left + w_right * right) / (w_left + w_right));
    }
    slopes.push(secants[n - 2]);
    slopes
}

/// Cubic Hermite evaluation on `[x0, x1]`.
fn hermite(x0: f64, x1: f64, y0: f64, y1: f64, d0: f64, d1: f64, x: f64) -> f64 {
    let h = x1 - x0;
    let s = (x - x0) / h;
    let s2 = s * s;
    let s3 = s2 * s;
    let h00 = 2.0 * s3 - 3.0 * s2 + 1.0;
    let h10 = s3 - 2.0 * s2 + s;
    let h01 = -2.0 * s3 + 3.0 * s2;
    let h11 = s3 - s2;
    h00 * y0 + h10 * h * d0 + h01 * y1 + h11 * h * d1
}
