use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;

use crate::error::TableError;

/// Status words carry one bit per channel in each byte.
pub const MAX_CHANNELS: usize = 8;

pub const SECONDS_PER_DAY: f64 = 86400.0;

/// Status string of a counter row that is valid a priori.
pub const GOOD_STATUS: &str = "GOOD";

/// Bit of `channel` within one byte of the status word.
pub fn channel_bit(channel: usize) -> u8 {
    1 << channel
}

/// Bits of channels `0..n`.
pub fn all_channels(n: usize) -> u8 {
    ((1u16 << n) - 1) as u8
}

// ---------------------------------------------------------------------------
// StatusFlags – the 32-bit rejection word of one sample
// ---------------------------------------------------------------------------

/// Rejection state of one sample.
///
/// ```text
///  bits  0 -  7   gathered: final per-channel decision
///  bits  8 - 15   filtered: unlock/outlier filter
///  bits 16 - 23   transferred: rejected because a critical channel was
///  bits 24 - 31   masked: manual exclusions, survive re-filtering
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusFlags(pub u32);

impl StatusFlags {
    pub const FILTERED_SHIFT: u32 = 8;
    pub const TRANSFERRED_SHIFT: u32 = 16;
    pub const MASKED_SHIFT: u32 = 24;
    pub const MASK_BITS: u32 = 0xFF00_0000;

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn gathered(self) -> u8 {
        self.0 as u8
    }

    pub fn filtered(self) -> u8 {
        (self.0 >> Self::FILTERED_SHIFT) as u8
    }

    pub fn transferred(self) -> u8 {
        (self.0 >> Self::TRANSFERRED_SHIFT) as u8
    }

    pub fn masked(self) -> u8 {
        (self.0 >> Self::MASKED_SHIFT) as u8
    }

    pub fn set_filtered(&mut self, channels: u8) {
        self.0 |= (channels as u32) << Self::FILTERED_SHIFT;
    }

    pub fn set_transferred(&mut self, channels: u8) {
        self.0 |= (channels as u32) << Self::TRANSFERRED_SHIFT;
    }

    /// Manual exclusion; takes effect immediately in the gathered bits.
    pub fn add_mask(&mut self, channels: u8) {
        self.0 |= ((channels as u32) << Self::MASKED_SHIFT) | channels as u32;
    }

    /// Drop everything but the manual mask, which seeds the gathered bits.
    pub fn reset(&mut self) {
        self.0 &= Self::MASK_BITS;
        self.0 |= self.0 >> Self::MASKED_SHIFT;
    }

    /// Rejection of a row the counter itself reported as bad.
    pub fn reject_source(&mut self, channels: u8) {
        self.set_filtered(channels);
        self.set_transferred(channels);
        self.0 |= channels as u32;
    }

    /// Overwrite the gathered bits with masked | transferred | filtered.
    pub fn gather(&mut self) {
        let gathered = self.masked() | self.transferred() | self.filtered();
        self.0 = (self.0 & !0xFF) | gathered as u32;
    }
}

impl fmt::Display for StatusFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08b}|{:08b}|{:08b}|{:08b}",
            self.masked(),
            self.transferred(),
            self.filtered(),
            self.gathered()
        )
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// One parsed row of a counter file, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub timestamp: String,
    pub status: String,
    /// Unix time (s).
    pub time: f64,
    pub values: Vec<f64>,
}

/// One time tick of the counter.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Seconds since the reference midnight.
    pub time: f64,
    /// Baseline-subtracted frequency deviation (Hz) per channel.
    pub channels: Vec<f64>,
    pub flags: StatusFlags,
    /// The counter reported this row as `GOOD`.
    pub source_good: bool,
    /// Filter bits set by the outlier stage alone, for the rejection
    /// breakdown. Not part of the status word.
    pub outlier_only: u8,
}

/// Value and time extent of a channel, for axis scaling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelRange {
    pub y_min: f64,
    pub y_max: f64,
    pub t_min: f64,
    pub t_max: f64,
}

impl Default for ChannelRange {
    fn default() -> Self {
        Self {
            y_min: -1.0,
            y_max: 1.0,
            t_min: 0.0,
            t_max: 1.0,
        }
    }
}

impl ChannelRange {
    fn of(times: &[f64], values: &[f64]) -> Self {
        if times.is_empty() {
            return Self::default();
        }
        let (y_min, y_max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        Self {
            y_min,
            y_max,
            t_min: times[0],
            t_max: times[times.len() - 1],
        }
    }
}

// ---------------------------------------------------------------------------
// Rejection breakdown
// ---------------------------------------------------------------------------

/// Mutually exclusive point classes for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Rejection {
    Good,
    /// Manually masked.
    Masked,
    /// Out of band (or bad counter status), not masked.
    Unlocked,
    /// Only rejected because a critical channel was.
    Transferred,
    /// Only rejected by the outlier stage.
    Outlier,
}

impl Rejection {
    pub const ALL: [Rejection; 5] = [
        Rejection::Good,
        Rejection::Masked,
        Rejection::Unlocked,
        Rejection::Transferred,
        Rejection::Outlier,
    ];

    pub fn of(sample: &Sample, channel: usize) -> Self {
        let bit = channel_bit(channel);
        let flags = sample.flags;
        if flags.masked() & bit != 0 {
            Rejection::Masked
        } else if flags.filtered() & bit != 0 {
            if sample.outlier_only & bit != 0 {
                Rejection::Outlier
            } else {
                Rejection::Unlocked
            }
        } else if flags.transferred() & bit != 0 {
            Rejection::Transferred
        } else {
            Rejection::Good
        }
    }
}

/// Number of samples per [`Rejection`] class for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RejectionCounts {
    pub good: usize,
    pub masked: usize,
    pub unlocked: usize,
    pub transferred: usize,
    pub outlier: usize,
}

// ---------------------------------------------------------------------------
// GoodPoints – rows usable for a set of channels
// ---------------------------------------------------------------------------

/// Rows in which every requested channel is good.
#[derive(Debug, Clone, PartialEq)]
pub struct GoodPoints {
    /// Requested channels as a bit set.
    pub mask: u8,
    pub times: Vec<f64>,
    /// Values of every channel (not only the requested ones) at `times`.
    values: Vec<Vec<f64>>,
}

impl GoodPoints {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn column(&self, channel: usize) -> &[f64] {
        &self.values[channel]
    }

    /// Per-row linear combination `sum(coefficient * channel value)`.
    pub fn combine(&self, terms: &[(usize, f64)]) -> Vec<f64> {
        (0..self.len())
            .map(|row| {
                terms
                    .iter()
                    .map(|&(channel, coefficient)| coefficient * self.values[channel][row])
                    .sum()
            })
            .collect()
    }

    pub fn mean(&self, channel: usize) -> Option<f64> {
        mean(&self.values[channel])
    }

    pub fn range(&self, channel: usize) -> ChannelRange {
        ChannelRange::of(&self.times, &self.values[channel])
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

// ---------------------------------------------------------------------------
// SampleTable – the loaded dataset
// ---------------------------------------------------------------------------

/// All samples of one counter file, in time order.
#[derive(Debug, Clone)]
pub struct SampleTable {
    samples: Vec<Sample>,
    channel_count: usize,
    /// Unix time of the UTC midnight preceding the first sample.
    reference_time: f64,
    sample_interval: f64,
    ranges: Vec<ChannelRange>,
    cache: HashMap<u8, Arc<GoodPoints>>,
}

impl SampleTable {
    /// Normalize times, subtract `baselines` (one per channel) and seed the
    /// status words from the counter status.
    pub fn load(mut rows: Vec<RawRow>, baselines: &[f64]) -> Result<Self, TableError> {
        let channel_count = baselines.len();
        if channel_count == 0 || channel_count > MAX_CHANNELS {
            return Err(TableError::ChannelCount(channel_count));
        }
        if let Some((row, r)) = rows
            .iter()
            .enumerate()
            .find(|(_, r)| r.values.len() != channel_count)
        {
            return Err(TableError::RowWidth {
                row,
                found: r.values.len(),
                expected: channel_count,
            });
        }
        if rows.windows(2).any(|w| w[1].time < w[0].time) {
            warn!("Counter rows are not in time order; sorting");
            rows.sort_by(|a, b| a.time.total_cmp(&b.time));
        }

        let t_min = rows
            .iter()
            .map(|r| r.time)
            .fold(f64::INFINITY, f64::min);
        let reference_time = if t_min.is_finite() {
            (t_min / SECONDS_PER_DAY).floor() * SECONDS_PER_DAY
        } else {
            0.0
        };
        info!(
            "Reference midnight {} (day {} since epoch)",
            reference_time,
            reference_time / SECONDS_PER_DAY
        );

        let everything = all_channels(channel_count);
        let mut bad_rows = 0;
        let samples: Vec<Sample> = rows
            .into_iter()
            .map(|row| {
                let source_good = row.status.trim() == GOOD_STATUS;
                let mut flags = StatusFlags::default();
                if !source_good {
                    flags.reject_source(everything);
                    bad_rows += 1;
                }
                Sample {
                    time: row.time - reference_time,
                    channels: row
                        .values
                        .iter()
                        .zip(baselines)
                        .map(|(v, base)| v - base)
                        .collect(),
                    flags,
                    source_good,
                    outlier_only: 0,
                }
            })
            .collect();
        if bad_rows > 0 {
            debug!("{bad_rows} rows with non-{GOOD_STATUS} counter status");
        }

        let sample_interval = median_step(&samples).unwrap_or(1.0);
        let times: Vec<f64> = samples.iter().map(|s| s.time).collect();
        let ranges = (0..channel_count)
            .map(|ch| {
                let values: Vec<f64> = samples.iter().map(|s| s.channels[ch]).collect();
                ChannelRange::of(&times, &values)
            })
            .collect();
        Ok(SampleTable {
            samples,
            channel_count,
            reference_time,
            sample_interval,
            ranges,
            cache: HashMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn reference_time(&self) -> f64 {
        self.reference_time
    }

    /// Median spacing of consecutive samples (s).
    pub fn sample_interval(&self) -> f64 {
        self.sample_interval
    }

    /// Full extent of every channel at load time.
    pub fn ranges(&self) -> &[ChannelRange] {
        &self.ranges
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Mutable access to the samples. Drops every cached view.
    pub fn samples_mut(&mut self) -> &mut [Sample] {
        self.invalidate();
        &mut self.samples
    }

    pub fn channel_values(&self, channel: usize) -> Vec<f64> {
        self.samples.iter().map(|s| s.channels[channel]).collect()
    }

    pub fn invalidate(&mut self) {
        if !self.cache.is_empty() {
            debug!("Dropping {} cached good-point views", self.cache.len());
            self.cache.clear();
        }
    }

    fn check_channel(&self, channel: usize) -> Result<(), TableError> {
        if channel >= self.channel_count {
            return Err(TableError::NoSuchChannel {
                channel,
                channels: self.channel_count,
            });
        }
        Ok(())
    }

    /// Rows where every channel in `channels` is good. Cached per channel
    /// set until the next flag mutation.
    pub fn good_points(&mut self, channels: &[usize]) -> Result<Arc<GoodPoints>, TableError> {
        let mut mask = 0u8;
        for &ch in channels {
            self.check_channel(ch)?;
            mask |= channel_bit(ch);
        }
        if let Some(points) = self.cache.get(&mask) {
            debug!("Using cached good points for channels {mask:08b}");
            return Ok(Arc::clone(points));
        }

        let selected: Vec<&Sample> = self
            .samples
            .iter()
            .filter(|s| s.flags.gathered() & mask == 0)
            .collect();
        let points = Arc::new(GoodPoints {
            mask,
            times: selected.iter().map(|s| s.time).collect(),
            values: (0..self.channel_count)
                .map(|ch| selected.iter().map(|s| s.channels[ch]).collect())
                .collect(),
        });
        debug!(
            "Cached {} good points for channels {mask:08b}",
            points.len()
        );
        self.cache.insert(mask, Arc::clone(&points));
        Ok(points)
    }

    pub fn classify(&self, channel: usize) -> Result<Vec<Rejection>, TableError> {
        self.check_channel(channel)?;
        Ok(self
            .samples
            .iter()
            .map(|s| Rejection::of(s, channel))
            .collect())
    }

    pub fn rejection_counts(&self, channel: usize) -> Result<RejectionCounts, TableError> {
        let mut counts = RejectionCounts::default();
        for class in self.classify(channel)? {
            match class {
                Rejection::Good => counts.good += 1,
                Rejection::Masked => counts.masked += 1,
                Rejection::Unlocked => counts.unlocked += 1,
                Rejection::Transferred => counts.transferred += 1,
                Rejection::Outlier => counts.outlier += 1,
            }
        }
        Ok(counts)
    }
}

fn median_step(samples: &[Sample]) -> Option<f64> {
    let mut steps: Vec<f64> = samples.windows(2).map(|w| w[1].time - w[0].time).collect();
    if steps.is_empty() {
        return None;
    }
    steps.sort_by(f64::total_cmp);
    let mid = steps.len() / 2;
    if steps.len() % 2 == 0 {
        Some((steps[mid - 1] + steps[mid]) / 2.0)
    } else {
        Some(steps[mid])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Rows one second apart starting at `t0`, all `GOOD`.
    pub(crate) fn rows(t0: f64, values: &[Vec<f64>]) -> Vec<RawRow> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| RawRow {
                timestamp: String::new(),
                status: GOOD_STATUS.to_string(),
                time: t0 + i as f64,
                values: v.clone(),
            })
            .collect()
    }

    #[test]
    fn test_load_normalizes_time_and_subtracts_baselines() {
        let t0 = 1_500_000_123.0;
        let table = SampleTable::load(
            rows(t0, &[vec![105.0, 7.0], vec![95.0, 8.0], vec![100.0, 9.0]]),
            &[100.0, 0.0],
        )
        .unwrap();
        let midnight = (t0 / 86400.0_f64).floor() * 86400.0;
        assert_eq!(table.reference_time(), midnight);
        assert_eq!(table.samples()[0].time, t0 - midnight);
        assert_eq!(table.channel_values(0), vec![5.0, -5.0, 0.0]);
        assert_eq!(table.sample_interval(), 1.0);
        assert_eq!(table.ranges()[0].y_min, -5.0);
        assert_eq!(table.ranges()[0].y_max, 5.0);
    }

    #[test]
    fn test_median_sample_interval_ignores_gaps() {
        let mut raw = rows(0.0, &vec![vec![0.0]; 6]);
        raw[4].time = 100.0;
        raw[5].time = 101.0;
        let table = SampleTable::load(raw, &[0.0]).unwrap();
        assert_eq!(table.sample_interval(), 1.0);
    }

    #[test]
    fn test_bad_status_rejects_all_channels() {
        let mut raw = rows(0.0, &vec![vec![0.0, 0.0, 0.0]; 3]);
        raw[1].status = " UNLOCK ".to_string();
        raw[2].status = "  GOOD ".to_string();
        let table = SampleTable::load(raw, &[0.0, 0.0, 0.0]).unwrap();
        let flags = table.samples()[1].flags;
        assert_eq!(flags.filtered(), 0b111);
        assert_eq!(flags.transferred(), 0b111);
        assert_eq!(flags.gathered(), 0b111);
        assert_eq!(flags.masked(), 0);
        assert!(!table.samples()[1].source_good);
        assert_eq!(table.samples()[2].flags, StatusFlags::default());
    }

    #[test]
    fn test_row_width_mismatch_is_an_error() {
        let raw = rows(0.0, &[vec![0.0, 1.0], vec![0.0]]);
        assert!(matches!(
            SampleTable::load(raw, &[0.0, 0.0]),
            Err(TableError::RowWidth { row: 1, found: 1, expected: 2 })
        ));
    }

    #[test]
    fn test_gather_is_or_of_categories() {
        let mut flags = StatusFlags::default();
        flags.set_filtered(0b0001);
        flags.set_transferred(0b0100);
        flags.0 |= 0b1000 << StatusFlags::MASKED_SHIFT;
        flags.0 |= 0b0010; // stale gathered bit
        flags.gather();
        assert_eq!(flags.gathered(), 0b1101);
        flags.reset();
        assert_eq!(flags.bits(), (0b1000 << 24) | 0b1000);
    }

    /// Ten rows, two channels, hand-picked gathered bits.
    fn fixture() -> SampleTable {
        let values: Vec<Vec<f64>> = (0..10).map(|i| vec![i as f64, -(i as f64)]).collect();
        let mut table = SampleTable::load(rows(0.0, &values), &[0.0, 0.0]).unwrap();
        let gathered = [0b00, 0b01, 0b10, 0b11, 0b00, 0b00, 0b10, 0b00, 0b01, 0b00];
        for (s, g) in table.samples_mut().iter_mut().zip(gathered) {
            s.flags = StatusFlags(g);
        }
        table
    }

    #[test]
    fn test_good_points_requires_all_channels_good() {
        let mut table = fixture();
        let both = table.good_points(&[0, 1]).unwrap();
        assert_eq!(both.times, vec![0.0, 4.0, 5.0, 7.0, 9.0]);
        assert_eq!(both.column(0), &[0.0, 4.0, 5.0, 7.0, 9.0]);
        assert_eq!(both.column(1), &[-0.0, -4.0, -5.0, -7.0, -9.0]);

        let first = table.good_points(&[0]).unwrap();
        assert_eq!(first.times, vec![0.0, 2.0, 4.0, 5.0, 6.0, 7.0, 9.0]);
        assert_eq!(first.mean(0), Some(33.0 / 7.0));
    }

    #[test]
    fn test_good_points_cache_dropped_on_mutation() {
        let mut table = fixture();
        let before = table.good_points(&[0]).unwrap();
        let again = table.good_points(&[0]).unwrap();
        assert!(Arc::ptr_eq(&before, &again));

        table.samples_mut()[0].flags.add_mask(0b01);
        let after = table.good_points(&[0]).unwrap();
        assert_eq!(after.len(), before.len() - 1);
    }

    #[test]
    fn test_good_points_unknown_channel() {
        let mut table = fixture();
        assert!(matches!(
            table.good_points(&[2]),
            Err(TableError::NoSuchChannel { channel: 2, channels: 2 })
        ));
    }

    #[test]
    fn test_rejection_classes_are_exclusive() {
        let mut table = fixture();
        {
            let samples = table.samples_mut();
            samples[0].flags = StatusFlags::default();
            samples[0].flags.add_mask(0b01);
            samples[0].flags.set_filtered(0b01);
            samples[1].flags = StatusFlags::default();
            samples[1].flags.set_filtered(0b01);
            samples[1].flags.set_transferred(0b01);
            samples[2].flags = StatusFlags::default();
            samples[2].flags.set_transferred(0b01);
            samples[3].flags = StatusFlags::default();
            samples[3].flags.set_filtered(0b01);
            samples[3].outlier_only = 0b01;
        }
        let classes = table.classify(0).unwrap();
        assert_eq!(classes[0], Rejection::Masked);
        assert_eq!(classes[1], Rejection::Unlocked);
        assert_eq!(classes[2], Rejection::Transferred);
        assert_eq!(classes[3], Rejection::Outlier);
        let counts = table.rejection_counts(0).unwrap();
        assert_eq!(
            counts.good + counts.masked + counts.unlocked + counts.transferred + counts.outlier,
            10
        );
    }
}
