use log::{debug, info};
use serde::Serialize;

use super::model::{all_channels, channel_bit, Sample, SampleTable};
use crate::error::FilterError;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Samples rejected around each out-of-band sample, to cover the settling
/// of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overhang {
    pub backward: usize,
    pub forward: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterParams {
    pub overhang: Overhang,
    /// Outlier limit in units of the block-averaged standard deviation.
    pub outlier_threshold: f64,
    /// Upper bound on the block length used for the variance estimate.
    pub block_len: usize,
    /// Half width of the moving average (window is `2 * width + 1`).
    pub window_width: usize,
    /// Channels with fewer good samples skip the outlier stage.
    pub min_samples: usize,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            overhang: Overhang {
                backward: 1,
                forward: 10,
            },
            outlier_threshold: 5.0,
            block_len: 300,
            window_width: 2,
            min_samples: 100,
        }
    }
}

/// Per-channel sample counts of one filter pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterSummary {
    /// Filter-rejected after the band stage (overhangs included).
    pub unlocked: Vec<usize>,
    /// Rejected by the outlier stage alone.
    pub outliers: Vec<usize>,
    /// Samples carrying transfer bits.
    pub transferred: usize,
    /// Final gathered rejections.
    pub rejected: Vec<usize>,
}

// ---------------------------------------------------------------------------
// FilterEngine
// ---------------------------------------------------------------------------

/// Recomputes the automatic part of every status word from scratch.
#[derive(Debug, Clone)]
pub struct FilterEngine {
    tolerances: Vec<f64>,
    critical: Vec<bool>,
    params: FilterParams,
}

impl FilterEngine {
    pub fn new(tolerances: Vec<f64>, critical: Vec<bool>, params: FilterParams) -> Self {
        Self {
            tolerances,
            critical,
            params,
        }
    }

    pub fn params(&self) -> &FilterParams {
        &self.params
    }

    /// Reset, band filter, transfer, outlier filter, transfer, gather.
    pub fn run(&self, table: &mut SampleTable) -> Result<FilterSummary, FilterError> {
        let n = table.channel_count();
        if self.tolerances.len() < n {
            return Err(FilterError::ToleranceCount {
                channels: n,
                found: self.tolerances.len(),
            });
        }
        if self.critical.len() < n {
            return Err(FilterError::CriticalCount {
                channels: n,
                found: self.critical.len(),
            });
        }

        let everything = all_channels(n);
        let samples = table.samples_mut();
        let mut summary = FilterSummary::default();

        reset(samples, everything);

        for ch in 0..n {
            let count = filter_unlocked(samples, ch, self.tolerances[ch], self.params.overhang);
            debug!("Channel {}: {count} samples outside ±{} Hz", ch + 1, self.tolerances[ch]);
            summary.unlocked.push(count);
            if self.critical[ch] {
                transfer_critical(samples, ch, everything);
            }
        }

        for ch in 0..n {
            let count = filter_outliers(samples, ch, &self.params);
            summary.outliers.push(count);
            if self.critical[ch] {
                transfer_critical(samples, ch, everything);
            }
        }

        gather(samples);

        summary.transferred = samples
            .iter()
            .filter(|s| s.flags.transferred() != 0)
            .count();
        summary.rejected = (0..n)
            .map(|ch| {
                let bit = channel_bit(ch);
                samples.iter().filter(|s| s.flags.gathered() & bit != 0).count()
            })
            .collect();
        info!(
            "Filter pass: rejected {:?} of {} samples ({} with transferred rejection)",
            summary.rejected,
            samples.len(),
            summary.transferred
        );
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Keep only manual mask bits, then re-apply the rejection of rows the
/// counter reported as bad.
pub fn reset(samples: &mut [Sample], everything: u8) {
    for s in samples.iter_mut() {
        s.flags.reset();
        s.outlier_only = 0;
        if !s.source_good {
            s.flags.reject_source(everything);
        }
    }
}

/// Reject samples with `|value| > tolerance` or a non-finite reading,
/// extended forward and then backward by the overhang. Rows already
/// rejected for their counter status do not start an overhang. Returns the
/// number of filter-rejected samples.
pub fn filter_unlocked(
    samples: &mut [Sample],
    channel: usize,
    tolerance: f64,
    overhang: Overhang,
) -> usize {
    let bit = channel_bit(channel);

    let mut hits = vec![false; samples.len()];
    let mut block = 0;
    for (hit, s) in hits.iter_mut().zip(samples.iter()) {
        let value = s.channels[channel];
        if !value.is_finite() || value.abs() > tolerance {
            block = overhang.forward + 1;
        }
        if block > 0 {
            block -= 1;
            *hit = true;
        }
    }

    block = 0;
    for hit in hits.iter_mut().rev() {
        if *hit {
            block = overhang.backward + 1;
        }
        if block > 0 {
            block -= 1;
            *hit = true;
        }
    }

    for (s, hit) in samples.iter_mut().zip(hits) {
        if hit {
            s.flags.set_filtered(bit);
        }
    }
    samples.iter().filter(|s| s.flags.filtered() & bit != 0).count()
}

/// A filter rejection on a critical channel rejects every channel.
pub fn transfer_critical(samples: &mut [Sample], channel: usize, everything: u8) {
    let bit = channel_bit(channel);
    for s in samples.iter_mut() {
        if s.flags.filtered() & bit != 0 {
            s.flags.set_transferred(everything);
        }
    }
}

/// Two rounds of glitch detection against a local moving average. The
/// second round estimates the scale without the first round's outliers and
/// also rejects the neighbours of every sample beyond the limit. Returns the
/// number of samples rejected by this stage alone.
pub fn filter_outliers(samples: &mut [Sample], channel: usize, params: &FilterParams) -> usize {
    let bit = channel_bit(channel);
    let any_category = u32::from_le_bytes([bit; 4]);

    for round in 0..2 {
        let good: Vec<f64> = samples
            .iter()
            .filter(|s| s.flags.bits() & any_category == 0)
            .map(|s| s.channels[channel])
            .collect();
        if good.len() < params.min_samples {
            debug!(
                "Channel {}: {} good samples, skipping outlier round {}",
                channel + 1,
                good.len(),
                round + 1
            );
            break;
        }
        let Some(limit) = outlier_limit(&good, params.block_len, params.outlier_threshold) else {
            debug!("Channel {}: no spread in good samples", channel + 1);
            break;
        };

        // non-finite readings are already rejected; keep them out of the average
        let fill = good.iter().sum::<f64>() / good.len() as f64;
        let values: Vec<f64> = samples
            .iter()
            .map(|s| s.channels[channel])
            .map(|v| if v.is_finite() { v } else { fill })
            .collect();
        let Some(average) = moving_average(&values, params.window_width) else {
            break;
        };
        let mut hits: Vec<usize> = values
            .iter()
            .zip(&average)
            .enumerate()
            .filter(|(_, (v, a))| (*v - *a).abs() > limit)
            .map(|(i, _)| i)
            .collect();
        if round == 1 {
            hits = with_neighbours(&hits, values.len());
        }
        debug!(
            "Channel {}: outlier limit {limit:.4} Hz, {} samples beyond it in round {}",
            channel + 1,
            hits.len(),
            round + 1
        );

        for i in hits {
            let s = &mut samples[i];
            if s.flags.filtered() & bit == 0 {
                s.flags.set_filtered(bit);
                s.outlier_only |= bit;
            }
        }
    }

    samples.iter().filter(|s| s.outlier_only & bit != 0).count()
}

/// Overwrite the gathered bits of every sample.
pub fn gather(samples: &mut [Sample]) {
    for s in samples.iter_mut() {
        s.flags.gather();
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `threshold * sqrt(var)`, where `var` is the inverse-variance weighted
/// mean of the variances of near-equal blocks of at most `block_len`
/// samples. Blocks without spread carry no weight.
fn outlier_limit(good: &[f64], block_len: usize, threshold: f64) -> Option<f64> {
    let splits = good.len().div_ceil(block_len.max(1));
    let block = good.len().div_ceil(splits.max(1)).max(1);
    let variances: Vec<f64> = good
        .chunks(block)
        .map(variance)
        .filter(|v| *v > 0.0 && v.is_finite())
        .collect();
    if variances.is_empty() {
        return None;
    }
    let weights: f64 = variances.iter().map(|v| 1.0 / v).sum();
    let weighted = variances.len() as f64 / weights;
    Some(threshold * weighted.sqrt())
}

fn variance(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
}

/// Centered average over `2 * width + 1` samples; the first and last
/// `width` samples get the nearest full window.
fn moving_average(values: &[f64], width: usize) -> Option<Vec<f64>> {
    let window = 2 * width + 1;
    let n = values.len();
    if n < window {
        return None;
    }
    let mut centered = Vec::with_capacity(n - 2 * width);
    let mut sum: f64 = values[..window].iter().sum();
    centered.push(sum / window as f64);
    for i in window..n {
        sum += values[i] - values[i - window];
        centered.push(sum / window as f64);
    }

    let first = centered[0];
    let last = centered[centered.len() - 1];
    let mut average = vec![first; width];
    average.extend(centered);
    average.extend(std::iter::repeat(last).take(width));
    Some(average)
}

fn with_neighbours(hits: &[usize], len: usize) -> Vec<usize> {
    let mut extended: Vec<usize> = hits
        .iter()
        .flat_map(|&i| i.saturating_sub(1)..=(i + 1).min(len - 1))
        .collect();
    extended.sort_unstable();
    extended.dedup();
    extended
}
