//! Manual exclusions: interactive range masks and the mask file.
//!
//! Mask file layout (CSV, one interval per line):
//!
//! ```text
//! channel ,day,  start  ,   end
//! 00000101,  0, 01:00:03, 01:00:06
//! ```
//!
//! `channel` holds one bit per channel (channel 1 rightmost), `day` counts
//! days from the reference midnight and `start`/`end` are UTC times of day.

use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;

use chrono::{DateTime, NaiveTime, Timelike};
use log::{debug, info, warn};

use super::model::{all_channels, Sample, SampleTable, SECONDS_PER_DAY};
use crate::error::MaskError;

/// Added to a read end time so the sample stamped at that second is kept
/// inside the half-open interval.
pub const END_MARGIN: f64 = 0.05;

const HEADER: [&str; 4] = ["channel ", "day", "  start  ", "   end"];
const TIME_FORMAT: &str = "%H:%M:%S";

/// One line of a mask file, in seconds since the reference midnight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskInterval {
    pub channels: u8,
    pub start: Option<f64>,
    pub end: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaskOutcome {
    /// Intervals read or supplied.
    pub intervals: usize,
    /// Samples that received mask bits (counted once per interval).
    pub masked: usize,
    /// Intervals dropped for an undefined start.
    pub skipped: usize,
    /// Intervals still overlapping when no further progress was possible.
    pub unresolved: usize,
}

// ---------------------------------------------------------------------------
// Interactive masking
// ---------------------------------------------------------------------------

/// Mask `channels` on every sample between the samples nearest to `t_start`
/// and `t_end` (inclusive). Returns the number of samples touched, 0 when
/// neither time lies within the data or the indices are out of order.
pub fn add_to_mask(table: &mut SampleTable, channels: u8, t_start: f64, t_end: f64) -> usize {
    let channels = channels & all_channels(table.channel_count());
    let (start_found, start) = nearest_index(table.samples(), t_start);
    let (end_found, end) = nearest_index(table.samples(), t_end);
    if !start_found && !end_found {
        debug!("Mask: {t_start} and {t_end} are both outside the data");
        return 0;
    }
    if start > end {
        debug!("Mask: indices {start} and {end} out of order");
        return 0;
    }

    for s in &mut table.samples_mut()[start..=end] {
        s.flags.add_mask(channels);
    }
    info!("Masked samples {start}..={end} for channels {channels:08b}");
    end - start + 1
}

/// Index of the sample nearest to `time`, and whether `time` lies within
/// the data. Times before the first sample map to 0, times after the last
/// sample to the last index.
fn nearest_index(samples: &[Sample], time: f64) -> (bool, usize) {
    let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
        return (false, 0);
    };
    if time < first.time {
        return (false, 0);
    }
    if time > last.time {
        return (false, samples.len() - 1);
    }
    let idx = samples.partition_point(|s| s.time < time);
    if idx == 0 || samples[idx].time == time {
        return (true, idx);
    }
    if (samples[idx - 1].time - time).abs() < (samples[idx].time - time).abs() {
        (true, idx - 1)
    } else {
        (true, idx)
    }
}

// ---------------------------------------------------------------------------
// Interval application
// ---------------------------------------------------------------------------

/// Apply mask intervals as half-open `[start, end)` ranges.
///
/// Intervals are taken in order of start time. One that starts before the
/// end of the previously applied interval is postponed to the next sweep,
/// so overlapping intervals all take effect regardless of input order.
pub fn apply_intervals(table: &mut SampleTable, intervals: Vec<MaskInterval>) -> MaskOutcome {
    let mut outcome = MaskOutcome {
        intervals: intervals.len(),
        ..MaskOutcome::default()
    };
    if intervals.is_empty() {
        return outcome;
    }

    let valid = all_channels(table.channel_count());
    let period = table.sample_interval();
    let mut pending: Vec<MaskInterval> = intervals
        .into_iter()
        .filter(|iv| match iv.start {
            Some(t) if t.is_finite() => true,
            _ => {
                warn!("Skipping mask interval without a valid start: {iv:?}");
                outcome.skipped += 1;
                false
            }
        })
        .collect();
    pending.sort_by(|a, b| start_of(a).total_cmp(&start_of(b)));

    let mut touched = false;
    while !pending.is_empty() {
        debug!("Applying mask intervals: {} remain", pending.len());
        let remaining = pending.len();
        let mut postponed = Vec::new();
        let mut prev_end = f64::NEG_INFINITY;
        let mut index = 0;

        for iv in pending {
            let start = start_of(&iv);
            if start < prev_end {
                postponed.push(iv);
                continue;
            }
            let mut end = match iv.end {
                Some(e) if e.is_finite() => e,
                _ => start + period,
            };
            while end < start {
                end += SECONDS_PER_DAY;
            }
            prev_end = end;

            let channels = iv.channels & valid;
            let samples = table.samples();
            while index < samples.len() && samples[index].time < start {
                index += 1;
            }
            let from = index;
            while index < samples.len() && samples[index].time < end {
                index += 1;
            }
            if index > from && channels != 0 {
                for s in &mut table.samples_mut()[from..index] {
                    s.flags.add_mask(channels);
                }
                outcome.masked += index - from;
                touched = true;
            }
        }

        if postponed.len() == remaining {
            warn!("{} mask intervals could not be applied", postponed.len());
            outcome.unresolved = postponed.len();
            break;
        }
        pending = postponed;
    }

    if touched {
        info!(
            "Masked {} samples from {} intervals",
            outcome.masked, outcome.intervals
        );
    }
    outcome
}

fn start_of(iv: &MaskInterval) -> f64 {
    iv.start.unwrap_or(f64::INFINITY)
}

// ---------------------------------------------------------------------------
// Mask file
// ---------------------------------------------------------------------------

/// Read a mask file. A missing file yields no intervals; malformed lines are
/// skipped with a warning.
pub fn read_maskfile(path: &Path) -> Result<Vec<MaskInterval>, MaskError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!("No mask file at {}", path.display());
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(MaskError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let mut intervals = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warn!("{}: skipping line {}: {e}", path.display(), line + 2);
                continue;
            }
        };
        match parse_record(&record) {
            Some(iv) => intervals.push(iv),
            None => warn!(
                "{}: skipping malformed line {}: {:?}",
                path.display(),
                line + 2,
                record
            ),
        }
    }
    debug!("Read {} mask intervals from {}", intervals.len(), path.display());
    Ok(intervals)
}

fn parse_record(record: &csv::StringRecord) -> Option<MaskInterval> {
    let channels = u8::from_str_radix(record.get(0)?, 2).ok()?;
    let day: i64 = record.get(1)?.parse().ok()?;
    let offset = day as f64 * SECONDS_PER_DAY;
    let start = record.get(2).and_then(time_of_day).map(|t| t + offset);
    let end = record
        .get(3)
        .and_then(time_of_day)
        .map(|t| t + offset + END_MARGIN);
    Some(MaskInterval {
        channels,
        start,
        end,
    })
}

fn time_of_day(text: &str) -> Option<f64> {
    match NaiveTime::parse_from_str(text, TIME_FORMAT) {
        Ok(t) => Some(t.num_seconds_from_midnight() as f64),
        Err(e) => {
            warn!("Unreadable mask time '{text}': {e}");
            None
        }
    }
}

/// Read `path` and apply its intervals.
pub fn load_maskfile(table: &mut SampleTable, path: &Path) -> Result<MaskOutcome, MaskError> {
    let intervals = read_maskfile(path)?;
    Ok(apply_intervals(table, intervals))
}

/// Write every run of samples sharing the same non-zero manual mask as one
/// line. Returns the number of lines written.
pub fn save_maskfile(table: &SampleTable, path: &Path) -> Result<usize, MaskError> {
    let csv_error = |source: csv::Error| MaskError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(|source| MaskError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    writer.write_record(HEADER).map_err(csv_error)?;

    let reference = table.reference_time();
    let mut written = 0;
    for (flags, t_a, t_b) in mask_runs(table.samples()) {
        let day = (t_a / SECONDS_PER_DAY).floor() as i64;
        writer
            .write_record([
                format!("{flags:08b}"),
                format!("{day:3}"),
                format!("{:>9}", clock_time(t_a + reference)?),
                format!("{:>9}", clock_time(t_b + reference)?),
            ])
            .map_err(csv_error)?;
        written += 1;
    }
    writer.flush().map_err(|source| MaskError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    info!("Wrote {written} mask intervals to {}", path.display());
    Ok(written)
}

/// `(mask bits, first time, last time)` of every run of equal non-zero
/// mask bits.
fn mask_runs(samples: &[Sample]) -> Vec<(u8, f64, f64)> {
    let mut runs: Vec<(u8, f64, f64)> = Vec::new();
    let mut current = 0u8;
    for s in samples {
        let flags = s.flags.masked();
        if flags == current {
            if let Some(run) = runs.last_mut().filter(|_| flags != 0) {
                run.2 = s.time;
            }
        } else {
            if flags != 0 {
                runs.push((flags, s.time, s.time));
            }
            current = flags;
        }
    }
    runs
}

fn clock_time(unix: f64) -> Result<String, MaskError> {
    let secs = unix.floor();
    DateTime::from_timestamp(secs as i64, 0)
        .filter(|_| secs.is_finite())
        .map(|t| t.format(TIME_FORMAT).to_string())
        .ok_or(MaskError::Timestamp(unix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::tests::rows;

    /// Midnight of 2020-09-13 (UTC).
    const MIDNIGHT: f64 = 1_599_955_200.0;

    fn table(n: usize, channels: usize) -> SampleTable {
        SampleTable::load(
            rows(MIDNIGHT + 3600.0, &vec![vec![0.0; channels]; n]),
            &vec![0.0; channels],
        )
        .unwrap()
    }

    fn masks(table: &SampleTable) -> Vec<u8> {
        table.samples().iter().map(|s| s.flags.masked()).collect()
    }

    #[test]
    fn test_add_to_mask_is_inclusive_and_idempotent() {
        let mut t = table(20, 2);
        assert_eq!(add_to_mask(&mut t, 0b01, 3604.2, 3606.9), 4);
        let once: Vec<_> = t.samples().iter().map(|s| s.flags).collect();
        assert_eq!(add_to_mask(&mut t, 0b01, 3604.2, 3606.9), 4);
        let twice: Vec<_> = t.samples().iter().map(|s| s.flags).collect();
        assert_eq!(once, twice);
        for (i, s) in t.samples().iter().enumerate() {
            let expected = if (4..=7).contains(&i) { 0b01 } else { 0 };
            assert_eq!(s.flags.masked(), expected, "row {i}");
            assert_eq!(s.flags.gathered(), expected, "row {i}");
        }
    }

    #[test]
    fn test_add_to_mask_outside_data() {
        let mut t = table(10, 1);
        assert_eq!(add_to_mask(&mut t, 0b1, 0.0, 100.0), 0);
        assert_eq!(add_to_mask(&mut t, 0b1, 9000.0, 9100.0), 0);
        assert_eq!(add_to_mask(&mut t, 0b1, 3607.0, 3602.0), 0);
        assert!(masks(&t).iter().all(|&m| m == 0));
        // one endpoint in range clamps the other to the data edge
        assert_eq!(add_to_mask(&mut t, 0b1, 0.0, 3602.0), 3);
    }

    #[test]
    fn test_overlapping_intervals_independent_of_order() {
        let a = MaskInterval {
            channels: 0b01,
            start: Some(3610.0),
            end: Some(3620.0),
        };
        let b = MaskInterval {
            channels: 0b10,
            start: Some(3615.0),
            end: Some(3625.0),
        };
        let c = MaskInterval {
            channels: 0b01,
            start: Some(3612.0),
            end: None,
        };

        let mut forward = table(40, 2);
        let outcome = apply_intervals(&mut forward, vec![a, b, c]);
        let mut backward = table(40, 2);
        apply_intervals(&mut backward, vec![c, b, a]);
        assert_eq!(masks(&forward), masks(&backward));

        assert_eq!(outcome.intervals, 3);
        assert_eq!(outcome.unresolved, 0);
        assert_eq!(outcome.masked, 10 + 10 + 1);
        let m = masks(&forward);
        assert_eq!(m[9], 0);
        assert_eq!(m[10], 0b01);
        assert_eq!(m[15], 0b11);
        assert_eq!(m[19], 0b11);
        assert_eq!(m[20], 0b10);
        assert_eq!(m[25], 0);
    }

    #[test]
    fn test_interval_across_midnight_and_missing_start() {
        let mut t = SampleTable::load(
            rows(MIDNIGHT + 86395.0, &vec![vec![0.0]; 10]),
            &[0.0],
        )
        .unwrap();
        let outcome = apply_intervals(
            &mut t,
            vec![
                MaskInterval {
                    channels: 0b1,
                    start: Some(86398.0),
                    end: Some(1.0 + END_MARGIN),
                },
                MaskInterval {
                    channels: 0b1,
                    start: None,
                    end: Some(5.0),
                },
            ],
        );
        assert_eq!(outcome.skipped, 1);
        let masked: Vec<usize> = masks(&t)
            .iter()
            .enumerate()
            .filter(|(_, &m)| m != 0)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(masked, vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_missing_mask_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = table(5, 1);
        let outcome = load_maskfile(&mut t, &dir.path().join("none.csv")).unwrap();
        assert_eq!(outcome, MaskOutcome::default());
    }

    #[test]
    fn test_unwritable_mask_file_reports_a_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("mask.csv");
        let mut t = table(5, 1);
        add_to_mask(&mut t, 0b1, 3601.0, 3602.0);
        let err = save_maskfile(&t, &path).unwrap_err();
        assert!(matches!(err, MaskError::Write { .. }));
        assert!(err.to_string().starts_with("Failed to write mask file"));
    }

    #[test]
    fn test_mask_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.csv");

        let mut t = table(30, 2);
        add_to_mask(&mut t, 0b01, 3603.0, 3606.0);
        add_to_mask(&mut t, 0b11, 3610.0, 3612.0);
        add_to_mask(&mut t, 0b10, 3627.0, 3629.0);
        assert_eq!(save_maskfile(&t, &path).unwrap(), 3);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "channel ,day,  start  ,   end");
        assert_eq!(lines[1], "00000001,  0, 01:00:03, 01:00:06");

        let mut reloaded = table(30, 2);
        let outcome = load_maskfile(&mut reloaded, &path).unwrap();
        assert_eq!(outcome.intervals, 3);
        assert_eq!(masks(&reloaded), masks(&t));
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.csv");
        std::fs::write(
            &path,
            "channel,day,start,end\n\
             00000001,0,01:00:02,01:00:03\n\
             garbage,0,01:00:05,01:00:06\n\
             00000001,x,01:00:05,01:00:06\n\
             00000001,0,25:99:00,01:00:08\n",
        )
        .unwrap();
        let intervals = read_maskfile(&path).unwrap();
        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals[0].start, Some(3602.0));
        assert_eq!(intervals[0].end, Some(3603.0 + END_MARGIN));
        assert_eq!(intervals[1].start, None);
    }
}
