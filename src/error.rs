use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building or querying a [`crate::data::model::SampleTable`].
#[derive(Error, Debug)]
pub enum TableError {
    #[error("Row {row} has {found} frequency values, expected {expected}")]
    RowWidth {
        row: usize,
        found: usize,
        expected: usize,
    },

    #[error("A dataset holds between 1 and 8 channels, got {0}")]
    ChannelCount(usize),

    #[error("Channel {channel} exceeds the number of channels ({channels})")]
    NoSuchChannel { channel: usize, channels: usize },
}

/// Precondition failures of a filter pass. Nothing is mutated when one is
/// returned.
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Need a tolerance for each of {channels} channels, got {found}")]
    ToleranceCount { channels: usize, found: usize },

    #[error("Need a critical-channel selection for {channels} channels, got {found}")]
    CriticalCount { channels: usize, found: usize },
}

#[derive(Error, Debug)]
pub enum MaskError {
    #[error("Failed to read mask file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write mask file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write mask file {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },

    #[error("Sample time {0} s cannot be expressed as a UTC time of day")]
    Timestamp(f64),
}

#[derive(Error, Debug)]
pub enum EvalError {
    #[error("Channel number 0 is not valid in evaluation '{0}' (channels count from 1)")]
    ZeroChannel(String),

    #[error("Evaluation '{name}' refers to channel {channel}, but only {channels} are configured")]
    ChannelOutOfRange {
        name: String,
        channel: usize,
        channels: usize,
    },

    #[error("Evaluation '{name}': {what} must not be zero")]
    Zero { name: String, what: &'static str },

    #[error("Evaluation '{0}' needs the CEO and repetition-rate channels in [config]")]
    MissingCombChannels(String),

    #[error(transparent)]
    Table(#[from] TableError),
}
