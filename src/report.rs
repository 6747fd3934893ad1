//! JSON report of one analysis pass.
//!
//! Decimal quantities are written as strings so that no digit is lost to a
//! JSON reader that parses numbers as doubles.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::color::{self, Color};
use crate::data::filter::FilterSummary;
use crate::data::model::{ChannelRange, Rejection, RejectionCounts};
use crate::evaluation::{EvaluationResult, EvaluationType};
use crate::state::{ChannelSummary, Session};
use crate::stats::{AdevPoint, LogPoint};

#[derive(Debug, Serialize)]
pub struct Report {
    pub source: String,
    pub generated: String,
    /// UTC midnight that sample times count from.
    pub reference_time: f64,
    pub reference_date: Option<String>,
    pub sample_interval: f64,
    pub samples: usize,
    pub filter: Option<FilterSummary>,
    pub channels: Vec<ChannelReport>,
    pub evaluations: Vec<EvaluationReport>,
    pub warnings: Vec<String>,
    /// Display colour of every point class.
    pub legend: Vec<ClassColor>,
}

#[derive(Debug, Serialize)]
pub struct ClassColor {
    pub class: Rejection,
    pub color: String,
}

#[derive(Debug, Serialize)]
pub struct ChannelReport {
    pub name: String,
    pub color: String,
    pub good_points: usize,
    pub mean: Option<f64>,
    pub frequency: Option<String>,
    pub rejections: RejectionCounts,
    pub range: ChannelRange,
    pub adev_reference: f64,
    pub adev: Vec<AdevPoint>,
    pub adev_log: Vec<LogPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub points: Option<Vec<Rejection>>,
}

#[derive(Debug, Serialize)]
pub struct EvaluationReport {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EvaluationType,
    pub color: String,
    pub show: bool,
    pub good_points: usize,
    pub baseline: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_ratio: Option<String>,
    pub target: String,
    pub result: String,
    pub sys_cor: String,
    pub sys_unc: String,
    pub mean_time: Option<f64>,
    pub mean_relative: Option<f64>,
    pub stat_unc: Option<f64>,
    pub frac_dev: f64,
    pub frac_unc: f64,
    pub adev: Vec<AdevPoint>,
    pub adev_log: Vec<LogPoint>,
    pub warning: Option<String>,
}

impl Report {
    /// Snapshot of `session`. With `with_points` every channel carries the
    /// class of each sample.
    pub fn from_session(session: &Session, with_points: bool) -> Result<Self> {
        let channels = session
            .channels
            .iter()
            .enumerate()
            .map(|(ch, summary)| {
                let points = if with_points {
                    Some(session.table.classify(ch)?)
                } else {
                    None
                };
                Ok(channel_report(
                    summary,
                    session.config.channels[ch].adev_reference,
                    points,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let reference_time = session.table.reference_time();
        Ok(Report {
            source: session.source.display().to_string(),
            generated: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            reference_time,
            reference_date: DateTime::from_timestamp(reference_time as i64, 0)
                .map(|t| t.format("%Y-%m-%d").to_string()),
            sample_interval: session.table.sample_interval(),
            samples: session.table.len(),
            filter: session.filter_summary.clone(),
            channels,
            evaluations: session
                .evaluations
                .iter()
                .zip(&session.config.evaluations)
                .zip(session.config.evaluation_colors())
                .map(|((result, cfg), color)| evaluation_report(result, color, cfg.show))
                .collect(),
            warnings: session.warnings.clone(),
            legend: Rejection::ALL
                .iter()
                .map(|&class| ClassColor {
                    class,
                    color: color::to_hex(color::rejection_color(class)),
                })
                .collect(),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serializing report")
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)
            .with_context(|| format!("writing report {}", path.display()))
    }
}

fn channel_report(
    summary: &ChannelSummary,
    adev_reference: f64,
    points: Option<Vec<Rejection>>,
) -> ChannelReport {
    ChannelReport {
        name: summary.name.clone(),
        color: color::to_hex(summary.color),
        good_points: summary.good_points,
        mean: summary.mean,
        frequency: summary.frequency.as_ref().map(|f| f.to_string()),
        rejections: summary.rejections,
        range: summary.range,
        adev_reference,
        adev: summary.adev.points.clone(),
        adev_log: summary.adev.log_points(),
        points,
    }
}

fn evaluation_report(result: &EvaluationResult, color: Color, show: bool) -> EvaluationReport {
    let comb = &result.combination;
    EvaluationReport {
        name: result.name.clone(),
        kind: comb.kind,
        color: color::to_hex(color),
        show,
        good_points: result.good_points,
        baseline: comb.baseline.to_string(),
        line_ratio: comb.line_ratio.as_ref().map(|r| r.to_string()),
        target: comb.target.to_string(),
        result: result.result.to_string(),
        sys_cor: comb.sys_cor.to_string(),
        sys_unc: comb.sys_unc.to_string(),
        mean_time: result.mean_time,
        mean_relative: result.mean_relative,
        stat_unc: result.stat_unc,
        frac_dev: result.frac_dev,
        frac_unc: result.frac_unc,
        adev: result.adev.points.clone(),
        adev_log: result.adev.log_points(),
        warning: result.warning.clone(),
    }
}
