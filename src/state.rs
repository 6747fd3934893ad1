use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use bigdecimal::BigDecimal;
use log::{info, warn};

use crate::color::Color;
use crate::config::AnalysisConfig;
use crate::data::filter::{FilterEngine, FilterSummary};
use crate::data::loader;
use crate::data::mask::{self, MaskOutcome};
use crate::data::model::{ChannelRange, RejectionCounts, SampleTable};
use crate::evaluation::{EvaluationResult, FrequencyEvaluator};
use crate::stats::{allan_deviation, AdevCurve, TauGrid};

// ---------------------------------------------------------------------------
// Channel results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ChannelSummary {
    pub name: String,
    pub color: Color,
    pub good_points: usize,
    /// Mean deviation from the baseline (Hz).
    pub mean: Option<f64>,
    /// Baseline plus mean deviation; the channel correction is not applied.
    pub frequency: Option<BigDecimal>,
    pub rejections: RejectionCounts,
    pub range: ChannelRange,
    pub adev: AdevCurve,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One dataset with its configuration and the results of the last pass.
pub struct Session {
    pub source: PathBuf,
    pub config: AnalysisConfig,
    pub table: SampleTable,
    /// Shared by every ADEV curve of this dataset.
    pub grid: TauGrid,

    pub filter_summary: Option<FilterSummary>,
    pub channels: Vec<ChannelSummary>,
    pub evaluations: Vec<EvaluationResult>,

    /// Data-quality warnings of the last evaluation.
    pub warnings: Vec<String>,
}

impl Session {
    /// Load a counter file. Without a configuration every channel gets the
    /// defaults and is named after its column.
    pub fn open(path: &Path, config: Option<AnalysisConfig>) -> Result<Self> {
        let file = loader::load_file(path)?;
        let config = match config {
            Some(c) => {
                if c.channel_count() != file.channel_count() {
                    bail!(
                        "{} has {} frequency columns, but the configuration defines {} channels",
                        path.display(),
                        file.channel_count(),
                        c.channel_count()
                    );
                }
                c
            }
            None => {
                let mut c = AnalysisConfig::with_channels(file.channel_count());
                for (ch, name) in c.channels.iter_mut().zip(&file.channel_names) {
                    ch.name = name.clone();
                }
                c
            }
        };

        let table = SampleTable::load(file.rows, &config.baselines())
            .with_context(|| format!("building sample table from {}", path.display()))?;
        let grid = TauGrid::new(table.sample_interval(), config.config.taus_per_decade);
        info!(
            "Session for {}: {} samples, tau0 = {} s",
            path.display(),
            table.len(),
            grid.tau0
        );

        Ok(Self {
            source: path.to_path_buf(),
            config,
            table,
            grid,
            filter_summary: None,
            channels: Vec::new(),
            evaluations: Vec::new(),
            warnings: Vec::new(),
        })
    }

    // -- masks --

    pub fn load_maskfile(&mut self, path: &Path) -> Result<MaskOutcome> {
        let outcome = mask::load_maskfile(&mut self.table, path)?;
        if outcome.unresolved > 0 || outcome.skipped > 0 {
            warn!(
                "Mask file {}: {} intervals skipped, {} unresolved",
                path.display(),
                outcome.skipped,
                outcome.unresolved
            );
        }
        Ok(outcome)
    }

    /// Mask a time range (seconds since the reference midnight) on the
    /// channels in `channels`.
    pub fn mask_range(&mut self, channels: u8, t_start: f64, t_end: f64) -> usize {
        mask::add_to_mask(&mut self.table, channels, t_start, t_end)
    }

    pub fn save_maskfile(&self, path: &Path) -> Result<usize> {
        Ok(mask::save_maskfile(&self.table, path)?)
    }

    // -- pipeline --

    /// Re-run the automatic rejection with the current configuration.
    pub fn refilter(&mut self) -> Result<&FilterSummary> {
        let engine = FilterEngine::new(
            self.config.tolerances(),
            self.config.critical(),
            self.config.filter_params(),
        );
        let summary = engine.run(&mut self.table)?;
        Ok(self.filter_summary.insert(summary))
    }

    /// Channel means, Allan deviations and every configured evaluation on
    /// the current good points.
    pub fn evaluate(&mut self) -> Result<()> {
        self.warnings.clear();
        let taus = self.grid.taus();
        let colors = self.config.channel_colors();

        let mut channels = Vec::with_capacity(self.table.channel_count());
        for (ch, cfg) in self.config.channels.iter().enumerate() {
            let good = self.table.good_points(&[ch])?;
            let values = good.column(ch);
            let mean = good.mean(ch);
            if mean.is_none() {
                warn!("Channel '{}' has no good data points", cfg.name);
                self.warnings.push(format!("channel '{}': no good data points", cfg.name));
            }
            let frequency = mean
                .and_then(|m| BigDecimal::from_str(&m.to_string()).ok())
                .map(|m| &cfg.baseline.0 + m);
            channels.push(ChannelSummary {
                name: cfg.name.clone(),
                color: colors[ch],
                good_points: good.len(),
                mean,
                frequency,
                rejections: self.table.rejection_counts(ch)?,
                range: good.range(ch),
                adev: allan_deviation(values, self.grid.tau0, &taus, cfg.adev_reference),
            });
        }
        self.channels = channels;

        let evaluator = FrequencyEvaluator::new(&self.config, &self.grid);
        let mut evaluations = Vec::with_capacity(self.config.evaluations.len());
        for eval in &self.config.evaluations {
            let result = evaluator
                .evaluate(&mut self.table, eval)
                .with_context(|| format!("evaluation '{}'", eval.name))?;
            if let Some(w) = &result.warning {
                self.warnings.push(format!("evaluation '{}': {w}", eval.name));
            }
            evaluations.push(result);
        }
        self.evaluations = evaluations;
        Ok(())
    }

    /// Filter, then evaluate.
    pub fn run(&mut self) -> Result<()> {
        self.refilter()?;
        self.evaluate()
    }
}
