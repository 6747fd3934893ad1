//! Analysis configuration: channels, derived evaluations and filter settings.
//!
//! The file is TOML with one `[config]` table, one `[[channel]]` entry per
//! counter channel and one `[[evaluation]]` entry per derived quantity:
//!
//! ```toml
//! [config]
//! ceo_channel = 1
//! rep_channel = 2
//! outlier_threshold = 5.0
//!
//! [[channel]]
//! name = "f_CEO"
//! baseline = 20000000
//! tolerance = 1000.0
//! filter = true
//!
//! [[evaluation]]
//! name = "Sr"
//! type = "absolute"
//! main_comb_line = 1716882
//! main_beat_channel = -3
//! main_reference = "429228004229873.0"
//! ```
//!
//! Quantities that enter the exact frequency equations are [`Exact`] and
//! must be written as strings or integers.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use bigdecimal::BigDecimal;
use serde::Deserialize;

use crate::color::{self, Color};
use crate::data::filter::{FilterParams, Overhang};
use crate::data::model::MAX_CHANNELS;

// ---------------------------------------------------------------------------
// Exact – decimal quantity that never passed through binary floating point
// ---------------------------------------------------------------------------

/// A decimal read from configuration text or an integer literal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "DecimalInput")]
pub struct Exact(pub BigDecimal);

#[derive(Deserialize)]
#[serde(untagged)]
enum DecimalInput {
    Text(String),
    Integer(i64),
    Float(f64),
}

impl TryFrom<DecimalInput> for Exact {
    type Error = String;

    fn try_from(input: DecimalInput) -> std::result::Result<Self, Self::Error> {
        match input {
            DecimalInput::Text(s) => BigDecimal::from_str(s.trim())
                .map(Exact)
                .map_err(|e| format!("'{s}' is not a decimal number: {e}")),
            DecimalInput::Integer(i) => Ok(Exact(BigDecimal::from(i))),
            DecimalInput::Float(v) => Err(format!(
                "{v} is a floating-point literal; write exact quantities as strings, e.g. \"{v}\""
            )),
        }
    }
}

impl Exact {
    pub fn zero() -> Self {
        Exact(BigDecimal::from(0))
    }

    pub fn one() -> Self {
        Exact(BigDecimal::from(1))
    }

    /// Lossy view for float-precision work (baseline subtraction).
    pub fn to_f64(&self) -> f64 {
        self.0.to_string().parse().unwrap_or(f64::NAN)
    }
}

impl FromStr for Exact {
    type Err = bigdecimal::ParseBigDecimalError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        BigDecimal::from_str(s).map(Exact)
    }
}

impl From<i64> for Exact {
    fn from(value: i64) -> Self {
        Exact(BigDecimal::from(value))
    }
}

impl fmt::Display for Exact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// [config]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 1-based, signed channel number of the carrier-envelope offset beat.
    pub ceo_channel: Option<i32>,
    /// 1-based channel number of the repetition rate.
    pub rep_channel: Option<i32>,
    pub outlier_threshold: f64,
    pub forward_overhang: usize,
    pub backward_overhang: usize,
    pub taus_per_decade: usize,
    /// Largest accepted |relative / target| before an evaluation is flagged.
    pub relative_tolerance: f64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            ceo_channel: None,
            rep_channel: None,
            outlier_threshold: 5.0,
            forward_overhang: 10,
            backward_overhang: 1,
            taus_per_decade: 10,
            relative_tolerance: 1e-7,
        }
    }
}

// ---------------------------------------------------------------------------
// [[channel]]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    /// Nominal frequency (Hz), subtracted from the readings at load time.
    #[serde(default = "Exact::zero")]
    pub baseline: Exact,
    /// Accepted band around the baseline (Hz).
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Rejection on this channel invalidates all channels.
    #[serde(default, rename = "filter")]
    pub critical: bool,
    /// Offset (Hz) added to the baseline in frequency evaluations.
    #[serde(default = "Exact::zero")]
    pub correction: Exact,
    /// Frequency used to express this channel's Allan deviation fractionally.
    #[serde(default = "default_adev_reference")]
    pub adev_reference: f64,
}

fn default_tolerance() -> f64 {
    1000.0
}

fn default_adev_reference() -> f64 {
    1.0
}

impl ChannelConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            color: None,
            baseline: Exact::zero(),
            tolerance: default_tolerance(),
            critical: false,
            correction: Exact::zero(),
            adev_reference: default_adev_reference(),
        }
    }

    /// Baseline plus correction: the channel frequency used in the comb
    /// equations when its measured deviation is zero.
    pub fn nominal_frequency(&self) -> BigDecimal {
        &self.baseline.0 + &self.correction.0
    }
}

// ---------------------------------------------------------------------------
// [[evaluation]]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct EvaluationConfig {
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default = "default_show")]
    pub show: bool,
    /// Harmonic factor between the comb-measured light and the clock laser.
    #[serde(default = "Exact::one")]
    pub multiplier: Exact,
    #[serde(flatten)]
    pub kind: EvaluationKind,
}

fn default_show() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EvaluationKind {
    Absolute(AbsoluteConfig),
    Ratio(RatioConfig),
}

/// `f = M * (s_ceo*f_ceo + n_a/n_rep * f_rep + s_beat*f_beat)`
#[derive(Debug, Clone, Deserialize)]
pub struct AbsoluteConfig {
    pub main_comb_line: Exact,
    pub main_beat_channel: i32,
    pub main_reference: Exact,
    #[serde(default = "Exact::zero")]
    pub main_sys_cor: Exact,
    #[serde(default = "Exact::zero")]
    pub main_sys_unc: Exact,
    /// Harmonic of the repetition rate that is counted.
    #[serde(default = "Exact::one")]
    pub ref_comb_line: Exact,
}

/// `R = M * f_main / f_ref`
#[derive(Debug, Clone, Deserialize)]
pub struct RatioConfig {
    pub main_comb_line: Exact,
    pub main_beat_channel: i32,
    pub main_reference: Exact,
    #[serde(default = "Exact::zero")]
    pub main_sys_cor: Exact,
    #[serde(default = "Exact::zero")]
    pub main_sys_unc: Exact,
    pub ref_comb_line: Exact,
    pub ref_beat_channel: i32,
    pub ref_reference: Exact,
    #[serde(default = "Exact::zero")]
    pub ref_sys_cor: Exact,
    #[serde(default = "Exact::zero")]
    pub ref_sys_unc: Exact,
}

// ---------------------------------------------------------------------------
// Whole file
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub config: GeneralConfig,
    #[serde(default, rename = "channel")]
    pub channels: Vec<ChannelConfig>,
    #[serde(default, rename = "evaluation")]
    pub evaluations: Vec<EvaluationConfig>,
}

impl AnalysisConfig {
    /// Plain configuration for `n` channels, named `ch 1` .. `ch n`.
    pub fn with_channels(n: usize) -> Self {
        Self {
            config: GeneralConfig::default(),
            channels: (1..=n)
                .map(|i| ChannelConfig::new(&format!("ch {i}")))
                .collect(),
            evaluations: Vec::new(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: AnalysisConfig = toml::from_str(text).context("parsing configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let n = self.channels.len();
        if n == 0 || n > MAX_CHANNELS {
            bail!("Configuration must define between 1 and {MAX_CHANNELS} channels, found {n}");
        }
        for ch in &self.channels {
            if ch.tolerance.is_nan() || ch.tolerance <= 0.0 {
                bail!("Channel '{}': tolerance must be positive", ch.name);
            }
            if ch.adev_reference == 0.0 {
                bail!("Channel '{}': adev_reference must not be zero", ch.name);
            }
            if let Some(c) = &ch.color {
                if color::parse_hex(c).is_none() {
                    bail!("Channel '{}': invalid colour '{c}'", ch.name);
                }
            }
        }
        if self.config.taus_per_decade == 0 {
            bail!("taus_per_decade must be at least 1");
        }
        Ok(())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn baselines(&self) -> Vec<f64> {
        self.channels.iter().map(|c| c.baseline.to_f64()).collect()
    }

    pub fn tolerances(&self) -> Vec<f64> {
        self.channels.iter().map(|c| c.tolerance).collect()
    }

    pub fn critical(&self) -> Vec<bool> {
        self.channels.iter().map(|c| c.critical).collect()
    }

    pub fn filter_params(&self) -> FilterParams {
        FilterParams {
            overhang: Overhang {
                forward: self.config.forward_overhang,
                backward: self.config.backward_overhang,
            },
            outlier_threshold: self.config.outlier_threshold,
            ..FilterParams::default()
        }
    }

    /// Configured channel colours, falling back to the default palette.
    pub fn channel_colors(&self) -> Vec<Color> {
        resolve_colors(self.channels.iter().map(|c| c.color.as_deref()))
    }

    pub fn evaluation_colors(&self) -> Vec<Color> {
        resolve_colors(self.evaluations.iter().map(|e| e.color.as_deref()))
    }
}

fn resolve_colors<'a>(configured: impl ExactSizeIterator<Item = Option<&'a str>>) -> Vec<Color> {
    let defaults = color::series_palette(configured.len());
    configured
        .zip(defaults)
        .map(|(c, fallback)| c.and_then(color::parse_hex).unwrap_or(fallback))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r##"
[config]
ceo_channel = -1
rep_channel = 2
outlier_threshold = 4.5
forward_overhang = 8

[[channel]]
name = "f_CEO"
color = "#277694"
baseline = 20000000
tolerance = 500.0
filter = true

[[channel]]
name = "f_rep"
baseline = "250000000.000000001"
filter = true

[[channel]]
name = "Sr beat"
baseline = 80000000

[[evaluation]]
name = "Sr"
type = "absolute"
main_comb_line = 1716882
main_beat_channel = -3
main_reference = "429228004229873.0"
main_sys_unc = "0.001"

[[evaluation]]
name = "Sr/In"
type = "ratio"
multiplier = 4
main_comb_line = 1716882
main_beat_channel = 3
main_reference = "429228004229873.0"
ref_comb_line = 1267402
ref_beat_channel = 3
ref_reference = "1267402452901041.3"
"##;

    #[test]
    fn test_parse_full_config() {
        let config = AnalysisConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.channel_count(), 3);
        assert_eq!(config.config.ceo_channel, Some(-1));
        assert_eq!(config.config.forward_overhang, 8);
        assert_eq!(config.config.backward_overhang, 1);
        assert!(config.channels[0].critical);
        assert!(!config.channels[2].critical);
        assert_eq!(
            config.channels[1].baseline,
            "250000000.000000001".parse::<Exact>().unwrap()
        );
        assert_eq!(config.channels[2].tolerance, 1000.0);

        match &config.evaluations[0].kind {
            EvaluationKind::Absolute(abs) => {
                assert_eq!(abs.main_beat_channel, -3);
                assert_eq!(abs.ref_comb_line, Exact::one());
            }
            other => panic!("expected absolute evaluation, got {other:?}"),
        }
        assert!(matches!(config.evaluations[1].kind, EvaluationKind::Ratio(_)));
        assert_eq!(config.evaluations[1].multiplier, Exact::from(4));
    }

    #[test]
    fn test_float_literal_for_exact_quantity_is_refused() {
        let text = r#"
[[channel]]
name = "a"
baseline = 1.5
"#;
        let err = AnalysisConfig::from_toml_str(text).unwrap_err();
        assert!(format!("{err:#}").contains("floating-point"));
    }

    #[test]
    fn test_channel_colours_fall_back_to_palette() {
        let config = AnalysisConfig::from_toml_str(SAMPLE).unwrap();
        let colors = config.channel_colors();
        assert_eq!(colors[0], color::SEA);
        assert_eq!(colors[1], color::PURPLE);
    }

    #[test]
    fn test_empty_channel_list_rejected() {
        assert!(AnalysisConfig::from_toml_str("[config]\n").is_err());
    }
}
