//! Absolute frequencies and frequency ratios from comb measurements.
//!
//! The nominal part of every quantity is computed from configuration
//! decimals in [`BigDecimal`]; only the small measured deviations pass
//! through `f64`. Adding a float mean of a few hertz to a 4e14 Hz baseline
//! would otherwise cost digits that the final result needs.

use std::collections::BTreeMap;
use std::str::FromStr;

use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use log::{debug, info, warn};
use serde::Serialize;

use crate::config::{AbsoluteConfig, AnalysisConfig, EvaluationConfig, EvaluationKind, RatioConfig};
use crate::data::model::{mean, SampleTable};
use crate::error::EvalError;
use crate::stats::{allan_deviation, AdevCurve, TauGrid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationType {
    Absolute,
    Ratio,
}

/// Decimal constants and float coefficients of one evaluation, independent
/// of the measured data.
#[derive(Debug, Clone, PartialEq)]
pub struct Combination {
    pub kind: EvaluationType,
    /// Value of the evaluation for zero measured deviations.
    pub baseline: BigDecimal,
    /// `M * n_a / n_b` for ratios.
    pub line_ratio: Option<BigDecimal>,
    pub target: BigDecimal,
    pub sys_cor: BigDecimal,
    pub sys_unc: BigDecimal,
    /// `(channel index, coefficient)` of the linearized relative series.
    pub terms: Vec<(usize, f64)>,
}

impl Combination {
    pub fn channels(&self) -> Vec<usize> {
        self.terms.iter().map(|&(ch, _)| ch).collect()
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationResult {
    pub name: String,
    pub combination: Combination,
    pub good_points: usize,
    pub mean_time: Option<f64>,
    /// Mean of the relative series (same unit as the result).
    pub mean_relative: Option<f64>,
    pub result: BigDecimal,
    /// `(result - target) / result`
    pub frac_dev: f64,
    pub stat_unc: Option<f64>,
    /// `sqrt(sys_unc^2 + stat_unc^2) / result`
    pub frac_unc: f64,
    pub times: Vec<f64>,
    pub relative: Vec<f64>,
    pub adev: AdevCurve,
    pub warning: Option<String>,
}

// ---------------------------------------------------------------------------
// FrequencyEvaluator
// ---------------------------------------------------------------------------

pub struct FrequencyEvaluator<'a> {
    config: &'a AnalysisConfig,
    grid: &'a TauGrid,
}

impl<'a> FrequencyEvaluator<'a> {
    pub fn new(config: &'a AnalysisConfig, grid: &'a TauGrid) -> Self {
        Self { config, grid }
    }

    /// Build the decimal constants and series coefficients of `eval`.
    pub fn combination(&self, eval: &EvaluationConfig) -> Result<Combination, EvalError> {
        match &eval.kind {
            EvaluationKind::Absolute(abs) => self.absolute(eval, abs),
            EvaluationKind::Ratio(ratio) => self.ratio(eval, ratio),
        }
    }

    fn absolute(
        &self,
        eval: &EvaluationConfig,
        cfg: &AbsoluteConfig,
    ) -> Result<Combination, EvalError> {
        let name = &eval.name;
        let (ceo, s_ceo, rep) = self.comb_channels(name)?;
        let (beat, s_beat) = self.channel(name, cfg.main_beat_channel)?;
        let n_a = &cfg.main_comb_line.0;
        let n_rep = &cfg.ref_comb_line.0;
        if n_rep.is_zero() {
            return Err(zero(name, "ref_comb_line"));
        }
        let m = &eval.multiplier.0;

        let f = |ch: usize| self.config.channels[ch].nominal_frequency();
        let sign = |s: i32| BigDecimal::from(s);
        let rep_part = n_a * f(rep) / n_rep;
        let baseline = m * (sign(s_ceo) * f(ceo) + rep_part + sign(s_beat) * f(beat));

        let mf = to_f64(m);
        let line = to_f64(n_a) / to_f64(n_rep);
        let terms = merge_terms([
            (ceo, mf * s_ceo as f64),
            (rep, mf * line),
            (beat, mf * s_beat as f64),
        ]);

        Ok(Combination {
            kind: EvaluationType::Absolute,
            baseline,
            line_ratio: None,
            target: cfg.main_reference.0.clone(),
            sys_cor: cfg.main_sys_cor.0.clone(),
            sys_unc: cfg.main_sys_unc.0.clone(),
            terms,
        })
    }

    fn ratio(&self, eval: &EvaluationConfig, cfg: &RatioConfig) -> Result<Combination, EvalError> {
        let name = &eval.name;
        let (ceo, s_ceo, rep) = self.comb_channels(name)?;
        let (a, s_a) = self.channel(name, cfg.main_beat_channel)?;
        let (b, s_b) = self.channel(name, cfg.ref_beat_channel)?;
        let n_a = &cfg.main_comb_line.0;
        let n_b = &cfg.ref_comb_line.0;
        let ref_a = &cfg.main_reference.0;
        let ref_b = &cfg.ref_reference.0;
        for (value, what) in [
            (n_b, "ref_comb_line"),
            (ref_a, "main_reference"),
            (ref_b, "ref_reference"),
        ] {
            if value.is_zero() {
                return Err(zero(name, what));
            }
        }
        let m = &eval.multiplier.0;

        let f = |ch: usize| self.config.channels[ch].nominal_frequency();
        let sign = |s: i32| BigDecimal::from(s);
        let f_rep = f(rep);
        let ceo_part = sign(s_ceo) * f(ceo);
        let big_a = n_a * &f_rep + &ceo_part + sign(s_a) * f(a);
        let big_b = n_b * &f_rep + &ceo_part + sign(s_b) * f(b);
        if big_b.is_zero() {
            return Err(zero(name, "reference optical frequency"));
        }
        let baseline = m * &big_a / &big_b;
        let line_ratio = m * n_a / n_b;

        let target = ref_a / ref_b;
        let rel_a = &cfg.main_sys_unc.0 / ref_a;
        let rel_b = &cfg.ref_sys_unc.0 / ref_b;
        let sys_cor = &target * (&cfg.main_sys_cor.0 / ref_a - &cfg.ref_sys_cor.0 / ref_b);
        let sys_unc = &target * (&rel_a * &rel_a + &rel_b * &rel_b).sqrt().unwrap_or_default();

        // first order in the deviations: M * (dA - q dB) / B
        let mf = to_f64(m);
        let bf = to_f64(&big_b);
        let q = to_f64(&(&big_a / &big_b));
        let terms = merge_terms([
            (rep, mf * (to_f64(n_a) - q * to_f64(n_b)) / bf),
            (ceo, mf * s_ceo as f64 * (1.0 - q) / bf),
            (a, mf * s_a as f64 / bf),
            (b, -mf * q * s_b as f64 / bf),
        ]);

        Ok(Combination {
            kind: EvaluationType::Ratio,
            baseline,
            line_ratio: Some(line_ratio),
            target,
            sys_cor,
            sys_unc,
            terms,
        })
    }

    fn comb_channels(&self, name: &str) -> Result<(usize, i32, usize), EvalError> {
        let general = &self.config.config;
        let (Some(ceo), Some(rep)) = (general.ceo_channel, general.rep_channel) else {
            return Err(EvalError::MissingCombChannels(name.to_string()));
        };
        let (ceo, s_ceo) = self.channel(name, ceo)?;
        let (rep, _) = self.channel(name, rep)?;
        Ok((ceo, s_ceo, rep))
    }

    /// Index and sign of a 1-based signed channel number.
    fn channel(&self, name: &str, channel: i32) -> Result<(usize, i32), EvalError> {
        if channel == 0 {
            return Err(EvalError::ZeroChannel(name.to_string()));
        }
        let number = channel.unsigned_abs() as usize;
        let channels = self.config.channel_count();
        if number > channels {
            return Err(EvalError::ChannelOutOfRange {
                name: name.to_string(),
                channel: number,
                channels,
            });
        }
        Ok((number - 1, channel.signum()))
    }

    /// Evaluate `eval` on the current good points of `table`.
    pub fn evaluate(
        &self,
        table: &mut SampleTable,
        eval: &EvaluationConfig,
    ) -> Result<EvaluationResult, EvalError> {
        let combination = self.combination(eval)?;
        let good = table.good_points(&combination.channels())?;
        let relative = good.combine(&combination.terms);
        let mean_relative = mean(&relative);
        let mean_time = mean(&good.times);
        let target_f = to_f64(&combination.target);

        let mut warning = None;
        let mut result = &combination.baseline + &combination.sys_cor;
        let mut stat_unc = None;
        let adev;
        match mean_relative.and_then(|v| decimal(v).map(|d| (v, d))) {
            Some((rel, rel_dec)) => {
                result += rel_dec;
                if (rel / target_f).abs() > self.config.config.relative_tolerance {
                    let msg = format!(
                        "relative term {rel:.6e} is large compared to target {target_f:.6e}; \
                         check the nominal frequencies"
                    );
                    warn!("Evaluation '{}': {msg}", eval.name);
                    warning = Some(msg);
                }
                adev = allan_deviation(&relative, self.grid.tau0, &self.grid.taus(), target_f);
                stat_unc = adev.extrapolate(relative.len() as f64 * self.grid.tau0);
            }
            None => {
                let msg = "no good data points".to_string();
                warn!("Evaluation '{}': {msg}", eval.name);
                warning = Some(msg);
                adev = AdevCurve {
                    reference: target_f,
                    points: Vec::new(),
                };
            }
        }

        let frac_dev = if result.is_zero() {
            f64::NAN
        } else {
            to_f64(&((&result - &combination.target) / &result))
        };
        let frac_unc = fractional_uncertainty(&combination.sys_unc, stat_unc, &result);
        info!(
            "Evaluation '{}': {} from {} points (frac. dev. {frac_dev:.3e} ± {frac_unc:.3e})",
            eval.name,
            result,
            good.len()
        );

        Ok(EvaluationResult {
            name: eval.name.clone(),
            combination,
            good_points: good.len(),
            mean_time,
            mean_relative,
            result,
            frac_dev,
            stat_unc,
            frac_unc,
            times: good.times.clone(),
            relative,
            adev,
            warning,
        })
    }
}

fn zero(name: &str, what: &'static str) -> EvalError {
    EvalError::Zero {
        name: name.to_string(),
        what,
    }
}

/// Coefficients of repeated channels add up.
fn merge_terms<const N: usize>(terms: [(usize, f64); N]) -> Vec<(usize, f64)> {
    let mut merged: BTreeMap<usize, f64> = BTreeMap::new();
    for (ch, c) in terms {
        *merged.entry(ch).or_default() += c;
    }
    debug!("Series coefficients: {merged:?}");
    merged.into_iter().collect()
}

/// `sqrt(sys_unc^2 + stat_unc^2) / result`, in decimal. NaN for a zero
/// result.
fn fractional_uncertainty(
    sys_unc: &BigDecimal,
    stat_unc: Option<f64>,
    result: &BigDecimal,
) -> f64 {
    if result.is_zero() {
        return f64::NAN;
    }
    let stat = stat_unc.and_then(decimal).unwrap_or_else(BigDecimal::zero);
    let total = (sys_unc * sys_unc + &stat * &stat)
        .sqrt()
        .unwrap_or_else(BigDecimal::zero);
    to_f64(&(total / result))
}

fn to_f64(value: &BigDecimal) -> f64 {
    value.to_f64().unwrap_or(f64::NAN)
}

/// Shortest decimal that reads back as `value`.
fn decimal(value: f64) -> Option<BigDecimal> {
    if !value.is_finite() {
        return None;
    }
    BigDecimal::from_str(&value.to_string()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::tests::rows;
    use approx::assert_relative_eq;

    const CONFIG: &str = r#"
[config]
ceo_channel = 1
rep_channel = 2

[[channel]]
name = "ceo"
baseline = 20000000

[[channel]]
name = "rep"
baseline = "250000000.000000001"

[[channel]]
name = "beat"
baseline = 0

[[evaluation]]
name = "line"
type = "absolute"
main_comb_line = 1000000
main_beat_channel = 3
main_reference = "250000020000000"
main_sys_unc = "0.25"
"#;

    fn table(values: Vec<Vec<f64>>, baselines: &[f64]) -> SampleTable {
        SampleTable::load(rows(0.0, &values), baselines).unwrap()
    }

    fn exact(s: &str) -> BigDecimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_absolute_keeps_decimal_digits() {
        let config = AnalysisConfig::from_toml_str(CONFIG).unwrap();
        let grid = TauGrid::new(1.0, 10);
        let evaluator = FrequencyEvaluator::new(&config, &grid);
        // readings at the nominal frequencies, nothing subtracted
        let mut t = table(vec![vec![0.0; 3]; 10], &[0.0; 3]);

        let res = evaluator.evaluate(&mut t, &config.evaluations[0]).unwrap();
        assert_eq!(res.result, exact("250000020000000.001"));
        assert_eq!(res.good_points, 10);
        assert!(res.warning.is_none());
        assert_eq!(res.combination.terms, vec![(0, 1.0), (1, 1e6), (2, 1.0)]);

        // the same sum in f64 loses the last digit
        let float = 2e7 + 1e6 * 250_000_000.000_000_001_f64;
        assert_ne!(decimal(float).unwrap(), res.result);

        assert_relative_eq!(res.frac_dev, 0.001 / 250_000_020_000_000.001, max_relative = 1e-9);
        assert_relative_eq!(res.frac_unc, 1e-15, max_relative = 1e-3);
    }

    #[test]
    fn test_fractional_uncertainty_in_quadrature() {
        let result = exact("1000000000000000");
        let frac = fractional_uncertainty(&exact("3"), Some(4.0), &result);
        assert_relative_eq!(frac, 5e-15, max_relative = 1e-12);
        let frac = fractional_uncertainty(&exact("0.25"), None, &exact("250000020000000.001"));
        assert_relative_eq!(frac, 0.25 / 250_000_020_000_000.001, max_relative = 1e-12);
        assert!(fractional_uncertainty(&exact("1"), Some(1.0), &BigDecimal::zero()).is_nan());
    }

    #[test]
    fn test_absolute_relative_series_and_warning() {
        let config = AnalysisConfig::from_toml_str(CONFIG).unwrap();
        let grid = TauGrid::new(1.0, 10);
        let evaluator = FrequencyEvaluator::new(&config, &grid);

        // 2 mHz on the repetition rate is 2 kHz at line 1e6
        let values: Vec<Vec<f64>> = (0..50).map(|_| vec![1.0, 0.002, -3.0]).collect();
        let mut t = table(values, &[0.0, 0.0, 0.0]);
        let res = evaluator.evaluate(&mut t, &config.evaluations[0]).unwrap();
        let rel = res.mean_relative.unwrap();
        assert_relative_eq!(rel, 1.0 + 2000.0 - 3.0, max_relative = 1e-12);
        assert!(res.warning.is_none());
        assert_eq!(res.relative.len(), 50);

        let values: Vec<Vec<f64>> = (0..50).map(|_| vec![0.0, 0.0, 5e7]).collect();
        let mut t = table(values, &[0.0, 0.0, 0.0]);
        let res = evaluator.evaluate(&mut t, &config.evaluations[0]).unwrap();
        assert!(res.warning.unwrap().contains("relative term"));
    }

    #[test]
    fn test_no_good_points_is_a_warning() {
        let config = AnalysisConfig::from_toml_str(CONFIG).unwrap();
        let grid = TauGrid::new(1.0, 10);
        let evaluator = FrequencyEvaluator::new(&config, &grid);
        let mut t = table(vec![vec![0.0; 3]; 5], &[0.0; 3]);
        for s in t.samples_mut() {
            s.flags.add_mask(0b100);
        }
        let res = evaluator.evaluate(&mut t, &config.evaluations[0]).unwrap();
        assert_eq!(res.good_points, 0);
        assert!(res.mean_relative.is_none());
        assert!(res.adev.is_empty());
        assert_eq!(res.warning.as_deref(), Some("no good data points"));
        assert_eq!(res.result, res.combination.baseline);
    }

    #[test]
    fn test_ratio_baseline_and_coefficients() {
        let text = r#"
[config]
ceo_channel = 1
rep_channel = 2

[[channel]]
name = "ceo"
baseline = 20000000
[[channel]]
name = "rep"
baseline = 100000000
[[channel]]
name = "a"
baseline = 30000000
[[channel]]
name = "b"
baseline = 40000000

[[evaluation]]
name = "a/b"
type = "ratio"
main_comb_line = 3000
main_beat_channel = 3
main_reference = "300050000000"
main_sys_unc = "3.0005"
ref_comb_line = 2000
ref_beat_channel = -4
ref_reference = "199980000000"
"#;
        let config = AnalysisConfig::from_toml_str(text).unwrap();
        let grid = TauGrid::new(1.0, 10);
        let evaluator = FrequencyEvaluator::new(&config, &grid);
        let comb = evaluator.combination(&config.evaluations[0]).unwrap();

        // A = 3000 * 1e8 + 2e7 + 3e7, B = 2000 * 1e8 + 2e7 - 4e7
        let expected = exact("300050000000") / exact("199980000000");
        assert_eq!(comb.baseline, expected);
        assert_eq!(comb.target, expected);
        assert_eq!(comb.line_ratio, Some(exact("1.5")));
        assert_eq!(comb.sys_cor, BigDecimal::zero());
        assert_relative_eq!(to_f64(&comb.sys_unc), to_f64(&expected) * 1e-11, max_relative = 1e-9);

        // one hertz on beat a moves the ratio by exactly 1/B
        let values: Vec<Vec<f64>> = (0..20).map(|_| vec![0.0, 0.0, 1.0, 0.0]).collect();
        let mut t = table(values, &[0.0; 4]);
        let res = evaluator.evaluate(&mut t, &config.evaluations[0]).unwrap();
        assert_relative_eq!(res.mean_relative.unwrap(), 1.0 / 199_980_000_000.0, max_relative = 1e-12);

        // a ratio is invariant under a common scaling, so the ceo and rep
        // coefficients cancel along (dA, dB) proportional to (A, B)
        let q = 300_050_000_000.0 / 199_980_000_000.0;
        let coef: BTreeMap<usize, f64> = comb.terms.iter().copied().collect();
        let b = 199_980_000_000.0;
        assert_relative_eq!(coef[&2], 1.0 / b, max_relative = 1e-12);
        assert_relative_eq!(coef[&3], q / b, max_relative = 1e-12);
        assert_relative_eq!(coef[&1], (3000.0 - q * 2000.0) / b, max_relative = 1e-9);
    }

    #[test]
    fn test_channel_numbers_are_checked() {
        let config = AnalysisConfig::from_toml_str(CONFIG).unwrap();
        let grid = TauGrid::new(1.0, 10);
        let evaluator = FrequencyEvaluator::new(&config, &grid);

        let mut eval = config.evaluations[0].clone();
        if let EvaluationKind::Absolute(abs) = &mut eval.kind {
            abs.main_beat_channel = 0;
        }
        assert!(matches!(evaluator.combination(&eval), Err(EvalError::ZeroChannel(_))));

        if let EvaluationKind::Absolute(abs) = &mut eval.kind {
            abs.main_beat_channel = -5;
        }
        assert!(matches!(
            evaluator.combination(&eval),
            Err(EvalError::ChannelOutOfRange { channel: 5, channels: 3, .. })
        ));

        let mut no_comb = config.clone();
        no_comb.config.rep_channel = None;
        let evaluator = FrequencyEvaluator::new(&no_comb, &grid);
        assert!(matches!(
            evaluator.combination(&config.evaluations[0]),
            Err(EvalError::MissingCombChannels(_))
        ));
    }
}
