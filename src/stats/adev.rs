use log::{debug, warn};
use serde::Serialize;

use super::edf::{confidence_interval, greenhall_edf, ONE_SIGMA};

/// Largest averaging factor of a tau grid.
const MAX_FACTOR: f64 = 1e9;

/// Stand-in for zero deviations on logarithmic axes.
pub const LOG_FLOOR: f64 = 1e-19;

/// Relative deviation of an achieved tau from the requested one that is
/// reported.
const TAU_TOLERANCE: f64 = 1e-4;

// ---------------------------------------------------------------------------
// Tau grid
// ---------------------------------------------------------------------------

/// Averaging times shared by every curve of one dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TauGrid {
    pub tau0: f64,
    /// Distinct integer averaging factors, ascending.
    pub factors: Vec<usize>,
}

impl TauGrid {
    /// Integer factors roughly `taus_per_decade` per decade, from 1 up to
    /// 1e9 samples.
    pub fn new(tau0: f64, taus_per_decade: usize) -> Self {
        let per_decade = taus_per_decade.max(1) as f64;
        let mut factors = vec![1usize];
        let mut k = 1;
        loop {
            let real = 10f64.powf(k as f64 / per_decade);
            if real > MAX_FACTOR * (1.0 + 1e-12) {
                break;
            }
            let factor = (real + 1e-9).floor() as usize;
            if factors.last().is_some_and(|&last| factor > last) {
                factors.push(factor);
            }
            k += 1;
        }
        Self { tau0, factors }
    }

    pub fn taus(&self) -> Vec<f64> {
        self.factors.iter().map(|&m| m as f64 * self.tau0).collect()
    }
}

// ---------------------------------------------------------------------------
// Allan deviation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AdevPoint {
    pub tau: f64,
    pub m: usize,
    pub dev: f64,
    pub edf: f64,
    /// Lower and upper one-sigma bounds of `dev`.
    pub lower: f64,
    pub upper: f64,
}

/// Allan deviation of one series, with fractional and log views relative
/// to `reference`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AdevCurve {
    pub reference: f64,
    pub points: Vec<AdevPoint>,
}

/// Log10 view for plotting; `top`/`bottom` are error-bar lengths.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LogPoint {
    pub tau: f64,
    pub dev: f64,
    pub top: f64,
    pub bottom: f64,
}

impl AdevCurve {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn taus(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.tau).collect()
    }

    pub fn devs(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.dev).collect()
    }

    pub fn frac_devs(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.dev / self.reference).collect()
    }

    pub fn frac_bounds(&self) -> Vec<(f64, f64)> {
        self.points
            .iter()
            .map(|p| (p.lower / self.reference, p.upper / self.reference))
            .collect()
    }

    pub fn log_points(&self) -> Vec<LogPoint> {
        let scale = self.reference.abs();
        let log = |v: f64| (v / scale).max(LOG_FLOOR).log10();
        self.points
            .iter()
            .map(|p| {
                let dev = log(p.dev);
                LogPoint {
                    tau: p.tau.log10(),
                    dev,
                    top: log(p.upper) - dev,
                    bottom: dev - log(p.lower),
                }
            })
            .collect()
    }

    /// Statistical uncertainty over a measurement of length `span`,
    /// extrapolated as white frequency noise from the largest tau not
    /// exceeding `span / 4` (the first tau if none qualifies).
    pub fn extrapolate(&self, span: f64) -> Option<f64> {
        let point = self
            .points
            .iter()
            .rev()
            .find(|p| p.tau <= span / 4.0)
            .or_else(|| self.points.first())?;
        if span <= 0.0 {
            return Some(point.dev);
        }
        Some(point.dev * (point.tau / span).sqrt())
    }
}

/// Overlapping Allan deviation of frequency samples `values` (spacing
/// `tau0`) at averaging factor `m`. `None` when the series is too short.
pub fn overlapping_adev(values: &[f64], tau0: f64, m: usize) -> Option<f64> {
    let n = values.len();
    if m == 0 || n < 2 * m + 1 {
        return None;
    }
    // phase, n + 1 samples
    let mut phase = Vec::with_capacity(n + 1);
    phase.push(0.0);
    let mut x = 0.0;
    for &y in values {
        x += y * tau0;
        phase.push(x);
    }

    let terms = n + 1 - 2 * m;
    let sum: f64 = (0..terms)
        .map(|i| (phase[i + 2 * m] - 2.0 * phase[i + m] + phase[i]).powi(2))
        .sum();
    let mf = m as f64;
    let var = sum / (2.0 * mf * mf * tau0 * tau0 * terms as f64);
    Some(var.sqrt())
}

/// Allan deviation of `values` at each of `taus`, with one-sigma
/// confidence bounds for white frequency noise. Taus that need more than
/// `(n - 1) / 2` samples per average are dropped.
pub fn allan_deviation(values: &[f64], tau0: f64, taus: &[f64], reference: f64) -> AdevCurve {
    let n = values.len();
    let mut points: Vec<AdevPoint> = Vec::new();
    for &requested in taus {
        let m = (requested / tau0).round().max(1.0) as usize;
        if n < 3 || m > (n - 1) / 2 {
            break;
        }
        if points.last().is_some_and(|p| p.m == m) {
            continue;
        }
        let tau = m as f64 * tau0;
        if ((tau - requested) / requested).abs() > TAU_TOLERANCE {
            warn!("Tau value differs from request: {tau} != {requested}");
        }
        let Some(dev) = overlapping_adev(values, tau0, m) else {
            break;
        };
        let edf = greenhall_edf(m, n);
        let (lower, upper) = confidence_interval(dev, ONE_SIGMA, edf).unwrap_or_else(|| {
            debug!("No confidence interval at tau {tau} (edf {edf})");
            (dev, dev)
        });
        points.push(AdevPoint {
            tau,
            m,
            dev,
            edf,
            lower,
            upper,
        });
    }
    AdevCurve { reference, points }
}
