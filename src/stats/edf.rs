//! Equivalent degrees of freedom of the overlapping Allan variance.
//!
//! Greenhall's algorithm ("Uncertainty of stability variances based on
//! finite differences", 2003), restricted to white frequency noise
//! (alpha = 0), second differences (d = 2) and the unmodified, fully
//! overlapped estimator (F = S = m).

use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Probability mass inside one standard deviation of a normal distribution.
pub const ONE_SIGMA: f64 = 0.682_689_492_137_085_85;

const J_MAX: usize = 100;

/// Asymptotic coefficients `(a0, a1)` of `1/edf = (a0 - a1/r) / r`, the
/// integrals of the squared and |t|-weighted squared autocorrelation of the
/// overlapped estimates.
const ASYMPTOTIC: (f64, f64) = (2.0 / 3.0, 1.0 / 3.0);

fn sw(t: f64) -> f64 {
    t.abs().powi(3)
}

fn sx(t: f64, f: f64) -> f64 {
    f * f * (2.0 * sw(t) - sw(t - 1.0 / f) - sw(t + 1.0 / f))
}

fn sz(t: f64, f: f64) -> f64 {
    6.0 * sx(t, f) - 4.0 * (sx(t - 1.0, f) + sx(t + 1.0, f)) + sx(t - 2.0, f) + sx(t + 2.0, f)
}

fn basic_sum(j: usize, m: f64, s: f64, f: f64) -> f64 {
    let jf = j as f64;
    let mut sum = sz(0.0, f).powi(2) + (1.0 - jf / m) * sz(jf / s, f).powi(2);
    for i in 1..j {
        let i = i as f64;
        sum += 2.0 * (1.0 - i / m) * sz(i / s, f).powi(2);
    }
    sum
}

/// EDF for averaging factor `m` over `n` frequency samples. Not finite when
/// `n < 2m + 1`.
pub fn greenhall_edf(m: usize, n: usize) -> f64 {
    if m == 0 || n < 2 * m + 1 {
        return f64::NAN;
    }
    let mf = m as f64;
    let big_m = (n - 2 * m) as f64;
    let j = (n - 2 * m).min(3 * m);
    let r = big_m / mf;

    let inv_edf = if j <= J_MAX {
        basic_sum(j, big_m, mf, mf) / (sz(0.0, mf).powi(2) * big_m)
    } else if r > 3.0 {
        let (a0, a1) = ASYMPTOTIC;
        (a0 - a1 / r) / r
    } else {
        let m_prime = J_MAX as f64 / r;
        basic_sum(J_MAX, J_MAX as f64, m_prime, m_prime)
            / (sz(0.0, m_prime).powi(2) * J_MAX as f64)
    };
    1.0 / inv_edf
}

/// Two-sided chi-squared interval `(lower, upper)` around `dev` holding
/// probability `ci`. Returns `None` for an unusable `edf`.
pub fn confidence_interval(dev: f64, ci: f64, edf: f64) -> Option<(f64, f64)> {
    if !edf.is_finite() || edf <= 0.0 {
        return None;
    }
    let chi2 = ChiSquared::new(edf).ok()?;
    let tail = (1.0 - ci) / 2.0;
    let chi2_low = chi2.inverse_cdf(tail);
    let chi2_high = chi2.inverse_cdf(1.0 - tail);
    let lower = dev * (edf / chi2_high).sqrt();
    let upper = dev * (edf / chi2_low).sqrt();
    (lower.is_finite() && upper.is_finite()).then_some((lower, upper))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_edf_short_series() {
        assert!(greenhall_edf(1, 2).is_nan());
        assert!(greenhall_edf(0, 100).is_nan());
        let edf = greenhall_edf(1, 10);
        assert_relative_eq!(edf, 6.471_910_112_359_55, max_relative = 1e-9);
    }

    #[test]
    fn test_edf_shrinks_with_averaging_factor() {
        let n = 1000;
        let edfs: Vec<f64> = [1, 2, 5, 10, 50, 100, 300, 400]
            .iter()
            .map(|&m| greenhall_edf(m, n))
            .collect();
        assert!(edfs.windows(2).all(|w| w[1] < w[0]), "{edfs:?}");
        assert!(edfs.iter().all(|e| e.is_finite() && *e > 0.0));
    }

    #[test]
    fn test_edf_branches_join_up() {
        // J crosses J_MAX between m = 33 and m = 34
        let direct = greenhall_edf(33, 100_000);
        let asymptotic = greenhall_edf(34, 100_000);
        assert_relative_eq!(direct, 4411.548_860_384_21, max_relative = 1e-6);
        assert_relative_eq!(direct * 33.0 / 34.0, asymptotic, max_relative = 0.05);

        // r crosses 3 between (50, 250) and (51, 256)
        let rescaled = greenhall_edf(50, 250);
        let asymptotic = greenhall_edf(51, 256);
        assert_relative_eq!(rescaled, asymptotic, max_relative = 0.05);
    }

    #[test]
    fn test_confidence_interval_brackets_deviation() {
        let (lo, hi) = confidence_interval(1.0, ONE_SIGMA, 100.0).unwrap();
        assert!(lo < 1.0 && hi > 1.0);
        // Wilson-Hilferty: chi2 quantiles 114.09 and 85.91 at 100 dof
        assert_relative_eq!(lo, 0.9362, epsilon = 0.003);
        assert_relative_eq!(hi, 1.0789, epsilon = 0.003);
        assert!(confidence_interval(1.0, ONE_SIGMA, f64::NAN).is_none());
        assert!(confidence_interval(1.0, ONE_SIGMA, 0.0).is_none());
    }
}
