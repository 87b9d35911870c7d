//! Small numeric helpers shared across the statistical engines.

/// Arithmetic mean. Returns `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Unbiased sample variance (ddof = 1). Returns `None` below 2 samples.
pub fn sample_variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    Some(ss / (values.len() - 1) as f64)
}

/// Unbiased sample standard deviation.
pub fn sample_std(values: &[f64]) -> Option<f64> {
    sample_variance(values).map(f64::sqrt)
}

/// Unbiased sample covariance of two equal-length slices (ddof = 1).
pub fn sample_covariance(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let mx = mean(x)?;
    let my = mean(y)?;
    let s: f64 = x.iter().zip(y).map(|(a, b)| (a - mx) * (b - my)).sum();
    Some(s / (x.len() - 1) as f64)
}

/// Median of a slice. Returns `None` for an empty slice.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    if n % 2 == 1 {
        Some(sorted[n / 2])
    } else {
        Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0)
    }
}

/// Linearly interpolated percentile, `q` in [0, 1].
///
/// Returns `None` for an empty slice or `q` outside [0, 1].
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=1.0).contains(&q) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        Some(sorted[lo])
    } else {
        let frac = pos - lo as f64;
        Some(sorted[lo] * (1.0 - frac) + sorted[hi] * frac)
    }
}

/// Newey–West long-run variance with Bartlett weights.
///
/// Heteroskedasticity- and autocorrelation-consistent variance of the mean's
/// building blocks: `gamma_0 + 2 * sum_{L=1..lag} (1 - L/(lag+1)) * gamma_L`
/// where `gamma_L` is the lag-`L` sample autocovariance. Used to standardize
/// event-aligned signature statistics whose samples are serially correlated.
///
/// Returns `None` below 2 samples.
pub fn newey_west_variance(u: &[f64], lag: usize) -> Option<f64> {
    let gamma0 = sample_variance(u)?;
    let mut var = gamma0;
    for l in 1..=lag {
        if l >= u.len() {
            break;
        }
        let w = 1.0 - l as f64 / (lag as f64 + 1.0);
        if let Some(cov) = sample_covariance(&u[l..], &u[..u.len() - l]) {
            var += 2.0 * w * cov;
        }
    }
    Some(var)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_variance() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(mean(&v), Some(2.5));
        let var = sample_variance(&v).unwrap();
        assert!((var - 5.0 / 3.0).abs() < 1e-12);
        assert!(mean(&[]).is_none());
        assert!(sample_variance(&[1.0]).is_none());
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert!(median(&[]).is_none());
    }

    #[test]
    fn test_percentile_interpolates() {
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&v, 0.0), Some(1.0));
        assert_eq!(percentile(&v, 1.0), Some(5.0));
        assert_eq!(percentile(&v, 0.5), Some(3.0));
        assert_eq!(percentile(&v, 0.25), Some(2.0));
        assert!(percentile(&v, 1.5).is_none());
    }

    #[test]
    fn test_newey_west_iid_close_to_plain_variance() {
        // For white noise the correction terms are small relative to gamma0.
        let u: Vec<f64> = (0..200)
            .map(|i| if i % 2 == 0 { 1.0 } else { -1.0 } * ((i % 7) as f64 - 3.0))
            .collect();
        let plain = sample_variance(&u).unwrap();
        let nw = newey_west_variance(&u, 5).unwrap();
        assert!(nw > 0.0);
        assert!((nw - plain).abs() / plain < 1.0);
    }

    #[test]
    fn test_newey_west_positively_autocorrelated_inflates() {
        // A slowly varying series has positive autocovariances, so the
        // long-run variance must exceed the plain sample variance.
        let u: Vec<f64> = (0..300).map(|i| (i as f64 / 25.0).sin()).collect();
        let plain = sample_variance(&u).unwrap();
        let nw = newey_west_variance(&u, 5).unwrap();
        assert!(nw > plain);
    }
}
