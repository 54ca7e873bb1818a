//! Descriptive statistics used across judges, aggregation and uncertainty.
//!
//! All functions are total: empty inputs return a documented neutral value
//! instead of NaN.

/// Arithmetic mean. Returns 0.0 for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Median. The two middle values are averaged for even-length input.
/// Returns 0.0 for an empty slice.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Population variance (divides by n).
pub fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> f64 {
    variance(values).sqrt()
}

/// `1 - stdev`, clamped into [0, 1]. Higher means the values agree.
pub fn agreement(values: &[f64]) -> f64 {
    (1.0 - std_dev(values)).clamp(0.0, 1.0)
}

/// Percentile of already sorted data with linear interpolation between
/// closest ranks. `q` is in [0, 1].
pub fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

/// Weighted mean of `(value, weight)` pairs.
///
/// Returns `None` when the weights sum to zero or less.
pub fn weighted_mean(pairs: impl IntoIterator<Item = (f64, f64)>) -> Option<f64> {
    let (num, den) = pairs
        .into_iter()
        .fold((0.0, 0.0), |(n, d), (v, w)| (n + v * w, d + w));
    if den > 0.0 {
        Some(num / den)
    } else {
        None
    }
}

/// Scale non-negative weights to sum to 1. Returns `None` if they sum to zero.
pub fn normalize(weights: &[f64]) -> Option<Vec<f64>> {
    let total: f64 = weights.iter().map(|w| w.max(0.0)).sum();
    if total <= 0.0 || !total.is_finite() {
        return None;
    }
    Some(weights.iter().map(|w| w.max(0.0) / total).collect())
}

/// Binary entropy in bits.
pub fn binary_entropy_bits(p: f64) -> f64 {
    let p = p.clamp(1e-12, 1.0 - 1e-12);
    -(p * p.log2() + (1.0 - p) * (1.0 - p).log2())
}

/// Shannon entropy of a distribution, normalized by `ln(n)` into [0, 1].
///
/// The input is normalized first; a single-element or zero-mass input has
/// entropy 0.
pub fn normalized_entropy(weights: &[f64]) -> f64 {
    if weights.len() < 2 {
        return 0.0;
    }
    let Some(dist) = normalize(weights) else {
        return 0.0;
    };
    let h: f64 = dist
        .iter()
        .filter(|p| **p > 0.0)
        .map(|p| -p * p.ln())
        .sum();
    (h / (weights.len() as f64).ln()).clamp(0.0, 1.0)
}

/// Variance of a distribution normalized by the largest variance attainable
/// over the same support (a one-hot distribution), giving a value in [0, 1].
pub fn normalized_dispersion(weights: &[f64]) -> f64 {
    let n = weights.len();
    if n < 2 {
        return 0.0;
    }
    let Some(dist) = normalize(weights) else {
        return 0.0;
    };
    let max_var = (n as f64 - 1.0) / (n as f64).powi(2);
    (variance(&dist) / max_var).clamp(0.0, 1.0)
}
