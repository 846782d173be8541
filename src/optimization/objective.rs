//! Error metrics for comparing simulated and observed series.

/// Scale applied to the observed value when the simulation has no data for a point
pub const MISSING_POINT_PENALTY: f64 = 5.0;

/// Root-mean-square error between simulated and observed series.
///
/// `simulated[i]` is `None` (or NaN) when the simulation produced no data for
/// observation `i`; such points contribute `(observed * 5)^2`. Observed points
/// beyond the end of `simulated` count as missing. Returns `None` when there
/// are no observations.
pub fn rmse(simulated: &[Option<f64>], observed: &[f64]) -> Option<f64> {
    if observed.is_empty() {
        return None;
    }

    let sum_sq: f64 = observed
        .iter()
        .enumerate()
        .map(|(i, &obs)| match simulated.get(i).copied().flatten() {
            Some(sim) if sim.is_finite() => (sim - obs).powi(2),
            _ => (obs * MISSING_POINT_PENALTY).powi(2),
        })
        .sum();

    Some((sum_sq / observed.len() as f64).sqrt())
}

/// Number of observations the simulation actually covered
pub fn covered_points(simulated: &[Option<f64>], observed: &[f64]) -> usize {
    observed
        .iter()
        .enumerate()
        .filter(|&(i, _)| {
            simulated
                .get(i)
                .copied()
                .flatten()
                .is_some_and(f64::is_finite)
        })
        .count()
}

/// Element-wise mean of several simulated series, ignoring missing entries.
///
/// Useful when the same parameters are simulated with several seeds. A point
/// is `None` only when every series is missing it.
pub fn mean_series(runs: &[Vec<Option<f64>>]) -> Vec<Option<f64>> {
    let len = runs.iter().map(Vec::len).max().unwrap_or(0);
    (0..len)
        .map(|i| {
            let (sum, count) = runs
                .iter()
                .filter_map(|r| r.get(i).copied().flatten())
                .filter(|v| v.is_finite())
                .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
            (count > 0).then(|| sum / count as f64)
        })
        .collect()
}
