/// Linear-interpolated percentile over a sorted, non-empty slice.
/// `p` is in `[0, 1]`.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p * (sorted.len() - 1) as f64;
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    if low == high {
        return sorted[low];
    }
    let weight = rank - low as f64;
    sorted[low] + (sorted[high] - sorted[low]) * weight
}

/// IQR-based outlier filter, parameterized by a value accessor so any grouped
/// record shape can be filtered. With `upper_only` set, values below
/// `Q1 - 1.5*IQR` are retained; negative durations are not expected in this
/// pipeline and are not the filter's concern.
pub fn filter_outliers<T>(items: Vec<T>, value: impl Fn(&T) -> f64, upper_only: bool) -> Vec<T> {
    if items.len() < 4 {
        return items;
    }
    let mut sorted: Vec<f64> = items.iter().map(&value).collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let q1 = percentile(&sorted, 0.25);
    let q3 = percentile(&sorted, 0.75);
    let iqr = q3 - q1;
    let upper = q3 + 1.5 * iqr;
    let lower = q1 - 1.5 * iqr;

    items
        .into_iter()
        .filter(|item| {
            let v = value(item);
            v <= upper && (upper_only || v >= lower)
        })
        .collect()
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation; the predicted-percent distribution covers
/// every student in the course, not a sample.
pub fn std_dev_population(values: &[f64]) -> Option<f64> {
    let mean = mean(values)?;
    let variance = values
        .iter()
        .map(|v| {
            let diff = v - mean;
            diff * diff
        })
        .sum::<f64>()
        / values.len() as f64;
    Some(variance.sqrt())
}

pub fn z_score(value: f64, mean: f64, std_dev: f64) -> Option<f64> {
    if std_dev == 0.0 {
        return None;
    }
    Some((value - mean) / std_dev)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_interpolates_linearly() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 100.0];
        assert_eq!(percentile(&values, 0.25), 2.0);
        assert_eq!(percentile(&values, 0.75), 4.0);
        assert_eq!(percentile(&values, 0.5), 3.0);
        assert!((percentile(&[1.0, 2.0], 0.25) - 1.25).abs() < 1e-9);
    }

    #[test]
    fn upper_outlier_is_dropped_and_rest_retained() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 100.0];
        let kept = filter_outliers(values, |v| *v, true);
        assert_eq!(kept, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn upper_only_keeps_low_values() {
        // Q1 = 97.75, lower fence well above 1.0; upper-only must keep it.
        let values = vec![1.0, 98.0, 99.0, 100.0, 101.0];
        let kept = filter_outliers(values, |v| *v, true);
        assert!(kept.contains(&1.0));
    }

    #[test]
    fn two_sided_filter_drops_low_values() {
        let values = vec![1.0, 98.0, 99.0, 100.0, 101.0, 102.0];
        let kept = filter_outliers(values, |v| *v, false);
        assert!(!kept.contains(&1.0));
        assert!(kept.contains(&98.0));
    }

    #[test]
    fn tiny_groups_pass_through_unfiltered() {
        let values = vec![1.0, 500.0];
        let kept = filter_outliers(values.clone(), |v| *v, true);
        assert_eq!(kept, values);
    }

    #[test]
    fn population_stats_match_known_distribution() {
        let values = vec![90.0, 80.0, 40.0];
        let m = mean(&values).unwrap();
        let sd = std_dev_population(&values).unwrap();
        assert!((m - 70.0).abs() < 1e-9);
        assert!((sd - 21.602468994692867).abs() < 1e-9);

        let z_low = z_score(40.0, m, sd).unwrap();
        let z_high = z_score(90.0, m, sd).unwrap();
        assert!((z_low - (-1.3887)).abs() < 1e-3);
        assert!((z_high - 0.9258).abs() < 1e-3);
    }

    #[test]
    fn zero_spread_yields_no_z_scores() {
        assert_eq!(z_score(50.0, 50.0, 0.0), None);
        assert_eq!(mean(&[]), None);
    }
}
