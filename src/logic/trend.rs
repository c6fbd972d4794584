use crate::models::Sample;

/// Least-squares slope of `samples`, in value units per second.
///
/// Samples are sorted by timestamp first. Returns `None` for fewer than two
/// samples or when every timestamp is identical.
pub fn slope(samples: &[Sample]) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }

    let mut ordered: Vec<&Sample> = samples.iter().collect();
    ordered.sort_by_key(|s| s.timestamp);

    // Offsets from the first sample keep the sums small; the slope is unchanged
    let origin = ordered[0].timestamp;
    let n = ordered.len() as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0);

    for sample in &ordered {
        let x = (sample.timestamp - origin)
            .num_microseconds()
            .map(|us| us as f64 / 1_000_000.0)
            .unwrap_or_else(|| (sample.timestamp - origin).num_seconds() as f64);
        let y = sample.value;
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_xx += x * x;
    }

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator == 0.0 {
        return None;
    }

    Some((n * sum_xy - sum_x * sum_y) / denominator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn at(hours: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap() + Duration::hours(hours)
    }

    #[test]
    fn too_few_samples() {
        assert_eq!(slope(&[]), None);
        assert_eq!(slope(&[Sample::new(at(0), 20.0)]), None);
    }

    #[test]
    fn identical_timestamps_have_no_slope() {
        let samples = vec![Sample::new(at(1), 20.0), Sample::new(at(1), 25.0)];
        assert_eq!(slope(&samples), None);
    }

    #[test]
    fn rising_series_is_positive() {
        let samples: Vec<Sample> = (0..6).map(|h| Sample::new(at(h), 60.0 + h as f64)).collect();
        let s = slope(&samples).unwrap();
        assert!((s - 1.0 / 3600.0).abs() < 1e-12);
    }

    #[test]
    fn falling_series_is_negative() {
        let samples = vec![
            Sample::new(at(0), 1015.0),
            Sample::new(at(3), 1011.0),
            Sample::new(at(6), 1004.0),
        ];
        assert!(slope(&samples).unwrap() < 0.0);
    }

    #[test]
    fn flat_series_is_zero() {
        let samples = vec![Sample::new(at(0), 50.0), Sample::new(at(2), 50.0)];
        assert_eq!(slope(&samples), Some(0.0));
    }

    #[test]
    fn input_order_does_not_matter() {
        let ordered = vec![
            Sample::new(at(0), 10.0),
            Sample::new(at(1), 14.0),
            Sample::new(at(2), 13.0),
            Sample::new(at(5), 20.0),
        ];
        let mut shuffled = ordered.clone();
        shuffled.swap(0, 3);
        shuffled.swap(1, 2);

        let a = slope(&ordered).unwrap();
        let b = slope(&shuffled).unwrap();
        assert!((a - b).abs() < 1e-15);
    }

    #[test]
    fn sub_second_spacing_counts() {
        let t = at(0);
        let samples = vec![
            Sample::new(t, 1.0),
            Sample::new(t + Duration::milliseconds(500), 2.0),
        ];
        assert!((slope(&samples).unwrap() - 2.0).abs() < 1e-9);
    }
}
