//! Baseline statistics and anomaly scoring.

/// Baselines are only trusted with at least this many prior samples;
/// below it the tier reports empty values and a zero z-score.
pub const MIN_SAMPLES: usize = 10;

/// Mean / population-stddev over one baseline tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct Baseline {
    pub avg: Option<f64>,
    pub stddev: Option<f64>,
    pub count: usize,
}

impl Baseline {
    pub fn from_samples(samples: &[f64]) -> Self {
        let count = samples.len();
        if count < MIN_SAMPLES {
            return Self {
                avg: None,
                stddev: None,
                count,
            };
        }
        let mean = samples.iter().sum::<f64>() / count as f64;
        let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / count as f64;
        Self {
            avg: Some(mean),
            stddev: Some(variance.sqrt()),
            count,
        }
    }

    /// `(value − mean) / stddev` when the stddev is positive, else 0.
    pub fn z_score(&self, value: f64) -> f64 {
        match (self.avg, self.stddev) {
            (Some(mean), Some(stddev)) if stddev > 0.0 => (value - mean) / stddev,
            _ => 0.0,
        }
    }

    /// |z| > 2 marks an outlier.
    pub fn is_outlier(&self, value: f64) -> bool {
        self.z_score(value).abs() > 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_ten_samples_is_empty() {
        let baseline = Baseline::from_samples(&[1.0; 9]);
        assert!(baseline.avg.is_none());
        assert_eq!(baseline.z_score(5.0), 0.0);
        assert!(!baseline.is_outlier(5.0));
    }

    #[test]
    fn z_score_matches_hand_computation() {
        // 50 samples with mean 0.02, stddev 0.005.
        let samples: Vec<f64> = (0..50)
            .map(|i| if i % 2 == 0 { 0.015 } else { 0.025 })
            .collect();
        let baseline = Baseline::from_samples(&samples);
        assert!((baseline.avg.unwrap() - 0.02).abs() < 1e-12);
        assert!((baseline.stddev.unwrap() - 0.005).abs() < 1e-12);

        let z = baseline.z_score(0.04);
        assert!((z - 4.0).abs() < 1e-9);
        assert!(baseline.is_outlier(0.04));
        assert!(!baseline.is_outlier(0.021));
    }

    #[test]
    fn zero_stddev_yields_zero_z() {
        let baseline = Baseline::from_samples(&[0.5; 20]);
        assert_eq!(baseline.z_score(0.9), 0.0);
    }
}
