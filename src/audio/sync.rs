//! Audio sample-count correction
//!
//! When audio is not the master clock, the audio stream is kept in step by
//! slightly stretching or shrinking the number of samples output per frame.
//! Corrections are based on an exponentially weighted average of the clock
//! difference so that jitter of a single callback does not cause audible
//! resampling artifacts.

use crate::utils::config::SyncConfig;
use log::trace;

/// Running state of the audio drift average
#[derive(Debug, Clone)]
pub struct AudioDriftCorrector {
    /// Decay coefficient of the moving average, `0.01^(1/N)`
    avg_coef: f64,

    /// Observations required before the average is trusted
    avg_nb: u32,

    /// Maximum correction in percent of the input sample count
    percent_max: u32,

    /// Differences at or above this are discontinuities, not drift
    nosync_threshold: f64,

    /// Output hardware buffer in samples per channel
    hw_buffer_samples: usize,

    diff_cum: f64,
    avg_count: u32,
}

impl AudioDriftCorrector {
    pub fn new(config: &SyncConfig, hw_buffer_samples: usize) -> Self {
        let avg_nb = config.audio_diff_avg_nb.max(1);
        Self {
            avg_coef: (0.01f64.ln() / avg_nb as f64).exp(),
            avg_nb,
            percent_max: config.sample_correction_percent_max.min(100),
            nosync_threshold: config.nosync_threshold,
            hw_buffer_samples,
            diff_cum: 0.0,
            avg_count: 0,
        }
    }

    /// Sample count to output for a frame of `nb_samples`
    ///
    /// `diff` is the audio clock minus the master clock in seconds, `None`
    /// when either clock is invalid.
    pub fn wanted_samples(&mut self, diff: Option<f64>, nb_samples: usize, sample_rate: u32) -> usize {
        let diff = match diff {
            Some(diff) if diff.abs() < self.nosync_threshold => diff,
            _ => {
                // Too far apart or unknown: start averaging afresh
                self.reset();
                return nb_samples;
            }
        };

        self.diff_cum = diff + self.avg_coef * self.diff_cum;
        if self.avg_count < self.avg_nb {
            self.avg_count += 1;
            return nb_samples;
        }

        let avg_diff = self.diff_cum * (1.0 - self.avg_coef);
        if avg_diff.abs() < self.threshold(sample_rate) {
            return nb_samples;
        }

        let wanted = nb_samples as i64 + (diff * sample_rate as f64) as i64;
        let min = (nb_samples * (100 - self.percent_max as usize) / 100) as i64;
        let max = (nb_samples * (100 + self.percent_max as usize) / 100) as i64;
        let wanted = wanted.clamp(min, max) as usize;

        trace!(
            "audio diff {:.4} avg {:.4}: {} -> {} samples",
            diff,
            avg_diff,
            nb_samples,
            wanted
        );
        wanted
    }

    /// Average magnitude below which no correction is applied
    pub fn threshold(&self, sample_rate: u32) -> f64 {
        if sample_rate == 0 {
            return f64::INFINITY;
        }
        self.hw_buffer_samples as f64 / sample_rate as f64
    }

    /// Forget accumulated drift
    pub fn reset(&mut self) {
        self.diff_cum = 0.0;
        self.avg_count = 0;
    }

    pub fn is_warmed_up(&self) -> bool {
        self.avg_count >= self.avg_nb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corrector() -> AudioDriftCorrector {
        AudioDriftCorrector::new(&SyncConfig::default(), 1024)
    }

    #[test]
    fn test_zero_diff_is_unchanged() {
        let mut corrector = corrector();
        for _ in 0..100 {
            assert_eq!(corrector.wanted_samples(Some(0.0), 1024, 48_000), 1024);
        }
        assert!(corrector.is_warmed_up());
    }

    #[test]
    fn test_warm_up_before_correcting() {
        let mut corrector = corrector();
        for _ in 0..20 {
            assert_eq!(corrector.wanted_samples(Some(0.05), 1024, 48_000), 1024);
        }
        assert!(corrector.is_warmed_up());
    }

    #[test]
    fn test_sustained_lead_is_clamped() {
        let mut corrector = corrector();
        let mut wanted = 0;
        for _ in 0..40 {
            wanted = corrector.wanted_samples(Some(0.05), 1024, 48_000);
        }
        assert!(wanted <= 1024 * 110 / 100);
        assert_eq!(wanted, 1126);
    }

    #[test]
    fn test_sustained_lag_shrinks() {
        let mut corrector = corrector();
        let mut wanted = 0;
        for _ in 0..40 {
            wanted = corrector.wanted_samples(Some(-0.05), 1000, 48_000);
        }
        assert_eq!(wanted, 900);
    }

    #[test]
    fn test_small_drift_below_threshold() {
        let mut corrector = corrector();
        for _ in 0..40 {
            // 10 ms is below the 1024/48000 s hardware buffer threshold
            assert_eq!(corrector.wanted_samples(Some(0.01), 1024, 48_000), 1024);
        }
    }

    #[test]
    fn test_discontinuity_resets_average() {
        let mut corrector = corrector();
        for _ in 0..30 {
            corrector.wanted_samples(Some(0.05), 1024, 48_000);
        }
        assert!(corrector.is_warmed_up());

        assert_eq!(corrector.wanted_samples(Some(12.0), 1024, 48_000), 1024);
        assert!(!corrector.is_warmed_up());

        corrector.wanted_samples(Some(0.05), 1024, 48_000);
        assert!(!corrector.is_warmed_up());

        assert_eq!(corrector.wanted_samples(None, 1024, 48_000), 1024);
        assert!(!corrector.is_warmed_up());
    }
}
