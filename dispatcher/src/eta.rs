use std::time::Duration;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Running estimate of the time a single window takes, from submission until the
/// queue is clear again.
#[derive(Debug, Clone, Default)]
pub struct EtaEstimator {
    samples: Vec<Duration>,
    // exact integer sum, so a long sweep does not drift
    total: Duration,
}

impl EtaEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch(&mut self, duration: Duration) {
        self.samples.push(duration);
        self.total = self.total.saturating_add(duration);
    }

    #[cfg(test)]
    pub fn samples(&self) -> &[Duration] {
        &self.samples
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            None
        } else {
            Some(from_nanos(
                self.total.as_nanos() / self.samples.len() as u128,
            ))
        }
    }

    /// mean duration per recorded batch times the windows still to go
    pub fn estimate_remaining(&self, batches_left: u64) -> Option<Duration> {
        self.mean()
            .map(|mean| from_nanos(mean.as_nanos().saturating_mul(u128::from(batches_left))))
    }
}

fn from_nanos(nanos: u128) -> Duration {
    let secs = u64::try_from(nanos / NANOS_PER_SEC).unwrap_or(u64::MAX);

    Duration::new(secs, (nanos % NANOS_PER_SEC) as u32)
}

/// format as `{h}h {m}m {s}s`, seconds keep their fraction if there is one
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = secs / 60 % 60;
    let nanos = duration.subsec_nanos();

    if nanos == 0 {
        format!("{hours}h {minutes}m {}s", secs % 60)
    } else {
        let seconds = (secs % 60) as f64 + f64::from(nanos) / NANOS_PER_SEC as f64;

        format!("{hours}h {minutes}m {seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_whole_seconds() {
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
        assert_eq!(format_duration(Duration::from_secs(59)), "0h 0m 59s");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h 0m 0s");
        assert_eq!(format_duration(Duration::from_secs(90061)), "25h 1m 1s");
        assert_eq!(format_duration(Duration::ZERO), "0h 0m 0s");
    }

    #[test]
    fn keeps_fractional_seconds() {
        assert_eq!(format_duration(Duration::from_millis(3_725_500)), "1h 2m 5.5s");
        assert_eq!(format_duration(Duration::from_millis(61_250)), "0h 1m 1.25s");
    }

    #[test]
    fn estimates_from_the_mean() {
        let mut eta = EtaEstimator::new();
        assert_eq!(eta.estimate_remaining(3), None);

        for secs in [10, 20, 30] {
            eta.record_batch(Duration::from_secs(secs));
        }

        assert_eq!(eta.samples().len(), 3);
        assert_eq!(eta.mean(), Some(Duration::from_secs(20)));
        assert_eq!(eta.estimate_remaining(2), Some(Duration::from_secs(40)));
        assert_eq!(eta.estimate_remaining(0), Some(Duration::ZERO));
    }

    #[test]
    fn mean_does_not_drift() {
        let mut eta = EtaEstimator::new();

        for _ in 0..100_000 {
            eta.record_batch(Duration::from_nanos(100_000_001));
        }

        assert_eq!(eta.mean(), Some(Duration::from_nanos(100_000_001)));
    }
}
