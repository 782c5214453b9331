use std::time::Duration;

///
/// The wait between protocol level reconnect attempts. The intervals are
/// used one per attempt, after the last one it keeps repeating.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectSchedule {
    intervals: Vec<Duration>,
    attempt: usize,
}

impl ReconnectSchedule {
    /// An empty list of intervals falls back to the default schedule.
    pub fn new(intervals: Vec<Duration>) -> Self {
        if intervals.is_empty() {
            return Self::default();
        }
        ReconnectSchedule {
            intervals,
            attempt: 0,
        }
    }

    pub fn next_interval(&mut self) -> Duration {
        let last = self.intervals.len() - 1;
        let interval = self.intervals[self.attempt.min(last)];
        self.attempt += 1;
        interval
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

impl Default for ReconnectSchedule {
    /// 10s, 20s, ... 100s
    fn default() -> Self {
        ReconnectSchedule {
            intervals: (1..=10).map(|n| Duration::from_secs(n * 10)).collect(),
            attempt: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_ascend_then_repeat_the_last() {
        let mut schedule = ReconnectSchedule::default();
        let secs: Vec<u64> = (0..12).map(|_| schedule.next_interval().as_secs()).collect();
        assert_eq!(secs, vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 100, 100]);
        assert_eq!(schedule.attempt(), 12);
    }

    #[test]
    fn reset_starts_over() {
        let mut schedule =
            ReconnectSchedule::new(vec![Duration::from_secs(1), Duration::from_secs(2)]);
        schedule.next_interval();
        schedule.next_interval();
        schedule.next_interval();
        schedule.reset();
        assert_eq!(schedule.attempt(), 0);
        assert_eq!(schedule.next_interval(), Duration::from_secs(1));
    }

    #[test]
    fn empty_schedule_uses_defaults() {
        assert_eq!(ReconnectSchedule::new(vec![]), ReconnectSchedule::default());
    }
}
