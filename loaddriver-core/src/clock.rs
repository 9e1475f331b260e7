//! Wall-clock timestamps derived from monotonic time.

use std::time::SystemTime;

use tokio::time::Instant;

/// Maps monotonic instants of a worker to wall-clock times.
///
/// All wall-clock timestamps of a worker are derived from one pairing of a monotonic instant and
/// the system time taken at the same moment. Timestamps derived this way keep the ordering of the
/// instants they were computed from, even if the system clock is adjusted during a run.
#[derive(Clone, Copy, Debug)]
pub struct RunClock {
    instant: Instant,
    wall: SystemTime,
}

impl RunClock {
    /// Creates a clock anchored at the current time.
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            wall: SystemTime::now(),
        }
    }

    /// Returns the wall-clock time corresponding to `instant`.
    pub fn wall_time(&self, instant: Instant) -> SystemTime {
        if instant >= self.instant {
            self.wall + (instant - self.instant)
        } else {
            self.wall - (self.instant - instant)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn preserves_monotonic_offsets() {
        let clock = RunClock::now();
        let before = Instant::now();
        tokio::time::sleep(Duration::from_millis(250)).await;
        let after = Instant::now();

        let elapsed = clock
            .wall_time(after)
            .duration_since(clock.wall_time(before))
            .unwrap();
        assert_eq!(elapsed, Duration::from_millis(250));

        let earlier = clock.wall_time(before - Duration::from_secs(1));
        assert_eq!(
            clock.wall_time(before).duration_since(earlier).unwrap(),
            Duration::from_secs(1)
        );
    }
}
