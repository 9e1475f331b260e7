//! Computation of ideal issue times.
//!
//! A [`Pacer`] yields, for a single client, the offsets relative to the start of its task at which
//! the client should issue its operations. The offsets never decrease. Throttled pacers realize a
//! target rate `r` per client, either with exact gaps of `1 / r` or with randomized gaps of the
//! same mean. Unthrottled pacers always yield the client's start offset, so that operations are
//! issued back-to-back.

use std::time::Duration;

use loaddriver_types::{PacingMode, Throughput};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::Exp1;

#[derive(Debug)]
enum Mode {
    Unthrottled,
    Fixed { rate: f64 },
    Uniform { rate: f64 },
    Poisson { rate: f64 },
}

/// Generator of ideal issue time offsets for one client.
#[derive(Debug)]
pub struct Pacer {
    mode: Mode,
    /// Offset of operation 0, used to stagger clients during ramp-up.
    start: Duration,
    /// Index of the next operation.
    index: u64,
    /// Accumulated randomized gaps.
    cursor: f64,
    rng: SmallRng,
}

impl Pacer {
    /// Creates a pacer for the given throughput and pacing mode.
    ///
    /// The seed is only used by randomized pacing modes. Two pacers created with the same
    /// arguments yield identical sequences.
    pub fn new(throughput: Throughput, pacing: PacingMode, seed: u64) -> Self {
        let mode = match (throughput, pacing) {
            (Throughput::Unthrottled, _) => Mode::Unthrottled,
            (Throughput::PerClient(rate), PacingMode::Fixed) => Mode::Fixed { rate },
            (Throughput::PerClient(rate), PacingMode::Uniform) => Mode::Uniform { rate },
            (Throughput::PerClient(rate), PacingMode::Poisson) => Mode::Poisson { rate },
        };

        Self {
            mode,
            start: Duration::ZERO,
            index: 0,
            cursor: 0.0,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Creates a pacer that issues operations back-to-back.
    pub fn unthrottled() -> Self {
        Self::new(Throughput::Unthrottled, PacingMode::Fixed, 0)
    }

    /// Shifts the zero point of this pacer.
    pub fn with_start_offset(mut self, offset: Duration) -> Self {
        self.start = offset;
        self
    }

    /// Returns `true` if this pacer realizes a target rate.
    pub fn is_throttled(&self) -> bool {
        !matches!(self.mode, Mode::Unthrottled)
    }

    /// Returns the ideal issue time offset of the next operation and advances the pacer.
    pub fn next_ideal_issue_time(&mut self) -> Duration {
        let n = self.index;
        self.index += 1;

        let offset = match self.mode {
            Mode::Unthrottled => 0.0,
            // Computed from the index rather than accumulated, so rounding never drifts.
            Mode::Fixed { rate } => n as f64 / rate,
            Mode::Uniform { rate } => {
                if n > 0 {
                    self.cursor += self.rng.random::<f64>() * 2.0 / rate;
                }
                self.cursor
            }
            Mode::Poisson { rate } => {
                if n > 0 {
                    let gap: f64 = self.rng.sample(Exp1);
                    self.cursor += gap / rate;
                }
                self.cursor
            }
        };

        self.start.saturating_add(secs(offset))
    }
}

impl Iterator for Pacer {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_ideal_issue_time())
    }
}

/// Returns the start offset of `client` when `clients` are ramped up over `ramp_up`.
///
/// Offsets are staggered linearly: client 0 starts immediately, the last client starts one step
/// before the end of the ramp-up period.
pub fn ramp_up_offset(ramp_up: Duration, client: usize, clients: usize) -> Duration {
    if clients == 0 || ramp_up.is_zero() {
        return Duration::ZERO;
    }
    ramp_up.mul_f64(client as f64 / clients as f64)
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn take(pacer: &mut Pacer, n: usize) -> Vec<Duration> {
        pacer.by_ref().take(n).collect()
    }

    #[test]
    fn fixed_gaps_are_exact() {
        let mut pacer = Pacer::new(Throughput::PerClient(4.0), PacingMode::Fixed, 0);
        assert!(pacer.is_throttled());
        assert_eq!(
            take(&mut pacer, 4),
            [
                Duration::ZERO,
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_millis(750),
            ]
        );
    }

    #[test]
    fn unthrottled_stays_at_start() {
        let mut pacer = Pacer::unthrottled().with_start_offset(Duration::from_secs(2));
        assert!(!pacer.is_throttled());
        assert!(take(&mut pacer, 10).iter().all(|t| *t == Duration::from_secs(2)));
    }

    #[test]
    fn start_offset_shifts_zero_point() {
        let mut pacer = Pacer::new(Throughput::PerClient(2.0), PacingMode::Fixed, 0)
            .with_start_offset(Duration::from_secs(1));
        assert_eq!(
            take(&mut pacer, 3),
            [
                Duration::from_secs(1),
                Duration::from_millis(1500),
                Duration::from_secs(2),
            ]
        );
    }

    #[test]
    fn randomized_gaps_have_expected_mean() {
        for pacing in [PacingMode::Uniform, PacingMode::Poisson] {
            let mut pacer = Pacer::new(Throughput::PerClient(100.0), pacing, 42);
            let times = take(&mut pacer, 20_001);
            assert_eq!(times[0], Duration::ZERO);
            assert!(times.windows(2).all(|w| w[0] <= w[1]));

            // 20k gaps with a mean of 10ms
            let mean = times[20_000].as_secs_f64() / 20_000.0;
            assert!((mean - 0.01).abs() < 0.0005, "{pacing:?}: mean gap {mean}");
        }
    }

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Pacer::new(Throughput::PerClient(10.0), PacingMode::Poisson, 7);
        let mut b = Pacer::new(Throughput::PerClient(10.0), PacingMode::Poisson, 7);
        let mut c = Pacer::new(Throughput::PerClient(10.0), PacingMode::Poisson, 8);

        let a = take(&mut a, 100);
        assert_eq!(a, take(&mut b, 100));
        assert_ne!(a, take(&mut c, 100));
    }

    #[test]
    fn ramp_up_is_linear() {
        let ramp = Duration::from_secs(10);
        assert_eq!(ramp_up_offset(ramp, 0, 4), Duration::ZERO);
        assert_eq!(ramp_up_offset(ramp, 1, 4), Duration::from_millis(2500));
        assert_eq!(ramp_up_offset(ramp, 3, 4), Duration::from_millis(7500));
        assert_eq!(ramp_up_offset(Duration::ZERO, 3, 4), Duration::ZERO);
    }
}
