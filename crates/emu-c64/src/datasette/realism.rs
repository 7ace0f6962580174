//! Tape speed variation: wobble, speed tuning and azimuth error.
//!
//! Both effects carry their rounding remainder into the next gap, so over
//! a long run the total tape time is preserved.

use std::f32::consts::PI;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::DatasetteConfig;

const WOBBLE_AMPLITUDE_ONE: f32 = 10_000.0;
const SPEED_TUNING_ONE: f32 = 100_000.0;
const AZIMUTH_ERROR_ONE: i64 = 1_000;

pub(crate) struct Realism {
    wobble_phase: f32,
    wobble_rest: f32,
    azimuth_rest: i64,
    rng: StdRng,
}

impl Realism {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            wobble_phase: 0.0,
            wobble_rest: 0.0,
            azimuth_rest: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Wobble first, then azimuth.
    pub(crate) fn apply(
        &mut self,
        gap: u64,
        total_cycles: u64,
        cycles_per_sec: u64,
        config: &DatasetteConfig,
    ) -> u64 {
        let gap = self.wobble(gap, total_cycles, cycles_per_sec, config);
        self.azimuth(gap, config.azimuth_error)
    }

    fn wobble(
        &mut self,
        gap: u64,
        total_cycles: u64,
        cycles_per_sec: u64,
        config: &DatasetteConfig,
    ) -> u64 {
        if (config.wobble_frequency == 0 || config.wobble_amplitude == 0)
            && config.speed_tuning == 0
        {
            return gap;
        }

        let freq = config.wobble_frequency as f32;
        let amplitude = config.wobble_amplitude as f32 / WOBBLE_AMPLITUDE_ONE;
        let tuning = config.speed_tuning as f32 / SPEED_TUNING_ONE;

        let micros = total_cycles as f32 / (cycles_per_sec as f32 / 1_000_000.0);
        self.wobble_phase += freq * (micros / (10_000_000_000.0 * (2.0 * PI)));
        if self.wobble_phase > 2.0 * PI {
            self.wobble_phase -= 2.0 * PI;
        }

        let factor = 1.0 + self.wobble_phase.sin() * amplitude + tuning;
        let exact = self.wobble_rest + factor * gap as f32;
        let rounded = ((exact + 0.5) as i64).max(1);
        self.wobble_rest = exact - rounded as f32;
        rounded as u64
    }

    fn azimuth(&mut self, gap: u64, error: u32) -> u64 {
        if error == 0 {
            return gap;
        }
        let e = i64::from(error);
        let err = self.rng.random_range(-e..=e);
        let exact = gap as i64 * AZIMUTH_ERROR_ONE + err + self.azimuth_rest;
        let rounded = ((exact + 500) / AZIMUTH_ERROR_ONE).max(1);
        self.azimuth_rest = exact - rounded * AZIMUTH_ERROR_ONE;
        rounded as u64
    }

    /// Forget carried remainders.
    pub(crate) fn reset(&mut self) {
        self.wobble_phase = 0.0;
        self.wobble_rest = 0.0;
        self.azimuth_rest = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CPS: u64 = 985_248;

    fn make_config() -> DatasetteConfig {
        DatasetteConfig::default()
    }

    #[test]
    fn defaults_leave_gaps_alone() {
        let mut r = Realism::new(1);
        assert_eq!(r.apply(100, 0, CPS, &make_config()), 100);
        assert_eq!(r.apply(2500, 1_000_000, CPS, &make_config()), 2500);
    }

    #[test]
    fn speed_tuning_scales_gap() {
        let mut r = Realism::new(1);
        let config = DatasetteConfig {
            speed_tuning: 50_000,
            ..make_config()
        };
        assert_eq!(r.apply(100, 0, CPS, &config), 150);

        let config = DatasetteConfig {
            speed_tuning: -50_000,
            ..make_config()
        };
        assert_eq!(r.apply(100, 0, CPS, &config), 50);
    }

    #[test]
    fn gap_never_drops_below_one() {
        let mut r = Realism::new(1);
        let config = DatasetteConfig {
            azimuth_error: 25_000,
            ..make_config()
        };
        for _ in 0..100 {
            assert!(r.apply(1, 0, CPS, &config) >= 1);
        }
    }

    proptest! {
        #[test]
        fn azimuth_error_preserves_total_time(
            gaps in prop::collection::vec(20u64..2000, 50..200),
            seed in any::<u64>(),
        ) {
            let mut r = Realism::new(seed);
            let config = DatasetteConfig { azimuth_error: 500, ..make_config() };
            let input: i64 = gaps.iter().map(|&g| g as i64).sum();
            let output: i64 = gaps.iter().map(|&g| r.apply(g, 0, CPS, &config) as i64).sum();
            // Remainders carry, so the drift is bounded by one error window
            // plus rounding.
            prop_assert!((input - output).abs() <= 2);
        }
    }
}
