//! Synthetic one-day feed: solar bell curve, evening load, peak tariff and a
//! scheduled blackout.

use std::collections::BTreeMap;

use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::sim::types::SimConfig;

use super::{Feed, FeedFrame, Reading};

/// Physical profile of one participant, in kW.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    /// Solar output at the daily peak (0 for no panels).
    pub solar_kw_peak: f64,
    /// Load present all day.
    pub base_load_kw: f64,
    /// Extra load during the evening hours.
    pub evening_load_kw: f64,
}

/// Shape of the synthetic day. Hours are whole clock hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyntheticDay {
    pub offpeak_price: f64,
    pub peak_price: f64,
    /// Peak tariff applies for `peak_start_hour <= hour < peak_end_hour`.
    pub peak_start_hour: u32,
    pub peak_end_hour: u32,
    /// Grid is down for `blackout_start_hour <= hour < blackout_end_hour`.
    pub blackout_start_hour: u32,
    pub blackout_end_hour: u32,
    /// Evening load applies for `evening_start_hour <= hour <= evening_end_hour`.
    pub evening_start_hour: u32,
    pub evening_end_hour: u32,
    pub solar_peak_hour: f64,
    pub solar_width_hours: f64,
    /// Relative noise on solar and absolute noise (kW) on load.
    pub noise_std: f64,
}

impl Default for SyntheticDay {
    fn default() -> Self {
        Self {
            offpeak_price: 38.0,
            peak_price: 46.0,
            peak_start_hour: 18,
            peak_end_hour: 22,
            blackout_start_hour: 19,
            blackout_end_hour: 21,
            evening_start_hour: 18,
            evening_end_hour: 22,
            solar_peak_hour: 13.0,
            solar_width_hours: 3.0,
            noise_std: 0.0,
        }
    }
}

impl SyntheticDay {
    fn is_blackout(&self, hour: u32) -> bool {
        (self.blackout_start_hour..self.blackout_end_hour).contains(&hour)
    }

    fn price(&self, hour: u32) -> f64 {
        if self.is_blackout(hour) {
            0.0
        } else if (self.peak_start_hour..self.peak_end_hour).contains(&hour) {
            self.peak_price
        } else {
            self.offpeak_price
        }
    }

    fn solar_shape(&self, hour: u32) -> f64 {
        if self.solar_width_hours <= 0.0 {
            return 0.0;
        }
        let z = (f64::from(hour) - self.solar_peak_hour) / self.solar_width_hours;
        (-0.5 * z * z).exp()
    }

    fn is_evening(&self, hour: u32) -> bool {
        (self.evening_start_hour..=self.evening_end_hour).contains(&hour)
    }
}

/// Gaussian noise via the Box-Muller transform.
fn gaussian_noise(rng: &mut StdRng, std_dev: f64) -> f64 {
    if std_dev <= 0.0 {
        return 0.0;
    }

    let u1: f64 = rng.random::<f64>().clamp(1e-12, 1.0);
    let u2: f64 = rng.random::<f64>();
    let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    z0 * std_dev
}

/// Generates one frame per tick of `sim` for every profile.
///
/// Power is converted to energy per tick (`kW * dt_hours`). With
/// `noise_std > 0` the same `sim.seed` always gives the same feed.
///
/// # Examples
///
/// ```
/// use microgrid_market::feed::synthetic::{generate, Profile, SyntheticDay};
/// use microgrid_market::sim::types::{SimConfig, SimTime};
///
/// let sim = SimConfig::new(48, 30, SimTime::MIDNIGHT, 42);
/// let houses = [Profile {
///     id: "house_b".into(),
///     solar_kw_peak: 0.0,
///     base_load_kw: 1.0,
///     evening_load_kw: 1.5,
/// }];
/// let feed = generate(&sim, &houses, &SyntheticDay::default());
///
/// assert_eq!(feed.len(), 48);
/// assert_eq!(feed.frame(38).unwrap().grid_available, Some(false)); // 19:00
/// ```
pub fn generate(sim: &SimConfig, profiles: &[Profile], day: &SyntheticDay) -> Feed {
    let mut rng = StdRng::seed_from_u64(sim.seed);
    let dt = sim.dt_hours();
    let mut frames = BTreeMap::new();

    for step in 0..sim.total_steps() {
        let timestamp = sim.timestamp_at(step);
        let hour = timestamp.hour();

        let readings = profiles
            .iter()
            .map(|p| {
                let solar_kw = p.solar_kw_peak * day.solar_shape(hour);
                let solar_kw = (solar_kw * (1.0 + gaussian_noise(&mut rng, day.noise_std))).max(0.0);
                let mut load_kw = p.base_load_kw;
                if day.is_evening(hour) {
                    load_kw += p.evening_load_kw;
                }
                let load_kw = (load_kw + gaussian_noise(&mut rng, day.noise_std)).max(0.0);
                let reading = Reading {
                    generation: solar_kw * dt,
                    consumption: load_kw * dt,
                    battery: None,
                };
                (p.id.clone(), reading)
            })
            .collect();

        frames.insert(
            step,
            FeedFrame {
                timestamp,
                grid_available: Some(!day.is_blackout(hour)),
                grid_price: Some(day.price(hour)),
                readings,
            },
        );
    }

    Feed {
        start: sim.start,
        step_minutes: sim.step_minutes,
        frames,
    }
}
