//! Probabilistic latency and failure injection.
//!
//! A [`ChaosPolicy`] is derived from an app's error and latency profiles
//! plus the run-wide `chaos_level` multiplier. Draws come from a seeded
//! generator threaded through the constructor, so a fixed seed reproduces
//! an identical sequence of decisions across runs. The injector never
//! mutates state; it only decides delay and pass/fail ahead of the state
//! transition.

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::definition::{ErrorProfile, LatencyProfile};

const FAILURE_PROBABILITY_CLAMP: f64 = 0.95;
const LATENCY_CEILING: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum LatencyDistribution {
    Fixed(Duration),
    Uniform { min: Duration, max: Duration },
    /// Pareto-shaped: mostly near `base` with a long tail, capped at
    /// `LATENCY_CEILING`.
    HeavyTailed { base: Duration, shape: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChaosPolicy {
    pub failure_probability: f64,
    /// Share of injected failures classified as permanent.
    pub permanent_ratio: f64,
    pub latency: LatencyDistribution,
}

impl ChaosPolicy {
    /// Combine the app profiles with the run-wide chaos level.
    ///
    /// The combination is multiplicative (`p = base_p * chaos_level`),
    /// clamped to 0.95, matching the original simulator's chaos-mode
    /// scaling. The always-fail profiles are exempt from the clamp so
    /// they stay deterministic; a chaos level of zero disables injection
    /// entirely, always-fail included.
    pub fn derive(error: ErrorProfile, latency: LatencyProfile, chaos_level: f64) -> Self {
        let level = chaos_level.max(0.0);
        let failure_probability = match error {
            ErrorProfile::AlwaysFailTransient | ErrorProfile::AlwaysFailPermanent => {
                if level > 0.0 { 1.0 } else { 0.0 }
            }
            _ => (base_probability(error) * level).min(FAILURE_PROBABILITY_CLAMP),
        };

        let permanent_ratio = match error {
            ErrorProfile::None | ErrorProfile::AlwaysFailTransient => 0.0,
            ErrorProfile::Low => 0.2,
            ErrorProfile::Medium => 0.25,
            ErrorProfile::High => 0.33,
            ErrorProfile::AlwaysFailPermanent => 1.0,
        };

        let latency = if level > 0.0 {
            match latency {
                LatencyProfile::Fast => LatencyDistribution::Fixed(Duration::from_millis(5)),
                LatencyProfile::Normal => LatencyDistribution::Uniform {
                    min: Duration::from_millis(20),
                    max: Duration::from_millis(120),
                },
                LatencyProfile::Slow => LatencyDistribution::Uniform {
                    min: Duration::from_millis(250),
                    max: Duration::from_millis(900),
                },
                LatencyProfile::Variable => LatencyDistribution::HeavyTailed {
                    base: Duration::from_millis(30),
                    shape: 1.5,
                },
            }
        } else {
            LatencyDistribution::Fixed(Duration::ZERO)
        };

        Self {
            failure_probability,
            permanent_ratio,
            latency,
        }
    }
}

fn base_probability(error: ErrorProfile) -> f64 {
    match error {
        ErrorProfile::None => 0.0,
        ErrorProfile::Low => 0.02,
        ErrorProfile::Medium => 0.08,
        ErrorProfile::High => 0.2,
        ErrorProfile::AlwaysFailTransient | ErrorProfile::AlwaysFailPermanent => 1.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaosFailure {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChaosDecision {
    pub delay: Duration,
    pub failure: Option<ChaosFailure>,
}

pub struct ChaosInjector {
    policy: ChaosPolicy,
    rng: Mutex<StdRng>,
}

impl ChaosInjector {
    pub fn new(policy: ChaosPolicy, seed: u64) -> Self {
        Self {
            policy,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn policy(&self) -> &ChaosPolicy {
        &self.policy
    }

    pub fn decide(&self) -> ChaosDecision {
        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let delay = match self.policy.latency {
            LatencyDistribution::Fixed(d) => d,
            LatencyDistribution::Uniform { min, max } => {
                if max > min {
                    min + Duration::from_secs_f64(rng.r#gen::<f64>() * (max - min).as_secs_f64())
                } else {
                    min
                }
            }
            LatencyDistribution::HeavyTailed { base, shape } => {
                let u: f64 = rng.gen_range(f64::EPSILON..1.0);
                base.mul_f64(u.powf(-1.0 / shape)).min(LATENCY_CEILING)
            }
        };

        let failure = if rng.r#gen::<f64>() < self.policy.failure_probability {
            if rng.r#gen::<f64>() < self.policy.permanent_ratio {
                Some(ChaosFailure::Permanent)
            } else {
                Some(ChaosFailure::Transient)
            }
        } else {
            None
        };

        ChaosDecision { delay, failure }
    }
}
