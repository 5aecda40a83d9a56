//! Per-token pondering decisions.
//!
//! A token is kept when its log-probability clears `-(floor + cooldown)`.
//! Otherwise the policy inserts a marker and asks for a fresh sample at a
//! lower temperature; once the temperature reaches zero the only way forward
//! is a reflection episode. Each accepted token shrinks the cooldown, so
//! sustained confident output tightens the threshold again.

use serde::{Deserialize, Serialize};

use crate::transcript::Marker;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PonderConfig {
    #[serde(default = "default_base_temperature")]
    pub base_temperature: f64,
    /// Temperature removed per consecutive ponder.
    #[serde(default = "default_temperature_step")]
    pub temperature_step: f64,
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,
    #[serde(default = "default_initial_cooldown")]
    pub initial_cooldown: f64,
    #[serde(default = "default_cooldown_reset")]
    pub cooldown_reset: f64,
    #[serde(default = "default_cooldown_decay")]
    pub cooldown_decay: f64,
    /// Consecutive ponders after which force markers replace ponder markers.
    #[serde(default = "default_force_after")]
    pub force_after: u32,
}

fn default_base_temperature() -> f64 {
    0.7
}

fn default_temperature_step() -> f64 {
    0.05
}

fn default_confidence_floor() -> f64 {
    2.0
}

fn default_initial_cooldown() -> f64 {
    1.0
}

fn default_cooldown_reset() -> f64 {
    3.0
}

fn default_cooldown_decay() -> f64 {
    1.025
}

fn default_force_after() -> u32 {
    10
}

impl Default for PonderConfig {
    fn default() -> Self {
        Self {
            base_temperature: default_base_temperature(),
            temperature_step: default_temperature_step(),
            confidence_floor: default_confidence_floor(),
            initial_cooldown: default_initial_cooldown(),
            cooldown_reset: default_cooldown_reset(),
            cooldown_decay: default_cooldown_decay(),
            force_after: default_force_after(),
        }
    }
}

/// Turn-scoped pondering state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PonderCounters {
    pub consecutive_ponders: u32,
    pub cooldown: f64,
}

/// What the policy sees for one token.
#[derive(Debug, Clone, Copy)]
pub struct TokenObservation<'a> {
    pub text: &'a str,
    pub log_probability: Option<f64>,
    pub cycle_detected: bool,
    /// Buffer already ends on a space or terminal punctuation.
    pub at_boundary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectReason {
    Cycle,
    ConfidenceFloor,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Accept {
        /// Emit a synthetic space before the token.
        leading_space: bool,
        intensity: f64,
        /// No log-probability was available; pondering is off for the rest of
        /// the turn.
        stop_pondering: bool,
    },
    /// Insert the marker and restart generation.
    Mark(Marker),
    /// Run a reflection episode and restart generation.
    Reflect(ReflectReason),
}

#[derive(Debug, Clone)]
pub struct PonderPolicy {
    config: PonderConfig,
    max_ponders: u32,
}

impl PonderPolicy {
    pub fn new(config: PonderConfig) -> Self {
        let max_ponders = if config.temperature_step > 0.0 {
            // Guard against 0.7 / 0.05 landing a hair under 14.
            ((config.base_temperature / config.temperature_step) - 1e-9)
                .ceil()
                .max(0.0) as u32
        } else {
            u32::MAX
        };
        Self {
            config,
            max_ponders,
        }
    }

    pub fn config(&self) -> &PonderConfig {
        &self.config
    }

    /// Consecutive low-confidence steps before the temperature reaches zero.
    pub fn max_ponders(&self) -> u32 {
        self.max_ponders
    }

    pub fn initial_counters(&self) -> PonderCounters {
        PonderCounters {
            consecutive_ponders: 0,
            cooldown: self.config.initial_cooldown,
        }
    }

    pub fn temperature(&self, counters: &PonderCounters) -> f64 {
        if counters.consecutive_ponders >= self.max_ponders {
            return 0.0;
        }
        (self.config.base_temperature
            - counters.consecutive_ponders as f64 * self.config.temperature_step)
            .max(0.0)
    }

    pub fn intensity(&self, counters: &PonderCounters) -> f64 {
        if self.max_ponders == 0 || self.max_ponders == u32::MAX {
            return 0.0;
        }
        counters.consecutive_ponders as f64 / self.max_ponders as f64
    }

    pub fn decide(&self, token: &TokenObservation<'_>, counters: &mut PonderCounters) -> Decision {
        if token.cycle_detected {
            return self.trigger(counters, ReflectReason::Cycle);
        }

        let Some(log_probability) = token.log_probability else {
            return self.accept(token, counters, true);
        };

        let threshold = -(self.config.confidence_floor + counters.cooldown);
        let low_confidence =
            log_probability.is_nan() || log_probability < threshold || token.text.is_empty();
        if !low_confidence {
            return self.accept(token, counters, false);
        }

        if self.temperature(counters) <= 0.0 {
            return self.trigger(counters, ReflectReason::ConfidenceFloor);
        }

        let marker = if counters.consecutive_ponders > self.config.force_after {
            Marker::Force
        } else {
            Marker::Ponder
        };
        counters.consecutive_ponders += 1;
        Decision::Mark(marker)
    }

    fn accept(
        &self,
        token: &TokenObservation<'_>,
        counters: &mut PonderCounters,
        stop_pondering: bool,
    ) -> Decision {
        let decision = Decision::Accept {
            leading_space: counters.consecutive_ponders > 0 && !token.at_boundary,
            intensity: self.intensity(counters),
            stop_pondering,
        };
        counters.consecutive_ponders = 0;
        counters.cooldown /= self.config.cooldown_decay;
        decision
    }

    fn trigger(&self, counters: &mut PonderCounters, reason: ReflectReason) -> Decision {
        counters.cooldown = self.config.cooldown_reset;
        counters.consecutive_ponders += 1;
        Decision::Reflect(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn low(text: &str, log_probability: f64) -> TokenObservation<'_> {
        TokenObservation {
            text,
            log_probability: Some(log_probability),
            cycle_detected: false,
            at_boundary: false,
        }
    }

    #[test]
    fn max_ponders_is_fourteen_by_default() {
        let policy = PonderPolicy::new(PonderConfig::default());
        assert_eq!(policy.max_ponders(), 14);
    }

    #[test]
    fn reflection_is_mandatory_after_exactly_fourteen_low_steps() {
        let policy = PonderPolicy::new(PonderConfig::default());
        let samples = [-3.5, -10.0, f64::NEG_INFINITY, -100.0, -4.0, -3.01, -50.0];

        for offset in 0..samples.len() {
            let mut counters = policy.initial_counters();
            let mut markers = Vec::new();
            let decision = loop {
                let lp = samples[(markers.len() + offset) % samples.len()];
                match policy.decide(&low("x", lp), &mut counters) {
                    Decision::Mark(marker) => markers.push(marker),
                    other => break other,
                }
                assert!(markers.len() <= 14);
            };
            assert_eq!(decision, Decision::Reflect(ReflectReason::ConfidenceFloor));
            assert_eq!(markers.len(), 14);
            assert_eq!(
                markers.iter().filter(|m| **m == Marker::Ponder).count(),
                11
            );
            assert!(markers[11..].iter().all(|m| *m == Marker::Force));
        }
    }

    #[test]
    fn temperature_anneals_to_zero() {
        let policy = PonderPolicy::new(PonderConfig::default());
        let mut counters = policy.initial_counters();
        assert!((policy.temperature(&counters) - 0.7).abs() < 1e-12);
        counters.consecutive_ponders = 13;
        assert!(policy.temperature(&counters) > 0.0);
        counters.consecutive_ponders = 14;
        assert_eq!(policy.temperature(&counters), 0.0);
    }

    #[test]
    fn empty_token_counts_as_low_confidence() {
        let policy = PonderPolicy::new(PonderConfig::default());
        let mut counters = policy.initial_counters();
        let decision = policy.decide(&low("", -0.01), &mut counters);
        assert_eq!(decision, Decision::Mark(Marker::Ponder));
        assert_eq!(counters.consecutive_ponders, 1);
    }

    #[test]
    fn confident_token_after_ponders_gets_leading_space() {
        let policy = PonderPolicy::new(PonderConfig::default());
        let mut counters = policy.initial_counters();
        policy.decide(&low("x", -9.0), &mut counters);
        policy.decide(&low("x", -9.0), &mut counters);

        let decision = policy.decide(&low("word", -0.1), &mut counters);
        match decision {
            Decision::Accept {
                leading_space,
                intensity,
                stop_pondering,
            } => {
                assert!(leading_space);
                assert!((intensity - 2.0 / 14.0).abs() < 1e-12);
                assert!(!stop_pondering);
            }
            other => panic!("unexpected decision {:?}", other),
        }
        assert_eq!(counters.consecutive_ponders, 0);
    }

    #[test]
    fn no_leading_space_at_boundary_or_without_ponders() {
        let policy = PonderPolicy::new(PonderConfig::default());
        let mut counters = policy.initial_counters();
        let plain = policy.decide(&low("word", -0.1), &mut counters);
        assert!(matches!(plain, Decision::Accept { leading_space: false, .. }));

        policy.decide(&low("x", -9.0), &mut counters);
        let at_boundary = TokenObservation {
            at_boundary: true,
            ..low("word", -0.1)
        };
        let decision = policy.decide(&at_boundary, &mut counters);
        assert!(matches!(decision, Decision::Accept { leading_space: false, .. }));
    }

    #[test]
    fn cooldown_decays_only_on_accepted_tokens() {
        let policy = PonderPolicy::new(PonderConfig::default());
        let mut counters = policy.initial_counters();
        policy.decide(&low("x", -9.0), &mut counters);
        assert_eq!(counters.cooldown, 1.0);
        policy.decide(&low("ok", -0.1), &mut counters);
        assert!((counters.cooldown - 1.0 / 1.025).abs() < 1e-12);
    }

    #[test]
    fn trigger_resets_cooldown_and_widens_threshold() {
        let policy = PonderPolicy::new(PonderConfig::default());
        let mut counters = PonderCounters {
            consecutive_ponders: 14,
            cooldown: 0.5,
        };
        let decision = policy.decide(&low("x", -9.0), &mut counters);
        assert_eq!(decision, Decision::Reflect(ReflectReason::ConfidenceFloor));
        assert_eq!(counters.cooldown, 3.0);
        assert_eq!(counters.consecutive_ponders, 15);

        // Threshold is now -5: a -4.9 token is accepted.
        let decision = policy.decide(&low("ok", -4.9), &mut counters);
        assert!(matches!(decision, Decision::Accept { .. }));
    }

    #[test]
    fn cycle_wins_over_confidence() {
        let policy = PonderPolicy::new(PonderConfig::default());
        let mut counters = policy.initial_counters();
        let token = TokenObservation {
            cycle_detected: true,
            ..low("fine", -0.01)
        };
        assert_eq!(
            policy.decide(&token, &mut counters),
            Decision::Reflect(ReflectReason::Cycle)
        );
        assert_eq!(counters.cooldown, 3.0);
    }

    #[test]
    fn missing_log_probability_accepts_and_stops_pondering() {
        let policy = PonderPolicy::new(PonderConfig::default());
        let mut counters = policy.initial_counters();
        let token = TokenObservation {
            log_probability: None,
            ..low("word", 0.0)
        };
        let decision = policy.decide(&token, &mut counters);
        assert!(matches!(
            decision,
            Decision::Accept {
                stop_pondering: true,
                ..
            }
        ));
    }

    #[test]
    fn nan_log_probability_is_untrusted() {
        let policy = PonderPolicy::new(PonderConfig::default());
        let mut counters = policy.initial_counters();
        assert_eq!(
            policy.decide(&low("x", f64::NAN), &mut counters),
            Decision::Mark(Marker::Ponder)
        );
    }
}
