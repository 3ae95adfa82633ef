use serde::{Deserialize, Serialize};

use crate::domain::{DeviceState, Mode, Thresholds};

/// Which rule produced a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionRule {
    StopAtReached,
    ChargeBelow,
    SurplusAvailable,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub mode: Mode,
    pub rule: DecisionRule,
}

/// Chooses the operating mode of a device from its live state.
///
/// Rules are checked in priority order and the first match wins:
/// 1. SOC at or above `stop_at` -> STOP
/// 2. SOC below `charge_below` -> ECO
/// 3. surplus at or above the export threshold -> FAST
/// 4. otherwise ECO
///
/// SOC rules are skipped when no vehicle is connected. BOOST is never returned, boost
/// is time-triggered by installed windows.
#[derive(Debug, Clone, Copy)]
pub struct ModeDecisionEngine {
    pub export_threshold_w: f64,
}

impl ModeDecisionEngine {
    pub fn new(export_threshold_w: f64) -> Self {
        Self { export_threshold_w }
    }

    pub fn decide(&self, state: &DeviceState, thresholds: &Thresholds) -> Mode {
        self.evaluate(state, thresholds).mode
    }

    pub fn evaluate(&self, state: &DeviceState, thresholds: &Thresholds) -> Decision {
        if let Some(soc) = state.soc_percent {
            if thresholds.stop_at.is_some_and(|stop_at| soc >= stop_at) {
                return Decision {
                    mode: Mode::Stop,
                    rule: DecisionRule::StopAtReached,
                };
            }
            if thresholds.charge_below.is_some_and(|below| soc < below) {
                return Decision {
                    mode: Mode::Eco,
                    rule: DecisionRule::ChargeBelow,
                };
            }
        }

        if state.surplus_w >= self.export_threshold_w {
            Decision {
                mode: Mode::Fast,
                rule: DecisionRule::SurplusAvailable,
            }
        } else {
            Decision {
                mode: Mode::Eco,
                rule: DecisionRule::Default,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeviceId;
    use proptest::prelude::*;
    use rstest::rstest;

    fn state(surplus_w: f64, soc_percent: Option<f64>) -> DeviceState {
        DeviceState {
            device_id: DeviceId::new("zappi-1"),
            current_mode: Mode::Eco,
            surplus_w,
            soc_percent,
        }
    }

    fn thresholds(charge_below: Option<f64>, stop_at: Option<f64>) -> Thresholds {
        Thresholds {
            charge_below,
            stop_at,
            capacity_kwh: 40.0,
        }
    }

    #[test]
    fn test_surplus_with_soc_between_thresholds_is_fast() {
        let engine = ModeDecisionEngine::new(500.0);
        let decision = engine.evaluate(&state(3000.0, Some(25.0)), &thresholds(Some(20.0), Some(80.0)));
        assert_eq!(decision.mode, Mode::Fast);
        assert_eq!(decision.rule, DecisionRule::SurplusAvailable);
    }

    #[rstest]
    #[case(Some(80.0), 5000.0, Mode::Stop, DecisionRule::StopAtReached)]
    #[case(Some(95.0), -2000.0, Mode::Stop, DecisionRule::StopAtReached)]
    #[case(Some(10.0), 5000.0, Mode::Eco, DecisionRule::ChargeBelow)]
    #[case(Some(50.0), 499.0, Mode::Eco, DecisionRule::Default)]
    #[case(Some(50.0), 500.0, Mode::Fast, DecisionRule::SurplusAvailable)]
    #[case(None, 5000.0, Mode::Fast, DecisionRule::SurplusAvailable)]
    #[case(None, -100.0, Mode::Eco, DecisionRule::Default)]
    fn test_rule_priority(
        #[case] soc: Option<f64>,
        #[case] surplus: f64,
        #[case] mode: Mode,
        #[case] rule: DecisionRule,
    ) {
        let engine = ModeDecisionEngine::new(500.0);
        let decision = engine.evaluate(&state(surplus, soc), &thresholds(Some(20.0), Some(80.0)));
        assert_eq!(decision, Decision { mode, rule });
    }

    #[test]
    fn test_disabled_thresholds_follow_surplus_only() {
        let engine = ModeDecisionEngine::new(500.0);
        let t = thresholds(None, None);
        assert_eq!(engine.decide(&state(100.0, Some(100.0)), &t), Mode::Eco);
        assert_eq!(engine.decide(&state(900.0, Some(1.0)), &t), Mode::Fast);
    }

    #[test]
    fn test_boost_is_never_decided() {
        let engine = ModeDecisionEngine::new(0.0);
        let mut s = state(10_000.0, Some(50.0));
        s.current_mode = Mode::Boost;
        assert_ne!(engine.decide(&s, &thresholds(None, None)), Mode::Boost);
    }

    proptest! {
        #[test]
        fn prop_stop_at_wins_regardless_of_surplus(
            surplus in -20_000.0f64..20_000.0,
            stop_at in 1.0f64..100.0,
            over in 0.0f64..50.0,
        ) {
            let engine = ModeDecisionEngine::new(500.0);
            let soc = (stop_at + over).min(100.0).max(stop_at);
            let t = thresholds(Some(stop_at / 2.0), Some(stop_at));
            prop_assert_eq!(engine.decide(&state(surplus, Some(soc)), &t), Mode::Stop);
        }

        #[test]
        fn prop_charge_below_forces_eco(
            surplus in -20_000.0f64..20_000.0,
            charge_below in 1.0f64..90.0,
            soc_fraction in 0.0f64..1.0,
        ) {
            let engine = ModeDecisionEngine::new(500.0);
            let soc = charge_below * soc_fraction;
            let t = thresholds(Some(charge_below), Some(charge_below + 5.0));
            prop_assert_eq!(engine.decide(&state(surplus, Some(soc)), &t), Mode::Eco);
        }

        #[test]
        fn prop_disabled_thresholds_depend_only_on_surplus(
            surplus in -20_000.0f64..20_000.0,
            soc in prop::option::of(0.0f64..100.0),
            threshold in 0.0f64..5_000.0,
        ) {
            let engine = ModeDecisionEngine::new(threshold);
            let expected = if surplus >= threshold { Mode::Fast } else { Mode::Eco };
            prop_assert_eq!(engine.decide(&state(surplus, soc), &thresholds(None, None)), expected);
        }
    }
}
