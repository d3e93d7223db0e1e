//! Proportional-band policy evaluator
//!
//! Turns a fan's current state and input temperature into a [`FanCommand`].
//!
//! # How It Works
//!
//! 1. **Manual override**: fans under operator control are never touched.
//!
//! 2. **Fail-safe**: no input temperature means maximum cooling.
//!
//! 3. **Hysteresis**: inside `target ± hysteresis_band / 2` nothing changes,
//!    so small fluctuations around target do not cause re-actuation.
//!
//! 4. **Proportional band**: outside the dead zone, speed scales linearly from
//!    `min_speed_percent` at target to `max_speed_percent` at
//!    `target + proportional_band`, clamped to that range.
//!
//! Everything here is pure: same inputs, same command.

use crate::data::{ControlMode, ControlPolicyConfig, FanCommand, FanPolicy, FanState};

/// Compute the command for one fan
///
/// `fan.target_temp` overrides `policy.target_temp` when set.
pub fn evaluate(fan: &FanState, input_temp: Option<f64>, policy: &FanPolicy) -> FanCommand {
    if fan.control_mode == ControlMode::Manual {
        return FanCommand::NoChange;
    }

    let input = match input_temp {
        Some(t) if t.is_finite() => t,
        _ => return FanCommand::SetSpeed(policy.max_speed_percent),
    };

    let target = fan.target_temp.unwrap_or(policy.target_temp);
    let delta = input - target;

    if delta.abs() < policy.hysteresis_band / 2.0 {
        return FanCommand::NoChange;
    }

    FanCommand::SetSpeed(proportional_speed(delta, policy))
}

/// Look up the fan's policy in `config` and evaluate; unknown fans get no change
pub fn evaluate_fan(fan: &FanState, input_temp: Option<f64>, config: &ControlPolicyConfig) -> FanCommand {
    match config.fan(&fan.fan_id) {
        Some(policy) => evaluate(fan, input_temp, policy),
        None => FanCommand::NoChange,
    }
}

/// Reduce the readings of a fan's bound sensors to one input temperature
///
/// The hottest reading wins. Any missing reading, or no readings at all,
/// yields `None` so the evaluator falls back to full cooling.
pub fn combine_inputs<I>(inputs: I) -> Option<f64>
where
    I: IntoIterator<Item = Option<f64>>,
{
    let mut hottest: Option<f64> = None;
    for input in inputs {
        let t = input?;
        hottest = Some(match hottest {
            Some(h) => h.max(t),
            None => t,
        });
    }
    hottest
}

fn proportional_speed(delta: f64, policy: &FanPolicy) -> u8 {
    let min = policy.min_speed_percent as f64;
    let max = policy.max_speed_percent as f64;

    let raw = min + (delta / policy.proportional_band) * (max - min);
    let desired = raw.clamp(min, max).round();

    (desired as u8).clamp(policy.min_speed_percent, policy.max_speed_percent)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> FanPolicy {
        FanPolicy::new("CPU_FAN_1", vec!["CPU_TEMP_1".into()], 65.0)
    }

    fn auto_fan() -> FanState {
        FanState::new("CPU_FAN_1", None, 50)
    }

    #[test]
    fn test_full_band_above_target() {
        // 85 °C, target 65, band 20 -> top of the band
        assert_eq!(evaluate(&auto_fan(), Some(85.0), &policy()), FanCommand::SetSpeed(100));
    }

    #[test]
    fn test_hysteresis_holds_near_target() {
        assert_eq!(evaluate(&auto_fan(), Some(66.0), &policy()), FanCommand::NoChange);

        let p = policy();
        let half = p.hysteresis_band / 2.0;
        let mut t = p.target_temp - half + 0.01;
        while t < p.target_temp + half {
            assert_eq!(evaluate(&auto_fan(), Some(t), &p), FanCommand::NoChange, "t = {}", t);
            t += 0.1;
        }
    }

    #[test]
    fn test_edge_of_dead_zone_actuates() {
        // delta == hysteresis/2 is outside the dead zone
        // 20 + (2/20)*80 = 28
        assert_eq!(evaluate(&auto_fan(), Some(67.0), &policy()), FanCommand::SetSpeed(28));
    }

    #[test]
    fn test_missing_input_fails_safe() {
        let mut p = policy();
        p.max_speed_percent = 90;
        assert_eq!(evaluate(&auto_fan(), None, &p), FanCommand::SetSpeed(90));
        assert_eq!(evaluate(&auto_fan(), Some(f64::NAN), &p), FanCommand::SetSpeed(90));
    }

    #[test]
    fn test_manual_is_never_overridden() {
        let mut fan = auto_fan();
        fan.control_mode = ControlMode::Manual;
        fan.speed_percent = 80;
        for input in [None, Some(20.0), Some(95.0), Some(149.0)] {
            assert_eq!(evaluate(&fan, input, &policy()), FanCommand::NoChange);
        }
    }

    #[test]
    fn test_below_target_clamps_to_floor() {
        assert_eq!(evaluate(&auto_fan(), Some(30.0), &policy()), FanCommand::SetSpeed(20));
    }

    #[test]
    fn test_result_always_within_limits() {
        let mut p = policy();
        p.min_speed_percent = 35;
        p.max_speed_percent = 85;
        p.hysteresis_band = 0.0;

        let mut t = -40.0;
        while t <= 150.0 {
            match evaluate(&auto_fan(), Some(t), &p) {
                FanCommand::SetSpeed(s) => assert!((35..=85).contains(&s), "t = {} s = {}", t, s),
                FanCommand::NoChange => {}
            }
            t += 0.25;
        }
    }

    #[test]
    fn test_fan_target_overrides_policy() {
        let mut fan = auto_fan();
        fan.target_temp = Some(50.0);
        // delta 10 against the fan target: 20 + 0.5 * 80 = 60
        assert_eq!(evaluate(&fan, Some(60.0), &policy()), FanCommand::SetSpeed(60));
    }

    #[test]
    fn test_evaluate_fan_unknown_policy() {
        let config = ControlPolicyConfig::default();
        assert_eq!(evaluate_fan(&auto_fan(), Some(90.0), &config), FanCommand::NoChange);
    }

    #[test]
    fn test_combine_inputs() {
        assert_eq!(combine_inputs([Some(40.0), Some(72.5), Some(60.0)]), Some(72.5));
        assert_eq!(combine_inputs([Some(40.0), None]), None);
        assert_eq!(combine_inputs(Vec::<Option<f64>>::new()), None);
    }
}
