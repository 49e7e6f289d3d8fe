//! The point-earning action catalog.
//!
//! Each action has a base award, a per-transaction ceiling, and a maximum
//! multiplier. The ceiling is checked after the multiplier is applied; an
//! award that would exceed it is rejected outright.

/// How an action earns points.
#[derive(Debug, Clone, Copy)]
pub struct ActionSpec {
    pub base_points: i64,
    /// Upper bound on `total_points` for one transaction of this action.
    pub ceiling: i64,
    pub max_multiplier: f64,
}

/// Look up the spec for an action type. Unknown actions earn nothing.
pub fn action_spec(action_type: &str) -> Option<ActionSpec> {
    let spec = match action_type {
        "FURNITURE_POSTED" => ActionSpec {
            base_points: 50,
            ceiling: 100,
            max_multiplier: 2.0,
        },
        "FURNITURE_RECOVERED" => ActionSpec {
            base_points: 75,
            ceiling: 150,
            max_multiplier: 2.0,
        },
        "RECOVERY_CONFIRMED" => ActionSpec {
            base_points: 25,
            ceiling: 50,
            max_multiplier: 2.0,
        },
        "REFERRAL_BONUS" => ActionSpec {
            base_points: 100,
            ceiling: 100,
            max_multiplier: 1.0,
        },
        "DAILY_CHECK_IN" => ActionSpec {
            base_points: 10,
            ceiling: 15,
            max_multiplier: 2.0,
        },
        _ => return None,
    };
    Some(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_actions_resolve() {
        assert_eq!(action_spec("FURNITURE_POSTED").unwrap().base_points, 50);
        assert_eq!(action_spec("DAILY_CHECK_IN").unwrap().ceiling, 15);
        assert!(action_spec("SELF_HIGH_FIVE").is_none());
    }

    #[test]
    fn ceilings_never_fall_below_base() {
        for action in [
            "FURNITURE_POSTED",
            "FURNITURE_RECOVERED",
            "RECOVERY_CONFIRMED",
            "REFERRAL_BONUS",
            "DAILY_CHECK_IN",
        ] {
            let spec = action_spec(action).unwrap();
            assert!(spec.ceiling >= spec.base_points, "{action}");
        }
    }
}
