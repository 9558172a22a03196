use serde::{Deserialize, Serialize};

/// Saturation flow of a signalized approach, in veh/h/lane.
const SATURATION_FLOW: f64 = 1900.0;

/// The minimum share of the cycle any signalized approach receives.
const MIN_GREEN_SHARE: f64 = 0.25;

/// Critical gap for a minor-street movement at a stop-controlled node, in s.
const CRITICAL_GAP: f64 = 6.5;

/// Follow-up headway for a minor-street movement, in s.
const FOLLOW_UP_HEADWAY: f64 = 3.5;

/// Share of an opposing approach's capacity treated as conflicting traffic.
const CONFLICT_SHARE: f64 = 0.5;

/// How traffic is controlled at an intersection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntersectionControl {
    #[default]
    Unsignalized,
    Signalized,
    Roundabout,
    GradeSeparated,
}

/// Describes an inbound approach for the purposes of computing its capacity.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Approach {
    /// The approach link's own capacity in veh/h.
    pub capacity: f64,
    /// Number of lanes on the approach.
    pub lanes: u8,
}

impl IntersectionControl {
    /// Computes the capacity of one inbound approach, in veh/h.
    ///
    /// # Parameters
    /// * `approach` - The approach being evaluated
    /// * `num_approaches` - The number of inbound approaches at the node
    /// * `opposing_capacity` - The summed link capacity of all other approaches
    pub(crate) fn approach_capacity(
        self,
        approach: Approach,
        num_approaches: usize,
        opposing_capacity: f64,
    ) -> f64 {
        let lanes = approach.lanes as f64;
        match self {
            IntersectionControl::GradeSeparated => approach.capacity,
            IntersectionControl::Signalized => {
                let green = f64::max(1.0 / num_approaches.max(1) as f64, MIN_GREEN_SHARE);
                green * SATURATION_FLOW * lanes
            }
            IntersectionControl::Unsignalized => {
                let conflicting = CONFLICT_SHARE * opposing_capacity;
                gap_acceptance_capacity(conflicting) * lanes
            }
            IntersectionControl::Roundabout => {
                let circulating = CONFLICT_SHARE * opposing_capacity;
                1130.0 * (-0.001 * circulating).exp() * lanes
            }
        }
    }
}

/// Potential capacity of a minor movement crossing `conflicting` veh/h of priority flow.
fn gap_acceptance_capacity(conflicting: f64) -> f64 {
    if conflicting <= 1e-9 {
        return 3600.0 / FOLLOW_UP_HEADWAY;
    }
    let q = conflicting / 3600.0;
    conflicting * (-q * CRITICAL_GAP).exp() / (1.0 - (-q * FOLLOW_UP_HEADWAY).exp())
}

#[cfg(test)]
mod test {
    use super::*;

    const APPROACH: Approach = Approach {
        capacity: 1000.0,
        lanes: 2,
    };

    #[test]
    fn grade_separated_is_unconstrained() {
        let cap = IntersectionControl::GradeSeparated.approach_capacity(APPROACH, 4, 5000.0);
        assert_eq!(cap, 1000.0);
    }

    #[test]
    fn signal_splits_green_time() {
        let two = IntersectionControl::Signalized.approach_capacity(APPROACH, 2, 1000.0);
        let four = IntersectionControl::Signalized.approach_capacity(APPROACH, 4, 3000.0);
        assert!(two > four);
        assert_eq!(four, 0.25 * 1900.0 * 2.0);
    }

    #[test]
    fn gap_acceptance_falls_with_conflicting_flow() {
        let quiet = gap_acceptance_capacity(0.0);
        let busy = gap_acceptance_capacity(800.0);
        let saturated = gap_acceptance_capacity(2000.0);
        assert!(quiet > busy && busy > saturated);
        assert!(saturated > 0.0);
    }

    #[test]
    fn roundabout_entry_decays() {
        let a = IntersectionControl::Roundabout.approach_capacity(APPROACH, 3, 0.0);
        let b = IntersectionControl::Roundabout.approach_capacity(APPROACH, 3, 2000.0);
        assert_eq!(a, 2260.0);
        assert!(b < a);
    }
}
