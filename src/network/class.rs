use serde::{Deserialize, Serialize};

/// The functional class of a road segment.
///
/// Every class-dependent parameter (capacity, BPR calibration, wave speed,
/// driver randomization) is looked up from a fixed table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoadClass {
    Path,
    Local,
    OneWay,
    Avenue,
    Boulevard,
    Highway,
}

/// Calibration parameters for a road class.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClassParams {
    /// Capacity of a single lane in veh/h.
    pub lane_capacity: f64,
    /// Default free-flow speed in m/s.
    pub free_flow_speed: f64,
    /// BPR delay scale.
    pub alpha: f64,
    /// BPR exponent; larger values give a sharper breakdown near capacity.
    pub beta: f64,
    /// Speed at which congestion travels upstream, in m/s.
    pub wave_speed: f64,
    /// Probability that a vehicle randomly slows down in the cellular model.
    pub slowdown_prob: f64,
    /// Position in the road hierarchy, from footpaths (0) up to highways (4).
    pub hierarchy_level: u8,
}

const CLASS_TABLE: [ClassParams; 6] = [
    // Path
    ClassParams {
        lane_capacity: 300.0,
        free_flow_speed: 1.5,
        alpha: 1.0,
        beta: 2.0,
        wave_speed: 1.0,
        slowdown_prob: 0.5,
        hierarchy_level: 0,
    },
    // Local
    ClassParams {
        lane_capacity: 500.0,
        free_flow_speed: 8.3,
        alpha: 0.8,
        beta: 3.0,
        wave_speed: 4.2,
        slowdown_prob: 0.35,
        hierarchy_level: 1,
    },
    // OneWay
    ClassParams {
        lane_capacity: 800.0,
        free_flow_speed: 11.1,
        alpha: 0.6,
        beta: 4.0,
        wave_speed: 5.0,
        slowdown_prob: 0.3,
        hierarchy_level: 2,
    },
    // Avenue
    ClassParams {
        lane_capacity: 900.0,
        free_flow_speed: 13.9,
        alpha: 0.5,
        beta: 4.0,
        wave_speed: 5.6,
        slowdown_prob: 0.25,
        hierarchy_level: 2,
    },
    // Boulevard
    ClassParams {
        lane_capacity: 1200.0,
        free_flow_speed: 16.7,
        alpha: 0.3,
        beta: 5.0,
        wave_speed: 5.6,
        slowdown_prob: 0.2,
        hierarchy_level: 3,
    },
    // Highway
    ClassParams {
        lane_capacity: 2000.0,
        free_flow_speed: 27.8,
        alpha: 0.15,
        beta: 8.0,
        wave_speed: 5.6,
        slowdown_prob: 0.1,
        hierarchy_level: 4,
    },
];

impl RoadClass {
    /// All road classes, in hierarchy order.
    pub const ALL: [RoadClass; 6] = [
        RoadClass::Path,
        RoadClass::Local,
        RoadClass::OneWay,
        RoadClass::Avenue,
        RoadClass::Boulevard,
        RoadClass::Highway,
    ];

    /// Gets the calibration parameters of the class.
    pub const fn params(self) -> &'static ClassParams {
        &CLASS_TABLE[self as usize]
    }

    /// The capacity of an edge of this class with `lanes` lanes, in veh/h.
    pub fn capacity(self, lanes: u8) -> f64 {
        self.params().lane_capacity * lanes as f64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn capacity_grows_with_hierarchy() {
        for pair in RoadClass::ALL.windows(2) {
            assert!(pair[0].capacity(1) < pair[1].capacity(1), "{:?}", pair);
            assert!(pair[0].params().hierarchy_level <= pair[1].params().hierarchy_level);
        }
    }

    #[test]
    fn friction_and_breakdown_ordering() {
        // Urban streets pay more friction, highways break down more sharply
        assert!(RoadClass::Local.params().alpha > RoadClass::Highway.params().alpha);
        assert!(RoadClass::Highway.params().beta > RoadClass::Local.params().beta);
        let highway = RoadClass::Highway.params().slowdown_prob;
        assert!(highway < RoadClass::Local.params().slowdown_prob);
    }

    #[test]
    fn wave_speed_never_exceeds_free_flow() {
        for class in RoadClass::ALL {
            let p = class.params();
            assert!(p.wave_speed <= p.free_flow_speed, "{:?}", class);
        }
    }
}
