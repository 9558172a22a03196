//! Engine configuration.
//!
//! Every section has calibrated defaults, so a configuration file only needs
//! to name the values it overrides.

use crate::error::ConfigError;
use crate::network::RoadClass;
use crate::util::Interval;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Configuration of the whole engine.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub assignment: AssignmentConfig,
    pub propagator: PropagatorConfig,
    pub lod: LodConfig,
    pub micro: MicroConfig,
    pub orchestrator: OrchestratorConfig,
}

/// Flow assignment parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    /// Number of incremental loading batches, between 5 and 10.
    pub batches: usize,
    /// Maximum number of successive-averages iterations.
    pub max_iterations: usize,
    /// Relative gap below which the assignment is converged.
    pub gap_tolerance: f64,
}

/// Congestion propagator parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagatorConfig {
    /// Jam density in veh/m/lane.
    pub jam_density: f64,
    /// Upper bound on the number of sub-steps per tick.
    pub max_substeps: usize,
}

/// Level of detail thresholds, in m from the viewpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LodConfig {
    /// Edges nearer than this run the simplified model.
    pub simplified_radius: f64,
    /// Edges nearer than this run the per-vehicle model.
    pub agent_radius: f64,
    /// Full width of the hysteresis band around each radius.
    pub hysteresis: f64,
}

/// Agent micro-model parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MicroConfig {
    /// Simulated seconds per cellular automaton step.
    pub step_seconds: f64,
    /// Upper bound on the number of steps run in one tick. Time beyond it is dropped.
    pub max_steps_per_tick: usize,
    /// Random slowdown probability per road class, overriding the class table.
    pub slowdown_prob: BTreeMap<RoadClass, f64>,
    /// Seed of the random streams.
    pub seed: u64,
    /// How strongly injection reacts to divergence from the aggregate occupancy.
    pub calibration_gain: f64,
    /// Bounds of the injection calibration factor.
    pub calibration_range: Interval<f64>,
    /// Lateral spacing of lanes in m, for rendering.
    pub lane_width: f64,
}

/// Orchestrator parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Simulated seconds between assignment runs.
    pub assignment_interval: f64,
    /// Weight of a newly assigned volume when blended into the published one.
    /// 1 disables smoothing.
    pub volume_smoothing: f64,
    /// Consecutive cycles an OD pair may stay unrouted before it is escalated.
    pub unrouted_retry_limit: u32,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            batches: 10,
            max_iterations: 50,
            gap_tolerance: 0.01,
        }
    }
}

impl Default for PropagatorConfig {
    fn default() -> Self {
        Self {
            jam_density: 1.0 / 7.5,
            max_substeps: 64,
        }
    }
}

impl Default for LodConfig {
    fn default() -> Self {
        Self {
            simplified_radius: 800.0,
            agent_radius: 300.0,
            hysteresis: 50.0,
        }
    }
}

impl Default for MicroConfig {
    fn default() -> Self {
        Self {
            step_seconds: 1.0,
            max_steps_per_tick: 8,
            slowdown_prob: BTreeMap::new(),
            seed: 0x5eed,
            calibration_gain: 0.5,
            calibration_range: Interval::new(0.25, 4.0),
            lane_width: 3.5,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            assignment_interval: 180.0,
            volume_smoothing: 0.7,
            unrouted_retry_limit: 3,
        }
    }
}

impl EngineConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Checks that every value is within its meaningful range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.assignment.validate()?;
        self.propagator.validate()?;
        self.lod.validate()?;
        self.micro.validate()?;
        self.orchestrator.validate()
    }
}

impl AssignmentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(5..=10).contains(&self.batches) {
            return Err(ConfigError::invalid(
                "assignment.batches",
                format!("must be between 5 and 10, got {}", self.batches),
            ));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::invalid("assignment.max_iterations", "must be at least 1"));
        }
        if !(self.gap_tolerance > 0.0 && self.gap_tolerance < 1.0) {
            return Err(ConfigError::invalid(
                "assignment.gap_tolerance",
                format!("must be in (0, 1), got {}", self.gap_tolerance),
            ));
        }
        Ok(())
    }
}

impl PropagatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("propagator.jam_density", self.jam_density)?;
        if self.max_substeps == 0 {
            return Err(ConfigError::invalid("propagator.max_substeps", "must be at least 1"));
        }
        Ok(())
    }
}

impl LodConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("lod.agent_radius", self.agent_radius)?;
        if !(self.simplified_radius > self.agent_radius) {
            return Err(ConfigError::invalid(
                "lod.simplified_radius",
                "must be greater than the agent radius",
            ));
        }
        if !(self.hysteresis >= 0.0 && self.hysteresis < self.simplified_radius - self.agent_radius)
        {
            return Err(ConfigError::invalid(
                "lod.hysteresis",
                "must be non-negative and narrower than the gap between the radii",
            ));
        }
        if self.hysteresis / 2.0 >= self.agent_radius {
            return Err(ConfigError::invalid(
                "lod.hysteresis",
                "half band must be smaller than the agent radius",
            ));
        }
        Ok(())
    }

    /// The distance band in which an edge is, or stays, in the agent tier.
    pub fn agent_band(&self) -> Interval<f64> {
        Interval::disc(self.agent_radius, self.hysteresis / 2.0)
    }

    /// The distance band in which an edge is, or stays, in the simplified tier.
    pub fn simplified_band(&self) -> Interval<f64> {
        Interval::disc(self.simplified_radius, self.hysteresis / 2.0)
    }
}

impl MicroConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("micro.step_seconds", self.step_seconds)?;
        positive("micro.lane_width", self.lane_width)?;
        if self.max_steps_per_tick == 0 {
            return Err(ConfigError::invalid(
                "micro.max_steps_per_tick",
                "must be at least 1",
            ));
        }
        for (class, p) in &self.slowdown_prob {
            if !(0.0..=1.0).contains(p) {
                return Err(ConfigError::invalid(
                    "micro.slowdown_prob",
                    format!("must be in [0, 1], got {} for {:?}", p, class),
                ));
            }
        }
        if !(self.calibration_gain >= 0.0 && self.calibration_gain.is_finite()) {
            return Err(ConfigError::invalid(
                "micro.calibration_gain",
                "must be non-negative and finite",
            ));
        }
        let range = self.calibration_range;
        if !(range.min > 0.0 && range.contains(1.0) && range.max.is_finite()) {
            return Err(ConfigError::invalid(
                "micro.calibration_range",
                format!("must be positive, finite and contain 1, got {:?}", range),
            ));
        }
        Ok(())
    }
}

impl MicroConfig {
    /// The random slowdown probability of a road class.
    pub fn slowdown_prob(&self, class: RoadClass) -> f64 {
        self.slowdown_prob
            .get(&class)
            .copied()
            .unwrap_or(class.params().slowdown_prob)
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("orchestrator.assignment_interval", self.assignment_interval)?;
        if !(self.volume_smoothing > 0.0 && self.volume_smoothing <= 1.0) {
            return Err(ConfigError::invalid(
                "orchestrator.volume_smoothing",
                format!("must be in (0, 1], got {}", self.volume_smoothing),
            ));
        }
        Ok(())
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be positive, got {}", value)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "assignment": { "batches": 5 }, "lod": { "agent_radius": 150.0 } }"#,
        )
        .unwrap();
        assert_eq!(config.assignment.batches, 5);
        assert_eq!(config.assignment.max_iterations, 50);
        assert_eq!(config.lod.agent_radius, 150.0);
        assert_eq!(config.lod.simplified_radius, 800.0);
        assert_eq!(config.micro, MicroConfig::default());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let err = EngineConfig::from_json_str(r#"{ "assignment": { "batches": 20 } }"#);
        assert!(matches!(
            err,
            Err(ConfigError::InvalidValue { field: "assignment.batches", .. })
        ));

        let err = EngineConfig::from_json_str(
            r#"{ "lod": { "agent_radius": 900.0, "simplified_radius": 800.0 } }"#,
        );
        assert!(matches!(
            err,
            Err(ConfigError::InvalidValue { field: "lod.simplified_radius", .. })
        ));

        let err =
            EngineConfig::from_json_str(r#"{ "orchestrator": { "volume_smoothing": 0.0 } }"#);
        assert!(err.is_err());

        let err =
            EngineConfig::from_json_str(r#"{ "micro": { "slowdown_prob": { "Local": 1.5 } } }"#);
        assert!(matches!(
            err,
            Err(ConfigError::InvalidValue { field: "micro.slowdown_prob", .. })
        ));
    }

    #[test]
    fn slowdown_prob_overrides_class_table() {
        let config = EngineConfig::from_json_str(
            r#"{ "micro": { "slowdown_prob": { "Highway": 0.0 } } }"#,
        )
        .unwrap();
        assert_eq!(config.micro.slowdown_prob(RoadClass::Highway), 0.0);
        assert_eq!(
            config.micro.slowdown_prob(RoadClass::Local),
            RoadClass::Local.params().slowdown_prob
        );
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = EngineConfig::from_file("/nonexistent/traffic-flow.json");
        assert!(matches!(err, Err(ConfigError::Io(_))));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = EngineConfig::from_json_str("{ assignment: }");
        assert!(matches!(err, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn hysteresis_bands_straddle_radii() {
        let lod = LodConfig::default();
        assert_eq!(lod.agent_band().min, 275.0);
        assert_eq!(lod.agent_band().max, 325.0);
        assert_eq!(lod.simplified_band().min, 775.0);
    }
}
