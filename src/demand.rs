//! Origin–destination travel demand.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifies a demand zone, as assigned by the trip generation model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneId(pub u32);

/// A matrix of trip rates between zones, in trips per hour.
///
/// Pairs are kept in a sorted map so that iteration, and therefore
/// assignment, is reproducible.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OdDemand {
    rates: BTreeMap<(ZoneId, ZoneId), f64>,
}

impl OdDemand {
    /// Creates an empty demand matrix.
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the trip rate between two zones. Non-positive or non-finite
    /// rates remove the pair.
    pub fn set(&mut self, origin: ZoneId, destination: ZoneId, rate: f64) {
        if rate.is_finite() && rate > 0.0 {
            self.rates.insert((origin, destination), rate);
        } else {
            self.rates.remove(&(origin, destination));
        }
    }

    /// Adds to the trip rate between two zones.
    pub fn add(&mut self, origin: ZoneId, destination: ZoneId, rate: f64) {
        let total = self.get(origin, destination) + rate;
        self.set(origin, destination, total);
    }

    /// Gets the trip rate between two zones.
    pub fn get(&self, origin: ZoneId, destination: ZoneId) -> f64 {
        self.rates
            .get(&(origin, destination))
            .copied()
            .unwrap_or(0.0)
    }

    /// Iterates over `(origin, destination, rate)`, grouped by origin.
    pub fn iter(&self) -> impl Iterator<Item = (ZoneId, ZoneId, f64)> + '_ {
        self.rates.iter().map(|((o, d), r)| (*o, *d, *r))
    }

    /// The number of pairs with non-zero demand.
    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    /// The total trip rate over all pairs.
    pub fn total(&self) -> f64 {
        self.rates.values().sum()
    }

    /// Trips produced by a zone minus trips attracted to it.
    pub fn net_production(&self, zone: ZoneId) -> f64 {
        self.iter()
            .map(|(o, d, r)| {
                let produced = if o == zone { r } else { 0.0 };
                let attracted = if d == zone { r } else { 0.0 };
                produced - attracted
            })
            .sum()
    }
}

impl FromIterator<(ZoneId, ZoneId, f64)> for OdDemand {
    fn from_iter<T: IntoIterator<Item = (ZoneId, ZoneId, f64)>>(iter: T) -> Self {
        let mut demand = OdDemand::new();
        for (o, d, r) in iter {
            demand.add(o, d, r);
        }
        demand
    }
}
