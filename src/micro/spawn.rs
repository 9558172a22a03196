use rand::Rng;
use rand_distr::{Distribution, Exp};

/// Samples `count` vehicle positions along an edge of the given length, in m
/// from its upstream end, sorted ascending.
///
/// Arrivals form a Poisson process at `flow` veh/s moving at `speed` m/s, so
/// spacings are exponential with mean `speed / flow`. If the sampled platoon
/// is longer than the edge it is compressed to fit. Without flow or speed,
/// vehicles are spread evenly.
pub(crate) fn sample_positions<R: Rng>(
    count: usize,
    length: f64,
    flow: f64,
    speed: f64,
    rng: &mut R,
) -> Vec<f64> {
    if count == 0 || !(length > 0.0) {
        return vec![];
    }
    let spacing = match Exp::new(flow / speed) {
        Ok(exp) if flow > 0.0 && speed > 0.0 => {
            (0..count).map(|_| exp.sample(rng)).collect::<Vec<f64>>()
        }
        _ => vec![length / count as f64; count],
    };

    // Lay vehicles out backwards from the downstream end
    let total: f64 = spacing.iter().sum();
    let scale = if total > length { length / total } else { 1.0 };
    let mut pos = length;
    let mut positions: Vec<f64> = spacing
        .iter()
        .map(|gap| {
            pos -= gap * scale;
            pos.max(0.0)
        })
        .collect();
    positions.reverse();
    positions
}

/// Finds the free cell nearest to `target`, preferring the downstream one on ties.
pub(crate) fn nearest_free<T>(cells: &[Option<T>], target: usize) -> Option<usize> {
    let len = cells.len();
    if len == 0 {
        return None;
    }
    let target = target.min(len - 1);
    (0..len).find_map(|offset| {
        let ahead = target + offset;
        if ahead < len && cells[ahead].is_none() {
            return Some(ahead);
        }
        let behind = target.checked_sub(offset)?;
        cells[behind].is_none().then_some(behind)
    })
}
