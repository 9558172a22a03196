use serde::{Deserialize, Serialize};

/// Level of service, from free flow (A) to breakdown (F).
///
/// Bands follow the Highway Capacity Manual convention on the
/// volume-to-capacity ratio.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum LevelOfService {
    #[default]
    A = 0,
    B = 1,
    C = 2,
    D = 3,
    E = 4,
    F = 5,
}

/// Upper V/C bound (exclusive) of bands A through E.
const BANDS: [f64; 5] = [0.35, 0.55, 0.77, 0.90, 1.00];

impl LevelOfService {
    /// Classifies a volume-to-capacity ratio.
    pub fn from_vc_ratio(vc: f64) -> Self {
        use LevelOfService::*;
        match BANDS.iter().position(|bound| vc < *bound) {
            Some(0) => A,
            Some(1) => B,
            Some(2) => C,
            Some(3) => D,
            Some(4) => E,
            _ => F,
        }
    }

    /// A normalized value for colour ramps, A = 0 and F = 1.
    pub fn as_t(self) -> f64 {
        self as u8 as f64 / 5.0
    }

    /// Single-character grade letter.
    pub fn letter(self) -> char {
        (b'A' + self as u8) as char
    }

    /// Human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            LevelOfService::A => "LOS A (Free Flow)",
            LevelOfService::B => "LOS B (Stable Flow)",
            LevelOfService::C => "LOS C (Restricted Flow)",
            LevelOfService::D => "LOS D (Approaching Unstable)",
            LevelOfService::E => "LOS E (Unstable Flow)",
            LevelOfService::F => "LOS F (Breakdown)",
        }
    }
}

#[cfg(test)]
mod test {
    use super::LevelOfService::{self, *};

    #[test]
    fn band_boundaries() {
        let cases = [
            (0.0, A),
            (0.349, A),
            (0.35, B),
            (0.549, B),
            (0.55, C),
            (0.769, C),
            (0.77, D),
            (0.899, D),
            (0.90, E),
            (0.999, E),
            (1.0, F),
            (2.5, F),
        ];
        for (vc, los) in cases {
            assert_eq!(LevelOfService::from_vc_ratio(vc), los, "v/c = {}", vc);
        }
    }

    #[test]
    fn letters_and_ramp() {
        assert_eq!(A.letter(), 'A');
        assert_eq!(F.letter(), 'F');
        assert_eq!(A.as_t(), 0.0);
        assert_eq!(F.as_t(), 1.0);
        assert!(E.label().contains('E'));
    }
}
