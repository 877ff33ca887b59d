//! Physical-unit newtypes and the PD source-capability model.
//!
//! The newtypes exist so a misplaced mV/mA/mW/mOhm swap is caught by the
//! type checker rather than surfacing as a silent scaling bug three
//! components downstream.

use crate::config::PDO_MIN_MV;

macro_rules! unit_newtype {
    ($name:ident, $suffix:literal) => {
        #[repr(transparent)]
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", self.0, $suffix)
            }
        }

        impl From<u32> for $name {
            fn from(v: u32) -> Self {
                $name(v)
            }
        }
    };
}

unit_newtype!(Millivolt, "mV");
unit_newtype!(Milliamp, "mA");
unit_newtype!(Milliwatt, "mW");
unit_newtype!(Milliohm, "mOhm");

/// Which kind of PD source capability a `Pdo` entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdoVariant {
    Fixed,
    PpsApdo,
    SprAvsApdo,
    EprAvsApdo,
    /// A slot with no advertised capability (a hole in the PDO list).
    Unknown,
}

impl PdoVariant {
    pub fn is_apdo(self) -> bool {
        matches!(self, PdoVariant::PpsApdo | PdoVariant::SprAvsApdo | PdoVariant::EprAvsApdo)
    }
}

/// One advertised PD source capability, plus the load-resistance-derived
/// margins ProfileSelector reasons about.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pdo {
    pub variant: PdoVariant,
    pub mv_min: Millivolt,
    pub mv_max: Millivolt,
    pub ma_max: Milliamp,
}

impl Pdo {
    pub fn new(variant: PdoVariant, mv_min: u32, mv_max: u32, ma_max: u32) -> Self {
        // PD 3.2 forbids advertising below 5V; clamp defensively.
        let mv_min = mv_min.max(PDO_MIN_MV);
        Pdo { variant, mv_min: Millivolt(mv_min), mv_max: Millivolt(mv_max.max(mv_min)), ma_max: Milliamp(ma_max) }
    }

    pub fn fixed(mv: u32, ma_max: u32) -> Self {
        Self::new(PdoVariant::Fixed, mv, mv, ma_max)
    }

    /// Minimum source resistance (mOhm) this PDO can drive without
    /// exceeding `ma_max` at `mv_min`: `R = V / I`, scaled from mV/mA to
    /// mOhm. This is intrinsic to the PDO — it does not depend on the
    /// live target power.
    pub fn mohms_min(&self) -> u32 {
        if self.ma_max.0 == 0 {
            return u32::MAX;
        }
        ((self.mv_min.0 as u64 * 1000) / self.ma_max.0 as u64) as u32
    }

    pub fn mohms_min_plus_5pct(&self) -> u32 {
        self.mohms_min() * 105 / 100
    }

    pub fn mohms_min_plus_10pct(&self) -> u32 {
        self.mohms_min() * 110 / 100
    }

    /// Maximum power deliverable through this PDO given the live load
    /// resistance: min of the voltage-limited and current-limited bounds.
    pub fn pmax_mw(&self, load_mohms: u32) -> u32 {
        if load_mohms == 0 {
            return 0;
        }
        let voltage_limited = (self.mv_max.0 as u64 * self.mv_max.0 as u64) / load_mohms as u64;
        let current_limited = (self.ma_max.0 as u64 * self.ma_max.0 as u64 * load_mohms as u64) / 1_000_000;
        voltage_limited.min(current_limited) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_mv_clamped_to_5v_floor() {
        let pdo = Pdo::fixed(3300, 1000);
        assert_eq!(pdo.mv_min, Millivolt(5000));
    }

    #[test]
    fn pmax_is_voltage_limited_at_high_resistance() {
        // 9V/3A PDO over a 20 ohm load: voltage-limited to 81/20000*1e6=4050mW,
        // current-limited to 9e6*20000/1e6 = way higher -> voltage wins.
        let pdo = Pdo::fixed(9000, 3000);
        assert_eq!(pdo.pmax_mw(20_000), 4050);
    }

    #[test]
    fn pmax_zero_load_is_zero() {
        let pdo = Pdo::fixed(9000, 3000);
        assert_eq!(pdo.pmax_mw(0), 0);
    }
}
