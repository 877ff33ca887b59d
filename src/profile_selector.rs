//! PDO selection with hysteresis and safety guards.
//!
//! Plain functions over the `units::Pdo` model; no hidden state, so the
//! decision tree is a pure function of (pdos, current_index, load_mohms,
//! target_power_mw). The ordering matters: overcurrent protection first,
//! then the APDO minimum-voltage guard, then upgrade, then the downgrade
//! that trades a Fixed contract for a programmable one to avoid running
//! the PWM below 100% with no feedback path to step back down.

use crate::config::{PROFILE_APDO_GUARD_RATIO, PROFILE_HEADROOM_RATIO, PROFILE_UPGRADE_TRIGGER_RATIO};
use crate::units::{Pdo, PdoVariant};

/// Returns the index ProfileSelector judges best, which may equal
/// `current_index` (no change). Callers only switch PDO when the
/// returned index differs from `current_index`.
pub fn select(pdos: &[Pdo], current_index: usize, load_mohms: u32, target_power_mw: u32) -> usize {
    if pdos.is_empty() || load_mohms == 0 {
        return current_index;
    }
    let current = &pdos[current_index.min(pdos.len() - 1)];

    // 1. Emergency overcurrent: force the mandatory 5V fixed slot.
    if load_mohms < current.mohms_min_plus_5pct() {
        return 0;
    }

    // 2. APDO PWM-lock guard.
    if current.variant.is_apdo() && apdo_guard_trips(current, load_mohms, target_power_mw) {
        return 0;
    }

    let pmax_cur = current.pmax_mw(load_mohms);

    // 3. Upgrade trigger.
    if (target_power_mw as f32) > PROFILE_UPGRADE_TRIGGER_RATIO * pmax_cur as f32 {
        if let Some(i) = best_apdo_upgrade(pdos, load_mohms, target_power_mw) {
            return i;
        }
        if let Some(i) = best_any_upgrade(pdos, load_mohms, target_power_mw) {
            return i;
        }
        if let Some(i) = strongest_safe(pdos, load_mohms, target_power_mw) {
            return i;
        }
        return current_index;
    }

    // 4. Downgrade for PWM avoidance (only from a Fixed PDO).
    if current.variant == PdoVariant::Fixed {
        if let Some(i) = downgrade_target(pdos, load_mohms, target_power_mw) {
            return i;
        }
    }

    current_index
}

fn apdo_guard_trips(pdo: &Pdo, load_mohms: u32, target_power_mw: u32) -> bool {
    if pdo.mv_min.0 <= 5000 {
        return false;
    }
    let p_at_minv = (pdo.mv_min.0 as u64 * pdo.mv_min.0 as u64) / load_mohms as u64;
    p_at_minv as f32 > target_power_mw as f32 * PROFILE_APDO_GUARD_RATIO
}

fn has_margin(pdo: &Pdo, load_mohms: u32) -> bool {
    load_mohms >= pdo.mohms_min_plus_10pct()
}

/// Highest-index APDO satisfying margin, guard, and headroom, preferring
/// the strongest (highest-index) qualifying candidate.
fn best_apdo_upgrade(pdos: &[Pdo], load_mohms: u32, target_power_mw: u32) -> Option<usize> {
    (0..pdos.len())
        .rev()
        .find(|&i| {
            let pdo = &pdos[i];
            pdo.variant.is_apdo()
                && has_margin(pdo, load_mohms)
                && !apdo_guard_trips(pdo, load_mohms, target_power_mw)
                && (target_power_mw as f32) <= PROFILE_HEADROOM_RATIO * pdo.pmax_mw(load_mohms) as f32
        })
}

/// First non-Unknown PDO (in index order) that clears margin/guard and
/// has 10% headroom over target.
fn best_any_upgrade(pdos: &[Pdo], load_mohms: u32, target_power_mw: u32) -> Option<usize> {
    pdos.iter().position(|pdo| {
        pdo.variant != PdoVariant::Unknown
            && has_margin(pdo, load_mohms)
            && !(pdo.variant.is_apdo() && apdo_guard_trips(pdo, load_mohms, target_power_mw))
            && PROFILE_HEADROOM_RATIO * pdo.pmax_mw(load_mohms) as f32 > target_power_mw as f32
    })
}

/// Best-effort: the strongest PDO that is at least current-margin-safe,
/// used when nothing can comfortably supply the target.
fn strongest_safe(pdos: &[Pdo], load_mohms: u32, target_power_mw: u32) -> Option<usize> {
    pdos.iter()
        .enumerate()
        .filter(|(_, pdo)| {
            pdo.variant != PdoVariant::Unknown
                && has_margin(pdo, load_mohms)
                && !(pdo.variant.is_apdo() && apdo_guard_trips(pdo, load_mohms, target_power_mw))
        })
        .max_by_key(|(_, pdo)| pdo.pmax_mw(load_mohms))
        .map(|(i, _)| i)
}

/// Downgrade target when currently on a Fixed PDO and not upgrading:
/// prefer an APDO with headroom that doesn't trip the guard, else a
/// lower-voltage Fixed PDO that still supports the target.
fn downgrade_target(pdos: &[Pdo], load_mohms: u32, target_power_mw: u32) -> Option<usize> {
    if let Some(i) = pdos.iter().position(|pdo| {
        pdo.variant.is_apdo()
            && has_margin(pdo, load_mohms)
            && !apdo_guard_trips(pdo, load_mohms, target_power_mw)
            && PROFILE_HEADROOM_RATIO * pdo.pmax_mw(load_mohms) as f32 > target_power_mw as f32
    }) {
        return Some(i);
    }
    pdos.iter()
        .enumerate()
        .filter(|(_, pdo)| {
            pdo.variant == PdoVariant::Fixed
                && has_margin(pdo, load_mohms)
                && PROFILE_HEADROOM_RATIO * pdo.pmax_mw(load_mohms) as f32 > target_power_mw as f32
        })
        .min_by_key(|(_, pdo)| pdo.mv_min.0)
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_upgrade_to_apdo() {
        let pdos = vec![
            Pdo::fixed(5000, 3000),
            Pdo::fixed(9000, 3000),
            Pdo::new(PdoVariant::PpsApdo, 5000, 11000, 5000),
        ];
        let better = select(&pdos, 0, 3000, 8000);
        assert_eq!(better, 2);
    }

    #[test]
    fn s2_avs_guard_forces_fallback() {
        let pdos = vec![Pdo::fixed(5000, 3000), Pdo::new(PdoVariant::SprAvsApdo, 9000, 21000, 5000)];
        let better = select(&pdos, 1, 3000, 5000);
        assert_eq!(better, 0);
    }

    #[test]
    fn s3_downgrade_fixed_to_apdo() {
        let pdos = vec![Pdo::fixed(9000, 3000), Pdo::new(PdoVariant::PpsApdo, 5000, 11000, 3000)];
        let better = select(&pdos, 0, 20_000, 3000);
        assert_eq!(better, 1);
    }

    #[test]
    fn empty_list_or_zero_load_is_no_change() {
        assert_eq!(select(&[], 0, 1000, 5000), 0);
        let pdos = vec![Pdo::fixed(5000, 3000)];
        assert_eq!(select(&pdos, 0, 0, 5000), 0);
    }

    #[test]
    fn never_selects_index_below_10pct_margin_except_zero() {
        let pdos = vec![
            Pdo::fixed(5000, 3000),
            Pdo::fixed(9000, 3000),
            Pdo::new(PdoVariant::PpsApdo, 5000, 11000, 5000),
        ];
        for load in [500u32, 1500, 3000, 10_000, 50_000] {
            for target in [1000u32, 5000, 8000, 15000] {
                let i = select(&pdos, 1, load, target);
                if i != 0 {
                    assert!(load >= pdos[i].mohms_min_plus_10pct());
                }
            }
        }
    }
}
