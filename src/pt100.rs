//! PT100 resistance <-> temperature lookup.
//!
//! The table covers -50..400 degC in 10 degree steps (IEC 60751 alpha =
//! 0.00385). Between knots, `r2t_x10` interpolates linearly; `t2r_x10` is
//! the same table read the other way, so round-tripping a tabulated
//! temperature through `r2t_x10(t2r_x10(t))` is exact by construction.

const TABLE_MIN_C: i32 = -50;
const TABLE_STEP_C: i32 = 10;

/// Resistance in milliohms at each 10 degree step from -50 to 400 degC,
/// per IEC 60751 for a 100 ohm platinum RTD.
const RESISTANCE_MOHM: &[u32] = &[
    80_310, 84_270, 88_220, 92_160, 96_090, 100_000, 103_900, 107_790, 111_670, 115_540,
    119_400, 123_240, 127_080, 130_900, 134_710, 138_510, 142_290, 146_070, 149_830, 153_580,
    157_330, 161_050, 164_770, 168_480, 172_170, 175_860, 179_530, 183_190, 186_840, 190_470,
    194_100, 197_710, 201_310, 204_900, 208_480, 212_050, 215_610, 219_150, 222_680, 226_210,
    229_720, 233_210, 236_700, 240_180, 243_640, 247_090, 250_530,
];

fn table_index_for_temp(t10: i32) -> usize {
    let t_c = t10 / 10;
    ((t_c - TABLE_MIN_C) / TABLE_STEP_C).clamp(0, RESISTANCE_MOHM.len() as i32 - 1) as usize
}

/// Temperature (degC x10) at a tabulated knot -> resistance (mOhm).
pub fn t2r_x10(t10: i32) -> u32 {
    RESISTANCE_MOHM[table_index_for_temp(t10)]
}

/// Resistance (mOhm) -> temperature (degC x10), linearly interpolated
/// between the nearest knots. Out-of-table resistances clamp to the
/// nearest end.
pub fn r2t_x10(r_mohm: u32) -> i32 {
    if r_mohm <= RESISTANCE_MOHM[0] {
        return TABLE_MIN_C * 10;
    }
    let last = RESISTANCE_MOHM.len() - 1;
    if r_mohm >= RESISTANCE_MOHM[last] {
        return (TABLE_MIN_C + last as i32 * TABLE_STEP_C) * 10;
    }
    for i in 0..last {
        let (r0, r1) = (RESISTANCE_MOHM[i], RESISTANCE_MOHM[i + 1]);
        if r_mohm >= r0 && r_mohm <= r1 {
            let t0 = (TABLE_MIN_C + i as i32 * TABLE_STEP_C) * 10;
            let span = (r1 - r0) as i64;
            let frac = (r_mohm - r0) as i64;
            let t_delta = (TABLE_STEP_C as i64 * 10 * frac) / span;
            return t0 + t_delta as i32;
        }
    }
    unreachable!("resistance within table bounds but no bracket found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_exactly_at_table_knots() {
        for i in 0..RESISTANCE_MOHM.len() {
            let t10 = (TABLE_MIN_C + i as i32 * TABLE_STEP_C) * 10;
            assert_eq!(r2t_x10(t2r_x10(t10)), t10, "knot index {i}");
        }
    }

    #[test]
    fn interpolates_between_knots() {
        let r0 = RESISTANCE_MOHM[5]; // 0 degC
        let r1 = RESISTANCE_MOHM[6]; // 10 degC
        let mid = (r0 + r1) / 2;
        let t = r2t_x10(mid);
        assert!(t > 0 && t < 100);
    }

    #[test]
    fn clamps_outside_table() {
        assert_eq!(r2t_x10(0), TABLE_MIN_C * 10);
        assert_eq!(r2t_x10(u32::MAX), (TABLE_MIN_C + 46 * TABLE_STEP_C) * 10);
    }
}
