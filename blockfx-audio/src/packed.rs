//! Packed 16-bit lane arithmetic for the mixer
//!
//! A `u32` word carries two signed 16-bit lanes (low lane first, matching the
//! little-endian byte layout of two consecutive samples). 8-bit samples are widened
//! into the high byte of each lane with [`unpack8`] so the same lane math serves
//! both depths.
//!
//! Two interchangeable backends implement [`PackedLanes`]:
//! - [`Scalar`] splits the lanes and clamps each one; it is the reference.
//! - [`Swar`] adds both lanes in one register and patches overflowed lanes with
//!   bit masks.

/// Lane-wise saturating operations on two packed `i16`s
pub trait PackedLanes {
    /// Saturating add of each lane
    fn add_sat(a: u32, b: u32) -> u32;

    /// Multiply each lane by a Q15 level (`0x8000` is unity), saturating
    fn scale(word: u32, level: u16) -> u32;
}

/// Which [`PackedLanes`] implementation a mixer runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MixBackend {
    /// Lane-by-lane reference implementation
    Scalar,
    /// Both lanes in one register
    #[default]
    Swar,
}

/// Unity gain in Q15
pub const UNITY_LEVEL: u16 = 1 << 15;

#[inline(always)]
fn lo_lane(word: u32) -> i32 {
    word as u16 as i16 as i32
}

#[inline(always)]
fn hi_lane(word: u32) -> i32 {
    (word as i32) >> 16
}

#[inline(always)]
fn pack(lo: i32, hi: i32) -> u32 {
    (lo as u16 as u32) | ((hi as u16 as u32) << 16)
}

#[inline(always)]
fn saturate16(value: i32) -> i32 {
    value.clamp(i16::MIN as i32, i16::MAX as i32)
}

/// Reference backend
pub struct Scalar;

impl PackedLanes for Scalar {
    #[inline]
    fn add_sat(a: u32, b: u32) -> u32 {
        pack(
            saturate16(lo_lane(a) + lo_lane(b)),
            saturate16(hi_lane(a) + hi_lane(b)),
        )
    }

    #[inline]
    fn scale(word: u32, level: u16) -> u32 {
        let level = level as i32;
        pack(
            saturate16((lo_lane(word) * level) >> 15),
            saturate16((hi_lane(word) * level) >> 15),
        )
    }
}

/// SIMD-within-a-register backend
pub struct Swar;

impl PackedLanes for Swar {
    #[inline]
    fn add_sat(a: u32, b: u32) -> u32 {
        const SIGNS: u32 = 0x8000_8000;
        // Add the low 15 bits of each lane, then fold the sign bits back in without carry
        let sum = ((a & !SIGNS) + (b & !SIGNS)) ^ ((a ^ b) & SIGNS);
        // A lane overflowed when both inputs share a sign the sum does not
        let overflow = !(a ^ b) & (a ^ sum) & SIGNS;
        let mask = (overflow >> 15) * 0xFFFF;
        // 0x7FFF per lane, bumped to 0x8000 where the inputs were negative
        let limit = 0x7FFF_7FFF + ((a & SIGNS) >> 15);
        (sum & !mask) | (limit & mask)
    }

    #[inline]
    fn scale(word: u32, level: u16) -> u32 {
        // |lane * level| >> 15 never exceeds |lane| for level <= unity
        let level = level.min(UNITY_LEVEL) as i32;
        pack((lo_lane(word) * level) >> 15, (hi_lane(word) * level) >> 15)
    }
}

/// Toggle the bias of two packed 16-bit samples (unsigned <-> signed)
#[inline(always)]
pub fn flip16(word: u32) -> u32 {
    word ^ 0x8000_8000
}

/// Toggle the bias of four packed 8-bit samples (signed -> unsigned)
#[inline(always)]
pub fn flip8(word: u32) -> u32 {
    word ^ 0x8080_8080
}

/// Widen two 8-bit samples into the high bytes of two 16-bit lanes
#[inline(always)]
pub fn unpack8(half: u16) -> u32 {
    let half = half as u32;
    ((half & 0xFF00) << 16) | ((half & 0x00FF) << 8)
}

/// Inverse of [`unpack8`]
#[inline(always)]
pub fn pack8(word: u32) -> u16 {
    (((word & 0xFF00_0000) >> 16) | ((word & 0xFF00) >> 8)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    const EDGES: [i16; 9] = [i16::MIN, -32_767, -16_384, -1, 0, 1, 16_384, 32_766, i16::MAX];

    fn word(lo: i16, hi: i16) -> u32 {
        pack(lo as i32, hi as i32)
    }

    #[test]
    fn test_backends_agree_on_edge_pairs() {
        for &a0 in &EDGES {
            for &b0 in &EDGES {
                let a = word(a0, b0);
                let b = word(b0, a0);
                assert_eq!(Swar::add_sat(a, b), Scalar::add_sat(a, b), "{a0} {b0}");
                for level in [0u16, 1, 0x4000, 0x7FFF, UNITY_LEVEL] {
                    assert_eq!(Swar::scale(a, level), Scalar::scale(a, level));
                }
            }
        }
    }

    #[test]
    fn test_add_saturates_per_lane() {
        let max = word(i16::MAX, i16::MIN);
        let sum = Swar::add_sat(max, max);
        assert_eq!(lo_lane(sum), i16::MAX as i32);
        assert_eq!(hi_lane(sum), i16::MIN as i32);
        // Lanes do not bleed carries into each other
        let sum = Swar::add_sat(word(-1, 0), word(1, 0));
        assert_eq!(sum, 0);
    }

    #[test]
    fn test_unity_scale_is_identity() {
        for &x in &EDGES {
            let w = word(x, x.wrapping_neg());
            assert_eq!(Scalar::scale(w, UNITY_LEVEL), w);
            assert_eq!(Swar::scale(w, UNITY_LEVEL), w);
        }
    }

    #[test]
    fn test_half_level_halves() {
        let halved = Scalar::scale(word(1000, -1000), 0x4000);
        assert_eq!(lo_lane(halved), 500);
        assert_eq!(hi_lane(halved), -500);
    }

    #[test]
    fn test_unpack8_places_bytes_in_lane_high_halves() {
        assert_eq!(unpack8(0x12AB), 0x1200_AB00);
        assert_eq!(pack8(unpack8(0x12AB)), 0x12AB);
        // Unsigned 8-bit silence becomes signed zero in both lanes
        assert_eq!(flip16(unpack8(0x8080)), 0);
    }
}
