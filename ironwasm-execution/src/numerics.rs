//! Numeric semantics: trapping integer division, shift/rotate masking,
//! NaN-aware float min/max, round-half-to-even, and the trapping
//! float-to-integer truncations.
//!
//! The saturating `trunc_sat` family needs no helpers: Rust's `as` casts
//! from float to integer saturate at the bounds and send NaN to zero,
//! which is exactly the required behavior.

use crate::runtime_structure::{EResult, Trap};

pub trait IntOps: Sized + Copy {
    fn idiv_s(a: Self, b: Self) -> EResult<Self>;
    fn idiv_u(a: Self, b: Self) -> EResult<Self>;
    fn irem_s(a: Self, b: Self) -> EResult<Self>;
    fn irem_u(a: Self, b: Self) -> EResult<Self>;
    fn ishl(a: Self, b: Self) -> Self;
    fn ishr_s(a: Self, b: Self) -> Self;
    fn ishr_u(a: Self, b: Self) -> Self;
    fn irotl(a: Self, b: Self) -> Self;
    fn irotr(a: Self, b: Self) -> Self;
    fn iclz(a: Self) -> Self;
    fn ictz(a: Self) -> Self;
    fn ipopcnt(a: Self) -> Self;
}

macro_rules! int_ops {
    ($t:ty, $u:ty) => {
        impl IntOps for $t {
            fn idiv_s(a: Self, b: Self) -> EResult<Self> {
                if b == 0 {
                    return Err(Trap::new("Integer divide by zero"));
                }
                if a == <$t>::MIN && b == -1 {
                    return Err(Trap::new("Integer overflow"));
                }
                Ok(a.wrapping_div(b))
            }

            fn idiv_u(a: Self, b: Self) -> EResult<Self> {
                if b == 0 {
                    return Err(Trap::new("Integer divide by zero"));
                }
                Ok(((a as $u) / (b as $u)) as $t)
            }

            fn irem_s(a: Self, b: Self) -> EResult<Self> {
                if b == 0 {
                    return Err(Trap::new("Integer remainder by zero"));
                }
                if a == <$t>::MIN && b == -1 {
                    return Ok(0);
                }
                Ok(a.wrapping_rem(b))
            }

            fn irem_u(a: Self, b: Self) -> EResult<Self> {
                if b == 0 {
                    return Err(Trap::new("Integer remainder by zero"));
                }
                Ok(((a as $u) % (b as $u)) as $t)
            }

            // wrapping_shl/shr mask the amount by the bit width, which is
            // the required modulo semantics.
            fn ishl(a: Self, b: Self) -> Self {
                a.wrapping_shl(b as u32)
            }

            fn ishr_s(a: Self, b: Self) -> Self {
                a.wrapping_shr(b as u32)
            }

            fn ishr_u(a: Self, b: Self) -> Self {
                ((a as $u).wrapping_shr(b as u32)) as $t
            }

            fn irotl(a: Self, b: Self) -> Self {
                ((a as $u).rotate_left(b as u32)) as $t
            }

            fn irotr(a: Self, b: Self) -> Self {
                ((a as $u).rotate_right(b as u32)) as $t
            }

            fn iclz(a: Self) -> Self {
                (a as $u).leading_zeros() as $t
            }

            fn ictz(a: Self) -> Self {
                (a as $u).trailing_zeros() as $t
            }

            fn ipopcnt(a: Self) -> Self {
                (a as $u).count_ones() as $t
            }
        }
    };
}

int_ops!(i32, u32);
int_ops!(i64, u64);

pub trait FloatOps: Sized + Copy {
    fn fmin(a: Self, b: Self) -> Self;
    fn fmax(a: Self, b: Self) -> Self;
    fn fnearest(v: Self) -> Self;
}

macro_rules! float_ops {
    ($f:ty) => {
        impl FloatOps for $f {
            fn fmin(a: Self, b: Self) -> Self {
                if a.is_nan() || b.is_nan() {
                    return <$f>::NAN;
                }
                if a == 0.0 && b == 0.0 {
                    return if a.is_sign_negative() || b.is_sign_negative() { -0.0 } else { 0.0 };
                }
                if a < b { a } else { b }
            }

            fn fmax(a: Self, b: Self) -> Self {
                if a.is_nan() || b.is_nan() {
                    return <$f>::NAN;
                }
                if a == 0.0 && b == 0.0 {
                    return if a.is_sign_negative() && b.is_sign_negative() { -0.0 } else { 0.0 };
                }
                if a > b { a } else { b }
            }

            fn fnearest(v: Self) -> Self {
                if v.is_nan() || v.is_infinite() || v == 0.0 {
                    return v;
                }
                v.round_ties_even()
            }
        }
    };
}

float_ops!(f32);
float_ops!(f64);

// Non-saturating truncations. All bounds are exactly representable as
// f64 except the i64/u64 maxima, where the open bound on the next power
// of two rejects exactly the out-of-range values.

pub fn trunc_s_f64_i32(v: f64) -> EResult<i32> {
    if v.is_nan() {
        return Err(Trap::new("Invalid conversion from NaN"));
    }
    let t = v.trunc();
    if t < -2_147_483_648.0 || t > 2_147_483_647.0 {
        return Err(Trap::new("Integer overflow during truncation"));
    }
    Ok(t as i32)
}

pub fn trunc_u_f64_i32(v: f64) -> EResult<u32> {
    if v.is_nan() {
        return Err(Trap::new("Invalid conversion from NaN"));
    }
    let t = v.trunc();
    if t < 0.0 || t > 4_294_967_295.0 {
        return Err(Trap::new("Integer overflow during truncation"));
    }
    Ok(t as u32)
}

pub fn trunc_s_f64_i64(v: f64) -> EResult<i64> {
    if v.is_nan() {
        return Err(Trap::new("Invalid conversion from NaN"));
    }
    let t = v.trunc();
    if t < -9_223_372_036_854_775_808.0 || t >= 9_223_372_036_854_775_808.0 {
        return Err(Trap::new("Integer overflow during truncation"));
    }
    Ok(t as i64)
}

pub fn trunc_u_f64_i64(v: f64) -> EResult<u64> {
    if v.is_nan() {
        return Err(Trap::new("Invalid conversion from NaN"));
    }
    let t = v.trunc();
    if t < 0.0 || t >= 18_446_744_073_709_551_616.0 {
        return Err(Trap::new("Integer overflow during truncation"));
    }
    Ok(t as u64)
}

pub fn trunc_s_f32_i32(v: f32) -> EResult<i32> {
    trunc_s_f64_i32(f64::from(v))
}

pub fn trunc_u_f32_i32(v: f32) -> EResult<u32> {
    trunc_u_f64_i32(f64::from(v))
}

pub fn trunc_s_f32_i64(v: f32) -> EResult<i64> {
    trunc_s_f64_i64(f64::from(v))
}

pub fn trunc_u_f32_i64(v: f32) -> EResult<u64> {
    trunc_u_f64_i64(f64::from(v))
}
