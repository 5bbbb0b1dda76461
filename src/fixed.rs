//! 17.14 fixed-point arithmetic.
//!
//! The feedback-queue scheduler needs deterministic real arithmetic without
//! touching the FPU. Real numbers are encoded in a signed 32-bit integer with
//! 14 fractional bits, so `1.0` is `1 << 14`. Products and quotients widen to
//! 64 bits internally; staying inside the representable range is the caller's
//! contract (nice values are clamped to [-20, 20], recent-CPU and the load
//! average are non-negative and bounded in practice).

use core::ops::{Add, Div, Mul, Sub};

/// Number of fractional bits.
const SHIFT: u32 = 14;

/// A real number in 17.14 fixed-point format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fixed(i32);

impl Fixed {
    /// `0.0`.
    pub const ZERO: Fixed = Fixed(0);
    /// `1.0`.
    pub const ONE: Fixed = Fixed(1 << SHIFT);

    /// Converts an integer to fixed point.
    pub const fn from_int(n: i32) -> Fixed {
        Fixed(n << SHIFT)
    }

    /// Builds the fraction `p / q` in fixed point.
    pub const fn from_ratio(p: i32, q: i32) -> Fixed {
        Fixed::from_int(p).div_raw(Fixed::from_int(q))
    }

    /// Converts to an integer, truncating toward zero.
    pub const fn to_int(self) -> i32 {
        self.0 / (1 << SHIFT)
    }

    /// Converts to an integer, rounding to the nearest.
    pub const fn to_int_nearest(self) -> i32 {
        if self.0 >= 0 {
            (self.0 + (1 << (SHIFT - 1))) / (1 << SHIFT)
        } else {
            (self.0 - (1 << (SHIFT - 1))) / (1 << SHIFT)
        }
    }

    /// Adds an integer, scaling it first.
    pub const fn add_int(self, n: i32) -> Fixed {
        Fixed(self.0 + (n << SHIFT))
    }

    /// Subtracts an integer, scaling it first.
    pub const fn sub_int(self, n: i32) -> Fixed {
        Fixed(self.0 - (n << SHIFT))
    }

    /// Multiplies by an integer directly, without scaling.
    pub const fn mul_int(self, n: i32) -> Fixed {
        Fixed(self.0 * n)
    }

    /// Divides by an integer directly, without scaling.
    pub const fn div_int(self, n: i32) -> Fixed {
        Fixed(self.0 / n)
    }

    const fn mul_raw(self, rhs: Fixed) -> Fixed {
        Fixed(((self.0 as i64 * rhs.0 as i64) >> SHIFT) as i32)
    }

    const fn div_raw(self, rhs: Fixed) -> Fixed {
        Fixed((((self.0 as i64) << SHIFT) / rhs.0 as i64) as i32)
    }
}

impl Add for Fixed {
    type Output = Fixed;
    fn add(self, rhs: Fixed) -> Fixed {
        Fixed(self.0 + rhs.0)
    }
}

impl Sub for Fixed {
    type Output = Fixed;
    fn sub(self, rhs: Fixed) -> Fixed {
        Fixed(self.0 - rhs.0)
    }
}

impl Mul for Fixed {
    type Output = Fixed;
    /// Widens to 64 bits, multiplies, then shifts right by the fractional
    /// width.
    fn mul(self, rhs: Fixed) -> Fixed {
        self.mul_raw(rhs)
    }
}

impl Div for Fixed {
    type Output = Fixed;
    /// Widens to 64 bits, shifts left by the fractional width, then divides.
    fn div(self, rhs: Fixed) -> Fixed {
        self.div_raw(rhs)
    }
}
