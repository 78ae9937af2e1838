//! Fixed-point frame positions
//!
//! A `Fixed` is a frame index with `FRAC_BITS` bits of sub-frame precision.
//! Packet positions, read requests and advance targets are all expressed in
//! this type so that fractional alignment survives arithmetic exactly.

use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// Number of fractional bits in a `Fixed` value.
pub const FRAC_BITS: u32 = 13;

const ONE_RAW: i64 = 1 << FRAC_BITS;
const FRAC_MASK: i64 = ONE_RAW - 1;

/// Frame position with integral and fractional parts
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Fixed(i64);

impl Fixed {
    pub const ZERO: Fixed = Fixed(0);
    pub const ONE: Fixed = Fixed(ONE_RAW);
    pub const MAX: Fixed = Fixed(i64::MAX);
    pub const MIN: Fixed = Fixed(i64::MIN);

    /// Position of the integral frame `frames`.
    pub const fn from_frames(frames: i64) -> Self {
        Fixed(frames << FRAC_BITS)
    }

    pub const fn from_raw(raw: i64) -> Self {
        Fixed(raw)
    }

    /// Nearest representable position to `frames`.
    pub fn from_f64(frames: f64) -> Self {
        Fixed((frames * ONE_RAW as f64).round() as i64)
    }

    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Largest integral frame `<= self`.
    pub const fn floor(self) -> i64 {
        self.0 >> FRAC_BITS
    }

    /// Smallest integral frame `>= self`.
    pub const fn ceiling(self) -> i64 {
        (self.0 + FRAC_MASK) >> FRAC_BITS
    }

    /// Nearest integral frame, halves rounded up.
    pub const fn round(self) -> i64 {
        (self.0 + ONE_RAW / 2) >> FRAC_BITS
    }

    /// `self` with the fractional part cleared (rounds toward negative infinity).
    pub const fn integral(self) -> Fixed {
        Fixed(self.0 & !FRAC_MASK)
    }

    /// Fractional part, always in `[0, 1)`.
    pub const fn fraction(self) -> Fixed {
        Fixed(self.0 & FRAC_MASK)
    }

    pub const fn is_integral(self) -> bool {
        self.0 & FRAC_MASK == 0
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / ONE_RAW as f64
    }
}

impl From<i64> for Fixed {
    fn from(frames: i64) -> Self {
        Fixed::from_frames(frames)
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

impl Add<i64> for Fixed {
    type Output = Fixed;

    fn add(self, frames: i64) -> Fixed {
        self + Fixed::from_frames(frames)
    }
}

impl Sub<i64> for Fixed {
    type Output = Fixed;

    fn sub(self, frames: i64) -> Fixed {
        self - Fixed::from_frames(frames)
    }
}

impl AddAssign for Fixed {
    fn add_assign(&mut self, rhs: Fixed) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Fixed {
    fn sub_assign(&mut self, rhs: Fixed) {
        self.0 -= rhs.0;
    }
}

impl Neg for Fixed {
    type Output = Fixed;

    fn neg(self) -> Fixed {
        Fixed(-self.0)
    }
}

impl fmt::Debug for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frac = self.fraction().raw();
        if frac == 0 {
            write!(f, "{}", self.floor())
        } else {
            write!(f, "{}+{}/{}", self.floor(), frac, ONE_RAW)
        }
    }
}

impl fmt::Display for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
