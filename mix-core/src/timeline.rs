//! Affine maps between reference time and subject positions
//!
//! `TimelineFunction` maps a reference timeline (usually nanoseconds of some
//! clock) onto a subject timeline (usually `Fixed` frames in raw units).
//! All intermediate math is done in 128 bits and rounds toward negative
//! infinity, so forward and inverse maps agree at exact points.

/// A non-negative ratio `subject_delta / reference_delta`, kept reduced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimelineRate {
    subject_delta: u64,
    reference_delta: u64,
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl TimelineRate {
    pub const ZERO: TimelineRate = TimelineRate {
        subject_delta: 0,
        reference_delta: 1,
    };

    pub const IDENTITY: TimelineRate = TimelineRate {
        subject_delta: 1,
        reference_delta: 1,
    };

    /// Nanoseconds per second.
    pub const NS_PER_SECOND: TimelineRate = TimelineRate {
        subject_delta: 1_000_000_000,
        reference_delta: 1,
    };

    /// # Panics
    /// If `reference_delta` is zero.
    pub fn new(subject_delta: u64, reference_delta: u64) -> Self {
        assert!(reference_delta != 0, "TimelineRate reference_delta must be non-zero");
        if subject_delta == 0 {
            return Self::ZERO;
        }
        let g = gcd(subject_delta, reference_delta);
        Self {
            subject_delta: subject_delta / g,
            reference_delta: reference_delta / g,
        }
    }

    pub fn subject_delta(&self) -> u64 {
        self.subject_delta
    }

    pub fn reference_delta(&self) -> u64 {
        self.reference_delta
    }

    /// # Panics
    /// If the rate is zero, which has no inverse.
    pub fn inverse(&self) -> Self {
        assert!(self.subject_delta != 0, "cannot invert a zero TimelineRate");
        Self {
            subject_delta: self.reference_delta,
            reference_delta: self.subject_delta,
        }
    }

    /// `a * b`, reduced. Precision is dropped only if the reduced product does
    /// not fit in 64 bits.
    pub fn product(a: TimelineRate, b: TimelineRate) -> Self {
        let mut s = a.subject_delta as u128 * b.subject_delta as u128;
        let mut r = a.reference_delta as u128 * b.reference_delta as u128;
        if s == 0 {
            return Self::ZERO;
        }
        let g = {
            let (mut x, mut y) = (s, r);
            while y != 0 {
                let t = x % y;
                x = y;
                y = t;
            }
            x
        };
        s /= g;
        r /= g;
        while s > u64::MAX as u128 || r > u64::MAX as u128 {
            s >>= 1;
            r >>= 1;
        }
        Self::new(s as u64, r.max(1) as u64)
    }

    /// `value * rate`, rounded toward negative infinity.
    pub fn scale(&self, value: i64) -> i64 {
        let num = value as i128 * self.subject_delta as i128;
        num.div_euclid(self.reference_delta as i128) as i64
    }

    /// `value * rate`, rounded toward positive infinity.
    pub fn scale_ceiling(&self, value: i64) -> i64 {
        let num = value as i128 * self.subject_delta as i128;
        let r = self.reference_delta as i128;
        (num.div_euclid(r) + if num.rem_euclid(r) != 0 { 1 } else { 0 }) as i64
    }
}

/// Invertible affine map `subject = (reference - reference_time) * rate + subject_time`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimelineFunction {
    subject_time: i64,
    reference_time: i64,
    rate: TimelineRate,
}

impl TimelineFunction {
    pub fn new(subject_time: i64, reference_time: i64, rate: TimelineRate) -> Self {
        Self {
            subject_time,
            reference_time,
            rate,
        }
    }

    pub fn identity() -> Self {
        Self::new(0, 0, TimelineRate::IDENTITY)
    }

    pub fn subject_time(&self) -> i64 {
        self.subject_time
    }

    pub fn reference_time(&self) -> i64 {
        self.reference_time
    }

    pub fn rate(&self) -> TimelineRate {
        self.rate
    }

    pub fn invertible(&self) -> bool {
        self.rate.subject_delta != 0
    }

    pub fn apply(&self, reference: i64) -> i64 {
        self.rate.scale(reference - self.reference_time) + self.subject_time
    }

    /// # Panics
    /// If the function is not invertible.
    pub fn apply_inverse(&self, subject: i64) -> i64 {
        self.rate.inverse().scale(subject - self.subject_time) + self.reference_time
    }

    /// # Panics
    /// If the function is not invertible.
    pub fn inverse(&self) -> Self {
        Self::new(self.reference_time, self.subject_time, self.rate.inverse())
    }

    /// The function `x -> bc(ab(x))`.
    pub fn compose(bc: &TimelineFunction, ab: &TimelineFunction) -> Self {
        Self::new(
            bc.apply(ab.subject_time),
            ab.reference_time,
            TimelineRate::product(bc.rate, ab.rate),
        )
    }
}
