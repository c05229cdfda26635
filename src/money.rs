use std::{
    fmt,
    iter::Sum,
    ops::{Add, AddAssign, Sub},
};

/// Tolerance used when comparing dollar amounts, one millionth of a dollar.
pub const TOLERANCE: f64 = 1e-6;

/// A dollar amount. Accumulation is plain `f64` addition, so two sums of the
/// same contributions in a different order are only equal within [`TOLERANCE`].
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
pub struct Usd(f64);

impl Usd {
    pub const ZERO: Usd = Usd(0.0);

    pub fn new(amount: f64) -> Self {
        Self(amount)
    }

    pub fn amount(&self) -> f64 {
        self.0
    }

    /// Share of this amount that a `percent` weight (0 to 100) represents.
    pub fn percent(&self, percent: f64) -> Self {
        Self(self.0 * (percent / 100.0))
    }

    pub fn approx_eq(&self, other: Usd) -> bool {
        (self.0 - other.0).abs() <= TOLERANCE
    }

    pub fn is_zero(&self) -> bool {
        self.0.abs() <= TOLERANCE
    }
}

impl From<f64> for Usd {
    fn from(amount: f64) -> Self {
        Self(amount)
    }
}

impl Add for Usd {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self(self.0 + other.0)
    }
}

impl Sub for Usd {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self(self.0 - other.0)
    }
}

impl AddAssign for Usd {
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Sum for Usd {
    fn sum<I: Iterator<Item = Usd>>(iter: I) -> Self {
        iter.fold(Usd::ZERO, |acc, x| acc + x)
    }
}

impl<'a> Sum<&'a Usd> for Usd {
    fn sum<I: Iterator<Item = &'a Usd>>(iter: I) -> Self {
        iter.fold(Usd::ZERO, |acc, x| acc + *x)
    }
}

impl fmt::Display for Usd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} USD", self.0)
    }
}
