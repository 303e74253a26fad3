//! Arbitrary-precision token amounts.
//!
//! Every on-chain amount is a non-negative integer of unbounded size. The
//! wrapper keeps all arithmetic explicit and checked: subtraction underflow
//! is an error, never a wrap or a saturation.

use std::fmt;
use std::ops::{AddAssign, SubAssign};
use std::str::FromStr;

use malachite::Natural;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{ChainError, ChainResult};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity {
    inner: Natural,
}

impl Quantity {
    pub fn zero() -> Self {
        Self {
            inner: Natural::from(0u32),
        }
    }

    pub fn from_u64(value: u64) -> Self {
        Self {
            inner: Natural::from(value),
        }
    }

    pub fn from_u128(value: u128) -> Self {
        Self {
            inner: Natural::from(value),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.inner == Natural::from(0u32)
    }

    pub fn add(&mut self, other: &Quantity) {
        self.inner.add_assign(other.inner.clone());
    }

    /// Checked subtraction; underflow leaves `self` untouched.
    pub fn sub(&mut self, other: &Quantity) -> ChainResult<()> {
        if self.inner < other.inner {
            return Err(ChainError::InsufficientBalance(format!(
                "quantity: {} less than {}",
                self.inner, other.inner
            )));
        }
        self.inner.sub_assign(other.inner.clone());
        Ok(())
    }

    pub fn mul(&mut self, other: &Quantity) {
        self.inner = &self.inner * &other.inner;
    }

    /// `floor(self * numerator / denominator)`.
    pub fn mul_div_floor(&self, numerator: &Quantity, denominator: &Quantity) -> ChainResult<Quantity> {
        if denominator.is_zero() {
            return Err(ChainError::Fatal("quantity: division by zero".into()));
        }
        let product = &self.inner * &numerator.inner;
        Ok(Quantity {
            inner: product / &denominator.inner,
        })
    }

    pub fn min(a: &Quantity, b: &Quantity) -> Quantity {
        if a <= b { a.clone() } else { b.clone() }
    }
}

/// Atomically moves `amount` from `src` to `dst`, failing without any change
/// when `src` does not cover it.
pub fn move_tokens(dst: &mut Quantity, src: &mut Quantity, amount: &Quantity) -> ChainResult<()> {
    src.sub(amount)?;
    dst.add(amount);
    Ok(())
}

impl Default for Quantity {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<u64> for Quantity {
    fn from(value: u64) -> Self {
        Quantity::from_u64(value)
    }
}

impl FromStr for Quantity {
    type Err = ChainError;

    fn from_str(s: &str) -> ChainResult<Self> {
        Natural::from_str(s)
            .map(|inner| Quantity { inner })
            .map_err(|_| ChainError::InvalidArgument("quantity: malformed amount".into()))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.inner.to_string())
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_underflow_is_rejected() {
        let mut a = Quantity::from_u64(5);
        let err = a.sub(&Quantity::from_u64(6)).unwrap_err();
        assert!(matches!(err, ChainError::InsufficientBalance(_)));
        assert_eq!(a, Quantity::from_u64(5));
    }

    #[test]
    fn move_tokens_is_atomic() {
        let mut src = Quantity::from_u64(100);
        let mut dst = Quantity::from_u64(1);
        move_tokens(&mut dst, &mut src, &Quantity::from_u64(40)).unwrap();
        assert_eq!(src, Quantity::from_u64(60));
        assert_eq!(dst, Quantity::from_u64(41));

        let err = move_tokens(&mut dst, &mut src, &Quantity::from_u64(61)).unwrap_err();
        assert!(matches!(err, ChainError::InsufficientBalance(_)));
        assert_eq!(src, Quantity::from_u64(60));
        assert_eq!(dst, Quantity::from_u64(41));
    }

    #[test]
    fn mul_div_floors() {
        let q = Quantity::from_u64(20);
        let shares = q
            .mul_div_floor(&Quantity::from_u64(100), &Quantity::from_u64(180))
            .unwrap();
        assert_eq!(shares, Quantity::from_u64(11));
    }

    #[test]
    fn string_roundtrip_handles_large_values() {
        let big: Quantity = "340282366920938463463374607431768211456123".parse().unwrap();
        assert_eq!(big.to_string().parse::<Quantity>().unwrap(), big);
    }
}
