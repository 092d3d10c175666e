//! The normalized result of a gather call.

use serde::{Deserialize, Serialize};

use crate::error::{GatherError, GatherResult};

/// A gathered value, always a finite integer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Quantity {
    pub q: i64,
}

impl Quantity {
    pub const fn new(q: i64) -> Self {
        Self { q }
    }

    /// Normalize a raw sample into a quantity.
    ///
    /// Rounds half away from zero (`2.5 → 3`, `-2.5 → -3`). NaN is the
    /// backend's "no data" marker and yields [`GatherError::NoData`];
    /// infinities and values outside the `i64` range yield
    /// [`GatherError::OutOfRange`].
    pub fn from_sample(value: f64) -> GatherResult<Self> {
        if value.is_nan() {
            return Err(GatherError::NoData);
        }
        let rounded = value.round();
        // i64::MAX is not exactly representable; 2^63 is the first value past it.
        if !rounded.is_finite() || rounded < i64::MIN as f64 || rounded >= i64::MAX as f64 {
            return Err(GatherError::OutOfRange(value));
        }
        Ok(Self { q: rounded as i64 })
    }
}

impl From<i64> for Quantity {
    fn from(q: i64) -> Self {
        Self { q }
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.q)
    }
}
