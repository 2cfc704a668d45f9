use serde::{Deserialize, Serialize};
use std::fmt;

/// Basis shift operator `(offset, missing)`.
///
/// The operator has ones on the `offset`-th superdiagonal (subdiagonal when
/// negative), except for the first `missing` entries along that diagonal.
/// - `(0, 0)` is the identity
/// - `(0, 2)` is the identity with its first two ones removed
/// - `(1, 0)` reads one period ahead
/// - `(-1, 1)` reads one period back, skipping the first column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BasisKey {
    pub offset: i32,
    pub missing: u32,
}

impl BasisKey {
    pub const IDENTITY: BasisKey = BasisKey {
        offset: 0,
        missing: 0,
    };

    pub fn new(offset: i32, missing: u32) -> Self {
        Self { offset, missing }
    }

    /// Closed-form product `self ∘ rhs` of two basis operators.
    ///
    /// The offset of the product is always `i + j`; the missing count follows a
    /// case split on the signs of `i`, `j` and `i + j`.
    pub fn compose(self, rhs: BasisKey) -> BasisKey {
        let i = i64::from(self.offset);
        let m = i64::from(self.missing);
        let j = i64::from(rhs.offset);
        let n = i64::from(rhs.missing);
        let k = i + j;

        let l = if i >= 0 {
            if j >= 0 {
                m.max(n - i)
            } else if k >= 0 {
                m.max(n - k)
            } else {
                (m + k).max(n)
            }
        } else if j <= 0 {
            (m + j).max(n)
        } else {
            m.max(n) + (-i).min(j)
        };

        // Every branch is bounded below by m or n.
        debug_assert!(l >= 0);
        BasisKey {
            offset: k as i32,
            missing: l as u32,
        }
    }
}

impl From<(i32, u32)> for BasisKey {
    fn from((offset, missing): (i32, u32)) -> Self {
        Self { offset, missing }
    }
}

impl fmt::Display for BasisKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.offset, self.missing)
    }
}
