//! Q17.14 fixed-point arithmetic for the MLFQS scheduler (spec §4.K),
//! grounded exactly on the reference implementation's operator set: every
//! operator is defined even though the MLFQS formula only needs a subset.

const FRACTION_BITS: i32 = 14;
const SCALE: i64 = 1 << FRACTION_BITS;

/// A signed 17.14 fixed-point number, stored as a scaled `i64` so
/// intermediate products never overflow before rounding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Fixed(i64);

impl Fixed {
    pub fn from_int(n: i32) -> Self {
        Self((n as i64) * SCALE)
    }

    pub fn to_int_truncate(self) -> i32 {
        (self.0 / SCALE) as i32
    }

    /// Rounds to the nearest integer, ties away from zero.
    pub fn to_int_round(self) -> i32 {
        if self.0 >= 0 {
            ((self.0 + SCALE / 2) / SCALE) as i32
        } else {
            ((self.0 - SCALE / 2) / SCALE) as i32
        }
    }

    pub fn add(self, other: Fixed) -> Fixed {
        Fixed(self.0 + other.0)
    }

    pub fn sub(self, other: Fixed) -> Fixed {
        Fixed(self.0 - other.0)
    }

    pub fn add_int(self, n: i32) -> Fixed {
        Fixed(self.0 + (n as i64) * SCALE)
    }

    pub fn sub_int(self, n: i32) -> Fixed {
        Fixed(self.0 - (n as i64) * SCALE)
    }

    pub fn mul(self, other: Fixed) -> Fixed {
        Fixed(((self.0 as i128 * other.0 as i128) / SCALE as i128) as i64)
    }

    pub fn mul_int(self, n: i32) -> Fixed {
        Fixed(self.0 * n as i64)
    }

    pub fn div(self, other: Fixed) -> Fixed {
        Fixed(((self.0 as i128 * SCALE as i128) / other.0 as i128) as i64)
    }

    pub fn div_int(self, n: i32) -> Fixed {
        Fixed(self.0 / n as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_round_trip() {
        assert_eq!(Fixed::from_int(5).to_int_truncate(), 5);
        assert_eq!(Fixed::from_int(-5).to_int_truncate(), -5);
    }

    #[test]
    fn rounding_matches_ties_away_from_zero() {
        let half = Fixed::from_int(1).div_int(2);
        assert_eq!(Fixed::from_int(2).add(half).to_int_round(), 3);
        assert_eq!(Fixed::from_int(-2).sub(half).to_int_round(), -3);
    }

    #[test]
    fn mul_and_div_are_inverse() {
        let a = Fixed::from_int(7);
        let b = Fixed::from_int(3);
        let product = a.mul(b);
        assert_eq!(product.to_int_truncate(), 21);
        assert_eq!(product.div(b).to_int_round(), 7);
    }

    #[test]
    fn add_sub_int_match_add_sub_of_from_int() {
        let a = Fixed::from_int(10);
        assert_eq!(a.add_int(5), a.add(Fixed::from_int(5)));
        assert_eq!(a.sub_int(5), a.sub(Fixed::from_int(5)));
    }
}
