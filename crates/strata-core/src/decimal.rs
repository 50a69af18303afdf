use crate::error::StrataError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DIGIT_BASE: u16 = 10_000;

/// Arbitrary precision decimal stored as base-10000 digit groups.
///
/// `digits[0]` is multiplied by `10000^weight`, each following group by the
/// next lower power. `scale` is the number of decimal digits after the point
/// that the value was written with; it is kept so that values survive a round
/// trip exactly ("1.50" stays "1.50").
///
/// Values are normalized: no leading or trailing zero groups, and zero is never
/// negative.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Decimal {
    negative: bool,
    weight: i16,
    scale: u16,
    digits: Vec<u16>,
}

impl Decimal {
    pub fn zero() -> Self {
        Self {
            negative: false,
            weight: 0,
            scale: 0,
            digits: Vec::new(),
        }
    }

    /// Builds a decimal from raw wire parts, validating every digit group.
    pub fn from_parts(
        negative: bool,
        weight: i16,
        scale: u16,
        digits: Vec<u16>,
    ) -> Result<Self, StrataError> {
        if let Some(bad) = digits.iter().find(|d| **d >= DIGIT_BASE) {
            return Err(StrataError::codec(format!(
                "decimal digit group {bad} out of range"
            )));
        }
        let mut value = Self {
            negative,
            weight,
            scale,
            digits,
        };
        value.normalize()?;
        Ok(value)
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    pub fn is_zero(&self) -> bool {
        self.digits.is_empty()
    }

    pub fn weight(&self) -> i16 {
        self.weight
    }

    pub fn scale(&self) -> u16 {
        self.scale
    }

    pub fn digits(&self) -> &[u16] {
        &self.digits
    }

    /// True when the value has no fractional part worth writing.
    pub fn is_integer(&self) -> bool {
        self.scale == 0 && self.digits.len() as i32 <= self.weight as i32 + 1
    }

    fn normalize(&mut self) -> Result<(), StrataError> {
        let leading = self.digits.iter().take_while(|d| **d == 0).count();
        if leading == self.digits.len() {
            *self = Self {
                scale: self.scale,
                ..Self::zero()
            };
            return Ok(());
        }
        self.weight = i16::try_from(leading)
            .ok()
            .and_then(|leading| self.weight.checked_sub(leading))
            .ok_or_else(|| StrataError::codec("decimal weight out of range"))?;
        self.digits.drain(..leading);
        self.trim_trailing();
        Ok(())
    }

    fn trim_trailing(&mut self) {
        while self.digits.last() == Some(&0) {
            self.digits.pop();
        }
    }

    fn group(&self, exponent: i32) -> u16 {
        let index = self.weight as i32 - exponent;
        if index < 0 {
            return 0;
        }
        self.digits.get(index as usize).copied().unwrap_or(0)
    }
}

impl Default for Decimal {
    fn default() -> Self {
        Self::zero()
    }
}

impl FromStr for Decimal {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StrataError::codec(format!("invalid decimal literal: {s:?}"));
        let (negative, body) = match s.as_bytes().first() {
            Some(b'-') => (true, &s[1..]),
            Some(b'+') => (false, &s[1..]),
            _ => (false, s),
        };
        let (int_part, frac_part) = match body.split_once('.') {
            Some((i, f)) => (i, f),
            None => (body, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let scale = u16::try_from(frac_part.len()).map_err(|_| invalid())?;

        let int_pad = (4 - int_part.len() % 4) % 4;
        let int_digits: String = "0".repeat(int_pad) + int_part;
        let frac_pad = (4 - frac_part.len() % 4) % 4;
        let frac_digits: String = frac_part.to_string() + &"0".repeat(frac_pad);

        let int_groups = int_digits.len() / 4;
        let weight = i16::try_from(int_groups as i64 - 1).map_err(|_| invalid())?;
        let mut digits = Vec::with_capacity(int_groups + frac_digits.len() / 4);
        for chunk in int_digits.as_bytes().chunks(4).chain(frac_digits.as_bytes().chunks(4)) {
            let group = chunk
                .iter()
                .fold(0u16, |acc, b| acc * 10 + u16::from(b - b'0'));
            digits.push(group);
        }
        Decimal::from_parts(negative, weight, scale, digits)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        if self.negative {
            out.push('-');
        }
        if self.digits.is_empty() || self.weight < 0 {
            out.push('0');
        } else {
            for exponent in (0..=self.weight as i32).rev() {
                let group = self.group(exponent);
                if exponent == self.weight as i32 {
                    out.push_str(&group.to_string());
                } else {
                    out.push_str(&format!("{group:04}"));
                }
            }
        }
        if self.scale > 0 {
            out.push('.');
            let groups = (self.scale as i32 + 3) / 4;
            let mut frac = String::with_capacity(groups as usize * 4);
            for exponent in 1..=groups {
                frac.push_str(&format!("{:04}", self.group(-exponent)));
            }
            frac.truncate(self.scale as usize);
            out.push_str(&frac);
        }
        f.write_str(&out)
    }
}

impl From<i64> for Decimal {
    fn from(value: i64) -> Self {
        let mut magnitude = value.unsigned_abs();
        let mut groups = Vec::new();
        while magnitude > 0 {
            groups.push((magnitude % DIGIT_BASE as u64) as u16);
            magnitude /= DIGIT_BASE as u64;
        }
        if groups.is_empty() {
            return Decimal::zero();
        }
        groups.reverse();
        // the most significant group is non-zero, so only trailing zeros remain
        let mut decimal = Decimal {
            negative: value < 0,
            weight: groups.len() as i16 - 1,
            scale: 0,
            digits: groups,
        };
        decimal.trim_trailing();
        decimal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn parse(s: &str) -> Decimal {
        s.parse().expect("parse decimal")
    }

    #[test]
    fn groups_are_base_ten_thousand() {
        let d = parse("-12.340");
        assert!(d.is_negative());
        assert_eq!(d.weight(), 0);
        assert_eq!(d.scale(), 3);
        assert_eq!(d.digits(), &[12, 3400]);
        assert_eq!(d.to_string(), "-12.340");
    }

    #[test]
    fn small_fractions_have_negative_weight() {
        let d = parse("0.0001");
        assert_eq!(d.weight(), -1);
        assert_eq!(d.digits(), &[1]);
        assert_eq!(d.to_string(), "0.0001");
        assert_eq!(parse("0.00000005").to_string(), "0.00000005");
    }

    #[test]
    fn trailing_zero_groups_are_dropped() {
        let d = parse("10000");
        assert_eq!(d.weight(), 1);
        assert_eq!(d.digits(), &[1]);
        assert_eq!(d.to_string(), "10000");
    }

    #[test]
    fn zero_keeps_scale_and_loses_sign() {
        let d = parse("-0.00");
        assert!(d.is_zero());
        assert!(!d.is_negative());
        assert_eq!(d.to_string(), "0.00");
        assert_eq!(Decimal::zero().to_string(), "0");
    }

    #[test]
    fn from_i64_matches_text() {
        assert_eq!(Decimal::from(i64::MIN), parse("-9223372036854775808"));
        assert_eq!(Decimal::from(0), Decimal::zero());
        assert_eq!(Decimal::from(120_000), parse("120000"));
    }

    #[test]
    fn leading_zero_groups_shift_weight() {
        let d = Decimal::from_parts(false, 1, 0, vec![0, 7, 0]).expect("parts");
        assert_eq!(d, Decimal::from(7));
        assert!(Decimal::from_parts(false, i16::MIN, 0, vec![0, 5]).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Decimal>().is_err());
        assert!("-".parse::<Decimal>().is_err());
        assert!("1e5".parse::<Decimal>().is_err());
        assert!("1.2.3".parse::<Decimal>().is_err());
        assert!(Decimal::from_parts(false, 0, 0, vec![10_000]).is_err());
    }

    proptest! {
        #[test]
        fn text_round_trip(int in "[0-9]{1,30}", frac in "[0-9]{0,20}", negative in any::<bool>()) {
            let mut literal = String::new();
            if negative {
                literal.push('-');
            }
            literal.push_str(&int);
            if !frac.is_empty() {
                literal.push('.');
                literal.push_str(&frac);
            }
            let first = parse(&literal);
            let second = parse(&first.to_string());
            prop_assert_eq!(first, second);
        }
    }
}
