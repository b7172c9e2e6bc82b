//! Fixed-precision binary floating point over `num-bigint`.
//!
//! A [`BigFloat`] is `(-1)^negative * mantissa * 2^exponent`. Every
//! constructor and every arithmetic result is rounded to the mantissa width of
//! a [`FloatContext`] and then normalised (odd mantissa, or the canonical
//! zero), so structural equality is numeric equality.
//!
//! Text output is the shortest decimal that parses back to the identical
//! value, printed like C's `%g` (`7`, `0.25`, `1.5e+21`, `1e-07`).

use std::cmp::Ordering;
use std::fmt::{self, Write as _};
use std::ops::Neg;
use std::str::FromStr;

use num_bigint::{BigInt, BigUint, Sign};
use num_integer::Integer;
use num_traits::{One, Zero};

use crate::policy::{BIG_FLOAT_PRECISION, BIG_FLOAT_ROUNDING};

/// Largest decimal exponent accepted when parsing.
const MAX_DECIMAL_EXPONENT: i64 = 100_000;

/// Decimal exponents at or above this switch to exponent notation.
const GENERAL_EXPONENT_THRESHOLD: i64 = 6;

/// Guard bits kept below the target precision while adding.
const GUARD_BITS: i64 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundingMode {
    /// Round to nearest, ties to the even mantissa.
    NearestEven,
    /// Round to nearest, ties away from zero.
    NearestAway,
    /// Truncate toward zero.
    ToZero,
}

/// Mantissa width and rounding used for a computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FloatContext {
    pub precision: u32,
    pub rounding: RoundingMode,
}

impl FloatContext {
    /// The context every store operation uses.
    pub const STORE: FloatContext = FloatContext {
        precision: BIG_FLOAT_PRECISION,
        rounding: BIG_FLOAT_ROUNDING,
    };

    /// Enough significant decimal digits to identify any value of this width.
    fn max_significant_digits(&self) -> usize {
        (f64::from(self.precision) * std::f64::consts::LOG10_2).ceil() as usize + 1
    }
}

impl Default for FloatContext {
    fn default() -> Self {
        FloatContext::STORE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseBigFloatError {
    #[error("empty input")]
    Empty,
    #[error("unexpected character {0:?}")]
    InvalidChar(char),
    #[error("missing digits")]
    MissingDigits,
    #[error("decimal exponent out of range")]
    ExponentOutOfRange,
    #[error("value is not finite")]
    NotFinite,
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BigFloat {
    negative: bool,
    mantissa: BigUint,
    exponent: i64,
}

impl BigFloat {
    pub fn zero() -> Self {
        BigFloat {
            negative: false,
            mantissa: BigUint::zero(),
            exponent: 0,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.mantissa.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    /// Parse decimal text (`-12.5`, `3e+08`, `.25`) at the store context.
    pub fn parse(text: &str) -> Result<Self, ParseBigFloatError> {
        Self::parse_with(text, &FloatContext::STORE)
    }

    pub fn parse_with(text: &str, ctx: &FloatContext) -> Result<Self, ParseBigFloatError> {
        let mut chars = text.char_indices().peekable();
        let negative = match chars.peek() {
            None => return Err(ParseBigFloatError::Empty),
            Some((_, '-')) => {
                chars.next();
                true
            }
            Some((_, '+')) => {
                chars.next();
                false
            }
            Some(_) => false,
        };

        let mut digits = String::new();
        let mut fraction_len: i64 = 0;
        let mut seen_point = false;
        let mut exponent_at = None;
        for (idx, ch) in chars {
            match ch {
                '0'..='9' => {
                    digits.push(ch);
                    if seen_point {
                        fraction_len += 1;
                    }
                }
                '.' if !seen_point => seen_point = true,
                'e' | 'E' => {
                    exponent_at = Some(idx + 1);
                    break;
                }
                other => return Err(ParseBigFloatError::InvalidChar(other)),
            }
        }
        if digits.is_empty() {
            return Err(ParseBigFloatError::MissingDigits);
        }

        let exponent = match exponent_at {
            Some(start) => parse_exponent(&text[start..])?,
            None => 0,
        };
        let mantissa = BigUint::parse_bytes(digits.as_bytes(), 10)
            .ok_or(ParseBigFloatError::MissingDigits)?;
        let exponent = exponent
            .checked_sub(fraction_len)
            .ok_or(ParseBigFloatError::ExponentOutOfRange)?;
        Self::from_decimal(negative, mantissa, exponent, ctx)
    }

    /// `(-1)^negative * digits * 10^exponent`, rounded to `ctx`.
    pub fn from_decimal(
        negative: bool,
        digits: BigUint,
        exponent: i64,
        ctx: &FloatContext,
    ) -> Result<Self, ParseBigFloatError> {
        if exponent.unsigned_abs() > MAX_DECIMAL_EXPONENT.unsigned_abs() {
            return Err(ParseBigFloatError::ExponentOutOfRange);
        }
        if digits.is_zero() {
            return Ok(Self::zero());
        }
        if exponent >= 0 {
            let magnitude = digits * pow10(exponent);
            return Ok(round(negative, magnitude, 0, false, ctx));
        }

        // digits / 10^k: scale the quotient so it carries precision + guard bits.
        let denominator = pow10(-exponent);
        let shift = i64::from(ctx.precision) + GUARD_BITS + denominator.bits() as i64
            - digits.bits() as i64;
        let (quotient, remainder) = if shift >= 0 {
            (digits << shift as u64).div_rem(&denominator)
        } else {
            digits.div_rem(&(denominator << (-shift) as u64))
        };
        Ok(round(
            negative,
            quotient,
            -shift,
            !remainder.is_zero(),
            ctx,
        ))
    }

    pub fn add(&self, other: &Self) -> Self {
        self.add_with(other, &FloatContext::STORE)
    }

    /// Correctly rounded sum. Operands are expected to be rounded to `ctx`
    /// already, which is true for every value built through this module.
    pub fn add_with(&self, other: &Self, ctx: &FloatContext) -> Self {
        if self.is_zero() {
            return other.clone();
        }
        if other.is_zero() {
            return self.clone();
        }

        let top = self.top().max(other.top());
        let floor = self
            .exponent
            .min(other.exponent)
            .max(top - i64::from(ctx.precision) - GUARD_BITS);
        // At most one operand (the strictly smaller one) loses bits here.
        let (a, a_lost) = self.aligned(floor);
        let (b, b_lost) = other.aligned(floor);
        let sticky = a_lost || b_lost;

        if self.negative == other.negative {
            return round(self.negative, a + b, floor, sticky, ctx);
        }
        let (negative, mut magnitude) = match a.cmp(&b) {
            Ordering::Equal => return Self::zero(),
            Ordering::Greater => (self.negative, a - b),
            Ordering::Less => (other.negative, b - a),
        };
        if sticky {
            // The truncated operand was slightly larger than its aligned form.
            magnitude -= 1u32;
        }
        round(negative, magnitude, floor, sticky, ctx)
    }

    /// Shortest decimal text that parses back to `self`.
    pub fn to_canonical_string(&self) -> String {
        if self.is_zero() {
            return "0".to_string();
        }
        let (digits, point) = self.shortest_digits(&FloatContext::STORE);
        format_general(self.negative, &digits, point)
    }

    /// Bit position just above the most significant mantissa bit.
    fn top(&self) -> i64 {
        self.exponent + self.mantissa.bits() as i64
    }

    fn aligned(&self, floor: i64) -> (BigUint, bool) {
        if self.exponent >= floor {
            return (&self.mantissa << (self.exponent - floor) as u64, false);
        }
        let shift = (floor - self.exponent) as u64;
        let kept = &self.mantissa >> shift;
        let lost = (&kept << shift) != self.mantissa;
        (kept, lost)
    }

    fn cmp_magnitude(&self, other: &Self) -> Ordering {
        match self.top().cmp(&other.top()) {
            Ordering::Equal => {
                let floor = self.exponent.min(other.exponent);
                self.aligned(floor).0.cmp(&other.aligned(floor).0)
            }
            unequal => unequal,
        }
    }

    /// Exact decimal expansion: digits without trailing zeros and the decimal
    /// point position, so that `self = 0.d1d2d3... * 10^point`.
    fn exact_digits(&self) -> (String, i64) {
        let (scaled, fraction_len) = if self.exponent >= 0 {
            (&self.mantissa << self.exponent as u64, 0)
        } else {
            // m / 2^k == m * 5^k / 10^k
            let k = -self.exponent;
            (&self.mantissa * pow5(k), k)
        };
        let text = scaled.to_str_radix(10);
        let point = text.len() as i64 - fraction_len;
        (text.trim_end_matches('0').to_string(), point)
    }

    fn shortest_digits(&self, ctx: &FloatContext) -> (String, i64) {
        let (digits, point) = self.exact_digits();
        for width in 1..=ctx.max_significant_digits() {
            if digits.len() <= width {
                break;
            }
            let (candidate, candidate_point) = round_digits(&digits, point, width);
            let Some(mantissa) = BigUint::parse_bytes(candidate.as_bytes(), 10) else {
                continue;
            };
            let exponent = candidate_point - candidate.len() as i64;
            if Self::from_decimal(self.negative, mantissa, exponent, ctx).as_ref() == Ok(self) {
                return (candidate, candidate_point);
            }
        }
        (digits, point)
    }
}

impl Default for BigFloat {
    fn default() -> Self {
        Self::zero()
    }
}

impl Ord for BigFloat {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.is_zero(), other.is_zero()) {
            (true, true) => return Ordering::Equal,
            (true, false) => {
                return if other.negative {
                    Ordering::Greater
                } else {
                    Ordering::Less
                };
            }
            (false, true) => {
                return if self.negative {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
            }
            (false, false) => {}
        }
        match (self.negative, other.negative) {
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            (false, false) => self.cmp_magnitude(other),
            (true, true) => self.cmp_magnitude(other).reverse(),
        }
    }
}

impl PartialOrd for BigFloat {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Neg for BigFloat {
    type Output = BigFloat;

    fn neg(mut self) -> Self::Output {
        if !self.is_zero() {
            self.negative = !self.negative;
        }
        self
    }
}

impl From<i64> for BigFloat {
    fn from(value: i64) -> Self {
        round(
            value < 0,
            BigUint::from(value.unsigned_abs()),
            0,
            false,
            &FloatContext::STORE,
        )
    }
}

impl From<&BigInt> for BigFloat {
    fn from(value: &BigInt) -> Self {
        round(
            value.sign() == Sign::Minus,
            value.magnitude().clone(),
            0,
            false,
            &FloatContext::STORE,
        )
    }
}

impl TryFrom<f64> for BigFloat {
    type Error = ParseBigFloatError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() {
            return Err(ParseBigFloatError::NotFinite);
        }
        if value == 0.0 {
            return Ok(Self::zero());
        }
        let bits = value.to_bits();
        let negative = bits >> 63 == 1;
        let biased = ((bits >> 52) & 0x7ff) as i64;
        let fraction = bits & ((1u64 << 52) - 1);
        let (mantissa, exponent) = if biased == 0 {
            (fraction, -1074)
        } else {
            (fraction | (1u64 << 52), biased - 1075)
        };
        Ok(round(
            negative,
            BigUint::from(mantissa),
            exponent,
            false,
            &FloatContext::STORE,
        ))
    }
}

impl FromStr for BigFloat {
    type Err = ParseBigFloatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BigFloat::parse(s)
    }
}

impl fmt::Display for BigFloat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_canonical_string())
    }
}

impl fmt::Debug for BigFloat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BigFloat")
            .field(&self.to_canonical_string())
            .finish()
    }
}

/// Round `magnitude * 2^exponent` to `ctx.precision` bits. `sticky` marks a
/// non-zero tail already discarded below `magnitude`.
fn round(
    negative: bool,
    magnitude: BigUint,
    exponent: i64,
    sticky: bool,
    ctx: &FloatContext,
) -> BigFloat {
    if magnitude.is_zero() {
        return BigFloat::zero();
    }
    let precision = u64::from(ctx.precision);
    let bits = magnitude.bits();
    let (mut mantissa, mut exponent) = if bits > precision {
        let dropped = bits - precision;
        let kept = &magnitude >> dropped;
        let remainder = magnitude - (&kept << dropped);
        let half = BigUint::one() << (dropped - 1);
        let round_up = match ctx.rounding {
            RoundingMode::NearestEven => {
                remainder > half || (remainder == half && (sticky || kept.is_odd()))
            }
            RoundingMode::NearestAway => remainder >= half,
            RoundingMode::ToZero => false,
        };
        let kept = if round_up { kept + 1u32 } else { kept };
        (kept, exponent + dropped as i64)
    } else {
        (magnitude, exponent)
    };

    if mantissa.bits() > precision {
        mantissa >>= 1u32;
        exponent += 1;
    }
    if let Some(zeros) = mantissa.trailing_zeros() {
        mantissa >>= zeros;
        exponent += zeros as i64;
    }
    BigFloat {
        negative,
        mantissa,
        exponent,
    }
}

fn parse_exponent(text: &str) -> Result<i64, ParseBigFloatError> {
    let (negative, digits) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    if digits.is_empty() {
        return Err(ParseBigFloatError::MissingDigits);
    }
    if let Some(bad) = digits.chars().find(|c| !c.is_ascii_digit()) {
        return Err(ParseBigFloatError::InvalidChar(bad));
    }
    let value = digits
        .parse::<i64>()
        .ok()
        .filter(|value| *value <= MAX_DECIMAL_EXPONENT)
        .ok_or(ParseBigFloatError::ExponentOutOfRange)?;
    Ok(if negative { -value } else { value })
}

/// Round a digit string to `width` significant digits, ties to even.
/// `digits` has no trailing zeros and is longer than `width`.
fn round_digits(digits: &str, point: i64, width: usize) -> (String, i64) {
    let (head, tail) = digits.split_at(width);
    let mut out: Vec<u8> = head.bytes().collect();
    let round_up = match tail.as_bytes()[0] {
        b'0'..=b'4' => false,
        b'5' => tail.len() > 1 || (out[width - 1] - b'0') % 2 == 1,
        _ => true,
    };

    let mut point = point;
    if round_up {
        let mut idx = width;
        loop {
            if idx == 0 {
                out.insert(0, b'1');
                point += 1;
                break;
            }
            idx -= 1;
            if out[idx] == b'9' {
                out[idx] = b'0';
            } else {
                out[idx] += 1;
                break;
            }
        }
    }
    let text: String = out.into_iter().map(char::from).collect();
    (text.trim_end_matches('0').to_string(), point)
}

fn format_general(negative: bool, digits: &str, point: i64) -> String {
    let mut out = String::with_capacity(digits.len() + 8);
    if negative {
        out.push('-');
    }
    let exponent = point - 1;
    if exponent < -4 || exponent >= GENERAL_EXPONENT_THRESHOLD {
        out.push_str(&digits[..1]);
        if digits.len() > 1 {
            out.push('.');
            out.push_str(&digits[1..]);
        }
        let sign = if exponent < 0 { '-' } else { '+' };
        let _ = write!(out, "e{sign}{:02}", exponent.abs());
    } else if point <= 0 {
        out.push_str("0.");
        out.extend(std::iter::repeat_n('0', (-point) as usize));
        out.push_str(digits);
    } else if point as usize >= digits.len() {
        out.push_str(digits);
        out.extend(std::iter::repeat_n('0', point as usize - digits.len()));
    } else {
        let (int, frac) = digits.split_at(point as usize);
        out.push_str(int);
        out.push('.');
        out.push_str(frac);
    }
    out
}

fn pow10(exponent: i64) -> BigUint {
    BigUint::from(10u32).pow(exponent as u32)
}

fn pow5(exponent: i64) -> BigUint {
    BigUint::from(5u32).pow(exponent as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bf(text: &str) -> BigFloat {
        BigFloat::parse(text).unwrap()
    }

    #[test]
    fn integers_are_exact() {
        assert_eq!(BigFloat::from(3).add(&BigFloat::from(4)), BigFloat::from(7));
        assert_eq!(BigFloat::from(7).to_string(), "7");
        assert_eq!(BigFloat::from(-250).to_string(), "-250");
        assert_eq!(BigFloat::from(0).to_string(), "0");
    }

    #[test]
    fn general_format_switches_to_exponent_notation() {
        assert_eq!(bf("100000").to_string(), "100000");
        assert_eq!(bf("1000000").to_string(), "1e+06");
        assert_eq!(bf("1234567").to_string(), "1.234567e+06");
        assert_eq!(bf("0.0001").to_string(), "0.0001");
        assert_eq!(bf("0.00001").to_string(), "1e-05");
        assert_eq!(bf("-0.25").to_string(), "-0.25");
        assert_eq!(bf("12.5").to_string(), "12.5");
    }

    #[test]
    fn shortest_text_for_inexact_values() {
        // 0.1 is not representable; the shortest text that maps back is still "0.1".
        let tenth = bf("0.1");
        assert_eq!(tenth.to_string(), "0.1");
        let sum = tenth.add(&bf("0.2"));
        assert_eq!(bf(&sum.to_string()), sum);

        let third = bf("0.333333333333333333333333333333333333333");
        let text = third.to_string();
        assert!(text.len() <= 2 + FloatContext::STORE.max_significant_digits());
        assert_eq!(bf(&text), third);
    }

    #[test]
    fn canonical_text_is_idempotent() {
        for text in [
            "3",
            "-7.125",
            "0.1",
            "1e-30",
            "6.02214076e+23",
            "123456789012345678901234567890123456789",
            "-0.000000000000000000000000000001",
        ] {
            let value = bf(text);
            let canonical = value.to_string();
            let reparsed = bf(&canonical);
            assert_eq!(reparsed, value, "{text}");
            assert_eq!(reparsed.to_string(), canonical, "{text}");
        }
    }

    #[test]
    fn mantissa_is_limited_to_store_precision() {
        // 2^100 + 1 needs 101 bits; the low bit is rounded away.
        let big = BigUint::one() << 100u32;
        let value = BigFloat::from_decimal(false, big.clone() + 1u32, 0, &FloatContext::STORE)
            .unwrap();
        let exact = BigFloat::from_decimal(false, big, 0, &FloatContext::STORE).unwrap();
        assert_eq!(value, exact);
    }

    #[test]
    fn ties_round_to_even_mantissa() {
        let ctx = FloatContext {
            precision: 4,
            rounding: RoundingMode::NearestEven,
        };
        // 4 bits: 17 = 10001b ties between 16 and 18 -> 16 (even mantissa 1000b).
        let seventeen = BigFloat::from_decimal(false, BigUint::from(17u32), 0, &ctx).unwrap();
        assert_eq!(seventeen, BigFloat::from(16));
        // 19 = 10011b ties between 18 and 20 -> 20 (mantissa 1010b is even).
        let nineteen = BigFloat::from_decimal(false, BigUint::from(19u32), 0, &ctx).unwrap();
        assert_eq!(nineteen, BigFloat::from(20));

        let away = FloatContext {
            precision: 4,
            rounding: RoundingMode::NearestAway,
        };
        let seventeen = BigFloat::from_decimal(false, BigUint::from(17u32), 0, &away).unwrap();
        assert_eq!(seventeen, BigFloat::from(18));

        let truncate = FloatContext {
            precision: 4,
            rounding: RoundingMode::ToZero,
        };
        let nineteen = BigFloat::from_decimal(false, BigUint::from(19u32), 0, &truncate).unwrap();
        assert_eq!(nineteen, BigFloat::from(18));
    }

    #[test]
    fn addition_is_commutative_and_handles_cancellation() {
        let a = bf("1e+20");
        let b = bf("-3.75");
        assert_eq!(a.add(&b), b.add(&a));
        assert_eq!(a.add(&-a.clone()), BigFloat::zero());
        assert_eq!(bf("5.5").add(&bf("-2.25")).to_string(), "3.25");
        assert_eq!(bf("-5.5").add(&bf("2.25")).to_string(), "-3.25");
    }

    #[test]
    fn tiny_addend_below_half_ulp_is_absorbed() {
        let one = BigFloat::from(1);
        let tiny = bf("1e-40");
        assert_eq!(one.add(&tiny), one);
        assert_eq!(one.add(&-tiny.clone()), one);
        assert_eq!(tiny.add(&one), one);
    }

    #[test]
    fn truncated_subtraction_rounds_toward_zero_in_truncate_mode() {
        let ctx = FloatContext {
            precision: 8,
            rounding: RoundingMode::ToZero,
        };
        let one = BigFloat::from(1);
        let tiny = BigFloat::from_decimal(false, BigUint::one(), -30, &ctx).unwrap();
        // 1 - 1e-30 truncated to 8 bits is the largest value below 1: 255/256.
        let below = one.add_with(&-tiny, &ctx);
        let expected =
            BigFloat::from_decimal(false, BigUint::from(99609375u32), -8, &ctx).unwrap();
        assert_eq!(below, expected);
    }

    #[test]
    fn ordering_follows_numeric_value() {
        let mut values = vec![bf("2.5"), bf("-1"), bf("0"), bf("-3.5"), bf("1e+10"), bf("0.001")];
        values.sort();
        let texts: Vec<_> = values.iter().map(ToString::to_string).collect();
        assert_eq!(texts, ["-3.5", "-1", "0", "0.001", "2.5", "1e+10"]);
    }

    #[test]
    fn converts_from_f64_exactly() {
        assert_eq!(BigFloat::try_from(4.0).unwrap(), BigFloat::from(4));
        assert_eq!(BigFloat::try_from(0.5).unwrap().to_string(), "0.5");
        assert_eq!(
            BigFloat::try_from(f64::NAN),
            Err(ParseBigFloatError::NotFinite)
        );
    }

    #[test]
    fn rejects_malformed_text() {
        assert_eq!(BigFloat::parse(""), Err(ParseBigFloatError::Empty));
        assert_eq!(BigFloat::parse("-"), Err(ParseBigFloatError::MissingDigits));
        assert_eq!(BigFloat::parse("1.2.3"), Err(ParseBigFloatError::InvalidChar('.')));
        assert_eq!(BigFloat::parse("abc"), Err(ParseBigFloatError::InvalidChar('a')));
        assert_eq!(BigFloat::parse("1e"), Err(ParseBigFloatError::MissingDigits));
        assert_eq!(
            BigFloat::parse("1e999999"),
            Err(ParseBigFloatError::ExponentOutOfRange)
        );
        assert!(BigFloat::parse("Inf").is_err());
    }

    #[test]
    fn extreme_exponents_are_out_of_range() {
        for text in [
            "0.1e-9223372036854775807",
            "0.00e-9223372036854775807",
            "1e9223372036854775807",
            "-5e-9223372036854775808",
            "1e-100001",
        ] {
            assert_eq!(
                BigFloat::parse(text),
                Err(ParseBigFloatError::ExponentOutOfRange),
                "{text}"
            );
        }
        assert_eq!(
            BigFloat::from_decimal(false, BigUint::from(1u32), i64::MIN, &FloatContext::STORE),
            Err(ParseBigFloatError::ExponentOutOfRange)
        );
        assert!(BigFloat::parse("1e-100000").is_ok());
    }
}
