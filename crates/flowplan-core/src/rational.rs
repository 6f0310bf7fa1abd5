//! Exact rational arithmetic for flow rates.
//!
//! [`Rational`] stores a fraction in lowest terms with a strictly positive
//! denominator. All arithmetic is exact: intermediates are widened to
//! `i128`, reduced, then narrowed back to `i64`. A result that does not fit
//! is reported as [`ArithmeticError::Overflow`] by the `checked_*` methods.
//! The operator impls (`+ - * /`) are thin wrappers that panic on overflow
//! or division by zero, mirroring primitive integers; the solver only uses
//! the checked forms.

use serde::{Deserialize, Serialize};
use std::cell::OnceCell;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Number of decimals in the cached decimal view.
pub const DISPLAY_DECIMALS: usize = 3;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced when building a rational from text or parts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("denominator is zero")]
    ZeroDenominator,
    #[error("malformed rational number: {0:?}")]
    Malformed(String),
    #[error("rational number out of range: {0:?}")]
    OutOfRange(String),
}

/// Errors produced by checked arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArithmeticError {
    #[error("rational arithmetic overflowed 64-bit storage")]
    Overflow,
    #[error("division by zero")]
    DivisionByZero,
}

// ---------------------------------------------------------------------------
// Rational
// ---------------------------------------------------------------------------

/// An exact fraction `numerator / denominator`.
///
/// Invariants: `denominator > 0` and `gcd(|numerator|, denominator) == 1`.
/// Equality, ordering and hashing only look at the reduced pair, so two
/// values built from `2/4` and `1/2` are indistinguishable.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "RawRational", into = "RawRational")]
pub struct Rational {
    num: i64,
    den: i64,
    decimal: OnceCell<String>,
    fraction: OnceCell<String>,
}

/// Wire shape of a rational: `{ "num": n, "den": d }`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RawRational {
    pub num: i64,
    pub den: i64,
}

impl TryFrom<RawRational> for Rational {
    type Error = ParseError;

    fn try_from(raw: RawRational) -> Result<Self, Self::Error> {
        Rational::new(raw.num, raw.den)
    }
}

impl From<Rational> for RawRational {
    fn from(r: Rational) -> Self {
        RawRational {
            num: r.num,
            den: r.den,
        }
    }
}

fn gcd_i128(mut a: i128, mut b: i128) -> i128 {
    a = a.abs();
    b = b.abs();
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl Rational {
    /// Build `n / d` in lowest terms. Fails if `d == 0`.
    pub fn new(n: i64, d: i64) -> Result<Self, ParseError> {
        if d == 0 {
            return Err(ParseError::ZeroDenominator);
        }
        Self::from_wide(n as i128, d as i128)
            .map_err(|_| ParseError::OutOfRange(format!("{n}/{d}")))
    }

    /// Build from an integer.
    pub fn from_integer(n: i64) -> Self {
        Self::raw(n, 1)
    }

    pub fn zero() -> Self {
        Self::raw(0, 1)
    }

    pub fn one() -> Self {
        Self::raw(1, 1)
    }

    /// Construct from an already-reduced pair.
    fn raw(num: i64, den: i64) -> Self {
        Self {
            num,
            den,
            decimal: OnceCell::new(),
            fraction: OnceCell::new(),
        }
    }

    /// Reduce a wide fraction and narrow it to 64-bit storage.
    fn from_wide(n: i128, d: i128) -> Result<Self, ArithmeticError> {
        if d == 0 {
            return Err(ArithmeticError::DivisionByZero);
        }
        if n == 0 {
            return Ok(Self::zero());
        }
        let g = gcd_i128(n, d);
        let (mut n, mut d) = (n / g, d / g);
        if d < 0 {
            n = n.checked_neg().ok_or(ArithmeticError::Overflow)?;
            d = d.checked_neg().ok_or(ArithmeticError::Overflow)?;
        }
        let num = i64::try_from(n).map_err(|_| ArithmeticError::Overflow)?;
        let den = i64::try_from(d).map_err(|_| ArithmeticError::Overflow)?;
        Ok(Self::raw(num, den))
    }

    pub fn numerator(&self) -> i64 {
        self.num
    }

    pub fn denominator(&self) -> i64 {
        self.den
    }

    pub fn is_zero(&self) -> bool {
        self.num == 0
    }

    pub fn is_negative(&self) -> bool {
        self.num < 0
    }

    pub fn is_integer(&self) -> bool {
        self.den == 1
    }

    /// Approximate value. Use only for display and pivot selection.
    pub fn to_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Absolute value.
    pub fn abs(&self) -> Result<Self, ArithmeticError> {
        Self::from_wide((self.num as i128).abs(), self.den as i128)
    }

    /// Smallest integer not below this value.
    pub fn ceil(&self) -> i64 {
        let q = self.num.div_euclid(self.den);
        if self.num.rem_euclid(self.den) == 0 { q } else { q + 1 }
    }

    // -----------------------------------------------------------------------
    // Checked arithmetic
    // -----------------------------------------------------------------------

    pub fn checked_add(&self, rhs: &Rational) -> Result<Self, ArithmeticError> {
        let a = (self.num as i128) * (rhs.den as i128);
        let b = (rhs.num as i128) * (self.den as i128);
        let n = a.checked_add(b).ok_or(ArithmeticError::Overflow)?;
        Self::from_wide(n, (self.den as i128) * (rhs.den as i128))
    }

    pub fn checked_sub(&self, rhs: &Rational) -> Result<Self, ArithmeticError> {
        let a = (self.num as i128) * (rhs.den as i128);
        let b = (rhs.num as i128) * (self.den as i128);
        let n = a.checked_sub(b).ok_or(ArithmeticError::Overflow)?;
        Self::from_wide(n, (self.den as i128) * (rhs.den as i128))
    }

    pub fn checked_mul(&self, rhs: &Rational) -> Result<Self, ArithmeticError> {
        Self::from_wide(
            (self.num as i128) * (rhs.num as i128),
            (self.den as i128) * (rhs.den as i128),
        )
    }

    pub fn checked_div(&self, rhs: &Rational) -> Result<Self, ArithmeticError> {
        if rhs.is_zero() {
            return Err(ArithmeticError::DivisionByZero);
        }
        Self::from_wide(
            (self.num as i128) * (rhs.den as i128),
            (self.den as i128) * (rhs.num as i128),
        )
    }

    pub fn checked_neg(&self) -> Result<Self, ArithmeticError> {
        let num = self.num.checked_neg().ok_or(ArithmeticError::Overflow)?;
        Ok(Self::raw(num, self.den))
    }

    /// Divide by a pin count (used for even splits).
    pub fn checked_div_count(&self, count: usize) -> Result<Self, ArithmeticError> {
        let count = i64::try_from(count).map_err(|_| ArithmeticError::Overflow)?;
        self.checked_div(&Self::from_integer(count))
    }

    // -----------------------------------------------------------------------
    // Parsing
    // -----------------------------------------------------------------------

    /// Parse the strict grammar `int["."digits]["/" int["."digits]]`.
    ///
    /// ```
    /// use flowplan_core::rational::Rational;
    ///
    /// assert_eq!(Rational::parse("1.5").unwrap(), Rational::new(3, 2).unwrap());
    /// assert_eq!(Rational::parse("3/4.5").unwrap(), Rational::new(2, 3).unwrap());
    /// ```
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let text = s.trim();
        let malformed = || ParseError::Malformed(s.to_string());
        let (top, bottom) = match text.split_once('/') {
            Some((a, b)) => (a.trim(), Some(b.trim())),
            None => (text, None),
        };
        let (tn, td) = parse_decimal(top, true).ok_or_else(malformed)?;
        let (bn, bd) = match bottom {
            Some(b) => parse_decimal(b, true).ok_or_else(malformed)?,
            None => (1, 1),
        };
        if bn == 0 {
            return Err(ParseError::ZeroDenominator);
        }
        let n = tn.checked_mul(bd);
        let d = td.checked_mul(bn);
        match (n, d) {
            (Some(n), Some(d)) => {
                Self::from_wide(n, d).map_err(|_| ParseError::OutOfRange(s.to_string()))
            }
            _ => Err(ParseError::OutOfRange(s.to_string())),
        }
    }

    /// Evaluate an arithmetic expression over rationals.
    ///
    /// Supports `+ - * /`, unary minus, parentheses and whitespace. Number
    /// literals are integers or decimals.
    ///
    /// ```
    /// use flowplan_core::rational::Rational;
    ///
    /// let v = Rational::evaluate("2 * (3 + 1) / 5").unwrap();
    /// assert_eq!(v, Rational::new(8, 5).unwrap());
    /// ```
    pub fn evaluate(expr: &str) -> Result<Self, ParseError> {
        let mut parser = ExprParser {
            src: expr,
            bytes: expr.as_bytes(),
            pos: 0,
        };
        let value = parser.expr()?;
        parser.skip_ws();
        if parser.pos != parser.bytes.len() {
            return Err(ParseError::Malformed(expr.to_string()));
        }
        Ok(value)
    }

    // -----------------------------------------------------------------------
    // String views
    // -----------------------------------------------------------------------

    /// `"n"` when integral, `"n/d"` otherwise. Cached until the next mutation.
    pub fn fraction_string(&self) -> &str {
        self.fraction.get_or_init(|| {
            if self.den == 1 {
                self.num.to_string()
            } else {
                format!("{}/{}", self.num, self.den)
            }
        })
    }

    /// Decimal view rounded to [`DISPLAY_DECIMALS`] places. Cached until the
    /// next mutation.
    pub fn decimal_string(&self) -> &str {
        self.decimal
            .get_or_init(|| self.format_decimal(DISPLAY_DECIMALS))
    }

    /// Decimal view with `places` decimals, rounding half away from zero.
    pub fn format_decimal(&self, places: usize) -> String {
        let scale = 10i128.checked_pow(places as u32).unwrap_or(i128::MAX);
        let n = (self.num as i128).abs();
        let d = self.den as i128;
        let scaled = n.saturating_mul(scale);
        let mut q = scaled / d;
        if (scaled % d).saturating_mul(2) >= d {
            q += 1;
        }
        let int_part = q / scale;
        let frac_part = q % scale;
        let sign = if self.num < 0 && q != 0 { "-" } else { "" };
        if places == 0 {
            format!("{sign}{int_part}")
        } else {
            format!("{sign}{int_part}.{frac_part:0places$}")
        }
    }

    fn invalidate(&mut self) {
        self.decimal = OnceCell::new();
        self.fraction = OnceCell::new();
    }

    fn assign(&mut self, value: Rational) {
        self.num = value.num;
        self.den = value.den;
        self.invalidate();
    }
}

/// Parse `int["."digits]` into a wide fraction. `allow_sign` permits a
/// leading `-` or `+`.
fn parse_decimal(s: &str, allow_sign: bool) -> Option<(i128, i128)> {
    let (negative, body) = match s.as_bytes().first() {
        Some(b'-') if allow_sign => (true, &s[1..]),
        Some(b'+') if allow_sign => (false, &s[1..]),
        _ => (false, s),
    };
    let (int_part, frac_part) = match body.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (body, None),
    };
    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut num: i128 = int_part.parse().ok()?;
    let mut den: i128 = 1;
    if let Some(frac) = frac_part {
        if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        for b in frac.bytes() {
            num = num.checked_mul(10)?.checked_add((b - b'0') as i128)?;
            den = den.checked_mul(10)?;
        }
    }
    Some((if negative { -num } else { num }, den))
}

// ---------------------------------------------------------------------------
// Expression parser
// ---------------------------------------------------------------------------

struct ExprParser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl ExprParser<'_> {
    fn malformed(&self) -> ParseError {
        ParseError::Malformed(self.src.to_string())
    }

    fn out_of_range(&self) -> ParseError {
        ParseError::OutOfRange(self.src.to_string())
    }

    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.bytes.get(self.pos).copied()
    }

    fn lift(&self, r: Result<Rational, ArithmeticError>) -> Result<Rational, ParseError> {
        r.map_err(|e| match e {
            ArithmeticError::DivisionByZero => ParseError::ZeroDenominator,
            ArithmeticError::Overflow => self.out_of_range(),
        })
    }

    fn expr(&mut self) -> Result<Rational, ParseError> {
        let mut acc = self.term()?;
        while let Some(op @ (b'+' | b'-')) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            acc = if op == b'+' {
                self.lift(acc.checked_add(&rhs))?
            } else {
                self.lift(acc.checked_sub(&rhs))?
            };
        }
        Ok(acc)
    }

    fn term(&mut self) -> Result<Rational, ParseError> {
        let mut acc = self.factor()?;
        while let Some(op @ (b'*' | b'/')) = self.peek() {
            self.pos += 1;
            let rhs = self.factor()?;
            acc = if op == b'*' {
                self.lift(acc.checked_mul(&rhs))?
            } else {
                self.lift(acc.checked_div(&rhs))?
            };
        }
        Ok(acc)
    }

    fn factor(&mut self) -> Result<Rational, ParseError> {
        match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                let inner = self.factor()?;
                self.lift(inner.checked_neg())
            }
            Some(b'(') => {
                self.pos += 1;
                let inner = self.expr()?;
                if self.peek() != Some(b')') {
                    return Err(self.malformed());
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(b) if b.is_ascii_digit() || b == b'.' => {
                let start = self.pos;
                while self.pos < self.bytes.len()
                    && (self.bytes[self.pos].is_ascii_digit() || self.bytes[self.pos] == b'.')
                {
                    self.pos += 1;
                }
                let literal = &self.src[start..self.pos];
                // A leading '.' is accepted here (".5"), unlike the strict grammar.
                let literal = if literal.starts_with('.') {
                    format!("0{literal}")
                } else {
                    literal.to_string()
                };
                let (n, d) = parse_decimal(&literal, false).ok_or_else(|| self.malformed())?;
                self.lift(Rational::from_wide(n, d))
            }
            _ => Err(self.malformed()),
        }
    }
}

// ---------------------------------------------------------------------------
// Trait impls
// ---------------------------------------------------------------------------

impl Default for Rational {
    fn default() -> Self {
        Self::zero()
    }
}

impl PartialEq for Rational {
    fn eq(&self, other: &Self) -> bool {
        self.num == other.num && self.den == other.den
    }
}

impl Eq for Rational {}

impl Hash for Rational {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.num.hash(state);
        self.den.hash(state);
    }
}

impl Ord for Rational {
    /// Cross-multiplication: `a/b < c/d  <=>  a*d < c*b` (denominators are positive).
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = (self.num as i128) * (other.den as i128);
        let rhs = (other.num as i128) * (self.den as i128);
        lhs.cmp(&rhs)
    }
}

impl PartialOrd for Rational {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rational({}/{})", self.num, self.den)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.fraction_string())
    }
}

impl FromStr for Rational {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Rational::parse(s)
    }
}

impl From<i64> for Rational {
    fn from(n: i64) -> Self {
        Rational::from_integer(n)
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $assign_trait:ident, $assign_method:ident, $checked:ident) => {
        impl std::ops::$trait<&Rational> for &Rational {
            type Output = Rational;

            fn $method(self, rhs: &Rational) -> Rational {
                match self.$checked(rhs) {
                    Ok(v) => v,
                    Err(e) => panic!("{} {} {}: {}", self, stringify!($method), rhs, e),
                }
            }
        }

        impl std::ops::$trait<Rational> for Rational {
            type Output = Rational;

            fn $method(self, rhs: Rational) -> Rational {
                std::ops::$trait::$method(&self, &rhs)
            }
        }

        impl std::ops::$trait<&Rational> for Rational {
            type Output = Rational;

            fn $method(self, rhs: &Rational) -> Rational {
                std::ops::$trait::$method(&self, rhs)
            }
        }

        impl std::ops::$assign_trait<&Rational> for Rational {
            fn $assign_method(&mut self, rhs: &Rational) {
                let value = std::ops::$trait::$method(&*self, rhs);
                self.assign(value);
            }
        }

        impl std::ops::$assign_trait<Rational> for Rational {
            fn $assign_method(&mut self, rhs: Rational) {
                std::ops::$assign_trait::$assign_method(self, &rhs);
            }
        }
    };
}

impl_binary_op!(Add, add, AddAssign, add_assign, checked_add);
impl_binary_op!(Sub, sub, SubAssign, sub_assign, checked_sub);
impl_binary_op!(Mul, mul, MulAssign, mul_assign, checked_mul);
impl_binary_op!(Div, div, DivAssign, div_assign, checked_div);

impl std::ops::Neg for &Rational {
    type Output = Rational;

    fn neg(self) -> Rational {
        match self.checked_neg() {
            Ok(v) => v,
            Err(e) => panic!("-{}: {}", self, e),
        }
    }
}

impl std::ops::Neg for Rational {
    type Output = Rational;

    fn neg(self) -> Rational {
        -&self
    }
}

impl std::iter::Sum for Rational {
    fn sum<I: Iterator<Item = Rational>>(iter: I) -> Self {
        iter.fold(Rational::zero(), |acc, x| acc + x)
    }
}

/// Shorthand used throughout tests and fixtures.
///
/// Panics if `d == 0`.
pub fn ratio(n: i64, d: i64) -> Rational {
    match Rational::new(n, d) {
        Ok(r) => r,
        Err(e) => panic!("ratio({n}, {d}): {e}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
