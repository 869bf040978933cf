use std::{
    fmt::{self, Display},
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use rust_decimal::{Decimal, prelude::ToPrimitive};

use crate::{
    error::Error,
    rcu::{Protect, RcuCell, RcuWriter, Retired},
};

/// Logical type of a value, checked before any string command touches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    String,
    List,
}

/// Physical representation of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Byte buffer behind an RCU pointer
    Raw,
    /// 64-bit integer stored inline
    Int,
    /// Sequence of byte strings
    List,
}

impl Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Raw => write!(f, "raw"),
            Encoding::Int => write!(f, "int"),
            Encoding::List => write!(f, "list"),
        }
    }
}

#[derive(Debug)]
enum Repr {
    Int(AtomicI64),
    Raw(RcuCell<Vec<u8>>),
    List(Vec<Vec<u8>>),
}

/// A stored value. Keys hold it through an `Arc`; the strong count is the
/// object's refcount and decides whether it may be edited in place.
///
/// # Example
/// ```rust
/// use quiver_core::{Object, ObjectType, RcuWriter, StringRef};
///
/// let writer = RcuWriter::new();
/// let obj = Object::integer(42);
/// assert_eq!(obj.object_type(), ObjectType::String);
/// assert_eq!(obj.as_string(&writer), Some(StringRef::Int(42)));
/// ```
#[derive(Debug)]
pub struct Object {
    repr: Repr,
}

impl Object {
    /// Creates a raw-encoded string holding a copy of `bytes`.
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Object {
            repr: Repr::Raw(RcuCell::new(bytes.into())),
        }
    }

    pub fn integer(value: i64) -> Self {
        Object {
            repr: Repr::Int(AtomicI64::new(value)),
        }
    }

    pub fn list(items: Vec<Vec<u8>>) -> Self {
        Object {
            repr: Repr::List(items),
        }
    }

    pub fn object_type(&self) -> ObjectType {
        match self.repr {
            Repr::Int(_) | Repr::Raw(_) => ObjectType::String,
            Repr::List(_) => ObjectType::List,
        }
    }

    pub fn encoding(&self) -> Encoding {
        match self.repr {
            Repr::Int(_) => Encoding::Int,
            Repr::Raw(_) => Encoding::Raw,
            Repr::List(_) => Encoding::List,
        }
    }

    /// Returns the string value, or `None` for non-string objects.
    ///
    /// # Arguments
    /// * `guard` - an open read section or the writer; the returned bytes
    ///   stay valid for as long as it is borrowed
    pub fn as_string<'a, P: Protect + ?Sized>(&'a self, guard: &'a P) -> Option<StringRef<'a>> {
        match &self.repr {
            Repr::Int(v) => Some(StringRef::Int(v.load(Ordering::Acquire))),
            Repr::Raw(cell) => Some(StringRef::Raw(cell.load(guard))),
            Repr::List(_) => None,
        }
    }

    pub fn list_items(&self) -> Option<&[Vec<u8>]> {
        match &self.repr {
            Repr::List(items) => Some(items),
            _ => None,
        }
    }

    /// Copies the string value into a fresh raw-encoded object.
    pub(crate) fn dup_raw<P: Protect + ?Sized>(&self, guard: &P) -> Option<Object> {
        self.as_string(guard).map(|s| Object::raw(s.to_vec()))
    }
}

/// A borrowed view of a string value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringRef<'a> {
    Int(i64),
    Raw(&'a [u8]),
}

impl StringRef<'_> {
    /// Length of the value in bytes. Integers count their decimal digits.
    pub fn len(&self) -> usize {
        match self {
            StringRef::Int(v) => decimal_len(*v),
            StringRef::Raw(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        match self {
            StringRef::Int(v) => v.to_string().into_bytes(),
            StringRef::Raw(bytes) => bytes.to_vec(),
        }
    }

    pub fn parse_i64(&self) -> Result<i64, Error> {
        match self {
            StringRef::Int(v) => Ok(*v),
            StringRef::Raw(bytes) => parse_i64_strict(bytes).ok_or_else(Error::not_an_integer),
        }
    }

    pub fn parse_long_float(&self) -> Result<LongFloat, Error> {
        match self {
            StringRef::Int(v) => Ok(LongFloat::Decimal(Decimal::from(*v))),
            StringRef::Raw(bytes) => LongFloat::parse(bytes).ok_or_else(Error::not_a_float),
        }
    }
}

fn decimal_len(value: i64) -> usize {
    let mut n = value.unsigned_abs();
    let mut len = if value < 0 { 2 } else { 1 };
    while n >= 10 {
        n /= 10;
        len += 1;
    }
    len
}

/// Parses a signed 64-bit integer in canonical form: optional `-`, no `+`,
/// no leading zeros, no surrounding whitespace. `-0` is rejected.
pub fn parse_i64_strict(s: &[u8]) -> Option<i64> {
    if s.is_empty() || s.len() > 20 {
        return None;
    }
    if s == b"0" {
        return Some(0);
    }

    let (negative, digits) = match s.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, s),
    };
    if !matches!(digits.first(), Some(b'1'..=b'9')) {
        return None;
    }

    let mut value: u64 = 0;
    for &c in digits {
        if !c.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add(u64::from(c - b'0'))?;
    }

    if negative {
        if value > i64::MIN.unsigned_abs() {
            None
        } else {
            Some((value as i64).wrapping_neg())
        }
    } else {
        i64::try_from(value).ok()
    }
}

/// Parses a decimal float. Whitespace and NaN are rejected; infinities are
/// accepted.
pub fn parse_f64(s: &[u8]) -> Option<f64> {
    if s.is_empty() {
        return None;
    }
    std::str::from_utf8(s)
        .ok()?
        .parse::<f64>()
        .ok()
        .filter(|v| !v.is_nan())
}

/// Formats a finite float as the shortest decimal that reads back to the
/// same value, without exponent notation.
pub fn format_f64(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    value.to_string()
}

/// Float with more precision than `f64` for INCRBYFLOAT.
///
/// Operands stay decimal whenever they fit in 96 bits of mantissa, so
/// `0.1 + 0.2` is exactly `0.3`. Infinities and magnitudes beyond the decimal
/// range fall back to `f64`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LongFloat {
    Decimal(Decimal),
    Float(f64),
}

impl LongFloat {
    pub const ZERO: LongFloat = LongFloat::Decimal(Decimal::ZERO);

    /// Accepts what [`parse_f64`] accepts.
    pub fn parse(s: &[u8]) -> Option<Self> {
        let float = parse_f64(s)?;
        let text = std::str::from_utf8(s).ok()?;
        let decimal = if text.contains(['e', 'E']) {
            Decimal::from_scientific(text)
        } else {
            text.parse::<Decimal>()
        };
        Some(decimal.map_or(LongFloat::Float(float), LongFloat::Decimal))
    }

    pub fn to_f64(self) -> f64 {
        match self {
            LongFloat::Decimal(d) => d.to_f64().unwrap_or(f64::NAN),
            LongFloat::Float(f) => f,
        }
    }

    /// Sum of both operands, `None` when it is NaN or infinite.
    pub fn checked_add(self, other: Self) -> Option<Self> {
        if let (LongFloat::Decimal(a), LongFloat::Decimal(b)) = (self, other)
            && let Some(sum) = a.checked_add(b)
        {
            return Some(LongFloat::Decimal(sum));
        }
        let sum = self.to_f64() + other.to_f64();
        sum.is_finite().then_some(LongFloat::Float(sum))
    }

    /// At most 17 fractional digits, trailing zeros dropped, no exponent.
    pub fn format(self) -> String {
        match self {
            LongFloat::Decimal(d) => {
                let d = d.round_dp(17).normalize();
                if d.is_zero() {
                    "0".to_string()
                } else {
                    d.to_string()
                }
            }
            LongFloat::Float(f) => format_f64(f),
        }
    }
}

/// Proof that the holder is the only key referencing an object, so the
/// object may be edited in place. Only the keyspace writer hands these out.
#[derive(Debug)]
pub struct Unshared {
    object: Arc<Object>,
    owner: usize,
}

impl Unshared {
    pub(crate) fn new(object: Arc<Object>, owner: usize) -> Self {
        Unshared { object, owner }
    }

    pub fn object(&self) -> &Object {
        &self.object
    }

    pub(crate) fn owner(&self) -> usize {
        self.owner
    }

    /// Swaps in a new byte buffer. Hands the buffer back when the object is
    /// not raw-encoded.
    pub(crate) fn publish_bytes(
        &self,
        bytes: Vec<u8>,
        writer: &RcuWriter,
    ) -> Result<Retired<Vec<u8>>, Vec<u8>> {
        match &self.object.repr {
            Repr::Raw(cell) => Ok(cell.publish(bytes, writer)),
            _ => Err(bytes),
        }
    }

    /// Stores a new integer in place. Returns false when the object is not
    /// integer-encoded.
    pub(crate) fn set_int(&self, value: i64) -> bool {
        match &self.object.repr {
            Repr::Int(v) => {
                v.store(value, Ordering::Release);
                true
            }
            _ => false,
        }
    }
}
