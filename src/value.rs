//! # Value Module
//!
//! Runtime value representation. An AWK value is simultaneously a number
//! and a string; which view an operator uses depends on context. Heap
//! values use `Rc` for deterministic sharing — arrays in particular are
//! passed to functions by reference by cloning the `Rc`.
//!
//! ## Key Design
//! - `Int`/`Double` are inline; integer arithmetic stays exact until it
//!   cannot (overflow promotes to `Double`).
//! - `StrNum` is a POSIX "numeric string": a string that came from input
//!   (field splitting, getline, ARGV/ENVIRON, -v) and looks like a number.
//!   It carries its parsed value and compares numerically.
//! - `Array` is `Rc<RefCell<AssocArray>>`; array values never coerce to
//!   scalars.

use crate::error::{AwkError, AwkResult};
use crate::format;

use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

// -----------------------------------------------------------------------------
// VALUE — Core Runtime Type
// -----------------------------------------------------------------------------

/// The universal runtime datum.
#[derive(Debug, Clone)]
pub enum Value {
    /// Never assigned; converts to `""` and `0`, compares as either.
    Uninit,
    /// Exact integer.
    Int(i64),
    /// Double-precision float.
    Double(f64),
    /// Ordinary string.
    Str(Rc<str>),
    /// Numeric string from input, with its cached numeric value.
    StrNum(Rc<str>, f64),
    /// Shared associative array reference.
    Array(Rc<RefCell<AssocArray>>),
}

impl Value {
    /// Wraps a string, marking it numeric when the whole trimmed text
    /// parses as a number. Used for every value that enters from input.
    pub fn from_input(s: &str) -> Value {
        match parse_numeric_string(s) {
            Some(n) => Value::StrNum(Rc::from(s), n),
            None => Value::Str(Rc::from(s)),
        }
    }

    /// Wraps an ordinary (non-input) string.
    #[inline]
    pub fn str(s: impl Into<Rc<str>>) -> Value {
        Value::Str(s.into())
    }

    /// Wraps a double, collapsing to `Int` when the value is integral.
    pub fn from_f64(n: f64) -> Value {
        if n.fract() == 0.0 && n.is_finite() && n.abs() < i64::MAX as f64 {
            Value::Int(n as i64)
        } else {
            Value::Double(n)
        }
    }

    /// The numeric view. Arrays have none.
    pub fn to_number(&self) -> AwkResult<f64> {
        match self {
            Value::Uninit => Ok(0.0),
            Value::Int(i) => Ok(*i as f64),
            Value::Double(d) => Ok(*d),
            Value::Str(s) => Ok(strtod(s)),
            Value::StrNum(_, n) => Ok(*n),
            Value::Array(_) => Err(AwkError::runtime("array used in scalar context")),
        }
    }

    /// The string view, formatting non-integral numbers with `convfmt`.
    pub fn to_str(&self, convfmt: &str) -> AwkResult<Rc<str>> {
        match self {
            Value::Uninit => Ok(Rc::from("")),
            Value::Int(i) => Ok(Rc::from(i.to_string().as_str())),
            Value::Double(d) => Ok(Rc::from(format::fmt_number(*d, convfmt).as_str())),
            Value::Str(s) | Value::StrNum(s, _) => Ok(Rc::clone(s)),
            Value::Array(_) => Err(AwkError::runtime("array used in scalar context")),
        }
    }

    /// Boolean view: numbers test against zero, strings against emptiness,
    /// numeric strings numerically.
    pub fn is_truthy(&self) -> AwkResult<bool> {
        match self {
            Value::Uninit => Ok(false),
            Value::Int(i) => Ok(*i != 0),
            Value::Double(d) => Ok(*d != 0.0),
            Value::Str(s) => Ok(!s.is_empty()),
            Value::StrNum(_, n) => Ok(*n != 0.0),
            Value::Array(_) => Err(AwkError::runtime("array used in scalar context")),
        }
    }

    /// True for values that take the numeric side of a comparison:
    /// computed numbers and numeric strings.
    #[inline]
    fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::Int(_) | Value::Double(_) | Value::StrNum(..) | Value::Uninit
        )
    }

    /// POSIX comparison: numeric iff both sides are numbers or numeric
    /// strings (uninitialised counts as either); string otherwise.
    pub fn compare(&self, other: &Value, convfmt: &str) -> AwkResult<std::cmp::Ordering> {
        if self.is_numeric() && other.is_numeric() {
            let a = self.to_number()?;
            let b = other.to_number()?;
            return Ok(a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal));
        }
        let a = self.to_str(convfmt)?;
        let b = other.to_str(convfmt)?;
        Ok(a.as_ref().cmp(b.as_ref()))
    }

    /// Returns the shared array, materialising one into `self` when the
    /// value is still uninitialised.
    pub fn as_array(&mut self, sorted: bool) -> AwkResult<Rc<RefCell<AssocArray>>> {
        match self {
            Value::Array(arr) => Ok(Rc::clone(arr)),
            Value::Uninit => {
                let arr = Rc::new(RefCell::new(AssocArray::new(sorted)));
                *self = Value::Array(Rc::clone(&arr));
                Ok(arr)
            }
            _ => Err(AwkError::runtime("scalar used in array context")),
        }
    }

    /// Guards opcodes that require a scalar operand.
    pub fn ensure_scalar(&self) -> AwkResult<()> {
        if matches!(self, Value::Array(_)) {
            Err(AwkError::runtime("array used in scalar context"))
        } else {
            Ok(())
        }
    }

    /// Returns the type name of this value as a static string.
    #[inline]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Uninit => "uninitialized",
            Value::Int(_) => "integer",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::StrNum(..) => "numeric string",
            Value::Array(_) => "array",
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Uninit
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Uninit => Ok(()),
            Value::Int(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{}", format::fmt_number(*d, "%.6g")),
            Value::Str(s) | Value::StrNum(s, _) => write!(f, "{}", s),
            Value::Array(_) => write!(f, "<array>"),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Double(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Int(if b { 1 } else { 0 })
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Rc::from(s.as_str()))
    }
}

// -----------------------------------------------------------------------------
// NUMBER PARSING
// -----------------------------------------------------------------------------

/// Lenient numeric conversion: leading whitespace skipped, optional sign,
/// longest numeric prefix interpreted, remainder discarded. Empty or
/// non-numeric input yields 0.0.
pub fn strtod(s: &str) -> f64 {
    let t = s.trim_start();
    let bytes = t.as_bytes();
    let mut end = 0;
    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut seen_digits = end > int_start;
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
            seen_digits = true;
        }
    }
    if !seen_digits {
        return 0.0;
    }
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
            exp_end += 1;
        }
        let digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > digits_start {
            end = exp_end;
        }
    }
    t[..end].parse::<f64>().unwrap_or(0.0)
}

/// Parses the entire trimmed string as a number, or `None` if any
/// non-numeric text remains. Decides numeric-string status for input.
pub fn parse_numeric_string(s: &str) -> Option<f64> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    t.parse::<f64>().ok().filter(|n| n.is_finite())
}

// -----------------------------------------------------------------------------
// ARITHMETIC — exact integers where possible
// -----------------------------------------------------------------------------

/// Binary arithmetic over the dual representation. Int operands stay Int
/// for `+ - *` (promoting on overflow) and for exact division; integer
/// division or modulo by zero is a hard error, double division follows
/// IEEE.
pub fn arith(op: ArithOp, lhs: &Value, rhs: &Value) -> AwkResult<Value> {
    if let (Value::Int(a), Value::Int(b)) = (int_view(lhs), int_view(rhs)) {
        match op {
            ArithOp::Add => {
                if let Some(v) = a.checked_add(b) {
                    return Ok(Value::Int(v));
                }
            }
            ArithOp::Sub => {
                if let Some(v) = a.checked_sub(b) {
                    return Ok(Value::Int(v));
                }
            }
            ArithOp::Mul => {
                if let Some(v) = a.checked_mul(b) {
                    return Ok(Value::Int(v));
                }
            }
            ArithOp::Div => {
                if b == 0 {
                    return Err(AwkError::runtime("division by zero"));
                }
                if a % b == 0 {
                    return Ok(Value::Int(a / b));
                }
            }
            ArithOp::Mod => {
                if b == 0 {
                    return Err(AwkError::runtime("division by zero in %"));
                }
                return Ok(Value::Int(a % b));
            }
            ArithOp::Pow => {
                if (0..=62).contains(&b) {
                    if let Some(v) = a.checked_pow(b as u32) {
                        return Ok(Value::Int(v));
                    }
                }
            }
        }
    }

    let a = lhs.to_number()?;
    let b = rhs.to_number()?;
    let result = match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Mod => {
            if b == 0.0 {
                return Err(AwkError::runtime("division by zero in %"));
            }
            a % b
        }
        ArithOp::Pow => a.powf(b),
    };
    Ok(Value::Double(result))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

/// Projects integral values (including integral numeric strings) to Int
/// for the exact arithmetic fast path.
fn int_view(v: &Value) -> Value {
    match v {
        Value::Int(i) => Value::Int(*i),
        Value::Uninit => Value::Int(0),
        Value::StrNum(_, n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => {
            Value::Int(*n as i64)
        }
        other => other.clone(),
    }
}

// -----------------------------------------------------------------------------
// ASSOCIATIVE ARRAY
// -----------------------------------------------------------------------------

/// A mapping from string keys to Values.
///
/// Keys keep insertion order by default; with the sorted flag (the `-t`
/// option) iteration yields keys in lexicographic order instead.
#[derive(Debug, Clone, Default)]
pub struct AssocArray {
    map: IndexMap<Rc<str>, Value, FxBuildHasher>,
    sorted: bool,
}

impl AssocArray {
    pub fn new(sorted: bool) -> Self {
        Self {
            map: IndexMap::default(),
            sorted,
        }
    }

    /// Element lookup for rvalue contexts. Referencing a missing key
    /// creates it, as AWK requires.
    pub fn get_or_insert(&mut self, key: Rc<str>) -> Value {
        self.map.entry(key).or_insert(Value::Uninit).clone()
    }

    pub fn set(&mut self, key: Rc<str>, value: Value) {
        self.map.insert(key, value);
    }

    /// Membership test for `in`; does not create the key.
    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Non-creating lookup, for dumps and diagnostics.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    pub fn delete(&mut self, key: &str) {
        self.map.shift_remove(key);
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Materialises the key list for `for (k in a)`, honouring the
    /// configured iteration order.
    pub fn keys(&self) -> Vec<Rc<str>> {
        let mut keys: Vec<Rc<str>> = self.map.keys().cloned().collect();
        if self.sorted {
            keys.sort();
        }
        keys
    }
}
