//! # Format Module
//!
//! The printf/sprintf format-string interpreter. Supports the
//! `%d %i %o %x %X %u %c %s %e %E %f %g %G %%` conversions with the
//! `-`, `0`, `+`, space and `#` flags, numeric or `*` width and
//! precision.
//!
//! A malformed specifier or an argument mismatch raises a Format error.
//! When the suppression flag is on (the default; `-r` turns it off) the
//! failing specifier is copied to the output literally instead.

use crate::error::{AwkError, AwkResult};
use crate::value::Value;

use std::str::Chars;

// -----------------------------------------------------------------------------
// CONVERSION SPECIFIER
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct Spec {
    minus: bool,
    plus: bool,
    space: bool,
    zero: bool,
    alt: bool,
    width: Option<usize>,
    precision: Option<usize>,
    conv: char,
    /// The specifier exactly as written, for literal fallback output.
    raw: String,
}

/// Parses one conversion specifier after its `%`. Consumes `*` width and
/// precision arguments from `args` via `next_arg`.
fn parse_spec(
    iter: &mut Chars,
    mut next_arg: impl FnMut() -> AwkResult<Value>,
) -> AwkResult<Spec> {
    let mut spec = Spec {
        raw: String::from("%"),
        ..Spec::default()
    };

    let mut next = iter.next();
    loop {
        match next {
            Some(c @ ('-' | '+' | ' ' | '0' | '#')) => {
                spec.raw.push(c);
                match c {
                    '-' => spec.minus = true,
                    '+' => spec.plus = true,
                    ' ' => spec.space = true,
                    '0' => spec.zero = true,
                    '#' => spec.alt = true,
                    _ => unreachable!(),
                }
                next = iter.next();
            }
            _ => break,
        }
    }

    if let Some('*') = next {
        spec.raw.push('*');
        let w = next_arg()?.to_number()? as i64;
        if w < 0 {
            spec.minus = true;
            spec.width = Some((-w) as usize);
        } else {
            spec.width = Some(w as usize);
        }
        next = iter.next();
    } else {
        let mut width = 0usize;
        let mut any = false;
        while let Some(c) = next {
            if let Some(d) = c.to_digit(10) {
                spec.raw.push(c);
                width = width * 10 + d as usize;
                any = true;
                next = iter.next();
            } else {
                break;
            }
        }
        if any {
            spec.width = Some(width);
        }
    }

    if let Some('.') = next {
        spec.raw.push('.');
        next = iter.next();
        if let Some('*') = next {
            spec.raw.push('*');
            let p = next_arg()?.to_number()? as i64;
            spec.precision = Some(p.max(0) as usize);
            next = iter.next();
        } else {
            let mut prec = 0usize;
            while let Some(c) = next {
                if let Some(d) = c.to_digit(10) {
                    spec.raw.push(c);
                    prec = prec * 10 + d as usize;
                    next = iter.next();
                } else {
                    break;
                }
            }
            spec.precision = Some(prec);
        }
    }

    match next {
        Some(c) => {
            spec.raw.push(c);
            spec.conv = c;
            Ok(spec)
        }
        None => Err(AwkError::format("format string ends inside a specifier")),
    }
}

// -----------------------------------------------------------------------------
// SPRINTF
// -----------------------------------------------------------------------------

/// Formats `args` according to `fmt`.
///
/// `convfmt` converts string arguments that are numbers; `catch_errors`
/// selects the literal-fallback behaviour for bad specifiers.
pub fn sprintf(
    fmt: &str,
    args: &[Value],
    convfmt: &str,
    catch_errors: bool,
) -> AwkResult<String> {
    let mut out = String::with_capacity(fmt.len());
    let mut iter = fmt.chars();
    let mut arg_idx = 0usize;

    while let Some(c) = iter.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        let start_idx = arg_idx;
        let spec = {
            let args_ref = &args;
            let idx_ref = &mut arg_idx;
            parse_spec(&mut iter, move || {
                let v = args_ref.get(*idx_ref).cloned().ok_or_else(|| {
                    AwkError::format("not enough arguments for format string")
                })?;
                *idx_ref += 1;
                Ok(v)
            })
        };

        let spec = match spec {
            Ok(s) => s,
            Err(e) => {
                if catch_errors {
                    arg_idx = start_idx;
                    out.push('%');
                    continue;
                }
                return Err(e);
            }
        };

        if spec.conv == '%' {
            out.push('%');
            continue;
        }

        match format_one(&spec, args, &mut arg_idx, convfmt) {
            Ok(text) => out.push_str(&text),
            Err(e) => {
                if catch_errors {
                    out.push_str(&spec.raw);
                } else {
                    return Err(e);
                }
            }
        }
    }

    Ok(out)
}

/// Renders a single non-`%%` conversion, consuming its argument.
fn format_one(
    spec: &Spec,
    args: &[Value],
    arg_idx: &mut usize,
    convfmt: &str,
) -> AwkResult<String> {
    let value = args
        .get(*arg_idx)
        .cloned()
        .ok_or_else(|| AwkError::format("not enough arguments for format string"))?;
    *arg_idx += 1;

    let text = match spec.conv {
        'd' | 'i' => fmt_signed(value.to_number()? as i64, spec),
        'u' | 'o' | 'x' | 'X' => {
            let n = value.to_number()? as i64;
            if n < 0 {
                return Err(AwkError::format(format!(
                    "negative value for %{} conversion",
                    spec.conv
                )));
            }
            fmt_unsigned(n as u64, spec)
        }
        'c' => {
            let ch = match &value {
                Value::Str(s) | Value::StrNum(s, _) => s.chars().next(),
                _ => char::from_u32(value.to_number()? as u32),
            };
            let body: String = ch.map(String::from).unwrap_or_default();
            pad(body, spec)
        }
        's' => {
            let s = value.to_str(convfmt)?;
            let body = match spec.precision {
                Some(p) => s.chars().take(p).collect::<String>(),
                None => s.to_string(),
            };
            pad(body, spec)
        }
        'e' | 'E' => {
            let prec = spec.precision.unwrap_or(6);
            let body = fmt_scientific(value.to_number()?, prec, spec.conv == 'E');
            pad_signed(body, spec)
        }
        'f' | 'F' => {
            let prec = spec.precision.unwrap_or(6);
            let body = format!("{:.*}", prec, value.to_number()?);
            pad_signed(body, spec)
        }
        'g' | 'G' => {
            let body = fmt_general(
                value.to_number()?,
                spec.precision.unwrap_or(6),
                spec.conv == 'G',
                spec.alt,
            );
            pad_signed(body, spec)
        }
        other => {
            return Err(AwkError::format(format!(
                "unsupported format specifier '%{}'",
                other
            )));
        }
    };
    Ok(text)
}

// -----------------------------------------------------------------------------
// NUMBER RENDERING
// -----------------------------------------------------------------------------

fn fmt_signed(v: i64, spec: &Spec) -> String {
    let mut digits = v.unsigned_abs().to_string();
    if let Some(p) = spec.precision {
        while digits.len() < p {
            digits.insert(0, '0');
        }
        if p == 0 && v == 0 {
            digits.clear();
        }
    }
    let sign = if v < 0 {
        "-"
    } else if spec.plus {
        "+"
    } else if spec.space {
        " "
    } else {
        ""
    };
    pad_numeric(sign, digits, spec)
}

fn fmt_unsigned(v: u64, spec: &Spec) -> String {
    let mut digits = match spec.conv {
        'o' => format!("{:o}", v),
        'x' => format!("{:x}", v),
        'X' => format!("{:X}", v),
        _ => v.to_string(),
    };
    if spec.alt && v != 0 {
        match spec.conv {
            'o' => digits.insert(0, '0'),
            'x' => digits.insert_str(0, "0x"),
            'X' => digits.insert_str(0, "0X"),
            _ => {}
        }
    }
    if let Some(p) = spec.precision {
        while digits.len() < p {
            digits.insert(0, '0');
        }
    }
    pad_numeric("", digits, spec)
}

/// C-style `%e`: one leading digit, `prec` fraction digits, exponent with
/// a sign and at least two digits.
fn fmt_scientific(v: f64, prec: usize, upper: bool) -> String {
    if !v.is_finite() {
        return non_finite(v, upper);
    }
    let formatted = format!("{:.*e}", prec, v);
    let (mantissa, exp) = formatted
        .split_once('e')
        .expect("std float e-format always contains an exponent");
    let exp: i32 = exp.parse().expect("std float exponent is an integer");
    let e = if upper { 'E' } else { 'e' };
    format!("{}{}{}{:02}", mantissa, e, if exp < 0 { '-' } else { '+' }, exp.abs())
}

/// C-style `%g`: `prec` significant digits, `%e` form for extreme
/// exponents, trailing zeros stripped unless `#` was given.
fn fmt_general(v: f64, prec: usize, upper: bool, alt: bool) -> String {
    if !v.is_finite() {
        return non_finite(v, upper);
    }
    let p = prec.max(1);
    let exp = if v == 0.0 {
        0
    } else {
        v.abs().log10().floor() as i32
    };

    let mut body = if exp < -4 || exp >= p as i32 {
        let mut s = fmt_scientific(v, p - 1, upper);
        if !alt {
            if let Some(epos) = s.find(if upper { 'E' } else { 'e' }) {
                let (mant, tail) = s.split_at(epos);
                let mant = strip_zeros(mant);
                s = format!("{}{}", mant, tail);
            }
        }
        s
    } else {
        let frac = (p as i32 - 1 - exp).max(0) as usize;
        let s = format!("{:.*}", frac, v);
        if alt {
            s
        } else {
            strip_zeros(&s).to_string()
        }
    };

    if upper {
        body = body.to_uppercase();
    }
    body
}

fn strip_zeros(s: &str) -> &str {
    if !s.contains('.') {
        return s;
    }
    let s = s.trim_end_matches('0');
    s.strip_suffix('.').unwrap_or(s)
}

fn non_finite(v: f64, upper: bool) -> String {
    let s = if v.is_nan() {
        "nan"
    } else if v > 0.0 {
        "inf"
    } else {
        "-inf"
    };
    if upper {
        s.to_uppercase()
    } else {
        s.to_string()
    }
}

// -----------------------------------------------------------------------------
// PADDING
// -----------------------------------------------------------------------------

/// Pads an already-signed body (floats keep their sign inside `body`).
fn pad_signed(mut body: String, spec: &Spec) -> String {
    if (spec.plus || spec.space) && !body.starts_with('-') {
        body.insert(0, if spec.plus { '+' } else { ' ' });
    }
    if spec.zero && !spec.minus {
        let width = spec.width.unwrap_or(0);
        if body.len() < width {
            let sign_len = if body.starts_with(['-', '+', ' ']) { 1 } else { 0 };
            let zeros = "0".repeat(width - body.len());
            body.insert_str(sign_len, &zeros);
            return body;
        }
    }
    pad(body, spec)
}

/// Joins a sign and digit string, zero-padding between them when asked.
fn pad_numeric(sign: &str, digits: String, spec: &Spec) -> String {
    let width = spec.width.unwrap_or(0);
    let len = sign.len() + digits.len();
    if spec.zero && !spec.minus && spec.precision.is_none() && len < width {
        return format!("{}{}{}", sign, "0".repeat(width - len), digits);
    }
    pad(format!("{}{}", sign, digits), spec)
}

/// Space-pads to the field width, honouring left alignment.
fn pad(body: String, spec: &Spec) -> String {
    let width = spec.width.unwrap_or(0);
    let len = body.chars().count();
    if len >= width {
        return body;
    }
    let fill = " ".repeat(width - len);
    if spec.minus {
        format!("{}{}", body, fill)
    } else {
        format!("{}{}", fill, body)
    }
}

// -----------------------------------------------------------------------------
// CONVFMT / OFMT
// -----------------------------------------------------------------------------

/// Converts a double to its string form: integral values print as
/// integers, everything else goes through the conversion format
/// (CONVFMT or OFMT, `%.6g` by default).
pub fn fmt_number(n: f64, convfmt: &str) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e16 {
        return format!("{}", n as i64);
    }
    sprintf(convfmt, &[Value::Double(n)], "%.6g", true)
        .unwrap_or_else(|_| format!("{}", n))
}
