//! # Builtins Module
//!
//! Pure bodies of the string builtins: substring extraction, field
//! splitting, search, and ERE substitution. The VM owns the regex cache
//! and global state; these functions only transform values.

use crate::value::Value;

use regex::Regex;

/// `substr(s, m, n)` with the POSIX clamp rules: character positions
/// start at 1, positions before the string exist but hold nothing, and
/// the window is `[m, m+n)`.
pub fn substr(s: &str, m: f64, n: Option<f64>) -> String {
    let len = s.chars().count() as f64;
    let start = m.trunc();
    let end = match n {
        Some(n) => start + n.trunc(),
        None => len + 1.0,
    };
    let lo = start.max(1.0);
    let hi = end.min(len + 1.0);
    if hi <= lo {
        return String::new();
    }
    s.chars()
        .skip(lo as usize - 1)
        .take((hi - lo) as usize)
        .collect()
}

/// `index(s, t)`: 1-based position of the first occurrence, 0 if none.
pub fn index_of(s: &str, t: &str) -> i64 {
    match s.find(t) {
        Some(byte_pos) => s[..byte_pos].chars().count() as i64 + 1,
        None => 0,
    }
}

/// How a record splits into fields.
pub enum FieldSep {
    /// FS `" "`: leading/trailing blanks ignored, runs of whitespace
    /// separate.
    Whitespace,
    /// Single-character FS, matched literally.
    Char(char),
    /// Anything longer compiles as an ERE.
    Ere(Regex),
}

/// Splits `record` by `sep`, yielding each field in order.
pub fn split_fields<F: FnMut(&str)>(record: &str, sep: &FieldSep, mut push: F) {
    match sep {
        FieldSep::Whitespace => {
            for field in record.split_ascii_whitespace() {
                push(field);
            }
        }
        FieldSep::Char(c) => {
            if record.is_empty() {
                return;
            }
            for field in record.split(*c) {
                push(field);
            }
        }
        FieldSep::Ere(re) => {
            if record.is_empty() {
                return;
            }
            let mut start = 0;
            for m in re.find_iter(record) {
                // A zero-width match would loop forever; skip it.
                if m.end() == m.start() {
                    continue;
                }
                push(&record[start..m.start()]);
                start = m.end();
            }
            push(&record[start..]);
        }
    }
}

/// `match(s, ere)`: returns (RSTART, RLENGTH) — (0, -1) when there is
/// no match, 1-based character positions otherwise.
pub fn match_locate(s: &str, re: &Regex) -> (i64, i64) {
    match re.find(s) {
        Some(m) => {
            let start = s[..m.start()].chars().count() as i64 + 1;
            let len = s[m.start()..m.end()].chars().count() as i64;
            (start, len)
        }
        None => (0, -1),
    }
}

/// ERE substitution for `sub` (first match) and `gsub` (every match).
///
/// In the replacement, `&` stands for the matched text, `\&` for a
/// literal ampersand, and `\\` for a backslash; any other escaped
/// character keeps its backslash.
pub fn substitute(re: &Regex, repl: &str, input: &str, global: bool) -> (String, i64) {
    let mut out = String::with_capacity(input.len());
    let mut last_end = 0;
    let mut count = 0i64;
    let mut prev_match_end: Option<usize> = None;

    for m in re.find_iter(input) {
        if m.start() < last_end {
            continue;
        }
        // An empty match directly after a replaced match is not a new
        // substitution site.
        if m.start() == m.end() && prev_match_end == Some(m.start()) {
            continue;
        }
        out.push_str(&input[last_end..m.start()]);
        expand_replacement(&mut out, repl, m.as_str());
        prev_match_end = Some(m.end());
        last_end = m.end();
        if m.start() == m.end() {
            // Carry one character forward so empty matches advance.
            if let Some(c) = input[m.end()..].chars().next() {
                out.push(c);
                last_end = m.end() + c.len_utf8();
            }
        }
        count += 1;
        if !global {
            break;
        }
    }
    out.push_str(&input[last_end..]);
    (out, count)
}

fn expand_replacement(out: &mut String, repl: &str, matched: &str) {
    let mut chars = repl.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('&') => out.push('&'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            },
            '&' => out.push_str(matched),
            other => out.push(other),
        }
    }
}

/// The `split()` builtin: clears `out` conceptually (the VM does it) and
/// returns the fields of `s` under `sep`.
pub fn split_into(s: &str, sep: &FieldSep) -> Vec<String> {
    let mut fields = Vec::new();
    split_fields(s, sep, |f| fields.push(f.to_string()));
    fields
}

/// Builds a field separator from the FS value: `" "` is whitespace
/// mode, one character splits literally, more compiles as an ERE.
pub fn field_sep_from(fs: &str) -> Result<FieldSep, regex::Error> {
    if fs == " " {
        return Ok(FieldSep::Whitespace);
    }
    let mut chars = fs.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c != '\\' => Ok(FieldSep::Char(c)),
        _ => Ok(FieldSep::Ere(Regex::new(fs)?)),
    }
}

/// Joins fields back into a record with OFS, for `$0` reconstruction.
pub fn join_fields(fields: &[Value], ofs: &str, convfmt: &str) -> String {
    let mut out = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push_str(ofs);
        }
        match field.to_str(convfmt) {
            Ok(s) => out.push_str(&s),
            Err(_) => {}
        }
    }
    out
}
