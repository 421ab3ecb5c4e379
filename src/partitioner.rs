//! # Partitioner Module
//!
//! A reader that consumes one record at a time from an underlying input
//! stream, splitting on the record-separator regular expression.
//!
//! ## Greedy regex matching
//!
//! By default, matching is non-greedy across buffer boundaries: an
//! ambiguous RS such as `ab?c?b` may match more or less input depending
//! on where a read happened to stop. Greedy mode reads one more character
//! at a time and re-matches while the match still touches the buffer end,
//! so such separators never split a record early. It is opt-in because
//! the extra read is undesirable for interactive input.

use crate::error::{AwkError, AwkResult};

use regex::Regex;
use std::io::Read;

const READ_CHUNK: usize = 4096;

/// Splits an input stream into records on a configurable separator.
pub struct Partitioner {
    reader: Box<dyn Read>,
    /// Compiled record separator.
    rs: Regex,
    /// The separator string `rs` was compiled from.
    rs_text: String,
    /// Empty-RS mode: one record holding all remaining input at EOF.
    consume_all: bool,
    /// Read but not yet returned as records.
    remaining: String,
    eof: bool,
    /// Re-match while the match abuts the buffer end.
    greedy: bool,
    /// Whether the underlying stream is a file from the filename list.
    from_filename_list: bool,
}

impl Partitioner {
    /// Wraps a stream with the given record separator.
    pub fn new(
        reader: Box<dyn Read>,
        record_separator: &str,
        from_filename_list: bool,
        greedy: bool,
    ) -> AwkResult<Self> {
        let (rs, consume_all) = compile_separator(record_separator)?;
        Ok(Self {
            reader,
            rs,
            rs_text: record_separator.to_string(),
            consume_all,
            remaining: String::new(),
            eof: false,
            greedy,
            from_filename_list,
        })
    }

    /// Assigns a new record separator, recompiling only on change.
    pub fn set_record_separator(&mut self, record_separator: &str) -> AwkResult<()> {
        if record_separator != self.rs_text {
            let (rs, consume_all) = compile_separator(record_separator)?;
            self.rs = rs;
            self.consume_all = consume_all;
            self.rs_text = record_separator.to_string();
        }
        Ok(())
    }

    /// True when the underlying input came from a filename-list argument.
    pub fn from_filename_list(&self) -> bool {
        self.from_filename_list
    }

    /// Consumes one record from the stream.
    ///
    /// Matches the separator against the buffered input, reading more as
    /// needed. At end of input a non-empty buffer is the final record;
    /// an empty one means no more records exist.
    pub fn next_record(&mut self) -> AwkResult<Option<String>> {
        loop {
            if !self.consume_all && !self.eof && !self.remaining.is_empty() {
                if let Some(m) = self.rs.find(&self.remaining) {
                    let (mut start, mut end) = (m.start(), m.end());

                    if self.greedy {
                        // Move the match away from the buffer end so that
                        // separators straddling a read boundary are seen
                        // whole. One character at a time.
                        while end == self.remaining.len() && !self.eof {
                            if self.fill(1)? == 0 {
                                break;
                            }
                            match self.rs.find(&self.remaining) {
                                Some(m) => {
                                    start = m.start();
                                    end = m.end();
                                }
                                None => break,
                            }
                        }
                    }

                    let record = self.remaining[..start].to_string();
                    self.remaining.drain(..end);
                    return Ok(Some(record));
                }
            }

            if self.eof {
                if self.remaining.is_empty() {
                    return Ok(None);
                }
                let record = std::mem::take(&mut self.remaining);
                return Ok(Some(record));
            }

            self.fill(READ_CHUNK)?;
        }
    }

    /// Reads up to `max` bytes into the buffer, returning the count.
    /// Sets the EOF flag on a zero-length read.
    fn fill(&mut self, max: usize) -> AwkResult<usize> {
        let mut chunk = vec![0u8; max];
        let n = self.reader.read(&mut chunk)?;
        if n == 0 {
            self.eof = true;
            return Ok(0);
        }
        chunk.truncate(n);
        // Input records are text; invalid bytes are replaced rather than
        // failing the whole stream.
        self.remaining.push_str(&String::from_utf8_lossy(&chunk));
        Ok(n)
    }
}

/// Compiles a record-separator string.
///
/// The empty separator selects consume-all mode (the whole remaining
/// input forms one record at EOF) backed by `(?sm)\z`. The common
/// newline separators compile literally as a fast path; anything else is
/// a DOTALL/MULTILINE regex.
fn compile_separator(rs: &str) -> AwkResult<(Regex, bool)> {
    if rs.is_empty() {
        let re = Regex::new(r"(?sm)\z").expect("static pattern compiles");
        return Ok((re, true));
    }
    if rs == "\n" || rs == "\r\n" || rs == "\r" {
        let re = Regex::new(&regex::escape(rs)).expect("escaped literal compiles");
        return Ok((re, false));
    }
    let re = Regex::new(&format!("(?sm){}", rs))
        .map_err(|e| AwkError::runtime(format!("invalid record separator /{}/: {}", rs, e)))?;
    Ok((re, false))
}
