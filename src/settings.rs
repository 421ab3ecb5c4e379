//! # Settings Module
//!
//! The single configuration record threaded through the whole pipeline.
//! Every knob the command line can set lives here, together with the
//! optional injected input/output streams that make the interpreter
//! testable in-process. There is no process-wide mutable state.

use crate::value::Value;

use std::io::{Read, Write};

/// One script input: either AWK source text or a serialised tuple IR
/// file produced by `-c`.
pub struct ScriptSource {
    /// Shown in diagnostics: a file name or `<command line>`.
    pub description: String,
    pub contents: SourceContents,
}

pub enum SourceContents {
    Text(String),
    Intermediate(Vec<u8>),
}

impl ScriptSource {
    pub const COMMAND_LINE: &'static str = "<command line>";

    pub fn from_text(description: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            contents: SourceContents::Text(text.into()),
        }
    }

    pub fn from_intermediate(description: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            description: description.into(),
            contents: SourceContents::Intermediate(bytes),
        }
    }

    pub fn is_intermediate(&self) -> bool {
        matches!(self.contents, SourceContents::Intermediate(_))
    }
}

/// What the interpreter should do and how.
pub struct Settings {
    /// Script sources in `-f` order (or the single command-line script).
    pub script_sources: Vec<ScriptSource>,
    /// `-v name=val` assignments, applied before BEGIN.
    pub variables: Vec<(String, Value)>,
    /// Positional arguments after the script: input filenames and
    /// deferred `name=val` assignments, in order. Populates ARGV.
    pub name_value_or_filenames: Vec<String>,
    /// `-F`: initial FS.
    pub field_separator: Option<String>,
    /// `-c`: write the tuple IR instead of executing.
    pub write_intermediate_file: bool,
    /// `-o`: output filename for IR / tuple dump / syntax-tree dump.
    pub output_filename: Option<String>,
    /// `-s`: dump the tuple IR as text.
    pub dump_intermediate_code: bool,
    /// `-S`: dump the syntax tree as text.
    pub dump_syntax_tree: bool,
    /// `-x`: enable `_sleep`, `_dump`, `exec`.
    pub additional_functions: bool,
    /// `-y`: enable `_INTEGER`, `_DOUBLE`, `_STRING`.
    pub additional_type_functions: bool,
    /// `-t`: keep associative array keys in sorted order.
    pub use_sorted_array_keys: bool,
    /// Swallow printf format errors, emitting the bad specifier
    /// literally. On by default; `-r` turns it off.
    pub catch_illegal_format_exceptions: bool,
    /// `-ext`: enable user-defined extensions.
    pub user_extensions: bool,
    /// `-ni`: do not consume stdin/ARGV through the input rules.
    pub no_auto_input: bool,
    /// `--locale`: numeric/formatting locale tag.
    pub locale: Option<String>,
    /// Greedy record-separator matching in the partitioner.
    pub greedy_record_separator: bool,
    /// Replaces stdin when set (testing, embedding).
    pub input: Option<Box<dyn Read>>,
    /// Replaces stdout when set (testing, embedding).
    pub output: Option<Box<dyn Write>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            script_sources: Vec::new(),
            variables: Vec::new(),
            name_value_or_filenames: Vec::new(),
            field_separator: None,
            write_intermediate_file: false,
            output_filename: None,
            dump_intermediate_code: false,
            dump_syntax_tree: false,
            additional_functions: false,
            additional_type_functions: false,
            use_sorted_array_keys: false,
            catch_illegal_format_exceptions: true,
            user_extensions: false,
            no_auto_input: false,
            locale: None,
            greedy_record_separator: false,
            input: None,
            output: None,
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// The effective output filename for a dump, falling back to the
    /// conventional default when `-o` was not given.
    pub fn dump_filename(&self, default: &str) -> String {
        self.output_filename
            .clone()
            .unwrap_or_else(|| default.to_string())
    }
}
