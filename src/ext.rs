//! # Extension Module
//!
//! User-defined builtin functions. An extension declares keyword names
//! and an invoke entry point; the registry resolves keywords at parse
//! time (for arity checking) and dispatches them at run time through the
//! generic invoke-extension opcode.
//!
//! Extensions are plain values, not a class hierarchy: the registry maps
//! each keyword to the extension that claimed it. The process-wide list
//! in the `HAWK_EXTENSIONS` environment variable (`#`-separated names)
//! selects bundled extensions; duplicates are skipped with a warning and
//! keyword collisions are a configuration error.

use crate::error::{AwkError, AwkResult};
use crate::value::Value;

use rustc_hash::FxHashMap;
use std::io::Write;
use tracing::{debug, warn};

/// Environment variable naming bundled extensions to load, `#`-separated.
pub const EXTENSIONS_ENV: &str = "HAWK_EXTENSIONS";

/// What an extension may touch while it runs.
pub struct ExtensionContext<'a> {
    /// The current record (`$0`).
    pub record: &'a str,
    /// The interpreter's output stream.
    pub output: &'a mut dyn Write,
}

/// A user-defined builtin bundle.
pub trait Extension {
    /// Display name used in diagnostics and collision reports.
    fn name(&self) -> &str;

    /// The keywords this extension claims.
    fn keywords(&self) -> Vec<&'static str>;

    /// Accepted (min, max) argument counts for one of this extension's
    /// keywords. Checked by the parser.
    fn arity(&self, keyword: &str) -> (usize, usize);

    /// Runs one keyword. Errors surface to the script as runtime errors
    /// carrying the extension's message.
    fn invoke(
        &mut self,
        keyword: &str,
        args: &[Value],
        ctx: &mut ExtensionContext,
    ) -> AwkResult<Value>;
}

// -----------------------------------------------------------------------------
// REGISTRY
// -----------------------------------------------------------------------------

#[derive(Default)]
pub struct ExtensionRegistry {
    extensions: Vec<Box<dyn Extension>>,
    by_keyword: FxHashMap<String, usize>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the registry from the `HAWK_EXTENSIONS` environment list
    /// plus the always-bundled core extension.
    pub fn from_env() -> AwkResult<Self> {
        let mut registry = Self::new();
        registry.register(Box::new(CoreExtension))?;

        if let Ok(list) = std::env::var(EXTENSIONS_ENV) {
            for name in list.split('#').filter(|s| !s.is_empty()) {
                match bundled(name) {
                    Some(ext) => registry.register(ext)?,
                    None => {
                        warn!(extension = name, "unknown extension, skipping");
                    }
                }
            }
        }
        Ok(registry)
    }

    /// Registers one extension. A repeated extension name is skipped
    /// with a warning; a keyword already claimed by another extension is
    /// an error.
    pub fn register(&mut self, ext: Box<dyn Extension>) -> AwkResult<()> {
        if self.extensions.iter().any(|e| e.name() == ext.name()) {
            warn!(
                extension = ext.name(),
                "extension registered multiple times, skipping"
            );
            return Ok(());
        }

        let index = self.extensions.len();
        for keyword in ext.keywords() {
            if let Some(&owner) = self.by_keyword.get(keyword) {
                return Err(AwkError::config(format!(
                    "keyword collision: '{}' claimed by both {} and {}",
                    keyword,
                    self.extensions[owner].name(),
                    ext.name()
                )));
            }
            self.by_keyword.insert(keyword.to_string(), index);
        }
        debug!(extension = ext.name(), "extension registered");
        self.extensions.push(ext);
        Ok(())
    }

    /// Keyword → arity map handed to the parser.
    pub fn keyword_arities(&self) -> FxHashMap<String, (usize, usize)> {
        self.by_keyword
            .iter()
            .map(|(keyword, &index)| {
                (keyword.clone(), self.extensions[index].arity(keyword))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Runs the extension owning `keyword`.
    pub fn invoke(
        &mut self,
        keyword: &str,
        args: &[Value],
        ctx: &mut ExtensionContext,
    ) -> AwkResult<Value> {
        match self.by_keyword.get(keyword) {
            Some(&index) => self.extensions[index].invoke(keyword, args, ctx),
            None => Err(AwkError::runtime(format!(
                "no extension registered for keyword '{}'",
                keyword
            ))),
        }
    }
}

/// Resolves a bundled extension by its configured name.
fn bundled(name: &str) -> Option<Box<dyn Extension>> {
    match name {
        "core" => Some(Box::new(CoreExtension)),
        _ => None,
    }
}

// -----------------------------------------------------------------------------
// CORE EXTENSION
// -----------------------------------------------------------------------------

/// The always-available utility keywords.
pub struct CoreExtension;

impl Extension for CoreExtension {
    fn name(&self) -> &str {
        "core"
    }

    fn keywords(&self) -> Vec<&'static str> {
        vec!["_version", "_getenv"]
    }

    fn arity(&self, keyword: &str) -> (usize, usize) {
        match keyword {
            "_version" => (0, 0),
            _ => (1, 1),
        }
    }

    fn invoke(
        &mut self,
        keyword: &str,
        args: &[Value],
        _ctx: &mut ExtensionContext,
    ) -> AwkResult<Value> {
        match keyword {
            "_version" => Ok(Value::str(env!("CARGO_PKG_VERSION"))),
            "_getenv" => {
                let name = args[0].to_str("%.6g")?;
                Ok(std::env::var(name.as_ref())
                    .map(Value::from)
                    .unwrap_or(Value::Uninit))
            }
            other => Err(AwkError::runtime(format!(
                "core extension cannot handle '{}'",
                other
            ))),
        }
    }
}
