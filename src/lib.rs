//! # hawk
//!
//! An AWK interpreter built as a three-stage engine: a handwritten
//! front-end (lexer, recursive-descent parser, two semantic passes), a
//! lowering of the syntax tree to a flat stream of opcode tuples with
//! symbolic jump addresses, and a stack virtual machine that interprets
//! the tuples against a regex-driven record partitioner.
//!
//! [`invoke`] is the library entry point: it runs the whole pipeline for
//! one [`settings::Settings`] configuration, covering execution as well
//! as the syntax-tree/tuple dump and intermediate-file modes.

pub mod ast;
pub mod builtins;
pub mod compiler;
pub mod error;
pub mod ext;
pub mod format;
pub mod io;
pub mod lexer;
pub mod opcode;
pub mod parser;
pub mod partitioner;
pub mod semantic;
pub mod settings;
pub mod token;
pub mod value;
pub mod vm;

#[cfg(test)]
mod tests;

use error::{AwkError, AwkResult};
use ext::ExtensionRegistry;
use lexer::Lexer;
use opcode::TupleList;
use parser::Parser;
use settings::{Settings, SourceContents};
use vm::Avm;

use tracing::debug;

/// Runs the interpreter for one configuration: parse, analyse, lower,
/// and execute — or stop after one of the dump stages. Returns the
/// process exit code.
pub fn invoke(settings: Settings) -> AwkResult<i32> {
    let extensions = if settings.user_extensions {
        ExtensionRegistry::from_env()?
    } else {
        ExtensionRegistry::new()
    };

    // Intermediate files bypass the front end; among several, the last
    // one wins. Plain sources concatenate in order and take precedence.
    let mut intermediate: Option<TupleList> = None;
    let mut source_text = String::new();
    let mut has_source = false;
    for src in &settings.script_sources {
        match &src.contents {
            SourceContents::Intermediate(bytes) => {
                debug!(source = %src.description, "loading tuple IR");
                intermediate = Some(TupleList::from_ir_bytes(bytes)?);
            }
            SourceContents::Text(text) => {
                source_text.push_str(text);
                source_text.push('\n');
                has_source = true;
            }
        }
    }

    let list = if has_source {
        let mut lexer = Lexer::new(&source_text).with_keyword_groups(
            settings.additional_functions,
            settings.additional_type_functions,
        );
        let tokens = lexer.tokenize()?;

        let mut parser = Parser::new(tokens);
        if settings.user_extensions {
            parser = parser.with_extension_keywords(extensions.keyword_arities());
        }
        let mut program = parser.parse()?;

        if settings.dump_syntax_tree {
            let filename = settings.dump_filename("syntax_tree.lst");
            debug!(file = %filename, "writing syntax tree");
            let mut file = std::fs::File::create(&filename)
                .map_err(|e| AwkError::io(format!("cannot create '{}': {}", filename, e)))?;
            program.dump(&mut file)?;
            return Ok(0);
        }

        let table = semantic::analyze(&mut program)?;
        let list = compiler::compile(&program, &table, &settings)?;

        if settings.write_intermediate_file {
            let filename = settings.dump_filename("a.ai");
            debug!(file = %filename, "writing tuple IR");
            std::fs::write(&filename, list.to_ir_bytes()?)
                .map_err(|e| AwkError::io(format!("cannot write '{}': {}", filename, e)))?;
            return Ok(0);
        }
        list
    } else {
        intermediate.ok_or_else(|| AwkError::config("no script provided"))?
    };

    if settings.dump_intermediate_code {
        let filename = settings.dump_filename("avm.lst");
        debug!(file = %filename, "writing tuple dump");
        let mut file = std::fs::File::create(&filename)
            .map_err(|e| AwkError::io(format!("cannot create '{}': {}", filename, e)))?;
        list.dump(&mut file)?;
        return Ok(0);
    }

    let mut avm = Avm::new(settings, extensions);
    avm.interpret(list)
}
