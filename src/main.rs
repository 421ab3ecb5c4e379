use std::process;

use hawk::error::AwkError;
use hawk::settings::{ScriptSource, Settings};
use hawk::value::Value;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment flag enabling greedy record-separator matching.
const GREEDY_RS_ENV: &str = "HAWK_GREEDY_RS";

fn main() {
    // Diagnostics are opt-in via RUST_LOG.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let settings = match parse_arguments(&args) {
        Ok(Some(settings)) => settings,
        Ok(None) => {
            // -h / -? already printed usage
            process::exit(0);
        }
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("See 'hawk -h' for usage.");
            process::exit(1);
        }
    };

    match hawk::invoke(settings) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}

/// Parses the command line in three phases, the way the option grammar
/// requires: `-X` options until the first non-option (or a bare `-`),
/// then the script (unless `-f` was given), then ARGV entries. Returns
/// `None` when usage was requested.
fn parse_arguments(args: &[String]) -> Result<Option<Settings>, AwkError> {
    let mut settings = Settings::new();
    settings.greedy_record_separator = env_flag(GREEDY_RS_ENV);

    let mut idx = 0;
    while idx < args.len() {
        let arg = &args[idx];
        if arg.is_empty() {
            return Err(AwkError::config(format!(
                "zero-length argument at position {}",
                idx + 1
            )));
        }
        if !arg.starts_with('-') {
            break;
        }
        match arg.as_str() {
            "-" => {
                idx += 1;
                break;
            }
            "-v" => {
                let value = required_argument(args, idx, "-v")?;
                idx += 1;
                let (name, val) = split_assignment(value)?;
                settings.variables.push((name.to_string(), parse_value(val)));
            }
            "-f" => {
                let filename = required_argument(args, idx, "-f")?;
                idx += 1;
                settings.script_sources.push(read_script_file(filename)?);
            }
            "-F" => {
                let fs = required_argument(args, idx, "-F")?;
                idx += 1;
                settings.field_separator = Some(fs.to_string());
            }
            "-o" => {
                let filename = required_argument(args, idx, "-o")?;
                idx += 1;
                settings.output_filename = Some(filename.to_string());
            }
            "--locale" => {
                let tag = required_argument(args, idx, "--locale")?;
                idx += 1;
                tracing::warn!(
                    locale = tag,
                    "locale-aware formatting is not implemented; using the C locale"
                );
                settings.locale = Some(tag.to_string());
            }
            "-c" => settings.write_intermediate_file = true,
            "-s" => settings.dump_intermediate_code = true,
            "-S" => settings.dump_syntax_tree = true,
            "-x" => settings.additional_functions = true,
            "-y" => settings.additional_type_functions = true,
            "-t" => settings.use_sorted_array_keys = true,
            "-r" => settings.catch_illegal_format_exceptions = false,
            "-ext" => settings.user_extensions = true,
            "-ni" => settings.no_auto_input = true,
            "-h" | "-?" => {
                if args.len() > 1 {
                    return Err(AwkError::config(
                        "help output does not accept other arguments",
                    ));
                }
                usage();
                return Ok(None);
            }
            unknown => {
                return Err(AwkError::config(format!("unknown parameter: {}", unknown)));
            }
        }
        idx += 1;
    }

    // Script mode when no -f was provided.
    if settings.script_sources.is_empty() {
        match args.get(idx) {
            Some(script) => {
                settings
                    .script_sources
                    .push(ScriptSource::from_text(ScriptSource::COMMAND_LINE, script));
                idx += 1;
            }
            None => return Err(AwkError::config("awk script not provided")),
        }
    }

    // Everything else feeds ARGV: input filenames and deferred
    // name=val assignments.
    while idx < args.len() {
        settings.name_value_or_filenames.push(args[idx].clone());
        idx += 1;
    }

    Ok(Some(settings))
}

/// Reads a `-f` argument, recognising tuple IR files by their magic so
/// compiled programs can be fed back in.
fn read_script_file(filename: &str) -> Result<ScriptSource, AwkError> {
    let bytes = std::fs::read(filename)
        .map_err(|e| AwkError::config(format!("cannot read script '{}': {}", filename, e)))?;
    let looks_intermediate = bytes.starts_with(b"{")
        && bytes
            .windows(hawk::opcode::IR_MAGIC.len())
            .any(|w| w == hawk::opcode::IR_MAGIC.as_bytes());
    if looks_intermediate {
        Ok(ScriptSource::from_intermediate(filename, bytes))
    } else {
        let text = String::from_utf8(bytes).map_err(|_| {
            AwkError::config(format!("script '{}' is not valid UTF-8", filename))
        })?;
        Ok(ScriptSource::from_text(filename, text))
    }
}

fn required_argument<'a>(
    args: &'a [String],
    idx: usize,
    flag: &str,
) -> Result<&'a str, AwkError> {
    args.get(idx + 1)
        .map(|s| s.as_str())
        .ok_or_else(|| AwkError::config(format!("need additional argument for {}", flag)))
}

fn split_assignment(arg: &str) -> Result<(&str, &str), AwkError> {
    arg.split_once('=')
        .filter(|(name, _)| {
            let mut chars = name.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
        .ok_or_else(|| {
            AwkError::config(format!("'{}' must be of the form name=value", arg))
        })
}

/// `-v` values deduce their type: integer, then double, then string.
fn parse_value(text: &str) -> Value {
    if let Ok(i) = text.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(d) = text.parse::<f64>() {
        return Value::Double(d);
    }
    Value::from_input(text)
}

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let v = v.trim();
            v == "1" || v.eq_ignore_ascii_case("yes") || v.eq_ignore_ascii_case("true")
        }
        Err(_) => false,
    }
}

fn usage() {
    println!("Usage:");
    println!(
        "hawk [-F fs_val] [-f script-filename] [-o output-filename] [-c] [-S] [-s] [-x] [-y] \
         [-r] [--locale tag] [-ext] [-ni] [-t] [-v name=val]... [script] \
         [name=val | input_filename]..."
    );
    println!();
    println!(" -F fs_val = Use fs_val for FS.");
    println!(" -f filename = Use contents of filename for script.");
    println!(" -v name=val = Initial awk variable assignments.");
    println!();
    println!(" -t = Maintain array keys in sorted order.");
    println!(" -c = Compile to intermediate file. (default: a.ai)");
    println!(" -o = Specify output file.");
    println!(" -S = Write the syntax tree to file. (default: syntax_tree.lst)");
    println!(" -s = Write the intermediate code to file. (default: avm.lst)");
    println!(" -x = Enable _sleep, _dump as keywords, and exec as a builtin func.");
    println!(" -y = Enable _INTEGER, _DOUBLE, and _STRING casting keywords.");
    println!(" -r = Do NOT hide format errors for [s]printf.");
    println!(" --locale tag = Specify a locale to be used instead of the C locale.");
    println!("-ext = Enable user-defined extensions. (default: not enabled)");
    println!("-ni = Do NOT process stdin or ARGC/V through input rules.");
    println!("      (Useful for blocking extensions.)");
    println!();
    println!(" -h or -? = This help screen.");
}
