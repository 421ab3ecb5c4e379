//! # IO Module
//!
//! Cached output and input streams for redirections. Streams are keyed
//! by the file name or command text exactly as the script wrote it, so
//! repeated `print x > "f"` statements append to one open handle until
//! `close("f")` or program shutdown.

use crate::error::{AwkError, AwkResult};
use crate::partitioner::Partitioner;

use rustc_hash::FxHashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::process::{Child, Command, Stdio};

// -----------------------------------------------------------------------------
// OUTPUT STREAMS
// -----------------------------------------------------------------------------

enum OutputTarget {
    File(BufWriter<File>),
    Pipe(Child),
}

/// Output files and command pipes opened by `print`/`printf`
/// redirections.
#[derive(Default)]
pub struct OutputStreams {
    targets: FxHashMap<String, OutputTarget>,
}

impl OutputStreams {
    /// Writes to the named file, opening it on first use. `append`
    /// selects `>>`; it only matters on the first write.
    pub fn write_file(&mut self, name: &str, text: &str, append: bool) -> AwkResult<()> {
        if !self.targets.contains_key(name) {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .append(append)
                .truncate(!append)
                .open(name)
                .map_err(|e| AwkError::io(format!("cannot open '{}': {}", name, e)))?;
            self.targets
                .insert(name.to_string(), OutputTarget::File(BufWriter::new(file)));
        }
        match self.targets.get_mut(name) {
            Some(OutputTarget::File(w)) => w
                .write_all(text.as_bytes())
                .map_err(|e| AwkError::io(format!("write to '{}' failed: {}", name, e))),
            _ => Err(AwkError::io(format!(
                "'{}' is open as a pipe, not a file",
                name
            ))),
        }
    }

    /// Writes to the named command's stdin, spawning it on first use.
    pub fn write_pipe(&mut self, command: &str, text: &str) -> AwkResult<()> {
        if !self.targets.contains_key(command) {
            let child = Command::new("sh")
                .arg("-c")
                .arg(command)
                .stdin(Stdio::piped())
                .spawn()
                .map_err(|e| AwkError::io(format!("cannot run '{}': {}", command, e)))?;
            self.targets
                .insert(command.to_string(), OutputTarget::Pipe(child));
        }
        match self.targets.get_mut(command) {
            Some(OutputTarget::Pipe(child)) => {
                let stdin = child
                    .stdin
                    .as_mut()
                    .ok_or_else(|| AwkError::io("pipe has no stdin"))?;
                stdin
                    .write_all(text.as_bytes())
                    .map_err(|e| AwkError::io(format!("write to '{}' failed: {}", command, e)))
            }
            _ => Err(AwkError::io(format!(
                "'{}' is open as a file, not a pipe",
                command
            ))),
        }
    }

    /// Closes one stream, returning the close status for `close(name)`:
    /// 0 on success, the child's exit code for pipes, -1 when the name
    /// was not open.
    pub fn close(&mut self, name: &str) -> i64 {
        match self.targets.remove(name) {
            Some(OutputTarget::File(mut w)) => {
                let _ = w.flush();
                0
            }
            Some(OutputTarget::Pipe(mut child)) => {
                drop(child.stdin.take());
                match child.wait() {
                    Ok(status) => status.code().unwrap_or(0) as i64,
                    Err(_) => -1,
                }
            }
            None => -1,
        }
    }

    /// Flushes every file and reaps every pipe. Called once before
    /// `invoke` returns so no output is lost.
    pub fn shutdown(&mut self) {
        let names: Vec<String> = self.targets.keys().cloned().collect();
        for name in names {
            self.close(&name);
        }
    }
}

// -----------------------------------------------------------------------------
// INPUT STREAMS
// -----------------------------------------------------------------------------

/// An input pipe keeps the child alive while its stdout is partitioned.
struct InputPipe {
    child: Child,
    partitioner: Partitioner,
}

/// Input files (`getline < file`) and command pipes (`cmd | getline`),
/// each wrapped in its own record partitioner.
#[derive(Default)]
pub struct InputStreams {
    files: FxHashMap<String, Partitioner>,
    pipes: FxHashMap<String, InputPipe>,
}

impl InputStreams {
    /// Reads the next record from the named file, opening it on first
    /// use. `rs` and `greedy` configure the partitioner.
    pub fn file_record(
        &mut self,
        name: &str,
        rs: &str,
        greedy: bool,
    ) -> AwkResult<Option<String>> {
        if !self.files.contains_key(name) {
            let file: Box<dyn std::io::Read> = if name == "-" {
                Box::new(std::io::stdin())
            } else {
                Box::new(
                    File::open(name)
                        .map_err(|e| AwkError::io(format!("cannot open '{}': {}", name, e)))?,
                )
            };
            self.files
                .insert(name.to_string(), Partitioner::new(file, rs, false, greedy)?);
        }
        let partitioner = self.files.get_mut(name).expect("inserted above");
        partitioner.set_record_separator(rs)?;
        partitioner.next_record()
    }

    /// Reads the next record from the named command's stdout, spawning
    /// the command on first use.
    pub fn pipe_record(
        &mut self,
        command: &str,
        rs: &str,
        greedy: bool,
    ) -> AwkResult<Option<String>> {
        if !self.pipes.contains_key(command) {
            let mut child = Command::new("sh")
                .arg("-c")
                .arg(command)
                .stdout(Stdio::piped())
                .spawn()
                .map_err(|e| AwkError::io(format!("cannot run '{}': {}", command, e)))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| AwkError::io("pipe has no stdout"))?;
            let partitioner = Partitioner::new(Box::new(stdout), rs, false, greedy)?;
            self.pipes
                .insert(command.to_string(), InputPipe { child, partitioner });
        }
        let pipe = self.pipes.get_mut(command).expect("inserted above");
        pipe.partitioner.set_record_separator(rs)?;
        pipe.partitioner.next_record()
    }

    /// Closes one input stream; see `OutputStreams::close` for codes.
    pub fn close(&mut self, name: &str) -> i64 {
        if self.files.remove(name).is_some() {
            return 0;
        }
        if let Some(mut pipe) = self.pipes.remove(name) {
            return match pipe.child.wait() {
                Ok(status) => status.code().unwrap_or(0) as i64,
                Err(_) => -1,
            };
        }
        -1
    }

    /// Drops every input and reaps pipe children.
    pub fn shutdown(&mut self) {
        self.files.clear();
        let names: Vec<String> = self.pipes.keys().cloned().collect();
        for name in names {
            self.close(&name);
        }
    }
}
