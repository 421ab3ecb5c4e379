//! # AVM Module
//!
//! The stack virtual machine that interprets the tuple stream. State is
//! a program counter, an operand stack, a call stack of activation
//! records, the global slot array, the field array, and the cached IO
//! streams. Each opcode defines its own stack effect; the program
//! counter advances through the precomputed `next` pointer except on
//! jumps, calls, and returns.
//!
//! The machine also owns the main input chain: the walk over ARGV that
//! opens files, applies deferred `name=val` assignments, and falls back
//! to standard input, feeding the `ConsumeInput` tuple at the head of
//! the lowered main loop.

use crate::builtins;
use crate::error::{AwkError, AwkResult, ErrorKind};
use crate::ext::{ExtensionContext, ExtensionRegistry};
use crate::format;
use crate::io::{InputStreams, OutputStreams};
use crate::opcode::{
    special, GetlineSource, Opcode, Redirect, StoreTarget, TupleList,
};
use crate::partitioner::Partitioner;
use crate::settings::Settings;
use crate::token::Builtin;
use crate::value::{self, AssocArray, Value};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::io::{BufWriter, Read, Write};
use std::rc::Rc;

const MAX_CALL_DEPTH: usize = 1024;

// -----------------------------------------------------------------------------
// RUNTIME STATE
// -----------------------------------------------------------------------------

/// An operand stack entry: almost always a value, but `for (k in a)`
/// keeps its key enumerator here between iterations.
enum StackEntry {
    Value(Value),
    /// Remaining keys, in reverse so iteration pops from the back.
    KeyList(Vec<Rc<str>>),
}

/// One activation record.
struct Frame {
    return_pc: usize,
    locals: Vec<Value>,
}

/// The main input chain state: which ARGV entry comes next and the
/// currently open partitioner.
struct InputChain {
    current: Option<Partitioner>,
    argv_index: usize,
    /// Whether any filename argument was ever opened.
    opened_file: bool,
    stdin_done: bool,
}

pub struct Avm {
    program: Rc<TupleList>,
    stack: Vec<StackEntry>,
    frames: Vec<Frame>,
    globals: Vec<Value>,

    /// `$0` with numeric-string tagging.
    record: Value,
    /// `$1..$NF`.
    fields: Vec<Value>,

    chain: InputChain,
    read_streams: InputStreams,
    write_streams: OutputStreams,
    out: Box<dyn Write>,
    /// Injected stdin replacement, taken when the chain first needs it.
    input_override: Option<Box<dyn Read>>,

    regex_cache: FxHashMap<String, Regex>,
    field_sep: Option<(String, builtins::FieldSep)>,

    rng: SmallRng,
    rand_seed: u64,

    extensions: ExtensionRegistry,
    sorted_arrays: bool,
    catch_format_errors: bool,
    greedy_rs: bool,

    exit_code: i64,
    /// Tuple index starting the function region, for exit-in-END checks.
    fn_region: usize,

    settings: Settings,
}

impl Avm {
    /// Builds a machine from the configuration, taking the injected
    /// streams out of it.
    pub fn new(mut settings: Settings, extensions: ExtensionRegistry) -> Self {
        let out: Box<dyn Write> = match settings.output.take() {
            Some(out) => out,
            None => Box::new(BufWriter::new(std::io::stdout())),
        };
        let input_override = settings.input.take();
        Self {
            program: Rc::new(TupleList::new()),
            stack: Vec::with_capacity(64),
            frames: Vec::new(),
            globals: Vec::new(),
            record: Value::str(""),
            fields: Vec::new(),
            chain: InputChain {
                current: None,
                argv_index: 1,
                opened_file: false,
                stdin_done: false,
            },
            read_streams: InputStreams::default(),
            write_streams: OutputStreams::default(),
            out,
            input_override,
            regex_cache: FxHashMap::default(),
            field_sep: None,
            rng: SmallRng::seed_from_u64(0),
            rand_seed: 0,
            extensions,
            sorted_arrays: settings.use_sorted_array_keys,
            catch_format_errors: settings.catch_illegal_format_exceptions,
            greedy_rs: settings.greedy_record_separator,
            exit_code: 0,
            fn_region: 0,
            settings,
        }
    }

    // -------------------------------------------------------------------------
    // SETUP
    // -------------------------------------------------------------------------

    /// Initialises the global slots: predefined variables, ENVIRON and
    /// ARGV, then the `-F` and `-v` settings.
    fn init_globals(&mut self, list: &TupleList) {
        self.globals = vec![Value::Uninit; list.num_globals as usize];

        self.globals[special::FS as usize] = Value::str(" ");
        self.globals[special::OFS as usize] = Value::str(" ");
        self.globals[special::ORS as usize] = Value::str("\n");
        self.globals[special::RS as usize] = Value::str("\n");
        self.globals[special::NR as usize] = Value::Int(0);
        self.globals[special::NF as usize] = Value::Int(0);
        self.globals[special::FNR as usize] = Value::Int(0);
        self.globals[special::FILENAME as usize] = Value::str("");
        self.globals[special::SUBSEP as usize] = Value::str("\u{1c}");
        self.globals[special::CONVFMT as usize] = Value::str("%.6g");
        self.globals[special::OFMT as usize] = Value::str("%.6g");
        self.globals[special::RSTART as usize] = Value::Int(0);
        self.globals[special::RLENGTH as usize] = Value::Int(-1);

        let mut environ = AssocArray::new(self.sorted_arrays);
        for (key, val) in std::env::vars() {
            environ.set(Rc::from(key.as_str()), Value::from_input(&val));
        }
        self.globals[special::ENVIRON as usize] =
            Value::Array(Rc::new(RefCell::new(environ)));

        let mut argv = AssocArray::new(self.sorted_arrays);
        argv.set(Rc::from("0"), Value::str("awk"));
        for (i, arg) in self.settings.name_value_or_filenames.iter().enumerate() {
            argv.set(
                Rc::from((i + 1).to_string().as_str()),
                Value::from_input(arg),
            );
        }
        self.globals[special::ARGC as usize] =
            Value::Int(self.settings.name_value_or_filenames.len() as i64 + 1);
        self.globals[special::ARGV as usize] = Value::Array(Rc::new(RefCell::new(argv)));

        if let Some(fs) = &self.settings.field_separator {
            self.globals[special::FS as usize] = Value::str(fs.as_str());
        }

        let offsets: FxHashMap<&str, u32> = list
            .global_offsets
            .iter()
            .map(|(name, off)| (name.as_str(), *off))
            .collect();
        for (name, val) in &self.settings.variables {
            if let Some(&off) = offsets.get(name.as_str()) {
                self.globals[off as usize] = val.clone();
            }
        }
    }

    // -------------------------------------------------------------------------
    // EXECUTION LOOP
    // -------------------------------------------------------------------------

    /// Interprets a lowered program to completion and returns the exit
    /// code. Flushes and reaps all IO before returning.
    pub fn interpret(&mut self, list: TupleList) -> AwkResult<i32> {
        debug_assert!(list.fully_resolved(), "post_process ran before interpret");
        self.init_globals(&list);
        self.fn_region = list
            .functions
            .iter()
            .map(|f| list.address_index(f.entry))
            .min()
            .unwrap_or(list.tuples.len());
        self.program = Rc::new(list);

        let result = self.run();
        self.wait_for_io();
        result.map(|_| self.exit_code as i32)
    }

    /// Flushes buffered output and reaps redirection children. The
    /// machine must not report success while IO is still pending.
    fn wait_for_io(&mut self) {
        let _ = self.out.flush();
        self.write_streams.shutdown();
        self.read_streams.shutdown();
    }

    fn run(&mut self) -> AwkResult<()> {
        let program = Rc::clone(&self.program);
        let mut pc = 0usize;

        while pc < program.tuples.len() {
            let tuple = &program.tuples[pc];
            let mut next = tuple.next;

            match self.exec(&tuple.op, pc, &mut next, &program) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(mut err) => {
                    if err.kind == ErrorKind::Runtime && err.span.is_none() {
                        err.message = format!("{} (at tuple {})", err.message, pc);
                    }
                    return Err(err);
                }
            }
            pc = next;
        }
        Ok(())
    }

    /// Executes one opcode. Returns `true` when the machine should halt.
    fn exec(
        &mut self,
        op: &Opcode,
        pc: usize,
        next: &mut usize,
        program: &TupleList,
    ) -> AwkResult<bool> {
        match op {
            // -- Stack ops --
            Opcode::PushInt(v) => self.push(Value::Int(*v)),
            Opcode::PushDouble(v) => self.push(Value::Double(*v)),
            Opcode::PushStr(s) => self.push(Value::str(s.as_str())),
            Opcode::PushUninit => self.push(Value::Uninit),
            Opcode::Dup => {
                let top = match self.stack.last() {
                    Some(StackEntry::Value(v)) => StackEntry::Value(v.clone()),
                    Some(StackEntry::KeyList(k)) => StackEntry::KeyList(k.clone()),
                    None => return Err(self.underflow()),
                };
                self.stack.push(top);
            }
            Opcode::Swap => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(self.underflow());
                }
                self.stack.swap(len - 1, len - 2);
            }
            Opcode::Pop => {
                self.stack.pop().ok_or_else(|| self.underflow())?;
            }

            // -- Variables --
            Opcode::LoadGlobal(off) => {
                let v = self.globals[*off as usize].clone();
                self.push(v);
            }
            Opcode::StoreGlobal(off) => {
                let v = self.pop()?;
                v.ensure_scalar()?;
                self.store_global(*off, v.clone())?;
                self.push(v);
            }
            Opcode::LoadLocal(off) => {
                let v = self.local(*off)?.clone();
                self.push(v);
            }
            Opcode::StoreLocal(off) => {
                let v = self.pop()?;
                v.ensure_scalar()?;
                *self.local_mut(*off)? = v.clone();
                self.push(v);
            }

            // -- Arrays --
            Opcode::ArrayLoadGlobal(off) => {
                let key = self.pop_key()?;
                let arr = self.global_array(*off)?;
                let v = arr.borrow_mut().get_or_insert(key);
                self.push(v);
            }
            Opcode::ArrayLoadLocal(off) => {
                let key = self.pop_key()?;
                let arr = self.local_array(*off)?;
                let v = arr.borrow_mut().get_or_insert(key);
                self.push(v);
            }
            Opcode::ArrayStoreGlobal(off) => {
                let v = self.pop()?;
                v.ensure_scalar()?;
                let key = self.pop_key()?;
                let arr = self.global_array(*off)?;
                arr.borrow_mut().set(key, v.clone());
                self.push(v);
            }
            Opcode::ArrayStoreLocal(off) => {
                let v = self.pop()?;
                v.ensure_scalar()?;
                let key = self.pop_key()?;
                let arr = self.local_array(*off)?;
                arr.borrow_mut().set(key, v.clone());
                self.push(v);
            }
            Opcode::ArrayRefGlobal(off) => {
                let arr = self.global_array(*off)?;
                self.push(Value::Array(arr));
            }
            Opcode::ArrayRefLocal(off) => {
                let arr = self.local_array(*off)?;
                self.push(Value::Array(arr));
            }
            Opcode::DeleteElemGlobal(off) => {
                let key = self.pop_key()?;
                let arr = self.global_array(*off)?;
                arr.borrow_mut().delete(&key);
            }
            Opcode::DeleteElemLocal(off) => {
                let key = self.pop_key()?;
                let arr = self.local_array(*off)?;
                arr.borrow_mut().delete(&key);
            }
            Opcode::DeleteArrayGlobal(off) => {
                let arr = self.global_array(*off)?;
                arr.borrow_mut().clear();
            }
            Opcode::DeleteArrayLocal(off) => {
                let arr = self.local_array(*off)?;
                arr.borrow_mut().clear();
            }
            Opcode::InGlobal(off) => {
                let key = self.pop_key()?;
                let arr = self.global_array(*off)?;
                let found = arr.borrow().contains(&key);
                self.push(Value::from(found));
            }
            Opcode::InLocal(off) => {
                let key = self.pop_key()?;
                let arr = self.local_array(*off)?;
                let found = arr.borrow().contains(&key);
                self.push(Value::from(found));
            }
            Opcode::JoinSubsep(count) => {
                let subsep = self.global_str(special::SUBSEP)?;
                let convfmt = self.global_str(special::CONVFMT)?;
                let values = self.pop_values(*count as usize)?;
                let mut joined = String::new();
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        joined.push_str(&subsep);
                    }
                    joined.push_str(&v.to_str(&convfmt)?);
                }
                self.push(Value::from(joined));
            }

            // -- Arithmetic / string --
            Opcode::Add => self.arith(value::ArithOp::Add)?,
            Opcode::Sub => self.arith(value::ArithOp::Sub)?,
            Opcode::Mul => self.arith(value::ArithOp::Mul)?,
            Opcode::Div => self.arith(value::ArithOp::Div)?,
            Opcode::Mod => self.arith(value::ArithOp::Mod)?,
            Opcode::Pow => self.arith(value::ArithOp::Pow)?,
            Opcode::Negate => {
                let v = self.pop()?;
                let result = match v {
                    Value::Int(i) => Value::Int(-i),
                    other => Value::Double(-other.to_number()?),
                };
                self.push(result);
            }
            Opcode::AsNumber => {
                let v = self.pop()?;
                let result = match v {
                    Value::Int(i) => Value::Int(i),
                    other => Value::from_f64(other.to_number()?),
                };
                self.push(result);
            }
            Opcode::Concat => {
                let convfmt = self.global_str(special::CONVFMT)?;
                let rhs = self.pop()?.to_str(&convfmt)?;
                let lhs = self.pop()?.to_str(&convfmt)?;
                let mut joined = String::with_capacity(lhs.len() + rhs.len());
                joined.push_str(&lhs);
                joined.push_str(&rhs);
                self.push(Value::from(joined));
            }
            Opcode::Match { negate } => {
                let convfmt = self.global_str(special::CONVFMT)?;
                let pattern = self.pop()?.to_str(&convfmt)?;
                let subject = self.pop()?.to_str(&convfmt)?;
                let re = self.compiled(&pattern)?;
                let matched = re.is_match(&subject);
                self.push(Value::from(matched != *negate));
            }
            Opcode::Lt => self.compare(|o| o == std::cmp::Ordering::Less)?,
            Opcode::Le => self.compare(|o| o != std::cmp::Ordering::Greater)?,
            Opcode::Gt => self.compare(|o| o == std::cmp::Ordering::Greater)?,
            Opcode::Ge => self.compare(|o| o != std::cmp::Ordering::Less)?,
            Opcode::Eq => self.compare(|o| o == std::cmp::Ordering::Equal)?,
            Opcode::Ne => self.compare(|o| o != std::cmp::Ordering::Equal)?,
            Opcode::Not => {
                let v = self.pop()?;
                let truthy = v.is_truthy()?;
                self.push(Value::from(!truthy));
            }

            // -- Control flow --
            Opcode::Jump(addr) => {
                *next = program.address_index(*addr);
            }
            Opcode::JumpIfFalse(addr) => {
                if !self.pop()?.is_truthy()? {
                    *next = program.address_index(*addr);
                }
            }
            Opcode::JumpIfTrue(addr) => {
                if self.pop()?.is_truthy()? {
                    *next = program.address_index(*addr);
                }
            }
            Opcode::Call { function, argc } => {
                if self.frames.len() >= MAX_CALL_DEPTH {
                    return Err(AwkError::runtime("call stack overflow"));
                }
                let info = &program.functions[*function as usize];
                let mut locals = vec![Value::Uninit; info.num_params as usize];
                for i in (0..*argc as usize).rev() {
                    locals[i] = self.pop()?;
                }
                self.frames.push(Frame {
                    return_pc: *next,
                    locals,
                });
                *next = program.address_index(info.entry);
            }
            Opcode::Return => {
                let v = self.pop()?;
                let frame = self
                    .frames
                    .pop()
                    .ok_or_else(|| AwkError::runtime("return outside of a function"))?;
                *next = frame.return_pc;
                self.push(v);
            }
            Opcode::Next => {
                let target = self
                    .program
                    .main_loop
                    .ok_or_else(|| AwkError::runtime("'next' with no input loop"))?;
                self.stack.clear();
                self.frames.clear();
                *next = program.address_index(target);
            }
            Opcode::NextFile => {
                let target = self
                    .program
                    .main_loop
                    .ok_or_else(|| AwkError::runtime("'nextfile' with no input loop"))?;
                self.chain.current = None;
                self.stack.clear();
                self.frames.clear();
                *next = program.address_index(target);
            }
            Opcode::Exit { has_code } => {
                if *has_code {
                    self.exit_code = self.pop()?.to_number()? as i64;
                }
                let end_index = program.address_index(program.end_section);
                let base_pc = self.frames.first().map(|f| f.return_pc).unwrap_or(pc);
                let in_end = base_pc >= end_index && base_pc < self.fn_region;
                if in_end {
                    return Ok(true);
                }
                self.stack.clear();
                self.frames.clear();
                *next = end_index;
            }
            Opcode::Halt => return Ok(true),

            // -- Main input loop --
            Opcode::ConsumeInput { eof } => {
                match self.next_main_record()? {
                    Some(record) => self.set_record(&record)?,
                    None => *next = program.address_index(*eof),
                }
            }

            // -- Iteration --
            Opcode::KeyList => {
                let v = self.pop()?;
                match v {
                    Value::Array(arr) => {
                        let mut keys = arr.borrow().keys();
                        keys.reverse();
                        self.stack.push(StackEntry::KeyList(keys));
                    }
                    _ => return Err(AwkError::runtime("scalar used in array context")),
                }
            }
            Opcode::IterNext { end } => {
                let key = match self.stack.last_mut() {
                    Some(StackEntry::KeyList(keys)) => keys.pop(),
                    _ => return Err(AwkError::runtime("iteration without a key list")),
                };
                match key {
                    Some(key) => self.push(Value::Str(key)),
                    None => {
                        self.stack.pop();
                        *next = program.address_index(*end);
                    }
                }
            }

            // -- Fields --
            Opcode::LoadField => {
                let index = self.pop()?.to_number()?;
                let v = self.get_field(index)?;
                self.push(v);
            }
            Opcode::StoreField => {
                let v = self.pop()?;
                v.ensure_scalar()?;
                let index = self.pop()?.to_number()?;
                self.set_field(index, v.clone())?;
                self.push(v);
            }

            // -- I/O --
            Opcode::Print { argc, redirect } => self.exec_print(*argc, *redirect, false)?,
            Opcode::Printf { argc, redirect } => self.exec_print(*argc, *redirect, true)?,
            Opcode::Getline { source, target } => self.exec_getline(*source, *target)?,

            // -- Builtins --
            Opcode::CallBuiltin { builtin, argc } => self.exec_builtin(*builtin, *argc)?,
            Opcode::Substitute { global, target } => self.exec_substitute(*global, *target)?,

            // -- Extensions --
            Opcode::InvokeExtension { keyword, argc } => {
                let args = self.pop_values(*argc as usize)?;
                let record = match &self.record {
                    Value::Str(s) | Value::StrNum(s, _) => s.to_string(),
                    other => other.to_string(),
                };
                let mut ctx = ExtensionContext {
                    record: &record,
                    output: &mut self.out,
                };
                let result = self.extensions.invoke(keyword, &args, &mut ctx)?;
                self.push(result);
            }
        }
        Ok(false)
    }

    // -------------------------------------------------------------------------
    // STACK PLUMBING
    // -------------------------------------------------------------------------

    #[inline]
    fn push(&mut self, v: Value) {
        self.stack.push(StackEntry::Value(v));
    }

    fn pop(&mut self) -> AwkResult<Value> {
        match self.stack.pop() {
            Some(StackEntry::Value(v)) => Ok(v),
            Some(StackEntry::KeyList(_)) => {
                Err(AwkError::runtime("key enumerator used as a value"))
            }
            None => Err(self.underflow()),
        }
    }

    /// Pops `count` values, restoring push order.
    fn pop_values(&mut self, count: usize) -> AwkResult<Vec<Value>> {
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.pop()?);
        }
        values.reverse();
        Ok(values)
    }

    /// Pops an array subscript as its string key.
    fn pop_key(&mut self) -> AwkResult<Rc<str>> {
        let convfmt = self.global_str(special::CONVFMT)?;
        self.pop()?.to_str(&convfmt)
    }

    fn underflow(&self) -> AwkError {
        // Unreachable when lowering is correct.
        AwkError::runtime("operand stack underflow")
    }

    fn arith(&mut self, op: value::ArithOp) -> AwkResult<()> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let result = value::arith(op, &lhs, &rhs)?;
        self.push(result);
        Ok(())
    }

    fn compare(&mut self, accept: impl Fn(std::cmp::Ordering) -> bool) -> AwkResult<()> {
        let convfmt = self.global_str(special::CONVFMT)?;
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let ordering = lhs.compare(&rhs, &convfmt)?;
        self.push(Value::from(accept(ordering)));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // VARIABLE ACCESS
    // -------------------------------------------------------------------------

    fn local(&self, off: u32) -> AwkResult<&Value> {
        self.frames
            .last()
            .and_then(|f| f.locals.get(off as usize))
            .ok_or_else(|| AwkError::runtime("local slot outside of a function"))
    }

    fn local_mut(&mut self, off: u32) -> AwkResult<&mut Value> {
        self.frames
            .last_mut()
            .and_then(|f| f.locals.get_mut(off as usize))
            .ok_or_else(|| AwkError::runtime("local slot outside of a function"))
    }

    /// Stores into a global slot, applying special-variable side
    /// effects.
    fn store_global(&mut self, off: u32, v: Value) -> AwkResult<()> {
        if off == special::NF {
            let nf = v.to_number()? as usize;
            self.resize_fields(nf)?;
            return Ok(());
        }
        self.globals[off as usize] = v;
        Ok(())
    }

    fn global_str(&self, off: u32) -> AwkResult<Rc<str>> {
        // CONVFMT itself is read with the default so lookup terminates.
        self.globals[off as usize].to_str("%.6g")
    }

    fn global_array(&mut self, off: u32) -> AwkResult<Rc<RefCell<AssocArray>>> {
        let sorted = self.sorted_arrays;
        self.globals[off as usize].as_array(sorted)
    }

    fn local_array(&mut self, off: u32) -> AwkResult<Rc<RefCell<AssocArray>>> {
        let sorted = self.sorted_arrays;
        self.frames
            .last_mut()
            .and_then(|f| f.locals.get_mut(off as usize))
            .ok_or_else(|| AwkError::runtime("local slot outside of a function"))?
            .as_array(sorted)
    }

    // -------------------------------------------------------------------------
    // RECORD AND FIELDS
    // -------------------------------------------------------------------------

    /// Installs a new `$0`, splitting fields with the current FS and
    /// updating NF.
    fn set_record(&mut self, record: &str) -> AwkResult<()> {
        self.record = Value::from_input(record);
        let sep = self.current_field_sep()?;
        self.fields.clear();
        let fields = &mut self.fields;
        builtins::split_fields(record, &sep, |f| fields.push(Value::from_input(f)));
        self.globals[special::NF as usize] = Value::Int(self.fields.len() as i64);
        Ok(())
    }

    /// Rebuilds `$0` from the field array with OFS.
    fn rebuild_record(&mut self) -> AwkResult<()> {
        let ofs = self.global_str(special::OFS)?;
        let convfmt = self.global_str(special::CONVFMT)?;
        let joined = builtins::join_fields(&self.fields, &ofs, &convfmt);
        self.record = Value::from_input(&joined);
        self.globals[special::NF as usize] = Value::Int(self.fields.len() as i64);
        Ok(())
    }

    fn resize_fields(&mut self, nf: usize) -> AwkResult<()> {
        self.fields.resize(nf, Value::Uninit);
        self.rebuild_record()
    }

    fn get_field(&mut self, index: f64) -> AwkResult<Value> {
        if index < 0.0 {
            return Err(AwkError::runtime(format!("invalid field index {}", index)));
        }
        let index = index as usize;
        if index == 0 {
            return Ok(self.record.clone());
        }
        Ok(self
            .fields
            .get(index - 1)
            .cloned()
            .unwrap_or(Value::Uninit))
    }

    fn set_field(&mut self, index: f64, v: Value) -> AwkResult<()> {
        if index < 0.0 {
            return Err(AwkError::runtime(format!("invalid field index {}", index)));
        }
        let index = index as usize;
        if index == 0 {
            let convfmt = self.global_str(special::CONVFMT)?;
            let text = v.to_str(&convfmt)?;
            return self.set_record(&text);
        }
        if self.fields.len() < index {
            self.fields.resize(index, Value::Uninit);
        }
        self.fields[index - 1] = v;
        self.rebuild_record()
    }

    /// The FS splitter, recompiled only when FS changed.
    fn current_field_sep(&mut self) -> AwkResult<builtins::FieldSep> {
        let fs = self.global_str(special::FS)?;
        let needs_compile = match &self.field_sep {
            Some((cached, _)) => cached.as_str() != fs.as_ref(),
            None => true,
        };
        if needs_compile {
            let sep = builtins::field_sep_from(&fs)
                .map_err(|e| AwkError::runtime(format!("invalid FS /{}/: {}", fs, e)))?;
            self.field_sep = Some((fs.to_string(), sep));
        }
        // A cheap clone is not available for compiled separators; split
        // borrows instead.
        let (_, sep) = self.field_sep.as_ref().expect("compiled above");
        Ok(match sep {
            builtins::FieldSep::Whitespace => builtins::FieldSep::Whitespace,
            builtins::FieldSep::Char(c) => builtins::FieldSep::Char(*c),
            builtins::FieldSep::Ere(re) => builtins::FieldSep::Ere(re.clone()),
        })
    }

    // -------------------------------------------------------------------------
    // MAIN INPUT CHAIN
    // -------------------------------------------------------------------------

    /// Pulls the next record from the filename-list/stdin chain,
    /// updating NR, FNR and FILENAME, and applying deferred `name=val`
    /// assignments when their position is reached.
    fn next_main_record(&mut self) -> AwkResult<Option<String>> {
        loop {
            if self.chain.current.is_some() {
                let rs = self.global_str(special::RS)?;
                let partitioner = self.chain.current.as_mut().expect("checked above");
                partitioner.set_record_separator(&rs)?;
                match partitioner.next_record()? {
                    Some(record) => {
                        self.bump_record_counters();
                        return Ok(Some(record));
                    }
                    None => self.chain.current = None,
                }
            }

            match self.open_next_input()? {
                true => continue,
                false => return Ok(None),
            }
        }
    }

    /// Walks ARGV for the next input source. Returns false when the
    /// chain is exhausted.
    fn open_next_input(&mut self) -> AwkResult<bool> {
        loop {
            let argc = self.globals[special::ARGC as usize].to_number()? as usize;
            if self.chain.argv_index >= argc {
                break;
            }
            let index = self.chain.argv_index;
            self.chain.argv_index += 1;

            let argv = self.global_array(special::ARGV)?;
            let key: Rc<str> = Rc::from(index.to_string().as_str());
            let arg_value = argv.borrow_mut().get_or_insert(key);
            let convfmt = self.global_str(special::CONVFMT)?;
            let arg = arg_value.to_str(&convfmt)?;

            if arg.is_empty() {
                continue;
            }

            // `name=val` arguments assign just before the next file
            // would be opened.
            if let Some((name, val)) = parse_assignment(&arg) {
                let offset = self
                    .program
                    .global_offsets
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, off)| *off);
                if let Some(offset) = offset {
                    let value = Value::from_input(&unescape_assignment(val));
                    self.store_global(offset, value)?;
                }
                continue;
            }

            let reader: Box<dyn Read> = if arg.as_ref() == "-" {
                match self.input_override.take() {
                    Some(input) => input,
                    None => Box::new(std::io::stdin()),
                }
            } else {
                Box::new(std::fs::File::open(arg.as_ref()).map_err(|e| {
                    AwkError::io(format!("cannot open '{}': {}", arg, e))
                })?)
            };

            let rs = self.global_str(special::RS)?;
            self.chain.current = Some(Partitioner::new(reader, &rs, true, self.greedy_rs)?);
            self.chain.opened_file = true;
            self.globals[special::FILENAME as usize] = Value::str(arg.as_ref());
            self.globals[special::FNR as usize] = Value::Int(0);
            return Ok(true);
        }

        // No (more) filename arguments: read standard input once.
        if !self.chain.opened_file && !self.chain.stdin_done {
            self.chain.stdin_done = true;
            let reader: Box<dyn Read> = match self.input_override.take() {
                Some(input) => input,
                None => Box::new(std::io::stdin()),
            };
            let rs = self.global_str(special::RS)?;
            self.chain.current = Some(Partitioner::new(reader, &rs, false, self.greedy_rs)?);
            self.globals[special::FNR as usize] = Value::Int(0);
            return Ok(true);
        }

        Ok(false)
    }

    fn bump_record_counters(&mut self) {
        let nr = self.globals[special::NR as usize]
            .to_number()
            .unwrap_or(0.0) as i64;
        let fnr = self.globals[special::FNR as usize]
            .to_number()
            .unwrap_or(0.0) as i64;
        self.globals[special::NR as usize] = Value::Int(nr + 1);
        self.globals[special::FNR as usize] = Value::Int(fnr + 1);
    }

    // -------------------------------------------------------------------------
    // PRINT / GETLINE
    // -------------------------------------------------------------------------

    fn exec_print(&mut self, argc: u16, redirect: Redirect, is_printf: bool) -> AwkResult<()> {
        let target = match redirect {
            Redirect::None => None,
            _ => {
                let convfmt = self.global_str(special::CONVFMT)?;
                Some(self.pop()?.to_str(&convfmt)?)
            }
        };
        let values = self.pop_values(argc as usize)?;

        let text = if is_printf {
            let convfmt = self.global_str(special::CONVFMT)?;
            let fmt = values
                .first()
                .ok_or_else(|| AwkError::runtime("printf without a format string"))?
                .to_str(&convfmt)?;
            format::sprintf(&fmt, &values[1..], &convfmt, self.catch_format_errors)?
        } else {
            let ofmt = self.global_str(special::OFMT)?;
            let ofs = self.global_str(special::OFS)?;
            let ors = self.global_str(special::ORS)?;
            let mut text = String::new();
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    text.push_str(&ofs);
                }
                text.push_str(&v.to_str(&ofmt)?);
            }
            text.push_str(&ors);
            text
        };

        match (redirect, target) {
            (Redirect::None, _) => {
                self.out
                    .write_all(text.as_bytes())
                    .map_err(|e| AwkError::io(format!("write failed: {}", e)))?;
            }
            (Redirect::Truncate, Some(name)) => {
                self.write_streams.write_file(&name, &text, false)?;
            }
            (Redirect::Append, Some(name)) => {
                self.write_streams.write_file(&name, &text, true)?;
            }
            (Redirect::Pipe | Redirect::TwoWayPipe, Some(command)) => {
                let _ = self.out.flush();
                self.write_streams.write_pipe(&command, &text)?;
            }
            _ => unreachable!("redirect target popped above"),
        }
        Ok(())
    }

    fn exec_getline(&mut self, source: GetlineSource, target: StoreTarget) -> AwkResult<()> {
        let convfmt = self.global_str(special::CONVFMT)?;

        // The target key or index was pushed after the source operand.
        let pending_key = match target {
            StoreTarget::Field
            | StoreTarget::GlobalArrayElem(_)
            | StoreTarget::LocalArrayElem(_) => Some(self.pop()?),
            _ => None,
        };

        let rs = self.global_str(special::RS)?;
        let read = match source {
            GetlineSource::CurrentInput => self.next_main_record(),
            GetlineSource::File => {
                let name = self.pop()?.to_str(&convfmt)?;
                self.read_streams
                    .file_record(&name, &rs, self.greedy_rs)
            }
            GetlineSource::Command => {
                let command = self.pop()?.to_str(&convfmt)?;
                let _ = self.out.flush();
                self.read_streams
                    .pipe_record(&command, &rs, self.greedy_rs)
            }
        };

        let record = match read {
            Ok(record) => record,
            Err(e) if e.kind == ErrorKind::Io => {
                self.push(Value::Int(-1));
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match record {
            Some(line) => {
                // NR advances for current-input and command reads;
                // FNR only for current input (already done by the chain).
                if source == GetlineSource::Command {
                    let nr = self.globals[special::NR as usize].to_number()? as i64;
                    self.globals[special::NR as usize] = Value::Int(nr + 1);
                }
                match target {
                    StoreTarget::Record => self.set_record(&line)?,
                    StoreTarget::Global(off) => {
                        self.store_global(off, Value::from_input(&line))?;
                    }
                    StoreTarget::Local(off) => {
                        *self.local_mut(off)? = Value::from_input(&line);
                    }
                    StoreTarget::Field => {
                        let index = pending_key
                            .expect("field index popped above")
                            .to_number()?;
                        self.set_field(index, Value::from_input(&line))?;
                    }
                    StoreTarget::GlobalArrayElem(off) => {
                        let key = pending_key.expect("key popped above").to_str(&convfmt)?;
                        let arr = self.global_array(off)?;
                        arr.borrow_mut().set(key, Value::from_input(&line));
                    }
                    StoreTarget::LocalArrayElem(off) => {
                        let key = pending_key.expect("key popped above").to_str(&convfmt)?;
                        let arr = self.local_array(off)?;
                        arr.borrow_mut().set(key, Value::from_input(&line));
                    }
                }
                self.push(Value::Int(1));
            }
            None => self.push(Value::Int(0)),
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // BUILTINS
    // -------------------------------------------------------------------------

    fn exec_builtin(&mut self, builtin: Builtin, argc: u16) -> AwkResult<()> {
        let convfmt = self.global_str(special::CONVFMT)?;
        match builtin {
            Builtin::Length => {
                let result = if argc == 0 {
                    let record = self.record.to_str(&convfmt)?;
                    record.chars().count() as i64
                } else {
                    match self.pop()? {
                        Value::Array(arr) => arr.borrow().len() as i64,
                        other => other.to_str(&convfmt)?.chars().count() as i64,
                    }
                };
                self.push(Value::Int(result));
            }
            Builtin::Substr => {
                let n = if argc == 3 {
                    Some(self.pop()?.to_number()?)
                } else {
                    None
                };
                let m = self.pop()?.to_number()?;
                let s = self.pop()?.to_str(&convfmt)?;
                self.push(Value::from(builtins::substr(&s, m, n)));
            }
            Builtin::Index => {
                let t = self.pop()?.to_str(&convfmt)?;
                let s = self.pop()?.to_str(&convfmt)?;
                self.push(Value::Int(builtins::index_of(&s, &t)));
            }
            Builtin::Split => {
                let sep = if argc == 3 {
                    let text = self.pop()?.to_str(&convfmt)?;
                    builtins::field_sep_from(&text).map_err(|e| {
                        AwkError::runtime(format!("invalid split separator: {}", e))
                    })?
                } else {
                    self.current_field_sep()?
                };
                let arr = match self.pop()? {
                    Value::Array(arr) => arr,
                    _ => return Err(AwkError::runtime("split needs an array")),
                };
                let s = self.pop()?.to_str(&convfmt)?;
                let fields = builtins::split_into(&s, &sep);
                let mut guard = arr.borrow_mut();
                guard.clear();
                for (i, field) in fields.iter().enumerate() {
                    guard.set(
                        Rc::from((i + 1).to_string().as_str()),
                        Value::from_input(field),
                    );
                }
                self.push(Value::Int(fields.len() as i64));
            }
            Builtin::Sprintf => {
                let values = self.pop_values(argc as usize)?;
                let fmt = values
                    .first()
                    .ok_or_else(|| AwkError::runtime("sprintf without a format string"))?
                    .to_str(&convfmt)?;
                let text =
                    format::sprintf(&fmt, &values[1..], &convfmt, self.catch_format_errors)?;
                self.push(Value::from(text));
            }
            Builtin::Match => {
                let pattern = self.pop()?.to_str(&convfmt)?;
                let subject = self.pop()?.to_str(&convfmt)?;
                let re = self.compiled(&pattern)?;
                let (start, len) = builtins::match_locate(&subject, &re);
                self.globals[special::RSTART as usize] = Value::Int(start);
                self.globals[special::RLENGTH as usize] = Value::Int(len);
                self.push(Value::Int(start));
            }
            Builtin::Sin => self.numeric_builtin(f64::sin)?,
            Builtin::Cos => self.numeric_builtin(f64::cos)?,
            Builtin::Exp => self.numeric_builtin(f64::exp)?,
            Builtin::Log => self.numeric_builtin(f64::ln)?,
            Builtin::Sqrt => self.numeric_builtin(f64::sqrt)?,
            Builtin::Atan2 => {
                let x = self.pop()?.to_number()?;
                let y = self.pop()?.to_number()?;
                self.push(Value::Double(y.atan2(x)));
            }
            Builtin::Int => {
                let v = self.pop()?.to_number()?;
                self.push(Value::Int(v.trunc() as i64));
            }
            Builtin::Rand => {
                let r: f64 = self.rng.gen_range(0.0..1.0);
                self.push(Value::Double(r));
            }
            Builtin::Srand => {
                let previous = self.rand_seed;
                let seed = if argc == 1 {
                    self.pop()?.to_number()? as u64
                } else {
                    std::time::SystemTime::now()
                        .duration_since(std::time::SystemTime::UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0)
                };
                self.rand_seed = seed;
                self.rng = SmallRng::seed_from_u64(seed);
                self.push(Value::Int(previous as i64));
            }
            Builtin::ToLower => {
                let s = self.pop()?.to_str(&convfmt)?;
                self.push(Value::from(s.to_lowercase()));
            }
            Builtin::ToUpper => {
                let s = self.pop()?.to_str(&convfmt)?;
                self.push(Value::from(s.to_uppercase()));
            }
            Builtin::System => {
                let command = self.pop()?.to_str(&convfmt)?;
                let _ = self.out.flush();
                let status = std::process::Command::new("sh")
                    .arg("-c")
                    .arg(command.as_ref())
                    .status()
                    .map(|s| s.code().unwrap_or(-1))
                    .unwrap_or(-1);
                self.push(Value::Int(status as i64));
            }
            Builtin::Close => {
                let name = self.pop()?.to_str(&convfmt)?;
                let status = {
                    let out = self.write_streams.close(&name);
                    if out != -1 {
                        out
                    } else {
                        self.read_streams.close(&name)
                    }
                };
                self.push(Value::Int(status));
            }
            Builtin::Sleep => {
                let seconds = self.pop()?.to_number()?;
                if seconds > 0.0 {
                    std::thread::sleep(std::time::Duration::from_secs_f64(seconds));
                }
                self.push(Value::Int(0));
            }
            Builtin::Dump => {
                if argc == 1 {
                    let arr = match self.pop()? {
                        Value::Array(arr) => arr,
                        _ => return Err(AwkError::runtime("_dump needs an array")),
                    };
                    let guard = arr.borrow();
                    for key in guard.keys() {
                        let value = guard.get(&key).cloned().unwrap_or(Value::Uninit);
                        let line = format!("[{}] = {}\n", key, value);
                        self.out.write_all(line.as_bytes())?;
                    }
                } else {
                    for (name, off) in &self.program.global_offsets {
                        if name.starts_with('<') {
                            continue;
                        }
                        let line = format!("{} = {}\n", name, self.globals[*off as usize]);
                        self.out.write_all(line.as_bytes())?;
                    }
                }
                self.push(Value::Uninit);
            }
            Builtin::Exec => {
                let command = self.pop()?.to_str(&convfmt)?;
                let _ = self.out.flush();
                let status = std::process::Command::new("sh")
                    .arg("-c")
                    .arg(command.as_ref())
                    .status()
                    .map(|s| s.code().unwrap_or(-1))
                    .unwrap_or(-1);
                self.push(Value::Int(status as i64));
            }
            Builtin::CastInt => {
                let v = self.pop()?.to_number()?;
                self.push(Value::Int(v as i64));
            }
            Builtin::CastDouble => {
                let v = self.pop()?.to_number()?;
                self.push(Value::Double(v));
            }
            Builtin::CastString => {
                let s = self.pop()?.to_str(&convfmt)?;
                self.push(Value::Str(s));
            }
            Builtin::Sub | Builtin::Gsub => {
                return Err(AwkError::runtime(
                    "sub/gsub reached the generic builtin dispatch",
                ));
            }
        }
        Ok(())
    }

    fn numeric_builtin(&mut self, f: impl Fn(f64) -> f64) -> AwkResult<()> {
        let v = self.pop()?.to_number()?;
        self.push(Value::Double(f(v)));
        Ok(())
    }

    fn exec_substitute(&mut self, global: bool, target: StoreTarget) -> AwkResult<()> {
        let convfmt = self.global_str(special::CONVFMT)?;

        let pending_key = match target {
            StoreTarget::Field
            | StoreTarget::GlobalArrayElem(_)
            | StoreTarget::LocalArrayElem(_) => Some(self.pop()?),
            _ => None,
        };
        let repl = self.pop()?.to_str(&convfmt)?;
        let pattern = self.pop()?.to_str(&convfmt)?;
        let re = self.compiled(&pattern)?;

        let old = match target {
            StoreTarget::Record => self.record.to_str(&convfmt)?,
            StoreTarget::Global(off) => self.globals[off as usize].to_str(&convfmt)?,
            StoreTarget::Local(off) => self.local(off)?.clone().to_str(&convfmt)?,
            StoreTarget::Field => {
                let index = pending_key
                    .as_ref()
                    .expect("field index popped above")
                    .to_number()?;
                self.get_field(index)?.to_str(&convfmt)?
            }
            StoreTarget::GlobalArrayElem(off) => {
                let key = pending_key
                    .as_ref()
                    .expect("key popped above")
                    .to_str(&convfmt)?;
                let arr = self.global_array(off)?;
                let v = arr.borrow_mut().get_or_insert(key);
                v.to_str(&convfmt)?
            }
            StoreTarget::LocalArrayElem(off) => {
                let key = pending_key
                    .as_ref()
                    .expect("key popped above")
                    .to_str(&convfmt)?;
                let arr = self.local_array(off)?;
                let v = arr.borrow_mut().get_or_insert(key);
                v.to_str(&convfmt)?
            }
        };

        let (new, count) = builtins::substitute(&re, &repl, &old, global);
        if count > 0 {
            match target {
                StoreTarget::Record => self.set_record(&new)?,
                StoreTarget::Global(off) => self.store_global(off, Value::from(new))?,
                StoreTarget::Local(off) => *self.local_mut(off)? = Value::from(new),
                StoreTarget::Field => {
                    let index = pending_key
                        .expect("field index popped above")
                        .to_number()?;
                    self.set_field(index, Value::from(new))?;
                }
                StoreTarget::GlobalArrayElem(off) => {
                    let key = pending_key
                        .expect("key popped above")
                        .to_str(&convfmt)?;
                    let arr = self.global_array(off)?;
                    arr.borrow_mut().set(key, Value::from(new));
                }
                StoreTarget::LocalArrayElem(off) => {
                    let key = pending_key
                        .expect("key popped above")
                        .to_str(&convfmt)?;
                    let arr = self.local_array(off)?;
                    arr.borrow_mut().set(key, Value::from(new));
                }
            }
        }
        self.push(Value::Int(count));
        Ok(())
    }

    /// Compiles an ERE, caching by pattern text. A bad dynamic pattern
    /// is a runtime error.
    fn compiled(&mut self, pattern: &str) -> AwkResult<Regex> {
        if let Some(re) = self.regex_cache.get(pattern) {
            return Ok(re.clone());
        }
        let re = Regex::new(pattern)
            .map_err(|e| AwkError::runtime(format!("invalid regex /{}/: {}", pattern, e)))?;
        self.regex_cache.insert(pattern.to_string(), re.clone());
        Ok(re)
    }
}

// -----------------------------------------------------------------------------
// ASSIGNMENT ARGUMENTS
// -----------------------------------------------------------------------------

/// Splits a `name=value` command-line argument, requiring a valid
/// variable name on the left.
fn parse_assignment(s: &str) -> Option<(&str, &str)> {
    let (name, value) = s.split_once('=')?;
    let mut chars = name.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((name, value))
}

/// Processes escape sequences in a deferred assignment value the way
/// string literals do.
fn unescape_assignment(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('a') => out.push('\u{07}'),
            Some('b') => out.push('\u{08}'),
            Some('f') => out.push('\u{0C}'),
            Some('v') => out.push('\u{0B}'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
