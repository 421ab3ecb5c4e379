//! # Opcode Module
//!
//! The tuple intermediate representation. A `Tuple` is one opcode with its
//! immediate operands plus a precomputed `next` index; the whole program —
//! BEGIN blocks, the main input loop with every rule, END blocks, and the
//! function bodies — lives in one flat, indexable queue.
//!
//! Jump targets are symbolic `Address`es allocated in an arena inside the
//! `TupleList`. Lowering creates them before their target is known;
//! `post_process` verifies every referenced address got an index and fills
//! in the `next` pointers.
//!
//! The `TupleList` is also the serialisable IR: `-c` writes it as a
//! versioned JSON document and `-f file.ai` loads one back, rejecting
//! files from a different build.

use crate::error::{AwkError, AwkResult};
use crate::token::Builtin;

use serde::{Deserialize, Serialize};
use std::io::Write;

/// Index into the address arena of a `TupleList`.
pub type AddressId = usize;

/// Magic string identifying serialised tuple IR files.
pub const IR_MAGIC: &str = "hawk-ir";

/// Fixed global slots of the predefined variables. The parser assigns
/// user globals offsets starting at `COUNT`.
pub mod special {
    pub const FS: u32 = 0;
    pub const OFS: u32 = 1;
    pub const ORS: u32 = 2;
    pub const RS: u32 = 3;
    pub const NR: u32 = 4;
    pub const NF: u32 = 5;
    pub const FNR: u32 = 6;
    pub const FILENAME: u32 = 7;
    pub const SUBSEP: u32 = 8;
    pub const ENVIRON: u32 = 9;
    pub const ARGV: u32 = 10;
    pub const ARGC: u32 = 11;
    pub const CONVFMT: u32 = 12;
    pub const OFMT: u32 = 13;
    pub const RSTART: u32 = 14;
    pub const RLENGTH: u32 = 15;
    pub const COUNT: u32 = 16;

    pub const NAMES: [&str; COUNT as usize] = [
        "FS", "OFS", "ORS", "RS", "NR", "NF", "FNR", "FILENAME", "SUBSEP", "ENVIRON", "ARGV",
        "ARGC", "CONVFMT", "OFMT", "RSTART", "RLENGTH",
    ];
}

// -----------------------------------------------------------------------------
// SUPPORT TYPES CARRIED BY OPCODES
// -----------------------------------------------------------------------------

/// Output redirection mode for `print`/`printf`. `TwoWayPipe` covers the
/// `|&` form and currently behaves exactly like `Pipe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Redirect {
    None,
    Truncate,
    Append,
    Pipe,
    TwoWayPipe,
}

/// Where a `getline` pulls its record from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GetlineSource {
    /// The main input chain (stdin / filename arguments).
    CurrentInput,
    /// `getline < expr` — a named file (name popped from the stack).
    File,
    /// `expr | getline` — a command pipe (command popped from the stack).
    Command,
}

/// A store destination resolved at lowering time, used by `getline`
/// targets and by `sub`/`gsub` in-place replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreTarget {
    /// `$0`, with a field re-split.
    Record,
    /// A global slot.
    Global(u32),
    /// A function-local slot.
    Local(u32),
    /// A field; its index is popped from the stack.
    Field,
    /// A global array element; its key is popped from the stack.
    GlobalArrayElem(u32),
    /// A local array element; its key is popped from the stack.
    LocalArrayElem(u32),
}

// -----------------------------------------------------------------------------
// OPCODES
// -----------------------------------------------------------------------------

/// A single AVM opcode with its immediate operands.
///
/// Stack conventions: store opcodes pop their operands and push the
/// assigned value back (assignment is an expression); statement contexts
/// follow with `Pop`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Opcode {
    // -- Stack ops --
    PushInt(i64),
    PushDouble(f64),
    PushStr(String),
    PushUninit,
    Dup,
    Swap,
    Pop,

    // -- Variables --
    LoadGlobal(u32),
    StoreGlobal(u32),
    LoadLocal(u32),
    StoreLocal(u32),

    // -- Arrays --
    /// key → value ; missing keys spring into existence.
    ArrayLoadGlobal(u32),
    ArrayLoadLocal(u32),
    /// key value → value
    ArrayStoreGlobal(u32),
    ArrayStoreLocal(u32),
    /// Push the array itself (materialising it when uninitialised), for
    /// call-by-reference arguments and builtin out-params.
    ArrayRefGlobal(u32),
    ArrayRefLocal(u32),
    /// key → ; removes one element.
    DeleteElemGlobal(u32),
    DeleteElemLocal(u32),
    /// Clears the whole array.
    DeleteArrayGlobal(u32),
    DeleteArrayLocal(u32),
    /// key → 0/1 membership test.
    InGlobal(u32),
    InLocal(u32),
    /// k1 .. kn → joined key using SUBSEP.
    JoinSubsep(u16),

    // -- Arithmetic / string --
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Negate,
    /// Unary plus: force the numeric view.
    AsNumber,
    Concat,
    /// string pattern → 0/1 ; `negate` gives `!~`.
    Match { negate: bool },
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    Not,

    // -- Control flow --
    Jump(AddressId),
    JumpIfFalse(AddressId),
    JumpIfTrue(AddressId),
    /// Call a user function from the function table.
    Call { function: u32, argc: u16 },
    /// value → ; pops the frame and pushes the return value.
    Return,
    /// Abandon the record: unwind frames, jump to the main loop head.
    Next,
    /// Like `Next` but first closes the current input source.
    NextFile,
    /// Transfer to the END section (or halt when already inside it).
    Exit { has_code: bool },
    /// Stop the machine. Implicit at the end of the END section.
    Halt,

    // -- Main input loop --
    /// Pull the next record from the input chain into `$0`, maintaining
    /// NR/FNR/NF/FILENAME; jumps to `eof` when input is exhausted.
    ConsumeInput { eof: AddressId },

    // -- Iteration (`for (k in a)`) --
    /// array-ref → enumerator ; materialises the key list.
    KeyList,
    /// Pops the next key from the enumerator; pops the enumerator and
    /// jumps to `end` when exhausted.
    IterNext { end: AddressId },

    // -- Fields --
    /// index → value
    LoadField,
    /// index value → value ; pads NF / rebuilds `$0` as required.
    StoreField,

    // -- I/O --
    /// argc values (first..last pushed in order), then the redirect
    /// target on top when redirected.
    Print { argc: u16, redirect: Redirect },
    Printf { argc: u16, redirect: Redirect },
    Getline { source: GetlineSource, target: StoreTarget },

    // -- Builtins (one opcode each) --
    CallBuiltin { builtin: Builtin, argc: u16 },
    /// `sub`/`gsub`: pops the target key/index (per `target`), the
    /// replacement, and the pattern; rewrites the target in place and
    /// pushes the substitution count.
    Substitute { global: bool, target: StoreTarget },

    // -- Extensions --
    /// Dispatch a registered extension keyword.
    InvokeExtension { keyword: String, argc: u16 },
}

// Builtin travels inside the IR, so it serialises by name.
impl Serialize for Builtin {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Builtin {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        crate::token::lookup_builtin(&name)
            .or_else(|| crate::token::lookup_extra_builtin(&name))
            .or_else(|| crate::token::lookup_cast_builtin(&name))
            .ok_or_else(|| serde::de::Error::custom(format!("unknown builtin '{}'", name)))
    }
}

// -----------------------------------------------------------------------------
// TUPLES AND ADDRESSES
// -----------------------------------------------------------------------------

/// One executable tuple: an opcode plus the index of the tuple that
/// follows it in straight-line execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
    pub op: Opcode,
    /// Filled in by `post_process`.
    pub next: usize,
}

/// A symbolic jump target: a label for dumps plus the tuple index it
/// resolves to. The index may be assigned any time after creation but
/// must be valid before the VM starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressEntry {
    pub label: String,
    pub index: Option<usize>,
}

/// One user-defined function: formals, per-formal array flags resolved by
/// the semantic passes, and the entry address of its lowered body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
    pub num_params: u16,
    pub array_params: Vec<bool>,
    pub entry: AddressId,
}

// -----------------------------------------------------------------------------
// TUPLE LIST — the program
// -----------------------------------------------------------------------------

/// The complete lowered program plus everything the AVM needs to run it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TupleList {
    /// IR file magic; always `hawk-ir`.
    pub magic: String,
    /// Producing crate version; loading a different version is refused.
    pub version: String,
    pub tuples: Vec<Tuple>,
    pub addresses: Vec<AddressEntry>,
    pub functions: Vec<FunctionInfo>,
    /// name → global slot, for -v assignments and ARGV `name=val` entries.
    pub global_offsets: Vec<(String, u32)>,
    pub num_globals: u32,
    /// Tuple index of the main-loop head (`Next` jumps here); absent when
    /// the program has no input loop.
    pub main_loop: Option<AddressId>,
    /// Address of the first END tuple (`Exit` transfers here).
    pub end_section: AddressId,
}

impl TupleList {
    pub fn new() -> Self {
        Self {
            magic: IR_MAGIC.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ..Self::default()
        }
    }

    /// Appends a tuple, returning its index.
    pub fn emit(&mut self, op: Opcode) -> usize {
        let idx = self.tuples.len();
        self.tuples.push(Tuple { op, next: idx + 1 });
        idx
    }

    /// Allocates a fresh unresolved address.
    pub fn new_address(&mut self, label: impl Into<String>) -> AddressId {
        self.addresses.push(AddressEntry {
            label: label.into(),
            index: None,
        });
        self.addresses.len() - 1
    }

    /// Points an address at the next tuple slot to be emitted.
    pub fn resolve_here(&mut self, addr: AddressId) {
        let index = self.tuples.len();
        self.addresses[addr].index = Some(index);
    }

    /// The resolved index of an address.
    ///
    /// Only valid after `post_process`; lowering guarantees assignment.
    #[inline]
    pub fn address_index(&self, addr: AddressId) -> usize {
        self.addresses[addr]
            .index
            .expect("address resolved during post-processing")
    }

    /// Walks every tuple, touching each address operand so that no jump
    /// target is left unresolved, and assigns the `next` pointer of each
    /// tuple. Invariant afterwards: every referenced address is in range.
    pub fn post_process(&mut self) -> AwkResult<()> {
        let count = self.tuples.len();
        for i in 0..count {
            self.tuples[i].next = i + 1;
            let addrs = self.tuples[i].op.address_operands();
            for addr in addrs {
                let entry = &self.addresses[addr];
                match entry.index {
                    Some(idx) if idx <= count => {}
                    Some(idx) => {
                        return Err(AwkError::runtime(format!(
                            "address '{}' points past the program ({} > {})",
                            entry.label, idx, count
                        )));
                    }
                    None => {
                        return Err(AwkError::runtime(format!(
                            "unresolved address '{}' after lowering",
                            entry.label
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// True when every address referenced from a tuple carries an index.
    pub fn fully_resolved(&self) -> bool {
        self.tuples.iter().all(|t| {
            t.op.address_operands()
                .iter()
                .all(|&a| self.addresses[a].index.is_some())
        })
    }

    // -------------------------------------------------------------------------
    // DUMP (-s)
    // -------------------------------------------------------------------------

    /// Writes the tuple stream as human-readable text, one tuple per line
    /// with resolved jump targets and address labels.
    pub fn dump(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "# tuples: {} (version {})", self.tuples.len(), self.version)?;
        for func in &self.functions {
            writeln!(
                out,
                "# function {}({} params) entry @{}",
                func.name,
                func.num_params,
                self.addresses[func.entry]
                    .index
                    .map(|i| i.to_string())
                    .unwrap_or_else(|| "?".to_string())
            )?;
        }
        for (i, tuple) in self.tuples.iter().enumerate() {
            let target = tuple
                .op
                .address_operands()
                .first()
                .map(|&a| {
                    let entry = &self.addresses[a];
                    format!(
                        "  -> {} ({})",
                        entry
                            .index
                            .map(|x| x.to_string())
                            .unwrap_or_else(|| "?".to_string()),
                        entry.label
                    )
                })
                .unwrap_or_default();
            writeln!(out, "{:>5}: {:?}{}", i, tuple.op, target)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // IR SERIALISATION (-c / -f file.ai)
    // -------------------------------------------------------------------------

    /// Serialises the program to the versioned IR format.
    pub fn to_ir_bytes(&self) -> AwkResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| AwkError::io(format!("cannot serialise tuple IR: {}", e)))
    }

    /// Loads a program from IR bytes, refusing foreign or stale files.
    pub fn from_ir_bytes(bytes: &[u8]) -> AwkResult<Self> {
        let list: TupleList = serde_json::from_slice(bytes)
            .map_err(|e| AwkError::io(format!("malformed tuple IR file: {}", e)))?;
        if list.magic != IR_MAGIC {
            return Err(AwkError::io("not a tuple IR file (bad magic)"));
        }
        if list.version != env!("CARGO_PKG_VERSION") {
            return Err(AwkError::io(format!(
                "tuple IR version mismatch: file {}, interpreter {}",
                list.version,
                env!("CARGO_PKG_VERSION")
            )));
        }
        Ok(list)
    }
}

impl Opcode {
    /// The address operands of this opcode, for resolution and dumps.
    pub fn address_operands(&self) -> Vec<AddressId> {
        match self {
            Opcode::Jump(a) | Opcode::JumpIfFalse(a) | Opcode::JumpIfTrue(a) => vec![*a],
            Opcode::ConsumeInput { eof } => vec![*eof],
            Opcode::IterNext { end } => vec![*end],
            _ => Vec::new(),
        }
    }
}
