// File: src/chunk.rs
//
// Bytecode instruction set and chunk representation for the Falcon VM.
// A chunk is a flat byte stream plus a constant pool and a run-length
// encoded line table; this mirrors clox's `Chunk` rather than an AST.

use crate::value::Value;

/// Bytecode instruction opcodes for the Falcon VM.
///
/// `repr(u8)` so opcodes are written directly into the instruction stream;
/// `OpCode::from(byte)` decodes them back during dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum OpCode {
    OP_CONSTANT = 0,
    OP_CONSTANT_16,
    OP_NULL,
    OP_TRUE,
    OP_FALSE,
    OP_POP,
    OP_POP_EXPR,
    OP_DUP,
    OP_DUP2,

    OP_GET_LOCAL,
    OP_SET_LOCAL,
    OP_GET_GLOBAL,
    OP_SET_GLOBAL,
    OP_DEFINE_GLOBAL,
    OP_GET_UPVALUE,
    OP_SET_UPVALUE,
    OP_CLOSE_UPVALUE,
    OP_GET_PROPERTY,
    OP_SET_PROPERTY,
    OP_GET_SUPER,
    OP_INDEX_GET,
    OP_INDEX_SET,

    OP_EQUAL,
    OP_NOT_EQUAL,
    OP_GREATER,
    OP_GREATER_EQUAL,
    OP_LESS,
    OP_LESS_EQUAL,

    OP_ADD,
    OP_SUBTRACT,
    OP_MULTIPLY,
    OP_DIVIDE,
    OP_MODULO,
    OP_POW,
    OP_NEGATE,
    OP_NOT,

    OP_JUMP,
    OP_JUMP_IF_FALSE,
    OP_LOOP,

    OP_CALL,
    OP_INVOKE,
    OP_SUPER_INVOKE,
    OP_CLOSURE,
    OP_RETURN,

    OP_CLASS,
    OP_INHERIT,
    OP_METHOD,

    OP_LIST,
    OP_MAP,

    OP_UNKNOWN,
}

impl From<u8> for OpCode {
    fn from(byte: u8) -> Self {
        // SAFETY-free decode: any byte produced by `emit` round-trips through
        // this match. A mismatched byte (implementation bug) maps to
        // OP_UNKNOWN so the VM can report it rather than read out of bounds.
        use OpCode::*;
        const TABLE: &[OpCode] = &[
            OP_CONSTANT,
            OP_CONSTANT_16,
            OP_NULL,
            OP_TRUE,
            OP_FALSE,
            OP_POP,
            OP_POP_EXPR,
            OP_DUP,
            OP_DUP2,
            OP_GET_LOCAL,
            OP_SET_LOCAL,
            OP_GET_GLOBAL,
            OP_SET_GLOBAL,
            OP_DEFINE_GLOBAL,
            OP_GET_UPVALUE,
            OP_SET_UPVALUE,
            OP_CLOSE_UPVALUE,
            OP_GET_PROPERTY,
            OP_SET_PROPERTY,
            OP_GET_SUPER,
            OP_INDEX_GET,
            OP_INDEX_SET,
            OP_EQUAL,
            OP_NOT_EQUAL,
            OP_GREATER,
            OP_GREATER_EQUAL,
            OP_LESS,
            OP_LESS_EQUAL,
            OP_ADD,
            OP_SUBTRACT,
            OP_MULTIPLY,
            OP_DIVIDE,
            OP_MODULO,
            OP_POW,
            OP_NEGATE,
            OP_NOT,
            OP_JUMP,
            OP_JUMP_IF_FALSE,
            OP_LOOP,
            OP_CALL,
            OP_INVOKE,
            OP_SUPER_INVOKE,
            OP_CLOSURE,
            OP_RETURN,
            OP_CLASS,
            OP_INHERIT,
            OP_METHOD,
            OP_LIST,
            OP_MAP,
        ];
        TABLE.get(byte as usize).copied().unwrap_or(OP_UNKNOWN)
    }
}

/// One run of the line table: `first_offset` is the first instruction
/// offset on `line`. Appended only when the line changes, so `lines` stays
/// small even for long single-line expressions.
#[derive(Debug, Clone, Copy)]
pub struct LineRun {
    pub first_offset: usize,
    pub line: usize,
}

/// A compiled bytecode chunk: instruction stream, constant pool, and the
/// source-line mapping used for error reporting.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    lines: Vec<LineRun>,
}

impl Chunk {
    pub fn new() -> Self {
        Self { code: Vec::with_capacity(8), constants: Vec::new(), lines: Vec::new() }
    }

    /// Appends one byte, recording `line` if it differs from the last run.
    pub fn write(&mut self, byte: u8, line: usize) -> usize {
        let offset = self.code.len();
        self.code.push(byte);
        match self.lines.last() {
            Some(run) if run.line == line => {}
            _ => self.lines.push(LineRun { first_offset: offset, line }),
        }
        offset
    }

    pub fn write_op(&mut self, op: OpCode, line: usize) -> usize {
        self.write(op as u8, line)
    }

    /// Binary search over the run table. Valid because offsets are appended
    /// monotonically during single-pass compilation.
    pub fn get_line(&self, offset: usize) -> usize {
        if self.lines.is_empty() {
            return 0;
        }
        let mut lo = 0usize;
        let mut hi = self.lines.len();
        while lo + 1 < hi {
            let mid = lo + (hi - lo) / 2;
            if self.lines[mid].first_offset <= offset {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        self.lines[lo].line
    }

    /// Adds `value` to the constant pool, returning its index.
    /// Callers are responsible for enforcing the 65,535-entry limit at
    /// compile time (see `Compiler::emit_constant`).
    pub fn add_constant(&mut self, value: Value) -> usize {
        let index = self.constants.len();
        self.constants.push(value);
        index
    }
}
