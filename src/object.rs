// File: src/object.rs
//
// The heap object model: a discriminated union over the ten kinds spec §3
// names. Each `ObjKind` variant owns exactly the fields spec §3 lists; the
// `marked`/bookkeeping bits live one layer up, on the arena slot itself
// (see `heap.rs`), not here — a kind should not need to know it is
// garbage-collected to be correct.

use crate::chunk::Chunk;
use crate::falcon_map::FalconMap;
use crate::value::{ObjRef, Value};

/// An interned, immutable string. Hash is FNV-1a, computed once at creation.
#[derive(Debug, Clone)]
pub struct LoxString {
    pub bytes: String,
    pub hash: u64,
}

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

impl LoxString {
    pub fn new(bytes: String) -> Self {
        let hash = fnv1a_hash(bytes.as_bytes());
        LoxString { bytes, hash }
    }
}

/// A compiled function: its arity, captured-upvalue count, and bytecode.
/// `name` is `None` for the implicit top-level script function.
#[derive(Debug, Clone)]
pub struct FunctionObj {
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    pub name: Option<ObjRef>,
}

impl FunctionObj {
    pub fn new_script() -> Self {
        FunctionObj { arity: 0, upvalue_count: 0, chunk: Chunk::new(), name: None }
    }
}

/// Where an upvalue currently reads/writes its value.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueLocation {
    /// Open: the slot index into the VM's value stack.
    Stack(usize),
    /// Closed: the owning frame has returned; the value now lives here.
    Closed(Value),
}

#[derive(Debug, Clone)]
pub struct UpvalueObj {
    pub location: UpvalueLocation,
}

#[derive(Debug, Clone)]
pub struct ClosureObj {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

#[derive(Debug, Clone)]
pub struct ClassObj {
    pub name: ObjRef,
    pub methods: FalconMap,
}

#[derive(Debug, Clone)]
pub struct InstanceObj {
    pub class: ObjRef,
    pub fields: FalconMap,
}

#[derive(Debug, Clone, Copy)]
pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: ObjRef,
}

#[derive(Debug, Clone, Default)]
pub struct ListObj {
    pub elements: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct MapObj {
    pub map: FalconMap,
}

/// A native (Rust-implemented) callable, registered into globals by the
/// host. Returning `Value::Err` must be preceded by a call to
/// `Vm::runtime_error` — the VM does not synthesize a message on its own.
pub type NativeFn = fn(&mut crate::vm::Vm, &[Value]) -> Value;

#[derive(Clone, Copy)]
pub struct NativeObj {
    pub name: ObjRef,
    pub arity: Option<u8>,
    pub function: NativeFn,
}

impl std::fmt::Debug for NativeObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeObj(arity={:?})", self.arity)
    }
}

/// The heap object payload. The discriminant this enum carries is exactly
/// spec §3's ten `Obj` variants.
#[derive(Debug, Clone)]
pub enum ObjKind {
    LoxString(LoxString),
    Function(FunctionObj),
    Upvalue(UpvalueObj),
    Closure(ClosureObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    List(ListObj),
    Map(MapObj),
    Native(NativeObj),
}

impl ObjKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjKind::LoxString(_) => "string",
            ObjKind::Function(_) => "function",
            ObjKind::Upvalue(_) => "upvalue",
            ObjKind::Closure(_) => "function",
            ObjKind::Class(_) => "class",
            ObjKind::Instance(_) => "instance",
            ObjKind::BoundMethod(_) => "function",
            ObjKind::List(_) => "list",
            ObjKind::Map(_) => "map",
            ObjKind::Native(_) => "function",
        }
    }
}
