// File: src/value.rs
//
// The tagged value union threaded through the scanner-free compiler and the
// VM. Mirrors spec §3/§4.A: five variants, falsiness, and equality rules.

use crate::heap::Heap;

/// An index into the heap arena (see `heap.rs`). `Copy` so `Value` stays a
/// small, stack-friendly tagged union — no reference counting, no `next`
/// pointer. The arena slot this indexes plays the role of the C source's
/// intrusive "global object list": occupying a live slot *is* list
/// membership, and sweeping a slot is the only way to leave it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub u32);

/// A Falcon runtime value.
///
/// `Err` is not a language-level exception type — it's the sentinel a
/// native function returns to signal "I already reported a runtime error,
/// unwind" without Falcon having any `throw`/`catch` construct.
#[derive(Debug, Clone, Copy)]
pub enum Value {
    Bool(bool),
    Null,
    Num(f64),
    Obj(ObjRef),
    Err,
}

impl Value {
    /// Falsiness per spec §4.A: `null`, `false`, `0`, `""`, `[]`, `{}` are
    /// falsey; everything else (including negative numbers and `Err`) is
    /// truthy.
    pub fn is_falsey(&self, heap: &Heap) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(b) => !b,
            Value::Num(n) => *n == 0.0,
            Value::Err => false,
            Value::Obj(r) => heap.is_falsey_obj(*r),
        }
    }

    /// Cross-type equality is always false. Numbers use IEEE double
    /// equality. Objects compare by identity — for strings this coincides
    /// with content equality because strings are interned.
    pub fn values_equal(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Null, Value::Null) => true,
            (Value::Num(x), Value::Num(y)) => x == y,
            (Value::Obj(x), Value::Obj(y)) => x == y,
            (Value::Err, Value::Err) => true,
            _ => false,
        }
    }

    pub fn is_obj(&self) -> bool {
        matches!(self, Value::Obj(_))
    }

    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(r) => Some(*r),
            _ => None,
        }
    }
}
