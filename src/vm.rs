// File: src/vm.rs
//
// The stack-based bytecode VM. A tight fetch-decode-execute loop over one
// `Chunk` at a time, switching chunks on call/return via a stack of
// `CallFrame`s. Mirrors clox's `vm.c` dispatch shape; natives, GC triggers,
// and error reporting are the ambient stack layered on top (SPEC_FULL.md
// §4.E/§6/§7).

use crate::chunk::OpCode;
use crate::errors::FalconError;
use crate::falcon_map::FalconMap;
use crate::heap::Heap;
use crate::object::{FunctionObj, NativeFn, UpvalueLocation};
use crate::value::{ObjRef, Value};

const MAX_FRAMES: usize = 1000;
const MAX_STACK: usize = 256 * 1000;

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    slots_base: usize,
}

/// One interpreter instance: its own heap, stack, globals, and call
/// frames. Nothing is shared across `Vm`s (spec §5) — string identity in
/// particular is only meaningful within a single `Vm`'s intern table.
pub struct Vm {
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    /// Open upvalues, kept sorted by descending stack slot so `close_upvalues`
    /// can stop at the first one below the closing point.
    open_upvalues: Vec<ObjRef>,
    globals: FalconMap,
    pub heap: Heap,
    pub file_name: String,
    pub is_repl: bool,
    /// Set by `native_error` just before a native returns `Value::Err`, so
    /// `call_native` can propagate the native's actual message instead of a
    /// generic one.
    pending_error: Option<FalconError>,
}

impl Vm {
    pub fn new(file_name: &str, is_repl: bool) -> Self {
        Vm {
            frames: Vec::with_capacity(64),
            stack: Vec::with_capacity(256),
            open_upvalues: Vec::new(),
            globals: FalconMap::new(),
            heap: Heap::new(),
            file_name: file_name.to_string(),
            is_repl,
            pending_error: None,
        }
    }

    pub fn define_native(&mut self, name: &str, arity: Option<u8>, function: NativeFn) {
        self.maybe_collect();
        let name_ref = self.heap.intern_copy(name);
        let native_ref = self.heap.new_native(name_ref, arity, function);
        let hash = self.heap.string_hash(name_ref);
        self.globals.set(name_ref, hash, Value::Obj(native_ref));
    }

    /// Runs a freshly compiled top-level script function to completion.
    pub fn interpret(&mut self, function: FunctionObj) -> Result<Option<Value>, FalconError> {
        self.maybe_collect();
        let func_ref = self.heap.new_function(function);
        self.push(Value::Obj(func_ref));
        let closure_ref = self.heap.new_closure(func_ref, Vec::new());
        self.pop();
        self.push(Value::Obj(closure_ref));
        self.call(closure_ref, 0)?;
        self.run()
    }

    // --- stack plumbing -------------------------------------------------

    fn push(&mut self, value: Value) {
        debug_assert!(self.stack.len() < MAX_STACK, "VM value stack exceeded {} slots", MAX_STACK);
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("pop from empty VM stack (compiler bug)")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn build_error(&self, message: impl Into<String>) -> FalconError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function_ref = self.heap.as_closure(frame.closure).function;
            let function = self.heap.as_function(function_ref);
            let line = function.chunk.get_line(frame.ip.saturating_sub(1));
            let name = match function.name {
                Some(n) => self.heap.as_string(n).bytes.clone(),
                None => "<script>".to_string(),
            };
            trace.push(format!("[line {}] in {}()", line, name));
        }
        FalconError::runtime(message).with_stack_trace(trace)
    }

    fn runtime_error<T>(&mut self, message: impl Into<String>) -> Result<T, FalconError> {
        let err = self.build_error(message);
        self.stack.clear();
        self.frames.clear();
        Err(err)
    }

    /// Called by natives to report a failure. The native must then return
    /// the `Value::Err` this produces — the VM unwinds as soon as a call
    /// site sees it.
    pub fn native_error(&mut self, message: impl Into<String>) -> Value {
        self.pending_error = Some(self.build_error(message));
        Value::Err
    }

    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let stack = &self.stack;
        let frames = &self.frames;
        let open_upvalues = &self.open_upvalues;
        let globals = &self.globals;
        self.heap.collect_with(|heap| {
            for &v in stack {
                heap.mark_value(v);
            }
            for frame in frames {
                heap.mark_object(frame.closure);
            }
            for &r in open_upvalues {
                heap.mark_object(r);
            }
            for (k, v) in globals.iter() {
                heap.mark_object(k);
                heap.mark_value(v);
            }
            let init = heap.init_string;
            heap.mark_object(init);
        });
    }

    // --- frame/bytecode reads --------------------------------------------

    fn frame_function(&self) -> ObjRef {
        let closure = self.frames.last().expect("no active frame").closure;
        self.heap.as_closure(closure).function
    }

    fn read_u8(&mut self) -> u8 {
        let function_ref = self.frame_function();
        let frame = self.frames.last_mut().expect("no active frame");
        let byte = self.heap.as_function(function_ref).chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16_be(&mut self) -> u16 {
        let hi = self.read_u8();
        let lo = self.read_u8();
        u16::from_be_bytes([hi, lo])
    }

    fn read_u16_le(&mut self) -> u16 {
        let lo = self.read_u8();
        let hi = self.read_u8();
        u16::from_le_bytes([lo, hi])
    }

    fn read_constant_8(&mut self) -> Value {
        let index = self.read_u8() as usize;
        let function_ref = self.frame_function();
        self.heap.as_function(function_ref).chunk.constants[index]
    }

    fn read_constant_16(&mut self) -> Value {
        let index = self.read_u16_le() as usize;
        let function_ref = self.frame_function();
        self.heap.as_function(function_ref).chunk.constants[index]
    }

    /// Reads a 2-byte name-constant operand (globals/properties/methods) —
    /// an index into the constant pool.
    fn read_name(&mut self) -> ObjRef {
        let index = self.read_u16_le() as usize;
        let function_ref = self.frame_function();
        match self.heap.as_function(function_ref).chunk.constants[index] {
            Value::Obj(r) => r,
            _ => panic!("name constant is not a string (compiler bug)"),
        }
    }

    /// Reads a 2-byte raw index operand (local slot / upvalue index).
    /// `emit_global_op` widens these to 2 bytes uniformly alongside the
    /// true name-constant operands, so the decode side has to match.
    fn read_index(&mut self) -> usize {
        self.read_u16_le() as usize
    }

    fn current_line(&self) -> usize {
        let function_ref = self.frame_function();
        let frame = self.frames.last().unwrap();
        self.heap.as_function(function_ref).chunk.get_line(frame.ip.saturating_sub(1))
    }

    // --- calling ------------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), FalconError> {
        use crate::object::ObjKind;
        let Value::Obj(obj) = callee else {
            return self.runtime_error("Can only call functions and classes.");
        };
        match self.heap.kind(obj).clone() {
            ObjKind::Closure(_) => self.call(obj, argc),
            ObjKind::Native(native) => self.call_native(native, obj, argc),
            ObjKind::BoundMethod(bound) => {
                let slot = self.stack.len() - 1 - argc as usize;
                self.stack[slot] = bound.receiver;
                self.call(bound.method, argc)
            }
            ObjKind::Class(_) => self.call_class(obj, argc),
            _ => self.runtime_error("Can only call functions and classes."),
        }
    }

    fn call_native(
        &mut self,
        native: crate::object::NativeObj,
        _obj: ObjRef,
        argc: u8,
    ) -> Result<(), FalconError> {
        if let Some(expected) = native.arity {
            if expected != argc {
                return self.runtime_error(format!(
                    "Expected {} arguments but got {}.",
                    expected, argc
                ));
            }
        }
        let base = self.stack.len() - argc as usize;
        let args: Vec<Value> = self.stack[base..].to_vec();
        let result = (native.function)(self, &args);
        self.stack.truncate(base - 1); // drop args + the native callee itself
        if matches!(result, Value::Err) {
            let err = self
                .pending_error
                .take()
                .unwrap_or_else(|| self.build_error("native function reported an error"));
            self.stack.clear();
            self.frames.clear();
            return Err(err);
        }
        self.push(result);
        Ok(())
    }

    fn call_class(&mut self, class_ref: ObjRef, argc: u8) -> Result<(), FalconError> {
        self.maybe_collect();
        let instance_ref = self.heap.new_instance(class_ref);
        let slot = self.stack.len() - 1 - argc as usize;
        self.stack[slot] = Value::Obj(instance_ref);

        let init_name = self.heap.init_string;
        let init_hash = self.heap.string_hash(init_name);
        let init = self.heap.as_class(class_ref).methods.get(init_name, init_hash);
        match init {
            Some(Value::Obj(method_ref)) => self.call(method_ref, argc),
            _ => {
                if argc != 0 {
                    return self
                        .runtime_error(format!("Expected 0 arguments but got {}.", argc));
                }
                Ok(())
            }
        }
    }

    fn call(&mut self, closure_ref: ObjRef, argc: u8) -> Result<(), FalconError> {
        let function_ref = self.heap.as_closure(closure_ref).function;
        let arity = self.heap.as_function(function_ref).arity;
        if argc != arity {
            return self
                .runtime_error(format!("Expected {} arguments but got {}.", arity, argc));
        }
        if self.frames.len() >= MAX_FRAMES {
            return self.runtime_error("Stack overflow.");
        }
        let slots_base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, slots_base });
        Ok(())
    }

    fn invoke_from_class(
        &mut self,
        class_ref: ObjRef,
        name: ObjRef,
        argc: u8,
    ) -> Result<(), FalconError> {
        let hash = self.heap.string_hash(name);
        match self.heap.as_class(class_ref).methods.get(name, hash) {
            Some(Value::Obj(method_ref)) => self.call(method_ref, argc),
            _ => self.runtime_error(format!(
                "Undefined property '{}'.",
                self.heap.as_string(name).bytes
            )),
        }
    }

    fn invoke(&mut self, name: ObjRef, argc: u8) -> Result<(), FalconError> {
        let receiver = self.peek(argc as usize);
        let Value::Obj(obj) = receiver else {
            return self.runtime_error("Only instances have methods.");
        };
        if self.heap.type_name(obj) != "instance" {
            return self.runtime_error("Only instances have methods.");
        }
        let hash = self.heap.string_hash(name);
        if let Some(value) = self.heap.as_instance(obj).fields.get(name, hash) {
            let slot = self.stack.len() - 1 - argc as usize;
            self.stack[slot] = value;
            return self.call_value(value, argc);
        }
        let class_ref = self.heap.as_instance(obj).class;
        self.invoke_from_class(class_ref, name, argc)
    }

    /// Expects the receiver already on top of the stack and leaves the bound
    /// method in its place; keeping it there across `maybe_collect()` is
    /// what roots it while the bound-method object is allocated.
    fn bind_method(&mut self, class_ref: ObjRef, name: ObjRef) -> Result<(), FalconError> {
        let receiver = self.peek(0);
        let hash = self.heap.string_hash(name);
        let method = self.heap.as_class(class_ref).methods.get(name, hash);
        match method {
            Some(Value::Obj(method_ref)) => {
                self.maybe_collect();
                let bound_ref = self.heap.new_bound_method(receiver, method_ref);
                self.pop();
                self.push(Value::Obj(bound_ref));
                Ok(())
            }
            _ => self.runtime_error(format!(
                "Undefined property '{}'.",
                self.heap.as_string(name).bytes
            )),
        }
    }

    // --- upvalues -------------------------------------------------------

    fn capture_upvalue(&mut self, stack_slot: usize) -> ObjRef {
        for &r in &self.open_upvalues {
            if let UpvalueLocation::Stack(slot) = self.heap.as_upvalue(r).location {
                if slot == stack_slot {
                    return r;
                }
            }
        }
        self.maybe_collect();
        let r = self.heap.new_upvalue(UpvalueLocation::Stack(stack_slot));
        self.open_upvalues.push(r);
        self.open_upvalues.sort_by(|a, b| {
            let sa = match self.heap.as_upvalue(*a).location {
                UpvalueLocation::Stack(s) => s,
                _ => 0,
            };
            let sb = match self.heap.as_upvalue(*b).location {
                UpvalueLocation::Stack(s) => s,
                _ => 0,
            };
            sb.cmp(&sa)
        });
        r
    }

    fn close_upvalues(&mut self, from_slot: usize) {
        self.open_upvalues.retain(|&r| {
            let slot = match self.heap.as_upvalue(r).location {
                UpvalueLocation::Stack(s) => s,
                UpvalueLocation::Closed(_) => return false,
            };
            if slot < from_slot {
                return true;
            }
            let value = self.stack[slot];
            self.heap.as_upvalue_mut(r).location = UpvalueLocation::Closed(value);
            false
        });
    }

    // --- the dispatch loop ------------------------------------------------

    fn run(&mut self) -> Result<Option<Value>, FalconError> {
        let mut last_repl_value: Option<Value> = None;
        loop {
            let op = OpCode::from(self.read_u8());
            match op {
                OpCode::OP_CONSTANT => {
                    let v = self.read_constant_8();
                    self.push(v);
                }
                OpCode::OP_CONSTANT_16 => {
                    let v = self.read_constant_16();
                    self.push(v);
                }
                OpCode::OP_NULL => self.push(Value::Null),
                OpCode::OP_TRUE => self.push(Value::Bool(true)),
                OpCode::OP_FALSE => self.push(Value::Bool(false)),
                OpCode::OP_POP => {
                    self.pop();
                }
                OpCode::OP_POP_EXPR => {
                    let v = self.pop();
                    if self.is_repl {
                        last_repl_value = Some(v);
                    }
                }
                OpCode::OP_DUP => {
                    let v = self.peek(0);
                    self.push(v);
                }
                OpCode::OP_DUP2 => {
                    let a = self.peek(1);
                    let b = self.peek(0);
                    self.push(a);
                    self.push(b);
                }
                OpCode::OP_GET_LOCAL => {
                    let slot = self.read_index();
                    let base = self.frames.last().unwrap().slots_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::OP_SET_LOCAL => {
                    let slot = self.read_index();
                    let base = self.frames.last().unwrap().slots_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::OP_GET_GLOBAL => {
                    let name = self.read_name();
                    let hash = self.heap.string_hash(name);
                    match self.globals.get(name, hash) {
                        Some(v) => self.push(v),
                        None => {
                            return self.runtime_error(format!(
                                "Undefined variable '{}'.",
                                self.heap.as_string(name).bytes
                            ))
                        }
                    }
                }
                OpCode::OP_DEFINE_GLOBAL => {
                    let name = self.read_name();
                    let hash = self.heap.string_hash(name);
                    if self.globals.contains(name, hash) {
                        return self.runtime_error(format!(
                            "Global variable '{}' is already defined.",
                            self.heap.as_string(name).bytes
                        ));
                    }
                    let v = self.pop();
                    self.globals.set(name, hash, v);
                }
                OpCode::OP_SET_GLOBAL => {
                    let name = self.read_name();
                    let hash = self.heap.string_hash(name);
                    if !self.globals.contains(name, hash) {
                        return self.runtime_error(format!(
                            "Undefined variable '{}'.",
                            self.heap.as_string(name).bytes
                        ));
                    }
                    self.globals.set(name, hash, self.peek(0));
                }
                OpCode::OP_GET_UPVALUE => {
                    let slot = self.read_index();
                    let upvalue_ref = {
                        let closure = self.frames.last().unwrap().closure;
                        self.heap.as_closure(closure).upvalues[slot]
                    };
                    let value = match self.heap.as_upvalue(upvalue_ref).location {
                        UpvalueLocation::Stack(s) => self.stack[s],
                        UpvalueLocation::Closed(v) => v,
                    };
                    self.push(value);
                }
                OpCode::OP_SET_UPVALUE => {
                    let slot = self.read_index();
                    let value = self.peek(0);
                    let upvalue_ref = {
                        let closure = self.frames.last().unwrap().closure;
                        self.heap.as_closure(closure).upvalues[slot]
                    };
                    match self.heap.as_upvalue(upvalue_ref).location {
                        UpvalueLocation::Stack(s) => self.stack[s] = value,
                        UpvalueLocation::Closed(_) => {
                            self.heap.as_upvalue_mut(upvalue_ref).location =
                                UpvalueLocation::Closed(value);
                        }
                    }
                }
                OpCode::OP_CLOSE_UPVALUE => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::OP_GET_PROPERTY => {
                    let name = self.read_name();
                    let receiver = self.peek(0);
                    let Value::Obj(obj) = receiver else {
                        return self.runtime_error("Only instances have properties.");
                    };
                    if self.heap.type_name(obj) != "instance" {
                        return self.runtime_error("Only instances have properties.");
                    }
                    let hash = self.heap.string_hash(name);
                    if let Some(value) = self.heap.as_instance(obj).fields.get(name, hash) {
                        self.pop();
                        self.push(value);
                    } else {
                        let class_ref = self.heap.as_instance(obj).class;
                        // receiver stays on the stack; bind_method pops it
                        // itself once the bound method is allocated.
                        self.bind_method(class_ref, name)?;
                    }
                }
                OpCode::OP_SET_PROPERTY => {
                    let name = self.read_name();
                    let value = self.pop();
                    let receiver = self.pop();
                    let Value::Obj(obj) = receiver else {
                        return self.runtime_error("Only instances have fields.");
                    };
                    if self.heap.type_name(obj) != "instance" {
                        return self.runtime_error("Only instances have fields.");
                    }
                    let hash = self.heap.string_hash(name);
                    self.heap.as_instance_mut(obj).fields.set(name, hash, value);
                    self.push(value);
                }
                OpCode::OP_GET_SUPER => {
                    let name = self.read_name();
                    let superclass_val = self.pop();
                    let Value::Obj(class_ref) = superclass_val else {
                        panic!("superclass operand is not a class (compiler bug)")
                    };
                    // receiver is left on the stack for bind_method to root
                    // across its allocation and pop itself.
                    self.bind_method(class_ref, name)?;
                }
                OpCode::OP_INDEX_GET => {
                    let index = self.pop();
                    let receiver = self.pop();
                    let value = self.index_get(receiver, index)?;
                    self.push(value);
                }
                OpCode::OP_INDEX_SET => {
                    let value = self.pop();
                    let index = self.pop();
                    let receiver = self.pop();
                    self.index_set(receiver, index, value)?;
                    self.push(value);
                }
                OpCode::OP_EQUAL => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(Value::values_equal(&a, &b)));
                }
                OpCode::OP_NOT_EQUAL => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(!Value::values_equal(&a, &b)));
                }
                OpCode::OP_GREATER => self.number_compare(|a, b| a > b)?,
                OpCode::OP_GREATER_EQUAL => self.number_compare(|a, b| a >= b)?,
                OpCode::OP_LESS => self.number_compare(|a, b| a < b)?,
                OpCode::OP_LESS_EQUAL => self.number_compare(|a, b| a <= b)?,
                OpCode::OP_ADD => self.add()?,
                OpCode::OP_SUBTRACT => self.number_binary(|a, b| a - b)?,
                OpCode::OP_MULTIPLY => self.number_binary(|a, b| a * b)?,
                OpCode::OP_DIVIDE => {
                    let b = self.peek(0);
                    if let Value::Num(n) = b {
                        if n == 0.0 {
                            return self.runtime_error("Cannot perform a division by zero.");
                        }
                    }
                    self.number_binary(|a, b| a / b)?;
                }
                OpCode::OP_MODULO => {
                    let b = self.peek(0);
                    if let Value::Num(n) = b {
                        if n == 0.0 {
                            return self.runtime_error("Cannot perform a division by zero.");
                        }
                    }
                    self.number_binary(|a, b| a % b)?;
                }
                OpCode::OP_POW => self.number_binary(|a, b| a.powf(b))?,
                OpCode::OP_NEGATE => {
                    let v = self.pop();
                    match v {
                        Value::Num(n) => self.push(Value::Num(-n)),
                        _ => return self.runtime_error("Operand must be a number."),
                    }
                }
                OpCode::OP_NOT => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey(&self.heap)));
                }
                OpCode::OP_JUMP => {
                    let offset = self.read_u16_be() as usize;
                    self.frames.last_mut().unwrap().ip += offset;
                }
                OpCode::OP_JUMP_IF_FALSE => {
                    let offset = self.read_u16_be() as usize;
                    if self.peek(0).is_falsey(&self.heap) {
                        self.frames.last_mut().unwrap().ip += offset;
                    }
                }
                OpCode::OP_LOOP => {
                    let offset = self.read_u16_be() as usize;
                    self.frames.last_mut().unwrap().ip -= offset;
                }
                OpCode::OP_CALL => {
                    let argc = self.read_u8();
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc)?;
                }
                OpCode::OP_INVOKE => {
                    let name = self.read_name();
                    let argc = self.read_u8();
                    self.invoke(name, argc)?;
                }
                OpCode::OP_SUPER_INVOKE => {
                    let name = self.read_name();
                    let argc = self.read_u8();
                    let superclass_val = self.pop();
                    let Value::Obj(class_ref) = superclass_val else {
                        panic!("superclass operand is not a class (compiler bug)")
                    };
                    self.invoke_from_class(class_ref, name, argc)?;
                }
                OpCode::OP_CLOSURE => {
                    let function_val = self.pop();
                    let Value::Obj(function_ref) = function_val else {
                        panic!("OP_CLOSURE operand is not a function (compiler bug)")
                    };
                    let upvalue_count = self.heap.as_function(function_ref).upvalue_count;
                    let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_u8() != 0;
                        let index = self.read_u8() as usize;
                        let upvalue_ref = if is_local {
                            let base = self.frames.last().unwrap().slots_base;
                            self.capture_upvalue(base + index)
                        } else {
                            let enclosing = self.frames.last().unwrap().closure;
                            self.heap.as_closure(enclosing).upvalues[index]
                        };
                        upvalues.push(upvalue_ref);
                    }
                    self.maybe_collect();
                    let closure_ref = self.heap.new_closure(function_ref, upvalues);
                    self.push(Value::Obj(closure_ref));
                }
                OpCode::OP_RETURN => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("return with no active frame");
                    self.close_upvalues(frame.slots_base);
                    self.stack.truncate(frame.slots_base);
                    if self.frames.is_empty() {
                        return Ok(if self.is_repl { last_repl_value } else { None });
                    }
                    self.push(result);
                }
                OpCode::OP_CLASS => {
                    let name = self.read_name();
                    self.maybe_collect();
                    let class_ref = self.heap.new_class(name);
                    self.push(Value::Obj(class_ref));
                }
                OpCode::OP_INHERIT => {
                    let subclass_val = self.peek(0);
                    let superclass_val = self.peek(1);
                    let Value::Obj(super_ref) = superclass_val else {
                        return self.runtime_error("Superclass must be a class.");
                    };
                    if self.heap.type_name(super_ref) != "class" {
                        return self.runtime_error("Superclass must be a class.");
                    }
                    let Value::Obj(sub_ref) = subclass_val else {
                        panic!("subclass operand is not a class (compiler bug)")
                    };
                    let super_methods = self.heap.as_class(super_ref).methods.clone();
                    self.heap.as_class_mut(sub_ref).methods.copy_from(&super_methods);
                    self.pop(); // the subclass value pushed only for this op
                }
                OpCode::OP_METHOD => {
                    let name = self.read_name();
                    let method_val = self.pop();
                    let Value::Obj(class_ref) = self.peek(0) else {
                        panic!("class operand is not a class (compiler bug)")
                    };
                    let hash = self.heap.string_hash(name);
                    self.heap.as_class_mut(class_ref).methods.set(name, hash, method_val);
                }
                OpCode::OP_LIST => {
                    let count = self.read_u16_le() as usize;
                    let start = self.stack.len() - count;
                    // Elements stay on the stack (rooted) across the
                    // collection point; only truncated once the list itself
                    // holds them.
                    self.maybe_collect();
                    let elements: Vec<Value> = self.stack[start..].to_vec();
                    self.stack.truncate(start);
                    let list_ref = self.heap.new_list(elements);
                    self.push(Value::Obj(list_ref));
                }
                OpCode::OP_MAP => {
                    let count = self.read_u16_le() as usize;
                    let start = self.stack.len() - count * 2;
                    // Same rooting discipline as OP_LIST.
                    self.maybe_collect();
                    let pairs: Vec<Value> = self.stack[start..].to_vec();
                    self.stack.truncate(start);
                    let map_ref = self.heap.new_map();
                    for pair in pairs.chunks(2) {
                        let Value::Obj(key_ref) = pair[0] else {
                            return self.runtime_error("Map keys must be strings.");
                        };
                        if self.heap.type_name(key_ref) != "string" {
                            return self.runtime_error("Map keys must be strings.");
                        }
                        let hash = self.heap.string_hash(key_ref);
                        self.heap.as_map_mut(map_ref).map.set(key_ref, hash, pair[1]);
                    }
                    self.push(Value::Obj(map_ref));
                }
                OpCode::OP_UNKNOWN => {
                    return self.runtime_error("unknown opcode (implementation bug)");
                }
            }
        }
    }

    fn index_get(&mut self, receiver: Value, index: Value) -> Result<Value, FalconError> {
        let Value::Obj(obj) = receiver else {
            return self.runtime_error("Only lists and maps can be subscripted.");
        };
        match self.heap.type_name(obj) {
            "list" => {
                let Value::Num(n) = index else {
                    return self.runtime_error("List index must be a number.");
                };
                let list = self.heap.as_list(obj);
                let i = n as i64;
                if i < 0 || i as usize >= list.elements.len() {
                    return self.runtime_error("List index out of bounds.");
                }
                Ok(list.elements[i as usize])
            }
            "map" => {
                let Value::Obj(key_ref) = index else {
                    return self.runtime_error("Map key must be a string.");
                };
                if self.heap.type_name(key_ref) != "string" {
                    return self.runtime_error("Map key must be a string.");
                }
                let hash = self.heap.string_hash(key_ref);
                match self.heap.as_map(obj).map.get(key_ref, hash) {
                    Some(v) => Ok(v),
                    None => self.runtime_error("Undefined map key."),
                }
            }
            _ => self.runtime_error("Only lists and maps can be subscripted."),
        }
    }

    fn index_set(&mut self, receiver: Value, index: Value, value: Value) -> Result<(), FalconError> {
        let Value::Obj(obj) = receiver else {
            return self.runtime_error("Subscript assignment target must be a list or map.");
        };
        match self.heap.type_name(obj) {
            "list" => {
                let Value::Num(n) = index else {
                    return self.runtime_error("List index must be a number.");
                };
                let i = n as i64;
                let list = self.heap.as_list_mut(obj);
                if i < 0 || i as usize >= list.elements.len() {
                    return self.runtime_error("List index out of bounds.");
                }
                list.elements[i as usize] = value;
                Ok(())
            }
            "map" => {
                let Value::Obj(key_ref) = index else {
                    return self.runtime_error("Map key must be a string.");
                };
                if self.heap.type_name(key_ref) != "string" {
                    return self.runtime_error("Map key must be a string.");
                }
                let hash = self.heap.string_hash(key_ref);
                self.heap.as_map_mut(obj).map.set(key_ref, hash, value);
                Ok(())
            }
            _ => self.runtime_error("Subscript assignment on non-list."),
        }
    }

    fn number_binary(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), FalconError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Num(x), Value::Num(y)) => {
                self.push(Value::Num(op(x, y)));
                Ok(())
            }
            _ => self.runtime_error("Operands must be numbers."),
        }
    }

    fn number_compare(&mut self, op: impl Fn(f64, f64) -> bool) -> Result<(), FalconError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Num(x), Value::Num(y)) => {
                self.push(Value::Bool(op(x, y)));
                Ok(())
            }
            _ => self.runtime_error("Operands must be numbers."),
        }
    }

    fn add(&mut self) -> Result<(), FalconError> {
        // Operands stay rooted on the stack until the string branch's
        // collection point has passed; only the number/error paths (which
        // allocate nothing) pop eagerly.
        let b = self.peek(0);
        let a = self.peek(1);
        match (a, b) {
            (Value::Num(x), Value::Num(y)) => {
                self.pop();
                self.pop();
                self.push(Value::Num(x + y));
                Ok(())
            }
            (Value::Obj(x), Value::Obj(y))
                if self.heap.type_name(x) == "string" && self.heap.type_name(y) == "string" =>
            {
                self.maybe_collect();
                let mut joined = self.heap.as_string(x).bytes.clone();
                joined.push_str(&self.heap.as_string(y).bytes);
                let r = self.heap.intern_take(joined);
                self.pop();
                self.pop();
                self.push(Value::Obj(r));
                Ok(())
            }
            _ => {
                self.pop();
                self.pop();
                self.runtime_error("Operands must be two numbers or two strings.")
            }
        }
    }

    pub fn line_for_error(&self) -> usize {
        self.current_line()
    }
}
