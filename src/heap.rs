// File: src/heap.rs
//
// The arena-backed heap and mark-and-sweep garbage collector. Spec §3/§4.E
// model every object as threaded onto a global intrusive list via a `next`
// pointer; here the arena `Vec<Option<HeapSlot>>` plays that role directly —
// occupying a live slot is list membership, and `sweep` is the only place
// a slot empties. `ObjRef(index)` replaces the C `Obj*` pointer.

use std::collections::HashMap;

use crate::falcon_map::FalconMap;
use crate::object::{
    BoundMethodObj, ClassObj, ClosureObj, FunctionObj, InstanceObj, ListObj, LoxString, MapObj,
    NativeFn, NativeObj, ObjKind, UpvalueLocation, UpvalueObj,
};
use crate::value::{ObjRef, Value};

const INITIAL_NEXT_GC: usize = 1024 * 1024;
const GC_GROW_FACTOR: usize = 2;

struct HeapSlot {
    marked: bool,
    size: usize,
    kind: ObjKind,
}

/// The heap arena, string intern table, and GC bookkeeping for one VM
/// lifetime. Dropping a `Heap` frees every object it owns; there is no
/// cross-heap object sharing (spec §5).
pub struct Heap {
    objects: Vec<Option<HeapSlot>>,
    free_list: Vec<u32>,
    strings: HashMap<String, ObjRef>,
    grey_stack: Vec<ObjRef>,
    pub bytes_allocated: usize,
    pub next_gc: usize,
    /// When set (via `FALCON_GC_STRESS=1`), every allocation collects.
    pub stress_gc: bool,
    pub init_string: ObjRef,
}

impl Heap {
    pub fn new() -> Self {
        let mut heap = Heap {
            objects: Vec::new(),
            free_list: Vec::new(),
            strings: HashMap::new(),
            grey_stack: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            stress_gc: std::env::var("FALCON_GC_STRESS").is_ok(),
            init_string: ObjRef(0),
        };
        heap.init_string = heap.intern_copy("init");
        heap
    }

    pub fn should_collect(&self) -> bool {
        self.stress_gc || self.bytes_allocated > self.next_gc
    }

    // --- arena plumbing -----------------------------------------------

    fn insert(&mut self, kind: ObjKind, size: usize) -> ObjRef {
        self.bytes_allocated += size;
        let slot = HeapSlot { marked: false, size, kind };
        if let Some(index) = self.free_list.pop() {
            self.objects[index as usize] = Some(slot);
            ObjRef(index)
        } else {
            let index = self.objects.len() as u32;
            self.objects.push(Some(slot));
            ObjRef(index)
        }
    }

    fn slot(&self, r: ObjRef) -> &HeapSlot {
        self.objects[r.0 as usize]
            .as_ref()
            .expect("dangling ObjRef: object already swept (GC bug)")
    }

    fn slot_mut(&mut self, r: ObjRef) -> &mut HeapSlot {
        self.objects[r.0 as usize]
            .as_mut()
            .expect("dangling ObjRef: object already swept (GC bug)")
    }

    pub fn kind(&self, r: ObjRef) -> &ObjKind {
        &self.slot(r).kind
    }

    pub fn type_name(&self, r: ObjRef) -> &'static str {
        self.slot(r).kind.type_name()
    }

    // --- constructors ----------------------------------------------------

    /// Interns a copy of `s`, returning the existing entry if one matches.
    pub fn intern_copy(&mut self, s: &str) -> ObjRef {
        if let Some(&existing) = self.strings.get(s) {
            return existing;
        }
        self.intern_take(s.to_string())
    }

    /// Interns an owned string, taking ownership if it is genuinely new.
    pub fn intern_take(&mut self, s: String) -> ObjRef {
        if let Some(&existing) = self.strings.get(&s) {
            return existing;
        }
        let size = std::mem::size_of::<LoxString>() + s.len();
        let key = s.clone();
        let obj = LoxString::new(s);
        let r = self.insert(ObjKind::LoxString(obj), size);
        self.strings.insert(key, r);
        r
    }

    pub fn new_function(&mut self, f: FunctionObj) -> ObjRef {
        self.insert(ObjKind::Function(f), std::mem::size_of::<FunctionObj>())
    }

    pub fn new_upvalue(&mut self, location: UpvalueLocation) -> ObjRef {
        self.insert(ObjKind::Upvalue(UpvalueObj { location }), std::mem::size_of::<UpvalueObj>())
    }

    pub fn new_closure(&mut self, function: ObjRef, upvalues: Vec<ObjRef>) -> ObjRef {
        let size = std::mem::size_of::<ClosureObj>() + upvalues.len() * std::mem::size_of::<ObjRef>();
        self.insert(ObjKind::Closure(ClosureObj { function, upvalues }), size)
    }

    pub fn new_class(&mut self, name: ObjRef) -> ObjRef {
        self.insert(
            ObjKind::Class(ClassObj { name, methods: FalconMap::new() }),
            std::mem::size_of::<ClassObj>(),
        )
    }

    pub fn new_instance(&mut self, class: ObjRef) -> ObjRef {
        self.insert(
            ObjKind::Instance(InstanceObj { class, fields: FalconMap::new() }),
            std::mem::size_of::<InstanceObj>(),
        )
    }

    pub fn new_bound_method(&mut self, receiver: Value, method: ObjRef) -> ObjRef {
        self.insert(
            ObjKind::BoundMethod(BoundMethodObj { receiver, method }),
            std::mem::size_of::<BoundMethodObj>(),
        )
    }

    pub fn new_list(&mut self, elements: Vec<Value>) -> ObjRef {
        let size =
            std::mem::size_of::<ListObj>() + elements.len() * std::mem::size_of::<Value>();
        self.insert(ObjKind::List(ListObj { elements }), size)
    }

    pub fn new_map(&mut self) -> ObjRef {
        self.insert(ObjKind::Map(MapObj::default()), std::mem::size_of::<MapObj>())
    }

    pub fn new_native(&mut self, name: ObjRef, arity: Option<u8>, function: NativeFn) -> ObjRef {
        self.insert(
            ObjKind::Native(NativeObj { name, arity, function }),
            std::mem::size_of::<NativeObj>(),
        )
    }

    // --- typed accessors --------------------------------------------------

    pub fn as_string(&self, r: ObjRef) -> &LoxString {
        match self.kind(r) {
            ObjKind::LoxString(s) => s,
            other => panic!("expected string, found {}", other.type_name()),
        }
    }

    pub fn string_hash(&self, r: ObjRef) -> u64 {
        self.as_string(r).hash
    }

    pub fn as_function(&self, r: ObjRef) -> &FunctionObj {
        match self.kind(r) {
            ObjKind::Function(f) => f,
            other => panic!("expected function, found {}", other.type_name()),
        }
    }

    pub fn as_closure(&self, r: ObjRef) -> &ClosureObj {
        match self.kind(r) {
            ObjKind::Closure(c) => c,
            other => panic!("expected closure, found {}", other.type_name()),
        }
    }

    pub fn as_class(&self, r: ObjRef) -> &ClassObj {
        match self.kind(r) {
            ObjKind::Class(c) => c,
            other => panic!("expected class, found {}", other.type_name()),
        }
    }

    pub fn as_class_mut(&mut self, r: ObjRef) -> &mut ClassObj {
        match &mut self.slot_mut(r).kind {
            ObjKind::Class(c) => c,
            other => panic!("expected class, found {}", other.type_name()),
        }
    }

    pub fn as_instance(&self, r: ObjRef) -> &InstanceObj {
        match self.kind(r) {
            ObjKind::Instance(i) => i,
            other => panic!("expected instance, found {}", other.type_name()),
        }
    }

    pub fn as_instance_mut(&mut self, r: ObjRef) -> &mut InstanceObj {
        match &mut self.slot_mut(r).kind {
            ObjKind::Instance(i) => i,
            other => panic!("expected instance, found {}", other.type_name()),
        }
    }

    pub fn as_bound_method(&self, r: ObjRef) -> &BoundMethodObj {
        match self.kind(r) {
            ObjKind::BoundMethod(b) => b,
            other => panic!("expected bound method, found {}", other.type_name()),
        }
    }

    pub fn as_list(&self, r: ObjRef) -> &ListObj {
        match self.kind(r) {
            ObjKind::List(l) => l,
            other => panic!("expected list, found {}", other.type_name()),
        }
    }

    pub fn as_list_mut(&mut self, r: ObjRef) -> &mut ListObj {
        match &mut self.slot_mut(r).kind {
            ObjKind::List(l) => l,
            other => panic!("expected list, found {}", other.type_name()),
        }
    }

    pub fn as_map(&self, r: ObjRef) -> &MapObj {
        match self.kind(r) {
            ObjKind::Map(m) => m,
            other => panic!("expected map, found {}", other.type_name()),
        }
    }

    pub fn as_map_mut(&mut self, r: ObjRef) -> &mut MapObj {
        match &mut self.slot_mut(r).kind {
            ObjKind::Map(m) => m,
            other => panic!("expected map, found {}", other.type_name()),
        }
    }

    pub fn as_native(&self, r: ObjRef) -> &NativeObj {
        match self.kind(r) {
            ObjKind::Native(n) => n,
            other => panic!("expected native function, found {}", other.type_name()),
        }
    }

    pub fn as_upvalue(&self, r: ObjRef) -> &UpvalueObj {
        match self.kind(r) {
            ObjKind::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.type_name()),
        }
    }

    pub fn as_upvalue_mut(&mut self, r: ObjRef) -> &mut UpvalueObj {
        match &mut self.slot_mut(r).kind {
            ObjKind::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.type_name()),
        }
    }

    // --- falsiness / display ----------------------------------------------

    pub fn is_falsey_obj(&self, r: ObjRef) -> bool {
        match self.kind(r) {
            ObjKind::LoxString(s) => s.bytes.is_empty(),
            ObjKind::List(l) => l.elements.is_empty(),
            ObjKind::Map(m) => m.map.is_empty(),
            _ => false,
        }
    }

    pub fn to_display_string(&self, value: Value) -> String {
        match value {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Num(n) => format_number(n),
            Value::Err => "<error>".to_string(),
            Value::Obj(r) => self.display_obj(r),
        }
    }

    fn display_obj(&self, r: ObjRef) -> String {
        match self.kind(r) {
            ObjKind::LoxString(s) => s.bytes.clone(),
            ObjKind::Function(f) => match f.name {
                Some(name) => format!("<function {}>", self.as_string(name).bytes),
                None => "<script>".to_string(),
            },
            ObjKind::Closure(c) => self.display_obj(c.function),
            ObjKind::Native(n) => format!("<native {}>", self.as_string(n.name).bytes),
            ObjKind::Class(c) => self.as_string(c.name).bytes.clone(),
            ObjKind::Instance(i) => format!("<{} instance>", self.as_string(self.as_class(i.class).name).bytes),
            ObjKind::BoundMethod(b) => self.display_obj(b.method),
            ObjKind::Upvalue(_) => "<upvalue>".to_string(),
            ObjKind::List(l) => {
                let parts: Vec<String> =
                    l.elements.iter().map(|v| self.to_display_string(*v)).collect();
                format!("[ {} ]", parts.join(", "))
            }
            ObjKind::Map(m) => {
                let parts: Vec<String> = m
                    .map
                    .iter()
                    .map(|(k, v)| {
                        format!("\"{}\": {}", self.as_string(k).bytes, self.to_display_string(v))
                    })
                    .collect();
                format!("{{ {} }}", parts.join(", "))
            }
        }
    }

    // --- garbage collection ------------------------------------------------

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        let slot = self.slot_mut(r);
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.grey_stack.push(r);
    }

    /// Pops one grey object and marks everything it points to ("blackens"
    /// it). Strings and natives have no outgoing references.
    fn blacken(&mut self, r: ObjRef) {
        // Clone out the edges first to avoid holding a borrow of `self`
        // while recursively marking through it.
        match self.kind(r).clone() {
            ObjKind::LoxString(_) | ObjKind::Native(_) => {}
            ObjKind::Function(f) => {
                if let Some(name) = f.name {
                    self.mark_object(name);
                }
                for &c in &f.chunk.constants {
                    self.mark_value(c);
                }
            }
            ObjKind::Upvalue(u) => {
                if let UpvalueLocation::Closed(v) = u.location {
                    self.mark_value(v);
                }
            }
            ObjKind::Closure(c) => {
                self.mark_object(c.function);
                for &u in &c.upvalues {
                    self.mark_object(u);
                }
            }
            ObjKind::Class(c) => {
                self.mark_object(c.name);
                let entries: Vec<(ObjRef, Value)> = c.methods.iter().collect();
                for (k, v) in entries {
                    self.mark_object(k);
                    self.mark_value(v);
                }
            }
            ObjKind::Instance(i) => {
                self.mark_object(i.class);
                let entries: Vec<(ObjRef, Value)> = i.fields.iter().collect();
                for (k, v) in entries {
                    self.mark_object(k);
                    self.mark_value(v);
                }
            }
            ObjKind::BoundMethod(b) => {
                self.mark_value(b.receiver);
                self.mark_object(b.method);
            }
            ObjKind::List(l) => {
                for &v in &l.elements {
                    self.mark_value(v);
                }
            }
            ObjKind::Map(m) => {
                let entries: Vec<(ObjRef, Value)> = m.map.iter().collect();
                for (k, v) in entries {
                    self.mark_object(k);
                    self.mark_value(v);
                }
            }
        }
    }

    pub fn trace_all(&mut self) {
        while let Some(r) = self.grey_stack.pop() {
            self.blacken(r);
        }
    }

    /// Drops unmarked strings from the intern table so sweep doesn't leave
    /// a dangling entry behind.
    pub fn sweep_strings(&mut self) {
        let objects = &self.objects;
        self.strings.retain(|_, r| {
            objects[r.0 as usize].as_ref().map(|s| s.marked).unwrap_or(false)
        });
    }

    pub fn sweep(&mut self) {
        for index in 0..self.objects.len() {
            let Some(slot) = self.objects[index].as_mut() else { continue };
            if slot.marked {
                slot.marked = false;
            } else {
                let size = slot.size;
                self.objects[index] = None;
                self.free_list.push(index as u32);
                self.bytes_allocated -= size;
            }
        }
    }

    pub fn resize_threshold(&mut self) {
        self.next_gc = self.bytes_allocated * GC_GROW_FACTOR;
    }

    /// Runs one full mark-and-sweep cycle. `mark_roots` is supplied by the
    /// caller (the VM during execution, the compiler mid-compile) since
    /// roots live outside the heap itself.
    pub fn collect_with<F: FnOnce(&mut Heap)>(&mut self, mark_roots: F) {
        mark_roots(self);
        self.trace_all();
        self.sweep_strings();
        self.sweep();
        self.resize_threshold();
    }

    pub fn live_object_count(&self) -> usize {
        self.objects.iter().filter(|s| s.is_some()).count()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Falcon numbers print without a trailing `.0` for integral values,
/// matching the round-trip property in spec §8.
pub fn format_number(n: f64) -> String {
    if n.is_infinite() {
        return if n > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}
