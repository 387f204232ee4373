// File: src/natives.rs
//
// The native (Rust-implemented) standard library: clock/time, process
// control, I/O, type introspection/conversion, and math helpers. Falcon's
// core (scanner/compiler/vm) never calls into this module — natives are
// registered into `globals` the same way a host embedding Falcon would
// register its own (spec §6 native-registration interface).

use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::value::Value;
use crate::vm::Vm;

pub fn register_all(vm: &mut Vm) {
    vm.define_native("clock", Some(0), clock);
    vm.define_native("time", Some(0), time);
    vm.define_native("exit", None, exit);
    vm.define_native("print", None, print);
    vm.define_native("input", None, input);
    vm.define_native("type", Some(1), type_of);
    vm.define_native("str", Some(1), str_of);
    vm.define_native("num", Some(1), num_of);
    vm.define_native("len", Some(1), len);

    vm.define_native("sqrt", Some(1), sqrt);
    vm.define_native("abs", Some(1), abs);
    vm.define_native("floor", Some(1), floor);
    vm.define_native("ceil", Some(1), ceil);
    vm.define_native("round", Some(1), round);
    vm.define_native("pow", Some(2), pow);
    vm.define_native("min", Some(2), min);
    vm.define_native("max", Some(2), max);
}

fn expect_num(vm: &mut Vm, args: &[Value], index: usize, fn_name: &str) -> Result<f64, Value> {
    match args.get(index) {
        Some(Value::Num(n)) => Ok(*n),
        _ => Err(vm.native_error(format!("{}() expects a number argument.", fn_name))),
    }
}

/// Seconds elapsed since the Unix epoch, matching clox's benchmark clock.
fn clock(vm: &mut Vm, _args: &[Value]) -> Value {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => Value::Num(d.as_secs_f64()),
        Err(_) => vm.native_error("System clock is before the Unix epoch."),
    }
}

/// Milliseconds elapsed since the Unix epoch — finer-grained than `clock`
/// for timing short-running scripts.
fn time(vm: &mut Vm, _args: &[Value]) -> Value {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => Value::Num(d.as_millis() as f64),
        Err(_) => vm.native_error("System clock is before the Unix epoch."),
    }
}

fn exit(vm: &mut Vm, args: &[Value]) -> Value {
    let code = match args.first() {
        None => 0,
        Some(Value::Num(n)) => *n as i32,
        Some(_) => return vm.native_error("exit() expects a number argument."),
    };
    std::process::exit(code);
}

fn print(vm: &mut Vm, args: &[Value]) -> Value {
    let parts: Vec<String> = args.iter().map(|&v| vm.heap.to_display_string(v)).collect();
    println!("{}", parts.join(" "));
    Value::Null
}

fn input(vm: &mut Vm, args: &[Value]) -> Value {
    if let Some(&prompt) = args.first() {
        print!("{}", vm.heap.to_display_string(prompt));
        if std::io::stdout().flush().is_err() {
            return vm.native_error("Failed to flush stdout.");
        }
    }
    let mut line = String::new();
    match std::io::stdin().read_line(&mut line) {
        Ok(0) => Value::Null, // EOF
        Ok(_) => {
            let trimmed = line.trim_end_matches(['\n', '\r']);
            Value::Obj(vm.heap.intern_copy(trimmed))
        }
        Err(_) => vm.native_error("Failed to read from stdin."),
    }
}

fn type_of(vm: &mut Vm, args: &[Value]) -> Value {
    let name = match args[0] {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Num(_) => "num",
        Value::Err => "error",
        Value::Obj(r) => vm.heap.type_name(r),
    };
    Value::Obj(vm.heap.intern_copy(name))
}

fn str_of(vm: &mut Vm, args: &[Value]) -> Value {
    let s = vm.heap.to_display_string(args[0]);
    Value::Obj(vm.heap.intern_take(s))
}

fn num_of(vm: &mut Vm, args: &[Value]) -> Value {
    match args[0] {
        Value::Num(n) => Value::Num(n),
        Value::Bool(b) => Value::Num(if b { 1.0 } else { 0.0 }),
        Value::Obj(r) if vm.heap.type_name(r) == "string" => {
            match vm.heap.as_string(r).bytes.trim().parse::<f64>() {
                Ok(n) => Value::Num(n),
                Err(_) => vm.native_error(format!(
                    "Cannot convert \"{}\" to a number.",
                    vm.heap.as_string(r).bytes
                )),
            }
        }
        _ => vm.native_error("num() cannot convert this value."),
    }
}

fn len(vm: &mut Vm, args: &[Value]) -> Value {
    match args[0] {
        Value::Obj(r) => match vm.heap.type_name(r) {
            "string" => Value::Num(vm.heap.as_string(r).bytes.chars().count() as f64),
            "list" => Value::Num(vm.heap.as_list(r).elements.len() as f64),
            "map" => Value::Num(vm.heap.as_map(r).map.len() as f64),
            _ => vm.native_error("len() expects a string, list, or map."),
        },
        _ => vm.native_error("len() expects a string, list, or map."),
    }
}

fn sqrt(vm: &mut Vm, args: &[Value]) -> Value {
    match expect_num(vm, args, 0, "sqrt") {
        Ok(n) => Value::Num(n.sqrt()),
        Err(e) => e,
    }
}

fn abs(vm: &mut Vm, args: &[Value]) -> Value {
    match expect_num(vm, args, 0, "abs") {
        Ok(n) => Value::Num(n.abs()),
        Err(e) => e,
    }
}

fn floor(vm: &mut Vm, args: &[Value]) -> Value {
    match expect_num(vm, args, 0, "floor") {
        Ok(n) => Value::Num(n.floor()),
        Err(e) => e,
    }
}

fn ceil(vm: &mut Vm, args: &[Value]) -> Value {
    match expect_num(vm, args, 0, "ceil") {
        Ok(n) => Value::Num(n.ceil()),
        Err(e) => e,
    }
}

fn round(vm: &mut Vm, args: &[Value]) -> Value {
    match expect_num(vm, args, 0, "round") {
        Ok(n) => Value::Num(n.round()),
        Err(e) => e,
    }
}

fn pow(vm: &mut Vm, args: &[Value]) -> Value {
    let base = match expect_num(vm, args, 0, "pow") {
        Ok(n) => n,
        Err(e) => return e,
    };
    let exp = match expect_num(vm, args, 1, "pow") {
        Ok(n) => n,
        Err(e) => return e,
    };
    Value::Num(base.powf(exp))
}

fn min(vm: &mut Vm, args: &[Value]) -> Value {
    let a = match expect_num(vm, args, 0, "min") {
        Ok(n) => n,
        Err(e) => return e,
    };
    let b = match expect_num(vm, args, 1, "min") {
        Ok(n) => n,
        Err(e) => return e,
    };
    Value::Num(a.min(b))
}

fn max(vm: &mut Vm, args: &[Value]) -> Value {
    let a = match expect_num(vm, args, 0, "max") {
        Ok(n) => n,
        Err(e) => return e,
    };
    let b = match expect_num(vm, args, 1, "max") {
        Ok(n) => n,
        Err(e) => return e,
    };
    Value::Num(a.max(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Vm;

    #[test]
    fn math_helpers_match_std() {
        let mut vm = Vm::new("<test>", false);
        assert!(matches!(sqrt(&mut vm, &[Value::Num(9.0)]), Value::Num(n) if n == 3.0));
        assert!(matches!(abs(&mut vm, &[Value::Num(-4.0)]), Value::Num(n) if n == 4.0));
        assert!(matches!(max(&mut vm, &[Value::Num(1.0), Value::Num(2.0)]), Value::Num(n) if n == 2.0));
    }

    #[test]
    fn type_of_reports_primitive_names() {
        let mut vm = Vm::new("<test>", false);
        let Value::Obj(r) = type_of(&mut vm, &[Value::Num(1.0)]) else {
            panic!("expected a string");
        };
        assert_eq!(vm.heap.as_string(r).bytes, "num");
    }

    #[test]
    fn num_of_rejects_unparseable_strings() {
        let mut vm = Vm::new("<test>", false);
        let s = vm.heap.intern_copy("not a number");
        assert!(matches!(num_of(&mut vm, &[Value::Obj(s)]), Value::Err));
    }
}
