// File: src/repl.rs
//
// Interactive REPL: a rustyline-backed read-eval-print loop over the
// scanner/compiler/vm pipeline. Each line (or multi-line block, while
// delimiters are unbalanced) is compiled and run against a single
// persistent `Vm`, so globals and classes defined in one entry survive
// into the next.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::compiler::Compiler;
use crate::natives;
use crate::vm::Vm;

pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        let mut vm = Vm::new("<repl>", true);
        natives::register_all(&mut vm);
        Ok(Repl { vm, editor })
    }

    fn show_banner(&self) {
        println!("{}", "Falcon REPL".bright_cyan().bold());
        println!("  Type an expression or statement, {} to leave.", "Ctrl+D".bright_yellow());
        println!();
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();
        let mut buffer = String::new();

        loop {
            let prompt = if buffer.is_empty() { "falcon> " } else { "...... > " };
            match self.editor.readline(prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());
                    buffer.push_str(&line);
                    buffer.push('\n');

                    if is_input_complete(&buffer) {
                        self.eval_input(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "\nGoodbye!".bright_cyan());
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }

        Ok(())
    }

    fn eval_input(&mut self, input: &str) {
        if input.trim().is_empty() {
            return;
        }

        let function = match Compiler::compile(input, "<repl>", &mut self.vm.heap, true) {
            Ok(f) => f,
            Err(errors) => {
                for err in errors {
                    eprintln!("{}", err.to_string().bright_red());
                }
                return;
            }
        };

        match self.vm.interpret(function) {
            Ok(Some(value)) => {
                let display = self.vm.heap.to_display_string(value);
                println!("{} {}", "=>".bright_blue(), display.bright_white());
            }
            Ok(None) => {}
            Err(err) => eprintln!("{}", err.to_string().bright_red()),
        }
    }
}

impl Default for Repl {
    fn default() -> Self {
        Self::new().expect("Failed to create REPL")
    }
}

/// Balances braces/brackets/parens so multi-line function/class bodies can
/// be entered across several lines before the REPL evaluates them.
fn is_input_complete(input: &str) -> bool {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return true;
    }

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for ch in trimmed.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' | '[' | '(' if !in_string => depth += 1,
            '}' | ']' | ')' if !in_string => depth -= 1,
            _ => {}
        }
    }

    !in_string && depth <= 0
}
