// File: src/errors.rs
//
// Structured diagnostics for Falcon. Replaces the C source's printf-style
// error reporting (spec §9 Design Notes) with one record type shared by
// the scanner, compiler, and VM, rendered consistently via `colored`.

use colored::Colorize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Compile,
    Runtime,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::Compile => write!(f, "CompilerError"),
            ErrorKind::Runtime => write!(f, "RuntimeError"),
        }
    }
}

/// A single diagnostic, with enough context to reproduce the
/// `"<file>:<line>:<col> => CompilerError: <msg>"` / source-line / caret
/// rendering spec §6 requires.
#[derive(Debug, Clone)]
pub struct FalconError {
    pub kind: ErrorKind,
    pub message: String,
    pub file: String,
    pub line: usize,
    pub column: usize,
    pub source_line: Option<String>,
    /// Populated only for runtime errors: innermost call first.
    pub stack_trace: Vec<String>,
}

impl FalconError {
    pub fn compile(file: &str, line: usize, column: usize, message: impl Into<String>) -> Self {
        FalconError {
            kind: ErrorKind::Compile,
            message: message.into(),
            file: file.to_string(),
            line,
            column,
            source_line: None,
            stack_trace: Vec::new(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        FalconError {
            kind: ErrorKind::Runtime,
            message: message.into(),
            file: String::new(),
            line: 0,
            column: 0,
            source_line: None,
            stack_trace: Vec::new(),
        }
    }

    pub fn with_source_line(mut self, line: impl Into<String>) -> Self {
        self.source_line = Some(line.into());
        self
    }

    pub fn with_stack_trace(mut self, frames: Vec<String>) -> Self {
        self.stack_trace = frames;
        self
    }
}

impl fmt::Display for FalconError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            ErrorKind::Compile => {
                writeln!(
                    f,
                    "{}:{}:{} => {}: {}",
                    self.file,
                    self.line,
                    self.column,
                    "CompilerError".red().bold(),
                    self.message.bold()
                )?;
                if let Some(ref src) = self.source_line {
                    writeln!(f, "{}", src)?;
                    writeln!(f, "{}{}", " ".repeat(self.column.saturating_sub(1)), "^".red().bold())?;
                }
                Ok(())
            }
            ErrorKind::Runtime => {
                writeln!(f, "{}: {}", "RuntimeError".red().bold(), self.message)?;
                if !self.stack_trace.is_empty() {
                    writeln!(f, "Stack trace (last call first):")?;
                    let frames = &self.stack_trace;
                    if frames.len() <= 20 {
                        for frame in frames {
                            writeln!(f, "    {}", frame)?;
                        }
                    } else {
                        for frame in &frames[..10] {
                            writeln!(f, "    {}", frame)?;
                        }
                        writeln!(f, "    ... ({} frames omitted) ...", frames.len() - 20)?;
                        for frame in &frames[frames.len() - 10..] {
                            writeln!(f, "    {}", frame)?;
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for FalconError {}
