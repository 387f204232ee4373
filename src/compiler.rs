// File: src/compiler.rs
//
// Single-pass Pratt compiler for Falcon: tokens flow straight from
// `Scanner::scan_token` into bytecode with no intermediate AST (see
// SPEC_FULL.md §4.D for why this departs from the teacher's two-stage
// parse-then-compile shape). Precedence climbing, scope/local tracking,
// and upvalue resolution all happen in this one pass.

use crate::chunk::{Chunk, OpCode};
use crate::errors::FalconError;
use crate::heap::Heap;
use crate::object::FunctionObj;
use crate::scanner::{Scanner, Token, TokenKind};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[allow(dead_code)]
enum Precedence {
    None,
    Assign,
    Ternary,
    Or,
    And,
    Equal,
    Compare,
    Term,
    Factor,
    Unary,
    Pow,
    Postfix,
}

impl Precedence {
    fn next(self) -> Self {
        use Precedence::*;
        match self {
            None => Assign,
            Assign => Ternary,
            Ternary => Or,
            Or => And,
            And => Equal,
            Equal => Compare,
            Compare => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Pow,
            Pow => Postfix,
            Postfix => Postfix,
        }
    }
}

type ParseFn = fn(&mut Compiler, bool);

#[derive(Clone, Copy)]
struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

fn get_rule(kind: TokenKind) -> ParseRule {
    use TokenKind::*;
    let rule = |prefix, infix, precedence| ParseRule { prefix, infix, precedence };
    match kind {
        LeftParen => rule(Some(Compiler::grouping), Some(Compiler::call), Precedence::Postfix),
        LeftBracket => rule(Some(Compiler::list), Some(Compiler::subscript), Precedence::Postfix),
        LeftBrace => rule(Some(Compiler::map_literal), None, Precedence::None),
        Dot => rule(None, Some(Compiler::dot), Precedence::Postfix),
        Minus => rule(Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        Plus => rule(None, Some(Compiler::binary), Precedence::Term),
        Slash => rule(None, Some(Compiler::binary), Precedence::Factor),
        Star => rule(None, Some(Compiler::binary), Precedence::Factor),
        Percent => rule(None, Some(Compiler::binary), Precedence::Factor),
        Caret => rule(None, Some(Compiler::binary), Precedence::Pow),
        Bang => rule(Some(Compiler::unary), None, Precedence::None),
        BangEqual => rule(None, Some(Compiler::binary), Precedence::Equal),
        EqualEqual => rule(None, Some(Compiler::binary), Precedence::Equal),
        Greater => rule(None, Some(Compiler::binary), Precedence::Compare),
        GreaterEqual => rule(None, Some(Compiler::binary), Precedence::Compare),
        Less => rule(None, Some(Compiler::binary), Precedence::Compare),
        LessEqual => rule(None, Some(Compiler::binary), Precedence::Compare),
        Identifier => rule(Some(Compiler::variable), None, Precedence::None),
        Str => rule(Some(Compiler::string), None, Precedence::None),
        Number => rule(Some(Compiler::number), None, Precedence::None),
        And => rule(None, Some(Compiler::and_), Precedence::And),
        Or => rule(None, Some(Compiler::or_), Precedence::Or),
        Question => rule(None, Some(Compiler::ternary), Precedence::Ternary),
        True | False | Null => rule(Some(Compiler::literal), None, Precedence::None),
        This => rule(Some(Compiler::this), None, Precedence::None),
        Super => rule(Some(Compiler::super_), None, Precedence::None),
        _ => rule(None, None, Precedence::None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Init,
}

struct Local {
    name: String,
    depth: i32, // -1 means "declared but not yet defined"
    captured: bool,
}

struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct FunctionScope {
    enclosing: Option<Box<FunctionScope>>,
    function: FunctionObj,
    ftype: FunctionType,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl FunctionScope {
    fn new(ftype: FunctionType, enclosing: Option<Box<FunctionScope>>) -> Self {
        // Slot 0 is reserved: `this` for methods, the callee itself otherwise.
        let slot0_name = if ftype == FunctionType::Method || ftype == FunctionType::Init {
            "this"
        } else {
            ""
        };
        FunctionScope {
            enclosing,
            function: FunctionObj::new_script(),
            ftype,
            locals: vec![Local { name: slot0_name.to_string(), depth: 0, captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassScope {
    enclosing: Option<Box<ClassScope>>,
    has_superclass: bool,
}

/// Per-loop bookkeeping so `next`/`break` can patch/jump correctly even when
/// nested. Saved and restored across function boundaries: a loop cannot
/// reach through a nested function body.
struct LoopScope {
    start: usize,
    scope_depth: i32,
    break_jumps: Vec<usize>,
}

pub struct Compiler<'src> {
    scanner: Scanner<'src>,
    heap: &'src mut Heap,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<FalconError>,
    file_name: String,
    fscope: Box<FunctionScope>,
    cscope: Option<Box<ClassScope>>,
    loops: Vec<LoopScope>,
    repl_mode: bool,
}

const MAX_LOCALS: usize = 256;
const MAX_CONSTANTS: usize = 65_535;
const MAX_JUMP: usize = 65_535;

impl<'src> Compiler<'src> {
    pub fn compile(
        source: &'src str,
        file_name: &str,
        heap: &'src mut Heap,
        repl_mode: bool,
    ) -> Result<FunctionObj, Vec<FalconError>> {
        let mut scanner = Scanner::new(source);
        let first = scanner.scan_token();
        let mut compiler = Compiler {
            scanner,
            heap,
            current: first,
            previous: first,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            file_name: file_name.to_string(),
            fscope: Box::new(FunctionScope::new(FunctionType::Script, None)),
            cscope: None,
            loops: Vec::new(),
            repl_mode,
        };

        while !compiler.check(TokenKind::Eof) {
            compiler.declaration();
        }
        compiler.consume(TokenKind::Eof, "Expect end of expression.");

        let function = compiler.finish_function();
        if compiler.had_error {
            Err(compiler.errors)
        } else {
            Ok(function)
        }
    }

    // --- token stream plumbing ---------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let msg = self.current.lexeme.to_string();
            self.error_at_current(&msg);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error_at_current(&mut self, message: &str) {
        let tok = self.current;
        self.error_at(tok, message);
    }

    fn error(&mut self, message: &str) {
        let tok = self.previous;
        self.error_at(tok, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let source_line = self.scanner.current_line_text().to_string();
        let err = FalconError::compile(&self.file_name, token.line, token.column, message)
            .with_source_line(source_line);
        self.errors.push(err);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            use TokenKind::*;
            match self.current.kind {
                Class | Function | Var | For | If | While | Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    fn line(&self) -> usize {
        self.previous.line
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.fscope.function.chunk
    }

    // --- bytecode emission --------------------------------------------

    fn emit(&mut self, byte: u8) {
        let line = self.line();
        self.chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.line();
        self.chunk().write_op(op, line);
    }

    fn emit_two(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit(byte);
    }

    fn make_constant(&mut self, value: Value) -> usize {
        let index = self.chunk().add_constant(value);
        if index > MAX_CONSTANTS {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        if index < 256 {
            self.emit_op(OpCode::OP_CONSTANT);
            self.emit(index as u8);
        } else {
            self.emit_op(OpCode::OP_CONSTANT_16);
            let bytes = (index as u16).to_le_bytes();
            self.emit(bytes[0]);
            self.emit(bytes[1]);
        }
    }

    fn identifier_constant(&mut self, name: &str) -> usize {
        let r = self.heap.intern_copy(name);
        self.make_constant(Value::Obj(r))
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit(0xff);
        self.emit(0xff);
        self.chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.chunk().code.len() - offset - 2;
        if jump > MAX_JUMP {
            self.error("Jump distance too large.");
            return;
        }
        let bytes = (jump as u16).to_be_bytes();
        self.chunk().code[offset] = bytes[0];
        self.chunk().code[offset + 1] = bytes[1];
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::OP_LOOP);
        let offset = self.chunk().code.len() - loop_start + 2;
        if offset > MAX_JUMP {
            self.error("Loop body too large.");
        }
        let bytes = (offset as u16).to_be_bytes();
        self.emit(bytes[0]);
        self.emit(bytes[1]);
    }

    fn finish_function(&mut self) -> FunctionObj {
        self.emit_op(OpCode::OP_NULL);
        self.emit_op(OpCode::OP_RETURN);
        // Swap out a placeholder to take true ownership of the completed
        // function; the placeholder never reaches the heap.
        std::mem::replace(&mut self.fscope.function, FunctionObj::new_script())
    }

    // --- scope management ----------------------------------------------

    fn begin_scope(&mut self) {
        self.fscope.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.fscope.scope_depth -= 1;
        let depth = self.fscope.scope_depth;
        while let Some(local) = self.fscope.locals.last() {
            if local.depth <= depth {
                break;
            }
            if self.fscope.locals.last().unwrap().captured {
                self.emit_op(OpCode::OP_CLOSE_UPVALUE);
            } else {
                self.emit_op(OpCode::OP_POP);
            }
            self.fscope.locals.pop();
        }
    }

    fn declare_variable(&mut self, name: &str) {
        if self.fscope.scope_depth == 0 {
            return;
        }
        let depth = self.fscope.scope_depth;
        for local in self.fscope.locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                self.error("A variable with this name already exists in this scope.");
                return;
            }
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &str) {
        if self.fscope.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in one function.");
            return;
        }
        self.fscope.locals.push(Local { name: name.to_string(), depth: -1, captured: false });
    }

    fn mark_initialized(&mut self) {
        if self.fscope.scope_depth == 0 {
            return;
        }
        let depth = self.fscope.scope_depth;
        if let Some(local) = self.fscope.locals.last_mut() {
            local.depth = depth;
        }
    }

    /// Parses an identifier and, if at global scope, returns its constant
    /// index; locals don't need one.
    fn parse_variable(&mut self, message: &str) -> usize {
        self.consume(TokenKind::Identifier, message);
        let name = self.previous.lexeme.to_string();
        self.declare_variable(&name);
        if self.fscope.scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(&name)
    }

    fn define_variable(&mut self, global: usize) {
        if self.fscope.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_global_op(OpCode::OP_DEFINE_GLOBAL, global);
    }

    /// Name-constant operand (globals, properties, methods, `invoke`,
    /// `class`, `super`): always a fixed 2-byte little-endian index. Unlike
    /// `OP_CONSTANT`/`OP_CONSTANT_16` there is only one opcode per
    /// operation here, so the width can't be inferred from the opcode
    /// itself — fixing it at 2 bytes keeps decoding unambiguous while still
    /// covering the shared pool's full 65,535-entry range.
    fn emit_global_op(&mut self, op: OpCode, index: usize) {
        self.emit_op(op);
        let bytes = (index as u16).to_le_bytes();
        self.emit(bytes[0]);
        self.emit(bytes[1]);
    }

    fn resolve_local(scope: &FunctionScope, name: &str) -> Option<(usize, bool)> {
        for (i, local) in scope.locals.iter().enumerate().rev() {
            if local.name == name {
                return Some((i, local.depth != -1));
            }
        }
        None
    }

    fn resolve_upvalue(scope: &mut FunctionScope, name: &str) -> Option<usize> {
        let enclosing = scope.enclosing.as_mut()?;
        if let Some((index, ready)) = Self::resolve_local(enclosing, name) {
            if !ready {
                return None;
            }
            enclosing.locals[index].captured = true;
            return Some(Self::add_upvalue(scope, index as u8, true));
        }
        if let Some(index) = Self::resolve_upvalue(enclosing, name) {
            return Some(Self::add_upvalue(scope, index as u8, false));
        }
        None
    }

    fn add_upvalue(scope: &mut FunctionScope, index: u8, is_local: bool) -> usize {
        for (i, up) in scope.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i;
            }
        }
        scope.upvalues.push(UpvalueDesc { index, is_local });
        scope.function.upvalue_count = scope.upvalues.len() as u8;
        scope.upvalues.len() - 1
    }

    // --- statements ------------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else if self.match_token(TokenKind::Function) {
            self.function_declaration();
        } else if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    /// `var a, b = expr, c;` — a comma list, each clause with an optional
    /// initializer (defaults to `null`).
    fn var_declaration(&mut self) {
        loop {
            let global = self.parse_variable("Expect variable name.");
            if self.match_token(TokenKind::Equal) {
                self.expression();
            } else {
                self.emit_op(OpCode::OP_NULL);
            }
            self.define_variable(global);
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
    }

    fn function_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.compile_function(FunctionType::Function);
        self.define_variable(global);
    }

    fn compile_function(&mut self, ftype: FunctionType) {
        let name = self.previous.lexeme.to_string();
        let saved_loops = std::mem::take(&mut self.loops);
        let enclosing = std::mem::replace(&mut self.fscope, Box::new(FunctionScope::new(ftype, None)));
        self.fscope.enclosing = Some(enclosing);

        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.fscope.function.arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                self.fscope.function.arity += 1;
                let param = self.parse_variable("Expect parameter name.");
                self.define_variable(param);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let function = self.finish_function();
        let mut scope =
            std::mem::replace(&mut self.fscope, Box::new(FunctionScope::new(FunctionType::Script, None)));
        self.fscope = scope.enclosing.take().expect("function scope must have an enclosing scope");
        self.loops = saved_loops;

        let name_ref = self.heap.intern_copy(&name);
        let mut func = function;
        func.name = Some(name_ref);
        let upvalues: Vec<(u8, bool)> = scope.upvalues.iter().map(|u| (u.index, u.is_local)).collect();

        let func_ref = self.heap.new_function(func);
        self.emit_constant_closure(func_ref, &upvalues);
    }

    fn emit_constant_closure(&mut self, func_ref: crate::value::ObjRef, upvalues: &[(u8, bool)]) {
        let index = self.make_constant(Value::Obj(func_ref));
        if index < 256 {
            self.emit_op(OpCode::OP_CONSTANT);
            self.emit(index as u8);
        } else {
            self.emit_op(OpCode::OP_CONSTANT_16);
            let bytes = (index as u16).to_le_bytes();
            self.emit(bytes[0]);
            self.emit(bytes[1]);
        }
        self.emit_op(OpCode::OP_CLOSURE);
        for &(idx, is_local) in upvalues {
            self.emit(if is_local { 1 } else { 0 });
            self.emit(idx);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme.to_string();
        let name_constant = self.identifier_constant(&class_name);
        self.declare_variable(&class_name);

        self.emit_global_op(OpCode::OP_CLASS, name_constant);
        self.define_variable(name_constant);

        let mut class_scope =
            Box::new(ClassScope { enclosing: self.cscope.take(), has_superclass: false });

        if self.match_token(TokenKind::Extends) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.previous.lexeme.to_string();
            if super_name == class_name {
                self.error("A class can't inherit from itself.");
            }
            self.named_variable(&super_name, false); // pushes the superclass value
            self.begin_scope();
            self.add_local("super");
            self.mark_initialized();
            self.named_variable(&class_name, false);
            self.emit_op(OpCode::OP_INHERIT);
            class_scope.has_superclass = true;
        }
        self.cscope = Some(class_scope);

        self.named_variable(&class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::OP_POP); // the class value pushed above

        let finished = self.cscope.take().expect("class scope active");
        if finished.has_superclass {
            self.end_scope();
        }
        self.cscope = finished.enclosing;
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme.to_string();
        let constant = self.identifier_constant(&name);
        let ftype = if name == "init" { FunctionType::Init } else { FunctionType::Method };
        self.compile_function(ftype);
        self.emit_global_op(OpCode::OP_METHOD, constant);
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Switch) {
            self.switch_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::Next) {
            self.next_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else {
            self.expression_statement();
        }
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        // At the REPL top level an expression statement's value is echoed
        // back; inside a script it's simply discarded.
        if self.repl_mode && self.fscope.ftype == FunctionType::Script && self.fscope.scope_depth == 0 {
            self.emit_op(OpCode::OP_POP_EXPR);
        } else {
            self.emit_op(OpCode::OP_POP);
        }
    }

    fn if_statement(&mut self) {
        self.expression();
        let then_jump = self.emit_jump(OpCode::OP_JUMP_IF_FALSE);
        self.emit_op(OpCode::OP_POP);
        self.statement();

        let else_jump = self.emit_jump(OpCode::OP_JUMP);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::OP_POP);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    /// `switch { when expr -> stmt; … else -> stmt }` — a chain of boolean
    /// guards, not a value-match: each `when` clause's expression must
    /// itself evaluate to a condition.
    fn switch_statement(&mut self) {
        self.consume(TokenKind::LeftBrace, "Expect '{' after 'switch'.");
        let mut end_jumps = Vec::new();

        while self.match_token(TokenKind::When) {
            self.expression();
            self.consume(TokenKind::Arrow, "Expect '->' after 'when' condition.");
            let next_jump = self.emit_jump(OpCode::OP_JUMP_IF_FALSE);
            self.emit_op(OpCode::OP_POP);
            self.statement();
            self.match_token(TokenKind::Semicolon);
            end_jumps.push(self.emit_jump(OpCode::OP_JUMP));
            self.patch_jump(next_jump);
            self.emit_op(OpCode::OP_POP);
        }

        if self.match_token(TokenKind::Else) {
            self.consume(TokenKind::Arrow, "Expect '->' after 'else'.");
            self.statement();
            self.match_token(TokenKind::Semicolon);
        }

        for jump in end_jumps {
            self.patch_jump(jump);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after 'switch' body.");
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().code.len();
        self.loops.push(LoopScope {
            start: loop_start,
            scope_depth: self.fscope.scope_depth,
            break_jumps: Vec::new(),
        });

        self.expression();
        let exit_jump = self.emit_jump(OpCode::OP_JUMP_IF_FALSE);
        self.emit_op(OpCode::OP_POP);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::OP_POP);
        self.finish_loop();
    }

    /// `for <init>, <condition>, <increment> { body }`. `init` is either an
    /// implicit local declaration (`i = 0`) or a bare expression statement;
    /// `body` is always a brace block.
    fn for_statement(&mut self) {
        self.begin_scope();

        if self.check(TokenKind::Identifier) {
            let name = self.current.lexeme.to_string();
            // One token of lookahead: `ident = ...` declares a loop-scoped
            // local; anything else is a bare init expression.
            let checkpoint = (self.current, self.previous);
            self.advance();
            if self.match_token(TokenKind::Equal) {
                self.declare_variable(&name);
                self.expression();
                self.mark_initialized();
            } else {
                self.current = checkpoint.0;
                self.previous = checkpoint.1;
                self.expression();
                self.emit_op(OpCode::OP_POP);
            }
        } else {
            self.expression();
            self.emit_op(OpCode::OP_POP);
        }
        self.consume(TokenKind::Comma, "Expect ',' after 'for' initializer.");

        let mut loop_start = self.chunk().code.len();
        self.expression();
        let exit_jump = self.emit_jump(OpCode::OP_JUMP_IF_FALSE);
        self.emit_op(OpCode::OP_POP);
        self.consume(TokenKind::Comma, "Expect ',' after 'for' condition.");

        let body_jump = self.emit_jump(OpCode::OP_JUMP);
        let increment_start = self.chunk().code.len();
        self.expression();
        self.emit_op(OpCode::OP_POP);
        self.emit_loop(loop_start);
        loop_start = increment_start;
        self.patch_jump(body_jump);

        self.loops.push(LoopScope {
            start: loop_start,
            scope_depth: self.fscope.scope_depth,
            break_jumps: Vec::new(),
        });

        self.consume(TokenKind::LeftBrace, "Expect '{' to start 'for' body.");
        self.begin_scope();
        self.block();
        self.end_scope();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::OP_POP);
        self.finish_loop();

        self.end_scope();
    }

    fn finish_loop(&mut self) {
        let loop_scope = self.loops.pop().expect("loop scope active");
        for jump in loop_scope.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn return_statement(&mut self) {
        if self.fscope.ftype == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_op(OpCode::OP_NULL);
            self.emit_op(OpCode::OP_RETURN);
            return;
        }
        if self.fscope.ftype == FunctionType::Init {
            self.error("Can't return a value from an 'init' method.");
        }
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
        self.emit_op(OpCode::OP_RETURN);
    }

    fn next_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'next'.");
        let Some(loop_scope) = self.loops.last() else {
            self.error("Can't use 'next' outside a loop.");
            return;
        };
        let (start, depth) = (loop_scope.start, loop_scope.scope_depth);
        self.pop_locals_above(depth);
        self.emit_loop(start);
    }

    fn break_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        if self.loops.is_empty() {
            self.error("Can't use 'break' outside a loop.");
            return;
        }
        let depth = self.loops.last().unwrap().scope_depth;
        self.pop_locals_above(depth);
        let jump = self.emit_jump(OpCode::OP_JUMP);
        self.loops.last_mut().unwrap().break_jumps.push(jump);
    }

    fn pop_locals_above(&mut self, depth: i32) {
        for local in self.fscope.locals.iter().rev() {
            if local.depth <= depth {
                break;
            }
            if local.captured {
                self.emit_op(OpCode::OP_CLOSE_UPVALUE);
            } else {
                self.emit_op(OpCode::OP_POP);
            }
        }
    }

    // --- expressions -------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assign);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = get_rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Ternary;
        prefix(self, can_assign);

        while precedence <= get_rule(self.current.kind).precedence {
            self.advance();
            let infix = get_rule(self.previous.kind).infix.expect("infix rule must exist");
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Num(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let raw = self.previous.lexeme;
        let text = &raw[1..raw.len() - 1];
        let r = self.heap.intern_copy(text);
        self.emit_constant(Value::Obj(r));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::True => self.emit_op(OpCode::OP_TRUE),
            TokenKind::False => self.emit_op(OpCode::OP_FALSE),
            TokenKind::Null => self.emit_op(OpCode::OP_NULL),
            _ => unreachable!(),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Minus => self.emit_op(OpCode::OP_NEGATE),
            TokenKind::Bang => self.emit_op(OpCode::OP_NOT),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op_kind = self.previous.kind;
        let rule = get_rule(op_kind);
        // Right-associative only for `^`; everything else is left-assoc.
        let next_prec =
            if op_kind == TokenKind::Caret { rule.precedence } else { rule.precedence.next() };
        self.parse_precedence(next_prec);
        match op_kind {
            TokenKind::Plus => self.emit_op(OpCode::OP_ADD),
            TokenKind::Minus => self.emit_op(OpCode::OP_SUBTRACT),
            TokenKind::Star => self.emit_op(OpCode::OP_MULTIPLY),
            TokenKind::Slash => self.emit_op(OpCode::OP_DIVIDE),
            TokenKind::Percent => self.emit_op(OpCode::OP_MODULO),
            TokenKind::Caret => self.emit_op(OpCode::OP_POW),
            TokenKind::BangEqual => self.emit_op(OpCode::OP_NOT_EQUAL),
            TokenKind::EqualEqual => self.emit_op(OpCode::OP_EQUAL),
            TokenKind::Greater => self.emit_op(OpCode::OP_GREATER),
            TokenKind::GreaterEqual => self.emit_op(OpCode::OP_GREATER_EQUAL),
            TokenKind::Less => self.emit_op(OpCode::OP_LESS),
            TokenKind::LessEqual => self.emit_op(OpCode::OP_LESS_EQUAL),
            _ => unreachable!(),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::OP_JUMP_IF_FALSE);
        self.emit_op(OpCode::OP_POP);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::OP_JUMP_IF_FALSE);
        let end_jump = self.emit_jump(OpCode::OP_JUMP);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::OP_POP);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn ternary(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::OP_JUMP_IF_FALSE);
        self.emit_op(OpCode::OP_POP);
        self.parse_precedence(Precedence::Assign);
        let end_jump = self.emit_jump(OpCode::OP_JUMP);
        self.consume(TokenKind::Colon, "Expect ':' in ternary expression.");
        self.patch_jump(else_jump);
        self.emit_op(OpCode::OP_POP);
        self.parse_precedence(Precedence::Ternary);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list(TokenKind::RightParen);
        self.emit_two(OpCode::OP_CALL, argc);
    }

    fn argument_list(&mut self, closing: TokenKind) -> u8 {
        let mut count: u16 = 0;
        if !self.check(closing) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(closing, "Expect closing delimiter after arguments.");
        count as u8
    }

    fn list(&mut self, _can_assign: bool) {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                count += 1;
                if count > 65_535 {
                    self.error("Too many elements in list literal.");
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after list elements.");
        self.emit_op(OpCode::OP_LIST);
        let bytes = (count as u16).to_le_bytes();
        self.emit(bytes[0]);
        self.emit(bytes[1]);
    }

    fn map_literal(&mut self, _can_assign: bool) {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightBrace) {
            loop {
                self.expression();
                self.consume(TokenKind::Colon, "Expect ':' after map key.");
                self.expression();
                count += 1;
                if count > 65_535 {
                    self.error("Too many entries in map literal.");
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after map entries.");
        self.emit_op(OpCode::OP_MAP);
        let bytes = (count as u16).to_le_bytes();
        self.emit(bytes[0]);
        self.emit(bytes[1]);
    }

    fn subscript(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']' after subscript index.");

        if can_assign && self.match_assignment_operator() {
            let op = self.previous.kind;
            if op == TokenKind::Equal {
                self.expression();
                self.emit_op(OpCode::OP_INDEX_SET);
            } else {
                // stack: receiver, index -> duplicate both so INDEX_GET can
                // consume one pair and INDEX_SET still has its own.
                self.emit_op(OpCode::OP_DUP2);
                self.emit_op(OpCode::OP_INDEX_GET);
                self.expression();
                self.emit_compound_op(op);
                self.emit_op(OpCode::OP_INDEX_SET);
            }
        } else {
            self.emit_op(OpCode::OP_INDEX_GET);
        }
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.to_string();
        let constant = self.identifier_constant(&name);

        if can_assign && self.match_assignment_operator() {
            let op = self.previous.kind;
            if op == TokenKind::Equal {
                self.expression();
                self.emit_global_op(OpCode::OP_SET_PROPERTY, constant);
            } else {
                self.emit_op(OpCode::OP_DUP);
                self.emit_global_op(OpCode::OP_GET_PROPERTY, constant);
                self.expression();
                self.emit_compound_op(op);
                self.emit_global_op(OpCode::OP_SET_PROPERTY, constant);
            }
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list(TokenKind::RightParen);
            self.emit_global_op(OpCode::OP_INVOKE, constant);
            self.emit(argc);
        } else {
            self.emit_global_op(OpCode::OP_GET_PROPERTY, constant);
        }
    }

    fn match_assignment_operator(&mut self) -> bool {
        use TokenKind::*;
        for kind in [Equal, PlusEqual, MinusEqual, StarEqual, SlashEqual, PercentEqual, CaretEqual] {
            if self.match_token(kind) {
                return true;
            }
        }
        false
    }

    fn emit_compound_op(&mut self, op: TokenKind) {
        use TokenKind::*;
        match op {
            PlusEqual => self.emit_op(OpCode::OP_ADD),
            MinusEqual => self.emit_op(OpCode::OP_SUBTRACT),
            StarEqual => self.emit_op(OpCode::OP_MULTIPLY),
            SlashEqual => self.emit_op(OpCode::OP_DIVIDE),
            PercentEqual => self.emit_op(OpCode::OP_MODULO),
            CaretEqual => self.emit_op(OpCode::OP_POW),
            _ => unreachable!(),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.to_string();
        self.named_variable(&name, can_assign);
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let (get_op, set_op, arg);
        if let Some((index, ready)) = Self::resolve_local(&self.fscope, name) {
            if !ready {
                self.error("Can't read local variable in its own initializer.");
            }
            arg = index;
            get_op = OpCode::OP_GET_LOCAL;
            set_op = OpCode::OP_SET_LOCAL;
        } else if let Some(index) = Self::resolve_upvalue(&mut self.fscope, name) {
            arg = index;
            get_op = OpCode::OP_GET_UPVALUE;
            set_op = OpCode::OP_SET_UPVALUE;
        } else {
            arg = self.identifier_constant(name);
            get_op = OpCode::OP_GET_GLOBAL;
            set_op = OpCode::OP_SET_GLOBAL;
        }

        if can_assign && self.match_assignment_operator() {
            let op = self.previous.kind;
            if op == TokenKind::Equal {
                self.expression();
            } else {
                self.emit_global_op(get_op, arg);
                self.expression();
                self.emit_compound_op(op);
            }
            self.emit_global_op(set_op, arg);
        } else {
            self.emit_global_op(get_op, arg);
        }
    }

    fn this(&mut self, _can_assign: bool) {
        if self.fscope.ftype != FunctionType::Method && self.fscope.ftype != FunctionType::Init {
            self.error("Can't use 'this' outside a method.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match &self.cscope {
            None => self.error("Can't use 'super' outside a class."),
            Some(c) if !c.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.")
            }
            _ => {}
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.previous.lexeme.to_string();
        let constant = self.identifier_constant(&name);

        self.named_variable("this", false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list(TokenKind::RightParen);
            self.named_variable("super", false);
            self.emit_global_op(OpCode::OP_SUPER_INVOKE, constant);
            self.emit(argc);
        } else {
            self.named_variable("super", false);
            self.emit_global_op(OpCode::OP_GET_SUPER, constant);
        }
    }
}
