//! Single-pass Pratt compiler.
//!
//! Parses and emits bytecode in one pass: a stack of
//! function builders (one per nested function literal), a class context
//! stack for `this`/`super` legality, and panic-mode error recovery
//! that synchronizes at statement boundaries.
//!
//! Collector discipline: chunks are built in plain memory; a function
//! becomes a collector-managed object only in `end_builder`, once its
//! chunk is finished and immutable. Until then, every managed constant
//! the compiler creates (interned strings, completed inner functions)
//! sits on the mutator root list so a concurrent cycle cannot reclaim
//! it; [`compile`] restores the root list on exit.

use crate::scanner::{Scanner, Token, TokenKind};
use qet_core::{Chunk, OpCode, Value};
use qet_gc::{self as gc, Gc, ObjRef, SNode};
use qet_runtime::ObjFunction;
use smallvec::SmallVec;

/// Compilation failure: the collected diagnostics, in source order.
#[derive(Debug)]
pub struct CompileError {
    pub diagnostics: Vec<String>,
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, diag) in self.diagnostics.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", diag)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

/// Expression binding strength, weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Call,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Function,
    Initializer,
    Method,
    Script,
}

/// A local variable slot in the function being compiled.
struct Local<'src> {
    name: &'src str,
    /// Scope depth, or -1 while the initializer is still being compiled.
    depth: i32,
    is_captured: bool,
}

/// An upvalue descriptor: a slot in the enclosing function's locals or
/// upvalues.
#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueSlot {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state.
struct FunctionBuilder<'src> {
    ftype: FunctionType,
    name: Option<Gc<SNode>>,
    arity: u8,
    chunk: Chunk,
    locals: SmallVec<[Local<'src>; 8]>,
    upvalues: SmallVec<[UpvalueSlot; 8]>,
    scope_depth: i32,
}

struct ClassContext {
    has_superclass: bool,
}

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Compile a source string into its top-level function.
///
/// Must be called from an entered mutator.
pub fn compile(source: &str) -> Result<Gc<ObjFunction>, CompileError> {
    let root_base = gc::roots_len();
    let mut parser = Parser::new(source);
    parser.push_builder(FunctionType::Script);

    parser.advance();
    while !parser.match_token(TokenKind::Eof) {
        parser.declaration();
    }
    let (function, _) = parser.end_builder();

    let result = if parser.had_error {
        Err(CompileError {
            diagnostics: parser.diagnostics,
        })
    } else {
        Ok(function)
    };
    gc::truncate_roots(root_base);
    result
}

struct Parser<'src> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<String>,
    builders: Vec<FunctionBuilder<'src>>,
    classes: Vec<ClassContext>,
}

impl<'src> Parser<'src> {
    fn new(source: &'src str) -> Parser<'src> {
        let placeholder = Token {
            kind: TokenKind::Eof,
            text: "",
            line: 1,
        };
        Parser {
            scanner: Scanner::new(source),
            current: placeholder,
            previous: placeholder,
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            builders: Vec::new(),
            classes: Vec::new(),
        }
    }

    // -------------------------------------------------------------------
    // Builder stack
    // -------------------------------------------------------------------

    fn builder(&self) -> &FunctionBuilder<'src> {
        self.builders.last().expect("builder stack is never empty")
    }

    fn builder_mut(&mut self) -> &mut FunctionBuilder<'src> {
        self.builders
            .last_mut()
            .expect("builder stack is never empty")
    }

    fn push_builder(&mut self, ftype: FunctionType) {
        let name = if ftype != FunctionType::Script {
            let name = gc::intern(self.previous.text.as_bytes());
            gc::push_root(name.erase());
            Some(name)
        } else {
            None
        };
        let mut locals: SmallVec<[Local<'src>; 8]> = SmallVec::new();
        // Slot zero belongs to the callee: the receiver in methods,
        // unnameable otherwise.
        locals.push(Local {
            name: if ftype == FunctionType::Function {
                ""
            } else {
                "this"
            },
            depth: 0,
            is_captured: false,
        });
        self.builders.push(FunctionBuilder {
            ftype,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals,
            upvalues: SmallVec::new(),
            scope_depth: 0,
        });
    }

    fn end_builder(&mut self) -> (Gc<ObjFunction>, SmallVec<[UpvalueSlot; 8]>) {
        self.emit_return();
        let builder = self.builders.pop().expect("builder stack is never empty");
        let function = ObjFunction::new(
            builder.arity,
            builder.upvalues.len() as u8,
            builder.chunk,
            builder.name,
        );
        (function, builder.upvalues)
    }

    // -------------------------------------------------------------------
    // Token plumbing and error reporting
    // -------------------------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let token = self.current;
            self.error_at(token, token.text);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        let token = self.current;
        self.error_at(token, message);
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

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let location = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.text),
        };
        self.diagnostics
            .push(format!("[line {}] Error{}: {}", token.line, location, message));
        self.had_error = true;
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // -------------------------------------------------------------------
    // Bytecode emission
    // -------------------------------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.builder_mut().chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_op_byte(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.builder().chunk.code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte(offset as u8);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.builder().chunk.code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 accounts for the jump operand itself.
        let jump = self.builder().chunk.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let code = &mut self.builder_mut().chunk.code;
        code[offset] = (jump >> 8) as u8;
        code[offset + 1] = jump as u8;
    }

    fn emit_return(&mut self) {
        if self.builder().ftype == FunctionType::Initializer {
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        // Managed constants live in plain chunk memory until the
        // function object exists; root them for the duration.
        if let Some(obj) = ObjRef::from_value(value) {
            gc::push_root(obj);
        }
        match self.builder_mut().chunk.add_constant(value) {
            Some(index) => index,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op_byte(OpCode::Constant, constant);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = gc::intern(name.as_bytes());
        self.make_constant(interned.as_value())
    }

    // -------------------------------------------------------------------
    // Variable resolution
    // -------------------------------------------------------------------

    fn resolve_local(&mut self, builder_index: usize, name: &str) -> Option<u8> {
        let count = self.builders[builder_index].locals.len();
        for i in (0..count).rev() {
            if self.builders[builder_index].locals[i].name == name {
                if self.builders[builder_index].locals[i].depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn add_upvalue(&mut self, builder_index: usize, index: u8, is_local: bool) -> u8 {
        let slot = UpvalueSlot { index, is_local };
        if let Some(existing) = self.builders[builder_index]
            .upvalues
            .iter()
            .position(|&uv| uv == slot)
        {
            return existing as u8;
        }
        if self.builders[builder_index].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.builders[builder_index].upvalues.push(slot);
        (self.builders[builder_index].upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, builder_index: usize, name: &str) -> Option<u8> {
        if builder_index == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(builder_index - 1, name) {
            self.builders[builder_index - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(builder_index, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(builder_index - 1, name) {
            return Some(self.add_upvalue(builder_index, upvalue, false));
        }
        None
    }

    fn add_local(&mut self, name: &'src str) {
        if self.builder().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.builder_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.builder().scope_depth == 0 {
            return;
        }
        let name = self.previous.text;
        let mut duplicate = false;
        {
            let builder = self.builder();
            for local in builder.locals.iter().rev() {
                if local.depth != -1 && local.depth < builder.scope_depth {
                    break;
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.builder().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.text;
        self.identifier_constant(name)
    }

    fn mark_initialized(&mut self) {
        let builder = self.builder_mut();
        if builder.scope_depth == 0 {
            return;
        }
        let depth = builder.scope_depth;
        if let Some(local) = builder.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.builder().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    fn begin_scope(&mut self) {
        self.builder_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.builder_mut().scope_depth -= 1;
        loop {
            let builder = self.builder();
            let Some(local) = builder.locals.last() else {
                break;
            };
            if local.depth <= builder.scope_depth {
                break;
            }
            let captured = local.is_captured;
            self.builder_mut().locals.pop();
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    // -------------------------------------------------------------------
    // Declarations and statements
    // -------------------------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name.text);
        self.declare_variable();

        self.emit_op_byte(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassContext {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name.text == self.previous.text {
                self.error("A class can't inherit from itself.");
            }

            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes
                .last_mut()
                .expect("class context just pushed")
                .has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        let has_superclass = self
            .classes
            .last()
            .expect("class context just pushed")
            .has_superclass;
        if has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.previous.text);
        let ftype = if self.previous.text == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(ftype);
        self.emit_op_byte(OpCode::Method, constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, ftype: FunctionType) {
        self.push_builder(ftype);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.builder().arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.builder_mut().arity += 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_builder();
        let constant = self.make_constant(function.as_value());
        self.emit_op_byte(OpCode::Closure, constant);
        for uv in upvalues {
            self.emit_byte(uv.is_local as u8);
            self.emit_byte(uv.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn return_statement(&mut self) {
        if self.builder().ftype == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.builder().ftype == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.builder().chunk.code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.builder().chunk.code.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.builder().chunk.code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }

        self.end_scope();
    }

    // -------------------------------------------------------------------
    // Expressions
    // -------------------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }

        while precedence <= Self::precedence_of(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn precedence_of(kind: TokenKind) -> Precedence {
        match kind {
            TokenKind::LeftParen | TokenKind::Dot => Precedence::Call,
            TokenKind::Minus | TokenKind::Plus => Precedence::Term,
            TokenKind::Slash | TokenKind::Star => Precedence::Factor,
            TokenKind::BangEqual | TokenKind::EqualEqual => Precedence::Equality,
            TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => Precedence::Comparison,
            TokenKind::And => Precedence::And,
            TokenKind::Or => Precedence::Or,
            _ => Precedence::None,
        }
    }

    /// Dispatch a prefix parse for `kind`; false when the token starts
    /// no expression.
    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::String => self.string_literal(),
            TokenKind::Number => self.number(),
            TokenKind::False | TokenKind::Nil | TokenKind::True => self.literal(),
            TokenKind::Super => self.super_(),
            TokenKind::This => self.this_(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::LeftParen => self.call(),
            TokenKind::Dot => self.dot(can_assign),
            TokenKind::And => self.and_(),
            TokenKind::Or => self.or_(),
            _ => self.binary(),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            _ => unreachable!("unary dispatched on non-unary token"),
        }
    }

    fn binary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(Self::precedence_of(operator).next());
        match operator {
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!("binary dispatched on non-binary token"),
        }
    }

    fn and_(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);

        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_op_byte(OpCode::Call, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.text);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(OpCode::SetProperty, name);
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op_byte(OpCode::Invoke, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_op_byte(OpCode::GetProperty, name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                count += 1;
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(255) as u8
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!("literal dispatched on non-literal token"),
        }
    }

    fn number(&mut self) {
        let parsed = self.previous.text.parse::<i64>().ok().and_then(Value::int);
        match parsed {
            Some(value) => self.emit_constant(value),
            None => self.error("Integer constant out of range."),
        }
    }

    fn string_literal(&mut self) {
        let text = self.previous.text;
        let contents = &text[1..text.len() - 1];
        let interned = gc::intern(contents.as_bytes());
        self.emit_constant(interned.as_value());
    }

    fn variable(&mut self, can_assign: bool) {
        let token = self.previous;
        self.named_variable(token, can_assign);
    }

    fn named_variable(&mut self, token: Token<'src>, can_assign: bool) {
        let top = self.builders.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(top, token.text) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(index) = self.resolve_upvalue(top, token.text) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, index)
        } else {
            let constant = self.identifier_constant(token.text);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    fn this_(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().expect("non-empty").has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.text);

        self.named_variable(Token::synthetic("this"), false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(Token::synthetic("super"), false);
            self.emit_op_byte(OpCode::SuperInvoke, name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(Token::synthetic("super"), false);
            self.emit_op_byte(OpCode::GetSuper, name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_mutator<R>(f: impl FnOnce() -> R) -> R {
        qet_gc::enter();
        let result = f();
        qet_gc::leave();
        result
    }

    #[test]
    fn test_compile_expression_statement() {
        with_mutator(|| {
            let function = compile("1 + 2 * 3;").expect("compiles");
            assert_eq!(function.arity, 0);
            assert!(function.name.is_none());
            assert!(!function.chunk.code.is_empty());
        });
    }

    #[test]
    fn test_compile_full_language_surface() {
        with_mutator(|| {
            let source = r#"
                class Counter {
                    init(start) { this.n = start; }
                    bump() { this.n = this.n + 1; return this.n; }
                }
                class Loud < Counter {
                    bump() { print "bump"; return super.bump(); }
                }
                fun twice(f) { f(); f(); }
                var c = Loud(10);
                twice(c.bump);
                for (var i = 0; i < 3; i = i + 1) { print i; }
                while (false) { print "never"; }
                if (c.n > 10 and true or false) { print c; } else { print !true; }
            "#;
            let function = compile(source).expect("compiles");
            assert!(function.chunk.constants.len() > 4);
        });
    }

    #[test]
    fn test_compile_error_reports_line() {
        with_mutator(|| {
            let err = compile("var;").expect_err("missing identifier");
            assert!(err.diagnostics[0].contains("[line 1]"));
            assert!(err.diagnostics[0].contains("Expect variable name."));
        });
    }

    #[test]
    fn test_error_recovery_collects_multiple() {
        with_mutator(|| {
            let err = compile("var; var x = 1 print x;").expect_err("two errors");
            assert!(err.diagnostics.len() >= 2);
        });
    }

    #[test]
    fn test_return_outside_function_rejected() {
        with_mutator(|| {
            assert!(compile("return 1;").is_err());
        });
    }

    #[test]
    fn test_this_outside_class_rejected() {
        with_mutator(|| {
            assert!(compile("print this;").is_err());
        });
    }

    #[test]
    fn test_integer_overflow_rejected() {
        with_mutator(|| {
            assert!(compile("print 99999999999999999999;").is_err());
        });
    }

    #[test]
    fn test_roots_restored_after_compile() {
        with_mutator(|| {
            let before = qet_gc::roots_len();
            let _ = compile("var a = \"hello\";");
            assert_eq!(qet_gc::roots_len(), before);
        });
    }
}
