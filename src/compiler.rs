use super::chunk::OpCode;
use super::error::CompileError;
use super::intern::StringInterner;
use super::scanner::Scanner;
use super::token::{Token, TokenType};
use super::value::{LoxFunction, Object, UpvalueSlot, Value};
use std::rc::Rc;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_PARAMS: usize = 255;
const MAX_ARGS: usize = 255;
const MAX_JUMP: usize = u16::MAX as usize;

/// Precedence ladder, lowest to highest. Declaration order doubles as the
/// `Ord` the derive generates, so `parse_precedence`'s infix loop condition
/// (`precedence <= rule_precedence`) is a plain comparison.
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
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

/// Infix binding power of every token type; tokens with no infix role
/// (most of them) sit at `Precedence::None`, which trivially fails the
/// `parse_precedence` loop condition.
fn infix_precedence(typ: TokenType) -> Precedence {
    use Precedence::*;
    use TokenType::*;
    match typ {
        LeftParen => Call,
        Minus | Plus => Term,
        Slash | Star => Factor,
        BangEqual | EqualEqual => Equality,
        Greater | GreaterEqual | Less | LessEqual => Comparison,
        And => Precedence::And,
        Or => Precedence::Or,
        _ => None,
    }
}

/// A block-scoped local variable slot. `depth == -1` marks "declared but
/// its initializer hasn't run yet" -- the uninitialized-local sentinel
/// that turns `var a = a;` into a compile error.
struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
}

enum FunctionType {
    Script,
    Function,
}

/// Per-function compilation state: the [`LoxFunction`] under construction,
/// its local-variable table, and its upvalue table. A new one is pushed
/// for every nested `fun`, forming the "stack of compiler frames" the
/// spec describes; `Compiler::states` is that stack.
struct CompilerState<'src> {
    function: LoxFunction,
    function_type: FunctionType,
    locals: Vec<Local<'src>>,
    scope_depth: i32,
    upvalues: Vec<UpvalueSlot>,
}

impl<'src> CompilerState<'src> {
    fn new(name: Option<Rc<str>>, function_type: FunctionType) -> Self {
        // Slot 0 is reserved for the running closure itself, matching the
        // calling convention the VM uses to find `argc` on the stack.
        let locals = vec![Local {
            name: "",
            depth: 0,
            is_captured: false,
        }];
        Self {
            function: LoxFunction::new(name),
            function_type,
            locals,
            scope_depth: 0,
            upvalues: vec![],
        }
    }
}

struct Parser<'src> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    panic_mode: bool,
    errors: Vec<CompileError>,
}

impl<'src> Parser<'src> {
    fn new(source: &'src str) -> Self {
        let mut scanner = Scanner::new(source);
        let first = scanner.scan_token();
        Self {
            scanner,
            current: first,
            previous: first,
            panic_mode: false,
            errors: vec![],
        }
    }

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.typ != TokenType::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at_current(&message);
        }
    }

    fn check(&self, typ: TokenType) -> bool {
        self.current.typ == typ
    }

    fn matches(&mut self, typ: TokenType) -> bool {
        if !self.check(typ) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, typ: TokenType, message: &str) {
        if self.current.typ == typ {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(CompileError::at(&token, message));
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.typ != TokenType::Eof {
            if self.previous.typ == TokenType::Semicolon {
                return;
            }
            match self.current.typ {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return => return,
                _ => self.advance(),
            }
        }
    }
}

/// Drives the scanner straight into bytecode in a single forward pass: no
/// intermediate AST is ever built. `states` holds one [`CompilerState`]
/// per function currently being compiled, innermost last.
pub struct Compiler<'src, 'i> {
    parser: Parser<'src>,
    states: Vec<CompilerState<'src>>,
    interner: &'i mut StringInterner,
}

pub fn compile(source: &str, interner: &mut StringInterner) -> Result<LoxFunction, Vec<CompileError>> {
    let mut compiler = Compiler {
        parser: Parser::new(source),
        states: vec![CompilerState::new(None, FunctionType::Script)],
        interner,
    };

    while !compiler.parser.matches(TokenType::Eof) {
        compiler.declaration();
    }

    let function = compiler.end_function();
    if compiler.parser.errors.is_empty() {
        Ok(function)
    } else {
        Err(compiler.parser.errors)
    }
}

impl<'src, 'i> Compiler<'src, 'i> {
    fn state(&self) -> &CompilerState<'src> {
        self.states.last().expect("at least the script frame")
    }

    fn state_mut(&mut self) -> &mut CompilerState<'src> {
        self.states.last_mut().expect("at least the script frame")
    }

    fn line(&self) -> u32 {
        self.parser.previous.line
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        self.state_mut().function.chunk.write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.line();
        self.state_mut().function.chunk.write_op(op, line);
    }

    fn emit_indexed(&mut self, short: OpCode, long: OpCode, index: usize) {
        if index <= u8::MAX as usize {
            self.emit_op(short);
            self.emit_byte(index as u8);
        } else {
            self.emit_op(long);
            let bytes = (index as u16).to_be_bytes();
            self.emit_byte(bytes[0]);
            self.emit_byte(bytes[1]);
        }
    }

    fn make_constant(&mut self, value: Value) -> usize {
        match self.state_mut().function.chunk.add_constant(value) {
            Ok(idx) => idx,
            Err(()) => {
                self.parser.error("Too many constants in one chunk.");
                0
            }
        }
    }

    /// Interns `text` through the shared VM string table (so identical
    /// bytes anywhere in the program collapse to one `Rc<str>`), then
    /// deduplicates against this function's own constant pool so repeated
    /// references to the same name/literal inside one function don't
    /// bloat its pool with repeat entries.
    fn string_constant(&mut self, text: &str) -> usize {
        let interned = self.interner.intern(text);
        let chunk = &self.state().function.chunk;
        for i in 0..chunk.constants_len() {
            if let Some(existing) = chunk.constant(i).as_string() {
                if Rc::ptr_eq(existing, &interned) {
                    return i;
                }
            }
        }
        self.make_constant(Value::string(interned))
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_indexed(OpCode::Constant, OpCode::ConstantLong, idx);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        let line = self.line();
        self.state_mut().function.chunk.write_jump(op, line)
    }

    fn patch_jump(&mut self, offset: usize) {
        if self.state_mut().function.chunk.patch_jump(offset).is_err() {
            self.parser.error("Too much code to jump over.");
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.line();
        if self
            .state_mut()
            .function
            .chunk
            .write_loop(loop_start, line)
            .is_err()
        {
            self.parser.error("Loop body too large.");
        }
    }

    fn emit_return(&mut self) {
        self.emit_op(OpCode::Nil);
        self.emit_op(OpCode::Return);
    }

    fn end_function(&mut self) -> LoxFunction {
        self.emit_return();
        let state = self.states.pop().expect("ending an open function");
        state.function
    }

    // ---- scopes ----

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;
        let depth = self.state().scope_depth;
        while let Some(local) = self.state().locals.last() {
            if local.depth <= depth {
                break;
            }
            if local.is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.state_mut().locals.pop();
        }
    }

    // ---- variables ----

    fn identifiers_equal(a: &str, b: &str) -> bool {
        a == b
    }

    fn resolve_local(state: &CompilerState<'src>, name: &str) -> Option<u8> {
        for (i, local) in state.locals.iter().enumerate().rev() {
            if Self::identifiers_equal(local.name, name) {
                return Some(i as u8);
            }
        }
        None
    }

    fn add_upvalue(state: &mut CompilerState<'src>, slot: UpvalueSlot) -> Option<u8> {
        for (i, existing) in state.upvalues.iter().enumerate() {
            if *existing == slot {
                return Some(i as u8);
            }
        }
        if state.upvalues.len() >= MAX_UPVALUES {
            return None;
        }
        state.upvalues.push(slot);
        state.function.upvalue_count = state.upvalues.len();
        Some((state.upvalues.len() - 1) as u8)
    }

    /// Resolves `name` against the enclosing-function chain. `states` is
    /// the suffix of the compiler's frame stack from some outer function
    /// through the function currently resolving the name (last element).
    /// Recursing on a shrinking mutable slice sidesteps aliasing issues
    /// that a direct parent pointer would run into under the borrow
    /// checker, while preserving the same walk clox does with explicit
    /// `enclosing` pointers.
    fn resolve_upvalue(states: &mut [CompilerState<'src>], name: &str) -> Option<u8> {
        if states.len() < 2 {
            return None;
        }
        let split = states.len() - 1;
        let (enclosing, current) = states.split_at_mut(split);
        let enclosing_top = enclosing.len() - 1;

        if let Some(local_slot) = Self::resolve_local(&enclosing[enclosing_top], name) {
            enclosing[enclosing_top].locals[local_slot as usize].is_captured = true;
            return Self::add_upvalue(&mut current[0], UpvalueSlot::Local(local_slot));
        }

        if let Some(up_slot) = Self::resolve_upvalue(enclosing, name) {
            return Self::add_upvalue(&mut current[0], UpvalueSlot::Upvalue(up_slot));
        }

        None
    }

    fn declare_variable(&mut self, name: &'src str) {
        if self.state().scope_depth == 0 {
            return;
        }
        let depth = self.state().scope_depth;
        for local in self.state().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if Self::identifiers_equal(local.name, name) {
                self.parser
                    .error("Already a variable with this name in this scope.");
            }
        }
        if self.state().locals.len() >= MAX_LOCALS {
            self.parser.error("Too many local variables in function.");
            return;
        }
        self.state_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    /// Returns `Some(constant_index)` for a global, `None` for a local
    /// (whose identity is its stack slot, not a name in the constant pool).
    fn parse_variable(&mut self, message: &str) -> Option<usize> {
        self.parser.consume(TokenType::Identifier, message);
        let name = self.parser.previous.lexeme;
        self.declare_variable(name);
        if self.state().scope_depth > 0 {
            return None;
        }
        Some(self.string_constant(name))
    }

    fn mark_initialized(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }
        let depth = self.state().scope_depth;
        self.state_mut().locals.last_mut().unwrap().depth = depth;
    }

    fn define_variable(&mut self, global: Option<usize>) {
        match global {
            None => self.mark_initialized(),
            Some(idx) => self.emit_indexed(OpCode::DefineGlobal, OpCode::DefineGlobalLong, idx),
        }
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let (get_op, set_op, arg): (OpCode, OpCode, usize) =
            if let Some(slot) = Self::resolve_local(self.state(), name) {
                (OpCode::GetLocal, OpCode::SetLocal, slot as usize)
            } else if let Some(slot) = Self::resolve_upvalue(&mut self.states, name) {
                (OpCode::GetUpvalue, OpCode::SetUpvalue, slot as usize)
            } else {
                let idx = self.string_constant(name);
                (OpCode::GetGlobal, OpCode::SetGlobal, idx)
            };

        let is_global = matches!(get_op, OpCode::GetGlobal);
        if can_assign && self.parser.matches(TokenType::Equal) {
            self.expression();
            if is_global {
                self.emit_indexed(OpCode::SetGlobal, OpCode::SetGlobalLong, arg);
            } else {
                self.emit_op(set_op);
                self.emit_byte(arg as u8);
            }
        } else if is_global {
            self.emit_indexed(OpCode::GetGlobal, OpCode::GetGlobalLong, arg);
        } else {
            self.emit_op(get_op);
            self.emit_byte(arg as u8);
        }
    }

    // ---- expressions ----

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.parser.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(self.parser.previous.typ, can_assign) {
            self.parser.error("Expect expression.");
            return;
        }

        while precedence <= infix_precedence(self.parser.current.typ) {
            self.parser.advance();
            self.infix(self.parser.previous.typ, can_assign);
        }

        if can_assign && self.parser.matches(TokenType::Equal) {
            self.parser.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// Returns `false` if `typ` has no prefix rule (the caller reports
    /// "Expect expression." in that case).
    fn prefix(&mut self, typ: TokenType, can_assign: bool) -> bool {
        use TokenType::*;
        match typ {
            LeftParen => self.grouping(),
            Minus | Bang => self.unary(),
            Number => self.number(),
            String => self.string(),
            True | False | Nil => self.literal(),
            Identifier => self.named_variable(self.parser.previous.lexeme, can_assign),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, typ: TokenType, _can_assign: bool) {
        use TokenType::*;
        match typ {
            Minus | Plus | Slash | Star | BangEqual | EqualEqual | Greater | GreaterEqual
            | Less | LessEqual => self.binary(typ),
            And => self.and(),
            Or => self.or(),
            LeftParen => self.call(),
            _ => unreachable!("token {:?} has no infix rule", typ),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.parser
            .consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let operator = self.parser.previous.typ;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenType::Minus => self.emit_op(OpCode::Negate),
            TokenType::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, operator: TokenType) {
        let next_precedence = infix_precedence(operator).next();
        self.parse_precedence(next_precedence);
        match operator {
            TokenType::Plus => self.emit_op(OpCode::Add),
            TokenType::Minus => self.emit_op(OpCode::Subtract),
            TokenType::Star => self.emit_op(OpCode::Multiply),
            TokenType::Slash => self.emit_op(OpCode::Divide),
            TokenType::EqualEqual => self.emit_op(OpCode::Equal),
            TokenType::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenType::Greater => self.emit_op(OpCode::Greater),
            TokenType::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenType::Less => self.emit_op(OpCode::Less),
            TokenType::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!(),
        }
    }

    fn and(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: usize = 0;
        if !self.parser.check(TokenType::RightParen) {
            loop {
                self.expression();
                if argc == MAX_ARGS {
                    self.parser.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.parser.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.parser
            .consume(TokenType::RightParen, "Expect ')' after arguments.");
        argc.min(MAX_ARGS) as u8
    }

    fn number(&mut self) {
        let value: f64 = self
            .parser
            .previous
            .lexeme
            .parse()
            .expect("scanner only emits well-formed number lexemes");
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let lexeme = self.parser.previous.lexeme;
        let text = &lexeme[1..lexeme.len() - 1];
        let interned = self.interner.intern(text);
        self.emit_constant(Value::string(interned));
    }

    fn literal(&mut self) {
        match self.parser.previous.typ {
            TokenType::True => self.emit_op(OpCode::True),
            TokenType::False => self.emit_op(OpCode::False),
            TokenType::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    // ---- statements ----

    fn declaration(&mut self) {
        if self.parser.matches(TokenType::Var) {
            self.var_declaration();
        } else if self.parser.matches(TokenType::Fun) {
            self.fun_declaration();
        } else {
            self.statement();
        }

        if self.parser.panic_mode {
            self.parser.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.parser.matches(TokenType::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.parser.consume(
            TokenType::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, function_type: FunctionType) {
        let name = self.parser.previous.lexeme;
        self.states
            .push(CompilerState::new(Some(Rc::from(name)), function_type));

        self.begin_scope();
        self.parser
            .consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.parser.check(TokenType::RightParen) {
            loop {
                if self.state().function.arity as usize == MAX_PARAMS {
                    self.parser
                        .error("Can't have more than 255 parameters.");
                }
                self.state_mut().function.arity += 1;
                let param = self.parse_variable("Expect parameter name.");
                self.define_variable(param);
                if !self.parser.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.parser
            .consume(TokenType::RightParen, "Expect ')' after parameters.");
        self.parser
            .consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();

        let upvalues = self.state().upvalues.clone();
        let function = self.end_function();

        let const_idx = self.make_constant(Value::Obj(Object::Function(Rc::new(function))));
        // OP_CLOSURE has no long form: its 1-byte index is followed by the
        // upvalue operand stream, so widening it to 2 bytes would make that
        // stream unreadable. Enclosing functions with >255 constants before
        // a nested `fun` must error instead of silently truncating the index.
        if const_idx > u8::MAX as usize {
            self.parser.error("Too many constants in one chunk.");
        }
        self.emit_op(OpCode::Closure);
        self.emit_byte(const_idx as u8);
        for upvalue in upvalues {
            match upvalue {
                UpvalueSlot::Local(idx) => {
                    self.emit_byte(1);
                    self.emit_byte(idx);
                }
                UpvalueSlot::Upvalue(idx) => {
                    self.emit_byte(0);
                    self.emit_byte(idx);
                }
            }
        }
    }

    fn block(&mut self) {
        while !self.parser.check(TokenType::RightBrace) && !self.parser.check(TokenType::Eof) {
            self.declaration();
        }
        self.parser
            .consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn statement(&mut self) {
        if self.parser.matches(TokenType::Print) {
            self.print_statement();
        } else if self.parser.matches(TokenType::If) {
            self.if_statement();
        } else if self.parser.matches(TokenType::While) {
            self.while_statement();
        } else if self.parser.matches(TokenType::For) {
            self.for_statement();
        } else if self.parser.matches(TokenType::Return) {
            self.return_statement();
        } else if self.parser.matches(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.parser
            .consume(TokenType::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.parser
            .consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn return_statement(&mut self) {
        if matches!(self.state().function_type, FunctionType::Script) {
            self.parser.error("Can't return from top-level code.");
        }
        if self.parser.matches(TokenType::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.parser
                .consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn if_statement(&mut self) {
        self.parser
            .consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.parser
            .consume(TokenType::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.parser.matches(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.state().function.chunk.len();
        self.parser
            .consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.parser
            .consume(TokenType::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.parser
            .consume(TokenType::LeftParen, "Expect '(' after 'for'.");

        if self.parser.matches(TokenType::Semicolon) {
            // no initializer
        } else if self.parser.matches(TokenType::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.state().function.chunk.len();
        let mut exit_jump: Option<usize> = None;
        if !self.parser.matches(TokenType::Semicolon) {
            self.expression();
            self.parser
                .consume(TokenType::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.parser.matches(TokenType::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.state().function.chunk.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.parser
                .consume(TokenType::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }

        self.end_scope();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> LoxFunction {
        let mut interner = StringInterner::new();
        compile(source, &mut interner).unwrap_or_else(|errors| {
            panic!("unexpected compile errors: {errors:?}");
        })
    }

    #[test]
    fn compiles_simple_arithmetic_print() {
        let function = compile_ok("print 1 + 2 * 3;");
        assert!(!function.chunk.is_empty());
    }

    #[test]
    fn redeclaration_in_same_scope_is_an_error() {
        let mut interner = StringInterner::new();
        let result = compile("{ var a = 1; var a = 2; }", &mut interner);
        assert!(result.is_err());
    }

    #[test]
    fn self_referential_initializer_is_an_error() {
        let mut interner = StringInterner::new();
        let result = compile("{ var a = a; }", &mut interner);
        assert!(result.is_err());
    }

    #[test]
    fn return_outside_function_is_an_error() {
        let mut interner = StringInterner::new();
        let result = compile("return 1;", &mut interner);
        assert!(result.is_err());
    }

    #[test]
    fn invalid_assignment_target_is_an_error() {
        let mut interner = StringInterner::new();
        let result = compile("a + b = c;", &mut interner);
        assert!(result.is_err());
    }

    #[test]
    fn error_recovery_reports_exactly_one_error_and_keeps_compiling() {
        let mut interner = StringInterner::new();
        // `1 1;` is a syntax error (missing operator/semicolon before the
        // second `1`); synchronize() should skip to the next statement and
        // still attempt to compile `print 2;` without raising again.
        let result = compile("1 1; print 2;", &mut interner);
        match result {
            Err(errors) => assert_eq!(errors.len(), 1, "errors: {errors:?}"),
            Ok(_) => panic!("expected a compile error"),
        }
    }

    #[test]
    fn string_literals_with_equal_bytes_share_identity_through_compilation() {
        let mut interner = StringInterner::new();
        let function = compile(r#"print "hi"; print "hi";"#, &mut interner)
            .unwrap_or_else(|e| panic!("{e:?}"));
        let strings: Vec<_> = (0..function.chunk.constants_len())
            .filter_map(|i| function.chunk.constant(i).as_string().cloned())
            .collect();
        assert_eq!(strings.len(), 2);
        assert!(Rc::ptr_eq(&strings[0], &strings[1]));
    }

    #[test]
    fn nested_function_past_255_constants_is_an_error_not_a_miscompile() {
        let mut interner = StringInterner::new();
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("{i};\n"));
        }
        source.push_str("fun f() {}\n");
        match compile(&source, &mut interner) {
            Err(errors) => assert!(
                errors.iter().any(|e| e.message.contains("Too many constants")),
                "errors: {errors:?}"
            ),
            Ok(_) => panic!("expected a compile error past 255 constants"),
        }
    }
}
