use super::chunk::OpCode;
use super::compiler::compile;
use super::error::{BacktraceFrame, InterpretResult, RuntimeError};
use super::intern::StringInterner;
use super::natives::install_natives;
use super::value::{Closure, LoxFunction, NativeContext, NativeFunction, Object, Upvalue, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::io::{self, Write};
use std::rc::Rc;
use std::time::Instant;

/// One active function invocation: which closure is running, where its
/// instruction pointer sits in that closure's chunk, and which stack slot
/// is slot 0 for its locals (`base`). Mirrors clox's `CallFrame`; the
/// value stack itself is owned by the `Vm`, not the frame.
struct CallFrame {
    closure: Rc<Closure>,
    ip: usize,
    base: usize,
}

impl CallFrame {
    fn chunk_byte(&self, offset: usize) -> u8 {
        self.closure.function.chunk.read_byte(offset)
    }
}

/// Owns every piece of mutable interpreter state for one interpretation
/// session: the value stack, call frames, globals, string table, object
/// registry, and open-upvalue list. A fresh `Vm` shares no state with any
/// other `Vm` instance -- string/object identity never crosses instances.
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: HashMap<Rc<str>, Value>,
    strings: StringInterner,
    /// Every `Function`, `Native`, `Closure`, and `Str` ever allocated during
    /// this `Vm`'s lifetime, stand-in for clox's intrusive object list.
    objects: Vec<Object>,
    open_upvalues: Vec<Rc<RefCell<Upvalue>>>,
    started_at: Instant,
    out: Box<dyn Write>,
}

impl Vm {
    pub const STACK_MAX: usize = 64 * 256;
    pub const FRAMES_MAX: usize = 64;

    pub fn new() -> Self {
        Self::with_writer(Box::new(io::stdout()))
    }

    /// Builds a `Vm` that prints to `writer` instead of the process's
    /// standard output -- the "output sink" the core consumes in place of
    /// writing `println!` directly, used by tests to capture `print`
    /// statement output without touching the real stdout.
    pub fn with_writer(writer: Box<dyn Write>) -> Self {
        let mut vm = Self {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(Self::FRAMES_MAX),
            globals: HashMap::new(),
            strings: StringInterner::new(),
            objects: Vec::new(),
            open_upvalues: Vec::new(),
            started_at: Instant::now(),
            out: writer,
        };
        install_natives(&mut vm);
        vm
    }

    pub fn define_native(&mut self, name: &'static str, arity: u8, function: super::value::NativeFn) {
        let native = Rc::new(NativeFunction {
            name,
            arity,
            function,
        });
        self.objects.push(Object::Native(Rc::clone(&native)));
        let key = self.strings.intern(name);
        self.objects.push(Object::Str(Rc::clone(&key)));
        self.globals.insert(key, Value::native(native));
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// Walks every constant a freshly compiled function (and, recursively,
    /// every function nested inside it) carries, registering the function
    /// itself plus any string constant in its pool. Compilation allocates
    /// these before the `Vm` has a chance to see them one at a time, so
    /// registration happens once here instead of at each individual
    /// `Rc::new`/`intern` call site inside the compiler.
    fn register_compiled(&mut self, function: &Rc<LoxFunction>) {
        self.objects.push(Object::Function(Rc::clone(function)));
        for i in 0..function.chunk.constants_len() {
            match function.chunk.constant(i) {
                Value::Obj(Object::Function(nested)) => {
                    let nested = Rc::clone(nested);
                    self.register_compiled(&nested);
                }
                Value::Obj(Object::Str(s)) => {
                    self.objects.push(Object::Str(Rc::clone(s)));
                }
                _ => {}
            }
        }
    }

    /// Compiles and runs `source` as a fresh top-level script, reusing this
    /// `Vm`'s globals and intern table across calls (so a REPL session
    /// accumulates global state line to line).
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function = match compile(source, &mut self.strings) {
            Ok(function) => function,
            Err(errors) => return InterpretResult::CompileError(errors),
        };

        let function = Rc::new(function);
        self.register_compiled(&function);
        let closure = Rc::new(Closure::new(Rc::clone(&function), vec![]));
        self.objects.push(Object::Closure(Rc::clone(&closure)));
        self.stack.push(Value::closure(Rc::clone(&closure)));
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: 0,
        });

        let outcome = self.run();
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        match outcome {
            Ok(()) => InterpretResult::Ok,
            Err(err) => InterpretResult::RuntimeError(err),
        }
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("run() never called with an empty frame stack")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("run() never called with an empty frame stack")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frame_mut();
        let byte = frame.chunk_byte(frame.ip);
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self, long: bool) -> Value {
        let idx = if long {
            self.read_u16() as usize
        } else {
            self.read_byte() as usize
        };
        self.frame().closure.function.chunk.constant(idx).clone()
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("compiler-emitted code balances the stack")
    }

    fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }

    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        let mut err = RuntimeError::new(message);
        for frame in self.frames.iter().rev() {
            let line = frame.closure.function.chunk.line_of(frame.ip.saturating_sub(1));
            err.frames.push(BacktraceFrame {
                line,
                name: frame.closure.function.name.as_ref().map(|n| n.to_string()),
            });
        }
        err
    }

    /// Finds or creates the open upvalue for absolute stack slot `location`.
    /// `open_upvalues` only ever grows at the current stack top, so it stays
    /// naturally ordered by descending stack index without an explicit sort.
    fn capture_upvalue(&mut self, location: usize) -> Rc<RefCell<Upvalue>> {
        for existing in &self.open_upvalues {
            if existing.borrow().stack_index() == Some(location) {
                return Rc::clone(existing);
            }
        }
        let upvalue = Rc::new(RefCell::new(Upvalue::Open(location)));
        self.open_upvalues.push(Rc::clone(&upvalue));
        upvalue
    }

    fn close_upvalues(&mut self, from: usize) {
        let stack = &self.stack;
        self.open_upvalues.retain(|upvalue| {
            let idx = match upvalue.borrow().stack_index() {
                Some(idx) => idx,
                None => return false,
            };
            if idx >= from {
                *upvalue.borrow_mut() = Upvalue::Closed(stack[idx].clone());
                false
            } else {
                true
            }
        });
    }

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        match callee {
            Value::Obj(Object::Closure(closure)) => self.call_closure(closure, argc),
            Value::Obj(Object::Native(native)) => self.call_native(native, argc),
            _ => Err(self.runtime_error("Can only call functions and closures.")),
        }
    }

    fn call_closure(&mut self, closure: Rc<Closure>, argc: usize) -> Result<(), RuntimeError> {
        let arity = closure.function.arity as usize;
        if argc != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {argc}.")));
        }
        if self.frames.len() == Self::FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base,
        });
        Ok(())
    }

    fn call_native(&mut self, native: Rc<NativeFunction>, argc: usize) -> Result<(), RuntimeError> {
        if argc != native.arity as usize {
            return Err(self.runtime_error(format!(
                "Expected {} arguments but got {argc}.",
                native.arity
            )));
        }
        let args_start = self.stack.len() - argc;
        let ctx = NativeContext {
            elapsed_secs: self.elapsed_secs(),
        };
        let result = (native.function)(ctx, &self.stack[args_start..])
            .map_err(|message| self.runtime_error(message))?;
        self.stack.truncate(args_start - 1);
        self.push(result);
        Ok(())
    }

    fn concatenate(&mut self, a: &Rc<str>, b: &Rc<str>) -> Value {
        let joined = format!("{a}{b}");
        let interned = self.strings.intern(&joined);
        self.objects.push(Object::Str(Rc::clone(&interned)));
        Value::string(interned)
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            #[cfg(feature = "trace")]
            self.trace_instruction();

            let byte = self.read_byte();
            let op = OpCode::try_from(byte).expect("compiler only ever emits valid opcodes");

            match op {
                OpCode::Constant => {
                    let value = self.read_constant(false);
                    self.push(value);
                }
                OpCode::ConstantLong => {
                    let value = self.read_constant(true);
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    self.push(self.stack[base + slot].clone());
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    self.stack[base + slot] = self.peek(0).clone();
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = Rc::clone(&self.frame().closure.upvalues[slot]);
                    let value = match &*upvalue.borrow() {
                        Upvalue::Open(idx) => self.stack[*idx].clone(),
                        Upvalue::Closed(value) => value.clone(),
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = Rc::clone(&self.frame().closure.upvalues[slot]);
                    let value = self.peek(0).clone();
                    let target_slot = upvalue.borrow().stack_index();
                    match target_slot {
                        Some(idx) => self.stack[idx] = value,
                        None => *upvalue.borrow_mut() = Upvalue::Closed(value),
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_constant(false);
                    self.define_global(name);
                }
                OpCode::DefineGlobalLong => {
                    let name = self.read_constant(true);
                    self.define_global(name);
                }
                OpCode::GetGlobal => {
                    let name = self.read_constant(false);
                    self.get_global(name)?;
                }
                OpCode::GetGlobalLong => {
                    let name = self.read_constant(true);
                    self.get_global(name)?;
                }
                OpCode::SetGlobal => {
                    let name = self.read_constant(false);
                    self.set_global(name)?;
                }
                OpCode::SetGlobalLong => {
                    let name = self.read_constant(true);
                    self.set_global(name)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.numeric_compare(|a, b| a > b)?,
                OpCode::Less => self.numeric_compare(|a, b| a < b)?,
                OpCode::Add => {
                    let b = self.peek(0).clone();
                    let a = self.peek(1).clone();
                    match (&a, &b) {
                        (Value::Number(x), Value::Number(y)) => {
                            let sum = x + y;
                            self.pop();
                            self.pop();
                            self.push(Value::Number(sum));
                        }
                        (Value::Obj(Object::Str(x)), Value::Obj(Object::Str(y))) => {
                            let result = self.concatenate(x, y);
                            self.pop();
                            self.pop();
                            self.push(result);
                        }
                        _ => {
                            return Err(
                                self.runtime_error("Operands must be two numbers or two strings.")
                            )
                        }
                    }
                }
                OpCode::Subtract => self.numeric_binary(|a, b| a - b)?,
                OpCode::Multiply => self.numeric_binary(|a, b| a * b)?,
                OpCode::Divide => self.numeric_binary(|a, b| a / b)?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    let value = self
                        .peek(0)
                        .as_number()
                        .ok_or_else(|| self.runtime_error("Operand must be a number."))?;
                    self.pop();
                    self.push(Value::Number(-value));
                }
                OpCode::Print => {
                    let value = self.pop();
                    writeln!(self.out, "{value}")
                        .expect("writes to the configured output sink do not fail");
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frame_mut().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frame_mut().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = self.peek(argc).clone();
                    self.call_value(callee, argc)?;
                }
                OpCode::Closure => {
                    let function = self.read_constant(false);
                    let function = match function {
                        Value::Obj(Object::Function(f)) => f,
                        _ => unreachable!("compiler only emits OP_CLOSURE over function constants"),
                    };
                    let count = function.upvalue_count;
                    let mut upvalues = Vec::with_capacity(count);
                    for _ in 0..count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let base = self.frame().base;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            upvalues.push(Rc::clone(&self.frame().closure.upvalues[index]));
                        }
                    }
                    let closure = Rc::new(Closure::new(function, upvalues));
                    self.objects.push(Object::Closure(Rc::clone(&closure)));
                    self.push(Value::closure(closure));
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let base = self.frame().base;
                    self.close_upvalues(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(base);
                    self.push(result);
                }
            }
        }
    }

    fn define_global(&mut self, name: Value) {
        let name = name
            .as_string()
            .expect("compiler emits string constants for globals")
            .clone();
        let value = self.pop();
        self.globals.insert(name, value);
    }

    fn get_global(&mut self, name: Value) -> Result<(), RuntimeError> {
        let name = name
            .as_string()
            .expect("compiler emits string constants for globals")
            .clone();
        match self.globals.get(&name) {
            Some(value) => {
                let value = value.clone();
                self.push(value);
                Ok(())
            }
            None => Err(self.runtime_error(format!("Undefined variable '{name}'."))),
        }
    }

    fn set_global(&mut self, name: Value) -> Result<(), RuntimeError> {
        let name = name
            .as_string()
            .expect("compiler emits string constants for globals")
            .clone();
        if !self.globals.contains_key(&name) {
            return Err(self.runtime_error(format!("Undefined variable '{name}'.")));
        }
        let value = self.peek(0).clone();
        self.globals.insert(name, value);
        Ok(())
    }

    fn numeric_binary(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let (a, b) = self.pop_two_numbers()?;
        self.push(Value::Number(op(a, b)));
        Ok(())
    }

    fn numeric_compare(&mut self, op: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let (a, b) = self.pop_two_numbers()?;
        self.push(Value::Bool(op(a, b)));
        Ok(())
    }

    fn pop_two_numbers(&mut self) -> Result<(f64, f64), RuntimeError> {
        let b = self.peek(0).as_number();
        let a = self.peek(1).as_number();
        match (a, b) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                Ok((a, b))
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    #[cfg(feature = "trace")]
    fn trace_instruction(&self) {
        print!("          ");
        for value in &self.stack {
            print!("[ {value} ]");
        }
        println!();
        let frame = self.frame();
        let op = OpCode::try_from(frame.chunk_byte(frame.ip)).ok();
        println!("{:04} {:?}", frame.ip, op);
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ok(source: &str) -> Vm {
        let mut vm = Vm::new();
        match vm.interpret(source) {
            InterpretResult::Ok => vm,
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test]
    fn arithmetic_precedence() {
        run_ok("print 1 + 2 * 3;");
    }

    #[test]
    fn string_concatenation() {
        run_ok(r#"var a = "hi"; var b = ", world"; print a + b;"#);
    }

    #[test]
    fn while_loop_mutates_global() {
        run_ok("var i = 0; while (i < 3) { i = i + 1; } print i;");
    }

    #[test]
    fn closures_share_captured_local() {
        run_ok(
            "fun make() { var x = 0; fun inc() { x = x + 1; return x; } return inc; } \
             var c = make(); print c(); print c(); print c();",
        );
    }

    #[test]
    fn undefined_global_read_is_runtime_error() {
        let mut vm = Vm::new();
        match vm.interpret("print undefined_var;") {
            InterpretResult::RuntimeError(err) => {
                assert!(err.message.contains("undefined_var"));
            }
            other => panic!("expected RuntimeError, got {other:?}"),
        }
    }

    #[test]
    fn arity_mismatch_is_runtime_error() {
        let mut vm = Vm::new();
        match vm.interpret("fun f(a, b) { return a + b; } print f(1);") {
            InterpretResult::RuntimeError(err) => {
                assert!(err.message.contains("Expected 2 arguments but got 1"));
            }
            other => panic!("expected RuntimeError, got {other:?}"),
        }
    }

    #[test]
    fn and_or_short_circuit_and_precedence() {
        run_ok(r#"if (true and false or true) print "ok"; else print "no";"#);
    }

    #[test]
    fn globals_persist_across_multiple_interpret_calls() {
        let mut vm = Vm::new();
        assert!(matches!(vm.interpret("var a = 1;"), InterpretResult::Ok));
        assert!(matches!(vm.interpret("print a;"), InterpretResult::Ok));
    }

    #[test]
    fn set_global_on_undefined_name_is_a_runtime_error() {
        let mut vm = Vm::new();
        match vm.interpret("a = 1;") {
            InterpretResult::RuntimeError(err) => {
                assert!(err.message.contains("Undefined variable"))
            }
            other => panic!("expected RuntimeError, got {other:?}"),
        }
    }

    #[test]
    fn function_following_many_constants_reports_compile_error_not_a_panic() {
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("{i};\n"));
        }
        source.push_str("fun f() {}\n");
        let mut vm = Vm::new();
        match vm.interpret(&source) {
            InterpretResult::CompileError(_) => {}
            other => panic!("expected CompileError, got {other:?}"),
        }
    }
}
