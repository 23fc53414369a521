//! The interpreter.

use crate::error::{InterpretError, RuntimeError};
use qet_core::{OpCode, Value};
use qet_gc::{self as gc, Gc, SNode};
use qet_runtime::{
    classify, format_value, ObjBoundMethod, ObjClass, ObjClosure, ObjInstance, ObjNative,
    ObjUpvalue, ObjectKind, Table,
};

const FRAMES_MAX: usize = 64;

/// One activation: a closure, its instruction cursor, and the stack
/// slot its window begins at.
struct CallFrame {
    closure: Gc<ObjClosure>,
    ip: usize,
    base: usize,
}

/// The virtual machine. One per interpreter thread; the thread must be
/// an entered mutator for the Vm's whole lifetime.
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Upvalues still pointing into the stack, sorted by slot.
    open_upvalues: Vec<Gc<ObjUpvalue>>,
    /// Pinned: initializer lookups must never lose this string.
    init_string: Gc<SNode>,
}

/// The sole built-in native: seconds since an arbitrary epoch.
fn clock_native(_args: &[Value]) -> Value {
    let seconds = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Value::int(seconds as i64).unwrap_or(Value::NIL)
}

impl Vm {
    /// Create a VM with the `clock` native defined.
    pub fn new() -> Vm {
        let init_string = gc::intern(b"init");
        let vm = Vm {
            stack: Vec::with_capacity(FRAMES_MAX * 256),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
        };
        vm.define_native("clock", clock_native);
        vm
    }

    fn define_native(&self, name: &str, function: qet_runtime::NativeFn) {
        let key = gc::intern(name.as_bytes());
        let native = ObjNative::new(function);
        self.globals.set(key, native.as_value());
    }

    /// Compile and run a source string.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = qet_compiler::compile(source).map_err(InterpretError::Compile)?;

        self.push(function.as_value());
        let closure = ObjClosure::new(function);
        self.pop();
        self.push(closure.as_value());
        self.call_closure(closure, 0)
            .map_err(InterpretError::Runtime)?;

        self.run().map_err(InterpretError::Runtime)
    }

    /// Read a global by name. Embedding and test hook.
    pub fn global(&self, name: &str) -> Option<Value> {
        let key = gc::intern(name.as_bytes());
        self.globals.get(key)
    }

    /// Shade everything this mutator can reach: the collaborator
    /// surface called after every handshake exchange.
    pub fn shade_roots(&self) {
        for &value in self.stack.iter() {
            gc::shade_value(value);
        }
        for frame in self.frames.iter() {
            gc::shade(frame.closure.erase());
        }
        for &upvalue in self.open_upvalues.iter() {
            gc::shade(upvalue.erase());
        }
        self.globals.shade();
        gc::shade(self.init_string.erase());
    }

    // -------------------------------------------------------------------
    // Stack and frame plumbing
    // -------------------------------------------------------------------

    #[inline]
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    #[inline]
    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = frame.closure.function;
            let instruction = frame.ip.saturating_sub(1);
            let line = function.chunk.line(instruction);
            let location = match function.name {
                Some(name) => format!("{}()", name),
                None => "script".to_string(),
            };
            trace.push(format!("[line {}] in {}", line, location));
        }
        self.reset_stack();
        RuntimeError {
            message: message.into(),
            trace,
        }
    }

    #[inline]
    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active frame");
        let byte = frame.closure.function.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    #[inline]
    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    #[inline]
    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frames.last().expect("no active frame");
        frame.closure.function.chunk.constants[index]
    }

    #[inline]
    fn read_string(&mut self) -> Gc<SNode> {
        let value = self.read_constant();
        qet_runtime::as_string(value).expect("compiler emitted a string constant")
    }

    // -------------------------------------------------------------------
    // Calls
    // -------------------------------------------------------------------

    fn call_closure(&mut self, closure: Gc<ObjClosure>, arg_count: usize) -> Result<(), RuntimeError> {
        let arity = closure.function.arity as usize;
        if arg_count != arity {
            return Err(self.runtime_error(format!(
                "Expected {} arguments but got {}.",
                arity, arg_count
            )));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        if let Some(obj) = gc::ObjRef::from_value(callee) {
            match classify(obj) {
                ObjectKind::BoundMethod(bound) => {
                    let slot = self.stack.len() - arg_count - 1;
                    self.stack[slot] = bound.receiver.load();
                    return self.call_closure(bound.method, arg_count);
                }
                ObjectKind::Class(class) => {
                    let instance = ObjInstance::new(class);
                    let slot = self.stack.len() - arg_count - 1;
                    self.stack[slot] = instance.as_value();
                    if let Some(initializer) = class.methods.get(self.init_string) {
                        let closure = as_closure(initializer);
                        return self.call_closure(closure, arg_count);
                    }
                    if arg_count != 0 {
                        return Err(self.runtime_error(format!(
                            "Expected 0 arguments but got {}.",
                            arg_count
                        )));
                    }
                    return Ok(());
                }
                ObjectKind::Closure(closure) => return self.call_closure(closure, arg_count),
                ObjectKind::Native(native) => {
                    let args_start = self.stack.len() - arg_count;
                    let result = (native.function)(&self.stack[args_start..]);
                    self.stack.truncate(args_start - 1);
                    self.push(result);
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(self.runtime_error("Can only call functions and classes."))
    }

    fn invoke_from_class(
        &mut self,
        class: Gc<ObjClass>,
        name: Gc<SNode>,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        let Some(method) = class.methods.get(name) else {
            return Err(self.runtime_error(format!("Undefined property '{}'.", name)));
        };
        self.call_closure(as_closure(method), arg_count)
    }

    fn invoke(&mut self, name: Gc<SNode>, arg_count: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(arg_count);
        let Some(instance) = as_instance(receiver) else {
            return Err(self.runtime_error("Only instances have methods."));
        };

        // A field shadows any method of the same name.
        if let Some(value) = instance.fields.get(name) {
            let slot = self.stack.len() - arg_count - 1;
            self.stack[slot] = value;
            return self.call_value(value, arg_count);
        }
        self.invoke_from_class(instance.class, name, arg_count)
    }

    fn bind_method(&mut self, class: Gc<ObjClass>, name: Gc<SNode>) -> Result<(), RuntimeError> {
        let Some(method) = class.methods.get(name) else {
            return Err(self.runtime_error(format!("Undefined property '{}'.", name)));
        };
        let bound = ObjBoundMethod::new(self.peek(0), as_closure(method));
        self.pop();
        self.push(bound.as_value());
        Ok(())
    }

    // -------------------------------------------------------------------
    // Upvalues
    // -------------------------------------------------------------------

    fn capture_upvalue(&mut self, slot: usize) -> Gc<ObjUpvalue> {
        let position = self.open_upvalues.binary_search_by_key(&slot, |uv| {
            uv.open_slot().expect("open upvalue list holds only open upvalues")
        });
        match position {
            Ok(index) => self.open_upvalues[index],
            Err(index) => {
                let upvalue = ObjUpvalue::new_open(slot);
                self.open_upvalues.insert(index, upvalue);
                upvalue
            }
        }
    }

    /// Close every open upvalue at or above `from_slot`.
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&upvalue) = self.open_upvalues.last() {
            let slot = upvalue
                .open_slot()
                .expect("open upvalue list holds only open upvalues");
            if slot < from_slot {
                break;
            }
            upvalue.close(self.stack[slot]);
            self.open_upvalues.pop();
        }
    }

    // -------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        let safepoint_interval = gc::config().safepoint_interval;
        let mut dispatches = 0usize;

        loop {
            // Cooperative safepoint: exchange state with the collector
            // and re-enumerate roots when it asked for a handshake.
            dispatches += 1;
            if dispatches >= safepoint_interval {
                dispatches = 0;
                if gc::handshake() {
                    self.shade_roots();
                }
            }

            let op = OpCode::from_byte(self.read_byte()).expect("compiler emitted valid opcode");
            match op {
                OpCode::Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                }
                OpCode::Nil => self.push(Value::NIL),
                OpCode::True => self.push(Value::TRUE),
                OpCode::False => self.push(Value::FALSE),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().expect("no active frame").base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().expect("no active frame").base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    let Some(value) = self.globals.get(name) else {
                        return Err(
                            self.runtime_error(format!("Undefined variable '{}'.", name))
                        );
                    };
                    self.push(value);
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    self.globals.set(name, self.peek(0));
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    if self.globals.set(name, self.peek(0)) {
                        // The assignment invented the variable: undo it.
                        self.globals.delete(name);
                        return Err(
                            self.runtime_error(format!("Undefined variable '{}'.", name))
                        );
                    }
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.current_upvalue(index);
                    let value = match upvalue.open_slot() {
                        Some(slot) => self.stack[slot],
                        None => upvalue.closed_value(),
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.current_upvalue(index);
                    let value = self.peek(0);
                    match upvalue.open_slot() {
                        Some(slot) => self.stack[slot] = value,
                        None => upvalue.set_closed(value),
                    }
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    let Some(instance) = as_instance(self.peek(0)) else {
                        return Err(self.runtime_error("Only instances have properties."));
                    };
                    if let Some(value) = instance.fields.get(name) {
                        self.pop(); // instance
                        self.push(value);
                    } else {
                        self.bind_method(instance.class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let Some(instance) = as_instance(self.peek(1)) else {
                        return Err(self.runtime_error("Only instances have fields."));
                    };
                    instance.fields.set(name, self.peek(0));
                    let value = self.pop();
                    self.pop(); // instance
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = as_class(self.pop()).expect("compiler placed a class");
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a == b));
                }
                OpCode::Greater => self.binary_compare(|a, b| a > b)?,
                OpCode::Less => self.binary_compare(|a, b| a < b)?,
                OpCode::Add => {
                    let (b, a) = (self.peek(0), self.peek(1));
                    if let (Some(a), Some(b)) =
                        (qet_runtime::as_string(a), qet_runtime::as_string(b))
                    {
                        self.pop();
                        self.pop();
                        self.concatenate(a, b);
                    } else if a.is_int() && b.is_int() {
                        self.binary_arith(i64::checked_add)?;
                    } else {
                        return Err(self
                            .runtime_error("Operands must be two numbers or two strings."));
                    }
                }
                OpCode::Subtract => self.binary_arith(i64::checked_sub)?,
                OpCode::Multiply => self.binary_arith(i64::checked_mul)?,
                OpCode::Divide => self.binary_arith(i64::checked_div)?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::bool(!value.is_truthy()));
                }
                OpCode::Negate => {
                    if self.peek(0).as_int().is_none() {
                        return Err(self.runtime_error("Operand must be a number."));
                    }
                    let value = self.pop().as_int().expect("just checked");
                    match value.checked_neg().and_then(Value::int) {
                        Some(result) => self.push(result),
                        None => return Err(self.runtime_error("Integer overflow.")),
                    }
                }
                OpCode::Print => {
                    let value = self.pop();
                    println!("{}", format_value(value));
                }
                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().expect("no active frame").ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().expect("no active frame").ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().expect("no active frame").ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    self.call_value(self.peek(arg_count), arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    let superclass = as_class(self.pop()).expect("compiler placed a class");
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
                OpCode::Closure => {
                    let function_value = self.read_constant();
                    let ObjectKind::Function(function) = classify(
                        gc::ObjRef::from_value(function_value).expect("function constant"),
                    ) else {
                        unreachable!("closure operand is always a function")
                    };
                    let closure = ObjClosure::new(function);
                    self.push(closure.as_value());
                    for i in 0..closure.upvalues.len() {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base = self.frames.last().expect("no active frame").base;
                            self.capture_upvalue(base + index)
                        } else {
                            self.current_upvalue(index)
                        };
                        closure.upvalues[i].store(Some(upvalue));
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("no active frame");
                    self.close_upvalues(frame.base);
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.base);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let class = ObjClass::new(name);
                    self.push(class.as_value());
                }
                OpCode::Inherit => {
                    let Some(superclass) = as_class(self.peek(1)) else {
                        return Err(self.runtime_error("Superclass must be a class."));
                    };
                    let subclass = as_class(self.peek(0)).expect("compiler placed a class");
                    // Copy-down inheritance: the subclass's own methods,
                    // defined after this opcode, shadow the copies.
                    subclass.methods.add_all(&superclass.methods);
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method = self.peek(0);
                    let class = as_class(self.peek(1)).expect("compiler placed a class");
                    class.methods.set(name, method);
                    self.pop();
                }
            }
        }
    }

    #[inline]
    fn current_upvalue(&self, index: usize) -> Gc<ObjUpvalue> {
        let frame = self.frames.last().expect("no active frame");
        frame.closure.upvalues[index]
            .load()
            .expect("upvalue slot filled by the closure opcode")
    }

    fn binary_compare(&mut self, op: impl Fn(i64, i64) -> bool) -> Result<(), RuntimeError> {
        let (Some(b), Some(a)) = (self.peek(0).as_int(), self.peek(1).as_int()) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        self.push(Value::bool(op(a, b)));
        Ok(())
    }

    fn binary_arith(
        &mut self,
        op: impl Fn(i64, i64) -> Option<i64>,
    ) -> Result<(), RuntimeError> {
        let (Some(b), Some(a)) = (self.peek(0).as_int(), self.peek(1).as_int()) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        if b == 0 && op(1, 0).is_none() {
            return Err(self.runtime_error("Division by zero."));
        }
        match op(a, b).and_then(Value::int) {
            Some(result) => {
                self.push(result);
                Ok(())
            }
            None => Err(self.runtime_error("Integer overflow.")),
        }
    }

    fn concatenate(&mut self, a: Gc<SNode>, b: Gc<SNode>) {
        let mut bytes = Vec::with_capacity(a.len() + b.len());
        bytes.extend_from_slice(a.as_bytes());
        bytes.extend_from_slice(b.as_bytes());
        let result = gc::intern(&bytes);
        self.push(result.as_value());
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

fn as_instance(v: Value) -> Option<Gc<ObjInstance>> {
    match gc::ObjRef::from_value(v).map(classify) {
        Some(ObjectKind::Instance(instance)) => Some(instance),
        _ => None,
    }
}

fn as_class(v: Value) -> Option<Gc<ObjClass>> {
    match gc::ObjRef::from_value(v).map(classify) {
        Some(ObjectKind::Class(class)) => Some(class),
        _ => None,
    }
}

fn as_closure(v: Value) -> Gc<ObjClosure> {
    match gc::ObjRef::from_value(v).map(classify) {
        Some(ObjectKind::Closure(closure)) => closure,
        _ => unreachable!("method tables hold only closures"),
    }
}
