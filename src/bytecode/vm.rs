//! Stack-based virtual machine for executing bytecode.
//!
//! Execution is a straight-line fetch/decode/execute loop. The operand stack
//! is a fixed array shared by all call frames: each frame owns a contiguous
//! window starting at its base pointer for parameters and locals, and popping
//! a frame restores the stack pointer to exactly where it stood before the
//! call, minus the callee slot and plus the single return value.

use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode::compiler::Bytecode;
use crate::bytecode::instruction::Opcode;
use crate::error::RuntimeError;
use crate::value::{builtins, Builtin, Closure, CompiledFunction, HashPair, Value};

/// Operand stack capacity.
pub const STACK_SIZE: usize = 2048;
/// Global slot capacity.
pub const GLOBALS_SIZE: usize = 65536;
/// Maximum call depth.
pub const MAX_FRAMES: usize = 1024;

/// Result type for VM operations.
pub type VmResult<T> = Result<T, RuntimeError>;

/// One active function invocation.
#[derive(Debug)]
struct Frame {
    closure: Rc<Closure>,
    /// Offset of the next instruction within the closure's stream.
    ip: usize,
    /// Start of this frame's stack window; locals live at
    /// `stack[base_pointer..base_pointer + num_locals]`.
    base_pointer: usize,
}

impl Frame {
    fn new(closure: Rc<Closure>, base_pointer: usize) -> Self {
        Frame {
            closure,
            ip: 0,
            base_pointer,
        }
    }
}

/// The virtual machine.
pub struct Vm {
    constants: Vec<Value>,
    stack: Vec<Value>,
    /// Next free stack slot; top of stack is `stack[sp - 1]`.
    sp: usize,
    globals: Vec<Value>,
    frames: Vec<Frame>,
}

impl Vm {
    /// Load bytecode into a fresh machine.
    pub fn new(bytecode: Bytecode) -> Self {
        Self::with_globals_store(bytecode, vec![Value::Null; GLOBALS_SIZE])
    }

    /// Load bytecode but reuse the global slots of a previous run, so a REPL
    /// can keep `let` bindings across inputs.
    pub fn with_globals_store(bytecode: Bytecode, globals: Vec<Value>) -> Self {
        let main_function = Rc::new(CompiledFunction {
            instructions: bytecode.instructions,
            num_locals: 0,
            num_parameters: 0,
        });
        let main_closure = Rc::new(Closure {
            function: main_function,
            free: Vec::new(),
        });

        Vm {
            constants: bytecode.constants,
            stack: vec![Value::Null; STACK_SIZE],
            sp: 0,
            globals,
            frames: vec![Frame::new(main_closure, 0)],
        }
    }

    /// Hand back the global slots for the next `with_globals_store` round.
    pub fn into_globals(self) -> Vec<Value> {
        self.globals
    }

    /// The global slot array.
    pub fn globals(&self) -> &[Value] {
        &self.globals
    }

    /// The most recently popped value: the program's result for a REPL-style
    /// caller, since every top-level expression statement pushes then pops.
    pub fn last_popped(&self) -> &Value {
        &self.stack[self.sp]
    }

    /// Execute until the entry frame's instruction stream is exhausted.
    /// Halts at the first error; a failed machine's state is not reusable.
    pub fn run(&mut self) -> VmResult<()> {
        while self.current_frame().ip < self.current_frame().closure.function.instructions.len() {
            let byte = self.read_u8() as u8;
            let op = Opcode::from_u8(byte).ok_or(RuntimeError::UndefinedOpcode(byte))?;

            match op {
                Opcode::Constant => {
                    let index = self.read_u16();
                    let constant = self
                        .constants
                        .get(index)
                        .cloned()
                        .ok_or(RuntimeError::InvalidConstant(index))?;
                    self.push(constant)?;
                }

                Opcode::Pop => {
                    self.pop()?;
                }

                Opcode::Null => self.push(Value::Null)?,
                Opcode::True => self.push(Value::Boolean(true))?,
                Opcode::False => self.push(Value::Boolean(false))?,

                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                    self.execute_binary_operation(op)?;
                }

                Opcode::Equal | Opcode::NotEqual | Opcode::LessThan | Opcode::GreaterThan => {
                    self.execute_comparison(op)?;
                }

                Opcode::Minus => {
                    let operand = self.pop()?;
                    match operand {
                        Value::Integer(n) => self.push(Value::Integer(-n))?,
                        other => {
                            return Err(RuntimeError::UnsupportedNegation(other.type_name()))
                        }
                    }
                }

                Opcode::Bang => {
                    let operand = self.pop()?;
                    self.push(Value::Boolean(!operand.is_truthy()))?;
                }

                Opcode::Jump => {
                    let target = self.read_u16();
                    self.current_frame_mut().ip = target;
                }

                Opcode::JumpNotTruthy => {
                    let target = self.read_u16();
                    let condition = self.pop()?;
                    if !condition.is_truthy() {
                        self.current_frame_mut().ip = target;
                    }
                }

                Opcode::SetGlobal => {
                    let index = self.read_u16();
                    let value = self.pop()?;
                    self.globals[index] = value;
                }

                Opcode::GetGlobal => {
                    let index = self.read_u16();
                    let value = self.globals[index].clone();
                    self.push(value)?;
                }

                Opcode::SetLocal => {
                    let index = self.read_u8();
                    let base = self.current_frame().base_pointer;
                    let value = self.pop()?;
                    self.stack[base + index] = value;
                }

                Opcode::GetLocal => {
                    let index = self.read_u8();
                    let base = self.current_frame().base_pointer;
                    let value = self.stack[base + index].clone();
                    self.push(value)?;
                }

                Opcode::GetBuiltin => {
                    let index = self.read_u8();
                    let builtin = builtins::get(index)
                        .copied()
                        .ok_or(RuntimeError::UndefinedBuiltin(index))?;
                    self.push(Value::Builtin(builtin))?;
                }

                Opcode::GetFree => {
                    let index = self.read_u8();
                    let value = self.current_frame().closure.free[index].clone();
                    self.push(value)?;
                }

                Opcode::Array => {
                    let count = self.read_u16();
                    if count > self.sp {
                        return Err(RuntimeError::StackUnderflow);
                    }
                    let elements = self.stack[self.sp - count..self.sp].to_vec();
                    self.sp -= count;
                    self.push(Value::Array(Rc::new(elements)))?;
                }

                Opcode::Hash => {
                    let count = self.read_u16();
                    if count > self.sp {
                        return Err(RuntimeError::StackUnderflow);
                    }
                    let hash = self.build_hash(self.sp - count, self.sp)?;
                    self.sp -= count;
                    self.push(hash)?;
                }

                Opcode::Index => {
                    let index = self.pop()?;
                    let left = self.pop()?;
                    self.execute_index(left, index)?;
                }

                Opcode::Call => {
                    let num_args = self.read_u8();
                    self.execute_call(num_args)?;
                }

                Opcode::Closure => {
                    let const_index = self.read_u16();
                    let num_free = self.read_u8();
                    self.push_closure(const_index, num_free)?;
                }

                Opcode::ReturnValue => {
                    let return_value = self.pop()?;
                    if self.return_from_frame(return_value)? {
                        return Ok(());
                    }
                }

                Opcode::Return => {
                    if self.return_from_frame(Value::Null)? {
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }

    /// Pop the current frame and push `value` onto the caller's stack.
    /// Returns true when the entry frame was popped, i.e. the run is over.
    fn return_from_frame(&mut self, value: Value) -> VmResult<bool> {
        let frame = self.frames.pop().expect("call frame");

        if self.frames.is_empty() {
            // Top-level `return`: park the value where `last_popped` reads it
            // and end the run with a balanced stack.
            self.stack[0] = value;
            self.sp = 0;
            return Ok(true);
        }

        // Discard the frame's window along with the callee slot beneath it.
        self.sp = frame.base_pointer - 1;
        self.push(value)?;
        Ok(false)
    }

    fn execute_binary_operation(&mut self, op: Opcode) -> VmResult<()> {
        // Operands were pushed left-then-right.
        let right = self.pop()?;
        let left = self.pop()?;

        match (&left, &right) {
            (Value::Integer(l), Value::Integer(r)) => {
                let result = match op {
                    Opcode::Add => l + r,
                    Opcode::Sub => l - r,
                    Opcode::Mul => l * r,
                    Opcode::Div => {
                        if *r == 0 {
                            return Err(RuntimeError::DivisionByZero);
                        }
                        // i64 division truncates toward zero.
                        l / r
                    }
                    _ => unreachable!("not a binary opcode: {:?}", op),
                };
                self.push(Value::Integer(result))
            }
            (Value::String(l), Value::String(r)) if op == Opcode::Add => {
                self.push(Value::String(Rc::new(format!("{}{}", l, r))))
            }
            _ => Err(RuntimeError::UnsupportedBinaryOperands {
                left: left.type_name(),
                right: right.type_name(),
            }),
        }
    }

    fn execute_comparison(&mut self, op: Opcode) -> VmResult<()> {
        let right = self.pop()?;
        let left = self.pop()?;

        let result = match (&left, &right) {
            (Value::Integer(l), Value::Integer(r)) => match op {
                Opcode::Equal => l == r,
                Opcode::NotEqual => l != r,
                Opcode::LessThan => l < r,
                Opcode::GreaterThan => l > r,
                _ => unreachable!("not a comparison opcode: {:?}", op),
            },
            (Value::Boolean(l), Value::Boolean(r)) => match op {
                Opcode::Equal => l == r,
                Opcode::NotEqual => l != r,
                _ => {
                    return Err(RuntimeError::UnsupportedComparison {
                        left: left.type_name(),
                        right: right.type_name(),
                    })
                }
            },
            (Value::String(l), Value::String(r)) => match op {
                Opcode::Equal => l == r,
                Opcode::NotEqual => l != r,
                _ => {
                    return Err(RuntimeError::UnsupportedComparison {
                        left: left.type_name(),
                        right: right.type_name(),
                    })
                }
            },
            _ => {
                return Err(RuntimeError::UnsupportedComparison {
                    left: left.type_name(),
                    right: right.type_name(),
                })
            }
        };

        self.push(Value::Boolean(result))
    }

    /// Build a hash from the stack slots in `[start, end)`, taken as
    /// key/value pairs in push order.
    fn build_hash(&self, start: usize, end: usize) -> VmResult<Value> {
        let mut pairs = IndexMap::with_capacity((end - start) / 2);

        for i in (start..end).step_by(2) {
            let key = self.stack[i].clone();
            let value = self.stack[i + 1].clone();

            let hash_key = key
                .hash_key()
                .ok_or_else(|| RuntimeError::UnusableHashKey(key.type_name()))?;
            pairs.insert(hash_key, HashPair { key, value });
        }

        Ok(Value::Hash(Rc::new(pairs)))
    }

    fn execute_index(&mut self, left: Value, index: Value) -> VmResult<()> {
        match (&left, &index) {
            (Value::Array(elements), Value::Integer(i)) => {
                // Out-of-range (including negative) is null, not an error.
                let value = if *i < 0 || *i as usize >= elements.len() {
                    Value::Null
                } else {
                    elements[*i as usize].clone()
                };
                self.push(value)
            }
            (Value::Hash(pairs), _) => {
                let key = index
                    .hash_key()
                    .ok_or_else(|| RuntimeError::UnusableHashKey(index.type_name()))?;
                let value = pairs
                    .get(&key)
                    .map(|pair| pair.value.clone())
                    .unwrap_or(Value::Null);
                self.push(value)
            }
            _ => Err(RuntimeError::UnsupportedIndex {
                container: left.type_name(),
                index: index.type_name(),
            }),
        }
    }

    fn execute_call(&mut self, num_args: usize) -> VmResult<()> {
        if num_args + 1 > self.sp {
            return Err(RuntimeError::StackUnderflow);
        }

        // The callee sits directly below its arguments.
        let callee = self.stack[self.sp - 1 - num_args].clone();
        match callee {
            Value::Closure(closure) => self.call_closure(closure, num_args),
            Value::Builtin(builtin) => self.call_builtin(builtin, num_args),
            other => Err(RuntimeError::NotCallable(other.type_name())),
        }
    }

    fn call_closure(&mut self, closure: Rc<Closure>, num_args: usize) -> VmResult<()> {
        if num_args != closure.function.num_parameters {
            return Err(RuntimeError::WrongArity {
                want: closure.function.num_parameters,
                got: num_args,
            });
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(RuntimeError::CallDepthExceeded);
        }

        // The arguments already sit where the frame's first locals go; the
        // remaining local slots are reserved above them.
        let base_pointer = self.sp - num_args;
        let frame_top = base_pointer + closure.function.num_locals;
        if frame_top > STACK_SIZE {
            return Err(RuntimeError::StackOverflow);
        }

        self.frames.push(Frame::new(closure, base_pointer));
        self.sp = frame_top;
        Ok(())
    }

    fn call_builtin(&mut self, builtin: Builtin, num_args: usize) -> VmResult<()> {
        let args = self.stack[self.sp - num_args..self.sp].to_vec();
        let result = (builtin.func)(&args);

        // Drop the arguments and the callee slot, then push the result.
        self.sp -= num_args + 1;
        self.push(result)
    }

    fn push_closure(&mut self, const_index: usize, num_free: usize) -> VmResult<()> {
        let function = match self.constants.get(const_index) {
            Some(Value::Function(function)) => function.clone(),
            Some(_) => return Err(RuntimeError::NotAFunction(const_index)),
            None => return Err(RuntimeError::InvalidConstant(const_index)),
        };

        if num_free > self.sp {
            return Err(RuntimeError::StackUnderflow);
        }
        let free = self.stack[self.sp - num_free..self.sp].to_vec();
        self.sp -= num_free;

        self.push(Value::Closure(Rc::new(Closure { function, free })))
    }

    fn current_frame(&self) -> &Frame {
        self.frames.last().expect("call frame")
    }

    fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("call frame")
    }

    /// Read a one-byte operand (or opcode) and advance the instruction
    /// pointer.
    fn read_u8(&mut self) -> usize {
        let frame = self.current_frame_mut();
        let byte = frame.closure.function.instructions.byte(frame.ip);
        frame.ip += 1;
        byte as usize
    }

    /// Read a two-byte big-endian operand and advance the instruction
    /// pointer.
    fn read_u16(&mut self) -> usize {
        let frame = self.current_frame_mut();
        let value = frame.closure.function.instructions.read_u16(frame.ip);
        frame.ip += 2;
        value as usize
    }

    fn push(&mut self, value: Value) -> VmResult<()> {
        if self.sp >= STACK_SIZE {
            return Err(RuntimeError::StackOverflow);
        }
        self.stack[self.sp] = value;
        self.sp += 1;
        Ok(())
    }

    /// Pop the top of the stack. The slot keeps its value until overwritten,
    /// which is what makes `last_popped` work.
    fn pop(&mut self) -> VmResult<Value> {
        if self.sp == 0 {
            return Err(RuntimeError::StackUnderflow);
        }
        self.sp -= 1;
        Ok(self.stack[self.sp].clone())
    }
}
