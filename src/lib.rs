//! Vesper: a small dynamically-typed scripting language.
//!
//! This crate is the language's execution backend. An external parser
//! produces an [`ast::Program`]; the [`bytecode::Compiler`] lowers it to a
//! [`Bytecode`] artifact (linear instructions plus a constant pool), and the
//! [`bytecode::Vm`] executes that artifact against the runtime [`Value`]
//! model. A REPL-style caller drives the pair through [`compile`] and [`run`],
//! or holds compiler/VM state itself to keep definitions across inputs.

pub mod ast;
pub mod bytecode;
pub mod error;
pub mod value;

pub use bytecode::{Bytecode, Compiler, Vm};
pub use error::VesperError;
pub use value::Value;

/// Compile a program into bytecode. Deterministic: the same tree always
/// yields identical bytecode.
pub fn compile(program: &ast::Program) -> Result<Bytecode, VesperError> {
    let mut compiler = Compiler::new();
    Ok(compiler.compile(program)?)
}

/// Compile and execute a program, returning its value: the stack top left
/// behind by the last expression statement.
pub fn run(program: &ast::Program) -> Result<Value, VesperError> {
    let bytecode = compile(program)?;
    let mut vm = Vm::new(bytecode);
    vm.run()?;
    Ok(vm.last_popped().clone())
}
