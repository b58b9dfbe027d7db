//! Bytecode backend for Vesper.
//!
//! The syntax tree is lowered to a compact linear instruction stream plus a
//! constant pool, then executed by a stack-based virtual machine.
//!
//! # Architecture
//!
//! - `instruction`: opcode catalog and byte-level encode/decode
//! - `symbol_table`: scope-aware name-to-slot resolution
//! - `compiler`: transforms the AST into a [`Bytecode`] artifact
//! - `vm`: stack-based virtual machine executing that artifact
//! - `disassembler`: human-readable bytecode inspection

pub mod compiler;
pub mod disassembler;
pub mod instruction;
pub mod symbol_table;
pub mod vm;

pub use compiler::{Bytecode, Compiler};
pub use disassembler::disassemble;
pub use instruction::{Instructions, Opcode};
pub use symbol_table::{Symbol, SymbolScope, SymbolTable};
pub use vm::Vm;
