//! Error types for compilation and execution.

use thiserror::Error;

/// Bytecode compilation errors.
///
/// With the operator and node inventories closed at the type level, the only
/// failure the compiler can hit on well-formed input is a name that resolves
/// to nothing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),
}

/// Runtime errors raised by the virtual machine.
///
/// Every variant is terminal for the current run: the VM halts at the first
/// error and its stack/frame state is discarded wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("stack overflow")]
    StackOverflow,

    #[error("stack underflow")]
    StackUnderflow,

    #[error("exceeded maximum call depth")]
    CallDepthExceeded,

    #[error("unsupported types for binary operation: {left} {right}")]
    UnsupportedBinaryOperands {
        left: &'static str,
        right: &'static str,
    },

    #[error("unknown comparison for types: {left} {right}")]
    UnsupportedComparison {
        left: &'static str,
        right: &'static str,
    },

    #[error("unsupported type for negation: {0}")]
    UnsupportedNegation(&'static str),

    #[error("division by zero")]
    DivisionByZero,

    #[error("unusable as hash key: {0}")]
    UnusableHashKey(&'static str),

    #[error("index operator not supported: {container}[{index}]")]
    UnsupportedIndex {
        container: &'static str,
        index: &'static str,
    },

    #[error("calling non-function: {0}")]
    NotCallable(&'static str),

    #[error("wrong number of arguments: want={want}, got={got}")]
    WrongArity { want: usize, got: usize },

    /// A `Closure` instruction referenced a constant that is not a function.
    /// Only reachable through a corrupted or hand-forged instruction stream.
    #[error("constant {0} is not a function")]
    NotAFunction(usize),

    /// An instruction referenced a constant-pool index that does not exist.
    #[error("constant index out of range: {0}")]
    InvalidConstant(usize),

    /// A `GetBuiltin` index outside the registry.
    #[error("undefined builtin: {0}")]
    UndefinedBuiltin(usize),

    /// The instruction stream contained a byte outside the opcode catalog.
    #[error("undefined opcode: {0}")]
    UndefinedOpcode(u8),
}

/// A unified error type covering the whole compile-then-run cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VesperError {
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}
