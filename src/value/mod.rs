//! Runtime values for the Vesper VM.
//!
//! `Value` is a closed sum type: every consumption site (arithmetic,
//! comparison, indexing, hashing) matches exhaustively, so adding a variant
//! forces an audit of all of them. Heap payloads sit behind `Rc` so cloning a
//! value is cheap and containers share structure; values are immutable once
//! built.

pub mod builtins;

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode::instruction::Instructions;

pub use builtins::{Builtin, BuiltinFn};

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    String(Rc<String>),
    Boolean(bool),
    Null,
    /// Ordered, immutable element sequence.
    Array(Rc<Vec<Value>>),
    /// Hash map keyed by [`HashKey`]; pairs iterate in insertion order.
    Hash(Rc<IndexMap<HashKey, HashPair>>),
    /// A compiled function, as stored in the constant pool.
    Function(Rc<CompiledFunction>),
    /// A function bundled with its captured free variables.
    Closure(Rc<Closure>),
    /// A native function from the builtin registry.
    Builtin(Builtin),
    /// An error produced by a builtin; travels the stack like any value.
    Error(Rc<String>),
}

/// A function compiled to bytecode.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFunction {
    pub instructions: Instructions,
    /// Stack-window slots the function needs, parameters included.
    pub num_locals: usize,
    pub num_parameters: usize,
}

/// A closure: the compiled function plus its free variables, copied at
/// creation time. The capture vector is never written after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Closure {
    pub function: Rc<CompiledFunction>,
    pub free: Vec<Value>,
}

/// Key derived from a hashable value. Equal values always derive equal keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashKey {
    pub kind: HashKind,
    pub value: u64,
}

/// Type tag of a hash key, so equal bit patterns of different types (e.g.
/// `1` and `true`) stay distinct keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashKind {
    Integer,
    String,
    Boolean,
}

/// A key/value entry of a hash, keeping the original key value around for
/// display.
#[derive(Debug, Clone, PartialEq)]
pub struct HashPair {
    pub key: Value,
    pub value: Value,
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a: stable across runs, unlike std's randomly seeded hasher.
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

impl Value {
    /// The value's type tag, as used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "Integer",
            Value::String(_) => "String",
            Value::Boolean(_) => "Boolean",
            Value::Null => "Null",
            Value::Array(_) => "Array",
            Value::Hash(_) => "Hash",
            Value::Function(_) => "Function",
            Value::Closure(_) => "Closure",
            Value::Builtin(_) => "Builtin",
            Value::Error(_) => "Error",
        }
    }

    /// Only `false` and `null` are falsy; zero and empty containers are not.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Boolean(b) => *b,
            Value::Null => false,
            _ => true,
        }
    }

    /// Derive the hash key, or `None` for unhashable variants.
    pub fn hash_key(&self) -> Option<HashKey> {
        match self {
            Value::Integer(n) => Some(HashKey {
                kind: HashKind::Integer,
                value: *n as u64,
            }),
            Value::String(s) => Some(HashKey {
                kind: HashKind::String,
                value: fnv1a(s.as_bytes()),
            }),
            Value::Boolean(b) => Some(HashKey {
                kind: HashKind::Boolean,
                value: u64::from(*b),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Null => write!(f, "null"),
            Value::Array(elements) => {
                write!(f, "[")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", element)?;
                }
                write!(f, "]")
            }
            Value::Hash(pairs) => {
                write!(f, "{{")?;
                for (i, pair) in pairs.values().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", pair.key, pair.value)?;
                }
                write!(f, "}}")
            }
            Value::Function(function) => write!(f, "<fn/{}>", function.num_parameters),
            Value::Closure(closure) => write!(f, "<fn/{}>", closure.function.num_parameters),
            Value::Builtin(builtin) => write!(f, "<builtin {}>", builtin.name),
            Value::Error(message) => write!(f, "ERROR: {}", message),
        }
    }
}
