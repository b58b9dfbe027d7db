//! Bytecode compiler: transforms the syntax tree into instructions and a
//! constant pool.
//!
//! Compilation is a single recursive walk. Branches are linearized with
//! placeholder jump targets that are backpatched once the target offset is
//! known, and each compilation scope tracks its last two emitted instructions
//! so a trailing `Pop` can be elided (if-expressions) or rewritten into a
//! `ReturnValue` (implicit function results).

use std::rc::Rc;

use crate::ast::{Block, Expression, InfixOperator, PrefixOperator, Program, Statement};
use crate::bytecode::instruction::{make, Instructions, Opcode};
use crate::bytecode::symbol_table::{Symbol, SymbolScope, SymbolTable};
use crate::error::CompileError;
use crate::value::{CompiledFunction, Value};

/// Result type for compilation.
pub type CompileResult<T> = Result<T, CompileError>;

/// Operand emitted for a jump whose target is not yet known. Always rewritten
/// before compilation finishes; the value only shows up in a disassembly of a
/// compiler bug.
const PLACEHOLDER_TARGET: usize = 9999;

/// The sole handoff structure from compiler to VM. Immutable once produced;
/// may be executed repeatedly.
#[derive(Debug, Clone, PartialEq)]
pub struct Bytecode {
    pub instructions: Instructions,
    pub constants: Vec<Value>,
}

/// An emitted instruction's opcode and starting offset.
#[derive(Debug, Clone, Copy)]
struct EmittedInstruction {
    opcode: Opcode,
    position: usize,
}

/// Instruction buffer for one function being compiled.
#[derive(Debug, Default)]
struct CompilationScope {
    instructions: Instructions,
    last_instruction: Option<EmittedInstruction>,
    previous_instruction: Option<EmittedInstruction>,
}

/// The bytecode compiler.
pub struct Compiler {
    constants: Vec<Value>,
    symbol_table: SymbolTable,
    /// Stack of function scopes; index 0 is the main program.
    scopes: Vec<CompilationScope>,
}

impl Compiler {
    pub fn new() -> Self {
        Self::with_state(SymbolTable::new(), Vec::new())
    }

    /// Resume with the symbol table and constants of a previous compilation,
    /// so a REPL can keep definitions across inputs.
    pub fn with_state(symbol_table: SymbolTable, constants: Vec<Value>) -> Self {
        Compiler {
            constants,
            symbol_table,
            scopes: vec![CompilationScope::default()],
        }
    }

    /// Hand back the state for the next `with_state` round.
    pub fn into_state(self) -> (SymbolTable, Vec<Value>) {
        (self.symbol_table, self.constants)
    }

    /// Compile a program into bytecode. Compiling the same tree twice yields
    /// identical bytecode.
    pub fn compile(&mut self, program: &Program) -> CompileResult<Bytecode> {
        for statement in &program.statements {
            self.compile_statement(statement)?;
        }
        Ok(self.bytecode())
    }

    /// Snapshot the current instruction stream and constant pool.
    pub fn bytecode(&self) -> Bytecode {
        Bytecode {
            instructions: self.scope().instructions.clone(),
            constants: self.constants.clone(),
        }
    }

    fn compile_statement(&mut self, statement: &Statement) -> CompileResult<()> {
        match statement {
            Statement::Expression(expression) => {
                self.compile_expression(expression)?;
                // The value is dead after an expression statement.
                self.emit(Opcode::Pop, &[]);
            }

            Statement::Let { name, value } => {
                // Defined before the value compiles, so a global function can
                // call itself by name.
                let symbol = self.symbol_table.define(name);
                self.compile_expression(value)?;
                match symbol.scope {
                    SymbolScope::Global => self.emit(Opcode::SetGlobal, &[symbol.index]),
                    _ => self.emit(Opcode::SetLocal, &[symbol.index]),
                };
            }

            Statement::Return(value) => {
                self.compile_expression(value)?;
                self.emit(Opcode::ReturnValue, &[]);
            }
        }

        Ok(())
    }

    fn compile_block(&mut self, block: &Block) -> CompileResult<()> {
        for statement in &block.statements {
            self.compile_statement(statement)?;
        }
        Ok(())
    }

    fn compile_expression(&mut self, expression: &Expression) -> CompileResult<()> {
        match expression {
            Expression::Identifier(name) => {
                let symbol = self
                    .symbol_table
                    .resolve(name)
                    .ok_or_else(|| CompileError::UndefinedVariable(name.clone()))?;
                self.load_symbol(&symbol);
            }

            Expression::IntegerLiteral(value) => {
                let index = self.add_constant(Value::Integer(*value));
                self.emit(Opcode::Constant, &[index]);
            }

            Expression::StringLiteral(value) => {
                let index = self.add_constant(Value::String(Rc::new(value.clone())));
                self.emit(Opcode::Constant, &[index]);
            }

            Expression::BooleanLiteral(value) => {
                if *value {
                    self.emit(Opcode::True, &[]);
                } else {
                    self.emit(Opcode::False, &[]);
                }
            }

            Expression::ArrayLiteral(elements) => {
                for element in elements {
                    self.compile_expression(element)?;
                }
                self.emit(Opcode::Array, &[elements.len()]);
            }

            Expression::HashLiteral(pairs) => {
                for (key, value) in pairs {
                    self.compile_expression(key)?;
                    self.compile_expression(value)?;
                }
                self.emit(Opcode::Hash, &[pairs.len() * 2]);
            }

            Expression::Prefix { operator, right } => {
                self.compile_expression(right)?;
                match operator {
                    PrefixOperator::Minus => self.emit(Opcode::Minus, &[]),
                    PrefixOperator::Bang => self.emit(Opcode::Bang, &[]),
                };
            }

            Expression::Infix {
                operator,
                left,
                right,
            } => {
                self.compile_expression(left)?;
                self.compile_expression(right)?;
                let opcode = match operator {
                    InfixOperator::Add => Opcode::Add,
                    InfixOperator::Subtract => Opcode::Sub,
                    InfixOperator::Multiply => Opcode::Mul,
                    InfixOperator::Divide => Opcode::Div,
                    InfixOperator::Equal => Opcode::Equal,
                    InfixOperator::NotEqual => Opcode::NotEqual,
                    InfixOperator::LessThan => Opcode::LessThan,
                    InfixOperator::GreaterThan => Opcode::GreaterThan,
                };
                self.emit(opcode, &[]);
            }

            Expression::If {
                condition,
                consequence,
                alternative,
            } => {
                self.compile_expression(condition)?;

                let jump_not_truthy = self.emit(Opcode::JumpNotTruthy, &[PLACEHOLDER_TARGET]);

                self.compile_block(consequence)?;
                // Keep the branch's last value on the stack: it is the
                // if-expression's result.
                if self.last_instruction_is(Opcode::Pop) {
                    self.remove_last_pop();
                }

                let jump = self.emit(Opcode::Jump, &[PLACEHOLDER_TARGET]);

                let after_consequence = self.scope().instructions.len();
                self.change_operand(jump_not_truthy, after_consequence);

                match alternative {
                    // Every if-expression produces exactly one value.
                    None => {
                        self.emit(Opcode::Null, &[]);
                    }
                    Some(alternative) => {
                        self.compile_block(alternative)?;
                        if self.last_instruction_is(Opcode::Pop) {
                            self.remove_last_pop();
                        }
                    }
                }

                let after_alternative = self.scope().instructions.len();
                self.change_operand(jump, after_alternative);
            }

            Expression::FunctionLiteral { parameters, body } => {
                self.enter_scope();

                for parameter in parameters {
                    self.symbol_table.define(parameter);
                }

                self.compile_block(body)?;

                // A trailing expression statement is the implicit return
                // value; an empty or non-value body returns null.
                if self.last_instruction_is(Opcode::Pop) {
                    self.replace_last_pop_with_return();
                }
                if !self.last_instruction_is(Opcode::ReturnValue) {
                    self.emit(Opcode::Return, &[]);
                }

                let free_symbols = self.symbol_table.free_symbols().to_vec();
                let num_locals = self.symbol_table.num_definitions();
                let instructions = self.leave_scope();

                // Put the captured values on the stack for Closure to pick up.
                for symbol in &free_symbols {
                    self.load_symbol(symbol);
                }

                let function = CompiledFunction {
                    instructions,
                    num_locals,
                    num_parameters: parameters.len(),
                };
                let index = self.add_constant(Value::Function(Rc::new(function)));
                self.emit(Opcode::Closure, &[index, free_symbols.len()]);
            }

            Expression::Call {
                function,
                arguments,
            } => {
                self.compile_expression(function)?;
                for argument in arguments {
                    self.compile_expression(argument)?;
                }
                self.emit(Opcode::Call, &[arguments.len()]);
            }

            Expression::Index { left, index } => {
                self.compile_expression(left)?;
                self.compile_expression(index)?;
                self.emit(Opcode::Index, &[]);
            }
        }

        Ok(())
    }

    fn load_symbol(&mut self, symbol: &Symbol) {
        match symbol.scope {
            SymbolScope::Global => self.emit(Opcode::GetGlobal, &[symbol.index]),
            SymbolScope::Local => self.emit(Opcode::GetLocal, &[symbol.index]),
            SymbolScope::Free => self.emit(Opcode::GetFree, &[symbol.index]),
            SymbolScope::Builtin => self.emit(Opcode::GetBuiltin, &[symbol.index]),
        };
    }

    /// Append `value` to the constant pool and return its index.
    fn add_constant(&mut self, value: Value) -> usize {
        let index = self.constants.len();
        assert!(index < 65536, "too many constants");
        self.constants.push(value);
        index
    }

    /// Encode and append an instruction, returning its starting offset.
    fn emit(&mut self, op: Opcode, operands: &[usize]) -> usize {
        let instruction = make(op, operands);
        let position = self.scope_mut().instructions.append(&instruction);
        self.set_last_instruction(op, position);
        position
    }

    fn set_last_instruction(&mut self, opcode: Opcode, position: usize) {
        let scope = self.scope_mut();
        scope.previous_instruction = scope.last_instruction;
        scope.last_instruction = Some(EmittedInstruction { opcode, position });
    }

    fn last_instruction_is(&self, op: Opcode) -> bool {
        matches!(self.scope().last_instruction, Some(last) if last.opcode == op)
    }

    fn remove_last_pop(&mut self) {
        let scope = self.scope_mut();
        if let Some(last) = scope.last_instruction {
            scope.instructions.truncate(last.position);
            scope.last_instruction = scope.previous_instruction;
        }
    }

    fn replace_last_pop_with_return(&mut self) {
        if let Some(last) = self.scope().last_instruction {
            let instruction = make(Opcode::ReturnValue, &[]);
            let scope = self.scope_mut();
            scope.instructions.replace(last.position, &instruction);
            scope.last_instruction = Some(EmittedInstruction {
                opcode: Opcode::ReturnValue,
                position: last.position,
            });
        }
    }

    /// Rewrite the operand of the jump at `position` in place, preserving
    /// instruction length.
    fn change_operand(&mut self, position: usize, operand: usize) {
        let opcode = Opcode::from_u8(self.scope().instructions.byte(position))
            .expect("patch target starts at an instruction");
        let instruction = make(opcode, &[operand]);
        self.scope_mut().instructions.replace(position, &instruction);
    }

    fn enter_scope(&mut self) {
        self.scopes.push(CompilationScope::default());
        let outer = std::mem::take(&mut self.symbol_table);
        self.symbol_table = SymbolTable::new_enclosed(outer);
    }

    fn leave_scope(&mut self) -> Instructions {
        let scope = self.scopes.pop().expect("compilation scope");
        let table = std::mem::take(&mut self.symbol_table);
        self.symbol_table = table.into_outer().expect("enclosed symbol table");
        scope.instructions
    }

    fn scope(&self) -> &CompilationScope {
        self.scopes.last().expect("compilation scope")
    }

    fn scope_mut(&mut self) -> &mut CompilationScope {
        self.scopes.last_mut().expect("compilation scope")
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Block, Expression, InfixOperator, PrefixOperator, Program, Statement};
    use pretty_assertions::assert_eq;

    fn int(value: i64) -> Expression {
        Expression::IntegerLiteral(value)
    }

    fn string(value: &str) -> Expression {
        Expression::StringLiteral(value.to_string())
    }

    fn ident(name: &str) -> Expression {
        Expression::Identifier(name.to_string())
    }

    fn infix(operator: InfixOperator, left: Expression, right: Expression) -> Expression {
        Expression::Infix {
            operator,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn prefix(operator: PrefixOperator, right: Expression) -> Expression {
        Expression::Prefix {
            operator,
            right: Box::new(right),
        }
    }

    fn call(function: Expression, arguments: Vec<Expression>) -> Expression {
        Expression::Call {
            function: Box::new(function),
            arguments,
        }
    }

    fn function(parameters: &[&str], body: Vec<Statement>) -> Expression {
        Expression::FunctionLiteral {
            parameters: parameters.iter().map(|p| p.to_string()).collect(),
            body: Block { statements: body },
        }
    }

    fn let_stmt(name: &str, value: Expression) -> Statement {
        Statement::Let {
            name: name.to_string(),
            value,
        }
    }

    fn expr(expression: Expression) -> Statement {
        Statement::Expression(expression)
    }

    fn program(statements: Vec<Statement>) -> Program {
        Program { statements }
    }

    fn compile(program: &Program) -> Bytecode {
        Compiler::new().compile(program).expect("compile error")
    }

    fn concat(instructions: Vec<Vec<u8>>) -> Instructions {
        let mut out = Instructions::new();
        for instruction in &instructions {
            out.append(instruction);
        }
        out
    }

    /// Pull a compiled function out of the constant pool.
    fn function_constant(bytecode: &Bytecode, index: usize) -> Rc<CompiledFunction> {
        match &bytecode.constants[index] {
            Value::Function(function) => function.clone(),
            other => panic!("constant {} is {:?}, expected function", index, other),
        }
    }

    #[test]
    fn integer_arithmetic() {
        let bytecode = compile(&program(vec![expr(infix(
            InfixOperator::Add,
            int(1),
            int(2),
        ))]));

        assert_eq!(bytecode.constants, vec![Value::Integer(1), Value::Integer(2)]);
        assert_eq!(
            bytecode.instructions,
            concat(vec![
                make(Opcode::Constant, &[0]),
                make(Opcode::Constant, &[1]),
                make(Opcode::Add, &[]),
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn expression_statements_pop_their_value() {
        let bytecode = compile(&program(vec![expr(int(1)), expr(int(2))]));

        assert_eq!(
            bytecode.instructions,
            concat(vec![
                make(Opcode::Constant, &[0]),
                make(Opcode::Pop, &[]),
                make(Opcode::Constant, &[1]),
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn prefix_expressions() {
        let bytecode = compile(&program(vec![
            expr(prefix(PrefixOperator::Minus, int(1))),
            expr(prefix(PrefixOperator::Bang, Expression::BooleanLiteral(true))),
        ]));

        assert_eq!(
            bytecode.instructions,
            concat(vec![
                make(Opcode::Constant, &[0]),
                make(Opcode::Minus, &[]),
                make(Opcode::Pop, &[]),
                make(Opcode::True, &[]),
                make(Opcode::Bang, &[]),
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn comparison_operators_emit_directly() {
        // `<` has its own opcode; operands are never swapped.
        let bytecode = compile(&program(vec![expr(infix(
            InfixOperator::LessThan,
            int(1),
            int(2),
        ))]));

        assert_eq!(
            bytecode.instructions,
            concat(vec![
                make(Opcode::Constant, &[0]),
                make(Opcode::Constant, &[1]),
                make(Opcode::LessThan, &[]),
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn conditional_without_alternative() {
        // if (true) { 10 }; 3333;
        let bytecode = compile(&program(vec![
            expr(Expression::If {
                condition: Box::new(Expression::BooleanLiteral(true)),
                consequence: Block {
                    statements: vec![expr(int(10))],
                },
                alternative: None,
            }),
            expr(int(3333)),
        ]));

        assert_eq!(
            bytecode.instructions,
            concat(vec![
                // 0000
                make(Opcode::True, &[]),
                // 0001, over the consequence to the implicit null
                make(Opcode::JumpNotTruthy, &[10]),
                // 0004
                make(Opcode::Constant, &[0]),
                // 0007, over the implicit null
                make(Opcode::Jump, &[11]),
                // 0010
                make(Opcode::Null, &[]),
                // 0011
                make(Opcode::Pop, &[]),
                // 0012
                make(Opcode::Constant, &[1]),
                // 0015
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn conditional_with_alternative() {
        // if (true) { 10 } else { 20 }; 3333;
        let bytecode = compile(&program(vec![
            expr(Expression::If {
                condition: Box::new(Expression::BooleanLiteral(true)),
                consequence: Block {
                    statements: vec![expr(int(10))],
                },
                alternative: Some(Block {
                    statements: vec![expr(int(20))],
                }),
            }),
            expr(int(3333)),
        ]));

        assert_eq!(
            bytecode.instructions,
            concat(vec![
                // 0000
                make(Opcode::True, &[]),
                // 0001
                make(Opcode::JumpNotTruthy, &[10]),
                // 0004
                make(Opcode::Constant, &[0]),
                // 0007
                make(Opcode::Jump, &[13]),
                // 0010
                make(Opcode::Constant, &[1]),
                // 0013
                make(Opcode::Pop, &[]),
                // 0014
                make(Opcode::Constant, &[2]),
                // 0017
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn global_let_statements() {
        let bytecode = compile(&program(vec![
            let_stmt("one", int(1)),
            let_stmt("two", int(2)),
            expr(ident("one")),
        ]));

        assert_eq!(
            bytecode.instructions,
            concat(vec![
                make(Opcode::Constant, &[0]),
                make(Opcode::SetGlobal, &[0]),
                make(Opcode::Constant, &[1]),
                make(Opcode::SetGlobal, &[1]),
                make(Opcode::GetGlobal, &[0]),
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn undefined_variable_is_a_compile_error() {
        let result = Compiler::new().compile(&program(vec![expr(ident("nope"))]));

        assert_eq!(
            result.unwrap_err(),
            CompileError::UndefinedVariable("nope".to_string())
        );
    }

    #[test]
    fn string_expressions() {
        let bytecode = compile(&program(vec![expr(infix(
            InfixOperator::Add,
            string("ves"),
            string("per"),
        ))]));

        assert_eq!(
            bytecode.constants,
            vec![
                Value::String(Rc::new("ves".to_string())),
                Value::String(Rc::new("per".to_string())),
            ]
        );
        assert_eq!(
            bytecode.instructions,
            concat(vec![
                make(Opcode::Constant, &[0]),
                make(Opcode::Constant, &[1]),
                make(Opcode::Add, &[]),
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn array_literals() {
        let bytecode = compile(&program(vec![expr(Expression::ArrayLiteral(vec![
            int(1),
            infix(InfixOperator::Add, int(2), int(3)),
        ]))]));

        assert_eq!(
            bytecode.instructions,
            concat(vec![
                make(Opcode::Constant, &[0]),
                make(Opcode::Constant, &[1]),
                make(Opcode::Constant, &[2]),
                make(Opcode::Add, &[]),
                make(Opcode::Array, &[2]),
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn hash_literals() {
        let bytecode = compile(&program(vec![expr(Expression::HashLiteral(vec![
            (int(1), int(2)),
            (int(3), int(4)),
        ]))]));

        // Keys and values interleave in source order; the operand counts
        // values, not pairs.
        assert_eq!(
            bytecode.instructions,
            concat(vec![
                make(Opcode::Constant, &[0]),
                make(Opcode::Constant, &[1]),
                make(Opcode::Constant, &[2]),
                make(Opcode::Constant, &[3]),
                make(Opcode::Hash, &[4]),
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn index_expressions() {
        let bytecode = compile(&program(vec![expr(Expression::Index {
            left: Box::new(Expression::ArrayLiteral(vec![int(1), int(2)])),
            index: Box::new(int(0)),
        })]));

        assert_eq!(
            bytecode.instructions,
            concat(vec![
                make(Opcode::Constant, &[0]),
                make(Opcode::Constant, &[1]),
                make(Opcode::Array, &[2]),
                make(Opcode::Constant, &[2]),
                make(Opcode::Index, &[]),
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn functions_return_their_last_expression() {
        let bytecode = compile(&program(vec![expr(function(
            &[],
            vec![expr(infix(InfixOperator::Add, int(5), int(10)))],
        ))]));

        let body = function_constant(&bytecode, 2);
        assert_eq!(
            body.instructions,
            concat(vec![
                make(Opcode::Constant, &[0]),
                make(Opcode::Constant, &[1]),
                make(Opcode::Add, &[]),
                make(Opcode::ReturnValue, &[]),
            ])
        );
        assert_eq!(
            bytecode.instructions,
            concat(vec![make(Opcode::Closure, &[2, 0]), make(Opcode::Pop, &[])])
        );
    }

    #[test]
    fn explicit_return_compiles_the_same() {
        let bytecode = compile(&program(vec![expr(function(
            &[],
            vec![Statement::Return(int(5))],
        ))]));

        let body = function_constant(&bytecode, 1);
        assert_eq!(
            body.instructions,
            concat(vec![
                make(Opcode::Constant, &[0]),
                make(Opcode::ReturnValue, &[]),
            ])
        );
    }

    #[test]
    fn empty_function_body_returns_null() {
        let bytecode = compile(&program(vec![expr(function(&[], vec![]))]));

        let body = function_constant(&bytecode, 0);
        assert_eq!(body.instructions, concat(vec![make(Opcode::Return, &[])]));
    }

    #[test]
    fn function_calls() {
        // let oneArg = fn(a) { a }; oneArg(24);
        let bytecode = compile(&program(vec![
            let_stmt("oneArg", function(&["a"], vec![expr(ident("a"))])),
            expr(call(ident("oneArg"), vec![int(24)])),
        ]));

        let body = function_constant(&bytecode, 0);
        assert_eq!(
            body.instructions,
            concat(vec![
                make(Opcode::GetLocal, &[0]),
                make(Opcode::ReturnValue, &[]),
            ])
        );
        assert_eq!(body.num_parameters, 1);
        assert_eq!(body.num_locals, 1);

        assert_eq!(
            bytecode.instructions,
            concat(vec![
                make(Opcode::Closure, &[0, 0]),
                make(Opcode::SetGlobal, &[0]),
                make(Opcode::GetGlobal, &[0]),
                make(Opcode::Constant, &[1]),
                make(Opcode::Call, &[1]),
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn let_statements_inside_functions_use_locals() {
        // fn() { let num = 55; num }
        let bytecode = compile(&program(vec![expr(function(
            &[],
            vec![let_stmt("num", int(55)), expr(ident("num"))],
        ))]));

        let body = function_constant(&bytecode, 1);
        assert_eq!(body.num_locals, 1);
        assert_eq!(
            body.instructions,
            concat(vec![
                make(Opcode::Constant, &[0]),
                make(Opcode::SetLocal, &[0]),
                make(Opcode::GetLocal, &[0]),
                make(Opcode::ReturnValue, &[]),
            ])
        );
    }

    #[test]
    fn globals_referenced_from_functions_stay_global() {
        // let num = 55; fn() { num }
        let bytecode = compile(&program(vec![
            let_stmt("num", int(55)),
            expr(function(&[], vec![expr(ident("num"))])),
        ]));

        let body = function_constant(&bytecode, 1);
        assert_eq!(
            body.instructions,
            concat(vec![
                make(Opcode::GetGlobal, &[0]),
                make(Opcode::ReturnValue, &[]),
            ])
        );
    }

    #[test]
    fn builtins_resolve_to_the_registry() {
        // len([]); push([], 1);
        let bytecode = compile(&program(vec![
            expr(call(ident("len"), vec![Expression::ArrayLiteral(vec![])])),
            expr(call(
                ident("push"),
                vec![Expression::ArrayLiteral(vec![]), int(1)],
            )),
        ]));

        assert_eq!(
            bytecode.instructions,
            concat(vec![
                make(Opcode::GetBuiltin, &[0]),
                make(Opcode::Array, &[0]),
                make(Opcode::Call, &[1]),
                make(Opcode::Pop, &[]),
                make(Opcode::GetBuiltin, &[4]),
                make(Opcode::Array, &[0]),
                make(Opcode::Constant, &[0]),
                make(Opcode::Call, &[2]),
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn closures_capture_enclosing_locals() {
        // fn(a) { fn(b) { a + b } }
        let bytecode = compile(&program(vec![expr(function(
            &["a"],
            vec![expr(function(
                &["b"],
                vec![expr(infix(InfixOperator::Add, ident("a"), ident("b")))],
            ))],
        ))]));

        let inner = function_constant(&bytecode, 0);
        assert_eq!(
            inner.instructions,
            concat(vec![
                make(Opcode::GetFree, &[0]),
                make(Opcode::GetLocal, &[0]),
                make(Opcode::Add, &[]),
                make(Opcode::ReturnValue, &[]),
            ])
        );

        let outer = function_constant(&bytecode, 1);
        assert_eq!(
            outer.instructions,
            concat(vec![
                make(Opcode::GetLocal, &[0]),
                make(Opcode::Closure, &[0, 1]),
                make(Opcode::ReturnValue, &[]),
            ])
        );

        assert_eq!(
            bytecode.instructions,
            concat(vec![make(Opcode::Closure, &[1, 0]), make(Opcode::Pop, &[])])
        );
    }

    #[test]
    fn deeply_nested_closures_capture_through_intermediates() {
        // fn(a) { fn(b) { fn(c) { a + b + c } } }
        let bytecode = compile(&program(vec![expr(function(
            &["a"],
            vec![expr(function(
                &["b"],
                vec![expr(function(
                    &["c"],
                    vec![expr(infix(
                        InfixOperator::Add,
                        infix(InfixOperator::Add, ident("a"), ident("b")),
                        ident("c"),
                    ))],
                ))],
            ))],
        ))]));

        let innermost = function_constant(&bytecode, 0);
        assert_eq!(
            innermost.instructions,
            concat(vec![
                make(Opcode::GetFree, &[0]),
                make(Opcode::GetFree, &[1]),
                make(Opcode::Add, &[]),
                make(Opcode::GetLocal, &[0]),
                make(Opcode::Add, &[]),
                make(Opcode::ReturnValue, &[]),
            ])
        );

        // The middle function forwards its own capture of `a` plus its local
        // `b` into the innermost closure.
        let middle = function_constant(&bytecode, 1);
        assert_eq!(
            middle.instructions,
            concat(vec![
                make(Opcode::GetFree, &[0]),
                make(Opcode::GetLocal, &[0]),
                make(Opcode::Closure, &[0, 2]),
                make(Opcode::ReturnValue, &[]),
            ])
        );

        let outermost = function_constant(&bytecode, 2);
        assert_eq!(
            outermost.instructions,
            concat(vec![
                make(Opcode::GetLocal, &[0]),
                make(Opcode::Closure, &[1, 1]),
                make(Opcode::ReturnValue, &[]),
            ])
        );
    }

    #[test]
    fn compilation_is_deterministic() {
        let tree = program(vec![
            let_stmt("x", int(5)),
            expr(call(
                function(&["y"], vec![expr(infix(InfixOperator::Add, ident("x"), ident("y")))]),
                vec![int(2)],
            )),
        ]);

        let first = compile(&tree);
        let second = compile(&tree);

        assert_eq!(first.instructions, second.instructions);
        assert_eq!(first.constants, second.constants);
    }

    #[test]
    fn compiler_scopes_track_emission_targets() {
        let mut compiler = Compiler::new();
        assert_eq!(compiler.scopes.len(), 1);

        compiler.emit(Opcode::Mul, &[]);

        compiler.enter_scope();
        assert_eq!(compiler.scopes.len(), 2);

        compiler.emit(Opcode::Sub, &[]);
        assert_eq!(compiler.scope().instructions.len(), 1);
        assert_eq!(
            compiler.scope().last_instruction.map(|last| last.opcode),
            Some(Opcode::Sub)
        );
        assert!(!compiler.symbol_table.is_root());

        compiler.leave_scope();
        assert_eq!(compiler.scopes.len(), 1);
        assert!(compiler.symbol_table.is_root());

        compiler.emit(Opcode::Add, &[]);
        assert_eq!(compiler.scope().instructions.len(), 2);
        assert_eq!(
            compiler.scope().last_instruction.map(|last| last.opcode),
            Some(Opcode::Add)
        );
        assert_eq!(
            compiler.scope().previous_instruction.map(|prev| prev.opcode),
            Some(Opcode::Mul)
        );
    }

    #[test]
    fn with_state_carries_definitions_across_compiles() {
        let mut first = Compiler::new();
        first
            .compile(&program(vec![let_stmt("x", int(1))]))
            .expect("compile error");
        let (table, constants) = first.into_state();

        let mut second = Compiler::with_state(table, constants);
        let bytecode = second
            .compile(&program(vec![expr(ident("x"))]))
            .expect("x is still defined");

        assert_eq!(
            bytecode.instructions,
            concat(vec![make(Opcode::GetGlobal, &[0]), make(Opcode::Pop, &[])])
        );
    }
}
