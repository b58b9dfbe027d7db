//! Human-readable rendering of instruction streams.

use std::fmt::Write;

use crate::bytecode::instruction::{read_operands, Instructions, Opcode};
use crate::value::Value;

/// Disassemble a whole instruction stream, one instruction per line:
/// `{offset:04} {mnemonic} {operands…}`. Constant operands are annotated with
/// the referenced value when the pool is provided.
///
/// Malformed input produces `ERROR:` lines instead of panicking, so a partial
/// or corrupted stream can still be inspected.
pub fn disassemble(instructions: &Instructions, constants: &[Value]) -> String {
    let mut output = String::new();
    let mut offset = 0;

    while offset < instructions.len() {
        offset = disassemble_instruction(instructions, offset, constants, &mut output);
    }

    output
}

/// Render the instruction at `offset`, returning the offset of the next one.
fn disassemble_instruction(
    instructions: &Instructions,
    offset: usize,
    constants: &[Value],
    output: &mut String,
) -> usize {
    write!(output, "{:04} ", offset).expect("writing to a String");

    let byte = instructions.byte(offset);
    let opcode = match Opcode::from_u8(byte) {
        Some(opcode) => opcode,
        None => {
            writeln!(output, "ERROR: undefined opcode {}", byte).expect("writing to a String");
            return offset + 1;
        }
    };

    let operand_len: usize = opcode.operand_widths().iter().sum();
    if offset + 1 + operand_len > instructions.len() {
        writeln!(output, "ERROR: truncated operands for {:?}", opcode)
            .expect("writing to a String");
        return instructions.len();
    }

    let (operands, _) = read_operands(opcode, &instructions.as_bytes()[offset + 1..]);

    match operands.len() {
        0 => writeln!(output, "{:?}", opcode),
        1 => {
            write!(output, "{:?} {}", opcode, operands[0]).expect("writing to a String");
            if opcode == Opcode::Constant {
                if let Some(constant) = constants.get(operands[0]) {
                    write!(output, " ({})", constant).expect("writing to a String");
                }
            }
            writeln!(output)
        }
        2 => writeln!(output, "{:?} {} {}", opcode, operands[0], operands[1]),
        n => writeln!(output, "ERROR: unhandled operand count {} for {:?}", n, opcode),
    }
    .expect("writing to a String");

    offset + 1 + operand_len
}
