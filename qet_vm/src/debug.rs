//! Bytecode disassembler.
//!
//! Renders chunks for tracing and tests. Output mirrors the classic
//! layout: offset, source line (or `|` for a continuation), mnemonic,
//! operands.

use qet_core::{Chunk, OpCode};
use qet_runtime::format_value;
use std::fmt::Write;

/// Disassemble a whole chunk under a heading.
pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (text, next) = disassemble_instruction(chunk, offset);
        out.push_str(&text);
        out.push('\n');
        offset = next;
    }
    out
}

/// Disassemble one instruction; returns the rendering and the offset of
/// the next instruction.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut out = String::new();
    let _ = write!(out, "{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        out.push_str("   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.lines[offset]);
    }

    let Some(op) = OpCode::from_byte(chunk.code[offset]) else {
        let _ = write!(out, "Unknown opcode {}", chunk.code[offset]);
        return (out, offset + 1);
    };
    let _ = write!(out, "{:<16?} ", op);

    match op {
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => {
            let constant = chunk.code[offset + 1];
            let _ = write!(
                out,
                "{:4} '{}'",
                constant,
                format_value(chunk.constants[constant as usize])
            );
            (out, offset + 2)
        }
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => {
            let _ = write!(out, "{:4}", chunk.code[offset + 1]);
            (out, offset + 2)
        }
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop => {
            let jump =
                ((chunk.code[offset + 1] as usize) << 8) | chunk.code[offset + 2] as usize;
            let target = if op == OpCode::Loop {
                offset + 3 - jump
            } else {
                offset + 3 + jump
            };
            let _ = write!(out, "{:4} -> {}", offset, target);
            (out, offset + 3)
        }
        OpCode::Invoke | OpCode::SuperInvoke => {
            let constant = chunk.code[offset + 1];
            let args = chunk.code[offset + 2];
            let _ = write!(
                out,
                "({} args) {:4} '{}'",
                args,
                constant,
                format_value(chunk.constants[constant as usize])
            );
            (out, offset + 3)
        }
        OpCode::Closure => {
            let mut cursor = offset + 1;
            let constant = chunk.code[cursor];
            cursor += 1;
            let function_value = chunk.constants[constant as usize];
            let _ = write!(out, "{:4} {}", constant, format_value(function_value));
            // One (is_local, index) pair per upvalue follows inline.
            let upvalue_count = qet_runtime::as_function_upvalue_count(function_value);
            for _ in 0..upvalue_count {
                let is_local = chunk.code[cursor];
                let index = chunk.code[cursor + 1];
                let _ = write!(
                    out,
                    "\n{:04}      |                     {} {}",
                    cursor,
                    if is_local != 0 { "local" } else { "upvalue" },
                    index
                );
                cursor += 2;
            }
            (out, cursor)
        }
        _ => (out, offset + 1),
    }
}
