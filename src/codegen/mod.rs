use std::fmt::Write;

use crate::vm::{
    has_imm, mnemonic, Const, Program, OP_CALL, OP_JMP, OP_JMP_IF_FALSE, OP_LOAD_VAR,
    OP_MAKE_CLOS, OP_PUSH_CONST, OP_STORE_VAR,
};

/// Human-readable listing of a compiled program: the constant pool, the
/// function table, and one line per instruction with a resolved annotation.
pub fn disassemble(program: &Program) -> String {
    let mut out = String::new();

    if !program.consts.is_empty() {
        out.push_str("; constants\n");
        for (i, c) in program.consts.iter().enumerate() {
            let text = match c {
                Const::Undefined => "undefined".to_string(),
                Const::Number(n) => n.to_string(),
                Const::Str(s) => format!("{s:?}"),
            };
            let _ = writeln!(out, ";   k{i} = {text}");
        }
    }
    if !program.funcs.is_empty() {
        out.push_str("; functions\n");
        for (i, f) in program.funcs.iter().enumerate() {
            let _ = writeln!(out, ";   fn #{i} entry={} arity={}", f.entry, f.arity);
        }
    }

    let code = &program.code;
    let mut i = 0;
    while i < code.len() {
        let op = code[i];
        let Some(name) = mnemonic(op) else {
            let _ = writeln!(out, "{i:04}  db {op}");
            i += 1;
            continue;
        };
        if !has_imm(op) {
            let _ = writeln!(out, "{i:04}  {name}");
            i += 1;
            continue;
        }
        let Some(&imm) = code.get(i + 1) else {
            let _ = writeln!(out, "{i:04}  {name} <truncated>");
            break;
        };
        let note = match op {
            OP_PUSH_CONST | OP_LOAD_VAR | OP_STORE_VAR => match program.consts.get(imm as usize) {
                Some(Const::Str(s)) => format!("; {s:?}"),
                Some(Const::Number(n)) => format!("; {n}"),
                Some(Const::Undefined) => "; undefined".to_string(),
                None => "; <bad const>".to_string(),
            },
            OP_MAKE_CLOS => match program.funcs.get(imm as usize) {
                Some(f) => format!("; fn #{imm} entry={}", f.entry),
                None => "; <bad fn>".to_string(),
            },
            OP_JMP | OP_JMP_IF_FALSE => format!("; -> {imm:04}"),
            OP_CALL => format!("; {imm} args"),
            _ => String::new(),
        };
        let _ = writeln!(out, "{i:04}  {name} {imm:<4}{note}");
        i += 2;
    }
    out
}
