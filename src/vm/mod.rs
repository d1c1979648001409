use std::io::Write;
use std::rc::Rc;

use serde::Serialize;

use crate::image::vmp::{mask, VmpImage};

pub mod builtins;
pub mod env;
pub mod value;

use builtins::Builtins;
use env::Env;
use value::{Closure, Value};

// ── Opcodes ──────────────────────────────────────────────────────────
//
// Stable plain-container assignment: bytes 1..=21 in the order below.
// 0 is reserved in both container variants and never appears in code.

pub(crate) const OP_PUSH_CONST: u8 = 1;
pub(crate) const OP_LOAD_VAR: u8 = 2;
pub(crate) const OP_STORE_VAR: u8 = 3;
pub(crate) const OP_ADD: u8 = 4;
pub(crate) const OP_SUB: u8 = 5;
pub(crate) const OP_MUL: u8 = 6;
pub(crate) const OP_DIV: u8 = 7;
pub(crate) const OP_EQ: u8 = 8;
pub(crate) const OP_NE: u8 = 9;
pub(crate) const OP_LT: u8 = 10;
pub(crate) const OP_GT: u8 = 11;
pub(crate) const OP_LE: u8 = 12;
pub(crate) const OP_GE: u8 = 13;
pub(crate) const OP_PRINT: u8 = 14;
pub(crate) const OP_POP: u8 = 15;
pub(crate) const OP_MAKE_CLOS: u8 = 16;
pub(crate) const OP_CALL: u8 = 17;
pub(crate) const OP_RET: u8 = 18;
pub(crate) const OP_JMP: u8 = 19;
pub(crate) const OP_JMP_IF_FALSE: u8 = 20;
pub(crate) const OP_HALT: u8 = 21;

/// Number of logical opcodes; the protected permutation is drawn over
/// `1..=OPCODE_COUNT`.
pub(crate) const OPCODE_COUNT: usize = 21;

/// Whether a logical opcode carries a 1-byte immediate.
pub(crate) fn has_imm(op: u8) -> bool {
    matches!(
        op,
        OP_PUSH_CONST
            | OP_LOAD_VAR
            | OP_STORE_VAR
            | OP_MAKE_CLOS
            | OP_CALL
            | OP_JMP
            | OP_JMP_IF_FALSE
    )
}

pub(crate) fn mnemonic(op: u8) -> Option<&'static str> {
    Some(match op {
        OP_PUSH_CONST => "push_const",
        OP_LOAD_VAR => "load_var",
        OP_STORE_VAR => "store_var",
        OP_ADD => "add",
        OP_SUB => "sub",
        OP_MUL => "mul",
        OP_DIV => "div",
        OP_EQ => "eq",
        OP_NE => "ne",
        OP_LT => "lt",
        OP_GT => "gt",
        OP_LE => "le",
        OP_GE => "ge",
        OP_PRINT => "print",
        OP_POP => "pop",
        OP_MAKE_CLOS => "make_clos",
        OP_CALL => "call",
        OP_RET => "ret",
        OP_JMP => "jmp",
        OP_JMP_IF_FALSE => "jmp_if_false",
        OP_HALT => "halt",
        _ => return None,
    })
}

// ── Compiled program ─────────────────────────────────────────────────

/// A pool constant. Only these three kinds exist in the container format.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Const {
    Undefined,
    Number(f64),
    Str(String),
}

impl Const {
    pub(crate) fn to_value(&self) -> Value {
        match self {
            Const::Undefined => Value::Undefined,
            Const::Number(n) => Value::Number(*n),
            Const::Str(s) => Value::Str(s.clone()),
        }
    }
}

/// `params` holds constant-pool indices of parameter-name strings; binding
/// happens at call time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FuncDescriptor {
    pub entry: u32,
    pub arity: u32,
    pub params: Vec<u8>,
}

/// The `(code, constant pool, function table)` triple every stage of the
/// pipeline exchanges.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Program {
    pub code: Vec<u8>,
    pub consts: Vec<Const>,
    pub funcs: Vec<FuncDescriptor>,
}

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Undefined variable: {0}")]
    UndefinedVariable(String),
    #[error("Not callable")]
    NotCallable,
    #[error("arity mismatch: expect {expect}, got {got}")]
    ArityMismatch { expect: u32, got: u32 },
    #[error("Bad opcode {0}")]
    BadOpcode(u8),
    #[error("Unknown physical opcode: {opcode} at position {position}")]
    UnknownPhysOpcode { opcode: u8, position: usize },
    #[error("stack underflow")]
    StackUnderflow,
    #[error("code stream ended mid-instruction")]
    TruncatedCode,
    #[error("constant index {0} out of range")]
    BadConstIndex(u8),
    #[error("function index {0} out of range")]
    BadFuncIndex(u8),
    #[error("variable name constant must be a string")]
    BadNameConst,
    #[error("{0}")]
    Host(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ── Machine ──────────────────────────────────────────────────────────

/// How fetched bytes turn into logical opcodes and immediates. The
/// protected variant holds the inverse permutation and the keystream seed;
/// decode happens per fetch, never ahead of execution.
enum Decode {
    Plain,
    Vmp { inv: [u8; 256], seed: u32 },
}

struct Frame {
    return_ip: usize,
    saved_env: Rc<Env>,
}

/// Single-threaded stack interpreter. Generic over the `print` sink so
/// callers can capture output; `run_vm` wires it to stdout.
pub struct Vm<'a, W: Write> {
    program: &'a Program,
    out: W,
    decode: Decode,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    env: Rc<Env>,
    ip: usize,
}

impl<'a, W: Write> Vm<'a, W> {
    pub fn new(program: &'a Program, builtins: &Builtins, out: W) -> Self {
        Self::with_decode(program, builtins, out, Decode::Plain)
    }

    /// Execute a protected image in place: opcodes pass through the inverse
    /// permutation and immediates are unmasked as they are consumed.
    pub fn protected(image: &'a VmpImage, builtins: &Builtins, out: W) -> Self {
        let decode = Decode::Vmp {
            inv: image.inverse_map(),
            seed: image.seed,
        };
        Self::with_decode(&image.program, builtins, out, decode)
    }

    fn with_decode(program: &'a Program, builtins: &Builtins, out: W, decode: Decode) -> Self {
        let env = Env::global();
        for (name, f) in builtins {
            env.define(name.clone(), Value::Native(Rc::clone(f)));
        }
        Vm {
            program,
            out,
            decode,
            stack: Vec::new(),
            frames: Vec::new(),
            env,
            ip: 0,
        }
    }

    fn fetch_op(&mut self) -> Result<u8, RuntimeError> {
        let pos = self.ip;
        let raw = *self
            .program
            .code
            .get(pos)
            .ok_or(RuntimeError::TruncatedCode)?;
        self.ip += 1;
        match &self.decode {
            Decode::Plain => {
                if (1..=OPCODE_COUNT as u8).contains(&raw) {
                    Ok(raw)
                } else {
                    Err(RuntimeError::BadOpcode(raw))
                }
            }
            Decode::Vmp { inv, .. } => match inv[raw as usize] {
                0 => Err(RuntimeError::UnknownPhysOpcode {
                    opcode: raw,
                    position: pos,
                }),
                op => Ok(op),
            },
        }
    }

    fn fetch_imm(&mut self) -> Result<u8, RuntimeError> {
        let pos = self.ip;
        let raw = *self
            .program
            .code
            .get(pos)
            .ok_or(RuntimeError::TruncatedCode)?;
        self.ip += 1;
        Ok(match &self.decode {
            Decode::Plain => raw,
            Decode::Vmp { seed, .. } => raw ^ mask(*seed, pos as u32),
        })
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or(RuntimeError::StackUnderflow)
    }

    fn constant(&self, k: u8) -> Result<Value, RuntimeError> {
        self.program
            .consts
            .get(k as usize)
            .map(Const::to_value)
            .ok_or(RuntimeError::BadConstIndex(k))
    }

    fn name(&self, k: u8) -> Result<String, RuntimeError> {
        match self.program.consts.get(k as usize) {
            Some(Const::Str(s)) => Ok(s.clone()),
            Some(_) => Err(RuntimeError::BadNameConst),
            None => Err(RuntimeError::BadConstIndex(k)),
        }
    }

    pub fn run(mut self) -> Result<Value, RuntimeError> {
        loop {
            let op = self.fetch_op()?;
            match op {
                OP_PUSH_CONST => {
                    let k = self.fetch_imm()?;
                    let v = self.constant(k)?;
                    self.stack.push(v);
                }
                OP_LOAD_VAR => {
                    let k = self.fetch_imm()?;
                    let name = self.name(k)?;
                    let v = self
                        .env
                        .lookup(&name)
                        .ok_or(RuntimeError::UndefinedVariable(name))?;
                    self.stack.push(v);
                }
                OP_STORE_VAR => {
                    let k = self.fetch_imm()?;
                    let name = self.name(k)?;
                    let v = self.pop()?;
                    self.env.assign(&name, v);
                }
                OP_ADD => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let v = if matches!(a, Value::Str(_)) || matches!(b, Value::Str(_)) {
                        Value::Str(format!("{a}{b}"))
                    } else {
                        Value::Number(a.to_number() + b.to_number())
                    };
                    self.stack.push(v);
                }
                OP_SUB | OP_MUL | OP_DIV => {
                    let b = self.pop()?.to_number();
                    let a = self.pop()?.to_number();
                    let n = match op {
                        OP_SUB => a - b,
                        OP_MUL => a * b,
                        // IEEE semantics: divide-by-zero yields ±∞ or NaN.
                        _ => a / b,
                    };
                    self.stack.push(Value::Number(n));
                }
                OP_EQ | OP_NE => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let eq = Value::loose_eq(&a, &b);
                    self.stack.push(Value::Bool(if op == OP_EQ { eq } else { !eq }));
                }
                OP_LT | OP_GT | OP_LE | OP_GE => {
                    use std::cmp::Ordering::*;
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let ord = Value::loose_cmp(&a, &b);
                    let res = match op {
                        OP_LT => matches!(ord, Some(Less)),
                        OP_GT => matches!(ord, Some(Greater)),
                        OP_LE => matches!(ord, Some(Less | Equal)),
                        _ => matches!(ord, Some(Greater | Equal)),
                    };
                    self.stack.push(Value::Bool(res));
                }
                OP_PRINT => {
                    let v = self.pop()?;
                    writeln!(self.out, "{v}")?;
                }
                OP_POP => {
                    self.pop()?;
                }
                OP_MAKE_CLOS => {
                    let f = self.fetch_imm()?;
                    if (f as usize) >= self.program.funcs.len() {
                        return Err(RuntimeError::BadFuncIndex(f));
                    }
                    self.stack.push(Value::Closure(Rc::new(Closure {
                        func: f as usize,
                        env: Rc::clone(&self.env),
                    })));
                }
                OP_CALL => {
                    let argc = self.fetch_imm()? as usize;
                    let mut args = Vec::with_capacity(argc);
                    for _ in 0..argc {
                        args.push(self.pop()?);
                    }
                    args.reverse();
                    let callee = self.pop()?;
                    match callee {
                        Value::Native(f) => {
                            let ret = f(&args)?;
                            self.stack.push(ret);
                        }
                        Value::Closure(clos) => {
                            let desc = &self.program.funcs[clos.func];
                            if desc.arity != argc as u32 {
                                return Err(RuntimeError::ArityMismatch {
                                    expect: desc.arity,
                                    got: argc as u32,
                                });
                            }
                            let entry = desc.entry as usize;
                            let params = desc.params.clone();
                            self.frames.push(Frame {
                                return_ip: self.ip,
                                saved_env: Rc::clone(&self.env),
                            });
                            let call_env = Env::child(Rc::clone(&clos.env));
                            for (param, arg) in params.iter().zip(args) {
                                let name = self.name(*param)?;
                                call_env.define(name, arg);
                            }
                            self.env = call_env;
                            self.ip = entry;
                        }
                        _ => return Err(RuntimeError::NotCallable),
                    }
                }
                OP_RET => {
                    let v = self.stack.pop().unwrap_or(Value::Undefined);
                    match self.frames.pop() {
                        None => return Ok(v),
                        Some(frame) => {
                            self.ip = frame.return_ip;
                            self.env = frame.saved_env;
                            self.stack.push(v);
                        }
                    }
                }
                OP_JMP => {
                    let a = self.fetch_imm()?;
                    self.ip = a as usize;
                }
                OP_JMP_IF_FALSE => {
                    let a = self.fetch_imm()?;
                    let v = self.pop()?;
                    if !v.truthy() {
                        self.ip = a as usize;
                    }
                }
                OP_HALT => {
                    return Ok(self.stack.pop().unwrap_or(Value::Undefined));
                }
                other => return Err(RuntimeError::BadOpcode(other)),
            }
        }
    }
}

/// Execute a decoded program with `print` wired to stdout.
pub fn run_vm(program: &Program, builtins: &Builtins) -> Result<Value, RuntimeError> {
    Vm::new(program, builtins, std::io::stdout().lock()).run()
}
