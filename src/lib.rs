#![warn(clippy::all)]

pub mod codegen;
pub mod compiler;
pub mod diagnostic;
pub mod image;
pub mod lexer;
pub mod vm;

pub use compiler::{compile, CompileError};
pub use image::vmp::{
    pack_protected, pack_protected_with, run_protected, unpack_protected, VmpImage,
};
pub use image::{pack_plain, unpack_plain, DecodeError};
pub use vm::builtins::{default_builtins, Builtins};
pub use vm::value::Value;
pub use vm::{run_vm, Program, RuntimeError, Vm};

/// Any failure in the compile → pack → unpack → execute pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Compile and execute in one step, with `print` wired to stdout.
pub fn run_source(source: &str, builtins: &Builtins) -> Result<Value, Error> {
    let program = compile(source)?;
    Ok(run_vm(&program, builtins)?)
}
