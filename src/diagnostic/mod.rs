pub mod ansi;
pub mod json;
pub mod source_map;

use crate::compiler::CompileError;
use crate::image::DecodeError;
use crate::lexer::{LexError, Span};
use crate::vm::RuntimeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// A renderable report built from any layer's error. The `code` is a stable
/// machine-readable identifier; the message is the error's display form.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: Option<&'static str>,
    pub message: String,
    pub label: Option<(Span, String)>,
    pub notes: Vec<String>,
    pub source: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            code: None,
            message: message.into(),
            label: None,
            notes: Vec::new(),
            source: None,
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.label = Some((span, label.into()));
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

// ---- From impls for the crate's error types ----

impl From<&LexError> for Diagnostic {
    fn from(e: &LexError) -> Self {
        let code = match e {
            LexError::UnexpectedChar { .. } => "VMP-L001",
            LexError::UnterminatedString { .. } => "VMP-L002",
        };
        let at = e.position();
        Diagnostic::error(e.to_string())
            .with_code(code)
            .with_span(at..at + 1, "here")
    }
}

impl From<&CompileError> for Diagnostic {
    fn from(e: &CompileError) -> Self {
        if let CompileError::Lex(lex) = e {
            return Diagnostic::from(lex);
        }
        let code = match e {
            CompileError::Lex(_) => unreachable!(),
            CompileError::Expect { .. } => "VMP-P001",
            CompileError::Factor { .. } => "VMP-P002",
            CompileError::CodeTooLarge => "VMP-P003",
            CompileError::ConstPoolOverflow => "VMP-P004",
            CompileError::FuncTableOverflow => "VMP-P005",
        };
        let mut d = Diagnostic::error(e.to_string()).with_code(code);
        if let Some(span) = e.span() {
            d = d.with_span(span, "here");
        }
        d
    }
}

impl From<&DecodeError> for Diagnostic {
    fn from(e: &DecodeError) -> Self {
        let code = match e {
            DecodeError::Hex(_) => "VMP-D001",
            DecodeError::Truncated => "VMP-D002",
            DecodeError::Trailing => "VMP-D003",
            DecodeError::BadConstTag(_) => "VMP-D004",
            DecodeError::Utf8(_) => "VMP-D005",
            DecodeError::PoolTooLarge => "VMP-D006",
            DecodeError::FuncTableTooLarge => "VMP-D007",
            DecodeError::ParamIndexOutOfRange { .. } => "VMP-D008",
            DecodeError::EntryOutOfRange { .. } => "VMP-D009",
            DecodeError::InvalidOpcode(_) => "VMP-D010",
            DecodeError::BadMagic => "VMP-D011",
            DecodeError::BadVersion => "VMP-D012",
            DecodeError::IntegrityCheckFailed => "VMP-D013",
            DecodeError::BadOpcodeMap(_) => "VMP-D014",
        };
        Diagnostic::error(e.to_string()).with_code(code)
    }
}

impl From<&RuntimeError> for Diagnostic {
    fn from(e: &RuntimeError) -> Self {
        let code = match e {
            RuntimeError::UndefinedVariable(_) => "VMP-R001",
            RuntimeError::NotCallable => "VMP-R002",
            RuntimeError::ArityMismatch { .. } => "VMP-R003",
            RuntimeError::BadOpcode(_) => "VMP-R004",
            RuntimeError::UnknownPhysOpcode { .. } => "VMP-R005",
            RuntimeError::StackUnderflow => "VMP-R006",
            RuntimeError::TruncatedCode => "VMP-R007",
            RuntimeError::BadConstIndex(_) => "VMP-R008",
            RuntimeError::BadFuncIndex(_) => "VMP-R009",
            RuntimeError::BadNameConst => "VMP-R010",
            RuntimeError::Host(_) => "VMP-R011",
            RuntimeError::Io(_) => "VMP-R012",
        };
        Diagnostic::error(e.to_string()).with_code(code)
    }
}

impl From<&crate::Error> for Diagnostic {
    fn from(e: &crate::Error) -> Self {
        match e {
            crate::Error::Compile(c) => Diagnostic::from(c),
            crate::Error::Decode(d) => Diagnostic::from(d),
            crate::Error::Runtime(r) => Diagnostic::from(r),
        }
    }
}
