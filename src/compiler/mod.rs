use std::collections::HashMap;

use crate::lexer::{lex, LexError, Span, Token};
use crate::vm::{Const, FuncDescriptor, Program};
use crate::vm::{
    OP_ADD, OP_CALL, OP_DIV, OP_EQ, OP_GE, OP_GT, OP_HALT, OP_JMP, OP_JMP_IF_FALSE, OP_LE,
    OP_LOAD_VAR, OP_LT, OP_MAKE_CLOS, OP_MUL, OP_NE, OP_POP, OP_PRINT, OP_PUSH_CONST, OP_RET,
    OP_STORE_VAR, OP_SUB,
};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("Expect {expected}, got {got}")]
    Expect {
        expected: String,
        got: String,
        span: Span,
    },
    #[error("Unexpected token in Factor: {token}")]
    Factor { token: String, span: Span },
    #[error("generated code exceeds the 255-byte jump-address range")]
    CodeTooLarge,
    #[error("constant pool limit of 256 entries exceeded")]
    ConstPoolOverflow,
    #[error("function table limit of 256 entries exceeded")]
    FuncTableOverflow,
}

impl CompileError {
    /// Byte span for diagnostics, when the error points at a token.
    pub fn span(&self) -> Option<Span> {
        match self {
            CompileError::Lex(e) => Some(e.position()..e.position() + 1),
            CompileError::Expect { span, .. } | CompileError::Factor { span, .. } => {
                Some(span.clone())
            }
            _ => None,
        }
    }
}

type Result<T> = std::result::Result<T, CompileError>;

/// Compile a source string straight to a `(code, consts, funcs)` triple.
/// Single pass: the recursive-descent parser emits bytecode as it goes,
/// backpatching forward jumps.
pub fn compile(source: &str) -> Result<Program> {
    Compiler::new(lex(source)?).compile()
}

// ── Constant pool ────────────────────────────────────────────────────

/// Insertion-ordered pool, deduplicated by (kind tag, textual form).
/// 1-byte indices cap the pool at 256 entries.
struct ConstPool {
    items: Vec<Const>,
    index: HashMap<(u8, String), u8>,
}

impl ConstPool {
    fn new() -> Self {
        ConstPool {
            items: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn add(&mut self, c: Const) -> Result<u8> {
        let key = match &c {
            Const::Undefined => (0u8, "undefined".to_string()),
            Const::Number(n) => (1, n.to_string()),
            Const::Str(s) => (2, s.clone()),
        };
        if let Some(&i) = self.index.get(&key) {
            return Ok(i);
        }
        if self.items.len() >= 256 {
            return Err(CompileError::ConstPoolOverflow);
        }
        let i = self.items.len() as u8;
        self.items.push(c);
        self.index.insert(key, i);
        Ok(i)
    }
}

// ── Compiler ─────────────────────────────────────────────────────────

struct Compiler {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    eof: usize,
    code: Vec<u8>,
    consts: ConstPool,
    funcs: Vec<FuncDescriptor>,
}

impl Compiler {
    fn new(tokens: Vec<(Token, Span)>) -> Self {
        let eof = tokens.last().map(|(_, s)| s.end).unwrap_or(0);
        Compiler {
            tokens,
            pos: 0,
            eof,
            code: Vec::new(),
            consts: ConstPool::new(),
            funcs: Vec::new(),
        }
    }

    // ---- Token stream ----

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|(t, _)| t)
    }

    /// Span of the current token, or an empty span at end of input.
    fn span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|(_, s)| s.clone())
            .unwrap_or(self.eof..self.eof)
    }

    /// Kind name of the current token for error messages.
    fn got(&self) -> String {
        match self.peek() {
            Some(t) => t.to_string(),
            None => "eof".to_string(),
        }
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        match self.peek() {
            Some(t) if t == expected => {
                self.advance();
                Ok(())
            }
            _ => Err(CompileError::Expect {
                expected: expected.to_string(),
                got: self.got(),
                span: self.span(),
            }),
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.peek() {
            Some(Token::Id(name)) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(CompileError::Expect {
                expected: "id".to_string(),
                got: self.got(),
                span: self.span(),
            }),
        }
    }

    // ---- Emission ----

    fn emit(&mut self, op: u8) {
        self.code.push(op);
    }

    fn emit2(&mut self, op: u8, imm: u8) {
        self.code.push(op);
        self.code.push(imm);
    }

    /// Emit a jump with a placeholder address; returns the position of the
    /// immediate byte for `patch`.
    fn emit_jump(&mut self, op: u8) -> usize {
        self.code.push(op);
        self.code.push(0);
        self.code.len() - 1
    }

    /// Point a previously emitted jump at the current end of code.
    fn patch(&mut self, at: usize) -> Result<()> {
        let target = self.code.len();
        if target > 255 {
            return Err(CompileError::CodeTooLarge);
        }
        self.code[at] = target as u8;
        Ok(())
    }

    fn emit_jump_to(&mut self, op: u8, target: usize) -> Result<()> {
        if target > 255 {
            return Err(CompileError::CodeTooLarge);
        }
        self.emit2(op, target as u8);
        Ok(())
    }

    fn emit_store(&mut self, name: &str) -> Result<()> {
        let k = self.consts.add(Const::Str(name.to_string()))?;
        self.emit2(OP_STORE_VAR, k);
        Ok(())
    }

    // ---- Program ----

    fn compile(mut self) -> Result<Program> {
        while self.peek().is_some() {
            self.stmt()?;
        }
        self.emit(OP_HALT);
        if self.code.len() > 255 {
            return Err(CompileError::CodeTooLarge);
        }
        Ok(Program {
            code: self.code,
            consts: self.consts.items,
            funcs: self.funcs,
        })
    }

    // ---- Statements ----

    fn stmt(&mut self) -> Result<()> {
        match self.peek() {
            Some(Token::Let) => {
                self.advance();
                let name = self.expect_ident()?;
                self.expect(&Token::Eq)?;
                self.expr()?;
                self.expect(&Token::Semi)?;
                self.emit_store(&name)
            }
            Some(Token::Print) => {
                self.advance();
                self.expect(&Token::LParen)?;
                self.expr()?;
                self.expect(&Token::RParen)?;
                self.expect(&Token::Semi)?;
                self.emit(OP_PRINT);
                Ok(())
            }
            Some(Token::Function) => self.function_stmt(),
            Some(Token::Return) => {
                self.advance();
                if matches!(self.peek(), Some(Token::Semi)) {
                    self.advance();
                    let k = self.consts.add(Const::Undefined)?;
                    self.emit2(OP_PUSH_CONST, k);
                } else {
                    self.expr()?;
                    self.expect(&Token::Semi)?;
                }
                self.emit(OP_RET);
                Ok(())
            }
            Some(Token::If) => self.if_stmt(),
            Some(Token::While) => self.while_stmt(),
            Some(Token::LBrace) => self.block(),
            // `x = E;` assigns; the lookahead distinguishes it from an
            // expression statement starting with an identifier.
            Some(Token::Id(_)) if matches!(self.peek_at(1), Some(Token::Eq)) => {
                let name = self.expect_ident()?;
                self.advance(); // '='
                self.expr()?;
                self.expect(&Token::Semi)?;
                self.emit_store(&name)
            }
            _ => {
                self.expr()?;
                self.expect(&Token::Semi)?;
                self.emit(OP_POP);
                Ok(())
            }
        }
    }

    fn block(&mut self) -> Result<()> {
        self.expect(&Token::LBrace)?;
        while !matches!(self.peek(), Some(Token::RBrace) | None) {
            self.stmt()?;
        }
        self.expect(&Token::RBrace)
    }

    fn if_stmt(&mut self) -> Result<()> {
        self.advance(); // 'if'
        self.expect(&Token::LParen)?;
        self.expr()?;
        self.expect(&Token::RParen)?;
        let jump_false = self.emit_jump(OP_JMP_IF_FALSE);
        self.stmt()?;
        if matches!(self.peek(), Some(Token::Else)) {
            self.advance();
            let jump_end = self.emit_jump(OP_JMP);
            self.patch(jump_false)?;
            self.stmt()?;
            self.patch(jump_end)
        } else {
            self.patch(jump_false)
        }
    }

    fn while_stmt(&mut self) -> Result<()> {
        self.advance(); // 'while'
        self.expect(&Token::LParen)?;
        let loop_start = self.code.len();
        self.expr()?;
        self.expect(&Token::RParen)?;
        let jump_exit = self.emit_jump(OP_JMP_IF_FALSE);
        self.stmt()?;
        self.emit_jump_to(OP_JMP, loop_start)?;
        self.patch(jump_exit)
    }

    /// Function bodies are emitted inline; a jump over the body keeps
    /// straight-line top-level execution out of it.
    fn function_stmt(&mut self) -> Result<()> {
        self.advance(); // 'function'
        let name = self.expect_ident()?;
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        if !matches!(self.peek(), Some(Token::RParen)) {
            loop {
                params.push(self.expect_ident()?);
                if matches!(self.peek(), Some(Token::Comma)) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;

        if self.funcs.len() >= 256 {
            return Err(CompileError::FuncTableOverflow);
        }
        let mut param_idxs = Vec::with_capacity(params.len());
        for p in &params {
            param_idxs.push(self.consts.add(Const::Str(p.clone()))?);
        }
        let fidx = self.funcs.len() as u8;
        self.funcs.push(FuncDescriptor {
            entry: 0, // provisional until the body is placed
            arity: params.len() as u32,
            params: param_idxs,
        });

        self.emit2(OP_MAKE_CLOS, fidx);
        self.emit_store(&name)?;
        let jump_over = self.emit_jump(OP_JMP);
        self.funcs[fidx as usize].entry = self.code.len() as u32;
        self.block()?;
        // Synthesized fallthrough return.
        let k = self.consts.add(Const::Undefined)?;
        self.emit2(OP_PUSH_CONST, k);
        self.emit(OP_RET);
        self.patch(jump_over)
    }

    // ---- Expressions ----
    //
    // Precedence by call tree: equality/relational lowest, then additive,
    // then multiplicative, then factor. All left-associative.

    fn expr(&mut self) -> Result<()> {
        self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => OP_EQ,
                Some(Token::BangEq) => OP_NE,
                Some(Token::Less) => OP_LT,
                Some(Token::Greater) => OP_GT,
                Some(Token::LessEq) => OP_LE,
                Some(Token::GreaterEq) => OP_GE,
                _ => break,
            };
            self.advance();
            self.additive()?;
            self.emit(op);
        }
        Ok(())
    }

    fn additive(&mut self) -> Result<()> {
        self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => OP_ADD,
                Some(Token::Minus) => OP_SUB,
                _ => break,
            };
            self.advance();
            self.term()?;
            self.emit(op);
        }
        Ok(())
    }

    fn term(&mut self) -> Result<()> {
        self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => OP_MUL,
                Some(Token::Slash) => OP_DIV,
                _ => break,
            };
            self.advance();
            self.factor()?;
            self.emit(op);
        }
        Ok(())
    }

    fn factor(&mut self) -> Result<()> {
        match self.peek() {
            Some(Token::Number(n)) => {
                let n = *n;
                self.advance();
                let k = self.consts.add(Const::Number(n))?;
                self.emit2(OP_PUSH_CONST, k);
                Ok(())
            }
            Some(Token::Str(s)) => {
                let s = s.clone();
                self.advance();
                let k = self.consts.add(Const::Str(s))?;
                self.emit2(OP_PUSH_CONST, k);
                Ok(())
            }
            Some(Token::LParen) => {
                self.advance();
                self.expr()?;
                self.expect(&Token::RParen)
            }
            Some(Token::Id(name)) => {
                let name = name.clone();
                self.advance();
                let k = self.consts.add(Const::Str(name))?;
                self.emit2(OP_LOAD_VAR, k);
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.call_args()
                } else {
                    Ok(())
                }
            }
            _ => Err(CompileError::Factor {
                token: self.got(),
                span: self.span(),
            }),
        }
    }

    /// Arguments are emitted left to right; `call n` finds the callee under
    /// them on the stack.
    fn call_args(&mut self) -> Result<()> {
        self.expect(&Token::LParen)?;
        let mut argc: usize = 0;
        if !matches!(self.peek(), Some(Token::RParen)) {
            loop {
                self.expr()?;
                argc += 1;
                if matches!(self.peek(), Some(Token::Comma)) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;
        self.emit2(OP_CALL, argc as u8);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn let_statement_bytecode() {
        let p = compile("let a = 10;").unwrap();
        assert_eq!(p.consts, vec![Const::Number(10.0), Const::Str("a".into())]);
        assert_eq!(p.code, vec![OP_PUSH_CONST, 0, OP_STORE_VAR, 1, OP_HALT]);
    }

    #[test]
    fn expression_statement_pops() {
        let p = compile("1 + 2;").unwrap();
        assert_eq!(
            p.code,
            vec![OP_PUSH_CONST, 0, OP_PUSH_CONST, 1, OP_ADD, OP_POP, OP_HALT]
        );
    }

    #[test]
    fn print_statement_bytecode() {
        let p = compile("print(7);").unwrap();
        assert_eq!(p.code, vec![OP_PUSH_CONST, 0, OP_PRINT, OP_HALT]);
    }

    #[test]
    fn constant_pool_dedup() {
        let p = compile(r#"let a = 1; let b = 1; let c = "x"; let d = "x";"#).unwrap();
        let ones = p.consts.iter().filter(|c| **c == Const::Number(1.0)).count();
        let xs = p.consts.iter().filter(|c| **c == Const::Str("x".into())).count();
        assert_eq!(ones, 1);
        assert_eq!(xs, 1);
    }

    #[test]
    fn dedup_keeps_insertion_order() {
        let p = compile("let a = 5; let b = 3; let c = 5;").unwrap();
        assert_eq!(p.consts[0], Const::Number(5.0));
        assert_eq!(p.consts[2], Const::Number(3.0));
    }

    #[test]
    fn number_and_string_with_same_text_are_distinct() {
        let p = compile(r#"let a = 5; let b = "5";"#).unwrap();
        assert!(p.consts.contains(&Const::Number(5.0)));
        assert!(p.consts.contains(&Const::Str("5".into())));
    }

    #[test]
    fn if_without_else_backpatches_to_end() {
        let p = compile("if (1) { print(2); }").unwrap();
        // push 1, jmp_if_false END, push 2, print, END: halt
        assert_eq!(
            p.code,
            vec![
                OP_PUSH_CONST, 0,
                OP_JMP_IF_FALSE, 7,
                OP_PUSH_CONST, 1,
                OP_PRINT,
                OP_HALT,
            ]
        );
        // Jump target is one past print, which is where halt sits.
        assert_eq!(p.code[p.code[3] as usize], OP_HALT);
    }

    #[test]
    fn if_else_emits_two_jumps() {
        let p = compile("if (1) { print(2); } else { print(3); }").unwrap();
        assert_eq!(
            p.code,
            vec![
                OP_PUSH_CONST, 0,
                OP_JMP_IF_FALSE, 9,
                OP_PUSH_CONST, 1,
                OP_PRINT,
                OP_JMP, 12,
                OP_PUSH_CONST, 2,
                OP_PRINT,
                OP_HALT,
            ]
        );
    }

    #[test]
    fn while_jumps_back_to_condition() {
        let p = compile("while (0) { print(1); }").unwrap();
        assert_eq!(
            p.code,
            vec![
                OP_PUSH_CONST, 0,
                OP_JMP_IF_FALSE, 9,
                OP_PUSH_CONST, 1,
                OP_PRINT,
                OP_JMP, 0,
                OP_HALT,
            ]
        );
    }

    #[test]
    fn function_body_is_skipped_by_jump() {
        let p = compile("function f(x){ return x; }").unwrap();
        assert_eq!(p.funcs.len(), 1);
        let desc = &p.funcs[0];
        assert_eq!(desc.arity, 1);
        // make_clos 0, store_var f, jmp over body
        assert_eq!(p.code[0], OP_MAKE_CLOS);
        assert_eq!(p.code[4], OP_JMP);
        assert_eq!(desc.entry as usize, 6);
        // Jump over the body lands on halt.
        assert_eq!(p.code[p.code[5] as usize], OP_HALT);
        // Body ends with the synthesized undefined return.
        let end = p.code.len();
        assert_eq!(p.code[end - 1 - 3], OP_PUSH_CONST);
        assert_eq!(p.code[end - 2], OP_RET);
    }

    #[test]
    fn param_names_are_pool_indices() {
        let p = compile("function add(a, b){ return a + b; }").unwrap();
        let desc = &p.funcs[0];
        assert_eq!(desc.params.len(), 2);
        assert_eq!(p.consts[desc.params[0] as usize], Const::Str("a".into()));
        assert_eq!(p.consts[desc.params[1] as usize], Const::Str("b".into()));
    }

    #[test]
    fn bare_return_pushes_undefined() {
        let p = compile("function f(){ return; }").unwrap();
        assert!(p.consts.contains(&Const::Undefined));
    }

    #[test]
    fn call_emits_argc() {
        let p = compile("f(1, 2, 3);").unwrap();
        let call_at = p.code.iter().position(|&b| b == OP_CALL).unwrap();
        assert_eq!(p.code[call_at + 1], 3);
    }

    #[test]
    fn relational_chain_is_left_associative() {
        let p = compile("1 < 2 < 3;").unwrap();
        // push 1, push 2, lt, push 3, lt
        let lts: Vec<usize> = p
            .code
            .iter()
            .enumerate()
            .filter(|(_, &b)| b == OP_LT)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(lts.len(), 2);
        assert!(lts[0] < lts[1]);
    }

    #[test]
    fn missing_semicolon_error() {
        let err = compile("let a = 1").unwrap_err();
        assert_eq!(err.to_string(), "Expect ;, got eof");
    }

    #[test]
    fn missing_eq_in_let_error() {
        let err = compile("let a 1;").unwrap_err();
        assert_eq!(err.to_string(), "Expect =, got num");
    }

    #[test]
    fn keyword_in_factor_error() {
        let err = compile("let a = let;").unwrap_err();
        assert_eq!(err.to_string(), "Unexpected token in Factor: let");
    }

    #[test]
    fn for_loop_is_rejected() {
        assert!(compile("for (i = 0; i < 3; i = i + 1) { print(i); }").is_err());
    }

    #[test]
    fn array_literal_is_rejected_lexically() {
        let err = compile("let a = [1, 2];").unwrap_err();
        assert_eq!(err.to_string(), "Unexpected char [");
    }

    #[test]
    fn code_over_255_bytes_is_rejected() {
        let source = "print(1);".repeat(90);
        let err = compile(&source).unwrap_err();
        assert_eq!(err, CompileError::CodeTooLarge);
    }

    #[test]
    fn constant_pool_overflow_is_rejected() {
        // 2 fresh constants per let (value and name) overflows past 256
        // before the code-size check would fire at the end.
        let source: String = (0..130).map(|i| format!("let v{i} = {};", 1000 + i)).collect();
        let err = compile(&source).unwrap_err();
        assert!(matches!(
            err,
            CompileError::ConstPoolOverflow | CompileError::CodeTooLarge
        ));
    }

    #[test]
    fn assignment_statement_stores() {
        let p = compile("let a = 1; a = 2;").unwrap();
        let stores = p.code.iter().filter(|&&b| b == OP_STORE_VAR).count();
        assert_eq!(stores, 2);
    }

    #[test]
    fn equality_lexes_apart_from_assignment() {
        let p = compile("let a = 1; a == 2;").unwrap();
        assert!(p.code.contains(&OP_EQ));
    }
}
