use logos::Logos;

pub type Span = std::ops::Range<usize>;

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"//[^\n]*")]
pub enum Token {
    // Keywords
    #[token("let")]
    Let,
    #[token("function")]
    Function,
    #[token("return")]
    Return,
    #[token("print")]
    Print,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("while")]
    While,

    // Two-char operators (greedy — must win over single-char)
    #[token("==")]
    EqEq,
    #[token("!=")]
    BangEq,
    #[token("<=")]
    LessEq,
    #[token(">=")]
    GreaterEq,

    // Single-char operators
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("=")]
    Eq,
    #[token("<")]
    Less,
    #[token(">")]
    Greater,

    // Punctuation
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,

    // Literals
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| unescape(lex.slice()))]
    Str(String),

    #[regex(r"[A-Za-z_$][A-Za-z0-9_$]*", |lex| lex.slice().to_string())]
    Id(String),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Token::Let => "let",
            Token::Function => "function",
            Token::Return => "return",
            Token::Print => "print",
            Token::If => "if",
            Token::Else => "else",
            Token::While => "while",
            Token::EqEq => "==",
            Token::BangEq => "!=",
            Token::LessEq => "<=",
            Token::GreaterEq => ">=",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Eq => "=",
            Token::Less => "<",
            Token::Greater => ">",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::Comma => ",",
            Token::Semi => ";",
            Token::Number(_) => "num",
            Token::Str(_) => "str",
            Token::Id(_) => "id",
        };
        write!(f, "{name}")
    }
}

/// Strip the surrounding quotes and process escapes. `\n \t \r \\ \"` map to
/// their characters; any other escaped character passes through unchanged.
fn unescape(slice: &str) -> String {
    let inner = &slice[1..slice.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        // The regex only matches backslash-plus-character pairs, so a
        // trailing lone backslash cannot reach this point.
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Lex source code into a stream of tokens with byte spans. End of input is
/// the end of the stream; the parser reports it as `eof`.
pub fn lex(source: &str) -> Result<Vec<(Token, Span)>, LexError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        match result {
            Ok(token) => tokens.push((token, lexer.span())),
            Err(()) => {
                let position = lexer.span().start;
                let rest = &source[position..];
                if rest.starts_with('"') {
                    return Err(LexError::UnterminatedString { position });
                }
                let ch = rest.chars().next().unwrap_or('\0');
                return Err(LexError::UnexpectedChar { ch, position });
            }
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LexError {
    #[error("Unexpected char {ch}")]
    UnexpectedChar { ch: char, position: usize },
    #[error("Unterminated string")]
    UnterminatedString { position: usize },
}

impl LexError {
    pub fn position(&self) -> usize {
        match self {
            LexError::UnexpectedChar { position, .. } => *position,
            LexError::UnterminatedString { position } => *position,
        }
    }
}
