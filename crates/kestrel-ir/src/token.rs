// Token: lexical tokens of the Kestrel script language
//
// Script source is brace-delimited with Python-flavoured keywords:
//
//   def add_one(x: Tensor, n: int = 1) -> Tensor {
//       # comments run to end of line
//       return x + n;
//   }
//
//   1. Keywords      def class namedtuple return if elif else while for in
//                    break continue pass raise assert and or not is
//                    None True False
//   2. Operators     + - * / // % ** == != < > <= >= = += -= *= /=
//   3. Punctuation   { } ( ) [ ] : ; , . -> ?
//   4. Literals      integers, floats, double-quoted strings
//   5. Identifiers
//
// Each token carries a Span for error reporting.

use std::fmt;

/// Byte-level location in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    /// Byte offset from the start of the source.
    pub offset: usize,
    /// Length in bytes.
    pub len: usize,
    /// Line number (1-based).
    pub line: usize,
    /// Column number (1-based, in bytes).
    pub col: usize,
}

impl Span {
    pub fn new(offset: usize, len: usize, line: usize, col: usize) -> Self {
        Self {
            offset,
            len,
            line,
            col,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// A token with its kind and source location.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }
}

/// Every token kind of the script language.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    //  Keywords
    Def,
    Class,
    NamedTuple,
    Return,
    If,
    Elif,
    Else,
    While,
    For,
    In,
    Break,
    Continue,
    Pass,
    Raise,
    Assert,
    And,
    Or,
    Not,
    Is,
    None,
    True,
    False,

    //  Literals
    IntLit(i64),
    FloatLit(f64),
    StringLit(String),
    Ident(String),

    //  Operators
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    SlashSlash,
    Percent,
    EqEq,
    BangEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    Eq,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,

    //  Punctuation
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Colon,
    Semi,
    Comma,
    Dot,
    Arrow,
    Question,

    Eof,
}

/// Map an identifier to a keyword token, if it is one.
pub fn keyword_lookup(word: &str) -> Option<TokenKind> {
    let kind = match word {
        "def" => TokenKind::Def,
        "class" => TokenKind::Class,
        "namedtuple" => TokenKind::NamedTuple,
        "return" => TokenKind::Return,
        "if" => TokenKind::If,
        "elif" => TokenKind::Elif,
        "else" => TokenKind::Else,
        "while" => TokenKind::While,
        "for" => TokenKind::For,
        "in" => TokenKind::In,
        "break" => TokenKind::Break,
        "continue" => TokenKind::Continue,
        "pass" => TokenKind::Pass,
        "raise" => TokenKind::Raise,
        "assert" => TokenKind::Assert,
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "not" => TokenKind::Not,
        "is" => TokenKind::Is,
        "None" => TokenKind::None,
        "True" => TokenKind::True,
        "False" => TokenKind::False,
        _ => return None,
    };
    Some(kind)
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenKind::Def => "'def'",
            TokenKind::Class => "'class'",
            TokenKind::NamedTuple => "'namedtuple'",
            TokenKind::Return => "'return'",
            TokenKind::If => "'if'",
            TokenKind::Elif => "'elif'",
            TokenKind::Else => "'else'",
            TokenKind::While => "'while'",
            TokenKind::For => "'for'",
            TokenKind::In => "'in'",
            TokenKind::Break => "'break'",
            TokenKind::Continue => "'continue'",
            TokenKind::Pass => "'pass'",
            TokenKind::Raise => "'raise'",
            TokenKind::Assert => "'assert'",
            TokenKind::And => "'and'",
            TokenKind::Or => "'or'",
            TokenKind::Not => "'not'",
            TokenKind::Is => "'is'",
            TokenKind::None => "'None'",
            TokenKind::True => "'True'",
            TokenKind::False => "'False'",
            TokenKind::IntLit(n) => return write!(f, "integer {n}"),
            TokenKind::FloatLit(v) => return write!(f, "float {v}"),
            TokenKind::StringLit(s) => return write!(f, "string \"{s}\""),
            TokenKind::Ident(s) => return write!(f, "identifier '{s}'"),
            TokenKind::Plus => "'+'",
            TokenKind::Minus => "'-'",
            TokenKind::Star => "'*'",
            TokenKind::StarStar => "'**'",
            TokenKind::Slash => "'/'",
            TokenKind::SlashSlash => "'//'",
            TokenKind::Percent => "'%'",
            TokenKind::EqEq => "'=='",
            TokenKind::BangEq => "'!='",
            TokenKind::Lt => "'<'",
            TokenKind::Gt => "'>'",
            TokenKind::LtEq => "'<='",
            TokenKind::GtEq => "'>='",
            TokenKind::Eq => "'='",
            TokenKind::PlusEq => "'+='",
            TokenKind::MinusEq => "'-='",
            TokenKind::StarEq => "'*='",
            TokenKind::SlashEq => "'/='",
            TokenKind::LBrace => "'{'",
            TokenKind::RBrace => "'}'",
            TokenKind::LParen => "'('",
            TokenKind::RParen => "')'",
            TokenKind::LBracket => "'['",
            TokenKind::RBracket => "']'",
            TokenKind::Colon => "':'",
            TokenKind::Semi => "';'",
            TokenKind::Comma => "','",
            TokenKind::Dot => "'.'",
            TokenKind::Arrow => "'->'",
            TokenKind::Question => "'?'",
            TokenKind::Eof => "end of file",
        };
        f.write_str(s)
    }
}
