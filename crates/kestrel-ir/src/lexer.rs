// Lexer: converts script source text into a stream of Tokens
//
// A hand-written byte scanner. Notes:
//
//   1. Identifiers may contain underscores; keywords are recognised through
//      `keyword_lookup`.
//   2. Numbers are integers or floats (with optional exponent). A leading
//      minus sign is a separate token; the parser folds it.
//   3. Strings use double or single quotes with the escapes \n \t \\ \" \'.
//   4. Comments start with `#` and run to the end of the line. `//` is the
//      floor-division operator.

use crate::error::{Error, ErrorKind, Result};
use crate::token::{keyword_lookup, Span, Token, TokenKind};

/// Lexer state over a source string.
pub struct Lexer<'src> {
    src: &'src str,
    bytes: &'src [u8],
    pos: usize,
    line: usize,
    col: usize,
}

impl<'src> Lexer<'src> {
    pub fn new(src: &'src str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    /// Tokenize the entire source. The last token is always Eof.
    pub fn tokenize(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token()?;
            let is_eof = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if is_eof {
                break;
            }
        }
        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Token> {
        self.skip_whitespace_and_comments();

        if self.pos >= self.bytes.len() {
            return Ok(Token::new(TokenKind::Eof, self.span(0)));
        }

        let start_pos = self.pos;
        let start_line = self.line;
        let start_col = self.col;
        let ch = self.bytes[self.pos] as char;

        if ch == '"' || ch == '\'' {
            return self.lex_string(ch, start_pos, start_line, start_col);
        }

        if ch.is_ascii_digit() {
            return self.lex_number(start_pos, start_line, start_col);
        }

        if ch.is_ascii_alphabetic() || ch == '_' {
            return Ok(self.lex_ident(start_pos, start_line, start_col));
        }

        self.advance();
        let kind = match ch {
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            ';' => TokenKind::Semi,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            '.' => TokenKind::Dot,
            '?' => TokenKind::Question,
            '%' => TokenKind::Percent,
            '+' => self.with_eq(TokenKind::PlusEq, TokenKind::Plus),
            '-' => {
                if self.peek() == Some('>') {
                    self.advance();
                    TokenKind::Arrow
                } else {
                    self.with_eq(TokenKind::MinusEq, TokenKind::Minus)
                }
            }
            '*' => {
                if self.peek() == Some('*') {
                    self.advance();
                    TokenKind::StarStar
                } else {
                    self.with_eq(TokenKind::StarEq, TokenKind::Star)
                }
            }
            '/' => {
                if self.peek() == Some('/') {
                    self.advance();
                    TokenKind::SlashSlash
                } else {
                    self.with_eq(TokenKind::SlashEq, TokenKind::Slash)
                }
            }
            '=' => self.with_eq(TokenKind::EqEq, TokenKind::Eq),
            '<' => self.with_eq(TokenKind::LtEq, TokenKind::Lt),
            '>' => self.with_eq(TokenKind::GtEq, TokenKind::Gt),
            '!' => {
                if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::BangEq
                } else {
                    return Err(Error::new(
                        ErrorKind::UnexpectedChar('!'),
                        Span::new(start_pos, 1, start_line, start_col),
                    ));
                }
            }
            _ => {
                return Err(Error::new(
                    ErrorKind::UnexpectedChar(ch),
                    Span::new(start_pos, 1, start_line, start_col),
                ));
            }
        };

        Ok(Token::new(
            kind,
            Span::new(start_pos, self.pos - start_pos, start_line, start_col),
        ))
    }

    // Helpers

    /// Consume a trailing `=` if present.
    fn with_eq(&mut self, with: TokenKind, without: TokenKind) -> TokenKind {
        if self.peek() == Some('=') {
            self.advance();
            with
        } else {
            without
        }
    }

    fn advance(&mut self) {
        if self.pos < self.bytes.len() {
            if self.bytes[self.pos] == b'\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.bytes.get(self.pos).map(|&b| b as char)
    }

    fn span(&self, len: usize) -> Span {
        Span::new(self.pos, len, self.line, self.col)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
                self.advance();
            }
            if self.pos < self.bytes.len() && self.bytes[self.pos] == b'#' {
                while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                    self.advance();
                }
                continue;
            }
            break;
        }
    }

    fn lex_string(
        &mut self,
        quote: char,
        start_pos: usize,
        start_line: usize,
        start_col: usize,
    ) -> Result<Token> {
        self.advance();
        let mut value = String::new();
        loop {
            let Some(ch) = self.src[self.pos..].chars().next() else {
                return Err(Error::new(
                    ErrorKind::UnterminatedString,
                    Span::new(start_pos, self.pos - start_pos, start_line, start_col),
                ));
            };
            if ch == '\n' {
                return Err(Error::new(
                    ErrorKind::UnterminatedString,
                    Span::new(start_pos, self.pos - start_pos, start_line, start_col),
                ));
            }
            if ch == quote {
                self.advance();
                break;
            }
            if ch == '\\' {
                self.advance();
                let Some(esc) = self.peek() else {
                    return Err(Error::new(
                        ErrorKind::UnterminatedString,
                        Span::new(start_pos, self.pos - start_pos, start_line, start_col),
                    ));
                };
                match esc {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    '\\' => value.push('\\'),
                    '"' => value.push('"'),
                    '\'' => value.push('\''),
                    _ => {
                        value.push('\\');
                        value.push(esc);
                    }
                }
                self.advance();
            } else {
                value.push(ch);
                for _ in 0..ch.len_utf8() {
                    self.advance();
                }
            }
        }
        Ok(Token::new(
            TokenKind::StringLit(value),
            Span::new(start_pos, self.pos - start_pos, start_line, start_col),
        ))
    }

    fn lex_number(&mut self, start_pos: usize, start_line: usize, start_col: usize) -> Result<Token> {
        let num_start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
            self.advance();
        }

        let mut is_float = false;

        if self.peek() == Some('.')
            && self
                .bytes
                .get(self.pos + 1)
                .map_or(true, |b| !b.is_ascii_alphabetic() && *b != b'_')
        {
            is_float = true;
            self.advance();
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
                self.advance();
            }
        }

        if matches!(self.peek(), Some('e') | Some('E')) {
            is_float = true;
            self.advance();
            if matches!(self.peek(), Some('+') | Some('-')) {
                self.advance();
            }
            if !matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                let raw = &self.src[num_start..self.pos];
                return Err(Error::new(
                    ErrorKind::InvalidNumber(raw.to_string()),
                    Span::new(start_pos, self.pos - start_pos, start_line, start_col),
                ));
            }
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
                self.advance();
            }
        }

        let raw = &self.src[num_start..self.pos];
        let span = Span::new(start_pos, self.pos - start_pos, start_line, start_col);

        if is_float {
            let val: f64 = raw
                .parse()
                .map_err(|_| Error::new(ErrorKind::InvalidNumber(raw.to_string()), span))?;
            Ok(Token::new(TokenKind::FloatLit(val), span))
        } else {
            let val: i64 = raw
                .parse()
                .map_err(|_| Error::new(ErrorKind::InvalidNumber(raw.to_string()), span))?;
            Ok(Token::new(TokenKind::IntLit(val), span))
        }
    }

    fn lex_ident(&mut self, start_pos: usize, start_line: usize, start_col: usize) -> Token {
        let id_start = self.pos;
        while self.pos < self.bytes.len()
            && (self.bytes[self.pos].is_ascii_alphanumeric() || self.bytes[self.pos] == b'_')
        {
            self.advance();
        }
        let word = &self.src[id_start..self.pos];
        let span = Span::new(start_pos, self.pos - start_pos, start_line, start_col);
        let kind = keyword_lookup(word).unwrap_or_else(|| TokenKind::Ident(word.to_string()));
        Token::new(kind, span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(src: &str) -> Vec<TokenKind> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_keywords_and_idents() {
        assert_eq!(
            lex("def foo is not None"),
            vec![
                TokenKind::Def,
                TokenKind::Ident("foo".into()),
                TokenKind::Is,
                TokenKind::Not,
                TokenKind::None,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_number_literals() {
        assert_eq!(
            lex("42 3.14 1e-4 2."),
            vec![
                TokenKind::IntLit(42),
                TokenKind::FloatLit(3.14),
                TokenKind::FloatLit(1e-4),
                TokenKind::FloatLit(2.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_floor_div_is_not_a_comment() {
        assert_eq!(
            lex("a // b # trailing"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::SlashSlash,
                TokenKind::Ident("b".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_compound_operators() {
        assert_eq!(
            lex("+= -> ** != <="),
            vec![
                TokenKind::PlusEq,
                TokenKind::Arrow,
                TokenKind::StarStar,
                TokenKind::BangEq,
                TokenKind::LtEq,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            lex(r#""a\"b" 'c'"#),
            vec![
                TokenKind::StringLit("a\"b".into()),
                TokenKind::StringLit("c".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_unterminated_string() {
        let err = Lexer::new("\"abc").tokenize().unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnterminatedString);
    }

    #[test]
    fn test_spans_track_lines() {
        let toks = Lexer::new("a\n  b").tokenize().unwrap();
        assert_eq!(toks[1].span.line, 2);
        assert_eq!(toks[1].span.col, 3);
    }
}
