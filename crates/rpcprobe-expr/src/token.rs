//! Single-pass tokenizer.
//!
//! `$` and `@` words are looked up in a fixed keyword table, so `$env` and
//! `@contain` are keywords while `$foo` is an error. Identifiers are maximal
//! runs of alphabetic characters only: `ab1` lexes as the identifier `ab`
//! followed by the number `1`.

use crate::error::{Error, Result};
use core::fmt;

/// Globals that start a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Global {
    Env,
    Res,
    Req,
}

/// Selectors that are only meaningful after a dot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attr {
    Body,
    Json,
    Str,
    Header,
    Raw,
}

impl Attr {
    pub const fn lexeme(self) -> &'static str {
        match self {
            Attr::Body => "$body",
            Attr::Json => "$json",
            Attr::Str => "$str",
            Attr::Header => "$header",
            Attr::Raw => "$raw",
        }
    }
}

/// Built-in functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Function {
    Contain,
}

impl Function {
    pub const fn name(self) -> &'static str {
        match self {
            Function::Contain => "contain",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Global(Global),
    Attr(Attr),
    Function(Function),
    Dot,
    Assign,
    Comma,
    LeftParen,
    RightParen,
    Number,
    Real,
    String,
    Identifier,
    Eof,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Kind::Global(Global::Env) => "`$env`",
            Kind::Global(Global::Res) => "`$res`",
            Kind::Global(Global::Req) => "`$req`",
            Kind::Attr(attr) => return write!(f, "`{}`", attr.lexeme()),
            Kind::Function(func) => return write!(f, "`@{}`", func.name()),
            Kind::Dot => "`.`",
            Kind::Assign => "`=`",
            Kind::Comma => "`,`",
            Kind::LeftParen => "`(`",
            Kind::RightParen => "`)`",
            Kind::Number => "a number",
            Kind::Real => "a real number",
            Kind::String => "a string",
            Kind::Identifier => "an identifier",
            Kind::Eof => "end of input",
        };
        f.write_str(text)
    }
}

const KEYWORDS: &[(&str, Kind)] = &[
    ("$env", Kind::Global(Global::Env)),
    ("$res", Kind::Global(Global::Res)),
    ("$req", Kind::Global(Global::Req)),
    ("$body", Kind::Attr(Attr::Body)),
    ("$json", Kind::Attr(Attr::Json)),
    ("$str", Kind::Attr(Attr::Str)),
    ("$header", Kind::Attr(Attr::Header)),
    ("$raw", Kind::Attr(Attr::Raw)),
    ("@contain", Kind::Function(Function::Contain)),
];

/// Literal payload carried by number, string and identifier tokens.
#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: Kind,
    pub value: Option<Literal>,
    /// Byte offset of the first character in the source.
    pub offset: usize,
}

impl Token {
    const fn new(kind: Kind, offset: usize) -> Self {
        Self {
            kind,
            value: None,
            offset,
        }
    }

    const fn with_value(kind: Kind, value: Literal, offset: usize) -> Self {
        Self {
            kind,
            value: Some(value),
            offset,
        }
    }
}

/// Tokenizes `source`. The returned vector always ends with a [`Kind::Eof`]
/// token.
///
/// # Errors
///
/// Returns the first lexical error found.
pub fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut lexer = Lexer { source, pos: 0 };
    let mut tokens = Vec::new();
    loop {
        let token = lexer.scan()?;
        let done = token.kind == Kind::Eof;
        tokens.push(token);
        if done {
            return Ok(tokens);
        }
    }
}

struct Lexer<'a> {
    source: &'a str,
    pos: usize,
}

impl Lexer<'_> {
    fn peek(&self) -> Option<char> {
        self.source[self.pos..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        self.source[self.pos..].chars().nth(1)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat_while(&mut self, pred: impl Fn(char) -> bool) {
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn scan(&mut self) -> Result<Token> {
        self.eat_while(char::is_whitespace);

        let start = self.pos;
        let Some(c) = self.bump() else {
            return Ok(Token::new(Kind::Eof, start));
        };

        match c {
            '.' => Ok(Token::new(Kind::Dot, start)),
            '=' => Ok(Token::new(Kind::Assign, start)),
            ',' => Ok(Token::new(Kind::Comma, start)),
            '(' => Ok(Token::new(Kind::LeftParen, start)),
            ')' => Ok(Token::new(Kind::RightParen, start)),
            '"' => self.string(start),
            '$' | '@' => self.keyword(start),
            c if c.is_ascii_digit() => self.number(start),
            c if c.is_alphabetic() => {
                self.eat_while(char::is_alphabetic);
                let name = self.source[start..self.pos].to_string();
                Ok(Token::with_value(
                    Kind::Identifier,
                    Literal::Str(name),
                    start,
                ))
            }
            found => Err(Error::UnexpectedChar {
                found,
                offset: start,
            }),
        }
    }

    fn keyword(&mut self, start: usize) -> Result<Token> {
        self.eat_while(char::is_alphabetic);
        let word = &self.source[start..self.pos];
        KEYWORDS
            .iter()
            .find(|(lexeme, _)| *lexeme == word)
            .map(|(_, kind)| Token::new(*kind, start))
            .ok_or_else(|| Error::UnknownKeyword {
                keyword: word.to_string(),
                offset: start,
            })
    }

    fn number(&mut self, start: usize) -> Result<Token> {
        self.eat_while(|c| c.is_ascii_digit());

        // `1.5` is a real, but `1.` leaves the dot for the parser.
        let fractional = self.peek() == Some('.')
            && self.peek_second().is_some_and(|c| c.is_ascii_digit());
        if fractional {
            self.bump();
            self.eat_while(|c| c.is_ascii_digit());
        }

        let literal = &self.source[start..self.pos];
        let invalid = || Error::InvalidNumber {
            literal: literal.to_string(),
            offset: start,
        };
        if fractional {
            let v: f64 = literal.parse().map_err(|_| invalid())?;
            Ok(Token::with_value(Kind::Real, Literal::Float(v), start))
        } else {
            let v: i64 = literal.parse().map_err(|_| invalid())?;
            Ok(Token::with_value(Kind::Number, Literal::Int(v), start))
        }
    }

    fn string(&mut self, start: usize) -> Result<Token> {
        let mut text = String::new();
        loop {
            match self.bump() {
                None => return Err(Error::UnterminatedString { offset: start }),
                Some('"') => break,
                Some('\\') => match self.bump() {
                    Some(c @ ('"' | '\\')) => text.push(c),
                    Some(c) => {
                        text.push('\\');
                        text.push(c);
                    }
                    None => return Err(Error::UnterminatedString { offset: start }),
                },
                Some(c) => text.push(c),
            }
        }
        Ok(Token::with_value(Kind::String, Literal::Str(text), start))
    }
}
