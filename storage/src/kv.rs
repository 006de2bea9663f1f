// SPDX-FileCopyrightText: 2025 Roman Valls, 2025
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! The config files use a relaxed JSON dialect:
//!
//! ```text
//! {
//!   baud    : 115200,
//!   image   : [
//!     { name : "app", sector : 0, param : "console=ttyS0" },
//!   ],
//! }
//! ```
//!
//! Keys may be bare words, separators between members are optional and a
//! trailing comma is accepted. Numbers are decimal or `0x` prefixed hex.
//!
//! [`parse`] walks a document and reports every scalar to a [`Visitor`]
//! together with the path of keys leading to it. Array elements report the
//! path of the array itself.

use core::fmt;

use heapless::{String, Vec};

/// Deepest key path accepted by [`parse`]
pub const MAX_DEPTH: usize = 8;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KvError {
    /// Unexpected character or token at the given byte offset
    Syntax(usize),
    UnexpectedEnd,
    BadNumber(usize),
    TooDeep,
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvError::Syntax(pos) => write!(f, "syntax error at byte {pos}"),
            KvError::UnexpectedEnd => write!(f, "unexpected end of input"),
            KvError::BadNumber(pos) => write!(f, "malformed number at byte {pos}"),
            KvError::TooDeep => write!(f, "nesting too deep"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Token<'a> {
    BeginObject,
    EndObject,
    BeginArray,
    EndArray,
    Colon,
    Comma,
    /// Quoted string, escapes still in place
    Str(&'a str),
    Number(i64),
    /// Bare word
    Word(&'a str),
}

pub struct Tokenizer<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take_while(&mut self, pred: impl Fn(u8) -> bool) -> &'a str {
        let bytes = self.src.as_bytes();
        let start = self.pos;
        while self.pos < bytes.len() && pred(bytes[self.pos]) {
            self.pos += 1;
        }
        &self.src[start..self.pos]
    }

    fn string(&mut self) -> Result<Token<'a>, KvError> {
        let bytes = self.src.as_bytes();
        let start = self.pos;
        let mut escaped = false;
        while self.pos < bytes.len() {
            let b = bytes[self.pos];
            self.pos += 1;
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => return Ok(Token::Str(&self.src[start..self.pos - 1])),
                _ => {}
            }
        }
        Err(KvError::UnexpectedEnd)
    }

    fn number(&mut self) -> Result<Token<'a>, KvError> {
        let start = self.pos;
        let negative = self.src.as_bytes()[self.pos] == b'-';
        if negative {
            self.pos += 1;
        }
        let digits = self.take_while(|b| b.is_ascii_alphanumeric());
        let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
            Some(hex) => i64::from_str_radix(hex, 16),
            None => digits.parse::<i64>(),
        }
        .map_err(|_| KvError::BadNumber(start))?;
        Ok(Token::Number(if negative { -magnitude } else { magnitude }))
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Result<Token<'a>, KvError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.take_while(|b| b.is_ascii_whitespace());
        let b = *self.src.as_bytes().get(self.pos)?;
        let token = match b {
            b'{' => Ok(Token::BeginObject),
            b'}' => Ok(Token::EndObject),
            b'[' => Ok(Token::BeginArray),
            b']' => Ok(Token::EndArray),
            b':' => Ok(Token::Colon),
            b',' => Ok(Token::Comma),
            b'"' => {
                self.pos += 1;
                return Some(self.string());
            }
            b'-' | b'0'..=b'9' => return Some(self.number()),
            b if b.is_ascii_alphabetic() || b == b'_' => {
                return Some(Ok(Token::Word(
                    self.take_while(|b| b.is_ascii_alphanumeric() || b == b'_'),
                )));
            }
            _ => Err(KvError::Syntax(self.pos)),
        };
        self.pos += 1;
        Some(token)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Value<'a> {
    Str(&'a str),
    Number(i64),
    Word(&'a str),
}

impl Value<'_> {
    /// Numeric value, also accepting numbers written as strings.
    pub fn as_number(&self) -> Option<i64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Str(s) => s.trim().parse().ok(),
            Value::Word(_) => None,
        }
    }
}

pub trait Visitor<'a> {
    fn value(&mut self, path: &[&'a str], value: Value<'a>) -> Result<(), KvError>;

    /// Called when an object starts, objects inside arrays included.
    fn begin_object(&mut self, _path: &[&'a str]) -> Result<(), KvError> {
        Ok(())
    }

    fn end_object(&mut self, _path: &[&'a str]) -> Result<(), KvError> {
        Ok(())
    }
}

struct Parser<'a> {
    tokens: Tokenizer<'a>,
    peeked: Option<Token<'a>>,
    path: Vec<&'a str, MAX_DEPTH>,
    // Open objects and arrays
    depth: usize,
}

impl<'a> Parser<'a> {
    fn next(&mut self) -> Result<Token<'a>, KvError> {
        if let Some(t) = self.peeked.take() {
            return Ok(t);
        }
        self.tokens.next().unwrap_or(Err(KvError::UnexpectedEnd))
    }

    fn peek(&mut self) -> Result<Token<'a>, KvError> {
        let t = self.next()?;
        self.peeked = Some(t);
        Ok(t)
    }

    fn syntax(&self) -> KvError {
        KvError::Syntax(self.tokens.position())
    }

    fn skip_commas(&mut self) -> Result<(), KvError> {
        while self.peek()? == Token::Comma {
            self.next()?;
        }
        Ok(())
    }

    fn enter(&mut self) -> Result<(), KvError> {
        if self.depth == MAX_DEPTH {
            return Err(KvError::TooDeep);
        }
        self.depth += 1;
        Ok(())
    }

    fn value<V: Visitor<'a>>(&mut self, visitor: &mut V) -> Result<(), KvError> {
        match self.next()? {
            Token::BeginObject => self.object(visitor),
            Token::BeginArray => self.array(visitor),
            Token::Str(s) => visitor.value(&self.path, Value::Str(s)),
            Token::Number(n) => visitor.value(&self.path, Value::Number(n)),
            Token::Word(w) => visitor.value(&self.path, Value::Word(w)),
            _ => Err(self.syntax()),
        }
    }

    fn object<V: Visitor<'a>>(&mut self, visitor: &mut V) -> Result<(), KvError> {
        self.enter()?;
        visitor.begin_object(&self.path)?;
        loop {
            self.skip_commas()?;
            let key = match self.next()? {
                Token::EndObject => break,
                Token::Word(k) | Token::Str(k) => k,
                _ => return Err(self.syntax()),
            };
            if self.next()? != Token::Colon {
                return Err(self.syntax());
            }
            self.path.push(key).map_err(|_| KvError::TooDeep)?;
            self.value(visitor)?;
            self.path.pop();
        }
        self.depth -= 1;
        visitor.end_object(&self.path)
    }

    fn array<V: Visitor<'a>>(&mut self, visitor: &mut V) -> Result<(), KvError> {
        self.enter()?;
        loop {
            self.skip_commas()?;
            if self.peek()? == Token::EndArray {
                self.next()?;
                self.depth -= 1;
                return Ok(());
            }
            self.value(visitor)?;
        }
    }
}

/// Walks the document in `src`, which must be a single object.
pub fn parse<'a, V: Visitor<'a>>(src: &'a str, visitor: &mut V) -> Result<(), KvError> {
    let mut parser = Parser {
        tokens: Tokenizer::new(src),
        peeked: None,
        path: Vec::new(),
        depth: 0,
    };
    match parser.next()? {
        Token::BeginObject => parser.object(visitor),
        _ => Err(parser.syntax()),
    }
}

/// Copies `raw` into a bounded string, resolving `\"` and `\\` escapes and
/// truncating at a character boundary when it does not fit.
pub fn unescape<const N: usize>(raw: &str) -> String<N> {
    let mut out = String::new();
    let mut escaped = false;
    for c in raw.chars() {
        if !escaped && c == '\\' {
            escaped = true;
            continue;
        }
        escaped = false;
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

/// Copies `s` into a bounded string, truncating at a character boundary.
pub fn truncated<const N: usize>(s: &str) -> String<N> {
    let mut out = String::new();
    for c in s.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

/// Displays a string as a quoted, escaped literal.
pub struct Quoted<'a>(pub &'a str);

impl fmt::Display for Quoted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"")?;
        for c in self.0.chars() {
            match c {
                '"' => f.write_str("\\\"")?,
                '\\' => f.write_str("\\\\")?,
                '\n' | '\r' => f.write_str(" ")?,
                c => fmt::Write::write_char(f, c)?,
            }
        }
        f.write_str("\"")
    }
}

#[cfg(test)]
mod kv_tests {
    use super::*;

    #[derive(Default)]
    struct Collect {
        seen: std::vec::Vec<(std::string::String, Value<'static>)>,
        objects: usize,
    }

    impl Visitor<'static> for Collect {
        fn value(&mut self, path: &[&'static str], value: Value<'static>) -> Result<(), KvError> {
            self.seen.push((path.join("."), value));
            Ok(())
        }

        fn begin_object(&mut self, _path: &[&'static str]) -> Result<(), KvError> {
            self.objects += 1;
            Ok(())
        }
    }

    fn at(path: &str, value: Value<'static>) -> (std::string::String, Value<'static>) {
        (path.into(), value)
    }

    #[test]
    fn tokenizes_bare_keys_hex_and_strings() {
        let tokens: std::vec::Vec<_> = Tokenizer::new(r#"{ a_1 : 0x1F, b : "x\"y" , c: -3 }"#)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            tokens,
            [
                Token::BeginObject,
                Token::Word("a_1"),
                Token::Colon,
                Token::Number(31),
                Token::Comma,
                Token::Word("b"),
                Token::Colon,
                Token::Str(r#"x\"y"#),
                Token::Comma,
                Token::Word("c"),
                Token::Colon,
                Token::Number(-3),
                Token::EndObject,
            ]
        );
    }

    #[test]
    fn reports_nested_paths() {
        let src = "{\n  baud : 115200,\n  common : [\"a\", \"b\"],\n  image_count : 1\n  image : [\n    { name : \"app\", sector : 0, },\n  ],\n}\n";
        let mut c = Collect::default();
        parse(src, &mut c).unwrap();

        assert_eq!(c.objects, 2);
        assert_eq!(
            c.seen,
            [
                at("baud", Value::Number(115200)),
                at("common", Value::Str("a")),
                at("common", Value::Str("b")),
                at("image_count", Value::Number(1)),
                at("image.name", Value::Str("app")),
                at("image.sector", Value::Number(0)),
            ]
        );
    }

    #[test]
    fn rejects_truncated_documents() {
        let mut c = Collect::default();
        assert_eq!(parse("{ a : [1, 2", &mut c), Err(KvError::UnexpectedEnd));
        assert_eq!(parse("{ a : \"open", &mut c), Err(KvError::UnexpectedEnd));
    }

    #[test]
    fn nested_arrays_count_toward_depth() {
        let mut c = Collect::default();
        let deep = "{ a : [[[[[[[[[1]]]]]]]]] }";
        assert_eq!(parse(deep, &mut c), Err(KvError::TooDeep));

        let mut c = Collect::default();
        let ok = "{ a : [[[[[[1]]]]]] }";
        assert_eq!(parse(ok, &mut c), Ok(()));
        assert_eq!(c.seen, [at("a", Value::Number(1))]);

        let mut c = Collect::default();
        let unbounded = ("{ a : ".to_string() + &"[".repeat(10_000)).leak();
        assert_eq!(parse(unbounded, &mut c), Err(KvError::TooDeep));
    }

    #[test]
    fn rejects_missing_colon() {
        let mut c = Collect::default();
        assert!(matches!(parse("{ a 1 }", &mut c), Err(KvError::Syntax(_))));
    }

    #[test]
    fn quoted_output_parses_back() {
        let text = std::format!("{{ v : {} }}", Quoted(r#"say "hi" \o/"#));
        let mut c = Collect::default();
        let leaked: &'static str = std::boxed::Box::leak(text.into_boxed_str());
        parse(leaked, &mut c).unwrap();
        let Value::Str(raw) = c.seen[0].1 else {
            panic!("expected a string");
        };
        assert_eq!(unescape::<32>(raw).as_str(), r#"say "hi" \o/"#);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s: String<4> = truncated("abé€");
        assert_eq!(s.as_str(), "abé");
    }
}
