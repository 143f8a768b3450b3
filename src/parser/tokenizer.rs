//! SQL tokenization
//!
//! Splits SQL text into tokens following SQLite's lexical rules. Keywords
//! are not distinguished from identifiers here; the grammar matches them
//! case-insensitively against unquoted identifier tokens.

use crate::error::{Error, Result};

// ============================================================================
// Token Types
// ============================================================================

/// Token value
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Identifier or keyword; `quoted` when written as "x", [x] or `x`
    Ident { text: String, quoted: bool },
    Integer(i64),
    /// Integer literal too large for i64, kept as text
    BigInteger(String),
    Real(f64),
    String(String),
    Blob(Vec<u8>),
    /// `?`, `?NNN`, `:name`, `@name` or `$name` (text as written)
    Variable(String),
    /// Operator or punctuation
    Punct(&'static str),
    Eof,
}

/// A token with its byte span in the source
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub start: usize,
    pub end: usize,
}

impl Token {
    /// Whether this is the unquoted keyword `kw` (case-insensitive)
    pub fn is_keyword(&self, kw: &str) -> bool {
        matches!(self, Token::Ident { text, quoted: false } if text.eq_ignore_ascii_case(kw))
    }

    pub fn is_punct(&self, p: &str) -> bool {
        matches!(self, Token::Punct(q) if *q == p)
    }

    /// Text for error messages
    pub fn describe(&self) -> String {
        match self {
            Token::Ident { text, .. } => text.clone(),
            Token::Integer(i) => i.to_string(),
            Token::BigInteger(s) => s.clone(),
            Token::Real(r) => r.to_string(),
            Token::String(s) => format!("'{}'", s),
            Token::Blob(b) => format!("X'{}'", hex::encode(b)),
            Token::Variable(v) => v.clone(),
            Token::Punct(p) => (*p).to_string(),
            Token::Eof => String::new(),
        }
    }
}

// ============================================================================
// Tokenizer
// ============================================================================

const PUNCTS: &[&str] = &[
    "<<", ">>", "<=", ">=", "<>", "!=", "==", "||", "->", "(", ")", ",", ";", ".", "*", "+", "-", "/", "%",
    "=", "<", ">", "&", "|", "~",
];

/// Tokenizer over a SQL string
pub struct Tokenizer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(src: &'a str) -> Self {
        Tokenizer {
            src,
            bytes: src.as_bytes(),
            pos: 0,
        }
    }

    /// Tokenize the whole input; the last token is always `Eof`
    pub fn tokenize(mut self) -> Result<Vec<Spanned>> {
        let mut out = Vec::new();
        loop {
            self.skip_space_and_comments()?;
            let start = self.pos;
            if self.pos >= self.bytes.len() {
                out.push(Spanned {
                    token: Token::Eof,
                    start,
                    end: start,
                });
                return Ok(out);
            }
            let token = self.scan()?;
            out.push(Spanned {
                token,
                start,
                end: self.pos,
            });
        }
    }

    fn peek(&self, off: usize) -> u8 {
        self.bytes.get(self.pos + off).copied().unwrap_or(0)
    }

    fn skip_space_and_comments(&mut self) -> Result<()> {
        loop {
            let c = self.peek(0);
            if c.is_ascii_whitespace() {
                self.pos += 1;
            } else if c == b'-' && self.peek(1) == b'-' {
                while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                    self.pos += 1;
                }
            } else if c == b'/' && self.peek(1) == b'*' {
                self.pos += 2;
                loop {
                    if self.pos >= self.bytes.len() {
                        break;
                    }
                    if self.peek(0) == b'*' && self.peek(1) == b'/' {
                        self.pos += 2;
                        break;
                    }
                    self.pos += 1;
                }
            } else {
                return Ok(());
            }
        }
    }

    fn scan(&mut self) -> Result<Token> {
        let c = self.peek(0);
        match c {
            b'\'' => self.scan_string().map(Token::String),
            b'"' | b'`' => self.scan_quoted(c).map(|text| Token::Ident { text, quoted: true }),
            b'[' => {
                let start = self.pos + 1;
                match self.src[start..].find(']') {
                    Some(n) => {
                        self.pos = start + n + 1;
                        Ok(Token::Ident {
                            text: self.src[start..start + n].to_string(),
                            quoted: true,
                        })
                    }
                    None => Err(Error::sql("unrecognized token: \"[\"")),
                }
            }
            b'x' | b'X' if self.peek(1) == b'\'' => self.scan_blob(),
            b'0'..=b'9' => self.scan_number(),
            b'.' if self.peek(1).is_ascii_digit() => self.scan_number(),
            b'?' => {
                let start = self.pos;
                self.pos += 1;
                while self.peek(0).is_ascii_digit() {
                    self.pos += 1;
                }
                Ok(Token::Variable(self.src[start..self.pos].to_string()))
            }
            b':' | b'@' | b'$' => {
                let start = self.pos;
                self.pos += 1;
                while is_ident_char(self.peek(0)) {
                    self.pos += 1;
                }
                if self.pos == start + 1 {
                    return Err(Error::sql(format!("unrecognized token: \"{}\"", c as char)));
                }
                Ok(Token::Variable(self.src[start..self.pos].to_string()))
            }
            c if is_ident_start(c) => {
                let start = self.pos;
                while is_ident_char(self.peek(0)) {
                    self.pos += 1;
                }
                Ok(Token::Ident {
                    text: self.src[start..self.pos].to_string(),
                    quoted: false,
                })
            }
            _ => {
                for p in PUNCTS {
                    if self.src[self.pos..].starts_with(p) {
                        self.pos += p.len();
                        return Ok(Token::Punct(normalize_punct(p)));
                    }
                }
                let ch = self.src[self.pos..].chars().next().unwrap_or('?');
                Err(Error::sql(format!("unrecognized token: \"{}\"", ch)))
            }
        }
    }

    fn scan_string(&mut self) -> Result<String> {
        self.scan_quoted(b'\'')
            .map_err(|_| Error::sql("unrecognized token: unterminated string"))
    }

    /// Scan text enclosed in `q`, where a doubled `q` stands for itself
    fn scan_quoted(&mut self, q: u8) -> Result<String> {
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            if self.pos >= self.bytes.len() {
                return Err(Error::sql("unrecognized token: unterminated quote"));
            }
            let c = self.bytes[self.pos];
            self.pos += 1;
            if c == q {
                if self.peek(0) == q {
                    out.push(q);
                    self.pos += 1;
                } else {
                    break;
                }
            } else {
                out.push(c);
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn scan_blob(&mut self) -> Result<Token> {
        self.pos += 1;
        let text = self.scan_quoted(b'\'')?;
        if text.len() % 2 != 0 {
            return Err(Error::sql(format!("unrecognized token: \"X'{}'\"", text)));
        }
        hex::decode(&text)
            .map(Token::Blob)
            .map_err(|_| Error::sql(format!("unrecognized token: \"X'{}'\"", text)))
    }

    fn scan_number(&mut self) -> Result<Token> {
        let start = self.pos;
        if self.peek(0) == b'0' && (self.peek(1) == b'x' || self.peek(1) == b'X') && self.peek(2).is_ascii_hexdigit() {
            self.pos += 2;
            while self.peek(0).is_ascii_hexdigit() {
                self.pos += 1;
            }
            let digits = &self.src[start + 2..self.pos];
            return u64::from_str_radix(digits, 16)
                .map(|v| Token::Integer(v as i64))
                .map_err(|_| Error::sql(format!("hex literal too big: {}", &self.src[start..self.pos])));
        }
        let mut is_real = false;
        while self.peek(0).is_ascii_digit() {
            self.pos += 1;
        }
        if self.peek(0) == b'.' {
            is_real = true;
            self.pos += 1;
            while self.peek(0).is_ascii_digit() {
                self.pos += 1;
            }
        }
        if self.peek(0) == b'e' || self.peek(0) == b'E' {
            let save = self.pos;
            self.pos += 1;
            if self.peek(0) == b'+' || self.peek(0) == b'-' {
                self.pos += 1;
            }
            if self.peek(0).is_ascii_digit() {
                is_real = true;
                while self.peek(0).is_ascii_digit() {
                    self.pos += 1;
                }
            } else {
                self.pos = save;
            }
        }
        if is_ident_start(self.peek(0)) {
            return Err(Error::sql(format!(
                "unrecognized token: \"{}\"",
                &self.src[start..=self.pos]
            )));
        }
        let text = &self.src[start..self.pos];
        if !is_real {
            if let Ok(v) = text.parse::<i64>() {
                return Ok(Token::Integer(v));
            }
            return Ok(Token::BigInteger(text.to_string()));
        }
        text.parse::<f64>()
            .map(Token::Real)
            .map_err(|_| Error::sql(format!("unrecognized token: \"{}\"", text)))
    }
}

fn normalize_punct(p: &'static str) -> &'static str {
    match p {
        "==" => "=",
        "!=" => "<>",
        other => other,
    }
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c >= 0x80
}

fn is_ident_char(c: u8) -> bool {
    is_ident_start(c) || c.is_ascii_digit() || c == b'$'
}

/// Tokenize `src`
pub fn tokenize(src: &str) -> Result<Vec<Spanned>> {
    Tokenizer::new(src).tokenize()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<Token> {
        tokenize(sql).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn test_tokenize_select_statement() {
        let toks = kinds("SELECT a, \"b c\" FROM t WHERE x >= 1.5;");
        assert!(toks[0].is_keyword("select"));
        assert_eq!(toks[3], Token::Ident { text: "b c".into(), quoted: true });
        assert_eq!(toks[7], Token::Ident { text: "x".into(), quoted: false });
        assert!(toks[8].is_punct(">="));
        assert_eq!(toks[9], Token::Real(1.5));
        assert!(toks[10].is_punct(";"));
        assert_eq!(toks[11], Token::Eof);
        assert_eq!(toks.len(), 12);
    }

    #[test]
    fn test_tokenize_strings_and_blobs() {
        let toks = kinds("'it''s' x'00ff'");
        assert_eq!(toks[0], Token::String("it's".into()));
        assert_eq!(toks[1], Token::Blob(vec![0, 0xff]));
    }

    #[test]
    fn test_tokenize_comments() {
        let toks = kinds("1 -- comment\n /* block */ 2");
        assert_eq!(toks[0], Token::Integer(1));
        assert_eq!(toks[1], Token::Integer(2));
    }

    #[test]
    fn test_tokenize_parameters() {
        let toks = kinds("? ?3 :name @x $y");
        assert_eq!(toks[0], Token::Variable("?".into()));
        assert_eq!(toks[1], Token::Variable("?3".into()));
        assert_eq!(toks[2], Token::Variable(":name".into()));
        assert_eq!(toks[4], Token::Variable("$y".into()));
    }

    #[test]
    fn test_tokenize_numbers() {
        let toks = kinds("0x10 9223372036854775808 1e3 .5");
        assert_eq!(toks[0], Token::Integer(16));
        assert_eq!(toks[1], Token::BigInteger("9223372036854775808".into()));
        assert_eq!(toks[2], Token::Real(1000.0));
        assert_eq!(toks[3], Token::Real(0.5));
    }

    #[test]
    fn test_operators_normalized() {
        let toks = kinds("a == b != c");
        assert!(toks[1].is_punct("="));
        assert!(toks[3].is_punct("<>"));
    }

    #[test]
    fn test_bad_token() {
        assert!(tokenize("SELECT #").is_err());
        assert!(tokenize("'open").is_err());
    }
}
