use crate::error::ParseError;

/// A single C declaration token.
///
/// Operator tokens are matched longest first, so `-` and `.` always come
/// out as punctuation and a numeric literal never starts with a sign. The
/// sign of a constant is applied by the expression evaluator instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tok {
    Ident(String),
    /// Integer literal. The value keeps the full unsigned 64-bit pattern
    /// so `0xFFFFFFFFFFFFFFFF` survives; the evaluator works on the bits.
    Num(i64),
    /// Quoted literal with escape sequences left untouched.
    Str(String),
    Ellipsis,
    Shl,
    Shr,
    AndAnd,
    OrOr,
    Le,
    Ge,
    EqEq,
    Ne,
    OpenBrace,
    CloseBrace,
    Semi,
    Comma,
    Colon,
    Assign,
    OpenParen,
    CloseParen,
    OpenSquare,
    CloseSquare,
    Dot,
    Amp,
    Not,
    Tilde,
    Minus,
    Plus,
    Star,
    Slash,
    Percent,
    Lt,
    Gt,
    Caret,
    Pipe,
    Question,
    Pound,
}

const TOK2: [(&[u8; 2], Tok); 8] = [
    (b">>", Tok::Shr),
    (b"<<", Tok::Shl),
    (b"&&", Tok::AndAnd),
    (b"||", Tok::OrOr),
    (b"<=", Tok::Le),
    (b">=", Tok::Ge),
    (b"==", Tok::EqEq),
    (b"!=", Tok::Ne),
];

const TOK1: [(u8, Tok); 25] = [
    (b'{', Tok::OpenBrace),
    (b'}', Tok::CloseBrace),
    (b';', Tok::Semi),
    (b',', Tok::Comma),
    (b':', Tok::Colon),
    (b'=', Tok::Assign),
    (b'(', Tok::OpenParen),
    (b')', Tok::CloseParen),
    (b'[', Tok::OpenSquare),
    (b']', Tok::CloseSquare),
    (b'.', Tok::Dot),
    (b'&', Tok::Amp),
    (b'!', Tok::Not),
    (b'~', Tok::Tilde),
    (b'-', Tok::Minus),
    (b'+', Tok::Plus),
    (b'*', Tok::Star),
    (b'/', Tok::Slash),
    (b'%', Tok::Percent),
    (b'<', Tok::Lt),
    (b'>', Tok::Gt),
    (b'^', Tok::Caret),
    (b'|', Tok::Pipe),
    (b'?', Tok::Question),
    (b'#', Tok::Pound),
];

/// Streaming tokenizer over a declaration string with one token of
/// pushback. `put_back` rewinds the cursor to the start of the token just
/// returned; the token is re-read on the next call.
pub struct Lexer<'s> {
    src: &'s [u8],
    pos: usize,
    prev: usize,
    line: u32,
}

impl<'s> Lexer<'s> {
    pub fn new(src: &'s str) -> Lexer<'s> {
        let mut bytes = src.as_bytes();
        if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
            bytes = &bytes[3..];
        }
        Lexer {
            src: bytes,
            pos: 0,
            prev: 0,
            line: 1,
        }
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(message, self.line)
    }

    /// Rewinds to the start of the most recently returned token.
    pub fn put_back(&mut self) {
        self.pos = self.prev;
    }

    /// Returns the next token, or an error at end of input.
    pub fn require(&mut self) -> Result<Tok, ParseError> {
        match self.next()? {
            Some(tok) => Ok(tok),
            None => Err(self.error("unexpected end")),
        }
    }

    /// Returns the next token or `None` at end of input.
    pub fn next(&mut self) -> Result<Option<Tok>, ParseError> {
        self.skip_blank()?;

        let s = &self.src[self.pos..];
        if s.is_empty() {
            self.prev = self.pos;
            return Ok(None);
        }

        self.prev = self.pos;

        if s.starts_with(b"...") {
            self.pos += 3;
            return Ok(Some(Tok::Ellipsis));
        }

        for (pat, tok) in TOK2 {
            if s.starts_with(pat) {
                self.pos += 2;
                return Ok(Some(tok));
            }
        }

        for (ch, tok) in TOK1 {
            if s[0] == ch {
                self.pos += 1;
                return Ok(Some(tok));
            }
        }

        match s[0] {
            b'0'..=b'9' => self.lex_number().map(Some),
            b'\'' | b'"' => self.lex_string(s[0]).map(Some),
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => Ok(Some(self.lex_ident())),
            c => Err(self.error(format!("invalid character '{}'", c as char))),
        }
    }

    fn skip_blank(&mut self) -> Result<(), ParseError> {
        loop {
            while let Some(&c) = self.src.get(self.pos) {
                match c {
                    b' ' | b'\t' | b'\r' | b'\x0b' => self.pos += 1,
                    b'\n' => {
                        self.line += 1;
                        self.pos += 1;
                    }
                    _ => break,
                }
            }

            let s = &self.src[self.pos..];
            if s.starts_with(b"//") {
                match s.iter().position(|&c| c == b'\n') {
                    Some(n) => self.pos += n,
                    None => return Err(self.error("non-terminated comment")),
                }
            } else if s.starts_with(b"/*") {
                self.pos += 2;
                loop {
                    let s = &self.src[self.pos..];
                    if s.is_empty() {
                        return Err(self.error("non-terminated comment"));
                    } else if s.starts_with(b"*/") {
                        self.pos += 2;
                        break;
                    } else {
                        if s[0] == b'\n' {
                            self.line += 1;
                        }
                        self.pos += 1;
                    }
                }
            } else {
                return Ok(());
            }
        }
    }

    /// C integer literal: `0x` hex, leading-zero octal, otherwise decimal,
    /// with any `u`/`U`/`l`/`L` suffix run skipped. Overflow pins to the
    /// maximum, matching `strtoul`.
    fn lex_number(&mut self) -> Result<Tok, ParseError> {
        let s = &self.src[self.pos..];
        let mut value: u64 = 0;
        let mut overflow = false;
        let mut len = 0;

        let (base, digits_at) = if s.len() > 2
            && s[0] == b'0'
            && (s[1] == b'x' || s[1] == b'X')
            && s[2].is_ascii_hexdigit()
        {
            (16u64, 2)
        } else if s[0] == b'0' {
            (8u64, 0)
        } else {
            (10u64, 0)
        };

        for &c in &s[digits_at..] {
            let digit = match c {
                b'0'..=b'9' => (c - b'0') as u64,
                b'a'..=b'f' => (c - b'a' + 10) as u64,
                b'A'..=b'F' => (c - b'A' + 10) as u64,
                _ => break,
            };
            if digit >= base {
                break;
            }
            match value.checked_mul(base).and_then(|v| v.checked_add(digit)) {
                Some(v) => value = v,
                None => overflow = true,
            }
            len += 1;
        }
        len += digits_at;

        if overflow {
            value = u64::MAX;
        }

        while let Some(c) = s.get(len) {
            match c {
                b'u' | b'U' | b'l' | b'L' => len += 1,
                _ => break,
            }
        }

        self.pos += len;
        Ok(Tok::Num(value as i64))
    }

    fn lex_string(&mut self, quote: u8) -> Result<Tok, ParseError> {
        let mut end = self.pos + 1;
        loop {
            match self.src.get(end) {
                None => return Err(self.error("string not finished")),
                Some(&c) if c == quote => break,
                Some(b'\\') => {
                    if end + 1 >= self.src.len() {
                        return Err(self.error("string not finished"));
                    }
                    end += 2;
                }
                Some(_) => end += 1,
            }
        }

        let body = String::from_utf8_lossy(&self.src[self.pos + 1..end]).into_owned();
        self.pos = end + 1;
        Ok(Tok::Str(body))
    }

    fn lex_ident(&mut self) -> Tok {
        let start = self.pos;
        while let Some(&c) = self.src.get(self.pos) {
            match c {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' => self.pos += 1,
                _ => break,
            }
        }
        let name = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        Tok::Ident(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all(src: &str) -> Vec<Tok> {
        let mut lex = Lexer::new(src);
        let mut out = Vec::new();
        while let Some(tok) = lex.next().expect("lex failed") {
            out.push(tok);
        }
        out
    }

    #[test]
    fn punctuation_longest_first() {
        assert_eq!(all("<< <"), vec![Tok::Shl, Tok::Lt]);
        assert_eq!(all(">>="), vec![Tok::Shr, Tok::Assign]);
        assert_eq!(all("..."), vec![Tok::Ellipsis]);
        assert_eq!(all("&&&"), vec![Tok::AndAnd, Tok::Amp]);
    }

    #[test]
    fn minus_is_always_punctuation() {
        assert_eq!(all("-5"), vec![Tok::Minus, Tok::Num(5)]);
    }

    #[test]
    fn numbers() {
        assert_eq!(all("123"), vec![Tok::Num(123)]);
        assert_eq!(all("0x10"), vec![Tok::Num(16)]);
        assert_eq!(all("010"), vec![Tok::Num(8)]);
        assert_eq!(all("0"), vec![Tok::Num(0)]);
        assert_eq!(all("123UL 5u"), vec![Tok::Num(123), Tok::Num(5)]);
        // Full unsigned range survives in the bit pattern.
        assert_eq!(all("0xFFFFFFFFFFFFFFFF"), vec![Tok::Num(-1)]);
        // An out-of-base digit ends the literal, as strtoul does.
        assert_eq!(all("08"), vec![Tok::Num(0), Tok::Num(8)]);
    }

    #[test]
    fn identifiers() {
        assert_eq!(
            all("uint8_t _x9"),
            vec![
                Tok::Ident("uint8_t".to_string()),
                Tok::Ident("_x9".to_string())
            ]
        );
    }

    #[test]
    fn strings_keep_escapes() {
        assert_eq!(all(r#""ab\"c""#), vec![Tok::Str("ab\\\"c".to_string())]);
        assert_eq!(all("'x'"), vec![Tok::Str("x".to_string())]);
    }

    #[test]
    fn comments_and_lines() {
        let mut lex = Lexer::new("a // one\n/* two\nthree */ b");
        assert_eq!(lex.next().unwrap(), Some(Tok::Ident("a".to_string())));
        assert_eq!(lex.next().unwrap(), Some(Tok::Ident("b".to_string())));
        assert_eq!(lex.line(), 3);
        assert_eq!(lex.next().unwrap(), None);
    }

    #[test]
    fn bom_is_skipped() {
        assert_eq!(all("\u{FEFF}int"), vec![Tok::Ident("int".to_string())]);
    }

    #[test]
    fn put_back_replays_the_token() {
        let mut lex = Lexer::new("struct point");
        assert_eq!(lex.next().unwrap(), Some(Tok::Ident("struct".to_string())));
        lex.put_back();
        assert_eq!(lex.next().unwrap(), Some(Tok::Ident("struct".to_string())));
        assert_eq!(lex.next().unwrap(), Some(Tok::Ident("point".to_string())));
    }

    #[test]
    fn lex_errors() {
        let mut lex = Lexer::new("/* open");
        assert!(lex.next().is_err());

        let mut lex = Lexer::new("\n@");
        let err = lex.next().unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("invalid character"));

        let mut lex = Lexer::new("\"open");
        assert!(lex.next().is_err());

        let mut lex = Lexer::new("  ");
        assert!(lex.require().is_err());
    }
}
