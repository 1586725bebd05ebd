use super::token::{keyword_type, Token, TokenType};

/// Walks a source buffer and emits [`Token`]s one at a time. Mirrors the
/// teacher's `Lexer` in spirit (a `start`/`current` cursor pair scanning a
/// shared buffer) but borrows `&'src str` slices directly out of `source`
/// instead of cloning into an `Rc<String>`, since nothing here needs shared
/// ownership of the buffer -- a single scanner borrow for the whole compile
/// session is enough.
pub struct Scanner<'src> {
    source: &'src str,
    start: usize,
    current: usize,
    line: u32,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            start: 0,
            current: 0,
            line: 1,
        }
    }

    pub fn scan_token(&mut self) -> Token<'src> {
        self.skip_whitespace_and_comments();
        self.start = self.current;

        let Some(c) = self.advance() else {
            return self.make_token(TokenType::Eof);
        };

        if is_alpha(c) {
            return self.identifier();
        }
        if c.is_ascii_digit() {
            return self.number();
        }

        match c {
            '(' => self.make_token(TokenType::LeftParen),
            ')' => self.make_token(TokenType::RightParen),
            '{' => self.make_token(TokenType::LeftBrace),
            '}' => self.make_token(TokenType::RightBrace),
            ',' => self.make_token(TokenType::Comma),
            '.' => self.make_token(TokenType::Dot),
            '-' => self.make_token(TokenType::Minus),
            '+' => self.make_token(TokenType::Plus),
            ';' => self.make_token(TokenType::Semicolon),
            '*' => self.make_token(TokenType::Star),
            '/' => self.make_token(TokenType::Slash),
            '!' => {
                let typ = if self.matches('=') {
                    TokenType::BangEqual
                } else {
                    TokenType::Bang
                };
                self.make_token(typ)
            }
            '=' => {
                let typ = if self.matches('=') {
                    TokenType::EqualEqual
                } else {
                    TokenType::Equal
                };
                self.make_token(typ)
            }
            '<' => {
                let typ = if self.matches('=') {
                    TokenType::LessEqual
                } else {
                    TokenType::Less
                };
                self.make_token(typ)
            }
            '>' => {
                let typ = if self.matches('=') {
                    TokenType::GreaterEqual
                } else {
                    TokenType::Greater
                };
                self.make_token(typ)
            }
            '"' => self.string(),
            _ => self.error_token("Unexpected character."),
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(' ') | Some('\t') | Some('\r') => {
                    self.advance();
                }
                Some('\n') => {
                    self.line += 1;
                    self.advance();
                }
                Some('/') if self.peek_next() == Some('/') => {
                    while self.peek().is_some() && self.peek() != Some('\n') {
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn identifier(&mut self) -> Token<'src> {
        while self.peek().map_or(false, is_alphanumeric) {
            self.advance();
        }
        let text = &self.source[self.start..self.current];
        self.make_token(keyword_type(text))
    }

    fn number(&mut self) -> Token<'src> {
        while self.peek().map_or(false, |c| c.is_ascii_digit()) {
            self.advance();
        }
        if self.peek() == Some('.') && self.peek_next().map_or(false, |c| c.is_ascii_digit()) {
            self.advance(); // consume the '.'
            while self.peek().map_or(false, |c| c.is_ascii_digit()) {
                self.advance();
            }
        }
        self.make_token(TokenType::Number)
    }

    fn string(&mut self) -> Token<'src> {
        while let Some(c) = self.peek() {
            if c == '"' {
                break;
            }
            if c == '\n' {
                self.line += 1;
            }
            self.advance();
        }
        if self.peek().is_none() {
            return self.error_token("Unterminated string.");
        }
        self.advance(); // closing quote
        self.make_token(TokenType::String)
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.current += c.len_utf8();
        Some(c)
    }

    fn peek(&self) -> Option<char> {
        self.source[self.current..].chars().next()
    }

    fn peek_next(&self) -> Option<char> {
        let mut chars = self.source[self.current..].chars();
        chars.next()?;
        chars.next()
    }

    fn matches(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn make_token(&self, typ: TokenType) -> Token<'src> {
        Token::new(typ, &self.source[self.start..self.current], self.line)
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token::synthetic(message, self.line)
    }
}

fn is_alpha(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_alphanumeric(c: char) -> bool {
    is_alpha(c) || c.is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(source: &str) -> Vec<TokenType> {
        let mut scanner = Scanner::new(source);
        let mut out = vec![];
        loop {
            let token = scanner.scan_token();
            let typ = token.typ;
            out.push(typ);
            if typ == TokenType::Eof {
                break;
            }
        }
        out
    }

    #[test]
    fn scans_punctuation_and_two_char_operators() {
        use TokenType::*;
        assert_eq!(
            scan_all("(){},.-+;*/ ! != = == < <= > >="),
            vec![
                LeftParen, RightParen, LeftBrace, RightBrace, Comma, Dot, Minus, Plus, Semicolon,
                Star, Slash, Bang, BangEqual, Equal, EqualEqual, Less, LessEqual, Greater,
                GreaterEqual, Eof,
            ]
        );
    }

    #[test]
    fn repeated_eof_after_end() {
        let mut scanner = Scanner::new("1");
        assert_eq!(scanner.scan_token().typ, TokenType::Number);
        assert_eq!(scanner.scan_token().typ, TokenType::Eof);
        assert_eq!(scanner.scan_token().typ, TokenType::Eof);
    }

    #[test]
    fn skips_line_comments() {
        let mut scanner = Scanner::new("// a whole comment\n1");
        let token = scanner.scan_token();
        assert_eq!(token.typ, TokenType::Number);
        assert_eq!(token.line, 2);
    }

    #[test]
    fn numbers_with_and_without_fraction() {
        let mut scanner = Scanner::new("123 45.67");
        let a = scanner.scan_token();
        assert_eq!(a.typ, TokenType::Number);
        assert_eq!(a.lexeme, "123");
        let b = scanner.scan_token();
        assert_eq!(b.typ, TokenType::Number);
        assert_eq!(b.lexeme, "45.67");
    }

    #[test]
    fn strings_allow_embedded_newlines() {
        let mut scanner = Scanner::new("\"a\nb\"");
        let token = scanner.scan_token();
        assert_eq!(token.typ, TokenType::String);
        assert_eq!(token.lexeme, "\"a\nb\"");
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        let mut scanner = Scanner::new("\"unterminated");
        let token = scanner.scan_token();
        assert_eq!(token.typ, TokenType::Error);
        assert_eq!(token.lexeme, "Unterminated string.");
    }

    #[test]
    fn identifiers_vs_keywords() {
        let mut scanner = Scanner::new("forge fun");
        let a = scanner.scan_token();
        assert_eq!(a.typ, TokenType::Identifier);
        let b = scanner.scan_token();
        assert_eq!(b.typ, TokenType::Fun);
    }

    #[test]
    fn line_counter_advances_on_newlines_only() {
        let mut scanner = Scanner::new("1\n2\n\n3");
        assert_eq!(scanner.scan_token().line, 1);
        assert_eq!(scanner.scan_token().line, 2);
        assert_eq!(scanner.scan_token().line, 4);
    }
}
