use std::fmt;

/// Every distinct lexeme family the scanner can produce, plus the two
/// sentinel kinds (`Error`, `Eof`) that let the parser treat scan failures
/// and end-of-input uniformly as tokens rather than as a separate channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    // single-character
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,

    // one or two character
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,

    // literals
    Identifier,
    String,
    Number,

    // keywords
    And,
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Or,
    Print,
    Return,
    Super,
    This,
    True,
    Var,
    While,

    Error,
    Eof,
}

/// A lexeme borrowed out of the original source buffer. The `'src` lifetime
/// is what the host-language spec calls out as an invariant ("the source
/// buffer must outlive all tokens and the compiler") enforced here by the
/// borrow checker rather than by convention.
#[derive(Clone, Copy)]
pub struct Token<'src> {
    pub typ: TokenType,
    pub lexeme: &'src str,
    pub line: u32,
}

impl<'src> Token<'src> {
    pub fn new(typ: TokenType, lexeme: &'src str, line: u32) -> Self {
        Self { typ, lexeme, line }
    }

    /// Synthetic token used to point a diagnostic at an error message that
    /// has no corresponding source span (e.g. "Unterminated string.").
    pub fn synthetic(lexeme: &'src str, line: u32) -> Self {
        Self::new(TokenType::Error, lexeme, line)
    }

    pub fn is_eof(&self) -> bool {
        self.typ == TokenType::Eof
    }
}

impl fmt::Debug for Token<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:?}) @ line {}", self.typ, self.lexeme, self.line)
    }
}

/// Compile-time keyword recognizer, structured as a prefix tree keyed on
/// ASCII lowercase letters: each level of the match consumes one character
/// and narrows to the branch of keywords sharing that prefix, short-
/// circuiting to `Identifier` the moment no keyword could still match.
/// This mirrors the shape of a `TrieLeaf` walk without needing to build one
/// at runtime, since the keyword set is fixed.
pub fn keyword_type(text: &str) -> TokenType {
    let mut chars = text.chars();
    match chars.next() {
        Some('a') => check_rest(chars.as_str(), "nd", TokenType::And),
        Some('c') => check_rest(chars.as_str(), "lass", TokenType::Class),
        Some('e') => check_rest(chars.as_str(), "lse", TokenType::Else),
        Some('f') => match chars.next() {
            Some('a') => check_rest(chars.as_str(), "lse", TokenType::False),
            Some('o') => check_rest(chars.as_str(), "r", TokenType::For),
            Some('u') => check_rest(chars.as_str(), "n", TokenType::Fun),
            _ => TokenType::Identifier,
        },
        Some('i') => check_rest(chars.as_str(), "f", TokenType::If),
        Some('n') => check_rest(chars.as_str(), "il", TokenType::Nil),
        Some('o') => check_rest(chars.as_str(), "r", TokenType::Or),
        Some('p') => check_rest(chars.as_str(), "rint", TokenType::Print),
        Some('r') => check_rest(chars.as_str(), "eturn", TokenType::Return),
        Some('s') => check_rest(chars.as_str(), "uper", TokenType::Super),
        Some('t') => match chars.next() {
            Some('h') => check_rest(chars.as_str(), "is", TokenType::This),
            Some('r') => check_rest(chars.as_str(), "ue", TokenType::True),
            _ => TokenType::Identifier,
        },
        Some('v') => check_rest(chars.as_str(), "ar", TokenType::Var),
        Some('w') => check_rest(chars.as_str(), "hile", TokenType::While),
        _ => TokenType::Identifier,
    }
}

fn check_rest(rest: &str, expected: &str, typ: TokenType) -> TokenType {
    if rest == expected {
        typ
    } else {
        TokenType::Identifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_every_keyword() {
        let pairs = [
            ("and", TokenType::And),
            ("class", TokenType::Class),
            ("else", TokenType::Else),
            ("false", TokenType::False),
            ("for", TokenType::For),
            ("fun", TokenType::Fun),
            ("if", TokenType::If),
            ("nil", TokenType::Nil),
            ("or", TokenType::Or),
            ("print", TokenType::Print),
            ("return", TokenType::Return),
            ("super", TokenType::Super),
            ("this", TokenType::This),
            ("true", TokenType::True),
            ("var", TokenType::Var),
            ("while", TokenType::While),
        ];
        for (text, expected) in pairs {
            assert_eq!(keyword_type(text), expected, "for {text:?}");
        }
    }

    #[test]
    fn rejects_keyword_prefixes_and_overruns() {
        for text in ["andy", "fo", "forge", "th", "tr", "printer", "supersede"] {
            assert_eq!(keyword_type(text), TokenType::Identifier, "for {text:?}");
        }
    }
}
