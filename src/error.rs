use std::fmt;

use super::token::Token;

/// A single compile-time diagnostic, formatted exactly as
/// `[line N] Error at '<lexeme>': <message>` (or `at end` for EOF). The
/// compiler never stops at the first one -- `synchronize` lets it skip to
/// the next statement boundary and keep collecting these into a `Vec`.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: u32,
    pub lexeme: String,
    pub at_end: bool,
    pub message: String,
}

impl CompileError {
    pub fn at(token: &Token, message: impl Into<String>) -> Self {
        Self {
            line: token.line,
            lexeme: token.lexeme.to_string(),
            at_end: token.is_eof(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.at_end {
            write!(f, "[line {}] Error at end: {}", self.line, self.message)
        } else {
            write!(
                f,
                "[line {}] Error at '{}': {}",
                self.line, self.lexeme, self.message
            )
        }
    }
}

/// One activation record's contribution to a runtime stack trace: the
/// source line the call frame was stopped at, and the callee's name
/// (`None` for the top-level script).
#[derive(Debug, Clone)]
pub struct BacktraceFrame {
    pub line: u32,
    pub name: Option<String>,
}

impl fmt::Display for BacktraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "[line {}] in {}", self.line, name),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

/// A runtime failure: a message plus the call stack active when it was
/// raised, most-recent frame first (reverse-chronological, matching the
/// order the VM unwound through when building it).
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub frames: Vec<BacktraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            frames: vec![],
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for (i, frame) in self.frames.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{frame}")?;
        }
        Ok(())
    }
}

/// The three-way outcome of `Vm::interpret`, kept distinct (rather than
/// folded into a single `Result<(), Error>`) so the CLI layer can map each
/// case to its own process exit code per the external interface spec.
#[derive(Debug)]
pub enum InterpretResult {
    Ok,
    CompileError(Vec<CompileError>),
    RuntimeError(RuntimeError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenType;

    #[test]
    fn formats_error_at_lexeme() {
        let token = Token::new(TokenType::Identifier, "foo", 3);
        let err = CompileError::at(&token, "Undefined variable.");
        assert_eq!(
            err.to_string(),
            "[line 3] Error at 'foo': Undefined variable."
        );
    }

    #[test]
    fn formats_error_at_end() {
        let token = Token::new(TokenType::Eof, "", 7);
        let err = CompileError::at(&token, "Expect expression.");
        assert_eq!(err.to_string(), "[line 7] Error at end: Expect expression.");
    }

    #[test]
    fn formats_backtrace_most_recent_first() {
        let err = RuntimeError {
            message: "Undefined variable 'x'.".to_string(),
            frames: vec![
                BacktraceFrame {
                    line: 4,
                    name: Some("inner".to_string()),
                },
                BacktraceFrame {
                    line: 9,
                    name: None,
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "Undefined variable 'x'.\n[line 4] in inner\n[line 9] in script"
        );
    }
}
