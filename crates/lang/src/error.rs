//! Error type shared by every pipeline stage
//!
//! All stages report failures as a `PatternLanguageError` carrying the
//! source line the failure was detected on. The first error short-circuits
//! the pipeline; the runtime records it in the console's hard-error slot.

use std::fmt;

/// A terminal error produced by any stage of the pipeline.
///
/// `line` is 1-indexed; line 0 means "no source position" (e.g. failures
/// raised by the runtime itself rather than by user code).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternLanguageError {
    pub line: u32,
    pub message: String,
}

impl PatternLanguageError {
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        PatternLanguageError {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for PatternLanguageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line == 0 {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} (line {})", self.message, self.line)
        }
    }
}

impl std::error::Error for PatternLanguageError {}

pub type Result<T> = std::result::Result<T, PatternLanguageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_line() {
        let err = PatternLanguageError::new(12, "Parser: unexpected token");
        assert_eq!(err.to_string(), "Parser: unexpected token (line 12)");
    }

    #[test]
    fn test_display_without_line() {
        let err = PatternLanguageError::new(0, "non-success value returned from main: 1");
        assert_eq!(err.to_string(), "non-success value returned from main: 1");
    }
}
