//! Diagnostics console
//!
//! Collects level-tagged log lines during a run plus a single hard-error
//! slot holding the terminal error, if any. The console is cleared at the
//! start of every run.

use crate::error::PatternLanguageError;

/// Severity of a console message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn name(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// Per-run diagnostics sink.
#[derive(Debug, Default)]
pub struct LogConsole {
    log: Vec<(LogLevel, String)>,
    hard_error: Option<PatternLanguageError>,
}

impl LogConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.log.push((level, message.into()));
    }

    pub fn get_log(&self) -> &[(LogLevel, String)] {
        &self.log
    }

    pub fn set_hard_error(&mut self, error: PatternLanguageError) {
        self.hard_error = Some(error);
    }

    pub fn last_hard_error(&self) -> Option<&PatternLanguageError> {
        self.hard_error.as_ref()
    }

    /// Drop all collected messages and the hard error. Called at run start.
    pub fn clear(&mut self) {
        self.log.clear();
        self.hard_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_and_clear() {
        let mut console = LogConsole::new();
        console.log(LogLevel::Info, "starting");
        console.log(LogLevel::Warning, "odd value");
        assert_eq!(console.get_log().len(), 2);
        assert_eq!(console.get_log()[1].0, LogLevel::Warning);

        console.set_hard_error(PatternLanguageError::new(3, "boom"));
        assert!(console.last_hard_error().is_some());

        console.clear();
        assert!(console.get_log().is_empty());
        assert!(console.last_hard_error().is_none());
    }
}
