//! Top-level pattern language runtime
//!
//! Owns the pipeline: preprocess, lex, parse, validate, evaluate. One
//! `execute_*` call is one run; per-run state (console, type table,
//! pragmas, settings) is reset at the start of every call, and the
//! result is either a pattern tree plus out-variables or a single hard
//! error recorded in the console.

use crate::console::{LogConsole, LogLevel};
use crate::error::{PatternLanguageError, Result};
use crate::evaluator::{DangerousFunctionPermission, Evaluator, RuntimeSettings};
use crate::functions::FunctionRegistry;
use crate::lexer::Lexer;
use crate::parser::Parser;
use crate::pattern::Pattern;
use crate::preprocessor::Preprocessor;
use crate::provider::Provider;
use crate::token::{BitfieldOrder, Endian};
use crate::validator::Validator;
use crate::value::Value;
use crate::ast::Program;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct PatternLanguage {
    registry: FunctionRegistry,
    include_paths: Vec<PathBuf>,
    console: LogConsole,
    ast: Option<Program>,
    patterns: Vec<Pattern>,
    out_variables: BTreeMap<String, Value>,
    main_result: Option<Value>,
    error: Option<PatternLanguageError>,
    settings: RuntimeSettings,
    abort_flag: Arc<AtomicBool>,
    dangerous_permission: DangerousFunctionPermission,
    dangerous_called: bool,
}

impl PatternLanguage {
    pub fn new() -> Self {
        PatternLanguage {
            registry: FunctionRegistry::with_builtins(),
            include_paths: Vec::new(),
            console: LogConsole::new(),
            ast: None,
            patterns: Vec::new(),
            out_variables: BTreeMap::new(),
            main_result: None,
            error: None,
            settings: RuntimeSettings::default(),
            abort_flag: Arc::new(AtomicBool::new(false)),
            dangerous_permission: DangerousFunctionPermission::Ask,
            dangerous_called: false,
        }
    }

    /// Directory searched by `#include` directives.
    pub fn add_include_path(&mut self, path: impl Into<PathBuf>) {
        self.include_paths.push(path.into());
    }

    /// Host function registrations.
    pub fn registry_mut(&mut self) -> &mut FunctionRegistry {
        &mut self.registry
    }

    fn make_preprocessor(&self) -> Preprocessor {
        let mut preprocessor = Preprocessor::new();
        for path in &self.include_paths {
            preprocessor.add_include_path(path.clone());
        }

        preprocessor.add_pragma_handler("endian", |value, settings| match value {
            "big" => {
                settings.default_endian = Endian::Big;
                true
            }
            "little" => {
                settings.default_endian = Endian::Little;
                true
            }
            "native" => {
                settings.default_endian = Endian::native();
                true
            }
            _ => false,
        });
        preprocessor.add_pragma_handler("eval_depth", |value, settings| {
            match parse_pragma_int(value) {
                Some(limit) if limit > 0 => {
                    settings.eval_depth = limit;
                    true
                }
                _ => false,
            }
        });
        preprocessor.add_pragma_handler("array_limit", |value, settings| {
            match parse_pragma_int(value) {
                Some(limit) if limit > 0 => {
                    settings.array_limit = limit;
                    true
                }
                _ => false,
            }
        });
        preprocessor.add_pragma_handler("pattern_limit", |value, settings| {
            match parse_pragma_int(value) {
                Some(limit) if limit > 0 => {
                    settings.pattern_limit = limit;
                    true
                }
                _ => false,
            }
        });
        preprocessor.add_pragma_handler("loop_limit", |value, settings| {
            match parse_pragma_int(value) {
                Some(limit) if limit > 0 => {
                    settings.loop_limit = limit;
                    true
                }
                _ => false,
            }
        });
        preprocessor.add_pragma_handler("base_address", |value, settings| {
            match parse_pragma_int(value) {
                Some(address) => {
                    settings.base_address = Some(address);
                    true
                }
                None => false,
            }
        });
        preprocessor.add_pragma_handler("bitfield_order", |value, settings| match value {
            "left_to_right" => {
                settings.bitfield_order = BitfieldOrder::LeftToRight;
                true
            }
            "right_to_left" => {
                settings.bitfield_order = BitfieldOrder::RightToLeft;
                true
            }
            _ => false,
        });

        preprocessor
    }

    /// Preprocess, lex, parse and validate without evaluating.
    pub fn parse_source(
        &mut self,
        source: &str,
        settings: &mut RuntimeSettings,
    ) -> Result<Program> {
        let mut preprocessor = self.make_preprocessor();
        let expanded = preprocessor.preprocess(source, settings, true)?;
        let tokens = Lexer::new().lex(&expanded)?;
        let program = Parser::new().parse(tokens)?;
        Validator::new().validate(&program, &self.registry)?;
        Ok(program)
    }

    /// Run `source` against `provider`. Returns `true` on success; on
    /// failure the console's hard-error slot and `get_error()` carry
    /// the terminal error and no patterns are exposed.
    pub fn execute_string(
        &mut self,
        provider: &dyn Provider,
        source: &str,
        env_vars: BTreeMap<String, Value>,
        in_vars: BTreeMap<String, Value>,
        check_result: bool,
    ) -> bool {
        self.console.clear();
        self.error = None;
        self.ast = None;
        self.patterns.clear();
        self.out_variables.clear();
        self.main_result = None;
        self.settings = RuntimeSettings::default();
        self.abort_flag.store(false, Ordering::Relaxed);

        match self.run(provider, source, env_vars, in_vars, check_result) {
            Ok(()) => true,
            Err(error) => {
                self.console.log(LogLevel::Error, error.message.clone());
                self.console.set_hard_error(error.clone());
                self.patterns.clear();
                self.error = Some(error);
                false
            }
        }
    }

    fn run(
        &mut self,
        provider: &dyn Provider,
        source: &str,
        env_vars: BTreeMap<String, Value>,
        in_vars: BTreeMap<String, Value>,
        check_result: bool,
    ) -> Result<()> {
        let mut settings = RuntimeSettings::default();
        let program = self.parse_source(source, &mut settings)?;
        self.settings = settings.clone();
        self.ast = Some(program.clone());

        let mut evaluator = Evaluator::new(
            provider,
            &self.registry,
            &mut self.console,
            settings,
            self.abort_flag.clone(),
            self.dangerous_permission,
        );
        let result = evaluator.evaluate(&program, env_vars, in_vars);
        self.dangerous_called = evaluator.has_dangerous_function_been_called();
        let out_variables = evaluator.out_variables();
        let main_result = evaluator.main_result().cloned();

        let patterns = result?;

        if check_result {
            if let Some(main_result) = &main_result {
                let code = main_result
                    .to_i128()
                    .map_err(|e| PatternLanguageError::new(0, e))?;
                if code != 0 {
                    return Err(PatternLanguageError::new(
                        0,
                        format!("non-success value returned from main: {}", code),
                    ));
                }
            }
        }

        self.patterns = patterns;
        self.out_variables = out_variables;
        self.main_result = main_result;
        Ok(())
    }

    /// Convenience wrapper reading the pattern from a file.
    pub fn execute_file(
        &mut self,
        provider: &dyn Provider,
        path: &Path,
        env_vars: BTreeMap<String, Value>,
        in_vars: BTreeMap<String, Value>,
    ) -> bool {
        let source = match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(e) => {
                let error = PatternLanguageError::new(
                    0,
                    format!("failed to read pattern file '{}': {}", path.display(), e),
                );
                self.console.clear();
                self.console.log(LogLevel::Error, error.message.clone());
                self.console.set_hard_error(error.clone());
                self.error = Some(error);
                return false;
            }
        };
        self.execute_string(provider, &source, env_vars, in_vars, true)
    }

    /// Wrap a statement snippet in `fn main() { ... };` and run it.
    /// Returns success plus main's return value.
    pub fn execute_function(
        &mut self,
        provider: &dyn Provider,
        snippet: &str,
    ) -> (bool, Option<Value>) {
        let source = format!("fn main() {{ {} }};", snippet);
        let success = self.execute_string(
            provider,
            &source,
            BTreeMap::new(),
            BTreeMap::new(),
            false,
        );
        (success, self.main_result.clone())
    }

    /// Cooperative cancellation: the evaluator aborts at its next
    /// scope push, loop iteration or array expansion.
    pub fn abort(&self) {
        self.abort_flag.store(true, Ordering::Relaxed);
    }

    pub fn get_current_ast(&self) -> Option<&Program> {
        self.ast.as_ref()
    }

    pub fn get_patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    pub fn get_out_variables(&self) -> &BTreeMap<String, Value> {
        &self.out_variables
    }

    pub fn get_console_log(&self) -> &[(LogLevel, String)] {
        self.console.get_log()
    }

    pub fn get_error(&self) -> Option<&PatternLanguageError> {
        self.error.as_ref()
    }

    /// Settings after pragma application, e.g. `#pragma base_address`.
    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn allow_dangerous_functions(&mut self, allow: bool) {
        self.dangerous_permission = if allow {
            DangerousFunctionPermission::Allow
        } else {
            DangerousFunctionPermission::Deny
        };
        self.dangerous_called = false;
    }

    pub fn has_dangerous_function_been_called(&self) -> bool {
        self.dangerous_called
    }
}

impl Default for PatternLanguage {
    fn default() -> Self {
        PatternLanguage::new()
    }
}

/// Pragma integers accept decimal and `0x` hex, like the rest of the
/// language.
fn parse_pragma_int(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryProvider;

    fn run(source: &str, data: Vec<u8>) -> (PatternLanguage, bool) {
        let mut runtime = PatternLanguage::new();
        let provider = MemoryProvider::new(data);
        let ok = runtime.execute_string(
            &provider,
            source,
            BTreeMap::new(),
            BTreeMap::new(),
            true,
        );
        (runtime, ok)
    }

    #[test]
    fn test_parse_pragma_int() {
        assert_eq!(parse_pragma_int("64"), Some(64));
        assert_eq!(parse_pragma_int("0x40"), Some(0x40));
        assert_eq!(parse_pragma_int(" 16 "), Some(16));
        assert_eq!(parse_pragma_int("zero"), None);
    }

    #[test]
    fn test_simple_placement_run() {
        let (runtime, ok) = run("u8 first @ 0x00;", vec![0xAB, 0xCD]);
        assert!(ok, "error: {:?}", runtime.get_error());
        assert_eq!(runtime.get_patterns().len(), 1);
        assert_eq!(runtime.get_patterns()[0].offset, 0);
        assert_eq!(runtime.get_patterns()[0].size, 1);
    }

    #[test]
    fn test_error_sets_console_hard_error() {
        let (runtime, ok) = run("u32 value @ 0x10;", vec![0; 4]);
        assert!(!ok);
        assert!(runtime.get_error().is_some());
        let log = runtime.get_console_log();
        assert!(log.iter().any(|(level, _)| *level == LogLevel::Error));
        assert!(runtime.get_patterns().is_empty());
    }

    #[test]
    fn test_endian_pragma_applies() {
        let (runtime, ok) = run(
            "#pragma endian big\nu16 value @ 0x00;",
            vec![0x01, 0x02],
        );
        assert!(ok, "error: {:?}", runtime.get_error());
        assert_eq!(
            runtime.get_patterns()[0].value,
            Some(Value::Unsigned(0x0102))
        );
    }

    #[test]
    fn test_base_address_pragma_recorded() {
        let (runtime, ok) = run("#pragma base_address 0x8000\nu8 v @ 0;", vec![0x00]);
        assert!(ok);
        assert_eq!(runtime.settings().base_address, Some(0x8000));
    }

    #[test]
    fn test_invalid_pragma_value() {
        let (runtime, ok) = run("#pragma eval_depth zero\nu8 v @ 0;", vec![0x00]);
        assert!(!ok);
        assert!(
            runtime
                .get_error()
                .unwrap()
                .message
                .contains("invalid value provided to 'eval_depth'")
        );
    }

    #[test]
    fn test_execute_function_returns_value() {
        let mut runtime = PatternLanguage::new();
        let provider = MemoryProvider::new(vec![0; 4]);
        let (ok, result) = runtime.execute_function(&provider, "return 40 + 2;");
        assert!(ok);
        assert_eq!(result, Some(Value::Signed(42)));
    }
}
