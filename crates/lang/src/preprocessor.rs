//! Preprocessor: textual `#include` / `#define` / `#pragma` pass
//!
//! Runs before the lexer. Comments are stripped (block comments keep
//! their newlines so line numbers survive), includes are resolved against
//! the host include-path list and inlined with their line breaks
//! flattened to spaces, defines are applied greedily longest-name-first
//! over the fully expanded text, and pragmas are dispatched in source
//! order to registered handlers that mutate the run's settings.

use crate::error::{PatternLanguageError, Result};
use crate::evaluator::RuntimeSettings;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Validates a pragma value and applies it to the run settings.
/// Returns `false` to reject the value.
pub type PragmaHandler = Box<dyn Fn(&str, &mut RuntimeSettings) -> bool>;

/// Nesting cap for `#include` chains without `#pragma once`.
const MAX_INCLUDE_DEPTH: u32 = 64;

#[derive(Default)]
pub struct Preprocessor {
    include_paths: Vec<PathBuf>,
    handlers: HashMap<String, PragmaHandler>,
    defines: Vec<(String, String, u32)>,
    pragmas: Vec<(String, String, u32)>,
    once_included: HashSet<PathBuf>,
    include_depth: u32,
}

impl Preprocessor {
    pub fn new() -> Self {
        let mut preprocessor = Preprocessor::default();
        preprocessor.add_default_pragma_handlers();
        preprocessor
    }

    pub fn add_include_path(&mut self, path: impl Into<PathBuf>) {
        self.include_paths.push(path.into());
    }

    pub fn add_pragma_handler(
        &mut self,
        key: impl Into<String>,
        handler: impl Fn(&str, &mut RuntimeSettings) -> bool + 'static,
    ) {
        self.handlers.insert(key.into(), Box::new(handler));
    }

    /// Handlers that only validate, without touching settings.
    pub fn add_default_pragma_handlers(&mut self) {
        self.add_pragma_handler("MIME", |value, _| {
            !value.is_empty() && !value.chars().all(char::is_whitespace)
        });
        self.add_pragma_handler("once", |value, _| value.is_empty());
    }

    /// Expand `code` into plain source text. `initial_run` resets the
    /// per-run define/pragma/once state; include recursion passes
    /// `false`.
    pub fn preprocess(
        &mut self,
        code: &str,
        settings: &mut RuntimeSettings,
        initial_run: bool,
    ) -> Result<String> {
        if initial_run {
            self.defines.clear();
            self.pragmas.clear();
            self.once_included.clear();
            self.include_depth = 0;
        }

        let mut output = self.scan(code, settings)?;

        if initial_run {
            // Apply defines greedily, longest name first, over the whole
            // expanded text.
            let mut sorted = self.defines.clone();
            sorted.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
            for (name, value, _) in &sorted {
                output = output.replace(name.as_str(), value);
            }

            // Dispatch pragmas in source order.
            for (key, value, line) in self.pragmas.clone() {
                match self.handlers.get(&key) {
                    Some(handler) => {
                        if !handler(&value, settings) {
                            return Err(PatternLanguageError::new(
                                line,
                                format!(
                                    "Preprocessor: invalid value provided to '{}' #pragma directive",
                                    key
                                ),
                            ));
                        }
                    }
                    None => {
                        return Err(PatternLanguageError::new(
                            line,
                            format!(
                                "Preprocessor: no #pragma handler registered for type {}",
                                key
                            ),
                        ));
                    }
                }
            }
        }

        Ok(output)
    }

    /// Single pass over `code`: strip comments, collect directives, copy
    /// everything else through.
    fn scan(&mut self, code: &str, settings: &mut RuntimeSettings) -> Result<String> {
        let bytes = code.as_bytes();
        let mut output = String::with_capacity(code.len());
        let mut offset = 0usize;
        let mut line = 1u32;
        let mut in_string = false;
        let mut start_of_line = true;

        while offset < bytes.len() {
            let c = bytes[offset];

            if c == b'"' && (offset == 0 || bytes[offset - 1] != b'\\') {
                in_string = !in_string;
            } else if in_string {
                output.push(code[offset..].chars().next().unwrap());
                offset += code[offset..].chars().next().unwrap().len_utf8();
                continue;
            }

            if c == b'#' && start_of_line {
                offset += 1;
                let directive_line = line;

                if bytes[offset..].starts_with(b"include") {
                    offset += 7;
                    offset = skip_blanks(bytes, offset);

                    let delimiter = match bytes.get(offset) {
                        Some(b'<') => b'>',
                        Some(b'"') => b'"',
                        _ => {
                            return Err(PatternLanguageError::new(
                                directive_line,
                                "Preprocessor: expected '<' or '\"' before file name",
                            ));
                        }
                    };
                    offset += 1;

                    let start = offset;
                    while bytes.get(offset).is_some_and(|&b| b != delimiter) {
                        offset += 1;
                    }
                    if offset >= bytes.len() {
                        return Err(PatternLanguageError::new(
                            directive_line,
                            format!(
                                "Preprocessor: missing terminating '{}' character",
                                delimiter as char
                            ),
                        ));
                    }
                    let include_file = &code[start..offset];
                    offset += 1;

                    let expanded =
                        self.process_include(include_file, settings, directive_line)?;
                    output.push_str(&expanded);
                    continue;
                } else if bytes[offset..].starts_with(b"define") {
                    offset += 6;
                    offset = skip_blanks(bytes, offset);

                    let start = offset;
                    while bytes
                        .get(offset)
                        .is_some_and(|&b| !b.is_ascii_whitespace())
                    {
                        offset += 1;
                    }
                    let name = &code[start..offset];

                    offset = skip_blanks(bytes, offset);
                    let start = offset;
                    while bytes
                        .get(offset)
                        .is_some_and(|&b| b != b'\n' && b != b'\r')
                    {
                        offset += 1;
                    }
                    let value = code[start..offset].trim_end();

                    if name.is_empty() || value.is_empty() {
                        return Err(PatternLanguageError::new(
                            directive_line,
                            "Preprocessor: no value given in #define directive",
                        ));
                    }
                    self.defines
                        .push((name.to_string(), value.to_string(), directive_line));
                    continue;
                } else if bytes[offset..].starts_with(b"pragma") {
                    offset += 6;
                    offset = skip_blanks(bytes, offset);

                    let start = offset;
                    while bytes.get(offset).is_some_and(|&b| {
                        !b.is_ascii_whitespace() && b != b'\n' && b != b'\r'
                    }) {
                        offset += 1;
                    }
                    let key = &code[start..offset];
                    if key.is_empty() {
                        return Err(PatternLanguageError::new(
                            directive_line,
                            "Preprocessor: no instruction given in #pragma directive",
                        ));
                    }

                    offset = skip_blanks(bytes, offset);
                    let start = offset;
                    while bytes
                        .get(offset)
                        .is_some_and(|&b| b != b'\n' && b != b'\r')
                    {
                        offset += 1;
                    }
                    let value = code[start..offset].trim_end();

                    self.pragmas
                        .push((key.to_string(), value.to_string(), directive_line));
                    continue;
                } else {
                    return Err(PatternLanguageError::new(
                        directive_line,
                        "Preprocessor: unknown preprocessor directive",
                    ));
                }
            } else if bytes[offset..].starts_with(b"//") {
                while bytes.get(offset).is_some_and(|&b| b != b'\n') {
                    offset += 1;
                }
                continue;
            } else if bytes[offset..].starts_with(b"/*") {
                let comment_line = line;
                offset += 2;
                loop {
                    if offset >= bytes.len() {
                        return Err(PatternLanguageError::new(
                            comment_line,
                            "Preprocessor: unterminated comment",
                        ));
                    }
                    if bytes[offset..].starts_with(b"*/") {
                        offset += 2;
                        break;
                    }
                    if bytes[offset] == b'\n' {
                        output.push('\n');
                        line += 1;
                    }
                    offset += 1;
                }
                continue;
            }

            if c == b'\n' {
                line += 1;
                start_of_line = true;
            } else if !c.is_ascii_whitespace() {
                start_of_line = false;
            }

            let ch = code[offset..].chars().next().unwrap();
            output.push(ch);
            offset += ch.len_utf8();
        }

        Ok(output)
    }

    /// Resolve, recursively preprocess and flatten an included file.
    fn process_include(
        &mut self,
        include_file: &str,
        settings: &mut RuntimeSettings,
        line: u32,
    ) -> Result<String> {
        let resolved = self.resolve_include_path(include_file).ok_or_else(|| {
            let message = if include_file.starts_with("std/") {
                format!(
                    "Preprocessor: {}: No such file or directory.\n\
                     This file might be part of the standard library, \
                     which can be installed through the host's content store.",
                    include_file
                )
            } else {
                format!(
                    "Preprocessor: {}: No such file or directory",
                    include_file
                )
            };
            PatternLanguageError::new(line, message)
        })?;

        if self.once_included.contains(&resolved) {
            return Ok(String::new());
        }

        if self.include_depth >= MAX_INCLUDE_DEPTH {
            return Err(PatternLanguageError::new(
                line,
                format!(
                    "Preprocessor: include depth exceeded limit of {}",
                    MAX_INCLUDE_DEPTH
                ),
            ));
        }

        let content = fs::read_to_string(&resolved).map_err(|e| {
            PatternLanguageError::new(
                line,
                format!("Preprocessor: {}: {}", include_file, e),
            )
        })?;

        let pragmas_before = self.pragmas.len();
        self.include_depth += 1;
        let result = self.preprocess(&content, settings, false);
        self.include_depth -= 1;
        let mut expanded = result?;

        if self.pragmas[pragmas_before..]
            .iter()
            .any(|(key, _, _)| key == "once")
        {
            self.once_included.insert(resolved);
        }

        // Flatten line breaks so the including file keeps its own line
        // numbering.
        expanded = expanded.replace(['\n', '\r'], " ");
        Ok(expanded)
    }

    fn resolve_include_path(&self, include_file: &str) -> Option<PathBuf> {
        let direct = Path::new(include_file);
        if direct.is_absolute() {
            return direct.exists().then(|| direct.to_path_buf());
        }
        for dir in &self.include_paths {
            let candidate = dir.join(include_file);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }
}

fn skip_blanks(bytes: &[u8], mut offset: usize) -> usize {
    while bytes
        .get(offset)
        .is_some_and(|&b| b == b' ' || b == b'\t')
    {
        offset += 1;
    }
    offset
}
