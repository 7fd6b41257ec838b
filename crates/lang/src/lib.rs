//! Binary pattern language
//!
//! A small interpreted language for describing the layout of binary
//! data. Programs walk a random-access byte source and materialize a
//! typed, annotated pattern tree: structs, unions, arrays, bitfields,
//! enums, pointers and strings, with attributes controlling endianness,
//! colors, formatting and visibility.
//!
//! The pipeline is preprocessor -> lexer -> parser -> validator ->
//! evaluator; [`PatternLanguage`] drives it end to end:
//!
//! ```
//! use patl::{MemoryProvider, PatternLanguage};
//! use std::collections::BTreeMap;
//!
//! let provider = MemoryProvider::new(vec![0x78, 0x56, 0x34, 0x12]);
//! let mut runtime = PatternLanguage::new();
//! let ok = runtime.execute_string(
//!     &provider,
//!     "u32 magic @ 0x00;",
//!     BTreeMap::new(),
//!     BTreeMap::new(),
//!     true,
//! );
//! assert!(ok);
//! assert_eq!(runtime.get_patterns()[0].size, 4);
//! ```

pub mod ast;
pub mod console;
pub mod error;
pub mod evaluator;
pub mod functions;
pub mod lexer;
pub mod parser;
pub mod pattern;
pub mod preprocessor;
pub mod provider;
pub mod runtime;
pub mod token;
pub mod validator;
pub mod value;

pub use console::{LogConsole, LogLevel};
pub use error::PatternLanguageError;
pub use evaluator::{
    ControlFlowStatement, DangerousFunctionPermission, Evaluator, RuntimeSettings,
};
pub use functions::{FunctionRegistry, ParameterCount};
pub use lexer::Lexer;
pub use parser::Parser;
pub use pattern::{Pattern, PatternKind, PatternVisitor};
pub use preprocessor::Preprocessor;
pub use provider::{MemoryProvider, Provider};
pub use runtime::PatternLanguage;
pub use token::{BitfieldOrder, Endian, Token, TokenKind, ValueType};
pub use validator::Validator;
pub use value::Value;
