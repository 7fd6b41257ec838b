//! Host function registry
//!
//! Language code calls host-provided functions by exact qualified name.
//! Each registration declares how many parameters it accepts (with
//! sentinels for variadic shapes) and whether it is dangerous, i.e.
//! guarded by the user-consent permission flag.
//!
//! A small `builtin` namespace ships with the registry so programs have
//! something useful out of the box and the dangerous-function flow is
//! exercised end to end.

use crate::console::LogLevel;
use crate::evaluator::Evaluator;
use crate::value::Value;
use std::collections::HashMap;

/// Arity contract of a registered function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterCount {
    Exactly(u32),
    Unlimited,
    MoreThan(u32),
    LessThan(u32),
    None,
}

impl ParameterCount {
    pub fn check(self, count: usize) -> bool {
        match self {
            ParameterCount::Exactly(n) => count == n as usize,
            ParameterCount::Unlimited => true,
            ParameterCount::MoreThan(n) => count > n as usize,
            ParameterCount::LessThan(n) => count < n as usize,
            ParameterCount::None => count == 0,
        }
    }
}

/// Host callable. Errors are plain messages; the evaluator attaches the
/// call site's line number.
pub type NativeCallback =
    Box<dyn Fn(&mut Evaluator, &[Value]) -> std::result::Result<Option<Value>, String>>;

pub struct NativeFunction {
    pub name: String,
    pub parameter_count: ParameterCount,
    pub dangerous: bool,
    pub callback: NativeCallback,
}

#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, NativeFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        FunctionRegistry::default()
    }

    /// Registry pre-populated with the `builtin` namespace.
    pub fn with_builtins() -> Self {
        let mut registry = FunctionRegistry::new();

        registry.add_custom_function(
            "builtin::print",
            ParameterCount::Exactly(1),
            |evaluator, args| {
                let text = args[0].to_string();
                evaluator.console_mut().log(LogLevel::Info, text);
                Ok(None)
            },
        );

        registry.add_custom_function(
            "builtin::format",
            ParameterCount::Exactly(1),
            |_, args| Ok(Some(Value::String(args[0].to_string()))),
        );

        registry.add_custom_function(
            "builtin::env",
            ParameterCount::Exactly(1),
            |evaluator, args| {
                let Value::String(name) = &args[0] else {
                    return Err("builtin::env expects a string argument".to_string());
                };
                match evaluator.env_var(name) {
                    Some(value) => Ok(Some(value.clone())),
                    None => Err(format!("no environment variable named '{}'", name)),
                }
            },
        );

        // No-op guarded function so hosts and tests can exercise the
        // dangerous-function permission flow.
        registry.add_dangerous_function(
            "builtin::dangerous::demo",
            ParameterCount::None,
            |_, _| Ok(None),
        );

        registry
    }

    /// Register a function. Returns `false` if the name is taken.
    pub fn add_custom_function(
        &mut self,
        name: impl Into<String>,
        parameter_count: ParameterCount,
        callback: impl Fn(&mut Evaluator, &[Value]) -> std::result::Result<Option<Value>, String>
        + 'static,
    ) -> bool {
        self.insert(name.into(), parameter_count, false, Box::new(callback))
    }

    /// Register a function that requires the dangerous-function
    /// permission before it may be called.
    pub fn add_dangerous_function(
        &mut self,
        name: impl Into<String>,
        parameter_count: ParameterCount,
        callback: impl Fn(&mut Evaluator, &[Value]) -> std::result::Result<Option<Value>, String>
        + 'static,
    ) -> bool {
        self.insert(name.into(), parameter_count, true, Box::new(callback))
    }

    fn insert(
        &mut self,
        name: String,
        parameter_count: ParameterCount,
        dangerous: bool,
        callback: NativeCallback,
    ) -> bool {
        if self.functions.contains_key(&name) {
            return false;
        }
        self.functions.insert(
            name.clone(),
            NativeFunction {
                name,
                parameter_count,
                dangerous,
                callback,
            },
        );
        true
    }

    /// Lookup by exact qualified name.
    pub fn get(&self, name: &str) -> Option<&NativeFunction> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_count_sentinels() {
        assert!(ParameterCount::Exactly(2).check(2));
        assert!(!ParameterCount::Exactly(2).check(3));
        assert!(ParameterCount::Unlimited.check(0));
        assert!(ParameterCount::Unlimited.check(99));
        assert!(ParameterCount::MoreThan(1).check(2));
        assert!(!ParameterCount::MoreThan(1).check(1));
        assert!(ParameterCount::LessThan(3).check(2));
        assert!(!ParameterCount::LessThan(3).check(3));
        assert!(ParameterCount::None.check(0));
        assert!(!ParameterCount::None.check(1));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = FunctionRegistry::new();
        assert!(registry.add_custom_function("x::f", ParameterCount::None, |_, _| Ok(None)));
        assert!(!registry.add_custom_function("x::f", ParameterCount::None, |_, _| Ok(None)));
    }

    #[test]
    fn test_builtins_present() {
        let registry = FunctionRegistry::with_builtins();
        assert!(registry.contains("builtin::print"));
        assert!(registry.contains("builtin::format"));
        assert!(registry.contains("builtin::env"));
        assert!(registry.get("builtin::dangerous::demo").unwrap().dangerous);
        assert!(!registry.get("builtin::print").unwrap().dangerous);
    }
}
