//! Validator: static structural checks between parsing and evaluation
//!
//! Catches what the parser cannot see locally: duplicate member and
//! constant names inside one type, named type references (including
//! `using` targets) that resolve to nothing, and calls to functions
//! that exist neither in the AST nor in the host registry. Attribute
//! site checks stay in the evaluator because they depend on the pattern
//! variant actually produced.

use crate::ast::{
    ArraySize, BitfieldEntry, Declaration, DeclarationKind, Expr, ExprKind, Member, MemberKind,
    Program, SizeOfTarget, Statement, StatementKind, TypeDefKind, TypeRef, TypeSpec,
};
use crate::error::{PatternLanguageError, Result};
use crate::functions::FunctionRegistry;
use std::collections::HashSet;

pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Validator
    }

    pub fn validate(&self, program: &Program, registry: &FunctionRegistry) -> Result<()> {
        for def in program.types.values() {
            match &def.kind {
                TypeDefKind::Struct { members } | TypeDefKind::Union { members } => {
                    check_member_names(members, &def.name, def.line)?;
                    for member in members {
                        self.check_member(member, program, registry)?;
                    }
                }
                TypeDefKind::Enum {
                    underlying,
                    entries,
                } => {
                    self.check_type_spec(underlying, program, def.line)?;
                    let mut seen = HashSet::new();
                    for entry in entries {
                        if !seen.insert(entry.name.as_str()) {
                            return Err(err(
                                entry.line,
                                format!(
                                    "duplicate constant '{}' in enum '{}'",
                                    entry.name, def.name
                                ),
                            ));
                        }
                        self.check_expr(&entry.min, program, registry)?;
                        if let Some(max) = &entry.max {
                            self.check_expr(max, program, registry)?;
                        }
                    }
                }
                TypeDefKind::Bitfield { entries } => {
                    let mut seen = HashSet::new();
                    for entry in entries {
                        if let BitfieldEntry::Field { line, name, .. } = entry {
                            if !seen.insert(name.as_str()) {
                                return Err(err(
                                    *line,
                                    format!(
                                        "duplicate field '{}' in bitfield '{}'",
                                        name, def.name
                                    ),
                                ));
                            }
                        }
                        self.check_bitfield_entry(entry, program, registry)?;
                    }
                }
                TypeDefKind::Alias { target } => {
                    self.check_type_spec(target, program, def.line)?;
                }
            }
        }

        for function in program.functions.values() {
            for statement in &function.body {
                self.check_statement(statement, program, registry)?;
            }
        }

        self.check_declarations(&program.declarations, program, registry)
    }

    fn check_declarations(
        &self,
        declarations: &[Declaration],
        program: &Program,
        registry: &FunctionRegistry,
    ) -> Result<()> {
        for decl in declarations {
            match &decl.kind {
                DeclarationKind::Placement(member) => {
                    self.check_member(member, program, registry)?;
                }
                DeclarationKind::Call(expr) => self.check_expr(expr, program, registry)?,
                DeclarationKind::Namespace { body, .. } => {
                    self.check_declarations(body, program, registry)?;
                }
                DeclarationKind::Type(_) | DeclarationKind::Function(_) => {}
            }
        }
        Ok(())
    }

    fn check_member(
        &self,
        member: &Member,
        program: &Program,
        registry: &FunctionRegistry,
    ) -> Result<()> {
        match &member.kind {
            MemberKind::Variable { ty, placement, .. } => {
                self.check_type_spec(ty, program, member.line)?;
                if let Some(expr) = placement {
                    self.check_expr(expr, program, registry)?;
                }
            }
            MemberKind::Array {
                ty,
                size,
                placement,
                ..
            } => {
                self.check_type_spec(ty, program, member.line)?;
                match size {
                    ArraySize::Fixed(expr)
                    | ArraySize::While(expr)
                    | ArraySize::Until(expr) => self.check_expr(expr, program, registry)?,
                }
                if let Some(expr) = placement {
                    self.check_expr(expr, program, registry)?;
                }
            }
            MemberKind::Pointer {
                ty,
                size_ty,
                placement,
                ..
            } => {
                self.check_type_spec(ty, program, member.line)?;
                self.check_type_spec(size_ty, program, member.line)?;
                if let Some(expr) = placement {
                    self.check_expr(expr, program, registry)?;
                }
            }
            MemberKind::Padding { size } => self.check_expr(size, program, registry)?,
            MemberKind::Conditional {
                condition,
                then_members,
                else_members,
            } => {
                self.check_expr(condition, program, registry)?;
                for m in then_members.iter().chain(else_members) {
                    self.check_member(m, program, registry)?;
                }
            }
        }
        Ok(())
    }

    fn check_bitfield_entry(
        &self,
        entry: &BitfieldEntry,
        program: &Program,
        registry: &FunctionRegistry,
    ) -> Result<()> {
        match entry {
            BitfieldEntry::Field { ty, bits, line, .. } => {
                if let Some(ty) = ty {
                    self.check_type_spec(ty, program, *line)?;
                }
                self.check_expr(bits, program, registry)
            }
            BitfieldEntry::Padding { bits, .. } => self.check_expr(bits, program, registry),
            BitfieldEntry::Conditional {
                condition,
                then_entries,
                else_entries,
                ..
            } => {
                self.check_expr(condition, program, registry)?;
                for e in then_entries.iter().chain(else_entries) {
                    self.check_bitfield_entry(e, program, registry)?;
                }
                Ok(())
            }
        }
    }

    fn check_type_spec(&self, spec: &TypeSpec, program: &Program, line: u32) -> Result<()> {
        if let TypeRef::Named { .. } = &spec.ty {
            if program.resolve_type(&spec.ty).is_none() {
                return Err(err(
                    line,
                    format!("unknown type '{}'", spec.ty.display_name()),
                ));
            }
        }
        Ok(())
    }

    fn check_statement(
        &self,
        statement: &Statement,
        program: &Program,
        registry: &FunctionRegistry,
    ) -> Result<()> {
        match &statement.kind {
            StatementKind::LocalDecl { init, .. } => {
                if let Some(expr) = init {
                    self.check_expr(expr, program, registry)?;
                }
                Ok(())
            }
            StatementKind::Assign { value, .. } => self.check_expr(value, program, registry),
            StatementKind::Call(expr) => self.check_expr(expr, program, registry),
            StatementKind::If {
                condition,
                then_body,
                else_body,
            } => {
                self.check_expr(condition, program, registry)?;
                for s in then_body.iter().chain(else_body) {
                    self.check_statement(s, program, registry)?;
                }
                Ok(())
            }
            StatementKind::While { condition, body } => {
                self.check_expr(condition, program, registry)?;
                for s in body {
                    self.check_statement(s, program, registry)?;
                }
                Ok(())
            }
            StatementKind::For {
                init,
                condition,
                post,
                body,
            } => {
                self.check_statement(init, program, registry)?;
                self.check_expr(condition, program, registry)?;
                self.check_statement(post, program, registry)?;
                for s in body {
                    self.check_statement(s, program, registry)?;
                }
                Ok(())
            }
            StatementKind::Return(expr) => {
                if let Some(expr) = expr {
                    self.check_expr(expr, program, registry)?;
                }
                Ok(())
            }
            StatementKind::Break | StatementKind::Continue => Ok(()),
        }
    }

    fn check_expr(
        &self,
        expr: &Expr,
        program: &Program,
        registry: &FunctionRegistry,
    ) -> Result<()> {
        match &expr.kind {
            ExprKind::Call { name, args } => {
                if !program.functions.contains_key(name) && !registry.contains(name) {
                    return Err(err(
                        expr.line,
                        format!("call to unknown function '{}'", name),
                    ));
                }
                for arg in args {
                    self.check_expr(arg, program, registry)?;
                }
                Ok(())
            }
            ExprKind::Unary { operand, .. } => self.check_expr(operand, program, registry),
            ExprKind::Binary { lhs, rhs, .. } => {
                self.check_expr(lhs, program, registry)?;
                self.check_expr(rhs, program, registry)
            }
            ExprKind::Ternary {
                condition,
                then_expr,
                else_expr,
            } => {
                self.check_expr(condition, program, registry)?;
                self.check_expr(then_expr, program, registry)?;
                self.check_expr(else_expr, program, registry)
            }
            ExprKind::Cast { operand, .. } => self.check_expr(operand, program, registry),
            ExprKind::SizeOf(SizeOfTarget::Path(segs)) | ExprKind::AddressOf(segs) => {
                for seg in segs {
                    if let crate::ast::PathSegment::Index(index) = seg {
                        self.check_expr(index, program, registry)?;
                    }
                }
                Ok(())
            }
            ExprKind::Path(segs) => {
                for seg in segs {
                    if let crate::ast::PathSegment::Index(index) = seg {
                        self.check_expr(index, program, registry)?;
                    }
                }
                Ok(())
            }
            ExprKind::Literal(_)
            | ExprKind::SizeOf(SizeOfTarget::Type(_))
            | ExprKind::CurrentOffset
            | ExprKind::Null => Ok(()),
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Validator::new()
    }
}

fn err(line: u32, message: impl std::fmt::Display) -> PatternLanguageError {
    PatternLanguageError::new(line, format!("Validator: {}", message))
}

/// Duplicate names among the direct (unconditional) members of one
/// struct or union. Conditional branches may legitimately redeclare a
/// name, so they are not flattened into this check.
fn check_member_names(members: &[Member], type_name: &str, _line: u32) -> Result<()> {
    let mut seen = HashSet::new();
    for member in members {
        let name = match &member.kind {
            MemberKind::Variable { name, .. }
            | MemberKind::Array { name, .. }
            | MemberKind::Pointer { name, .. } => Some(name),
            MemberKind::Padding { .. } | MemberKind::Conditional { .. } => None,
        };
        if let Some(name) = name {
            if !seen.insert(name.as_str()) {
                return Err(err(
                    member.line,
                    format!("duplicate member '{}' in type '{}'", name, type_name),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn validate(source: &str) -> Result<()> {
        let tokens = Lexer::new().lex(source)?;
        let program = Parser::new().parse(tokens)?;
        Validator::new().validate(&program, &FunctionRegistry::with_builtins())
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let err = validate("struct S { u8 x; u8 x; };").unwrap_err();
        assert!(err.message.contains("duplicate member 'x'"));
    }

    #[test]
    fn test_duplicate_enum_constant_rejected() {
        let err = validate("enum E : u8 { A, A };").unwrap_err();
        assert!(err.message.contains("duplicate constant 'A'"));
    }

    #[test]
    fn test_duplicate_bitfield_field_rejected() {
        let err = validate("bitfield B { f : 4; f : 4; };").unwrap_err();
        assert!(err.message.contains("duplicate field 'f'"));
    }

    #[test]
    fn test_unresolved_alias_rejected() {
        let err = validate("using A = DoesNotExist;").unwrap_err();
        assert!(err.message.contains("unknown type 'DoesNotExist'"));
    }

    #[test]
    fn test_unknown_function_rejected() {
        let err = validate("fn main() { missing(); };").unwrap_err();
        assert!(err.message.contains("unknown function 'missing'"));
    }

    #[test]
    fn test_registry_function_accepted() {
        assert!(validate("fn main() { builtin::print(\"ok\"); };").is_ok());
    }

    #[test]
    fn test_forward_reference_accepted() {
        assert!(validate("struct A { B b; }; struct B { u8 x; }; A a @ 0;").is_ok());
    }

    #[test]
    fn test_conditional_branches_may_share_names() {
        assert!(validate("struct S { u8 tag; if (tag == 1) { u8 body; } else { u16 body; } };")
            .is_ok());
    }
}
