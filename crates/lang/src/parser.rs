//! Parser: token sequence to AST
//!
//! Recursive descent with unrestricted lookahead: the cursor can be
//! saved and restored, and the matching primitives (`peek`, `sequence`,
//! `optional`) rewind on partial failure so alternatives can be tried
//! silently. The first unrecoverable mismatch produces a line-tagged
//! error.
//!
//! The parser maintains a namespace stack; every declared type and
//! function is stored under its qualified name (`a::b::Name`) in the
//! program's tables, which enables forward references across the
//! translation unit.

use crate::ast::{
    ArraySize, Attribute, BinaryOperator, BitfieldEntry, Declaration, DeclarationKind, EnumEntry,
    Expr, ExprKind, FunctionDef, FunctionParameter, Member, MemberKind, PathSegment, Program,
    SizeOfTarget, Statement, StatementKind, TypeDef, TypeDefKind, TypeRef, TypeSpec,
    UnaryOperator,
};
use crate::error::{PatternLanguageError, Result};
use crate::token::{Endian, Keyword, Operator, Separator, Token, TokenKind, ValueType};
use crate::value::Value;
use std::collections::HashMap;
use std::rc::Rc;

/// One token-matching unit for the backtracking primitives.
#[derive(Debug, Clone, Copy)]
pub enum Tk {
    Op(Operator),
    Sep(Separator),
    Kw(Keyword),
    AnyIdentifier,
    AnyTypeKeyword,
}

fn matches_tk(kind: &TokenKind, tk: Tk) -> bool {
    match (kind, tk) {
        (TokenKind::Operator(a), Tk::Op(b)) => *a == b,
        (TokenKind::Separator(a), Tk::Sep(b)) => *a == b,
        (TokenKind::Keyword(a), Tk::Kw(b)) => *a == b,
        (TokenKind::Identifier(_), Tk::AnyIdentifier) => true,
        (TokenKind::TypeKeyword(_), Tk::AnyTypeKeyword) => true,
        _ => false,
    }
}

#[derive(Default)]
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    namespaces: Vec<String>,
    types: HashMap<String, Rc<TypeDef>>,
    functions: HashMap<String, Rc<FunctionDef>>,
}

impl Parser {
    pub fn new() -> Self {
        Parser::default()
    }

    pub fn parse(&mut self, tokens: Vec<Token>) -> Result<Program> {
        self.tokens = tokens;
        self.pos = 0;
        self.namespaces.clear();
        self.types = HashMap::new();
        self.functions = HashMap::new();

        let mut declarations = Vec::new();
        while !self.at_end() {
            declarations.push(self.parse_declaration()?);
        }

        Ok(Program {
            declarations,
            types: std::mem::take(&mut self.types),
            functions: std::mem::take(&mut self.functions),
        })
    }

    // ----- cursor primitives -------------------------------------------

    fn current(&self) -> &TokenKind {
        self.tokens
            .get(self.pos)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::EndOfFile)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(0)
    }

    fn at_end(&self) -> bool {
        matches!(self.current(), TokenKind::EndOfFile)
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
    }

    /// Non-consuming match at `offset` tokens ahead.
    fn peek(&self, tk: Tk, offset: usize) -> bool {
        self.tokens
            .get(self.pos + offset)
            .map(|t| matches_tk(&t.kind, tk))
            .unwrap_or(false)
    }

    /// Consume all of `tks` in order, or restore the cursor and fail.
    fn sequence(&mut self, tks: &[Tk]) -> bool {
        let saved = self.pos;
        for tk in tks {
            if self.peek(*tk, 0) {
                self.advance();
            } else {
                self.pos = saved;
                return false;
            }
        }
        true
    }

    /// First matching alternative wins; consumes one token.
    fn one_of(&mut self, tks: &[Tk]) -> Option<Tk> {
        for tk in tks {
            if self.peek(*tk, 0) {
                self.advance();
                return Some(*tk);
            }
        }
        None
    }

    /// Consume the token if it matches; never fails.
    fn optional(&mut self, tk: Tk) -> bool {
        if self.peek(tk, 0) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn err(&self, message: impl std::fmt::Display) -> PatternLanguageError {
        PatternLanguageError::new(self.line(), format!("Parser: {}", message))
    }

    fn expect(&mut self, tk: Tk, what: &str) -> Result<()> {
        if self.optional(tk) {
            Ok(())
        } else {
            Err(self.err(format!("expected {}, got {}", what, self.current().describe())))
        }
    }

    fn expect_identifier(&mut self, what: &str) -> Result<String> {
        if let TokenKind::Identifier(name) = self.current() {
            let name = name.clone();
            self.advance();
            Ok(name)
        } else {
            Err(self.err(format!("expected {}, got {}", what, self.current().describe())))
        }
    }

    fn expect_string(&mut self, what: &str) -> Result<String> {
        if let TokenKind::StringLiteral(text) = self.current() {
            let text = text.clone();
            self.advance();
            Ok(text)
        } else {
            Err(self.err(format!("expected {}, got {}", what, self.current().describe())))
        }
    }

    // ----- names and registration --------------------------------------

    fn qualified(&self, name: &str) -> String {
        if self.namespaces.is_empty() {
            name.to_string()
        } else {
            format!("{}::{}", self.namespaces.join("::"), name)
        }
    }

    fn register_type(
        &mut self,
        line: u32,
        short_name: String,
        endian: Option<Endian>,
        kind: TypeDefKind,
        attributes: Vec<Attribute>,
    ) -> Result<Rc<TypeDef>> {
        let qualified = self.qualified(&short_name);
        if self.types.contains_key(&qualified) {
            return Err(self.err(format!("redefinition of type '{}'", qualified)));
        }
        let def = Rc::new(TypeDef {
            line,
            name: qualified.clone(),
            endian,
            kind,
            attributes,
        });
        self.types.insert(qualified, def.clone());
        Ok(def)
    }

    /// `a::b::c` chains; at least one identifier.
    fn parse_qualified_name(&mut self) -> Result<String> {
        let mut name = self.expect_identifier("a name")?;
        while self.peek(Tk::Op(Operator::ScopeResolution), 0)
            && self.peek(Tk::AnyIdentifier, 1)
        {
            self.advance();
            let part = self.expect_identifier("a name")?;
            name.push_str("::");
            name.push_str(&part);
        }
        Ok(name)
    }

    // ----- declarations ------------------------------------------------

    fn parse_declaration(&mut self) -> Result<Declaration> {
        let line = self.line();

        match self.current() {
            TokenKind::Keyword(Keyword::Using) => self.parse_using(),
            TokenKind::Keyword(Keyword::Struct) => self.parse_struct(),
            TokenKind::Keyword(Keyword::Union) => self.parse_union(),
            TokenKind::Keyword(Keyword::Enum) => self.parse_enum(),
            TokenKind::Keyword(Keyword::Bitfield) => self.parse_bitfield(),
            TokenKind::Keyword(Keyword::Fn) => self.parse_function_definition(),
            TokenKind::Keyword(Keyword::Namespace) => self.parse_namespace(),
            TokenKind::Keyword(Keyword::If)
            | TokenKind::Keyword(Keyword::In)
            | TokenKind::Keyword(Keyword::Out)
            | TokenKind::Keyword(Keyword::BigEndian)
            | TokenKind::Keyword(Keyword::LittleEndian)
            | TokenKind::TypeKeyword(_) => {
                let member = self.parse_variable_member(true)?;
                Ok(Declaration {
                    line,
                    kind: DeclarationKind::Placement(member),
                })
            }
            TokenKind::Identifier(_) => {
                // A qualified name followed by '(' is a top-level call;
                // anything else is a placement with a named type.
                let saved = self.pos;
                let name = self.parse_qualified_name()?;
                if self.peek(Tk::Sep(Separator::OpenParen), 0) {
                    let call = self.parse_call_expression(name, line)?;
                    self.expect(Tk::Sep(Separator::Semicolon), "';'")?;
                    Ok(Declaration {
                        line,
                        kind: DeclarationKind::Call(call),
                    })
                } else {
                    self.pos = saved;
                    let member = self.parse_variable_member(true)?;
                    Ok(Declaration {
                        line,
                        kind: DeclarationKind::Placement(member),
                    })
                }
            }
            other => Err(self.err(format!("unexpected {}", other.describe()))),
        }
    }

    fn parse_using(&mut self) -> Result<Declaration> {
        let line = self.line();
        self.advance(); // using
        let name = self.expect_identifier("an alias name after 'using'")?;
        self.expect(Tk::Op(Operator::Assign), "'='")?;
        let target = self.parse_type()?;
        let attributes = self.parse_attributes()?;
        self.expect(Tk::Sep(Separator::Semicolon), "';'")?;

        let def = self.register_type(
            line,
            name,
            None,
            TypeDefKind::Alias { target },
            attributes,
        )?;
        Ok(Declaration {
            line,
            kind: DeclarationKind::Type(def),
        })
    }

    fn parse_struct(&mut self) -> Result<Declaration> {
        let line = self.line();
        self.advance(); // struct
        let name = self.expect_identifier("a struct name")?;
        self.expect(Tk::Sep(Separator::OpenBrace), "'{'")?;

        let mut members = Vec::new();
        while !self.optional(Tk::Sep(Separator::CloseBrace)) {
            if self.at_end() {
                return Err(self.err(format!("unexpected end of file in struct '{}'", name)));
            }
            members.push(self.parse_variable_member(false)?);
        }

        let attributes = self.parse_attributes()?;
        self.expect(Tk::Sep(Separator::Semicolon), "';' after struct definition")?;

        let def = self.register_type(
            line,
            name,
            None,
            TypeDefKind::Struct { members },
            attributes,
        )?;
        Ok(Declaration {
            line,
            kind: DeclarationKind::Type(def),
        })
    }

    fn parse_union(&mut self) -> Result<Declaration> {
        let line = self.line();
        self.advance(); // union
        let name = self.expect_identifier("a union name")?;
        self.expect(Tk::Sep(Separator::OpenBrace), "'{'")?;

        let mut members = Vec::new();
        while !self.optional(Tk::Sep(Separator::CloseBrace)) {
            if self.at_end() {
                return Err(self.err(format!("unexpected end of file in union '{}'", name)));
            }
            members.push(self.parse_variable_member(false)?);
        }

        let attributes = self.parse_attributes()?;
        self.expect(Tk::Sep(Separator::Semicolon), "';' after union definition")?;

        let def = self.register_type(
            line,
            name,
            None,
            TypeDefKind::Union { members },
            attributes,
        )?;
        Ok(Declaration {
            line,
            kind: DeclarationKind::Type(def),
        })
    }

    fn parse_enum(&mut self) -> Result<Declaration> {
        let line = self.line();
        self.advance(); // enum
        let name = self.expect_identifier("an enum name")?;
        self.expect(Tk::Op(Operator::Colon), "':' and an underlying type")?;
        let underlying = self.parse_type()?;
        self.expect(Tk::Sep(Separator::OpenBrace), "'{'")?;

        let mut entries: Vec<EnumEntry> = Vec::new();
        while !self.optional(Tk::Sep(Separator::CloseBrace)) {
            if self.at_end() {
                return Err(self.err(format!("unexpected end of file in enum '{}'", name)));
            }
            let entry_line = self.line();
            let entry_name = self.expect_identifier("an enum constant name")?;

            let (min, max) = if self.optional(Tk::Op(Operator::Assign)) {
                let min = self.parse_expression()?;
                let max = if self.optional(Tk::Op(Operator::Dots)) {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                (min, max)
            } else {
                // Implicit value: previous effective value plus one,
                // zero for the first constant.
                let min = match entries.last() {
                    None => Expr::new(entry_line, ExprKind::Literal(Value::Unsigned(0))),
                    Some(prev) => {
                        let base = prev.max.clone().unwrap_or_else(|| prev.min.clone());
                        Expr::new(
                            entry_line,
                            ExprKind::Binary {
                                op: BinaryOperator::Add,
                                lhs: Box::new(base),
                                rhs: Box::new(Expr::new(
                                    entry_line,
                                    ExprKind::Literal(Value::Unsigned(1)),
                                )),
                            },
                        )
                    }
                };
                (min, None)
            };

            entries.push(EnumEntry {
                line: entry_line,
                name: entry_name,
                min,
                max,
            });

            if !self.optional(Tk::Sep(Separator::Comma))
                && !self.peek(Tk::Sep(Separator::CloseBrace), 0)
            {
                return Err(self.err("expected ',' between enum constants"));
            }
        }

        let attributes = self.parse_attributes()?;
        self.expect(Tk::Sep(Separator::Semicolon), "';' after enum definition")?;

        let def = self.register_type(
            line,
            name,
            None,
            TypeDefKind::Enum {
                underlying,
                entries,
            },
            attributes,
        )?;
        Ok(Declaration {
            line,
            kind: DeclarationKind::Type(def),
        })
    }

    fn parse_bitfield(&mut self) -> Result<Declaration> {
        let line = self.line();
        self.advance(); // bitfield
        let name = self.expect_identifier("a bitfield name")?;
        self.expect(Tk::Sep(Separator::OpenBrace), "'{'")?;

        let entries = self.parse_bitfield_entries(&name)?;

        let attributes = self.parse_attributes()?;
        self.expect(Tk::Sep(Separator::Semicolon), "';' after bitfield definition")?;

        let def = self.register_type(
            line,
            name,
            None,
            TypeDefKind::Bitfield { entries },
            attributes,
        )?;
        Ok(Declaration {
            line,
            kind: DeclarationKind::Type(def),
        })
    }

    fn parse_bitfield_entries(&mut self, name: &str) -> Result<Vec<BitfieldEntry>> {
        let mut entries = Vec::new();
        while !self.optional(Tk::Sep(Separator::CloseBrace)) {
            if self.at_end() {
                return Err(self.err(format!("unexpected end of file in bitfield '{}'", name)));
            }
            entries.push(self.parse_bitfield_entry(name)?);
        }
        Ok(entries)
    }

    fn parse_bitfield_entry(&mut self, bitfield_name: &str) -> Result<BitfieldEntry> {
        let line = self.line();

        if self.peek(Tk::Kw(Keyword::If), 0) {
            self.advance();
            self.expect(Tk::Sep(Separator::OpenParen), "'('")?;
            let condition = self.parse_expression()?;
            self.expect(Tk::Sep(Separator::CloseParen), "')'")?;

            let then_entries = self.parse_bitfield_branch(bitfield_name)?;
            let else_entries = if self.optional(Tk::Kw(Keyword::Else)) {
                self.parse_bitfield_branch(bitfield_name)?
            } else {
                Vec::new()
            };
            return Ok(BitfieldEntry::Conditional {
                line,
                condition,
                then_entries,
                else_entries,
            });
        }

        if matches!(self.current(), TokenKind::TypeKeyword(ValueType::Padding)) {
            self.advance();
            self.expect(Tk::Op(Operator::Colon), "':'")?;
            let bits = self.parse_expression()?;
            self.expect(Tk::Sep(Separator::Semicolon), "';'")?;
            return Ok(BitfieldEntry::Padding { line, bits });
        }

        // `bool flag : 1;`, `Mode mode : 2;` or plain `value : 4;`.
        let ty = if self.peek(Tk::AnyTypeKeyword, 0) {
            Some(self.parse_type()?)
        } else if self.peek(Tk::AnyIdentifier, 0) && self.peek(Tk::AnyIdentifier, 1) {
            Some(self.parse_type()?)
        } else {
            None
        };

        let name = self.expect_identifier("a bitfield field name")?;
        self.expect(Tk::Op(Operator::Colon), "':' and a bit width")?;
        let bits = self.parse_expression()?;
        self.expect(Tk::Sep(Separator::Semicolon), "';'")?;
        Ok(BitfieldEntry::Field {
            line,
            name,
            ty,
            bits,
        })
    }

    fn parse_bitfield_branch(&mut self, bitfield_name: &str) -> Result<Vec<BitfieldEntry>> {
        if self.optional(Tk::Sep(Separator::OpenBrace)) {
            let mut entries = Vec::new();
            while !self.optional(Tk::Sep(Separator::CloseBrace)) {
                if self.at_end() {
                    return Err(self.err(format!(
                        "unexpected end of file in bitfield '{}'",
                        bitfield_name
                    )));
                }
                entries.push(self.parse_bitfield_entry(bitfield_name)?);
            }
            Ok(entries)
        } else {
            Ok(vec![self.parse_bitfield_entry(bitfield_name)?])
        }
    }

    fn parse_namespace(&mut self) -> Result<Declaration> {
        let line = self.line();
        self.advance(); // namespace
        let name = self.parse_qualified_name()?;
        self.expect(Tk::Sep(Separator::OpenBrace), "'{'")?;

        let depth = name.split("::").count();
        for part in name.split("::") {
            self.namespaces.push(part.to_string());
        }

        let mut body = Vec::new();
        let result = (|| -> Result<()> {
            while !self.optional(Tk::Sep(Separator::CloseBrace)) {
                if self.at_end() {
                    return Err(
                        self.err(format!("unexpected end of file in namespace '{}'", name))
                    );
                }
                body.push(self.parse_declaration()?);
            }
            Ok(())
        })();

        for _ in 0..depth {
            self.namespaces.pop();
        }
        result?;

        self.optional(Tk::Sep(Separator::Semicolon));
        Ok(Declaration {
            line,
            kind: DeclarationKind::Namespace { name, body },
        })
    }

    fn parse_function_definition(&mut self) -> Result<Declaration> {
        let line = self.line();
        self.advance(); // fn
        let short_name = self.expect_identifier("a function name")?;
        let name = self.qualified(&short_name);

        self.expect(Tk::Sep(Separator::OpenParen), "'('")?;
        let mut parameters: Vec<FunctionParameter> = Vec::new();
        while !self.optional(Tk::Sep(Separator::CloseParen)) {
            if !parameters.is_empty() {
                self.expect(Tk::Sep(Separator::Comma), "','")?;
            }
            let ty = self.parse_type()?;
            let pack = self.optional(Tk::Op(Operator::Dots));
            let param_name = self.expect_identifier("a parameter name")?;
            parameters.push(FunctionParameter {
                ty,
                name: param_name,
                pack,
            });
        }
        if parameters
            .iter()
            .rev()
            .skip(1)
            .any(|p| p.pack)
        {
            return Err(self.err("parameter packs must be the last parameter"));
        }

        self.expect(Tk::Sep(Separator::OpenBrace), "'{'")?;
        let mut body = Vec::new();
        while !self.optional(Tk::Sep(Separator::CloseBrace)) {
            if self.at_end() {
                return Err(self.err(format!("unexpected end of file in function '{}'", name)));
            }
            body.push(self.parse_statement()?);
        }
        self.optional(Tk::Sep(Separator::Semicolon));

        if self.functions.contains_key(&name) {
            return Err(self.err(format!("redefinition of function '{}'", name)));
        }
        let def = Rc::new(FunctionDef {
            line,
            name: name.clone(),
            parameters,
            body,
        });
        self.functions.insert(name, def.clone());
        Ok(Declaration {
            line,
            kind: DeclarationKind::Function(def),
        })
    }

    // ----- members and placements --------------------------------------

    /// Shared declaration form: struct/union members (`top_level ==
    /// false`) and global placements (`top_level == true`).
    fn parse_variable_member(&mut self, top_level: bool) -> Result<Member> {
        let line = self.line();

        if self.peek(Tk::Kw(Keyword::If), 0) {
            return self.parse_conditional_member(top_level);
        }

        if !top_level && matches!(self.current(), TokenKind::TypeKeyword(ValueType::Padding)) {
            self.advance();
            self.expect(Tk::Sep(Separator::OpenBracket), "'['")?;
            let size = self.parse_expression()?;
            self.expect(Tk::Sep(Separator::CloseBracket), "']'")?;
            self.expect(Tk::Sep(Separator::Semicolon), "';'")?;
            return Ok(Member {
                line,
                kind: MemberKind::Padding { size },
                attributes: Vec::new(),
            });
        }

        let (is_in, is_out) = if top_level {
            match self.one_of(&[Tk::Kw(Keyword::In), Tk::Kw(Keyword::Out)]) {
                Some(Tk::Kw(Keyword::In)) => (true, false),
                Some(Tk::Kw(Keyword::Out)) => (false, true),
                _ => (false, false),
            }
        } else {
            (false, false)
        };

        let ty = self.parse_type()?;

        // Pointer: `T *name : SizeType [@ expr];`
        if self.optional(Tk::Op(Operator::Star)) {
            let name = self.expect_identifier("a pointer name")?;
            self.expect(Tk::Op(Operator::Colon), "':' and a pointer size type")?;
            let size_ty = self.parse_type()?;
            let placement = self.parse_optional_placement(top_level)?;
            let attributes = self.parse_attributes()?;
            self.expect(Tk::Sep(Separator::Semicolon), "';'")?;
            if is_in || is_out {
                return Err(self.err("in/out variables cannot be pointers"));
            }
            return Ok(Member {
                line,
                kind: MemberKind::Pointer {
                    ty,
                    name,
                    size_ty,
                    placement,
                },
                attributes,
            });
        }

        let name = self.expect_identifier("a variable name")?;

        // Array: `T name[size]` / `T name[while(...)]` / `T name[until(...)]`
        if self.optional(Tk::Sep(Separator::OpenBracket)) {
            let size = if self.optional(Tk::Kw(Keyword::While)) {
                self.expect(Tk::Sep(Separator::OpenParen), "'('")?;
                let condition = self.parse_expression()?;
                self.expect(Tk::Sep(Separator::CloseParen), "')'")?;
                ArraySize::While(condition)
            } else if self.optional(Tk::Kw(Keyword::Until)) {
                self.expect(Tk::Sep(Separator::OpenParen), "'('")?;
                let condition = self.parse_expression()?;
                self.expect(Tk::Sep(Separator::CloseParen), "')'")?;
                ArraySize::Until(condition)
            } else {
                ArraySize::Fixed(self.parse_expression()?)
            };
            self.expect(Tk::Sep(Separator::CloseBracket), "']'")?;

            let placement = self.parse_optional_placement(top_level)?;
            let attributes = self.parse_attributes()?;
            self.expect(Tk::Sep(Separator::Semicolon), "';'")?;
            if is_in || is_out {
                return Err(self.err("in/out variables cannot be arrays"));
            }
            return Ok(Member {
                line,
                kind: MemberKind::Array {
                    ty,
                    name,
                    size,
                    placement,
                },
                attributes,
            });
        }

        let placement = self.parse_optional_placement(top_level)?;
        let attributes = self.parse_attributes()?;
        self.expect(Tk::Sep(Separator::Semicolon), "';'")?;
        if (is_in || is_out) && placement.is_some() {
            return Err(self.err("in/out variables cannot be placed in memory"));
        }
        Ok(Member {
            line,
            kind: MemberKind::Variable {
                ty,
                name,
                placement,
                is_in,
                is_out,
            },
            attributes,
        })
    }

    fn parse_optional_placement(&mut self, top_level: bool) -> Result<Option<Expr>> {
        if self.optional(Tk::Op(Operator::At)) {
            if !top_level {
                return Err(self.err("placement ('@') is not allowed inside types"));
            }
            Ok(Some(self.parse_expression()?))
        } else {
            Ok(None)
        }
    }

    fn parse_conditional_member(&mut self, top_level: bool) -> Result<Member> {
        let line = self.line();
        self.advance(); // if
        self.expect(Tk::Sep(Separator::OpenParen), "'('")?;
        let condition = self.parse_expression()?;
        self.expect(Tk::Sep(Separator::CloseParen), "')'")?;

        let then_members = self.parse_member_branch(top_level)?;
        let else_members = if self.optional(Tk::Kw(Keyword::Else)) {
            if self.peek(Tk::Kw(Keyword::If), 0) {
                vec![self.parse_conditional_member(top_level)?]
            } else {
                self.parse_member_branch(top_level)?
            }
        } else {
            Vec::new()
        };

        Ok(Member {
            line,
            kind: MemberKind::Conditional {
                condition,
                then_members,
                else_members,
            },
            attributes: Vec::new(),
        })
    }

    fn parse_member_branch(&mut self, top_level: bool) -> Result<Vec<Member>> {
        if self.optional(Tk::Sep(Separator::OpenBrace)) {
            let mut members = Vec::new();
            while !self.optional(Tk::Sep(Separator::CloseBrace)) {
                if self.at_end() {
                    return Err(self.err("unexpected end of file in conditional"));
                }
                members.push(self.parse_variable_member(top_level)?);
            }
            Ok(members)
        } else {
            Ok(vec![self.parse_variable_member(top_level)?])
        }
    }

    // ----- types -------------------------------------------------------

    fn parse_type(&mut self) -> Result<TypeSpec> {
        let endian = match self.one_of(&[
            Tk::Kw(Keyword::BigEndian),
            Tk::Kw(Keyword::LittleEndian),
        ]) {
            Some(Tk::Kw(Keyword::BigEndian)) => Some(Endian::Big),
            Some(Tk::Kw(Keyword::LittleEndian)) => Some(Endian::Little),
            _ => None,
        };

        match self.current() {
            TokenKind::TypeKeyword(vt) => {
                let vt = *vt;
                self.advance();
                Ok(TypeSpec::new(endian, TypeRef::Builtin(vt)))
            }
            TokenKind::Identifier(_) => {
                let name = self.parse_qualified_name()?;
                Ok(TypeSpec::new(
                    endian,
                    TypeRef::Named {
                        name,
                        namespaces: self.namespaces.clone(),
                    },
                ))
            }
            other => Err(self.err(format!("expected a type name, got {}", other.describe()))),
        }
    }

    // ----- attributes --------------------------------------------------

    /// Zero or more `[[key]]` / `[[key("value")]]` groups.
    fn parse_attributes(&mut self) -> Result<Vec<Attribute>> {
        let mut attributes = Vec::new();
        while self.sequence(&[
            Tk::Sep(Separator::OpenBracket),
            Tk::Sep(Separator::OpenBracket),
        ]) {
            loop {
                let line = self.line();
                let key = self.expect_identifier("an attribute name")?;
                let value = if self.optional(Tk::Sep(Separator::OpenParen)) {
                    let text = self.expect_string("a string attribute value")?;
                    self.expect(Tk::Sep(Separator::CloseParen), "')'")?;
                    Some(text)
                } else {
                    None
                };
                attributes.push(Attribute { line, key, value });
                if !self.optional(Tk::Sep(Separator::Comma)) {
                    break;
                }
            }
            self.expect(Tk::Sep(Separator::CloseBracket), "']]'")?;
            self.expect(Tk::Sep(Separator::CloseBracket), "']]'")?;
        }
        Ok(attributes)
    }

    // ----- statements (function mode) ----------------------------------

    fn parse_statement(&mut self) -> Result<Statement> {
        let line = self.line();

        match self.current() {
            TokenKind::Keyword(Keyword::Return) => {
                self.advance();
                let value = if self.peek(Tk::Sep(Separator::Semicolon), 0) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.expect(Tk::Sep(Separator::Semicolon), "';'")?;
                Ok(Statement {
                    line,
                    kind: StatementKind::Return(value),
                })
            }
            TokenKind::Keyword(Keyword::Break) => {
                self.advance();
                self.expect(Tk::Sep(Separator::Semicolon), "';'")?;
                Ok(Statement {
                    line,
                    kind: StatementKind::Break,
                })
            }
            TokenKind::Keyword(Keyword::Continue) => {
                self.advance();
                self.expect(Tk::Sep(Separator::Semicolon), "';'")?;
                Ok(Statement {
                    line,
                    kind: StatementKind::Continue,
                })
            }
            TokenKind::Keyword(Keyword::If) => {
                self.advance();
                self.expect(Tk::Sep(Separator::OpenParen), "'('")?;
                let condition = self.parse_expression()?;
                self.expect(Tk::Sep(Separator::CloseParen), "')'")?;
                let then_body = self.parse_statement_block()?;
                let else_body = if self.optional(Tk::Kw(Keyword::Else)) {
                    self.parse_statement_block()?
                } else {
                    Vec::new()
                };
                Ok(Statement {
                    line,
                    kind: StatementKind::If {
                        condition,
                        then_body,
                        else_body,
                    },
                })
            }
            TokenKind::Keyword(Keyword::While) => {
                self.advance();
                self.expect(Tk::Sep(Separator::OpenParen), "'('")?;
                let condition = self.parse_expression()?;
                self.expect(Tk::Sep(Separator::CloseParen), "')'")?;
                let body = self.parse_statement_block()?;
                Ok(Statement {
                    line,
                    kind: StatementKind::While { condition, body },
                })
            }
            TokenKind::Keyword(Keyword::For) => {
                self.advance();
                self.expect(Tk::Sep(Separator::OpenParen), "'('")?;
                let init = self.parse_simple_statement()?;
                self.expect(Tk::Sep(Separator::Semicolon), "';'")?;
                let condition = self.parse_expression()?;
                self.expect(Tk::Sep(Separator::Semicolon), "';'")?;
                let post = self.parse_simple_statement()?;
                self.expect(Tk::Sep(Separator::CloseParen), "')'")?;
                let body = self.parse_statement_block()?;
                Ok(Statement {
                    line,
                    kind: StatementKind::For {
                        init: Box::new(init),
                        condition,
                        post: Box::new(post),
                        body,
                    },
                })
            }
            _ => {
                let statement = self.parse_simple_statement()?;
                self.expect(Tk::Sep(Separator::Semicolon), "';'")?;
                Ok(statement)
            }
        }
    }

    fn parse_statement_block(&mut self) -> Result<Vec<Statement>> {
        if self.optional(Tk::Sep(Separator::OpenBrace)) {
            let mut body = Vec::new();
            while !self.optional(Tk::Sep(Separator::CloseBrace)) {
                if self.at_end() {
                    return Err(self.err("unexpected end of file in statement block"));
                }
                body.push(self.parse_statement()?);
            }
            Ok(body)
        } else {
            Ok(vec![self.parse_statement()?])
        }
    }

    /// Declaration, assignment or expression statement, without the
    /// trailing ';'.
    fn parse_simple_statement(&mut self) -> Result<Statement> {
        let line = self.line();

        // Try a local declaration first: `<type> <name> [= expr]`. On
        // mismatch the cursor is restored and the alternatives run.
        let type_start = matches!(
            self.current(),
            TokenKind::TypeKeyword(_)
                | TokenKind::Identifier(_)
                | TokenKind::Keyword(Keyword::BigEndian)
                | TokenKind::Keyword(Keyword::LittleEndian)
        );
        if type_start {
            let saved = self.pos;
            if let Ok(ty) = self.parse_type() {
                if let TokenKind::Identifier(name) = self.current() {
                    let name = name.clone();
                    self.advance();
                    let init = if self.optional(Tk::Op(Operator::Assign)) {
                        Some(self.parse_expression()?)
                    } else {
                        None
                    };
                    return Ok(Statement {
                        line,
                        kind: StatementKind::LocalDecl { ty, name, init },
                    });
                }
            }
            self.pos = saved;
        }

        // Assignment: `name = expr` or `name op= expr`.
        if let TokenKind::Identifier(name) = self.current() {
            let name = name.clone();
            if self.peek(Tk::Op(Operator::Assign), 1) {
                self.advance();
                self.advance();
                let value = self.parse_expression()?;
                return Ok(Statement {
                    line,
                    kind: StatementKind::Assign { name, value },
                });
            }
            if let TokenKind::Operator(op) = self
                .tokens
                .get(self.pos + 1)
                .map(|t| t.kind.clone())
                .unwrap_or(TokenKind::EndOfFile)
            {
                if let Some(base) = op.compound_base() {
                    self.advance();
                    self.advance();
                    let rhs = self.parse_expression()?;
                    let current = Expr::new(
                        line,
                        ExprKind::Path(vec![PathSegment::Name(name.clone())]),
                    );
                    let value = Expr::new(
                        line,
                        ExprKind::Binary {
                            op: binary_operator_for(base),
                            lhs: Box::new(current),
                            rhs: Box::new(rhs),
                        },
                    );
                    return Ok(Statement {
                        line,
                        kind: StatementKind::Assign { name, value },
                    });
                }
            }
        }

        let expr = self.parse_expression()?;
        Ok(Statement {
            line,
            kind: StatementKind::Call(expr),
        })
    }

    // ----- expressions -------------------------------------------------

    pub fn parse_expression(&mut self) -> Result<Expr> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<Expr> {
        let line = self.line();
        let condition = self.parse_boolean_or()?;
        if self.optional(Tk::Op(Operator::Question)) {
            let then_expr = self.parse_expression()?;
            self.expect(Tk::Op(Operator::Colon), "':'")?;
            let else_expr = self.parse_expression()?;
            Ok(Expr::new(
                line,
                ExprKind::Ternary {
                    condition: Box::new(condition),
                    then_expr: Box::new(then_expr),
                    else_expr: Box::new(else_expr),
                },
            ))
        } else {
            Ok(condition)
        }
    }

    fn parse_binary_level(
        &mut self,
        ops: &[(Operator, BinaryOperator)],
        next: fn(&mut Self) -> Result<Expr>,
    ) -> Result<Expr> {
        let line = self.line();
        let mut lhs = next(self)?;
        'outer: loop {
            for (token_op, ast_op) in ops {
                if self.optional(Tk::Op(*token_op)) {
                    let rhs = next(self)?;
                    lhs = Expr::new(
                        line,
                        ExprKind::Binary {
                            op: *ast_op,
                            lhs: Box::new(lhs),
                            rhs: Box::new(rhs),
                        },
                    );
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn parse_boolean_or(&mut self) -> Result<Expr> {
        self.parse_binary_level(
            &[(Operator::BoolOr, BinaryOperator::BoolOr)],
            Self::parse_boolean_xor,
        )
    }

    fn parse_boolean_xor(&mut self) -> Result<Expr> {
        self.parse_binary_level(
            &[(Operator::BoolXor, BinaryOperator::BoolXor)],
            Self::parse_boolean_and,
        )
    }

    fn parse_boolean_and(&mut self) -> Result<Expr> {
        self.parse_binary_level(
            &[(Operator::BoolAnd, BinaryOperator::BoolAnd)],
            Self::parse_binary_or,
        )
    }

    fn parse_binary_or(&mut self) -> Result<Expr> {
        self.parse_binary_level(
            &[(Operator::BitOr, BinaryOperator::BitOr)],
            Self::parse_binary_xor,
        )
    }

    fn parse_binary_xor(&mut self) -> Result<Expr> {
        self.parse_binary_level(
            &[(Operator::BitXor, BinaryOperator::BitXor)],
            Self::parse_binary_and,
        )
    }

    fn parse_binary_and(&mut self) -> Result<Expr> {
        self.parse_binary_level(
            &[(Operator::BitAnd, BinaryOperator::BitAnd)],
            Self::parse_equality,
        )
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        self.parse_binary_level(
            &[
                (Operator::Equal, BinaryOperator::Equal),
                (Operator::NotEqual, BinaryOperator::NotEqual),
            ],
            Self::parse_relation,
        )
    }

    fn parse_relation(&mut self) -> Result<Expr> {
        self.parse_binary_level(
            &[
                (Operator::LessEqual, BinaryOperator::LessEqual),
                (Operator::GreaterEqual, BinaryOperator::GreaterEqual),
                (Operator::Less, BinaryOperator::Less),
                (Operator::Greater, BinaryOperator::Greater),
            ],
            Self::parse_shift,
        )
    }

    fn parse_shift(&mut self) -> Result<Expr> {
        self.parse_binary_level(
            &[
                (Operator::ShiftLeft, BinaryOperator::ShiftLeft),
                (Operator::ShiftRight, BinaryOperator::ShiftRight),
            ],
            Self::parse_additive,
        )
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        self.parse_binary_level(
            &[
                (Operator::Plus, BinaryOperator::Add),
                (Operator::Minus, BinaryOperator::Sub),
            ],
            Self::parse_multiplicative,
        )
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        self.parse_binary_level(
            &[
                (Operator::Star, BinaryOperator::Mul),
                (Operator::Slash, BinaryOperator::Div),
                (Operator::Percent, BinaryOperator::Mod),
            ],
            Self::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let line = self.line();
        let op = match self.current() {
            TokenKind::Operator(Operator::Minus) => Some(UnaryOperator::Minus),
            TokenKind::Operator(Operator::Plus) => Some(UnaryOperator::Plus),
            TokenKind::Operator(Operator::BoolNot) => Some(UnaryOperator::BoolNot),
            TokenKind::Operator(Operator::BitNot) => Some(UnaryOperator::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr::new(
                line,
                ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
            ));
        }
        self.parse_factor()
    }

    fn parse_factor(&mut self) -> Result<Expr> {
        let line = self.line();

        match self.current().clone() {
            TokenKind::Separator(Separator::OpenParen) => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(Tk::Sep(Separator::CloseParen), "')'")?;
                Ok(expr)
            }
            TokenKind::Integer(lit) => {
                self.advance();
                let value = if lit.signed {
                    Value::Signed(lit.value as i128)
                } else {
                    Value::Unsigned(lit.value)
                };
                Ok(Expr::new(line, ExprKind::Literal(value)))
            }
            TokenKind::Float(v) => {
                self.advance();
                Ok(Expr::new(line, ExprKind::Literal(Value::Float(v))))
            }
            TokenKind::StringLiteral(s) => {
                self.advance();
                Ok(Expr::new(line, ExprKind::Literal(Value::String(s))))
            }
            TokenKind::CharLiteral(c) => {
                self.advance();
                Ok(Expr::new(line, ExprKind::Literal(Value::Char(c))))
            }
            TokenKind::BoolLiteral(b) => {
                self.advance();
                Ok(Expr::new(line, ExprKind::Literal(Value::Bool(b))))
            }
            TokenKind::Operator(Operator::Dollar) => {
                self.advance();
                Ok(Expr::new(line, ExprKind::CurrentOffset))
            }
            TokenKind::Keyword(Keyword::Null) => {
                self.advance();
                Ok(Expr::new(line, ExprKind::Null))
            }
            TokenKind::TypeKeyword(vt) => {
                // Function-style cast: `u32(expr)`.
                self.advance();
                self.expect(Tk::Sep(Separator::OpenParen), "'(' after cast type")?;
                let operand = self.parse_expression()?;
                self.expect(Tk::Sep(Separator::CloseParen), "')'")?;
                Ok(Expr::new(
                    line,
                    ExprKind::Cast {
                        target: vt,
                        operand: Box::new(operand),
                    },
                ))
            }
            TokenKind::Keyword(Keyword::SizeOf) => {
                self.advance();
                self.expect(Tk::Sep(Separator::OpenParen), "'('")?;
                let target = if let TokenKind::TypeKeyword(vt) = self.current() {
                    let vt = *vt;
                    self.advance();
                    SizeOfTarget::Type(TypeRef::Builtin(vt))
                } else {
                    SizeOfTarget::Path(self.parse_path()?)
                };
                self.expect(Tk::Sep(Separator::CloseParen), "')'")?;
                Ok(Expr::new(line, ExprKind::SizeOf(target)))
            }
            TokenKind::Keyword(Keyword::AddressOf) => {
                self.advance();
                self.expect(Tk::Sep(Separator::OpenParen), "'('")?;
                let path = self.parse_path()?;
                self.expect(Tk::Sep(Separator::CloseParen), "')'")?;
                Ok(Expr::new(line, ExprKind::AddressOf(path)))
            }
            TokenKind::Keyword(Keyword::Parent) | TokenKind::Keyword(Keyword::This) => {
                let path = self.parse_path()?;
                Ok(Expr::new(line, ExprKind::Path(path)))
            }
            TokenKind::Identifier(_) => {
                let name = self.parse_qualified_name()?;
                if self.peek(Tk::Sep(Separator::OpenParen), 0) {
                    self.parse_call_expression(name, line)
                } else {
                    let path = self.parse_path_tail(vec![PathSegment::Name(name)])?;
                    Ok(Expr::new(line, ExprKind::Path(path)))
                }
            }
            other => Err(self.err(format!(
                "unexpected {} in expression",
                other.describe()
            ))),
        }
    }

    fn parse_call_expression(&mut self, name: String, line: u32) -> Result<Expr> {
        self.expect(Tk::Sep(Separator::OpenParen), "'('")?;
        let mut args = Vec::new();
        while !self.optional(Tk::Sep(Separator::CloseParen)) {
            if !args.is_empty() {
                self.expect(Tk::Sep(Separator::Comma), "','")?;
            }
            args.push(self.parse_expression()?);
        }
        Ok(Expr::new(line, ExprKind::Call { name, args }))
    }

    /// Full path starting at the current token: `parent`/`this`/name
    /// head plus `.member` / `[index]` tail.
    fn parse_path(&mut self) -> Result<Vec<PathSegment>> {
        let mut segments = Vec::new();
        match self.current() {
            TokenKind::Keyword(Keyword::Parent) => {
                self.advance();
                segments.push(PathSegment::Parent);
            }
            TokenKind::Keyword(Keyword::This) => {
                self.advance();
                segments.push(PathSegment::This);
            }
            TokenKind::Identifier(_) => {
                let name = self.parse_qualified_name()?;
                segments.push(PathSegment::Name(name));
            }
            other => {
                return Err(self.err(format!(
                    "expected a path expression, got {}",
                    other.describe()
                )));
            }
        }
        self.parse_path_tail(segments)
    }

    fn parse_path_tail(&mut self, mut segments: Vec<PathSegment>) -> Result<Vec<PathSegment>> {
        loop {
            if self.optional(Tk::Sep(Separator::Dot)) {
                match self.current() {
                    TokenKind::Keyword(Keyword::Parent) => {
                        self.advance();
                        segments.push(PathSegment::Parent);
                    }
                    _ => {
                        let name = self.expect_identifier("a member name after '.'")?;
                        segments.push(PathSegment::Name(name));
                    }
                }
            } else if self.peek(Tk::Sep(Separator::OpenBracket), 0)
                && !self.peek(Tk::Sep(Separator::OpenBracket), 1)
            {
                // A second '[' would start an attribute group, not an
                // index.
                self.advance();
                let index = self.parse_expression()?;
                self.expect(Tk::Sep(Separator::CloseBracket), "']'")?;
                segments.push(PathSegment::Index(Box::new(index)));
            } else {
                return Ok(segments);
            }
        }
    }
}

fn binary_operator_for(op: Operator) -> BinaryOperator {
    match op {
        Operator::Plus => BinaryOperator::Add,
        Operator::Minus => BinaryOperator::Sub,
        Operator::Star => BinaryOperator::Mul,
        Operator::Slash => BinaryOperator::Div,
        Operator::Percent => BinaryOperator::Mod,
        Operator::ShiftLeft => BinaryOperator::ShiftLeft,
        Operator::ShiftRight => BinaryOperator::ShiftRight,
        Operator::BitAnd => BinaryOperator::BitAnd,
        Operator::BitOr => BinaryOperator::BitOr,
        _ => BinaryOperator::BitXor,
    }
}
