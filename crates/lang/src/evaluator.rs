//! Evaluator: AST to pattern tree
//!
//! Walks top-level declarations in source order, reading bytes through
//! the provider and materializing typed patterns. Scopes are a stack;
//! each frame owns the pattern vector it is filling (struct members,
//! union members, function locals) plus an optional parameter pack.
//! Function-local variables live in a value stack indexed by the slot
//! stored in their pattern's offset field.
//!
//! All failures are terminal: they unwind through `Result` up to the
//! top-level `execute*` call, which records them as the run's hard
//! error. The cooperative abort flag is polled at scope pushes, loop
//! iterations and array expansions.

use crate::ast::{
    ArraySize, Attribute, BitfieldEntry, Declaration, DeclarationKind, EnumEntry, Expr, ExprKind,
    FunctionDef, Member, MemberKind, PathSegment, Program, SizeOfTarget, Statement, StatementKind,
    TypeDef, TypeDefKind, TypeRef, TypeSpec,
};
use crate::console::{LogConsole, LogLevel};
use crate::error::{PatternLanguageError, Result};
use crate::functions::FunctionRegistry;
use crate::pattern::{
    EnumValueEntry, Pattern, PatternKind, bytes_to_unsigned, decode_scalar, extract_bits,
    sign_extend,
};
use crate::provider::Provider;
use crate::token::{BitfieldOrder, Endian, ValueType};
use crate::value::{self, Value};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DangerousFunctionPermission {
    Ask,
    Deny,
    Allow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlowStatement {
    None,
    Continue,
    Break,
    Return,
}

/// Per-run limits and defaults, seeded by the runtime and mutated by
/// `#pragma` handlers before evaluation starts.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub default_endian: Endian,
    pub eval_depth: u64,
    pub array_limit: u64,
    pub pattern_limit: u64,
    pub loop_limit: u64,
    pub base_address: Option<u64>,
    pub bitfield_order: BitfieldOrder,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        RuntimeSettings {
            default_endian: Endian::native(),
            eval_depth: 32,
            array_limit: 0x1000,
            pattern_limit: 0x2000,
            loop_limit: 0x1000,
            base_address: None,
            bitfield_order: BitfieldOrder::RightToLeft,
        }
    }
}

/// Variadic tail of a function call.
#[derive(Debug, Clone)]
pub struct ParameterPack {
    pub name: String,
    pub values: Vec<Value>,
}

/// Identity of the pattern a scope is building members for.
#[derive(Debug, Clone)]
struct ParentInfo {
    offset: u64,
    endian: Endian,
    type_name: String,
}

#[derive(Default)]
struct Scope {
    patterns: Vec<Pattern>,
    parameter_pack: Option<ParameterPack>,
    parent_info: Option<ParentInfo>,
}

/// Rotating palette used by `[[single_color]]`.
const AUTO_COLORS: [u32; 8] = [
    0x264B8E, 0x2E7D52, 0x8E6026, 0x7D2E2E, 0x5B2E7D, 0x2E7D7A, 0x8E8A26, 0x54588E,
];

pub struct Evaluator<'a> {
    provider: &'a dyn Provider,
    registry: &'a FunctionRegistry,
    console: &'a mut LogConsole,
    settings: RuntimeSettings,
    offset: u64,
    scopes: Vec<Scope>,
    stack: Vec<Value>,
    env: BTreeMap<String, Value>,
    in_vars: BTreeMap<String, Value>,
    out_vars: BTreeMap<String, usize>,
    types: HashMap<String, Rc<TypeDef>>,
    functions: HashMap<String, Rc<FunctionDef>>,
    control_flow: ControlFlowStatement,
    return_value: Option<Value>,
    main_result: Option<Value>,
    abort_flag: Arc<AtomicBool>,
    pattern_count: u64,
    dangerous_permission: DangerousFunctionPermission,
    dangerous_called: bool,
    color_index: usize,
}

impl<'a> Evaluator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: &'a dyn Provider,
        registry: &'a FunctionRegistry,
        console: &'a mut LogConsole,
        settings: RuntimeSettings,
        abort_flag: Arc<AtomicBool>,
        dangerous_permission: DangerousFunctionPermission,
    ) -> Self {
        Evaluator {
            provider,
            registry,
            console,
            settings,
            offset: 0,
            scopes: Vec::new(),
            stack: Vec::new(),
            env: BTreeMap::new(),
            in_vars: BTreeMap::new(),
            out_vars: BTreeMap::new(),
            types: HashMap::new(),
            functions: HashMap::new(),
            control_flow: ControlFlowStatement::None,
            return_value: None,
            main_result: None,
            abort_flag,
            pattern_count: 0,
            dangerous_permission,
            dangerous_called: false,
            color_index: 0,
        }
    }

    /// Run a parsed program. Returns the global pattern list with local
    /// variables filtered out.
    pub fn evaluate(
        &mut self,
        program: &Program,
        env: BTreeMap<String, Value>,
        in_vars: BTreeMap<String, Value>,
    ) -> Result<Vec<Pattern>> {
        self.offset = 0;
        self.scopes.clear();
        self.stack.clear();
        self.out_vars.clear();
        self.functions.clear();
        self.pattern_count = 0;
        self.control_flow = ControlFlowStatement::None;
        self.return_value = None;
        self.main_result = None;
        self.dangerous_called = false;
        if self.dangerous_permission == DangerousFunctionPermission::Deny {
            self.dangerous_permission = DangerousFunctionPermission::Ask;
        }
        self.env = env;
        self.in_vars = in_vars;
        self.types = program.types.clone();

        self.push_scope(None, 0)?;
        let result = self.run_declarations(&program.declarations);
        let global = self.pop_scope();
        result?;

        let mut patterns = global.patterns;
        patterns.retain(|p| !p.local);
        Ok(patterns)
    }

    fn run_declarations(&mut self, declarations: &[Declaration]) -> Result<()> {
        self.walk_declarations(declarations)?;

        if let Some(main) = self.functions.get("main").cloned() {
            if !main.parameters.is_empty() {
                return Err(self.err(main.line, "main function may not accept any arguments"));
            }
            self.main_result = self.call_ast_function(&main, Vec::new(), main.line)?;
        }
        Ok(())
    }

    fn walk_declarations(&mut self, declarations: &[Declaration]) -> Result<()> {
        for decl in declarations {
            match &decl.kind {
                DeclarationKind::Type(_) => {}
                DeclarationKind::Function(def) => {
                    self.functions.insert(def.name.clone(), def.clone());
                }
                DeclarationKind::Namespace { body, .. } => self.walk_declarations(body)?,
                DeclarationKind::Call(expr) => {
                    if let ExprKind::Call { name, args } = &expr.kind {
                        self.call_function(name, args, expr.line)?;
                    } else {
                        self.eval_expr(expr)?;
                    }
                }
                DeclarationKind::Placement(member) => self.place_top_level(member)?,
            }
        }
        Ok(())
    }

    // ----- accessors ---------------------------------------------------

    pub fn console_mut(&mut self) -> &mut LogConsole {
        self.console
    }

    pub fn env_var(&self, name: &str) -> Option<&Value> {
        self.env.get(name)
    }

    pub fn main_result(&self) -> Option<&Value> {
        self.main_result.as_ref()
    }

    /// Final values of all `out` globals.
    pub fn out_variables(&self) -> BTreeMap<String, Value> {
        self.out_vars
            .iter()
            .filter_map(|(name, slot)| {
                self.stack.get(*slot).map(|v| (name.clone(), v.clone()))
            })
            .collect()
    }

    pub fn pattern_count(&self) -> u64 {
        self.pattern_count
    }

    pub fn has_dangerous_function_been_called(&self) -> bool {
        self.dangerous_called
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn current_offset(&self) -> u64 {
        self.offset
    }

    // ----- plumbing ----------------------------------------------------

    fn err(&self, line: u32, message: impl std::fmt::Display) -> PatternLanguageError {
        PatternLanguageError::new(line, format!("Evaluator: {}", message))
    }

    fn poll_abort(&self, line: u32) -> Result<()> {
        if self.abort_flag.load(Ordering::Relaxed) {
            Err(self.err(line, "evaluation aborted by user"))
        } else {
            Ok(())
        }
    }

    fn push_scope(&mut self, parent_info: Option<ParentInfo>, line: u32) -> Result<()> {
        if self.scopes.len() as u64 > self.settings.eval_depth {
            return Err(self.err(
                line,
                format!(
                    "evaluation depth exceeded set limit of {}",
                    self.settings.eval_depth
                ),
            ));
        }
        self.poll_abort(line)?;
        self.scopes.push(Scope {
            patterns: Vec::new(),
            parameter_pack: None,
            parent_info,
        });
        Ok(())
    }

    fn pop_scope(&mut self) -> Scope {
        self.scopes.pop().unwrap_or_default()
    }

    fn current_scope_mut(&mut self) -> &mut Scope {
        self.scopes.last_mut().expect("scope stack is never empty")
    }

    fn note_pattern_created(&mut self, line: u32) -> Result<()> {
        if self.pattern_count >= self.settings.pattern_limit {
            return Err(self.err(
                line,
                format!(
                    "exceeded maximum number of patterns: {}",
                    self.settings.pattern_limit
                ),
            ));
        }
        self.pattern_count += 1;
        Ok(())
    }

    fn read_bytes(&self, offset: u64, len: u64, line: u32) -> Result<Vec<u8>> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| self.err(line, "address overflow while reading"))?;
        if end > self.provider.size() {
            return Err(self.err(
                line,
                format!(
                    "read past end of data: {} bytes at offset 0x{:X} (data size 0x{:X})",
                    len,
                    offset,
                    self.provider.size()
                ),
            ));
        }
        let mut buf = vec![0u8; len as usize];
        self.provider.read(offset, &mut buf);
        Ok(buf)
    }

    fn resolve_type(&self, ty: &TypeRef, line: u32) -> Result<Rc<TypeDef>> {
        for candidate in ty.candidates() {
            if let Some(def) = self.types.get(&candidate) {
                return Ok(def.clone());
            }
        }
        Err(self.err(line, format!("unknown type '{}'", ty.display_name())))
    }

    /// Follow aliases down to a built-in type, merging endian overrides
    /// along the way (use site wins over alias target).
    fn resolve_to_builtin(
        &self,
        spec: &TypeSpec,
        line: u32,
    ) -> Result<(ValueType, Option<Endian>)> {
        let mut current = spec.clone();
        for _ in 0..64 {
            match &current.ty {
                TypeRef::Builtin(vt) => return Ok((*vt, current.endian)),
                TypeRef::Named { .. } => {
                    let def = self.resolve_type(&current.ty, line)?;
                    let TypeDefKind::Alias { target } = &def.kind else {
                        return Err(self.err(
                            line,
                            format!("type '{}' is not a built-in type", def.name),
                        ));
                    };
                    current = TypeSpec::new(
                        current.endian.or(def.endian).or(target.endian),
                        target.ty.clone(),
                    );
                }
            }
        }
        Err(self.err(line, "circular type alias"))
    }

    // ----- top-level declarations --------------------------------------

    fn place_top_level(&mut self, member: &Member) -> Result<()> {
        let endian = self.settings.default_endian;
        match &member.kind {
            MemberKind::Variable {
                ty,
                name,
                placement,
                is_in,
                is_out,
            } => {
                if let Some(expr) = placement {
                    let target = self.eval_offset(expr)?;
                    let saved = self.offset;
                    self.offset = target;
                    let created = self.create_type_pattern(ty, name, endian, member.line);
                    self.offset = saved;
                    let mut pattern = created?;
                    self.apply_attributes(&mut pattern, &member.attributes, true)?;
                    self.current_scope_mut().patterns.push(pattern);
                } else {
                    self.create_global_variable(member, ty, name, *is_in, *is_out)?;
                }
            }
            MemberKind::Array {
                ty,
                name,
                size,
                placement,
            } => {
                let Some(expr) = placement else {
                    return Err(self.err(
                        member.line,
                        format!("expected placement ('@') for array '{}'", name),
                    ));
                };
                let target = self.eval_offset(expr)?;
                let saved = self.offset;
                self.offset = target;
                let created =
                    self.create_array_pattern(ty, name, size, endian, member.line);
                self.offset = saved;
                let mut pattern = created?;
                self.apply_attributes(&mut pattern, &member.attributes, true)?;
                self.current_scope_mut().patterns.push(pattern);
            }
            MemberKind::Pointer {
                ty,
                name,
                size_ty,
                placement,
            } => {
                let Some(expr) = placement else {
                    return Err(self.err(
                        member.line,
                        format!("expected placement ('@') for pointer '{}'", name),
                    ));
                };
                let target = self.eval_offset(expr)?;
                let saved = self.offset;
                self.offset = target;
                let created = self.create_pointer_pattern(
                    ty,
                    name,
                    size_ty,
                    &member.attributes,
                    endian,
                    member.line,
                );
                self.offset = saved;
                let mut pattern = created?;
                self.apply_attributes(&mut pattern, &member.attributes, true)?;
                self.current_scope_mut().patterns.push(pattern);
            }
            MemberKind::Padding { .. } => {
                return Err(self.err(member.line, "padding is only allowed inside types"));
            }
            MemberKind::Conditional {
                condition,
                then_members,
                else_members,
            } => {
                let taken = self.eval_condition(condition)?;
                let branch = if taken { then_members } else { else_members };
                for m in branch {
                    self.place_top_level(m)?;
                }
            }
        }
        Ok(())
    }

    fn create_global_variable(
        &mut self,
        member: &Member,
        ty: &TypeSpec,
        name: &str,
        is_in: bool,
        is_out: bool,
    ) -> Result<()> {
        let slot = self.create_local_variable(ty, name, member.line)?;
        if is_out {
            self.out_vars.insert(name.to_string(), slot);
        }
        if is_in {
            if let Some(value) = self.in_vars.get(name).cloned() {
                self.set_variable(name, value, member.line)?;
            }
        }
        Ok(())
    }

    // ----- member placement --------------------------------------------

    fn place_members(&mut self, members: &[Member], inherited: Endian) -> Result<()> {
        for member in members {
            self.place_member(member, inherited)?;
        }
        Ok(())
    }

    fn place_member(&mut self, member: &Member, inherited: Endian) -> Result<()> {
        match &member.kind {
            MemberKind::Variable { ty, name, .. } => {
                let pattern = self.create_type_pattern(ty, name, inherited, member.line)?;
                self.finish_member(pattern, member)
            }
            MemberKind::Array { ty, name, size, .. } => {
                let pattern =
                    self.create_array_pattern(ty, name, size, inherited, member.line)?;
                self.finish_member(pattern, member)
            }
            MemberKind::Pointer {
                ty, name, size_ty, ..
            } => {
                let pattern = self.create_pointer_pattern(
                    ty,
                    name,
                    size_ty,
                    &member.attributes,
                    inherited,
                    member.line,
                )?;
                self.finish_member(pattern, member)
            }
            MemberKind::Padding { size } => {
                let bytes = self.eval_offset(size)?;
                self.note_pattern_created(member.line)?;
                let mut pattern = Pattern::new(
                    PatternKind::Padding,
                    self.offset,
                    bytes,
                    inherited,
                    "padding",
                    "",
                );
                pattern.hidden = true;
                self.offset += bytes;
                self.current_scope_mut().patterns.push(pattern);
                Ok(())
            }
            MemberKind::Conditional {
                condition,
                then_members,
                else_members,
            } => {
                let taken = self.eval_condition(condition)?;
                let branch = if taken { then_members } else { else_members };
                self.place_members(branch, inherited)
            }
        }
    }

    /// Apply attributes and push a freshly placed member, honoring
    /// `[[no_unique_address]]` by rewinding the cursor afterwards.
    fn finish_member(&mut self, mut pattern: Pattern, member: &Member) -> Result<()> {
        self.apply_attributes(&mut pattern, &member.attributes, true)?;
        if member
            .attributes
            .iter()
            .any(|a| a.key == "no_unique_address")
        {
            self.offset = pattern.offset;
        }
        self.current_scope_mut().patterns.push(pattern);
        Ok(())
    }

    // ----- type instantiation ------------------------------------------

    /// Create a pattern for a type use at the current cursor, advancing
    /// the cursor past it.
    fn create_type_pattern(
        &mut self,
        spec: &TypeSpec,
        name: &str,
        inherited: Endian,
        line: u32,
    ) -> Result<Pattern> {
        match &spec.ty {
            TypeRef::Builtin(vt) => {
                let endian = spec.endian.unwrap_or(inherited);
                self.create_builtin_pattern(*vt, name, endian, line)
            }
            TypeRef::Named { .. } => {
                let def = self.resolve_type(&spec.ty, line)?;
                let endian = spec.endian.or(def.endian).unwrap_or(inherited);
                let mut pattern = match &def.kind {
                    TypeDefKind::Alias { target } => {
                        let merged = TypeSpec::new(
                            spec.endian.or(def.endian).or(target.endian),
                            target.ty.clone(),
                        );
                        self.create_type_pattern(&merged, name, inherited, line)?
                    }
                    TypeDefKind::Struct { members } => {
                        self.create_struct_pattern(&def, members, name, endian, line)?
                    }
                    TypeDefKind::Union { members } => {
                        self.create_union_pattern(&def, members, name, endian, line)?
                    }
                    TypeDefKind::Enum {
                        underlying,
                        entries,
                    } => self.create_enum_pattern(&def, underlying, entries, name, endian, line)?,
                    TypeDefKind::Bitfield { entries } => {
                        self.create_bitfield_pattern(&def, entries, name, endian, line)?
                    }
                };
                if !matches!(def.kind, TypeDefKind::Alias { .. }) {
                    self.apply_attributes(&mut pattern, &def.attributes, false)?;
                }
                Ok(pattern)
            }
        }
    }

    fn create_builtin_pattern(
        &mut self,
        vt: ValueType,
        name: &str,
        endian: Endian,
        line: u32,
    ) -> Result<Pattern> {
        let Some(size) = vt.size_bytes() else {
            return Err(self.err(
                line,
                format!("type '{}' has no size and cannot be placed in memory", vt.name()),
            ));
        };

        let kind = match vt {
            ValueType::Float | ValueType::Double => PatternKind::Float,
            ValueType::Bool => PatternKind::Boolean,
            ValueType::Char => PatternKind::Character,
            ValueType::Char16 => PatternKind::Character16,
            _ if vt.is_signed() => PatternKind::Signed,
            _ => PatternKind::Unsigned,
        };

        self.note_pattern_created(line)?;
        let bytes = self.read_bytes(self.offset, size, line)?;
        let mut pattern = Pattern::new(kind, self.offset, size, endian, vt.name(), name);
        pattern.value = decode_scalar(&pattern.kind, &bytes, endian);
        self.offset += size;
        Ok(pattern)
    }

    fn create_struct_pattern(
        &mut self,
        def: &TypeDef,
        members: &[Member],
        name: &str,
        endian: Endian,
        line: u32,
    ) -> Result<Pattern> {
        let start = self.offset;
        self.note_pattern_created(line)?;
        self.push_scope(
            Some(ParentInfo {
                offset: start,
                endian,
                type_name: def.short_name().to_string(),
            }),
            line,
        )?;
        let result = self.place_members(members, endian);
        let scope = self.pop_scope();
        result?;

        // The struct's size is recomputed from the final cursor, so a
        // trailing [[no_unique_address]] member shrinks it.
        let size = self.offset.saturating_sub(start);
        let mut pattern = Pattern::new(
            PatternKind::Struct {
                members: scope.patterns,
            },
            start,
            size,
            endian,
            def.short_name(),
            name,
        );
        pattern.type_name = format!("struct {}", def.short_name());
        Ok(pattern)
    }

    fn create_union_pattern(
        &mut self,
        def: &TypeDef,
        members: &[Member],
        name: &str,
        endian: Endian,
        line: u32,
    ) -> Result<Pattern> {
        let start = self.offset;
        self.note_pattern_created(line)?;
        self.push_scope(
            Some(ParentInfo {
                offset: start,
                endian,
                type_name: def.short_name().to_string(),
            }),
            line,
        )?;
        let result = (|| -> Result<()> {
            for member in members {
                self.offset = start;
                self.place_member(member, endian)?;
            }
            Ok(())
        })();
        let scope = self.pop_scope();
        result?;

        let size = scope
            .patterns
            .iter()
            .map(|p| (p.offset + p.size).saturating_sub(start))
            .max()
            .unwrap_or(0);
        self.offset = start + size;

        let mut pattern = Pattern::new(
            PatternKind::Union {
                members: scope.patterns,
            },
            start,
            size,
            endian,
            def.short_name(),
            name,
        );
        pattern.type_name = format!("union {}", def.short_name());
        Ok(pattern)
    }

    fn evaluate_enum_entries(&mut self, entries: &[EnumEntry]) -> Result<Vec<EnumValueEntry>> {
        let mut result = Vec::with_capacity(entries.len());
        for entry in entries {
            let min = self.eval_expr(&entry.min)?;
            let max = match &entry.max {
                Some(expr) => self.eval_expr(expr)?,
                None => min.clone(),
            };
            result.push(EnumValueEntry {
                name: entry.name.clone(),
                min,
                max,
            });
        }
        Ok(result)
    }

    fn match_enum_value(entries: &[EnumValueEntry], value: &Value) -> Option<String> {
        for entry in entries {
            let ge = value::apply_binary(crate::ast::BinaryOperator::GreaterEqual, value, &entry.min)
                .and_then(|v| v.to_bool())
                .unwrap_or(false);
            let le = value::apply_binary(crate::ast::BinaryOperator::LessEqual, value, &entry.max)
                .and_then(|v| v.to_bool())
                .unwrap_or(false);
            if ge && le {
                return Some(entry.name.clone());
            }
        }
        None
    }

    fn create_enum_pattern(
        &mut self,
        def: &TypeDef,
        underlying: &TypeSpec,
        entries: &[EnumEntry],
        name: &str,
        endian: Endian,
        line: u32,
    ) -> Result<Pattern> {
        let (vt, ty_endian) = self.resolve_to_builtin(underlying, line)?;
        if !vt.is_integer() {
            return Err(self.err(
                line,
                format!(
                    "enum '{}' underlying type must be an integral type",
                    def.short_name()
                ),
            ));
        }
        let endian = ty_endian.unwrap_or(endian);
        let size = vt.size_bytes().unwrap_or(4);

        self.note_pattern_created(line)?;
        let bytes = self.read_bytes(self.offset, size, line)?;
        let raw = bytes_to_unsigned(&bytes, endian);
        let value = if vt.is_signed() {
            Value::Signed(sign_extend(raw, size as u32 * 8))
        } else {
            Value::Unsigned(raw)
        };

        let table = self.evaluate_enum_entries(entries)?;
        let matched = Self::match_enum_value(&table, &value);

        let mut pattern = Pattern::new(
            PatternKind::Enum {
                entries: table,
                matched,
            },
            self.offset,
            size,
            endian,
            def.short_name(),
            name,
        );
        pattern.type_name = format!("enum {}", def.short_name());
        pattern.value = Some(value);
        self.offset += size;
        Ok(pattern)
    }

    /// Resolved bitfield field before bit offsets are assigned.
    fn collect_bitfield_fields(
        &mut self,
        entries: &[BitfieldEntry],
        out: &mut Vec<(Option<String>, u64, Option<TypeSpec>, u32)>,
    ) -> Result<()> {
        for entry in entries {
            match entry {
                BitfieldEntry::Field {
                    line,
                    name,
                    ty,
                    bits,
                } => {
                    let width = self.eval_offset(bits)?;
                    if width == 0 {
                        return Err(
                            self.err(*line, format!("bitfield field '{}' has zero size", name))
                        );
                    }
                    out.push((Some(name.clone()), width, ty.clone(), *line));
                }
                BitfieldEntry::Padding { line, bits } => {
                    let width = self.eval_offset(bits)?;
                    out.push((None, width, None, *line));
                }
                BitfieldEntry::Conditional {
                    condition,
                    then_entries,
                    else_entries,
                    ..
                } => {
                    let taken = self.eval_condition(condition)?;
                    let branch = if taken { then_entries } else { else_entries };
                    self.collect_bitfield_fields(branch, out)?;
                }
            }
        }
        Ok(())
    }

    fn create_bitfield_pattern(
        &mut self,
        def: &TypeDef,
        entries: &[BitfieldEntry],
        name: &str,
        endian: Endian,
        line: u32,
    ) -> Result<Pattern> {
        let mut fields = Vec::new();
        self.collect_bitfield_fields(entries, &mut fields)?;

        let total_bits: u64 = fields.iter().map(|(_, bits, _, _)| *bits).sum();
        if total_bits == 0 {
            return Err(self.err(
                line,
                format!("bitfield '{}' must have at least one field", def.short_name()),
            ));
        }
        if total_bits > 128 {
            return Err(self.err(
                line,
                format!(
                    "bitfield '{}' is wider than 128 bits",
                    def.short_name()
                ),
            ));
        }

        let size = total_bits.div_ceil(8);
        let container_bits = size * 8;
        self.note_pattern_created(line)?;
        let bytes = self.read_bytes(self.offset, size, line)?;
        let container = bytes_to_unsigned(&bytes, endian);

        let mut cursor = 0u64;
        let mut field_patterns = Vec::new();
        for (field_name, bits, field_ty, field_line) in fields {
            let bit_offset = match self.settings.bitfield_order {
                BitfieldOrder::RightToLeft => cursor,
                BitfieldOrder::LeftToRight => container_bits - cursor - bits,
            };
            cursor += bits;

            let Some(field_name) = field_name else {
                continue;
            };

            let raw = extract_bits(container, bit_offset as u32, bits as u32);
            let mut is_bool = false;
            let mut enum_entries = Vec::new();
            let mut matched = None;
            let mut type_name = "bits".to_string();

            if let Some(field_ty) = &field_ty {
                match &field_ty.ty {
                    TypeRef::Builtin(ValueType::Bool) => {
                        is_bool = true;
                        type_name = "bool".to_string();
                    }
                    TypeRef::Builtin(vt) if vt.is_integer() => {
                        type_name = vt.name().to_string();
                    }
                    TypeRef::Builtin(vt) => {
                        return Err(self.err(
                            field_line,
                            format!(
                                "type '{}' is not valid for a bitfield field",
                                vt.name()
                            ),
                        ));
                    }
                    TypeRef::Named { .. } => {
                        let field_def = self.resolve_type(&field_ty.ty, field_line)?;
                        let TypeDefKind::Enum { entries, .. } = &field_def.kind else {
                            return Err(self.err(
                                field_line,
                                format!(
                                    "type '{}' is not valid for a bitfield field",
                                    field_def.short_name()
                                ),
                            ));
                        };
                        let entries = entries.clone();
                        enum_entries = self.evaluate_enum_entries(&entries)?;
                        matched =
                            Self::match_enum_value(&enum_entries, &Value::Unsigned(raw));
                        type_name = field_def.short_name().to_string();
                    }
                }
            }

            self.note_pattern_created(field_line)?;
            let mut field = Pattern::new(
                PatternKind::BitfieldField {
                    bit_offset: bit_offset as u32,
                    bit_size: bits as u32,
                    is_bool,
                    enum_entries,
                    matched,
                },
                self.offset,
                size,
                endian,
                type_name,
                field_name,
            );
            field.value = Some(if is_bool {
                Value::Bool(raw != 0)
            } else {
                Value::Unsigned(raw)
            });
            field_patterns.push(field);
        }

        let mut pattern = Pattern::new(
            PatternKind::Bitfield {
                fields: field_patterns,
            },
            self.offset,
            size,
            endian,
            def.short_name(),
            name,
        );
        pattern.type_name = format!("bitfield {}", def.short_name());
        self.offset += size;
        Ok(pattern)
    }

    fn create_array_pattern(
        &mut self,
        spec: &TypeSpec,
        name: &str,
        size: &ArraySize,
        inherited: Endian,
        line: u32,
    ) -> Result<Pattern> {
        match size {
            ArraySize::Fixed(expr) => {
                let count = self.eval_offset(expr)?;
                if count == 0 {
                    return Err(
                        self.err(line, format!("array '{}' must have at least one element", name))
                    );
                }
                if count > self.settings.array_limit {
                    return Err(self.err(
                        line,
                        format!(
                            "array grew past set limit of {}",
                            self.settings.array_limit
                        ),
                    ));
                }
                self.create_fixed_array(spec, name, count, inherited, line)
            }
            ArraySize::While(condition) => {
                self.create_loop_array(spec, name, condition, false, inherited, line)
            }
            ArraySize::Until(condition) => {
                self.create_loop_array(spec, name, condition, true, inherited, line)
            }
        }
    }

    fn create_fixed_array(
        &mut self,
        spec: &TypeSpec,
        name: &str,
        count: u64,
        inherited: Endian,
        line: u32,
    ) -> Result<Pattern> {
        let start = self.offset;

        if let TypeRef::Builtin(vt) = &spec.ty {
            let endian = spec.endian.unwrap_or(inherited);

            // Character arrays read as strings.
            if *vt == ValueType::Char {
                self.note_pattern_created(line)?;
                let bytes = self.read_bytes(start, count, line)?;
                let text: String = bytes
                    .iter()
                    .take_while(|&&b| b != 0)
                    .map(|&b| b as char)
                    .collect();
                let mut pattern =
                    Pattern::new(PatternKind::String, start, count, endian, "char[]", name);
                pattern.value = Some(Value::String(text));
                self.offset = start + count;
                return Ok(pattern);
            }
            if *vt == ValueType::Char16 {
                self.note_pattern_created(line)?;
                let total = count
                    .checked_mul(2)
                    .ok_or_else(|| self.err(line, "array size overflows"))?;
                let bytes = self.read_bytes(start, total, line)?;
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| bytes_to_unsigned(pair, endian) as u16)
                    .take_while(|&u| u != 0)
                    .collect();
                let text = String::from_utf16_lossy(&units);
                let mut pattern = Pattern::new(
                    PatternKind::WideString,
                    start,
                    total,
                    endian,
                    "char16[]",
                    name,
                );
                pattern.value = Some(Value::String(text));
                self.offset = start + total;
                return Ok(pattern);
            }

            // Homogeneous scalar arrays use the static representation:
            // one template plus the raw bytes.
            if let Some(elem_size) = vt.size_bytes() {
                let total = count
                    .checked_mul(elem_size)
                    .ok_or_else(|| self.err(line, "array size overflows"))?;
                let data = self.read_bytes(start, total, line)?;
                let mut template = self.create_builtin_pattern(*vt, "[0]", endian, line)?;
                template.offset = start;
                self.offset = start + total;

                self.note_pattern_created(line)?;
                let pattern = Pattern::new(
                    PatternKind::StaticArray {
                        template: Box::new(template),
                        count,
                        data,
                    },
                    start,
                    total,
                    endian,
                    format!("{}[{}]", vt.name(), count),
                    name,
                );
                return Ok(pattern);
            }
        }

        // Everything else gets explicit entries.
        let mut entries = Vec::with_capacity(count as usize);
        for index in 0..count {
            self.poll_abort(line)?;
            let entry =
                self.create_type_pattern(spec, &format!("[{}]", index), inherited, line)?;
            entries.push(entry);
        }
        self.note_pattern_created(line)?;
        let total = self.offset.saturating_sub(start);
        let pattern = Pattern::new(
            PatternKind::DynamicArray { entries },
            start,
            total,
            inherited,
            format!("{}[{}]", spec.ty.display_name(), count),
            name,
        );
        Ok(pattern)
    }

    fn create_loop_array(
        &mut self,
        spec: &TypeSpec,
        name: &str,
        condition: &Expr,
        until: bool,
        inherited: Endian,
        line: u32,
    ) -> Result<Pattern> {
        let start = self.offset;
        let mut entries: Vec<Pattern> = Vec::new();
        let mut iterations = 0u64;

        loop {
            self.poll_abort(line)?;
            iterations += 1;
            if iterations > self.settings.loop_limit {
                return Err(self.err(
                    line,
                    format!(
                        "loop iterations exceeded set limit of {}",
                        self.settings.loop_limit
                    ),
                ));
            }

            if !until && !self.eval_condition(condition)? {
                break;
            }

            let entry = self.create_type_pattern(
                spec,
                &format!("[{}]", entries.len()),
                inherited,
                line,
            )?;

            if entries.len() as u64 >= self.settings.array_limit {
                return Err(self.err(
                    line,
                    format!(
                        "array grew past set limit of {}",
                        self.settings.array_limit
                    ),
                ));
            }

            let stop = if until {
                // The predicate sees the freshly created element under
                // the array's variable name.
                let mut probe = entry.clone();
                probe.name = name.to_string();
                self.push_scope(None, line)?;
                self.current_scope_mut().patterns.push(probe);
                let result = self.eval_condition(condition);
                self.pop_scope();
                result?
            } else {
                false
            };

            entries.push(entry);
            if stop {
                break;
            }
        }

        self.note_pattern_created(line)?;
        let total = self.offset.saturating_sub(start);
        Ok(Pattern::new(
            PatternKind::DynamicArray { entries },
            start,
            total,
            inherited,
            format!("{}[]", spec.ty.display_name()),
            name,
        ))
    }

    fn create_pointer_pattern(
        &mut self,
        spec: &TypeSpec,
        name: &str,
        size_ty: &TypeSpec,
        attributes: &[Attribute],
        inherited: Endian,
        line: u32,
    ) -> Result<Pattern> {
        let (vt, ty_endian) = self.resolve_to_builtin(size_ty, line)?;
        if !vt.is_integer() {
            return Err(self.err(
                line,
                format!("pointer size type must be an integral type, got '{}'", vt.name()),
            ));
        }
        let endian = ty_endian.or(spec.endian).unwrap_or(inherited);
        let size = vt.size_bytes().unwrap_or(8);

        self.note_pattern_created(line)?;
        let ptr_offset = self.offset;
        let bytes = self.read_bytes(ptr_offset, size, line)?;
        let raw = bytes_to_unsigned(&bytes, endian);
        let raw = if vt.is_signed() {
            let signed = sign_extend(raw, size as u32 * 8);
            u64::try_from(signed)
                .map_err(|_| self.err(line, format!("pointer value {} is negative", signed)))?
        } else {
            u64::try_from(raw)
                .map_err(|_| self.err(line, "pointer value does not fit into 64 bits"))?
        };
        self.offset = ptr_offset + size;

        // [[pointer_base("fn")]] relocates the pointee: fn(raw) + raw.
        let mut pointee_address = raw;
        if let Some(attr) = attributes.iter().find(|a| a.key == "pointer_base") {
            let Some(fn_name) = &attr.value else {
                return Err(self.err(attr.line, "attribute 'pointer_base' expects a parameter"));
            };
            let base = self
                .call_function_with_values(
                    fn_name,
                    vec![Value::Unsigned(u128::from(raw))],
                    attr.line,
                )?
                .ok_or_else(|| {
                    self.err(attr.line, format!("function '{}' does not return a value", fn_name))
                })?;
            let base = base
                .to_i128()
                .map_err(|e| self.err(attr.line, e))?;
            pointee_address = (base + i128::from(raw)) as u64;
        }

        let saved = self.offset;
        self.offset = pointee_address;
        let pointee = self.create_type_pattern(spec, name, inherited, line);
        self.offset = saved;
        let pointee = pointee?;

        let mut pattern = Pattern::new(
            PatternKind::Pointer {
                pointee: Box::new(pointee),
            },
            ptr_offset,
            size,
            endian,
            format!("{}*", spec.ty.display_name()),
            name,
        );
        pattern.value = Some(Value::Unsigned(u128::from(raw)));
        Ok(pattern)
    }

    // ----- local variables ---------------------------------------------

    /// Create a stack-backed local in the current scope. Returns the
    /// value-stack slot.
    fn create_local_variable(&mut self, ty: &TypeSpec, name: &str, line: u32) -> Result<usize> {
        let exists = self
            .scopes
            .last()
            .map(|s| s.patterns.iter().any(|p| p.name == name))
            .unwrap_or(false);
        if exists {
            return Err(self.err(line, format!("variable with name '{}' already exists", name)));
        }

        let (vt, _) = match &ty.ty {
            TypeRef::Builtin(vt) => (*vt, ty.endian),
            TypeRef::Named { .. } => self.resolve_to_builtin(ty, line).map_err(|_| {
                self.err(
                    line,
                    format!(
                        "local variables of type '{}' are not supported",
                        ty.ty.display_name()
                    ),
                )
            })?,
        };

        let (kind, default, size) = match vt {
            ValueType::Bool => (PatternKind::Boolean, Value::Bool(false), 1),
            ValueType::Char => (PatternKind::Character, Value::Char('\0'), 1),
            ValueType::Char16 => (PatternKind::Character16, Value::Char16(0), 2),
            ValueType::Float | ValueType::Double => (
                PatternKind::Float,
                Value::Float(0.0),
                vt.size_bytes().unwrap_or(8),
            ),
            ValueType::String => (PatternKind::String, Value::String(String::new()), 0),
            ValueType::Auto => (PatternKind::Unsigned, Value::Unsigned(0), 0),
            ValueType::Padding => {
                return Err(self.err(line, "'padding' is not a valid variable type"));
            }
            _ if vt.is_signed() => (
                PatternKind::Signed,
                Value::Signed(0),
                vt.size_bytes().unwrap_or(16),
            ),
            _ => (
                PatternKind::Unsigned,
                Value::Unsigned(0),
                vt.size_bytes().unwrap_or(16),
            ),
        };

        let slot = self.stack.len();
        self.stack.push(default);

        let mut pattern = Pattern::new(
            kind,
            slot as u64,
            size,
            self.settings.default_endian,
            vt.name(),
            name,
        );
        pattern.local = true;
        self.current_scope_mut().patterns.push(pattern);
        Ok(slot)
    }

    /// Find a local by name, innermost scope first. Returns its slot and
    /// the value type to cast assignments to (`None` for `auto`/`str`).
    fn find_local(&self, name: &str) -> Option<(usize, Option<ValueType>)> {
        for scope in self.scopes.iter().rev() {
            for pattern in &scope.patterns {
                if pattern.name == name {
                    if !pattern.local {
                        return None;
                    }
                    let vt = ValueType::from_str(&pattern.type_name)
                        .filter(|vt| vt.size_bytes().is_some());
                    return Some((pattern.offset as usize, vt));
                }
            }
        }
        None
    }

    fn set_variable(&mut self, name: &str, value: Value, line: u32) -> Result<()> {
        let Some((slot, vt)) = self.find_local(name) else {
            let placed = self
                .scopes
                .iter()
                .rev()
                .flat_map(|s| s.patterns.iter())
                .any(|p| p.name == name);
            if placed {
                return Err(self.err(
                    line,
                    format!(
                        "cannot modify variable '{}' which has been placed in memory",
                        name
                    ),
                ));
            }
            return Err(self.err(line, format!("no variable with name '{}' found", name)));
        };

        let value = match vt {
            Some(vt) => value.cast_to(vt).map_err(|e| self.err(line, e))?,
            None => value,
        };
        self.stack[slot] = value;
        Ok(())
    }

    // ----- expressions -------------------------------------------------

    fn eval_condition(&mut self, expr: &Expr) -> Result<bool> {
        self.eval_expr(expr)?
            .to_bool()
            .map_err(|e| self.err(expr.line, e))
    }

    fn eval_offset(&mut self, expr: &Expr) -> Result<u64> {
        self.eval_expr(expr)?
            .to_u64()
            .map_err(|e| self.err(expr.line, e))
    }

    pub fn eval_expr(&mut self, expr: &Expr) -> Result<Value> {
        let line = expr.line;
        match &expr.kind {
            ExprKind::Literal(v) => Ok(v.clone()),
            ExprKind::Null => Ok(Value::Unsigned(0)),
            ExprKind::CurrentOffset => Ok(Value::Unsigned(u128::from(self.offset))),
            ExprKind::Unary { op, operand } => {
                let v = self.eval_expr(operand)?;
                value::apply_unary(*op, &v).map_err(|e| self.err(line, e))
            }
            ExprKind::Binary { op, lhs, rhs } => {
                use crate::ast::BinaryOperator::*;
                // Logical && and || short-circuit.
                match op {
                    BoolAnd => {
                        if !self.eval_condition(lhs)? {
                            return Ok(Value::Bool(false));
                        }
                        return Ok(Value::Bool(self.eval_condition(rhs)?));
                    }
                    BoolOr => {
                        if self.eval_condition(lhs)? {
                            return Ok(Value::Bool(true));
                        }
                        return Ok(Value::Bool(self.eval_condition(rhs)?));
                    }
                    _ => {}
                }
                let l = self.eval_expr(lhs)?;
                let r = self.eval_expr(rhs)?;
                value::apply_binary(*op, &l, &r).map_err(|e| self.err(line, e))
            }
            ExprKind::Ternary {
                condition,
                then_expr,
                else_expr,
            } => {
                if self.eval_condition(condition)? {
                    self.eval_expr(then_expr)
                } else {
                    self.eval_expr(else_expr)
                }
            }
            ExprKind::Cast { target, operand } => {
                let v = self.eval_expr(operand)?;
                v.cast_to(*target).map_err(|e| self.err(line, e))
            }
            ExprKind::Call { name, args } => {
                let result = self.call_function(name, args, line)?;
                result.ok_or_else(|| {
                    self.err(line, format!("function '{}' does not return a value", name))
                })
            }
            ExprKind::SizeOf(target) => match target {
                SizeOfTarget::Path(segs) => {
                    match self.resolve_path(segs, line) {
                        Ok(pattern) => Ok(Value::Unsigned(u128::from(pattern.size))),
                        Err(path_error) => {
                            // `sizeof(TypeName)` parses as a path; fall
                            // back to measuring the named type.
                            let [PathSegment::Name(name)] = segs.as_slice() else {
                                return Err(path_error);
                            };
                            let ty = TypeRef::Named {
                                name: name.clone(),
                                namespaces: Vec::new(),
                            };
                            if self.resolve_type(&ty, line).is_err() {
                                return Err(path_error);
                            }
                            self.measure_type(&ty, line)
                        }
                    }
                }
                SizeOfTarget::Type(ty) => {
                    if let TypeRef::Builtin(vt) = ty {
                        if let Some(size) = vt.size_bytes() {
                            return Ok(Value::Unsigned(u128::from(size)));
                        }
                    }
                    self.measure_type(ty, line)
                }
            },
            ExprKind::AddressOf(segs) => {
                let pattern = self.resolve_path(segs, line)?;
                if pattern.local {
                    return Err(
                        self.err(line, "cannot take the address of a local variable")
                    );
                }
                Ok(Value::Unsigned(u128::from(pattern.offset)))
            }
            ExprKind::Path(segs) => {
                // A bare qualified name is an enum constant reference.
                if segs.len() == 1 {
                    if let PathSegment::Name(name) = &segs[0] {
                        if name.contains("::") {
                            return self.resolve_scope_name(name, line);
                        }
                    }
                }
                let pattern = self.resolve_path(segs, line)?;
                Ok(self.read_pattern_value(&pattern))
            }
        }
    }

    /// Instantiate a type at the current offset to measure it; the
    /// cursor is restored afterwards and no pattern is kept.
    fn measure_type(&mut self, ty: &TypeRef, line: u32) -> Result<Value> {
        let spec = TypeSpec::new(None, ty.clone());
        let saved = self.offset;
        let created = self.create_type_pattern(&spec, "", self.settings.default_endian, line);
        self.offset = saved;
        Ok(Value::Unsigned(u128::from(created?.size)))
    }

    fn read_pattern_value(&self, pattern: &Pattern) -> Value {
        if pattern.local {
            if let Some(v) = self.stack.get(pattern.offset as usize) {
                return v.clone();
            }
        }
        if let Some(v) = &pattern.value {
            return v.clone();
        }
        Value::Pattern(Box::new(pattern.clone()))
    }

    /// Resolve `Enum::Constant` style references.
    fn resolve_scope_name(&mut self, qualified: &str, line: u32) -> Result<Value> {
        let Some((type_name, constant)) = qualified.rsplit_once("::") else {
            return Err(self.err(line, format!("invalid name '{}'", qualified)));
        };

        let def = self
            .types
            .get(type_name)
            .cloned()
            .or_else(|| {
                // Fall back to a unique suffix match so constants inside
                // namespaces resolve from sibling code.
                let suffix = format!("::{}", type_name);
                let mut matches = self
                    .types
                    .iter()
                    .filter(|(k, _)| k.ends_with(&suffix))
                    .map(|(_, v)| v.clone());
                let first = matches.next();
                if matches.next().is_some() { None } else { first }
            })
            .ok_or_else(|| self.err(line, format!("unknown type '{}'", type_name)))?;

        let TypeDefKind::Enum { entries, .. } = &def.kind else {
            return Err(self.err(
                line,
                format!("'{}' is not an enum type", type_name),
            ));
        };

        let entries = entries.clone();
        for entry in &entries {
            if entry.name == constant {
                return self.eval_expr(&entry.min);
            }
        }
        Err(self.err(
            line,
            format!("enum '{}' has no constant '{}'", type_name, constant),
        ))
    }

    // ----- path resolution ---------------------------------------------

    /// Walk a member path against the pattern tree built so far and
    /// return a clone of the target pattern.
    fn resolve_path(&mut self, segments: &[PathSegment], line: u32) -> Result<Pattern> {
        let mut index = 0;
        let mut parents = 0usize;
        while matches!(segments.get(index), Some(PathSegment::Parent)) {
            parents += 1;
            index += 1;
        }

        let mut current: Option<Pattern> = None;

        if parents > 0 {
            let scope_index = self
                .scopes
                .len()
                .checked_sub(1 + parents)
                .ok_or_else(|| self.err(line, "no parent scope available"))?;
            if index >= segments.len() {
                current = Some(self.synthesize_scope_pattern(scope_index, line)?);
            } else {
                let PathSegment::Name(name) = &segments[index] else {
                    return Err(self.err(line, "expected member name after 'parent'"));
                };
                current = Some(self.find_in_scope(scope_index, name).ok_or_else(|| {
                    self.err(line, format!("no member named '{}' in parent", name))
                })?);
                index += 1;
            }
        } else if matches!(segments.first(), Some(PathSegment::This)) {
            let scope_index = self.scopes.len() - 1;
            current = Some(self.synthesize_scope_pattern(scope_index, line)?);
            index = 1;
        }

        if current.is_none() {
            let PathSegment::Name(name) = &segments[index] else {
                return Err(self.err(line, "invalid path expression"));
            };
            current = Some(self.find_in_scopes(name).ok_or_else(|| {
                self.err(line, format!("no variable named '{}' found", name))
            })?);
            index += 1;
        }

        let mut pattern = current.expect("path root resolved above");

        while index < segments.len() {
            match &segments[index] {
                PathSegment::Parent | PathSegment::This => {
                    return Err(self.err(line, "'parent' is only allowed at the start of a path"));
                }
                PathSegment::Name(name) => {
                    pattern = self.descend_member(pattern, name, line)?;
                }
                PathSegment::Index(expr) => {
                    let i = self.eval_offset(expr)?;
                    pattern = self.descend_index(pattern, i, line)?;
                }
            }
            index += 1;
        }

        Ok(pattern)
    }

    fn descend_member(&self, pattern: Pattern, name: &str, line: u32) -> Result<Pattern> {
        // Pointers dereference implicitly on member access.
        let pattern = match pattern {
            Pattern {
                kind: PatternKind::Pointer { pointee },
                ..
            } => *pointee,
            other => other,
        };

        let children: &[Pattern] = match &pattern.kind {
            PatternKind::Struct { members } | PatternKind::Union { members } => members,
            PatternKind::Bitfield { fields } => fields,
            _ => {
                return Err(self.err(
                    line,
                    format!("cannot access member '{}' of type '{}'", name, pattern.type_name),
                ));
            }
        };

        children
            .iter()
            .find(|m| m.name == name)
            .cloned()
            .ok_or_else(|| {
                self.err(
                    line,
                    format!("no member named '{}' in '{}'", name, pattern.type_name),
                )
            })
    }

    fn descend_index(&self, pattern: Pattern, index: u64, line: u32) -> Result<Pattern> {
        match &pattern.kind {
            PatternKind::StaticArray { count, .. } => {
                pattern.array_entry(index).ok_or_else(|| {
                    self.err(
                        line,
                        format!("array index {} out of bounds (length {})", index, count),
                    )
                })
            }
            PatternKind::DynamicArray { entries } => entries
                .get(index as usize)
                .cloned()
                .ok_or_else(|| {
                    self.err(
                        line,
                        format!(
                            "array index {} out of bounds (length {})",
                            index,
                            entries.len()
                        ),
                    )
                }),
            _ => Err(self.err(
                line,
                format!("cannot index into type '{}'", pattern.type_name),
            )),
        }
    }

    fn find_in_scope(&self, scope_index: usize, name: &str) -> Option<Pattern> {
        self.scopes.get(scope_index).and_then(|scope| {
            scope
                .patterns
                .iter()
                .rev()
                .find(|p| p.name == name)
                .cloned()
        })
    }

    fn find_in_scopes(&self, name: &str) -> Option<Pattern> {
        for scope_index in (0..self.scopes.len()).rev() {
            if let Some(found) = self.find_in_scope(scope_index, name) {
                return Some(found);
            }
        }
        None
    }

    /// Build a pattern representing the composite a scope is currently
    /// filling (`this` / trailing `parent`).
    fn synthesize_scope_pattern(&self, scope_index: usize, line: u32) -> Result<Pattern> {
        let scope = self
            .scopes
            .get(scope_index)
            .ok_or_else(|| self.err(line, "no parent scope available"))?;
        let info = scope.parent_info.as_ref().ok_or_else(|| {
            self.err(line, "'this' can only be used inside of structs and unions")
        })?;

        let end = scope
            .patterns
            .iter()
            .map(|p| p.offset + p.size)
            .max()
            .unwrap_or(info.offset)
            .max(self.offset);
        let mut pattern = Pattern::new(
            PatternKind::Struct {
                members: scope.patterns.clone(),
            },
            info.offset,
            end.saturating_sub(info.offset),
            info.endian,
            info.type_name.clone(),
            "",
        );
        pattern.type_name = info.type_name.clone();
        Ok(pattern)
    }

    // ----- function calls ----------------------------------------------

    fn find_parameter_pack(&self, name: &str) -> Option<Vec<Value>> {
        for scope in self.scopes.iter().rev() {
            if let Some(pack) = &scope.parameter_pack {
                if pack.name == name {
                    return Some(pack.values.clone());
                }
            }
        }
        None
    }

    pub fn call_function(
        &mut self,
        name: &str,
        arg_exprs: &[Expr],
        line: u32,
    ) -> Result<Option<Value>> {
        let mut args = Vec::with_capacity(arg_exprs.len());
        for arg in arg_exprs {
            // A bare name matching a parameter pack expands in place.
            if let ExprKind::Path(segs) = &arg.kind {
                if let [PathSegment::Name(n)] = segs.as_slice() {
                    if let Some(values) = self.find_parameter_pack(n) {
                        args.extend(values);
                        continue;
                    }
                }
            }
            args.push(self.eval_expr(arg)?);
        }
        self.call_function_with_values(name, args, line)
    }

    pub fn call_function_with_values(
        &mut self,
        name: &str,
        args: Vec<Value>,
        line: u32,
    ) -> Result<Option<Value>> {
        // AST-defined functions shadow host registrations.
        if let Some(def) = self.functions.get(name).cloned() {
            return self.call_ast_function(&def, args, line);
        }

        let registry = self.registry;
        let Some(function) = registry.get(name) else {
            return Err(self.err(line, format!("call to unknown function '{}'", name)));
        };

        if !function.parameter_count.check(args.len()) {
            return Err(self.err(
                line,
                format!("invalid number of parameters for function '{}'", name),
            ));
        }

        if function.dangerous {
            match self.dangerous_permission {
                DangerousFunctionPermission::Allow => self.dangerous_called = true,
                DangerousFunctionPermission::Ask | DangerousFunctionPermission::Deny => {
                    return Err(self.err(
                        line,
                        format!("calling dangerous function '{}' is not allowed", name),
                    ));
                }
            }
        }

        (function.callback)(self, &args).map_err(|e| self.err(line, e))
    }

    fn call_ast_function(
        &mut self,
        def: &Rc<FunctionDef>,
        args: Vec<Value>,
        line: u32,
    ) -> Result<Option<Value>> {
        let has_pack = def.parameters.last().is_some_and(|p| p.pack);
        let fixed = if has_pack {
            def.parameters.len() - 1
        } else {
            def.parameters.len()
        };

        let arity_ok = if has_pack {
            args.len() >= fixed
        } else {
            args.len() == fixed
        };
        if !arity_ok {
            return Err(self.err(
                line,
                format!(
                    "function '{}' expects {} parameters, got {}",
                    def.name,
                    fixed,
                    args.len()
                ),
            ));
        }

        let stack_base = self.stack.len();
        let saved_control_flow = self.control_flow;
        let saved_return = self.return_value.take();
        self.control_flow = ControlFlowStatement::None;

        self.push_scope(None, line)?;

        let result = (|| -> Result<()> {
            let mut args = args;
            let pack_values = args.split_off(fixed);

            for (param, value) in def.parameters.iter().take(fixed).zip(args) {
                let slot = self.create_local_variable(&param.ty, &param.name, def.line)?;
                let (_, vt) = self
                    .find_local(&param.name)
                    .unwrap_or((slot, None));
                let value = match vt {
                    Some(vt) => value.cast_to(vt).map_err(|e| self.err(def.line, e))?,
                    None => value,
                };
                self.stack[slot] = value;
            }

            if has_pack {
                let pack_name = def
                    .parameters
                    .last()
                    .map(|p| p.name.clone())
                    .unwrap_or_default();
                self.current_scope_mut().parameter_pack = Some(ParameterPack {
                    name: pack_name,
                    values: pack_values,
                });
            }

            self.exec_block(&def.body)?;

            match self.control_flow {
                ControlFlowStatement::Break => {
                    Err(self.err(def.line, "break used outside of a loop"))
                }
                ControlFlowStatement::Continue => {
                    Err(self.err(def.line, "continue used outside of a loop"))
                }
                _ => Ok(()),
            }
        })();

        self.pop_scope();
        self.stack.truncate(stack_base);

        let returned = self.return_value.take();
        self.control_flow = saved_control_flow;
        self.return_value = saved_return;
        result?;
        Ok(returned)
    }

    // ----- statements --------------------------------------------------

    fn exec_block(&mut self, statements: &[Statement]) -> Result<()> {
        for statement in statements {
            self.exec_statement(statement)?;
            if self.control_flow != ControlFlowStatement::None {
                break;
            }
        }
        Ok(())
    }

    /// Loop bodies and conditional branches run in their own frame so
    /// locals declared inside them disappear between iterations.
    fn exec_scoped_block(&mut self, statements: &[Statement], line: u32) -> Result<()> {
        let stack_base = self.stack.len();
        self.push_scope(None, line)?;
        let result = self.exec_block(statements);
        self.pop_scope();
        self.stack.truncate(stack_base);
        result
    }

    fn exec_statement(&mut self, statement: &Statement) -> Result<()> {
        let line = statement.line;
        match &statement.kind {
            StatementKind::LocalDecl { ty, name, init } => {
                self.create_local_variable(ty, name, line)?;
                if let Some(init) = init {
                    let value = self.eval_expr(init)?;
                    self.assign_local(name, value, line)?;
                } else if matches!(ty.ty, TypeRef::Builtin(ValueType::Auto)) {
                    return Err(
                        self.err(line, "cannot determine type of auto variable without initializer")
                    );
                }
                Ok(())
            }
            StatementKind::Assign { name, value } => {
                let value = self.eval_expr(value)?;
                self.set_variable(name, value, line)
            }
            StatementKind::Call(expr) => {
                if let ExprKind::Call { name, args } = &expr.kind {
                    self.call_function(name, args, expr.line)?;
                } else {
                    self.eval_expr(expr)?;
                }
                Ok(())
            }
            StatementKind::If {
                condition,
                then_body,
                else_body,
            } => {
                if self.eval_condition(condition)? {
                    self.exec_scoped_block(then_body, line)
                } else {
                    self.exec_scoped_block(else_body, line)
                }
            }
            StatementKind::While { condition, body } => {
                let mut iterations = 0u64;
                loop {
                    self.poll_abort(line)?;
                    iterations += 1;
                    if iterations > self.settings.loop_limit {
                        return Err(self.err(
                            line,
                            format!(
                                "loop iterations exceeded set limit of {}",
                                self.settings.loop_limit
                            ),
                        ));
                    }
                    if !self.eval_condition(condition)? {
                        break;
                    }
                    self.exec_scoped_block(body, line)?;
                    match self.control_flow {
                        ControlFlowStatement::Break => {
                            self.control_flow = ControlFlowStatement::None;
                            break;
                        }
                        ControlFlowStatement::Continue => {
                            self.control_flow = ControlFlowStatement::None;
                        }
                        ControlFlowStatement::Return => break,
                        ControlFlowStatement::None => {}
                    }
                }
                Ok(())
            }
            StatementKind::For {
                init,
                condition,
                post,
                body,
            } => {
                self.exec_statement(init)?;
                let mut iterations = 0u64;
                loop {
                    self.poll_abort(line)?;
                    iterations += 1;
                    if iterations > self.settings.loop_limit {
                        return Err(self.err(
                            line,
                            format!(
                                "loop iterations exceeded set limit of {}",
                                self.settings.loop_limit
                            ),
                        ));
                    }
                    if !self.eval_condition(condition)? {
                        break;
                    }
                    self.exec_scoped_block(body, line)?;
                    match self.control_flow {
                        ControlFlowStatement::Break => {
                            self.control_flow = ControlFlowStatement::None;
                            break;
                        }
                        ControlFlowStatement::Continue => {
                            self.control_flow = ControlFlowStatement::None;
                            self.exec_statement(post)?;
                        }
                        ControlFlowStatement::Return => break,
                        ControlFlowStatement::None => {
                            self.exec_statement(post)?;
                        }
                    }
                }
                Ok(())
            }
            StatementKind::Return(expr) => {
                self.return_value = match expr {
                    Some(expr) => Some(self.eval_expr(expr)?),
                    None => None,
                };
                self.control_flow = ControlFlowStatement::Return;
                Ok(())
            }
            StatementKind::Break => {
                self.control_flow = ControlFlowStatement::Break;
                Ok(())
            }
            StatementKind::Continue => {
                self.control_flow = ControlFlowStatement::Continue;
                Ok(())
            }
        }
    }

    /// Assignment that skips the placed-variable check; used for
    /// initializers where the local was just created.
    fn assign_local(&mut self, name: &str, value: Value, line: u32) -> Result<()> {
        let Some((slot, vt)) = self.find_local(name) else {
            return Err(self.err(line, format!("no variable with name '{}' found", name)));
        };
        let value = match vt {
            Some(vt) => value.cast_to(vt).map_err(|e| self.err(line, e))?,
            None => value,
        };
        self.stack[slot] = value;
        Ok(())
    }

    // ----- attributes --------------------------------------------------

    fn pattern_value_for_call(&self, pattern: &Pattern) -> Value {
        match &pattern.value {
            Some(v) => v.clone(),
            None => Value::Pattern(Box::new(pattern.clone())),
        }
    }

    fn apply_attributes(
        &mut self,
        pattern: &mut Pattern,
        attributes: &[Attribute],
        variable_site: bool,
    ) -> Result<()> {
        for attr in attributes {
            self.apply_attribute(pattern, attr, variable_site)?;
        }
        Ok(())
    }

    fn apply_attribute(
        &mut self,
        pattern: &mut Pattern,
        attr: &Attribute,
        variable_site: bool,
    ) -> Result<()> {
        let line = attr.line;
        let require_value = |this: &Self| -> Result<String> {
            attr.value.clone().ok_or_else(|| {
                this.err(line, format!("attribute '{}' expects a parameter", attr.key))
            })
        };
        let forbid_value = |this: &Self| -> Result<()> {
            if attr.value.is_some() {
                Err(this.err(
                    line,
                    format!("attribute '{}' expects no parameters", attr.key),
                ))
            } else {
                Ok(())
            }
        };

        match attr.key.as_str() {
            "inline" => {
                forbid_value(self)?;
                if !matches!(
                    pattern.kind,
                    PatternKind::Struct { .. }
                        | PatternKind::Union { .. }
                        | PatternKind::StaticArray { .. }
                        | PatternKind::DynamicArray { .. }
                ) {
                    return Err(self.err(
                        line,
                        "attribute 'inline' can only be applied to structs, unions and arrays",
                    ));
                }
                pattern.inlined = true;
            }
            "format" => {
                let fn_name = require_value(self)?;
                let value = self.pattern_value_for_call(pattern);
                match self.call_format_function(&fn_name, value, line)? {
                    Some(text) => pattern.formatted_value = Some(text),
                    None => {}
                }
                pattern.formatter = Some(fn_name);
            }
            "format_entries" => {
                let fn_name = require_value(self)?;
                match &mut pattern.kind {
                    PatternKind::DynamicArray { entries } => {
                        let mut formatted = Vec::with_capacity(entries.len());
                        for entry in entries.iter() {
                            let value = match &entry.value {
                                Some(v) => v.clone(),
                                None => Value::Pattern(Box::new(entry.clone())),
                            };
                            formatted.push(self.call_format_function(&fn_name, value, line)?);
                        }
                        for (entry, text) in entries.iter_mut().zip(formatted) {
                            entry.formatted_value = text;
                            entry.formatter = Some(fn_name.clone());
                        }
                    }
                    PatternKind::StaticArray { template, .. } => {
                        template.formatter = Some(fn_name.clone());
                    }
                    _ => {
                        return Err(self.err(
                            line,
                            "attribute 'format_entries' can only be applied to arrays",
                        ));
                    }
                }
            }
            "transform" => {
                let fn_name = require_value(self)?;
                let value = self.pattern_value_for_call(pattern);
                let transformed = self
                    .call_function_with_values(&fn_name, vec![value], line)?
                    .ok_or_else(|| {
                        self.err(
                            line,
                            format!("function '{}' does not return a value", fn_name),
                        )
                    })?;
                pattern.value = Some(transformed);
                pattern.transform = Some(fn_name);
            }
            "pointer_base" => {
                // Consumed during pointer creation; only the site check
                // remains here.
                require_value(self)?;
                if !matches!(pattern.kind, PatternKind::Pointer { .. }) {
                    return Err(self.err(
                        line,
                        "attribute 'pointer_base' can only be applied to pointers",
                    ));
                }
            }
            "hidden" => {
                forbid_value(self)?;
                pattern.hidden = true;
            }
            "color" => {
                let text = require_value(self)?;
                let decoded = hex::decode(&text).map_err(|_| {
                    self.err(line, format!("invalid color value '{}'", text))
                })?;
                let [r, g, b] = decoded.as_slice() else {
                    return Err(self.err(line, format!("invalid color value '{}'", text)));
                };
                pattern.color =
                    Some((u32::from(*r) << 16) | (u32::from(*g) << 8) | u32::from(*b));
            }
            "single_color" => {
                forbid_value(self)?;
                pattern.color = Some(AUTO_COLORS[self.color_index % AUTO_COLORS.len()]);
                self.color_index += 1;
            }
            "name" => {
                let text = require_value(self)?;
                if !variable_site {
                    return Err(self.err(
                        line,
                        "attribute 'name' can only be applied to variable declarations",
                    ));
                }
                pattern.display_name = Some(text);
            }
            "comment" => {
                let text = require_value(self)?;
                if !variable_site {
                    return Err(self.err(
                        line,
                        "attribute 'comment' can only be applied to variable declarations",
                    ));
                }
                pattern.comment = Some(text);
            }
            "no_unique_address" => {
                forbid_value(self)?;
                if !variable_site {
                    return Err(self.err(
                        line,
                        "attribute 'no_unique_address' can only be applied to variable declarations",
                    ));
                }
                // Cursor rewind happens at the placement site.
            }
            other => {
                return Err(self.err(line, format!("unknown attribute '{}'", other)));
            }
        }
        Ok(())
    }

    /// Run a `[[format]]` function. A failing formatter logs a soft
    /// error and leaves the default rendering in place; a formatter that
    /// returns a non-string is a terminal misuse error.
    fn call_format_function(
        &mut self,
        fn_name: &str,
        value: Value,
        line: u32,
    ) -> Result<Option<String>> {
        match self.call_function_with_values(fn_name, vec![value], line) {
            Ok(Some(Value::String(text))) => Ok(Some(text)),
            Ok(_) => Err(self.err(
                line,
                format!("format function '{}' needs to return a string", fn_name),
            )),
            Err(e) => {
                self.console.log(
                    LogLevel::Error,
                    format!("format function '{}' failed: {}", fn_name, e.message),
                );
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_settings_defaults() {
        let settings = RuntimeSettings::default();
        assert_eq!(settings.eval_depth, 32);
        assert_eq!(settings.array_limit, 0x1000);
        assert_eq!(settings.pattern_limit, 0x2000);
        assert_eq!(settings.loop_limit, 0x1000);
        assert_eq!(settings.bitfield_order, BitfieldOrder::RightToLeft);
        assert!(settings.base_address.is_none());
    }

    #[test]
    fn test_match_enum_value_ranges() {
        let entries = vec![
            EnumValueEntry {
                name: "A".to_string(),
                min: Value::Unsigned(1),
                max: Value::Unsigned(1),
            },
            EnumValueEntry {
                name: "Lots".to_string(),
                min: Value::Unsigned(10),
                max: Value::Unsigned(20),
            },
        ];
        assert_eq!(
            Evaluator::match_enum_value(&entries, &Value::Unsigned(1)),
            Some("A".to_string())
        );
        assert_eq!(
            Evaluator::match_enum_value(&entries, &Value::Unsigned(15)),
            Some("Lots".to_string())
        );
        assert_eq!(Evaluator::match_enum_value(&entries, &Value::Unsigned(2)), None);
    }
}
