//! End-to-end execution tests
//!
//! Each test runs a complete pattern source against an in-memory
//! provider and checks the produced pattern tree, out-variables and
//! error reporting.

use patl::{MemoryProvider, PatternKind, PatternLanguage, Value};
use std::collections::BTreeMap;

fn execute(source: &str, data: Vec<u8>) -> (PatternLanguage, bool) {
    execute_with_vars(source, data, BTreeMap::new())
}

fn execute_with_vars(
    source: &str,
    data: Vec<u8>,
    in_vars: BTreeMap<String, Value>,
) -> (PatternLanguage, bool) {
    let mut runtime = PatternLanguage::new();
    let provider = MemoryProvider::new(data);
    let ok = runtime.execute_string(&provider, source, BTreeMap::new(), in_vars, true);
    (runtime, ok)
}

#[test]
fn test_u32_placement() {
    let (runtime, ok) = execute(
        "#pragma endian little\nu32 value @ 0x00;",
        vec![0x78, 0x56, 0x34, 0x12, 0xFF, 0xFF],
    );
    assert!(ok, "error: {:?}", runtime.get_error());

    let patterns = runtime.get_patterns();
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].offset, 0);
    assert_eq!(patterns[0].size, 4);
    assert_eq!(patterns[0].name, "value");
    assert_eq!(patterns[0].value, Some(Value::Unsigned(0x1234_5678)));
}

#[test]
fn test_big_endian_override() {
    let (runtime, ok) = execute("be u16 x @ 0x02;", vec![0x00, 0x00, 0x01, 0x02]);
    assert!(ok, "error: {:?}", runtime.get_error());

    let pattern = &runtime.get_patterns()[0];
    assert_eq!(pattern.offset, 2);
    assert_eq!(pattern.value, Some(Value::Unsigned(0x0102)));
}

#[test]
fn test_struct_members() {
    let (runtime, ok) = execute(
        "struct Point { u8 x; u8 y; }; Point p @ 0x00;",
        vec![0x0A, 0x0B, 0xFF],
    );
    assert!(ok, "error: {:?}", runtime.get_error());

    let pattern = &runtime.get_patterns()[0];
    assert_eq!(pattern.offset, 0);
    assert_eq!(pattern.size, 2);
    let PatternKind::Struct { members } = &pattern.kind else {
        panic!("expected a struct pattern");
    };
    assert_eq!(members.len(), 2);
    assert_eq!(members[0].name, "x");
    assert_eq!(members[0].offset, 0);
    assert_eq!(members[0].value, Some(Value::Unsigned(0x0A)));
    assert_eq!(members[1].name, "y");
    assert_eq!(members[1].offset, 1);
    assert_eq!(members[1].value, Some(Value::Unsigned(0x0B)));
}

#[test]
fn test_static_array() {
    let (runtime, ok) = execute("u8 a[4] @ 0x00;", vec![1, 2, 3, 4, 5]);
    assert!(ok, "error: {:?}", runtime.get_error());

    let pattern = &runtime.get_patterns()[0];
    assert_eq!(pattern.size, 4);
    assert!(matches!(pattern.kind, PatternKind::StaticArray { .. }));
    for i in 0..4u64 {
        let entry = pattern.array_entry(i).expect("entry exists");
        assert_eq!(entry.value, Some(Value::Unsigned(u128::from(i) + 1)));
        assert_eq!(entry.offset, i);
    }
    assert!(pattern.array_entry(4).is_none());
}

#[test]
fn test_bitfield_right_to_left() {
    let (runtime, ok) = execute(
        "bitfield F { low : 4; high : 4; }; F f @ 0x00;",
        vec![0xA5],
    );
    assert!(ok, "error: {:?}", runtime.get_error());

    let pattern = &runtime.get_patterns()[0];
    assert_eq!(pattern.size, 1);
    let PatternKind::Bitfield { fields } = &pattern.kind else {
        panic!("expected a bitfield pattern");
    };
    assert_eq!(fields.len(), 2);
    assert_eq!(fields[0].name, "low");
    assert_eq!(fields[0].value, Some(Value::Unsigned(0x5)));
    assert_eq!(fields[1].name, "high");
    assert_eq!(fields[1].value, Some(Value::Unsigned(0xA)));
}

#[test]
fn test_bitfield_left_to_right() {
    let (runtime, ok) = execute(
        "#pragma bitfield_order left_to_right\nbitfield F { high : 4; low : 4; }; F f @ 0x00;",
        vec![0xA5],
    );
    assert!(ok, "error: {:?}", runtime.get_error());

    let PatternKind::Bitfield { fields } = &runtime.get_patterns()[0].kind else {
        panic!("expected a bitfield pattern");
    };
    assert_eq!(fields[0].value, Some(Value::Unsigned(0xA)));
    assert_eq!(fields[1].value, Some(Value::Unsigned(0x5)));
}

#[test]
fn test_non_zero_main_return() {
    let (runtime, ok) = execute("fn main() { return 1; };", vec![]);
    assert!(!ok);
    let error = runtime.get_error().expect("hard error recorded");
    assert!(
        error
            .message
            .contains("non-success value returned from main: 1"),
        "message was: {}",
        error.message
    );
}

#[test]
fn test_define_substitution() {
    let (runtime, ok) = execute("#define X 42\nu8 v @ X;", vec![0; 64]);
    assert!(ok, "error: {:?}", runtime.get_error());
    assert_eq!(runtime.get_patterns()[0].offset, 42);
}

#[test]
fn test_enum_matching() {
    let (runtime, ok) = execute(
        "enum Color : u8 { Red, Green, Blue }; Color c @ 0x00;",
        vec![0x01],
    );
    assert!(ok, "error: {:?}", runtime.get_error());

    let pattern = &runtime.get_patterns()[0];
    let PatternKind::Enum { matched, .. } = &pattern.kind else {
        panic!("expected an enum pattern");
    };
    assert_eq!(matched.as_deref(), Some("Green"));
    assert_eq!(pattern.value, Some(Value::Unsigned(1)));
}

#[test]
fn test_enum_range_entry() {
    let (runtime, ok) = execute(
        "enum Kind : u8 { One = 1, Many = 10 ... 20 }; Kind k @ 0x00;",
        vec![15],
    );
    assert!(ok, "error: {:?}", runtime.get_error());
    let PatternKind::Enum { matched, .. } = &runtime.get_patterns()[0].kind else {
        panic!("expected an enum pattern");
    };
    assert_eq!(matched.as_deref(), Some("Many"));
}

#[test]
fn test_enum_constant_expression() {
    let (runtime, ok) = execute(
        "enum Color : u8 { Red, Green, Blue }; u8 v @ Color::Blue;",
        vec![0x11, 0x22, 0x33],
    );
    assert!(ok, "error: {:?}", runtime.get_error());
    let pattern = &runtime.get_patterns()[0];
    assert_eq!(pattern.offset, 2);
    assert_eq!(pattern.value, Some(Value::Unsigned(0x33)));
}

#[test]
fn test_union_members_share_offset() {
    let (runtime, ok) = execute(
        "union U { u8 a; u32 b; }; U u @ 0x00;",
        vec![0xDE, 0xAD, 0xBE, 0xEF],
    );
    assert!(ok, "error: {:?}", runtime.get_error());

    let pattern = &runtime.get_patterns()[0];
    assert_eq!(pattern.size, 4);
    let PatternKind::Union { members } = &pattern.kind else {
        panic!("expected a union pattern");
    };
    assert_eq!(members.len(), 2);
    assert!(members.iter().all(|m| m.offset == 0));
}

#[test]
fn test_pointer_resolution() {
    let (runtime, ok) = execute("u8 *ptr : u8 @ 0x00;", vec![0x02, 0xFF, 0xAB]);
    assert!(ok, "error: {:?}", runtime.get_error());

    let pattern = &runtime.get_patterns()[0];
    assert_eq!(pattern.size, 1);
    assert_eq!(pattern.value, Some(Value::Unsigned(2)));
    let PatternKind::Pointer { pointee } = &pattern.kind else {
        panic!("expected a pointer pattern");
    };
    assert_eq!(pointee.offset, 2);
    assert_eq!(pointee.value, Some(Value::Unsigned(0xAB)));
}

#[test]
fn test_pointer_base_attribute() {
    let (runtime, ok) = execute(
        "fn rel(auto v) { return 2; };\nu8 *p : u8 @ 0x00 [[pointer_base(\"rel\")]];",
        vec![0x01, 0x00, 0x00, 0xCC],
    );
    assert!(ok, "error: {:?}", runtime.get_error());

    let PatternKind::Pointer { pointee } = &runtime.get_patterns()[0].kind else {
        panic!("expected a pointer pattern");
    };
    // Address is rel(raw) + raw = 2 + 1.
    assert_eq!(pointee.offset, 3);
    assert_eq!(pointee.value, Some(Value::Unsigned(0xCC)));
}

#[test]
fn test_char_array_reads_string() {
    let (runtime, ok) = execute("char name[5] @ 0x00;", b"hello!".to_vec());
    assert!(ok, "error: {:?}", runtime.get_error());

    let pattern = &runtime.get_patterns()[0];
    assert!(matches!(pattern.kind, PatternKind::String));
    assert_eq!(pattern.size, 5);
    assert_eq!(pattern.value, Some(Value::String("hello".to_string())));
}

#[test]
fn test_char16_array_reads_wide_string() {
    let (runtime, ok) = execute(
        "#pragma endian little\nchar16 w[2] @ 0x00;",
        vec![0x41, 0x00, 0x42, 0x00],
    );
    assert!(ok, "error: {:?}", runtime.get_error());

    let pattern = &runtime.get_patterns()[0];
    assert!(matches!(pattern.kind, PatternKind::WideString));
    assert_eq!(pattern.value, Some(Value::String("AB".to_string())));
}

#[test]
fn test_while_array() {
    let (runtime, ok) = execute("u8 data[while($ < 3)] @ 0x00;", vec![7, 8, 9, 10]);
    assert!(ok, "error: {:?}", runtime.get_error());

    let PatternKind::DynamicArray { entries } = &runtime.get_patterns()[0].kind else {
        panic!("expected a dynamic array");
    };
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[2].value, Some(Value::Unsigned(9)));
}

#[test]
fn test_until_array_keeps_sentinel() {
    let (runtime, ok) = execute(
        "struct Entry { u8 v; }; Entry list[until(list.v == 0)] @ 0x00;",
        vec![5, 3, 0, 9],
    );
    assert!(ok, "error: {:?}", runtime.get_error());

    let PatternKind::DynamicArray { entries } = &runtime.get_patterns()[0].kind else {
        panic!("expected a dynamic array");
    };
    assert_eq!(entries.len(), 3);
}

#[test]
fn test_conditional_members() {
    let source = "struct Msg { u8 tag; if (tag == 1) { u16 short_body; } else { u32 long_body; } };\n\
                  Msg m @ 0x00;";
    let (runtime, ok) = execute(source, vec![0x01, 0xAA, 0xBB, 0xCC, 0xDD]);
    assert!(ok, "error: {:?}", runtime.get_error());

    let PatternKind::Struct { members } = &runtime.get_patterns()[0].kind else {
        panic!("expected a struct pattern");
    };
    assert_eq!(members.len(), 2);
    assert_eq!(members[1].name, "short_body");
    assert_eq!(runtime.get_patterns()[0].size, 3);
}

#[test]
fn test_padding_member() {
    let (runtime, ok) = execute(
        "struct P { u8 a; padding[2]; u8 b; }; P p @ 0x00;",
        vec![1, 0, 0, 2],
    );
    assert!(ok, "error: {:?}", runtime.get_error());

    let pattern = &runtime.get_patterns()[0];
    assert_eq!(pattern.size, 4);
    let PatternKind::Struct { members } = &pattern.kind else {
        panic!("expected a struct pattern");
    };
    assert_eq!(members.len(), 3);
    assert!(matches!(members[1].kind, PatternKind::Padding));
    assert_eq!(members[2].offset, 3);
}

#[test]
fn test_no_unique_address_overlap() {
    let (runtime, ok) = execute(
        "struct V { u8 tag [[no_unique_address]]; u16 body; }; V v @ 0x00;",
        vec![0x01, 0x02],
    );
    assert!(ok, "error: {:?}", runtime.get_error());

    let pattern = &runtime.get_patterns()[0];
    assert_eq!(pattern.size, 2);
    let PatternKind::Struct { members } = &pattern.kind else {
        panic!("expected a struct pattern");
    };
    assert_eq!(members[0].offset, 0);
    assert_eq!(members[1].offset, 0);
}

#[test]
fn test_parent_path_resolution() {
    let source = "struct Inner { u8 len; u8 data[parent.count]; };\n\
                  struct Outer { u8 count; Inner inner; };\n\
                  Outer o @ 0x00;";
    let (runtime, ok) = execute(source, vec![2, 9, 8, 7]);
    assert!(ok, "error: {:?}", runtime.get_error());

    let PatternKind::Struct { members } = &runtime.get_patterns()[0].kind else {
        panic!("expected a struct pattern");
    };
    let PatternKind::Struct { members: inner } = &members[1].kind else {
        panic!("expected a nested struct pattern");
    };
    assert_eq!(inner[1].size, 2);
}

#[test]
fn test_sibling_dependent_placement() {
    let source = "struct Header { u8 count; };\nHeader h @ 0x00;\nu8 items[h.count] @ 0x01;";
    let (runtime, ok) = execute(source, vec![3, 9, 8, 7]);
    assert!(ok, "error: {:?}", runtime.get_error());
    assert_eq!(runtime.get_patterns()[1].size, 3);
}

#[test]
fn test_sizeof_and_addressof() {
    let source = "struct S { u32 a; };\nS s @ 0x00;\nu8 v @ sizeof(s) + addressof(s);";
    let (runtime, ok) = execute(source, vec![0, 0, 0, 0, 0x5A]);
    assert!(ok, "error: {:?}", runtime.get_error());

    let pattern = &runtime.get_patterns()[1];
    assert_eq!(pattern.offset, 4);
    assert_eq!(pattern.value, Some(Value::Unsigned(0x5A)));
}

#[test]
fn test_sizeof_builtin_type() {
    let (runtime, ok) = execute("u8 v @ sizeof(u64);", vec![0; 16]);
    assert!(ok, "error: {:?}", runtime.get_error());
    assert_eq!(runtime.get_patterns()[0].offset, 8);
}

#[test]
fn test_using_alias() {
    let (runtime, ok) = execute(
        "using Magic = be u32;\nMagic m @ 0x00;",
        vec![0x01, 0x02, 0x03, 0x04],
    );
    assert!(ok, "error: {:?}", runtime.get_error());
    assert_eq!(
        runtime.get_patterns()[0].value,
        Some(Value::Unsigned(0x0102_0304))
    );
}

#[test]
fn test_namespace_qualified_type() {
    let source = "namespace fmt { struct Header { u8 a; u8 b; }; }\nfmt::Header h @ 0x00;";
    let (runtime, ok) = execute(source, vec![1, 2]);
    assert!(ok, "error: {:?}", runtime.get_error());
    assert_eq!(runtime.get_patterns()[0].size, 2);
}

#[test]
fn test_in_out_variables() {
    let source = "in u32 factor;\nout u32 result;\nfn main() { result = factor * 2; return 0; };";
    let mut in_vars = BTreeMap::new();
    in_vars.insert("factor".to_string(), Value::Unsigned(21));
    let (runtime, ok) = execute_with_vars(source, vec![], in_vars);
    assert!(ok, "error: {:?}", runtime.get_error());

    assert_eq!(
        runtime.get_out_variables().get("result"),
        Some(&Value::Unsigned(42))
    );
    // Local variables never appear in the pattern tree.
    assert!(runtime.get_patterns().is_empty());
}

#[test]
fn test_function_with_loop() {
    let source = "out u32 total;\n\
                  fn main() { \
                    u32 acc = 0; \
                    for (u8 i = 0; i < 10; i += 1) { acc += i; } \
                    total = acc; \
                    return 0; \
                  };";
    let (runtime, ok) = execute(source, vec![]);
    assert!(ok, "error: {:?}", runtime.get_error());
    assert_eq!(
        runtime.get_out_variables().get("total"),
        Some(&Value::Unsigned(45))
    );
}

#[test]
fn test_parameter_pack_forwarding() {
    let source = "fn inner(auto a, auto b) { return a + b; };\n\
                  fn outer(auto ... rest) { return inner(rest); };\n\
                  fn main() { return outer(40, 2) - 42; };";
    let (runtime, ok) = execute(source, vec![]);
    assert!(ok, "error: {:?}", runtime.get_error());
}

#[test]
fn test_format_attribute() {
    let source = "fn fmt(auto v) { return \"answer\"; };\nu8 v @ 0x00 [[format(\"fmt\")]];";
    let (runtime, ok) = execute(source, vec![42]);
    assert!(ok, "error: {:?}", runtime.get_error());
    assert_eq!(runtime.get_patterns()[0].format_value(), "answer");
}

#[test]
fn test_transform_attribute() {
    let source = "fn double(auto v) { return v * 2; };\nu8 v @ 0x00 [[transform(\"double\")]];";
    let (runtime, ok) = execute(source, vec![4]);
    assert!(ok, "error: {:?}", runtime.get_error());
    assert_eq!(runtime.get_patterns()[0].value, Some(Value::Signed(8)));
}

#[test]
fn test_color_name_comment_attributes() {
    let source =
        "u8 v @ 0x00 [[color(\"FF8000\"), name(\"version\"), comment(\"format revision\")]];";
    let (runtime, ok) = execute(source, vec![1]);
    assert!(ok, "error: {:?}", runtime.get_error());

    let pattern = &runtime.get_patterns()[0];
    assert_eq!(pattern.color, Some(0xFF8000));
    assert_eq!(pattern.display_name(), "version");
    assert_eq!(pattern.comment.as_deref(), Some("format revision"));
}

#[test]
fn test_hidden_and_inline_attributes() {
    let source = "struct S { u8 a; }; S s @ 0x00 [[inline]];\nu8 h @ 0x01 [[hidden]];";
    let (runtime, ok) = execute(source, vec![1, 2]);
    assert!(ok, "error: {:?}", runtime.get_error());
    assert!(runtime.get_patterns()[0].inlined);
    assert!(runtime.get_patterns()[1].hidden);
}

#[test]
fn test_attribute_misuse_is_terminal() {
    let (runtime, ok) = execute("u8 v @ 0x00 [[inline]];", vec![1]);
    assert!(!ok);
    assert!(
        runtime
            .get_error()
            .unwrap()
            .message
            .contains("can only be applied to structs, unions and arrays")
    );
}

#[test]
fn test_unknown_attribute_is_terminal() {
    let (runtime, ok) = execute("u8 v @ 0x00 [[sparkles]];", vec![1]);
    assert!(!ok);
    assert!(
        runtime
            .get_error()
            .unwrap()
            .message
            .contains("unknown attribute 'sparkles'")
    );
}

#[test]
fn test_division_by_zero_is_terminal() {
    let (runtime, ok) = execute("u8 v @ 1 / 0;", vec![0; 4]);
    assert!(!ok);
    assert!(
        runtime
            .get_error()
            .unwrap()
            .message
            .contains("division by zero")
    );
}

#[test]
fn test_read_past_end_is_terminal() {
    let (runtime, ok) = execute("u32 v @ 0x02;", vec![0, 0, 0, 0]);
    assert!(!ok);
    assert!(
        runtime
            .get_error()
            .unwrap()
            .message
            .contains("read past end of data")
    );
}

#[test]
fn test_dangerous_function_permission_flow() {
    let source = "fn main() { builtin::dangerous::demo(); return 0; };";
    let provider = MemoryProvider::new(vec![]);

    let mut runtime = PatternLanguage::new();
    let ok = runtime.execute_string(
        &provider,
        source,
        BTreeMap::new(),
        BTreeMap::new(),
        true,
    );
    assert!(!ok);
    assert!(
        runtime
            .get_error()
            .unwrap()
            .message
            .contains("dangerous function")
    );
    assert!(!runtime.has_dangerous_function_been_called());

    runtime.allow_dangerous_functions(true);
    let ok = runtime.execute_string(
        &provider,
        source,
        BTreeMap::new(),
        BTreeMap::new(),
        true,
    );
    assert!(ok, "error: {:?}", runtime.get_error());
    assert!(runtime.has_dangerous_function_been_called());
}

#[test]
fn test_builtin_print_logs_to_console() {
    let source = "fn main() { builtin::print(\"hello from pattern\"); return 0; };";
    let (runtime, ok) = execute(source, vec![]);
    assert!(ok, "error: {:?}", runtime.get_error());
    assert!(
        runtime
            .get_console_log()
            .iter()
            .any(|(_, message)| message == "hello from pattern")
    );
}

#[test]
fn test_execute_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.pat");
    std::fs::write(&path, "u8 first @ 0x00;").unwrap();

    let mut runtime = PatternLanguage::new();
    let provider = MemoryProvider::new(vec![0x7F]);
    let ok = runtime.execute_file(&provider, &path, BTreeMap::new(), BTreeMap::new());
    assert!(ok, "error: {:?}", runtime.get_error());
    assert_eq!(runtime.get_patterns()[0].value, Some(Value::Unsigned(0x7F)));
}

#[test]
fn test_include_with_pragma_once() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("types.pat"),
        "#pragma once\nstruct Shared { u8 v; };\n",
    )
    .unwrap();

    let source = "#include \"types.pat\"\n#include \"types.pat\"\nShared s @ 0x00;";
    let mut runtime = PatternLanguage::new();
    runtime.add_include_path(dir.path());
    let provider = MemoryProvider::new(vec![9]);
    let ok = runtime.execute_string(&provider, source, BTreeMap::new(), BTreeMap::new(), true);
    // Without the once-guard the second include would redefine Shared.
    assert!(ok, "error: {:?}", runtime.get_error());
    assert_eq!(runtime.get_patterns()[0].size, 1);
}

#[test]
fn test_float_value() {
    let mut data = Vec::new();
    data.extend_from_slice(&1.5f32.to_le_bytes());
    let (runtime, ok) = execute("#pragma endian little\nfloat f @ 0x00;", data);
    assert!(ok, "error: {:?}", runtime.get_error());
    assert_eq!(runtime.get_patterns()[0].value, Some(Value::Float(1.5)));
}

#[test]
fn test_nested_array_of_structs() {
    let source = "struct Pair { u8 a; u8 b; }; Pair pairs[2] @ 0x00;";
    let (runtime, ok) = execute(source, vec![1, 2, 3, 4]);
    assert!(ok, "error: {:?}", runtime.get_error());

    let pattern = &runtime.get_patterns()[0];
    assert_eq!(pattern.size, 4);
    let PatternKind::DynamicArray { entries } = &pattern.kind else {
        panic!("expected a dynamic array of structs");
    };
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].offset, 2);
    let PatternKind::Struct { members } = &entries[1].kind else {
        panic!("expected struct entries");
    };
    assert_eq!(members[1].value, Some(Value::Unsigned(4)));
}
