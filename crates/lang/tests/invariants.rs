//! Property-style invariant tests
//!
//! These hold for every accepted program: deterministic output,
//! containment and non-overlap of the produced tree, limit enforcement
//! without partial results, prompt cooperative abort, and idempotent
//! preprocessing under `#pragma once`.

use patl::evaluator::{DangerousFunctionPermission, Evaluator, RuntimeSettings};
use patl::{
    LogConsole, Lexer, MemoryProvider, Parser, Pattern, PatternKind, PatternLanguage,
    Preprocessor, Value,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

fn execute(source: &str, data: Vec<u8>) -> (PatternLanguage, bool) {
    let mut runtime = PatternLanguage::new();
    let provider = MemoryProvider::new(data);
    let ok = runtime.execute_string(&provider, source, BTreeMap::new(), BTreeMap::new(), true);
    (runtime, ok)
}

fn walk(pattern: &Pattern, visit: &mut impl FnMut(&Pattern)) {
    visit(pattern);
    for child in pattern.children() {
        walk(child, visit);
    }
}

const NESTED_SOURCE: &str = "\
    enum Kind : u8 { Empty, Data };\n\
    bitfield Flags { a : 3; b : 5; };\n\
    struct Item { u8 len; u8 body[2]; };\n\
    struct File { Kind kind; Flags flags; Item items[2]; u16 tail; };\n\
    File f @ 0x00;";

const NESTED_DATA: &[u8] = &[1, 0xC7, 2, 9, 8, 3, 7, 6, 0xAA, 0xBB];

#[test]
fn test_deterministic_output() {
    let (first, ok1) = execute(NESTED_SOURCE, NESTED_DATA.to_vec());
    let (second, ok2) = execute(NESTED_SOURCE, NESTED_DATA.to_vec());
    assert!(ok1 && ok2);
    assert_eq!(first.get_patterns(), second.get_patterns());
    assert_eq!(first.get_out_variables(), second.get_out_variables());
}

#[test]
fn test_endianness_round_trip() {
    let data = vec![0x11, 0x22, 0x33, 0x44];
    let (le, ok) = execute("le u32 v @ 0;", data.clone());
    assert!(ok);
    assert_eq!(
        le.get_patterns()[0].value,
        Some(Value::Unsigned(u128::from(u32::from_le_bytes([
            0x11, 0x22, 0x33, 0x44
        ]))))
    );

    let (be, ok) = execute("be u32 v @ 0;", data);
    assert!(ok);
    assert_eq!(
        be.get_patterns()[0].value,
        Some(Value::Unsigned(u128::from(u32::from_be_bytes([
            0x11, 0x22, 0x33, 0x44
        ]))))
    );
}

#[test]
fn test_containment() {
    let (runtime, ok) = execute(NESTED_SOURCE, NESTED_DATA.to_vec());
    assert!(ok, "error: {:?}", runtime.get_error());

    for root in runtime.get_patterns() {
        let mut check = |parent: &Pattern| {
            // Pointees live outside their pointer's extent by design.
            if matches!(parent.kind, PatternKind::Pointer { .. }) {
                return;
            }
            for child in parent.children() {
                assert!(
                    parent.offset <= child.offset
                        && child.offset + child.size <= parent.offset + parent.size,
                    "child '{}' [{}, {}) escapes parent '{}' [{}, {})",
                    child.name,
                    child.offset,
                    child.offset + child.size,
                    parent.name,
                    parent.offset,
                    parent.offset + parent.size,
                );
            }
        };
        walk(root, &mut check);
    }
}

#[test]
fn test_struct_members_do_not_overlap() {
    let (runtime, ok) = execute(NESTED_SOURCE, NESTED_DATA.to_vec());
    assert!(ok);

    for root in runtime.get_patterns() {
        let mut check = |pattern: &Pattern| {
            if let PatternKind::Struct { members } = &pattern.kind {
                for (i, a) in members.iter().enumerate() {
                    for b in members.iter().skip(i + 1) {
                        let disjoint =
                            a.offset + a.size <= b.offset || b.offset + b.size <= a.offset;
                        assert!(
                            disjoint,
                            "members '{}' and '{}' overlap in '{}'",
                            a.name, b.name, pattern.name
                        );
                    }
                }
            }
        };
        walk(root, &mut check);
    }
}

#[test]
fn test_union_member_offsets_coincide() {
    let (runtime, ok) = execute(
        "union U { u8 a; u16 b; u32 c; }; U u @ 0x00;",
        vec![0; 4],
    );
    assert!(ok);

    let PatternKind::Union { members } = &runtime.get_patterns()[0].kind else {
        panic!("expected a union");
    };
    assert!(members.iter().all(|m| m.offset == 0));
}

#[test]
fn test_bitfield_totality() {
    let (runtime, ok) = execute(
        "bitfield F { a : 3; b : 7; padding : 2; c : 4; }; F f @ 0x00;",
        vec![0xFF, 0xFF],
    );
    assert!(ok);

    let container = &runtime.get_patterns()[0];
    let PatternKind::Bitfield { fields } = &container.kind else {
        panic!("expected a bitfield");
    };

    let mut ranges = Vec::new();
    for field in fields {
        let PatternKind::BitfieldField {
            bit_offset,
            bit_size,
            ..
        } = &field.kind
        else {
            panic!("expected bitfield fields");
        };
        assert!(u64::from(bit_offset + bit_size) <= 8 * container.size);
        ranges.push((*bit_offset, bit_offset + bit_size));
    }
    for (i, a) in ranges.iter().enumerate() {
        for b in ranges.iter().skip(i + 1) {
            assert!(a.1 <= b.0 || b.1 <= a.0, "bit ranges overlap: {:?} {:?}", a, b);
        }
    }
}

#[test]
fn test_pattern_limit_honesty() {
    let source = "#pragma pattern_limit 3\nstruct S { u8 a; u8 b; }; S items[4] @ 0x00;";
    let (runtime, ok) = execute(source, vec![0; 8]);
    assert!(!ok);
    assert!(
        runtime
            .get_error()
            .unwrap()
            .message
            .contains("exceeded maximum number of patterns")
    );
    // No partial tree leaks.
    assert!(runtime.get_patterns().is_empty());
}

#[test]
fn test_array_limit() {
    let (runtime, ok) = execute("#pragma array_limit 2\nu8 a[5] @ 0x00;", vec![0; 8]);
    assert!(!ok);
    assert!(
        runtime
            .get_error()
            .unwrap()
            .message
            .contains("array grew past set limit")
    );
}

#[test]
fn test_loop_limit() {
    let source = "#pragma loop_limit 4\nfn main() { u32 i = 0; while (true) { i = i + 1; } return 0; };";
    let (runtime, ok) = execute(source, vec![]);
    assert!(!ok);
    assert!(
        runtime
            .get_error()
            .unwrap()
            .message
            .contains("loop iterations exceeded set limit")
    );
}

#[test]
fn test_evaluation_depth_limit() {
    let (runtime, ok) = execute("struct R { R inner; }; R r @ 0x00;", vec![0; 4]);
    assert!(!ok);
    assert!(
        runtime
            .get_error()
            .unwrap()
            .message
            .contains("evaluation depth exceeded set limit")
    );
}

#[test]
fn test_abort_promptness() {
    let tokens = Lexer::new().lex("u8 a @ 0x00;").unwrap();
    let program = Parser::new().parse(tokens).unwrap();

    let provider = MemoryProvider::new(vec![0]);
    let registry = patl::FunctionRegistry::with_builtins();
    let mut console = LogConsole::new();
    let abort_flag = Arc::new(AtomicBool::new(true));

    let mut evaluator = Evaluator::new(
        &provider,
        &registry,
        &mut console,
        RuntimeSettings::default(),
        abort_flag,
        DangerousFunctionPermission::Ask,
    );
    let error = evaluator
        .evaluate(&program, BTreeMap::new(), BTreeMap::new())
        .unwrap_err();
    assert!(error.message.contains("evaluation aborted by user"));
}

#[test]
fn test_pragma_once_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("shared.pat"),
        "#pragma once\nstruct Shared { u8 v; };\n",
    )
    .unwrap();

    let once = "#include \"shared.pat\"\nShared s @ 0x00;";
    let twice = "#include \"shared.pat\"\n#include \"shared.pat\"\nShared s @ 0x00;";

    let mut settings = RuntimeSettings::default();
    let mut preprocessor = Preprocessor::new();
    preprocessor.add_include_path(dir.path());
    let expanded_once = preprocessor.preprocess(once, &mut settings, true).unwrap();

    let mut preprocessor = Preprocessor::new();
    preprocessor.add_include_path(dir.path());
    let expanded_twice = preprocessor.preprocess(twice, &mut settings, true).unwrap();

    // Token streams are identical; whitespace may differ.
    let tokens_once: Vec<_> = Lexer::new()
        .lex(&expanded_once)
        .unwrap()
        .into_iter()
        .map(|t| t.kind)
        .collect();
    let tokens_twice: Vec<_> = Lexer::new()
        .lex(&expanded_twice)
        .unwrap()
        .into_iter()
        .map(|t| t.kind)
        .collect();
    assert_eq!(tokens_once, tokens_twice);
}

#[test]
fn test_clone_preserves_structural_equality() {
    let (runtime, ok) = execute(NESTED_SOURCE, NESTED_DATA.to_vec());
    assert!(ok);
    let original = &runtime.get_patterns()[0];
    let cloned = original.clone();
    assert_eq!(original, &cloned);
}
