//! Text IR parsing and printing, including allocated output.

use spillgen::core::AllocError;
use spillgen::ir::{interp, Location};
use spillgen::test_ir::{parse_function, parse_module};

const MODULE: &str = r#"
; two functions sharing nothing
func first {
entry: dispatch ^handler
    mov %a:i32, $-4
    cmp %f:flags, %a, $0x10
    j.l %f, ^done
body:
    mov [s0:i32], %a
    call $100
done:
    push %a
    ret
handler:
    ret
}

func second {
entry:
    mov %c:i8, $7
    mov cl, %c
    movsd %x:f64, [s1:f64]
    ret
}
"#;

#[test]
fn test_module_round_trip() {
    let funcs = parse_module(MODULE).unwrap();
    assert_eq!(funcs.len(), 2);
    assert_eq!(funcs[0].name, "first");
    assert_eq!(funcs[0].blocks.len(), 4);
    assert_eq!(funcs[0].blocks[0].dispatch, Some(3));

    for func in &funcs {
        let printed = func.to_string();
        let again = parse_function(&printed).unwrap();
        assert_eq!(again.to_string(), printed);
    }
}

#[test]
fn test_printed_form() {
    let func = parse_module(MODULE).unwrap().remove(1);
    assert_eq!(
        func.to_string(),
        "func second {\n\
         entry:\n\
         \x20   mov %c:i8, $7\n\
         \x20   mov cl, %c:i8\n\
         \x20   movsd %x:f64, [s1:f64]\n\
         \x20   ret\n\
         }\n"
    );
}

#[test]
fn test_slots_and_registers_are_shared() {
    let func = parse_function(
        r#"
        func shared {
        entry:
            mov eax, $1
            mov [s2:i32], eax
            push [s2:i32]
            ret
        }
        "#,
    )
    .unwrap();
    let insts = &func.blocks[0].insts;
    let eax = func.insts[insts[0]].opnds[0];
    assert_eq!(func.insts[insts[1]].opnds[1], eax);
    let slot = func.insts[insts[1]].opnds[0];
    assert!(matches!(func.operands[slot].loc, Location::Mem(_)));
    assert_eq!(interp::run(&func).unwrap().trace, vec![1]);
}

#[test]
fn test_rejects_malformed_input() {
    let cases = [
        "func f {\nentry:\n    frob %a:i32\n    ret\n}\n",
        "func f {\nentry:\n    push %a\n    ret\n}\n",
        "func f {\nentry:\n    push r9\n    ret\n}\n",
        "func f {\nentry:\n    jmp ^nowhere\n}\n",
        "func f {\nentry:\n    ret\n",
    ];
    for text in cases {
        let err = parse_function(text).unwrap_err();
        assert!(matches!(err, AllocError::Parse { .. }), "{text}: {err}");
    }
}

#[test]
fn test_parse_function_wants_exactly_one() {
    let err = parse_function(MODULE).unwrap_err();
    assert!(matches!(err, AllocError::Parse { line: 1, .. }));
}
