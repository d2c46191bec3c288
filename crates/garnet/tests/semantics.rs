//! End-to-end behavior: compile syntax trees and run them on a fresh VM.

use garnet::ast::build::*;
use garnet::ast::{Node, Params};
use garnet::{EvalError, Signal, Value, VmConfig, VmError};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn eval(program: Node) -> garnet::Evaluation {
    init();
    garnet::eval(&program).unwrap_or_else(|e| panic!("eval failed: {}", e))
}

fn value(program: Node) -> Value {
    eval(program).value
}

fn error(program: Node) -> EvalError {
    init();
    garnet::eval(&program).expect_err("expected an error")
}

/// `receiver.inspect`, rendered through the runtime.
fn inspected(program: Node) -> String {
    match value(call(program, "inspect", vec![])) {
        Value::String(s) => s.to_string(),
        other => panic!("inspect returned {:?}", other),
    }
}

fn syms(names: &[&str]) -> Value {
    Value::array(names.iter().map(|n| Value::symbol(n)).collect())
}

fn push(list: &str, item: Node) -> Node {
    call(vcall(list), "<<", vec![item])
}

// ===========================================================================
// Dispatch
// ===========================================================================

#[test]
fn test_super_skips_classes_without_definition() {
    let program = body(vec![
        class("A", None, vec![def("foo", params(&[]), vec![string("A#foo")])]),
        class("B", Some(const_ref("A")), vec![]),
        class(
            "C",
            Some(const_ref("B")),
            vec![def(
                "foo",
                params(&[]),
                vec![call(
                    array(vec![zsuper(), string("C#foo")]),
                    "join",
                    vec![string(",")],
                )],
            )],
        ),
        call(call(const_ref("C"), "new", vec![]), "foo", vec![]),
    ]);
    assert_eq!(value(program), Value::string("A#foo,C#foo"));
}

#[test]
fn test_super_walks_through_included_module() {
    let program = body(vec![
        class("Base", None, vec![def("name", params(&[]), vec![string("Base")])]),
        module(
            "Tagged",
            vec![def(
                "name",
                params(&[]),
                vec![call(string("Tagged>"), "+", vec![zsuper()])],
            )],
        ),
        class(
            "Leaf",
            Some(const_ref("Base")),
            vec![
                fcall("include", vec![const_ref("Tagged")]),
                def(
                    "name",
                    params(&[]),
                    vec![call(string("Leaf>"), "+", vec![zsuper()])],
                ),
            ],
        ),
        call(call(const_ref("Leaf"), "new", vec![]), "name", vec![]),
    ]);
    assert_eq!(value(program), Value::string("Leaf>Tagged>Base"));
}

#[test]
fn test_zsuper_forwards_arguments() {
    let program = body(vec![
        class(
            "Adder",
            None,
            vec![def(
                "add",
                params(&["a", "b"]),
                vec![call(vcall("a"), "+", vec![vcall("b")])],
            )],
        ),
        class(
            "Doubler",
            Some(const_ref("Adder")),
            vec![def(
                "add",
                params(&["a", "b"]),
                vec![call(zsuper(), "*", vec![int(2)])],
            )],
        ),
        call(
            call(const_ref("Doubler"), "new", vec![]),
            "add",
            vec![int(3), int(4)],
        ),
    ]);
    assert_eq!(value(program), Value::Integer(14));
}

#[test]
fn test_double_include_keeps_ancestors() {
    let program = body(vec![
        module("M", vec![]),
        class(
            "C",
            None,
            vec![
                fcall("include", vec![const_ref("M")]),
                fcall("include", vec![const_ref("M")]),
            ],
        ),
        const_ref("C"),
    ]);
    assert_eq!(
        inspected(call(program, "ancestors", vec![])),
        "[C, M, Object, Kernel, BasicObject]"
    );
}

#[test]
fn test_undefined_method_carries_selector() {
    let program = begin(
        vec![call(int(5), "frobnicate", vec![])],
        vec![rescue(
            vec![const_ref("NoMethodError")],
            Some("e"),
            vec![call(vcall("e"), "name", vec![])],
        )],
        None,
        None,
    );
    assert_eq!(value(program), Value::symbol("frobnicate"));
}

#[test]
fn test_method_missing_override() {
    let program = body(vec![
        class(
            "Ghost",
            None,
            vec![def(
                "method_missing",
                Params {
                    required: vec!["name".to_string()],
                    rest: Some("args".to_string()),
                    ..Params::default()
                },
                vec![array(vec![vcall("name"), vcall("args")])],
            )],
        ),
        call(call(const_ref("Ghost"), "new", vec![]), "boo", vec![int(1)]),
    ]);
    assert_eq!(
        value(program),
        Value::array(vec![Value::symbol("boo"), Value::array(vec![Value::Integer(1)])])
    );
}

#[test]
fn test_singleton_and_class_methods() {
    let program = body(vec![
        class(
            "Factory",
            None,
            vec![
                defs(Node::SelfRef, "make", params(&[]), vec![vcall("new")]),
                sclass(
                    Node::SelfRef,
                    vec![def("label", params(&[]), vec![string("factory")])],
                ),
            ],
        ),
        array(vec![
            call(const_ref("Factory"), "label", vec![]),
            call(
                call(call(const_ref("Factory"), "make", vec![]), "class", vec![]),
                "name",
                vec![],
            ),
        ]),
    ]);
    assert_eq!(
        value(program),
        Value::array(vec![Value::string("factory"), Value::string("Factory")])
    );
}

#[test]
fn test_lexical_constant_lookup() {
    let program = body(vec![
        module(
            "Outer",
            vec![
                casgn(cpath(&["LIMIT"]), int(7)),
                class(
                    "Inner",
                    None,
                    vec![def("limit", params(&[]), vec![const_ref("LIMIT")])],
                ),
            ],
        ),
        call(
            call(const_path(&["Outer", "Inner"]), "new", vec![]),
            "limit",
            vec![],
        ),
    ]);
    assert_eq!(value(program), Value::Integer(7));
}

#[test]
fn test_uninitialized_constant() {
    let err = error(const_ref("Missing"));
    assert_eq!(
        err.to_string(),
        "runtime error: uncaught NameError: uninitialized constant Missing"
    );
}

#[test]
fn test_superclass_mismatch() {
    let program = body(vec![
        class("A", None, vec![]),
        class("A", Some(const_ref("String")), vec![]),
    ]);
    let err = error(program);
    assert!(err.to_string().contains("superclass mismatch for class A"));
}

// ===========================================================================
// Exceptions
// ===========================================================================

#[test]
fn test_ensure_runs_once_when_rescued() {
    let program = body(vec![
        lasgn("log", array(vec![])),
        begin(
            vec![begin(
                vec![fcall("raise", vec![string("boom")])],
                vec![],
                None,
                Some(vec![push("log", sym("ensure"))]),
            )],
            vec![rescue(vec![], None, vec![push("log", sym("rescued"))])],
            None,
            None,
        ),
        vcall("log"),
    ]);
    assert_eq!(value(program), syms(&["ensure", "rescued"]));
}

#[test]
fn test_ensure_runs_once_on_normal_exit() {
    let program = body(vec![
        lasgn("log", array(vec![])),
        lasgn(
            "result",
            begin(
                vec![push("log", sym("body")), int(1)],
                vec![],
                None,
                Some(vec![push("log", sym("ensure")), int(2)]),
            ),
        ),
        array(vec![vcall("result"), vcall("log")]),
    ]);
    assert_eq!(
        value(program),
        Value::array(vec![Value::Integer(1), syms(&["body", "ensure"])])
    );
}

#[test]
fn test_ensure_runs_once_when_escaping() {
    let program = body(vec![
        def(
            "risky",
            params(&["log"]),
            vec![begin(
                vec![fcall("raise", vec![string("boom")])],
                vec![],
                None,
                Some(vec![push("log", sym("ensure"))]),
            )],
        ),
        lasgn("log", array(vec![])),
        begin(
            vec![fcall("risky", vec![vcall("log")])],
            vec![rescue(vec![], None, vec![push("log", sym("rescued"))])],
            None,
            None,
        ),
        vcall("log"),
    ]);
    assert_eq!(value(program), syms(&["ensure", "rescued"]));
}

#[test]
fn test_unrescued_error_escapes() {
    let err = error(begin(
        vec![fcall("raise", vec![string("boom")])],
        vec![],
        None,
        Some(vec![int(1)]),
    ));
    assert_eq!(err.to_string(), "runtime error: uncaught RuntimeError: boom");
}

#[test]
fn test_ensure_runs_on_return() {
    let program = body(vec![
        def(
            "guarded",
            params(&["log"]),
            vec![begin(
                vec![ret(Some(int(1)))],
                vec![],
                None,
                Some(vec![push("log", sym("ensure"))]),
            )],
        ),
        lasgn("log", array(vec![])),
        array(vec![fcall("guarded", vec![vcall("log")]), vcall("log")]),
    ]);
    assert_eq!(
        value(program),
        Value::array(vec![Value::Integer(1), syms(&["ensure"])])
    );
}

#[test]
fn test_rescue_else_runs_without_exception() {
    let program = begin(
        vec![int(1)],
        vec![rescue(vec![], None, vec![int(2)])],
        Some(vec![int(3)]),
        None,
    );
    assert_eq!(value(program), Value::Integer(3));
}

#[test]
fn test_error_in_else_skips_sibling_rescue() {
    let program = body(vec![
        lasgn("log", array(vec![])),
        begin(
            vec![begin(
                vec![int(1)],
                vec![rescue(vec![], None, vec![push("log", sym("rescued"))])],
                Some(vec![fcall("raise", vec![string("from else")])]),
                Some(vec![push("log", sym("ensure"))]),
            )],
            vec![rescue(vec![], None, vec![push("log", sym("outer"))])],
            None,
            None,
        ),
        vcall("log"),
    ]);
    assert_eq!(value(program), syms(&["ensure", "outer"]));
}

#[test]
fn test_abandoned_ensure_handler_does_not_replace_pending_return() {
    // The inner handler's stashed exception is dropped when its own raise
    // is rescued; the outer handler then resumes the pending return.
    let inner = begin(
        vec![begin(
            vec![fcall("raise", vec![string("inner")])],
            vec![],
            None,
            Some(vec![fcall("raise", vec![string("from ensure")])]),
        )],
        vec![rescue(vec![], None, vec![push("log", sym("rescued"))])],
        None,
        None,
    );
    let program = body(vec![
        def(
            "guarded",
            params(&["log"]),
            vec![begin(vec![ret(Some(sym("body")))], vec![], None, Some(vec![inner]))],
        ),
        lasgn("log", array(vec![])),
        array(vec![fcall("guarded", vec![vcall("log")]), vcall("log")]),
    ]);
    assert_eq!(
        value(program),
        Value::array(vec![Value::symbol("body"), syms(&["rescued"])])
    );
}

#[test]
fn test_retry_through_ensure_handler() {
    let program = body(vec![
        lasgn("attempts", int(0)),
        lasgn("log", array(vec![])),
        begin(
            vec![begin(
                vec![
                    lasgn("attempts", call(vcall("attempts"), "+", vec![int(1)])),
                    fcall("raise", vec![string("body")]),
                ],
                vec![],
                None,
                Some(vec![
                    push("log", vcall("attempts")),
                    if_else(
                        call(vcall("attempts"), "<", vec![int(3)]),
                        vec![fcall("raise", vec![string("ensure")])],
                        None,
                    ),
                ]),
            )],
            vec![rescue(
                vec![],
                Some("e"),
                vec![if_else(
                    call(vcall("attempts"), "<", vec![int(3)]),
                    vec![Node::Retry],
                    Some(vec![call(vcall("e"), "message", vec![])]),
                )],
            )],
            None,
            None,
        ),
    ]);
    assert_eq!(
        eval(body(vec![program, vcall("log")])).value,
        Value::array(vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)])
    );
}

#[test]
fn test_rescue_matches_superclass() {
    let program = body(vec![
        class("AppError", Some(const_ref("StandardError")), vec![]),
        class("DbError", Some(const_ref("AppError")), vec![]),
        begin(
            vec![fcall("raise", vec![const_ref("DbError"), string("down")])],
            vec![rescue(
                vec![const_ref("AppError")],
                Some("e"),
                vec![call(vcall("e"), "message", vec![])],
            )],
            None,
            None,
        ),
    ]);
    assert_eq!(value(program), Value::string("down"));
}

#[test]
fn test_retry_reruns_protected_body() {
    let program = body(vec![
        lasgn("attempts", int(0)),
        begin(
            vec![
                lasgn("attempts", call(vcall("attempts"), "+", vec![int(1)])),
                if_else(
                    call(vcall("attempts"), "<", vec![int(3)]),
                    vec![fcall("raise", vec![string("again")])],
                    None,
                ),
                vcall("attempts"),
            ],
            vec![rescue(vec![], None, vec![Node::Retry])],
            None,
            None,
        ),
    ]);
    assert_eq!(value(program), Value::Integer(3));
}

// ===========================================================================
// Blocks
// ===========================================================================

#[test]
fn test_yield_and_block_locals() {
    let program = body(vec![
        def(
            "twice",
            params(&["x"]),
            vec![call(yield_(vec![vcall("x")]), "+", vec![yield_(vec![vcall("x")])])],
        ),
        lasgn("base", int(10)),
        with_block(
            fcall("twice", vec![int(1)]),
            params(&["n"]),
            vec![call(vcall("n"), "+", vec![vcall("base")])],
        ),
    ]);
    assert_eq!(value(program), Value::Integer(22));
}

#[test]
fn test_next_finishes_iteration() {
    let program = with_block(
        call(array(vec![int(1), int(2), int(3)]), "map", vec![]),
        params(&["x"]),
        vec![
            if_else(
                call(vcall("x"), "==", vec![int(2)]),
                vec![next(Some(int(0)))],
                None,
            ),
            call(vcall("x"), "*", vec![int(10)]),
        ],
    );
    assert_eq!(
        value(program),
        Value::array(vec![Value::Integer(10), Value::Integer(0), Value::Integer(30)])
    );
}

#[test]
fn test_redo_restarts_iteration() {
    let program = body(vec![
        lasgn("count", int(0)),
        with_block(
            call(array(vec![int(1)]), "each", vec![]),
            params(&["x"]),
            vec![
                lasgn("count", call(vcall("count"), "+", vec![int(1)])),
                if_else(
                    call(vcall("count"), "<", vec![int(3)]),
                    vec![Node::Redo],
                    None,
                ),
            ],
        ),
        vcall("count"),
    ]);
    assert_eq!(value(program), Value::Integer(3));
}

#[test]
fn test_break_out_of_loop() {
    let program = body(vec![
        lasgn("i", int(0)),
        with_block(
            fcall("loop", vec![]),
            Params::default(),
            vec![
                lasgn("i", call(vcall("i"), "+", vec![int(1)])),
                if_else(
                    call(vcall("i"), "==", vec![int(5)]),
                    vec![brk(Some(call(vcall("i"), "*", vec![int(2)])))],
                    None,
                ),
            ],
        ),
    ]);
    assert_eq!(value(program), Value::Integer(10));
}

#[test]
fn test_break_runs_ensure_inside_block() {
    let program = body(vec![
        lasgn("log", array(vec![])),
        lasgn(
            "found",
            with_block(
                call(array(vec![int(1), int(2)]), "each", vec![]),
                params(&["x"]),
                vec![begin(
                    vec![brk(Some(vcall("x")))],
                    vec![],
                    None,
                    Some(vec![push("log", sym("ensure"))]),
                )],
            ),
        ),
        array(vec![vcall("found"), vcall("log")]),
    ]);
    assert_eq!(
        value(program),
        Value::array(vec![Value::Integer(1), syms(&["ensure"])])
    );
}

#[test]
fn test_return_from_block_leaves_method() {
    let program = body(vec![
        def(
            "first_big",
            params(&["list"]),
            vec![
                with_block(
                    call(vcall("list"), "each", vec![]),
                    params(&["x"]),
                    vec![if_else(
                        call(vcall("x"), ">", vec![int(1)]),
                        vec![ret(Some(vcall("x")))],
                        None,
                    )],
                ),
                nil(),
            ],
        ),
        fcall("first_big", vec![array(vec![int(1), int(2), int(3)])]),
    ]);
    assert_eq!(value(program), Value::Integer(2));
}

#[test]
fn test_block_arg_passes_proc() {
    let program = body(vec![
        def(
            "apply",
            Params {
                required: vec!["x".to_string()],
                block: Some("blk".to_string()),
                ..Params::default()
            },
            vec![call(vcall("blk"), "call", vec![vcall("x")])],
        ),
        lasgn(
            "double",
            with_block(
                fcall("proc", vec![]),
                params(&["n"]),
                vec![call(vcall("n"), "*", vec![int(2)])],
            ),
        ),
        with_block_arg(fcall("apply", vec![int(21)]), vcall("double")),
    ]);
    assert_eq!(value(program), Value::Integer(42));
}

#[test]
fn test_orphan_break_is_uncaught() {
    let program = body(vec![
        def(
            "make",
            params(&[]),
            vec![with_block(
                fcall("proc", vec![]),
                Params::default(),
                vec![brk(Some(int(1)))],
            )],
        ),
        call(fcall("make", vec![]), "call", vec![]),
    ]);
    let err = error(program);
    assert!(matches!(
        err,
        EvalError::Runtime(VmError::Uncaught(Signal::Break { .. }))
    ));
}

// ===========================================================================
// Runtime limits and surfaces
// ===========================================================================

#[test]
fn test_stack_overflow() {
    init();
    let program = body(vec![
        def("down", params(&[]), vec![fcall("down", vec![])]),
        fcall("down", vec![]),
    ]);
    let config = VmConfig {
        max_frame_depth: 64,
        ..VmConfig::default()
    };
    let err = garnet::eval_with_config(&program, config).unwrap_err();
    assert!(matches!(err, EvalError::Runtime(VmError::StackOverflow)));
}

#[test]
fn test_puts_output_is_captured() {
    let result = eval(body(vec![
        with_block(
            call(int(3), "times", vec![]),
            params(&["i"]),
            vec![fcall("puts", vec![vcall("i")])],
        ),
        fcall("p", vec![string("done")]),
    ]));
    assert_eq!(result.output, "0\n1\n2\n\"done\"\n");
}

#[test]
fn test_eval_json_program() {
    init();
    let json = r#"{
        "type": "If",
        "branches": [{
            "condition": {"type": "False"},
            "body": {"stmts": [{"type": "Integer", "value": 1}]}
        }],
        "else_body": {"stmts": [{"type": "Str", "value": "else"}]}
    }"#;
    let result = garnet::eval_json(json).unwrap();
    assert_eq!(result.value, Value::string("else"));
}
