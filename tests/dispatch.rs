mod common;

use std::sync::Arc;

use common::{both_ways, read, run, run_with, Outcome};
use scmc::{
    compiler::{
        registry::Callable,
        scope::{visit_stmt, TemplateRef, VariableKind},
        sexpr::intern,
        tree_il::{Entry, Expr, Stmt, Type},
        Registry,
    },
    runtime::builtins::{Builtin, Overload},
    CompileOptions, Compiler, Environment, Machine, RuntimeError, Value,
};

fn known(compiler: &Compiler, name: &str) -> TemplateRef {
    match compiler.registry().known_procedure(intern(name)) {
        Some(known) => match known.callable {
            Callable::Fixed(t) | Callable::Variadic(t) => t,
            Callable::Overloads(_) => panic!("{} is an overload set", name),
        },
        None => panic!("{} is not a known procedure", name),
    }
}

fn last_expr(stmt: &Stmt) -> &Expr {
    match stmt {
        Stmt::Block(stmts) => last_expr(stmts.last().unwrap()),
        Stmt::Return(e) | Stmt::Expression(e) => e,
        Stmt::If(..) => panic!("unexpected conditional"),
    }
}

#[test]
fn known_procedures_match_generic_calls() {
    let program = r#"
        (define (square x) (* x x))
        (define (add3 a b c) (+ a (+ b c)))
        (define (sum . xs) (if (null? xs) 0 (+ (car xs) (apply sum (cdr xs)))))
        (define (pick v) (vector-ref v 1))
        (list (square 5) (add3 1 2 3) (sum) (sum 1 2 3 4) (pick #(a b c)))
    "#;
    let (optimized, generic) = both_ways(program);
    assert_eq!(optimized, "(25 6 0 10 b)");
    assert_eq!(optimized, generic);
}

#[test]
fn arguments_evaluate_left_to_right_once() {
    let program = r#"
        (define trace '())
        (define (note x) (set! trace (cons x trace)) x)
        (define (f a b c) (list a b c))
        (define r ((lambda () (f (note 1) (note 2) (note 3)))))
        (list r trace)
    "#;
    let (optimized, generic) = both_ways(program);
    assert_eq!(optimized, "((1 2 3) (3 2 1))");
    assert_eq!(optimized, generic);
}

#[test]
fn overload_set_selects_by_arity() {
    common::init_logging();
    let compiler = Compiler::new(CompileOptions::default());
    run_with(
        &compiler,
        &[r#"
            (define (one a) (list 'one a))
            (define (three a b c) (list 'three a b c))
            (define (var a b . rest) (list 'var a b rest))
        "#],
    )
    .unwrap();

    let registry = compiler.registry();
    let ov = intern("ov");
    registry.register_overload(ov, known(&compiler, "one"), 1, false).unwrap();
    registry.register_overload(ov, known(&compiler, "three"), 3, false).unwrap();
    registry.register_overload(ov, known(&compiler, "var"), 2, true).unwrap();

    let eval = |text: &str| run_with(&compiler, &[text]).map(|v| v.to_string());
    assert_eq!(eval("(ov 1 2)").unwrap(), "(var 1 2 ())");
    assert_eq!(eval("(ov 1)").unwrap(), "(one 1)");
    assert_eq!(eval("(ov 1 2 3)").unwrap(), "(three 1 2 3)");
    assert_eq!(eval("(ov 1 2 3 4)").unwrap(), "(var 1 2 (3 4))");
    assert!(matches!(
        eval("(ov)"),
        Err(Outcome::Runtime(RuntimeError::Unbound(_)))
    ));

    let err = registry
        .register_overload(ov, known(&compiler, "var"), 2, true)
        .unwrap_err();
    assert!(err.is_internal());
}

#[test]
fn inlining_twice_keeps_names_unique() {
    common::init_logging();
    let compiler = Compiler::new(CompileOptions::default());
    let value = run_with(
        &compiler,
        &[r#"
            (define (inc x) (+ x 1))
            (define (g y) (+ (inc y) (inc y)))
            (define (h y) (inc (inc y)))
            (list (g 5) (h 5))
        "#],
    )
    .unwrap();
    assert_eq!(value.to_string(), "(12 7)");

    for name in ["g", "h"] {
        let template = known(&compiler, name);
        let t = template.get();
        let names = t
            .parameters
            .iter()
            .chain(t.variables.iter())
            .map(|slot| slot.get().name)
            .collect::<Vec<_>>();
        assert_eq!(t.variables.len(), 2, "two inlined copies of inc in {}", name);
        for (i, a) in names.iter().enumerate() {
            assert_ne!(*a, intern("x"));
            for b in &names[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
    // The shared template itself is never consumed.
    assert!(!known(&compiler, "inc").get().inlined);
}

#[test]
fn captured_slots_give_the_receiver_a_heap_frame() {
    common::init_logging();
    let compiler = Compiler::new(CompileOptions::default());
    let value = run_with(
        &compiler,
        &[r#"
            (define (outer n) ((lambda (k) (lambda () k)) n))
            (define (plain n) ((lambda (k) (+ k 1)) n))
            (list ((outer 7)) (plain 7))
        "#],
    )
    .unwrap();
    assert_eq!(value.to_string(), "(7 8)");
    assert!(known(&compiler, "outer").get().has_heap_frame);
    assert!(!known(&compiler, "plain").get().has_heap_frame);
}

fn explode(_: &mut Machine, args: &[Value]) -> Result<Value, RuntimeError> {
    match &args[0] {
        Value::Fixnum(0) => panic!("explode called with zero"),
        Value::Fixnum(n) => Ok(Value::Fixnum(n * 2)),
        other => Err(RuntimeError::wrong_type("explode", "fixnum", other)),
    }
}

#[test]
fn failed_folds_compile_to_real_calls() {
    common::init_logging();
    let compiler = Compiler::new(CompileOptions::default());
    compiler.env().define_builtin(Arc::new(Builtin::new(
        "explode",
        true,
        vec![Overload::new(&[Type::Integer], None, Type::Integer, explode)],
    )));

    let (forms, source) = read("(explode 21)");
    let unit = compiler.compile_unit(&forms, &source).unwrap();
    assert!(matches!(last_expr(&unit.body), Expr::Constant(_)));

    let (forms, source) = read("(explode 0)");
    let unit = compiler.compile_unit(&forms, &source).unwrap();
    assert!(matches!(last_expr(&unit.body), Expr::Native(_)));

    let (forms, source) = read("(/ 1 0)");
    let unit = compiler.compile_unit(&forms, &source).unwrap();
    assert!(matches!(last_expr(&unit.body), Expr::Native(_)));
    let result = Machine::new(compiler.env().clone()).run_unit(&unit);
    assert!(matches!(result, Err(RuntimeError::DivisionByZero)));
}

#[test]
fn runaway_folds_are_bounded_by_fuel() {
    common::init_logging();
    let compiler = Compiler::new(CompileOptions::default().with_fold_fuel(200));
    let value = run_with(
        &compiler,
        &[r#"
            (define (count n) (if (= n 0) 'done (count (- n 1))))
            (count 100)
        "#],
    )
    .unwrap();
    assert_eq!(value.to_string(), "done");

    compiler.registry().set_allow_constant_fold(intern("count"), true);
    let (forms, source) = read("(count 100)");
    let unit = compiler.compile_unit(&forms, &source).unwrap();
    assert!(matches!(last_expr(&unit.body), Expr::Invoke(_)));

    let (forms, source) = read("(count 3)");
    let unit = compiler.compile_unit(&forms, &source).unwrap();
    assert!(matches!(last_expr(&unit.body), Expr::Constant(_)));
}

#[test]
fn multiple_values_rewrite_matches_generic() {
    let program = r#"
        (define (mv0) (call-with-values (lambda () (values)) (lambda () 'none)))
        (define (mv1) (call-with-values (lambda () 5) (lambda (x) (list x))))
        (define (mv3) (call-with-values (lambda () (values 1 2 3)) (lambda (a b c) (list c b a))))
        (define (opaque) (call-with-values producer (lambda (a b) (+ a b))))
        (define (producer) (values 10 20))
        (list (mv0) (mv1) (mv3) (opaque))
    "#;
    let (optimized, generic) = both_ways(program);
    assert_eq!(optimized, "(none (5) (3 2 1) 30)");
    assert_eq!(optimized, generic);

    let compiler = Compiler::new(CompileOptions::default());
    run_with(&compiler, &[program]).unwrap();
    let temporaries = |name: &str| {
        known(&compiler, name)
            .get()
            .variables
            .iter()
            .filter(|slot| slot.get().kind == VariableKind::Temporary)
            .count()
    };
    assert_eq!(temporaries("mv0"), 0);
    assert_eq!(temporaries("mv1"), 0);
    assert_eq!(temporaries("mv3"), 1);
    assert_eq!(temporaries("opaque"), 1);
}

#[test]
fn zero_arity_consumer_still_runs_the_producer() {
    let program = r#"
        (define n 0)
        (define (bump!) (set! n (+ n 1)) n)
        (define (literal) (call-with-values (lambda () (set! n (+ n 1)) (values)) (lambda () 'none)))
        (define (opaque) (call-with-values bump! (lambda () 'none)))
        (list (literal) n (opaque) n)
    "#;
    let (optimized, generic) = both_ways(program);
    assert_eq!(optimized, "(none 1 none 2)");
    assert_eq!(optimized, generic);

    let compiler = Compiler::new(CompileOptions::default());
    run_with(&compiler, &[program]).unwrap();
    let generic_calls = |name: &str| {
        let template = known(&compiler, name);
        let t = template.get();
        let mut calls = 0;
        if let Some(body) = &t.body {
            visit_stmt(body, &mut |e: &Expr| {
                if matches!(e, Expr::Call(_)) {
                    calls += 1;
                }
                true
            });
        }
        calls
    };
    assert_eq!(generic_calls("literal"), 0);
    assert_eq!(generic_calls("opaque"), 1);
}

#[test]
fn redefinition_is_never_bound_early() {
    let program = r#"
        (define (f) 1)
        (define (use) (f))
        (define (f) 2)
        (use)
    "#;
    let (optimized, generic) = both_ways(program);
    assert_eq!(optimized, "2");
    assert_eq!(optimized, generic);

    common::init_logging();
    let compiler = Compiler::new(CompileOptions::default());
    let value = run_with(
        &compiler,
        &["(define (g) 1)", "(define (g) 2) (define (call-g) (g)) (call-g)"],
    )
    .unwrap();
    assert_eq!(value.to_string(), "2");
    assert!(compiler.registry().is_assigned(intern("g")));
    assert!(compiler.registry().known_procedure(intern("g")).is_none());
}

#[test]
fn folding_never_leaks_global_writes() {
    common::init_logging();
    let compiler = Compiler::new(CompileOptions::default());
    run_with(
        &compiler,
        &[r#"
        (define counter 0)
        (define (bump n) (set! counter (+ counter 1)) (car n))
        (define (tick n) (set! counter (+ counter 1)) n)
    "#],
    )
    .unwrap();
    let counter = || {
        compiler
            .env()
            .lookup(intern("counter"))
            .map(|binding| binding.value().to_string())
    };
    compiler.registry().set_allow_constant_fold(intern("bump"), true);
    compiler.registry().set_allow_constant_fold(intern("tick"), true);

    let (forms, source) = read("(bump 5)");
    let unit = compiler.compile_unit(&forms, &source).unwrap();
    assert_eq!(counter().as_deref(), Some("0"));
    let result = Machine::new(compiler.env().clone()).run_unit(&unit);
    assert!(matches!(result, Err(RuntimeError::WrongType { .. })));
    assert_eq!(counter().as_deref(), Some("1"));

    let (forms, source) = read("(tick 7)");
    let unit = compiler.compile_unit(&forms, &source).unwrap();
    assert!(matches!(last_expr(&unit.body), Expr::Invoke(_)));
    assert_eq!(counter().as_deref(), Some("1"));
    let value = Machine::new(compiler.env().clone()).run_unit(&unit).unwrap();
    assert_eq!(value.to_string(), "7");
    assert_eq!(counter().as_deref(), Some("2"));
}

#[test]
fn unassigned_local_does_not_hide_builtin() {
    let program = r#"
        (define (apply-it car) (car '(1 2)))
        (apply-it cdr)
    "#;
    let (optimized, generic) = both_ways(program);
    assert_eq!(optimized, "1");
    assert_eq!(generic, "(2)");
}

#[test]
fn assigned_local_forces_generic_call() {
    let program = r#"
        (define (g car) (set! car cdr) (car '(1 2)))
        (g car)
    "#;
    let (optimized, generic) = both_ways(program);
    assert_eq!(optimized, "(2)");
    assert_eq!(optimized, generic);
}

#[test]
fn user_definitions_hide_builtins() {
    let program = r#"
        (define (not x) 'shadowed)
        (define (null? x) 'mine)
        (list (not #f) (null? '()))
    "#;
    let (optimized, generic) = both_ways(program);
    assert_eq!(optimized, "(shadowed mine)");
    assert_eq!(optimized, generic);
}

#[test]
fn long_argument_lists_are_packed() {
    common::init_logging();
    let compiler = Compiler::new(CompileOptions::default());
    let (forms, source) = read(
        r#"
        (define (nine a b c d e f g h i) (list a i))
        (nine 1 2 3 4 5 6 7 8 9)
    "#,
    );
    let unit = compiler.compile_unit(&forms, &source).unwrap();
    let Expr::Invoke(invoke) = last_expr(&unit.body) else {
        panic!("expected a direct invocation");
    };
    assert_eq!(invoke.entry, Entry::Packed);
    let value = Machine::new(compiler.env().clone()).run_unit(&unit).unwrap();
    assert_eq!(value.to_string(), "(1 9)");

    let (optimized, generic) = both_ways(
        r#"
        (define (nine a b c d e f g h i) (list a i))
        ((lambda () (nine 1 2 3 4 5 6 7 8 9)))
    "#,
    );
    assert_eq!(optimized, "(1 9)");
    assert_eq!(optimized, generic);
}

#[test]
fn uninitialized_marker_reaches_parameter() {
    common::init_logging();
    let compiler = Compiler::new(CompileOptions::default());
    let (forms, source) = read(
        r#"
        (define (h x y) y)
        (h 1 uninitialized)
    "#,
    );
    compiler.compile_unit(&forms, &source).unwrap();
    let template = known(&compiler, "h");
    let t = template.get();
    assert!(!t.parameters[0].get().uninitialized);
    assert!(t.parameters[1].get().uninitialized);
}

#[test]
fn immediate_application_respects_depth_limit() {
    let program = "((lambda (x y) (list y x)) 1 2)";
    let shallow = run(CompileOptions::default().with_max_inline_depth(0), program).unwrap();
    assert_eq!(shallow.to_string(), "(2 1)");
    let (optimized, generic) = both_ways(&format!("((lambda () {}))", program));
    assert_eq!(optimized, "(2 1)");
    assert_eq!(optimized, generic);
}

#[test]
fn assignment_later_in_unit_revokes_known_binding() {
    let program = r#"
        (define (f) 1)
        (define (use) (f))
        (set! f (lambda () 2))
        (use)
    "#;
    let (optimized, generic) = both_ways(program);
    assert_eq!(optimized, "2");
    assert_eq!(optimized, generic);
}

#[test]
fn shared_state_across_threads() {
    common::init_logging();
    let registry = Arc::new(Registry::with_defaults());
    let env = Arc::new(Environment::standard());

    std::thread::scope(|s| {
        let handles = (1..=4)
            .map(|n| {
                let registry = registry.clone();
                let env = env.clone();
                s.spawn(move || {
                    let compiler =
                        Compiler::with_shared(CompileOptions::default(), registry, env);
                    let text = format!("(define (times{n} x) (* x {n})) (times{n} 2)");
                    run_with(&compiler, &[text.as_str()]).unwrap().to_string()
                })
            })
            .collect::<Vec<_>>();
        for (n, handle) in (1..=4).zip(handles) {
            assert_eq!(handle.join().unwrap(), (2 * n).to_string());
        }
    });

    for n in 1..=4 {
        assert!(registry
            .known_procedure(intern(&format!("times{}", n)))
            .is_some());
    }
}
