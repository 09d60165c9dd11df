//! Integration vectors: end-to-end scenarios across the spec algebra,
//! registry, sequence regexes, and generators.
//!
//! The registry and config are process-wide, so every test serializes on a
//! local guard before touching them.

use std::sync::{Mutex, MutexGuard, OnceLock};

use conformal_kernel::{
    alt, and, and_keys, cat, coll_of, conform, def, every, exercise, explain_data, explain_str,
    float_in, gen, keys, kw, merge, nilable, or, qkw, reset_registry, spec, tuple, unform, valid,
    zero_or_more, zero_or_one, EveryOpts, Keyword, Overrides, PathSeg, Pred, ReChild, SpecRef,
    Value, ValueKind,
};

fn guard() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

fn number() -> Pred {
    Pred::func("number?", |v| {
        Ok(matches!(v, Value::Int(_) | Value::Float(_)))
    })
}

fn kmap(entries: Vec<(Keyword, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (Value::Keyword(k), v))
            .collect(),
    )
}

#[test]
fn ingredient_cat_conforms_and_reports_the_unit_slot() {
    let _g = guard();
    let ingredient = || {
        cat(vec![
            (kw("qty"), ReChild::from(number())),
            (kw("unit"), ReChild::from(ValueKind::Keyword)),
        ])
    };

    // A keyword unit conforms to a keyed map.
    let good = Value::vector([Value::from(2), Value::from(kw("teaspoon"))]);
    assert_eq!(
        conform(ingredient(), &good).unwrap(),
        kmap(vec![
            (kw("qty"), Value::from(2)),
            (kw("unit"), Value::from(kw("teaspoon"))),
        ])
    );

    // The string literal is not a keyword: one problem at [:unit].
    let bad = Value::vector([Value::from(2), Value::from("teaspoon")]);
    assert!(conform(ingredient(), &bad).unwrap().is_invalid());
    let expl = explain_data(ingredient(), &bad).unwrap().expect("explanation");
    assert_eq!(expl.problems.len(), 1);
    assert_eq!(expl.problems[0].path, vec![PathSeg::Key(kw("unit"))]);
    assert_eq!(expl.problems[0].val, Value::from("teaspoon"));
    assert_eq!(expl.problems[0].pred, "keyword");
}

#[test]
fn or_tags_branches_and_reports_both_on_failure() {
    let _g = guard();
    let name_or_id = || {
        or(vec![
            (kw("name"), SpecRef::from(ValueKind::Str)),
            (kw("id"), SpecRef::from(ValueKind::Int)),
        ])
    };

    assert_eq!(
        conform(name_or_id(), &Value::from("abc")).unwrap(),
        Value::vector([Value::from(kw("name")), Value::from("abc")])
    );
    assert_eq!(
        conform(name_or_id(), &Value::from(42)).unwrap(),
        Value::vector([Value::from(kw("id")), Value::from(42)])
    );

    let expl = explain_data(name_or_id(), &Value::from(kw("foo")))
        .unwrap()
        .expect("explanation");
    assert_eq!(expl.problems.len(), 2);
    assert_eq!(expl.problems[0].path, vec![PathSeg::Key(kw("name"))]);
    assert_eq!(expl.problems[0].pred, "string");
    assert_eq!(expl.problems[1].path, vec![PathSeg::Key(kw("id"))]);
    assert_eq!(expl.problems[1].pred, "int");
}

#[test]
fn rep_boundaries() {
    let _g = guard();
    let stars = || zero_or_more(ReChild::from(ValueKind::Keyword));
    assert_eq!(conform(stars(), &Value::Vector(vec![])).unwrap(), Value::Vector(vec![]));
    let abc = Value::vector([
        Value::from(kw("a")),
        Value::from(kw("b")),
        Value::from(kw("c")),
    ]);
    assert_eq!(conform(stars(), &abc).unwrap(), abc);
    assert!(conform(stars(), &Value::vector([Value::from(1)]))
        .unwrap()
        .is_invalid());

    assert_eq!(
        conform(zero_or_one(ReChild::from(ValueKind::Int)), &Value::Vector(vec![])).unwrap(),
        Value::Nil
    );
}

#[test]
fn nested_sequences_via_spec_wrappers() {
    let _g = guard();
    let opts = || {
        cat(vec![
            (
                kw("names_tag"),
                ReChild::from(Pred::one_of([Value::from(kw("names"))]).unwrap()),
            ),
            (
                kw("names"),
                ReChild::from(spec(SpecRef::from(zero_or_more(ReChild::from(
                    ValueKind::Str,
                ))))),
            ),
            (
                kw("nums_tag"),
                ReChild::from(Pred::one_of([Value::from(kw("nums"))]).unwrap()),
            ),
            (
                kw("nums"),
                ReChild::from(spec(SpecRef::from(zero_or_more(ReChild::from(number()))))),
            ),
        ])
    };
    let input = Value::vector([
        Value::from(kw("names")),
        Value::vector([Value::from("a"), Value::from("b")]),
        Value::from(kw("nums")),
        Value::vector([Value::from(1), Value::from(2)]),
    ]);
    let conformed = conform(opts(), &input).unwrap();
    assert_eq!(
        conformed,
        kmap(vec![
            (kw("names_tag"), Value::from(kw("names"))),
            (kw("names"), Value::vector([Value::from("a"), Value::from("b")])),
            (kw("nums_tag"), Value::from(kw("nums"))),
            (kw("nums"), Value::vector([Value::from(1), Value::from(2)])),
        ])
    );
    // Round-trip back to the original sequence.
    assert_eq!(unform(opts(), &conformed).unwrap(), input);
}

#[test]
fn person_keys_presence_and_registered_value_specs() {
    let _g = guard();
    reset_registry();
    def(qkw("ns", "first"), ValueKind::Str).unwrap();
    def(qkw("ns", "last"), ValueKind::Str).unwrap();
    def(
        qkw("ns", "email_type"),
        and(vec![
            SpecRef::from(ValueKind::Str),
            SpecRef::from(Pred::pattern("[a-z0-9.]+@[a-z0-9.]+").unwrap()),
        ]),
    )
    .unwrap();
    def(qkw("ns", "email"), qkw("ns", "email_type")).unwrap();
    def(qkw("ns", "phone"), ValueKind::Str).unwrap();
    def(
        qkw("ns", "person"),
        keys(
            vec![
                qkw("ns", "first").into(),
                qkw("ns", "last").into(),
                qkw("ns", "email").into(),
            ],
            vec![qkw("ns", "phone").into()],
            vec![],
            vec![],
        )
        .unwrap(),
    )
    .unwrap();

    // Missing email: one presence problem naming the key.
    let missing = kmap(vec![
        (qkw("ns", "first"), Value::from("ada")),
        (qkw("ns", "last"), Value::from("lovelace")),
    ]);
    let expl = explain_data(&qkw("ns", "person"), &missing)
        .unwrap()
        .expect("explanation");
    assert_eq!(expl.problems.len(), 1);
    assert_eq!(expl.problems[0].pred, "(key? :ns/email)");
    assert_eq!(expl.problems[0].via, vec![qkw("ns", "person")]);

    // Bad email value: problem at the key path, via the alias target.
    let bad = kmap(vec![
        (qkw("ns", "first"), Value::from("ada")),
        (qkw("ns", "last"), Value::from("lovelace")),
        (qkw("ns", "email"), Value::from("n/a")),
    ]);
    let expl = explain_data(&qkw("ns", "person"), &bad)
        .unwrap()
        .expect("explanation");
    assert_eq!(expl.problems.len(), 1);
    assert_eq!(
        expl.problems[0].path,
        vec![PathSeg::Key(qkw("ns", "email"))]
    );
    assert_eq!(
        expl.problems[0].via,
        vec![qkw("ns", "person"), qkw("ns", "email_type")]
    );
    assert_eq!(expl.problems[0].pred, "#\"[a-z0-9.]+@[a-z0-9.]+\"");

    // A conforming person, with the optional phone present.
    let good = kmap(vec![
        (qkw("ns", "first"), Value::from("ada")),
        (qkw("ns", "last"), Value::from("lovelace")),
        (qkw("ns", "email"), Value::from("ada@algo.org")),
        (qkw("ns", "phone"), Value::from("555-1842")),
    ]);
    assert!(valid(&qkw("ns", "person"), &good).unwrap());
}

#[test]
fn tuple_reports_the_failing_slot() {
    let _g = guard();
    let point = || {
        tuple(vec![
            SpecRef::from(ValueKind::Float),
            SpecRef::from(ValueKind::Float),
            SpecRef::from(ValueKind::Float),
        ])
    };
    let bad = Value::vector([Value::from(1.1), Value::from(2.2), Value::from(3)]);
    assert!(conform(point(), &bad).unwrap().is_invalid());
    let expl = explain_data(point(), &bad).unwrap().expect("explanation");
    assert_eq!(expl.problems.len(), 1);
    assert_eq!(expl.problems[0].path, vec![PathSeg::Index(2)]);
    assert_eq!(expl.problems[0].val, Value::from(3));
    assert_eq!(expl.problems[0].pred, "float");
    assert_eq!(expl.problems[0].in_, vec![PathSeg::Index(2)]);
}

#[test]
fn validity_conform_and_explain_agree() {
    let _g = guard();
    let samples = vec![
        Value::Nil,
        Value::from(0),
        Value::from(-3),
        Value::from(2.5),
        Value::from("x"),
        Value::from(kw("k")),
        Value::vector([Value::from(1)]),
    ];
    let specs: Vec<SpecRef> = vec![
        SpecRef::from(ValueKind::Int),
        SpecRef::from(nilable(ValueKind::Str)),
        SpecRef::from(or(vec![
            (kw("i"), SpecRef::from(ValueKind::Int)),
            (kw("s"), SpecRef::from(ValueKind::Str)),
        ])),
        SpecRef::from(coll_of(ValueKind::Int, EveryOpts::default())),
    ];
    for s in &specs {
        for v in &samples {
            let conformed = conform(s, v).unwrap();
            let is_valid = valid(s, v).unwrap();
            let explained = explain_data(s, v).unwrap();
            assert_eq!(is_valid, !conformed.is_invalid());
            assert_eq!(is_valid, explained.is_none());
            if let Some(expl) = explained {
                assert!(!expl.problems.is_empty());
            }
        }
    }
}

#[test]
fn unform_inverts_conform_for_non_transforming_specs() {
    let _g = guard();
    let s = or(vec![
        (kw("nums"), SpecRef::from(zero_or_more(ReChild::from(number())))),
        (kw("name"), SpecRef::from(ValueKind::Str)),
    ]);
    let sref = SpecRef::from(s);
    let inputs = vec![
        Value::vector([Value::from(1), Value::from(2.5)]),
        Value::from("echo"),
    ];
    for input in inputs {
        let conformed = conform(&sref, &input).unwrap();
        assert!(!conformed.is_invalid());
        assert_eq!(unform(&sref, &conformed).unwrap(), input);
    }
}

#[test]
fn merge_components_combine_last_wins() {
    let _g = guard();
    reset_registry();
    def(qkw("m", "a"), ValueKind::Int).unwrap();
    def(qkw("m", "b"), ValueKind::Int).unwrap();
    let left = keys(vec![qkw("m", "a").into()], vec![], vec![], vec![]).unwrap();
    let right = keys(vec![qkw("m", "b").into()], vec![], vec![], vec![]).unwrap();
    let both = merge(vec![left.into(), right.into()]);

    let input = kmap(vec![
        (qkw("m", "a"), Value::from(1)),
        (qkw("m", "b"), Value::from(2)),
    ]);
    assert_eq!(conform(both, &input).unwrap(), input);
}

#[test]
fn and_keys_or_keys_presence_logic() {
    let _g = guard();
    reset_registry();
    def(qkw("auth", "user"), ValueKind::Str).unwrap();
    def(qkw("auth", "token"), ValueKind::Str).unwrap();
    def(qkw("auth", "password"), ValueKind::Str).unwrap();
    let s = keys(
        vec![and_keys(vec![
            qkw("auth", "user").into(),
            conformal_kernel::or_keys(vec![
                qkw("auth", "token").into(),
                qkw("auth", "password").into(),
            ]),
        ])],
        vec![],
        vec![],
        vec![],
    )
    .unwrap();
    let sref = SpecRef::from(s);

    assert!(valid(
        &sref,
        &kmap(vec![
            (qkw("auth", "user"), Value::from("root")),
            (qkw("auth", "token"), Value::from("t0k3n")),
        ])
    )
    .unwrap());
    assert!(!valid(
        &sref,
        &kmap(vec![(qkw("auth", "user"), Value::from("root"))])
    )
    .unwrap());
    let expl = explain_data(
        &sref,
        &kmap(vec![(qkw("auth", "user"), Value::from("root"))]),
    )
    .unwrap()
    .expect("explanation");
    assert_eq!(
        expl.problems[0].pred,
        "(key? (or :auth/token :auth/password))"
    );
}

#[test]
fn float_in_bounds_and_flags() {
    let _g = guard();
    let s = || float_in(0.0, 10.0, false, false);
    assert!(valid(s(), &Value::from(0.0)).unwrap());
    assert!(valid(s(), &Value::from(10.0)).unwrap());
    assert!(!valid(s(), &Value::from(10.5)).unwrap());
    assert!(!valid(s(), &Value::from(f64::NAN)).unwrap());
    assert!(!valid(s(), &Value::from(3)).unwrap(), "ints are not floats");
    assert!(valid(float_in(0.0, 10.0, false, true), &Value::from(f64::NAN)).unwrap());
    assert!(valid(
        float_in(0.0, f64::INFINITY, true, false),
        &Value::from(f64::INFINITY)
    )
    .unwrap());
}

#[test]
fn explain_str_renders_lines_and_success() {
    let _g = guard();
    assert_eq!(
        explain_str(ValueKind::Int, &Value::from(1)).unwrap(),
        "Success!\n"
    );
    let line = explain_str(ValueKind::Int, &Value::from("one")).unwrap();
    assert_eq!(line, "val: \"one\" fails predicate: int\n");
}

#[test]
fn generation_is_deterministic_and_conforming() {
    let _g = guard();
    reset_registry();
    let s = cat(vec![
        (kw("n"), ReChild::from(ValueKind::Int)),
        (kw("tags"), ReChild::from(zero_or_more(ReChild::from(ValueKind::Keyword)))),
    ]);
    let sref = SpecRef::from(s);
    let g = gen(&sref, &Overrides::new()).unwrap();
    let a = g.sample_n(5, 99).unwrap();
    let b = g.sample_n(5, 99).unwrap();
    assert_eq!(a, b, "same seed, same samples");
    for v in a {
        assert!(valid(&sref, &v).unwrap());
    }
}

#[test]
fn overrides_replace_generators_by_name_and_path() {
    let _g = guard();
    reset_registry();
    def(qkw("gen", "id"), ValueKind::Int).unwrap();
    let constant_ids = Overrides::new().name(
        qkw("gen", "id"),
        conformal_kernel::Gen::constant(Value::from(7)),
    );
    let pairs = exercise(&qkw("gen", "id"), 4, &constant_ids).unwrap();
    for (raw, conformed) in pairs {
        assert_eq!(raw, Value::from(7));
        assert_eq!(conformed, Value::from(7));
    }

    let s = tuple(vec![SpecRef::from(ValueKind::Int), SpecRef::from(ValueKind::Str)]);
    let by_path = Overrides::new().path(
        vec![PathSeg::Index(1)],
        conformal_kernel::Gen::constant(Value::from("fixed")),
    );
    let sref = SpecRef::from(s);
    let g = gen(&sref, &by_path).unwrap();
    for seed in 0..5 {
        let v = g.sample_seeded(seed).unwrap();
        assert_eq!(v.as_vector().unwrap()[1], Value::from("fixed"));
    }
}

#[test]
fn recursive_named_specs_conform_and_generate_bounded() {
    let _g = guard();
    reset_registry();
    def(
        qkw("rec", "tree"),
        or(vec![
            (kw("leaf"), SpecRef::from(ValueKind::Int)),
            (
                kw("node"),
                SpecRef::from(coll_of(
                    qkw("rec", "tree"),
                    EveryOpts {
                        max_count: Some(3),
                        ..EveryOpts::default()
                    },
                )),
            ),
        ]),
    )
    .unwrap();

    let nested = Value::vector([
        Value::from(1),
        Value::vector([Value::from(2), Value::vector([Value::from(3)])]),
    ]);
    assert!(valid(&qkw("rec", "tree"), &nested).unwrap());
    assert!(!valid(&qkw("rec", "tree"), &Value::from("leafless")).unwrap());

    // Generation terminates: the recursive branch is pruned at the limit.
    let g = gen(&qkw("rec", "tree"), &Overrides::new()).unwrap();
    for seed in 0..5 {
        let v = g.sample_seeded(seed).unwrap();
        assert!(valid(&qkw("rec", "tree"), &v).unwrap());
    }
}

#[test]
fn every_accepts_large_inputs_cheaply_coll_of_does_not() {
    let _g = guard();
    let mut items: Vec<Value> = (0..5_000i64).map(Value::Int).collect();
    items.push(Value::from("bad"));
    let big = Value::Vector(items);
    assert!(valid(every(ValueKind::Int, EveryOpts::default()), &big).unwrap());
    assert!(!valid(coll_of(ValueKind::Int, EveryOpts::default()), &big).unwrap());
}

#[test]
fn assert_valid_honors_the_config_knob() {
    let _g = guard();
    conformal_kernel::config::set_check_asserts(false);
    let v = Value::from("not an int");
    assert_eq!(
        conformal_kernel::assert_valid(ValueKind::Int, &v).unwrap(),
        v
    );
    conformal_kernel::config::set_check_asserts(true);
    let err = conformal_kernel::assert_valid(ValueKind::Int, &v).unwrap_err();
    assert!(err.to_string().contains("assertion failed"));
    conformal_kernel::config::set_check_asserts(false);
}

#[test]
fn alt_is_left_to_right_inside_sequences() {
    let _g = guard();
    let r = alt(vec![
        (kw("a"), ReChild::from(ValueKind::Int)),
        (kw("b"), ReChild::from(ValueKind::Int)),
    ]);
    assert_eq!(
        conform(r, &Value::vector([Value::from(9)])).unwrap(),
        Value::vector([Value::from(kw("a")), Value::from(9)])
    );
}
