//! End-to-end lowering tests: whole programs in, DECORATE text out.
//!
//! Assertions work on trimmed non-empty lines so they stay independent of
//! indentation depth.

use pretty_assertions::assert_eq;
use zdcode::{
    Compiler,
    ast::{
        ActionCall, AnonymousClassDef, ApplySpec, ClassBodyItem, ClassDef, EffectAst, Expression,
        ForIterator, ForLoop, FormattableString, GroupDef, LabelDef, Literal, MacroDef,
        ModClauseDef, ModDef, ModifierPart, Parameter, SelectorAst, SpriteRef, StateAction,
        Statement, StaticDerivationDef, TemplateBodyItem, TemplateDef, TemplateDerivation,
        TopLevel, FramesDef,
    },
};

fn frames(sprite: &str, letters: &str, duration: i64) -> Statement {
    Statement::Frames(FramesDef {
        sprite: SpriteRef::Normal(sprite.to_string()),
        frames: letters.to_string(),
        duration,
        modifiers: Vec::new(),
        action: None,
    })
}

fn frames_kw(sprite: &str, letters: &str, duration: i64, keywords: &[&str]) -> Statement {
    Statement::Frames(FramesDef {
        sprite: SpriteRef::Normal(sprite.to_string()),
        frames: letters.to_string(),
        duration,
        modifiers: keywords
            .iter()
            .map(|k| vec![ModifierPart::Text((*k).to_string())])
            .collect(),
        action: None,
    })
}

fn frames_action(sprite: &str, letters: &str, duration: i64, call: ActionCall) -> Statement {
    Statement::Frames(FramesDef {
        sprite: SpriteRef::Normal(sprite.to_string()),
        frames: letters.to_string(),
        duration,
        modifiers: Vec::new(),
        action: Some(StateAction::Single(call)),
    })
}

fn var_expr(name: &str) -> Expression {
    Expression::Literal(Literal::ActorVariable(name.to_string()))
}

fn cmp_expr(left: &str, op: &str, right: &str) -> Expression {
    Expression::Seq(vec![
        var_expr(left),
        Expression::Operator(op.to_string()),
        Expression::Literal(Literal::Number(right.to_string())),
    ])
}

fn label(name: &str, body: Vec<Statement>) -> ClassBodyItem {
    ClassBodyItem::Label(LabelDef {
        name: name.to_string(),
        body,
    })
}

fn class(name: &str, body: Vec<ClassBodyItem>) -> TopLevel {
    TopLevel::Class(ClassDef {
        name: FormattableString::Literal(name.to_string()),
        inherit: None,
        replace: None,
        editor_num: None,
        group: None,
        body,
    })
}

fn compiled_lines(program: Vec<TopLevel>) -> Vec<String> {
    let mut compiler = Compiler::with_seed(0);
    compiler.compile(program).expect("program should compile");
    decorate_lines(&compiler)
}

fn decorate_lines(compiler: &Compiler) -> Vec<String> {
    compiler
        .decorate()
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

/// The slice of `lines` directly following the first occurrence of `start`.
fn after<'a>(lines: &'a [String], start: &str) -> &'a [String] {
    let position = lines
        .iter()
        .position(|l| l == start)
        .unwrap_or_else(|| panic!("no line '{start}' in {lines:#?}"));
    &lines[position + 1..]
}

/// A spawn-safe Spawn label comes through untouched.
#[test]
fn spawn_safe_label_needs_no_padding() {
    let lines = compiled_lines(vec![class(
        "A",
        vec![label(
            "Spawn",
            vec![frames("TNT1", "A", 5), Statement::Flow("stop".to_string())],
        )],
    )]);
    assert_eq!(&after(&lines, "Spawn:")[..2], ["TNT1 A 5", "stop"]);
}

/// A Spawn label opening on a keep-sprite state gets an invisible zero-tic
/// state prepended.
#[test]
fn unsafe_spawn_label_is_padded() {
    let lines = compiled_lines(vec![class(
        "A",
        vec![label(
            "Spawn",
            vec![frames("####", "#", 0), frames("TNT1", "A", 5)],
        )],
    )]);
    assert_eq!(
        &after(&lines, "Spawn:")[..3],
        ["TNT1 A 0", "\"####\" \"#\" 0", "TNT1 A 5"]
    );
}

/// If/else lowers to the reference shape: condition jump over the else
/// branch, unconditional jump over the then branch, landing pad last.
#[test]
fn if_else_lowers_with_correct_offsets() {
    let lines = compiled_lines(vec![class(
        "A",
        vec![label(
            "L",
            vec![Statement::If {
                condition: cmp_expr("health", ">", "10"),
                body: vec![frames("PISG", "A", 1)],
                else_body: Some(vec![frames("PISG", "B", 1)]),
            }],
        )],
    )]);
    assert_eq!(
        &after(&lines, "L:")[..5],
        [
            "TNT1 A 0 A_JumpIf(health > 10, 3)",
            "PISG B 1",
            "TNT1 A 0 A_Jump(256, 2)",
            "PISG A 1",
            "TNT1 A 0",
        ]
    );
}

/// An if without an else negates the condition and adds a single pad.
#[test]
fn if_without_else_negates_the_condition() {
    let lines = compiled_lines(vec![class(
        "A",
        vec![label(
            "L",
            vec![Statement::If {
                condition: cmp_expr("health", ">", "10"),
                body: vec![frames("PISG", "A", 1)],
                else_body: None,
            }],
        )],
    )]);
    assert_eq!(
        &after(&lines, "L:")[..3],
        [
            "TNT1 A 0 A_JumpIf(!(health > 10), 2)",
            "PISG A 1",
            "TNT1 A 0",
        ]
    );
}

/// `x N` repetition duplicates the block in place, with no pad states.
#[test]
fn repeat_unrolls_without_pads() {
    let lines = compiled_lines(vec![class(
        "A",
        vec![label(
            "L",
            vec![Statement::Repeat {
                count: zdcode::ast::ReplaceableNumber::Literal(3),
                index_name: None,
                body: vec![frames("PISG", "A", 1)],
            }],
        )],
    )]);
    let body = after(&lines, "L:");
    assert_eq!(&body[..3], ["PISG A 1", "PISG A 1", "PISG A 1"]);
    assert!(
        !body.iter().any(|l| l.starts_with("TNT1 A 0")),
        "repetition must not introduce pad states: {body:#?}"
    );
}

/// Deriving a named class from a template substitutes its parameters.
#[test]
fn template_derivation_substitutes_parameters() {
    let lines = compiled_lines(vec![
        TopLevel::Template(TemplateDef {
            name: FormattableString::Literal("T".to_string()),
            parameters: vec!["P".to_string()],
            inherit: None,
            replace: None,
            editor_num: None,
            group: None,
            body: vec![TemplateBodyItem::Item(label(
                "Spawn",
                vec![Statement::Frames(FramesDef {
                    sprite: SpriteRef::Parametrized("P".to_string()),
                    frames: "A".to_string(),
                    duration: 1,
                    modifiers: Vec::new(),
                    action: None,
                })],
            ))],
        }),
        TopLevel::StaticDerivation(StaticDerivationDef {
            name: FormattableString::Literal("D".to_string()),
            group: None,
            source: TemplateDerivation {
                template_name: "T".to_string(),
                params: vec![Parameter::Expression(Expression::Literal(Literal::Str(
                    "PIST".to_string(),
                )))],
                inherit: None,
                group: None,
                body: Vec::new(),
            },
        }),
    ]);
    assert!(lines.iter().any(|l| l == "Actor D"), "{lines:#?}");
    assert_eq!(after(&lines, "Spawn:")[0], "PIST A 1");
}

/// Spec scenario: a mod adding Translucent to Bright states touches only
/// the states the selector matches.
#[test]
fn modifiers_rewrite_matching_states_only() {
    let lines = compiled_lines(vec![class(
        "A",
        vec![
            ClassBodyItem::Mod(ModDef {
                name: "M".to_string(),
                clauses: vec![ModClauseDef {
                    selector: SelectorAst::Flag(vec![ModifierPart::Text("Bright".to_string())]),
                    effects: vec![EffectAst::AddFlag(vec![ModifierPart::Text(
                        "Translucent".to_string(),
                    )])],
                }],
            }),
            ClassBodyItem::Apply(ApplySpec::Named("M".to_string())),
            label(
                "L",
                vec![
                    frames_kw("PISG", "A", 1, &["Bright"]),
                    frames("PISG", "B", 1),
                ],
            ),
        ],
    )]);
    assert_eq!(
        &after(&lines, "L:")[..2],
        ["PISG A 1 Bright Translucent", "PISG B 1"]
    );
}

/// Template memoization: identical derivations of a template with no
/// abstract members share one generated actor.
#[test]
fn identical_derivations_share_one_actor() {
    let derivation = || {
        Parameter::Derivation(TemplateDerivation {
            template_name: "T".to_string(),
            params: vec![Parameter::Expression(Expression::Literal(Literal::Str(
                "PIST".to_string(),
            )))],
            inherit: None,
            group: None,
            body: Vec::new(),
        })
    };
    let template = TopLevel::Template(TemplateDef {
        name: FormattableString::Literal("T".to_string()),
        parameters: vec!["P".to_string()],
        inherit: None,
        replace: None,
        editor_num: None,
        group: None,
        body: Vec::new(),
    });
    let lines = compiled_lines(vec![
        template,
        class(
            "A",
            vec![ClassBodyItem::Property {
                name: "DropItem".to_string(),
                values: vec![derivation()],
            }],
        ),
        class(
            "B",
            vec![ClassBodyItem::Property {
                name: "DropItem".to_string(),
                values: vec![derivation()],
            }],
        ),
    ]);

    let derived: Vec<&String> = lines
        .iter()
        .filter(|l| l.starts_with("Actor T__deriv_"))
        .collect();
    assert_eq!(derived.len(), 1, "one memoized actor expected: {lines:#?}");

    let references: Vec<&String> = lines
        .iter()
        .filter(|l| l.starts_with("DropItem \"T__deriv_"))
        .collect();
    assert_eq!(references.len(), 2);
    assert_eq!(references[0], references[1]);
}

/// Macro return skips the rest of the injected body.
#[test]
fn macro_return_jumps_to_the_injection_end() {
    let lines = compiled_lines(vec![
        TopLevel::MacroDef(MacroDef {
            name: "Fire".to_string(),
            args: Vec::new(),
            body: vec![
                frames("PISG", "A", 1),
                Statement::Return,
                frames("PISG", "B", 1),
            ],
        }),
        class(
            "A",
            vec![label(
                "L",
                vec![
                    Statement::Inject {
                        from_class: None,
                        name: "Fire".to_string(),
                        args: Vec::new(),
                    },
                    frames("PISG", "C", 1),
                ],
            )],
        ),
    ]);
    assert_eq!(
        &after(&lines, "L:")[..4],
        [
            "PISG A 1",
            "TNT1 A 0 A_Jump(256, 2)",
            "PISG B 1",
            "PISG C 1",
        ]
    );
}

/// Macro arguments bind as replacements inside the injected body.
#[test]
fn macro_arguments_substitute_into_the_body() {
    let lines = compiled_lines(vec![
        TopLevel::MacroDef(MacroDef {
            name: "Say".to_string(),
            args: vec!["what".to_string()],
            body: vec![frames_action(
                "TNT1",
                "A",
                0,
                ActionCall {
                    name: "A_Print".to_string(),
                    args: vec![Parameter::Expression(var_expr("what"))],
                },
            )],
        }),
        class(
            "A",
            vec![label(
                "L",
                vec![Statement::Inject {
                    from_class: None,
                    name: "Say".to_string(),
                    args: vec![Parameter::Expression(Expression::Literal(Literal::Str(
                        "hello".to_string(),
                    )))],
                }],
            )],
        ),
    ]);
    assert_eq!(after(&lines, "L:")[0], "TNT1 A 0 A_Print(\"hello\")");
}

/// Sometimes wraps its body in a chance jump and a landing pad.
#[test]
fn sometimes_emits_the_chance_jump() {
    let lines = compiled_lines(vec![class(
        "A",
        vec![label(
            "L",
            vec![Statement::Sometimes {
                chance: Expression::Literal(Literal::Number("25".to_string())),
                body: vec![frames("BLUR", "A", 1)],
            }],
        )],
    )]);
    assert_eq!(
        &after(&lines, "L:")[..3],
        [
            "TNT1 A 0 A_Jump(256-(256*(25)/100), 2)",
            "BLUR A 1",
            "TNT1 A 0",
        ]
    );
}

/// While loops emit the check, loop label, recheck, and landing pad; break
/// lowers to a forward jump.
#[test]
fn while_loop_with_break_lowers_to_jumps() {
    let lines = compiled_lines(vec![class(
        "A",
        vec![label(
            "L",
            vec![Statement::While {
                condition: cmp_expr("health", ">", "0"),
                body: vec![
                    frames("PISG", "A", 1),
                    Statement::Break,
                    frames("PISG", "B", 1),
                ],
                else_body: None,
            }],
        )],
    )]);
    assert_eq!(
        &after(&lines, "L:")[..7],
        [
            "TNT1 A 0 A_JumpIf(!(health > 0), 5)",
            "_loop_while_0:",
            "PISG A 1",
            "TNT1 A 0 A_Jump(256, 2)",
            "PISG B 1",
            "TNT1 A 0 A_JumpIf(health > 0, \"_loop_while_0\")",
            "TNT1 A 0",
        ]
    );
}

/// For-in-group iterates the group members bound as quoted literals.
#[test]
fn for_in_group_enumerates_members() {
    let lines = compiled_lines(vec![
        TopLevel::Group(GroupDef {
            name: "spawnables".to_string(),
            items: vec!["Zombie".to_string(), "Imp".to_string()],
        }),
        class(
            "A",
            vec![label(
                "L",
                vec![Statement::For(Box::new(ForLoop {
                    var_name: "cls".to_string(),
                    index_name: None,
                    iterator: ForIterator::Group("spawnables".to_string()),
                    body: vec![frames_action(
                        "TNT1",
                        "A",
                        0,
                        ActionCall {
                            name: "A_SpawnItem".to_string(),
                            args: vec![Parameter::Expression(var_expr("cls"))],
                        },
                    )],
                    else_body: None,
                }))],
            )],
        ),
    ]);
    assert_eq!(
        &after(&lines, "L:")[..2],
        [
            "TNT1 A 0 A_SpawnItem(\"Zombie\")",
            "TNT1 A 0 A_SpawnItem(\"Imp\")",
        ]
    );
}

/// For-in-range binds the loop variable to each integer in the range.
#[test]
fn for_in_range_enumerates_integers() {
    let lines = compiled_lines(vec![class(
        "A",
        vec![label(
            "L",
            vec![Statement::For(Box::new(ForLoop {
                var_name: "n".to_string(),
                index_name: None,
                iterator: ForIterator::Range {
                    from: zdcode::ast::ReplaceableNumber::Literal(1),
                    to: zdcode::ast::ReplaceableNumber::Literal(3),
                    inclusive: true,
                },
                body: vec![frames_action(
                    "TNT1",
                    "A",
                    0,
                    ActionCall {
                        name: "A_Print".to_string(),
                        args: vec![Parameter::Expression(var_expr("n"))],
                    },
                )],
                else_body: None,
            }))],
        )],
    )]);
    assert_eq!(
        &after(&lines, "L:")[..3],
        ["TNT1 A 0 A_Print(1)", "TNT1 A 0 A_Print(2)", "TNT1 A 0 A_Print(3)"]
    );
}

/// Compile-time evaluation results are spliced into parameter text.
#[test]
fn eval_expressions_fold_at_compile_time() {
    use zdcode::ast::{EvalNode, EvalOp, EvalOperator};
    let lines = compiled_lines(vec![class(
        "A",
        vec![ClassBodyItem::Property {
            name: "Health".to_string(),
            values: vec![Parameter::Expression(Expression::Literal(Literal::Eval(
                EvalNode::Op(Box::new(EvalOp {
                    op: EvalOperator::Mul,
                    operands: vec![
                        EvalNode::Op(Box::new(EvalOp {
                            op: EvalOperator::Add,
                            operands: vec![EvalNode::Int(2), EvalNode::Int(3)],
                        })),
                        EvalNode::Int(2),
                    ],
                })),
            )))],
        }],
    )]);
    assert!(lines.iter().any(|l| l == "Health 10"), "{lines:#?}");
}

/// Inheritance targets declared later are moved ahead of their inheritors.
#[test]
fn inheritance_targets_precede_inheritors() {
    let lines = compiled_lines(vec![
        TopLevel::Class(ClassDef {
            name: FormattableString::Literal("Aaa".to_string()),
            inherit: Some(zdcode::ast::InheritSpec::ClassName("Zzz".to_string())),
            replace: None,
            editor_num: None,
            group: None,
            body: Vec::new(),
        }),
        class("Zzz", Vec::new()),
    ]);
    let parent = lines.iter().position(|l| l == "Actor Zzz").unwrap();
    let child = lines.iter().position(|l| l == "Actor Aaa : Zzz").unwrap();
    assert!(parent < child, "{lines:#?}");
}

/// Anonymous classes register under a generated program-scoped name.
#[test]
fn anonymous_classes_get_generated_names() {
    let mut compiler = Compiler::with_seed(7);
    compiler
        .compile(vec![class(
            "A",
            vec![label(
                "L",
                vec![frames_action(
                    "TNT1",
                    "A",
                    0,
                    ActionCall {
                        name: "A_SpawnItem".to_string(),
                        args: vec![Parameter::AnonymousClass(AnonymousClassDef {
                            inherit: None,
                            group: None,
                            body: vec![ClassBodyItem::Flag("NOGRAVITY".to_string())],
                        })],
                    },
                )],
            )],
        )])
        .unwrap();
    let lines = decorate_lines(&compiler);
    let expected = format!("_AnonymClass_{}_0", compiler.program_id());
    assert!(
        lines.iter().any(|l| *l == format!("Actor {expected}")),
        "{lines:#?}"
    );
    assert!(
        lines
            .iter()
            .any(|l| *l == format!("TNT1 A 0 A_SpawnItem(\"{expected}\")")),
        "{lines:#?}"
    );
}

/// The same seed and program yield byte-identical output; the output header
/// carries the program id.
#[test]
fn output_is_deterministic_for_a_seed() {
    let program = || {
        vec![class(
            "A",
            vec![label("Spawn", vec![frames("TNT1", "A", 5)])],
        )]
    };
    let mut first = Compiler::with_seed(1234);
    first.compile(program()).unwrap();
    let mut second = Compiler::with_seed(1234);
    second.compile(program()).unwrap();
    assert_eq!(first.decorate(), second.decorate());
    assert!(
        first
            .decorate()
            .starts_with(&format!("// :ZDCODE version='{}' id='", zdcode::VERSION)),
        "{}",
        first.decorate()
    );

    let mut other = Compiler::with_seed(99);
    other.compile(program()).unwrap();
    assert_ne!(first.program_id(), other.program_id());
}

/// Compilation errors surface through the handler without emitting output.
#[test]
fn errors_reach_the_top_level_handler() {
    let mut compiler = Compiler::with_seed(0);
    let mut seen = None;
    let ok = compiler.compile_with_handler(
        vec![class("A", vec![label("L", vec![Statement::Return])])],
        |error| seen = Some(error.clone()),
    );
    assert!(!ok);
    let error = seen.expect("handler should have been called");
    assert!(error.message().contains("return"));
    assert!(error.location().contains("label 'L'"));
}

/// Programs round-trip through serde as data fixtures.
#[test]
fn programs_deserialize_from_json_fixtures() {
    let fixture = serde_json::json!([
        {
            "Class": {
                "name": { "Literal": "A" },
                "inherit": null,
                "replace": null,
                "editor_num": null,
                "group": null,
                "body": [
                    {
                        "Label": {
                            "name": "Spawn",
                            "body": [
                                {
                                    "Frames": {
                                        "sprite": { "Normal": "TNT1" },
                                        "frames": "A",
                                        "duration": 5,
                                        "modifiers": [],
                                        "action": null
                                    }
                                },
                                { "Flow": "stop" }
                            ]
                        }
                    }
                ]
            }
        }
    ]);
    let program: Vec<TopLevel> = serde_json::from_value(fixture).unwrap();
    let lines = compiled_lines(program);
    assert_eq!(&after(&lines, "Spawn:")[..2], ["TNT1 A 5", "stop"]);
}
