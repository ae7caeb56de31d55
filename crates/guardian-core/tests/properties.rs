//! Property tests for evaluation and aggregation

use guardian_core::verdict::{ValidationResult, UNPARSEABLE_RULE};
use guardian_core::{
    context_keys, Action, ActionType, ConstitutionalVerdict, GuardMode, GuardianConfig, Principle,
    Severity, SharedConfig, ValidationEngine, Violation,
};
use proptest::prelude::*;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

fn arb_principle() -> impl Strategy<Value = Principle> {
    prop::sample::select(Principle::ALL.to_vec())
}

fn arb_severity() -> impl Strategy<Value = Severity> {
    prop_oneof![
        Just(Severity::Low),
        Just(Severity::Medium),
        Just(Severity::High),
        Just(Severity::Critical),
    ]
}

fn arb_mode() -> impl Strategy<Value = GuardMode> {
    prop_oneof![
        Just(GuardMode::Strict),
        Just(GuardMode::Balanced),
        Just(GuardMode::Permissive),
    ]
}

fn arb_violation() -> impl Strategy<Value = Violation> {
    (arb_principle(), arb_severity(), "[a-z-]{3,20}", "[ -~]{0,40}")
        .prop_map(|(principle, severity, rule, message)| {
            Violation::new(principle, severity, &rule, message)
        })
}

/// One result per principle, each with a handful of violations
fn arb_results() -> impl Strategy<Value = Vec<ValidationResult>> {
    prop::collection::vec(prop::collection::vec(arb_severity(), 0..4), 6).prop_map(|per_principle| {
        let config = GuardianConfig::default();
        Principle::ALL
            .iter()
            .zip(per_principle)
            .map(|(principle, severities)| {
                let violations = severities
                    .into_iter()
                    .map(|severity| Violation::new(*principle, severity, "generated", "generated finding"))
                    .collect();
                ValidationResult::from_violations(*principle, violations, &config)
            })
            .collect()
    })
}

/// Source-like text: keywords, brackets, quotes and shell operators
fn arb_content() -> impl Strategy<Value = String> {
    let fragment = prop_oneof![
        Just("def ".to_string()),
        Just("fn ".to_string()),
        Just("function ".to_string()),
        Just("rm -rf ".to_string()),
        Just("pass".to_string()),
        Just("TODO".to_string()),
        Just("\"\"\"".to_string()),
        Just("{".to_string()),
        Just("}".to_string()),
        Just("(".to_string()),
        Just(")".to_string()),
        Just(":\n    ".to_string()),
        Just(" && ".to_string()),
        Just("\n".to_string()),
        "[a-zA-Z_][a-zA-Z0-9_]{0,8}",
        "[ -~]{0,12}",
    ];
    prop::collection::vec(fragment, 0..40).prop_map(|parts| parts.concat())
}

fn arb_action() -> impl Strategy<Value = Action> {
    let language = prop_oneof![
        Just(None),
        Just(Some("python")),
        Just(Some("rust")),
        Just(Some("typescript")),
        Just(Some("cobol")),
    ];
    let kind = prop_oneof![
        Just(ActionType::CodeGeneration),
        Just(ActionType::ShellCommand),
        Just(ActionType::FileEdit),
        Just(ActionType::Custom("note".to_string())),
    ];
    (kind, language, arb_content()).prop_map(|(kind, language, content)| {
        let action = Action::new(kind, content);
        match language {
            Some(language) => action.with_context(context_keys::LANGUAGE, language),
            None => action,
        }
    })
}

/// Bracket nesting far past anything hand-written, in every tree-sitter language
fn arb_deep_nesting() -> impl Strategy<Value = Action> {
    let shape = prop_oneof![
        Just(("python", "x = ", "(", ")", "\n")),
        Just(("rust", "fn f() -> u8 { ", "(", ")", " }\n")),
        Just(("typescript", "const x = ", "[", "]", ";\n")),
    ];
    (shape, 250usize..12_000).prop_map(|((language, head, open, close, tail), depth)| {
        let content = format!("{}{}1{}{}", head, open.repeat(depth), close.repeat(depth), tail);
        Action::code(content).with_context(context_keys::LANGUAGE, language)
    })
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Evaluation never panics and always yields one result per principle
    #[test]
    fn evaluation_is_total(action in arb_action(), mode in arb_mode()) {
        let config = GuardianConfig::default().with_mode(mode);
        let verdict = ValidationEngine::new().evaluate_blocking(&action, &config);

        prop_assert_eq!(verdict.results.len(), Principle::ALL.len());
        prop_assert_eq!(verdict.action_id, action.id());
        prop_assert!((0.0..=1.0).contains(&verdict.overall_score));
        for result in &verdict.results {
            prop_assert!((0.0..=1.0).contains(&result.score));
        }
    }

    /// A CRITICAL anywhere fails the verdict and zeroes the score
    #[test]
    fn critical_violation_always_fails(results in arb_results(), mode in arb_mode()) {
        let config = GuardianConfig::default().with_mode(mode);
        let any_critical = results
            .iter()
            .flat_map(|r| r.violations.iter())
            .any(|v| v.severity == Severity::Critical);
        let verdict = ConstitutionalVerdict::aggregate(Uuid::new_v4(), results, &config);

        prop_assert_eq!(verdict.has_critical(), any_critical);
        if any_critical {
            prop_assert!(!verdict.passed);
            prop_assert_eq!(verdict.overall_score, 0.0);
        } else {
            prop_assert_eq!(verdict.passed, verdict.overall_score >= config.threshold());
        }
    }

    /// More violations never raise a principle's score
    #[test]
    fn extra_violations_never_raise_a_score(
        base in prop::collection::vec(arb_violation(), 0..6),
        extra in arb_violation(),
    ) {
        let config = GuardianConfig::default();
        let principle = extra.principle;
        let before: Vec<Violation> = base
            .into_iter()
            .map(|mut v| {
                v.principle = principle;
                v
            })
            .collect();
        let mut after = before.clone();
        after.push(extra);

        let before = ValidationResult::from_violations(principle, before, &config);
        let after = ValidationResult::from_violations(principle, after, &config);
        prop_assert!(after.score <= before.score);
    }

    /// Verdicts survive a JSON round trip unchanged
    #[test]
    fn verdict_json_round_trip(results in arb_results()) {
        let verdict = ConstitutionalVerdict::aggregate(Uuid::new_v4(), results, &GuardianConfig::default());
        let json = serde_json::to_string(&verdict).unwrap();
        let back: ConstitutionalVerdict = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back, verdict);
    }

    /// Mode swaps are seen by the next snapshot and nothing else changes
    #[test]
    fn mode_swap_is_visible_to_the_next_snapshot(modes in prop::collection::vec(arb_mode(), 1..8)) {
        let shared = SharedConfig::new(GuardianConfig::default().with_max_lines(321)).unwrap();
        for mode in modes {
            let before = shared.snapshot();
            shared.set_mode(mode);
            let after = shared.snapshot();
            prop_assert_eq!(after.mode, mode);
            prop_assert_eq!(after.max_lines, 321);
            prop_assert_eq!(shared.mode(), mode);
            prop_assert_eq!(before.max_lines, after.max_lines);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Nesting too deep to walk is a CRITICAL unparseable finding, never a crash
    #[test]
    fn deep_nesting_fails_closed(action in arb_deep_nesting()) {
        let verdict = ValidationEngine::new().evaluate_blocking(&action, &GuardianConfig::default());

        prop_assert!(!verdict.passed);
        prop_assert_eq!(verdict.results.len(), Principle::ALL.len());
        prop_assert!(verdict
            .violations
            .iter()
            .any(|v| v.rule == UNPARSEABLE_RULE && v.severity == Severity::Critical));
    }
}
