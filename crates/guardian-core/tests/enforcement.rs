//! End-to-end enforcement through the coordinator and the engine

use guardian_core::guards::InterruptReason;
use guardian_core::verdict::UNPARSEABLE_RULE;
use guardian_core::{
    context_keys, Action, Artifact, EnforcementStatus, ExecutionFailure, GuardMode, GuardOutcome,
    GuardState, GuardianConfig, GuardianCoordinator, Principle, Severity, SharedConfig,
    ValidationEngine,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const INVENTORY_MODULE: &str = r#""""Inventory bookkeeping.

Version: 1.2.0

Parses stock records and keeps per-SKU totals on disk.
"""

import json
from dataclasses import dataclass

__version__ = "1.2.0"

MAX_QUANTITY = 10_000


class InventoryError(ValueError):
    """Raised when a stock record cannot be accepted."""


@dataclass(frozen=True)
class StockRecord:
    """One stock movement for a SKU."""

    sku: str
    quantity: int


def parse_record(raw: str) -> StockRecord:
    """Parse a JSON stock record.

    Args:
        raw: JSON object with sku and quantity fields.

    Returns:
        The parsed record.
    """
    try:
        payload = json.loads(raw)
        quantity = int(payload["quantity"])
    except (ValueError, KeyError, TypeError) as error:
        raise InventoryError(f"malformed stock record {raw}: {error}") from error
    sku = str(payload.get("sku", "")).strip()
    if not sku:
        raise InventoryError("stock record has an empty sku")
    if abs(quantity) > MAX_QUANTITY:
        raise InventoryError(f"quantity {quantity} for {sku} exceeds {MAX_QUANTITY}")
    return StockRecord(sku=sku, quantity=quantity)


def apply_records(totals: dict[str, int], records: list[StockRecord]) -> dict[str, int]:
    """Fold stock movements into per-SKU totals.

    Args:
        totals: Current totals by SKU, left unchanged.
        records: Movements to apply in order.

    Returns:
        New totals. A SKU whose total reaches zero is dropped.
    """
    updated = dict(totals)
    for record in records:
        balance = updated.get(record.sku, 0) + record.quantity
        if balance < 0:
            raise InventoryError(f"{record.sku} would fall to {balance} units")
        updated[record.sku] = balance
    return {sku: count for sku, count in updated.items() if count > 0}


def load_totals(path: str) -> dict[str, int]:
    """Read totals written by save_totals.

    Args:
        path: JSON file mapping SKU to count.

    Returns:
        Totals by SKU.
    """
    try:
        with open(path, encoding="utf-8") as handle:
            data = json.load(handle)
    except (OSError, ValueError) as error:
        raise InventoryError(f"cannot read totals from {path}: {error}") from error
    return {str(sku): int(count) for sku, count in data.items()}


def save_totals(path: str, totals: dict[str, int]) -> None:
    """Write totals as JSON with SKUs sorted.

    Args:
        path: Destination file, replaced when present.
        totals: Totals by SKU.
    """
    try:
        with open(path, "w", encoding="utf-8") as handle:
            json.dump(totals, handle, sort_keys=True, indent=2)
    except OSError as error:
        raise InventoryError(f"cannot write totals to {path}: {error}") from error


def low_stock(totals: dict[str, int], threshold: int) -> list[str]:
    """SKUs at or below a reorder level.

    Args:
        totals: Totals by SKU.
        threshold: Inclusive reorder level.

    Returns:
        Matching SKUs in alphabetical order.
    """
    return sorted(sku for sku, count in totals.items() if count <= threshold)


def test_parse_record_reads_fields():
    record = parse_record('{"sku": "A-1", "quantity": 3}')
    assert record == StockRecord(sku="A-1", quantity=3)


def test_parse_record_rejects_bad_quantity():
    try:
        parse_record('{"sku": "A-1", "quantity": "many"}')
    except InventoryError as error:
        assert "malformed" in str(error)
    else:
        raise AssertionError("expected InventoryError")


def test_apply_records_drops_empty_skus():
    totals = apply_records({"A-1": 2}, [StockRecord("A-1", -2), StockRecord("B-7", 5)])
    assert totals == {"B-7": 5}


def test_low_stock_is_sorted():
    assert low_stock({"b": 1, "a": 0, "c": 9}, 1) == ["a", "b"]
"#;

fn coordinator(config: GuardianConfig) -> GuardianCoordinator {
    GuardianCoordinator::new(SharedConfig::new(config).unwrap())
}

#[tokio::test]
async fn recursive_delete_of_root_is_rejected_in_strict_mode() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let report = coordinator(GuardianConfig::default().with_mode(GuardMode::Strict))
        .enforce(&Action::shell("rm -rf /"), move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Artifact::output("")) }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(report.status, EnforcementStatus::Rejected);

    let pre = &report.decisions[0];
    assert_eq!(pre.outcome, GuardOutcome::Reject);
    assert!(!pre.reasoning.is_empty());

    let verdict = report.verdict().unwrap();
    assert_eq!(verdict.overall_score, 0.0);
    let criticals: Vec<_> = verdict
        .violations
        .iter()
        .filter(|v| v.severity == Severity::Critical)
        .collect();
    assert_eq!(criticals.len(), 1);
    assert_eq!(criticals[0].principle, Principle::UserSovereignty);
}

#[tokio::test]
async fn pass_only_function_is_a_critical_stub() {
    let action = Action::code("def f(): pass\n").with_context(context_keys::LANGUAGE, "python");
    let verdict = ValidationEngine::new()
        .evaluate(&action, &GuardianConfig::default())
        .await;

    assert!(!verdict.passed);
    let stub = verdict
        .violations_for(Principle::Truth)
        .find(|v| v.rule == "stub-function")
        .expect("stub violation");
    assert_eq!(stub.severity, Severity::Critical);
}

#[tokio::test]
async fn complete_module_scores_high_on_every_principle() {
    let action = Action::code(INVENTORY_MODULE).with_context(context_keys::LANGUAGE, "python");
    let verdict = ValidationEngine::new()
        .evaluate(&action, &GuardianConfig::default())
        .await;

    for result in &verdict.results {
        assert!(
            result.score >= 0.9,
            "{} scored {}: {:?}",
            result.principle,
            result.score,
            result.violations
        );
    }
    assert_eq!(verdict.results.len(), 6);
    assert!(verdict.passed, "{}", verdict.explain());
    assert!(!verdict.has_critical());
}

#[tokio::test]
async fn identical_failures_interrupt_before_a_third_attempt() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let config = GuardianConfig::default().with_max_iterations(2);
    let report = coordinator(config)
        .enforce(&Action::shell("python3 build.py"), move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(ExecutionFailure::parse("ValueError: X")) }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(report.status, EnforcementStatus::Interrupted);
    assert_eq!(report.final_state, GuardState::Interrupted);
    let runtime = report.decisions.last().unwrap();
    assert_eq!(runtime.outcome, GuardOutcome::Interrupt);
    assert!(matches!(
        runtime.interrupt,
        Some(InterruptReason::CircularError { .. })
    ));
}

#[tokio::test]
async fn generated_code_is_reviewed_after_execution() {
    let action = Action::code("").with_context(context_keys::LANGUAGE, "python");
    let report = coordinator(GuardianConfig::default())
        .enforce(&action, |_ctx| async { Ok(Artifact::code(INVENTORY_MODULE)) })
        .await;

    assert!(report.is_accepted(), "{:?}", report.blocking_decision());
    assert_eq!(report.final_state, GuardState::Accepted);
    assert!(report.metrics.post_score.unwrap() >= 0.9);
    assert_eq!(report.metrics.laziness_index, Some(0.0));
}

#[tokio::test]
async fn lazy_artifact_is_rejected_after_execution() {
    let action = Action::code("").with_context(context_keys::LANGUAGE, "python");
    let report = coordinator(GuardianConfig::default())
        .enforce(&action, |_ctx| async {
            Ok(Artifact::code("def total(items):\n    # TODO: sum the items\n    pass\n"))
        })
        .await;

    assert_eq!(report.status, EnforcementStatus::Rejected);
    assert_eq!(report.final_state, GuardState::Rejected);
    assert!(report.artifact.is_some());
    assert!(report.metrics.laziness_index.unwrap() > 10.0);
}

#[tokio::test]
async fn mode_switch_applies_to_the_next_enforcement() {
    let coordinator = coordinator(GuardianConfig::default());
    let action = Action::shell("chmod 777 deploy.sh\nkill 4242\ngit reset --hard HEAD~1\n");

    let balanced = coordinator
        .enforce(&action, |_ctx| async { Ok(Artifact::output("done")) })
        .await;
    assert_ne!(balanced.status, EnforcementStatus::Rejected);
    let score = balanced.metrics.overall_score.unwrap();
    assert!(score > 0.7 && score < 0.9, "score {}", score);

    coordinator.config().set_mode(GuardMode::Strict);
    let strict = coordinator
        .enforce(&action, |_ctx| async { Ok(Artifact::output("done")) })
        .await;
    assert_eq!(strict.status, EnforcementStatus::Rejected);
    assert_eq!(strict.decisions.len(), 1);
}

#[tokio::test]
async fn deeply_nested_source_fails_closed_instead_of_aborting() {
    let depth = 10_000;
    let source = format!("x = {}1{}\n", "(".repeat(depth), ")".repeat(depth));
    let action = Action::code(source).with_context(context_keys::LANGUAGE, "python");
    let verdict = ValidationEngine::new()
        .evaluate(&action, &GuardianConfig::default())
        .await;

    assert!(!verdict.passed);
    assert_eq!(verdict.overall_score, 0.0);
    assert_eq!(verdict.results.len(), 6);
    for result in &verdict.results {
        assert_eq!(result.violations[0].rule, UNPARSEABLE_RULE, "{}", result.principle);
        assert_eq!(result.violations[0].severity, Severity::Critical);
    }
}
