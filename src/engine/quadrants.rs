//! Four-quadrant requirements: the per-role directive sent with agent steps
//! and the trace and control items derived from the quadrant text.
//!
//! Trace item codes:
//!
//! | quadrant               | code     | kept when              |
//! |------------------------|----------|------------------------|
//! | `functional_core`      | `FC-001` | non-blank (one item)   |
//! | `physical_constraints` | `PC-nnn` | longer than 5 chars    |
//! | `semantic_contract`    | `SC-nnn` | at least 10 chars      |
//! | `exceptions`           | `EX-nnn` | longer than 5 chars    |

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::models::{
    ControlItem, ControlLayer, ControlStatus, NewControlItem, NewTraceItem, Quadrants, Role, Slice,
    TraceCategory,
};

const FUNCTIONAL_SUMMARY_CHARS: usize = 100;
const CONTRACT_CONTROLS: usize = 5;
const CONTRACT_LABEL_CHARS: usize = 30;

static ITEM_MARKER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(?:[-*•]|\d+[.)])\s*").ok());

fn prefix(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}

/// Split quadrant text into items. A bullet, a number or a capital letter
/// starts an item; other lines continue the previous one.
pub fn split_items(text: &str) -> Vec<String> {
    let mut items: Vec<String> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let marker = ITEM_MARKER.as_ref().and_then(|re| re.find(line));
        let body = match marker {
            Some(m) => line[m.end()..].trim(),
            None => line,
        };
        let starts_item = marker.is_some()
            || line.chars().next().is_some_and(char::is_uppercase)
            || items.is_empty();
        match items.last_mut() {
            Some(last) if !starts_item => {
                last.push(' ');
                last.push_str(body);
            }
            _ => items.push(body.to_string()),
        }
    }
    items.retain(|item| !item.is_empty());
    items
}

fn numbered(
    category: TraceCategory,
    text: &str,
    keep: impl Fn(&str) -> bool,
) -> Vec<NewTraceItem> {
    split_items(text)
        .into_iter()
        .filter(|item| keep(item))
        .enumerate()
        .map(|(i, item)| NewTraceItem {
            code: format!("{}-{:03}", category.code_prefix(), i + 1),
            category,
            text: item,
        })
        .collect()
}

/// Trace items in code order: functional, physical, semantic, exception.
pub fn derive_trace_items(quadrants: &Quadrants) -> Vec<NewTraceItem> {
    let mut items = Vec::new();
    let functional = quadrants.functional_core.trim();
    if !functional.is_empty() {
        items.push(NewTraceItem {
            code: format!("{}-001", TraceCategory::Functional.code_prefix()),
            category: TraceCategory::Functional,
            text: format!(
                "Implement functional core: {}",
                prefix(functional, FUNCTIONAL_SUMMARY_CHARS)
            ),
        });
    }
    items.extend(numbered(
        TraceCategory::Physical,
        &quadrants.physical_constraints,
        |item| item.chars().count() > 5,
    ));
    items.extend(numbered(
        TraceCategory::Semantic,
        &quadrants.semantic_contract,
        |item| item.chars().count() >= 10,
    ));
    items.extend(numbered(
        TraceCategory::Exception,
        &quadrants.exceptions,
        |item| item.chars().count() > 5,
    ));
    items
}

fn control(
    layer: ControlLayer,
    item: impl Into<String>,
    source: &str,
    tracking: impl Into<String>,
    acceptance: &str,
) -> NewControlItem {
    NewControlItem {
        layer,
        item: item.into(),
        source: source.to_string(),
        tracking: tracking.into(),
        acceptance: acceptance.to_string(),
    }
}

/// The control table seeded for a slice with these quadrants.
pub fn derive_control_items(quadrants: &Quadrants) -> Vec<NewControlItem> {
    let mut items = Vec::new();

    if !quadrants.physical_constraints.trim().is_empty() {
        for name in [
            "Technology stack conformance",
            "Performance requirements",
            "Environment constraints",
            "Dependency management",
        ] {
            items.push(control(
                ControlLayer::Base,
                name,
                "physical_constraints",
                "Path isolation checklist",
                "Core paths are never modified by extension hooks",
            ));
        }
    }

    let semantic = numbered(
        TraceCategory::Semantic,
        &quadrants.semantic_contract,
        |item| item.chars().count() >= 10,
    );
    for trace in semantic.iter().take(CONTRACT_CONTROLS) {
        items.push(control(
            ControlLayer::Contract,
            format!(
                "Semantic contract: {}",
                prefix(&trace.text, CONTRACT_LABEL_CHARS)
            ),
            "semantic_contract",
            format!("Trace {}", trace.code),
            "Core logic follows the contract deterministically",
        ));
    }

    for name in [
        "State change hook",
        "Data validation hook",
        "Error handling hook",
        "Logging hook",
    ] {
        items.push(control(
            ControlLayer::Slot,
            name,
            "functional_core",
            "Hook call-chain analysis",
            "Every state change triggers its hook",
        ));
    }

    if !quadrants.semantic_contract.trim().is_empty() {
        for name in [
            "Forbidden anti-patterns",
            "Security boundary checks",
            "Exception handling coverage",
        ] {
            items.push(control(
                ControlLayer::Protection,
                name,
                "semantic_contract",
                "Automated static scan",
                "No listed anti-pattern appears in the code",
            ));
        }
    }
    items
}

fn role_directive(role: Role) -> [&'static str; 4] {
    match role {
        Role::Pm => [
            "Structure the PRD by the four quadrants.",
            "Turn the functional core into concrete user stories.",
            "State the physical constraints as measurable limits.",
            "List every exception with its expected behaviour.",
        ],
        Role::Architect => [
            "Map each design component to the quadrant it serves.",
            "Keep the design within the physical constraints.",
            "Show where each semantic contract rule is enforced.",
            "Design explicit handling for each exception.",
        ],
        Role::Dev => [
            "Implement the functional core first.",
            "Enforce the semantic contract inside the core logic.",
            "Handle every listed exception explicitly.",
            "Stay within the physical constraints.",
        ],
        Role::Qa => [
            "Derive at least one test per quadrant.",
            "Cover every semantic contract rule with a test.",
            "Exercise each listed exception and edge case.",
            "Check the physical constraints where they are testable.",
        ],
        Role::Ops => [
            "Verify the deployment meets the physical constraints.",
            "Document how exceptions surface in monitoring.",
            "Record operational risks against the quadrant they threaten.",
            "Confirm the runbook covers the listed failure modes.",
        ],
    }
}

fn section(out: &mut String, title: &str, text: &str) {
    let text = text.trim();
    out.push_str(&format!("\n### {}\n", title));
    out.push_str(if text.is_empty() { "(unspecified)" } else { text });
    out.push('\n');
}

/// Requirements section appended to a role's instruction.
pub fn requirements_prompt(slice: &Slice, quadrants: &Quadrants, role: Role) -> String {
    let mut out = format!(
        "## Four-quadrant requirements for slice {}: {}\n",
        slice.id, slice.title
    );
    section(&mut out, "Functional core", &quadrants.functional_core);
    section(&mut out, "Physical constraints", &quadrants.physical_constraints);
    section(&mut out, "Semantic contract", &quadrants.semantic_contract);
    section(&mut out, "Exceptions and edge cases", &quadrants.exceptions);
    out.push_str(&format!("\n### Directive for {}\n", role));
    for line in role_directive(role) {
        out.push_str(&format!("- {}\n", line));
    }
    out
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ControlSummary {
    pub total: usize,
    pub by_layer: BTreeMap<ControlLayer, usize>,
    pub by_status: BTreeMap<ControlStatus, usize>,
    /// Verified items as a percentage of all items.
    pub coverage: f64,
}

pub fn summarize_controls(items: &[ControlItem]) -> ControlSummary {
    let mut summary = ControlSummary {
        total: items.len(),
        ..Default::default()
    };
    for item in items {
        *summary.by_layer.entry(item.layer).or_default() += 1;
        *summary.by_status.entry(item.status).or_default() += 1;
    }
    let verified = summary
        .by_status
        .get(&ControlStatus::Verified)
        .copied()
        .unwrap_or(0);
    if summary.total > 0 {
        summary.coverage = (verified as f64 / summary.total as f64 * 1000.0).round() / 10.0;
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::models::{RiskLevel, SliceState};

    fn quadrants() -> Quadrants {
        Quadrants {
            functional_core: "Customers check out a cart and receive an order number".into(),
            physical_constraints: "- Python 3.12\n- p95 latency under 200ms\n- ok".into(),
            semantic_contract: "1. Order totals never go negative\n   even after coupons\n\
                                2) Stock is reserved before payment\n- short"
                .into(),
            exceptions: "* Card declined returns 402\n* Empty cart is rejected".into(),
        }
    }

    fn slice() -> Slice {
        Slice {
            id: 7,
            project_id: 1,
            title: "Checkout".into(),
            scope: String::new(),
            out_of_scope: String::new(),
            risk_level: RiskLevel::Medium,
            acceptance: Vec::new(),
            branch_name: "slice/0007-checkout".into(),
            state: SliceState::Dev,
            failed_step: None,
            version: 0,
            pr_number: None,
            pr_url: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn items_split_on_markers_and_join_continuations() {
        let items = split_items("- first rule\n  continued here\n* second\n3) third\nFourth line");
        assert_eq!(
            items,
            vec!["first rule continued here", "second", "third", "Fourth line"]
        );
        assert!(split_items("  \n\n").is_empty());
    }

    #[test]
    fn trace_items_follow_length_rules_and_numbering() {
        let items = derive_trace_items(&quadrants());
        let codes: Vec<&str> = items.iter().map(|i| i.code.as_str()).collect();
        assert_eq!(
            codes,
            vec!["FC-001", "PC-001", "PC-002", "SC-001", "SC-002", "EX-001", "EX-002"]
        );
        assert!(items[0].text.starts_with("Implement functional core: Customers"));
        assert_eq!(items[3].text, "Order totals never go negative even after coupons");
        assert_eq!(items[3].category, TraceCategory::Semantic);
    }

    #[test]
    fn functional_item_is_truncated() {
        let q = Quadrants {
            functional_core: "x".repeat(150),
            ..Default::default()
        };
        let items = derive_trace_items(&q);
        assert_eq!(items.len(), 1);
        assert!(items[0].text.ends_with(&format!("{}...", "x".repeat(100))));
    }

    #[test]
    fn control_layers_depend_on_quadrants() {
        let all = derive_control_items(&quadrants());
        let count = |layer| all.iter().filter(|c| c.layer == layer).count();
        assert_eq!(count(ControlLayer::Base), 4);
        assert_eq!(count(ControlLayer::Contract), 2);
        assert_eq!(count(ControlLayer::Slot), 4);
        assert_eq!(count(ControlLayer::Protection), 3);
        let contract = all
            .iter()
            .find(|c| c.layer == ControlLayer::Contract)
            .unwrap();
        assert_eq!(contract.tracking, "Trace SC-001");

        let functional_only = derive_control_items(&Quadrants {
            functional_core: "Checkout".into(),
            ..Default::default()
        });
        assert_eq!(functional_only.len(), 4);
        assert!(functional_only.iter().all(|c| c.layer == ControlLayer::Slot));
    }

    #[test]
    fn contract_controls_are_capped() {
        let q = Quadrants {
            semantic_contract: (1..=8)
                .map(|i| format!("- Rule number {} must hold", i))
                .collect::<Vec<_>>()
                .join("\n"),
            ..Default::default()
        };
        let contract = derive_control_items(&q)
            .into_iter()
            .filter(|c| c.layer == ControlLayer::Contract)
            .count();
        assert_eq!(contract, 5);
    }

    #[test]
    fn prompt_carries_quadrants_and_role_directive() {
        let q = Quadrants {
            functional_core: "Checkout".into(),
            ..Default::default()
        };
        let prompt = requirements_prompt(&slice(), &q, Role::Qa);
        assert!(prompt.starts_with("## Four-quadrant requirements for slice 7: Checkout"));
        assert!(prompt.contains("### Functional core\nCheckout\n"));
        assert!(prompt.contains("### Semantic contract\n(unspecified)\n"));
        assert!(prompt.contains("### Directive for qa"));
        assert!(prompt.contains("- Derive at least one test per quadrant."));
        assert!(!requirements_prompt(&slice(), &q, Role::Dev).contains("per quadrant."));
    }

    #[test]
    fn summary_counts_layers_statuses_and_coverage() {
        let item = |layer, status| ControlItem {
            id: 0,
            slice_id: 7,
            layer,
            item: "x".into(),
            source: "functional_core".into(),
            tracking: String::new(),
            acceptance: String::new(),
            status,
            updated_by: None,
            updated_at: String::new(),
        };
        let items = vec![
            item(ControlLayer::Slot, ControlStatus::Verified),
            item(ControlLayer::Slot, ControlStatus::Pending),
            item(ControlLayer::Base, ControlStatus::Failed),
        ];
        let summary = summarize_controls(&items);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_layer[&ControlLayer::Slot], 2);
        assert_eq!(summary.by_status[&ControlStatus::Failed], 1);
        assert_eq!(summary.coverage, 33.3);
        assert_eq!(summarize_controls(&[]).coverage, 0.0);
    }
}
