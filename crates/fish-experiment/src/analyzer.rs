//! Static analysis of the protocol sequence.
//!
//! Produces the round registry (which rounds can run, in which order, how
//! long they take and which cycling buffers they use) together with every
//! configuration problem found on the way. Analysis never stops at the first
//! problem: all findings are collected so the operator can fix them at once.
//!
//! # Rounds
//!
//! A `buffer` step whose name contains `ii` is a cycling buffer. Its family
//! is the text before the last `ii`. Round ids come from the declared buffer
//! names: a name starting with the family (case-insensitive) yields the
//! remainder as a round id. A round is admissible only if every family
//! covers it. Rounds covered by some families but not all are reported.
//!
//! Conditional blocks (`- - round: "1,3"`) add their own buffers and run
//! time to the listed rounds only. Their ids are checked by exact name
//! (`family + id`) for every family, conditional and default.
//!
//! Rounds are ordered by the position of the names matching the first
//! default family in the buffer table.

use fish_core::error::{AppResult, FluidicsError};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use tracing::{error, info, warn};

use crate::config::{Entry, ExperimentConfig, Step, ROUND_PLACEHOLDER};

// =============================================================================
// Findings
// =============================================================================

/// Severity of an analysis finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Something that will fail or be skipped at run time.
    Error,
    /// Worth knowing, nothing will fail.
    Warning,
}

/// One problem found during analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    /// How bad it is.
    pub severity: Severity,
    /// Operator-facing description.
    pub message: String,
}

impl Finding {
    fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        error!("{}", message);
        Self {
            severity: Severity::Error,
            message,
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        let message = message.into();
        warn!("{}", message);
        Self {
            severity: Severity::Warning,
            message,
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.severity {
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
        };
        write!(f, "{}: {}", label, self.message)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Per-round analysis result.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundInfo {
    /// Estimated run time in minutes.
    pub estimated_minutes: f64,
    /// Cycling buffers of this round, after `ii` substitution.
    pub cycling_buffers: Vec<String>,
}

/// Admissible rounds and their bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct RoundRegistry {
    order: Vec<String>,
    rounds: HashMap<String, RoundInfo>,
    default_minutes: f64,
    available: Vec<String>,
}

impl RoundRegistry {
    /// All admissible round ids, in run order.
    pub fn round_ids(&self) -> &[String] {
        &self.order
    }

    /// Info for an admissible round.
    pub fn round(&self, round_id: &str) -> Option<&RoundInfo> {
        self.rounds.get(round_id)
    }

    /// Estimated minutes for `round_id`, or the default sequence estimate.
    pub fn estimated_minutes(&self, round_id: &str) -> f64 {
        self.rounds
            .get(round_id)
            .map(|info| info.estimated_minutes)
            .unwrap_or(self.default_minutes)
    }

    /// Estimate of the sequence without conditional blocks.
    pub fn default_minutes(&self) -> f64 {
        self.default_minutes
    }

    /// Rounds not run yet in this session, in run order.
    pub fn available(&self) -> &[String] {
        &self.available
    }

    /// True if `round_id` can still run.
    pub fn is_available(&self, round_id: &str) -> bool {
        self.available.iter().any(|id| id == round_id)
    }

    /// Next round to run.
    pub fn next_available(&self) -> Option<&str> {
        self.available.first().map(String::as_str)
    }

    /// Mark `round_id` as done. A round can only be completed once.
    pub fn complete(&mut self, round_id: &str) -> AppResult<()> {
        let index = self
            .available
            .iter()
            .position(|id| id == round_id)
            .ok_or_else(|| FluidicsError::RoundUnavailable(round_id.to_string()))?;
        self.available.remove(index);
        info!(available = ?self.available, "Available rounds");
        Ok(())
    }
}

/// Registry plus findings.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    /// Round registry.
    pub registry: RoundRegistry,
    /// Fixed buffers used by every round.
    pub fixed_buffers: Vec<String>,
    /// Problems found.
    pub findings: Vec<Finding>,
}

impl Analysis {
    /// True if any finding is an error.
    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Error)
    }
}

// =============================================================================
// Analysis
// =============================================================================

/// Replace every `ii` in `template` with `round_id`.
pub fn substitute_round(template: &str, round_id: &str) -> String {
    template.replace(ROUND_PLACEHOLDER, round_id)
}

/// Family of a cycling buffer name: the text before the last `ii`.
pub fn cycling_family(name: &str) -> Option<&str> {
    name.rfind(ROUND_PLACEHOLDER).map(|i| &name[..i])
}

/// Buffers and run time collected from a list of steps.
#[derive(Debug, Default)]
struct Scope {
    templates: Vec<String>,
    seconds: f64,
}

impl Scope {
    fn families(&self) -> Vec<String> {
        let mut families = Vec::new();
        for template in &self.templates {
            if let Some(family) = cycling_family(template) {
                if !families.iter().any(|f| f == family) {
                    families.push(family.to_string());
                }
            }
        }
        families
    }
}

fn collect_step(step: &Step, scope: &mut Scope, fixed: &mut Vec<String>) {
    match step {
        Step::Buffer(name) if name.contains(ROUND_PLACEHOLDER) => {
            if !scope.templates.contains(name) {
                scope.templates.push(name.clone());
            }
        }
        Step::Buffer(name) => {
            if !fixed.contains(name) {
                fixed.push(name.clone());
            }
        }
        Step::Pump(s) | Step::Pause(s) => scope.seconds += s,
        Step::PumpValveOut(durations) => scope.seconds += durations.iter().sum::<f64>(),
        _ => {}
    }
}

fn starts_with_ignore_case<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    let head = name.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &name[prefix.len()..])
}

/// Analyze the sequence of `config`.
pub fn analyze(config: &ExperimentConfig) -> Analysis {
    info!("Analyze buffers that will change in sequential runs");
    let mut findings = Vec::new();
    let mut fixed = Vec::new();
    let mut default_scope = Scope::default();
    // Conditional ids in first-seen order.
    let mut conditional: Vec<(String, Scope)> = Vec::new();

    for entry in &config.sequence {
        match entry {
            Entry::Step(step) => collect_step(step, &mut default_scope, &mut fixed),
            Entry::Conditional(steps) => {
                let Some(ids) = entry.selector() else {
                    let action = steps.first().map(Step::action).unwrap_or("nothing");
                    findings.push(Finding::error(format!(
                        "First action in conditional sequence has to be \"round\" and not {}",
                        action
                    )));
                    continue;
                };
                let mut block = Scope::default();
                for step in steps {
                    collect_step(step, &mut block, &mut fixed);
                }
                for id in ids {
                    let index = match conditional.iter().position(|(c, _)| c == id) {
                        Some(i) => i,
                        None => {
                            conditional.push((id.clone(), Scope::default()));
                            conditional.len() - 1
                        }
                    };
                    let scope = &mut conditional[index].1;
                    scope.seconds += block.seconds;
                    for template in &block.templates {
                        if !scope.templates.contains(template) {
                            scope.templates.push(template.clone());
                        }
                    }
                }
            }
        }
    }

    let declared: Vec<&str> = config.buffer_names().collect();
    let declared_set: HashSet<&str> = declared.iter().copied().collect();

    // Fixed buffers
    let undefined_fixed: Vec<&String> = fixed
        .iter()
        .filter(|name| !declared_set.contains(name.as_str()))
        .collect();
    if undefined_fixed.is_empty() {
        info!(?fixed, "All FIXED buffers are defined in buffer list");
    } else {
        findings.push(Finding::error(format!(
            "Not all FIXED buffers are defined in buffer list! Please check: {:?}",
            undefined_fixed
        )));
    }

    let duplicates = config.duplicate_plate_positions();
    if !duplicates.is_empty() {
        findings.push(Finding::error(format!(
            "These Plate 1 positions are listed multiple times: {:?}",
            duplicates
        )));
    }

    let default_minutes = default_scope.seconds / 60.0;
    let default_families = default_scope.families();
    let conditional_ids: HashSet<&str> = conditional.iter().map(|(id, _)| id.as_str()).collect();

    let mut registry = RoundRegistry {
        default_minutes,
        ..Default::default()
    };

    if default_families.is_empty() {
        findings.push(Finding::warning("No buffer identified to loop over"));
        return Analysis {
            registry,
            fixed_buffers: fixed,
            findings,
        };
    }

    // Declared names matched by more than one family cannot be attributed.
    let all_families: Vec<String> = {
        let mut all = default_families.clone();
        for (_, scope) in &conditional {
            for family in scope.families() {
                if !all.contains(&family) {
                    all.push(family);
                }
            }
        }
        all
    };
    let mut ambiguous: HashSet<&str> = HashSet::new();
    for name in &declared {
        let matching: Vec<&String> = all_families
            .iter()
            .filter(|family| starts_with_ignore_case(name, family).is_some())
            .collect();
        if matching.len() > 1 {
            findings.push(Finding::error(format!(
                "Buffer {} matches several cycling families {:?}; it is not used for any of them",
                name, matching
            )));
            ambiguous.insert(*name);
        }
    }

    let ids_for_family = |family: &str| -> Vec<String> {
        declared
            .iter()
            .filter(|name| !ambiguous.contains(*name))
            .filter_map(|name| starts_with_ignore_case(name, family))
            .map(str::to_string)
            .collect()
    };

    let mut admissible: BTreeSet<String> = BTreeSet::new();

    // Default rounds: intersection over the default families.
    let per_family: Vec<BTreeSet<String>> = default_families
        .iter()
        .map(|family| {
            ids_for_family(family)
                .into_iter()
                .filter(|id| !conditional_ids.contains(id.as_str()))
                .collect()
        })
        .collect();
    let union: BTreeSet<String> = per_family.iter().flatten().cloned().collect();
    let intersection: BTreeSet<String> = union
        .iter()
        .filter(|id| per_family.iter().all(|ids| ids.contains(*id)))
        .cloned()
        .collect();
    let bad: Vec<&String> = union.difference(&intersection).collect();
    if !bad.is_empty() {
        findings.push(Finding::error(format!(
            "Round(s): {:?} can not be performed. Not all buffers defined.",
            bad
        )));
    }
    for id in &intersection {
        admissible.insert(id.clone());
    }

    // Conditional rounds: every family must have `family + id` declared.
    let declared_lower: HashSet<String> = declared
        .iter()
        .filter(|name| !ambiguous.contains(*name))
        .map(|name| name.to_ascii_lowercase())
        .collect();
    for (id, scope) in &conditional {
        let families: Vec<String> = scope
            .families()
            .into_iter()
            .chain(default_families.iter().cloned())
            .collect();
        let mut covered = 0;
        for family in &families {
            let wanted = format!("{}{}", family, id);
            if declared_lower.contains(&wanted.to_ascii_lowercase()) {
                covered += 1;
            } else {
                findings.push(Finding::error(format!(
                    "Buffer {} in conditional steps for round {} not defined!",
                    wanted, id
                )));
            }
        }
        if covered == families.len() {
            admissible.insert(id.clone());
        } else if covered > 0 {
            findings.push(Finding::error(format!(
                "Round(s): [{:?}] can not be performed. Not all buffers defined.",
                id
            )));
        }
    }

    // Order by the first default family, as listed in the buffer table.
    let mut order: Vec<String> = Vec::new();
    for id in ids_for_family(&default_families[0]) {
        if admissible.contains(&id) && !order.contains(&id) {
            order.push(id);
        }
    }

    // Every substituted buffer name must be declared as written.
    order.retain(|id| {
        let conditional_templates = conditional
            .iter()
            .find(|(c, _)| c == id)
            .map(|(_, scope)| scope.templates.as_slice())
            .unwrap_or_default();
        let missing: Vec<String> = default_scope
            .templates
            .iter()
            .chain(conditional_templates)
            .map(|template| substitute_round(template, id))
            .filter(|name| !declared_set.contains(name.as_str()))
            .collect();
        if missing.is_empty() {
            true
        } else {
            findings.push(Finding::error(format!(
                "Round {} skipped: buffers {:?} are not declared with this exact name",
                id, missing
            )));
            false
        }
    });

    for id in &order {
        let (minutes, templates): (f64, Vec<&String>) =
            match conditional.iter().find(|(c, _)| c == id) {
                Some((_, scope)) => (
                    default_minutes + scope.seconds / 60.0,
                    scope.templates.iter().chain(&default_scope.templates).collect(),
                ),
                None => (default_minutes, default_scope.templates.iter().collect()),
            };
        registry.rounds.insert(
            id.clone(),
            RoundInfo {
                estimated_minutes: minutes,
                cycling_buffers: templates
                    .into_iter()
                    .map(|template| substitute_round(template, id))
                    .collect(),
            },
        );
    }

    info!(rounds = ?order, default_minutes, "Identified round IDs");
    registry.available = order.clone();
    registry.order = order;

    Analysis {
        registry,
        fixed_buffers: fixed,
        findings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze_yaml(text: &str) -> Analysis {
        analyze(&ExperimentConfig::from_yaml_str(text).unwrap())
    }

    #[test]
    fn family_is_text_before_last_placeholder() {
        assert_eq!(cycling_family("washii"), Some("wash"));
        assert_eq!(cycling_family("probeii_ii"), Some("probeii_"));
        assert_eq!(cycling_family("wash"), None);
        assert_eq!(substitute_round("washii_b", "3"), "wash3_b");
    }

    #[test]
    fn rounds_follow_buffer_table_order() {
        let analysis = analyze_yaml(
            r#"
buffers:
  wash3: [1, 1, A3]
  wash1: [1, 1, A1]
  wash2: [1, 1, A2]
  hyb: [2, 1, B1]
sequence:
  - buffer: hyb
  - buffer: washii
  - pump: 90
  - pause: 30
  - pump_valve_out: [30, 30]
"#,
        );
        assert!(!analysis.has_errors(), "{:?}", analysis.findings);
        let registry = &analysis.registry;
        assert_eq!(registry.round_ids(), ["3", "1", "2"]);
        assert_eq!(registry.available(), ["3", "1", "2"]);
        assert_eq!(registry.estimated_minutes("1"), 3.0);
        assert_eq!(registry.round("2").unwrap().cycling_buffers, vec!["wash2"]);
        assert_eq!(analysis.fixed_buffers, vec!["hyb"]);
    }

    #[test]
    fn partially_covered_rounds_are_reported() {
        let analysis = analyze_yaml(
            r#"
buffers:
  probe1: [1, 1, A1]
  probe2: [2, 1, A2]
  probe3: [3, 1, A3]
  wash1: [4, 1, B1]
  wash3: [5, 1, B3]
sequence:
  - buffer: probeii
  - buffer: washii
"#,
        );
        assert_eq!(analysis.registry.round_ids(), ["1", "3"]);
        assert!(analysis
            .findings
            .iter()
            .any(|f| f.message.contains("[\"2\"] can not be performed")));
    }

    #[test]
    fn removing_a_family_buffer_removes_exactly_that_round() {
        let full = r#"
buffers:
  probe1: [1, 1, A1]
  probe2: [2, 1, A2]
  wash1: [4, 1, B1]
  wash2: [5, 1, B2]
sequence:
  - buffer: probeii
  - buffer: washii
"#;
        assert_eq!(analyze_yaml(full).registry.round_ids(), ["1", "2"]);

        let without_wash2 = full.replace("  wash2: [5, 1, B2]\n", "");
        assert_eq!(analyze_yaml(&without_wash2).registry.round_ids(), ["1"]);

        let without_probe1 = full.replace("  probe1: [1, 1, A1]\n", "");
        assert_eq!(analyze_yaml(&without_probe1).registry.round_ids(), ["2"]);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let analysis = analyze_yaml(
            r#"
buffers:
  Wash1: [1, 1, A1]
  WASH2: [1, 1, A2]
sequence:
  - buffer: Washii
"#,
        );
        // Both names match the family, but only Wash1 is reachable as written.
        assert_eq!(analysis.registry.round_ids(), ["1"]);
        assert!(analysis.has_errors());
    }

    #[test]
    fn conditional_blocks_extend_listed_rounds() {
        let analysis = analyze_yaml(
            r#"
buffers:
  wash1: [1, 1, A1]
  wash2: [1, 1, A2]
  wash3: [1, 1, A3]
  strip2: [2, 1, B2]
  extra: [3, 1, C1]
sequence:
  - buffer: washii
  - pump: 60
  - - round: "2"
    - buffer: stripii
    - buffer: extra
    - pause: 120
"#,
        );
        assert!(!analysis.has_errors(), "{:?}", analysis.findings);
        let registry = &analysis.registry;
        assert_eq!(registry.round_ids(), ["1", "2", "3"]);
        assert_eq!(registry.estimated_minutes("1"), 1.0);
        assert_eq!(registry.estimated_minutes("2"), 3.0);
        assert_eq!(
            registry.round("2").unwrap().cycling_buffers,
            vec!["strip2", "wash2"]
        );
        assert_eq!(analysis.fixed_buffers, vec!["extra"]);
    }

    #[test]
    fn conditional_round_missing_its_buffer_is_rejected() {
        let analysis = analyze_yaml(
            r#"
buffers:
  wash1: [1, 1, A1]
  wash2: [1, 1, A2]
sequence:
  - buffer: washii
  - - round: "2"
    - buffer: stripii
"#,
        );
        assert_eq!(analysis.registry.round_ids(), ["1"]);
        assert!(analysis
            .findings
            .iter()
            .any(|f| f.message.contains("strip2 in conditional steps for round 2")));
    }

    #[test]
    fn configuration_findings() {
        let analysis = analyze_yaml(
            r#"
buffers:
  wash1: [1, 1, A1]
  hyb: [2, 1, A1]
sequence:
  - buffer: washii
  - buffer: missing
  - - pause: 10
    - buffer: hyb
"#,
        );
        let messages: Vec<&str> = analysis.findings.iter().map(|f| f.message.as_str()).collect();
        assert!(messages.iter().any(|m| m.contains("FIXED") && m.contains("missing")));
        assert!(messages.iter().any(|m| m.contains("Plate 1 positions")));
        assert!(messages
            .iter()
            .any(|m| m.contains("has to be \"round\" and not pause")));
        assert_eq!(analysis.registry.round_ids(), ["1"]);
    }

    #[test]
    fn overlapping_families_are_a_configuration_error() {
        let analysis = analyze_yaml(
            r#"
buffers:
  probe1: [1, 1, A1]
  probe2: [2, 1, A2]
  probeB1: [3, 1, B1]
  probeB2: [4, 1, B2]
sequence:
  - buffer: probeii
  - buffer: probeBii
"#,
        );
        assert!(analysis
            .findings
            .iter()
            .any(|f| f.message.contains("probeB1 matches several cycling families")));
        // probeB* count for neither family, so family probeB has no rounds.
        assert!(analysis.registry.round_ids().is_empty());
    }

    #[test]
    fn no_cycling_family_yields_no_rounds() {
        let analysis = analyze_yaml(
            r#"
buffers:
  wash: [1, 1, A1]
sequence:
  - buffer: wash
  - pump: 30
"#,
        );
        assert!(analysis.registry.round_ids().is_empty());
        assert_eq!(analysis.findings.len(), 1);
        assert_eq!(analysis.findings[0].severity, Severity::Warning);
        assert_eq!(analysis.registry.default_minutes(), 0.5);
    }

    #[test]
    fn rounds_complete_at_most_once() {
        let mut registry = analyze_yaml(
            r#"
buffers:
  wash1: [1, 1, A1]
  wash2: [1, 1, A2]
sequence:
  - buffer: washii
"#,
        )
        .registry;

        registry.complete("1").unwrap();
        assert_eq!(registry.available(), ["2"]);
        assert_eq!(registry.next_available(), Some("2"));
        assert!(matches!(
            registry.complete("1"),
            Err(FluidicsError::RoundUnavailable(_))
        ));
        assert_eq!(registry.available(), ["2"]);
        assert_eq!(registry.round_ids(), ["1", "2"]);
    }
}
