use once_cell::unsync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::connectivity::Connectivity;
use crate::core::ValidationOptions;
use crate::geometry::{bounding_box, Position, Rect};
use crate::schema::{Component, LabelKind};
use crate::schematic::Schematic;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    /// Identity tokens of the elements involved.
    pub elements: Vec<String>,
    pub location: Option<Position>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl Issue {
    fn new(rule: &dyn Rule, message: String, elements: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule.id().to_string(),
            severity: rule.severity(),
            message,
            elements,
            location: None,
            suggestion: None,
        }
    }

    fn at(mut self, location: Position) -> Self {
        self.location = Some(location);
        self
    }

    fn suggest(mut self, suggestion: &str) -> Self {
        self.suggestion = Some(suggestion.to_string());
        self
    }
}

/// Everything a rule may look at during one validation pass.
pub struct RuleContext<'a> {
    pub schematic: &'a Schematic,
    pub options: &'a ValidationOptions,
    /// Loaded child documents keyed by the file name their sheet refers to.
    pub children: &'a HashMap<String, &'a Schematic>,
    connectivity: OnceCell<Connectivity>,
}

impl<'a> RuleContext<'a> {
    pub fn new(
        schematic: &'a Schematic,
        options: &'a ValidationOptions,
        children: &'a HashMap<String, &'a Schematic>,
    ) -> Self {
        Self {
            schematic,
            options,
            children,
            connectivity: OnceCell::new(),
        }
    }

    /// Connectivity snapshot, built once per pass.
    pub(crate) fn connectivity(&self) -> &Connectivity {
        self.connectivity
            .get_or_init(|| Connectivity::build(self.schematic))
    }
}

pub trait Rule: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn severity(&self) -> Severity;
    fn check(&self, ctx: &RuleContext<'_>) -> Vec<Issue>;
}

pub struct RulesEngine {
    rules: Vec<Arc<dyn Rule>>,
}

impl RulesEngine {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_default_rules() -> Self {
        let mut engine = Self::new();
        engine.add_rule(Arc::new(DuplicateReferenceRule));
        engine.add_rule(Arc::new(DanglingPinRule));
        engine.add_rule(Arc::new(OverlappingPlacementRule));
        engine.add_rule(Arc::new(UnmatchedSheetPinRule));
        engine.add_rule(Arc::new(UnresolvedSymbolRule));
        engine.add_rule(Arc::new(ZeroLengthWireRule));
        engine.add_rule(Arc::new(ConflictingNetNamesRule));
        engine
    }

    pub fn add_rule(&mut self, rule: Arc<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> impl Iterator<Item = &Arc<dyn Rule>> + '_ {
        self.rules.iter()
    }

    /// Run every enabled rule. Rules never short-circuit each other.
    pub fn analyze(&self, ctx: &RuleContext<'_>) -> Vec<Issue> {
        let mut issues = Vec::new();
        for rule in &self.rules {
            if ctx.options.rule_enabled(rule.id()) {
                issues.extend(rule.check(ctx));
            }
        }
        if ctx.options.strict_mode {
            for issue in &mut issues {
                if issue.severity == Severity::Warning {
                    issue.severity = Severity::Error;
                }
            }
        }
        issues
    }
}

impl Default for RulesEngine {
    fn default() -> Self {
        Self::with_default_rules()
    }
}

// Rule implementations

pub struct DuplicateReferenceRule;

impl Rule for DuplicateReferenceRule {
    fn id(&self) -> &str {
        "duplicate_reference"
    }

    fn name(&self) -> &str {
        "Duplicate Reference Designator"
    }

    fn severity(&self) -> Severity {
        Severity::Error
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Vec<Issue> {
        let mut by_reference: BTreeMap<&str, Vec<&Component>> = BTreeMap::new();
        for component in ctx.schematic.components() {
            by_reference
                .entry(component.reference.as_str())
                .or_default()
                .push(component);
        }

        by_reference
            .into_iter()
            .filter(|(_, group)| group.len() > 1 && !is_multi_unit(group))
            .map(|(reference, group)| {
                Issue::new(
                    self,
                    format!(
                        "Reference {} is used by {} components",
                        reference,
                        group.len()
                    ),
                    group.iter().map(|c| c.id.to_string()).collect(),
                )
                .at(group[0].position())
                .suggest("Re-annotate so every component has a unique reference")
            })
            .collect()
    }
}

/// Units of one multi-unit part share a reference.
fn is_multi_unit(group: &[&Component]) -> bool {
    let mut units = HashSet::new();
    group.iter().all(|c| c.lib_id == group[0].lib_id && units.insert(c.unit))
}

pub struct DanglingPinRule;

impl Rule for DanglingPinRule {
    fn id(&self) -> &str {
        "dangling_pin"
    }

    fn name(&self) -> &str {
        "Dangling Pin"
    }

    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Vec<Issue> {
        ctx.connectivity()
            .dangling_pins()
            .map(|pin| {
                Issue::new(
                    self,
                    format!("Pin {} of {} is not connected", pin.number, pin.reference),
                    vec![pin.component.to_string()],
                )
                .at(pin.position)
                .suggest("Connect the pin or place a no-connect marker on it")
            })
            .collect()
    }
}

pub struct OverlappingPlacementRule;

impl Rule for OverlappingPlacementRule {
    fn id(&self) -> &str {
        "overlapping_placement"
    }

    fn name(&self) -> &str {
        "Overlapping Placement"
    }

    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Vec<Issue> {
        let tolerance = ctx.options.overlap_tolerance.max(0.0);
        let placed: Vec<(&Component, Rect)> = ctx
            .schematic
            .components()
            .filter_map(|c| {
                let symbol = ctx.schematic.symbol(&c.lib_id)?;
                Some((c, bounding_box(&symbol, &c.placement)))
            })
            .collect();

        let mut issues = Vec::new();
        for (i, (a, box_a)) in placed.iter().enumerate() {
            for (b, box_b) in &placed[i + 1..] {
                let Some((width, height)) = box_a.overlap(box_b) else {
                    continue;
                };
                if width > tolerance && height > tolerance {
                    issues.push(
                        Issue::new(
                            self,
                            format!(
                                "{} and {} overlap by {:.2} x {:.2} mm",
                                a.reference, b.reference, width, height
                            ),
                            vec![a.id.to_string(), b.id.to_string()],
                        )
                        .at(b.position()),
                    );
                }
            }
        }
        issues
    }
}

pub struct UnmatchedSheetPinRule;

impl Rule for UnmatchedSheetPinRule {
    fn id(&self) -> &str {
        "unmatched_sheet_pin"
    }

    fn name(&self) -> &str {
        "Unmatched Sheet Pin"
    }

    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Vec<Issue> {
        let mut issues = Vec::new();
        for sheet in ctx.schematic.sheets() {
            let scope = ctx
                .children
                .get(&sheet.file_name)
                .copied()
                .unwrap_or(ctx.schematic);
            let names: HashSet<&str> = scope
                .labels()
                .filter(|l| l.kind == LabelKind::Hierarchical)
                .map(|l| l.text.as_str())
                .collect();

            for pin in &sheet.pins {
                if !names.contains(pin.name.as_str()) {
                    issues.push(
                        Issue::new(
                            self,
                            format!(
                                "Sheet pin {} on {} has no matching hierarchical label",
                                pin.name, sheet.name
                            ),
                            vec![sheet.id.to_string(), pin.id.to_string()],
                        )
                        .at(sheet.pin_position(pin)),
                    );
                }
            }
        }
        issues
    }
}

pub struct UnresolvedSymbolRule;

impl Rule for UnresolvedSymbolRule {
    fn id(&self) -> &str {
        "unresolved_symbol"
    }

    fn name(&self) -> &str {
        "Unresolved Symbol"
    }

    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Vec<Issue> {
        ctx.schematic
            .components()
            .filter(|c| ctx.schematic.symbol(&c.lib_id).is_none())
            .map(|c| {
                Issue::new(
                    self,
                    format!("Symbol {} for {} cannot be found", c.lib_id, c.reference),
                    vec![c.id.to_string()],
                )
                .at(c.position())
                .suggest("Add the symbol library to the search path")
            })
            .collect()
    }
}

pub struct ZeroLengthWireRule;

impl Rule for ZeroLengthWireRule {
    fn id(&self) -> &str {
        "zero_length_wire"
    }

    fn name(&self) -> &str {
        "Zero-Length Wire"
    }

    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Vec<Issue> {
        ctx.schematic
            .wires()
            .filter(|w| w.start.coincides(&w.end))
            .map(|w| {
                Issue::new(
                    self,
                    format!("Wire at {} has zero length", w.start),
                    vec![w.id.to_string()],
                )
                .at(w.start)
            })
            .collect()
    }
}

pub struct ConflictingNetNamesRule;

impl Rule for ConflictingNetNamesRule {
    fn id(&self) -> &str {
        "conflicting_net_names"
    }

    fn name(&self) -> &str {
        "Conflicting Net Names"
    }

    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Vec<Issue> {
        let mut conflicts: Vec<(String, Vec<String>)> = ctx
            .connectivity()
            .groups
            .values()
            .filter(|g| g.names.len() > 1)
            .map(|g| {
                let names: Vec<&str> = g.names.iter().map(String::as_str).collect();
                let mut labels: Vec<String> = g.labels.iter().map(|l| l.to_string()).collect();
                labels.sort();
                (names.join(", "), labels)
            })
            .collect();
        conflicts.sort();

        conflicts
            .into_iter()
            .map(|(names, labels)| {
                Issue::new(
                    self,
                    format!("One net carries several names: {}", names),
                    labels,
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::SymbolLibrary;
    use crate::schema::{LabelShape, Size};

    fn schematic() -> Schematic {
        Schematic::with_library("Rules", Arc::new(SymbolLibrary::builtin()))
    }

    fn run(sch: &Schematic, rule: &dyn Rule) -> Vec<Issue> {
        let options = ValidationOptions::default();
        let children = HashMap::new();
        rule.check(&RuleContext::new(sch, &options, &children))
    }

    #[test]
    fn test_dangling_pin_rule() {
        let mut sch = schematic();
        sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), None)
            .unwrap();
        assert_eq!(run(&sch, &DanglingPinRule).len(), 2);

        sch.add_label_to_pin("R1", "1", "A").unwrap();
        sch.add_no_connect(sch.pin_position("R1", "2").unwrap());
        assert!(run(&sch, &DanglingPinRule).is_empty());
    }

    #[test]
    fn test_overlap_respects_tolerance() {
        let mut sch = schematic();
        sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), None)
            .unwrap();
        sch.add_component("Device:R", "R2", "10k", (100.5, 100.0), None)
            .unwrap();
        sch.add_component("Device:R", "R3", "10k", (150.0, 100.0), None)
            .unwrap();
        let issues = run(&sch, &OverlappingPlacementRule);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.starts_with("R1 and R2"));

        let options = ValidationOptions {
            overlap_tolerance: 50.0,
            ..Default::default()
        };
        let children = HashMap::new();
        let ctx = RuleContext::new(&sch, &options, &children);
        assert!(OverlappingPlacementRule.check(&ctx).is_empty());
    }

    #[test]
    fn test_unmatched_sheet_pin_uses_child_when_loaded() {
        let mut sch = schematic();
        let sheet = sch.add_sheet("Power", "power.kicad_sch", (50.0, 50.0), Size::new(20.0, 10.0));
        sch.add_sheet_pin(&sheet, "VIN", LabelShape::Input, (0.0, 5.0))
            .unwrap();
        assert_eq!(run(&sch, &UnmatchedSheetPinRule).len(), 1);

        let mut child = schematic();
        child.add_hierarchical_label("VIN", (10.0, 10.0), LabelShape::Input);
        let children = HashMap::from([("power.kicad_sch".to_string(), &child)]);
        let options = ValidationOptions::default();
        let ctx = RuleContext::new(&sch, &options, &children);
        assert!(UnmatchedSheetPinRule.check(&ctx).is_empty());
    }

    #[test]
    fn test_conflicting_names_and_zero_length_wire() {
        let mut sch = schematic();
        sch.add_wire((0.0, 0.0), (10.0, 0.0));
        sch.add_wire((20.0, 20.0), (20.0, 20.0));
        sch.add_label("A", (0.0, 0.0));
        sch.add_label("B", (10.0, 0.0));

        let conflicts = run(&sch, &ConflictingNetNamesRule);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].message, "One net carries several names: A, B");
        assert_eq!(conflicts[0].elements.len(), 2);
        assert_eq!(run(&sch, &ZeroLengthWireRule).len(), 1);
    }

    #[test]
    fn test_strict_mode_and_rule_selection() {
        let mut sch = schematic();
        sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), None)
            .unwrap();
        let engine = RulesEngine::with_default_rules();
        let children = HashMap::new();

        let options = ValidationOptions {
            strict_mode: true,
            ..Default::default()
        };
        let issues = engine.analyze(&RuleContext::new(&sch, &options, &children));
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().all(|i| i.severity == Severity::Error));

        let options = ValidationOptions {
            rules: vec!["zero_length_wire".to_string()],
            ..Default::default()
        };
        assert!(engine
            .analyze(&RuleContext::new(&sch, &options, &children))
            .is_empty());
    }
}
