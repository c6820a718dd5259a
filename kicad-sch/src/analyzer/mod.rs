pub mod rules;

pub use rules::*;

use std::collections::HashMap;

use crate::core::{ValidationOptions, ValidationReport};
use crate::schematic::Schematic;

impl Schematic {
    /// Run every check with default options. Never mutates the document.
    pub fn validate(&self) -> Vec<Issue> {
        self.validate_with(&ValidationOptions::default(), &HashMap::new())
            .issues
    }

    /// Run the enabled checks. Sheet pins are matched against the loaded
    /// child in `children` (keyed by sheet file name) when present.
    pub fn validate_with(
        &self,
        options: &ValidationOptions,
        children: &HashMap<String, &Schematic>,
    ) -> ValidationReport {
        let engine = RulesEngine::with_default_rules();
        let ctx = RuleContext::new(self, options, children);
        let report = ValidationReport::new(engine.analyze(&ctx));
        tracing::debug!(
            "Validated {}: {} errors, {} warnings",
            self.project(),
            report.stats.errors,
            report.stats.warnings
        );
        report
    }
}
