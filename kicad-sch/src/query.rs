//! Component queries and bulk field updates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::Result;
use crate::geometry::{bounding_box, Position, Rect};
use crate::schema::{Component, ComponentId};
use crate::schematic::{apply_property, check_property_key, Schematic};

/// Predicates combined with AND. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentCriteria {
    pub lib_id: Option<String>,
    /// Exact reference designator.
    pub reference: Option<String>,
    /// Reference designator prefix, e.g. `"R"`.
    pub reference_prefix: Option<String>,
    pub value: Option<String>,
    pub footprint: Option<String>,
    pub properties: BTreeMap<String, String>,
}

impl ComponentCriteria {
    pub fn lib_id(mut self, lib_id: impl Into<String>) -> Self {
        self.lib_id = Some(lib_id.into());
        self
    }

    pub fn reference_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.reference_prefix = Some(prefix.into());
        self
    }

    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, component: &Component) -> bool {
        fn eq(expected: &Option<String>, actual: &str) -> bool {
            expected.as_deref().map_or(true, |e| e == actual)
        }

        eq(&self.lib_id, &component.lib_id)
            && eq(&self.reference, &component.reference)
            && self
                .reference_prefix
                .as_deref()
                .map_or(true, |p| component.reference.starts_with(p))
            && eq(&self.value, &component.value)
            && eq(&self.footprint, &component.footprint)
            && self
                .properties
                .iter()
                .all(|(k, v)| component.property(k) == Some(v.as_str()))
    }
}

/// Field changes merged into every matched component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentUpdate {
    pub value: Option<String>,
    pub footprint: Option<String>,
    pub properties: BTreeMap<String, String>,
}

impl ComponentUpdate {
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.footprint.is_none() && self.properties.is_empty()
    }

    /// Apply to `component`, reporting whether anything changed.
    fn apply(&self, component: &mut Component) -> bool {
        let mut changed = false;
        if let Some(value) = &self.value {
            changed |= component.value != *value;
            component.value = value.clone();
        }
        if let Some(footprint) = &self.footprint {
            changed |= component.footprint != *footprint;
            component.footprint = footprint.clone();
        }
        for (key, value) in &self.properties {
            changed |= component.property(key) != Some(value.as_str());
            apply_property(component, key, value);
        }
        changed
    }
}

impl Schematic {
    pub fn filter(&self, criteria: &ComponentCriteria) -> Vec<ComponentId> {
        self.components()
            .filter(|c| criteria.matches(c))
            .map(|c| c.id.clone())
            .collect()
    }

    /// Components whose bounding box touches the rectangle spanned by the
    /// two corners. Unresolved components are treated as a point at their
    /// position.
    pub fn in_area(&self, x1: f64, y1: f64, x2: f64, y2: f64) -> Vec<ComponentId> {
        let area = Rect::from_corners(Position::new(x1, y1), Position::new(x2, y2));
        self.components()
            .filter(|c| {
                let extent = match self.symbol(&c.lib_id) {
                    Some(symbol) => bounding_box(&symbol, &c.placement),
                    None => Rect::point(c.position()),
                };
                area.intersects(&extent)
            })
            .map(|c| c.id.clone())
            .collect()
    }

    /// Apply `update` to every component matching `criteria`; returns how
    /// many were modified. Each component is updated as a whole, but a
    /// failure leaves earlier components in the batch updated.
    pub fn bulk_update(&mut self, criteria: &ComponentCriteria, update: &ComponentUpdate) -> Result<usize> {
        for key in update.properties.keys() {
            check_property_key(key)?;
        }
        if update.is_empty() {
            return Ok(0);
        }

        let matched = self.filter(criteria);
        let mut modified = 0;
        for id in &matched {
            let unchanged = self
                .component_by_id(id)
                .map(|c| !update.apply(&mut c.clone()))
                .unwrap_or(true);
            if unchanged {
                continue;
            }
            self.update_component_by_id(id, |c| {
                update.apply(c);
                Ok(())
            })?;
            modified += 1;
        }
        tracing::debug!("Bulk update modified {} of {} components", modified, matched.len());
        Ok(modified)
    }
}
