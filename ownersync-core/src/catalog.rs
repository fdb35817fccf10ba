//! Catalog of tracked reconciliation units.

use std::collections::BTreeMap;

use crate::error::{ReconcileError, ReconcileResult};
use crate::types::{ReconciliationUnit, UnitId};

/// Validated, immutable set of units keyed by id.
#[derive(Debug, Clone, Default)]
pub struct UnitCatalog {
    units: BTreeMap<UnitId, ReconciliationUnit>,
}

impl UnitCatalog {
    /// Every unit must validate and ids must be unique.
    pub fn new(units: impl IntoIterator<Item = ReconciliationUnit>) -> ReconcileResult<Self> {
        let mut by_id = BTreeMap::new();
        for unit in units {
            unit.validate()?;
            if by_id.contains_key(&unit.id) {
                return Err(ReconcileError::Validation(format!(
                    "unit '{}' declared twice",
                    unit.id
                )));
            }
            by_id.insert(unit.id.clone(), unit);
        }
        Ok(Self { units: by_id })
    }

    /// Unknown ids are a validation failure.
    pub fn get(&self, id: &UnitId) -> ReconcileResult<&ReconciliationUnit> {
        self.units
            .get(id)
            .ok_or_else(|| ReconcileError::Validation(format!("unknown unit '{id}'")))
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.units.contains_key(id)
    }

    /// Sorted.
    pub fn ids(&self) -> impl Iterator<Item = &UnitId> {
        self.units.keys()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemberId, UnitLocator};

    fn unit(id: &str) -> ReconciliationUnit {
        let mut unit = ReconciliationUnit::new(
            id,
            UnitLocator::new("directory", id),
            UnitLocator::new("github", format!("org/{id}")),
        );
        unit.managers.push(MemberId::new("alice"));
        unit
    }

    #[test]
    fn test_lookup_and_order() {
        let catalog = UnitCatalog::new([unit("payments"), unit("billing")]).unwrap();
        assert_eq!(catalog.len(), 2);
        assert!(catalog.get(&UnitId::new("payments")).is_ok());
        let ids: Vec<_> = catalog.ids().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["billing", "payments"]);
    }

    #[test]
    fn test_unknown_unit_is_validation_error() {
        let catalog = UnitCatalog::new([unit("payments")]).unwrap();
        let err = catalog.get(&UnitId::new("ghost")).unwrap_err();
        assert!(matches!(err, ReconcileError::Validation(_)));
    }

    #[test]
    fn test_rejects_duplicates_and_unmanaged_units() {
        assert!(UnitCatalog::new([unit("payments"), unit("payments")]).is_err());

        let mut orphan = unit("orphan");
        orphan.managers.clear();
        assert!(UnitCatalog::new([orphan]).is_err());
    }
}
