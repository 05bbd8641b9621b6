//! Plan resolution
//!
//! Maps a Stripe price id to plan metadata (tier + photo allotment). The
//! catalog is built from configured price ids; anything not in the catalog
//! falls through to a substring heuristic so that a price added in the
//! Stripe dashboard before a deploy still resolves to a usable tier instead
//! of failing the event. Heuristic hits are surfaced as a distinct variant
//! and logged at warn level so catalog drift stays auditable.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use stageright_shared::PlanType;

use crate::client::PriceIds;

/// Plan metadata: tier plus per-cycle photo allotment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_type: PlanType,
    pub photos_limit: i32,
}

impl Plan {
    pub fn for_plan_type(plan_type: PlanType) -> Self {
        Self {
            plan_type,
            photos_limit: plan_type.photos_included(),
        }
    }

    pub fn free() -> Self {
        Self::for_plan_type(PlanType::Free)
    }

    pub fn standard() -> Self {
        Self::for_plan_type(PlanType::Standard)
    }

    pub fn agency() -> Self {
        Self::for_plan_type(PlanType::Agency)
    }
}

/// How a price id was resolved to a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanResolution {
    /// Exact catalog match
    Catalog(Plan),
    /// Substring heuristic; the catalog had no entry for the price id
    Heuristic(Plan),
}

impl PlanResolution {
    pub fn plan(&self) -> Plan {
        match self {
            Self::Catalog(plan) | Self::Heuristic(plan) => *plan,
        }
    }

    pub fn is_heuristic(&self) -> bool {
        matches!(self, Self::Heuristic(_))
    }
}

/// Plan catalog keyed by Stripe price id.
///
/// Read-only after construction; safe to share across tasks without locking.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    by_price_id: HashMap<String, Plan>,
}

impl PlanCatalog {
    /// Build the catalog from configured price ids
    pub fn new(price_ids: &PriceIds) -> Self {
        let mut by_price_id = HashMap::new();
        by_price_id.insert(price_ids.standard.clone(), Plan::standard());
        by_price_id.insert(price_ids.agency.clone(), Plan::agency());
        if let Some(id) = &price_ids.standard_annual {
            by_price_id.insert(id.clone(), Plan::standard());
        }
        if let Some(id) = &price_ids.agency_annual {
            by_price_id.insert(id.clone(), Plan::agency());
        }
        Self { by_price_id }
    }

    /// Catalog with explicit entries (tests, scripts)
    pub fn with_entries(entries: impl IntoIterator<Item = (String, Plan)>) -> Self {
        Self {
            by_price_id: entries.into_iter().collect(),
        }
    }

    /// Resolve a price id to plan metadata.
    ///
    /// Falls back to a substring heuristic when the catalog misses:
    /// "agency" anywhere in the price id means the agency tier, anything
    /// else means standard.
    pub fn resolve(&self, price_id: &str) -> PlanResolution {
        if let Some(plan) = self.by_price_id.get(price_id) {
            return PlanResolution::Catalog(*plan);
        }

        let plan = if price_id.to_lowercase().contains("agency") {
            Plan::agency()
        } else {
            Plan::standard()
        };

        tracing::warn!(
            price_id = %price_id,
            resolved_plan = %plan.plan_type,
            "Price id not in plan catalog - resolved heuristically"
        );

        PlanResolution::Heuristic(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> PlanCatalog {
        PlanCatalog::with_entries([
            ("price_std_monthly".to_string(), Plan::standard()),
            ("price_agency_monthly".to_string(), Plan::agency()),
        ])
    }

    #[test]
    fn test_catalog_hit() {
        let resolution = catalog().resolve("price_agency_monthly");
        assert!(!resolution.is_heuristic());
        assert_eq!(resolution.plan(), Plan::agency());
    }

    #[test]
    fn test_heuristic_agency_substring() {
        let resolution = catalog().resolve("price_agency_v2_annual");
        assert!(resolution.is_heuristic());
        assert_eq!(resolution.plan().plan_type, PlanType::Agency);
        assert_eq!(resolution.plan().photos_limit, 300);
    }

    #[test]
    fn test_heuristic_defaults_to_standard() {
        let resolution = catalog().resolve("price_mystery_plan");
        assert!(resolution.is_heuristic());
        assert_eq!(resolution.plan().plan_type, PlanType::Standard);
        assert_eq!(resolution.plan().photos_limit, 50);
    }
}
