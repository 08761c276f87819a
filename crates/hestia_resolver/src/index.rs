//! Candidate index / blocking engine.
//!
//! Narrows the full inventory to a small candidate set with cheap attribute
//! filters before any scoring runs. Pure function over a snapshot.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use hestia_common::{Domain, EntityRecord, Query};

/// Inventory snapshot taken from the registry at cycle start.
#[derive(Debug, Clone)]
pub struct InventorySnapshot {
    pub entities: Vec<EntityRecord>,
    pub taken_at: DateTime<Utc>,
}

impl InventorySnapshot {
    pub fn new(entities: Vec<EntityRecord>) -> Self {
        Self {
            entities,
            taken_at: Utc::now(),
        }
    }

    /// Restrict the snapshot to a fixed id pool (clarification re-runs are
    /// scoped to the session's original candidate set).
    pub fn restricted_to(&self, pool: &[String]) -> Self {
        Self {
            entities: self
                .entities
                .iter()
                .filter(|e| pool.iter().any(|id| *id == e.entity_id))
                .cloned()
                .collect(),
            taken_at: self.taken_at,
        }
    }
}

/// Blocking result: the candidate set plus whether the location filter had
/// to be relaxed to avoid returning empty.
#[derive(Debug, Clone)]
pub struct CandidateSet {
    pub entities: Vec<EntityRecord>,
    pub relaxed_location: bool,
}

impl CandidateSet {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entities.iter().map(|e| e.entity_id.clone()).collect()
    }
}

/// Domains implied by the query's device terms.
pub fn implied_domains(query: &Query) -> Vec<Domain> {
    let mut domains: Vec<Domain> = query
        .device_terms
        .iter()
        .filter_map(|t| Domain::from_device_term(t))
        .collect();
    domains.dedup();
    domains
}

/// Apply the ordered blocking filters: domain, then location.
///
/// The domain filter is never relaxed. The location filter is relaxed with a
/// warning when it would otherwise empty the candidate set.
pub fn block(snapshot: &InventorySnapshot, query: &Query) -> CandidateSet {
    let domains = implied_domains(query);

    let by_domain: Vec<EntityRecord> = if domains.is_empty() {
        // No term implied a domain; blocking cannot constrain by category.
        snapshot.entities.clone()
    } else {
        snapshot
            .entities
            .iter()
            .filter(|e| domains.contains(&e.domain))
            .cloned()
            .collect()
    };

    let (entities, relaxed_location) = match &query.location_term {
        Some(location) => {
            let by_location: Vec<EntityRecord> = by_domain
                .iter()
                .filter(|e| e.area_matches(location))
                .cloned()
                .collect();
            if by_location.is_empty() && !by_domain.is_empty() {
                warn!(
                    query_id = %query.id,
                    location = %location,
                    "location filter emptied candidate set, relaxing"
                );
                (by_domain, true)
            } else {
                (by_location, false)
            }
        }
        None => (by_domain, false),
    };

    debug!(
        query_id = %query.id,
        inventory = snapshot.entities.len(),
        candidates = entities.len(),
        relaxed = relaxed_location,
        "blocking complete"
    );

    CandidateSet {
        entities,
        relaxed_location,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hestia_common::query::ExtractedTerms;

    fn inventory() -> InventorySnapshot {
        InventorySnapshot::new(vec![
            EntityRecord::new("light.office_ceiling", Domain::Light, "Office Ceiling")
                .with_area("office"),
            EntityRecord::new("light.kitchen_ceiling", Domain::Light, "Kitchen Ceiling")
                .with_area("kitchen"),
            EntityRecord::new("switch.office_fan", Domain::Switch, "Office Fan")
                .with_area("office"),
            EntityRecord::new("lock.front_door", Domain::Lock, "Front Door").with_area("hall"),
        ])
    }

    fn query(terms: &[&str], location: Option<&str>) -> Query {
        Query::new(
            terms.join(" "),
            ExtractedTerms {
                device_terms: terms.iter().map(|s| s.to_string()).collect(),
                location_term: location.map(|s| s.to_string()),
            },
        )
    }

    #[test]
    fn domain_and_location_filters_apply_in_order() {
        let set = block(&inventory(), &query(&["light"], Some("office")));
        assert_eq!(set.ids(), vec!["light.office_ceiling"]);
        assert!(!set.relaxed_location);
    }

    #[test]
    fn location_invariant_holds_for_every_candidate() {
        let set = block(&inventory(), &query(&["light"], Some("kitchen")));
        assert!(!set.relaxed_location);
        assert!(set.entities.iter().all(|e| e.area_matches("kitchen")));
    }

    #[test]
    fn location_relaxes_instead_of_returning_empty() {
        let set = block(&inventory(), &query(&["light"], Some("garage")));
        assert!(set.relaxed_location);
        assert_eq!(set.entities.len(), 2); // both lights survive
    }

    #[test]
    fn domain_filter_is_never_relaxed() {
        let set = block(&inventory(), &query(&["vacuum"], None));
        assert!(set.is_empty());
        assert!(!set.relaxed_location);
    }

    #[test]
    fn no_implied_domain_keeps_full_inventory() {
        let set = block(&inventory(), &query(&["office"], None));
        assert_eq!(set.entities.len(), 4);
    }

    #[test]
    fn restricted_snapshot_scopes_reruns() {
        let snap = inventory().restricted_to(&["light.office_ceiling".to_string()]);
        assert_eq!(snap.entities.len(), 1);
        let set = block(&snap, &query(&["light"], None));
        assert_eq!(set.ids(), vec!["light.office_ceiling"]);
    }
}
