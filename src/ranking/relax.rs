//! Relax policy: peel soft filters, in order, until enough results remain.
//!
//! Order is fixed: `openState -> isGlutenFree -> minRatingBucket ->
//! priceIntent`. Hard constraints (kosher, meat/dairy) are never relaxed;
//! when they stand between the user and an acceptable result count, the
//! denial is recorded and surfaced in meta instead.

use crate::search::{Place, RelaxDenial, SharedFilters};

use super::filter::{FilterCounters, FilterOptions, post_filter};

/// Reason code attached to denied relaxations.
const HARD_CONSTRAINT: &str = "HARD_CONSTRAINT";

#[derive(Debug)]
pub struct RelaxOutcome {
    pub results: Vec<Place>,
    pub counters: FilterCounters,
    /// Soft filters removed, in relaxation order.
    pub relaxed: Vec<&'static str>,
    /// Requested relaxations that were refused.
    pub denied: Vec<RelaxDenial>,
}

/// Run the post-filter, relaxing soft filters one at a time while the
/// output stays below `min_acceptable`.
pub fn filter_with_relaxation(
    pool: &[Place],
    filters: &SharedFilters,
    opts: &FilterOptions,
    min_acceptable: usize,
) -> RelaxOutcome {
    let mut active = filters.clone();
    let mut relaxed = Vec::new();

    let (mut results, mut counters) = post_filter(pool.to_vec(), &active, opts);

    for step in RELAX_ORDER {
        if results.len() >= min_acceptable {
            break;
        }
        if !(step.applies)(&active) {
            continue;
        }
        (step.clear)(&mut active);
        relaxed.push(step.field);
        tracing::debug!(field = step.field, "relaxing soft filter");
        (results, counters) = post_filter(pool.to_vec(), &active, opts);
    }

    // Still short: the hard constraints stay, each recorded as denied.
    let mut denied = Vec::new();
    if results.len() < min_acceptable {
        if filters.is_kosher {
            denied.push(RelaxDenial {
                field: "isKosher".to_string(),
                reason_code: HARD_CONSTRAINT.to_string(),
            });
        }
        if filters.meat_dairy.is_some() {
            denied.push(RelaxDenial {
                field: "meatDairy".to_string(),
                reason_code: HARD_CONSTRAINT.to_string(),
            });
        }
    }

    RelaxOutcome {
        results,
        counters,
        relaxed,
        denied,
    }
}

struct RelaxStep {
    field: &'static str,
    applies: fn(&SharedFilters) -> bool,
    clear: fn(&mut SharedFilters),
}

const RELAX_ORDER: [RelaxStep; 4] = [
    RelaxStep {
        field: "openState",
        applies: |f| f.open_state.is_some(),
        clear: |f| f.open_state = None,
    },
    RelaxStep {
        field: "isGlutenFree",
        applies: |f| f.is_gluten_free,
        clear: |f| f.is_gluten_free = false,
    },
    RelaxStep {
        field: "minRatingBucket",
        applies: |f| f.min_rating_bucket.is_some(),
        clear: |f| f.min_rating_bucket = None,
    },
    RelaxStep {
        field: "priceIntent",
        applies: |f| f.price_intent.is_some(),
        clear: |f| f.price_intent = None,
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{LatLng, OpenNow, OpenStateFilter, PriceIntent, RatingBucket};
    use pretty_assertions::assert_eq;

    fn place(id: &str, open: OpenNow, rating: Option<f64>, price: Option<u8>) -> Place {
        Place {
            place_id: id.to_string(),
            name: id.to_string(),
            address: None,
            location: LatLng {
                lat: 32.0,
                lng: 34.7,
            },
            open_now: open,
            rating,
            user_ratings_total: None,
            price_level: price,
            types: vec![],
            opening_periods: vec![],
            distance_meters: None,
            cuisine_score: None,
            dietary_hints: vec![],
        }
    }

    #[test]
    fn test_no_relaxation_when_enough_results() {
        let pool = vec![
            place("a", OpenNow::Open, Some(4.5), Some(1)),
            place("b", OpenNow::Open, Some(4.6), Some(1)),
        ];
        let filters = SharedFilters {
            open_state: Some(OpenStateFilter::OpenNow),
            ..Default::default()
        };
        let outcome = filter_with_relaxation(&pool, &filters, &FilterOptions::default(), 2);
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.relaxed.is_empty());
        assert!(outcome.denied.is_empty());
    }

    #[test]
    fn test_relaxes_open_state_first() {
        let pool = vec![
            place("closed-1", OpenNow::Closed, Some(4.5), None),
            place("closed-2", OpenNow::Closed, Some(4.2), None),
        ];
        let filters = SharedFilters {
            open_state: Some(OpenStateFilter::OpenNow),
            min_rating_bucket: Some(RatingBucket::R40),
            ..Default::default()
        };
        let outcome = filter_with_relaxation(&pool, &filters, &FilterOptions::default(), 2);
        assert_eq!(outcome.relaxed, vec!["openState"]);
        assert_eq!(outcome.results.len(), 2);
    }

    #[test]
    fn test_relax_order_is_respected() {
        // Nothing passes until every soft filter is gone.
        let pool = vec![place("x", OpenNow::Closed, Some(3.0), Some(4))];
        let filters = SharedFilters {
            open_state: Some(OpenStateFilter::OpenNow),
            is_gluten_free: true,
            min_rating_bucket: Some(RatingBucket::R45),
            price_intent: Some(PriceIntent::Cheap),
            ..Default::default()
        };
        let outcome = filter_with_relaxation(&pool, &filters, &FilterOptions::default(), 1);
        assert_eq!(
            outcome.relaxed,
            vec!["openState", "isGlutenFree", "minRatingBucket", "priceIntent"]
        );
        assert_eq!(outcome.results.len(), 1);
    }

    #[test]
    fn test_hard_constraints_recorded_as_denied() {
        let pool: Vec<Place> = vec![];
        let filters = SharedFilters {
            open_state: Some(OpenStateFilter::OpenNow),
            is_kosher: true,
            meat_dairy: Some(crate::search::MeatDairy::Meat),
            ..Default::default()
        };
        let outcome = filter_with_relaxation(&pool, &filters, &FilterOptions::default(), 1);
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.relaxed, vec!["openState"]);
        let fields: Vec<&str> = outcome.denied.iter().map(|d| d.field.as_str()).collect();
        assert_eq!(fields, vec!["isKosher", "meatDairy"]);
        for denial in &outcome.denied {
            assert_eq!(denial.reason_code, "HARD_CONSTRAINT");
        }
    }

    #[test]
    fn test_partial_relaxation_stops_early() {
        let pool = vec![
            place("ok", OpenNow::Closed, Some(4.8), Some(1)),
            place("also-ok", OpenNow::Closed, Some(4.7), Some(1)),
        ];
        let filters = SharedFilters {
            open_state: Some(OpenStateFilter::OpenNow),
            min_rating_bucket: Some(RatingBucket::R45),
            price_intent: Some(PriceIntent::Cheap),
            ..Default::default()
        };
        let outcome = filter_with_relaxation(&pool, &filters, &FilterOptions::default(), 2);
        // Dropping openState alone is enough; rating and price survive.
        assert_eq!(outcome.relaxed, vec!["openState"]);
        assert_eq!(outcome.results.len(), 2);
    }
}
