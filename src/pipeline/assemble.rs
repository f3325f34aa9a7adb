//! Assistant assembly: the final `SearchResponse`.

use crate::ranking::{DistanceOrigin, FilterCounters, RankingProfile};
use crate::search::{
    Chip, LatLng, Place, RelaxDenial, ResponseMeta, ResultGroups, SearchResponse, SharedFilters,
};

/// Distance bands for the street-anchor grouping.
const EXACT_RADIUS_M: f64 = 150.0;
const NEARBY_GROUP_RADIUS_M: f64 = 1_000.0;

pub struct AssemblyInput<'a> {
    pub results: Vec<Place>,
    /// Anchor point when the search was a landmark plan; enables grouping.
    pub street_anchor: Option<LatLng>,
    pub filters: &'a SharedFilters,
    pub has_user_location: bool,
    pub counters: FilterCounters,
    pub profile: RankingProfile,
    pub origin: DistanceOrigin,
    pub relaxed: Vec<&'static str>,
    pub denied: Vec<RelaxDenial>,
}

pub fn assemble(input: AssemblyInput<'_>) -> SearchResponse {
    let groups = input
        .street_anchor
        .map(|anchor| group_by_distance(&input.results, anchor));
    let chips = suggest_chips(input.filters, input.has_user_location);

    SearchResponse {
        results: input.results,
        groups,
        chips,
        assist: None,
        meta: ResponseMeta {
            total_before_filter: input.counters.before,
            total_after_filter: input.counters.after,
            ranking_profile: Some(input.profile.name().to_string()),
            distance_origin: Some(input.origin.name().to_string()),
            relaxed: input.relaxed.iter().map(|s| s.to_string()).collect(),
            relax_denied: input.denied,
            failure_reason: None,
        },
    }
}

/// EXACT/NEARBY split around a street anchor. Anything beyond the nearby
/// band stays ungrouped (it is still in `results`).
fn group_by_distance(results: &[Place], anchor: LatLng) -> ResultGroups {
    let mut exact = Vec::new();
    let mut nearby = Vec::new();
    for place in results {
        let d = anchor.distance_meters(&place.location);
        if d <= EXACT_RADIUS_M {
            exact.push(place.place_id.clone());
        } else if d <= NEARBY_GROUP_RADIUS_M {
            nearby.push(place.place_id.clone());
        }
    }
    ResultGroups { exact, nearby }
}

/// Refinement chips for filters the user has not applied yet.
fn suggest_chips(filters: &SharedFilters, has_user_location: bool) -> Vec<Chip> {
    let mut chips = Vec::new();
    if filters.open_state.is_none() {
        chips.push(Chip::OpenNow);
    }
    if filters.min_rating_bucket.is_none() {
        chips.push(Chip::TopRated);
    }
    if filters.price_intent.is_none() {
        chips.push(Chip::CheapEats);
    }
    if !has_user_location {
        chips.push(Chip::NearMe);
    }
    chips
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{OpenNow, OpenStateFilter, RatingBucket};
    use pretty_assertions::assert_eq;

    fn place_at(id: &str, lat: f64, lng: f64) -> Place {
        Place {
            place_id: id.to_string(),
            name: id.to_string(),
            address: None,
            location: LatLng { lat, lng },
            open_now: OpenNow::Unknown,
            rating: None,
            user_ratings_total: None,
            price_level: None,
            types: vec![],
            opening_periods: vec![],
            distance_meters: None,
            cuisine_score: None,
            dietary_hints: vec![],
        }
    }

    #[test]
    fn test_groups_only_with_street_anchor() {
        let anchor = LatLng {
            lat: 32.0800,
            lng: 34.7800,
        };
        let results = vec![
            place_at("exact", 32.0805, 34.7800),   // ~55 m
            place_at("nearby", 32.0860, 34.7800),  // ~660 m
            place_at("far", 32.2000, 34.7800),     // ~13 km
        ];

        let with_anchor = assemble(AssemblyInput {
            results: results.clone(),
            street_anchor: Some(anchor),
            filters: &SharedFilters::default(),
            has_user_location: true,
            counters: FilterCounters::default(),
            profile: RankingProfile::Balanced,
            origin: DistanceOrigin::UserLocation(anchor),
            relaxed: vec![],
            denied: vec![],
        });
        let groups = with_anchor.groups.unwrap();
        assert_eq!(groups.exact, vec!["exact"]);
        assert_eq!(groups.nearby, vec!["nearby"]);

        let without = assemble(AssemblyInput {
            results,
            street_anchor: None,
            filters: &SharedFilters::default(),
            has_user_location: true,
            counters: FilterCounters::default(),
            profile: RankingProfile::Balanced,
            origin: DistanceOrigin::None,
            relaxed: vec![],
            denied: vec![],
        });
        assert!(without.groups.is_none());
    }

    #[test]
    fn test_chips_reflect_unapplied_filters() {
        let all = suggest_chips(&SharedFilters::default(), false);
        assert_eq!(
            all,
            vec![Chip::OpenNow, Chip::TopRated, Chip::CheapEats, Chip::NearMe]
        );

        let applied = SharedFilters {
            open_state: Some(OpenStateFilter::OpenNow),
            min_rating_bucket: Some(RatingBucket::R40),
            ..Default::default()
        };
        let few = suggest_chips(&applied, true);
        assert_eq!(few, vec![Chip::CheapEats]);
    }

    #[test]
    fn test_meta_carries_kernel_outputs() {
        let response = assemble(AssemblyInput {
            results: vec![],
            street_anchor: None,
            filters: &SharedFilters::default(),
            has_user_location: true,
            counters: FilterCounters {
                before: 10,
                after: 7,
                removed: 3,
                unknown_kept: 2,
                unknown_removed: 0,
            },
            profile: RankingProfile::DistanceHeavy,
            origin: DistanceOrigin::None,
            relaxed: vec!["openState"],
            denied: vec![],
        });
        assert_eq!(response.meta.total_before_filter, 10);
        assert_eq!(response.meta.total_after_filter, 7);
        assert_eq!(response.meta.ranking_profile.as_deref(), Some("DISTANCE_HEAVY"));
        assert_eq!(response.meta.distance_origin.as_deref(), Some("NONE"));
        assert_eq!(response.meta.relaxed, vec!["openState"]);
    }

}
