//! Score composition and the stable ordering.

use crate::search::{LatLng, OpenNow, Place};

use super::profiles::Weights;

/// Where distances are measured from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DistanceOrigin {
    CityCenter(LatLng),
    UserLocation(LatLng),
    None,
}

impl DistanceOrigin {
    pub fn name(&self) -> &'static str {
        match self {
            DistanceOrigin::CityCenter(_) => "CITY_CENTER",
            DistanceOrigin::UserLocation(_) => "USER_LOCATION",
            DistanceOrigin::None => "NONE",
        }
    }

    fn point(&self) -> Option<LatLng> {
        match self {
            DistanceOrigin::CityCenter(p) | DistanceOrigin::UserLocation(p) => Some(*p),
            DistanceOrigin::None => None,
        }
    }
}

/// An explicitly mentioned, successfully geocoded city wins over the user's
/// own location; otherwise fall back to the user, else no origin at all.
pub fn resolve_distance_origin(
    intent_reason: Option<&str>,
    city_center: Option<LatLng>,
    user_location: Option<LatLng>,
) -> DistanceOrigin {
    if intent_reason == Some("explicit_city_mentioned") {
        if let Some(center) = city_center {
            return DistanceOrigin::CityCenter(center);
        }
    }
    match user_location {
        Some(loc) => DistanceOrigin::UserLocation(loc),
        None => DistanceOrigin::None,
    }
}

/// Distance beyond which the distance sub-score bottoms out.
pub const DEFAULT_R_MAX_METERS: f64 = 5_000.0;

/// Rank the candidate pool: compute sub-scores, compose with the weight
/// vector, fill in `distance_meters`, and stable-sort by
/// `(-composite, place_id)`.
pub fn rank(
    mut items: Vec<Place>,
    weights: &Weights,
    origin: DistanceOrigin,
    r_max_meters: f64,
) -> Vec<Place> {
    let n_max = items
        .iter()
        .filter_map(|p| p.user_ratings_total)
        .max()
        .unwrap_or(0);
    let origin_point = origin.point();

    let mut scored: Vec<(f64, Place)> = items
        .drain(..)
        .map(|mut place| {
            if let Some(from) = origin_point {
                place.distance_meters = Some(from.distance_meters(&place.location));
            }
            let composite = composite_score(&place, weights, n_max, r_max_meters);
            (composite, place)
        })
        .collect();

    scored.sort_by(|(sa, pa), (sb, pb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| pa.place_id.cmp(&pb.place_id))
    });

    scored.into_iter().map(|(_, place)| place).collect()
}

fn composite_score(place: &Place, weights: &Weights, n_max: u32, r_max_meters: f64) -> f64 {
    let rating = place.rating.map(|r| (r / 5.0).clamp(0.0, 1.0)).unwrap_or(0.0);

    let reviews = match (place.user_ratings_total, n_max) {
        (Some(n), max) if max > 0 => {
            (1.0 + f64::from(n)).ln() / (1.0 + f64::from(max)).ln()
        }
        _ => 0.0,
    };

    // With no origin the sub-score is zero, and the selected profile carries
    // zero distance weight anyway.
    let distance = match place.distance_meters {
        Some(d) if r_max_meters > 0.0 => (1.0 - d / r_max_meters).clamp(0.0, 1.0),
        _ => 0.0,
    };

    let open_boost = match place.open_now {
        OpenNow::Open => 1.0,
        OpenNow::Unknown => 0.5,
        OpenNow::Closed => 0.0,
    };

    // Neutral when the enforcer has not scored this place.
    let cuisine = place.cuisine_score.map(|c| c.clamp(0.0, 1.0)).unwrap_or(0.5);

    weights.rating * rating
        + weights.reviews * reviews
        + weights.distance * distance
        + weights.open_boost * open_boost
        + weights.cuisine * cuisine
}
