//! Route mapping: which provider method serves this intent.

use serde::Serialize;

use crate::error::FailureCode;
use crate::ranking::RouteKind;
use crate::search::{AssistPayload, ClarifyQuestion, NormalizedRequest};

use super::intent::IntentOutput;

/// Default radius for nearby searches, meters.
const NEARBY_RADIUS_M: u32 = 2_000;

/// The chosen provider call, with the data it needs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ProviderMapping {
    TextSearch {
        query: String,
        city_text: Option<String>,
    },
    NearbySearch {
        radius_m: u32,
        keyword: Option<String>,
    },
    LandmarkPlan {
        landmark: String,
        keyword: Option<String>,
    },
}

impl ProviderMapping {
    pub fn kind(&self) -> RouteKind {
        match self {
            ProviderMapping::TextSearch { .. } => RouteKind::TextSearch,
            ProviderMapping::NearbySearch { .. } => RouteKind::Nearby,
            ProviderMapping::LandmarkPlan { .. } => RouteKind::LandmarkPlan,
        }
    }
}

/// Outcome of route mapping: a provider plan, or a clarification because
/// text search has nothing to anchor on.
#[derive(Debug)]
pub enum RouteDecision {
    Provider(ProviderMapping),
    Clarify(AssistPayload),
}

/// Pure mapping from intent to provider route.
///
/// A landmark wins; an explicit near-me (or a located user with no city)
/// goes nearby; everything else is a text search, guarded by the location
/// anchor rule.
pub fn map_route(intent: &IntentOutput, request: &NormalizedRequest) -> RouteDecision {
    if let Some(landmark) = &intent.landmark_text {
        return RouteDecision::Provider(ProviderMapping::LandmarkPlan {
            landmark: landmark.clone(),
            keyword: intent.cuisine_key.clone(),
        });
    }

    let has_user_location = request.user_location.is_some();
    if has_user_location && (intent.near_me || intent.city_text.is_none()) {
        return RouteDecision::Provider(ProviderMapping::NearbySearch {
            radius_m: NEARBY_RADIUS_M,
            keyword: intent.cuisine_key.clone(),
        });
    }

    // Text search needs some location anchor: a city, a landmark, the
    // user's location, or at least an explicit near-me ask.
    let anchored =
        intent.city_text.is_some() || has_user_location || intent.near_me;
    if !anchored {
        return RouteDecision::Clarify(AssistPayload::Clarify {
            question: ClarifyQuestion::Location,
            reason: Some(FailureCode::LocationRequired),
        });
    }

    RouteDecision::Provider(ProviderMapping::TextSearch {
        query: request.query.clone(),
        city_text: intent.city_text.clone(),
    })
}
