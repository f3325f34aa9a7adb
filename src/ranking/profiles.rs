//! Ranking weight profiles and deterministic profile selection.
//!
//! Selection looks only at structured signals, never at query text, so two
//! identical intents in different languages rank identically.

use serde::{Deserialize, Serialize};

use crate::search::PriceIntent;

/// Intent reasons that pull ranking toward proximity. The intent stage and
/// this selector share the list; extend both in lock-step.
pub const PROXIMITY_INTENT_REASONS: &[&str] = &[
    "nearby_intent",
    "proximity_keywords",
    "small_radius_detected",
    "user_location_primary",
];

/// Cuisine keys that imply a quality-first search.
pub const QUALITY_CUISINES: &[&str] = &["fine_dining", "french", "mediterranean"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RankingProfile {
    NoLocation,
    DistanceHeavy,
    Balanced,
    CuisineFocused,
    QualityFocused,
}

impl RankingProfile {
    pub const ALL: [RankingProfile; 5] = [
        RankingProfile::NoLocation,
        RankingProfile::DistanceHeavy,
        RankingProfile::Balanced,
        RankingProfile::CuisineFocused,
        RankingProfile::QualityFocused,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RankingProfile::NoLocation => "NO_LOCATION",
            RankingProfile::DistanceHeavy => "DISTANCE_HEAVY",
            RankingProfile::Balanced => "BALANCED",
            RankingProfile::CuisineFocused => "CUISINE_FOCUSED",
            RankingProfile::QualityFocused => "QUALITY_FOCUSED",
        }
    }
}

/// Weight vector over the five sub-scores. Each profile sums to 1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    pub rating: f64,
    pub reviews: f64,
    pub distance: f64,
    pub open_boost: f64,
    pub cuisine: f64,
}

impl Weights {
    pub fn sum(&self) -> f64 {
        self.rating + self.reviews + self.distance + self.open_boost + self.cuisine
    }

    fn components(&self) -> [f64; 5] {
        [
            self.rating,
            self.reviews,
            self.distance,
            self.open_boost,
            self.cuisine,
        ]
    }
}

pub fn weights_for(profile: RankingProfile) -> Weights {
    match profile {
        RankingProfile::NoLocation => Weights {
            rating: 0.40,
            reviews: 0.25,
            distance: 0.0,
            open_boost: 0.15,
            cuisine: 0.20,
        },
        RankingProfile::DistanceHeavy => Weights {
            rating: 0.20,
            reviews: 0.10,
            distance: 0.45,
            open_boost: 0.15,
            cuisine: 0.10,
        },
        RankingProfile::Balanced => Weights {
            rating: 0.30,
            reviews: 0.15,
            distance: 0.25,
            open_boost: 0.15,
            cuisine: 0.15,
        },
        RankingProfile::CuisineFocused => Weights {
            rating: 0.25,
            reviews: 0.10,
            distance: 0.15,
            open_boost: 0.15,
            cuisine: 0.35,
        },
        RankingProfile::QualityFocused => Weights {
            rating: 0.40,
            reviews: 0.25,
            distance: 0.10,
            open_boost: 0.10,
            cuisine: 0.15,
        },
    }
}

/// Which provider route the pipeline chose, reduced to what ranking needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    TextSearch,
    Nearby,
    LandmarkPlan,
}

/// Structured, language-independent ranking signals.
#[derive(Debug, Clone, Default)]
pub struct RankingSignals {
    pub route: Option<RouteKind>,
    pub has_user_location: bool,
    pub intent_reason: Option<String>,
    pub cuisine_key: Option<String>,
    pub open_now_requested: bool,
    pub price_intent: Option<PriceIntent>,
    pub quality_intent: bool,
    pub occasion: Option<String>,
}

/// First-match profile selection.
pub fn select_profile(signals: &RankingSignals) -> RankingProfile {
    if !signals.has_user_location {
        return RankingProfile::NoLocation;
    }
    let proximity_reason = signals
        .intent_reason
        .as_deref()
        .is_some_and(|r| PROXIMITY_INTENT_REASONS.contains(&r));
    if signals.route == Some(RouteKind::Nearby) || proximity_reason {
        return RankingProfile::DistanceHeavy;
    }
    let quality_cuisine = signals
        .cuisine_key
        .as_deref()
        .is_some_and(|c| QUALITY_CUISINES.contains(&c));
    if quality_cuisine || signals.quality_intent || signals.occasion.as_deref() == Some("romantic")
    {
        return RankingProfile::QualityFocused;
    }
    if signals.cuisine_key.is_some() {
        return RankingProfile::CuisineFocused;
    }
    RankingProfile::Balanced
}

/// Validate every profile at startup: weights bounded in [0, 1] and summing
/// to 1.0 within 1e-3. A broken table aborts the process before it can rank
/// anything.
pub fn validate_profiles() -> Result<(), String> {
    for profile in RankingProfile::ALL {
        let weights = weights_for(profile);
        for (i, w) in weights.components().into_iter().enumerate() {
            if !(0.0..=1.0).contains(&w) {
                return Err(format!(
                    "profile {} component {i} out of bounds: {w}",
                    profile.name()
                ));
            }
        }
        let sum = weights.sum();
        if (sum - 1.0).abs() > 1e-3 {
            return Err(format!("profile {} weights sum to {sum}", profile.name()));
        }
    }
    Ok(())
}
