//! Domain types for the search pipeline.
//!
//! Everything here is either a wire shape (request/response DTOs, tagged
//! assist payloads) or a normalized internal record (places, filters). The
//! pipeline, ranking kernel and job store all speak these types; none of them
//! ever sees raw provider JSON.

mod normalize;

pub use normalize::{coarse_location, idempotency_key, normalize_query};

use serde::{Deserialize, Serialize};

use crate::error::FailureCode;

// --- Request ---

/// Inbound body of `POST /search`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    /// BCP-47-ish language hint from the client, e.g. "he", "en".
    pub language: Option<String>,
    pub user_location: Option<LatLng>,
    #[serde(default)]
    pub filters: SharedFilters,
}

/// Request after normalization, as stored on the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedRequest {
    pub query: String,
    pub language_hint: Option<String>,
    pub user_location: Option<LatLng>,
    pub filters: SharedFilters,
}

impl SearchRequest {
    /// Validate and normalize the inbound request.
    pub fn normalize(self) -> Result<NormalizedRequest, String> {
        let query = normalize_query(&self.query);
        if query.is_empty() {
            return Err("query must not be empty".to_string());
        }
        if query.chars().count() > 512 {
            return Err("query too long (max 512 characters)".to_string());
        }
        if let Some(loc) = &self.user_location {
            if !loc.is_valid() {
                return Err("user_location out of range".to_string());
            }
        }
        Ok(NormalizedRequest {
            query,
            language_hint: self.language,
            user_location: self.user_location,
            filters: self.filters,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Great-circle distance in meters (haversine).
    pub fn distance_meters(&self, other: &LatLng) -> f64 {
        const EARTH_RADIUS_M: f64 = 6_371_000.0;
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = (other.lat - self.lat).to_radians();
        let dlng = (other.lng - self.lng).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }
}

// --- Filters ---

/// Client- or intent-supplied filters shared across pipeline stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SharedFilters {
    pub open_state: Option<OpenStateFilter>,
    pub min_rating_bucket: Option<RatingBucket>,
    pub price_intent: Option<PriceIntent>,
    pub is_gluten_free: bool,
    /// Hard constraint, never relaxed.
    pub is_kosher: bool,
    /// Hard constraint, never relaxed.
    pub meat_dairy: Option<MeatDairy>,
}

/// Open-state filter axis. Days are 0 = Sunday .. 6 = Saturday, minutes are
/// minutes since local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpenStateFilter {
    OpenNow,
    ClosedNow,
    OpenAt { day: u8, minute: u16 },
    OpenBetween { day: u8, start: u16, end: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatingBucket {
    R35,
    R40,
    R45,
}

impl RatingBucket {
    pub fn threshold(self) -> f64 {
        match self {
            RatingBucket::R35 => 3.5,
            RatingBucket::R40 => 4.0,
            RatingBucket::R45 => 4.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceIntent {
    Cheap,
    Moderate,
    Upscale,
}

impl PriceIntent {
    /// Maximum provider price level (0..=4) admitted by this intent.
    /// `Upscale` is a floor, not a ceiling.
    pub fn admits(self, price_level: u8) -> bool {
        match self {
            PriceIntent::Cheap => price_level <= 1,
            PriceIntent::Moderate => price_level <= 2,
            PriceIntent::Upscale => price_level >= 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeatDairy {
    Meat,
    Dairy,
}

// --- Result items ---

/// Normalized place record produced by the provider adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Place {
    pub place_id: String,
    pub name: String,
    pub address: Option<String>,
    pub location: LatLng,
    pub open_now: OpenNow,
    pub rating: Option<f64>,
    pub user_ratings_total: Option<u32>,
    /// Provider price level 0 (free) ..= 4 (very expensive).
    pub price_level: Option<u8>,
    pub types: Vec<String>,
    #[serde(default)]
    pub opening_periods: Vec<OpeningPeriod>,
    /// Distance from the ranking origin, filled in by the scorer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_meters: Option<f64>,
    /// Cuisine-match score from the enforcer, boost-only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cuisine_score: Option<f64>,
    /// Dietary annotations (e.g. "gluten_free"). Never used to drop items.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dietary_hints: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpenNow {
    Open,
    Closed,
    Unknown,
}

/// One structured opening interval. Close may land on a later day than open
/// (periods crossing midnight).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpeningPeriod {
    pub open_day: u8,
    pub open_minute: u16,
    pub close_day: u8,
    pub close_minute: u16,
}

// --- Response ---

/// Terminal payload of a successful search job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<Place>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<ResultGroups>,
    pub chips: Vec<Chip>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assist: Option<AssistPayload>,
    pub meta: ResponseMeta,
}

/// EXACT/NEARBY split for street-anchor searches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultGroups {
    pub exact: Vec<String>,
    pub nearby: Vec<String>,
}

/// Suggested refinement chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chip {
    OpenNow,
    TopRated,
    CheapEats,
    NearMe,
}

/// Structured assist payload; the client renders it, the server never ships
/// prose here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssistPayload {
    /// Nudge toward the product's scope.
    Guide { topic: String },
    /// The pipeline needs one more piece of information.
    Clarify {
        question: ClarifyQuestion,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<FailureCode>,
    },
    /// Something failed; suggest how to recover.
    Recovery { reason: FailureCode },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClarifyQuestion {
    Location,
    CuisineOrArea,
    Rephrase,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    pub total_before_filter: usize,
    pub total_after_filter: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ranking_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_origin: Option<String>,
    /// Soft filters removed by the relax policy, in relaxation order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relaxed: Vec<String>,
    /// Relaxations that were requested but denied, with the reason.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relax_denied: Vec<RelaxDenial>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureCode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelaxDenial {
    pub field: String,
    pub reason_code: String,
}
