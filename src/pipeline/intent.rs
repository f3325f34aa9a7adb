//! Intent stage: structured field extraction and region sanitization.

use serde::Deserialize;

use crate::error::{FailureCode, StageError};
use crate::lang::{LangUpdate, LanguageContext, update_lang_ctx};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, complete_json};
use crate::search::{LatLng, PriceIntent, RatingBucket};

const STAGE: &str = "intent";

/// Region codes the provider accepts from us.
pub const REGION_ALLOWLIST: &[&str] = &[
    "IL", "US", "GB", "FR", "ES", "DE", "IT", "RU", "UA", "AE", "GR", "CY", "NL", "PT",
];

/// Israel bounding box for the GZ sanitization rule.
const IL_BBOX: (f64, f64, f64, f64) = (29.3, 33.5, 34.2, 35.95); // lat min/max, lng min/max

/// Structured fields the intent model extracts. Everything is optional;
/// absence means "not expressed in the query".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IntentOutput {
    pub cuisine_key: Option<String>,
    pub city_text: Option<String>,
    pub landmark_text: Option<String>,
    pub near_me: bool,
    pub open_now_requested: bool,
    pub price_intent: Option<PriceIntent>,
    pub min_rating_bucket: Option<RatingBucket>,
    pub quality_intent: bool,
    pub occasion: Option<String>,
    /// Why the model thinks the user cares about location, e.g.
    /// `nearby_intent`, `explicit_city_mentioned`.
    pub intent_reason: Option<String>,
    pub region_candidate: Option<String>,
    pub ui_language: Option<String>,
    pub provider_language: Option<String>,
    /// Models sometimes echo a language decision they do not own. The
    /// orchestrator checks this against the immutable context.
    pub assistant_language: Option<String>,
}

/// Run extraction and fold the language refinements into a fresh context.
pub async fn run(
    llm: &dyn LlmProvider,
    query: &str,
    user_location: Option<LatLng>,
    ctx: &LanguageContext,
) -> Result<(IntentOutput, LanguageContext), StageError> {
    let prompt = format!(
        "Extract structured search intent from this restaurant query.\n\
         Reply with JSON (omit unknown fields):\n\
         {{\"cuisine_key\": \"sushi|pizza|french|fine_dining|...\",\n\
         \"city_text\": \"...\", \"landmark_text\": \"...\",\n\
         \"near_me\": bool, \"open_now_requested\": bool,\n\
         \"price_intent\": \"cheap|moderate|upscale\",\n\
         \"min_rating_bucket\": \"R35|R40|R45\",\n\
         \"quality_intent\": bool, \"occasion\": \"romantic|...\",\n\
         \"intent_reason\": \"nearby_intent|proximity_keywords|small_radius_detected|user_location_primary|explicit_city_mentioned\",\n\
         \"region_candidate\": \"<ISO 3166-1 alpha-2>\",\n\
         \"ui_language\": \"<code>\", \"provider_language\": \"<code>\"}}\n\n\
         Query: {query}"
    );

    let request = CompletionRequest::new(vec![
        ChatMessage::system("You extract restaurant search intent. JSON only."),
        ChatMessage::user(&prompt),
    ])
    .with_max_tokens(512)
    .with_temperature(0.0);

    let output: IntentOutput = complete_json(llm, request)
        .await
        .map_err(|e| StageError::new(STAGE, FailureCode::StageError, e.to_string()))?;

    let region = sanitize_region(
        output.region_candidate.as_deref(),
        user_location,
        &ctx.region_code,
    );
    let next_ctx = update_lang_ctx(
        ctx,
        LangUpdate {
            ui_language: output.ui_language.clone(),
            provider_language: output.provider_language.clone(),
            region_code: Some(region),
        },
    );

    tracing::debug!(
        cuisine = ?output.cuisine_key,
        city = ?output.city_text,
        reason = ?output.intent_reason,
        region = %next_ctx.region_code,
        "intent extracted"
    );
    Ok((output, next_ctx))
}

/// Validate a region candidate against the allowlist, fixing the mistakes
/// models actually make: `IS` (Iceland) for Israel, and `GZ` which is only
/// coerced to `IL` when the user is physically inside the IL bounding box.
/// Anything else unrecognized keeps the current region.
pub fn sanitize_region(
    candidate: Option<&str>,
    user_location: Option<LatLng>,
    current: &str,
) -> String {
    let Some(raw) = candidate else {
        return current.to_string();
    };
    let upper = raw.trim().to_uppercase();

    match upper.as_str() {
        "IS" => "IL".to_string(),
        "GZ" => {
            if user_location.is_some_and(in_il_bbox) {
                "IL".to_string()
            } else {
                tracing::warn!(candidate = %upper, "region candidate rejected");
                current.to_string()
            }
        }
        code if REGION_ALLOWLIST.contains(&code) => code.to_string(),
        _ => {
            tracing::warn!(candidate = %upper, "region candidate not in allowlist");
            current.to_string()
        }
    }
}

fn in_il_bbox(loc: LatLng) -> bool {
    let (lat_min, lat_max, lng_min, lng_max) = IL_BBOX;
    (lat_min..=lat_max).contains(&loc.lat) && (lng_min..=lng_max).contains(&loc.lng)
}
