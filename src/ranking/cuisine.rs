//! Cuisine enforcer: LLM-scored cuisine match, boost-only.
//!
//! The enforcer never drops a candidate. It asks the model for a
//! `cuisineScore` per place and writes it into the pool for the scorer to
//! weigh. Under hard constraints (kosher, meat/dairy) the policy is capped
//! to BOOST as well, so a constraint mismatch can sink a result to the
//! bottom but never hide it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, complete_json};
use crate::search::{Place, SharedFilters};

/// Enforcement policy. FILTER does not exist on purpose; see module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcerMode {
    Boost,
}

/// Policy selection. Hard constraints are exactly the case where dropping
/// results would be tempting, and exactly the case where it is forbidden.
pub fn enforcement_mode(_filters: &SharedFilters) -> EnforcerMode {
    EnforcerMode::Boost
}

pub struct CuisineEnforcer {
    llm: Arc<dyn LlmProvider>,
}

#[derive(Debug, Deserialize)]
struct ScoreReply {
    scores: HashMap<String, f64>,
}

impl CuisineEnforcer {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    /// Score the pool against a cuisine key. Best-effort: on any LLM
    /// failure the pool is left unscored (the scorer treats that as
    /// neutral) and the pipeline continues.
    pub async fn score_places(&self, cuisine_key: &str, places: &mut [Place]) {
        if places.is_empty() {
            return;
        }

        let listing: String = places
            .iter()
            .map(|p| format!("- id={} name=\"{}\" types={}\n", p.place_id, p.name, p.types.join(",")))
            .collect();

        let prompt = format!(
            "Score how well each place matches the cuisine \"{cuisine_key}\".\n\
             Reply with a JSON object {{\"scores\": {{\"<id>\": <0.0-1.0>, ...}}}}.\n\
             Score every id exactly once.\n\n{listing}"
        );

        let request = CompletionRequest::new(vec![
            ChatMessage::system(
                "You classify restaurants by cuisine. Reply with JSON only.",
            ),
            ChatMessage::user(&prompt),
        ])
        .with_max_tokens(1024)
        .with_temperature(0.0);

        let reply: ScoreReply = match complete_json(self.llm.as_ref(), request).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, cuisine_key, "cuisine enforcer skipped");
                return;
            }
        };

        for place in places.iter_mut() {
            if let Some(score) = reply.scores.get(&place.place_id) {
                place.cuisine_score = Some(score.clamp(0.0, 1.0));
            }
        }
    }
}
