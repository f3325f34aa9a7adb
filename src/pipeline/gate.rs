//! Gate stage: on-topic classification and the one-time language decision.

use serde::Deserialize;

use crate::error::{FailureCode, StageError};
use crate::lang::{LanguageContext, init_lang_ctx};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, complete_json};
use crate::search::{AssistPayload, ClarifyQuestion};

const STAGE: &str = "gate";

/// What the gate decided about the request as a whole.
#[derive(Debug)]
pub enum GateDecision {
    Continue,
    Clarify(AssistPayload),
    Stop(AssistPayload),
}

#[derive(Debug, Deserialize)]
struct GateReply {
    route: GateRoute,
    /// ISO 639-1 code of the language the assistant should answer in.
    assistant_language: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    topic: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum GateRoute {
    Continue,
    Clarify,
    Stop,
}

/// Run the gate. This is the only place a [`LanguageContext`] is born.
pub async fn run(
    llm: &dyn LlmProvider,
    query: &str,
    language_hint: Option<&str>,
    default_region: &str,
) -> Result<(GateDecision, LanguageContext), StageError> {
    let hint = language_hint
        .map(|h| format!("The client hints the language is \"{h}\".\n"))
        .unwrap_or_default();

    let prompt = format!(
        "You gate a restaurant search engine. Decide whether the query below\n\
         is a restaurant/food search (CONTINUE), too vague to act on\n\
         (CLARIFY), or entirely off-topic (STOP). Detect the query language\n\
         (he, en, ar, ru, fr, es or another ISO 639-1 code).\n\
         {hint}\
         Reply with JSON: {{\"route\": \"CONTINUE|CLARIFY|STOP\",\n\
         \"assistant_language\": \"<code>\", \"confidence\": <0..1>,\n\
         \"topic\": \"<short topic when STOP>\"}}\n\n\
         Query: {query}"
    );

    let request = CompletionRequest::new(vec![
        ChatMessage::system("You classify queries for a restaurant search backend. JSON only."),
        ChatMessage::user(&prompt),
    ])
    .with_max_tokens(256)
    .with_temperature(0.0);

    let reply: GateReply = complete_json(llm, request).await.map_err(|e| {
        StageError::new(STAGE, FailureCode::StageError, e.to_string())
    })?;

    let ctx = init_lang_ctx(
        normalize_language_code(&reply.assistant_language, language_hint),
        reply.confidence,
        default_region,
    );
    tracing::debug!(
        language = ctx.assistant_language(),
        confidence = ctx.assistant_language_confidence(),
        route = ?reply.route,
        "gate decided"
    );

    let decision = match reply.route {
        GateRoute::Continue => GateDecision::Continue,
        GateRoute::Clarify => GateDecision::Clarify(AssistPayload::Clarify {
            question: ClarifyQuestion::Rephrase,
            reason: None,
        }),
        GateRoute::Stop => GateDecision::Stop(AssistPayload::Guide {
            topic: reply.topic.unwrap_or_else(|| "restaurant_search".to_string()),
        }),
    };

    Ok((decision, ctx))
}

/// Guard against models emitting names ("Hebrew") or locales ("he-IL")
/// instead of a bare code.
fn normalize_language_code(raw: &str, hint: Option<&str>) -> String {
    let code = raw.trim().to_lowercase();
    let code = code.split(['-', '_']).next().unwrap_or(&code);
    if code.len() == 2 && code.chars().all(|c| c.is_ascii_lowercase()) {
        return code.to_string();
    }
    match code {
        "hebrew" => "he".to_string(),
        "english" => "en".to_string(),
        "arabic" => "ar".to_string(),
        "russian" => "ru".to_string(),
        "french" => "fr".to_string(),
        "spanish" => "es".to_string(),
        _ => hint.unwrap_or("en").to_string(),
    }
}
