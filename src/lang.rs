//! Per-request language context and its enforcement rules.
//!
//! The Gate stage decides the assistant language exactly once; later stages
//! may refine the UI/provider languages and region but can never touch the
//! assistant language or its confidence. The struct keeps the immutable pair
//! private so in-crate code cannot mutate it by accident, and the assertion
//! helpers catch external collaborators (LLM stages) trying to sneak a
//! change through their JSON output.

use serde::{Deserialize, Serialize};

use crate::error::FailureCode;

/// Single source of truth for a request's language decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageContext {
    assistant_language: String,
    assistant_language_confidence: f64,
    pub ui_language: String,
    pub provider_language: String,
    pub region_code: String,
}

/// Mutable-field patch produced by later stages.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LangUpdate {
    pub ui_language: Option<String>,
    pub provider_language: Option<String>,
    pub region_code: Option<String>,
}

/// Raised when a stage attempts to change an immutable language field.
#[derive(Debug, thiserror::Error)]
#[error("stage {stage} attempted to change {field}")]
pub struct LangViolation {
    pub stage: &'static str,
    pub field: &'static str,
}

impl LangViolation {
    pub fn failure_code(&self) -> FailureCode {
        FailureCode::LangEnforcementViolation
    }
}

/// Create the context. Called exactly once, by the Gate stage.
pub fn init_lang_ctx(
    assistant_language: impl Into<String>,
    confidence: f64,
    region_code: impl Into<String>,
) -> LanguageContext {
    let assistant_language = assistant_language.into();
    LanguageContext {
        ui_language: assistant_language.clone(),
        provider_language: assistant_language.clone(),
        assistant_language,
        assistant_language_confidence: confidence.clamp(0.0, 1.0),
        region_code: region_code.into(),
    }
}

/// Rebuild the context with refined mutable fields; immutables carry over.
pub fn update_lang_ctx(ctx: &LanguageContext, update: LangUpdate) -> LanguageContext {
    LanguageContext {
        assistant_language: ctx.assistant_language.clone(),
        assistant_language_confidence: ctx.assistant_language_confidence,
        ui_language: update.ui_language.unwrap_or_else(|| ctx.ui_language.clone()),
        provider_language: update
            .provider_language
            .unwrap_or_else(|| ctx.provider_language.clone()),
        region_code: update.region_code.unwrap_or_else(|| ctx.region_code.clone()),
    }
}

/// Assert that a stage did not move the immutable fields.
pub fn assert_lang_ctx_immutable(
    original: &LanguageContext,
    received: &LanguageContext,
    stage: &'static str,
) -> Result<(), LangViolation> {
    if original.assistant_language != received.assistant_language {
        return Err(LangViolation {
            stage,
            field: "assistant_language",
        });
    }
    // Confidence is a float; exact equality is intended, the value must be
    // carried through verbatim.
    if original.assistant_language_confidence != received.assistant_language_confidence {
        return Err(LangViolation {
            stage,
            field: "assistant_language_confidence",
        });
    }
    Ok(())
}

/// Strict check before any user-facing assistant text is emitted.
///
/// With a context: mismatch is an error. Without one: derive the expected
/// language from the fallback chain and warn on mismatch, never block.
pub fn verify_assistant_language_graceful(
    ctx: Option<&LanguageContext>,
    payload_language: &str,
    fallback_sources: &[Option<&str>],
) -> Result<(), LangViolation> {
    match ctx {
        Some(ctx) => {
            if ctx.assistant_language != payload_language {
                tracing::error!(
                    expected = %ctx.assistant_language,
                    got = %payload_language,
                    "assistant payload language mismatch"
                );
                return Err(LangViolation {
                    stage: "assistant",
                    field: "assistant_language",
                });
            }
            Ok(())
        }
        None => {
            let expected = fallback_sources.iter().find_map(|s| *s);
            if let Some(expected) = expected {
                if expected != payload_language {
                    tracing::warn!(
                        expected = %expected,
                        got = %payload_language,
                        "assistant payload language differs from fallback expectation"
                    );
                }
            }
            Ok(())
        }
    }
}

/// Guard before every outbound provider call.
pub fn assert_provider_language(
    ctx: &LanguageContext,
    provider_language: &str,
) -> Result<(), LangViolation> {
    if ctx.provider_language != provider_language {
        return Err(LangViolation {
            stage: "provider",
            field: "provider_language",
        });
    }
    Ok(())
}

impl LanguageContext {
    pub fn assistant_language(&self) -> &str {
        &self.assistant_language
    }

    pub fn assistant_language_confidence(&self) -> f64 {
        self.assistant_language_confidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_init_seeds_mutables_from_assistant_language() {
        let ctx = init_lang_ctx("he", 0.92, "IL");
        assert_eq!(ctx.assistant_language(), "he");
        assert_eq!(ctx.ui_language, "he");
        assert_eq!(ctx.provider_language, "he");
        assert_eq!(ctx.region_code, "IL");
    }

    #[test]
    fn test_init_clamps_confidence() {
        assert_eq!(init_lang_ctx("en", 1.7, "IL").assistant_language_confidence(), 1.0);
        assert_eq!(init_lang_ctx("en", -0.2, "IL").assistant_language_confidence(), 0.0);
    }

    #[test]
    fn test_update_preserves_immutables() {
        let ctx = init_lang_ctx("he", 0.9, "IL");
        let updated = update_lang_ctx(
            &ctx,
            LangUpdate {
                ui_language: Some("en".to_string()),
                provider_language: Some("he".to_string()),
                region_code: Some("IL".to_string()),
            },
        );
        assert_eq!(updated.assistant_language(), "he");
        assert_eq!(updated.assistant_language_confidence(), 0.9);
        assert_eq!(updated.ui_language, "en");
        assert!(assert_lang_ctx_immutable(&ctx, &updated, "intent").is_ok());
    }

    #[test]
    fn test_assert_catches_language_change() {
        let original = init_lang_ctx("he", 0.9, "IL");
        let mut tampered = original.clone();
        tampered.assistant_language = "en".to_string();

        let err = assert_lang_ctx_immutable(&original, &tampered, "intent").unwrap_err();
        assert_eq!(err.stage, "intent");
        assert_eq!(err.field, "assistant_language");
        assert_eq!(err.failure_code(), FailureCode::LangEnforcementViolation);
    }

    #[test]
    fn test_assert_catches_confidence_change() {
        let original = init_lang_ctx("he", 0.9, "IL");
        let mut tampered = original.clone();
        tampered.assistant_language_confidence = 0.5;

        let err = assert_lang_ctx_immutable(&original, &tampered, "route").unwrap_err();
        assert_eq!(err.field, "assistant_language_confidence");
    }

    #[test]
    fn test_graceful_verify_strict_with_ctx() {
        let ctx = init_lang_ctx("he", 0.9, "IL");
        assert!(verify_assistant_language_graceful(Some(&ctx), "he", &[]).is_ok());
        assert!(verify_assistant_language_graceful(Some(&ctx), "en", &[]).is_err());
    }

    #[test]
    fn test_graceful_verify_warns_without_ctx() {
        // Mismatch against fallback expectation warns but never fails.
        let result =
            verify_assistant_language_graceful(None, "en", &[None, Some("he"), Some("ru")]);
        assert!(result.is_ok());
    }

    #[test]
    fn test_provider_language_guard() {
        let ctx = init_lang_ctx("he", 0.9, "IL");
        assert!(assert_provider_language(&ctx, "he").is_ok());
        assert!(assert_provider_language(&ctx, "en").is_err());
    }
}
