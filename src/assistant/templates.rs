//! Deterministic narration templates, one per supported language.
//!
//! These are sent before any LLM round-trip so the user sees activity
//! immediately, and as fallbacks when the LLM cannot be reached. Unknown
//! languages fall back to English.

/// Sent as the first `message` on the search path.
pub fn narration(language: &str) -> &'static str {
    match language {
        "he" => "מחפשים בשבילך מסעדות מתאימות…",
        "ar" => "نبحث لك عن مطاعم مناسبة…",
        "ru" => "Ищем для вас подходящие рестораны…",
        "fr" => "Nous cherchons des restaurants pour vous…",
        "es" => "Buscando restaurantes para ti…",
        _ => "Searching for matching restaurants…",
    }
}

/// Sent when the result did not arrive within the SSE window.
pub fn timeout_message(language: &str) -> &'static str {
    match language {
        "he" => "החיפוש לוקח יותר זמן מהצפוי. אפשר לנסות שוב בעוד רגע.",
        "ar" => "يستغرق البحث وقتًا أطول من المتوقع. حاول مرة أخرى بعد قليل.",
        "ru" => "Поиск занимает больше времени, чем ожидалось. Попробуйте ещё раз чуть позже.",
        "fr" => "La recherche prend plus de temps que prévu. Réessayez dans un instant.",
        "es" => "La búsqueda está tardando más de lo esperado. Inténtalo de nuevo en un momento.",
        _ => "The search is taking longer than expected. Please try again in a moment.",
    }
}

/// Sent when the job ended in failure; the reason code rides separately.
pub fn failure_message(language: &str) -> &'static str {
    match language {
        "he" => "משהו השתבש בחיפוש. נסו שוב או נסחו מחדש.",
        "ar" => "حدث خطأ أثناء البحث. حاول مرة أخرى أو أعد الصياغة.",
        "ru" => "Что-то пошло не так. Попробуйте ещё раз или переформулируйте запрос.",
        "fr" => "Une erreur s'est produite. Réessayez ou reformulez votre demande.",
        "es" => "Algo salió mal. Inténtalo de nuevo o reformula tu búsqueda.",
        _ => "Something went wrong with the search. Try again or rephrase.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LANGUAGES: &[&str] = &["he", "en", "ar", "ru", "fr", "es"];

    #[test]
    fn test_every_language_has_all_templates() {
        for lang in LANGUAGES {
            assert!(!narration(lang).is_empty());
            assert!(!timeout_message(lang).is_empty());
            assert!(!failure_message(lang).is_empty());
        }
    }

    #[test]
    fn test_unknown_language_falls_back_to_english() {
        assert_eq!(narration("tlh"), narration("en"));
        assert_eq!(timeout_message("xx"), timeout_message("en"));
    }

    #[test]
    fn test_templates_differ_across_languages() {
        assert_ne!(narration("he"), narration("en"));
        assert_ne!(narration("ru"), narration("fr"));
    }
}
