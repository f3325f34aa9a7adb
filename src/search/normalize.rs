//! Query normalization and idempotent request fingerprinting.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::search::{LatLng, SharedFilters};

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));

/// Normalize free-text input for matching and fingerprinting.
///
/// Lowercases (script-aware via Unicode), trims, and collapses internal
/// whitespace. Diacritics and non-Latin scripts are preserved as typed: two
/// queries in different scripts are different queries.
pub fn normalize_query(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    WHITESPACE.replace_all(&lowered, " ").into_owned()
}

/// Coarsen a location to ~1 km so nearby repeat requests dedup together.
pub fn coarse_location(location: Option<&LatLng>) -> String {
    match location {
        Some(loc) => format!("{:.2},{:.2}", loc.lat, loc.lng),
        None => "none".to_string(),
    }
}

/// Stable fingerprint collapsing identical submissions onto one job.
///
/// Hash of `(normalizedQuery, sessionOrUserId, coarseLocation, language,
/// filterSignature)`. The filter signature is the serde encoding of
/// `SharedFilters`, which is deterministic for a given struct layout.
pub fn idempotency_key(
    normalized_query: &str,
    session_or_user_id: &str,
    location: Option<&LatLng>,
    language: Option<&str>,
    filters: &SharedFilters,
) -> String {
    let filter_signature =
        serde_json::to_string(filters).unwrap_or_else(|_| "unserializable".to_string());

    let mut hasher = Sha256::new();
    for part in [
        normalized_query,
        session_or_user_id,
        &coarse_location(location),
        language.unwrap_or("auto"),
        &filter_signature,
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]); // field separator, prevents boundary collisions
    }

    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::RatingBucket;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(normalize_query("  Pizza \t in\n Tel Aviv  "), "pizza in tel aviv");
    }

    #[test]
    fn test_normalize_preserves_scripts() {
        assert_eq!(normalize_query("  פיצה  בתל אביב "), "פיצה בתל אביב");
        assert_eq!(normalize_query("ПИЦЦА в Москве"), "пицца в москве");
        assert_eq!(normalize_query("مطعم  شاورما"), "مطعم شاورما");
    }

    #[test]
    fn test_coarse_location_rounds() {
        let loc = LatLng {
            lat: 32.08531,
            lng: 34.78179,
        };
        assert_eq!(coarse_location(Some(&loc)), "32.09,34.78");
        assert_eq!(coarse_location(None), "none");
    }

    #[test]
    fn test_idempotency_key_stable() {
        let filters = SharedFilters::default();
        let a = idempotency_key("pizza in tel aviv", "sess-1", None, Some("en"), &filters);
        let b = idempotency_key("pizza in tel aviv", "sess-1", None, Some("en"), &filters);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_idempotency_key_varies_by_session() {
        let filters = SharedFilters::default();
        let a = idempotency_key("pizza", "sess-1", None, None, &filters);
        let b = idempotency_key("pizza", "sess-2", None, None, &filters);
        assert_ne!(a, b);
    }

    #[test]
    fn test_idempotency_key_varies_by_filters() {
        let a = idempotency_key("pizza", "s", None, None, &SharedFilters::default());
        let b = idempotency_key(
            "pizza",
            "s",
            None,
            None,
            &SharedFilters {
                min_rating_bucket: Some(RatingBucket::R40),
                ..Default::default()
            },
        );
        assert_ne!(a, b);
    }

    #[test]
    fn test_idempotency_key_varies_by_coarse_location() {
        let filters = SharedFilters::default();
        let near = LatLng {
            lat: 32.08,
            lng: 34.78,
        };
        let same_cell = LatLng {
            lat: 32.081,
            lng: 34.779,
        };
        let far = LatLng {
            lat: 31.77,
            lng: 35.21,
        };
        let a = idempotency_key("pizza", "s", Some(&near), None, &filters);
        let b = idempotency_key("pizza", "s", Some(&same_cell), None, &filters);
        let c = idempotency_key("pizza", "s", Some(&far), None, &filters);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_no_boundary_collision() {
        let filters = SharedFilters::default();
        let a = idempotency_key("ab", "c", None, None, &filters);
        let b = idempotency_key("a", "bc", None, None, &filters);
        assert_ne!(a, b);
    }
}
