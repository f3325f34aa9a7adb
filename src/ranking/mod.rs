//! Deterministic filter and ranking kernel.

pub mod cuisine;
pub mod filter;
pub mod profiles;
pub mod relax;
pub mod score;

pub use cuisine::{CuisineEnforcer, EnforcerMode, enforcement_mode};
pub use filter::{FilterCounters, FilterOptions, post_filter};
pub use profiles::{
    PROXIMITY_INTENT_REASONS, QUALITY_CUISINES, RankingProfile, RankingSignals, RouteKind,
    Weights, select_profile, validate_profiles, weights_for,
};
pub use relax::{RelaxOutcome, filter_with_relaxation};
pub use score::{DEFAULT_R_MAX_METERS, DistanceOrigin, rank, resolve_distance_origin};
