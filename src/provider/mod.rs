//! Places provider adapter.
//!
//! The pipeline depends on the [`PlacesProvider`] trait only; the concrete
//! client wraps the Google Places web services with fetch-with-timeout,
//! retry, and normalization into domain [`Place`] records.

mod google;
pub mod http;

pub use google::GooglePlacesClient;
pub use http::{FetchConfig, fetch_json, with_retry};

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::error::ProviderError;
use crate::search::{LatLng, Place};

#[derive(Debug, Clone)]
pub struct TextSearchQuery {
    pub query: String,
    pub language: String,
    pub region: String,
    pub location_bias: Option<LatLng>,
    pub page_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NearbySearchQuery {
    pub location: LatLng,
    pub radius_m: u32,
    pub keyword: Option<String>,
    pub language: String,
}

#[derive(Debug, Clone)]
pub struct FindPlaceQuery {
    pub input: String,
    pub language: String,
}

#[derive(Debug, Clone)]
pub struct GeocodeQuery {
    pub address: String,
    pub language: String,
    pub region: String,
}

/// One page of normalized provider results.
#[derive(Debug, Clone, Default)]
pub struct ProviderPage {
    pub places: Vec<Place>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait PlacesProvider: Send + Sync {
    async fn text_search(
        &self,
        query: &TextSearchQuery,
        cancel: &CancelToken,
    ) -> Result<ProviderPage, ProviderError>;

    async fn nearby_search(
        &self,
        query: &NearbySearchQuery,
        cancel: &CancelToken,
    ) -> Result<ProviderPage, ProviderError>;

    async fn find_place(
        &self,
        query: &FindPlaceQuery,
        cancel: &CancelToken,
    ) -> Result<Option<Place>, ProviderError>;

    async fn geocode_address(
        &self,
        query: &GeocodeQuery,
        cancel: &CancelToken,
    ) -> Result<Option<LatLng>, ProviderError>;
}

/// Scripted provider for unit tests across the crate.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    pub struct ScriptedPlaces {
        pages: Mutex<std::collections::VecDeque<Result<ProviderPage, ProviderError>>>,
        pub geocode_result: Mutex<Option<LatLng>>,
        pub calls: AtomicU32,
        pub geocode_calls: AtomicU32,
    }

    impl ScriptedPlaces {
        pub fn returning(pages: Vec<Result<ProviderPage, ProviderError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                ..Default::default()
            }
        }

        pub fn with_places(places: Vec<Place>) -> Self {
            Self::returning(vec![Ok(ProviderPage {
                places,
                next_page_token: None,
            })])
        }

        pub fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn next_page(&self) -> Result<ProviderPage, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ProviderPage::default()))
        }
    }

    #[async_trait]
    impl PlacesProvider for ScriptedPlaces {
        async fn text_search(
            &self,
            _query: &TextSearchQuery,
            _cancel: &CancelToken,
        ) -> Result<ProviderPage, ProviderError> {
            self.next_page()
        }

        async fn nearby_search(
            &self,
            _query: &NearbySearchQuery,
            _cancel: &CancelToken,
        ) -> Result<ProviderPage, ProviderError> {
            self.next_page()
        }

        async fn find_place(
            &self,
            _query: &FindPlaceQuery,
            _cancel: &CancelToken,
        ) -> Result<Option<Place>, ProviderError> {
            Ok(self.next_page()?.places.into_iter().next())
        }

        async fn geocode_address(
            &self,
            _query: &GeocodeQuery,
            _cancel: &CancelToken,
        ) -> Result<Option<LatLng>, ProviderError> {
            self.geocode_calls.fetch_add(1, Ordering::SeqCst);
            Ok(*self.geocode_result.lock().unwrap())
        }
    }
}
