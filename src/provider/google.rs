//! Google Places web-services client and result normalization.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;

use crate::cancel::CancelToken;
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::provider::http::{FetchConfig, fetch_json, with_retry};
use crate::provider::{
    FindPlaceQuery, GeocodeQuery, NearbySearchQuery, PlacesProvider, ProviderPage, TextSearchQuery,
};
use crate::search::{LatLng, OpenNow, OpeningPeriod, Place};

pub struct GooglePlacesClient {
    client: Client,
    config: ProviderConfig,
    host: String,
}

impl GooglePlacesClient {
    pub fn new(config: ProviderConfig) -> Self {
        let host = host_of(&config.base_url);
        Self {
            client: Client::new(),
            config,
            host,
        }
    }

    fn fetch_config(&self, timeout: std::time::Duration) -> FetchConfig {
        FetchConfig {
            timeout,
            dns_preflight: self.config.dns_preflight,
            dns_preflight_timeout: self.config.dns_preflight_timeout,
        }
    }

    async fn call(
        &self,
        path: &str,
        params: Vec<(&str, String)>,
        timeout: std::time::Duration,
        cancel: &CancelToken,
    ) -> Result<serde_json::Value, ProviderError> {
        let url = format!("{}{path}", self.config.base_url.trim_end_matches('/'));
        let fetch_cfg = self.fetch_config(timeout);

        let body = with_retry(
            self.config.retry_attempts,
            &self.config.retry_backoff,
            cancel,
            |_attempt| {
                let request = self
                    .client
                    .get(&url)
                    .query(&params)
                    .query(&[("key", self.config.api_key.expose_secret())]);
                fetch_json(request, &self.host, &fetch_cfg, cancel)
            },
        )
        .await?;

        check_api_status(&body)?;
        Ok(body)
    }
}

#[async_trait]
impl PlacesProvider for GooglePlacesClient {
    async fn text_search(
        &self,
        query: &TextSearchQuery,
        cancel: &CancelToken,
    ) -> Result<ProviderPage, ProviderError> {
        let mut params = vec![
            ("query", query.query.clone()),
            ("language", query.language.clone()),
            ("region", query.region.clone()),
        ];
        if let Some(bias) = &query.location_bias {
            params.push(("location", format!("{},{}", bias.lat, bias.lng)));
        }
        if let Some(token) = &query.page_token {
            params.push(("pagetoken", token.clone()));
        }

        let body = self
            .call(
                "/maps/api/place/textsearch/json",
                params,
                self.config.text_search_timeout,
                cancel,
            )
            .await?;
        Ok(normalize_page(&body, self.config.page_size_max))
    }

    async fn nearby_search(
        &self,
        query: &NearbySearchQuery,
        cancel: &CancelToken,
    ) -> Result<ProviderPage, ProviderError> {
        let mut params = vec![
            (
                "location",
                format!("{},{}", query.location.lat, query.location.lng),
            ),
            ("radius", query.radius_m.to_string()),
            ("type", "restaurant".to_string()),
            ("language", query.language.clone()),
        ];
        if let Some(keyword) = &query.keyword {
            params.push(("keyword", keyword.clone()));
        }

        let body = self
            .call(
                "/maps/api/place/nearbysearch/json",
                params,
                self.config.nearby_timeout,
                cancel,
            )
            .await?;
        Ok(normalize_page(&body, self.config.page_size_max))
    }

    async fn find_place(
        &self,
        query: &FindPlaceQuery,
        cancel: &CancelToken,
    ) -> Result<Option<Place>, ProviderError> {
        let params = vec![
            ("input", query.input.clone()),
            ("inputtype", "textquery".to_string()),
            ("language", query.language.clone()),
            (
                "fields",
                "place_id,name,formatted_address,geometry,rating,user_ratings_total,price_level,types"
                    .to_string(),
            ),
        ];

        let body = self
            .call(
                "/maps/api/place/findplacefromtext/json",
                params,
                self.config.find_place_timeout,
                cancel,
            )
            .await?;
        let candidates = body
            .get("candidates")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(candidates.iter().find_map(normalize_item))
    }

    async fn geocode_address(
        &self,
        query: &GeocodeQuery,
        cancel: &CancelToken,
    ) -> Result<Option<LatLng>, ProviderError> {
        let params = vec![
            ("address", query.address.clone()),
            ("language", query.language.clone()),
            ("region", query.region.clone()),
        ];

        let body = self
            .call(
                "/maps/api/geocode/json",
                params,
                self.config.geocode_timeout,
                cancel,
            )
            .await?;
        Ok(body
            .get("results")
            .and_then(|v| v.as_array())
            .and_then(|results| results.first())
            .and_then(|first| parse_latlng(first.pointer("/geometry/location"))))
    }
}

/// The web services report application errors in-band via `status`.
fn check_api_status(body: &serde_json::Value) -> Result<(), ProviderError> {
    let status = body.get("status").and_then(|v| v.as_str()).unwrap_or("OK");
    match status {
        "OK" | "ZERO_RESULTS" => Ok(()),
        "OVER_QUERY_LIMIT" => Err(ProviderError::Http {
            status: 429,
            body: status.to_string(),
        }),
        "REQUEST_DENIED" => Err(ProviderError::Http {
            status: 403,
            body: status.to_string(),
        }),
        "INVALID_REQUEST" => Err(ProviderError::Http {
            status: 400,
            body: status.to_string(),
        }),
        other => Err(ProviderError::Network {
            reason: format!("provider status {other}"),
        }),
    }
}

/// Normalize one result page; items without a `place_id` are silently
/// dropped and the page is capped at the configured ceiling.
fn normalize_page(body: &serde_json::Value, page_size_max: usize) -> ProviderPage {
    let places = body
        .get("results")
        .and_then(|v| v.as_array())
        .map(|results| {
            results
                .iter()
                .filter_map(normalize_item)
                .take(page_size_max)
                .collect()
        })
        .unwrap_or_default();

    ProviderPage {
        places,
        next_page_token: body
            .get("next_page_token")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    }
}

fn normalize_item(item: &serde_json::Value) -> Option<Place> {
    let place_id = item.get("place_id")?.as_str()?.to_string();
    let name = item
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("(unnamed)")
        .to_string();
    let location = parse_latlng(item.pointer("/geometry/location"))?;

    let open_now = match item.pointer("/opening_hours/open_now").and_then(|v| v.as_bool()) {
        Some(true) => OpenNow::Open,
        Some(false) => OpenNow::Closed,
        None => OpenNow::Unknown,
    };

    let opening_periods = item
        .pointer("/opening_hours/periods")
        .and_then(|v| v.as_array())
        .map(|periods| periods.iter().filter_map(parse_period).collect())
        .unwrap_or_default();

    Some(Place {
        place_id,
        name,
        address: item
            .get("formatted_address")
            .or_else(|| item.get("vicinity"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        location,
        open_now,
        rating: item.get("rating").and_then(|v| v.as_f64()),
        user_ratings_total: item
            .get("user_ratings_total")
            .and_then(|v| v.as_u64())
            .map(|n| n as u32),
        price_level: item
            .get("price_level")
            .and_then(|v| v.as_u64())
            .map(|n| n.min(4) as u8),
        types: item
            .get("types")
            .and_then(|v| v.as_array())
            .map(|types| {
                types
                    .iter()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        opening_periods,
        distance_meters: None,
        cuisine_score: None,
        dietary_hints: Vec::new(),
    })
}

fn parse_latlng(value: Option<&serde_json::Value>) -> Option<LatLng> {
    let value = value?;
    let lat = value.get("lat")?.as_f64()?;
    let lng = value.get("lng")?.as_f64()?;
    let loc = LatLng { lat, lng };
    loc.is_valid().then_some(loc)
}

/// Periods arrive as `{open: {day, time: "HHMM"}, close: {...}}`. A missing
/// close means 24/7; that is encoded as a full-week wrap.
fn parse_period(period: &serde_json::Value) -> Option<OpeningPeriod> {
    let (open_day, open_minute) = parse_day_time(period.get("open")?)?;
    match period.get("close") {
        Some(close) => {
            let (close_day, close_minute) = parse_day_time(close)?;
            Some(OpeningPeriod {
                open_day,
                open_minute,
                close_day,
                close_minute,
            })
        }
        None => Some(OpeningPeriod {
            open_day,
            open_minute,
            close_day: open_day,
            close_minute: open_minute,
        }),
    }
}

fn parse_day_time(value: &serde_json::Value) -> Option<(u8, u16)> {
    let day = value.get("day")?.as_u64()?;
    if day > 6 {
        return None;
    }
    let time = value.get("time")?.as_str()?;
    if time.len() != 4 {
        return None;
    }
    let hours: u16 = time[..2].parse().ok()?;
    let minutes: u16 = time[2..].parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some((day as u8, hours * 60 + minutes))
}

fn host_of(base_url: &str) -> String {
    base_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or(base_url)
        .to_string()
}
