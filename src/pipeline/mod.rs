//! Pipeline orchestrator: Gate -> Intent -> Route -> Provider -> Post-filter
//! -> Rank -> Assistant assembly.
//!
//! One spawned task per job, claimed through the store's status transition
//! so a request id can never have two pipelines. Every stage is wrapped in
//! its own deadline, the whole run in a hard one; each completed stage
//! heartbeats the job and publishes a progress frame.

pub mod assemble;
pub mod gate;
pub mod intent;
pub mod route;

pub use intent::IntentOutput;
pub use route::{ProviderMapping, RouteDecision};

use std::sync::Arc;
use std::time::Instant;

use crate::cancel::CancelToken;
use crate::config::{PipelineConfig, RankingConfig};
use crate::error::{FailureCode, StageError};
use crate::lang::{LanguageContext, assert_lang_ctx_immutable, assert_provider_language};
use crate::llm::LlmProvider;
use crate::provider::{
    FindPlaceQuery, GeocodeQuery, NearbySearchQuery, PlacesProvider, TextSearchQuery,
};
use crate::ranking::{
    CuisineEnforcer, DEFAULT_R_MAX_METERS, FilterOptions, RankingSignals, filter_with_relaxation,
    rank, resolve_distance_origin, select_profile, weights_for,
};
use crate::realtime::{RealtimeHub, ServerMessage};
use crate::search::{
    AssistPayload, LatLng, NormalizedRequest, OpenStateFilter, Place, SearchResponse,
    SharedFilters,
};
use crate::store::{Job, JobStatus, JobStore};

use assemble::AssemblyInput;
use gate::GateDecision;

/// Radius used when a landmark anchors a nearby scan.
const LANDMARK_RADIUS_M: u32 = 1_000;

/// How many raw candidates ride in the `partial` frame.
const PARTIAL_PREVIEW: usize = 5;

pub struct Pipeline {
    store: Arc<JobStore>,
    hub: Arc<RealtimeHub>,
    llm: Arc<dyn LlmProvider>,
    places: Arc<dyn PlacesProvider>,
    cfg: PipelineConfig,
    ranking: RankingConfig,
}

enum Outcome {
    Success(SearchResponse),
    Clarify(AssistPayload),
    Stop(AssistPayload),
}

impl Pipeline {
    pub fn new(
        store: Arc<JobStore>,
        hub: Arc<RealtimeHub>,
        llm: Arc<dyn LlmProvider>,
        places: Arc<dyn PlacesProvider>,
        cfg: PipelineConfig,
        ranking: RankingConfig,
    ) -> Self {
        Self {
            store,
            hub,
            llm,
            places,
            cfg,
            ranking,
        }
    }

    /// Launch the pipeline for a freshly created job.
    pub fn spawn(self: &Arc<Self>, job: Job, cancel: CancelToken) -> tokio::task::JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.run(job, cancel).await;
        })
    }

    pub async fn run(&self, job: Job, cancel: CancelToken) {
        // Claiming PENDING -> RUNNING is what guarantees at most one
        // pipeline per request id.
        match self.store.set_status(&job.request_id, JobStatus::Running, Some(0)).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(request_id = %job.request_id, "job not claimable, skipping run");
                return;
            }
            Err(e) => {
                tracing::error!(request_id = %job.request_id, error = %e, "store unavailable at claim");
                return;
            }
        }

        let started = Instant::now();
        let deadline = started + self.cfg.total_deadline;
        let outcome = tokio::select! {
            outcome = self.execute(&job, deadline, &cancel) => outcome,
            _ = tokio::time::sleep(self.cfg.total_deadline) => Err(StageError::new(
                "pipeline",
                FailureCode::PipelineTimeout,
                format!("hard deadline of {:?} exceeded", self.cfg.total_deadline),
            )),
            _ = cancel.cancelled() => {
                tracing::info!(request_id = %job.request_id, "pipeline cancelled by client");
                self.finish_assist(
                    &job,
                    JobStatus::DoneStopped,
                    AssistPayload::Guide { topic: "search_cancelled".to_string() },
                )
                .await;
                return;
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(Outcome::Success(response)) => {
                match self.store.set_result(&job.request_id, response).await {
                    Ok(true) => {
                        if let Some(done) = self.store.get_job(&job.request_id).await {
                            self.hub.publish_terminal(&done);
                        }
                        tracing::info!(request_id = %job.request_id, duration_ms, "pipeline succeeded");
                    }
                    Ok(false) => {
                        tracing::warn!(request_id = %job.request_id, "result discarded, job already terminal");
                    }
                    Err(e) => {
                        tracing::error!(request_id = %job.request_id, error = %e, "failed to persist result");
                    }
                }
            }
            Ok(Outcome::Clarify(assist)) => {
                self.finish_assist(&job, JobStatus::DoneClarify, assist).await;
            }
            Ok(Outcome::Stop(assist)) => {
                self.finish_assist(&job, JobStatus::DoneStopped, assist).await;
            }
            Err(stage_error) => {
                tracing::warn!(
                    request_id = %job.request_id,
                    stage = stage_error.stage,
                    code = %stage_error.code,
                    duration_ms,
                    "pipeline failed"
                );
                let record = stage_error.into_record();
                if let Err(e) = self.store.set_error(&job.request_id, record).await {
                    tracing::error!(request_id = %job.request_id, error = %e, "failed to persist error");
                }
                if let Some(done) = self.store.get_job(&job.request_id).await {
                    self.hub.publish_terminal(&done);
                }
            }
        }
    }

    async fn finish_assist(&self, job: &Job, status: JobStatus, assist: AssistPayload) {
        match self
            .store
            .set_assist_outcome(&job.request_id, status, assist)
            .await
        {
            Ok(true) => {
                if let Some(done) = self.store.get_job(&job.request_id).await {
                    self.hub.publish_terminal(&done);
                }
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(request_id = %job.request_id, error = %e, "failed to persist assist outcome");
            }
        }
    }

    async fn execute(
        &self,
        job: &Job,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<Outcome, StageError> {
        let request = &job.request;

        // --- Gate ---
        let t = Instant::now();
        tracing::debug!(request_id = %job.request_id, stage = "gate", "stage_started");
        let (decision, ctx) = timed(
            "gate",
            self.cfg.gate_timeout,
            gate::run(
                self.llm.as_ref(),
                &request.query,
                request.language_hint.as_deref(),
                &self.cfg.default_region,
            ),
        )
        .await?;
        if let Err(e) = self.store.set_lang_context(&job.request_id, ctx.clone()).await {
            tracing::warn!(request_id = %job.request_id, error = %e, "lang context not persisted");
        }
        self.stage_done(job, "gate", 10, t).await;

        match decision {
            GateDecision::Continue => {}
            GateDecision::Clarify(assist) => return Ok(Outcome::Clarify(assist)),
            GateDecision::Stop(assist) => return Ok(Outcome::Stop(assist)),
        }

        // --- Intent ---
        let t = Instant::now();
        tracing::debug!(request_id = %job.request_id, stage = "intent", "stage_started");
        let (intent_out, next_ctx) = timed(
            "intent",
            self.cfg.intent_timeout,
            intent::run(self.llm.as_ref(), &request.query, request.user_location, &ctx),
        )
        .await?;

        // The intent model received language data from outside; hold it to
        // the immutability contract before trusting anything else it said.
        if let Some(echo) = &intent_out.assistant_language {
            if echo != ctx.assistant_language() {
                return Err(StageError::new(
                    "intent",
                    FailureCode::LangEnforcementViolation,
                    format!(
                        "stage attempted to change assistant language {} -> {echo}",
                        ctx.assistant_language()
                    ),
                ));
            }
        }
        assert_lang_ctx_immutable(&ctx, &next_ctx, "intent").map_err(|v| {
            StageError::new("intent", FailureCode::LangEnforcementViolation, v.to_string())
        })?;
        let ctx = next_ctx;
        if let Err(e) = self.store.set_lang_context(&job.request_id, ctx.clone()).await {
            tracing::warn!(request_id = %job.request_id, error = %e, "lang context not persisted");
        }
        self.stage_done(job, "intent", 25, t).await;

        let filters = merge_filters(&request.filters, &intent_out);

        // --- Route mapping ---
        let t = Instant::now();
        tracing::debug!(request_id = %job.request_id, stage = "route", "stage_started");
        let decision = timed("route", self.cfg.route_timeout, async {
            Ok(route::map_route(&intent_out, request))
        })
        .await?;
        let mapping = match decision {
            RouteDecision::Provider(mapping) => mapping,
            RouteDecision::Clarify(assist) => return Ok(Outcome::Clarify(assist)),
        };
        self.stage_done(job, "route", 40, t).await;

        // --- Provider call ---
        let t = Instant::now();
        tracing::debug!(request_id = %job.request_id, stage = "provider", "stage_started");
        let (pool, street_anchor, city_center) = self
            .call_provider(&mapping, request, &intent_out, &ctx, cancel)
            .await?;
        if pool.is_empty() {
            return Err(StageError::new(
                "provider",
                FailureCode::ProviderZeroResults,
                "provider returned no candidates",
            ));
        }
        if let Err(e) = self.store.set_candidate_pool(&job.request_id, &pool).await {
            tracing::warn!(request_id = %job.request_id, error = %e, "candidate pool not persisted");
        }
        self.hub.publish(
            &job.request_id,
            ServerMessage::Partial {
                request_id: job.request_id.clone(),
                results: pool.iter().take(PARTIAL_PREVIEW).cloned().collect(),
            },
        );
        self.stage_done(job, "provider", 70, t).await;

        // --- Post-filter + relax ---
        let t = Instant::now();
        tracing::debug!(request_id = %job.request_id, stage = "post_filter", "stage_started");
        let filter_opts = FilterOptions {
            keep_unknown: self.ranking.keep_unknown_open_state,
        };
        let relax_outcome = timed("post_filter", self.cfg.post_filter_timeout, async {
            Ok(filter_with_relaxation(
                &pool,
                &filters,
                &filter_opts,
                self.ranking.min_acceptable_results,
            ))
        })
        .await?;
        self.stage_done(job, "post_filter", 85, t).await;

        // --- Rank ---
        let t = Instant::now();
        tracing::debug!(request_id = %job.request_id, stage = "rank", "stage_started");
        let mut survivors = relax_outcome.results;
        if let Some(cuisine_key) = &intent_out.cuisine_key {
            // Boost-only; an enforcer timeout leaves scores neutral.
            let enforcer = CuisineEnforcer::new(self.llm.clone());
            let _ = tokio::time::timeout(
                self.cfg.rank_timeout,
                enforcer.score_places(cuisine_key, &mut survivors),
            )
            .await;
        }

        let signals = RankingSignals {
            route: Some(mapping.kind()),
            has_user_location: request.user_location.is_some(),
            intent_reason: intent_out.intent_reason.clone(),
            cuisine_key: intent_out.cuisine_key.clone(),
            open_now_requested: intent_out.open_now_requested,
            price_intent: filters.price_intent,
            quality_intent: intent_out.quality_intent,
            occasion: intent_out.occasion.clone(),
        };
        let profile = select_profile(&signals);
        let origin = resolve_distance_origin(
            intent_out.intent_reason.as_deref(),
            city_center,
            request.user_location,
        );
        let ranked = rank(survivors, &weights_for(profile), origin, DEFAULT_R_MAX_METERS);
        self.stage_done(job, "rank", 95, t).await;

        // --- Assistant assembly ---
        let t = Instant::now();
        tracing::debug!(request_id = %job.request_id, stage = "assistant", "stage_started");
        // Under time pressure the distance grouping is dropped and only the
        // ranked results ship.
        let abridged =
            deadline.saturating_duration_since(Instant::now()) < self.cfg.assistant_min_remaining;
        let response = assemble::assemble(AssemblyInput {
            results: ranked,
            street_anchor: if abridged { None } else { street_anchor },
            filters: &filters,
            has_user_location: request.user_location.is_some(),
            counters: relax_outcome.counters,
            profile,
            origin,
            relaxed: relax_outcome.relaxed,
            denied: relax_outcome.denied,
        });
        self.stage_done(job, "assistant", 100, t).await;

        Ok(Outcome::Success(response))
    }

    /// Execute the mapped provider call. Returns the candidate pool, the
    /// street anchor (landmark plans only), and the geocoded city center.
    async fn call_provider(
        &self,
        mapping: &ProviderMapping,
        request: &NormalizedRequest,
        intent_out: &IntentOutput,
        ctx: &LanguageContext,
        cancel: &CancelToken,
    ) -> Result<(Vec<Place>, Option<LatLng>, Option<LatLng>), StageError> {
        assert_provider_language(ctx, &ctx.provider_language).map_err(|v| {
            StageError::new("provider", FailureCode::LangEnforcementViolation, v.to_string())
        })?;
        let language = ctx.provider_language.clone();
        let region = ctx.region_code.clone();

        let city_center = if intent_out.intent_reason.as_deref() == Some("explicit_city_mentioned")
        {
            match &intent_out.city_text {
                Some(city) => self
                    .places
                    .geocode_address(
                        &GeocodeQuery {
                            address: city.clone(),
                            language: language.clone(),
                            region: region.clone(),
                        },
                        cancel,
                    )
                    .await
                    .unwrap_or_else(|e| {
                        tracing::warn!(error = %e, "city geocode failed");
                        None
                    }),
                None => None,
            }
        } else {
            None
        };

        let as_stage = |e: crate::error::ProviderError| {
            StageError::new("provider", e.failure_code(), e.to_string())
        };

        match mapping {
            ProviderMapping::TextSearch { query, .. } => {
                let page = self
                    .places
                    .text_search(
                        &TextSearchQuery {
                            query: query.clone(),
                            language,
                            region,
                            location_bias: request.user_location,
                            page_token: None,
                        },
                        cancel,
                    )
                    .await
                    .map_err(as_stage)?;
                Ok((page.places, None, city_center))
            }
            ProviderMapping::NearbySearch { radius_m, keyword } => {
                let location = request.user_location.ok_or_else(|| {
                    StageError::new(
                        "provider",
                        FailureCode::LocationRequired,
                        "nearby search without user location",
                    )
                })?;
                let page = self
                    .places
                    .nearby_search(
                        &NearbySearchQuery {
                            location,
                            radius_m: *radius_m,
                            keyword: keyword.clone(),
                            language,
                        },
                        cancel,
                    )
                    .await
                    .map_err(as_stage)?;
                Ok((page.places, None, city_center))
            }
            ProviderMapping::LandmarkPlan { landmark, keyword } => {
                let anchor = self
                    .places
                    .find_place(
                        &FindPlaceQuery {
                            input: landmark.clone(),
                            language: language.clone(),
                        },
                        cancel,
                    )
                    .await
                    .map_err(as_stage)?;

                match anchor {
                    Some(anchor_place) => {
                        let page = self
                            .places
                            .nearby_search(
                                &NearbySearchQuery {
                                    location: anchor_place.location,
                                    radius_m: LANDMARK_RADIUS_M,
                                    keyword: keyword.clone(),
                                    language,
                                },
                                cancel,
                            )
                            .await
                            .map_err(as_stage)?;
                        Ok((page.places, Some(anchor_place.location), city_center))
                    }
                    None => {
                        // Unresolvable landmark: degrade to a plain text
                        // search over the original query.
                        let page = self
                            .places
                            .text_search(
                                &TextSearchQuery {
                                    query: request.query.clone(),
                                    language,
                                    region,
                                    location_bias: request.user_location,
                                    page_token: None,
                                },
                                cancel,
                            )
                            .await
                            .map_err(as_stage)?;
                        Ok((page.places, None, city_center))
                    }
                }
            }
        }
    }

    async fn stage_done(&self, job: &Job, stage: &'static str, progress: u8, started: Instant) {
        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            request_id = %job.request_id,
            stage,
            duration_ms,
            progress,
            "stage_completed"
        );
        // set_status bumps updated_at, which is the heartbeat.
        if let Err(e) = self
            .store
            .set_status(&job.request_id, JobStatus::Running, Some(progress))
            .await
        {
            tracing::warn!(request_id = %job.request_id, error = %e, "progress not persisted");
        }
        self.hub.publish(
            &job.request_id,
            ServerMessage::Progress {
                request_id: job.request_id.clone(),
                stage: stage.to_string(),
                progress,
            },
        );
    }
}

/// Client-supplied filters win over intent-derived ones.
fn merge_filters(client: &SharedFilters, intent_out: &IntentOutput) -> SharedFilters {
    SharedFilters {
        open_state: client.open_state.or(intent_out
            .open_now_requested
            .then_some(OpenStateFilter::OpenNow)),
        min_rating_bucket: client.min_rating_bucket.or(intent_out.min_rating_bucket),
        price_intent: client.price_intent.or(intent_out.price_intent),
        is_gluten_free: client.is_gluten_free,
        is_kosher: client.is_kosher,
        meat_dairy: client.meat_dairy,
    }
}

async fn timed<T, F>(stage: &'static str, budget: std::time::Duration, fut: F) -> Result<T, StageError>
where
    F: std::future::Future<Output = Result<T, StageError>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(StageError::timeout(stage, budget.as_millis() as u64)),
    }
}
