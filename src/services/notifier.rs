use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Error, Result};
use parking_lot::Mutex;
use rand::{SeedableRng, rngs::StdRng};
use tokio::{
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{error, info, warn};

use crate::{
    clients::{
        cache::TtlCache,
        circuit_breaker::CircuitBreaker,
        clock::Clock,
        dead_letter::DeadLetterSink,
        gateway::PushGateway,
        health::HealthChecker,
        quota::QuotaTracker,
        recipients::RecipientStore,
        store::DocumentStore,
    },
    config::Config,
    models::{
        dispatch::{DispatchResult, SkipReason},
        health::{ServiceHealth, SystemHealth},
        message::{CommentEvent, EventSubmission, NotificationMessage},
        recipient::{GeoPoint, Recipient},
        retry::{QueueStatus, RetryRunSummary},
    },
    services::{
        dispatcher::{BatchSender, Dispatcher},
        geo_filter::{GeoFilter, Zone},
        retry_queue::RetryQueue,
        token_selector::TokenSelector,
    },
};

/// Intervals of the timer-driven jobs.
#[derive(Debug, Clone)]
pub struct SweepSchedule {
    pub retry_interval: Duration,
    pub stale_sweep_interval: Duration,
    pub dead_letter_sweep_interval: Duration,
    pub cache_sweep_interval: Duration,
}

impl Default for SweepSchedule {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(5 * 60),
            stale_sweep_interval: Duration::from_secs(60 * 60),
            dead_letter_sweep_interval: Duration::from_secs(24 * 60 * 60),
            cache_sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Owns every pipeline component and exposes the operations callers use.
pub struct NotificationService {
    clock: Arc<dyn Clock>,
    breaker: Arc<CircuitBreaker>,
    recipients: Arc<RecipientStore>,
    recipient_cache: Arc<TtlCache<Arc<Vec<Recipient>>>>,
    entity_cache: Arc<TtlCache<Option<Recipient>>>,
    location_cache: TtlCache<Arc<HashMap<String, Zone>>>,
    geo_filter: GeoFilter,
    token_selector: TokenSelector,
    quota: QuotaTracker,
    dispatcher: Dispatcher,
    retry_queue: Arc<RetryQueue>,
    dead_letters: Arc<DeadLetterSink>,
    health: HealthChecker,
    maintenance_mode: AtomicBool,
    rng: Mutex<StdRng>,
}

impl NotificationService {
    pub fn new(
        config: &Config,
        store: Arc<dyn DocumentStore>,
        gateway: Arc<dyn PushGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            "push_gateway".to_string(),
            config.circuit_breaker_config(),
            clock.clone(),
        ));

        let recipient_cache = Arc::new(TtlCache::new(
            "recipients",
            config.recipient_cache_config(),
            clock.clone(),
        ));
        let entity_cache = Arc::new(TtlCache::new(
            "entities",
            config.entity_cache_config(),
            clock.clone(),
        ));
        let location_cache = TtlCache::new("locations", config.location_cache_config(), clock.clone());

        let recipients = Arc::new(RecipientStore::new(
            store.clone(),
            recipient_cache.clone(),
            entity_cache.clone(),
        ));
        let dead_letters = Arc::new(DeadLetterSink::new(
            store.clone(),
            clock.clone(),
            config.dead_letter_retention_days,
        ));

        let dispatch_config = config.dispatch_config();
        let sender = Arc::new(BatchSender::new(gateway, breaker.clone(), &dispatch_config));

        let retry_queue = Arc::new(RetryQueue::new(
            store.clone(),
            clock.clone(),
            sender.clone(),
            breaker.clone(),
            recipients.clone(),
            dead_letters.clone(),
            config.retry_config(),
            config.dead_letter_unclassified,
        ));
        let dispatcher = Dispatcher::new(sender, recipients.clone(), retry_queue.clone());

        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        info!(
            token_policy = ?config.token_policy,
            radius_km = config.geo_radius_km,
            batch_size = dispatch_config.batch_size,
            daily_quota = config.daily_quota,
            "Notification service initialized"
        );

        Self {
            quota: QuotaTracker::new(store.clone(), clock.clone(), config.quota_config()),
            health: HealthChecker::new(store, breaker.clone()),
            geo_filter: GeoFilter::new(config.geo_filter_config()),
            token_selector: TokenSelector::new(config.token_policy),
            maintenance_mode: AtomicBool::new(config.maintenance_mode),
            rng: Mutex::new(rng),
            clock,
            breaker,
            recipients,
            recipient_cache,
            entity_cache,
            location_cache,
            dispatcher,
            retry_queue,
            dead_letters,
        }
    }

    /// Replaces the random source behind the geo filter.
    pub fn with_rng(self, rng: StdRng) -> Self {
        *self.rng.lock() = rng;
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn retry_queue(&self) -> &Arc<RetryQueue> {
        &self.retry_queue
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterSink> {
        &self.dead_letters
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub fn set_maintenance_mode(&self, enabled: bool) {
        self.maintenance_mode.store(enabled, Ordering::SeqCst);
        warn!(enabled, "Maintenance mode changed");
    }

    pub fn maintenance_mode(&self) -> bool {
        self.maintenance_mode.load(Ordering::SeqCst)
    }

    /// Notifies recipients near a new post.
    pub async fn submit_event(&self, event: &EventSubmission) -> Result<DispatchResult, Error> {
        let mut result = DispatchResult::new(&event.event_id);

        if self.maintenance_mode() {
            info!(event_id = %event.event_id, "Maintenance mode, event not dispatched");
            return Ok(result.skipped(SkipReason::MaintenanceMode));
        }

        let recipients = self.recipients.active_recipients().await?;
        let candidates: Vec<&Recipient> = recipients
            .iter()
            .filter(|r| r.user_id != event.author_id)
            .collect();
        result.candidates = candidates.len();

        let zones = self.zones_for(event.location, &candidates);
        let (nearby, geo_stats) = {
            let mut rng = self.rng.lock();
            self.geo_filter
                .filter(event.location, candidates.iter().copied(), &zones, &mut *rng)
        };
        result.geo = Some(geo_stats);

        let selection = self.token_selector.select(nearby);
        result.users_without_valid_token = selection.users_without_valid_token;
        result.selected_tokens = selection.tokens.len();

        if selection.is_empty() {
            info!(event_id = %event.event_id, candidates = result.candidates, "No recipients for event");
            return Ok(result.skipped(SkipReason::NoRecipients));
        }

        let message = NotificationMessage::for_post(event);
        self.deliver(result, message, selection.token_strings()).await
    }

    /// Notifies a post's owner about a comment by someone else.
    pub async fn submit_comment(&self, event: &CommentEvent) -> Result<DispatchResult, Error> {
        let mut result = DispatchResult::new(&event.post_id);

        if self.maintenance_mode() {
            return Ok(result.skipped(SkipReason::MaintenanceMode));
        }

        if event.commenter_id == event.post_owner_id {
            return Ok(result.skipped(SkipReason::SelfNotification));
        }

        let owner = match self.recipients.recipient(&event.post_owner_id).await? {
            Some(owner) if owner.is_active => owner,
            _ => {
                info!(post_id = %event.post_id, owner = %event.post_owner_id, "Post owner has no active tokens");
                return Ok(result.skipped(SkipReason::RecipientNotFound));
            }
        };
        result.candidates = 1;

        let selection = self.token_selector.select([&owner]);
        result.users_without_valid_token = selection.users_without_valid_token;
        result.selected_tokens = selection.tokens.len();

        if selection.is_empty() {
            return Ok(result.skipped(SkipReason::NoRecipients));
        }

        let message = NotificationMessage::for_comment(event);
        self.deliver(result, message, selection.token_strings()).await
    }

    /// Breaker gate, then quota gate, then dispatch.
    async fn deliver(
        &self,
        mut result: DispatchResult,
        message: NotificationMessage,
        mut tokens: Vec<String>,
    ) -> Result<DispatchResult, Error> {
        if self.breaker.is_open() {
            warn!(event_id = %result.event_id, tokens = tokens.len(), "Circuit breaker open, dispatch skipped");
            return Ok(result.skipped(SkipReason::CircuitOpen));
        }

        let reservation = self.quota.try_reserve(tokens.len() as u64).await?;
        let granted = reservation.granted as usize;
        let allowed = reservation.allowed;
        result.quota = Some(reservation);

        if !allowed {
            return Ok(result.skipped(SkipReason::QuotaExceeded));
        }
        tokens.truncate(granted);

        let report = self
            .dispatcher
            .dispatch(&result.event_id, &message, tokens)
            .await;
        result.report = Some(report);

        Ok(result)
    }

    /// Distance zones per user for this event cell, memoised in the location cache.
    fn zones_for(&self, event: GeoPoint, candidates: &[&Recipient]) -> Arc<HashMap<String, Zone>> {
        let key = format!(
            "{:.4}_{:.4}_{}",
            event.lat,
            event.lng,
            self.geo_filter.config().radius_km
        );

        let cached = self.location_cache.get(&key);
        if let Some(zones) = &cached
            && candidates.iter().all(|r| zones.contains_key(&r.user_id))
        {
            return Arc::clone(zones);
        }

        let mut zones = cached.map(|z| (*z).clone()).unwrap_or_default();
        zones.extend(
            self.geo_filter
                .classify_all(event, candidates.iter().copied()),
        );

        let zones = Arc::new(zones);
        self.location_cache.set(key, Arc::clone(&zones));
        zones
    }

    pub async fn queue_status(&self) -> Result<QueueStatus, Error> {
        self.retry_queue.status().await
    }

    pub async fn flush_retry_queue(&self) -> Result<RetryRunSummary, Error> {
        self.retry_queue.flush().await
    }

    /// Empties every cache. Returns the number of entries dropped.
    pub fn clear_caches(&self) -> usize {
        let cleared =
            self.recipient_cache.clear() + self.entity_cache.clear() + self.location_cache.clear();
        info!(cleared, "Caches cleared");
        cleared
    }

    pub fn sweep_caches(&self) -> usize {
        self.recipient_cache.sweep_expired()
            + self.entity_cache.sweep_expired()
            + self.location_cache.sweep_expired()
    }

    pub async fn system_health(&self) -> SystemHealth {
        let mut checks = self.health.check_all().await;
        let maintenance_mode = self.maintenance_mode();

        let quota = match self.quota.state().await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(error = %e, "Quota state unavailable");
                None
            }
        };
        let queue = match self.retry_queue.status().await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(error = %e, "Retry queue status unavailable");
                None
            }
        };
        let dead_letters = match self.dead_letters.count().await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(error = %e, "Dead letter count unavailable");
                None
            }
        };

        if let Some(state) = quota.as_ref().filter(|q| q.remaining == 0) {
            checks.insert(
                "daily_quota".to_string(),
                ServiceHealth::degraded(format!(
                    "Daily quota of {} exhausted for {}",
                    state.limit, state.date
                )),
            );
        }

        let caches: BTreeMap<String, _> = [
            (self.recipient_cache.name(), self.recipient_cache.stats()),
            (self.entity_cache.name(), self.entity_cache.stats()),
            (self.location_cache.name(), self.location_cache.stats()),
        ]
        .into_iter()
        .map(|(name, stats)| (name.to_string(), stats))
        .collect();

        SystemHealth {
            status: HealthChecker::determine_overall_status(&checks, maintenance_mode),
            timestamp: self.clock.now(),
            maintenance_mode,
            checks,
            circuit_breaker: self.breaker.snapshot(),
            caches,
            quota,
            queue,
            dead_letters,
        }
    }

    /// Starts the timer jobs: retry worker, stale sweep, dead-letter sweep
    /// and cache sweep.
    pub fn spawn_background_jobs(self: &Arc<Self>, schedule: &SweepSchedule) -> Vec<JoinHandle<()>> {
        let retry = {
            let service = Arc::clone(self);
            let period = schedule.retry_interval;
            tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Err(e) = service.retry_queue.process_due().await {
                        error!(error = %e, "Retry worker run failed");
                    }
                }
            })
        };

        let stale = {
            let service = Arc::clone(self);
            let period = schedule.stale_sweep_interval;
            tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Err(e) = service.retry_queue.sweep_stale().await {
                        error!(error = %e, "Stale retry sweep failed");
                    }
                }
            })
        };

        let dead_letter = {
            let service = Arc::clone(self);
            let period = schedule.dead_letter_sweep_interval;
            tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Err(e) = service.dead_letters.sweep_expired().await {
                        error!(error = %e, "Dead letter sweep failed");
                    }
                }
            })
        };

        let cache = {
            let service = Arc::clone(self);
            let period = schedule.cache_sweep_interval;
            tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let removed = service.sweep_caches();
                    if removed > 0 {
                        info!(removed, "Expired cache entries swept");
                    }
                }
            })
        };

        info!(
            retry_interval_secs = schedule.retry_interval.as_secs(),
            "Background jobs started"
        );

        vec![retry, stale, dead_letter, cache]
    }
}
