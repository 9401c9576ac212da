use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use push_fanout::{
    clients::{
        clock::ManualClock,
        gateway::PushGateway,
        recipients::RECIPIENTS_COLLECTION,
        store::{Document, DocumentStore, Filter, InMemoryStore, TxApply, TxOutcome, WriteOp, to_document},
    },
    config::Config,
    models::{
        dispatch::{OutboundMessage, SendResponse},
        message::{EventPayload, EventSubmission},
        recipient::{GeoPoint, RecipientRecord, TokenBag},
    },
    services::notifier::NotificationService,
};
use tokio::sync::Barrier;

pub const BANGKOK: GeoPoint = GeoPoint {
    lat: 13.7563,
    lng: 100.5018,
};

/// A token that passes format validation, unique per `tag`.
pub fn valid_token(tag: &str) -> String {
    let mut token = format!("{tag}:APA91bHx");
    while token.len() < 152 {
        token.push('Q');
    }
    token
}

/// A point `km` kilometres due north of Bangkok.
pub fn north_of_bangkok(km: f64) -> GeoPoint {
    GeoPoint::new(BANGKOK.lat + (km / 6371.0_f64).to_degrees(), BANGKOK.lng)
}

/// Push gateway answering from a per-token script; unscripted tokens are delivered.
#[derive(Default)]
pub struct ScriptedGateway {
    failures: Mutex<HashMap<String, String>>,
    transport_down: Mutex<bool>,
    batches: Mutex<Vec<Vec<String>>>,
}

impl ScriptedGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_token(&self, token: &str, code: &str) {
        self.failures
            .lock()
            .insert(token.to_string(), code.to_string());
    }

    pub fn heal_token(&self, token: &str) {
        self.failures.lock().remove(token);
    }

    pub fn set_transport_down(&self, down: bool) {
        *self.transport_down.lock() = down;
    }

    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().clone()
    }

    pub fn sent_tokens(&self) -> Vec<String> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl PushGateway for ScriptedGateway {
    async fn send_batch(&self, messages: &[OutboundMessage]) -> Result<Vec<SendResponse>, Error> {
        self.batches
            .lock()
            .push(messages.iter().map(|m| m.token.clone()).collect());

        if *self.transport_down.lock() {
            return Err(anyhow!("connection refused"));
        }

        let failures = self.failures.lock();
        Ok(messages
            .iter()
            .map(|m| match failures.get(&m.token) {
                Some(code) => SendResponse::failed(code.clone(), "scripted failure"),
                None => SendResponse::delivered(format!("projects/test/messages/{}", m.token.len())),
            })
            .collect())
    }
}

const OPTIMISTIC_TX_ATTEMPTS: usize = 100;

/// In-memory store with scriptable faults.
///
/// Sets and deletes can be made to fail, and transactions can run optimistically:
/// read, yield, then compare-and-set, retrying on conflict the way the Redis
/// store does.
#[derive(Default)]
pub struct ScriptedStore {
    inner: InMemoryStore,
    failing_deletes: Mutex<HashMap<String, usize>>,
    failing_sets: Mutex<HashMap<String, usize>>,
    optimistic: AtomicBool,
    read_barrier: Mutex<Option<(Arc<Barrier>, usize)>>,
    conflicts: AtomicUsize,
}

impl ScriptedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `times` deletes in `collection` fail.
    pub fn fail_deletes(&self, collection: &str, times: usize) {
        self.failing_deletes
            .lock()
            .insert(collection.to_string(), times);
    }

    /// The next `times` sets in `collection` fail.
    pub fn fail_sets(&self, collection: &str, times: usize) {
        self.failing_sets
            .lock()
            .insert(collection.to_string(), times);
    }

    /// Optimistic transactions where the first read of each of the next
    /// `contenders` calls waits until all of them have read.
    pub fn contend(&self, contenders: usize) {
        self.optimistic.store(true, Ordering::SeqCst);
        *self.read_barrier.lock() = Some((Arc::new(Barrier::new(contenders)), contenders));
    }

    pub fn conflicts(&self) -> usize {
        self.conflicts.load(Ordering::SeqCst)
    }
}

fn take_failure(failures: &Mutex<HashMap<String, usize>>, collection: &str) -> bool {
    match failures.lock().get_mut(collection) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

#[async_trait]
impl DocumentStore for ScriptedStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, Error> {
        self.inner.get(collection, id).await
    }

    async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<(String, Document)>, Error> {
        self.inner.query(collection, filter).await
    }

    async fn set(&self, collection: &str, id: &str, doc: Document) -> Result<(), Error> {
        if take_failure(&self.failing_sets, collection) {
            return Err(anyhow!("Scripted set failure for {}/{}", collection, id));
        }
        self.inner.set(collection, id, doc).await
    }

    async fn update(&self, collection: &str, id: &str, fields: Document) -> Result<(), Error> {
        self.inner.update(collection, id, fields).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), Error> {
        if take_failure(&self.failing_deletes, collection) {
            return Err(anyhow!("Scripted delete failure for {}/{}", collection, id));
        }
        self.inner.delete(collection, id).await
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), Error> {
        self.inner.batch_write(ops).await
    }

    async fn transaction(
        &self,
        collection: &str,
        id: &str,
        apply: TxApply<'_>,
    ) -> Result<TxOutcome, Error> {
        if !self.optimistic.load(Ordering::SeqCst) {
            return self.inner.transaction(collection, id, apply).await;
        }

        let barrier = {
            let mut slot = self.read_barrier.lock();
            let taken = slot.as_mut().map(|(barrier, remaining)| {
                *remaining -= 1;
                Arc::clone(barrier)
            });
            if slot.as_ref().is_some_and(|(_, remaining)| *remaining == 0) {
                *slot = None;
            }
            taken
        };
        for attempt in 0..OPTIMISTIC_TX_ATTEMPTS {
            let previous = self.inner.get(collection, id).await?;
            match (&barrier, attempt) {
                (Some(barrier), 0) => {
                    barrier.wait().await;
                }
                _ => tokio::task::yield_now().await,
            }
            let written = apply(previous.as_ref())?;

            let conflicted = AtomicBool::new(false);
            let outcome = self
                .inner
                .transaction(collection, id, &|current| {
                    if current != previous.as_ref() {
                        conflicted.store(true, Ordering::SeqCst);
                        return Ok(None);
                    }
                    Ok(written.clone())
                })
                .await?;

            if !conflicted.load(Ordering::SeqCst) {
                return Ok(outcome);
            }
            self.conflicts.fetch_add(1, Ordering::SeqCst);
        }

        Err(anyhow!("Transaction on {}/{} kept conflicting", collection, id))
    }

    async fn ping(&self) -> Result<(), Error> {
        self.inner.ping().await
    }
}

/// Service wired to an in-memory store, a manual clock and a scripted gateway.
pub struct Harness {
    pub store: Arc<ScriptedStore>,
    pub clock: Arc<ManualClock>,
    pub gateway: Arc<ScriptedGateway>,
    pub service: NotificationService,
}

pub fn test_config() -> Config {
    Config {
        inter_batch_delay_ms: 0,
        rng_seed: Some(7),
        ..Default::default()
    }
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: Config) -> Harness {
    let store = ScriptedStore::new();
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 3, 14, 3, 0, 0).unwrap(),
    ));
    let gateway = ScriptedGateway::new();

    let service = NotificationService::new(&config, store.clone(), gateway.clone(), clock.clone());

    Harness {
        store,
        clock,
        gateway,
        service,
    }
}

pub async fn seed_recipient(
    store: &dyn DocumentStore,
    user_id: &str,
    location: Option<GeoPoint>,
    tokens: Vec<String>,
) -> Result<()> {
    let record = RecipientRecord {
        user_id: user_id.to_string(),
        tokens: Some(TokenBag::List(tokens.into_iter().map(Some).collect())),
        fcm_token: None,
        is_active: true,
        last_known_lat: location.map(|p| p.lat),
        last_known_lng: location.map(|p| p.lng),
        platform: Some("android".to_string()),
    };

    store
        .set(RECIPIENTS_COLLECTION, user_id, to_document(&record)?)
        .await
}

pub fn post_at(event_id: &str, location: GeoPoint, author_id: &str) -> EventSubmission {
    EventSubmission {
        event_id: event_id.to_string(),
        location,
        payload: EventPayload {
            category: "flood".to_string(),
            description: "Water rising on Sukhumvit soi 11".to_string(),
            location_label: Some("Sukhumvit".to_string()),
            author_name: Some("Somchai".to_string()),
        },
        author_id: author_id.to_string(),
    }
}
