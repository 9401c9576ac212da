use std::{
    collections::HashSet,
    sync::Arc,
};

use anyhow::{Error, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    clients::{
        cache::TtlCache,
        store::{Document, DocumentStore, Filter, WriteOp, commit_in_chunks, from_document},
    },
    models::recipient::{Recipient, RecipientRecord},
};

pub const RECIPIENTS_COLLECTION: &str = "user_tokens";

const ACTIVE_RECIPIENTS_KEY: &str = "active_recipients";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    pub tokens: usize,
    pub documents_updated: usize,
    pub deactivated: usize,
}

/// Read-mostly view over the recipient documents, shielded by two caches.
pub struct RecipientStore {
    store: Arc<dyn DocumentStore>,
    recipient_cache: Arc<TtlCache<Arc<Vec<Recipient>>>>,
    entity_cache: Arc<TtlCache<Option<Recipient>>>,
}

impl RecipientStore {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        recipient_cache: Arc<TtlCache<Arc<Vec<Recipient>>>>,
        entity_cache: Arc<TtlCache<Option<Recipient>>>,
    ) -> Self {
        Self {
            store,
            recipient_cache,
            entity_cache,
        }
    }

    fn parse(id: &str, doc: Document) -> Option<Recipient> {
        match from_document::<RecipientRecord>(doc) {
            Ok(record) => Some(Recipient::from_record(id, &record)),
            Err(e) => {
                warn!(doc_id = %id, error = %e, "Skipping malformed recipient document");
                None
            }
        }
    }

    /// Every active recipient, served from cache within its TTL.
    pub async fn active_recipients(&self) -> Result<Arc<Vec<Recipient>>, Error> {
        if let Some(cached) = self.recipient_cache.get(ACTIVE_RECIPIENTS_KEY) {
            debug!(recipients = cached.len(), "Active recipients served from cache");
            return Ok(cached);
        }

        let docs = self
            .store
            .query(RECIPIENTS_COLLECTION, &Filter::new().eq("isActive", true))
            .await?;

        let recipients: Vec<Recipient> = docs
            .into_iter()
            .filter_map(|(id, doc)| Self::parse(&id, doc))
            .filter(|recipient| recipient.is_active)
            .collect();

        info!(recipients = recipients.len(), "Loaded active recipients");

        let recipients = Arc::new(recipients);
        self.recipient_cache
            .set(ACTIVE_RECIPIENTS_KEY, Arc::clone(&recipients));
        Ok(recipients)
    }

    /// One recipient by user id, cached including "not found".
    pub async fn recipient(&self, user_id: &str) -> Result<Option<Recipient>, Error> {
        if let Some(cached) = self.entity_cache.get(user_id) {
            return Ok(cached);
        }

        let found = match self.store.get(RECIPIENTS_COLLECTION, user_id).await? {
            Some(doc) => Self::parse(user_id, doc),
            None => self
                .store
                .query(
                    RECIPIENTS_COLLECTION,
                    &Filter::new().eq("userId", user_id).limit(1),
                )
                .await?
                .into_iter()
                .next()
                .and_then(|(id, doc)| Self::parse(&id, doc)),
        };

        self.entity_cache.set(user_id, found.clone());
        Ok(found)
    }

    /// Removes `tokens` from every recipient document that holds them.
    ///
    /// Token bags keep their stored shape; a recipient left with nothing is
    /// marked inactive.
    pub async fn purge_tokens(&self, tokens: &[String]) -> Result<PurgeSummary, Error> {
        if tokens.is_empty() {
            return Ok(PurgeSummary::default());
        }

        let purged: HashSet<String> = tokens.iter().cloned().collect();
        let docs = self
            .store
            .query(RECIPIENTS_COLLECTION, &Filter::new())
            .await?;

        let mut summary = PurgeSummary {
            tokens: purged.len(),
            ..Default::default()
        };
        let mut ops = Vec::new();
        let mut touched_users = Vec::new();

        for (id, doc) in docs {
            let Ok(mut record) = from_document::<RecipientRecord>(doc) else {
                continue;
            };
            let was_active = record.is_active;
            if !record.purge(&purged) {
                continue;
            }

            let mut fields = Document::new();
            fields.insert(
                "tokens".to_string(),
                serde_json::to_value(&record.tokens)?,
            );
            fields.insert(
                "fcmToken".to_string(),
                record.fcm_token.clone().map_or(Value::Null, Value::String),
            );
            fields.insert("isActive".to_string(), Value::Bool(record.is_active));

            if was_active && !record.is_active {
                summary.deactivated += 1;
            }
            touched_users.push(if record.user_id.is_empty() { id.clone() } else { record.user_id.clone() });

            ops.push(WriteOp::Update {
                collection: RECIPIENTS_COLLECTION.to_string(),
                id,
                fields,
            });
        }

        summary.documents_updated = commit_in_chunks(self.store.as_ref(), ops).await?;

        if summary.documents_updated > 0 {
            self.recipient_cache.invalidate(ACTIVE_RECIPIENTS_KEY);
            for user_id in &touched_users {
                self.entity_cache.invalidate(user_id);
            }
        }

        info!(
            tokens = summary.tokens,
            documents_updated = summary.documents_updated,
            deactivated = summary.deactivated,
            "Purged invalid tokens"
        );

        Ok(summary)
    }
}
