use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, Script, aio::MultiplexedConnection};
use tracing::{debug, info, warn};

use crate::clients::store::{
    Document, DocumentStore, Filter, TxApply, TxOutcome, WriteOp, check_batch_size,
};

const MAX_CAS_ATTEMPTS: usize = 16;

/// Writes ARGV[2] to KEYS[1] only if it still holds ARGV[1] (or is absent when
/// ARGV[4] is "0"), and registers ARGV[3] in the id set at KEYS[2].
const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[4] == '1' then
  if current ~= ARGV[1] then return 0 end
else
  if current then return 0 end
end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('SADD', KEYS[2], ARGV[3])
return 1
"#;

/// Document store on Redis: one JSON string per document plus an id set per collection.
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
    prefix: String,
    cas_script: Script,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, Error> {
        info!("Connecting to Redis...");

        let client = Client::open(redis_url)
            .map_err(|e| anyhow!("Failed to create redis client: {}", e))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| anyhow!("Failed to connect to redis: {}", e))?;

        info!(prefix = %prefix, "Redis connection established");

        Ok(Self {
            connection,
            prefix: prefix.to_string(),
            cas_script: Script::new(COMPARE_AND_SET),
        })
    }

    fn doc_key(&self, collection: &str, id: &str) -> String {
        format!("{}:{}:{}", self.prefix, collection, id)
    }

    fn index_key(&self, collection: &str) -> String {
        format!("{}:{}:_ids", self.prefix, collection)
    }

    fn decode(raw: &str) -> Result<Document, Error> {
        serde_json::from_str(raw).map_err(|e| anyhow!("Corrupt document in redis: {}", e))
    }

    /// One compare-and-set round. `Ok(false)` means another writer got there first.
    async fn compare_and_set(
        &self,
        collection: &str,
        id: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, Error> {
        let mut conn = self.connection.clone();
        let written: i32 = self
            .cas_script
            .key(self.doc_key(collection, id))
            .key(self.index_key(collection))
            .arg(expected.unwrap_or(""))
            .arg(new)
            .arg(id)
            .arg(if expected.is_some() { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;

        Ok(written == 1)
    }
}

#[async_trait]
impl DocumentStore for RedisStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, Error> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(self.doc_key(collection, id)).await?;
        raw.as_deref().map(Self::decode).transpose()
    }

    async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<(String, Document)>, Error> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn.smembers(self.index_key(collection)).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.doc_key(collection, id)).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut docs = Vec::with_capacity(ids.len());
        for (id, raw) in ids.into_iter().zip(values) {
            match raw.as_deref().map(Self::decode) {
                Some(Ok(doc)) => docs.push((id, doc)),
                Some(Err(e)) => warn!(collection, id = %id, error = %e, "Skipping unreadable document"),
                None => debug!(collection, id = %id, "Index entry without document"),
            }
        }

        Ok(filter.apply(docs))
    }

    async fn set(&self, collection: &str, id: &str, doc: Document) -> Result<(), Error> {
        let mut conn = self.connection.clone();
        let raw = serde_json::to_string(&doc)?;

        redis::pipe()
            .atomic()
            .set(self.doc_key(collection, id), raw)
            .ignore()
            .sadd(self.index_key(collection), id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, fields: Document) -> Result<(), Error> {
        self.transaction(collection, id, &|current| match current {
            Some(doc) => {
                let mut merged = doc.clone();
                merged.extend(fields.clone());
                Ok(Some(merged))
            }
            None => Err(anyhow!("Document {}/{} not found", collection, id)),
        })
        .await?;

        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), Error> {
        let mut conn = self.connection.clone();

        redis::pipe()
            .atomic()
            .del(self.doc_key(collection, id))
            .ignore()
            .srem(self.index_key(collection), id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }

    /// Runs the batch as one MULTI/EXEC. Updates read their targets first, so
    /// they are merged against the state at read time.
    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), Error> {
        check_batch_size(&ops)?;

        let mut pipe = redis::pipe();
        pipe.atomic();

        for op in ops {
            match op {
                WriteOp::Set { collection, id, doc } => {
                    pipe.set(self.doc_key(&collection, &id), serde_json::to_string(&doc)?)
                        .ignore()
                        .sadd(self.index_key(&collection), &id)
                        .ignore();
                }
                WriteOp::Update {
                    collection,
                    id,
                    fields,
                } => {
                    let mut doc = self
                        .get(&collection, &id)
                        .await?
                        .ok_or_else(|| anyhow!("Document {}/{} not found", collection, id))?;
                    doc.extend(fields);
                    pipe.set(self.doc_key(&collection, &id), serde_json::to_string(&doc)?)
                        .ignore();
                }
                WriteOp::Delete { collection, id } => {
                    pipe.del(self.doc_key(&collection, &id))
                        .ignore()
                        .srem(self.index_key(&collection), &id)
                        .ignore();
                }
            }
        }

        let mut conn = self.connection.clone();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn transaction(
        &self,
        collection: &str,
        id: &str,
        apply: TxApply<'_>,
    ) -> Result<TxOutcome, Error> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let mut conn = self.connection.clone();
            let raw: Option<String> = conn.get(self.doc_key(collection, id)).await?;
            let previous = raw.as_deref().map(Self::decode).transpose()?;

            let Some(next) = apply(previous.as_ref())? else {
                return Ok(TxOutcome {
                    previous,
                    written: None,
                });
            };

            let encoded = serde_json::to_string(&next)?;
            if self
                .compare_and_set(collection, id, raw.as_deref(), &encoded)
                .await?
            {
                return Ok(TxOutcome {
                    previous,
                    written: Some(next),
                });
            }

            debug!(collection, id, attempt, "Transaction conflict, retrying");
        }

        Err(anyhow!(
            "Transaction on {}/{} did not commit after {} attempts",
            collection,
            id,
            MAX_CAS_ATTEMPTS
        ))
    }

    async fn ping(&self) -> Result<(), Error> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
