use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

/// A JSON object stored under `(collection, id)`.
pub type Document = Map<String, Value>;

/// Most operations a single `batch_write` accepts.
pub const MAX_BATCH_OPS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

/// Conjunction of conditions on top-level fields, plus ordering and a limit.
///
/// A document missing a filtered field never matches.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub conditions: Vec<Condition>,
    pub order_by: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, FilterOp::Eq, value)
    }

    pub fn lt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, FilterOp::Lt, value)
    }

    pub fn le(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, FilterOp::Le, value)
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions.iter().all(|condition| {
            let Some(actual) = doc.get(&condition.field) else {
                return false;
            };

            let ordering = compare_values(actual, &condition.value);
            match condition.op {
                FilterOp::Eq => ordering == Some(Ordering::Equal),
                FilterOp::Ne => ordering != Some(Ordering::Equal),
                FilterOp::Lt => ordering == Some(Ordering::Less),
                FilterOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
                FilterOp::Gt => ordering == Some(Ordering::Greater),
                FilterOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
            }
        })
    }

    /// Filters, orders and truncates `docs`. Shared by every store implementation.
    pub fn apply(&self, docs: impl IntoIterator<Item = (String, Document)>) -> Vec<(String, Document)> {
        let mut matched: Vec<(String, Document)> =
            docs.into_iter().filter(|(_, doc)| self.matches(doc)).collect();

        if let Some((field, direction)) = &self.order_by {
            matched.sort_by(|(_, a), (_, b)| {
                let ordering = match (a.get(field), b.get(field)) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                match direction {
                    Direction::Ascending => ordering,
                    Direction::Descending => ordering.reverse(),
                }
            });
        }

        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }

        matched
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ if a == b => Some(Ordering::Equal),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set {
        collection: String,
        id: String,
        doc: Document,
    },
    /// Merges `fields` into an existing document.
    Update {
        collection: String,
        id: String,
        fields: Document,
    },
    Delete {
        collection: String,
        id: String,
    },
}

impl WriteOp {
    pub fn delete(collection: &str, id: impl Into<String>) -> Self {
        WriteOp::Delete {
            collection: collection.to_string(),
            id: id.into(),
        }
    }
}

/// Result of a read-modify-write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxOutcome {
    pub previous: Option<Document>,
    /// `None` when the update function declined to write.
    pub written: Option<Document>,
}

/// Computes the new document from the current one; `None` leaves it untouched.
pub type TxApply<'a> = &'a (dyn Fn(Option<&Document>) -> Result<Option<Document>> + Send + Sync);

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, Error>;

    async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<(String, Document)>, Error>;

    async fn set(&self, collection: &str, id: &str, doc: Document) -> Result<(), Error>;

    /// Fails when the document does not exist.
    async fn update(&self, collection: &str, id: &str, fields: Document) -> Result<(), Error>;

    async fn delete(&self, collection: &str, id: &str) -> Result<(), Error>;

    /// Applies up to [`MAX_BATCH_OPS`] writes together.
    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), Error>;

    /// Atomic read-modify-write of one document.
    ///
    /// `apply` may run more than once when a concurrent writer wins the race.
    async fn transaction(
        &self,
        collection: &str,
        id: &str,
        apply: TxApply<'_>,
    ) -> Result<TxOutcome, Error>;

    async fn ping(&self) -> Result<(), Error>;
}

/// Writes `ops` in batches no larger than [`MAX_BATCH_OPS`]. Returns the op count.
pub async fn commit_in_chunks(store: &dyn DocumentStore, ops: Vec<WriteOp>) -> Result<usize, Error> {
    let total = ops.len();
    let mut ops = ops.into_iter().peekable();

    while ops.peek().is_some() {
        let chunk: Vec<WriteOp> = ops.by_ref().take(MAX_BATCH_OPS).collect();
        store.batch_write(chunk).await?;
    }

    Ok(total)
}

pub fn to_document<T: Serialize>(value: &T) -> Result<Document, Error> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("Expected a JSON object, got {}", other)),
    }
}

pub fn from_document<T: DeserializeOwned>(doc: Document) -> Result<T, Error> {
    Ok(serde_json::from_value(Value::Object(doc))?)
}

pub(crate) fn check_batch_size(ops: &[WriteOp]) -> Result<(), Error> {
    if ops.len() > MAX_BATCH_OPS {
        return Err(anyhow!(
            "Batch of {} operations exceeds the limit of {}",
            ops.len(),
            MAX_BATCH_OPS
        ));
    }
    Ok(())
}

type Collections = HashMap<String, BTreeMap<String, Document>>;

/// Process-local store for tests and single-instance deployments.
#[derive(Default)]
pub struct InMemoryStore {
    collections: Mutex<Collections>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    fn apply_op(collections: &mut Collections, op: WriteOp) {
        match op {
            WriteOp::Set { collection, id, doc } => {
                collections.entry(collection).or_default().insert(id, doc);
            }
            WriteOp::Update {
                collection,
                id,
                fields,
            } => {
                if let Some(doc) = collections.get_mut(&collection).and_then(|c| c.get_mut(&id)) {
                    doc.extend(fields);
                }
            }
            WriteOp::Delete { collection, id } => {
                if let Some(docs) = collections.get_mut(&collection) {
                    docs.remove(&id);
                }
            }
        }
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, Error> {
        Ok(self
            .collections
            .lock()
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<(String, Document)>, Error> {
        let snapshot: Vec<(String, Document)> = self
            .collections
            .lock()
            .get(collection)
            .map(|docs| docs.iter().map(|(id, doc)| (id.clone(), doc.clone())).collect())
            .unwrap_or_default();

        Ok(filter.apply(snapshot))
    }

    async fn set(&self, collection: &str, id: &str, doc: Document) -> Result<(), Error> {
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, fields: Document) -> Result<(), Error> {
        let mut collections = self.collections.lock();
        let doc = collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| anyhow!("Document {}/{} not found", collection, id))?;
        doc.extend(fields);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), Error> {
        if let Some(docs) = self.collections.lock().get_mut(collection) {
            docs.remove(id);
        }
        Ok(())
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), Error> {
        check_batch_size(&ops)?;

        let mut collections = self.collections.lock();

        // Validate before touching anything so a failed batch leaves no partial writes.
        for op in &ops {
            if let WriteOp::Update { collection, id, .. } = op {
                let exists = collections
                    .get(collection)
                    .is_some_and(|docs| docs.contains_key(id));
                if !exists {
                    return Err(anyhow!("Document {}/{} not found", collection, id));
                }
            }
        }

        for op in ops {
            Self::apply_op(&mut collections, op);
        }

        Ok(())
    }

    async fn transaction(
        &self,
        collection: &str,
        id: &str,
        apply: TxApply<'_>,
    ) -> Result<TxOutcome, Error> {
        let mut collections = self.collections.lock();
        let docs = collections.entry(collection.to_string()).or_default();

        let previous = docs.get(id).cloned();
        let written = apply(previous.as_ref())?;

        if let Some(doc) = &written {
            docs.insert(id.to_string(), doc.clone());
        }

        Ok(TxOutcome { previous, written })
    }

    async fn ping(&self) -> Result<(), Error> {
        Ok(())
    }
}
