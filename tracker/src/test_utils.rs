use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use serde_json::{json, Value};

use crate::database::{Client, Collection, CustomDatabaseError, Document, Filter, InsertResult};
use crate::features::{Feature, Version};

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

/// A feature whose versions carry the given counts, in the given order.
pub fn versioned_feature(name: &str, versions: &[(&str, u64)]) -> Feature {
    Feature {
        name: name.to_string(),
        versions: versions
            .iter()
            .map(|(label, count)| Version {
                version: label.to_string(),
                percent: 0.0,
                count: *count,
            })
            .collect(),
    }
}

pub fn customer_document(customer_code: &str, hostname: &str, features: Value) -> Value {
    json!({
        "customerCode": customer_code,
        "hostname": hostname,
        "features": features,
    })
}

pub fn user_document(
    uid: Option<&str>,
    cookie: Option<&str>,
    customer_code: &str,
    hostname: &str,
    features: &[(&str, &str)],
) -> Value {
    let mut document = json!({
        "customerCode": customer_code,
        "hostname": hostname,
        "features": features
            .iter()
            .map(|(name, version)| json!({"name": name, "version": version}))
            .collect::<Vec<Value>>(),
    });
    if let Some(uid) = uid {
        document["uid"] = json!(uid);
    }
    if let Some(cookie) = cookie {
        document["cookie"] = json!(cookie);
    }
    document
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryCall {
    FindOne(Collection),
    Count(Collection),
    Insert(Collection),
    Replace(Collection),
}

/// In-memory document store with the same matching rules as [`crate::database::PgClient`].
#[derive(Clone, Default)]
pub struct MemoryClient {
    documents: Arc<Mutex<HashMap<Collection, Vec<Document>>>>,
    calls: Arc<Mutex<Vec<MemoryCall>>>,
    discard_inserts: bool,
    unavailable: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Ids start at 1 and grow per collection, like a `BIGSERIAL` column.
fn push_document(
    stored: &mut HashMap<Collection, Vec<Document>>,
    collection: Collection,
    body: Value,
) -> Document {
    let docs = stored.entry(collection).or_default();
    let id = docs.last().map_or(1, |doc| doc.id + 1);
    let document = Document { id, body };
    docs.push(document.clone());
    document
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents(self, collection: Collection, documents: Vec<Value>) -> Self {
        {
            let mut stored = lock(&self.documents);
            for body in documents {
                push_document(&mut stored, collection, body);
            }
        }
        self
    }

    /// Inserts succeed but report no created record.
    pub fn discard_inserts(mut self) -> Self {
        self.discard_inserts = true;
        self
    }

    /// Every call fails as if the pool could not hand out a connection.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Stored bodies in insertion order.
    pub fn documents(&self, collection: Collection) -> Vec<Value> {
        lock(&self.documents)
            .get(&collection)
            .map(|docs| docs.iter().map(|doc| doc.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<MemoryCall> {
        lock(&self.calls).clone()
    }

    pub fn mutations(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, MemoryCall::Insert(_) | MemoryCall::Replace(_)))
            .count()
    }

    fn record(&self, call: MemoryCall) -> Result<(), CustomDatabaseError> {
        lock(&self.calls).push(call);
        if self.unavailable {
            return Err(CustomDatabaseError::Other(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl Client for MemoryClient {
    async fn find_one(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<Document>, CustomDatabaseError> {
        self.record(MemoryCall::FindOne(collection))?;

        Ok(lock(&self.documents).get(&collection).and_then(|docs| {
            docs.iter()
                .find(|doc| filter.matches(&doc.body))
                .cloned()
        }))
    }

    async fn count(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<u64, CustomDatabaseError> {
        self.record(MemoryCall::Count(collection))?;

        let matching = lock(&self.documents).get(&collection).map_or(0, |docs| {
            docs.iter()
                .filter(|doc| filter.matches(&doc.body))
                .count()
        });
        Ok(u64::try_from(matching).unwrap_or(u64::MAX))
    }

    async fn insert(
        &self,
        collection: Collection,
        document: Value,
    ) -> Result<InsertResult, CustomDatabaseError> {
        self.record(MemoryCall::Insert(collection))?;

        if self.discard_inserts {
            return Ok(InsertResult::default());
        }

        let created = push_document(&mut lock(&self.documents), collection, document);
        Ok(InsertResult {
            inserted: vec![created],
        })
    }

    async fn replace(
        &self,
        collection: Collection,
        id: i64,
        document: Value,
    ) -> Result<u64, CustomDatabaseError> {
        self.record(MemoryCall::Replace(collection))?;

        let mut documents = lock(&self.documents);
        let target = documents
            .get_mut(&collection)
            .and_then(|docs| docs.iter_mut().find(|doc| doc.id == id));

        match target {
            Some(existing) => {
                existing.body = document;
                Ok(1)
            }
            None => Ok(0),
        }
    }
}
