use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tokio::time::timeout;

#[derive(Error, Debug)]
pub enum CustomDatabaseError {
    #[error("Pg error: {0}")]
    Other(#[from] sqlx::Error),

    #[error("Timeout error")]
    Timeout(#[from] tokio::time::error::Elapsed),
}

impl CustomDatabaseError {
    /// True when the failure is about reaching the database, not about the query.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            CustomDatabaseError::Timeout(_)
                | CustomDatabaseError::Other(sqlx::Error::PoolTimedOut)
                | CustomDatabaseError::Other(sqlx::Error::PoolClosed)
                | CustomDatabaseError::Other(sqlx::Error::Io(_))
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Users,
    Customers,
    Events,
}

impl Collection {
    pub fn table(&self) -> &'static str {
        match self {
            Collection::Users => "tracker_users",
            Collection::Customers => "tracker_customers",
            Collection::Events => "tracker_events",
        }
    }
}

/// Document filter with jsonb containment semantics.
///
/// A document matches when it contains every entry of `all_of` and, if any
/// alternatives were given, at least one of them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    all_of: Map<String, Value>,
    any_of: Vec<Value>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.all_of.insert(key.to_string(), value.into());
        self
    }

    pub fn any_of(mut self, alternatives: Vec<Value>) -> Self {
        self.any_of = alternatives;
        self
    }

    pub fn required(&self) -> Value {
        Value::Object(self.all_of.clone())
    }

    pub fn alternatives(&self) -> &[Value] {
        &self.any_of
    }

    pub fn matches(&self, document: &Value) -> bool {
        contains(document, &self.required())
            && (self.any_of.is_empty() || self.any_of.iter().any(|alt| contains(document, alt)))
    }
}

/// Same rules as postgres `@>`: objects match key by key, every element of an
/// array pattern must be contained by some element of the document array.
pub fn contains(document: &Value, pattern: &Value) -> bool {
    match (document, pattern) {
        (Value::Object(doc), Value::Object(pat)) => pat
            .iter()
            .all(|(key, value)| doc.get(key).is_some_and(|d| contains(d, value))),
        (Value::Array(doc), Value::Array(pat)) => {
            pat.iter().all(|p| doc.iter().any(|d| contains(d, p)))
        }
        (doc, pat) => doc == pat,
    }
}

/// A stored document together with the id of the row holding it.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: i64,
    pub body: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertResult {
    pub inserted: Vec<Document>,
}

/// A document store scoped per collection.
/// Every call stands on its own: no transactions or cursors are held across calls.
#[async_trait]
pub trait Client {
    /// The oldest matching document.
    async fn find_one(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<Document>, CustomDatabaseError>;

    async fn count(&self, collection: Collection, filter: &Filter)
        -> Result<u64, CustomDatabaseError>;

    async fn insert(
        &self,
        collection: Collection,
        document: Value,
    ) -> Result<InsertResult, CustomDatabaseError>;

    /// Replaces the document stored under `id`, returning how many were replaced.
    async fn replace(
        &self,
        collection: Collection,
        id: i64,
        document: Value,
    ) -> Result<u64, CustomDatabaseError>;
}

pub struct PgClient {
    pool: PgPool,
    timeout: Duration,
}

impl PgClient {
    pub async fn new(
        url: &str,
        max_connections: u32,
        timeout_ms: u64,
    ) -> Result<PgClient, CustomDatabaseError> {
        let timeout = Duration::from_millis(timeout_ms);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(timeout)
            .connect(url)
            .await?;

        Ok(PgClient { pool, timeout })
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
    qb.push(" WHERE doc @> ");
    qb.push_bind(Json(filter.required()));

    if !filter.alternatives().is_empty() {
        qb.push(" AND (");
        let mut separated = qb.separated(" OR ");
        for alternative in filter.alternatives() {
            separated.push("doc @> ");
            separated.push_bind_unseparated(Json(alternative.clone()));
        }
        separated.push_unseparated(")");
    }
}

#[async_trait]
impl Client for PgClient {
    async fn find_one(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<Document>, CustomDatabaseError> {
        let mut conn = self.pool.acquire().await?;

        let mut qb = QueryBuilder::<Postgres>::new("SELECT id, doc FROM ");
        qb.push(collection.table());
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY id LIMIT 1");

        let query = qb
            .build_query_as::<(i64, Json<Value>)>()
            .fetch_optional(&mut *conn);
        let row = timeout(self.timeout, query).await??;

        Ok(row.map(|(id, Json(body))| Document { id, body }))
    }

    async fn count(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<u64, CustomDatabaseError> {
        let mut conn = self.pool.acquire().await?;

        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM ");
        qb.push(collection.table());
        push_filter(&mut qb, filter);

        let query = qb.build_query_as::<(i64,)>().fetch_one(&mut *conn);
        let (count,) = timeout(self.timeout, query).await??;

        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn insert(
        &self,
        collection: Collection,
        document: Value,
    ) -> Result<InsertResult, CustomDatabaseError> {
        let mut conn = self.pool.acquire().await?;

        let statement = format!(
            "INSERT INTO {} (doc) VALUES ($1) RETURNING id, doc",
            collection.table()
        );
        let query = sqlx::query_as::<_, (i64, Json<Value>)>(&statement)
            .bind(Json(document))
            .fetch_all(&mut *conn);
        let rows = timeout(self.timeout, query).await??;

        Ok(InsertResult {
            inserted: rows
                .into_iter()
                .map(|(id, Json(body))| Document { id, body })
                .collect(),
        })
    }

    async fn replace(
        &self,
        collection: Collection,
        id: i64,
        document: Value,
    ) -> Result<u64, CustomDatabaseError> {
        let mut conn = self.pool.acquire().await?;

        let statement = format!("UPDATE {} SET doc = $1 WHERE id = $2", collection.table());
        let query = sqlx::query(&statement)
            .bind(Json(document))
            .bind(id)
            .execute(&mut *conn);
        let result = timeout(self.timeout, query).await??;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn objects_match_on_subset_of_keys() {
        let doc = json!({"customerCode": "acme", "hostname": "acme.io", "uid": "abc"});

        assert!(contains(&doc, &json!({"customerCode": "acme"})));
        assert!(contains(&doc, &json!({})));
        assert!(!contains(&doc, &json!({"customerCode": "other"})));
        assert!(!contains(&doc, &json!({"cookie": "abc"})));
    }

    #[test]
    fn array_patterns_match_any_element() {
        let doc = json!({"features": [
            {"name": "card-1", "version": "A"},
            {"name": "card-2", "version": "B"},
        ]});

        assert!(contains(
            &doc,
            &json!({"features": [{"name": "card-2", "version": "B"}]})
        ));
        assert!(!contains(
            &doc,
            &json!({"features": [{"name": "card-2", "version": "A"}]})
        ));
    }

    #[test]
    fn filter_requires_one_alternative_when_given() {
        let filter = Filter::new()
            .eq("customerCode", "acme")
            .any_of(vec![json!({"uid": "u1"}), json!({"cookie": "c1"})]);

        assert!(filter.matches(&json!({"customerCode": "acme", "cookie": "c1"})));
        assert!(filter.matches(&json!({"customerCode": "acme", "uid": "u1"})));
        assert!(!filter.matches(&json!({"customerCode": "acme", "uid": "u2"})));
        assert!(!filter.matches(&json!({"customerCode": "other", "uid": "u1"})));
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(Filter::new().matches(&json!({"anything": true})));
    }
}
