use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use time::OffsetDateTime;
use tracing::instrument;

use crate::api::TrackerError;
use crate::database::{Client, Collection, Document, Filter};
use crate::event::EventKind;
use crate::features::{initial_assignments, parse_features, validate_features, Assignment, Feature};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Row the record was read from. Not part of the stored document.
    #[serde(skip)]
    pub id: Option<i64>,
    /// Hashed external id, never the raw one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
    pub customer_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub features: Vec<Assignment>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub customer_code: String,
    pub hostname: String,
    pub features: Vec<Feature>,
}

impl Customer {
    /// Builds a customer from its stored document. The feature list goes
    /// through [`parse_features`], so a malformed one is an invalid argument.
    pub fn from_document(document: &Value) -> Result<Customer, TrackerError> {
        let field = |name: &str| {
            document
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| {
                    tracing::error!("customer record without {}", name);
                    TrackerError::DataParsingError
                })
        };

        Ok(Customer {
            customer_code: field("customerCode")?,
            hostname: field("hostname")?,
            features: parse_features(document.get("features").unwrap_or(&Value::Null))?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
    pub kind: EventKind,
    pub data: Map<String, Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn require<'a>(name: &str, value: Option<&'a str>) -> Result<&'a str, TrackerError> {
    present(value).ok_or_else(|| TrackerError::invalid_argument(name))
}

fn identity_filter(
    uid: Option<&str>,
    cookie: Option<&str>,
    customer_code: &str,
    hostname: &str,
) -> Result<Filter, TrackerError> {
    let mut alternatives = Vec::new();
    if let Some(uid) = uid {
        alternatives.push(json!({ "uid": uid }));
    }
    if let Some(cookie) = cookie {
        alternatives.push(json!({ "cookie": cookie }));
    }
    if alternatives.is_empty() {
        return Err(TrackerError::InvalidArgument(
            "uid or cookie is required".to_string(),
        ));
    }

    Ok(Filter::new()
        .eq("customerCode", customer_code)
        .eq("hostname", hostname)
        .any_of(alternatives))
}

fn parse_user(document: Document) -> Result<User, TrackerError> {
    let mut user: User = serde_json::from_value(document.body).map_err(|e| {
        tracing::error!("failed to parse user record: {}", e);
        TrackerError::DataParsingError
    })?;
    user.id = Some(document.id);
    Ok(user)
}

fn to_document<T: Serialize>(record: &T) -> Result<Value, TrackerError> {
    serde_json::to_value(record).map_err(|e| {
        tracing::error!("failed to encode record: {}", e);
        TrackerError::DataParsingError
    })
}

/// Validated reads and writes over the user, customer and event collections.
/// Every operation checks its arguments before the first storage call.
#[derive(Clone)]
pub struct Store {
    client: Arc<dyn Client + Send + Sync>,
}

impl Store {
    pub fn new(client: Arc<dyn Client + Send + Sync>) -> Self {
        Store { client }
    }

    #[instrument(skip_all)]
    pub async fn get_user(
        &self,
        uid: Option<&str>,
        cookie: Option<&str>,
        customer_code: Option<&str>,
        hostname: Option<&str>,
    ) -> Result<Option<User>, TrackerError> {
        let customer_code = require("customerCode", customer_code)?;
        let hostname = require("hostname", hostname)?;
        let filter = identity_filter(present(uid), present(cookie), customer_code, hostname)?;

        let document = self.client.find_one(Collection::Users, &filter).await?;
        document.map(parse_user).transpose()
    }

    #[instrument(skip_all)]
    pub async fn get_customer(
        &self,
        customer_code: Option<&str>,
        hostname: Option<&str>,
    ) -> Result<Option<Customer>, TrackerError> {
        let customer_code = require("customerCode", customer_code)?;
        let hostname = require("hostname", hostname)?;
        let filter = Filter::new()
            .eq("customerCode", customer_code)
            .eq("hostname", hostname);

        let document = self.client.find_one(Collection::Customers, &filter).await?;
        document
            .map(|document| Customer::from_document(&document.body))
            .transpose()
    }

    /// Attaches to every version the number of users of this customer and
    /// host currently assigned to it.
    #[instrument(skip_all, fields(features = features.len()))]
    pub async fn get_feature_unique_count(
        &self,
        customer_code: Option<&str>,
        hostname: Option<&str>,
        features: &mut [Feature],
    ) -> Result<(), TrackerError> {
        let customer_code = require("customerCode", customer_code)?;
        let hostname = require("hostname", hostname)?;
        validate_features(features)?;

        for feature in features.iter_mut() {
            let name = feature.name.clone();
            for version in feature.versions.iter_mut() {
                let filter = Filter::new()
                    .eq("customerCode", customer_code)
                    .eq("hostname", hostname)
                    .eq(
                        "features",
                        json!([{ "name": name, "version": version.version }]),
                    );
                version.count = self.client.count(Collection::Users, &filter).await?;
            }
        }
        Ok(())
    }

    /// Inserts a user on the first version of every feature. Returns `None`
    /// when the store reports that nothing was created.
    #[instrument(skip_all)]
    pub async fn insert_new_user(
        &self,
        uid: Option<&str>,
        cookie: Option<&str>,
        customer_code: Option<&str>,
        hostname: Option<&str>,
        features: &[Feature],
    ) -> Result<Option<User>, TrackerError> {
        let customer_code = require("customerCode", customer_code)?;
        validate_features(features)?;

        let user = User {
            id: None,
            uid: present(uid).map(str::to_owned),
            cookie: present(cookie).map(str::to_owned),
            customer_code: customer_code.to_string(),
            hostname: present(hostname).map(str::to_owned),
            features: initial_assignments(features),
        };

        let result = self
            .client
            .insert(Collection::Users, to_document(&user)?)
            .await?;

        match result.inserted.into_iter().next() {
            Some(document) => Ok(Some(parse_user(document)?)),
            None => {
                tracing::warn!("insert reported no created user");
                Ok(None)
            }
        }
    }

    /// Persists a user's reconciled feature list into the record it was read
    /// from, so only users returned by the store can be updated.
    #[instrument(skip_all, fields(id = user.id))]
    pub async fn update_user_features(&self, user: &User) -> Result<(), TrackerError> {
        require("customerCode", Some(user.customer_code.as_str()))?;
        let id = user.id.ok_or_else(|| TrackerError::invalid_argument("user id"))?;

        let updated = self
            .client
            .replace(Collection::Users, id, to_document(user)?)
            .await?;
        if updated == 0 {
            tracing::warn!("no user record matched the feature update");
        }
        Ok(())
    }

    #[instrument(skip_all, fields(kind = ?kind))]
    pub async fn save_event(
        &self,
        ic: Option<&str>,
        cookie: Option<&str>,
        data: Map<String, Value>,
        kind: EventKind,
        received_at: OffsetDateTime,
    ) -> Result<(), TrackerError> {
        let record = EventRecord {
            ic: present(ic).map(str::to_owned),
            cookie: present(cookie).map(str::to_owned),
            kind,
            data,
            received_at,
        };

        self.client
            .insert(Collection::Events, to_document(&record)?)
            .await?;
        Ok(())
    }
}
