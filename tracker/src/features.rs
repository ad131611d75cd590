use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::api::TrackerError;
use crate::store::{Customer, User};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Version {
    pub version: String,
    #[serde(default)]
    pub percent: f64,
    /// Users currently on this variant. Filled in per request, never persisted.
    #[serde(skip)]
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Feature {
    pub name: String,
    pub versions: Vec<Version>,
}

/// The variant a user is on for one feature.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Assignment {
    pub name: String,
    pub version: String,
}

/// Parses a raw feature list, rejecting anything that is not an array of
/// `{name, versions}` objects with at least one labelled version each.
pub fn parse_features(value: &Value) -> Result<Vec<Feature>, TrackerError> {
    if !value.is_array() {
        return Err(TrackerError::InvalidArgument(
            "features must be an array".to_string(),
        ));
    }

    let features: Vec<Feature> = serde_json::from_value(value.clone()).map_err(|e| {
        tracing::warn!("rejected malformed feature list: {}", e);
        TrackerError::invalid_argument("features")
    })?;

    validate_features(&features)?;
    Ok(features)
}

pub fn validate_features(features: &[Feature]) -> Result<(), TrackerError> {
    for feature in features {
        if feature.name.is_empty() {
            return Err(TrackerError::invalid_argument("feature name"));
        }
        if feature.versions.is_empty() {
            return Err(TrackerError::InvalidArgument(format!(
                "feature {} has no versions",
                feature.name
            )));
        }
        if feature.versions.iter().any(|v| v.version.is_empty()) {
            return Err(TrackerError::InvalidArgument(format!(
                "feature {} has an unlabelled version",
                feature.name
            )));
        }
    }
    Ok(())
}

/// Orders every feature's versions from least to most used. Ties keep their
/// configured order.
#[instrument(skip_all, fields(features = features.len()))]
pub fn sort_feature_by_count(features: &mut [Feature]) -> Result<(), TrackerError> {
    validate_features(features)?;

    for feature in features.iter_mut() {
        feature.versions.sort_by_key(|v| v.count);
    }
    Ok(())
}

/// One assignment per feature, on its first version.
pub fn initial_assignments(features: &[Feature]) -> Vec<Assignment> {
    features
        .iter()
        .filter_map(|feature| {
            feature.versions.first().map(|version| Assignment {
                name: feature.name.clone(),
                version: version.version.clone(),
            })
        })
        .collect()
}

/// Reconciles a user's assignments with what the customer currently offers.
///
/// Existing assignments survive while their feature and version still exist.
/// Anything else falls back to the feature's first version, which after
/// [`sort_feature_by_count`] is the least used one. Features the customer no
/// longer offers are dropped.
pub fn sync_feature_list(user: &User, customer: &Customer) -> Vec<Assignment> {
    customer
        .features
        .iter()
        .filter_map(|feature| {
            let kept = user.features.iter().find(|assigned| {
                assigned.name == feature.name
                    && feature
                        .versions
                        .iter()
                        .any(|v| v.version == assigned.version)
            });

            match kept {
                Some(assigned) => Some(assigned.clone()),
                None => feature.versions.first().map(|version| Assignment {
                    name: feature.name.clone(),
                    version: version.version.clone(),
                }),
            }
        })
        .collect()
}
