use std::num::NonZeroU32;

use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use bytes::Bytes;
use metrics::counter;
use serde::Deserialize;
use tracing::instrument;
use uuid::Uuid;

use crate::api::{InitResponse, TrackerError};
use crate::auth::{authorized, hash_authorized};
use crate::features::{sort_feature_by_count, sync_feature_list};
use crate::router;
use crate::store::{Store, User};
use crate::time::{unix_millis, TimeSource};
use crate::token::TokenGenerator;

/// Name of the device cookie set on every init response.
pub const DEVICE_COOKIE: &str = "tracker_device";

#[derive(Debug, Default, Deserialize)]
pub struct InitRequest {
    #[serde(rename = "customerCode")]
    pub customer_code: Option<String>,
    /// Raw external user id, hashed before it is used anywhere
    pub uid: Option<String>,
    /// User cookie presented by the client library
    pub ic: Option<String>,
    pub hostname: Option<String>,
}

impl InitRequest {
    pub fn from_bytes(bytes: Bytes) -> Result<InitRequest, TrackerError> {
        tracing::debug!(len = bytes.len(), "decoding init request");
        if bytes.is_empty() {
            return Ok(InitRequest::default());
        }
        Ok(serde_json::from_slice::<InitRequest>(&bytes)?)
    }
}

/// Returns the presented token when `validate` accepts it, otherwise mints
/// replacements until one is accepted or `max_retries` replacements have
/// been rejected too. An absent token is minted without counting as a retry.
/// The budget is never zero, so a rejected token always gets one replacement.
fn reuse_or_mint<V, M>(
    presented: Option<&str>,
    max_retries: NonZeroU32,
    validate: V,
    mut mint: M,
) -> Result<String, TrackerError>
where
    V: Fn(&str) -> Result<(), TrackerError>,
    M: FnMut() -> String,
{
    let mut candidate = match presented.filter(|c| !c.is_empty()) {
        Some(cookie) => cookie.to_owned(),
        None => {
            let token = mint();
            tracing::info!("no cookie presented, minted a new one");
            token
        }
    };

    let mut retries = 0;
    loop {
        match validate(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if retries >= max_retries.get() => {
                tracing::warn!(retries, "giving up on cookie: {}", e);
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(retries, "regenerating rejected cookie: {}", e);
                counter!("tracker_cookie_regenerated_total").increment(1);
                retries += 1;
                candidate = mint();
            }
        }
    }
}

/// Device cookie for this request.
pub fn setup_cookie(
    tokens: &TokenGenerator,
    timesource: &(dyn TimeSource + Send + Sync),
    cookie: Option<&str>,
    max_retries: NonZeroU32,
) -> Result<String, TrackerError> {
    reuse_or_mint(
        cookie,
        max_retries,
        |candidate| authorized(tokens, Some(candidate)),
        || tokens.generate_token(unix_millis(timesource.current_time()), Uuid::now_v7()),
    )
}

/// User cookie for `hashed_user_id`. A valid cookie minted for a different
/// user is treated like an invalid one.
pub fn setup_user_cookie(
    tokens: &TokenGenerator,
    hashed_user_id: &str,
    cookie: Option<&str>,
    max_retries: NonZeroU32,
) -> Result<String, TrackerError> {
    reuse_or_mint(
        cookie,
        max_retries,
        |candidate| {
            let owner = hash_authorized(tokens, Some(candidate))?;
            if owner != hashed_user_id {
                return Err(TrackerError::Unauthorized(
                    "user cookie belongs to another user".to_string(),
                ));
            }
            Ok(())
        },
        || tokens.generate_hash_token(hashed_user_id),
    )
}

/// Finds or creates the user and brings its feature assignments in line with
/// what the customer currently offers.
#[instrument(skip_all)]
pub async fn handle_user_on_init(
    store: &Store,
    uid: Option<&str>,
    cookie: Option<&str>,
    customer_code: Option<&str>,
    hostname: Option<&str>,
) -> Result<Option<User>, TrackerError> {
    let user = store.get_user(uid, cookie, customer_code, hostname).await?;

    let mut customer = store
        .get_customer(customer_code, hostname)
        .await?
        .ok_or_else(|| TrackerError::Unauthorized("unknown customer".to_string()))?;

    store
        .get_feature_unique_count(customer_code, hostname, &mut customer.features)
        .await?;
    sort_feature_by_count(&mut customer.features)?;

    match user {
        None => {
            tracing::info!("user not found, inserting");
            let created = store
                .insert_new_user(uid, cookie, customer_code, hostname, &customer.features)
                .await?;
            if created.is_some() {
                counter!("tracker_users_created_total").increment(1);
            }
            Ok(created)
        }
        Some(mut user) => {
            tracing::info!("user found, syncing features");
            let features = sync_feature_list(&user, &customer);
            if features != user.features {
                user.features = features;
                store.update_user_features(&user).await?;
            }
            Ok(Some(user))
        }
    }
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

fn request_hostname(request: &InitRequest, headers: &HeaderMap) -> Option<String> {
    request
        .hostname
        .clone()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(|host| strip_port(host).to_string())
        })
}

#[instrument(
    skip_all,
    fields(customer_code, hostname, has_uid, has_cookie)
)]
pub async fn init(
    state: State<router::State>,
    jar: CookieJar,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(CookieJar, Json<InitResponse>), TrackerError> {
    let request = InitRequest::from_bytes(body)?;
    let hostname = request_hostname(&request, &headers);
    let presented = jar.get(DEVICE_COOKIE).map(|c| c.value().to_owned());

    let span = tracing::Span::current();
    span.record("customer_code", request.customer_code.as_deref());
    span.record("hostname", hostname.as_deref());
    span.record("has_uid", request.uid.is_some());
    span.record("has_cookie", presented.is_some());

    counter!("tracker_init_total").increment(1);

    let cookie = setup_cookie(
        &state.tokens,
        state.timesource.as_ref(),
        presented.as_deref(),
        state.max_cookie_retries,
    )?;

    let hashed_uid = request
        .uid
        .as_deref()
        .filter(|uid| !uid.is_empty())
        .map(|uid| state.tokens.hash_user_id(uid));
    let user_cookie = hashed_uid
        .as_deref()
        .map(|hashed| {
            setup_user_cookie(
                &state.tokens,
                hashed,
                request.ic.as_deref(),
                state.max_cookie_retries,
            )
        })
        .transpose()?;

    let user = handle_user_on_init(
        &state.store,
        hashed_uid.as_deref(),
        Some(&cookie),
        request.customer_code.as_deref(),
        hostname.as_deref(),
    )
    .await?;

    let features = match user {
        Some(user) => user.features,
        None => {
            tracing::warn!("no user record after init, responding without features");
            Vec::new()
        }
    };

    let jar = jar.add(
        Cookie::build((DEVICE_COOKIE, cookie.clone()))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax),
    );

    Ok((
        jar,
        Json(InitResponse {
            cookie,
            user_cookie,
            features,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use time::macros::datetime;
    use time::OffsetDateTime;

    use super::*;
    use crate::database::Collection;
    use crate::features::Assignment;
    use crate::test_utils::{customer_document, user_document, MemoryClient};
    use crate::token::TokenKind;

    struct FixedTime {
        time: OffsetDateTime,
    }

    impl TimeSource for FixedTime {
        fn current_time(&self) -> OffsetDateTime {
            self.time
        }
    }

    fn fixed_time() -> FixedTime {
        FixedTime {
            time: datetime!(2024-03-01 12:00 UTC),
        }
    }

    fn budget(retries: u32) -> NonZeroU32 {
        NonZeroU32::new(retries).unwrap()
    }

    fn tokens() -> TokenGenerator {
        TokenGenerator::new("init-secret").unwrap()
    }

    fn two_card_customer() -> serde_json::Value {
        customer_document(
            "code",
            "host",
            json!([
                {"name": "card-1", "versions": [{"version": "A"}, {"version": "B"}]},
                {"name": "card-2", "versions": [{"version": "A"}, {"version": "B"}]},
            ]),
        )
    }

    fn assignment(name: &str, version: &str) -> Assignment {
        Assignment {
            name: name.to_string(),
            version: version.to_string(),
        }
    }

    #[test]
    fn missing_cookie_is_minted() {
        let tokens = tokens();
        let first = setup_cookie(&tokens, &fixed_time(), None, budget(1)).unwrap();
        let second = setup_cookie(&tokens, &fixed_time(), Some(""), budget(1)).unwrap();

        assert_ne!(first, second);
        assert!(tokens.verify(&first, TokenKind::Device).is_ok());
        assert!(tokens.verify(&second, TokenKind::Device).is_ok());
    }

    #[test]
    fn valid_cookie_is_reused() {
        let tokens = tokens();
        let existing = tokens.generate_token(1, Uuid::new_v4());

        let cookie = setup_cookie(&tokens, &fixed_time(), Some(&existing), budget(1)).unwrap();
        assert_eq!(cookie, existing);
    }

    #[test]
    fn invalid_cookie_is_regenerated() {
        let tokens = tokens();

        let cookie =
            setup_cookie(&tokens, &fixed_time(), Some("d.forged.cookie"), budget(1)).unwrap();
        assert_ne!(cookie, "d.forged.cookie");
        assert!(tokens.verify(&cookie, TokenKind::Device).is_ok());
    }

    #[test]
    fn rejected_replacements_surface_unauthorized() {
        let result = reuse_or_mint(
            Some("bad"),
            budget(1),
            |candidate| match candidate {
                "good" => Ok(()),
                _ => Err(TrackerError::Unauthorized("rejected".to_string())),
            },
            || "also bad".to_string(),
        );

        match result {
            Err(TrackerError::Unauthorized(_)) => (),
            other => panic!("expected Unauthorized, got {other:?}"),
        }
    }

    #[test]
    fn retries_are_bounded() {
        let mut minted = 0;
        let result = reuse_or_mint(
            Some("bad"),
            budget(3),
            |_| Err(TrackerError::Unauthorized("never valid".to_string())),
            || {
                minted += 1;
                "still bad".to_string()
            },
        );

        assert!(matches!(result, Err(TrackerError::Unauthorized(_))));
        assert_eq!(minted, 3);
    }

    #[test]
    fn user_cookie_must_belong_to_the_user() {
        let tokens = tokens();
        let alice = tokens.hash_user_id("alice");
        let bob = tokens.hash_user_id("bob");
        let alice_cookie = tokens.generate_hash_token(&alice);

        let reused =
            setup_user_cookie(&tokens, &alice, Some(&alice_cookie), budget(1)).unwrap();
        assert_eq!(reused, alice_cookie);

        let replaced =
            setup_user_cookie(&tokens, &bob, Some(&alice_cookie), budget(1)).unwrap();
        assert_eq!(tokens.verify(&replaced, TokenKind::User).unwrap(), bob);

        let minted = setup_user_cookie(&tokens, &bob, None, budget(1)).unwrap();
        assert_eq!(minted, replaced);
    }

    #[test]
    fn host_header_port_is_stripped() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:3000"), "[::1]");
    }

    #[tokio::test]
    async fn new_user_is_inserted_on_least_used_versions() {
        let client = MemoryClient::new()
            .with_documents(Collection::Customers, vec![two_card_customer()])
            .with_documents(
                Collection::Users,
                vec![user_document(
                    None,
                    Some("someone-else"),
                    "code",
                    "host",
                    &[("card-1", "A")],
                )],
            );
        let store = Store::new(Arc::new(client.clone()));

        let user = handle_user_on_init(&store, None, Some("cookie"), Some("code"), Some("host"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(user.cookie.as_deref(), Some("cookie"));
        assert_eq!(
            user.features,
            vec![assignment("card-1", "B"), assignment("card-2", "A")]
        );
        assert_eq!(client.documents(Collection::Users).len(), 2);
    }

    #[tokio::test]
    async fn unknown_customer_is_unauthorized_without_writes() {
        let client = MemoryClient::new();
        let store = Store::new(Arc::new(client.clone()));

        match handle_user_on_init(&store, None, Some("cookie"), Some("code"), Some("host")).await {
            Err(TrackerError::Unauthorized(_)) => (),
            other => panic!("expected Unauthorized, got {other:?}"),
        }
        assert_eq!(client.mutations(), 0);
    }

    #[tokio::test]
    async fn existing_user_is_synced_and_persisted_when_changed() {
        let client = MemoryClient::new()
            .with_documents(Collection::Customers, vec![two_card_customer()])
            .with_documents(
                Collection::Users,
                vec![user_document(
                    None,
                    Some("cookie"),
                    "code",
                    "host",
                    &[("card-1", "B"), ("retired", "A")],
                )],
            );
        let store = Store::new(Arc::new(client.clone()));

        let user = handle_user_on_init(&store, None, Some("cookie"), Some("code"), Some("host"))
            .await
            .unwrap()
            .unwrap();

        let expected = vec![assignment("card-1", "B"), assignment("card-2", "A")];
        assert_eq!(user.features, expected);

        let stored = client.documents(Collection::Users);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0]["features"], json!(expected));
    }

    #[tokio::test]
    async fn unchanged_user_is_not_rewritten() {
        let client = MemoryClient::new()
            .with_documents(Collection::Customers, vec![two_card_customer()])
            .with_documents(
                Collection::Users,
                vec![user_document(
                    None,
                    Some("cookie"),
                    "code",
                    "host",
                    &[("card-1", "A"), ("card-2", "A")],
                )],
            );
        let store = Store::new(Arc::new(client.clone()));

        handle_user_on_init(&store, None, Some("cookie"), Some("code"), Some("host"))
            .await
            .unwrap();

        assert_eq!(client.mutations(), 0);
    }

    #[tokio::test]
    async fn discarded_insert_yields_no_user() {
        let client = MemoryClient::new()
            .with_documents(Collection::Customers, vec![two_card_customer()])
            .discard_inserts();
        let store = Store::new(Arc::new(client.clone()));

        let user = handle_user_on_init(&store, None, Some("cookie"), Some("code"), Some("host"))
            .await
            .unwrap();
        assert!(user.is_none());
    }

    #[test]
    fn init_request_accepts_empty_and_partial_bodies() {
        let empty = InitRequest::from_bytes(Bytes::new()).unwrap();
        assert!(empty.customer_code.is_none());

        let partial =
            InitRequest::from_bytes(Bytes::from(r#"{"customerCode":"code","uid":"u-1"}"#))
                .unwrap();
        assert_eq!(partial.customer_code.as_deref(), Some("code"));
        assert_eq!(partial.uid.as_deref(), Some("u-1"));
        assert!(partial.hostname.is_none());

        assert!(matches!(
            InitRequest::from_bytes(Bytes::from("not json")),
            Err(TrackerError::RequestParsingError(_))
        ));
    }
}
