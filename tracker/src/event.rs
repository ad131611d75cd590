use axum::extract::{Path, State};
use axum::Json;
use axum_extra::extract::CookieJar;
use bytes::Bytes;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::instrument;

use crate::api::{EventResponse, EventResponseCode, TrackerError};
use crate::init::DEVICE_COOKIE;
use crate::router;
use crate::store::Store;
use crate::time::TimeSource;

/// Body key holding the identity cookie. Never persisted with the event data.
pub const IDENTITY_COOKIE_KEY: &str = "ic";

const CLICK_PROPERTIES: &[&str] = &[
    "x",
    "y",
    "pageX",
    "pageY",
    "clientX",
    "clientY",
    "tagName",
    "id",
    "className",
    "innerText",
    "href",
    "path",
    "url",
    "timestamp",
];

const SCROLL_PROPERTIES: &[&str] = &[
    "scrollX",
    "scrollY",
    "scrollHeight",
    "scrollWidth",
    "innerHeight",
    "innerWidth",
    "url",
    "timestamp",
];

const RESIZE_PROPERTIES: &[&str] = &[
    "width",
    "height",
    "innerWidth",
    "innerHeight",
    "outerWidth",
    "outerHeight",
    "url",
    "timestamp",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Click,
    Scroll,
    Resize,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Click => "click",
            EventKind::Scroll => "scroll",
            EventKind::Resize => "resize",
        }
    }

    pub fn properties(&self) -> &'static [&'static str] {
        match self {
            EventKind::Click => CLICK_PROPERTIES,
            EventKind::Scroll => SCROLL_PROPERTIES,
            EventKind::Resize => RESIZE_PROPERTIES,
        }
    }
}

/// Splits a raw event body into its identity cookie and the allow-listed
/// properties for `kind`.
pub fn pick_properties(
    kind: EventKind,
    mut body: Map<String, Value>,
) -> Result<(Option<String>, Map<String, Value>), TrackerError> {
    let ic = match body.remove(IDENTITY_COOKIE_KEY) {
        None | Some(Value::Null) => None,
        Some(Value::String(ic)) => Some(ic),
        Some(_) => return Err(TrackerError::invalid_argument(IDENTITY_COOKIE_KEY)),
    };

    let allowed = kind.properties();
    let data: Map<String, Value> = body
        .into_iter()
        .filter(|(key, _)| allowed.contains(&key.as_str()))
        .collect();

    Ok((ic, data))
}

pub async fn handle_event(
    store: &Store,
    timesource: &(dyn TimeSource + Send + Sync),
    kind: EventKind,
    cookie: Option<&str>,
    body: Map<String, Value>,
) -> Result<(), TrackerError> {
    let received = body.len();
    let (ic, data) = pick_properties(kind, body)?;
    if data.len() + usize::from(ic.is_some()) < received {
        tracing::debug!(kind = kind.as_str(), "dropped properties outside the allow-list");
    }

    store
        .save_event(ic.as_deref(), cookie, data, kind, timesource.current_time())
        .await
}

#[instrument(skip_all, fields(kind = kind.as_str(), has_cookie))]
pub async fn event(
    state: State<router::State>,
    Path(kind): Path<EventKind>,
    jar: CookieJar,
    body: Bytes,
) -> Result<Json<EventResponse>, TrackerError> {
    tracing::debug!(len = body.len(), "decoding new event");

    let body = match serde_json::from_slice::<Value>(&body)? {
        Value::Object(body) => body,
        _ => {
            return Err(TrackerError::InvalidArgument(
                "event body must be a json object".to_string(),
            ))
        }
    };

    let cookie = jar.get(DEVICE_COOKIE).map(|c| c.value().to_owned());
    tracing::Span::current().record("has_cookie", cookie.is_some());

    counter!("tracker_events_received_total", "kind" => kind.as_str()).increment(1);

    handle_event(
        &state.store,
        state.timesource.as_ref(),
        kind,
        cookie.as_deref(),
        body,
    )
    .await?;

    Ok(Json(EventResponse {
        status: EventResponseCode::Ok,
    }))
}
