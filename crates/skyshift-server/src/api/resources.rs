//! Generic per-kind CRUD and watch handlers.
//!
//! Every kind gets the same surface; the concrete type is plugged in at
//! route registration. Bodies are decoded through the codec (single decode
//! point: unknown fields rejected, defaults injected, validation run)
//! before touching the store.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use skyshift_store::{EventType, ObjectEvent, ObjectStream};
use skyshift_types::{codec, kinds::Action, Object};

use super::{authorize, error::ApiError, error::Result, AppState, Identity};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Stream events instead of returning a snapshot.
    #[serde(default)]
    pub watch: bool,

    /// Event sequence to resume a watch from (inclusive).
    #[serde(default)]
    pub from: Option<u64>,
}

/// The wire form of one watch event.
#[derive(Debug, Serialize)]
struct WatchEventWire<T> {
    #[serde(rename = "type")]
    event_type: EventType,
    version: u64,
    object: T,
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub kind: &'static str,
    pub items: Vec<T>,
    pub revision: u64,
}

/// Serializes a watch stream as newline-delimited JSON. The response body
/// stays open until the client goes away or the stream errors out.
fn ndjson_response<T: Object>(stream: ObjectStream<T>) -> Response {
    let body = stream.map(|item| {
        item.map(|event: ObjectEvent<T>| {
            let wire = WatchEventWire {
                event_type: event.event_type,
                version: event.version,
                object: event.object,
            };
            let mut line = serde_json::to_vec(&wire).unwrap_or_default();
            line.push(b'\n');
            bytes::Bytes::from(line)
        })
    });
    Response::new(Body::from_stream(body))
}

async fn list_or_watch<T: Object>(
    state: AppState,
    identity: Identity,
    namespace: Option<String>,
    query: ListQuery,
) -> Result<Response> {
    let action = if query.watch {
        Action::Watch
    } else {
        Action::List
    };
    // Listing a namespaced kind across all namespaces needs a role that
    // spans every namespace.
    let scope = match (&namespace, T::KIND.is_namespaced()) {
        (Some(namespace), _) => Some(namespace.as_str()),
        (None, true) => Some(skyshift_types::kinds::rbac::ALL),
        (None, false) => None,
    };
    authorize(&state, &identity, action, T::KIND, scope).await?;

    if query.watch {
        let stream = state
            .store
            .watch::<T>(namespace.as_deref(), query.from)
            .await?;
        Ok(ndjson_response(stream))
    } else {
        let list = state.store.list::<T>(namespace.as_deref()).await?;
        Ok(Json(ListResponse {
            kind: "List",
            items: list.items,
            revision: list.revision,
        })
        .into_response())
    }
}

pub async fn list_global<T: Object>(
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<ListQuery>,
) -> Result<Response> {
    list_or_watch::<T>(state, identity, None, query).await
}

/// All-namespaces listing for a namespaced kind.
pub async fn list_all<T: Object>(
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<ListQuery>,
) -> Result<Response> {
    list_or_watch::<T>(state, identity, None, query).await
}

pub async fn list_namespaced<T: Object>(
    State(state): State<AppState>,
    identity: Identity,
    Path(namespace): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Response> {
    list_or_watch::<T>(state, identity, Some(namespace), query).await
}

fn decode_body<T: Object>(
    mut body: serde_json::Value,
    namespace: Option<&str>,
    name: Option<&str>,
) -> Result<T> {
    // The request path supplies the namespace when the payload omits it.
    if let (Some(namespace), Some(metadata)) = (namespace, body.get_mut("metadata")) {
        if metadata.is_object() && metadata.get("namespace").is_none() {
            metadata["namespace"] = serde_json::Value::String(namespace.to_string());
        }
    }

    let object: T = codec::decode_value(body)?;

    if let Some(namespace) = namespace {
        if object.metadata().namespace.as_deref() != Some(namespace) {
            return Err(ApiError::BadRequest {
                message: format!(
                    "object namespace {:?} does not match request path namespace {namespace:?}",
                    object.metadata().namespace
                ),
            });
        }
    }
    if let Some(name) = name {
        if object.metadata().name != name {
            return Err(ApiError::BadRequest {
                message: format!(
                    "object name {:?} does not match request path name {name:?}",
                    object.metadata().name
                ),
            });
        }
    }
    Ok(object)
}

pub async fn create_global<T: Object>(
    State(state): State<AppState>,
    identity: Identity,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<T>> {
    authorize(&state, &identity, Action::Create, T::KIND, None).await?;
    let object = decode_body::<T>(body, None, None)?;
    Ok(Json(state.store.create(object).await?))
}

pub async fn create_namespaced<T: Object>(
    State(state): State<AppState>,
    identity: Identity,
    Path(namespace): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<T>> {
    authorize(&state, &identity, Action::Create, T::KIND, Some(&namespace)).await?;
    let object = decode_body::<T>(body, Some(&namespace), None)?;
    Ok(Json(state.store.create(object).await?))
}

pub async fn get_global<T: Object>(
    State(state): State<AppState>,
    identity: Identity,
    Path(name): Path<String>,
) -> Result<Json<T>> {
    authorize(&state, &identity, Action::Get, T::KIND, None).await?;
    Ok(Json(state.store.get(None, &name).await?))
}

pub async fn get_namespaced<T: Object>(
    State(state): State<AppState>,
    identity: Identity,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<T>> {
    authorize(&state, &identity, Action::Get, T::KIND, Some(&namespace)).await?;
    Ok(Json(state.store.get(Some(&namespace), &name).await?))
}

pub async fn update_global<T: Object>(
    State(state): State<AppState>,
    identity: Identity,
    Path(name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<T>> {
    authorize(&state, &identity, Action::Update, T::KIND, None).await?;
    let object = decode_body::<T>(body, None, Some(&name))?;
    Ok(Json(state.store.update(object).await?))
}

pub async fn update_namespaced<T: Object>(
    State(state): State<AppState>,
    identity: Identity,
    Path((namespace, name)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<T>> {
    authorize(&state, &identity, Action::Update, T::KIND, Some(&namespace)).await?;
    let object = decode_body::<T>(body, Some(&namespace), Some(&name))?;
    Ok(Json(state.store.update(object).await?))
}

pub async fn update_status_global<T: Object>(
    State(state): State<AppState>,
    identity: Identity,
    Path(name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<T>> {
    authorize(&state, &identity, Action::Update, T::KIND, None).await?;
    let object = decode_body::<T>(body, None, Some(&name))?;
    Ok(Json(state.store.update_status(object).await?))
}

pub async fn update_status_namespaced<T: Object>(
    State(state): State<AppState>,
    identity: Identity,
    Path((namespace, name)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<T>> {
    authorize(&state, &identity, Action::Update, T::KIND, Some(&namespace)).await?;
    let object = decode_body::<T>(body, Some(&namespace), Some(&name))?;
    Ok(Json(state.store.update_status(object).await?))
}

pub async fn delete_global<T: Object>(
    State(state): State<AppState>,
    identity: Identity,
    Path(name): Path<String>,
) -> Result<Json<T>> {
    authorize(&state, &identity, Action::Delete, T::KIND, None).await?;
    Ok(Json(state.store.delete(None, &name, None).await?))
}

pub async fn delete_namespaced<T: Object>(
    State(state): State<AppState>,
    identity: Identity,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<T>> {
    authorize(&state, &identity, Action::Delete, T::KIND, Some(&namespace)).await?;
    Ok(Json(state.store.delete(Some(&namespace), &name, None).await?))
}
