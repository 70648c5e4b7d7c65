//! Object-specific side paths: sessions, invites, namespace cascade,
//! job logs and exec.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use skyshift_compat::{ClusterManager, ExecRequest, LogsOptions};
use skyshift_store::StoreError;
use skyshift_types::kinds::{
    Action, Cluster, Invite, InvitePhase, Job, Namespace, Role, User,
};
use skyshift_types::Kind;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{authorize, error::ApiError, error::Result, AppState, Identity};
use crate::auth::{hash_password, verify_password};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: i64,
}

pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>> {
    let user: User = match state.store.get(None, &request.username).await {
        Ok(user) => user,
        Err(StoreError::NotFound { .. }) => return Err(ApiError::InvalidCredentials),
        Err(error) => return Err(error.into()),
    };

    if !verify_password(&request.password, &user.spec.password_hash)? {
        return Err(ApiError::InvalidCredentials);
    }

    let (token, expires_at) = state.signer.sign_session(&request.username)?;
    debug!(user = %request.username, "login");
    Ok(Json(LoginResponse { token, expires_at }))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    /// The invite token authorizing this registration.
    pub invite: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<User>> {
    let claims = state.signer.verify_invite(&request.invite)?;

    if let Some(subject) = &claims.sub {
        if *subject != request.username {
            return Err(ApiError::BadRequest {
                message: format!("invite was issued for user {subject:?}"),
            });
        }
    }

    // The stored invite record is the revocation point: a token that
    // verifies but whose record is revoked (or already redeemed) is dead.
    let mut invite: Invite = match state.store.get(None, &claims.jti).await {
        Ok(invite) => invite,
        Err(StoreError::NotFound { .. }) => return Err(ApiError::InviteNotRedeemable),
        Err(error) => return Err(error.into()),
    };
    if invite.status.phase != InvitePhase::Pending {
        return Err(ApiError::InviteNotRedeemable);
    }

    let user = state
        .store
        .create(User::new(&request.username, hash_password(&request.password)?))
        .await?;

    // Bind the invited roles.
    for role_name in &claims.roles {
        for _ in 0..3 {
            let mut role: Role = match state.store.get(None, role_name).await {
                Ok(role) => role,
                Err(StoreError::NotFound { .. }) => {
                    warn!(role = %role_name, "invite references a missing role");
                    break;
                }
                Err(error) => return Err(error.into()),
            };
            if role.binds_user(&request.username) {
                break;
            }
            role.spec.users.push(request.username.clone());
            match state.store.update(role).await {
                Ok(_) => break,
                Err(StoreError::Conflict { .. }) => continue,
                Err(error) => return Err(error.into()),
            }
        }
    }

    invite.status.phase = InvitePhase::Accepted;
    state.store.update_status(invite).await?;

    debug!(user = %request.username, "registered");
    Ok(Json(user))
}

#[derive(Debug, Deserialize)]
pub struct CreateInviteRequest {
    #[serde(default)]
    pub roles: Vec<String>,

    /// Pin the invite to a specific username.
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateInviteResponse {
    pub token: String,
    pub jti: String,
}

pub async fn create_invite(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<CreateInviteRequest>,
) -> Result<Json<CreateInviteResponse>> {
    authorize(&state, &identity, Action::Create, Kind::Invite, None).await?;

    let (token, claims) = state.signer.sign_invite(
        &identity.username,
        request.username,
        request.roles.clone(),
        state.invite_ttl,
    )?;

    let mut record = Invite::new(&claims.jti, &identity.username, claims.roles.clone());
    record.spec.expires_at = chrono::DateTime::from_timestamp(claims.exp, 0);
    state.store.create(record).await?;

    Ok(Json(CreateInviteResponse {
        token,
        jti: claims.jti,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RevokeInviteRequest {
    pub token: String,
}

pub async fn revoke_invite(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<RevokeInviteRequest>,
) -> Result<Json<Invite>> {
    authorize(&state, &identity, Action::Delete, Kind::Invite, None).await?;

    let claims = state.signer.verify_invite(&request.token)?;
    let mut invite: Invite = state.store.get(None, &claims.jti).await?;
    invite.status.phase = InvitePhase::Revoked;
    Ok(Json(state.store.update_status(invite).await?))
}

/// DELETE on a namespace cascades to every object keyed under it.
pub async fn delete_namespace(
    State(state): State<AppState>,
    identity: Identity,
    Path(name): Path<String>,
) -> Result<Json<Namespace>> {
    authorize(&state, &identity, Action::Delete, Kind::Namespace, None).await?;
    Ok(Json(state.store.delete_namespace_cascade(&name).await?))
}

/// Resolves the cluster manager serving a job's logs/exec requests.
async fn manager_for_job(
    state: &AppState,
    job: &Job,
    cluster: Option<String>,
) -> Result<Arc<dyn ClusterManager>> {
    let cluster_name = cluster
        .or_else(|| job.status.replica_status.keys().next().cloned())
        .ok_or_else(|| ApiError::BadRequest {
            message: format!("job {:?} has no placed replicas", job.metadata.name),
        })?;
    let cluster: Cluster = state.store.get(None, &cluster_name).await?;
    Ok(state.factory.open(&cluster).await?)
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    /// Restrict to one cluster; defaults to the job's first placement.
    #[serde(default)]
    pub cluster: Option<String>,

    #[serde(default)]
    pub follow: bool,

    /// Byte offset to resume from.
    #[serde(default)]
    pub offset: u64,
}

pub async fn job_logs(
    State(state): State<AppState>,
    identity: Identity,
    Path((namespace, name)): Path<(String, String)>,
    Query(query): Query<LogsQuery>,
) -> Result<Response> {
    authorize(&state, &identity, Action::Get, Kind::Job, Some(&namespace)).await?;

    let job: Job = state.store.get(Some(&namespace), &name).await?;
    let manager = manager_for_job(&state, &job, query.cluster).await?;
    let stream = manager
        .job_logs(
            &job,
            LogsOptions {
                follow: query.follow,
                offset: query.offset,
            },
        )
        .await?;

    Ok(Response::new(Body::from_stream(stream)))
}

#[derive(Debug, Deserialize)]
pub struct ExecQuery {
    #[serde(default)]
    pub cluster: Option<String>,

    /// The command to run, comma-separated.
    pub command: String,

    #[serde(default)]
    pub task: Option<String>,

    #[serde(default)]
    pub container: Option<String>,

    #[serde(default)]
    pub tty: bool,
}

pub async fn exec_job(
    upgrade: WebSocketUpgrade,
    State(state): State<AppState>,
    identity: Identity,
    Path((namespace, name)): Path<(String, String)>,
    Query(query): Query<ExecQuery>,
) -> Result<Response> {
    authorize(&state, &identity, Action::Exec, Kind::Job, Some(&namespace)).await?;

    let job: Job = state.store.get(Some(&namespace), &name).await?;
    let manager = manager_for_job(&state, &job, query.cluster.clone()).await?;
    let request = ExecRequest {
        task: query.task.clone(),
        container: query.container.clone(),
        command: query.command.split(',').map(str::to_string).collect(),
        interactive: query.tty,
    };

    Ok(upgrade.on_upgrade(move |socket| run_exec(socket, manager, job, request)))
}

/// Bridges an exec session onto a websocket: binary frames carry bytes in
/// both directions, a final text frame carries the exit code.
async fn run_exec(
    mut socket: WebSocket,
    manager: Arc<dyn ClusterManager>,
    job: Job,
    request: ExecRequest,
) {
    let mut session = match manager.exec(&job, request).await {
        Ok(session) => session,
        Err(error) => {
            let body = serde_json::json!({ "error": error.to_string() }).to_string();
            let _ = socket.send(Message::Text(body.into())).await;
            return;
        }
    };

    loop {
        tokio::select! {
            chunk = session.output.next() => match chunk {
                Some(Ok(bytes)) => {
                    if socket.send(Message::Binary(bytes)).await.is_err() {
                        return;
                    }
                }
                Some(Err(error)) => {
                    let body = serde_json::json!({ "error": error.to_string() }).to_string();
                    let _ = socket.send(Message::Text(body.into())).await;
                    return;
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    if let Some(stdin) = session.stdin.as_mut() {
                        if stdin.write_all(&data).await.is_err() {
                            session.stdin = None;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(_)) => return,
            },
        }
    }

    let code = session.exit_code.await;
    let body = serde_json::json!({ "exit_code": code }).to_string();
    let _ = socket.send(Message::Text(body.into())).await;
}
