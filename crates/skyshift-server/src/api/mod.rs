//! The API surface: uniform CRUD + watch per kind, plus the side paths
//! (login, register, invites, logs, exec).
//!
//! Request flow: authenticate (bearer token) -> authorize -> decode and
//! validate -> store operation -> encode response.

pub mod error;
pub mod resources;
pub mod side;

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
    routing::{get, post, put},
    Router,
};
use skyshift_compat::ManagerFactory;
use skyshift_store::ObjectStore;
use skyshift_types::{
    kinds::{
        Action, Cluster, Endpoints, FilterPolicy, Invite, Job, Link, Role, Service, User,
    },
    Kind, Object,
};
use tower_http::trace::TraceLayer;

use crate::auth::{Authorizer, TokenSigner};
use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub store: ObjectStore,
    pub signer: Arc<TokenSigner>,
    pub authz: Authorizer,
    pub factory: Arc<dyn ManagerFactory>,
    /// Default validity of issued invites.
    pub invite_ttl: std::time::Duration,
}

/// The authenticated caller, extracted from the bearer token.
pub struct Identity {
    pub username: String,
}

impl FromRequestParts<AppState> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::MissingToken)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(ApiError::MissingToken)?;

        let claims = state.signer.verify_session(token)?;
        Ok(Identity {
            username: claims.sub,
        })
    }
}

/// Denies unless the subject's roles grant the action.
pub(crate) async fn authorize(
    state: &AppState,
    identity: &Identity,
    action: Action,
    kind: Kind,
    namespace: Option<&str>,
) -> Result<(), ApiError> {
    if state
        .authz
        .allowed(&identity.username, action, kind, namespace)
        .await?
    {
        Ok(())
    } else {
        Err(ApiError::Forbidden {
            subject: identity.username.clone(),
            action: action.to_string(),
            kind: kind.to_string(),
        })
    }
}

fn global_kind_routes<T: Object>(router: Router<AppState>, resource: &str) -> Router<AppState> {
    router
        .route(
            &format!("/{resource}"),
            get(resources::list_global::<T>).post(resources::create_global::<T>),
        )
        .route(
            &format!("/{resource}/{{name}}"),
            get(resources::get_global::<T>)
                .put(resources::update_global::<T>)
                .delete(resources::delete_global::<T>),
        )
        .route(
            &format!("/{resource}/{{name}}/status"),
            put(resources::update_status_global::<T>),
        )
}

fn namespaced_kind_routes<T: Object>(router: Router<AppState>, resource: &str) -> Router<AppState> {
    router
        .route(&format!("/{resource}"), get(resources::list_all::<T>))
        .route(
            &format!("/namespaces/{{namespace}}/{resource}"),
            get(resources::list_namespaced::<T>).post(resources::create_namespaced::<T>),
        )
        .route(
            &format!("/namespaces/{{namespace}}/{resource}/{{name}}"),
            get(resources::get_namespaced::<T>)
                .put(resources::update_namespaced::<T>)
                .delete(resources::delete_namespaced::<T>),
        )
        .route(
            &format!("/namespaces/{{namespace}}/{resource}/{{name}}/status"),
            put(resources::update_status_namespaced::<T>),
        )
}

/// Assembles the full API router.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/login", post(side::login))
        .route("/register", post(side::register))
        .route("/invites/revoke", post(side::revoke_invite))
        // The invite collection supports listing like any kind, but
        // creation mints a signed token instead of accepting a payload.
        .route(
            "/invites",
            get(resources::list_global::<Invite>).post(side::create_invite),
        )
        .route(
            "/invites/{name}",
            get(resources::get_global::<Invite>).delete(resources::delete_global::<Invite>),
        )
        // Namespace lifecycle: deletion cascades to the namespace's
        // objects, so it gets its own handler.
        .route(
            "/namespaces",
            get(resources::list_global::<skyshift_types::kinds::Namespace>)
                .post(resources::create_global::<skyshift_types::kinds::Namespace>),
        )
        .route(
            "/namespaces/{namespace}",
            get(resources::get_global::<skyshift_types::kinds::Namespace>)
                .delete(side::delete_namespace),
        )
        .route(
            "/namespaces/{namespace}/jobs/{name}/logs",
            get(side::job_logs),
        )
        .route(
            "/namespaces/{namespace}/jobs/{name}/exec",
            get(side::exec_job),
        );

    router = global_kind_routes::<Cluster>(router, "clusters");
    router = global_kind_routes::<Link>(router, "links");
    router = global_kind_routes::<Role>(router, "roles");
    router = global_kind_routes::<User>(router, "users");

    router = namespaced_kind_routes::<Job>(router, "jobs");
    router = namespaced_kind_routes::<Service>(router, "services");
    router = namespaced_kind_routes::<Endpoints>(router, "endpoints");
    router = namespaced_kind_routes::<FilterPolicy>(router, "filterpolicies");

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
