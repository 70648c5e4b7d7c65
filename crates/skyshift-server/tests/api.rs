//! API-level tests: authentication, RBAC gating and the CRUD surface,
//! driven through the router without a network socket.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use skyshift_compat::{ClusterManager, ManagerError, ManagerFactory};
use skyshift_server::{api::AppState, bootstrap::bootstrap, build_router, Authorizer, TokenSigner};
use skyshift_store::{ObjectStore, SledDriver};
use skyshift_types::kinds::Cluster;
use tower::ServiceExt;

struct NoopFactory;

#[async_trait]
impl ManagerFactory for NoopFactory {
    async fn open(
        &self,
        _cluster: &Cluster,
    ) -> Result<Arc<dyn ClusterManager>, ManagerError> {
        Err(ManagerError::Unsupported {
            operation: "test factory",
        })
    }

    async fn release(&self, _cluster_name: &str) {}
}

struct TestApi {
    _dir: tempfile::TempDir,
    router: Router,
    store: ObjectStore,
}

async fn test_api() -> TestApi {
    let dir = tempfile::tempdir().expect("tempdir");
    let driver = SledDriver::open(dir.path()).expect("driver opens");
    let store = ObjectStore::new(Arc::new(driver));
    bootstrap(&store, "bootstrap-secret").await.expect("bootstrap");

    let state = AppState {
        store: store.clone(),
        signer: Arc::new(TokenSigner::new(
            Duration::from_secs(3600),
            Duration::from_secs(600),
        )),
        authz: Authorizer::new(store.clone()),
        factory: Arc::new(NoopFactory),
        invite_ttl: Duration::from_secs(3600),
    };

    TestApi {
        _dir: dir,
        router: build_router(state),
        store,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("infallible service");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body collects")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn post_json(path: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("request builds")
}

fn get_request(path: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(path);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).expect("request builds")
}

async fn admin_token(router: &Router) -> String {
    let (status, body) = send(
        router,
        post_json(
            "/login",
            None,
            json!({ "username": "admin", "password": "bootstrap-secret" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "admin login must succeed: {body}");
    body["token"].as_str().expect("token in response").to_string()
}

#[tokio::test]
async fn login_rejects_wrong_password() {
    let api = test_api().await;
    let (status, _) = send(
        &api.router,
        post_json(
            "/login",
            None,
            json!({ "username": "admin", "password": "wrong" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn requests_without_tokens_are_unauthorized() {
    let api = test_api().await;
    let (status, _) = send(&api.router, get_request("/clusters", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn cluster_crud_round_trip() {
    let api = test_api().await;
    let token = admin_token(&api.router).await;

    let (status, created) = send(
        &api.router,
        post_json(
            "/clusters",
            Some(&token),
            json!({
                "kind": "Cluster",
                "metadata": { "name": "c1" },
                "spec": { "manager": "k8" },
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "create failed: {created}");
    assert_eq!(created["metadata"]["resource_version"], 1);

    // Duplicate create conflicts.
    let (status, _) = send(
        &api.router,
        post_json(
            "/clusters",
            Some(&token),
            json!({ "kind": "Cluster", "metadata": { "name": "c1" } }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, fetched) = send(&api.router, get_request("/clusters/c1", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["metadata"]["name"], "c1");

    let (status, list) = send(&api.router, get_request("/clusters", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["items"].as_array().expect("items").len(), 1);
}

#[tokio::test]
async fn invalid_objects_are_rejected_with_reasons() {
    let api = test_api().await;
    let token = admin_token(&api.router).await;

    // Unknown field.
    let (status, body) = send(
        &api.router,
        post_json(
            "/namespaces/default/jobs",
            Some(&token),
            json!({
                "metadata": { "name": "j1", "namespace": "default" },
                "spec": { "image": "ubuntu", "imgae": "typo" },
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
    assert_eq!(body["error"], "InvalidObject");

    // Bad DNS name.
    let (status, _) = send(
        &api.router,
        post_json(
            "/clusters",
            Some(&token),
            json!({ "metadata": { "name": "Not_A_Name" } }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn subjects_without_roles_are_forbidden_everywhere() {
    let api = test_api().await;
    let token = admin_token(&api.router).await;

    // Mint an invite carrying no roles and register a user with it.
    let (status, invite) = send(
        &api.router,
        post_json("/invites", Some(&token), json!({ "roles": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "invite failed: {invite}");
    let invite_token = invite["token"].as_str().expect("invite token");

    let (status, _) = send(
        &api.router,
        post_json(
            "/register",
            None,
            json!({
                "username": "powerless",
                "password": "pw",
                "invite": invite_token,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &api.router,
        post_json(
            "/login",
            None,
            json!({ "username": "powerless", "password": "pw" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let user_token = body["token"].as_str().expect("token").to_string();

    // Authenticated but unbound: every non-public endpoint denies.
    let (status, _) = send(&api.router, get_request("/clusters", Some(&user_token))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = send(
        &api.router,
        post_json(
            "/namespaces/default/jobs",
            Some(&user_token),
            json!({ "metadata": { "name": "j1", "namespace": "default" }, "spec": { "image": "x" } }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn revoked_invites_cannot_be_redeemed() {
    let api = test_api().await;
    let token = admin_token(&api.router).await;

    let (_, invite) = send(
        &api.router,
        post_json("/invites", Some(&token), json!({ "roles": [] })),
    )
    .await;
    let invite_token = invite["token"].as_str().expect("invite token").to_string();

    let (status, _) = send(
        &api.router,
        post_json(
            "/invites/revoke",
            Some(&token),
            json!({ "token": invite_token }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &api.router,
        post_json(
            "/register",
            None,
            json!({ "username": "late", "password": "pw", "invite": invite_token }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn namespace_delete_cascades_through_the_api() {
    let api = test_api().await;
    let token = admin_token(&api.router).await;

    let (status, _) = send(
        &api.router,
        post_json("/namespaces", Some(&token), json!({ "metadata": { "name": "team-a" } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &api.router,
        post_json(
            "/namespaces/team-a/jobs",
            Some(&token),
            json!({ "metadata": { "name": "j1", "namespace": "team-a" }, "spec": { "image": "x" } }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let delete = Request::builder()
        .method("DELETE")
        .uri("/namespaces/team-a")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request builds");
    let (status, _) = send(&api.router, delete).await;
    assert_eq!(status, StatusCode::OK);

    let jobs = api
        .store
        .list::<skyshift_types::kinds::Job>(Some("team-a"))
        .await
        .expect("list");
    assert!(jobs.items.is_empty());
}

#[tokio::test]
async fn status_subresource_does_not_touch_spec() {
    let api = test_api().await;
    let token = admin_token(&api.router).await;

    let (_, created) = send(
        &api.router,
        post_json(
            "/namespaces/default/jobs",
            Some(&token),
            json!({ "metadata": { "name": "j1", "namespace": "default" }, "spec": { "image": "x" } }),
        ),
    )
    .await;
    let version = created["metadata"]["resource_version"].clone();

    let put = Request::builder()
        .method("PUT")
        .uri("/namespaces/default/jobs/j1/status")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::from(
            json!({
                "metadata": { "name": "j1", "namespace": "default", "resource_version": version },
                "spec": { "image": "smuggled" },
                "status": { "status": "PENDING" },
            })
            .to_string(),
        ))
        .expect("request builds");
    let (status, updated) = send(&api.router, put).await;
    assert_eq!(status, StatusCode::OK, "status update failed: {updated}");
    assert_eq!(updated["spec"]["image"], "x");
    assert_eq!(updated["status"]["status"], "PENDING");
    assert_eq!(updated["metadata"]["generation"], 1);
}
