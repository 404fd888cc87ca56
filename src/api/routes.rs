//! Router assembly and server startup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header, HeaderValue, Method},
    middleware,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::catalog::Catalog;
use crate::config::Config;
use crate::identity::{FirebaseVerifier, IdentityVerifier, StaticVerifier};
use crate::rewards::{
    FlowDispatcher, LoggingDispatcher, RewardDispatcher, RewardQueue, RewardQueueConfig,
};
use crate::service::TaskService;
use crate::store::{CompletionStore, InMemoryCompletionStore, InMemoryUserStore, UserStore};

use super::auth;
use super::rate_limit::{self, RateLimiter};
use super::tasks;
use super::types::HealthResponse;

/// How long shutdown waits for queued rewards to drain.
const REWARD_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub service: TaskService,
    /// Verifies ID tokens posted to `/auth/firebase`
    pub verifier: Arc<dyn IdentityVerifier>,
    pub rate_limiter: RateLimiter,
}

impl AppState {
    pub fn new(config: Config, service: TaskService, verifier: Arc<dyn IdentityVerifier>) -> Self {
        let rate_limiter =
            RateLimiter::new(config.rate_limit.max_requests, config.rate_limit.window)
                .trust_proxy(config.rate_limit.trust_proxy);
        Self {
            config,
            service,
            verifier,
            rate_limiter,
        }
    }
}

/// Build the application router with all middleware attached.
pub fn build_router(state: Arc<AppState>) -> anyhow::Result<Router> {
    let origin = HeaderValue::from_str(&state.config.client_url)
        .map_err(|e| anyhow::anyhow!("invalid CLIENT_URL {:?}: {}", state.config.client_url, e))?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/auth/firebase", post(auth::login));

    let protected_routes = Router::new()
        .route("/tasks/daily", get(tasks::daily_tasks))
        .route("/tasks/complete", post(tasks::complete_task))
        .route("/tasks/history", get(tasks::history))
        .route("/user/balance", get(tasks::balance))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_auth,
        ));

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit::rate_limit,
        ))
        .layer(cors)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("SAMEORIGIN"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    Ok(app)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let users: Arc<dyn UserStore> = Arc::new(InMemoryUserStore::new());
    let completions: Arc<dyn CompletionStore> = Arc::new(InMemoryCompletionStore::new());

    let dispatcher: Arc<dyn RewardDispatcher> = match FlowDispatcher::from_config(&config.flow) {
        Some(flow) => {
            tracing::info!("Reward dispatch via Flow access node {}", config.flow.access_node);
            Arc::new(flow)
        }
        None => {
            tracing::warn!("FLOW_CONTRACT_ADDRESS not set, rewards will only be logged");
            Arc::new(LoggingDispatcher::new())
        }
    };

    let (queue, worker) = RewardQueue::spawn(
        Arc::clone(&dispatcher),
        Arc::clone(&users),
        RewardQueueConfig {
            max_attempts: config.flow.max_attempts,
            capacity: config.flow.queue_capacity,
            ..RewardQueueConfig::default()
        },
    );

    let service =
        TaskService::new(Catalog::daily(), users, completions, dispatcher).with_reward_queue(queue);

    let verifier: Arc<dyn IdentityVerifier> = if config.dev_mode {
        tracing::warn!("DEV_MODE enabled: ID tokens are accepted without verification");
        Arc::new(StaticVerifier::accept_any())
    } else {
        let project_id = config
            .auth
            .firebase_project_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("FIREBASE_PROJECT_ID is required outside dev mode"))?;
        Arc::new(FirebaseVerifier::new(project_id))
    };

    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::new(config, service, verifier));
    let app = build_router(Arc::clone(&state))?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Last queue sender goes with the state; the worker then drains and exits.
    drop(state);
    match tokio::time::timeout(REWARD_DRAIN_TIMEOUT, worker).await {
        Ok(Ok(())) => tracing::info!("Reward queue drained"),
        Ok(Err(e)) => tracing::error!("Reward worker failed: {}", e),
        Err(_) => tracing::warn!("Reward queue did not drain within {:?}", REWARD_DRAIN_TIMEOUT),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

/// `GET /health`
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK".to_string(),
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::identity::{AuthError, Identity};
    use async_trait::async_trait;

    /// Verifier whose provider is down.
    struct UnreachableVerifier;

    #[async_trait]
    impl IdentityVerifier for UnreachableVerifier {
        async fn verify(&self, _token: &str) -> Result<Identity, AuthError> {
            Err(AuthError::Upstream("connection refused".to_string()))
        }
    }

    fn test_state(config: Config) -> Arc<AppState> {
        let verifier = StaticVerifier::new().with_token(
            "good-id-token",
            Identity {
                uid: "user-1".to_string(),
                email: Some("ada@example.com".to_string()),
                name: Some("Ada".to_string()),
            },
        );
        test_state_with(config, Arc::new(verifier))
    }

    fn test_state_with(config: Config, verifier: Arc<dyn IdentityVerifier>) -> Arc<AppState> {
        let users: Arc<dyn UserStore> = Arc::new(InMemoryUserStore::new());
        let completions: Arc<dyn CompletionStore> = Arc::new(InMemoryCompletionStore::new());
        let service = TaskService::new(
            Catalog::daily(),
            users,
            completions,
            Arc::new(LoggingDispatcher::new()),
        );
        Arc::new(AppState::new(config, service, verifier))
    }

    fn app() -> Router {
        build_router(test_state(Config::for_tests())).unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn post_raw(uri: &str, token: Option<&str>, body: &'static str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn get_authed(uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    }

    async fn login(app: &Router) -> String {
        let (status, body) = send(
            app,
            post_json("/auth/firebase", None, json!({ "idToken": "good-id-token" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["uid"], "user-1");
        body["sessionToken"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_and_security_headers() {
        let app = app();
        let res = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["x-content-type-options"], "nosniff");
        assert_eq!(res.headers()["x-frame-options"], "SAMEORIGIN");

        let (_, body) = send(
            &app,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(body["status"], "OK");
    }

    #[tokio::test]
    async fn test_protected_routes_require_session() {
        let app = app();

        let (status, body) = send(
            &app,
            Request::builder()
                .uri("/tasks/daily")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Access token required");

        let (status, body) = send(&app, get_authed("/tasks/daily", "not-a-jwt")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Invalid token");
    }

    #[tokio::test]
    async fn test_login_rejections() {
        let app = app();

        let (status, body) = send(&app, post_json("/auth/firebase", None, json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "ID token required");

        let (status, body) = send(
            &app,
            post_json("/auth/firebase", None, json!({ "idToken": "forged" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Authentication failed");
    }

    #[tokio::test]
    async fn test_complete_then_repeat_same_day() {
        let app = app();
        let token = login(&app).await;

        let (status, body) = send(&app, get_authed("/tasks/daily", &token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tasks"].as_array().unwrap().len(), 5);
        assert!(body["tasks"]
            .as_array()
            .unwrap()
            .iter()
            .all(|t| t["completed"] == false));

        let request = json!({ "taskId": "tweet", "proof": { "url": "https://x.com/p/1" } });
        let (status, body) = send(
            &app,
            post_json("/tasks/complete", Some(&token), request.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["reward"], 10);
        assert_eq!(body["message"], "Task completed! You earned 10 TASK tokens.");

        let (status, body) = send(&app, post_json("/tasks/complete", Some(&token), request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Task already completed today");

        let (_, body) = send(&app, get_authed("/tasks/daily", &token)).await;
        let tweet = body["tasks"]
            .as_array()
            .unwrap()
            .iter()
            .find(|t| t["id"] == "tweet")
            .unwrap()
            .clone();
        assert_eq!(tweet["completed"], true);
        assert!(tweet["completedAt"].is_string());

        let (status, body) = send(&app, get_authed("/tasks/history", &token)).await;
        assert_eq!(status, StatusCode::OK);
        let history = body["history"].as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["totalReward"], 10);

        let (status, body) = send(&app, get_authed("/user/balance", &token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance"], 0.0);
        assert_eq!(body["currency"], "TASK");
    }

    #[tokio::test]
    async fn test_complete_validation_and_unknown_task() {
        let app = app();
        let token = login(&app).await;

        let (status, body) = send(
            &app,
            post_json("/tasks/complete", Some(&token), json!({ "taskId": "tweet" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Task ID and proof required");

        let (status, body) = send(
            &app,
            post_json(
                "/tasks/complete",
                Some(&token),
                json!({ "taskId": "podcast", "proof": "done" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Task not found");
    }

    #[tokio::test]
    async fn test_rate_limit_returns_429() {
        let mut config = Config::for_tests();
        config.rate_limit.max_requests = 2;
        let app = build_router(test_state(config)).unwrap();

        for _ in 0..2 {
            let (status, _) = send(
                &app,
                Request::builder().uri("/health").body(Body::empty()).unwrap(),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) = send(
            &app,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "Too many requests, please try again later.");
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let app = app();
        let token = login(&app).await;

        for req in [
            post_raw("/auth/firebase", None, "{\"idToken\": "),
            post_raw("/tasks/complete", Some(&token), "not json at all"),
        ] {
            let (status, body) = send(&app, req).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(!body["error"].as_str().unwrap().is_empty());
        }

        // Nothing was recorded by the rejected completion
        let (_, body) = send(&app, get_authed("/tasks/history", &token)).await;
        assert!(body["history"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provider_outage_is_server_error() {
        let state = test_state_with(Config::for_tests(), Arc::new(UnreachableVerifier));
        let app = build_router(state).unwrap();

        let (status, body) = send(
            &app,
            post_json("/auth/firebase", None, json!({ "idToken": "anything" })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Authentication failed");
    }

    #[tokio::test]
    async fn test_rotating_forwarded_for_does_not_reset_limit() {
        let mut config = Config::for_tests();
        config.rate_limit.max_requests = 2;
        let app = build_router(test_state(config)).unwrap();

        let mut allowed = 0;
        for i in 0..50 {
            let mut req = Request::builder()
                .uri("/health")
                .header("x-forwarded-for", format!("203.0.113.{}", i))
                .body(Body::empty())
                .unwrap();
            req.extensions_mut()
                .insert(axum::extract::ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 5000))));
            let (status, _) = send(&app, req).await;
            if status == StatusCode::OK {
                allowed += 1;
            } else {
                assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
            }
        }
        assert_eq!(allowed, 2);
    }
}
