use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use pagecraft_core::assembly::SystemTemplate;
use pagecraft_core::policy::Tier;
use pagecraft_core::types::DbId;
use pagecraft_events::EventBus;
use pagecraft_llm::{ChunkSink, Completion, LlmError, ModelClient, ModelRequest};
use pagecraft_pipeline::{GenerationService, GenerationSettings, MemoryGenerationStore, Unlimited};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use pagecraft_api::auth::jwt::{issue_token, JwtConfig};
use pagecraft_api::config::ServerConfig;
use pagecraft_api::router::build_app_router;
use pagecraft_api::state::AppState;

pub const BRIEF: &str = "BRAND: Crumb | Bread worth waking up for\n\
                         STYLE: warm, rustic, editorial\n\
                         PALETTE: #FFF8F0, #F2E3D5, #C26A3D, #2B1D14\n\
                         VIBE: cozy, artisanal\n\
                         TYPE: product";

/// Model client that answers every streamed pass from a fixed list.
pub struct ScriptedClient {
    replies: Mutex<VecDeque<&'static str>>,
}

impl ScriptedClient {
    pub fn new(replies: Vec<&'static str>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn complete(&self, _request: &ModelRequest) -> Result<Completion, LlmError> {
        Ok(Completion { text: BRIEF.into() })
    }

    async fn stream(
        &self,
        _request: &ModelRequest,
        on_chunk: ChunkSink<'_>,
    ) -> Result<Completion, LlmError> {
        let reply = self.replies.lock().unwrap().pop_front().ok_or(LlmError::Api {
            status: 500,
            body: "script exhausted".into(),
        })?;
        on_chunk(reply);
        Ok(Completion { text: reply.into() })
    }
}

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 30,
        jwt: JwtConfig {
            secret: "test-secret-that-is-long-enough-for-hmac".to_string(),
            issuer: None,
            leeway_secs: 0,
        },
    }
}

pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryGenerationStore>,
    pub config: ServerConfig,
}

impl TestApp {
    pub fn token(&self, account_id: DbId) -> String {
        issue_token(account_id, 900, &self.config.jwt).unwrap()
    }
}

/// Build the production router over an in-memory generation store.
///
/// The database pool is lazy and never connected; only the health route
/// touches it.
pub fn build_test_app(store: Arc<MemoryGenerationStore>, replies: Vec<&'static str>) -> TestApp {
    let config = test_config();
    let pool = sqlx::postgres::PgPoolOptions::new()
        .acquire_timeout(Duration::from_millis(200))
        .connect_lazy("postgres://pagecraft@127.0.0.1:1/unused")
        .unwrap();
    let event_bus = Arc::new(EventBus::default());
    let generation = Arc::new(GenerationService::new(
        store.clone(),
        Arc::new(ScriptedClient::new(replies)),
        event_bus.clone(),
        Arc::new(Unlimited),
        SystemTemplate::from_text("You build landing pages.\n\n{brief}").unwrap(),
        GenerationSettings {
            model: "page-model".into(),
            brief_model: "brief-model".into(),
            max_tokens: 4096,
        },
        CancellationToken::new(),
    ));

    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
        generation,
        event_bus,
    };

    let router = build_app_router(state, &config);

    TestApp {
        router,
        store,
        config,
    }
}

/// Create an account with one project, returning `(account_id, project_id)`.
pub fn seed(store: &MemoryGenerationStore, tier: Tier, balance: i32) -> (DbId, DbId) {
    let account = store.add_account(tier, balance);
    let project = store.add_project(account);
    (account, project)
}

pub async fn send(
    app: &TestApp,
    method: Method,
    uri: &str,
    token: Option<&str>,
    headers: &[(&str, &str)],
    body: Option<serde_json::Value>,
) -> Response<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.router.clone().oneshot(request).await.unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = tokio::time::timeout(Duration::from_secs(5), response.into_body().collect())
        .await
        .expect("body did not finish")
        .unwrap()
        .to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

/// Event names of an SSE body, in order.
pub fn sse_event_names(body: &str) -> Vec<&str> {
    body.lines()
        .filter_map(|line| line.strip_prefix("event: "))
        .collect()
}
