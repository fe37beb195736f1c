use std::{convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use secrecy::ExposeSecret;
use serde::Serialize;
use tagbridge_clients_upstream::{HttpUpstreamClient, ScriptedUpstreamClient};
use tagbridge_contracts::{
    ChatRequest, ChatResponse, ErrorResponse, GenerateRequest, GenerateResponse, HealthResponse,
    ModelEntry, ModelsResponse,
};
use tagbridge_core::{BridgeEngine, CoreError, Credential, UpstreamClient, response::to_ndjson_line};
use tracing::{info, instrument, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod config;

use config::{AppConfig, UpstreamMode};

const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

#[derive(OpenApi)]
#[openapi(
    paths(get_health, get_tags, post_chat, post_generate),
    components(
        schemas(
            HealthResponse,
            ErrorResponse,
            ModelEntry,
            ModelsResponse,
            ChatRequest,
            ChatResponse,
            GenerateRequest,
            GenerateResponse
        )
    ),
    tags(
        (name = "tagbridge", description = "Ollama-style chat API over a tag-prompted upstream")
    )
)]
struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    engine: Arc<BridgeEngine>,
}

impl AppState {
    pub fn from_config(config: &AppConfig) -> Result<Self, CoreError> {
        let upstream: Arc<dyn UpstreamClient> = match config.upstream_mode {
            UpstreamMode::Http => {
                let default_credential =
                    config.upstream_token.as_ref().map(|token| Credential::new(token.expose_secret()));
                Arc::new(HttpUpstreamClient::new(
                    config.upstream_base_url.clone(),
                    default_credential,
                    config.upstream_timeout_seconds,
                    Some(config.upstream_max_inflight),
                )?)
            }
            UpstreamMode::Scripted => Arc::new(ScriptedUpstreamClient::echo()),
        };
        info!(
            event = "app.upstream.configured",
            mode = ?config.upstream_mode,
            base_url = %config.upstream_base_url,
            has_default_token = config.upstream_token.is_some(),
            supported_models = config.supported_models.len()
        );
        Ok(Self::with_upstream(upstream, config.supported_models.clone()))
    }

    pub fn with_upstream(upstream: Arc<dyn UpstreamClient>, supported_models: Vec<String>) -> Self {
        let engine = BridgeEngine::new(upstream).with_supported_models(supported_models);
        Self { engine: Arc::new(engine) }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/api/tags", get(get_tags))
        .route("/api/chat", post(post_chat))
        .route("/api/generate", post(post_generate))
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service health", body = HealthResponse)),
    tag = "tagbridge"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy".to_string() })
}

#[utoipa::path(
    get,
    path = "/api/tags",
    responses((status = 200, description = "Configured model list", body = ModelsResponse)),
    tag = "tagbridge"
)]
async fn get_tags(State(state): State<AppState>) -> Json<ModelsResponse> {
    let models = state
        .engine
        .supported_models()
        .iter()
        .map(|model| ModelEntry { name: model.clone(), model: model.clone() })
        .collect();
    Json(ModelsResponse { models })
}

#[utoipa::path(
    post,
    path = "/api/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Single chat response, or NDJSON chunks when streaming", body = ChatResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 502, description = "Upstream failure", body = ErrorResponse)
    ),
    tag = "tagbridge"
)]
#[instrument(skip(state, headers, request), fields(model = %request.model, stream = request.wants_stream()))]
async fn post_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    let credential = bearer_credential(&headers);
    if request.wants_stream() {
        return match state.engine.chat_stream(request, credential.as_ref()).await {
            Ok(records) => ndjson_response(records),
            Err(err) => error_response(err),
        };
    }

    match state.engine.chat(request, credential.as_ref()).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => error_response(err),
    }
}

#[utoipa::path(
    post,
    path = "/api/generate",
    request_body = GenerateRequest,
    responses(
        (status = 200, description = "Single completion, or NDJSON chunks when streaming", body = GenerateResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 502, description = "Upstream failure", body = ErrorResponse)
    ),
    tag = "tagbridge"
)]
#[instrument(skip(state, headers, request), fields(model = %request.model, stream = request.wants_stream()))]
async fn post_generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<GenerateRequest>,
) -> Response {
    let credential = bearer_credential(&headers);
    if request.wants_stream() {
        return match state.engine.generate_stream(request, credential.as_ref()).await {
            Ok(records) => ndjson_response(records),
            Err(err) => error_response(err),
        };
    }

    match state.engine.generate(request, credential.as_ref()).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => error_response(err),
    }
}

/// Reads a caller-supplied `Authorization: Bearer` token, if any.
fn bearer_credential(headers: &HeaderMap) -> Option<Credential> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| Credential::new(token))
}

fn ndjson_response<T, S>(records: S) -> Response
where
    T: Serialize + Send + 'static,
    S: Stream<Item = Result<T, CoreError>> + Send + 'static,
{
    let lines = records.map(|record| {
        let line = match record.and_then(|record| to_ndjson_line(&record)) {
            Ok(line) => line,
            Err(err) => {
                warn!(event = "app.stream.failed", error = %err);
                error_line(&err)
            }
        };
        Ok::<Bytes, Infallible>(Bytes::from(line))
    });

    let mut response = Body::from_stream(lines).into_response();
    response.headers_mut().insert(header::CONTENT_TYPE, HeaderValue::from_static(NDJSON_CONTENT_TYPE));
    response
}

fn error_line(err: &CoreError) -> String {
    to_ndjson_line(&ErrorResponse { error: err.to_string() })
        .unwrap_or_else(|_| "{\"error\":\"stream failed\"}\n".to_string())
}

fn error_status(err: &CoreError) -> StatusCode {
    match err {
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::Upstream(_) | CoreError::Decode(_) => StatusCode::BAD_GATEWAY,
        CoreError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: CoreError) -> Response {
    let status = error_status(&err);
    warn!(event = "app.request.failed", status = status.as_u16(), error = %err);
    (status, Json(ErrorResponse { error: err.to_string() })).into_response()
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use axum::http::Request;
    use serde_json::Value;
    use tagbridge_clients_upstream::ScriptedReply;
    use tower::ServiceExt;

    use super::*;

    #[derive(Debug)]
    struct AppFixture<'a> {
        name: &'a str,
        method: &'a str,
        path: &'a str,
        body: Option<&'a str>,
        upstream: &'a str,
        auth: Option<&'a str>,
    }

    impl<'a> AppFixture<'a> {
        fn parse(raw: &'a str) -> Self {
            let mut fixture = Self {
                name: "unnamed",
                method: "GET",
                path: "/health",
                body: None,
                upstream: "echo",
                auth: None,
            };

            for line in raw.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let Some((key, value)) = line.split_once('=') else {
                    continue;
                };
                let value = value.trim();

                match key.trim() {
                    "name" => fixture.name = value,
                    "method" => fixture.method = value,
                    "path" => fixture.path = value,
                    "body" => fixture.body = Some(value),
                    "upstream" => fixture.upstream = value,
                    "auth" => fixture.auth = Some(value),
                    other => panic!("unsupported fixture key: {other}"),
                }
            }

            fixture
        }
    }

    fn scripted_upstream(kind: &str) -> Arc<ScriptedUpstreamClient> {
        let reply = match kind {
            "echo" => ScriptedReply::Echo,
            "tool_call" => ScriptedReply::Fragments(vec![
                "<tool_call>\n{\"nam".to_string(),
                "e\": \"lookup\", \"arguments\": {\"city\": \"Oslo\"}}".to_string(),
                "\n</tool_call>".to_string(),
            ]),
            "interrupted" => ScriptedReply::Interrupted {
                fragments: vec!["partial".to_string()],
                error: "connection reset".to_string(),
            },
            "fail" => ScriptedReply::Fail("upstream returned status 503".to_string()),
            other => panic!("unsupported upstream fixture value: {other}"),
        };
        Arc::new(ScriptedUpstreamClient::new(reply))
    }

    fn assert_snapshot(name: &str, actual: &str, expected: &str) {
        let actual = actual.trim();
        let expected = expected.trim();
        assert_eq!(
            actual, expected,
            "snapshot mismatch for fixture `{name}`\n\nactual:\n{actual}\n\nexpected:\n{expected}"
        );
    }

    fn summarize_body(content_type: &str, body: &str) -> String {
        if content_type == NDJSON_CONTENT_TYPE {
            return body.lines().map(|line| format!("line={line}")).collect::<Vec<_>>().join("\n");
        }
        match serde_json::from_str::<Value>(body) {
            Ok(value) => format!("json={value}"),
            Err(_) => {
                let head = body.split(':').next().unwrap_or_default();
                format!("text.head={head}")
            }
        }
    }

    async fn snapshot_response(response: Response) -> String {
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("<none>")
            .to_string();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body read must succeed");
        let body = String::from_utf8_lossy(&body).to_string();
        format!(
            "status={status}\ncontent_type={content_type}\n{}",
            summarize_body(&content_type, &body)
        )
    }

    async fn send(app: Router, fixture: &AppFixture<'_>) -> Response {
        let mut builder = Request::builder().method(fixture.method).uri(fixture.path);
        if let Some(token) = fixture.auth {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request_body = if let Some(body) = fixture.body {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(body.to_string())
        } else {
            Body::empty()
        };

        app.oneshot(builder.body(request_body).expect("request must build"))
            .await
            .expect("request must complete")
    }

    async fn check_fixture(raw_fixture: &str, expected_snapshot: &str) {
        let fixture = AppFixture::parse(raw_fixture);
        let upstream = scripted_upstream(fixture.upstream);
        let supported = AppConfig::for_tests().supported_models;
        let app = build_router(AppState::with_upstream(upstream, supported));

        let response = send(app, &fixture).await;
        let actual_snapshot = snapshot_response(response).await;
        assert_snapshot(fixture.name, &actual_snapshot, expected_snapshot);
    }

    #[tokio::test]
    async fn app_route_fixtures() {
        let fixtures = [
            (
                r#"
name=health
method=GET
path=/health
"#,
                r#"
status=200
content_type=application/json
json={"status":"healthy"}
"#,
            ),
            (
                r#"
name=tags_lists_supported_models
method=GET
path=/api/tags
"#,
                r#"
status=200
content_type=application/json
json={"models":[{"name":"qwen-max-latest","model":"qwen-max-latest"},{"name":"qwen-plus","model":"qwen-plus"}]}
"#,
            ),
            (
                r#"
name=chat_stream_defaults_on
method=POST
path=/api/chat
body={"model":"qwen-plus","messages":[{"role":"user","content":"hello world"}]}
"#,
                r#"
status=200
content_type=application/x-ndjson
line={"message":{"role":"assistant","content":""},"done":false}
line={"message":{"role":"assistant","content":"hello "},"done":false}
line={"message":{"role":"assistant","content":"world"},"done":false}
line={"done":true}
"#,
            ),
            (
                r#"
name=chat_complete
method=POST
path=/api/chat
body={"model":"qwen-plus","messages":[{"role":"user","content":"hello world"}],"stream":false}
"#,
                r#"
status=200
content_type=application/json
json={"message":{"role":"assistant","content":"hello world"},"done":true}
"#,
            ),
            (
                r#"
name=chat_stream_tool_call
method=POST
path=/api/chat
upstream=tool_call
body={"model":"qwen-max-latest","messages":[{"role":"user","content":"weather in Oslo?"}],"tools":[{"type":"function","function":{"name":"lookup","description":"Look up a city","parameters":{"type":"object","properties":{"city":{"type":"string","description":"City"}}}}}]}
"#,
                r#"
status=200
content_type=application/x-ndjson
line={"message":{"role":"assistant","content":""},"done":false}
line={"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"lookup","arguments":{"city":"Oslo"}}}]},"done":false}
line={"done":true}
"#,
            ),
            (
                r#"
name=chat_complete_tool_call
method=POST
path=/api/chat
upstream=tool_call
body={"model":"qwen-max-latest","messages":[{"role":"user","content":"weather?"}],"stream":false}
"#,
                r#"
status=200
content_type=application/json
json={"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"lookup","arguments":{"city":"Oslo"}}}]},"done":true}
"#,
            ),
            (
                r#"
name=chat_stream_interrupted_ends_with_error_line
method=POST
path=/api/chat
upstream=interrupted
body={"model":"qwen-plus","messages":[{"role":"user","content":"hi"}]}
"#,
                r#"
status=200
content_type=application/x-ndjson
line={"message":{"role":"assistant","content":""},"done":false}
line={"message":{"role":"assistant","content":"partial"},"done":false}
line={"error":"upstream error: connection reset"}
"#,
            ),
            (
                r#"
name=chat_upstream_failure
method=POST
path=/api/chat
upstream=fail
body={"model":"qwen-plus","messages":[{"role":"user","content":"hi"}],"stream":false}
"#,
                r#"
status=502
content_type=application/json
json={"error":"upstream error: upstream returned status 503"}
"#,
            ),
            (
                r#"
name=chat_unsupported_model
method=POST
path=/api/chat
body={"model":"llama3","messages":[{"role":"user","content":"hi"}]}
"#,
                r#"
status=400
content_type=application/json
json={"error":"validation failed: model `llama3` is not supported"}
"#,
            ),
            (
                r#"
name=chat_unknown_role_rejected_before_core
method=POST
path=/api/chat
body={"model":"qwen-plus","messages":[{"role":"robot","content":"hi"}]}
"#,
                r#"
status=422
content_type=text/plain; charset=utf-8
text.head=Failed to deserialize the JSON body into the target type
"#,
            ),
            (
                r#"
name=generate_stream
method=POST
path=/api/generate
body={"model":"qwen-plus","prompt":"hello world","system":"be brief"}
"#,
                r#"
status=200
content_type=application/x-ndjson
line={"response":"","done":false}
line={"response":"hello ","done":false}
line={"response":"world","done":false}
line={"done":true}
"#,
            ),
            (
                r#"
name=generate_complete
method=POST
path=/api/generate
body={"model":"qwen-plus","prompt":"hello world","stream":false}
"#,
                r#"
status=200
content_type=application/json
json={"response":"hello world","done":true}
"#,
            ),
        ];

        for (fixture, expected) in fixtures {
            check_fixture(fixture, expected).await;
        }
    }

    #[tokio::test]
    async fn caller_bearer_token_reaches_upstream_and_is_not_echoed() {
        let upstream = scripted_upstream("fail");
        let app = build_router(AppState::with_upstream(upstream.clone(), Vec::new()));
        let fixture = AppFixture::parse(
            r#"
name=bearer_forwarding
method=POST
path=/api/chat
auth=caller-secret
body={"model":"qwen-plus","messages":[{"role":"user","content":"hi"}],"stream":false}
"#,
        );

        let snapshot = snapshot_response(send(app, &fixture).await).await;

        assert_eq!(upstream.last_token().await.as_deref(), Some("caller-secret"));
        assert!(snapshot.starts_with("status=502"));
        assert!(!snapshot.contains("caller-secret"));
    }

    #[tokio::test]
    async fn tools_prompt_reaches_upstream_as_system_message() {
        let upstream = scripted_upstream("echo");
        let app = build_router(AppState::with_upstream(upstream.clone(), Vec::new()));
        let fixture = AppFixture::parse(
            r#"
name=tools_prompt
method=POST
path=/api/chat
body={"model":"qwen-plus","stream":false,"messages":[{"role":"user","content":"hi"},{"role":"tool","content":"21C"}],"tools":[{"type":"function","function":{"name":"lookup","description":"Look up","parameters":{"type":"object","properties":{}}}}]}
"#,
        );

        send(app, &fixture).await;

        let payload = upstream.last_payload().await.expect("upstream must be called");
        let roles = payload.messages.iter().map(|m| m.role).collect::<Vec<_>>();
        assert_eq!(
            roles,
            vec![
                tagbridge_contracts::UpstreamRole::System,
                tagbridge_contracts::UpstreamRole::User,
                tagbridge_contracts::UpstreamRole::User
            ]
        );
        assert!(payload.messages[0].content.contains("<tools>"));
        assert_eq!(payload.messages[2].content, "<tool_response>21C</tool_response>");
        assert!(!payload.stream);
        assert_eq!(payload.chat_id, "local");
    }

    #[test]
    fn bearer_parsing_ignores_other_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert!(bearer_credential(&headers).is_none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer  tok "));
        assert_eq!(bearer_credential(&headers).map(|c| c.expose().to_string()).as_deref(), Some("tok"));
    }
}
