//! HTTP and WebSocket handlers

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use printgate_core::GatewayError;

use crate::state::AppState;

pub type SharedState = Arc<AppState>;

/// Feed messages buffered per observer before ticks are dropped
const FEED_BUFFER: usize = 16;

/// Error payload returned to dashboard clients
pub struct ApiError(GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            GatewayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        };

        (
            status,
            Json(json!({
                "success": false,
                "error": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn success(data: Value) -> ApiResult {
    Ok(Json(json!({ "success": true, "data": data })))
}

pub async fn root_handler() -> impl IntoResponse {
    Json(json!({ "message": "Remote 3D Print Dashboard API" }))
}

/// Health check endpoint
pub async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "printgate-server",
        "authenticated": state.client.dispatcher().session().is_authenticated().await,
        "observers": state.scheduler.active_count().await,
    }))
}

pub async fn status_handler(State(state): State<SharedState>) -> ApiResult {
    success(state.client.get_state().await?)
}

pub async fn printers_handler(State(state): State<SharedState>) -> ApiResult {
    success(state.client.list_printers().await?)
}

pub async fn jobs_handler(State(state): State<SharedState>) -> ApiResult {
    success(state.client.list_jobs().await?)
}

pub async fn models_handler(State(state): State<SharedState>) -> ApiResult {
    success(state.client.list_models().await?)
}

pub async fn model_info_handler(State(state): State<SharedState>, Path(id): Path<u64>) -> ApiResult {
    success(state.client.get_model_info(id).await?)
}

pub async fn print_handler(State(state): State<SharedState>, Path(id): Path<u64>) -> ApiResult {
    tracing::info!(model = id, "Starting print");
    success(state.client.start_print(id).await?)
}

pub async fn stop_handler(State(state): State<SharedState>) -> ApiResult {
    tracing::info!("Emergency stop requested");
    success(state.client.stop_print().await?)
}

pub async fn pause_handler(State(state): State<SharedState>) -> ApiResult {
    success(state.client.pause_print().await?)
}

pub async fn resume_handler(State(state): State<SharedState>) -> ApiResult {
    success(state.client.resume_print().await?)
}

pub async fn home_handler(State(state): State<SharedState>) -> ApiResult {
    success(state.client.home_all_axes().await?)
}

pub async fn logs_handler(State(state): State<SharedState>) -> ApiResult {
    success(state.client.get_logs().await?)
}

/// Temperature request body
#[derive(Deserialize)]
pub struct TemperatureRequest {
    value: f64,
}

pub async fn extruder_temperature_handler(
    State(state): State<SharedState>,
    Json(req): Json<TemperatureRequest>,
) -> ApiResult {
    success(state.client.set_extruder_temperature(req.value).await?)
}

pub async fn bed_temperature_handler(
    State(state): State<SharedState>,
    Json(req): Json<TemperatureRequest>,
) -> ApiResult {
    success(state.client.set_bed_temperature(req.value).await?)
}

/// Raw G-code request body
#[derive(Deserialize)]
pub struct GcodeRequest {
    command: String,
}

pub async fn gcode_handler(
    State(state): State<SharedState>,
    Json(req): Json<GcodeRequest>,
) -> ApiResult {
    success(state.client.send_raw_command(&req.command).await?)
}

/// Upload a G-code file sent as the raw request body
pub async fn upload_handler(
    State(state): State<SharedState>,
    Path(filename): Path<String>,
    body: Bytes,
) -> ApiResult {
    if body.is_empty() {
        return Err(GatewayError::InvalidInput("empty upload".to_string()).into());
    }
    success(state.client.upload_file(&filename, &body).await?)
}

/// WebSocket upgrade handler for the observer feed
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<SharedState>,
) -> Response {
    if let Some(origin) = headers.get(header::ORIGIN) {
        let allowed = origin
            .to_str()
            .map(|o| state.origin_allowed(o))
            .unwrap_or(false);

        if !allowed {
            tracing::warn!(origin = ?origin, "Rejected observer from disallowed origin");
            return (
                StatusCode::FORBIDDEN,
                Json(json!({ "success": false, "error": "Origin not allowed" })),
            )
                .into_response();
        }
    }

    ws.on_upgrade(|socket| handle_websocket(socket, state))
}

/// Handle an observer connection for its whole lifetime
async fn handle_websocket(socket: WebSocket, state: SharedState) {
    let (mut sender, mut receiver) = socket.split();

    let client_id = uuid::Uuid::new_v4().to_string();
    tracing::info!("Observer connected: {}", client_id);

    let (feed_tx, mut feed_rx) = mpsc::channel(FEED_BUFFER);
    state.scheduler.attach(client_id.clone(), feed_tx).await;

    loop {
        tokio::select! {
            feed = feed_rx.recv() => {
                match feed {
                    Some(msg) => {
                        let json = match serde_json::to_string(&msg) {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::error!("Failed to encode feed message: {}", e);
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    // Scheduler dropped our sink (shutdown or replacement)
                    None => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("Observer {} disconnected", client_id);
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    // Push-only feed: anything else from the client is ignored
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("Observer {} socket error: {}", client_id, e);
                        break;
                    }
                }
            }
        }
    }

    state.scheduler.detach(&client_id).await;
    tracing::info!("Observer {} cleaned up", client_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use printgate_core::config::UpstreamConfig;
    use printgate_core::PrinterClient;
    use tower::ServiceExt;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup() -> (MockServer, axum::Router) {
        let server = MockServer::start().await;
        let upstream = UpstreamConfig {
            host: "127.0.0.1".to_string(),
            port: server.address().port(),
            api_key: "api-key".to_string(),
            request_timeout_secs: 5,
            ..UpstreamConfig::default()
        };
        let client = PrinterClient::from_config(&upstream).unwrap();
        let state = Arc::new(AppState::new(
            client,
            Duration::from_secs(2),
            "http://localhost:3000".to_string(),
        ));
        (server, crate::build_router(state))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_server, app) = setup().await;

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["authenticated"], false);
        assert_eq!(body["observers"], 0);
    }

    #[tokio::test]
    async fn test_status_wraps_upstream_body() {
        let (server, app) = setup().await;

        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "data": { "command": "stateList" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "printers": [] })))
            .expect(1)
            .mount(&server)
            .await;

        let response = app
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({ "success": true, "data": { "printers": [] } })
        );
    }

    #[tokio::test]
    async fn test_upstream_failure_is_structured() {
        let (server, app) = setup().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "error": "printer offline" })))
            .mount(&server)
            .await;

        let response = app
            .oneshot(Request::get("/api/printers").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Upstream error (HTTP 500): printer offline");
    }

    #[tokio::test]
    async fn test_bed_temperature() {
        let (server, app) = setup().await;

        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "data": { "command": "send", "cmd": "M140 S60" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let response = app
            .oneshot(post_json("/api/temperature/bed", json!({ "value": 60 })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_start_print_by_id() {
        let (server, app) = setup().await;

        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "data": { "command": "copyModel", "id": 12, "autostart": 1 } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(1)
            .mount(&server)
            .await;

        let response = app
            .oneshot(Request::post("/api/print/12").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["data"]["ok"], true);
    }

    #[tokio::test]
    async fn test_blank_gcode_rejected() {
        let (server, app) = setup().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let response = app
            .oneshot(post_json("/api/gcode", json!({ "command": "  " })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["success"], false);
    }

    #[tokio::test]
    async fn test_upload_forwards_file() {
        let (server, app) = setup().await;

        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "data": { "command": "upload", "filename": "cube.gcode", "data": "RzI4Cg==" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let response = app
            .oneshot(
                Request::post("/api/upload/cube.gcode")
                    .body(Body::from("G28\n"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_origin_check() {
        let client = PrinterClient::from_config(&UpstreamConfig::default()).unwrap();

        let state = AppState::new(client.clone(), Duration::from_secs(2), "http://localhost:3000".to_string());
        assert!(state.origin_allowed("http://localhost:3000"));
        assert!(state.origin_allowed("http://localhost:3000/"));
        assert!(!state.origin_allowed("http://evil.example"));

        let open = AppState::new(client, Duration::from_secs(2), "*".to_string());
        assert!(open.origin_allowed("http://anything.example"));
    }
}
