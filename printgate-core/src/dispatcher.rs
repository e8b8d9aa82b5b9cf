//! Request dispatch against the Repetier Server API
//!
//! Every call is an envelope POSTed to the single `/printer/api/` endpoint:
//!
//! ```json
//! { "apikey": "...", "sessionId": "...", "data": { "command": "stateList", ... } }
//! ```
//!
//! When the server answers with a permission error the dispatcher logs in
//! again and re-sends the same envelope once. Any other failure goes straight
//! back to the caller; there is no generic retry or backoff here.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::auth::{Authenticator, Credentials};
use crate::config::UpstreamConfig;
use crate::error::{self, GatewayError};
use crate::session::SessionState;

/// Upper bound on re-authentications per dispatched command
const MAX_AUTH_RETRIES: u32 = 1;

/// Command parameters, merged into the envelope's `data` object
pub type Params = Map<String, Value>;

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    apikey: &'a str,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
    data: &'a Params,
}

/// Executes commands against the upstream server.
/// Clone is cheap; clones share the HTTP pool and the session.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    http: Client,
    endpoint: String,
    credentials: Arc<Credentials>,
    session: SessionState,
    authenticator: Authenticator,
    timeout: Duration,
}

impl Dispatcher {
    /// Build a dispatcher, its authenticator and a fresh session from config
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, GatewayError> {
        let timeout = config.request_timeout();
        let http = Client::builder().timeout(timeout).build()?;

        Ok(Self::new(
            http,
            config.endpoint(),
            Arc::new(config.credentials()),
            SessionState::new(),
            timeout,
        ))
    }

    pub fn new(
        http: Client,
        endpoint: impl Into<String>,
        credentials: Arc<Credentials>,
        session: SessionState,
        timeout: Duration,
    ) -> Self {
        let endpoint = endpoint.into();
        let authenticator = Authenticator::new(
            http.clone(),
            endpoint.clone(),
            Arc::clone(&credentials),
            session.clone(),
            timeout,
        );

        Self {
            http,
            endpoint,
            credentials,
            session,
            authenticator,
            timeout,
        }
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Log in with the configured credentials. See [`Authenticator::authenticate`].
    pub async fn authenticate(&self) -> bool {
        self.authenticator.authenticate().await
    }

    /// Send `command` with `parameters` and return the decoded body unchanged.
    ///
    /// An empty `command` sends the parameters alone. On a permission error
    /// the dispatcher re-authenticates and retries at most once; the retried
    /// result is returned whatever it is.
    pub async fn dispatch(&self, command: &str, parameters: Params) -> Result<Value, GatewayError> {
        let data = envelope_data(command, parameters);
        let mut reauthentications = 0;

        loop {
            match self.send(&data).await {
                Err(e) if e.is_permission_denied() && reauthentications < MAX_AUTH_RETRIES => {
                    tracing::info!(command, "Upstream rejected session, re-authenticating");
                    if !self.authenticator.authenticate().await {
                        tracing::warn!(command, "Re-authentication failed");
                        return Err(e);
                    }
                    reauthentications += 1;
                }
                Err(e) => {
                    tracing::warn!(command, error = %e, "Upstream request failed");
                    return Err(e);
                }
                Ok(body) => return Ok(body),
            }
        }
    }

    async fn send(&self, data: &Params) -> Result<Value, GatewayError> {
        let session_id = self.session.token().await;
        let envelope = Envelope {
            apikey: &self.credentials.api_key,
            session_id: session_id.as_deref(),
            data,
        };

        tracing::debug!(
            command = data.get("command").and_then(|v| v.as_str()).unwrap_or(""),
            with_session = session_id.is_some(),
            "Dispatching upstream request"
        );

        let response = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(e, self.timeout))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayError::from_reqwest(e, self.timeout))?;

        classify_response(status, &bytes)
    }
}

/// Parameters with the command name merged in, when there is one.
fn envelope_data(command: &str, mut parameters: Params) -> Params {
    if !command.is_empty() {
        parameters.insert("command".to_string(), Value::String(command.to_string()));
    }
    parameters
}

/// Turn an upstream reply into a body or a typed error.
///
/// A permission error wins regardless of HTTP status; other non-2xx replies
/// become [`GatewayError::Upstream`].
fn classify_response(status: StatusCode, bytes: &[u8]) -> Result<Value, GatewayError> {
    let parsed = if bytes.iter().all(u8::is_ascii_whitespace) {
        Ok(Value::Null)
    } else {
        serde_json::from_slice::<Value>(bytes)
    };

    if let Ok(ref body) = parsed {
        if let Some(text) = error::error_text(body) {
            if error::is_permission_error(text) {
                return Err(GatewayError::PermissionDenied(text.to_string()));
            }
        }
    }

    if !status.is_success() {
        let message = match parsed {
            Ok(ref body) => error::error_text(body)
                .map(String::from)
                .unwrap_or_else(|| GatewayError::truncate_body(&body.to_string())),
            Err(_) => GatewayError::truncate_body(&String::from_utf8_lossy(bytes)),
        };
        return Err(GatewayError::Upstream {
            status: status.as_u16(),
            message,
        });
    }

    parsed.map_err(|e| {
        GatewayError::InvalidResponse(format!(
            "{}: {}",
            e,
            GatewayError::truncate_body(&String::from_utf8_lossy(bytes))
        ))
    })
}
