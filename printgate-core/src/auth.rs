//! Upstream credentials and the Repetier login handshake
//!
//! Repetier Server accepts an API key on every call. When a login and
//! password are configured the gateway also holds a session:
//! - the first login happens at startup
//! - later logins happen only after the server rejects the current session
//!
//! A failed login never clears the stored session; the failure may be
//! transient and the old session may still work.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::session::SessionState;

/// Upstream identity, fixed after startup
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    login: Option<String>,
    password: Option<String>,
}

impl Credentials {
    /// Blank login or password counts as absent.
    pub fn new(api_key: &str, login: Option<&str>, password: Option<&str>) -> Self {
        let non_blank = |s: Option<&str>| s.filter(|v| !v.trim().is_empty()).map(String::from);
        Self {
            api_key: api_key.to_string(),
            login: non_blank(login),
            password: non_blank(password),
        }
    }

    /// Login and password, only when both are present
    pub fn login_pair(&self) -> Option<(&str, &str)> {
        match (&self.login, &self.password) {
            (Some(login), Some(password)) => Some((login.as_str(), password.as_str())),
            _ => None,
        }
    }

    pub fn has_login(&self) -> bool {
        self.login_pair().is_some()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("login", &self.login)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Login envelope. Unlike regular calls the command sits at the top level.
#[derive(Debug, Serialize)]
struct LoginEnvelope<'a> {
    apikey: &'a str,
    command: &'static str,
    data: LoginData<'a>,
}

#[derive(Debug, Serialize)]
struct LoginData<'a> {
    login: &'a str,
    password: &'a str,
    #[serde(rename = "rememberMe")]
    remember_me: bool,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    error: Option<String>,
}

/// Performs the login handshake and is the only writer of [`SessionState`].
#[derive(Debug, Clone)]
pub struct Authenticator {
    http: Client,
    endpoint: String,
    credentials: Arc<Credentials>,
    session: SessionState,
    timeout: Duration,
}

impl Authenticator {
    /// `timeout` bounds each login request, whatever the client's own settings.
    pub fn new(
        http: Client,
        endpoint: impl Into<String>,
        credentials: Arc<Credentials>,
        session: SessionState,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            credentials,
            session,
            timeout,
        }
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Log in and store the returned session id.
    ///
    /// Returns `false` without contacting the server when no login is
    /// configured. Every failure is reported as `false`, never as an error.
    pub async fn authenticate(&self) -> bool {
        let Some((login, password)) = self.credentials.login_pair() else {
            tracing::debug!("No upstream login configured, using API key only");
            return false;
        };

        let envelope = LoginEnvelope {
            apikey: &self.credentials.api_key,
            command: "login",
            data: LoginData {
                login,
                password,
                remember_me: false,
            },
        };

        let response = match self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&envelope)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(error = %e, "Upstream login request failed");
                return false;
            }
        };

        let body: LoginResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "Upstream login returned an unreadable body");
                return false;
            }
        };

        match body {
            LoginResponse {
                session_id: Some(session_id),
                ..
            } => {
                self.session.store(session_id).await;
                tracing::info!(login, "Authenticated with upstream server");
                true
            }
            LoginResponse {
                error: Some(error), ..
            } => {
                tracing::warn!(login, error = %error, "Upstream login rejected");
                false
            }
            _ => {
                tracing::warn!(login, "Upstream login response had no session id");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup(login: Option<&str>, password: Option<&str>) -> (MockServer, Authenticator) {
        let server = MockServer::start().await;
        let credentials = Arc::new(Credentials::new("api-key", login, password));
        let auth = Authenticator::new(
            Client::new(),
            format!("{}/printer/api/", server.uri()),
            credentials,
            SessionState::new(),
            Duration::from_secs(5),
        );
        (server, auth)
    }

    #[test]
    fn test_blank_login_counts_as_absent() {
        let creds = Credentials::new("k", Some(" "), Some("pw"));
        assert!(!creds.has_login());
        assert_eq!(creds.login_pair(), None);

        let creds = Credentials::new("k", Some("admin"), Some("pw"));
        assert_eq!(creds.login_pair(), Some(("admin", "pw")));
    }

    #[test]
    fn test_debug_redacts() {
        let creds = Credentials::new("key-123", Some("admin"), Some("pw-456"));
        let debug = format!("{:?}", creds);
        assert!(debug.contains("admin"));
        assert!(!debug.contains("key-123"));
        assert!(!debug.contains("pw-456"));
    }

    #[tokio::test]
    async fn test_missing_credentials_skip_upstream() {
        let (server, auth) = setup(Some("admin"), None).await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sessionId": "x" })))
            .expect(0)
            .mount(&server)
            .await;

        assert!(!auth.authenticate().await);
        assert_eq!(auth.session().token().await, None);
    }

    #[tokio::test]
    async fn test_successful_login_stores_session() {
        let (server, auth) = setup(Some("admin"), Some("secret")).await;

        Mock::given(method("POST"))
            .and(path("/printer/api/"))
            .and(body_partial_json(json!({
                "apikey": "api-key",
                "command": "login",
                "data": { "login": "admin", "password": "secret", "rememberMe": false }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sessionId": "abc123" })))
            .expect(1)
            .mount(&server)
            .await;

        assert!(auth.authenticate().await);
        assert_eq!(auth.session().token().await.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_wrong_password_leaves_session_unchanged() {
        let (server, auth) = setup(Some("admin"), Some("wrong")).await;
        auth.session().store("still-valid".to_string()).await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "error": "wrong credentials" })),
            )
            .expect(2)
            .mount(&server)
            .await;

        assert!(!auth.authenticate().await);
        assert!(!auth.authenticate().await);
        assert_eq!(auth.session().token().await.as_deref(), Some("still-valid"));
    }

    #[tokio::test]
    async fn test_transport_failure_returns_false() {
        let credentials = Arc::new(Credentials::new("k", Some("a"), Some("b")));
        // Nothing listens on the discard port
        let auth = Authenticator::new(
            Client::new(),
            "http://127.0.0.1:9/printer/api/",
            credentials,
            SessionState::new(),
            Duration::from_secs(5),
        );

        assert!(!auth.authenticate().await);
        assert_eq!(auth.session().token().await, None);
    }

    #[tokio::test]
    async fn test_unexpected_body_returns_false() {
        let (server, auth) = setup(Some("admin"), Some("secret")).await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy</html>"))
            .mount(&server)
            .await;

        assert!(!auth.authenticate().await);
        assert_eq!(auth.session().token().await, None);
    }

    #[tokio::test]
    async fn test_login_bounded_by_timeout() {
        let server = MockServer::start().await;
        let auth = Authenticator::new(
            Client::new(),
            format!("{}/printer/api/", server.uri()),
            Arc::new(Credentials::new("k", Some("admin"), Some("secret"))),
            SessionState::new(),
            Duration::from_millis(200),
        );

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "sessionId": "late" }))
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let ok = tokio::time::timeout(Duration::from_secs(3), auth.authenticate())
            .await
            .expect("login was not bounded");
        assert!(!ok);
        assert_eq!(auth.session().token().await, None);
    }
}
