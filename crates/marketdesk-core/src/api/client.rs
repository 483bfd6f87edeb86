//! Authenticated request pipeline for the admin backend.
//!
//! Every call goes out with the current bearer token. A 401 triggers one
//! credential refresh and one replay of the same request; a second 401 is
//! handed back to the caller. When the refresh itself fails the stored
//! credentials are gone and the login redirect fires.

use std::sync::Arc;

use anyhow::Result;
use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::{ApiError, RequestEnvelope};
use crate::auth::{CredentialManager, CredentialStore};
use crate::config::Config;

/// Login entry the redirect points at unless configured otherwise
pub const DEFAULT_LOGIN_PATH: &str = "/login";

/// Receives the fire-and-forget redirect to the login entry point.
pub trait LoginRedirect: Send + Sync {
    fn redirect_to_login(&self, login_path: &str);
}

/// Redirect that only records the event in the log.
pub struct LogRedirect;

impl LoginRedirect for LogRedirect {
    fn redirect_to_login(&self, login_path: &str) {
        warn!(login_path, "Credentials are no longer valid, redirecting to login");
    }
}

/// Outcome of one dispatch of an envelope.
enum Attempt {
    Success(Response),
    Unauthorized,
    TransportFailure(reqwest::Error),
}

/// Client for the admin backend.
/// Clone is cheap - the HTTP client and the credential manager are shared.
#[derive(Clone)]
pub struct AuthenticatedClient {
    http: Client,
    manager: Arc<CredentialManager>,
    redirect: Arc<dyn LoginRedirect>,
    login_path: String,
}

impl AuthenticatedClient {
    pub fn new(http: Client, manager: Arc<CredentialManager>) -> Self {
        Self {
            http,
            manager,
            redirect: Arc::new(LogRedirect),
            login_path: DEFAULT_LOGIN_PATH.to_string(),
        }
    }

    /// Build the client, credential store, and manager described by the
    /// configuration. The store is hydrated from its durable backend.
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = config.http_client()?;
        let store = CredentialStore::hydrate(config.open_storage()?);
        let manager = Arc::new(CredentialManager::new(
            http.clone(),
            config.api_base_url.clone(),
            store,
        ));
        Ok(Self::new(http, manager).with_login_path(config.login_path.clone()))
    }

    pub fn with_redirect(mut self, redirect: Arc<dyn LoginRedirect>) -> Self {
        self.redirect = redirect;
        self
    }

    pub fn with_login_path(mut self, login_path: impl Into<String>) -> Self {
        self.login_path = login_path.into();
        self
    }

    pub fn manager(&self) -> &Arc<CredentialManager> {
        &self.manager
    }

    /// Absolute URL for a backend path. Absolute URLs pass through.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.manager.base_url();
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }

    pub fn request(&self, method: Method, path: &str) -> RequestEnvelope {
        RequestEnvelope::new(method, self.url(path))
    }

    async fn attempt(&self, envelope: &RequestEnvelope) -> Attempt {
        match envelope.to_request(&self.http).send().await {
            Ok(response) if response.status() == StatusCode::UNAUTHORIZED => Attempt::Unauthorized,
            Ok(response) => Attempt::Success(response),
            Err(e) => Attempt::TransportFailure(e),
        }
    }

    /// Send a request through the pipeline.
    ///
    /// Any non-401 response, successful or not, comes back unchanged.
    pub async fn execute(&self, mut envelope: RequestEnvelope) -> Result<Response, ApiError> {
        let sent_token = self.manager.store().get_access_token();
        if let Some(token) = sent_token.as_deref() {
            envelope.set_bearer(Some(token))?;
        }

        loop {
            match self.attempt(&envelope).await {
                Attempt::Success(response) => return Ok(response),
                Attempt::TransportFailure(e) => {
                    warn!(url = envelope.url(), error = %e, "Request failed");
                    return Err(ApiError::Transport(e));
                }
                Attempt::Unauthorized => {
                    if !envelope.mark_retried() {
                        warn!(url = envelope.url(), "Still unauthorized after token refresh");
                        return Err(ApiError::UnauthorizedAfterRetry);
                    }

                    debug!(url = envelope.url(), "Unauthorized, refreshing credentials");
                    match self.manager.on_unauthorized(sent_token.as_deref()).await {
                        Ok(token) => envelope.set_bearer(Some(token.as_str()))?,
                        Err(e) => {
                            self.redirect.redirect_to_login(&self.login_path);
                            return Err(e.into());
                        }
                    }
                }
            }
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn parse_json<T: DeserializeOwned>(response: Response, url: &str) -> Result<T, ApiError> {
        let response = Self::check_response(response).await?;
        response.json().await.map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", url, e))
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let envelope = self.request(Method::GET, path);
        let url = envelope.url().to_string();
        let response = self.execute(envelope).await?;
        Self::parse_json(response, &url).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let envelope = self.request(Method::POST, path).json(body)?;
        let url = envelope.url().to_string();
        let response = self.execute(envelope).await?;
        Self::parse_json(response, &url).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::{json, Value};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::auth::manager::REFRESH_PATH;
    use crate::auth::{AuthError, MemoryStorage, TokenPair};

    #[derive(Default)]
    struct RecordingRedirect {
        targets: Mutex<Vec<String>>,
    }

    impl RecordingRedirect {
        fn count(&self) -> usize {
            self.targets.lock().unwrap().len()
        }
    }

    impl LoginRedirect for RecordingRedirect {
        fn redirect_to_login(&self, login_path: &str) {
            self.targets.lock().unwrap().push(login_path.to_string());
        }
    }

    fn client_for(
        base_url: String,
        tokens: Option<TokenPair>,
    ) -> (AuthenticatedClient, Arc<RecordingRedirect>) {
        let storage = match tokens {
            Some(t) => MemoryStorage::with_tokens(t),
            None => MemoryStorage::new(),
        };
        let http = Client::new();
        let manager = Arc::new(CredentialManager::new(
            http.clone(),
            base_url,
            CredentialStore::hydrate(Box::new(storage)),
        ));
        let redirect = Arc::new(RecordingRedirect::default());
        let client = AuthenticatedClient::new(http, manager)
            .with_redirect(redirect.clone())
            .with_login_path("/auth/sign-in");
        (client, redirect)
    }

    async fn mount_resource(
        server: &MockServer,
        resource: &str,
        bearer: &str,
        response: ResponseTemplate,
        calls: impl Into<wiremock::Times>,
    ) {
        Mock::given(method("GET"))
            .and(path(resource))
            .and(header("authorization", format!("Bearer {}", bearer).as_str()))
            .respond_with(response)
            .expect(calls)
            .mount(server)
            .await;
    }

    async fn mount_refresh(server: &MockServer, response: ResponseTemplate, calls: u64) {
        Mock::given(method("POST"))
            .and(path(REFRESH_PATH))
            .respond_with(response)
            .expect(calls)
            .mount(server)
            .await;
    }

    #[test]
    fn test_url_joins_base_and_path() {
        let (client, _) = client_for("http://api.local/v1/".into(), None);
        assert_eq!(client.url("/payments"), "http://api.local/v1/payments");
        assert_eq!(client.url("users?page=2"), "http://api.local/v1/users?page=2");
        assert_eq!(
            client.url("https://cdn.local/file"),
            "https://cdn.local/file"
        );
    }

    #[tokio::test]
    async fn test_attaches_bearer_and_returns_success() {
        let server = MockServer::start().await;
        mount_resource(
            &server,
            "/payments",
            "A1",
            ResponseTemplate::new(200).set_body_json(json!([{"id": 1, "status": "pending"}])),
            1,
        )
        .await;
        mount_refresh(&server, ResponseTemplate::new(200), 0).await;

        let (client, redirect) = client_for(server.uri(), Some(TokenPair::new("A1", "R1")));
        let payments: Value = client.get_json("/payments").await.unwrap();

        assert_eq!(payments[0]["status"], "pending");
        assert_eq!(redirect.count(), 0);
    }

    #[tokio::test]
    async fn test_non_401_failure_is_returned_unchanged() {
        let server = MockServer::start().await;
        mount_resource(
            &server,
            "/tickets",
            "A1",
            ResponseTemplate::new(500).set_body_string("boom"),
            1,
        )
        .await;
        mount_refresh(&server, ResponseTemplate::new(200), 0).await;

        let (client, _) = client_for(server.uri(), Some(TokenPair::new("A1", "R1")));
        let envelope = client.request(Method::GET, "/tickets");
        let response = client.execute(envelope).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.text().await.unwrap(), "boom");
    }

    #[tokio::test]
    async fn test_get_json_classifies_errors() {
        let server = MockServer::start().await;
        mount_resource(
            &server,
            "/services/99",
            "A1",
            ResponseTemplate::new(404).set_body_string("no such service"),
            1,
        )
        .await;

        let (client, _) = client_for(server.uri(), Some(TokenPair::new("A1", "R1")));
        let err = client.get_json::<Value>("/services/99").await.unwrap_err();

        assert!(matches!(err, ApiError::NotFound(body) if body == "no such service"));
    }

    #[tokio::test]
    async fn test_post_json_replays_body_after_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/7/approve"))
            .and(header("authorization", "Bearer A1"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/services/7/approve"))
            .and(header("authorization", "Bearer A2"))
            .and(body_json(json!({"approved": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "approved"})))
            .expect(1)
            .mount(&server)
            .await;
        mount_refresh(
            &server,
            ResponseTemplate::new(200).set_body_json(json!({"accessToken": "A2"})),
            1,
        )
        .await;

        let (client, _) = client_for(server.uri(), Some(TokenPair::new("A1", "R1")));
        let result: Value = client
            .post_json("/services/7/approve", &json!({"approved": true}))
            .await
            .unwrap();

        assert_eq!(result["status"], "approved");
    }

    #[tokio::test]
    async fn test_empty_store_without_refresh_token_redirects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/payments"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        mount_refresh(&server, ResponseTemplate::new(200), 0).await;

        let (client, redirect) = client_for(server.uri(), None);
        let err = client
            .execute(client.request(Method::GET, "/payments"))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Auth(AuthError::NoRefreshToken)));
        assert!(err.requires_login());
        assert!(!client.manager().store().has_tokens());
        assert_eq!(
            *redirect.targets.lock().unwrap(),
            vec!["/auth/sign-in".to_string()]
        );

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_empty_store_keeps_caller_authorization_header() {
        let server = MockServer::start().await;
        mount_resource(
            &server,
            "/health",
            "service-key",
            ResponseTemplate::new(200).set_body_json(json!({"ok": true})),
            1,
        )
        .await;

        let (client, redirect) = client_for(server.uri(), None);
        let envelope = client.request(Method::GET, "/health").header(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_static("Bearer service-key"),
        );
        let response = client.execute(envelope).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(redirect.count(), 0);
    }

    #[tokio::test]
    async fn test_expired_access_token_is_refreshed_and_replayed() {
        let server = MockServer::start().await;
        mount_resource(&server, "/payments", "A1", ResponseTemplate::new(401), 1).await;
        mount_resource(
            &server,
            "/payments",
            "A2",
            ResponseTemplate::new(200).set_body_json(json!({"total": 3})),
            1,
        )
        .await;
        Mock::given(method("POST"))
            .and(path(REFRESH_PATH))
            .and(body_json(json!({"refreshToken": "R1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"accessToken": "A2"})))
            .expect(1)
            .mount(&server)
            .await;

        let (client, redirect) = client_for(server.uri(), Some(TokenPair::new("A1", "R1")));
        let body: Value = client.get_json("/payments").await.unwrap();

        assert_eq!(body["total"], 3);
        assert_eq!(
            client.manager().store().tokens(),
            Some(TokenPair::new("A2", "R1"))
        );
        assert_eq!(redirect.count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_refresh_clears_and_redirects_without_replay() {
        let server = MockServer::start().await;
        mount_resource(&server, "/referrals", "A1", ResponseTemplate::new(401), 1).await;
        mount_refresh(
            &server,
            ResponseTemplate::new(400).set_body_string("refresh token expired: internal detail"),
            1,
        )
        .await;

        let (client, redirect) = client_for(server.uri(), Some(TokenPair::new("A1", "R1")));
        let err = client.get_json::<Value>("/referrals").await.unwrap_err();

        assert!(matches!(
            err,
            ApiError::Auth(AuthError::RefreshRejected { status: 400 })
        ));
        assert!(!err.to_string().contains("internal detail"));
        assert_eq!(client.manager().store().get_access_token(), None);
        assert_eq!(client.manager().store().get_refresh_token(), None);
        assert_eq!(redirect.count(), 1);
    }

    #[tokio::test]
    async fn test_second_unauthorized_is_not_retried_again() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tickets"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;
        mount_refresh(
            &server,
            ResponseTemplate::new(200).set_body_json(json!({"accessToken": "A2"})),
            1,
        )
        .await;

        let (client, redirect) = client_for(server.uri(), Some(TokenPair::new("A1", "R1")));
        let err = client
            .execute(client.request(Method::GET, "/tickets"))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::UnauthorizedAfterRetry));
        assert_eq!(redirect.count(), 0);
        assert_eq!(
            client.manager().store().get_access_token().as_deref(),
            Some("A2")
        );
    }

    #[tokio::test]
    async fn test_transport_failure_keeps_credentials() {
        let server = MockServer::start().await;
        let uri = server.uri();
        drop(server);

        let (client, redirect) = client_for(uri, Some(TokenPair::new("A1", "R1")));
        let err = client
            .execute(client.request(Method::GET, "/users"))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Transport(_)));
        assert_eq!(
            client.manager().store().tokens(),
            Some(TokenPair::new("A1", "R1"))
        );
        assert_eq!(redirect.count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_refresh() {
        let server = MockServer::start().await;
        mount_resource(&server, "/users", "A1", ResponseTemplate::new(401), 1..=2).await;
        mount_resource(
            &server,
            "/users",
            "A2",
            ResponseTemplate::new(200).set_body_json(json!([])),
            2,
        )
        .await;
        mount_refresh(
            &server,
            ResponseTemplate::new(200)
                .set_body_json(json!({"accessToken": "A2", "refreshToken": "R2"}))
                .set_delay(std::time::Duration::from_millis(50)),
            1,
        )
        .await;

        let (client, _) = client_for(server.uri(), Some(TokenPair::new("A1", "R1")));
        let (first, second) = tokio::join!(
            client.get_json::<Value>("/users"),
            client.get_json::<Value>("/users"),
        );

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(
            client.manager().store().tokens(),
            Some(TokenPair::new("A2", "R2"))
        );
    }
}
