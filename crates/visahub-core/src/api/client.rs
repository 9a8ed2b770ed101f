//! API client for the VisaHub REST backend.
//!
//! Every data call goes through the [`RequestExecutor`], so callers get
//! credential attachment, refresh-and-replay and timeout retries for free.
//! Resource payloads are plain serde types owned by the caller; this client
//! does not know about jobs, meetups or conversations.

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::{header, Client, Method};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ApiError, RequestExecutor};
use crate::auth::{SessionManager, UserIdentity};
use crate::config::Config;

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
    user: UserIdentity,
}

/// API client for the VisaHub backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    config: Arc<Config>,
    executor: RequestExecutor,
    session: Arc<SessionManager>,
}

impl ApiClient {
    pub fn new(
        client: Client,
        config: Arc<Config>,
        executor: RequestExecutor,
        session: Arc<SessionManager>,
    ) -> Self {
        Self {
            client,
            config,
            executor,
            session,
        }
    }

    /// Build the shared HTTP client. The cookie jar carries the session
    /// cookie the refresh endpoint authenticates with.
    pub fn http_client(config: &Config) -> Result<Client> {
        Client::builder()
            .timeout(config.request_timeout())
            .cookie_store(true)
            .build()
            .context("Failed to build HTTP client")
    }

    /// Sign in with email and password and establish the session.
    pub async fn login(&self, email: &str, password: &str) -> Result<UserIdentity> {
        let url = self.config.url(&self.config.login_path);

        let response = self
            .client
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .json(&LoginRequest { email, password })
            .send()
            .await
            .context("Failed to send login request")?;

        let response = Self::check_response(response).await.context("Sign-in failed")?;
        let login: LoginResponse = response
            .json()
            .await
            .context("Failed to parse login response")?;

        self.session
            .set_session(login.user.clone(), &login.token)
            .await?;
        Ok(login.user)
    }

    /// Tell the backend we're leaving, then clear the local session no
    /// matter what it answered.
    pub async fn logout(&self) {
        let url = self.config.url(&self.config.logout_path);
        let mut request = self.client.post(&url);
        if let Some(token) = self.session.credential().await {
            request = request.bearer_auth(token);
        }
        match request.send().await {
            Ok(response) if !response.status().is_success() => {
                warn!(status = %response.status(), "Logout request rejected");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Logout request failed"),
        }
        self.session.clear_session().await;
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn send<T, B>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
        token: Option<String>,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let mut request = self
            .client
            .request(method, url)
            .header(header::ACCEPT, "application/json");
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(ApiError::from_transport)?;
        let response = Self::check_response(response).await?;
        let text = response.text().await.map_err(ApiError::from_transport)?;
        debug!(url, bytes = text.len(), "Response received");

        // Empty 2xx bodies (204, bare 200) decode as JSON null
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text)
            .map_err(|e| ApiError::InvalidResponse(format!("{}: {}", url, e)))
    }

    /// Send a request through the executor.
    pub async fn request<T, B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.config.url(path);
        self.executor
            .execute(|token| self.send::<T, B>(method.clone(), &url, body, token))
            .await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request::<T, ()>(Method::GET, path, None).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.request(Method::PUT, path, Some(body)).await
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.request(Method::PATCH, path, Some(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request::<T, ()>(Method::DELETE, path, None).await
    }
}
