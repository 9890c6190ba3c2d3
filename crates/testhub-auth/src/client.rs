//! HTTP client for the platform's protected endpoints.

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::api::{check_status, parse_base_url};
use crate::error::AuthError;
use crate::manager::SessionManager;
use crate::Result;

/// Attaches the session's bearer token to every request. A 401 triggers one
/// token refresh and one retry; a second 401 ends the session.
#[derive(Clone)]
pub struct AuthorizedClient {
    http_client: reqwest::Client,
    base_url: Url,
    session: SessionManager,
}

impl AuthorizedClient {
    pub fn new(base_url: &str, session: SessionManager, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            base_url: parse_base_url(base_url)?,
            session,
        })
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Send a request to `path`, relative to the API base URL. Statuses other
    /// than 401 are returned to the caller unchecked.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let url = self.base_url.join(path.trim_start_matches('/'))?;
        let token = self.session.access_token();

        let response = self
            .execute(method.clone(), url.clone(), body, token.as_deref())
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(rejected) = token else {
            return Err(AuthError::Unauthorized);
        };

        tracing::info!(path, "Request unauthorized, refreshing access token");
        // A failed refresh has already logged the session out if it had to
        let fresh = self.session.refresh_after_unauthorized(&rejected).await?;

        let retry = self.execute(method, url, body, Some(&fresh)).await?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            if self.session.access_token().as_deref() != Some(fresh.as_str()) {
                return Err(AuthError::SessionChanged);
            }
            tracing::warn!(path, "Request still unauthorized after refresh, logging out");
            self.session.logout().await;
            return Err(AuthError::Unauthorized);
        }
        Ok(retry)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(Method::GET, path, None).await?;
        let response = check_status(response, path, |_| None).await?;
        Ok(response.json().await?)
    }

    pub async fn post_json<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        let response = self.send(Method::POST, path, Some(body)).await?;
        let response = check_status(response, path, |_| None).await?;
        Ok(response.json().await?)
    }

    async fn execute(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        access_token: Option<&str>,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .http_client
            .request(method, url)
            .header("Accept", "application/json");
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }
}
