//! REST contract of the platform's `auth/` endpoints.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use url::Url;

use crate::error::AuthError;
use crate::session::{Credentials, LoginResponse, RefreshResponse, Registration, UserProfile};
use crate::Result;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000/api/";

#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<LoginResponse>;

    async fn register(&self, registration: &Registration) -> Result<UserProfile>;

    /// Ask the server to blacklist `refresh_token`.
    async fn logout(&self, access_token: Option<&str>, refresh_token: &str) -> Result<()>;

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse>;

    async fn profile(&self, access_token: &str) -> Result<UserProfile>;

    async fn current_user(&self, access_token: &str) -> Result<UserProfile>;
}

/// [`AuthApi`] over HTTP.
#[derive(Clone)]
pub struct HttpAuthApi {
    http_client: reqwest::Client,
    base_url: Url,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(alias = "error", alias = "message")]
    detail: Option<serde_json::Value>,
}

impl HttpAuthApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            base_url: parse_base_url(base_url)?,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    async fn get_user(&self, path: &str, access_token: &str) -> Result<UserProfile> {
        let response = self
            .http_client
            .get(self.endpoint(path)?)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .send()
            .await?;

        let response = check_status(response, path, |status| {
            matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
                .then_some(AuthError::Unauthorized)
        })
        .await?;

        Ok(response.json().await?)
    }
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    async fn login(&self, credentials: &Credentials) -> Result<LoginResponse> {
        tracing::debug!(username = %credentials.username, "Logging in");

        let response = self
            .http_client
            .post(self.endpoint("auth/login/")?)
            .json(credentials)
            .send()
            .await?;

        let response = check_status(response, "login", |status| {
            matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED)
                .then_some(AuthError::InvalidCredentials)
        })
        .await?;

        Ok(response.json().await?)
    }

    async fn register(&self, registration: &Registration) -> Result<UserProfile> {
        let response = self
            .http_client
            .post(self.endpoint("auth/register/")?)
            .json(registration)
            .send()
            .await?;

        if response.status() == StatusCode::BAD_REQUEST {
            // Field-level validation errors; hand them back verbatim
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected(body));
        }

        let response = check_status(response, "register", |_| None).await?;
        Ok(response.json().await?)
    }

    async fn logout(&self, access_token: Option<&str>, refresh_token: &str) -> Result<()> {
        let mut request = self
            .http_client
            .post(self.endpoint("auth/logout/")?)
            .json(&json!({ "refresh": refresh_token }));
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        check_status(response, "logout", |status| {
            (status == StatusCode::UNAUTHORIZED).then_some(AuthError::Unauthorized)
        })
        .await?;
        Ok(())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse> {
        let response = self
            .http_client
            .post(self.endpoint("auth/token/refresh/")?)
            .json(&json!({ "refresh": refresh_token }))
            .send()
            .await?;

        let response = check_status(response, "token refresh", |status| {
            matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED)
                .then_some(AuthError::RefreshRejected)
        })
        .await?;

        Ok(response.json().await?)
    }

    async fn profile(&self, access_token: &str) -> Result<UserProfile> {
        self.get_user("auth/profile/", access_token).await
    }

    async fn current_user(&self, access_token: &str) -> Result<UserProfile> {
        self.get_user("auth/me/", access_token).await
    }
}

/// Relative endpoint paths are joined onto the base, so it must end in `/`.
pub(crate) fn parse_base_url(base_url: &str) -> Result<Url> {
    let mut url = Url::parse(base_url)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Pass successful responses through; map failures with `classify`, falling
/// back to [`AuthError::Server`].
pub(crate) async fn check_status(
    response: reqwest::Response,
    context: &str,
    classify: impl FnOnce(StatusCode) -> Option<AuthError>,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body);
    tracing::warn!(status = %status, context, message = %message, "Request failed");

    Err(classify(status).unwrap_or(AuthError::Server {
        status: status.as_u16(),
        message,
    }))
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            detail: Some(serde_json::Value::String(detail)),
        }) => detail,
        Ok(ErrorBody {
            detail: Some(other),
        }) => other.to_string(),
        _ => format!("len={}", body.len()),
    }
}
