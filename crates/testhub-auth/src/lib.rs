//! TestHub Auth - authenticated session lifecycle
//!
//! This crate provides:
//! - Login, registration and logout against the platform's `auth/` API
//! - Access-token refresh with rotation and a background auto-refresh task
//! - Write-through persistence of the session in local storage
//! - An HTTP client that retries once after refreshing on a 401

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod navigator;
mod refresh;
pub mod session;
pub mod store;
pub mod token;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use api::{AuthApi, HttpAuthApi, DEFAULT_API_URL};
pub use client::AuthorizedClient;
pub use config::AuthConfig;
pub use error::AuthError;
pub use manager::SessionManager;
pub use navigator::{Navigator, NoopNavigator};
pub use session::{
    Credentials, LoginResponse, RefreshResponse, Registration, SessionSnapshot, SessionStatus,
    UserProfile,
};
pub use store::SessionStore;
pub use token::expiry_millis;

pub type Result<T> = std::result::Result<T, AuthError>;
