use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::Utc;
use storage::LocalStore;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    api::{AuthApi, TokenStatus},
    error::AuthError,
    identity::{resolve_identity, Identity, IdentityError},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOptions {
    pub validate_remotely: bool,
    /// Extra validation attempts after a failure other than revocation.
    pub validation_retries: u32,
    pub retry_delay: Duration,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            validate_remotely: true,
            validation_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogoutReason {
    InvalidToken(IdentityError),
    Revoked,
    ValidationFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Authenticated(Identity),
    LoggedOut(LogoutReason),
}

impl AuthState {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Self::Authenticated(identity) => Some(identity),
            Self::LoggedOut(_) => None,
        }
    }
}

pub struct AuthGate {
    store: LocalStore,
    api: Arc<dyn AuthApi>,
    options: AuthOptions,
    completed_checks: AtomicU64,
    check_lock: Mutex<Option<AuthState>>,
}

impl AuthGate {
    pub fn new(store: LocalStore, api: Arc<dyn AuthApi>, options: AuthOptions) -> Self {
        Self {
            store,
            api,
            options,
            completed_checks: AtomicU64::new(0),
            check_lock: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Decides whether the stored token still identifies a user. Any negative
    /// outcome clears the token. A caller arriving while another check runs
    /// receives that check's result.
    pub async fn check_authentication(&self) -> Result<AuthState> {
        let ticket = self.completed_checks.load(Ordering::SeqCst);
        let mut last = self.check_lock.lock().await;
        if self.completed_checks.load(Ordering::SeqCst) != ticket {
            if let Some(state) = last.as_ref() {
                return Ok(state.clone());
            }
        }

        let state = self.run_check().await?;
        *last = Some(state.clone());
        self.completed_checks.fetch_add(1, Ordering::SeqCst);
        Ok(state)
    }

    async fn run_check(&self) -> Result<AuthState> {
        let token = self.store.bearer_token().await?;
        let identity = match resolve_identity(token.as_deref(), Utc::now()) {
            Ok(identity) => identity,
            Err(err) => {
                info!(%err, "no usable local token");
                return self.logged_out(LogoutReason::InvalidToken(err)).await;
            }
        };
        let Some(token) = token.filter(|_| self.options.validate_remotely) else {
            return Ok(AuthState::Authenticated(identity));
        };

        let mut attempt = 0u32;
        loop {
            match self.api.validate_token(&token).await {
                Ok(TokenStatus::Valid(user_id)) => {
                    if user_id != identity.user_id {
                        warn!(claimed = %identity.user_id, validated = %user_id, "token identity differs from validator");
                    }
                    return Ok(AuthState::Authenticated(identity));
                }
                Ok(TokenStatus::Revoked) => {
                    warn!(user_id = %identity.user_id, "token rejected by backend");
                    return self.logged_out(LogoutReason::Revoked).await;
                }
                Err(err) if attempt < self.options.validation_retries => {
                    attempt += 1;
                    warn!(%err, attempt, "token validation failed; retrying");
                    tokio::time::sleep(self.options.retry_delay).await;
                }
                Err(err) => {
                    warn!(%err, "token validation failed; giving up");
                    return self.logged_out(LogoutReason::ValidationFailed).await;
                }
            }
        }
    }

    async fn logged_out(&self, reason: LogoutReason) -> Result<AuthState> {
        self.logout().await?;
        Ok(AuthState::LoggedOut(reason))
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Identity> {
        let username = username.trim();
        if username.is_empty() {
            return Err(AuthError::MissingUsername.into());
        }
        if password.is_empty() {
            return Err(AuthError::MissingPassword.into());
        }
        let token = self.api.login(username, password).await?;
        self.accept_token(&token).await
    }

    pub async fn signup(&self, username: &str, password: &str) -> Result<Identity> {
        let username = username.trim();
        if username.is_empty() {
            return Err(AuthError::MissingUsername.into());
        }
        let token = self.api.signup(username, password).await?;
        self.accept_token(&token).await
    }

    async fn accept_token(&self, token: &str) -> Result<Identity> {
        let identity = resolve_identity(Some(token), Utc::now())
            .map_err(|err| anyhow::Error::new(err).context(AuthError::UnusableToken))?;
        self.store
            .set_bearer_token(token)
            .await
            .context("failed to persist bearer token")?;
        info!(user_id = %identity.user_id, username = %identity.username, "signed in");
        Ok(identity)
    }

    pub async fn logout(&self) -> Result<()> {
        self.store.clear_bearer_token().await
    }
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
